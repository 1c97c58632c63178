//! Configuration file management for OpenTS.
//!
//! Search parameters can be overridden through INI-format configuration files
//! without touching code. Files are applied on top of the built-in defaults
//! with the following precedence (highest first):
//!
//! 1. Local configuration (`./opents_config.cfg`)
//! 2. User configuration (`~/.config/opents/opents_config.cfg`)
//! 3. System configuration (`/etc/opents/opents_config.cfg`)
//! 4. Built-in defaults
//!
//! Only keys that are present in a file override the layer below it.
//!
//! # Configuration File Format
//!
//! ```ini
//! [coordinates]
//! kind = internal
//! bond_scale = 1.25
//!
//! [hessian]
//! update = bofill
//!
//! [trust]
//! initial_radius = 0.1
//! max_radius = 1.0
//!
//! [limits]
//! max_evaluations = 500
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use opents::settings::SettingsManager;
//!
//! let settings = SettingsManager::load()?;
//! println!("Configuration loaded from: {}", settings.config_source());
//! let config = settings.config().clone();
//! # Ok::<(), opents::settings::ConfigError>(())
//! ```

use crate::config::SearchConfig;
use configparser::ini::Ini;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// File name searched for in every configuration directory.
pub const CONFIG_FILE_NAME: &str = "opents_config.cfg";

/// Errors that can occur during configuration loading and processing.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// I/O error when reading configuration files
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// INI parsing error
    #[error("INI parsing error: {0}")]
    IniParse(String),
    /// Invalid configuration value
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
    /// Unknown section in a configuration file
    #[error("Unknown section: {0}")]
    UnknownSection(String),
}

type Section = HashMap<String, Option<String>>;

/// Configuration manager that resolves layered INI files into a [`SearchConfig`].
pub struct SettingsManager {
    config: SearchConfig,
    config_source: String,
}

impl SettingsManager {
    /// Loads configuration from the standard locations.
    ///
    /// Files that fail to parse are skipped with a warning; the merged result
    /// must pass [`SearchConfig::validate`].
    pub fn load() -> Result<Self, ConfigError> {
        let mut paths = Vec::new();
        if let Some(system) = Self::get_system_config_path() {
            paths.push(system);
        }
        if let Some(user) = Self::get_user_config_path() {
            paths.push(user);
        }
        paths.push(PathBuf::from(CONFIG_FILE_NAME));

        let manager = Self::load_layers(&paths)?;
        info!("Configuration loaded from: {}", manager.config_source);
        Ok(manager)
    }

    /// Loads a single configuration file on top of the defaults.
    ///
    /// Unlike [`SettingsManager::load`], parse errors are returned.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = SearchConfig::default();
        Self::apply_file(&mut config, path)?;
        config.validate()?;
        Ok(Self {
            config,
            config_source: format!("{}", path.display()),
        })
    }

    /// Applies the given files in order, later files taking precedence.
    ///
    /// Missing files are ignored.
    pub fn load_layers(paths: &[PathBuf]) -> Result<Self, ConfigError> {
        let mut config = SearchConfig::default();
        let mut config_source = "built-in defaults".to_string();

        for path in paths {
            if !path.exists() {
                continue;
            }
            match Self::apply_file(&mut config, path) {
                Ok(()) => {
                    config_source = format!("{}", path.display());
                    debug!("Applied configuration from: {}", path.display());
                }
                Err(e) => {
                    warn!("Failed to load config from {}: {}", path.display(), e);
                }
            }
        }

        config.validate()?;
        Ok(Self {
            config,
            config_source,
        })
    }

    /// Returns the source of the highest-precedence file applied.
    pub fn config_source(&self) -> &str {
        &self.config_source
    }

    /// Gets a reference to the resolved configuration.
    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// Consumes the manager and returns the resolved configuration.
    pub fn into_config(self) -> SearchConfig {
        self.config
    }

    fn apply_file(config: &mut SearchConfig, path: &Path) -> Result<(), ConfigError> {
        let content = fs::read_to_string(path)?;
        apply_ini(config, &content)
    }

    /// Gets the system configuration file path.
    fn get_system_config_path() -> Option<PathBuf> {
        #[cfg(unix)]
        {
            Some(PathBuf::from("/etc/opents").join(CONFIG_FILE_NAME))
        }
        #[cfg(windows)]
        {
            std::env::var("PROGRAMDATA")
                .ok()
                .map(|pd| PathBuf::from(pd).join("opents").join(CONFIG_FILE_NAME))
        }
    }

    /// Gets the user configuration file path.
    fn get_user_config_path() -> Option<PathBuf> {
        #[cfg(unix)]
        {
            std::env::var("HOME").ok().map(|home| {
                PathBuf::from(home)
                    .join(".config")
                    .join("opents")
                    .join(CONFIG_FILE_NAME)
            })
        }
        #[cfg(windows)]
        {
            std::env::var("APPDATA")
                .ok()
                .map(|appdata| PathBuf::from(appdata).join("opents").join(CONFIG_FILE_NAME))
        }
    }
}

/// Applies the keys of an INI document onto `config`.
///
/// Keys absent from the document keep their current values.
pub fn apply_ini(config: &mut SearchConfig, content: &str) -> Result<(), ConfigError> {
    let mut ini = Ini::new();
    ini.read(content.to_string())
        .map_err(|e| ConfigError::IniParse(format!("Failed to parse INI: {}", e)))?;

    for (name, section) in ini.get_map_ref() {
        match name.as_str() {
            "coordinates" => parse_coordinates(config, section)?,
            "hessian" => parse_hessian(config, section)?,
            "trust" => parse_trust(config, section)?,
            "curvature" => parse_curvature(config, section)?,
            "convergence" => {
                set(section, "eigenvalue_tolerance", &mut config.convergence.eigenvalue_tolerance)?;
            }
            "limits" => parse_limits(config, section)?,
            "default" if section.is_empty() => {}
            other => return Err(ConfigError::UnknownSection(other.to_string())),
        }
    }
    Ok(())
}

/// Overwrites `target` when `key` is present in the section.
fn set<T: FromStr>(section: &Section, key: &str, target: &mut T) -> Result<(), ConfigError> {
    if let Some(Some(raw)) = section.get(key) {
        *target = raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("Invalid {}: {}", key, raw)))?;
    }
    Ok(())
}

/// Like [`set`] for optional budgets; `none` or an empty value clears them.
fn set_optional<T: FromStr>(
    section: &Section,
    key: &str,
    target: &mut Option<T>,
) -> Result<(), ConfigError> {
    match section.get(key) {
        Some(Some(raw)) if !raw.trim().is_empty() && !raw.trim().eq_ignore_ascii_case("none") => {
            let value = raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue(format!("Invalid {}: {}", key, raw)))?;
            *target = Some(value);
        }
        Some(_) => *target = None,
        None => {}
    }
    Ok(())
}

fn parse_bool(section: &Section, key: &str, target: &mut bool) -> Result<(), ConfigError> {
    if let Some(Some(raw)) = section.get(key) {
        *target = match raw.trim().to_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => true,
            "false" | "no" | "off" | "0" => false,
            _ => {
                return Err(ConfigError::InvalidValue(format!(
                    "Invalid {} value: {}",
                    key, raw
                )))
            }
        };
    }
    Ok(())
}

fn parse_coordinates(config: &mut SearchConfig, section: &Section) -> Result<(), ConfigError> {
    let c = &mut config.coordinates;
    if let Some(Some(kind)) = section.get("kind") {
        c.kind = kind.parse().map_err(ConfigError::InvalidValue)?;
    }
    set(section, "bond_scale", &mut c.bond_scale)?;
    set(section, "linear_angle_threshold", &mut c.linear_angle_threshold)?;
    parse_bool(section, "project_translation", &mut c.project_translation)?;
    parse_bool(section, "project_rotation", &mut c.project_rotation)?;
    set(section, "max_backtransform_iterations", &mut c.max_backtransform_iterations)?;
    set(section, "backtransform_tolerance", &mut c.backtransform_tolerance)?;
    set(section, "max_correction_iterations", &mut c.max_correction_iterations)?;
    Ok(())
}

fn parse_hessian(config: &mut SearchConfig, section: &Section) -> Result<(), ConfigError> {
    let h = &mut config.hessian;
    if let Some(Some(update)) = section.get("update") {
        h.update = update.parse().map_err(ConfigError::InvalidValue)?;
    }
    set(section, "stretch", &mut h.stretch)?;
    set(section, "bend", &mut h.bend)?;
    set(section, "torsion", &mut h.torsion)?;
    set(section, "cartesian", &mut h.cartesian)?;
    Ok(())
}

fn parse_trust(config: &mut SearchConfig, section: &Section) -> Result<(), ConfigError> {
    let t = &mut config.trust;
    set(section, "initial_radius", &mut t.initial_radius)?;
    set(section, "max_radius", &mut t.max_radius)?;
    set(section, "min_radius", &mut t.min_radius)?;
    set(section, "shrink_below", &mut t.shrink_below)?;
    set(section, "shrink_above", &mut t.shrink_above)?;
    set(section, "grow_above", &mut t.grow_above)?;
    set(section, "shrink_factor", &mut t.shrink_factor)?;
    set(section, "grow_factor", &mut t.grow_factor)?;
    set(section, "boundary_fraction", &mut t.boundary_fraction)?;
    set(section, "noise_floor", &mut t.noise_floor)?;
    Ok(())
}

fn parse_curvature(config: &mut SearchConfig, section: &Section) -> Result<(), ConfigError> {
    let k = &mut config.curvature;
    parse_bool(section, "refine_initial", &mut k.refine_initial)?;
    set(section, "displacement", &mut k.displacement)?;
    set(section, "tolerance", &mut k.tolerance)?;
    set(section, "max_vectors", &mut k.max_vectors)?;
    Ok(())
}

fn parse_limits(config: &mut SearchConfig, section: &Section) -> Result<(), ConfigError> {
    set_optional(section, "max_evaluations", &mut config.limits.max_evaluations)?;
    set_optional(section, "time_limit_secs", &mut config.limits.time_limit_secs)?;
    Ok(())
}

impl SettingsManager {
    /// Creates an `opents_config.cfg` template listing every option with its default.
    pub fn create_template(path: &Path) -> Result<(), ConfigError> {
        let template_content = Self::generate_template_content();
        fs::write(path, template_content)?;
        info!("Created settings template at: {}", path.display());
        Ok(())
    }

    /// Generates the content for an `opents_config.cfg` template file.
    fn generate_template_content() -> String {
        let d = SearchConfig::default();
        format!(
            r#"# OpenTS Configuration File
#
# Configuration files are applied in order, later files overriding earlier ones:
#
# 1. System config (/etc/opents/opents_config.cfg)
# 2. User config (~/.config/opents/opents_config.cfg)
# 3. Current working directory (./opents_config.cfg) - highest priority
#
# Missing sections or keys keep the built-in defaults shown below.

[coordinates]
# Working representation: internal (redundant internals) or cartesian
kind = {}

# Bond perception: d < bond_scale * (r_cov(i) + r_cov(j))
bond_scale = {}

# Angles above this value (degrees) are treated as near-linear
linear_angle_threshold = {}

# Remove rigid-body motion in the cartesian representation
# Disable rotation projection for periodic systems (cartesian only;
# internal coordinates never contain rigid-body motion)
project_translation = {}
project_rotation = {}

# Internal-to-Cartesian back-transformation
max_backtransform_iterations = {}
backtransform_tolerance = {}

# Cartesian Newton polish of constraint residuals
max_correction_iterations = {}

[hessian]
# Update rule: sr1, psb or bofill
update = {}

# Initial diagonal guess
stretch = {}
bend = {}
torsion = {}
cartesian = {}

[trust]
initial_radius = {}
max_radius = {}
# The search fails with StepRealizationFailed below this radius
min_radius = {}

# ratio = actual / predicted energy change
# ratio < shrink_below or ratio > shrink_above: shrink
# ratio > grow_above with a step at the boundary: grow
shrink_below = {}
shrink_above = {}
grow_above = {}
shrink_factor = {}
grow_factor = {}
boundary_fraction = {}

# Predicted changes smaller than this count as ratio 1
noise_floor = {}

[curvature]
# Finite-difference refinement of the saddle mode; always used before
# classifying with a Hessian that was never updated
refine_initial = {}
displacement = {}
tolerance = {}
max_vectors = {}

[convergence]
# Eigenvalues below -eigenvalue_tolerance count as negative curvature
eigenvalue_tolerance = {}

[limits]
# Optional budgets; use none to disable
max_evaluations = none
time_limit_secs = none
"#,
            d.coordinates.kind,
            d.coordinates.bond_scale,
            d.coordinates.linear_angle_threshold,
            d.coordinates.project_translation,
            d.coordinates.project_rotation,
            d.coordinates.max_backtransform_iterations,
            d.coordinates.backtransform_tolerance,
            d.coordinates.max_correction_iterations,
            d.hessian.update,
            d.hessian.stretch,
            d.hessian.bend,
            d.hessian.torsion,
            d.hessian.cartesian,
            d.trust.initial_radius,
            d.trust.max_radius,
            d.trust.min_radius,
            d.trust.shrink_below,
            d.trust.shrink_above,
            d.trust.grow_above,
            d.trust.shrink_factor,
            d.trust.grow_factor,
            d.trust.boundary_fraction,
            d.trust.noise_floor,
            d.curvature.refine_initial,
            d.curvature.displacement,
            d.curvature.tolerance,
            d.curvature.max_vectors,
            d.convergence.eigenvalue_tolerance,
        )
    }
}
