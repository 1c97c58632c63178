// Tests for search configuration documents and configuration files
use opents::config::{CoordinateKind, SearchConfig};
use opents::hessian_update::HessianUpdateMethod;
use opents::settings::{ConfigError, SettingsManager};
use std::fs;
use std::io::Write;

#[test]
fn test_partial_json_document_uses_defaults() {
    let json = r#"{
        "coordinates": { "kind": "cartesian", "project_rotation": false },
        "hessian": { "update": "sr1" },
        "limits": { "max_evaluations": 250 }
    }"#;
    let config: SearchConfig = serde_json::from_str(json).unwrap();

    assert_eq!(config.coordinates.kind, CoordinateKind::Cartesian);
    assert!(!config.coordinates.project_rotation);
    assert!(config.coordinates.project_translation);
    assert_eq!(config.hessian.update, HessianUpdateMethod::Sr1);
    assert_eq!(config.hessian.stretch, 0.5);
    assert_eq!(config.limits.max_evaluations, Some(250));
    assert_eq!(config.limits.time_limit_secs, None);
    assert_eq!(config.trust, SearchConfig::default().trust);
    assert!(config.validate().is_ok());
}

#[test]
fn test_json_round_trip() {
    let mut config = SearchConfig::default();
    config.trust.initial_radius = 0.05;
    config.limits.time_limit_secs = Some(3600.0);
    let json = serde_json::to_string(&config).unwrap();
    let back: SearchConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(back, config);
}

#[test]
fn test_validation_rejects_inconsistent_trust_radii() {
    let mut config = SearchConfig::default();
    config.trust.min_radius = 0.5;
    assert!(matches!(config.validate(), Err(ConfigError::InvalidValue(_))));

    let mut config = SearchConfig::default();
    config.trust.shrink_factor = 1.5;
    assert!(matches!(config.validate(), Err(ConfigError::InvalidValue(_))));
}

#[test]
fn test_configuration_file_drives_search_settings() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("opents_config.cfg");
    let mut file = fs::File::create(&path).unwrap();
    write!(
        file,
        "[coordinates]\nkind = cartesian\n\n[trust]\ninitial_radius = 0.2\n\n[limits]\ntime_limit_secs = 60\n"
    )
    .unwrap();

    let manager = SettingsManager::load_from(&path).unwrap();
    let config = manager.config();
    assert_eq!(config.coordinates.kind, CoordinateKind::Cartesian);
    assert_eq!(config.trust.initial_radius, 0.2);
    assert_eq!(config.limits.time_limit_secs, Some(60.0));
    assert_eq!(manager.config_source(), path.display().to_string());
}

#[test]
fn test_invalid_file_value_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("opents_config.cfg");
    fs::write(&path, "[trust]\ninitial_radius = 2.0\nmax_radius = 1.0\n").unwrap();
    assert!(SettingsManager::load_from(&path).is_err());
}
