#![deny(missing_docs)]

//! OpenTS - Constrained Transition-State Search
//!
//! OpenTS locates first-order saddle points (transition states) on a
//! potential energy surface while holding user-specified geometric
//! constraints fixed. Energies and gradients come from an external
//! [`Evaluator`](evaluator::Evaluator); the crate supplies the optimizer.
//!
//! # Algorithm
//!
//! The search works in redundant internal coordinates built from the bond
//! graph of the configuration (or, optionally, in Cartesian coordinates) and
//! follows one Hessian eigenvector uphill with partitioned rational-function
//! optimization (P-RFO):
//!
//! 1. **Coordinates**: bonds, angles and dihedrals with the Wilson B-matrix
//!    ```text
//!    g_q = B⁺ᵀ g_x        Δx = B⁺ (q_target - q(x))   (iterated)
//!    ```
//! 2. **Constraint projection**: the working space is split into constrained
//!    directions and the free subspace `U`; only `Uᵀ g` and `Uᵀ H U` reach the
//!    step generator, and a Newton correction keeps residuals at zero.
//! 3. **Approximate Hessian**: diagonal force-constant guess refined by SR1,
//!    PSB or Bofill secant updates.
//! 4. **P-RFO step**: maximize along the tracked saddle mode, minimize along
//!    all others, restricted to a trust radius.
//! 5. **Trust region**: the radius follows the ratio of actual to predicted
//!    energy change; bad steps are rolled back.
//!
//! # Features
//!
//! - **Constraints**: fixed Cartesian components, bonds, angles, dihedrals,
//!   center of mass and overall rotation
//! - **Mode Tracking**: saddle mode followed by overlap, not eigenvalue rank
//! - **Coordinate Rebuilds**: bond formation and near-linear angles trigger a
//!   new coordinate set with the Hessian carried over
//! - **Curvature Refinement**: finite-difference Davidson measurement of the
//!   saddle mode before classifying with an un-updated Hessian
//! - **Budgets**: accepted steps, evaluations and wall-clock time
//! - **Layered Configuration**: defaults, INI files and programmatic overrides
//!
//! # Quick Start
//!
//! ```no_run
//! use opents::constraints::{Constraint, ConstraintKind};
//! use opents::evaluator::{FnEvaluator, EvaluatorError};
//! use opents::geometry::{Geometry, State};
//! use opents::optimizer::SaddleSearch;
//! use opents::settings::SettingsManager;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut geometry = Geometry::new(
//!         vec!["C".into(), "H".into(), "H".into(), "H".into(), "H".into()],
//!         vec![0.0; 15],
//!     );
//!
//!     // Keep the first C-H bond at its current length.
//!     let constraints = vec![Constraint::at_current(ConstraintKind::Bond { atoms: (0, 1) }, &geometry)?];
//!
//!     let evaluator = FnEvaluator::new(|_: &Geometry| -> Result<State, EvaluatorError> {
//!         // Call your electronic-structure code here.
//!         Err(EvaluatorError::Calculation("not implemented".into()))
//!     });
//!
//!     let config = SettingsManager::load()?.into_config();
//!     let mut search = SaddleSearch::new(&mut geometry, constraints, evaluator, config)?;
//!     let report = search.run(4.5e-4, 200)?;
//!     println!("{:?} after {} steps", report.outcome, report.steps);
//!     Ok(())
//! }
//! ```
//!
//! # Outcomes
//!
//! | Outcome | Meaning |
//! |---------|---------|
//! | `ConvergedSaddle` | forces converged, one negative curvature on the tracked mode |
//! | `ConvergedWrongStationaryType` | forces converged, wrong curvature signature |
//! | `MaxStepsExceeded` | step, evaluation or time budget exhausted |
//! | `StepRealizationFailed` | trust radius collapsed |
//!
//! # Modules
//!
//! - [`config`](config/index.html) - Search configuration structures
//! - [`settings`](settings/index.html) - Layered INI configuration files
//! - [`geometry`](geometry/index.html) - Configuration and evaluator state
//! - [`evaluator`](evaluator/index.html) - Energy and gradient interface
//! - [`internal`](internal/index.html) - Primitive internal coordinates
//! - [`coordinates`](coordinates/index.html) - Working coordinate system
//! - [`constraints`](constraints/index.html) - Geometric constraints
//! - [`projection`](projection/index.html) - Free-DOF basis
//! - [`hessian`](hessian/index.html) - Approximate Hessian
//! - [`curvature`](curvature/index.html) - Finite-difference saddle-mode refinement
//! - [`step`](step/index.html) - P-RFO step generation
//! - [`trust`](trust/index.html) - Trust-region control
//! - [`convergence`](convergence/index.html) - Termination criteria
//! - [`optimizer`](optimizer/index.html) - Search loop
//!
//! # References
//!
//! - Baker, J. *J. Comput. Chem.* **1986**, 7, 385-395.
//! - Bofill, J. M. *J. Comput. Chem.* **1994**, 15, 1-11.
//! - Peng, C.; Ayala, P. Y.; Schlegel, H. B.; Frisch, M. J.
//!   *J. Comput. Chem.* **1996**, 17, 49-56.

pub mod config;
pub mod constraints;
pub mod convergence;
pub mod coordinates;
pub mod curvature;
/// Covalent radii and atomic masses
pub mod elements;
pub mod evaluator;
pub mod geometry;
pub mod hessian;
pub mod hessian_update;
pub mod internal;
/// Dense linear-algebra helpers
pub mod linalg;
pub mod optimizer;
pub mod projection;
/// Configuration management system
pub mod settings;
pub mod step;
pub mod trust;

pub use config::SearchConfig;
pub use constraints::{Constraint, ConstraintKind};
pub use geometry::{Geometry, State};
pub use optimizer::{SaddleSearch, SearchError, SearchReport, TerminalOutcome};
