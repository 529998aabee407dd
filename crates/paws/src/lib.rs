//! Prior-assisted weak supervision (PAWS).
//!
//! Trains a mass-parameterized classifier jointly with the parameters of an
//! assumed signal process (resonance masses, signal fraction `mu`, branching
//! fraction `alpha`) from reference and mixed event samples, and scans the
//! resulting metric landscape over candidate hypotheses.

pub mod aggregate;
pub mod config;
pub mod error;
pub mod landscape;
pub mod model;
pub mod result;
pub mod seed;
pub mod training;

pub use config::{RunConfig, TrainableMask, TrainingMode};
pub use error::{PawsError, Result};
pub use result::{ParameterEstimates, RunResult, TerminalState};
