//! Hypothesis landscapes: grid parsing and the scanner that maps a metric
//! over candidate signal hypotheses.

pub mod grid;
pub mod scanner;

pub use grid::{Grid, GridAxis, GridParam, GridPoint};
pub use scanner::{
    scan_evaluate, scan_retrain, Landscape, LandscapePoint, ProgressFn, Reduce, RunReport,
    ScanConfig, ScanContext, ScanMode, ScanOutcome,
};
