//! Run results: terminal state, parameter estimates, per-epoch history and
//! the stable JSON artifact written for every finished run.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::{HypothesisConfig, TrainingMode};
use crate::error::{PawsError, Result};

/// Physical parameter values (masses in GeV).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterEstimates {
    pub masses: Vec<f64>,
    pub mu: f64,
    /// Only with two decay modes.
    #[serde(default)]
    pub alpha: Option<f64>,
}

impl ParameterEstimates {
    /// Initial values from a hypothesis.
    pub fn from_hypothesis(h: &HypothesisConfig) -> Self {
        Self {
            masses: h.masses.clone(),
            mu: h.mu,
            alpha: h.has_alpha().then_some(h.alpha),
        }
    }

    pub fn is_finite(&self) -> bool {
        self.masses.iter().all(|m| m.is_finite())
            && self.mu.is_finite()
            && self.alpha.map_or(true, f64::is_finite)
    }
}

/// How a training run ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TerminalState {
    Converged,
    EarlyStopped,
    Diverged { reason: String },
    MaxEpochsReached,
    Cancelled,
}

impl TerminalState {
    /// Whether the run produced a usable result.
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Diverged { .. } | Self::Cancelled)
    }
}

impl std::fmt::Display for TerminalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Converged => write!(f, "converged"),
            Self::EarlyStopped => write!(f, "early_stopped"),
            Self::Diverged { reason } => write!(f, "diverged ({reason})"),
            Self::MaxEpochsReached => write!(f, "max_epochs_reached"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One epoch of training history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: usize,
    /// Mean training loss over the epoch's applied steps.
    pub train_loss: Option<f64>,
    pub validation_loss: Option<f64>,
    pub parameters: ParameterEstimates,
    /// Step-size multiplier in effect at the end of the epoch.
    pub step_scale: f64,
}

/// Final record of one training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: String,
    /// Configuration identity without seed and restart.
    pub group_key: String,
    pub mode: TrainingMode,
    pub seed: u64,
    pub restart: usize,
    /// Grid coordinate of the run (empty outside scans).
    pub coordinate: BTreeMap<String, f64>,
    pub terminal_state: TerminalState,
    /// Hit the epoch limit without meaningful improvement.
    pub degraded: bool,
    pub epochs_run: usize,
    pub best_epoch: Option<usize>,
    pub best_validation_loss: Option<f64>,
    pub initial_parameters: ParameterEstimates,
    pub final_parameters: ParameterEstimates,
    /// Test-split metrics by name; `None` when undefined for the data.
    pub test_metrics: BTreeMap<String, Option<f64>>,
    pub history: Vec<EpochRecord>,
    pub imbalanced_batches: usize,
    pub skipped_batches: usize,
    pub step_retries: usize,
    pub elapsed_secs: f64,
}

impl RunResult {
    /// Metric value by name, `None` when missing or undefined.
    pub fn metric(&self, name: &str) -> Option<f64> {
        self.test_metrics.get(name).copied().flatten()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(file), self)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|e| {
            PawsError::Checkpoint(format!("failed to open {}: {e}", path.display()))
        })?;
        Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
    }
}

/// Format a coordinate as `m1=300_m2=300_mu=0.01`; `base` when empty.
pub fn format_coordinate(coordinate: &BTreeMap<String, f64>) -> String {
    if coordinate.is_empty() {
        return "base".to_string();
    }
    coordinate
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("_")
}

/// Identity of a configuration, shared by all its seeds and restarts.
pub fn group_key(run_name: &str, mode: TrainingMode, coordinate: &BTreeMap<String, f64>) -> String {
    format!("{run_name}__{mode}__{}", format_coordinate(coordinate))
}

/// Identity of one run.
pub fn run_id(group_key: &str, seed: u64, restart: usize) -> String {
    format!("{group_key}__seed{seed}__r{restart}")
}
