//! Landscape scans: one metric value per grid point, either by retraining
//! at every point or by evaluating one frozen model with its parameters
//! overridden.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use burn::module::AutodiffModule;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use events::{DatasetProvider, Split};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::{RunConfig, BASE_SEED};
use crate::error::{PawsError, Result};
use crate::landscape::grid::Grid;
use crate::model::classifier::ParameterizedClassifier;
use crate::model::SemiWeaklyModel;
use crate::result::RunResult;
use crate::seed::{derive_run_seed, derive_seed};
use crate::training::loss::LossKind;
use crate::training::metrics::{bootstrap_std, compute_metric, mean, median, Metric};
use crate::training::trainer::{refresh_sampled_kappa, score_split, train, RunContext};

/// How each grid point gets its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    /// One training run per (point, restart).
    #[default]
    Retrain,
    /// One frozen model scored at every point.
    Evaluate,
}

/// Combination of restart values into one point value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reduce {
    #[default]
    Best,
    Mean,
    Median,
}

impl Reduce {
    /// `None` when `values` is empty.
    pub fn apply(self, values: &[f64], higher_is_better: bool) -> Option<f64> {
        match self {
            Self::Best => values.iter().copied().reduce(|a, b| {
                if higher_is_better {
                    a.max(b)
                } else {
                    a.min(b)
                }
            }),
            Self::Mean => mean(values),
            Self::Median => median(values),
        }
    }
}

impl std::fmt::Display for Reduce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Best => write!(f, "best"),
            Self::Mean => write!(f, "mean"),
            Self::Median => write!(f, "median"),
        }
    }
}

/// Scan settings shared by every point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanConfig {
    pub grid: Grid,
    #[serde(default = "default_restarts")]
    pub restarts: usize,
    #[serde(default)]
    pub mode: ScanMode,
    #[serde(default = "default_metric")]
    pub metric: Metric,
    #[serde(default)]
    pub reduce: Reduce,
    /// Training runs in flight at once.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Bootstrap resamples per point; 0 disables.
    #[serde(default)]
    pub bootstrap: usize,
    /// Split the metric is evaluated on.
    #[serde(default = "default_split")]
    pub split: Split,
    #[serde(default = "default_base_seed")]
    pub base_seed: u64,
}

fn default_restarts() -> usize {
    1
}
fn default_metric() -> Metric {
    Metric::Loss
}
fn default_max_concurrency() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get())
}
fn default_split() -> Split {
    Split::Test
}
fn default_base_seed() -> u64 {
    BASE_SEED
}

impl ScanConfig {
    pub fn new(grid: Grid) -> Self {
        Self {
            grid,
            restarts: default_restarts(),
            mode: ScanMode::default(),
            metric: default_metric(),
            reduce: Reduce::default(),
            max_concurrency: default_max_concurrency(),
            bootstrap: 0,
            split: default_split(),
            base_seed: default_base_seed(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.grid.is_empty() {
            return Err(PawsError::config("grid has no points"));
        }
        if self.restarts == 0 {
            return Err(PawsError::config("restarts must be > 0"));
        }
        if self.max_concurrency == 0 {
            return Err(PawsError::config("max_concurrency must be > 0"));
        }
        if self.bootstrap == 1 {
            return Err(PawsError::config("bootstrap needs at least 2 resamples"));
        }
        Ok(())
    }
}

/// One point of a finished landscape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LandscapePoint {
    pub coordinate: BTreeMap<String, f64>,
    /// Reduction over the successful restarts.
    pub aggregated: Option<f64>,
    /// Per restart; `None` for failed runs and undefined metrics.
    pub per_restart: Vec<Option<f64>>,
    pub failure_count: usize,
    pub bootstrap_std: Option<f64>,
}

/// Metric surface over a hypothesis grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Landscape {
    pub metric: Metric,
    pub higher_is_better: bool,
    pub reduce: Reduce,
    pub mode: ScanMode,
    pub grid: Grid,
    pub points: Vec<LandscapePoint>,
}

impl Landscape {
    /// Point with the best aggregated value.
    pub fn best(&self) -> Option<&LandscapePoint> {
        self.points
            .iter()
            .filter_map(|p| p.aggregated.map(|v| (p, v)))
            .reduce(|a, b| {
                let b_better = if self.higher_is_better { b.1 > a.1 } else { b.1 < a.1 };
                if b_better {
                    b
                } else {
                    a
                }
            })
            .map(|(p, _)| p)
    }

    pub fn total_failures(&self) -> usize {
        self.points.iter().map(|p| p.failure_count).sum()
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

/// Report for one finished (point, restart) task.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub point: usize,
    pub restart: usize,
    /// `None` when the run failed before producing a result.
    pub result: Option<RunResult>,
    pub value: Option<f64>,
    pub bootstrap_std: Option<f64>,
    pub failed: bool,
}

/// Callback invoked as each run finishes.
pub type ProgressFn = Arc<dyn Fn(&RunReport) + Send + Sync>;

/// Scan-wide context outside the configuration identity.
#[derive(Clone, Default)]
pub struct ScanContext {
    pub cancel: Option<Arc<AtomicBool>>,
    /// Every run writes its artifacts here.
    pub output_dir: Option<PathBuf>,
    pub progress: Option<ProgressFn>,
}

impl ScanContext {
    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }
}

/// Landscape plus every run result, ordered by (point, restart).
#[derive(Debug, Clone)]
pub struct ScanOutcome {
    pub landscape: Landscape,
    pub runs: Vec<RunResult>,
}

/// Non-finite metric values count as failures.
fn accept_value(value: Option<f64>) -> (Option<f64>, bool) {
    match value {
        Some(v) if !v.is_finite() => (None, true),
        other => (other, false),
    }
}

/// Combine per-restart reports into landscape points.
fn build_points(
    scan: &ScanConfig,
    reports: &[Vec<Option<RunReport>>],
) -> Vec<LandscapePoint> {
    let higher = scan.metric.higher_is_better();
    scan.grid
        .points()
        .iter()
        .zip(reports)
        .map(|(point, restarts)| {
            let per_restart: Vec<Option<f64>> = restarts
                .iter()
                .map(|r| r.as_ref().and_then(|r| r.value))
                .collect();
            let failure_count = restarts
                .iter()
                .filter(|r| r.as_ref().map_or(true, |r| r.failed))
                .count();
            let values: Vec<f64> = per_restart.iter().flatten().copied().collect();
            let stds: Vec<f64> = restarts
                .iter()
                .filter_map(|r| r.as_ref().and_then(|r| r.bootstrap_std))
                .collect();
            LandscapePoint {
                coordinate: point.coordinate(),
                aggregated: scan.reduce.apply(&values, higher),
                per_restart,
                failure_count,
                bootstrap_std: mean(&stds),
            }
        })
        .collect()
}

/// Retrain at every (grid point, restart) on a bounded pool of blocking
/// tasks.
///
/// Run seeds come from `(scan.base_seed, point index, restart)`, so results
/// do not depend on scheduling. Per-run failures (configuration errors,
/// divergence, cancellation, panics) become `None` values counted in
/// `failure_count`; only an invalid scan configuration is an error.
pub async fn scan_retrain<B: AutodiffBackend>(
    base: &RunConfig,
    scan: &ScanConfig,
    data: Arc<dyn DatasetProvider>,
    pretrained: Option<ParameterizedClassifier<B>>,
    ctx: ScanContext,
    device: B::Device,
) -> Result<ScanOutcome> {
    scan.validate()?;
    let points = scan.grid.points();
    // Every point's configuration must be valid before any compute.
    for point in &points {
        point.apply(base)?.validate()?;
    }

    tracing::info!(
        grid = %scan.grid,
        points = points.len(),
        restarts = scan.restarts,
        max_concurrency = scan.max_concurrency,
        metric = %scan.metric,
        "Starting landscape scan (retrain)"
    );

    let semaphore = Arc::new(Semaphore::new(scan.max_concurrency));
    let mut join_set = JoinSet::new();
    let mut reports: Vec<Vec<Option<RunReport>>> =
        vec![vec![None; scan.restarts]; points.len()];

    'spawn: for point in &points {
        for restart in 0..scan.restarts {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| PawsError::Data(format!("scan worker pool closed: {e}")))?;
            if ctx.is_cancelled() {
                tracing::info!(point = point.index, restart, "Scan cancelled, not queueing more runs");
                break 'spawn;
            }

            let point = point.clone();
            let base = base.clone();
            let data = Arc::clone(&data);
            let pretrained = pretrained.clone();
            let device = device.clone();
            let metric = scan.metric;
            let split = scan.split;
            let bootstrap = scan.bootstrap;
            let seed = derive_run_seed(scan.base_seed, point.index, restart);
            let run_ctx = RunContext {
                cancel: ctx.cancel.clone(),
                output_dir: ctx.output_dir.clone(),
                coordinate: point.coordinate(),
                restart,
            };

            join_set.spawn_blocking(move || {
                let _permit = permit;
                let outcome = (|| -> Result<(RunResult, Option<f64>, Option<f64>)> {
                    let mut config = point.apply(&base)?;
                    config.training.seed = seed;
                    let run = train::<B>(&config, data.as_ref(), pretrained, &run_ctx, &device)?;
                    if !run.result.terminal_state.is_success() {
                        return Ok((run.result, None, None));
                    }
                    let t = &config.training;
                    let scores = score_split(&run.model.valid(), data.as_ref(), split, t.batch_size, &device);
                    let value = compute_metric(metric, &scores, t.loss);
                    let std = (bootstrap > 0)
                        .then(|| bootstrap_std(metric, &scores, t.loss, bootstrap, derive_seed(seed, 1)))
                        .flatten();
                    Ok((run.result, value, std))
                })();

                match outcome {
                    Ok((result, value, std)) => {
                        let (value, bad_value) = accept_value(value);
                        let failed = !result.terminal_state.is_success() || bad_value;
                        RunReport {
                            point: point.index,
                            restart,
                            result: Some(result),
                            value,
                            bootstrap_std: std,
                            failed,
                        }
                    }
                    Err(e) => {
                        tracing::warn!(point = point.index, restart, error = %e, "Run failed");
                        RunReport {
                            point: point.index,
                            restart,
                            result: None,
                            value: None,
                            bootstrap_std: None,
                            failed: true,
                        }
                    }
                }
            });
        }
    }

    while let Some(joined) = join_set.join_next().await {
        let report = match joined {
            Ok(report) => report,
            Err(e) => {
                // The task panicked; its slot stays empty and counts as a failure.
                tracing::warn!(error = %e, "Scan task did not complete");
                continue;
            }
        };
        if let Some(progress) = &ctx.progress {
            progress(&report);
        }
        tracing::debug!(
            point = report.point,
            restart = report.restart,
            value = ?report.value,
            failed = report.failed,
            "Scan run finished"
        );
        let (point, restart) = (report.point, report.restart);
        reports[point][restart] = Some(report);
    }
    let runs: Vec<RunResult> = reports
        .iter()
        .flatten()
        .flatten()
        .filter_map(|r| r.result.clone())
        .collect();

    let landscape = Landscape {
        metric: scan.metric,
        higher_is_better: scan.metric.higher_is_better(),
        reduce: scan.reduce,
        mode: ScanMode::Retrain,
        grid: scan.grid.clone(),
        points: build_points(scan, &reports),
    };
    tracing::info!(
        points = landscape.points.len(),
        failures = landscape.total_failures(),
        "Landscape scan finished"
    );
    Ok(ScanOutcome { landscape, runs })
}

/// Score one frozen model at every grid point.
///
/// `scan.restarts` is ignored: evaluation is deterministic. A sampled kappa
/// is re-estimated at every point. With
/// `scan.bootstrap > 0` each point also gets a bootstrap standard deviation.
pub fn scan_evaluate<B: Backend>(
    model: &SemiWeaklyModel<B>,
    scan: &ScanConfig,
    data: &dyn DatasetProvider,
    loss: LossKind,
    batch_size: usize,
    device: &B::Device,
) -> Result<Landscape> {
    scan.validate()?;
    if batch_size == 0 {
        return Err(PawsError::config("batch_size must be > 0"));
    }
    let base = model.estimates();
    let points = scan.grid.points();
    let parameters = points
        .iter()
        .map(|p| p.apply_estimates(&base))
        .collect::<Result<Vec<_>>>()?;

    tracing::info!(
        grid = %scan.grid,
        points = points.len(),
        metric = %scan.metric,
        split = %scan.split,
        "Starting landscape scan (evaluate)"
    );

    let reports: Vec<Vec<Option<RunReport>>> = points
        .iter()
        .zip(&parameters)
        .map(|(point, values)| {
            let mut at_point = model.with_parameters(values);
            if at_point.settings().sample_kappa {
                at_point = refresh_sampled_kappa(at_point, data, Split::Train, batch_size, device);
            }
            let scores = score_split(&at_point, data, scan.split, batch_size, device);
            let (value, failed) = accept_value(compute_metric(scan.metric, &scores, loss));
            let std = (scan.bootstrap > 0)
                .then(|| {
                    bootstrap_std(
                        scan.metric,
                        &scores,
                        loss,
                        scan.bootstrap,
                        derive_seed(scan.base_seed, point.index as u64),
                    )
                })
                .flatten();
            tracing::debug!(point = point.index, value = ?value, "Point evaluated");
            vec![Some(RunReport {
                point: point.index,
                restart: 0,
                result: None,
                value,
                bootstrap_std: std,
                failed,
            })]
        })
        .collect();

    Ok(Landscape {
        metric: scan.metric,
        higher_is_better: scan.metric.higher_is_better(),
        reduce: scan.reduce,
        mode: ScanMode::Evaluate,
        grid: scan.grid.clone(),
        points: build_points(scan, &reports),
    })
}
