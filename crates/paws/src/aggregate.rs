//! Aggregation of finished runs into one summary row per configuration.
//!
//! Runs sharing a `group_key` differ only in seed and restart. Within a group
//! the `top_k` successful runs with the lowest best validation loss are kept
//! and their test metrics and final parameters reduced. A [`ResultFilter`]
//! narrows the runs down by hypothesis and restart before grouping.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::TrainingMode;
use crate::error::{PawsError, Result};
use crate::result::{ParameterEstimates, RunResult};
use crate::training::metrics::{mean, median};

const RESULT_FILE: &str = "result.json";

/// Reduction of values across the kept runs of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Statistic {
    Mean,
    #[default]
    Median,
}

impl Statistic {
    pub fn apply(self, values: &[f64]) -> Option<f64> {
        match self {
            Self::Mean => mean(values),
            Self::Median => median(values),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateConfig {
    /// Runs kept per group; `None` keeps every successful run.
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default = "default_score_reduce")]
    pub score_reduce: Statistic,
    #[serde(default)]
    pub parameter_reduce: Statistic,
}

fn default_score_reduce() -> Statistic {
    Statistic::Mean
}

impl Default for AggregateConfig {
    fn default() -> Self {
        Self {
            top_k: None,
            score_reduce: default_score_reduce(),
            parameter_reduce: Statistic::default(),
        }
    }
}

/// One configuration's reduced results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRow {
    pub group_key: String,
    pub mode: TrainingMode,
    pub coordinate: BTreeMap<String, f64>,
    /// Runs found for the group.
    pub n_runs: usize,
    /// Runs that entered the reduction.
    pub n_kept: usize,
    pub n_failed: usize,
    pub n_degraded: usize,
    pub best_validation_loss: Option<f64>,
    pub metrics: BTreeMap<String, Option<f64>>,
    /// `None` when no run of the group succeeded.
    pub parameters: Option<ParameterEstimates>,
}

/// A filter entry: one value or the `*` wildcard.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Pattern<T> {
    Any,
    Value(T),
}

impl<T: std::str::FromStr> Pattern<T> {
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim() {
            "*" => Ok(Self::Any),
            value => value
                .parse()
                .map(Self::Value)
                .map_err(|_| PawsError::config(format!("invalid filter value '{value}'"))),
        }
    }

    /// Comma-separated entries.
    pub fn parse_list(s: &str) -> Result<Vec<Self>> {
        s.split(',')
            .filter(|part| !part.trim().is_empty())
            .map(Self::parse)
            .collect()
    }
}

impl Pattern<f64> {
    pub fn matches(&self, value: f64) -> bool {
        match self {
            Self::Any => true,
            Self::Value(v) => (v - value).abs() <= 1e-9 * v.abs().max(1.0),
        }
    }
}

impl Pattern<usize> {
    pub fn matches(&self, value: usize) -> bool {
        match self {
            Self::Any => true,
            Self::Value(v) => *v == value,
        }
    }
}

/// Selection of runs by the hypothesis they started from and their restart
/// index. A run passes a list when any entry matches; an empty list passes
/// every run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultFilter {
    /// Mass points as `m1:m2`, each component a value or `*`.
    pub mass_points: Vec<Vec<Pattern<f64>>>,
    pub mu: Vec<Pattern<f64>>,
    pub alpha: Vec<Pattern<f64>>,
    pub trials: Vec<Pattern<usize>>,
}

impl ResultFilter {
    /// Parse comma-separated `m1:m2` mass points, e.g. `"300:300,*:400"`.
    pub fn parse_mass_points(s: &str) -> Result<Vec<Vec<Pattern<f64>>>> {
        s.split(',')
            .filter(|part| !part.trim().is_empty())
            .map(|point| point.split(':').map(Pattern::parse).collect())
            .collect()
    }

    pub fn matches(&self, result: &RunResult) -> bool {
        let p = &result.initial_parameters;
        let mass_ok = self.mass_points.is_empty()
            || self.mass_points.iter().any(|point| match point.as_slice() {
                [Pattern::Any] => true,
                components => {
                    components.len() == p.masses.len()
                        && components.iter().zip(&p.masses).all(|(c, &m)| c.matches(m))
                }
            });
        let mu_ok = self.mu.is_empty() || self.mu.iter().any(|c| c.matches(p.mu));
        let alpha_ok = self.alpha.is_empty()
            || self.alpha.iter().any(|c| match p.alpha {
                Some(alpha) => c.matches(alpha),
                None => *c == Pattern::Any,
            });
        let trial_ok = self.trials.is_empty() || self.trials.iter().any(|c| c.matches(result.restart));
        mass_ok && mu_ok && alpha_ok && trial_ok
    }

    /// Runs that pass every list.
    pub fn apply(&self, results: Vec<RunResult>) -> Vec<RunResult> {
        let before = results.len();
        let kept: Vec<RunResult> = results.into_iter().filter(|r| self.matches(r)).collect();
        tracing::info!(before, after = kept.len(), "Filtered run results");
        kept
    }
}

/// Every `result.json` below `dir`, skipping provisional `.partial`
/// directories. Results come back sorted by run id.
pub fn collect_results(dir: &Path) -> Result<Vec<RunResult>> {
    let mut results = Vec::new();
    collect_into(dir, &mut results)?;
    results.sort_by(|a, b| a.run_id.cmp(&b.run_id));
    tracing::info!(dir = %dir.display(), count = results.len(), "Collected run results");
    Ok(results)
}

fn collect_into(dir: &Path, results: &mut Vec<RunResult>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            let provisional = path
                .extension()
                .is_some_and(|ext| ext == "partial" || ext == "old");
            if !provisional {
                collect_into(&path, results)?;
            }
        } else if path.file_name().is_some_and(|name| name == RESULT_FILE) {
            match RunResult::load(&path) {
                Ok(result) => results.push(result),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable result");
                }
            }
        }
    }
    Ok(())
}

fn reduce_parameters(kept: &[&RunResult], stat: Statistic) -> Option<ParameterEstimates> {
    let first = kept.first()?;
    let n_masses = first.final_parameters.masses.len();
    let masses = (0..n_masses)
        .map(|i| {
            let values: Vec<f64> = kept
                .iter()
                .filter_map(|r| r.final_parameters.masses.get(i).copied())
                .collect();
            stat.apply(&values).unwrap_or(f64::NAN)
        })
        .collect();
    let mus: Vec<f64> = kept.iter().map(|r| r.final_parameters.mu).collect();
    let alphas: Vec<f64> = kept.iter().filter_map(|r| r.final_parameters.alpha).collect();
    Some(ParameterEstimates {
        masses,
        mu: stat.apply(&mus)?,
        alpha: stat.apply(&alphas),
    })
}

/// Group runs by configuration and reduce each group.
pub fn aggregate(results: &[RunResult], config: &AggregateConfig) -> Vec<SummaryRow> {
    let mut groups: BTreeMap<&str, Vec<&RunResult>> = BTreeMap::new();
    for r in results {
        groups.entry(r.group_key.as_str()).or_default().push(r);
    }

    groups
        .into_iter()
        .map(|(key, runs)| {
            let mut ok: Vec<&RunResult> = runs
                .iter()
                .copied()
                .filter(|r| r.terminal_state.is_success())
                .collect();
            ok.sort_by(|a, b| {
                let a = a.best_validation_loss.unwrap_or(f64::INFINITY);
                let b = b.best_validation_loss.unwrap_or(f64::INFINITY);
                a.total_cmp(&b)
            });
            if let Some(k) = config.top_k {
                ok.truncate(k);
            }

            let mut names: Vec<&String> = runs.iter().flat_map(|r| r.test_metrics.keys()).collect();
            names.sort();
            names.dedup();
            let metrics = names
                .into_iter()
                .map(|name| {
                    let values: Vec<f64> = ok.iter().filter_map(|r| r.metric(name)).collect();
                    (name.clone(), config.score_reduce.apply(&values))
                })
                .collect();

            SummaryRow {
                group_key: key.to_string(),
                mode: runs[0].mode,
                coordinate: runs[0].coordinate.clone(),
                n_runs: runs.len(),
                n_kept: ok.len(),
                n_failed: runs.iter().filter(|r| !r.terminal_state.is_success()).count(),
                n_degraded: runs.iter().filter(|r| r.degraded).count(),
                best_validation_loss: ok.first().and_then(|r| r.best_validation_loss),
                metrics,
                parameters: reduce_parameters(&ok, config.parameter_reduce),
            }
        })
        .collect()
}
