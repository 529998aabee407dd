//! TOML config loading for the paws CLI.
//!
//! Deserializes `configs/paws.toml`, whose `[model]`, `[hypothesis]`,
//! `[training]` and `[stopping]` sections make up a `RunConfig`, plus the
//! `[scan]` and `[data]` sections, then merges CLI overrides on top.

use std::path::{Path, PathBuf};

use events::{EventReader, InMemoryDataset, Split, SplitFractions, SyntheticConfig};
use paws::config::{HypothesisConfig, Kappa, ModelSettings, StoppingPolicy, TrainingConfig, BASE_SEED};
use paws::landscape::{Grid, Reduce, ScanConfig, ScanMode};
use paws::training::metrics::Metric;
use paws::{RunConfig, TrainingMode};
use serde::de::DeserializeOwned;
use serde::Deserialize;

/// Top-level structure matching `configs/paws.toml`. Every section is optional.
#[derive(Debug, Default, Deserialize)]
pub struct PawsToml {
    #[serde(default)]
    pub model: ModelSettings,
    #[serde(default)]
    pub hypothesis: HypothesisConfig,
    #[serde(default)]
    pub training: TrainingConfig,
    #[serde(default)]
    pub stopping: StoppingPolicy,
    #[serde(default)]
    pub scan: ScanSection,
    #[serde(default)]
    pub data: DataSection,
}

/// Scan settings. All optional so the grid can also come from `--grid`.
#[derive(Debug, Default, Deserialize)]
pub struct ScanSection {
    pub grid: Option<String>,
    pub restarts: Option<usize>,
    pub mode: Option<ScanMode>,
    pub metric: Option<Metric>,
    pub reduce: Option<Reduce>,
    pub max_concurrency: Option<usize>,
    pub bootstrap: Option<usize>,
    pub split: Option<Split>,
    pub base_seed: Option<u64>,
}

/// Where events come from and how they are partitioned.
#[derive(Debug, Deserialize)]
pub struct DataSection {
    /// Event Parquet files. Take precedence over `synthetic`.
    #[serde(default)]
    pub paths: Vec<PathBuf>,
    /// Generate events in memory when no paths are given.
    pub synthetic: Option<SyntheticConfig>,
    #[serde(default)]
    pub fractions: SplitFractions,
    #[serde(default = "default_split_seed")]
    pub split_seed: u64,
    /// Feature columns to keep, in order.
    pub features: Option<Vec<usize>>,
}

fn default_split_seed() -> u64 {
    BASE_SEED
}

impl Default for DataSection {
    fn default() -> Self {
        Self {
            paths: Vec::new(),
            synthetic: None,
            fractions: SplitFractions::default(),
            split_seed: default_split_seed(),
            features: None,
        }
    }
}

/// Load and deserialize a `PawsToml` from a TOML file.
pub fn load_paws_toml(path: &Path) -> anyhow::Result<PawsToml> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read config {}: {e}", path.display()))?;
    let config: PawsToml = toml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("Invalid config {}: {e}", path.display()))?;
    tracing::info!(path = %path.display(), "Loaded paws config");
    Ok(config)
}

/// Load the config file if one is given, defaults otherwise.
pub fn load_or_default(path: Option<&Path>) -> anyhow::Result<PawsToml> {
    match path {
        Some(p) => load_paws_toml(p),
        None => Ok(PawsToml::default()),
    }
}

/// Parse a CLI string into any enum that deserializes from its name.
pub fn parse_name<T: DeserializeOwned>(kind: &str, value: &str) -> anyhow::Result<T> {
    serde_json::from_value(serde_json::Value::String(value.to_string()))
        .map_err(|e| anyhow::anyhow!("Invalid {kind} '{value}': {e}"))
}

/// CLI flags that override `RunConfig` fields.
#[derive(Debug, Default, Clone)]
pub struct RunOverrides {
    pub mode: Option<String>,
    pub run_name: Option<String>,
    pub seed: Option<u64>,
    pub max_epochs: Option<usize>,
    pub batch_size: Option<usize>,
    pub masses: Option<Vec<f64>>,
    pub mu: Option<f64>,
    pub alpha: Option<f64>,
    /// A positive number, `sampled` or `inferred`.
    pub kappa: Option<String>,
}

/// Build a `RunConfig` from defaults, TOML sections and CLI flags.
///
/// Priority chain: defaults < TOML values < CLI flags. A dedicated run whose
/// mu was left at the default gets mu = 1, matching `RunConfig::for_mode`.
pub fn build_run_config(toml: &PawsToml, overrides: &RunOverrides) -> anyhow::Result<RunConfig> {
    let mut config = RunConfig {
        model: toml.model.clone(),
        hypothesis: toml.hypothesis.clone(),
        training: toml.training.clone(),
        stopping: toml.stopping.clone(),
    };

    if let Some(mode) = &overrides.mode {
        config.training.mode = parse_name::<TrainingMode>("mode", mode)?;
    }
    if config.training.mode == TrainingMode::Dedicated
        && overrides.mu.is_none()
        && config.hypothesis.mu == HypothesisConfig::default().mu
    {
        config.hypothesis.mu = 1.0;
    }
    if let Some(name) = &overrides.run_name {
        config.training.run_name = name.clone();
    }
    if let Some(seed) = overrides.seed {
        config.training.seed = seed;
    }
    if let Some(n) = overrides.max_epochs {
        config.training.max_epochs = n;
    }
    if let Some(n) = overrides.batch_size {
        config.training.batch_size = n;
    }
    if let Some(masses) = &overrides.masses {
        config.hypothesis.masses = masses.clone();
    }
    if let Some(mu) = overrides.mu {
        config.hypothesis.mu = mu;
    }
    if let Some(alpha) = overrides.alpha {
        config.hypothesis.alpha = alpha;
    }
    if let Some(kappa) = &overrides.kappa {
        config.hypothesis.kappa = Kappa::parse(kappa).ok_or_else(|| {
            anyhow::anyhow!("Invalid kappa '{kappa}': expected a number, 'sampled' or 'inferred'")
        })?;
    }

    config.validate()?;
    Ok(config)
}

/// CLI flags that override `[scan]` fields.
#[derive(Debug, Default, Clone)]
pub struct ScanOverrides {
    pub grid: Option<String>,
    pub mode: Option<String>,
    pub metric: Option<String>,
    pub reduce: Option<String>,
    pub restarts: Option<usize>,
    pub max_concurrency: Option<usize>,
    pub bootstrap: Option<usize>,
}

/// Build a `ScanConfig`. The grid expression is required from TOML or CLI.
pub fn build_scan_config(
    section: &ScanSection,
    overrides: &ScanOverrides,
) -> anyhow::Result<ScanConfig> {
    let expr = overrides
        .grid
        .as_deref()
        .or(section.grid.as_deref())
        .ok_or_else(|| anyhow::anyhow!("No grid given: set [scan] grid or pass --grid"))?;
    let mut scan = ScanConfig::new(Grid::parse(expr)?);

    if let Some(n) = section.restarts {
        scan.restarts = n;
    }
    if let Some(mode) = section.mode {
        scan.mode = mode;
    }
    if let Some(metric) = section.metric {
        scan.metric = metric;
    }
    if let Some(reduce) = section.reduce {
        scan.reduce = reduce;
    }
    if let Some(n) = section.max_concurrency {
        scan.max_concurrency = n;
    }
    if let Some(n) = section.bootstrap {
        scan.bootstrap = n;
    }
    if let Some(split) = section.split {
        scan.split = split;
    }
    if let Some(seed) = section.base_seed {
        scan.base_seed = seed;
    }

    if let Some(mode) = &overrides.mode {
        scan.mode = parse_name("scan mode", mode)?;
    }
    if let Some(metric) = &overrides.metric {
        scan.metric = Metric::parse(metric)
            .ok_or_else(|| anyhow::anyhow!("Unknown metric '{metric}'"))?;
    }
    if let Some(reduce) = &overrides.reduce {
        scan.reduce = parse_name("reduction", reduce)?;
    }
    if let Some(n) = overrides.restarts {
        scan.restarts = n;
    }
    if let Some(n) = overrides.max_concurrency {
        scan.max_concurrency = n;
    }
    if let Some(n) = overrides.bootstrap {
        scan.bootstrap = n;
    }

    scan.validate()?;
    Ok(scan)
}

/// Load the events named by `--data` (or `[data] paths`), falling back to
/// `[data.synthetic]`, and partition them.
pub fn load_dataset(section: &DataSection, cli_paths: &[PathBuf]) -> anyhow::Result<InMemoryDataset> {
    let paths = if cli_paths.is_empty() {
        section.paths.as_slice()
    } else {
        cli_paths
    };

    let events = if !paths.is_empty() {
        EventReader::read_multiple(paths)?
    } else if let Some(synthetic) = &section.synthetic {
        tracing::info!(seed = synthetic.seed, "Generating synthetic events");
        events::synthetic::generate(synthetic)?
    } else {
        anyhow::bail!("No event data: pass --data or set [data] paths / [data.synthetic]");
    };

    let dataset = InMemoryDataset::from_events(events, section.fractions, section.split_seed)?;
    match &section.features {
        Some(indices) => dataset.select_features(indices),
        None => Ok(dataset),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use events::DatasetProvider;

    #[test]
    fn test_deserialize_full_paws_toml() {
        let toml_str = r#"
[model]
hidden = [32, 16]

[hypothesis]
masses = [250.0, 400.0]
mu = 0.02
decay_modes = ["qq", "qqq"]

[training]
mode = "ideal_weakly"
batch_size = 512
max_epochs = 40
seed = 7

[stopping]
patience = 4

[scan]
grid = "m1=100_500_100,m2=(300)"
restarts = 3
metric = "auc"
reduce = "median"

[data]
paths = ["a.parquet", "b.parquet"]
split_seed = 11
features = [0, 2, 4]

[data.fractions]
train = 0.6
validation = 0.2
test = 0.2
"#;
        let config: PawsToml = toml::from_str(toml_str).unwrap();
        assert_eq!(config.model.hidden, vec![32, 16]);
        assert_eq!(config.hypothesis.masses, vec![250.0, 400.0]);
        assert_eq!(config.hypothesis.decay_modes.len(), 2);
        assert_eq!(config.training.mode, TrainingMode::IdealWeakly);
        assert_eq!(config.training.batch_size, 512);
        assert_eq!(config.stopping.patience, 4);
        assert_eq!(config.scan.restarts, Some(3));
        assert_eq!(config.scan.metric, Some(Metric::Auc));
        assert_eq!(config.scan.reduce, Some(Reduce::Median));
        assert_eq!(config.data.paths.len(), 2);
        assert_eq!(config.data.split_seed, 11);
        assert!((config.data.fractions.train - 0.6).abs() < 1e-12);
        assert_eq!(config.data.features, Some(vec![0, 2, 4]));
    }

    #[test]
    fn test_shipped_config_is_valid() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../configs/paws.toml");
        let config = load_paws_toml(&path).unwrap();
        let run = build_run_config(&config, &RunOverrides::default()).unwrap();
        assert!(run.hypothesis.has_alpha());
        let scan = build_scan_config(&config.scan, &ScanOverrides::default()).unwrap();
        assert_eq!(scan.grid.len(), 81);
        assert_eq!(scan.restarts, 3);
        assert!(config.data.synthetic.is_some());
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config: PawsToml = toml::from_str("").unwrap();
        assert_eq!(config.training.mode, TrainingMode::SemiWeakly);
        assert!(config.scan.grid.is_none());
        assert!(config.data.paths.is_empty());
        assert_eq!(config.data.split_seed, BASE_SEED);
        let run = build_run_config(&config, &RunOverrides::default()).unwrap();
        assert_eq!(run, RunConfig::default());
    }

    #[test]
    fn test_cli_override_priority() {
        let config: PawsToml = toml::from_str(
            r#"
[training]
seed = 7
max_epochs = 40
batch_size = 512
"#,
        )
        .unwrap();
        let overrides = RunOverrides {
            seed: Some(99),
            max_epochs: Some(5),
            masses: Some(vec![200.0, 350.0]),
            ..Default::default()
        };
        let run = build_run_config(&config, &overrides).unwrap();
        assert_eq!(run.training.seed, 99);
        assert_eq!(run.training.max_epochs, 5);
        // Not overridden: TOML value survives.
        assert_eq!(run.training.batch_size, 512);
        assert_eq!(run.hypothesis.masses, vec![200.0, 350.0]);
    }

    #[test]
    fn test_dedicated_override_sets_unit_mu() {
        let overrides = RunOverrides {
            mode: Some("dedicated".into()),
            ..Default::default()
        };
        let run = build_run_config(&PawsToml::default(), &overrides).unwrap();
        assert_eq!(run.training.mode, TrainingMode::Dedicated);
        assert_eq!(run.hypothesis.mu, 1.0);
    }

    #[test]
    fn test_invalid_override_is_rejected() {
        let bad_mode = RunOverrides {
            mode: Some("strongly".into()),
            ..Default::default()
        };
        assert!(build_run_config(&PawsToml::default(), &bad_mode).is_err());

        let bad_mass = RunOverrides {
            masses: Some(vec![10.0, 300.0]),
            ..Default::default()
        };
        assert!(build_run_config(&PawsToml::default(), &bad_mass).is_err());
    }

    #[test]
    fn test_kappa_override() {
        let sampled = RunOverrides {
            kappa: Some("sampled".into()),
            ..Default::default()
        };
        let run = build_run_config(&PawsToml::default(), &sampled).unwrap();
        assert_eq!(run.hypothesis.kappa, Kappa::Estimate(paws::config::KappaEstimate::Sampled));

        let fixed = RunOverrides {
            kappa: Some("2.5".into()),
            ..Default::default()
        };
        let run = build_run_config(&PawsToml::default(), &fixed).unwrap();
        assert_eq!(run.hypothesis.kappa, Kappa::Value(2.5));

        for bad in ["guessed", "-1", "0"] {
            let overrides = RunOverrides {
                kappa: Some(bad.into()),
                ..Default::default()
            };
            assert!(build_run_config(&PawsToml::default(), &overrides).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_scan_config_cli_grid_wins() {
        let section = ScanSection {
            grid: Some("mu=(0.01)".into()),
            restarts: Some(2),
            ..Default::default()
        };
        let overrides = ScanOverrides {
            grid: Some("m1=100_300_100".into()),
            metric: Some("sic_1000".into()),
            mode: Some("evaluate".into()),
            ..Default::default()
        };
        let scan = build_scan_config(&section, &overrides).unwrap();
        assert_eq!(scan.grid.len(), 3);
        assert_eq!(scan.restarts, 2);
        assert_eq!(scan.mode, ScanMode::Evaluate);
        assert_eq!(scan.metric, Metric::Sic { inverse_fpr: 1000.0 });
    }

    #[test]
    fn test_scan_config_requires_grid() {
        let err = build_scan_config(&ScanSection::default(), &ScanOverrides::default());
        assert!(err.is_err());

        let bad_metric = ScanOverrides {
            grid: Some("mu=(0.01)".into()),
            metric: Some("precision".into()),
            ..Default::default()
        };
        assert!(build_scan_config(&ScanSection::default(), &bad_metric).is_err());
    }

    #[test]
    fn test_load_synthetic_dataset_with_feature_selection() {
        let section = DataSection {
            synthetic: Some(SyntheticConfig {
                n_reference: 200,
                n_mixed: 200,
                ..Default::default()
            }),
            features: Some(vec![0, 1, 2]),
            ..Default::default()
        };
        let dataset = load_dataset(&section, &[]).unwrap();
        assert_eq!(dataset.n_features(), 3);
        let total: usize = [Split::Train, Split::Validation, Split::Test]
            .iter()
            .map(|&s| dataset.events(s).len())
            .sum();
        assert_eq!(total, 400);
    }

    #[test]
    fn test_load_dataset_without_source_fails() {
        assert!(load_dataset(&DataSection::default(), &[]).is_err());
    }
}
