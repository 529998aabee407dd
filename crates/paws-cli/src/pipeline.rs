//! Subcommand pipelines: synthetic data generation, supervised pretraining,
//! single training runs, landscape scans, result gathering and file
//! summaries.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use burn::backend::ndarray::NdArray;
use burn::backend::Autodiff;
use indicatif::{ProgressBar, ProgressStyle};

use events::{DatasetProvider, DatasetSummary, EventReader, EventWriter, LabeledEvent};
use paws::aggregate::{aggregate, collect_results, AggregateConfig, Pattern, ResultFilter};
use paws::landscape::{
    scan_evaluate, scan_retrain, Landscape, ProgressFn, RunReport, ScanContext, ScanMode,
};
use paws::model::classifier::ParameterizedClassifier;
use paws::training::supervised::{load_classifier, train_supervised, SupervisedSet};
use paws::training::trainer::{load_model, train, RunContext};

use crate::config::{
    build_run_config, build_scan_config, load_dataset, load_or_default, parse_name, RunOverrides,
    ScanOverrides,
};
use crate::results::{
    print_landscape, print_summary_rows, read_summary_json, write_summary_json,
    write_summary_parquet,
};

/// Backend for training runs.
pub type TrainBackend = Autodiff<NdArray<f32>>;
/// Backend for scoring a frozen model.
pub type EvalBackend = NdArray<f32>;

const LANDSCAPE_FILE: &str = "landscape.json";

/// Arguments for the `generate` subcommand.
#[derive(Debug)]
pub struct GenerateArgs {
    /// Config whose `[data.synthetic]` section seeds the generator settings.
    pub config: Option<PathBuf>,
    /// Output Parquet file.
    pub output: PathBuf,
    pub n_reference: Option<usize>,
    pub n_mixed: Option<usize>,
    pub mu: Option<f64>,
    pub alpha: Option<f64>,
    pub m1: Option<f64>,
    pub m2: Option<f64>,
    pub noise_dimensions: Option<usize>,
    pub seed: Option<u64>,
}

/// Arguments for the `pretrain` subcommand.
#[derive(Debug)]
pub struct PretrainArgs {
    pub config: Option<PathBuf>,
    /// The classifier is written here.
    pub output_dir: PathBuf,
    /// `m1:m2` pairs in GeV, comma separated.
    pub mass_points: String,
    pub n_signal_per_point: usize,
    pub n_background: Option<usize>,
    pub data_seed: Option<u64>,
    pub overrides: RunOverrides,
}

/// Arguments for the `train` subcommand.
#[derive(Debug)]
pub struct TrainArgs {
    pub config: Option<PathBuf>,
    /// Event Parquet files; override `[data] paths`.
    pub data: Vec<PathBuf>,
    /// Root directory for run artifacts.
    pub output_dir: PathBuf,
    /// Saved model whose classifier initialises the network.
    pub pretrained: Option<PathBuf>,
    pub overrides: RunOverrides,
}

/// Arguments for the `scan` subcommand.
#[derive(Debug)]
pub struct ScanArgs {
    pub config: Option<PathBuf>,
    pub data: Vec<PathBuf>,
    /// Run artifacts and `landscape.json` go here.
    pub output_dir: PathBuf,
    /// Retrain: pretrained classifier. Evaluate: the frozen model to score.
    pub model: Option<PathBuf>,
    /// Rerun even when `landscape.json` exists.
    pub no_cache: bool,
    pub run: RunOverrides,
    pub scan: ScanOverrides,
}

/// Arguments for the `gather` subcommand.
#[derive(Debug)]
pub struct GatherArgs {
    /// Directory searched recursively for `result.json` files.
    pub input: PathBuf,
    /// Output Parquet file.
    pub output: PathBuf,
    /// Optional JSON copy of the summary.
    pub json: Option<PathBuf>,
    pub top_k: Option<usize>,
    pub score_reduce: Option<String>,
    pub parameter_reduce: Option<String>,
    /// `m1:m2` filters on the initial masses.
    pub mass_points: String,
    pub mu_list: String,
    pub alpha_list: String,
    pub trial_list: String,
}

/// Arguments for the `summary` subcommand.
#[derive(Debug)]
pub struct SummaryArgs {
    /// Event Parquet file, landscape JSON or gathered summary JSON.
    pub input: PathBuf,
    /// Print as JSON instead of text.
    pub json: bool,
}

fn progress_bar(len: u64) -> anyhow::Result<ProgressBar> {
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")?
            .progress_chars("=> "),
    );
    Ok(pb)
}

fn load_pretrained(
    dir: Option<&PathBuf>,
    device: &<TrainBackend as burn::prelude::Backend>::Device,
) -> anyhow::Result<Option<ParameterizedClassifier<TrainBackend>>> {
    let Some(dir) = dir else {
        return Ok(None);
    };
    let classifier = load_classifier::<TrainBackend>(dir, device)?;
    tracing::info!(
        path = %dir.display(),
        signal_log_odds = classifier.signal_log_odds(),
        "Loaded pretrained classifier"
    );
    Ok(Some(classifier))
}

/// Parse `m1:m2` pairs, e.g. `"200:300,300:300"`.
fn parse_mass_points(s: &str) -> anyhow::Result<Vec<(f64, f64)>> {
    s.split(',')
        .filter(|part| !part.trim().is_empty())
        .map(|part| {
            let (m1, m2) = part
                .split_once(':')
                .ok_or_else(|| anyhow::anyhow!("Invalid mass point '{part}': expected m1:m2"))?;
            let parse = |v: &str| {
                v.trim()
                    .parse::<f64>()
                    .map_err(|e| anyhow::anyhow!("Invalid mass '{v}' in '{part}': {e}"))
            };
            Ok((parse(m1)?, parse(m2)?))
        })
        .collect()
}

/// Keep the feature columns named in `[data] features`, in order.
fn select_labeled_features(
    events: Vec<LabeledEvent>,
    indices: &[usize],
) -> anyhow::Result<Vec<LabeledEvent>> {
    events
        .into_iter()
        .map(|mut event| {
            let selected = indices
                .iter()
                .map(|&i| {
                    event.features.get(i).copied().ok_or_else(|| {
                        anyhow::anyhow!(
                            "Feature index {i} out of range for {} features",
                            event.features.len()
                        )
                    })
                })
                .collect::<anyhow::Result<Vec<f32>>>()?;
            event.features = selected;
            Ok(event)
        })
        .collect()
}

fn print_dataset_summary(summary: &DatasetSummary) {
    println!("Total events: {}", summary.total_events);
    println!("Features: {}", summary.n_features);
    println!("Reference: {}", summary.reference_count);
    println!("Mixed: {}", summary.mixed_count);
    println!("Signal (truth): {}", summary.signal_count);
    if let Some(fraction) = summary.mixed_signal_fraction() {
        println!("Mixed signal fraction: {fraction:.5}");
    }
}

/// Generate a synthetic signal-injection dataset and write it to Parquet.
pub fn run_generate(args: GenerateArgs) -> anyhow::Result<()> {
    let toml = load_or_default(args.config.as_deref())?;
    let mut synthetic = toml.data.synthetic.unwrap_or_default();
    if let Some(n) = args.n_reference {
        synthetic.n_reference = n;
    }
    if let Some(n) = args.n_mixed {
        synthetic.n_mixed = n;
    }
    if let Some(mu) = args.mu {
        synthetic.mu = mu;
    }
    if let Some(alpha) = args.alpha {
        synthetic.alpha = alpha;
    }
    if let Some(m) = args.m1 {
        synthetic.m1 = m;
    }
    if let Some(m) = args.m2 {
        synthetic.m2 = m;
    }
    if let Some(n) = args.noise_dimensions {
        synthetic.noise_dimensions = n;
    }
    if let Some(seed) = args.seed {
        synthetic.seed = seed;
    }

    let events = events::synthetic::generate(&synthetic)?;
    let summary = DatasetSummary::from_events(&events);
    let mut writer = EventWriter::new(args.output);
    writer.record_all(events);
    let path = writer.finish()?;

    println!("--- Generated Dataset ---");
    println!("Output: {}", path.display());
    print_dataset_summary(&summary);
    Ok(())
}

/// Train the parametric classifier on labelled synthetic events and write it
/// to `output_dir`.
pub async fn run_pretrain(args: PretrainArgs) -> anyhow::Result<()> {
    let start = Instant::now();

    // 1. Config
    let toml = load_or_default(args.config.as_deref())?;
    let config = build_run_config(&toml, &args.overrides)?;
    let mass_points = parse_mass_points(&args.mass_points)?;
    if mass_points.is_empty() {
        anyhow::bail!("No mass points given");
    }

    // 2. Labelled events
    let mut synthetic = toml.data.synthetic.clone().unwrap_or_default();
    if let Some(n) = args.n_background {
        synthetic.n_reference = n;
    }
    if let Some(seed) = args.data_seed {
        synthetic.seed = seed;
    }
    let mut events =
        events::synthetic::generate_labeled(&synthetic, &mass_points, args.n_signal_per_point)?;
    if let Some(indices) = &toml.data.features {
        events = select_labeled_features(events, indices)?;
    }
    let data = SupervisedSet::from_events(events, toml.data.fractions, toml.data.split_seed)?;

    // 3. Train off the async runtime
    tracing::info!(
        mass_points = mass_points.len(),
        n_features = data.n_features(),
        seed = config.training.seed,
        "Starting supervised pretraining"
    );
    let ctx = RunContext {
        output_dir: Some(args.output_dir.clone()),
        ..Default::default()
    };
    let device = Default::default();
    let trained = tokio::task::spawn_blocking(move || {
        train_supervised::<TrainBackend>(&config, &data, &ctx, &device)
    })
    .await??;
    let result = trained.result;

    // 4. Summary
    println!("\n--- Pretraining Summary ---");
    println!("Terminal state: {}", result.terminal_state);
    println!("Epochs: {}", result.epochs_run);
    if let Some(loss) = result.best_validation_loss {
        println!("Best validation loss: {loss:.6}");
    }
    for (mode, auc) in result.test_auc.iter().enumerate() {
        match auc {
            Some(v) => println!("Test AUC (mode {mode}): {v:.4}"),
            None => println!("Test AUC (mode {mode}): n/a"),
        }
    }
    println!("Signal log-odds: {:.4}", result.signal_log_odds);
    if result.terminal_state.is_success() {
        println!("Output: {}", args.output_dir.display());
    }
    println!("Elapsed: {:.1}s", start.elapsed().as_secs_f64());
    Ok(())
}

/// Train one run and write its artifacts under `output_dir/<run_id>/`.
pub async fn run_train(args: TrainArgs) -> anyhow::Result<()> {
    let start = Instant::now();

    // 1. Config
    let toml = load_or_default(args.config.as_deref())?;
    let config = build_run_config(&toml, &args.overrides)?;

    // 2. Data
    let dataset = load_dataset(&toml.data, &args.data)?;

    // 3. Optional pretrained network
    let device = Default::default();
    let pretrained = load_pretrained(args.pretrained.as_ref(), &device)?;

    // 4. Train off the async runtime
    tracing::info!(
        mode = %config.training.mode,
        seed = config.training.seed,
        n_features = dataset.n_features(),
        "Starting training run"
    );
    let ctx = RunContext {
        output_dir: Some(args.output_dir.clone()),
        ..Default::default()
    };
    let run = tokio::task::spawn_blocking(move || {
        train::<TrainBackend>(&config, &dataset, pretrained, &ctx, &device)
    })
    .await??;
    let result = run.result;

    // 5. Summary
    println!("\n--- Training Summary ---");
    println!("Run: {}", result.run_id);
    println!("Mode: {}", result.mode);
    println!("Terminal state: {}", result.terminal_state);
    if result.degraded {
        println!("Degraded: parameters did not converge");
    }
    println!("Epochs: {}", result.epochs_run);
    if let Some(loss) = result.best_validation_loss {
        println!("Best validation loss: {loss:.6}");
    }
    let p = &result.final_parameters;
    println!("Masses: {:?}", p.masses);
    println!("mu: {:.6}", p.mu);
    if let Some(alpha) = p.alpha {
        println!("alpha: {alpha:.4}");
    }
    for (name, value) in &result.test_metrics {
        match value {
            Some(v) => println!("{name}: {v:.4}"),
            None => println!("{name}: n/a"),
        }
    }
    if result.terminal_state.is_success() {
        println!("Artifacts: {}", args.output_dir.join(&result.run_id).display());
    }
    println!("Elapsed: {:.1}s", start.elapsed().as_secs_f64());

    Ok(())
}

/// Scan the hypothesis grid and write `landscape.json`.
pub async fn run_scan(args: ScanArgs) -> anyhow::Result<()> {
    let start = Instant::now();

    let path = args.output_dir.join(LANDSCAPE_FILE);
    if !args.no_cache && path.exists() {
        let landscape = Landscape::load(&path)?;
        tracing::info!(path = %path.display(), "Landscape exists, skipping scan");
        println!();
        print_landscape(&landscape);
        println!("Cached: {}", path.display());
        return Ok(());
    }

    let toml = load_or_default(args.config.as_deref())?;
    let scan = build_scan_config(&toml.scan, &args.scan)?;
    let dataset = load_dataset(&toml.data, &args.data)?;

    let landscape = match scan.mode {
        ScanMode::Retrain => {
            let base = build_run_config(&toml, &args.run)?;
            let device = Default::default();
            let pretrained = load_pretrained(args.model.as_ref(), &device)?;

            let pb = progress_bar((scan.grid.len() * scan.restarts) as u64)?;
            let bar = pb.clone();
            let progress: ProgressFn = Arc::new(move |report: &RunReport| {
                if report.failed {
                    bar.set_message(format!(
                        "point {} restart {} failed",
                        report.point, report.restart
                    ));
                }
                bar.inc(1);
            });
            let ctx = ScanContext {
                output_dir: Some(args.output_dir.clone()),
                progress: Some(progress),
                ..Default::default()
            };
            let data: Arc<dyn DatasetProvider> = Arc::new(dataset);
            let outcome =
                scan_retrain::<TrainBackend>(&base, &scan, data, pretrained, ctx, device).await?;
            pb.finish_with_message("done");
            outcome.landscape
        }
        ScanMode::Evaluate => {
            let dir = args
                .model
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("Evaluate scans need --model <saved model dir>"))?;
            let device = Default::default();
            let (config, model) = load_model::<EvalBackend>(dir, &device)?;
            let batch_size = args.run.batch_size.unwrap_or(config.training.batch_size);
            scan_evaluate(
                &model,
                &scan,
                &dataset,
                config.training.loss,
                batch_size,
                &device,
            )?
        }
    };

    std::fs::create_dir_all(&args.output_dir)?;
    landscape.save(&path)?;

    println!();
    print_landscape(&landscape);
    println!("Output: {}", path.display());
    println!("Elapsed: {:.1}s", start.elapsed().as_secs_f64());
    Ok(())
}

/// Collect run results below a directory and write the aggregated table.
pub fn run_gather(args: GatherArgs) -> anyhow::Result<()> {
    let results = collect_results(&args.input)?;
    if results.is_empty() {
        anyhow::bail!("No result.json files found under {}", args.input.display());
    }
    let filter = ResultFilter {
        mass_points: ResultFilter::parse_mass_points(&args.mass_points)?,
        mu: Pattern::parse_list(&args.mu_list)?,
        alpha: Pattern::parse_list(&args.alpha_list)?,
        trials: Pattern::parse_list(&args.trial_list)?,
    };
    let results = filter.apply(results);
    if results.is_empty() {
        anyhow::bail!("No runs under {} pass the filters", args.input.display());
    }

    let mut config = AggregateConfig {
        top_k: args.top_k,
        ..Default::default()
    };
    if let Some(s) = &args.score_reduce {
        config.score_reduce = parse_name("score reduction", s)?;
    }
    if let Some(s) = &args.parameter_reduce {
        config.parameter_reduce = parse_name("parameter reduction", s)?;
    }

    let rows = aggregate(&results, &config);
    write_summary_parquet(&rows, &args.output)?;
    if let Some(json) = &args.json {
        write_summary_json(&rows, json)?;
    }

    print_summary_rows(&rows);
    println!("Runs: {}", results.len());
    println!("Groups: {}", rows.len());
    println!("Output: {}", args.output.display());
    Ok(())
}

/// Print statistics of an event Parquet file, a landscape or a gathered summary.
pub fn run_summary(args: SummaryArgs) -> anyhow::Result<()> {
    let is_parquet = args
        .input
        .extension()
        .is_some_and(|ext| ext == "parquet");

    if is_parquet {
        let summary = EventReader::read_summary(&args.input)?;
        if args.json {
            println!("{}", serde_json::to_string_pretty(&summary)?);
        } else {
            println!("--- Dataset Summary ---");
            println!("File: {}", args.input.display());
            print_dataset_summary(&summary);
        }
        return Ok(());
    }

    if let Ok(landscape) = Landscape::load(&args.input) {
        if args.json {
            println!("{}", serde_json::to_string_pretty(&landscape)?);
        } else {
            print_landscape(&landscape);
        }
        return Ok(());
    }

    let rows = read_summary_json(&args.input).map_err(|e| {
        anyhow::anyhow!(
            "{} is neither a landscape nor a gathered summary: {e}",
            args.input.display()
        )
    })?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        let by_mode: BTreeMap<String, usize> = rows.iter().fold(BTreeMap::new(), |mut acc, r| {
            *acc.entry(r.mode.to_string()).or_default() += 1;
            acc
        });
        print_summary_rows(&rows);
        for (mode, n) in by_mode {
            println!("{mode}: {n} groups");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use events::TruthLabel;

    #[test]
    fn test_parse_mass_points() {
        let points = parse_mass_points("200:300, 300:300,").unwrap();
        assert_eq!(points, vec![(200.0, 300.0), (300.0, 300.0)]);
        assert!(parse_mass_points("200").is_err());
        assert!(parse_mass_points("200:heavy").is_err());
    }

    #[test]
    fn test_select_labeled_features() {
        let events = vec![LabeledEvent {
            features: vec![1.0, 2.0, 3.0],
            truth: TruthLabel::Background,
            decay_mode: None,
            masses: Vec::new(),
        }];
        let selected = select_labeled_features(events.clone(), &[2, 0]).unwrap();
        assert_eq!(selected[0].features, vec![3.0, 1.0]);
        assert!(select_labeled_features(events, &[3]).is_err());
    }
}
