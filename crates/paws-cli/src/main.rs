mod config;
mod pipeline;
pub mod results;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use config::{RunOverrides, ScanOverrides};
use pipeline::{GatherArgs, GenerateArgs, PretrainArgs, ScanArgs, SummaryArgs, TrainArgs};

#[derive(Parser)]
#[command(
    name = "paws",
    version,
    about = "Prior-assisted weak supervision: train, scan and gather resonance-search classifiers"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// Flags shared by `train` and `scan` that override `RunConfig` fields.
#[derive(Args, Debug, Default)]
struct RunFlags {
    /// Training mode: dedicated, ideal_weakly or semi_weakly.
    #[arg(long)]
    mode: Option<String>,
    /// Run name used in run ids and group keys.
    #[arg(long)]
    run_name: Option<String>,
    /// Base random seed.
    #[arg(long)]
    seed: Option<u64>,
    /// Maximum training epochs.
    #[arg(long)]
    max_epochs: Option<usize>,
    /// Events per batch.
    #[arg(long)]
    batch_size: Option<usize>,
    /// Initial resonance masses in GeV, comma separated (e.g. 300,250).
    #[arg(long, value_delimiter = ',')]
    masses: Option<Vec<f64>>,
    /// Initial signal fraction of the mixed sample.
    #[arg(long)]
    mu: Option<f64>,
    /// Initial two-prong branching fraction.
    #[arg(long)]
    alpha: Option<f64>,
    /// Prior normalization: a positive number, sampled or inferred.
    #[arg(long)]
    kappa: Option<String>,
}

impl From<RunFlags> for RunOverrides {
    fn from(flags: RunFlags) -> Self {
        Self {
            mode: flags.mode,
            run_name: flags.run_name,
            seed: flags.seed,
            max_epochs: flags.max_epochs,
            batch_size: flags.batch_size,
            masses: flags.masses,
            mu: flags.mu,
            alpha: flags.alpha,
            kappa: flags.kappa,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Generate a synthetic signal-injection dataset as Parquet.
    Generate {
        /// TOML config; its [data.synthetic] section provides the defaults.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Output Parquet file.
        #[arg(long, default_value = "data/synthetic.parquet")]
        output: PathBuf,
        /// Reference (background-only) events.
        #[arg(long)]
        n_reference: Option<usize>,
        /// Mixed-sample events.
        #[arg(long)]
        n_mixed: Option<usize>,
        /// Injected signal fraction of the mixed sample.
        #[arg(long)]
        mu: Option<f64>,
        /// Two-prong branching fraction of the injected signal.
        #[arg(long)]
        alpha: Option<f64>,
        /// First resonance mass in GeV.
        #[arg(long)]
        m1: Option<f64>,
        /// Second resonance mass in GeV.
        #[arg(long)]
        m2: Option<f64>,
        /// Extra pure-noise feature columns.
        #[arg(long)]
        noise_dimensions: Option<usize>,
        /// Generator seed.
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Train the parametric classifier on truth labels over a grid of signal masses.
    Pretrain {
        /// TOML config; [model], [training], [stopping] and [data.synthetic] apply.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Directory for the classifier; pass it to `train --pretrained`.
        #[arg(long, default_value = "runs/pretrained")]
        output_dir: PathBuf,
        /// Signal mass points in GeV as m1:m2, comma separated.
        #[arg(long, required = true)]
        mass_points: String,
        /// Signal events per mass point and decay mode.
        #[arg(long, default_value_t = 1000)]
        n_signal_per_point: usize,
        /// Background events; overrides [data.synthetic] n_reference.
        #[arg(long)]
        n_background: Option<usize>,
        /// Generator seed; overrides [data.synthetic] seed.
        #[arg(long)]
        data_seed: Option<u64>,
        #[command(flatten)]
        run: RunFlags,
    },
    /// Train one model and write its artifacts.
    Train {
        /// TOML config with [model], [hypothesis], [training], [stopping] and [data].
        #[arg(long)]
        config: Option<PathBuf>,
        /// Event Parquet file(s); override [data] paths.
        #[arg(long, num_args = 1..)]
        data: Vec<PathBuf>,
        /// Root directory for run artifacts.
        #[arg(long, default_value = "runs")]
        output_dir: PathBuf,
        /// Saved model directory whose classifier initialises the network.
        #[arg(long)]
        pretrained: Option<PathBuf>,
        #[command(flatten)]
        run: RunFlags,
    },
    /// Map a metric over a hypothesis grid.
    Scan {
        /// TOML config; [scan] holds the grid and scan settings.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Event Parquet file(s); override [data] paths.
        #[arg(long, num_args = 1..)]
        data: Vec<PathBuf>,
        /// Directory for run artifacts and landscape.json.
        #[arg(long, default_value = "runs/scan")]
        output_dir: PathBuf,
        /// Saved model: pretrained classifier for retrain, scored model for evaluate.
        #[arg(long)]
        model: Option<PathBuf>,
        /// Grid expression, e.g. "m1=100_500_50,m2=(300),mu=0.01".
        #[arg(long)]
        grid: Option<String>,
        /// Scan mode: retrain or evaluate.
        #[arg(long)]
        scan_mode: Option<String>,
        /// Metric: loss, auc, accuracy, log_loss or sic_<inverse fpr>.
        #[arg(long)]
        metric: Option<String>,
        /// Restart reduction: best, mean or median.
        #[arg(long)]
        reduce: Option<String>,
        /// Training restarts per grid point.
        #[arg(long)]
        restarts: Option<usize>,
        /// Training runs in flight at once.
        #[arg(long)]
        max_concurrency: Option<usize>,
        /// Bootstrap resamples per point (0 disables).
        #[arg(long)]
        bootstrap: Option<usize>,
        /// Rerun the scan even when the output landscape already exists.
        #[arg(long)]
        no_cache: bool,
        #[command(flatten)]
        run: RunFlags,
    },
    /// Aggregate run results into a summary table.
    Gather {
        /// Directory searched recursively for result.json files.
        #[arg(long)]
        input: PathBuf,
        /// Output Parquet file.
        #[arg(long, default_value = "summary.parquet")]
        output: PathBuf,
        /// Also write the summary as JSON.
        #[arg(long)]
        json: Option<PathBuf>,
        /// Keep the k runs with the lowest validation loss per group.
        #[arg(long)]
        top_k: Option<usize>,
        /// Reduction of test metrics: mean or median.
        #[arg(long)]
        score_reduce: Option<String>,
        /// Reduction of final parameters: mean or median.
        #[arg(long)]
        parameter_reduce: Option<String>,
        /// Initial mass points to keep as m1:m2, comma separated; `*` matches any.
        #[arg(long, default_value = "*")]
        mass_points: String,
        /// Initial mu values to keep, comma separated; `*` matches any.
        #[arg(long, default_value = "*")]
        mu_list: String,
        /// Initial alpha values to keep, comma separated; `*` matches any.
        #[arg(long, default_value = "*")]
        alpha_list: String,
        /// Restart indices to keep, comma separated; `*` matches any.
        #[arg(long, default_value = "*")]
        trial_list: String,
    },
    /// Print statistics of an event Parquet file, landscape or gathered summary.
    Summary {
        /// Input file (.parquet events, landscape.json or summary JSON).
        #[arg(long)]
        input: PathBuf,
        /// Print as JSON.
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Generate {
            config,
            output,
            n_reference,
            n_mixed,
            mu,
            alpha,
            m1,
            m2,
            noise_dimensions,
            seed,
        } => pipeline::run_generate(GenerateArgs {
            config,
            output,
            n_reference,
            n_mixed,
            mu,
            alpha,
            m1,
            m2,
            noise_dimensions,
            seed,
        }),
        Command::Pretrain {
            config,
            output_dir,
            mass_points,
            n_signal_per_point,
            n_background,
            data_seed,
            run,
        } => {
            pipeline::run_pretrain(PretrainArgs {
                config,
                output_dir,
                mass_points,
                n_signal_per_point,
                n_background,
                data_seed,
                overrides: run.into(),
            })
            .await
        }
        Command::Train {
            config,
            data,
            output_dir,
            pretrained,
            run,
        } => {
            pipeline::run_train(TrainArgs {
                config,
                data,
                output_dir,
                pretrained,
                overrides: run.into(),
            })
            .await
        }
        Command::Scan {
            config,
            data,
            output_dir,
            model,
            grid,
            scan_mode,
            metric,
            reduce,
            restarts,
            max_concurrency,
            bootstrap,
            no_cache,
            run,
        } => {
            pipeline::run_scan(ScanArgs {
                config,
                data,
                output_dir,
                model,
                no_cache,
                run: run.into(),
                scan: ScanOverrides {
                    grid,
                    mode: scan_mode,
                    metric,
                    reduce,
                    restarts,
                    max_concurrency,
                    bootstrap,
                },
            })
            .await
        }
        Command::Gather {
            input,
            output,
            json,
            top_k,
            score_reduce,
            parameter_reduce,
            mass_points,
            mu_list,
            alpha_list,
            trial_list,
        } => pipeline::run_gather(GatherArgs {
            input,
            output,
            json,
            top_k,
            score_reduce,
            parameter_reduce,
            mass_points,
            mu_list,
            alpha_list,
            trial_list,
        }),
        Command::Summary { input, json } => pipeline::run_summary(SummaryArgs { input, json }),
    }
}
