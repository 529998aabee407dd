//! Joint training loop: one optimizer per parameter group, warmup + cosine
//! schedule, rollback-and-retry on numeric failure, and the stopping policy.
//!
//! A run is a pure function of its `RunConfig`, dataset and seed. Results and
//! weights are written to `<output_dir>/<run_id>.partial/` and promoted to
//! `<output_dir>/<run_id>/` only when the run succeeds.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use burn::grad_clipping::GradientClippingConfig;
use burn::module::AutodiffModule;
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::{Adam, AdamConfig, AdamW, AdamWConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};
use burn::tensor::backend::AutodiffBackend;
use events::{DatasetProvider, SampleFilter, Split};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::{MassInit, RunConfig, TrainableMask, TrainingConfig, MASS_SCALE};
use crate::error::{PawsError, Result};
use crate::model::bridge::{batch_to_tensor, mixed_indicator, tensor_to_f64, tensor_to_vec};
use crate::model::classifier::{ClassifierConfig, ParameterizedClassifier};
use crate::model::mixture::sampled_kappa;
use crate::model::parameters::PhysicalParameter;
use crate::model::SemiWeaklyModel;
use crate::result::{
    group_key, run_id, EpochRecord, ParameterEstimates, RunResult, TerminalState,
};
use crate::seed::epoch_seed;
use crate::training::loss::{check_batch_composition, weak_supervision_loss, BatchComposition};
use crate::training::metrics::{compute_metric, Metric, SplitScores};

const MODEL_FILE: &str = "model";
const CLASSIFIER_CONFIG_FILE: &str = "classifier.json";
pub(crate) const RUN_CONFIG_FILE: &str = "run_config.json";
const RESULT_FILE: &str = "result.json";

/// Per-run context that is not part of the configuration identity.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    /// Checked at every epoch boundary.
    pub cancel: Option<Arc<AtomicBool>>,
    /// Where artifacts go; nothing is written when `None`.
    pub output_dir: Option<PathBuf>,
    /// Grid coordinate this run belongs to.
    pub coordinate: BTreeMap<String, f64>,
    pub restart: usize,
}

impl RunContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }
}

/// Final weights plus the run record.
#[derive(Debug)]
pub struct TrainedRun<B: AutodiffBackend> {
    pub model: SemiWeaklyModel<B>,
    pub result: RunResult,
}

/// Compute the learning rate at a given step using warmup + cosine decay.
///
/// - Warmup phase (`step < warmup_steps`): linearly ramps from 0 to `base_lr`.
/// - Cosine phase: decays from `base_lr` to 0 following a cosine schedule.
pub fn lr_schedule(base_lr: f64, warmup_steps: usize, total_steps: usize, step: usize) -> f64 {
    if warmup_steps > 0 && step < warmup_steps {
        base_lr * (step + 1) as f64 / warmup_steps as f64
    } else {
        let decay_steps = total_steps.saturating_sub(warmup_steps).max(1);
        let progress = (step.saturating_sub(warmup_steps)) as f64 / decay_steps as f64;
        let progress = progress.min(1.0);
        base_lr * 0.5 * (1.0 + (std::f64::consts::PI * progress).cos())
    }
}

/// Trainable mask in effect at `epoch`, after the freezing schedule.
pub fn effective_mask(config: &RunConfig, epoch: usize) -> TrainableMask {
    let mut mask = config.mask();
    if epoch < config.training.mass_unfreeze_epoch {
        mask.mass = false;
    }
    if let Some(n) = config.training.network_train_epochs {
        if epoch >= n {
            mask.network = false;
        }
    }
    mask
}

/// Starting parameter values. `MassInit::Random` draws every non-fixed mass
/// uniformly within the bounds from `rng`.
pub fn initial_parameters<R: Rng>(config: &RunConfig, rng: &mut R) -> ParameterEstimates {
    let h = &config.hypothesis;
    let mut initial = ParameterEstimates::from_hypothesis(h);
    if h.mass_init == MassInit::Random {
        let [lo, hi] = h.mass_bounds;
        for (i, mass) in initial.masses.iter_mut().enumerate() {
            if !h.fixed_mass_components.contains(&i) {
                *mass = rng.gen_range(lo..=hi);
            }
        }
    }
    initial
}

/// Score every event of a split, in storage order, without gradients.
pub fn score_split<B: Backend>(
    model: &SemiWeaklyModel<B>,
    data: &dyn DatasetProvider,
    split: Split,
    batch_size: usize,
    device: &B::Device,
) -> SplitScores {
    let mask = TrainableMask::frozen();
    let mut scores = SplitScores::default();
    for batch in data.batches(split, batch_size, SampleFilter::All, None) {
        let out = model.forward(batch_to_tensor::<B>(&batch, device), &mask);
        scores.extend(SplitScores {
            log_ratio: tensor_to_vec(out.log_ratio),
            signal_log_ratio: tensor_to_vec(out.signal_log_ratio),
            tags: batch.tags,
            truth: batch.truth,
        });
    }
    scores
}

fn check_dataset(data: &dyn DatasetProvider) -> Result<()> {
    if data.n_features() == 0 {
        return Err(PawsError::Data("dataset has zero features".into()));
    }
    for split in [Split::Train, Split::Validation] {
        for (filter, name) in [
            (SampleFilter::Reference, "reference"),
            (SampleFilter::Mixed, "mixed"),
        ] {
            if data.len(split, filter) == 0 {
                return Err(PawsError::Data(format!(
                    "{split} split has no {name} events"
                )));
            }
        }
    }
    Ok(())
}

/// Reason a physical parameter left its domain by more than `margin` times
/// the domain width.
fn out_of_domain(p: &ParameterEstimates, config: &RunConfig) -> Option<String> {
    let margin = config.stopping.divergence_margin;
    let [lo, hi] = config.hypothesis.mass_bounds;
    let slack = margin * (hi - lo);
    for (i, &m) in p.masses.iter().enumerate() {
        if !(m.is_finite() && m >= lo - slack && m <= hi + slack) {
            return Some(format!("m{} = {m} GeV left [{lo}, {hi}]", i + 1));
        }
    }
    if !(p.mu.is_finite() && p.mu >= -margin && p.mu <= 1.0 + margin) {
        return Some(format!("mu = {} left [0, 1]", p.mu));
    }
    if let Some(alpha) = p.alpha {
        if !(alpha.is_finite() && alpha >= -margin && alpha <= 1.0 + margin) {
            return Some(format!("alpha = {alpha} left [0, 1]"));
        }
    }
    None
}

/// Largest change of any physical parameter, masses in network units.
fn max_parameter_change(a: &ParameterEstimates, b: &ParameterEstimates) -> f64 {
    let masses = a
        .masses
        .iter()
        .zip(&b.masses)
        .map(|(x, y)| ((x - y) / MASS_SCALE).abs());
    let alpha = match (a.alpha, b.alpha) {
        (Some(x), Some(y)) => (x - y).abs(),
        _ => 0.0,
    };
    masses
        .chain([(a.mu - b.mu).abs(), alpha])
        .fold(0.0, f64::max)
}

/// Optimizer state of every parameter group: AdamW with gradient clipping on
/// the network, plain Adam on each physical parameter.
struct GroupOptimizers<B: AutodiffBackend> {
    network: OptimizerAdaptor<AdamW, ParameterizedClassifier<B>, B>,
    masses: OptimizerAdaptor<Adam, PhysicalParameter<B>, B>,
    mu: OptimizerAdaptor<Adam, PhysicalParameter<B>, B>,
    alpha: OptimizerAdaptor<Adam, PhysicalParameter<B>, B>,
}

impl<B: AutodiffBackend> GroupOptimizers<B> {
    /// Fresh moment estimates.
    fn new(t: &TrainingConfig) -> Self {
        let physical = AdamConfig::new();
        Self {
            network: AdamWConfig::new()
                .with_weight_decay(t.weight_decay as f32)
                .with_grad_clipping(Some(GradientClippingConfig::Norm(t.max_grad_norm as f32)))
                .init(),
            masses: physical.init(),
            mu: physical.init(),
            alpha: physical.init(),
        }
    }
}

/// Tensors of one training batch.
struct StepInputs<B: Backend> {
    features: Tensor<B, 2>,
    is_mixed: Tensor<B, 1>,
    /// Every input feature is finite.
    finite: bool,
}

/// State before the last successful update, kept so that update can be
/// redone with a smaller rate.
struct AppliedStep<B: AutodiffBackend> {
    before: SemiWeaklyModel<B>,
    inputs: StepInputs<B>,
    schedule: f64,
}

/// Why an optimizer step was rejected.
#[derive(Debug, Clone, PartialEq)]
enum StepFailure {
    Inputs,
    Loss(f64),
    Parameters,
}

impl std::fmt::Display for StepFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inputs => write!(f, "non-finite input features"),
            Self::Loss(value) => write!(f, "loss is {value}"),
            Self::Parameters => write!(f, "parameter became non-finite"),
        }
    }
}

/// One optimizer update of every trainable group at `schedule` times the
/// group learning rates. Returns the updated model and the pre-update loss.
fn optimizer_step<B: AutodiffBackend>(
    model: &SemiWeaklyModel<B>,
    inputs: &StepInputs<B>,
    mask: &TrainableMask,
    schedule: f64,
    optimizers: &mut GroupOptimizers<B>,
    config: &RunConfig,
) -> std::result::Result<(SemiWeaklyModel<B>, f64), StepFailure> {
    if !inputs.finite {
        return Err(StepFailure::Inputs);
    }
    let t = &config.training;
    let out = model.forward(inputs.features.clone(), mask);
    let mut loss = weak_supervision_loss(t.loss, out.log_ratio, inputs.is_mixed.clone());
    if let Some(penalty) = model.regularization(mask) {
        loss = loss + penalty;
    }
    let loss_value = tensor_to_f64(loss.clone());
    if !loss_value.is_finite() {
        return Err(StepFailure::Loss(loss_value));
    }

    let SemiWeaklyModel {
        classifier,
        masses,
        mu,
        alpha,
        settings,
    } = model.clone();
    let mut grads = loss.backward();

    let classifier = if mask.network {
        let g = GradientsParams::from_module(&mut grads, &classifier);
        optimizers.network.step(t.network_lr * schedule, classifier, g)
    } else {
        classifier
    };
    let masses = if mask.mass {
        let g = GradientsParams::from_module(&mut grads, &masses);
        optimizers.masses.step(t.mass_lr * schedule, masses, g)
    } else {
        masses
    };
    let mu = if mask.mu {
        let g = GradientsParams::from_module(&mut grads, &mu);
        optimizers.mu.step(t.mu_lr * schedule, mu, g)
    } else {
        mu
    };
    let alpha = match alpha {
        Some(alpha) if mask.alpha => {
            let g = GradientsParams::from_module(&mut grads, &alpha);
            Some(optimizers.alpha.step(t.alpha_lr * schedule, alpha, g))
        }
        other => other,
    };
    let updated = SemiWeaklyModel {
        classifier,
        masses,
        mu,
        alpha,
        settings,
    };
    if updated.estimates().is_finite() {
        Ok((updated, loss_value))
    } else {
        Err(StepFailure::Parameters)
    }
}

/// Re-estimate a sampled kappa from the reference events of `split` under
/// the model's current masses. Keeps the old value when no estimate exists.
pub fn refresh_sampled_kappa<B: Backend>(
    model: SemiWeaklyModel<B>,
    data: &dyn DatasetProvider,
    split: Split,
    batch_size: usize,
    device: &B::Device,
) -> SemiWeaklyModel<B> {
    let mask = TrainableMask::frozen();
    let mut signal_log_ratio = Vec::new();
    for batch in data.batches(split, batch_size, SampleFilter::Reference, None) {
        let out = model.forward(batch_to_tensor::<B>(&batch, device), &mask);
        signal_log_ratio.extend(tensor_to_vec(out.signal_log_ratio));
    }
    match sampled_kappa(&signal_log_ratio) {
        Some(kappa) => {
            tracing::debug!(kappa, "Sampled kappa");
            model.with_kappa(kappa)
        }
        None => {
            tracing::warn!("No finite kappa estimate; keeping {}", model.settings().kappa);
            model
        }
    }
}

/// Train one run.
///
/// With `pretrained`, its weights replace the freshly initialised network
/// (for example a dedicated classifier reused by a semi-weakly run).
///
/// Configuration and data problems are returned as errors before any
/// compute. Divergence, cancellation and weak convergence are not errors:
/// they are reported through `RunResult::terminal_state` and `degraded`.
pub fn train<B: AutodiffBackend>(
    config: &RunConfig,
    data: &dyn DatasetProvider,
    pretrained: Option<ParameterizedClassifier<B>>,
    ctx: &RunContext,
    device: &B::Device,
) -> Result<TrainedRun<B>> {
    config.validate()?;
    check_dataset(data)?;

    let t = &config.training;
    let stopping = &config.stopping;
    let start = Instant::now();
    let n_features = data.n_features();

    let mut rng = StdRng::seed_from_u64(t.seed);
    let initial = initial_parameters(config, &mut rng);
    let mut model = match pretrained {
        Some(classifier) => {
            if classifier.n_features() != n_features {
                return Err(PawsError::Data(format!(
                    "pretrained classifier expects {} features, dataset has {n_features}",
                    classifier.n_features()
                )));
            }
            SemiWeaklyModel::new(classifier, config, &initial, device)?
        }
        None => SemiWeaklyModel::init(config, n_features, &initial, &mut rng, device)?,
    };

    let group = group_key(&t.run_name, t.mode, &ctx.coordinate);
    let id = run_id(&group, t.seed, ctx.restart);
    let steps_per_epoch = data
        .batches(Split::Train, t.batch_size, SampleFilter::All, None)
        .num_batches();
    let total_steps = steps_per_epoch * t.max_epochs;

    tracing::info!(
        run_id = %id,
        mode = %t.mode,
        seed = t.seed,
        n_features,
        steps_per_epoch,
        max_epochs = t.max_epochs,
        "Starting training run"
    );

    let mut optimizers = GroupOptimizers::new(t);
    let mut history: Vec<EpochRecord> = Vec::new();
    let mut best: Option<(usize, f64, SemiWeaklyModel<B>)> = None;
    let mut first_validation: Option<f64> = None;
    let mut previous: Option<(f64, ParameterEstimates)> = None;
    let mut epochs_since_improvement = 0usize;
    let mut imbalanced_batches = 0usize;
    let mut skipped_batches = 0usize;
    let mut step_retries = 0usize;
    let mut global_step = 0usize;
    let mut terminal = TerminalState::MaxEpochsReached;

    'epochs: for epoch in 0..t.max_epochs {
        let over_budget = t
            .max_wall_secs
            .is_some_and(|limit| start.elapsed().as_secs_f64() >= limit);
        if ctx.is_cancelled() || over_budget {
            tracing::info!(run_id = %id, epoch, over_budget, "Run cancelled");
            terminal = TerminalState::Cancelled;
            break;
        }

        let mask = effective_mask(config, epoch);
        if !mask.any() {
            tracing::info!(run_id = %id, epoch, "Freezing schedule left nothing to train");
            terminal = TerminalState::Converged;
            break;
        }

        if model.settings().sample_kappa {
            model = refresh_sampled_kappa(model, data, Split::Train, t.batch_size, device);
        }

        let mut step_scale = 1.0;
        let mut loss_sum = 0.0;
        let mut loss_steps = 0usize;
        let mut last_step: Option<AppliedStep<B>> = None;
        let batches = data.batches(
            Split::Train,
            t.batch_size,
            SampleFilter::All,
            Some(epoch_seed(t.seed, epoch)),
        );

        for (step, batch) in batches.enumerate() {
            match check_batch_composition(&batch.tags, t.min_source_fraction) {
                BatchComposition::Balanced => {}
                BatchComposition::Imbalanced { reference, mixed } => {
                    imbalanced_batches += 1;
                    tracing::warn!(epoch, step, reference, mixed, "Imbalanced batch");
                }
                BatchComposition::MissingSource { reference, mixed } => {
                    skipped_batches += 1;
                    tracing::debug!(epoch, step, reference, mixed, "Batch skipped (missing sample)");
                    global_step += 1;
                    continue;
                }
            }

            let inputs = StepInputs {
                features: batch_to_tensor::<B>(&batch, device),
                is_mixed: mixed_indicator::<B>(&batch.tags, device),
                finite: batch.features.iter().all(|v| v.is_finite()),
            };
            let mut consecutive = 0usize;

            loop {
                let schedule = lr_schedule(1.0, t.warmup_steps, total_steps, global_step) * step_scale;
                let failure = match optimizer_step(&model, &inputs, &mask, schedule, &mut optimizers, config) {
                    Ok((updated, loss_value)) => {
                        last_step = Some(AppliedStep {
                            before: model,
                            inputs,
                            schedule,
                        });
                        model = updated;
                        loss_sum += loss_value;
                        loss_steps += 1;
                        break;
                    }
                    Err(failure) => failure,
                };

                consecutive += 1;
                step_retries += 1;
                if consecutive > t.max_step_retries {
                    let err = PawsError::NumericInstability {
                        epoch,
                        step,
                        detail: failure.to_string(),
                    };
                    tracing::warn!(run_id = %id, retries = consecutive - 1, "{err}");
                    terminal = TerminalState::Diverged {
                        reason: err.to_string(),
                    };
                    break 'epochs;
                }
                step_scale *= t.retry_lr_factor;
                optimizers = GroupOptimizers::new(t);

                // A non-finite loss on finite inputs points at the update
                // that produced the current state: undo it and redo it with
                // the reduced rate.
                if let (StepFailure::Loss(_), Some(previous_step)) = (&failure, &last_step) {
                    let redo = previous_step.schedule * t.retry_lr_factor.powi(consecutive as i32);
                    model = match optimizer_step(
                        &previous_step.before,
                        &previous_step.inputs,
                        &mask,
                        redo,
                        &mut optimizers,
                        config,
                    ) {
                        Ok((redone, _)) => redone,
                        Err(_) => previous_step.before.clone(),
                    };
                    tracing::warn!(epoch, step, redo, "Rolled back previous step");
                }
                tracing::warn!(epoch, step, step_scale, detail = %failure, "Retrying step");
            }
            global_step += 1;
        }

        let valid = model.valid();
        let scores = score_split(&valid, data, Split::Validation, t.batch_size, device);
        let validation_loss = compute_metric(Metric::Loss, &scores, t.loss);
        let parameters = model.estimates();
        let train_loss = (loss_steps > 0).then(|| loss_sum / loss_steps as f64);

        tracing::info!(
            run_id = %id,
            epoch,
            train_loss = train_loss.map(|v| format!("{v:.5}")).unwrap_or_default(),
            validation_loss = validation_loss.map(|v| format!("{v:.5}")).unwrap_or_default(),
            masses = ?parameters.masses,
            mu = parameters.mu,
            "Epoch finished"
        );

        history.push(EpochRecord {
            epoch,
            train_loss,
            validation_loss,
            parameters: parameters.clone(),
            step_scale,
        });

        let Some(val) = validation_loss.filter(|v| v.is_finite()) else {
            terminal = TerminalState::Diverged {
                reason: format!("validation loss is not finite at epoch {epoch}"),
            };
            break;
        };
        if let Some(reason) = out_of_domain(&parameters, config) {
            tracing::warn!(run_id = %id, epoch, reason = %reason, "Run diverged");
            terminal = TerminalState::Diverged { reason };
            break;
        }

        first_validation.get_or_insert(val);
        let improved = best
            .as_ref()
            .map_or(true, |(_, b, _)| val < b - stopping.min_delta);
        if improved {
            best = Some((epoch, val, model.clone()));
            epochs_since_improvement = 0;
        } else {
            epochs_since_improvement += 1;
        }

        if let Some((prev_val, prev_params)) = &previous {
            let settled = (val - prev_val).abs() < stopping.convergence_tolerance
                && max_parameter_change(&parameters, prev_params) < stopping.convergence_tolerance;
            if epoch + 1 >= stopping.min_epochs && settled {
                terminal = TerminalState::Converged;
                break;
            }
        }
        if epochs_since_improvement >= stopping.patience {
            tracing::info!(run_id = %id, epoch, patience = stopping.patience, "Early stopping");
            terminal = TerminalState::EarlyStopped;
            break;
        }
        previous = Some((val, parameters));
    }

    let best_epoch = best.as_ref().map(|(e, _, _)| *e);
    let best_validation_loss = best.as_ref().map(|(_, v, _)| *v);
    if t.restore_best && terminal.is_success() {
        if let Some((_, _, best_model)) = best {
            model = best_model;
        }
    }

    let degraded = terminal == TerminalState::MaxEpochsReached
        && match (first_validation, best_validation_loss) {
            (Some(first), Some(best)) => first - best < stopping.min_improvement,
            _ => true,
        };
    if degraded {
        tracing::warn!(run_id = %id, "Run reached max epochs without meaningful improvement");
    }

    let test_metrics: BTreeMap<String, Option<f64>> = if terminal.is_success() {
        let scores = score_split(&model.valid(), data, Split::Test, t.batch_size, device);
        t.metrics
            .iter()
            .map(|m| (m.to_string(), compute_metric(*m, &scores, t.loss)))
            .collect()
    } else {
        t.metrics.iter().map(|m| (m.to_string(), None)).collect()
    };

    let result = RunResult {
        run_id: id,
        group_key: group,
        mode: t.mode,
        seed: t.seed,
        restart: ctx.restart,
        coordinate: ctx.coordinate.clone(),
        terminal_state: terminal,
        degraded,
        epochs_run: history.len(),
        best_epoch,
        best_validation_loss,
        initial_parameters: initial,
        final_parameters: model.estimates(),
        test_metrics,
        history,
        imbalanced_batches,
        skipped_batches,
        step_retries,
        elapsed_secs: start.elapsed().as_secs_f64(),
    };

    tracing::info!(
        run_id = %result.run_id,
        terminal_state = %result.terminal_state,
        epochs_run = result.epochs_run,
        step_retries,
        elapsed_secs = format!("{:.1}", result.elapsed_secs),
        "Training run finished"
    );

    if let Some(dir) = &ctx.output_dir {
        write_artifacts(dir, &model, config, &result)?;
    }

    Ok(TrainedRun { model, result })
}

/// Write a run into `<dir>/<run_id>.partial/` and promote it on success.
/// A failed run only clears its own stale partial directory.
fn write_artifacts<B: Backend>(
    dir: &Path,
    model: &SemiWeaklyModel<B>,
    config: &RunConfig,
    result: &RunResult,
) -> Result<()> {
    let partial = dir.join(format!("{}.partial", result.run_id));
    if partial.exists() {
        std::fs::remove_dir_all(&partial)?;
    }
    if !result.terminal_state.is_success() {
        tracing::debug!(run_id = %result.run_id, "Not writing artifacts for failed run");
        return Ok(());
    }

    std::fs::create_dir_all(&partial)?;
    save_model(model, config, &partial)?;
    result.save(&partial.join(RESULT_FILE))?;

    let target = dir.join(&result.run_id);
    if target.exists() {
        let old = dir.join(format!("{}.old", result.run_id));
        if old.exists() {
            std::fs::remove_dir_all(&old)?;
        }
        std::fs::rename(&target, &old)?;
        std::fs::rename(&partial, &target)?;
        std::fs::remove_dir_all(&old)?;
    } else {
        std::fs::rename(&partial, &target)?;
    }
    tracing::info!(path = %target.display(), "Run artifacts written");
    Ok(())
}

/// Save weights, architecture and run configuration into `dir`.
pub fn save_model<B: Backend>(
    model: &SemiWeaklyModel<B>,
    config: &RunConfig,
    dir: &Path,
) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    model
        .classifier
        .to_config()
        .save(dir.join(CLASSIFIER_CONFIG_FILE))?;
    let file = std::fs::File::create(dir.join(RUN_CONFIG_FILE))?;
    serde_json::to_writer_pretty(std::io::BufWriter::new(file), config)?;
    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    model
        .clone()
        .save_file(dir.join(MODEL_FILE), &recorder)
        .map_err(|e| {
            PawsError::Checkpoint(format!("failed to save model to {}: {e}", dir.display()))
        })?;
    Ok(())
}

/// Load a model saved by [`save_model`], with its run configuration.
pub fn load_model<B: Backend>(
    dir: &Path,
    device: &B::Device,
) -> Result<(RunConfig, SemiWeaklyModel<B>)> {
    let classifier_config = ClassifierConfig::load(dir.join(CLASSIFIER_CONFIG_FILE))
        .map_err(|e| {
            PawsError::Checkpoint(format!(
                "failed to read classifier config in {}: {e}",
                dir.display()
            ))
        })?;
    let run_config_path = dir.join(RUN_CONFIG_FILE);
    let file = std::fs::File::open(&run_config_path).map_err(|e| {
        PawsError::Checkpoint(format!("failed to open {}: {e}", run_config_path.display()))
    })?;
    let config: RunConfig = serde_json::from_reader(std::io::BufReader::new(file))?;

    // Weights are overwritten by the record; the generator only fixes shapes.
    let classifier = classifier_config.init::<B, _>(&mut StdRng::seed_from_u64(0), device);
    let initial = ParameterEstimates::from_hypothesis(&config.hypothesis);
    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    let model = SemiWeaklyModel::new(classifier, &config, &initial, device)?
        .load_file(dir.join(MODEL_FILE), &recorder, device)
        .map_err(|e| {
            PawsError::Checkpoint(format!("failed to load model from {}: {e}", dir.display()))
        })?;
    Ok((config, model))
}
