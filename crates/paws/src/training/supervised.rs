//! Supervised training of the mass-parameterized classifier on truth labels.
//!
//! Signal events carry the masses they were generated at. Background events
//! take a mass hypothesis drawn from the signal masses of their split,
//! redrawn every training epoch, so the classifier learns the likelihood
//! ratio at every hypothesis of the grid. A semi-weakly run then fits the
//! masses and mu on this network with its weights frozen.

use std::path::Path;
use std::time::Instant;

use burn::grad_clipping::GradientClippingConfig;
use burn::module::AutodiffModule;
use burn::optim::{AdamWConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};
use burn::tensor::activation::log_sigmoid;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::TensorData;
use events::{DecayMode, LabeledEvent, Split, SplitFractions, TruthLabel};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::config::{RunConfig, MASS_SCALE};
use crate::error::{PawsError, Result};
use crate::model::bridge::tensor_to_f64;
use crate::model::classifier::{ClassifierConfig, ParameterizedClassifier};
use crate::result::TerminalState;
use crate::seed::{derive_seed, epoch_seed};
use crate::training::metrics::roc_auc;
use crate::training::trainer::{load_model, lr_schedule, RunContext, RUN_CONFIG_FILE};

const CLASSIFIER_FILE: &str = "classifier";
const CLASSIFIER_CONFIG_FILE: &str = "classifier.json";
const SUPERVISED_RESULT_FILE: &str = "supervised_result.json";

/// Truth-labelled events with fixed train / validation / test partitions.
#[derive(Debug, Clone)]
pub struct SupervisedSet {
    train: Vec<LabeledEvent>,
    validation: Vec<LabeledEvent>,
    test: Vec<LabeledEvent>,
    n_features: usize,
    n_masses: usize,
}

impl SupervisedSet {
    /// Partition `events` deterministically from `split_seed`, background and
    /// signal separately so every split keeps both classes.
    pub fn from_events(
        events: Vec<LabeledEvent>,
        fractions: SplitFractions,
        split_seed: u64,
    ) -> Result<Self> {
        fractions
            .validate()
            .map_err(|e| PawsError::Data(e.to_string()))?;
        let n_features = events
            .first()
            .map(|e| e.features.len())
            .ok_or_else(|| PawsError::Data("labelled dataset has no events".into()))?;
        if let Some(bad) = events.iter().find(|e| e.features.len() != n_features) {
            return Err(PawsError::Data(format!(
                "inconsistent feature length: expected {n_features}, found {}",
                bad.features.len()
            )));
        }
        let n_masses = events
            .iter()
            .find(|e| e.truth.is_signal())
            .map(|e| e.masses.len())
            .ok_or_else(|| PawsError::Data("labelled dataset has no signal events".into()))?;
        if n_masses == 0 {
            return Err(PawsError::Data("signal events carry no masses".into()));
        }
        if let Some(bad) = events
            .iter()
            .find(|e| e.truth.is_signal() && e.masses.len() != n_masses)
        {
            return Err(PawsError::Data(format!(
                "signal events carry {n_masses} masses, found one with {}",
                bad.masses.len()
            )));
        }

        let mut rng = StdRng::seed_from_u64(split_seed);
        let mut train = Vec::new();
        let mut validation = Vec::new();
        let mut test = Vec::new();
        for truth in [TruthLabel::Background, TruthLabel::Signal] {
            let mut group: Vec<&LabeledEvent> = events.iter().filter(|e| e.truth == truth).collect();
            group.shuffle(&mut rng);
            let n = group.len();
            let n_train = (n as f64 * fractions.train).round() as usize;
            let n_val = ((n as f64 * fractions.validation).round() as usize).min(n - n_train);
            for (i, event) in group.into_iter().enumerate() {
                let target = if i < n_train {
                    &mut train
                } else if i < n_train + n_val {
                    &mut validation
                } else {
                    &mut test
                };
                target.push(event.clone());
            }
        }
        for part in [&mut train, &mut validation, &mut test] {
            part.shuffle(&mut rng);
        }

        tracing::info!(
            train = train.len(),
            validation = validation.len(),
            test = test.len(),
            n_features,
            n_masses,
            split_seed,
            "Partitioned labelled dataset"
        );

        Ok(Self {
            train,
            validation,
            test,
            n_features,
            n_masses,
        })
    }

    pub fn events(&self, split: Split) -> &[LabeledEvent] {
        match split {
            Split::Train => &self.train,
            Split::Validation => &self.validation,
            Split::Test => &self.test,
        }
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn n_masses(&self) -> usize {
        self.n_masses
    }
}

/// One epoch of supervised training.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisedEpoch {
    pub epoch: usize,
    pub train_loss: Option<f64>,
    pub validation_loss: Option<f64>,
}

/// Outcome of a supervised training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisedResult {
    pub terminal_state: TerminalState,
    pub epochs_run: usize,
    pub best_epoch: Option<usize>,
    pub best_validation_loss: Option<f64>,
    /// Test AUC of each decay mode's signal against all background.
    pub test_auc: Vec<Option<f64>>,
    pub signal_log_odds: f64,
    pub history: Vec<SupervisedEpoch>,
    /// Batches without events of both classes.
    pub skipped_batches: usize,
    pub elapsed_secs: f64,
}

impl SupervisedResult {
    pub fn save(&self, path: &Path) -> Result<()> {
        let file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(file), self)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
    }
}

/// Trained network plus its record.
#[derive(Debug)]
pub struct TrainedClassifier<B: AutodiffBackend> {
    pub classifier: ParameterizedClassifier<B>,
    pub result: SupervisedResult,
}

/// Output column of each event: its decay mode's column for signal, `None`
/// for background.
fn output_columns(events: &[LabeledEvent], modes: &[DecayMode]) -> Result<Vec<Option<usize>>> {
    events
        .iter()
        .map(|e| {
            if !e.truth.is_signal() {
                return Ok(None);
            }
            match e.decay_mode {
                None => Ok(Some(0)),
                Some(mode) => modes.iter().position(|m| *m == mode).map(Some).ok_or_else(|| {
                    PawsError::Data(format!("signal event of unconfigured decay mode {mode}"))
                }),
            }
        })
        .collect()
}

/// Mass hypothesis of every event: a signal event's own masses, a
/// background event's drawn from the split's signal masses.
fn assign_masses<R: Rng>(events: &[LabeledEvent], rng: &mut R) -> Vec<Vec<f64>> {
    let pool: Vec<&Vec<f64>> = events
        .iter()
        .filter(|e| e.truth.is_signal())
        .map(|e| &e.masses)
        .collect();
    events
        .iter()
        .map(|e| {
            if e.truth.is_signal() {
                e.masses.clone()
            } else {
                pool.choose(rng).map(|m| (*m).clone()).unwrap_or_default()
            }
        })
        .collect()
}

/// Tensors of one batch plus its per-column loss weights.
struct LabeledBatch<B: Backend> {
    features: Tensor<B, 2>,
    masses: Tensor<B, 2>,
    targets: Tensor<B, 2>,
    weights: Tensor<B, 2>,
    /// Columns with both classes present.
    active_columns: usize,
}

/// Build a batch from `indices` of a split.
///
/// Per column, with `class_balanced` background and signal each carry half
/// the weight; otherwise every participating event weighs the same. Weights
/// of a column sum to one, and columns without both classes get none.
fn labeled_batch<B: Backend>(
    events: &[LabeledEvent],
    masses: &[Vec<f64>],
    columns: &[Option<usize>],
    indices: &[usize],
    n_outputs: usize,
    class_balanced: bool,
    device: &B::Device,
) -> LabeledBatch<B> {
    let len = indices.len();
    let n_features = events.first().map_or(0, |e| e.features.len());
    let n_masses = masses.iter().map(Vec::len).max().unwrap_or(0);

    let n_background = indices.iter().filter(|&&i| columns[i].is_none()).count();
    let mut n_signal = vec![0usize; n_outputs];
    for &i in indices {
        if let Some(c) = columns[i] {
            n_signal[c] += 1;
        }
    }
    let active: Vec<bool> = n_signal.iter().map(|&n| n > 0 && n_background > 0).collect();

    let mut features = Vec::with_capacity(len * n_features);
    let mut mass_values = Vec::with_capacity(len * n_masses);
    let mut targets = vec![0.0_f32; len * n_outputs];
    let mut weights = vec![0.0_f32; len * n_outputs];
    for (row, &i) in indices.iter().enumerate() {
        features.extend_from_slice(&events[i].features);
        mass_values.extend(masses[i].iter().map(|m| (m / MASS_SCALE) as f32));
        for c in 0..n_outputs {
            if !active[c] {
                continue;
            }
            let cell = row * n_outputs + c;
            let total = (n_background + n_signal[c]) as f64;
            match columns[i] {
                None => {
                    weights[cell] = if class_balanced {
                        0.5 / n_background as f64
                    } else {
                        1.0 / total
                    } as f32;
                }
                Some(col) if col == c => {
                    targets[cell] = 1.0;
                    weights[cell] = if class_balanced {
                        0.5 / n_signal[c] as f64
                    } else {
                        1.0 / total
                    } as f32;
                }
                Some(_) => {}
            }
        }
    }

    LabeledBatch {
        features: Tensor::from_data(TensorData::new(features, [len, n_features]), device),
        masses: Tensor::from_data(TensorData::new(mass_values, [len, n_masses]), device),
        targets: Tensor::from_data(TensorData::new(targets, [len, n_outputs]), device),
        weights: Tensor::from_data(TensorData::new(weights, [len, n_outputs]), device),
        active_columns: active.iter().filter(|&&a| a).count(),
    }
}

/// Weighted binary cross-entropy with logits, averaged over active columns.
///
/// `logits`, `targets` and `weights` have shape `(batch, n_outputs)`.
pub fn weighted_bce<B: Backend>(
    logits: Tensor<B, 2>,
    targets: Tensor<B, 2>,
    weights: Tensor<B, 2>,
    active_columns: usize,
) -> Tensor<B, 1> {
    let negatives = targets.clone().neg().add_scalar(1.0);
    let per_cell = (log_sigmoid(logits.clone()) * targets + log_sigmoid(logits.neg()) * negatives).neg();
    (per_cell * weights)
        .sum()
        .div_scalar(active_columns.max(1) as f64)
}

/// Mean loss over a split in fixed order, without gradients.
fn split_loss<B: Backend>(
    classifier: &ParameterizedClassifier<B>,
    events: &[LabeledEvent],
    masses: &[Vec<f64>],
    columns: &[Option<usize>],
    batch_size: usize,
    class_balanced: bool,
    device: &B::Device,
) -> Option<f64> {
    let order: Vec<usize> = (0..events.len()).collect();
    let mut sum = 0.0;
    let mut count = 0usize;
    for chunk in order.chunks(batch_size) {
        let batch = labeled_batch::<B>(
            events,
            masses,
            columns,
            chunk,
            classifier.n_outputs(),
            class_balanced,
            device,
        );
        if batch.active_columns == 0 {
            continue;
        }
        let logits = classifier.forward_per_event(batch.features, batch.masses);
        let loss = weighted_bce(logits, batch.targets, batch.weights, batch.active_columns);
        sum += tensor_to_f64(loss) * chunk.len() as f64;
        count += chunk.len();
    }
    (count > 0).then(|| sum / count as f64)
}

/// Per-mode test AUC of mode signal against background, at each event's mass
/// hypothesis.
fn per_mode_auc<B: Backend>(
    classifier: &ParameterizedClassifier<B>,
    events: &[LabeledEvent],
    masses: &[Vec<f64>],
    columns: &[Option<usize>],
    batch_size: usize,
    device: &B::Device,
) -> Vec<Option<f64>> {
    let n_outputs = classifier.n_outputs();
    let order: Vec<usize> = (0..events.len()).collect();
    let mut logits: Vec<f32> = Vec::with_capacity(events.len() * n_outputs);
    for chunk in order.chunks(batch_size) {
        let batch = labeled_batch::<B>(events, masses, columns, chunk, n_outputs, true, device);
        let out = classifier.forward_per_event(batch.features, batch.masses);
        logits.extend(out.into_data().iter::<f32>());
    }
    (0..n_outputs)
        .map(|c| {
            let (scores, labels): (Vec<f64>, Vec<bool>) = columns
                .iter()
                .enumerate()
                .filter(|(_, col)| col.map_or(true, |col| col == c))
                .map(|(i, col)| (logits[i * n_outputs + c] as f64, col.is_some()))
                .unzip();
            roc_auc(&scores, &labels)
        })
        .collect()
}

/// Train the mass-parameterized classifier on truth labels.
///
/// Uses the architecture in `config.model`, one output per configured decay
/// mode, and the optimizer, schedule and stopping settings of
/// `config.training` and `config.stopping`. With `ctx.output_dir` the network
/// is written there by [`save_classifier`] when the run succeeds.
pub fn train_supervised<B: AutodiffBackend>(
    config: &RunConfig,
    data: &SupervisedSet,
    ctx: &RunContext,
    device: &B::Device,
) -> Result<TrainedClassifier<B>> {
    config.validate()?;
    let t = &config.training;
    let stopping = &config.stopping;
    let modes = &config.hypothesis.decay_modes;
    if data.n_masses() != config.hypothesis.masses.len() {
        return Err(PawsError::config(format!(
            "labelled events carry {} masses, hypothesis has {}",
            data.n_masses(),
            config.hypothesis.masses.len()
        )));
    }

    let train_events = data.events(Split::Train);
    let validation_events = data.events(Split::Validation);
    let test_events = data.events(Split::Test);
    let train_columns = output_columns(train_events, modes)?;
    let validation_columns = output_columns(validation_events, modes)?;
    let test_columns = output_columns(test_events, modes)?;
    for (name, columns) in [("train", &train_columns), ("validation", &validation_columns)] {
        if columns.iter().all(Option::is_some) || columns.iter().all(Option::is_none) {
            return Err(PawsError::Data(format!(
                "{name} split needs both signal and background events"
            )));
        }
    }

    let n_background = train_columns.iter().filter(|c| c.is_none()).count();
    let n_signal = train_columns.len() - n_background;
    let signal_log_odds = if t.class_balanced {
        0.0
    } else {
        (n_signal as f64 / (modes.len() * n_background) as f64).ln()
    };

    let start = Instant::now();
    let mut rng = StdRng::seed_from_u64(t.seed);
    let mut classifier: ParameterizedClassifier<B> = config
        .model
        .classifier_config(data.n_features(), data.n_masses(), modes.len())
        .init(&mut rng, device);
    classifier = classifier.with_signal_log_odds(signal_log_odds);

    // Validation and test hypotheses are drawn once.
    let validation_masses = assign_masses(
        validation_events,
        &mut StdRng::seed_from_u64(derive_seed(t.seed, 1)),
    );
    let test_masses = assign_masses(test_events, &mut StdRng::seed_from_u64(derive_seed(t.seed, 2)));

    let steps_per_epoch = train_events.len().div_ceil(t.batch_size);
    let total_steps = steps_per_epoch * t.max_epochs;
    let mut optim = AdamWConfig::new()
        .with_weight_decay(t.weight_decay as f32)
        .with_grad_clipping(Some(GradientClippingConfig::Norm(t.max_grad_norm as f32)))
        .init();

    tracing::info!(
        train = train_events.len(),
        n_signal,
        n_background,
        class_balanced = t.class_balanced,
        steps_per_epoch,
        max_epochs = t.max_epochs,
        "Starting supervised training"
    );

    let mut history = Vec::new();
    let mut best: Option<(usize, f64, ParameterizedClassifier<B>)> = None;
    let mut previous_validation: Option<f64> = None;
    let mut epochs_since_improvement = 0usize;
    let mut skipped_batches = 0usize;
    let mut global_step = 0usize;
    let mut terminal = TerminalState::MaxEpochsReached;

    'epochs: for epoch in 0..t.max_epochs {
        let over_budget = t
            .max_wall_secs
            .is_some_and(|limit| start.elapsed().as_secs_f64() >= limit);
        if ctx.is_cancelled() || over_budget {
            tracing::info!(epoch, over_budget, "Supervised training cancelled");
            terminal = TerminalState::Cancelled;
            break;
        }

        let mut epoch_rng = StdRng::seed_from_u64(epoch_seed(t.seed, epoch));
        let train_masses = assign_masses(train_events, &mut epoch_rng);
        let mut order: Vec<usize> = (0..train_events.len()).collect();
        order.shuffle(&mut epoch_rng);

        let mut loss_sum = 0.0;
        let mut loss_steps = 0usize;
        for (step, chunk) in order.chunks(t.batch_size).enumerate() {
            let batch = labeled_batch::<B>(
                train_events,
                &train_masses,
                &train_columns,
                chunk,
                modes.len(),
                t.class_balanced,
                device,
            );
            if batch.active_columns == 0 {
                skipped_batches += 1;
                global_step += 1;
                continue;
            }
            let logits = classifier.forward_per_event(batch.features, batch.masses);
            let loss = weighted_bce(logits, batch.targets, batch.weights, batch.active_columns);
            let loss_value = tensor_to_f64(loss.clone());
            if !loss_value.is_finite() {
                let err = PawsError::NumericInstability {
                    epoch,
                    step,
                    detail: format!("loss is {loss_value}"),
                };
                tracing::warn!("{err}");
                terminal = TerminalState::Diverged {
                    reason: err.to_string(),
                };
                break 'epochs;
            }

            let grads = GradientsParams::from_grads(loss.backward(), &classifier);
            let lr = lr_schedule(t.network_lr, t.warmup_steps, total_steps, global_step);
            classifier = optim.step(lr, classifier, grads);
            loss_sum += loss_value;
            loss_steps += 1;
            global_step += 1;
        }

        let valid = classifier.valid();
        let validation_loss = split_loss(
            &valid,
            validation_events,
            &validation_masses,
            &validation_columns,
            t.batch_size,
            t.class_balanced,
            device,
        );
        let train_loss = (loss_steps > 0).then(|| loss_sum / loss_steps as f64);
        tracing::info!(
            epoch,
            train_loss = train_loss.map(|v| format!("{v:.5}")).unwrap_or_default(),
            validation_loss = validation_loss.map(|v| format!("{v:.5}")).unwrap_or_default(),
            "Supervised epoch finished"
        );
        history.push(SupervisedEpoch {
            epoch,
            train_loss,
            validation_loss,
        });

        let Some(val) = validation_loss.filter(|v| v.is_finite()) else {
            terminal = TerminalState::Diverged {
                reason: format!("validation loss is not finite at epoch {epoch}"),
            };
            break;
        };
        let improved = best
            .as_ref()
            .map_or(true, |(_, b, _)| val < b - stopping.min_delta);
        if improved {
            best = Some((epoch, val, classifier.clone()));
            epochs_since_improvement = 0;
        } else {
            epochs_since_improvement += 1;
        }
        if let Some(prev) = previous_validation {
            if epoch + 1 >= stopping.min_epochs && (val - prev).abs() < stopping.convergence_tolerance {
                terminal = TerminalState::Converged;
                break;
            }
        }
        if epochs_since_improvement >= stopping.patience {
            tracing::info!(epoch, patience = stopping.patience, "Early stopping");
            terminal = TerminalState::EarlyStopped;
            break;
        }
        previous_validation = Some(val);
    }

    let best_epoch = best.as_ref().map(|(e, _, _)| *e);
    let best_validation_loss = best.as_ref().map(|(_, v, _)| *v);
    if t.restore_best && terminal.is_success() {
        if let Some((_, _, best_classifier)) = best {
            classifier = best_classifier;
        }
    }

    let test_has_both = test_columns.iter().any(Option::is_some) && test_columns.iter().any(Option::is_none);
    let test_auc = if terminal.is_success() && test_has_both {
        per_mode_auc(
            &classifier.valid(),
            test_events,
            &test_masses,
            &test_columns,
            t.batch_size,
            device,
        )
    } else {
        vec![None; modes.len()]
    };

    let result = SupervisedResult {
        terminal_state: terminal,
        epochs_run: history.len(),
        best_epoch,
        best_validation_loss,
        test_auc,
        signal_log_odds,
        history,
        skipped_batches,
        elapsed_secs: start.elapsed().as_secs_f64(),
    };
    tracing::info!(
        terminal_state = %result.terminal_state,
        epochs_run = result.epochs_run,
        test_auc = ?result.test_auc,
        elapsed_secs = format!("{:.1}", result.elapsed_secs),
        "Supervised training finished"
    );

    if let Some(dir) = &ctx.output_dir {
        if result.terminal_state.is_success() {
            save_classifier(&classifier, dir)?;
            result.save(&dir.join(SUPERVISED_RESULT_FILE))?;
        }
    }

    Ok(TrainedClassifier { classifier, result })
}

/// Save a classifier's weights and architecture into `dir`.
pub fn save_classifier<B: Backend>(classifier: &ParameterizedClassifier<B>, dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    classifier.to_config().save(dir.join(CLASSIFIER_CONFIG_FILE))?;
    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    classifier
        .clone()
        .save_file(dir.join(CLASSIFIER_FILE), &recorder)
        .map_err(|e| {
            PawsError::Checkpoint(format!("failed to save classifier to {}: {e}", dir.display()))
        })?;
    tracing::info!(path = %dir.display(), "Classifier written");
    Ok(())
}

/// Load the network in `dir`: a classifier saved by [`save_classifier`], or
/// the classifier of a run directory written by the trainer.
pub fn load_classifier<B: Backend>(dir: &Path, device: &B::Device) -> Result<ParameterizedClassifier<B>> {
    if dir.join(RUN_CONFIG_FILE).exists() {
        return Ok(load_model::<B>(dir, device)?.1.classifier);
    }
    let config = ClassifierConfig::load(dir.join(CLASSIFIER_CONFIG_FILE)).map_err(|e| {
        PawsError::Checkpoint(format!(
            "failed to read classifier config in {}: {e}",
            dir.display()
        ))
    })?;
    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    config
        .init::<B, _>(&mut StdRng::seed_from_u64(0), device)
        .load_file(dir.join(CLASSIFIER_FILE), &recorder, device)
        .map_err(|e| {
            PawsError::Checkpoint(format!("failed to load classifier from {}: {e}", dir.display()))
        })
}
