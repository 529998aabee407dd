//! Run configuration: physics constants, trainable-parameter masks, and the
//! immutable `RunConfig` handed to every training run.

use events::DecayMode;
use serde::{Deserialize, Serialize};

use crate::error::{PawsError, Result};
use crate::model::classifier::ClassifierConfig;
use crate::training::loss::LossKind;
use crate::training::metrics::Metric;

/// GeV per network unit. Masses enter the network as `m / MASS_SCALE`.
pub const MASS_SCALE: f64 = 100.0;
/// Physical mass window in GeV.
pub const MASS_RANGE: (f64, f64) = (50.0, 600.0);
/// Default spacing of mass grids in GeV.
pub const MASS_INTERVAL: f64 = 50.0;
/// Allowed range of `ln mu` under the exponential parameterisation.
pub const LOG_MU_RANGE: (f64, f64) = (-10.0, 0.0);
pub const ALPHA_REGULARIZER_STRENGTH: f64 = 10.0;
pub const BASE_SEED: u64 = 2023;

/// Which parameter groups a run optimises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingMode {
    /// Network trained, hypothesis and mixture fractions held fixed.
    Dedicated,
    /// Mass fixed at the assumed hypothesis, mu and alpha learned.
    IdealWeakly,
    /// Mass, mu and alpha all learned.
    #[default]
    SemiWeakly,
}

impl std::fmt::Display for TrainingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dedicated => write!(f, "dedicated"),
            Self::IdealWeakly => write!(f, "ideal_weakly"),
            Self::SemiWeakly => write!(f, "semi_weakly"),
        }
    }
}

/// Trainable flags per parameter group. Frozen groups enter the forward pass
/// detached and their optimizer step is skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainableMask {
    pub network: bool,
    pub mass: bool,
    pub mu: bool,
    pub alpha: bool,
}

impl TrainableMask {
    pub fn dedicated() -> Self {
        Self {
            network: true,
            mass: false,
            mu: false,
            alpha: false,
        }
    }

    pub fn ideal_weakly() -> Self {
        Self {
            network: false,
            mass: false,
            mu: true,
            alpha: true,
        }
    }

    pub fn semi_weakly() -> Self {
        Self {
            network: false,
            mass: true,
            mu: true,
            alpha: true,
        }
    }

    pub fn for_mode(mode: TrainingMode) -> Self {
        match mode {
            TrainingMode::Dedicated => Self::dedicated(),
            TrainingMode::IdealWeakly => Self::ideal_weakly(),
            TrainingMode::SemiWeakly => Self::semi_weakly(),
        }
    }

    /// Whether any physical parameter (mass, mu, alpha) is trainable.
    pub fn any_physical(&self) -> bool {
        self.mass || self.mu || self.alpha
    }

    pub fn any(&self) -> bool {
        self.network || self.any_physical()
    }

    /// Everything frozen: used for evaluation.
    pub fn frozen() -> Self {
        Self {
            network: false,
            mass: false,
            mu: false,
            alpha: false,
        }
    }
}

/// How the mass parameters start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MassInit {
    /// Start at `HypothesisConfig::masses`.
    #[default]
    Fixed,
    /// Uniform within `mass_bounds`, drawn from the run seed.
    Random,
}

/// Network architecture and mixture numerics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSettings {
    /// Hidden layer widths.
    #[serde(default = "default_hidden")]
    pub hidden: Vec<usize>,
    /// Logits are clipped to `[-logit_clip, logit_clip]`.
    #[serde(default = "default_logit_clip")]
    pub logit_clip: f64,
    /// Lower bound on the density ratio before taking logs.
    #[serde(default = "default_ratio_floor")]
    pub ratio_floor: f64,
}

fn default_hidden() -> Vec<usize> {
    vec![256, 256, 256]
}
fn default_logit_clip() -> f64 {
    20.0
}
fn default_ratio_floor() -> f64 {
    1e-12
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            hidden: default_hidden(),
            logit_clip: default_logit_clip(),
            ratio_floor: default_ratio_floor(),
        }
    }
}

impl ModelSettings {
    pub fn classifier_config(
        &self,
        n_features: usize,
        n_masses: usize,
        n_outputs: usize,
    ) -> ClassifierConfig {
        ClassifierConfig::new(n_features)
            .with_n_masses(n_masses)
            .with_n_outputs(n_outputs)
            .with_hidden(self.hidden.clone())
            .with_logit_clip(self.logit_clip)
    }
}

/// How kappa is estimated when it is not a fixed number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KappaEstimate {
    /// `1 / mean(LR)` over the reference training events, refreshed every
    /// epoch and at every evaluated hypothesis.
    Sampled,
    /// `exp(-signal_log_odds)` of the supervised classifier: the event-count
    /// ratio it was trained with.
    Inferred,
}

/// Prior normalization factor: a fixed value or an estimate.
///
/// Written as a number (`kappa = 1.0`) or as `"sampled"` / `"inferred"`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Kappa {
    Value(f64),
    Estimate(KappaEstimate),
}

impl Default for Kappa {
    fn default() -> Self {
        Self::Value(1.0)
    }
}

impl Kappa {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sampled" => Some(Self::Estimate(KappaEstimate::Sampled)),
            "inferred" => Some(Self::Estimate(KappaEstimate::Inferred)),
            other => other.parse().ok().map(Self::Value),
        }
    }

    pub fn is_sampled(self) -> bool {
        self == Self::Estimate(KappaEstimate::Sampled)
    }
}

impl std::fmt::Display for Kappa {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Value(v) => write!(f, "{v}"),
            Self::Estimate(KappaEstimate::Sampled) => write!(f, "sampled"),
            Self::Estimate(KappaEstimate::Inferred) => write!(f, "inferred"),
        }
    }
}

/// Assumed signal hypothesis and mixture initialisation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HypothesisConfig {
    /// Resonance masses in GeV, one per stage (`m1`, `m2`).
    #[serde(default = "default_masses")]
    pub masses: Vec<f64>,
    /// Lower and upper mass bound in GeV.
    #[serde(default = "default_mass_bounds")]
    pub mass_bounds: [f64; 2],
    #[serde(default)]
    pub mass_init: MassInit,
    /// Mass components held at their initial value even when masses train.
    #[serde(default)]
    pub fixed_mass_components: Vec<usize>,
    /// Initial signal fraction in the mixed sample.
    #[serde(default = "default_mu")]
    pub mu: f64,
    /// Initial two-prong branching fraction.
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    /// Prior normalization factor on the signal likelihood ratio.
    #[serde(default)]
    pub kappa: Kappa,
    #[serde(default = "default_decay_modes")]
    pub decay_modes: Vec<DecayMode>,
    /// Sigmoid parameterisation for mu and alpha instead of exponential / linear.
    #[serde(default)]
    pub sigmoid_activation: bool,
}

fn default_masses() -> Vec<f64> {
    vec![300.0, 300.0]
}
fn default_mass_bounds() -> [f64; 2] {
    [MASS_RANGE.0, MASS_RANGE.1]
}
fn default_mu() -> f64 {
    0.01
}
fn default_alpha() -> f64 {
    0.5
}
fn default_decay_modes() -> Vec<DecayMode> {
    vec![DecayMode::TwoProng]
}

impl Default for HypothesisConfig {
    fn default() -> Self {
        Self {
            masses: default_masses(),
            mass_bounds: default_mass_bounds(),
            mass_init: MassInit::default(),
            fixed_mass_components: Vec::new(),
            mu: default_mu(),
            alpha: default_alpha(),
            kappa: Kappa::default(),
            decay_modes: default_decay_modes(),
            sigmoid_activation: false,
        }
    }
}

impl HypothesisConfig {
    /// Number of decay-mode outputs the classifier needs.
    pub fn n_modes(&self) -> usize {
        self.decay_modes.len()
    }

    /// Whether alpha enters the mixture (two decay modes).
    pub fn has_alpha(&self) -> bool {
        self.decay_modes.len() == 2
    }
}

/// Optimisation schedule and numeric-recovery knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Human-readable prefix of run identities.
    #[serde(default = "default_run_name")]
    pub run_name: String,
    #[serde(default)]
    pub mode: TrainingMode,
    /// Per-group overrides of the mode's trainable mask.
    #[serde(default)]
    pub train_network: Option<bool>,
    #[serde(default)]
    pub train_mass: Option<bool>,
    #[serde(default)]
    pub train_mu: Option<bool>,
    #[serde(default)]
    pub train_alpha: Option<bool>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_epochs")]
    pub max_epochs: usize,
    #[serde(default = "default_network_lr")]
    pub network_lr: f64,
    #[serde(default = "default_physical_lr")]
    pub mass_lr: f64,
    #[serde(default = "default_physical_lr")]
    pub mu_lr: f64,
    #[serde(default = "default_physical_lr")]
    pub alpha_lr: f64,
    /// AdamW weight decay on network weights.
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    /// Gradient-norm clip on network weights.
    #[serde(default = "default_max_grad_norm")]
    pub max_grad_norm: f64,
    #[serde(default)]
    pub warmup_steps: usize,
    #[serde(default)]
    pub loss: LossKind,
    /// Minimum share of each sample in a batch before it counts as imbalanced.
    #[serde(default = "default_min_source_fraction")]
    pub min_source_fraction: f64,
    /// Masses stay frozen before this epoch.
    #[serde(default)]
    pub mass_unfreeze_epoch: usize,
    /// When set, network weights train only for this many epochs.
    #[serde(default)]
    pub network_train_epochs: Option<usize>,
    #[serde(default = "default_max_step_retries")]
    pub max_step_retries: usize,
    #[serde(default = "default_retry_lr_factor")]
    pub retry_lr_factor: f64,
    /// Supervised training weights each decay mode's signal to the
    /// background count, so the logits are likelihood ratios.
    #[serde(default = "default_true")]
    pub class_balanced: bool,
    /// Restore the lowest-validation-loss snapshot at the end of the run.
    #[serde(default = "default_true")]
    pub restore_best: bool,
    /// Wall-clock budget; checked at epoch boundaries.
    #[serde(default)]
    pub max_wall_secs: Option<f64>,
    /// Metrics computed on the test split at the end of the run.
    #[serde(default = "default_metrics")]
    pub metrics: Vec<Metric>,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_run_name() -> String {
    "paws".to_string()
}
fn default_batch_size() -> usize {
    1024
}
fn default_max_epochs() -> usize {
    100
}
fn default_network_lr() -> f64 {
    1e-3
}
fn default_physical_lr() -> f64 {
    1e-2
}
fn default_weight_decay() -> f64 {
    1e-4
}
fn default_max_grad_norm() -> f64 {
    1.0
}
fn default_min_source_fraction() -> f64 {
    0.05
}
fn default_max_step_retries() -> usize {
    3
}
fn default_retry_lr_factor() -> f64 {
    0.5
}
fn default_true() -> bool {
    true
}
fn default_metrics() -> Vec<Metric> {
    vec![
        Metric::Loss,
        Metric::Auc,
        Metric::LogLoss,
        Metric::Sic { inverse_fpr: 1e3 },
    ]
}
fn default_seed() -> u64 {
    BASE_SEED
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            run_name: default_run_name(),
            mode: TrainingMode::default(),
            train_network: None,
            train_mass: None,
            train_mu: None,
            train_alpha: None,
            batch_size: default_batch_size(),
            max_epochs: default_max_epochs(),
            network_lr: default_network_lr(),
            mass_lr: default_physical_lr(),
            mu_lr: default_physical_lr(),
            alpha_lr: default_physical_lr(),
            weight_decay: default_weight_decay(),
            max_grad_norm: default_max_grad_norm(),
            warmup_steps: 0,
            loss: LossKind::default(),
            min_source_fraction: default_min_source_fraction(),
            mass_unfreeze_epoch: 0,
            network_train_epochs: None,
            max_step_retries: default_max_step_retries(),
            retry_lr_factor: default_retry_lr_factor(),
            class_balanced: true,
            restore_best: true,
            max_wall_secs: None,
            metrics: default_metrics(),
            seed: default_seed(),
        }
    }
}

/// Thresholds deciding how a run ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoppingPolicy {
    /// Epochs without improvement before early stopping.
    #[serde(default = "default_patience")]
    pub patience: usize,
    /// Validation-loss decrease that counts as an improvement.
    #[serde(default = "default_min_delta")]
    pub min_delta: f64,
    /// Convergence is never declared before this many epochs.
    #[serde(default = "default_min_epochs")]
    pub min_epochs: usize,
    /// Largest epoch-to-epoch change of validation loss and of any physical
    /// parameter (masses in network units) for convergence.
    #[serde(default = "default_convergence_tolerance")]
    pub convergence_tolerance: f64,
    /// How far a physical parameter may leave its domain before the run
    /// diverges, as a fraction of the domain width.
    #[serde(default = "default_divergence_margin")]
    pub divergence_margin: f64,
    /// Total validation improvement below which a run that hit the epoch
    /// limit is flagged degraded.
    #[serde(default = "default_min_improvement")]
    pub min_improvement: f64,
}

fn default_patience() -> usize {
    10
}
fn default_min_delta() -> f64 {
    1e-5
}
fn default_min_epochs() -> usize {
    5
}
fn default_convergence_tolerance() -> f64 {
    1e-6
}
fn default_divergence_margin() -> f64 {
    0.5
}
fn default_min_improvement() -> f64 {
    1e-6
}

impl Default for StoppingPolicy {
    fn default() -> Self {
        Self {
            patience: default_patience(),
            min_delta: default_min_delta(),
            min_epochs: default_min_epochs(),
            convergence_tolerance: default_convergence_tolerance(),
            divergence_margin: default_divergence_margin(),
            min_improvement: default_min_improvement(),
        }
    }
}

/// Complete, immutable description of one training run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub model: ModelSettings,
    #[serde(default)]
    pub hypothesis: HypothesisConfig,
    #[serde(default)]
    pub training: TrainingConfig,
    #[serde(default)]
    pub stopping: StoppingPolicy,
}

impl RunConfig {
    /// Defaults for a mode, with its trainable mask.
    pub fn for_mode(mode: TrainingMode) -> Self {
        let mut config = Self::default();
        config.training.mode = mode;
        if mode == TrainingMode::Dedicated {
            config.hypothesis.mu = 1.0;
        }
        config
    }

    /// Trainable mask: the mode's defaults with per-group overrides applied.
    /// Alpha never trains when only one decay mode is configured.
    pub fn mask(&self) -> TrainableMask {
        let t = &self.training;
        let base = TrainableMask::for_mode(t.mode);
        TrainableMask {
            network: t.train_network.unwrap_or(base.network),
            mass: t.train_mass.unwrap_or(base.mass),
            mu: t.train_mu.unwrap_or(base.mu),
            alpha: t.train_alpha.unwrap_or(base.alpha) && self.hypothesis.has_alpha(),
        }
    }

    /// Check every setting before any compute starts.
    pub fn validate(&self) -> Result<()> {
        let h = &self.hypothesis;
        let t = &self.training;
        let s = &self.stopping;
        let m = &self.model;
        let mask = self.mask();

        if m.hidden.is_empty() || m.hidden.contains(&0) {
            return Err(PawsError::config(format!(
                "hidden layer widths must be non-empty and positive, got {:?}",
                m.hidden
            )));
        }
        if !(m.logit_clip.is_finite() && m.logit_clip > 0.0) {
            return Err(PawsError::config(format!(
                "logit_clip must be positive and finite, got {}",
                m.logit_clip
            )));
        }
        // exp(logit_clip) must stay finite in f32.
        if m.logit_clip > 80.0 {
            return Err(PawsError::config(format!(
                "logit_clip {} overflows f32 likelihood ratios (max 80)",
                m.logit_clip
            )));
        }
        if !(m.ratio_floor > 0.0 && m.ratio_floor < 1.0) {
            return Err(PawsError::config(format!(
                "ratio_floor must be in (0, 1), got {}",
                m.ratio_floor
            )));
        }

        if h.masses.is_empty() {
            return Err(PawsError::config("at least one mass parameter is required"));
        }
        let [lo, hi] = h.mass_bounds;
        if !(lo.is_finite() && hi.is_finite() && lo > 0.0 && lo < hi) {
            return Err(PawsError::config(format!(
                "mass_bounds must satisfy 0 < lo < hi, got [{lo}, {hi}]"
            )));
        }
        for (i, &mass) in h.masses.iter().enumerate() {
            if !(lo..=hi).contains(&mass) {
                return Err(PawsError::config(format!(
                    "m{} = {mass} GeV outside mass bounds [{lo}, {hi}]",
                    i + 1
                )));
            }
        }
        if let Some(&bad) = h.fixed_mass_components.iter().find(|&&c| c >= h.masses.len()) {
            return Err(PawsError::config(format!(
                "fixed mass component {bad} out of range ({} masses)",
                h.masses.len()
            )));
        }
        if h.decay_modes.is_empty() || h.decay_modes.len() > 2 {
            return Err(PawsError::config(format!(
                "one or two decay modes are required, got {:?}",
                h.decay_modes
            )));
        }
        if h.decay_modes.len() == 2 && h.decay_modes[0] == h.decay_modes[1] {
            return Err(PawsError::config("decay modes must be distinct"));
        }
        if !(0.0..=1.0).contains(&h.mu) {
            return Err(PawsError::config(format!("mu must be in [0, 1], got {}", h.mu)));
        }
        if !(0.0..=1.0).contains(&h.alpha) {
            return Err(PawsError::config(format!(
                "alpha must be in [0, 1], got {}",
                h.alpha
            )));
        }
        // Boundary values have no finite raw parameter under these transforms.
        if mask.mu && (h.mu == 0.0 || (h.sigmoid_activation && h.mu == 1.0)) {
            return Err(PawsError::config(format!(
                "trainable mu cannot start at {}; freeze it or start inside (0, 1)",
                h.mu
            )));
        }
        if mask.alpha && h.sigmoid_activation && (h.alpha == 0.0 || h.alpha == 1.0) {
            return Err(PawsError::config(format!(
                "trainable sigmoid alpha cannot start at {}",
                h.alpha
            )));
        }
        if let Kappa::Value(kappa) = h.kappa {
            if !(kappa.is_finite() && kappa > 0.0) {
                return Err(PawsError::config(format!(
                    "kappa must be positive and finite, got {kappa}"
                )));
            }
        }

        if !mask.any() {
            return Err(PawsError::config("no parameter group is trainable"));
        }
        if t.batch_size == 0 {
            return Err(PawsError::config("batch_size must be > 0"));
        }
        if t.max_epochs == 0 {
            return Err(PawsError::config("max_epochs must be > 0"));
        }
        for (name, lr) in [
            ("network_lr", t.network_lr),
            ("mass_lr", t.mass_lr),
            ("mu_lr", t.mu_lr),
            ("alpha_lr", t.alpha_lr),
        ] {
            if !(lr.is_finite() && lr > 0.0) {
                return Err(PawsError::config(format!("{name} must be > 0, got {lr}")));
            }
        }
        if !(0.0..0.5).contains(&t.min_source_fraction) {
            return Err(PawsError::config(format!(
                "min_source_fraction must be in [0, 0.5), got {}",
                t.min_source_fraction
            )));
        }
        if !(t.retry_lr_factor > 0.0 && t.retry_lr_factor < 1.0) {
            return Err(PawsError::config(format!(
                "retry_lr_factor must be in (0, 1), got {}",
                t.retry_lr_factor
            )));
        }
        if let Some(secs) = t.max_wall_secs {
            if !(secs > 0.0) {
                return Err(PawsError::config(format!(
                    "max_wall_secs must be > 0, got {secs}"
                )));
            }
        }
        if s.patience == 0 {
            return Err(PawsError::config("patience must be > 0"));
        }
        if s.min_delta < 0.0 || s.convergence_tolerance < 0.0 || s.divergence_margin < 0.0 {
            return Err(PawsError::config(
                "min_delta, convergence_tolerance and divergence_margin must be >= 0",
            ));
        }
        Ok(())
    }
}
