use burn::prelude::*;
use burn::tensor::activation::silu;
use rand::Rng;

use crate::model::dense::{Dense, DenseConfig};

/// Configuration for the mass-parameterized classifier.
///
/// ```text
/// (batch, n_features) ‖ (batch, n_masses)      masses in network units
///   → Dense(n_features + n_masses → hidden[0]) → SiLU
///   → ... → Dense(hidden[i-1] → hidden[i]) → SiLU
///   → Dense(hidden[last] → n_outputs) → clamp(±logit_clip)
///   → logits: (batch, n_outputs), one log likelihood ratio per decay mode
/// ```
#[derive(Config, Debug)]
pub struct ClassifierConfig {
    /// Event feature dimension.
    pub n_features: usize,
    /// Number of mass parameters appended to the features.
    #[config(default = 2)]
    pub n_masses: usize,
    /// One output per decay mode.
    #[config(default = 1)]
    pub n_outputs: usize,
    /// Hidden layer widths.
    #[config(default = "vec![256, 256, 256]")]
    pub hidden: Vec<usize>,
    /// Output logits are clipped to `[-logit_clip, logit_clip]`.
    #[config(default = 20.0)]
    pub logit_clip: f64,
    /// Log of the signal-to-background event ratio the classifier was
    /// trained with on truth labels. Zero for class-balanced training.
    #[config(default = 0.0)]
    pub signal_log_odds: f64,
}

/// MLP scoring events under a mass hypothesis.
#[derive(Module, Debug)]
pub struct ParameterizedClassifier<B: Backend> {
    pub(crate) layers: Vec<Dense<B>>,
    pub(crate) output: Dense<B>,
    n_features: usize,
    n_masses: usize,
    logit_clip: f64,
    signal_log_odds: f64,
}

impl ClassifierConfig {
    /// Initialize with weights drawn from `rng`.
    pub fn init<B: Backend, R: Rng>(&self, rng: &mut R, device: &B::Device) -> ParameterizedClassifier<B> {
        let mut layers = Vec::with_capacity(self.hidden.len());
        let mut d_in = self.n_features + self.n_masses;
        for &width in &self.hidden {
            layers.push(DenseConfig::new(d_in, width).init(rng, device));
            d_in = width;
        }
        ParameterizedClassifier {
            layers,
            output: DenseConfig::new(d_in, self.n_outputs).init(rng, device),
            n_features: self.n_features,
            n_masses: self.n_masses,
            logit_clip: self.logit_clip,
            signal_log_odds: self.signal_log_odds,
        }
    }
}

impl<B: Backend> ParameterizedClassifier<B> {
    /// Per-mode logits for a batch under one mass hypothesis.
    ///
    /// Input shapes: features `(batch, n_features)`, masses `(n_masses,)` in
    /// network units. Output shape: `(batch, n_outputs)`, always finite for
    /// finite inputs.
    pub fn forward(&self, features: Tensor<B, 2>, masses: Tensor<B, 1>) -> Tensor<B, 2> {
        let [batch, _] = features.dims();
        let device = features.device();

        // (batch, 1) @ (1, n_masses) repeats the hypothesis on every row and
        // keeps the gradient path to the masses.
        let mass_columns = Tensor::<B, 2>::ones([batch, 1], &device).matmul(masses.unsqueeze_dim(0));
        self.forward_per_event(features, mass_columns)
    }

    /// Per-mode logits with a mass hypothesis per event, as in supervised
    /// training on a grid of signal masses.
    ///
    /// Input shapes: features `(batch, n_features)`, masses
    /// `(batch, n_masses)` in network units.
    pub fn forward_per_event(&self, features: Tensor<B, 2>, masses: Tensor<B, 2>) -> Tensor<B, 2> {
        let mut x = Tensor::cat(vec![features, masses], 1);

        for layer in &self.layers {
            x = silu(layer.forward(x));
        }
        self.output
            .forward(x)
            .clamp(-self.logit_clip, self.logit_clip)
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn n_masses(&self) -> usize {
        self.n_masses
    }

    pub fn signal_log_odds(&self) -> f64 {
        self.signal_log_odds
    }

    /// Record the class prior of the truth-labelled training set.
    pub fn with_signal_log_odds(mut self, log_odds: f64) -> Self {
        self.signal_log_odds = log_odds;
        self
    }

    pub fn n_outputs(&self) -> usize {
        self.output.weight.val().dims()[0]
    }

    /// Configuration that rebuilds this architecture, used when saving.
    pub fn to_config(&self) -> ClassifierConfig {
        ClassifierConfig::new(self.n_features)
            .with_n_masses(self.n_masses)
            .with_n_outputs(self.n_outputs())
            .with_hidden(
                self.layers
                    .iter()
                    .map(|l| l.weight.val().dims()[0])
                    .collect(),
            )
            .with_logit_clip(self.logit_clip)
            .with_signal_log_odds(self.signal_log_odds)
    }
}
