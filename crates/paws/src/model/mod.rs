//! Semi-weakly supervised model: a mass-parameterized classifier plus the
//! trainable physical parameters (masses, mu, alpha) of the signal mixture.

pub mod bridge;
pub mod classifier;
pub mod dense;
pub mod mixture;
pub mod parameters;

use burn::module::Ignored;
use burn::prelude::*;
use rand::Rng;

use crate::config::{Kappa, KappaEstimate, RunConfig, TrainableMask, MASS_SCALE};
use crate::error::{PawsError, Result};
use crate::model::classifier::ParameterizedClassifier;
use crate::model::mixture::{density_ratio, MixtureOutput, MixtureSettings};
use crate::model::parameters::{alpha_spec, mass_spec, mu_spec, PhysicalParameter};
use crate::result::ParameterEstimates;

/// Classifier plus mixture parameters, trained jointly.
#[derive(Module, Debug)]
pub struct SemiWeaklyModel<B: Backend> {
    pub classifier: ParameterizedClassifier<B>,
    pub masses: PhysicalParameter<B>,
    pub mu: PhysicalParameter<B>,
    /// Present only with two decay modes.
    pub alpha: Option<PhysicalParameter<B>>,
    pub(crate) settings: Ignored<MixtureSettings>,
}

impl<B: Backend> SemiWeaklyModel<B> {
    /// Fresh classifier drawn from `rng`, parameters at `initial`.
    pub fn init<R: Rng>(
        config: &RunConfig,
        n_features: usize,
        initial: &ParameterEstimates,
        rng: &mut R,
        device: &B::Device,
    ) -> Result<Self> {
        let classifier = config
            .model
            .classifier_config(
                n_features,
                config.hypothesis.masses.len(),
                config.hypothesis.n_modes(),
            )
            .init(rng, device);
        Self::new(classifier, config, initial, device)
    }

    /// Wrap an existing classifier. Fails when its input or output width does
    /// not fit the hypothesis.
    pub fn new(
        classifier: ParameterizedClassifier<B>,
        config: &RunConfig,
        initial: &ParameterEstimates,
        device: &B::Device,
    ) -> Result<Self> {
        let h = &config.hypothesis;
        if classifier.n_masses() != initial.masses.len() {
            return Err(PawsError::config(format!(
                "classifier expects {} masses, hypothesis has {}",
                classifier.n_masses(),
                initial.masses.len()
            )));
        }
        if classifier.n_outputs() < h.n_modes() {
            return Err(PawsError::config(format!(
                "classifier has {} outputs, {} decay modes configured",
                classifier.n_outputs(),
                h.n_modes()
            )));
        }

        let (mass_t, mass_r) = mass_spec(h);
        let (mu_t, mu_r) = mu_spec(h);
        let masses = PhysicalParameter::new(&initial.masses, mass_t, mass_r, device)
            .with_frozen_components(&h.fixed_mass_components);
        let mu = PhysicalParameter::new(&[initial.mu], mu_t, mu_r, device);
        let alpha = if h.has_alpha() {
            let (alpha_t, alpha_r) = alpha_spec(h);
            let value = initial.alpha.unwrap_or(h.alpha);
            Some(PhysicalParameter::new(&[value], alpha_t, alpha_r, device))
        } else {
            None
        };

        // A sampled kappa starts at 1 until the trainer estimates it.
        let kappa = match h.kappa {
            Kappa::Value(kappa) => kappa,
            Kappa::Estimate(KappaEstimate::Inferred) => (-classifier.signal_log_odds()).exp(),
            Kappa::Estimate(KappaEstimate::Sampled) => 1.0,
        };

        Ok(Self {
            classifier,
            masses,
            mu,
            alpha,
            settings: Ignored(MixtureSettings {
                kappa,
                ratio_floor: config.model.ratio_floor,
                sample_kappa: h.kappa.is_sampled(),
            }),
        })
    }

    /// Score a batch of features under the current parameters.
    ///
    /// Groups not marked trainable in `mask` enter detached; a frozen
    /// classifier still passes gradient through to the masses.
    pub fn forward(&self, features: Tensor<B, 2>, mask: &TrainableMask) -> MixtureOutput<B> {
        let masses = self.masses.value(mask.mass).div_scalar(MASS_SCALE);
        let logits = if mask.network {
            self.classifier.forward(features, masses)
        } else {
            self.classifier.clone().no_grad().forward(features, masses)
        };
        let mu = self.mu.value(mask.mu);
        let alpha = self.alpha.as_ref().map(|a| a.value(mask.alpha));
        density_ratio(logits, mu, alpha, self.settings.0)
    }

    /// Sum of the regularization penalties of trainable groups.
    pub fn regularization(&self, mask: &TrainableMask) -> Option<Tensor<B, 1>> {
        let mut groups = Vec::new();
        if mask.mass {
            groups.push(&self.masses);
        }
        if mask.mu {
            groups.push(&self.mu);
        }
        if mask.alpha {
            if let Some(alpha) = &self.alpha {
                groups.push(alpha);
            }
        }
        groups
            .into_iter()
            .filter_map(|p| p.penalty())
            .reduce(|a, b| a + b)
    }

    /// Current physical parameter values.
    pub fn estimates(&self) -> ParameterEstimates {
        ParameterEstimates {
            masses: self.masses.values(),
            mu: self.mu.values().first().copied().unwrap_or(f64::NAN),
            alpha: self
                .alpha
                .as_ref()
                .map(|a| a.values().first().copied().unwrap_or(f64::NAN)),
        }
    }

    /// Same classifier with the physical parameters set to `values`.
    pub fn with_parameters(&self, values: &ParameterEstimates) -> Self {
        let alpha = match (&self.alpha, values.alpha) {
            (Some(a), Some(v)) => Some(a.with_values(&[v])),
            (a, _) => a.clone(),
        };
        Self {
            classifier: self.classifier.clone(),
            masses: self.masses.with_values(&values.masses),
            mu: self.mu.with_values(&[values.mu]),
            alpha,
            settings: Ignored(self.settings.0),
        }
    }

    pub fn settings(&self) -> MixtureSettings {
        self.settings.0
    }

    /// Same model with kappa replaced.
    pub fn with_kappa(mut self, kappa: f64) -> Self {
        self.settings.0.kappa = kappa;
        self
    }
}
