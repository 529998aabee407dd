//! Trainable physical parameters (masses, mu, alpha) with their raw-value
//! transforms and min/max regularizers.

use burn::module::{Ignored, Param};
use burn::prelude::*;
use burn::tensor::activation::{relu, sigmoid};
use burn::tensor::TensorData;

use crate::config::{
    HypothesisConfig, ALPHA_REGULARIZER_STRENGTH, LOG_MU_RANGE, MASS_SCALE,
};
use crate::model::bridge::{tensor_to_vec, values_to_tensor};

/// Maps the optimised raw value to the physical value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParameterTransform {
    Linear,
    /// `value = raw * factor`.
    Scale(f64),
    /// `value = exp(raw)`.
    Exponential,
    /// `value = 1 / (1 + exp(-raw))`.
    Sigmoid,
}

impl ParameterTransform {
    /// Physical value of a raw value.
    pub fn value(self, raw: f64) -> f64 {
        match self {
            Self::Linear => raw,
            Self::Scale(factor) => raw * factor,
            Self::Exponential => raw.exp(),
            Self::Sigmoid => 1.0 / (1.0 + (-raw).exp()),
        }
    }

    /// Raw value of a physical value. Boundary values of the exponential and
    /// sigmoid transforms map to infinities.
    pub fn inverse(self, value: f64) -> f64 {
        match self {
            Self::Linear => value,
            Self::Scale(factor) => value / factor,
            Self::Exponential => value.ln(),
            Self::Sigmoid => (value / (1.0 - value)).ln(),
        }
    }

    /// Tensor version of [`ParameterTransform::value`].
    pub fn apply<B: Backend>(self, raw: Tensor<B, 1>) -> Tensor<B, 1> {
        match self {
            Self::Linear => raw,
            Self::Scale(factor) => raw.mul_scalar(factor),
            Self::Exponential => raw.exp(),
            Self::Sigmoid => sigmoid(raw),
        }
    }
}

/// Quadratic penalty outside `[min, max]` on raw values:
/// `strength * (relu(min - w)^2 + relu(w - max)^2)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MinMaxRegularizer {
    pub min: f64,
    pub max: f64,
    pub strength: f64,
}

impl MinMaxRegularizer {
    pub fn new(min: f64, max: f64, strength: f64) -> Self {
        Self { min, max, strength }
    }

    /// Penalty summed over all components, shape `(1,)`.
    pub fn penalty<B: Backend>(&self, raw: Tensor<B, 1>) -> Tensor<B, 1> {
        let below = relu(raw.clone().neg().add_scalar(self.min)).powf_scalar(2.0);
        let above = relu(raw.sub_scalar(self.max)).powf_scalar(2.0);
        (below + above).sum().mul_scalar(self.strength)
    }

    /// Host version of [`MinMaxRegularizer::penalty`] for one value.
    pub fn penalty_value(&self, raw: f64) -> f64 {
        let below = (self.min - raw).max(0.0);
        let above = (raw - self.max).max(0.0);
        self.strength * (below * below + above * above)
    }
}

/// Transform and regularizer for the mass group.
pub fn mass_spec(hypothesis: &HypothesisConfig) -> (ParameterTransform, Option<MinMaxRegularizer>) {
    let [lo, hi] = hypothesis.mass_bounds;
    (
        ParameterTransform::Scale(MASS_SCALE),
        Some(MinMaxRegularizer::new(lo / MASS_SCALE, hi / MASS_SCALE, 1.0)),
    )
}

/// Transform and regularizer for mu.
pub fn mu_spec(hypothesis: &HypothesisConfig) -> (ParameterTransform, Option<MinMaxRegularizer>) {
    if hypothesis.sigmoid_activation {
        (ParameterTransform::Sigmoid, None)
    } else {
        (
            ParameterTransform::Exponential,
            Some(MinMaxRegularizer::new(LOG_MU_RANGE.0, LOG_MU_RANGE.1, 1.0)),
        )
    }
}

/// Transform and regularizer for alpha.
pub fn alpha_spec(
    hypothesis: &HypothesisConfig,
) -> (ParameterTransform, Option<MinMaxRegularizer>) {
    if hypothesis.sigmoid_activation {
        (ParameterTransform::Sigmoid, None)
    } else {
        (
            ParameterTransform::Linear,
            Some(MinMaxRegularizer::new(0.0, 1.0, ALPHA_REGULARIZER_STRENGTH)),
        )
    }
}

/// A group of physical parameters stored as raw values.
#[derive(Module, Debug)]
pub struct PhysicalParameter<B: Backend> {
    /// Raw values, shape `(n,)`.
    pub(crate) raw: Param<Tensor<B, 1>>,
    transform: Ignored<ParameterTransform>,
    regularizer: Ignored<Option<MinMaxRegularizer>>,
    /// Components that never receive gradient, even when the group trains.
    frozen_components: Ignored<Vec<bool>>,
}

impl<B: Backend> PhysicalParameter<B> {
    /// Build from physical values.
    pub fn new(
        values: &[f64],
        transform: ParameterTransform,
        regularizer: Option<MinMaxRegularizer>,
        device: &B::Device,
    ) -> Self {
        let raw: Vec<f64> = values.iter().map(|&v| transform.inverse(v)).collect();
        Self {
            raw: Param::from_tensor(values_to_tensor(&raw, device)),
            transform: Ignored(transform),
            regularizer: Ignored(regularizer),
            frozen_components: Ignored(vec![false; values.len()]),
        }
    }

    /// Hold the listed components fixed.
    pub fn with_frozen_components(mut self, components: &[usize]) -> Self {
        for &c in components {
            if let Some(flag) = self.frozen_components.0.get_mut(c) {
                *flag = true;
            }
        }
        self
    }

    /// Same transform and regularizer, new physical values.
    pub fn with_values(&self, values: &[f64]) -> Self {
        let device = self.raw.val().device();
        Self::new(values, self.transform.0, self.regularizer.0, &device)
            .with_frozen_components(&self.frozen_indices())
    }

    fn frozen_indices(&self) -> Vec<usize> {
        self.frozen_components
            .0
            .iter()
            .enumerate()
            .filter(|(_, f)| **f)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.frozen_components.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn transform(&self) -> ParameterTransform {
        self.transform.0
    }

    /// Physical values on the forward graph.
    ///
    /// A frozen group is detached; frozen components of a trainable group
    /// pass their value through without gradient.
    pub fn value(&self, trainable: bool) -> Tensor<B, 1> {
        let raw = self.raw.val();
        let raw = if !trainable {
            raw.detach()
        } else if self.frozen_components.0.iter().any(|f| *f) {
            let keep: Vec<f32> = self
                .frozen_components
                .0
                .iter()
                .map(|f| if *f { 0.0 } else { 1.0 })
                .collect();
            let n = keep.len();
            let keep = Tensor::<B, 1>::from_data(TensorData::new(keep, [n]), &raw.device());
            raw.clone() * keep.clone() + raw.detach() * keep.neg().add_scalar(1.0)
        } else {
            raw
        };
        self.transform.0.apply(raw)
    }

    /// Regularization penalty on the raw values, if this group has one.
    pub fn penalty(&self) -> Option<Tensor<B, 1>> {
        self.regularizer.0.map(|r| r.penalty(self.raw.val()))
    }

    /// Host copy of the raw values.
    pub fn raw_values(&self) -> Vec<f64> {
        tensor_to_vec(self.raw.val())
    }

    /// Host copy of the physical values.
    pub fn values(&self) -> Vec<f64> {
        self.raw_values()
            .into_iter()
            .map(|r| self.transform.0.value(r))
            .collect()
    }
}
