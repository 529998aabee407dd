//! Weak-supervision objectives on the mixed-over-reference log density ratio.
//!
//! Labels are the sample of origin (mixed = 1, reference = 0), never truth.
//! Both objectives are generic over `B: Backend`; the host accumulator
//! reproduces them in f64 for validation without building a graph.

use std::fmt;

use burn::prelude::*;
use burn::tensor::activation::log_sigmoid;
use events::SampleTag;
use serde::{Deserialize, Serialize};

/// Choice of weak-supervision objective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossKind {
    /// Class-balanced binary cross-entropy on `sigmoid(ln f)`.
    #[default]
    Bce,
    /// Extended negative log-likelihood of the mixed sample.
    Nll,
}

impl fmt::Display for LossKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bce => write!(f, "bce"),
            Self::Nll => write!(f, "nll"),
        }
    }
}

/// Weak-supervision loss for one batch.
///
/// The mixture weight of an event (1 for reference, `f` for mixed) enters
/// through `log_ratio`: `Bce` is the cross-entropy of the posterior
/// `f / (1 + f) = sigmoid(ln f)`.
///
/// # Arguments
/// - `log_ratio`: shape `(batch,)`, `ln f(x)` per event
/// - `is_mixed`: shape `(batch,)`, 1 for mixed events, 0 for reference events
///
/// # Returns
/// Scalar loss tensor of shape `(1,)`.
pub fn weak_supervision_loss<B: Backend>(
    kind: LossKind,
    log_ratio: Tensor<B, 1>,
    is_mixed: Tensor<B, 1>,
) -> Tensor<B, 1> {
    let is_reference = is_mixed.clone().neg().add_scalar(1.0);
    let n_mixed = is_mixed.clone().sum().clamp_min(1.0);
    let n_reference = is_reference.clone().sum().clamp_min(1.0);

    match kind {
        LossKind::Bce => {
            // Each sample carries half the batch weight.
            let mixed_term = (log_sigmoid(log_ratio.clone()).neg() * is_mixed).sum() / n_mixed;
            let reference_term =
                (log_sigmoid(log_ratio.neg()).neg() * is_reference).sum() / n_reference;
            (mixed_term + reference_term).mul_scalar(0.5)
        }
        LossKind::Nll => {
            let mixed_term = (log_ratio.clone() * is_mixed).sum() / n_mixed;
            let reference_mean = (log_ratio.exp() * is_reference).sum() / n_reference;
            reference_mean.clamp_min(1e-30).log() - mixed_term
        }
    }
}

/// Numerically stable `ln(sigmoid(x))`.
fn log_sigmoid_f64(x: f64) -> f64 {
    if x >= 0.0 {
        -(-x).exp().ln_1p()
    } else {
        x - x.exp().ln_1p()
    }
}

/// Host-side accumulator of the weak loss over many batches.
///
/// Sums are kept per sample so the value over a whole split equals the loss
/// of one batch holding the entire split.
#[derive(Debug, Clone)]
pub struct WeakLossAccumulator {
    kind: LossKind,
    mixed_sum: f64,
    mixed_count: usize,
    reference_sum: f64,
    reference_count: usize,
}

impl WeakLossAccumulator {
    pub fn new(kind: LossKind) -> Self {
        Self {
            kind,
            mixed_sum: 0.0,
            mixed_count: 0,
            reference_sum: 0.0,
            reference_count: 0,
        }
    }

    pub fn update(&mut self, log_ratio: &[f32], tags: &[SampleTag]) {
        for (&z, &tag) in log_ratio.iter().zip(tags) {
            let z = z as f64;
            match (self.kind, tag) {
                (LossKind::Bce, SampleTag::Mixed) => {
                    self.mixed_sum -= log_sigmoid_f64(z);
                    self.mixed_count += 1;
                }
                (LossKind::Bce, SampleTag::Reference) => {
                    self.reference_sum -= log_sigmoid_f64(-z);
                    self.reference_count += 1;
                }
                (LossKind::Nll, SampleTag::Mixed) => {
                    self.mixed_sum += z;
                    self.mixed_count += 1;
                }
                (LossKind::Nll, SampleTag::Reference) => {
                    self.reference_sum += z.exp();
                    self.reference_count += 1;
                }
            }
        }
    }

    /// Loss over everything seen so far. `None` unless both samples were seen.
    pub fn value(&self) -> Option<f64> {
        if self.mixed_count == 0 || self.reference_count == 0 {
            return None;
        }
        let mixed = self.mixed_sum / self.mixed_count as f64;
        let reference = self.reference_sum / self.reference_count as f64;
        Some(match self.kind {
            LossKind::Bce => 0.5 * (mixed + reference),
            LossKind::Nll => reference.max(1e-30).ln() - mixed,
        })
    }
}

/// How well a batch represents both samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchComposition {
    Balanced,
    /// One sample is below the configured share; the batch is still used.
    Imbalanced { reference: usize, mixed: usize },
    /// One sample is absent; the step is skipped.
    MissingSource { reference: usize, mixed: usize },
}

/// Classify a batch by its sample composition.
pub fn check_batch_composition(tags: &[SampleTag], min_source_fraction: f64) -> BatchComposition {
    let mixed = tags.iter().filter(|t| **t == SampleTag::Mixed).count();
    let reference = tags.len() - mixed;
    if mixed == 0 || reference == 0 {
        return BatchComposition::MissingSource { reference, mixed };
    }
    let minority = reference.min(mixed) as f64 / tags.len() as f64;
    if minority < min_source_fraction {
        BatchComposition::Imbalanced { reference, mixed }
    } else {
        BatchComposition::Balanced
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::bridge::{tensor_to_f64, values_to_tensor};
    use burn::backend::ndarray::NdArray;
    use burn::backend::Autodiff;

    type TestBackend = NdArray<f32>;
    type TestAutodiffBackend = Autodiff<NdArray<f32>>;

    fn tags(pattern: &[u8]) -> Vec<SampleTag> {
        pattern
            .iter()
            .map(|&b| if b == 1 { SampleTag::Mixed } else { SampleTag::Reference })
            .collect()
    }

    fn indicator(pattern: &[u8]) -> Vec<f64> {
        pattern.iter().map(|&b| b as f64).collect()
    }

    #[test]
    fn test_unit_ratio_baselines() {
        let device = Default::default();
        let pattern = [0, 1, 0, 1, 1];
        let z = values_to_tensor::<TestBackend>(&[0.0; 5], &device);
        let m = values_to_tensor::<TestBackend>(&indicator(&pattern), &device);

        let bce = tensor_to_f64(weak_supervision_loss(LossKind::Bce, z.clone(), m.clone()));
        assert!((bce - std::f64::consts::LN_2).abs() < 1e-6, "got {bce}");

        let nll = tensor_to_f64(weak_supervision_loss(LossKind::Nll, z, m));
        assert!(nll.abs() < 1e-6, "got {nll}");
    }

    #[test]
    fn test_bce_is_cross_entropy_of_mixture_posterior() {
        // Mixed events carry weight f, reference events weight 1, so the
        // posterior of "mixed" is f / (1 + f) = sigmoid(ln f).
        let device = Default::default();
        let pattern = [1, 0, 1, 0];
        let f = [3.0_f64, 0.5, 1.2, 2.0];
        let log_f: Vec<f64> = f.iter().map(|v| v.ln()).collect();
        let got = tensor_to_f64(weak_supervision_loss(
            LossKind::Bce,
            values_to_tensor::<TestBackend>(&log_f, &device),
            values_to_tensor::<TestBackend>(&indicator(&pattern), &device),
        ));

        let posterior = |w: f64| w / (1.0 + w);
        let mixed = -(posterior(f[0]).ln() + posterior(f[2]).ln()) / 2.0;
        let reference = -((1.0 - posterior(f[1])).ln() + (1.0 - posterior(f[3])).ln()) / 2.0;
        let expected = 0.5 * (mixed + reference);
        assert!((got - expected).abs() < 1e-5, "{got} vs {expected}");

        // Mixed-sample likelihood of the NLL objective weighs events by f.
        let nll = tensor_to_f64(weak_supervision_loss(
            LossKind::Nll,
            values_to_tensor::<TestBackend>(&log_f, &device),
            values_to_tensor::<TestBackend>(&indicator(&pattern), &device),
        ));
        let expected = ((f[1] + f[3]) / 2.0).ln() - (f[0].ln() + f[2].ln()) / 2.0;
        assert!((nll - expected).abs() < 1e-5, "{nll} vs {expected}");
    }

    #[test]
    fn test_bce_rewards_separation() {
        let device = Default::default();
        let pattern = [0, 0, 1, 1];
        let m = values_to_tensor::<TestBackend>(&indicator(&pattern), &device);
        let good = values_to_tensor::<TestBackend>(&[-2.0, -2.0, 2.0, 2.0], &device);
        let bad = values_to_tensor::<TestBackend>(&[2.0, 2.0, -2.0, -2.0], &device);
        let good = tensor_to_f64(weak_supervision_loss(LossKind::Bce, good, m.clone()));
        let bad = tensor_to_f64(weak_supervision_loss(LossKind::Bce, bad, m));
        assert!(good < std::f64::consts::LN_2);
        assert!(bad > std::f64::consts::LN_2);
    }

    #[test]
    fn test_host_accumulator_matches_tensor_loss() {
        let device = Default::default();
        let pattern = [0, 1, 1, 0, 1, 0, 0];
        let z = [0.3, 1.2, -0.7, -0.1, 2.5, 0.0, -1.5];
        let z32: Vec<f32> = z.iter().map(|&v| v as f32).collect();
        for kind in [LossKind::Bce, LossKind::Nll] {
            let expected = tensor_to_f64(weak_supervision_loss(
                kind,
                values_to_tensor::<TestBackend>(&z, &device),
                values_to_tensor::<TestBackend>(&indicator(&pattern), &device),
            ));

            // Split across two updates to check accumulation.
            let mut acc = WeakLossAccumulator::new(kind);
            acc.update(&z32[..3], &tags(&pattern[..3]));
            acc.update(&z32[3..], &tags(&pattern[3..]));
            let got = acc.value().unwrap();
            assert!((got - expected).abs() < 1e-5, "{kind}: {got} vs {expected}");
        }
    }

    #[test]
    fn test_accumulator_needs_both_samples() {
        let mut acc = WeakLossAccumulator::new(LossKind::Bce);
        assert!(acc.value().is_none());
        acc.update(&[0.1, 0.2], &tags(&[1, 1]));
        assert!(acc.value().is_none());
        acc.update(&[0.1], &tags(&[0]));
        assert!(acc.value().is_some());
    }

    #[test]
    fn test_gradient_reaches_log_ratio() {
        let device = Default::default();
        let z = values_to_tensor::<TestAutodiffBackend>(&[0.5, -0.5, 1.0], &device).require_grad();
        let m = values_to_tensor::<TestAutodiffBackend>(&[1.0, 0.0, 1.0], &device);
        for kind in [LossKind::Bce, LossKind::Nll] {
            let grads = weak_supervision_loss(kind, z.clone(), m.clone()).backward();
            let g: f32 = z
                .grad(&grads)
                .expect("log ratio should have gradient")
                .abs()
                .sum()
                .into_scalar()
                .elem();
            assert!(g > 0.0, "{kind}");
        }
    }

    #[test]
    fn test_batch_composition() {
        assert_eq!(
            check_batch_composition(&tags(&[0, 1, 0, 1]), 0.05),
            BatchComposition::Balanced
        );
        let mut pattern = vec![0u8; 99];
        pattern.push(1);
        assert_eq!(
            check_batch_composition(&tags(&pattern), 0.05),
            BatchComposition::Imbalanced {
                reference: 99,
                mixed: 1
            }
        );
        assert_eq!(
            check_batch_composition(&tags(&[1, 1, 1]), 0.05),
            BatchComposition::MissingSource {
                reference: 0,
                mixed: 3
            }
        );
    }

    #[test]
    fn test_loss_kind_serde() {
        assert_eq!(serde_json::to_string(&LossKind::Nll).unwrap(), "\"nll\"");
        let k: LossKind = serde_json::from_str("\"bce\"").unwrap();
        assert_eq!(k, LossKind::Bce);
    }
}
