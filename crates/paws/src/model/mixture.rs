//! Mixed-over-reference density ratio built from per-mode classifier scores
//! and the mixture fractions.

use burn::prelude::*;

/// Numeric settings of the mixture that do not change during a run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MixtureSettings {
    /// Prior normalization factor on the signal likelihood ratio.
    pub kappa: f64,
    /// Lower bound on the ratio before taking logs.
    pub ratio_floor: f64,
    /// Kappa is re-estimated from the reference sample whenever the masses
    /// change, see [`sampled_kappa`].
    pub sample_kappa: bool,
}

impl Default for MixtureSettings {
    fn default() -> Self {
        Self {
            kappa: 1.0,
            ratio_floor: 1e-12,
            sample_kappa: false,
        }
    }
}

/// Forward output of the semi-weakly model for one batch.
#[derive(Debug, Clone)]
pub struct MixtureOutput<B: Backend> {
    /// Per-mode classifier logits, shape `(batch, n_modes)`.
    pub logits: Tensor<B, 2>,
    /// `ln f(x)`, shape `(batch,)`. The discriminant used by the objective.
    pub log_ratio: Tensor<B, 1>,
    /// `ln` of the mu-free signal likelihood ratio, shape `(batch,)`.
    pub signal_log_ratio: Tensor<B, 1>,
}

/// Compute `f = (1 - mu) + mu * kappa * (alpha * LR_0 + (1 - alpha) * LR_1)`.
///
/// `mu` and `alpha` have shape `(1,)`. Without `alpha` only the first mode is
/// used. With `mu == 0` the ratio is exactly 1 for every event, and with
/// `alpha` at 0 or 1 it is exactly the single-mode ratio.
pub fn density_ratio<B: Backend>(
    logits: Tensor<B, 2>,
    mu: Tensor<B, 1>,
    alpha: Option<Tensor<B, 1>>,
    settings: MixtureSettings,
) -> MixtureOutput<B> {
    let [batch, n_modes] = logits.dims();
    let ratios = logits.clone().exp();
    let first = ratios.clone().slice([0..batch, 0..1]).reshape([batch]);

    let signal_ratio = match alpha {
        Some(alpha) if n_modes >= 2 => {
            let second = ratios.slice([0..batch, 1..2]).reshape([batch]);
            let complement = alpha.clone().neg().add_scalar(1.0);
            first * alpha + second * complement
        }
        _ => first,
    };

    let background = mu.clone().neg().add_scalar(1.0);
    let ratio = signal_ratio.clone() * mu.mul_scalar(settings.kappa) + background;

    MixtureOutput {
        logits,
        log_ratio: ratio.clamp_min(settings.ratio_floor).log(),
        signal_log_ratio: signal_ratio.clamp_min(settings.ratio_floor).log(),
    }
}

/// Kappa that normalizes the signal likelihood ratio to unit mean over
/// background: `1 / mean(exp(signal_log_ratio))` over reference events.
///
/// `None` when there are no values or the mean is not positive and finite.
pub fn sampled_kappa(signal_log_ratio: &[f64]) -> Option<f64> {
    if signal_log_ratio.is_empty() {
        return None;
    }
    let mean = signal_log_ratio.iter().map(|v| v.exp()).sum::<f64>() / signal_log_ratio.len() as f64;
    (mean.is_finite() && mean > 0.0).then(|| 1.0 / mean)
}
