//! Synthetic signal-injection datasets.
//!
//! The reference sample is pure background. The mixed sample is background
//! with an injected fraction `mu` of signal, split `alpha / (1 - alpha)`
//! between the two-prong and three-prong decay modes. Signal feature means
//! move smoothly with the resonance masses, so a mass-parameterized
//! classifier has something to learn.
//!
//! [`generate_labeled`] draws the truth-labelled signal and background
//! samples a mass-parameterized classifier is trained on, with signal at a
//! list of mass points.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::types::{DecayMode, Event, LabeledEvent, SampleTag, TruthLabel};

/// Mass (GeV) at which the mass-dependent mean shift is zero.
const MASS_PIVOT: f64 = 325.0;
/// GeV per unit of mean shift.
const MASS_UNIT: f64 = 100.0;

/// Parameters of a synthetic dataset. Fully determined by `seed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticConfig {
    #[serde(default = "default_n_reference")]
    pub n_reference: usize,
    #[serde(default = "default_n_mixed")]
    pub n_mixed: usize,
    /// Informative feature dimensions.
    #[serde(default = "default_n_features")]
    pub n_features: usize,
    /// Extra pure-noise dimensions appended to every event.
    #[serde(default)]
    pub noise_dimensions: usize,
    /// Injected signal fraction of the mixed sample.
    #[serde(default = "default_mu")]
    pub mu: f64,
    /// Two-prong share of the injected signal.
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    #[serde(default = "default_m1")]
    pub m1: f64,
    #[serde(default = "default_m2")]
    pub m2: f64,
    #[serde(default = "default_decay_modes")]
    pub decay_modes: Vec<DecayMode>,
    /// Mean offset of signal from background, in background standard deviations.
    #[serde(default = "default_separation")]
    pub separation: f64,
    /// Standard deviation of signal features.
    #[serde(default = "default_signal_width")]
    pub signal_width: f64,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_n_reference() -> usize {
    20_000
}
fn default_n_mixed() -> usize {
    20_000
}
fn default_n_features() -> usize {
    6
}
fn default_mu() -> f64 {
    0.05
}
fn default_alpha() -> f64 {
    0.5
}
fn default_m1() -> f64 {
    300.0
}
fn default_m2() -> f64 {
    300.0
}
fn default_decay_modes() -> Vec<DecayMode> {
    vec![DecayMode::TwoProng]
}
fn default_separation() -> f64 {
    1.5
}
fn default_signal_width() -> f64 {
    0.6
}
fn default_seed() -> u64 {
    2023
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            n_reference: default_n_reference(),
            n_mixed: default_n_mixed(),
            n_features: default_n_features(),
            noise_dimensions: 0,
            mu: default_mu(),
            alpha: default_alpha(),
            m1: default_m1(),
            m2: default_m2(),
            decay_modes: default_decay_modes(),
            separation: default_separation(),
            signal_width: default_signal_width(),
            seed: default_seed(),
        }
    }
}

impl SyntheticConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.n_features < 3 {
            anyhow::bail!("n_features must be >= 3, got {}", self.n_features);
        }
        if !(0.0..=1.0).contains(&self.mu) {
            anyhow::bail!("mu must be in [0, 1], got {}", self.mu);
        }
        if !(0.0..=1.0).contains(&self.alpha) {
            anyhow::bail!("alpha must be in [0, 1], got {}", self.alpha);
        }
        if self.decay_modes.is_empty() {
            anyhow::bail!("at least one decay mode is required");
        }
        if self.signal_width.is_nan() || self.signal_width <= 0.0 {
            anyhow::bail!("signal_width must be > 0, got {}", self.signal_width);
        }
        Ok(())
    }

    /// Total feature length of generated events.
    pub fn total_features(&self) -> usize {
        self.n_features + self.noise_dimensions
    }

    /// Number of injected signal events per decay mode, in `decay_modes` order.
    pub fn signal_counts(&self) -> Vec<(DecayMode, usize)> {
        let n_signal = (self.mu * self.n_mixed as f64).round() as usize;
        match self.decay_modes.as_slice() {
            [mode] => vec![(*mode, n_signal)],
            modes => {
                let n_first = (self.alpha * n_signal as f64).round() as usize;
                let mut counts = vec![(modes[0], n_first), (modes[1], n_signal - n_first)];
                // Any further entries carry no signal.
                counts.extend(modes[2..].iter().map(|m| (*m, 0)));
                counts
            }
        }
    }
}

/// Mean feature vector of signal in `mode` at masses `(m1, m2)`.
///
/// Dimensions cycle through three roles: an `m1`-dependent shift, an
/// `m2`-dependent shift, and a mode signature (+ for qq, - for qqq).
pub fn signal_mean(config: &SyntheticConfig, mode: DecayMode) -> Vec<f64> {
    let s = config.separation;
    let shift1 = 0.8 * (config.m1 - MASS_PIVOT) / MASS_UNIT;
    let shift2 = 0.8 * (config.m2 - MASS_PIVOT) / MASS_UNIT;
    let sign = match mode {
        DecayMode::TwoProng => 1.0,
        DecayMode::ThreeProng => -1.0,
    };
    (0..config.n_features)
        .map(|j| match j % 3 {
            0 => s + shift1,
            1 => s + shift2,
            _ => sign * s,
        })
        .collect()
}

/// Generate reference and mixed events. Reference events come first.
pub fn generate(config: &SyntheticConfig) -> anyhow::Result<Vec<Event>> {
    config.validate()?;
    let mut rng = StdRng::seed_from_u64(config.seed);
    let unit = Normal::new(0.0, 1.0)?;
    let signal_noise = Normal::new(0.0, config.signal_width)?;

    let background = |rng: &mut StdRng| -> Vec<f32> {
        (0..config.n_features)
            .map(|_| unit.sample(rng) as f32)
            .collect()
    };

    let mut events = Vec::with_capacity(config.n_reference + config.n_mixed);
    for _ in 0..config.n_reference {
        events.push(Event {
            features: background(&mut rng),
            sample: SampleTag::Reference,
            truth: Some(TruthLabel::Background),
            decay_mode: None,
        });
    }

    let mut mixed = Vec::with_capacity(config.n_mixed);
    for (mode, count) in config.signal_counts() {
        let mean = signal_mean(config, mode);
        for _ in 0..count {
            let features = mean
                .iter()
                .map(|m| (m + signal_noise.sample(&mut rng)) as f32)
                .collect();
            mixed.push(Event {
                features,
                sample: SampleTag::Mixed,
                truth: Some(TruthLabel::Signal),
                decay_mode: Some(mode),
            });
        }
    }
    while mixed.len() < config.n_mixed {
        mixed.push(Event {
            features: background(&mut rng),
            sample: SampleTag::Mixed,
            truth: Some(TruthLabel::Background),
            decay_mode: None,
        });
    }
    mixed.shuffle(&mut rng);
    events.extend(mixed);

    if config.noise_dimensions > 0 {
        for event in &mut events {
            event
                .features
                .extend((0..config.noise_dimensions).map(|_| unit.sample(&mut rng) as f32));
        }
    }

    tracing::info!(
        reference = config.n_reference,
        mixed = config.n_mixed,
        mu = config.mu,
        alpha = config.alpha,
        m1 = config.m1,
        m2 = config.m2,
        n_features = config.total_features(),
        seed = config.seed,
        "Generated synthetic events"
    );

    Ok(events)
}

/// Truth-labelled events: `config.n_reference` background events plus
/// `n_signal_per_point` signal events per mass point and decay mode.
///
/// `config.m1`, `config.m2`, `mu`, `alpha` and `n_mixed` are not used.
pub fn generate_labeled(
    config: &SyntheticConfig,
    mass_points: &[(f64, f64)],
    n_signal_per_point: usize,
) -> anyhow::Result<Vec<LabeledEvent>> {
    config.validate()?;
    if mass_points.is_empty() {
        anyhow::bail!("at least one signal mass point is required");
    }
    let mut rng = StdRng::seed_from_u64(config.seed);
    let unit = Normal::new(0.0, 1.0)?;
    let signal_noise = Normal::new(0.0, config.signal_width)?;
    let gaussian = |rng: &mut StdRng, n: usize| -> Vec<f32> {
        (0..n).map(|_| unit.sample(rng) as f32).collect()
    };

    let n_signal = mass_points.len() * config.decay_modes.len() * n_signal_per_point;
    let mut events = Vec::with_capacity(config.n_reference + n_signal);
    for _ in 0..config.n_reference {
        events.push(LabeledEvent {
            features: gaussian(&mut rng, config.n_features),
            truth: TruthLabel::Background,
            decay_mode: None,
            masses: Vec::new(),
        });
    }
    for &(m1, m2) in mass_points {
        let point = SyntheticConfig {
            m1,
            m2,
            ..config.clone()
        };
        for &mode in &config.decay_modes {
            let mean = signal_mean(&point, mode);
            for _ in 0..n_signal_per_point {
                let features = mean
                    .iter()
                    .map(|m| (m + signal_noise.sample(&mut rng)) as f32)
                    .collect();
                events.push(LabeledEvent {
                    features,
                    truth: TruthLabel::Signal,
                    decay_mode: Some(mode),
                    masses: vec![m1, m2],
                });
            }
        }
    }

    if config.noise_dimensions > 0 {
        for event in &mut events {
            event
                .features
                .extend(gaussian(&mut rng, config.noise_dimensions));
        }
    }

    tracing::info!(
        background = config.n_reference,
        signal = n_signal,
        mass_points = mass_points.len(),
        n_features = config.total_features(),
        seed = config.seed,
        "Generated labelled events"
    );

    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DatasetSummary;

    fn small_config() -> SyntheticConfig {
        SyntheticConfig {
            n_reference: 400,
            n_mixed: 400,
            mu: 0.1,
            ..Default::default()
        }
    }

    #[test]
    fn test_counts_and_truth() {
        let events = generate(&small_config()).unwrap();
        let summary = DatasetSummary::from_events(&events);
        assert_eq!(summary.reference_count, 400);
        assert_eq!(summary.mixed_count, 400);
        assert_eq!(summary.signal_count, 40);
        assert_eq!(summary.mixed_signal_count, 40);
        assert_eq!(summary.n_features, 6);
    }

    #[test]
    fn test_deterministic_per_seed() {
        let a = generate(&small_config()).unwrap();
        let b = generate(&small_config()).unwrap();
        assert_eq!(a, b);
        let c = generate(&SyntheticConfig {
            seed: 7,
            ..small_config()
        })
        .unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_alpha_splits_modes() {
        let config = SyntheticConfig {
            decay_modes: vec![DecayMode::TwoProng, DecayMode::ThreeProng],
            alpha: 0.25,
            ..small_config()
        };
        assert_eq!(
            config.signal_counts(),
            vec![(DecayMode::TwoProng, 10), (DecayMode::ThreeProng, 30)]
        );
        let events = generate(&config).unwrap();
        let qqq = events
            .iter()
            .filter(|e| e.decay_mode == Some(DecayMode::ThreeProng))
            .count();
        assert_eq!(qqq, 30);
    }

    #[test]
    fn test_zero_mu_has_no_signal() {
        let config = SyntheticConfig {
            mu: 0.0,
            ..small_config()
        };
        let events = generate(&config).unwrap();
        assert!(events.iter().all(|e| e.truth == Some(TruthLabel::Background)));
    }

    #[test]
    fn test_noise_dimensions_appended() {
        let config = SyntheticConfig {
            noise_dimensions: 4,
            ..small_config()
        };
        let events = generate(&config).unwrap();
        assert!(events.iter().all(|e| e.features.len() == 10));
    }

    #[test]
    fn test_signal_mean_depends_on_mass() {
        let low = signal_mean(&SyntheticConfig { m1: 100.0, ..Default::default() }, DecayMode::TwoProng);
        let high = signal_mean(&SyntheticConfig { m1: 500.0, ..Default::default() }, DecayMode::TwoProng);
        assert!(high[0] > low[0]);
        assert_eq!(high[1], low[1]);
        let qqq = signal_mean(&SyntheticConfig::default(), DecayMode::ThreeProng);
        assert!(qqq[2] < 0.0);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(SyntheticConfig { mu: 1.5, ..Default::default() }.validate().is_err());
        assert!(SyntheticConfig { n_features: 2, ..Default::default() }.validate().is_err());
        assert!(SyntheticConfig { decay_modes: vec![], ..Default::default() }.validate().is_err());
    }

    #[test]
    fn test_labeled_counts_and_masses() {
        let config = SyntheticConfig {
            n_reference: 50,
            decay_modes: vec![DecayMode::TwoProng, DecayMode::ThreeProng],
            noise_dimensions: 1,
            ..small_config()
        };
        let points = [(100.0, 200.0), (400.0, 400.0)];
        let events = generate_labeled(&config, &points, 10).unwrap();
        assert_eq!(events.len(), 50 + 2 * 2 * 10);

        let signal: Vec<_> = events
            .iter()
            .filter(|e| e.truth == TruthLabel::Signal)
            .collect();
        assert_eq!(signal.len(), 40);
        assert!(signal.iter().all(|e| e.masses.len() == 2 && e.decay_mode.is_some()));
        assert_eq!(
            signal.iter().filter(|e| e.masses == vec![100.0, 200.0]).count(),
            20
        );
        assert!(events
            .iter()
            .filter(|e| e.truth == TruthLabel::Background)
            .all(|e| e.masses.is_empty()));
        assert!(events.iter().all(|e| e.features.len() == 7));

        assert_eq!(events, generate_labeled(&config, &points, 10).unwrap());
    }

    #[test]
    fn test_labeled_signal_follows_mass() {
        let config = SyntheticConfig {
            n_reference: 0,
            signal_width: 0.1,
            ..small_config()
        };
        let events = generate_labeled(&config, &[(100.0, 300.0), (500.0, 300.0)], 50).unwrap();
        let mean_first = |m1: f64| {
            let values: Vec<f32> = events
                .iter()
                .filter(|e| e.masses[0] == m1)
                .map(|e| e.features[0])
                .collect();
            values.iter().sum::<f32>() / values.len() as f32
        };
        assert!(mean_first(500.0) > mean_first(100.0) + 2.0);
        assert!(generate_labeled(&config, &[], 10).is_err());
    }
}
