//! Evaluation metrics on scored events: the weak loss, ROC AUC, accuracy,
//! log loss and the significance improvement at a fixed false-positive rate.
//!
//! Truth-based metrics use only events that carry a truth label and return
//! `None` when no event does or when one class is missing.

use std::fmt;

use events::{SampleTag, TruthLabel};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::training::loss::{LossKind, WeakLossAccumulator};

/// A metric evaluated on one split. Serialized as its name, e.g. `"sic_1e3"`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Metric {
    /// Weak-supervision objective.
    Loss,
    /// ROC AUC of the log ratio against truth labels.
    Auc,
    /// Fraction of events with `ln f > 0` exactly when they are signal.
    Accuracy,
    /// Binary cross-entropy of `sigmoid(ln f)` against truth labels.
    LogLoss,
    /// `tpr / sqrt(fpr)` at `fpr = 1 / inverse_fpr`.
    Sic { inverse_fpr: f64 },
}

impl Metric {
    pub fn higher_is_better(&self) -> bool {
        !matches!(self, Self::Loss | Self::LogLoss)
    }

    pub fn needs_truth(&self) -> bool {
        !matches!(self, Self::Loss)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "loss" => Some(Self::Loss),
            "auc" => Some(Self::Auc),
            "accuracy" => Some(Self::Accuracy),
            "log_loss" => Some(Self::LogLoss),
            _ => {
                let inverse_fpr: f64 = s.strip_prefix("sic_")?.parse().ok()?;
                (inverse_fpr.is_finite() && inverse_fpr >= 1.0).then_some(Self::Sic { inverse_fpr })
            }
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Loss => write!(f, "loss"),
            Self::Auc => write!(f, "auc"),
            Self::Accuracy => write!(f, "accuracy"),
            Self::LogLoss => write!(f, "log_loss"),
            Self::Sic { inverse_fpr } => write!(f, "sic_{inverse_fpr:e}"),
        }
    }
}

impl TryFrom<String> for Metric {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s).ok_or_else(|| {
            format!("unknown metric '{s}' (expected loss, auc, accuracy, log_loss or sic_<1/fpr>)")
        })
    }
}

impl From<Metric> for String {
    fn from(m: Metric) -> Self {
        m.to_string()
    }
}

/// Host copy of a model's scores over one split.
#[derive(Debug, Clone, Default)]
pub struct SplitScores {
    /// `ln f(x)` per event.
    pub log_ratio: Vec<f64>,
    /// mu-free signal log likelihood ratio per event.
    pub signal_log_ratio: Vec<f64>,
    pub tags: Vec<SampleTag>,
    pub truth: Vec<Option<TruthLabel>>,
}

impl SplitScores {
    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn extend(&mut self, other: SplitScores) {
        self.log_ratio.extend(other.log_ratio);
        self.signal_log_ratio.extend(other.signal_log_ratio);
        self.tags.extend(other.tags);
        self.truth.extend(other.truth);
    }

    /// Subset at the given indices, repeats allowed.
    pub fn select(&self, indices: &[usize]) -> SplitScores {
        SplitScores {
            log_ratio: indices.iter().map(|&i| self.log_ratio[i]).collect(),
            signal_log_ratio: indices.iter().map(|&i| self.signal_log_ratio[i]).collect(),
            tags: indices.iter().map(|&i| self.tags[i]).collect(),
            truth: indices.iter().map(|&i| self.truth[i]).collect(),
        }
    }

    fn labelled(&self) -> (Vec<f64>, Vec<bool>) {
        self.log_ratio
            .iter()
            .zip(&self.truth)
            .filter_map(|(&s, t)| t.map(|t| (s, t.is_signal())))
            .unzip()
    }
}

/// Evaluate `metric` on a scored split.
pub fn compute_metric(metric: Metric, scores: &SplitScores, loss: LossKind) -> Option<f64> {
    if metric == Metric::Loss {
        let log_ratio: Vec<f32> = scores.log_ratio.iter().map(|&v| v as f32).collect();
        let mut acc = WeakLossAccumulator::new(loss);
        acc.update(&log_ratio, &scores.tags);
        return acc.value();
    }
    let (s, labels) = scores.labelled();
    match metric {
        Metric::Loss => None,
        Metric::Auc => roc_auc(&s, &labels),
        Metric::Accuracy => accuracy(&s, &labels),
        Metric::LogLoss => log_loss(&s, &labels),
        Metric::Sic { inverse_fpr } => sic(&s, &labels, 1.0 / inverse_fpr),
    }
}

fn class_counts(labels: &[bool]) -> (usize, usize) {
    let pos = labels.iter().filter(|&&l| l).count();
    (pos, labels.len() - pos)
}

/// ROC AUC via the Mann-Whitney statistic with average ranks for ties.
/// Constant scores give exactly 0.5.
pub fn roc_auc(scores: &[f64], labels: &[bool]) -> Option<f64> {
    let (n_pos, n_neg) = class_counts(labels);
    if n_pos == 0 || n_neg == 0 {
        return None;
    }
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    let mut rank_sum_pos = 0.0;
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && scores[order[j + 1]] == scores[order[i]] {
            j += 1;
        }
        // Ranks i+1..=j+1 share their average.
        let avg_rank = (i + j + 2) as f64 / 2.0;
        for &k in &order[i..=j] {
            if labels[k] {
                rank_sum_pos += avg_rank;
            }
        }
        i = j + 1;
    }
    let n_pos_f = n_pos as f64;
    Some((rank_sum_pos - n_pos_f * (n_pos_f + 1.0) / 2.0) / (n_pos_f * n_neg as f64))
}

pub fn accuracy(scores: &[f64], labels: &[bool]) -> Option<f64> {
    if scores.is_empty() {
        return None;
    }
    let correct = scores
        .iter()
        .zip(labels)
        .filter(|&(&s, &l)| (s > 0.0) == l)
        .count();
    Some(correct as f64 / scores.len() as f64)
}

pub fn log_loss(scores: &[f64], labels: &[bool]) -> Option<f64> {
    if scores.is_empty() {
        return None;
    }
    let total: f64 = scores
        .iter()
        .zip(labels)
        .map(|(&s, &l)| {
            // -ln sigmoid(±s)
            let x = if l { s } else { -s };
            if x >= 0.0 {
                (-x).exp().ln_1p()
            } else {
                -x + x.exp().ln_1p()
            }
        })
        .sum();
    Some(total / scores.len() as f64)
}

/// ROC curve points `(fpr, tpr)` from the highest threshold down, one point
/// per distinct score, starting at `(0, 0)`.
pub fn roc_curve(scores: &[f64], labels: &[bool]) -> Option<Vec<(f64, f64)>> {
    let (n_pos, n_neg) = class_counts(labels);
    if n_pos == 0 || n_neg == 0 {
        return None;
    }
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

    let mut points = vec![(0.0, 0.0)];
    let (mut tp, mut fp) = (0usize, 0usize);
    for (idx, &k) in order.iter().enumerate() {
        if labels[k] {
            tp += 1;
        } else {
            fp += 1;
        }
        let last_of_tie = order
            .get(idx + 1)
            .map_or(true, |&next| scores[next] != scores[k]);
        if last_of_tie {
            points.push((fp as f64 / n_neg as f64, tp as f64 / n_pos as f64));
        }
    }
    Some(points)
}

/// Significance improvement `tpr / sqrt(fpr)` with the tpr linearly
/// interpolated on the ROC curve at `fpr`.
pub fn sic(scores: &[f64], labels: &[bool], fpr: f64) -> Option<f64> {
    if !(fpr > 0.0 && fpr <= 1.0) {
        return None;
    }
    let curve = roc_curve(scores, labels)?;
    let tpr = curve
        .windows(2)
        .find(|w| w[1].0 >= fpr)
        .map(|w| {
            let ((f0, t0), (f1, t1)) = (w[0], w[1]);
            if f1 > f0 {
                t0 + (t1 - t0) * (fpr - f0) / (f1 - f0)
            } else {
                t1
            }
        })?;
    Some(tpr / fpr.sqrt())
}

/// Standard deviation of `metric` over `resamples` bootstrap resamples.
/// Resamples where the metric is undefined are dropped.
pub fn bootstrap_std(
    metric: Metric,
    scores: &SplitScores,
    loss: LossKind,
    resamples: usize,
    seed: u64,
) -> Option<f64> {
    if resamples < 2 || scores.is_empty() {
        return None;
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let n = scores.len();
    let values: Vec<f64> = (0..resamples)
        .filter_map(|_| {
            let indices: Vec<usize> = (0..n).map(|_| rng.gen_range(0..n)).collect();
            compute_metric(metric, &scores.select(&indices), loss)
        })
        .collect();
    std_dev(&values)
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    Some(if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    })
}

/// Sample standard deviation; `None` for fewer than two values.
pub fn std_dev(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let m = mean(values)?;
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    Some(var.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_names() {
        for m in [
            Metric::Loss,
            Metric::Auc,
            Metric::Accuracy,
            Metric::LogLoss,
            Metric::Sic { inverse_fpr: 1e3 },
        ] {
            assert_eq!(Metric::parse(&m.to_string()), Some(m));
        }
        assert_eq!(Metric::Sic { inverse_fpr: 1e3 }.to_string(), "sic_1e3");
        assert_eq!(Metric::parse("sic_100"), Some(Metric::Sic { inverse_fpr: 100.0 }));
        assert_eq!(Metric::parse("sic_0.5"), None);
        assert_eq!(Metric::parse("f1"), None);
        assert!(!Metric::Loss.higher_is_better());
        assert!(Metric::Sic { inverse_fpr: 10.0 }.higher_is_better());
    }

    #[test]
    fn test_metric_serde_as_string() {
        let json = serde_json::to_string(&vec![Metric::Auc, Metric::Sic { inverse_fpr: 1e3 }]).unwrap();
        assert_eq!(json, r#"["auc","sic_1e3"]"#);
        let back: Vec<Metric> = serde_json::from_str(&json).unwrap();
        assert_eq!(back[1], Metric::Sic { inverse_fpr: 1000.0 });
        assert!(serde_json::from_str::<Metric>("\"roc\"").is_err());
    }

    #[test]
    fn test_auc() {
        let labels = [false, false, true, true];
        assert_eq!(roc_auc(&[0.1, 0.2, 0.8, 0.9], &labels), Some(1.0));
        assert_eq!(roc_auc(&[0.9, 0.8, 0.2, 0.1], &labels), Some(0.0));
        assert_eq!(roc_auc(&[0.0; 4], &labels), Some(0.5));
        // one inversion out of four pairs
        assert_eq!(roc_auc(&[0.1, 0.5, 0.4, 0.9], &labels), Some(0.75));
        assert_eq!(roc_auc(&[0.1, 0.2], &[true, true]), None);
    }

    #[test]
    fn test_accuracy_and_log_loss() {
        let labels = [false, true, true];
        assert_eq!(accuracy(&[-1.0, 2.0, -0.5], &labels), Some(2.0 / 3.0));
        let ll = log_loss(&[0.0, 0.0, 0.0], &labels).unwrap();
        assert!((ll - std::f64::consts::LN_2).abs() < 1e-12);
        let good = log_loss(&[-5.0, 5.0, 5.0], &labels).unwrap();
        assert!(good < 0.01);
    }

    #[test]
    fn test_sic() {
        // Perfect separation: tpr = 1 at any fpr.
        let labels = [false, false, false, false, true, true];
        let scores = [0.1, 0.2, 0.3, 0.4, 0.9, 0.95];
        let v = sic(&scores, &labels, 0.25).unwrap();
        assert!((v - 1.0 / 0.5).abs() < 1e-12);

        // Constant scores: the ROC is the diagonal, sic = sqrt(fpr).
        let v = sic(&[0.0; 6], &labels, 0.25).unwrap();
        assert!((v - 0.5).abs() < 1e-12);

        assert!(sic(&scores, &labels, 0.0).is_none());
    }

    #[test]
    fn test_compute_metric_without_truth() {
        let scores = SplitScores {
            log_ratio: vec![0.0, 0.0],
            signal_log_ratio: vec![0.0, 0.0],
            tags: vec![SampleTag::Reference, SampleTag::Mixed],
            truth: vec![None, None],
        };
        assert!(compute_metric(Metric::Auc, &scores, LossKind::Bce).is_none());
        let loss = compute_metric(Metric::Loss, &scores, LossKind::Bce).unwrap();
        assert!((loss - std::f64::consts::LN_2).abs() < 1e-12);
    }

    #[test]
    fn test_bootstrap_std_deterministic() {
        let n = 40;
        let scores = SplitScores {
            log_ratio: (0..n).map(|i| (i as f64 * 0.37).sin()).collect(),
            signal_log_ratio: vec![0.0; n],
            tags: (0..n)
                .map(|i| if i % 2 == 0 { SampleTag::Mixed } else { SampleTag::Reference })
                .collect(),
            truth: (0..n)
                .map(|i| Some(if i % 3 == 0 { TruthLabel::Signal } else { TruthLabel::Background }))
                .collect(),
        };
        let a = bootstrap_std(Metric::Auc, &scores, LossKind::Bce, 20, 7).unwrap();
        let b = bootstrap_std(Metric::Auc, &scores, LossKind::Bce, 20, 7).unwrap();
        assert_eq!(a, b);
        assert!(a > 0.0);
        assert!(bootstrap_std(Metric::Auc, &scores, LossKind::Bce, 1, 7).is_none());
    }

    #[test]
    fn test_stats() {
        assert_eq!(mean(&[1.0, 2.0, 6.0]), Some(3.0));
        assert_eq!(median(&[5.0, 1.0, 3.0]), Some(3.0));
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), Some(2.5));
        assert_eq!(median(&[]), None);
        let s = std_dev(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]).unwrap();
        assert!((s - 2.138_089_935).abs() < 1e-6);
        assert_eq!(std_dev(&[1.0]), None);
    }
}
