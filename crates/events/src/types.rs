//! Data types for events, batches, and dataset partitions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which physical sample an event was drawn from.
///
/// The reference sample is background-dominated; the mixed sample is suspected
/// to contain an admixture of signal at an unknown rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleTag {
    Reference,
    Mixed,
}

impl fmt::Display for SampleTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reference => write!(f, "reference"),
            Self::Mixed => write!(f, "mixed"),
        }
    }
}

impl SampleTag {
    /// Parse from string. Returns `None` for unrecognized values.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "reference" => Some(Self::Reference),
            "mixed" => Some(Self::Mixed),
            _ => None,
        }
    }

    /// Weak-supervision target: 1 for the mixed sample, 0 for the reference.
    pub fn target(self) -> f32 {
        match self {
            Self::Reference => 0.0,
            Self::Mixed => 1.0,
        }
    }
}

/// Ground-truth class of an event. Diagnostics only; never a training target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TruthLabel {
    Signal,
    Background,
}

impl fmt::Display for TruthLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Signal => write!(f, "signal"),
            Self::Background => write!(f, "background"),
        }
    }
}

impl TruthLabel {
    /// Parse from string. Returns `None` for unrecognized values.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "signal" => Some(Self::Signal),
            "background" => Some(Self::Background),
            _ => None,
        }
    }

    pub fn is_signal(self) -> bool {
        matches!(self, Self::Signal)
    }
}

/// Signal decay topology: two-prong (`qq`) or three-prong (`qqq`) jets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DecayMode {
    #[serde(rename = "qq")]
    TwoProng,
    #[serde(rename = "qqq")]
    ThreeProng,
}

impl fmt::Display for DecayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TwoProng => write!(f, "qq"),
            Self::ThreeProng => write!(f, "qqq"),
        }
    }
}

impl DecayMode {
    /// Parse from string. Returns `None` for unrecognized values.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "qq" => Some(Self::TwoProng),
            "qqq" => Some(Self::ThreeProng),
            _ => None,
        }
    }
}

/// A single collision event: an opaque feature vector plus its sample tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Fixed-length feature vector.
    pub features: Vec<f32>,
    /// Sample the event was drawn from.
    pub sample: SampleTag,
    /// Ground-truth class, when known (simulation). Diagnostics only.
    pub truth: Option<TruthLabel>,
    /// Decay mode of an injected signal event, when known. Diagnostics only.
    pub decay_mode: Option<DecayMode>,
}

impl Event {
    /// Event with no truth information, as recorded from data.
    pub fn unlabeled(features: Vec<f32>, sample: SampleTag) -> Self {
        Self {
            features,
            sample,
            truth: None,
            decay_mode: None,
        }
    }
}

/// Simulated event of known class, used to train the mass-parameterized
/// classifier with truth labels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledEvent {
    pub features: Vec<f32>,
    pub truth: TruthLabel,
    /// Decay mode of a signal event.
    pub decay_mode: Option<DecayMode>,
    /// Resonance masses in GeV a signal event was generated at. Empty for
    /// background.
    pub masses: Vec<f64>,
}

/// A contiguous batch of events in row-major layout, ready for tensor conversion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventBatch {
    /// Row-major features, `len() * n_features` values.
    pub features: Vec<f32>,
    /// Number of features per event.
    pub n_features: usize,
    /// Sample tag per event.
    pub tags: Vec<SampleTag>,
    /// Truth label per event (`None` where unknown).
    pub truth: Vec<Option<TruthLabel>>,
}

impl EventBatch {
    pub fn with_capacity(n_events: usize, n_features: usize) -> Self {
        Self {
            features: Vec::with_capacity(n_events * n_features),
            n_features,
            tags: Vec::with_capacity(n_events),
            truth: Vec::with_capacity(n_events),
        }
    }

    /// Append one event. Panics if the feature length does not match.
    pub fn push(&mut self, event: &Event) {
        assert_eq!(
            event.features.len(),
            self.n_features,
            "event has {} features, batch expects {}",
            event.features.len(),
            self.n_features
        );
        self.features.extend_from_slice(&event.features);
        self.tags.push(event.sample);
        self.truth.push(event.truth);
    }

    /// Number of events in the batch.
    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Weak-supervision targets (mixed = 1, reference = 0).
    pub fn targets(&self) -> Vec<f32> {
        self.tags.iter().map(|t| t.target()).collect()
    }

    /// Count of `(reference, mixed)` events.
    pub fn source_counts(&self) -> (usize, usize) {
        let mixed = self.tags.iter().filter(|t| **t == SampleTag::Mixed).count();
        (self.tags.len() - mixed, mixed)
    }

    /// Whether every event carries a truth label.
    pub fn has_truth(&self) -> bool {
        !self.truth.is_empty() && self.truth.iter().all(Option::is_some)
    }

    /// Concatenate batches into one (used for full-split evaluation).
    pub fn concat(batches: Vec<EventBatch>) -> Self {
        let n_features = batches.first().map(|b| b.n_features).unwrap_or(0);
        let total: usize = batches.iter().map(|b| b.len()).sum();
        let mut out = Self::with_capacity(total, n_features);
        for batch in batches {
            out.features.extend(batch.features);
            out.tags.extend(batch.tags);
            out.truth.extend(batch.truth);
        }
        out
    }
}

/// Dataset partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Validation,
    Test,
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Train => write!(f, "train"),
            Self::Validation => write!(f, "validation"),
            Self::Test => write!(f, "test"),
        }
    }
}

/// Restricts a batch sequence to one physical sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleFilter {
    #[default]
    All,
    Reference,
    Mixed,
}

impl SampleFilter {
    pub fn accepts(self, tag: SampleTag) -> bool {
        match self {
            Self::All => true,
            Self::Reference => tag == SampleTag::Reference,
            Self::Mixed => tag == SampleTag::Mixed,
        }
    }
}

/// Summary statistics for a stored event dataset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetSummary {
    pub total_events: usize,
    pub n_features: usize,
    pub reference_count: usize,
    pub mixed_count: usize,
    /// Events labelled signal in simulation truth.
    pub signal_count: usize,
    /// Signal events inside the mixed sample.
    pub mixed_signal_count: usize,
}

impl DatasetSummary {
    /// Observed signal fraction of the mixed sample, if truth is available.
    pub fn mixed_signal_fraction(&self) -> Option<f64> {
        if self.mixed_count == 0 || self.signal_count == 0 {
            return None;
        }
        Some(self.mixed_signal_count as f64 / self.mixed_count as f64)
    }

    pub fn from_events(events: &[Event]) -> Self {
        let mut summary = DatasetSummary {
            total_events: events.len(),
            n_features: events.first().map(|e| e.features.len()).unwrap_or(0),
            ..Default::default()
        };
        for event in events {
            match event.sample {
                SampleTag::Reference => summary.reference_count += 1,
                SampleTag::Mixed => summary.mixed_count += 1,
            }
            if event.truth == Some(TruthLabel::Signal) {
                summary.signal_count += 1;
                if event.sample == SampleTag::Mixed {
                    summary.mixed_signal_count += 1;
                }
            }
        }
        summary
    }
}
