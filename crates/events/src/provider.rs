//! Dataset provider: deterministic split partitions and lazy, restartable
//! batch iteration with per-epoch reshuffling.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::types::{DatasetSummary, Event, EventBatch, SampleFilter, SampleTag, Split};

/// Source of event batches consumed by the training core.
///
/// Implementations must be safe to share read-only across concurrent
/// training runs.
pub trait DatasetProvider: Send + Sync {
    /// Length of every feature vector.
    fn n_features(&self) -> usize;

    /// Number of events in a split that pass `filter`.
    fn len(&self, split: Split, filter: SampleFilter) -> usize;

    /// Lazy batch sequence over one split.
    ///
    /// With `shuffle_seed = Some(s)` the order is a deterministic permutation
    /// derived from `s`; with `None` events come in storage order. Calling
    /// again restarts the sequence.
    fn batches(
        &self,
        split: Split,
        batch_size: usize,
        filter: SampleFilter,
        shuffle_seed: Option<u64>,
    ) -> BatchIter<'_>;

    /// The whole split as a single batch, in storage order.
    fn full(&self, split: Split, filter: SampleFilter) -> EventBatch {
        let n = self.len(split, filter).max(1);
        EventBatch::concat(self.batches(split, n, filter, None).collect())
    }
}

/// Iterator over fixed-size batches of a borrowed event slice.
pub struct BatchIter<'a> {
    events: &'a [Event],
    order: Vec<usize>,
    batch_size: usize,
    n_features: usize,
    pos: usize,
}

impl<'a> BatchIter<'a> {
    /// Build an iterator over `events` filtered by `filter`.
    ///
    /// # Panics
    /// Panics if `batch_size` is zero.
    pub fn new(
        events: &'a [Event],
        n_features: usize,
        batch_size: usize,
        filter: SampleFilter,
        shuffle_seed: Option<u64>,
    ) -> Self {
        assert!(batch_size > 0, "batch_size must be > 0");
        let mut order: Vec<usize> = events
            .iter()
            .enumerate()
            .filter(|(_, e)| filter.accepts(e.sample))
            .map(|(i, _)| i)
            .collect();
        if let Some(seed) = shuffle_seed {
            let mut rng = StdRng::seed_from_u64(seed);
            order.shuffle(&mut rng);
        }
        Self {
            events,
            order,
            batch_size,
            n_features,
            pos: 0,
        }
    }

    /// Number of batches the iterator will yield in total.
    pub fn num_batches(&self) -> usize {
        self.order.len().div_ceil(self.batch_size)
    }
}

impl Iterator for BatchIter<'_> {
    type Item = EventBatch;

    fn next(&mut self) -> Option<EventBatch> {
        if self.pos >= self.order.len() {
            return None;
        }
        let end = (self.pos + self.batch_size).min(self.order.len());
        let mut batch = EventBatch::with_capacity(end - self.pos, self.n_features);
        for &i in &self.order[self.pos..end] {
            batch.push(&self.events[i]);
        }
        self.pos = end;
        Some(batch)
    }
}

/// Fractions of each sample assigned to train / validation / test.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SplitFractions {
    #[serde(default = "default_train_fraction")]
    pub train: f64,
    #[serde(default = "default_validation_fraction")]
    pub validation: f64,
    #[serde(default = "default_test_fraction")]
    pub test: f64,
}

fn default_train_fraction() -> f64 {
    0.5
}
fn default_validation_fraction() -> f64 {
    0.25
}
fn default_test_fraction() -> f64 {
    0.25
}

impl Default for SplitFractions {
    fn default() -> Self {
        Self {
            train: default_train_fraction(),
            validation: default_validation_fraction(),
            test: default_test_fraction(),
        }
    }
}

impl SplitFractions {
    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, v) in [
            ("train", self.train),
            ("validation", self.validation),
            ("test", self.test),
        ] {
            if !(0.0..=1.0).contains(&v) {
                anyhow::bail!("split fraction {name}={v} outside [0, 1]");
            }
        }
        let sum = self.train + self.validation + self.test;
        if (sum - 1.0).abs() > 1e-6 {
            anyhow::bail!("split fractions sum to {sum:.6}, expected 1");
        }
        if self.train == 0.0 {
            anyhow::bail!("train fraction must be > 0");
        }
        Ok(())
    }
}

/// Fully materialized dataset with fixed train / validation / test partitions.
#[derive(Debug, Clone)]
pub struct InMemoryDataset {
    train: Vec<Event>,
    validation: Vec<Event>,
    test: Vec<Event>,
    n_features: usize,
}

impl InMemoryDataset {
    /// Partition `events` deterministically from `split_seed`.
    ///
    /// Each sample (reference, mixed) is shuffled and cut separately, so every
    /// split keeps both sources in the same proportion as the input.
    pub fn from_events(
        events: Vec<Event>,
        fractions: SplitFractions,
        split_seed: u64,
    ) -> anyhow::Result<Self> {
        fractions.validate()?;
        let n_features = check_feature_lengths(&events)?;

        let mut rng = StdRng::seed_from_u64(split_seed);
        let mut train = Vec::new();
        let mut validation = Vec::new();
        let mut test = Vec::new();

        for tag in [SampleTag::Reference, SampleTag::Mixed] {
            let mut group: Vec<&Event> = events.iter().filter(|e| e.sample == tag).collect();
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

        // Interleave sources so storage-order batches see both samples.
        for part in [&mut train, &mut validation, &mut test] {
            part.shuffle(&mut rng);
        }

        tracing::info!(
            train = train.len(),
            validation = validation.len(),
            test = test.len(),
            n_features,
            split_seed,
            "Partitioned event dataset"
        );

        Ok(Self {
            train,
            validation,
            test,
            n_features,
        })
    }

    /// Build from already-partitioned events.
    pub fn from_partitions(
        train: Vec<Event>,
        validation: Vec<Event>,
        test: Vec<Event>,
    ) -> anyhow::Result<Self> {
        let all: Vec<&Event> = train.iter().chain(&validation).chain(&test).collect();
        let n_features = all
            .first()
            .map(|e| e.features.len())
            .ok_or_else(|| anyhow::anyhow!("dataset has no events"))?;
        if let Some(bad) = all.iter().find(|e| e.features.len() != n_features) {
            anyhow::bail!(
                "inconsistent feature length: expected {n_features}, found {}",
                bad.features.len()
            );
        }
        Ok(Self {
            train,
            validation,
            test,
            n_features,
        })
    }

    /// Keep only the feature columns at `indices`, in the given order.
    pub fn select_features(&self, indices: &[usize]) -> anyhow::Result<Self> {
        if indices.is_empty() {
            anyhow::bail!("feature selection is empty");
        }
        if let Some(&bad) = indices.iter().find(|&&i| i >= self.n_features) {
            anyhow::bail!("feature index {bad} out of range (n_features = {})", self.n_features);
        }
        let project = |events: &[Event]| -> Vec<Event> {
            events
                .iter()
                .map(|e| Event {
                    features: indices.iter().map(|&i| e.features[i]).collect(),
                    ..e.clone()
                })
                .collect()
        };
        Ok(Self {
            train: project(&self.train),
            validation: project(&self.validation),
            test: project(&self.test),
            n_features: indices.len(),
        })
    }

    /// Events of one split.
    pub fn events(&self, split: Split) -> &[Event] {
        match split {
            Split::Train => &self.train,
            Split::Validation => &self.validation,
            Split::Test => &self.test,
        }
    }

    pub fn summary(&self, split: Split) -> DatasetSummary {
        DatasetSummary::from_events(self.events(split))
    }
}

impl DatasetProvider for InMemoryDataset {
    fn n_features(&self) -> usize {
        self.n_features
    }

    fn len(&self, split: Split, filter: SampleFilter) -> usize {
        self.events(split)
            .iter()
            .filter(|e| filter.accepts(e.sample))
            .count()
    }

    fn batches(
        &self,
        split: Split,
        batch_size: usize,
        filter: SampleFilter,
        shuffle_seed: Option<u64>,
    ) -> BatchIter<'_> {
        BatchIter::new(
            self.events(split),
            self.n_features,
            batch_size,
            filter,
            shuffle_seed,
        )
    }
}

fn check_feature_lengths(events: &[Event]) -> anyhow::Result<usize> {
    let n_features = events
        .first()
        .map(|e| e.features.len())
        .ok_or_else(|| anyhow::anyhow!("dataset has no events"))?;
    if n_features == 0 {
        anyhow::bail!("events have zero features");
    }
    if let Some((i, bad)) = events
        .iter()
        .enumerate()
        .find(|(_, e)| e.features.len() != n_features)
    {
        anyhow::bail!(
            "event {i} has {} features, expected {n_features}",
            bad.features.len()
        );
    }
    Ok(n_features)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_events(n_ref: usize, n_mix: usize) -> Vec<Event> {
        let mut events = Vec::new();
        for i in 0..n_ref {
            events.push(Event::unlabeled(vec![i as f32, 0.0], SampleTag::Reference));
        }
        for i in 0..n_mix {
            events.push(Event::unlabeled(vec![i as f32, 1.0], SampleTag::Mixed));
        }
        events
    }

    #[test]
    fn test_split_sizes_stratified() {
        let ds = InMemoryDataset::from_events(make_events(100, 60), SplitFractions::default(), 7)
            .unwrap();
        assert_eq!(ds.len(Split::Train, SampleFilter::Reference), 50);
        assert_eq!(ds.len(Split::Train, SampleFilter::Mixed), 30);
        assert_eq!(ds.len(Split::Validation, SampleFilter::Reference), 25);
        assert_eq!(ds.len(Split::Validation, SampleFilter::Mixed), 15);
        assert_eq!(ds.len(Split::Test, SampleFilter::All), 40);
    }

    #[test]
    fn test_split_is_deterministic() {
        let a = InMemoryDataset::from_events(make_events(40, 40), SplitFractions::default(), 3)
            .unwrap();
        let b = InMemoryDataset::from_events(make_events(40, 40), SplitFractions::default(), 3)
            .unwrap();
        assert_eq!(a.events(Split::Train), b.events(Split::Train));
        let c = InMemoryDataset::from_events(make_events(40, 40), SplitFractions::default(), 4)
            .unwrap();
        assert_ne!(a.events(Split::Train), c.events(Split::Train));
    }

    #[test]
    fn test_batches_cover_split_once() {
        let ds = InMemoryDataset::from_events(make_events(30, 30), SplitFractions::default(), 1)
            .unwrap();
        let iter = ds.batches(Split::Train, 8, SampleFilter::All, Some(11));
        assert_eq!(iter.num_batches(), 4);
        let batches: Vec<EventBatch> = iter.collect();
        let total: usize = batches.iter().map(|b| b.len()).sum();
        assert_eq!(total, 30);
        assert_eq!(batches.last().unwrap().len(), 6);
    }

    #[test]
    fn test_reshuffle_per_seed_and_restart() {
        let ds = InMemoryDataset::from_events(make_events(50, 50), SplitFractions::default(), 1)
            .unwrap();
        let first: Vec<EventBatch> = ds.batches(Split::Train, 10, SampleFilter::All, Some(5)).collect();
        let again: Vec<EventBatch> = ds.batches(Split::Train, 10, SampleFilter::All, Some(5)).collect();
        let other: Vec<EventBatch> = ds.batches(Split::Train, 10, SampleFilter::All, Some(6)).collect();
        assert_eq!(first, again);
        assert_ne!(first, other);
    }

    #[test]
    fn test_filter_mixed_only() {
        let ds = InMemoryDataset::from_events(make_events(20, 20), SplitFractions::default(), 1)
            .unwrap();
        for batch in ds.batches(Split::Train, 4, SampleFilter::Mixed, None) {
            assert!(batch.tags.iter().all(|t| *t == SampleTag::Mixed));
        }
        let full = ds.full(Split::Validation, SampleFilter::Reference);
        assert_eq!(full.len(), 5);
    }

    #[test]
    fn test_rejects_inconsistent_features() {
        let mut events = make_events(2, 2);
        events[3].features.push(9.0);
        let err = InMemoryDataset::from_events(events, SplitFractions::default(), 0).unwrap_err();
        assert!(err.to_string().contains("expected 2"));
    }

    #[test]
    fn test_rejects_bad_fractions() {
        let fractions = SplitFractions {
            train: 0.6,
            validation: 0.6,
            test: 0.0,
        };
        assert!(InMemoryDataset::from_events(make_events(2, 2), fractions, 0).is_err());
        assert!(InMemoryDataset::from_events(Vec::new(), SplitFractions::default(), 0).is_err());
    }

    #[test]
    fn test_select_features() {
        let ds = InMemoryDataset::from_events(make_events(4, 4), SplitFractions::default(), 0)
            .unwrap();
        let projected = ds.select_features(&[1]).unwrap();
        assert_eq!(projected.n_features(), 1);
        for e in projected.events(Split::Train) {
            let expected = if e.sample == SampleTag::Mixed { 1.0 } else { 0.0 };
            assert_eq!(e.features, vec![expected]);
        }
        assert!(ds.select_features(&[5]).is_err());
    }
}
