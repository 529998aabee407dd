//! Event datasets for weak-supervision training.
//!
//! Provides the event and batch types, deterministic train / validation /
//! test partitions with lazy batch iteration, Parquet reading and writing,
//! and synthetic generators for signal-injection and labelled datasets.

pub mod provider;
pub mod reader;
pub mod synthetic;
pub mod types;
pub mod writer;

pub use provider::{BatchIter, DatasetProvider, InMemoryDataset, SplitFractions};
pub use reader::EventReader;
pub use synthetic::SyntheticConfig;
pub use types::{
    DatasetSummary, DecayMode, Event, EventBatch, LabeledEvent, SampleFilter, SampleTag, Split,
    TruthLabel,
};
pub use writer::EventWriter;
