//! Reads events from Parquet files.

use crate::types::{DatasetSummary, DecayMode, Event, SampleTag, TruthLabel};
use arrow::array::*;
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use std::path::{Path, PathBuf};

/// Static methods for reading event data from Parquet files.
pub struct EventReader;

impl EventReader {
    /// Read all events from a Parquet file.
    pub fn read_all(path: &Path) -> anyhow::Result<Vec<Event>> {
        let file = std::fs::File::open(path)
            .map_err(|e| anyhow::anyhow!("Failed to open {}: {e}", path.display()))?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;

        let mut events = Vec::new();
        for batch_result in reader {
            let batch = batch_result?;
            let mut batch_events = extract_events_from_batch(&batch)?;
            events.append(&mut batch_events);
        }

        tracing::debug!(
            count = events.len(),
            path = %path.display(),
            "Read events"
        );

        Ok(events)
    }

    /// Read events from multiple Parquet files.
    ///
    /// All files must share one feature length.
    pub fn read_multiple(paths: &[PathBuf]) -> anyhow::Result<Vec<Event>> {
        let mut all_events: Vec<Event> = Vec::new();
        for path in paths {
            let mut events = Self::read_all(path)?;
            if let (Some(first), Some(new)) = (all_events.first(), events.first()) {
                if first.features.len() != new.features.len() {
                    anyhow::bail!(
                        "{} has {} features, earlier files have {}",
                        path.display(),
                        new.features.len(),
                        first.features.len()
                    );
                }
            }
            all_events.append(&mut events);
        }
        Ok(all_events)
    }

    /// Compute summary statistics from an event Parquet file.
    pub fn read_summary(path: &Path) -> anyhow::Result<DatasetSummary> {
        let events = Self::read_all(path)?;
        Ok(DatasetSummary::from_events(&events))
    }
}

/// Extract events from a single Arrow RecordBatch.
fn extract_events_from_batch(batch: &RecordBatch) -> anyhow::Result<Vec<Event>> {
    let features = batch
        .column(0)
        .as_any()
        .downcast_ref::<ListArray>()
        .ok_or_else(|| anyhow::anyhow!("Column 0 (features) is not ListArray"))?;

    let samples = batch
        .column(1)
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| anyhow::anyhow!("Column 1 (sample) is not StringArray"))?;

    let truths = batch
        .column(2)
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| anyhow::anyhow!("Column 2 (truth) is not StringArray"))?;

    let decay_modes = batch
        .column(3)
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| anyhow::anyhow!("Column 3 (decay_mode) is not StringArray"))?;

    let mut events = Vec::with_capacity(batch.num_rows());
    for i in 0..batch.num_rows() {
        let values = features.value(i);
        let float_array = values
            .as_any()
            .downcast_ref::<Float32Array>()
            .ok_or_else(|| anyhow::anyhow!("Feature values are not Float32Array"))?;

        let sample = SampleTag::parse(samples.value(i))
            .ok_or_else(|| anyhow::anyhow!("Row {i}: unknown sample tag '{}'", samples.value(i)))?;

        let truth = if truths.is_null(i) {
            None
        } else {
            Some(TruthLabel::parse(truths.value(i)).ok_or_else(|| {
                anyhow::anyhow!("Row {i}: unknown truth label '{}'", truths.value(i))
            })?)
        };

        let decay_mode = if decay_modes.is_null(i) {
            None
        } else {
            Some(DecayMode::parse(decay_modes.value(i)).ok_or_else(|| {
                anyhow::anyhow!("Row {i}: unknown decay mode '{}'", decay_modes.value(i))
            })?)
        };

        events.push(Event {
            features: float_array.values().to_vec(),
            sample,
            truth,
            decay_mode,
        });
    }

    Ok(events)
}
