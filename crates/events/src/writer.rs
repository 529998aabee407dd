//! Writes events to Parquet files using Arrow.

use crate::types::Event;
use arrow::array::*;
use arrow::buffer::OffsetBuffer;
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use std::path::PathBuf;
use std::sync::Arc;

/// Arrow schema for event Parquet files (4 columns).
pub fn event_schema() -> Schema {
    Schema::new(vec![
        Field::new(
            "features",
            DataType::List(Arc::new(Field::new("item", DataType::Float32, false))),
            false,
        ),
        Field::new("sample", DataType::Utf8, false),
        Field::new("truth", DataType::Utf8, true),
        Field::new("decay_mode", DataType::Utf8, true),
    ])
}

/// Buffers events and writes them to a Parquet file.
pub struct EventWriter {
    events: Vec<Event>,
    output_path: PathBuf,
}

impl EventWriter {
    /// Create a new writer that will write to the given path.
    pub fn new(output_path: PathBuf) -> Self {
        Self {
            events: Vec::new(),
            output_path,
        }
    }

    /// Buffer a single event.
    pub fn record(&mut self, event: Event) {
        self.events.push(event);
    }

    /// Buffer multiple events.
    pub fn record_all(&mut self, events: Vec<Event>) {
        self.events.extend(events);
    }

    /// Number of buffered events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Write all buffered events to the Parquet file and return the output path.
    ///
    /// Fails if the buffered events do not share one feature length.
    pub fn finish(self) -> anyhow::Result<PathBuf> {
        let schema = Arc::new(event_schema());

        let batch = if self.events.is_empty() {
            RecordBatch::new_empty(schema.clone())
        } else {
            build_record_batch(&self.events)?
        };

        if let Some(parent) = self.output_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = std::fs::File::create(&self.output_path)?;
        let mut writer = ArrowWriter::try_new(file, schema, None)?;
        writer.write(&batch)?;
        writer.close()?;

        tracing::info!(
            events = self.events.len(),
            path = %self.output_path.display(),
            "Wrote event Parquet file"
        );

        Ok(self.output_path)
    }
}

/// Build an Arrow RecordBatch from events.
fn build_record_batch(events: &[Event]) -> anyhow::Result<RecordBatch> {
    let schema = Arc::new(event_schema());
    let n_features = events[0].features.len();

    let mut all_values = Vec::with_capacity(events.len() * n_features);
    let mut offsets = vec![0i32];
    for (i, event) in events.iter().enumerate() {
        if event.features.len() != n_features {
            anyhow::bail!(
                "Event {i} has {} features, expected {n_features}",
                event.features.len()
            );
        }
        all_values.extend_from_slice(&event.features);
        offsets.push(all_values.len() as i32);
    }
    let features = ListArray::new(
        Arc::new(Field::new("item", DataType::Float32, false)),
        OffsetBuffer::new(offsets.into()),
        Arc::new(Float32Array::from(all_values)),
        None,
    );

    let samples: StringArray = events.iter().map(|e| Some(e.sample.to_string())).collect();
    let truths: StringArray = events
        .iter()
        .map(|e| e.truth.map(|t| t.to_string()))
        .collect();
    let decay_modes: StringArray = events
        .iter()
        .map(|e| e.decay_mode.map(|m| m.to_string()))
        .collect();

    let columns: Vec<Arc<dyn arrow::array::Array>> = vec![
        Arc::new(features),
        Arc::new(samples),
        Arc::new(truths),
        Arc::new(decay_modes),
    ];

    Ok(RecordBatch::try_new(schema, columns)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SampleTag;
    use tempfile::TempDir;

    #[test]
    fn test_event_schema_has_4_columns() {
        let schema = event_schema();
        assert_eq!(schema.fields().len(), 4);
        assert_eq!(schema.field(0).name(), "features");
        assert_eq!(schema.field(1).name(), "sample");
        assert!(!schema.field(1).is_nullable());
        assert!(schema.field(2).is_nullable());
        assert!(schema.field(3).is_nullable());
    }

    #[test]
    fn test_write_empty_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("empty.parquet");
        let writer = EventWriter::new(path.clone());
        assert!(writer.is_empty());
        let result = writer.finish().unwrap();
        assert_eq!(result, path);
        assert!(path.exists());
    }

    #[test]
    fn test_write_creates_parent_dirs() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("events.parquet");
        let mut writer = EventWriter::new(path.clone());
        for i in 0..10 {
            writer.record(Event::unlabeled(vec![i as f32; 3], SampleTag::Mixed));
        }
        assert_eq!(writer.len(), 10);
        let result = writer.finish().unwrap();
        assert!(std::fs::metadata(&result).unwrap().len() > 0);
    }

    #[test]
    fn test_write_rejects_ragged_features() {
        let tmp = TempDir::new().unwrap();
        let mut writer = EventWriter::new(tmp.path().join("ragged.parquet"));
        writer.record(Event::unlabeled(vec![1.0, 2.0], SampleTag::Reference));
        writer.record(Event::unlabeled(vec![1.0], SampleTag::Reference));
        let err = writer.finish().unwrap_err();
        assert!(err.to_string().contains("expected 2"));
    }
}
