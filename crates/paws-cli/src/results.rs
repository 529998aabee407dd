//! Summary tables: aggregated rows to Parquet and JSON, plus terminal output
//! for summaries and landscapes.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use arrow::array::{ArrayRef, Float64Array, ListArray, StringArray, UInt64Array};
use arrow::datatypes::{DataType, Field, Float64Type, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use paws::aggregate::SummaryRow;
use paws::landscape::Landscape;

/// Prefix of the per-metric columns in the summary Parquet file.
pub const METRIC_COLUMN_PREFIX: &str = "metric_";

/// Every metric name appearing in any row, sorted.
fn metric_names(rows: &[SummaryRow]) -> Vec<String> {
    rows.iter()
        .flat_map(|r| r.metrics.keys().cloned())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Arrow schema for a summary table with the given metric columns.
pub fn summary_schema(metrics: &[String]) -> Schema {
    let mut fields = vec![
        Field::new("group_key", DataType::Utf8, false),
        Field::new("mode", DataType::Utf8, false),
        Field::new("coordinate", DataType::Utf8, false),
        Field::new("n_runs", DataType::UInt64, false),
        Field::new("n_kept", DataType::UInt64, false),
        Field::new("n_failed", DataType::UInt64, false),
        Field::new("n_degraded", DataType::UInt64, false),
        Field::new("best_validation_loss", DataType::Float64, true),
        Field::new(
            "masses",
            DataType::List(Arc::new(Field::new("item", DataType::Float64, true))),
            true,
        ),
        Field::new("mu", DataType::Float64, true),
        Field::new("alpha", DataType::Float64, true),
    ];
    fields.extend(
        metrics
            .iter()
            .map(|m| Field::new(format!("{METRIC_COLUMN_PREFIX}{m}"), DataType::Float64, true)),
    );
    Schema::new(fields)
}

/// Write summary rows to a Parquet file, one metric column per metric name.
pub fn write_summary_parquet(rows: &[SummaryRow], path: &Path) -> anyhow::Result<()> {
    let metrics = metric_names(rows);
    let schema = Arc::new(summary_schema(&metrics));

    let count = |f: fn(&SummaryRow) -> usize| -> ArrayRef {
        Arc::new(UInt64Array::from(
            rows.iter().map(|r| f(r) as u64).collect::<Vec<_>>(),
        ))
    };
    let coordinates = rows
        .iter()
        .map(|r| serde_json::to_string(&r.coordinate))
        .collect::<Result<Vec<_>, _>>()?;

    let mut columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from(
            rows.iter().map(|r| r.group_key.clone()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            rows.iter().map(|r| r.mode.to_string()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(coordinates)),
        count(|r| r.n_runs),
        count(|r| r.n_kept),
        count(|r| r.n_failed),
        count(|r| r.n_degraded),
        Arc::new(Float64Array::from(
            rows.iter().map(|r| r.best_validation_loss).collect::<Vec<_>>(),
        )),
        Arc::new(ListArray::from_iter_primitive::<Float64Type, _, _>(
            rows.iter().map(|r| {
                r.parameters
                    .as_ref()
                    .map(|p| p.masses.iter().map(|&m| Some(m)).collect::<Vec<_>>())
            }),
        )),
        Arc::new(Float64Array::from(
            rows.iter()
                .map(|r| r.parameters.as_ref().map(|p| p.mu))
                .collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(
            rows.iter()
                .map(|r| r.parameters.as_ref().and_then(|p| p.alpha))
                .collect::<Vec<_>>(),
        )),
    ];
    for name in &metrics {
        columns.push(Arc::new(Float64Array::from(
            rows.iter()
                .map(|r| r.metrics.get(name).copied().flatten())
                .collect::<Vec<_>>(),
        )));
    }

    let batch = RecordBatch::try_new(schema.clone(), columns)?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let file = std::fs::File::create(path)
        .map_err(|e| anyhow::anyhow!("Failed to create {}: {e}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, schema, None)?;
    writer.write(&batch)?;
    writer.close()?;

    tracing::info!(rows = rows.len(), path = %path.display(), "Wrote summary Parquet file");
    Ok(())
}

/// Write summary rows as a pretty-printed JSON array.
pub fn write_summary_json(rows: &[SummaryRow], path: &Path) -> anyhow::Result<()> {
    let file = std::fs::File::create(path)
        .map_err(|e| anyhow::anyhow!("Failed to create {}: {e}", path.display()))?;
    serde_json::to_writer_pretty(std::io::BufWriter::new(file), rows)?;
    tracing::info!(rows = rows.len(), path = %path.display(), "Wrote summary JSON");
    Ok(())
}

pub fn read_summary_json(path: &Path) -> anyhow::Result<Vec<SummaryRow>> {
    let file = std::fs::File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open {}: {e}", path.display()))?;
    Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
}

fn format_coordinate(coordinate: &std::collections::BTreeMap<String, f64>) -> String {
    if coordinate.is_empty() {
        return "-".to_string();
    }
    coordinate
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

fn format_value(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{v:.4}"))
}

/// Print one line per summary row.
pub fn print_summary_rows(rows: &[SummaryRow]) {
    let metrics = metric_names(rows);
    println!("--- Run Summary ---");
    for row in rows {
        let params = row.parameters.as_ref().map_or_else(
            || "no successful runs".to_string(),
            |p| {
                let masses = p
                    .masses
                    .iter()
                    .map(|m| format!("{m:.1}"))
                    .collect::<Vec<_>>()
                    .join("/");
                match p.alpha {
                    Some(a) => format!("m={masses} mu={:.5} alpha={a:.3}", p.mu),
                    None => format!("m={masses} mu={:.5}", p.mu),
                }
            },
        );
        let scores = metrics
            .iter()
            .map(|m| format!("{m}={}", format_value(row.metrics.get(m).copied().flatten())))
            .collect::<Vec<_>>()
            .join(" ");
        println!(
            "{} [{}] {}: kept {}/{} (failed {}, degraded {}) {params} {scores}",
            row.mode,
            format_coordinate(&row.coordinate),
            row.group_key,
            row.n_kept,
            row.n_runs,
            row.n_failed,
            row.n_degraded,
        );
    }
}

/// Print a landscape point by point, marking the best one.
pub fn print_landscape(landscape: &Landscape) {
    let best = landscape.best().map(|p| &p.coordinate);
    println!("--- Landscape ---");
    println!("Grid: {}", landscape.grid);
    println!(
        "Metric: {} ({}, reduce {})",
        landscape.metric,
        if landscape.higher_is_better { "higher is better" } else { "lower is better" },
        landscape.reduce
    );
    for point in &landscape.points {
        let marker = if Some(&point.coordinate) == best { "*" } else { " " };
        let spread = point
            .bootstrap_std
            .map(|s| format!(" ± {s:.4}"))
            .unwrap_or_default();
        println!(
            "{marker} {:<32} {}{spread} (failures {})",
            format_coordinate(&point.coordinate),
            format_value(point.aggregated),
            point.failure_count
        );
    }
    println!("Total failures: {}", landscape.total_failures());
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Array;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use paws::{ParameterEstimates, TrainingMode};
    use std::collections::BTreeMap;

    fn rows() -> Vec<SummaryRow> {
        vec![
            SummaryRow {
                group_key: "scan-semi_weakly-m1=300".into(),
                mode: TrainingMode::SemiWeakly,
                coordinate: BTreeMap::from([("m1".to_string(), 300.0)]),
                n_runs: 3,
                n_kept: 2,
                n_failed: 1,
                n_degraded: 0,
                best_validation_loss: Some(0.5),
                metrics: BTreeMap::from([("auc".to_string(), Some(0.75))]),
                parameters: Some(ParameterEstimates {
                    masses: vec![300.0, 250.0],
                    mu: 0.25,
                    alpha: Some(0.5),
                }),
            },
            SummaryRow {
                group_key: "scan-semi_weakly-m1=400".into(),
                mode: TrainingMode::SemiWeakly,
                coordinate: BTreeMap::from([("m1".to_string(), 400.0)]),
                n_runs: 1,
                n_kept: 0,
                n_failed: 1,
                n_degraded: 0,
                best_validation_loss: None,
                metrics: BTreeMap::from([
                    ("auc".to_string(), None),
                    ("loss".to_string(), None),
                ]),
                parameters: None,
            },
        ]
    }

    #[test]
    fn test_metric_columns_union() {
        assert_eq!(metric_names(&rows()), vec!["auc".to_string(), "loss".to_string()]);
        let schema = summary_schema(&metric_names(&rows()));
        assert!(schema.field_with_name("metric_auc").is_ok());
        assert!(schema.field_with_name("metric_loss").is_ok());
    }

    #[test]
    fn test_write_summary_parquet() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("out").join("summary.parquet");
        write_summary_parquet(&rows(), &path).unwrap();

        let file = std::fs::File::open(&path).unwrap();
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)
            .unwrap()
            .build()
            .unwrap();
        let batches: Vec<RecordBatch> = reader.map(|b| b.unwrap()).collect();
        let total: usize = batches.iter().map(|b| b.num_rows()).sum();
        assert_eq!(total, 2);

        let batch = &batches[0];
        let auc = batch
            .column_by_name("metric_auc")
            .unwrap()
            .as_any()
            .downcast_ref::<Float64Array>()
            .unwrap();
        assert_eq!(auc.value(0), 0.75);
        assert!(auc.is_null(1));

        let mu = batch
            .column_by_name("mu")
            .unwrap()
            .as_any()
            .downcast_ref::<Float64Array>()
            .unwrap();
        assert_eq!(mu.value(0), 0.25);
        assert!(mu.is_null(1));

        let masses = batch
            .column_by_name("masses")
            .unwrap()
            .as_any()
            .downcast_ref::<ListArray>()
            .unwrap();
        assert_eq!(masses.value_length(0), 2);
        assert!(masses.is_null(1));
    }

    #[test]
    fn test_summary_json_roundtrip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("summary.json");
        write_summary_json(&rows(), &path).unwrap();
        assert_eq!(read_summary_json(&path).unwrap(), rows());
    }

    #[test]
    fn test_empty_summary_parquet() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("empty.parquet");
        write_summary_parquet(&[], &path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_format_helpers() {
        assert_eq!(format_coordinate(&BTreeMap::new()), "-");
        let c = BTreeMap::from([("m1".to_string(), 300.0), ("mu".to_string(), 0.01)]);
        assert_eq!(format_coordinate(&c), "m1=300,mu=0.01");
        assert_eq!(format_value(None), "n/a");
        assert_eq!(format_value(Some(0.5)), "0.5000");
    }
}
