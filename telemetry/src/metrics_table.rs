use std::sync::Arc;

use anyhow::{Context, Result};
use arrow::array::{
    ArrayBuilder, Float32Array, Float32Builder, Int32Array, Int32Builder, StringArray,
    StringBuilder, TimestampMicrosecondArray, TimestampMicrosecondBuilder,
};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};

/// Returns the fixed schema for the host metrics table.
///
/// The encoder and the decoder must agree on this schema exactly; a buffer
/// carrying anything else is rejected rather than coerced.
pub fn metrics_table_schema() -> Schema {
    Schema::new(vec![
        Field::new("device", DataType::Utf8, false),
        Field::new(
            "ts",
            DataType::Timestamp(TimeUnit::Microsecond, None),
            false,
        ),
        Field::new("cpu_used", DataType::Float32, false),
        Field::new("cpu_free", DataType::Float32, false),
        Field::new("memory_used", DataType::Float32, false),
        Field::new("memory_free", DataType::Float32, false),
        Field::new("run_elapsed_ms", DataType::Int32, false),
    ])
}

/// One timestamped host metrics observation.
///
/// Percentages are passed through as sampled; this type does not validate
/// ranges.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub device: String,
    pub ts: DateTime<Utc>,
    pub cpu_used: f32,
    pub cpu_free: f32,
    pub memory_used: f32,
    pub memory_free: f32,
    pub run_elapsed_ms: i32,
}

/// A builder for creating a `RecordBatch` of metric samples.
pub struct MetricsRecordBuilder {
    devices: StringBuilder,
    times: TimestampMicrosecondBuilder,
    cpu_used: Float32Builder,
    cpu_free: Float32Builder,
    memory_used: Float32Builder,
    memory_free: Float32Builder,
    run_elapsed_ms: Int32Builder,
}

impl MetricsRecordBuilder {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            devices: StringBuilder::with_capacity(capacity, capacity * 16),
            times: TimestampMicrosecondBuilder::with_capacity(capacity),
            cpu_used: Float32Builder::with_capacity(capacity),
            cpu_free: Float32Builder::with_capacity(capacity),
            memory_used: Float32Builder::with_capacity(capacity),
            memory_free: Float32Builder::with_capacity(capacity),
            run_elapsed_ms: Int32Builder::with_capacity(capacity),
        }
    }

    pub fn append(&mut self, sample: &MetricSample) {
        self.devices.append_value(&sample.device);
        self.times.append_value(sample.ts.timestamp_micros());
        self.cpu_used.append_value(sample.cpu_used);
        self.cpu_free.append_value(sample.cpu_free);
        self.memory_used.append_value(sample.memory_used);
        self.memory_free.append_value(sample.memory_free);
        self.run_elapsed_ms.append_value(sample.run_elapsed_ms);
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn finish(mut self) -> Result<RecordBatch> {
        RecordBatch::try_new(
            Arc::new(metrics_table_schema()),
            vec![
                Arc::new(self.devices.finish()),
                Arc::new(self.times.finish()),
                Arc::new(self.cpu_used.finish()),
                Arc::new(self.cpu_free.finish()),
                Arc::new(self.memory_used.finish()),
                Arc::new(self.memory_free.finish()),
                Arc::new(self.run_elapsed_ms.finish()),
            ],
        )
        .with_context(|| "building metrics record batch")
    }
}

/// Builds a `RecordBatch` from a slice of samples.
pub fn samples_to_batch(samples: &[MetricSample]) -> Result<RecordBatch> {
    let mut builder = MetricsRecordBuilder::with_capacity(samples.len());
    for sample in samples {
        builder.append(sample);
    }
    builder.finish()
}

fn typed_column_by_name<'a, T: core::any::Any>(
    rc: &'a RecordBatch,
    column_name: &str,
) -> Result<&'a T> {
    let column = rc
        .column_by_name(column_name)
        .with_context(|| format!("getting column {column_name}"))?;
    column
        .as_any()
        .downcast_ref::<T>()
        .with_context(|| format!("casting {column_name}: {:?}", column.data_type()))
}

/// Extracts the rows of a metrics batch.
///
/// Used by the sink when binding insert parameters and by tests comparing
/// round-tripped batches.
pub fn samples_from_batch(rc: &RecordBatch) -> Result<Vec<MetricSample>> {
    let devices: &StringArray = typed_column_by_name(rc, "device")?;
    let times: &TimestampMicrosecondArray = typed_column_by_name(rc, "ts")?;
    let cpu_used: &Float32Array = typed_column_by_name(rc, "cpu_used")?;
    let cpu_free: &Float32Array = typed_column_by_name(rc, "cpu_free")?;
    let memory_used: &Float32Array = typed_column_by_name(rc, "memory_used")?;
    let memory_free: &Float32Array = typed_column_by_name(rc, "memory_free")?;
    let run_elapsed_ms: &Int32Array = typed_column_by_name(rc, "run_elapsed_ms")?;
    let mut samples = Vec::with_capacity(rc.num_rows());
    for i in 0..rc.num_rows() {
        samples.push(MetricSample {
            device: devices.value(i).to_owned(),
            ts: DateTime::from_timestamp_micros(times.value(i))
                .with_context(|| format!("timestamp out of range in row {i}"))?,
            cpu_used: cpu_used.value(i),
            cpu_free: cpu_free.value(i),
            memory_used: memory_used.value(i),
            memory_free: memory_free.value(i),
            run_elapsed_ms: run_elapsed_ms.value(i),
        });
    }
    Ok(samples)
}

/// Fixed-value samples for tests.
#[cfg(test)]
pub(crate) fn test_samples(n: usize) -> Vec<MetricSample> {
    (0..n)
        .map(|i| MetricSample {
            device: "localhost".to_owned(),
            ts: DateTime::from_timestamp_micros(1_700_000_000_000_000 + i as i64)
                .expect("timestamp in range"),
            cpu_used: 12.5,
            cpu_free: 87.5,
            memory_used: 42.0,
            memory_free: 58.0,
            run_elapsed_ms: i as i32,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_has_one_column_per_field_and_declared_row_count() {
        let batch = samples_to_batch(&test_samples(7)).unwrap();
        assert_eq!(batch.num_rows(), 7);
        assert_eq!(batch.num_columns(), metrics_table_schema().fields().len());
        for column in batch.columns() {
            assert_eq!(column.len(), 7);
        }
    }

    #[test]
    fn rows_survive_columnar_conversion() {
        let samples = test_samples(5);
        let batch = samples_to_batch(&samples).unwrap();
        assert_eq!(samples_from_batch(&batch).unwrap(), samples);
    }

    #[test]
    fn empty_batch_is_valid() {
        let batch = samples_to_batch(&[]).unwrap();
        assert_eq!(batch.num_rows(), 0);
        assert_eq!(batch.schema().fields(), metrics_table_schema().fields());
    }
}
