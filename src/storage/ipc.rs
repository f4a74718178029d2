//! Arrow IPC stream sink.
//!
//! The file holds one table: the schema carries the identifier and the joined comments as
//! metadata, and every row is written as a one-row record batch followed by a flush. A
//! reader can consume the stream up to the last complete batch even if the process dies
//! before the end-of-stream marker is written.

use super::{Column, ColumnType, RowSink};
use crate::error::ScanResult;
use arrow::array::{ArrayRef, Float32Array, Float64Array, Int32Array, Int64Array, UInt64Array};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::ipc::writer::StreamWriter;
use arrow::record_batch::RecordBatch;
use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

/// Schema metadata key holding the identifier
pub const IDENTIFIER_KEY: &str = "identifier";
/// Schema metadata key holding the comments, joined with `"; "`
pub const COMMENTS_KEY: &str = "comments";

fn arrow_type(dtype: ColumnType) -> DataType {
    match dtype {
        ColumnType::Float64 => DataType::Float64,
        ColumnType::Float32 => DataType::Float32,
        ColumnType::Int64 => DataType::Int64,
        ColumnType::Int32 => DataType::Int32,
        ColumnType::UInt64 => DataType::UInt64,
    }
}

fn single_value(dtype: ColumnType, value: f64) -> ArrayRef {
    match dtype {
        ColumnType::Float64 => Arc::new(Float64Array::from(vec![value])),
        ColumnType::Float32 => Arc::new(Float32Array::from(vec![value as f32])),
        ColumnType::Int64 => Arc::new(Int64Array::from(vec![value as i64])),
        ColumnType::Int32 => Arc::new(Int32Array::from(vec![value as i32])),
        ColumnType::UInt64 => Arc::new(UInt64Array::from(vec![value as u64])),
    }
}

pub(super) struct IpcSink {
    writer: Option<StreamWriter<File>>,
    schema: SchemaRef,
    dtypes: Vec<ColumnType>,
}

impl IpcSink {
    pub(super) fn create(
        path: &Path,
        identifier: &str,
        comments: &[String],
        columns: &[Column],
    ) -> ScanResult<Self> {
        let fields: Vec<Field> = columns
            .iter()
            .map(|c| Field::new(c.name.as_str(), arrow_type(c.dtype), false))
            .collect();

        let metadata = HashMap::from([
            (IDENTIFIER_KEY.to_string(), identifier.to_string()),
            (COMMENTS_KEY.to_string(), comments.join("; ")),
        ]);
        let schema = Arc::new(Schema::new_with_metadata(fields, metadata));

        let file = File::create(path)?;
        let mut writer = StreamWriter::try_new(file, &schema)?;
        writer.flush()?;

        Ok(Self {
            writer: Some(writer),
            schema,
            dtypes: columns.iter().map(|c| c.dtype).collect(),
        })
    }
}

impl RowSink for IpcSink {
    fn append(&mut self, values: &[f64]) -> ScanResult<()> {
        let arrays: Vec<ArrayRef> = self
            .dtypes
            .iter()
            .zip(values)
            .map(|(dtype, value)| single_value(*dtype, *value))
            .collect();
        let batch = RecordBatch::try_new(self.schema.clone(), arrays)?;

        if let Some(writer) = self.writer.as_mut() {
            writer.write(&batch)?;
            writer.flush()?;
        }
        Ok(())
    }

    fn finish(&mut self) -> ScanResult<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.finish()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::ipc::reader::StreamReader;

    #[test]
    fn rows_are_readable_before_finish() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.arrow");
        let columns = vec![
            Column::new("bias", ColumnType::Float64),
            Column::new("step", ColumnType::Int32),
        ];

        let mut sink = IpcSink::create(&path, "IV_curve", &["hot".to_string()], &columns).unwrap();
        sink.append(&[-10.0, 3.0]).unwrap();

        let reader = StreamReader::try_new(File::open(&path).unwrap(), None).unwrap();
        assert_eq!(reader.schema().metadata()[IDENTIFIER_KEY], "IV_curve");
        assert_eq!(reader.schema().metadata()[COMMENTS_KEY], "hot");

        let batches: Vec<RecordBatch> = reader.take(1).map(|b| b.unwrap()).collect();
        assert_eq!(batches.len(), 1);
        let step = batches[0]
            .column(1)
            .as_any()
            .downcast_ref::<Int32Array>()
            .unwrap();
        assert_eq!(step.value(0), 3);

        sink.finish().unwrap();
    }
}
