//! Structured JSON with a metadata envelope.

use serde_json::{json, Map, Value};

use super::{ExportData, ExportError, ExportFile, ExportFormat, ExportWriter};
use crate::model::Row;

#[derive(Debug, Clone)]
pub struct JsonWriter {
    pub pretty: bool,
}

impl Default for JsonWriter {
    fn default() -> Self {
        Self { pretty: true }
    }
}

/// `row` restricted to `columns`; absent columns become null.
pub(crate) fn project(row: &Row, columns: &[String]) -> Map<String, Value> {
    columns
        .iter()
        .map(|c| (c.clone(), row.get(c).cloned().unwrap_or(Value::Null)))
        .collect()
}

impl ExportWriter for JsonWriter {
    fn format(&self) -> ExportFormat {
        ExportFormat::Json
    }

    fn write(&self, data: &ExportData<'_>) -> Result<Vec<ExportFile>, ExportError> {
        let columns = &data.metadata.columns;
        let records: Vec<Value> = data
            .rows
            .iter()
            .map(|(_, row)| Value::Object(project(row, columns)))
            .collect();
        let document = json!({
            "metadata": data.metadata,
            "records": records,
        });
        let bytes = if self.pretty {
            serde_json::to_vec_pretty(&document)?
        } else {
            serde_json::to_vec(&document)?
        };
        Ok(vec![ExportFile::new(
            format!("{}.json", data.metadata.table),
            "application/json",
            bytes,
        )])
    }
}
