//! Delimited text with a JSON metadata sidecar.

use serde_json::Value;

use super::{ExportData, ExportError, ExportFile, ExportFormat, ExportWriter};

#[derive(Debug, Clone)]
pub struct CsvWriter {
    pub delimiter: char,
    /// Written for SQL NULL.
    pub null_value: String,
}

impl Default for CsvWriter {
    fn default() -> Self {
        Self {
            delimiter: ',',
            null_value: String::new(),
        }
    }
}

impl CsvWriter {
    fn field(&self, value: &Value) -> String {
        let text = match value {
            Value::Null => self.null_value.clone(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            Value::String(s) => s.clone(),
            // Geometry and JSON columns travel as compact JSON.
            Value::Array(_) | Value::Object(_) => value.to_string(),
        };
        self.escape(&text)
    }

    /// RFC 4180 quoting.
    fn escape(&self, field: &str) -> String {
        let needs_quoting = field.contains(self.delimiter)
            || field.contains('"')
            || field.contains('\n')
            || field.contains('\r');
        if needs_quoting {
            format!("\"{}\"", field.replace('"', "\"\""))
        } else {
            field.to_string()
        }
    }

    fn line(&self, fields: Vec<String>) -> String {
        let mut line = fields.join(&self.delimiter.to_string());
        line.push('\n');
        line
    }
}

impl ExportWriter for CsvWriter {
    fn format(&self) -> ExportFormat {
        ExportFormat::Csv
    }

    fn write(&self, data: &ExportData<'_>) -> Result<Vec<ExportFile>, ExportError> {
        let columns = &data.metadata.columns;
        let mut out = self.line(columns.iter().map(|c| self.escape(c)).collect());
        for (_, row) in data.rows {
            out.push_str(&self.line(
                columns
                    .iter()
                    .map(|c| self.field(row.get(c).unwrap_or(&Value::Null)))
                    .collect(),
            ));
        }

        let table = &data.metadata.table;
        let sidecar = serde_json::to_vec_pretty(data.metadata)?;
        Ok(vec![
            ExportFile::new(format!("{}.csv", table), "text/csv", out.into_bytes()),
            ExportFile::new(
                format!("{}.metadata.json", table),
                "application/json",
                sidecar,
            ),
        ])
    }
}
