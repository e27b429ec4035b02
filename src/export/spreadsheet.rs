//! SpreadsheetML 2003 workbooks: one data worksheet and a metadata worksheet.

use std::fmt::Write as _;

use serde_json::Value;

use super::{ExportData, ExportError, ExportFile, ExportFormat, ExportWriter};

/// Excel rejects longer worksheet names.
const MAX_SHEET_NAME: usize = 31;

#[derive(Debug, Clone, Copy, Default)]
pub struct SpreadsheetWriter;

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\n' => out.push_str("&#10;"),
            c => out.push(c),
        }
    }
    out
}

fn cell(value: &Value) -> String {
    let (kind, text) = match value {
        Value::Null => return "<Cell/>".to_string(),
        Value::Number(n) => ("Number", n.to_string()),
        Value::Bool(b) => ("Boolean", if *b { "1" } else { "0" }.to_string()),
        Value::String(s) => ("String", s.clone()),
        Value::Array(_) | Value::Object(_) => ("String", value.to_string()),
    };
    format!("<Cell><Data ss:Type=\"{}\">{}</Data></Cell>", kind, escape(&text))
}

fn row<'a>(out: &mut String, cells: impl IntoIterator<Item = &'a Value>) {
    out.push_str("<Row>");
    for value in cells {
        out.push_str(&cell(value));
    }
    out.push_str("</Row>\n");
}

fn sheet_name(table: &str) -> String {
    let name: String = table
        .chars()
        .map(|c| if "[]:*?/\\".contains(c) { '_' } else { c })
        .take(MAX_SHEET_NAME)
        .collect();
    if name == "metadata" {
        "data".to_string()
    } else {
        name
    }
}

impl ExportWriter for SpreadsheetWriter {
    fn format(&self) -> ExportFormat {
        ExportFormat::Spreadsheet
    }

    fn write(&self, data: &ExportData<'_>) -> Result<Vec<ExportFile>, ExportError> {
        let metadata = data.metadata;
        let columns = &metadata.columns;
        let mut out = String::from(concat!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n",
            "<?mso-application progid=\"Excel.Sheet\"?>\n",
            "<Workbook xmlns=\"urn:schemas-microsoft-com:office:spreadsheet\" ",
            "xmlns:ss=\"urn:schemas-microsoft-com:office:spreadsheet\">\n",
        ));

        let _ = writeln!(
            out,
            "<Worksheet ss:Name=\"{}\"><Table>",
            escape(&sheet_name(&metadata.table))
        );
        let header: Vec<Value> = columns.iter().map(|c| Value::from(c.as_str())).collect();
        row(&mut out, &header);
        for (_, record) in data.rows {
            let values: Vec<&Value> = columns
                .iter()
                .map(|c| record.get(c).unwrap_or(&Value::Null))
                .collect();
            row(&mut out, values);
        }
        out.push_str("</Table></Worksheet>\n");

        out.push_str("<Worksheet ss:Name=\"metadata\"><Table>\n");
        let entries = [
            ("exported_at", Value::from(metadata.exported_at.to_rfc3339())),
            ("table", Value::from(metadata.table.as_str())),
            ("source_table", Value::from(metadata.source_table.as_str())),
            ("target_table", Value::from(metadata.target_table.as_str())),
            ("record_count", Value::from(metadata.record_count)),
            ("columns", Value::from(columns.join(","))),
            ("filter", Value::from(serde_json::to_string(&metadata.filter)?)),
            ("schema_version", Value::from(metadata.schema_version.as_str())),
            ("store_version", Value::from(metadata.store_version)),
        ];
        for (field, value) in &entries {
            row(&mut out, [&Value::from(*field), value]);
        }
        out.push_str("</Table></Worksheet>\n</Workbook>\n");

        Ok(vec![ExportFile::new(
            format!("{}.xml", metadata.table),
            "application/vnd.ms-excel",
            out.into_bytes(),
        )])
    }
}
