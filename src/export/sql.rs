//! Self-contained SQL scripts: DDL and inserts for the data table plus an
//! `export_metadata` table, rendered for SQLite.

use sea_query::{Alias, ColumnDef, Index, Query, SimpleExpr, SqliteQueryBuilder, Table};
use serde_json::Value;

use super::{ExportData, ExportError, ExportFile, ExportFormat, ExportMetadata, ExportWriter};
use crate::schema::{SemanticType, TableDescriptor};

pub const METADATA_TABLE: &str = "export_metadata";

#[derive(Debug, Clone)]
pub struct SqlWriter {
    /// Rows per `INSERT` statement.
    pub chunk_size: usize,
}

impl Default for SqlWriter {
    fn default() -> Self {
        Self { chunk_size: 500 }
    }
}

fn sql_value(value: &Value) -> SimpleExpr {
    let value = match value {
        Value::Null => sea_query::Value::String(None),
        Value::Bool(b) => sea_query::Value::from(*b),
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => sea_query::Value::from(i),
            (None, Some(f)) => sea_query::Value::from(f),
            (None, None) => sea_query::Value::from(n.to_string()),
        },
        Value::String(s) => sea_query::Value::from(s.clone()),
        Value::Array(_) | Value::Object(_) => sea_query::Value::from(value.to_string()),
    };
    SimpleExpr::Value(value)
}

fn create_data_table(descriptor: &TableDescriptor, columns: &[String]) -> String {
    let mut create = Table::create();
    create
        .table(Alias::new(descriptor.target_name.as_str()))
        .if_not_exists();
    for name in columns {
        let mut def = ColumnDef::new(Alias::new(name.as_str()));
        let column = descriptor.column(name);
        match column.map(|c| c.semantic_type) {
            Some(SemanticType::Int) => def.big_integer(),
            Some(SemanticType::Float) => def.double(),
            Some(SemanticType::Bool) => def.boolean(),
            _ => def.text(),
        };
        if column.is_some_and(|c| !c.nullable) {
            def.not_null();
        }
        create.col(def);
    }
    if descriptor.primary_key.iter().all(|k| columns.contains(k)) {
        let mut pk = Index::create();
        for key in &descriptor.primary_key {
            pk.col(Alias::new(key.as_str()));
        }
        create.primary_key(&mut pk);
    }
    create.to_string(SqliteQueryBuilder)
}

fn metadata_rows(metadata: &ExportMetadata) -> Result<Vec<(&'static str, String)>, ExportError> {
    Ok(vec![
        ("exported_at", metadata.exported_at.to_rfc3339()),
        ("table", metadata.table.clone()),
        ("source_table", metadata.source_table.clone()),
        ("target_table", metadata.target_table.clone()),
        ("record_count", metadata.record_count.to_string()),
        ("columns", serde_json::to_string(&metadata.columns)?),
        ("filter", serde_json::to_string(&metadata.filter)?),
        ("schema_version", metadata.schema_version.clone()),
        ("store_version", metadata.store_version.to_string()),
    ])
}

impl ExportWriter for SqlWriter {
    fn format(&self) -> ExportFormat {
        ExportFormat::Sql
    }

    fn write(&self, data: &ExportData<'_>) -> Result<Vec<ExportFile>, ExportError> {
        let metadata = data.metadata;
        let columns = &metadata.columns;
        let mut statements = vec![create_data_table(data.descriptor, columns)];

        for chunk in data.rows.chunks(self.chunk_size.max(1)) {
            let mut insert = Query::insert();
            insert
                .into_table(Alias::new(data.descriptor.target_name.as_str()))
                .columns(columns.iter().map(|c| Alias::new(c.as_str())));
            for (_, row) in chunk {
                insert.values_panic(columns.iter().map(|c| sql_value(row.get(c).unwrap_or(&Value::Null))));
            }
            statements.push(insert.to_string(SqliteQueryBuilder));
        }

        statements.push(
            Table::create()
                .table(Alias::new(METADATA_TABLE))
                .if_not_exists()
                .col(ColumnDef::new(Alias::new("field")).text().not_null().primary_key())
                .col(ColumnDef::new(Alias::new("value")).text().not_null())
                .to_string(SqliteQueryBuilder),
        );
        let mut insert = Query::insert();
        insert
            .into_table(Alias::new(METADATA_TABLE))
            .columns([Alias::new("field"), Alias::new("value")]);
        for (field, value) in metadata_rows(metadata)? {
            insert.values_panic([field.into(), value.into()]);
        }
        statements.push(insert.to_string(SqliteQueryBuilder));

        let mut script = String::from("BEGIN TRANSACTION;\n");
        for statement in statements {
            script.push_str(&statement);
            script.push_str(";\n");
        }
        script.push_str("COMMIT;\n");

        Ok(vec![ExportFile::new(
            format!("{}.sql", metadata.table),
            "application/sql",
            script.into_bytes(),
        )])
    }
}
