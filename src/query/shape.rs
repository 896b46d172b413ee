//! Stable column names for metadata statements.
//!
//! `SHOW TABLES` names its column `Tables_in_<db>` and `DESCRIBE` uses
//! `Field`/`Type`. Callers get `table_name`/`database` and
//! `column_name`/`data_type` added alongside the driver's columns.

use crate::db::{ColumnInfo, QueryResult, Value};
use crate::safety::{Category, ParsedStatement};

const TABLES_PREFIX: &str = "Tables_in_";

/// Adds normalized columns to metadata results. Other results pass through.
pub fn shape_result(stmt: &ParsedStatement, result: &mut QueryResult) {
    if stmt.category != Category::Metadata {
        return;
    }

    let verb = stmt.operation.split_whitespace().next().unwrap_or("");
    match verb {
        "SHOW" => {
            add_table_columns(result);
            // SHOW [FULL] COLUMNS uses the DESCRIBE layout.
            add_field_columns(result);
        }
        "DESC" | "DESCRIBE" => add_field_columns(result),
        _ => {}
    }
}

fn add_table_columns(result: &mut QueryResult) {
    let Some((index, database)) = result.columns.iter().enumerate().find_map(|(i, c)| {
        let prefix = c.name.get(..TABLES_PREFIX.len())?;
        prefix
            .eq_ignore_ascii_case(TABLES_PREFIX)
            .then(|| (i, c.name[TABLES_PREFIX.len()..].to_string()))
    }) else {
        return;
    };
    if result.column_index("table_name").is_some() {
        return;
    }

    let data_type = result.columns[index].data_type.clone();
    result.push_column(ColumnInfo::new("table_name", data_type), |row| {
        row.get(index).cloned().unwrap_or_default()
    });
    result.push_column(ColumnInfo::new("database", "VARCHAR"), |_| {
        Value::from(database.as_str())
    });
}

fn add_field_columns(result: &mut QueryResult) {
    let (Some(field), Some(kind)) = (result.column_index("Field"), result.column_index("Type"))
    else {
        return;
    };
    if result.column_index("column_name").is_some() {
        return;
    }

    result.push_column(ColumnInfo::new("column_name", "VARCHAR"), |row| {
        row.get(field).cloned().unwrap_or_default()
    });
    result.push_column(ColumnInfo::new("data_type", "VARCHAR"), |row| {
        row.get(kind).cloned().unwrap_or_default()
    });
}
