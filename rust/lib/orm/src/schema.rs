//! `CREATE TABLE` statements for compiled entities.

use openerp_sql::Value;

use crate::domain::quote_ident;
use crate::error::OrmError;
use crate::fields::{FieldType, OnDelete};
use crate::registry::ModelRegistry;

/// DDL for entity `name`. Virtual and unstored computed fields get no column.
///
/// Reference targets are compiled too, so they must be registered.
pub fn create_table_sql(registry: &ModelRegistry, name: &str) -> Result<String, OrmError> {
    let entity = registry.compile(name)?;
    let mut columns = Vec::new();

    for (field, def) in entity.stored_fields() {
        let Some(column_type) = def.column_type() else {
            continue;
        };
        let mut column = format!("{} {}", quote_ident(field), column_type);
        if def.primary_key {
            column.push_str(" PRIMARY KEY AUTOINCREMENT");
            columns.push(column);
            continue;
        }
        if def.required {
            column.push_str(" NOT NULL");
        }
        if def.unique {
            column.push_str(" UNIQUE");
        }
        if let Some(default) = &def.default {
            column.push_str(" DEFAULT ");
            column.push_str(&literal(&def.to_db(default)));
        }
        if def.ty == FieldType::Reference {
            let relation = def.relation.as_deref().unwrap_or_default();
            let target = registry.compile(relation)?;
            column.push_str(&format!(
                " REFERENCES {}({}) ON DELETE {}",
                quote_ident(&target.table),
                quote_ident(target.primary_key()),
                def.on_delete.unwrap_or(OnDelete::SetNull).as_sql()
            ));
        }
        columns.push(column);
    }

    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
        quote_ident(&entity.table),
        columns.join(",\n    ")
    ))
}

fn literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Real(f) => format!("{f:?}"),
        Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
        Value::Blob(b) => format!("X'{}'", b.iter().map(|byte| format!("{byte:02X}")).collect::<String>()),
    }
}
