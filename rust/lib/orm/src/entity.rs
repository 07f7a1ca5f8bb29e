//! Entity declarations (base definitions and extensions) and the compiled
//! entity produced by the registry.

use std::fmt;

use indexmap::IndexMap;
use openerp_sql::Row;
use serde::{Deserialize, Serialize};

use crate::fields::{FieldDefinition, RecordData, sql_to_json};
use crate::method::{MethodChain, MethodFn};

/// Auto-numbering policy: fill `field` from sequence `code` on create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequencePolicy {
    pub field: String,
    pub code: String,
}

/// Base declaration of an entity.
#[derive(Clone, Serialize, Deserialize)]
pub struct EntityDefinition {
    /// Dotted, unique name (e.g. `sale.order`).
    pub name: String,

    /// Table name. Derived from `name` when empty.
    #[serde(default)]
    pub table: String,

    #[serde(default)]
    pub fields: IndexMap<String, FieldDefinition>,

    #[serde(default = "default_order")]
    pub default_order: String,

    /// Field used as display name of references. Defaults to `name` when
    /// the entity has such a field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rec_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<SequencePolicy>,

    #[serde(skip)]
    pub methods: IndexMap<String, MethodFn>,
}

fn default_order() -> String {
    "id".to_string()
}

/// `sale.order` → `sale_order`.
pub fn table_for(name: &str) -> String {
    name.replace('.', "_")
}

impl fmt::Debug for EntityDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityDefinition")
            .field("name", &self.name)
            .field("table", &self.table)
            .field("fields", &self.fields.keys().collect::<Vec<_>>())
            .field("default_order", &self.default_order)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl EntityDefinition {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            table: table_for(name),
            fields: IndexMap::new(),
            default_order: default_order(),
            rec_name: None,
            sequence: None,
            methods: IndexMap::new(),
        }
    }

    pub fn with_table(mut self, table: &str) -> Self {
        self.table = table.to_string();
        self
    }

    pub fn field(mut self, name: &str, def: FieldDefinition) -> Self {
        self.fields.insert(name.to_string(), def);
        self
    }

    pub fn method(mut self, name: &str, f: MethodFn) -> Self {
        self.methods.insert(name.to_string(), f);
        self
    }

    pub fn with_order(mut self, order: &str) -> Self {
        self.default_order = order.to_string();
        self
    }

    pub fn with_rec_name(mut self, field: &str) -> Self {
        self.rec_name = Some(field.to_string());
        self
    }

    pub fn with_sequence(mut self, field: &str, code: &str) -> Self {
        self.sequence = Some(SequencePolicy {
            field: field.to_string(),
            code: code.to_string(),
        });
        self
    }
}

/// Additions to an entity declared by another module.
#[derive(Clone, Serialize, Deserialize)]
pub struct EntityExtension {
    pub target: String,

    #[serde(default)]
    pub added_fields: IndexMap<String, FieldDefinition>,

    #[serde(skip)]
    pub added_methods: IndexMap<String, MethodFn>,
}

impl fmt::Debug for EntityExtension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityExtension")
            .field("target", &self.target)
            .field("added_fields", &self.added_fields.keys().collect::<Vec<_>>())
            .field("added_methods", &self.added_methods.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl EntityExtension {
    pub fn new(target: &str) -> Self {
        Self {
            target: target.to_string(),
            added_fields: IndexMap::new(),
            added_methods: IndexMap::new(),
        }
    }

    pub fn field(mut self, name: &str, def: FieldDefinition) -> Self {
        self.added_fields.insert(name.to_string(), def);
        self
    }

    pub fn method(mut self, name: &str, f: MethodFn) -> Self {
        self.added_methods.insert(name.to_string(), f);
        self
    }
}

/// A fully merged entity. Built once per name by the registry and shared
/// read-only with every model and recordset bound to it.
pub struct CompiledEntity {
    pub name: String,
    pub table: String,
    pub fields: IndexMap<String, FieldDefinition>,
    pub default_order: String,
    pub rec_name: Option<String>,
    pub sequence: Option<SequencePolicy>,
    pub(crate) primary_key: String,
    pub(crate) methods: IndexMap<String, MethodChain>,
}

impl fmt::Debug for CompiledEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledEntity")
            .field("name", &self.name)
            .field("table", &self.table)
            .field("fields", &self.fields.keys().collect::<Vec<_>>())
            .field(
                "methods",
                &self
                    .methods
                    .values()
                    .map(|c| (c.name(), c.depth()))
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl CompiledEntity {
    /// Name of the primary-key field.
    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }

    pub fn field(&self, name: &str) -> Option<&FieldDefinition> {
        self.fields.get(name)
    }

    /// Fields backed by a column, in declaration order.
    pub fn stored_fields(&self) -> impl Iterator<Item = (&String, &FieldDefinition)> {
        self.fields.iter().filter(|(_, def)| def.has_column())
    }

    /// Whether `name` is a field with a column.
    pub fn is_stored(&self, name: &str) -> bool {
        self.fields.get(name).is_some_and(|def| def.has_column())
    }

    /// Field shown as the display name of references to this entity.
    pub fn display_field(&self) -> Option<&str> {
        match &self.rec_name {
            Some(field) => Some(field.as_str()),
            None if self.is_stored("name") => Some("name"),
            None => None,
        }
    }

    /// Look up an action (business method) by name.
    pub fn action(&self, name: &str) -> Option<&MethodChain> {
        self.methods.get(name)
    }

    /// Names of all actions, in the order they were first declared.
    pub fn actions(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    /// Convert a raw result row into record data using the field converters.
    /// Columns without a declared field pass through untyped.
    pub fn row_from_db(&self, row: &Row) -> RecordData {
        let mut data = RecordData::new();
        for (column, value) in &row.columns {
            let json = match self.fields.get(column) {
                Some(def) => def.from_db(value),
                None => sql_to_json(value),
            };
            data.insert(column.clone(), json);
        }
        data
    }
}
