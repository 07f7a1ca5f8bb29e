//! Field definitions and the static field type table.
//!
//! Every declared field type maps to exactly one [`FieldTypeInfo`]: the column
//! type used by the schema generator, a validator, and the converters between
//! JSON record values and SQL parameters.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use openerp_sql::Value;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::env::Environment;

/// A record as plain data: field name to JSON value.
pub type RecordData = serde_json::Map<String, Json>;

/// A default evaluated at `create` time, not at definition time.
pub type DefaultFn = Arc<dyn Fn(&Environment) -> Json + Send + Sync>;

/// Declared type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FieldType {
    Char,
    Text,
    Integer,
    Float,
    Monetary,
    Boolean,
    Date,
    Datetime,
    Selection,
    Json,
    /// Single reference to another entity (many-to-one).
    Reference,
    /// Stored list of ids of another entity (many-to-many).
    ReferenceList,
    /// Virtual list of the target rows whose `inverse_field` points here
    /// (one-to-many).
    ReferenceListInverse,
}

impl FieldType {
    /// The table entry for this type.
    pub fn info(self) -> &'static FieldTypeInfo {
        &FIELD_TYPES[self as usize]
    }

    pub fn is_relational(self) -> bool {
        matches!(
            self,
            FieldType::Reference | FieldType::ReferenceList | FieldType::ReferenceListInverse
        )
    }
}

/// Referential action of a reference column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OnDelete {
    Cascade,
    #[serde(alias = "set null")]
    SetNull,
    Restrict,
}

impl OnDelete {
    pub fn as_sql(self) -> &'static str {
        match self {
            OnDelete::Cascade => "CASCADE",
            OnDelete::SetNull => "SET NULL",
            OnDelete::Restrict => "RESTRICT",
        }
    }
}

/// Declaration of one field of an entity.
#[derive(Clone, Serialize, Deserialize)]
pub struct FieldDefinition {
    #[serde(rename = "type")]
    pub ty: FieldType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    #[serde(default)]
    pub required: bool,

    #[serde(default)]
    pub unique: bool,

    #[serde(default)]
    pub primary_key: bool,

    /// Literal default, also emitted as the column `DEFAULT`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Json>,

    /// Thunk default, evaluated per `create` call. Wins over `default`.
    #[serde(skip)]
    pub default_fn: Option<DefaultFn>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u32>,

    /// Selection choices as `(code, label)` pairs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<(String, String)>,

    /// Target entity name of a relational field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relation: Option<String>,

    /// Field on the target that points back (reference-list-inverse only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inverse_field: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_delete: Option<OnDelete>,

    /// Name of the method computing this field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compute: Option<String>,

    /// Persist a computed field in its own column.
    #[serde(default)]
    pub store: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help: Option<String>,
}

impl fmt::Debug for FieldDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldDefinition")
            .field("ty", &self.ty)
            .field("label", &self.label)
            .field("required", &self.required)
            .field("unique", &self.unique)
            .field("primary_key", &self.primary_key)
            .field("default", &self.default)
            .field("default_fn", &self.default_fn.as_ref().map(|_| "<fn>"))
            .field("relation", &self.relation)
            .field("compute", &self.compute)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl PartialEq for FieldDefinition {
    /// Thunk defaults compare by identity.
    fn eq(&self, other: &Self) -> bool {
        let same_fn = match (&self.default_fn, &other.default_fn) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        };
        same_fn
            && self.ty == other.ty
            && self.label == other.label
            && self.required == other.required
            && self.unique == other.unique
            && self.primary_key == other.primary_key
            && self.default == other.default
            && self.size == other.size
            && self.options == other.options
            && self.relation == other.relation
            && self.inverse_field == other.inverse_field
            && self.on_delete == other.on_delete
            && self.compute == other.compute
            && self.store == other.store
            && self.help == other.help
    }
}

impl FieldDefinition {
    pub fn new(ty: FieldType) -> Self {
        Self {
            ty,
            label: None,
            required: false,
            unique: false,
            primary_key: false,
            default: None,
            default_fn: None,
            size: None,
            options: Vec::new(),
            relation: None,
            inverse_field: None,
            on_delete: None,
            compute: None,
            store: false,
            help: None,
        }
    }

    pub fn char() -> Self {
        Self::new(FieldType::Char)
    }

    pub fn text() -> Self {
        Self::new(FieldType::Text)
    }

    pub fn integer() -> Self {
        Self::new(FieldType::Integer)
    }

    pub fn float() -> Self {
        Self::new(FieldType::Float)
    }

    pub fn monetary() -> Self {
        Self::new(FieldType::Monetary)
    }

    pub fn boolean() -> Self {
        Self::new(FieldType::Boolean)
    }

    pub fn date() -> Self {
        Self::new(FieldType::Date)
    }

    pub fn datetime() -> Self {
        Self::new(FieldType::Datetime)
    }

    pub fn json() -> Self {
        Self::new(FieldType::Json)
    }

    pub fn selection(options: &[(&str, &str)]) -> Self {
        let mut def = Self::new(FieldType::Selection);
        def.options = options
            .iter()
            .map(|(code, label)| (code.to_string(), label.to_string()))
            .collect();
        def
    }

    /// Single reference to `target`.
    pub fn reference(target: &str) -> Self {
        let mut def = Self::new(FieldType::Reference);
        def.relation = Some(target.to_string());
        def
    }

    pub fn reference_list(target: &str) -> Self {
        let mut def = Self::new(FieldType::ReferenceList);
        def.relation = Some(target.to_string());
        def
    }

    /// Rows of `target` whose `inverse_field` references this record.
    pub fn inverse(target: &str, inverse_field: &str) -> Self {
        let mut def = Self::new(FieldType::ReferenceListInverse);
        def.relation = Some(target.to_string());
        def.inverse_field = Some(inverse_field.to_string());
        def
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.label = Some(label.to_string());
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn with_default(mut self, value: Json) -> Self {
        self.default = Some(value);
        self
    }

    pub fn with_default_fn(
        mut self,
        f: impl Fn(&Environment) -> Json + Send + Sync + 'static,
    ) -> Self {
        self.default_fn = Some(Arc::new(f));
        self
    }

    pub fn with_size(mut self, size: u32) -> Self {
        self.size = Some(size);
        self
    }

    pub fn on_delete(mut self, policy: OnDelete) -> Self {
        self.on_delete = Some(policy);
        self
    }

    /// Compute this field with the named method.
    pub fn computed(mut self, method: &str) -> Self {
        self.compute = Some(method.to_string());
        self
    }

    pub fn stored(mut self) -> Self {
        self.store = true;
        self
    }

    /// Whether the field is backed by a table column.
    pub fn has_column(&self) -> bool {
        if self.ty.info().column.is_none() {
            return false;
        }
        self.compute.is_none() || self.store
    }

    /// Declared SQL column type, `None` for virtual fields.
    pub fn column_type(&self) -> Option<String> {
        if !self.has_column() {
            return None;
        }
        let base = self.ty.info().column?;
        match (self.ty, self.size) {
            (FieldType::Char, Some(size)) => Some(format!("VARCHAR({size})")),
            _ => Some(base.to_string()),
        }
    }

    /// Check the structural invariants of the declaration.
    pub fn check(&self, name: &str) -> Result<(), String> {
        if self.ty.is_relational() != self.relation.is_some() {
            return Err(format!(
                "field '{name}': a relation target is required exactly for relational types"
            ));
        }
        if (self.ty == FieldType::ReferenceListInverse) != self.inverse_field.is_some() {
            return Err(format!(
                "field '{name}': inverse_field is required exactly for reference-list-inverse"
            ));
        }
        if self.ty == FieldType::Selection && self.options.is_empty() {
            return Err(format!("field '{name}': selection without options"));
        }
        if self.primary_key && self.ty != FieldType::Integer {
            return Err(format!("field '{name}': primary key must be an integer"));
        }
        Ok(())
    }

    /// Normalize and validate an incoming value for this field.
    ///
    /// Empty strings become null for numeric, date and reference types, and a
    /// reference given as `{id, name}` is reduced to its id.
    pub fn normalize(&self, value: Json) -> Result<Json, String> {
        let info = self.ty.info();
        let value = match value {
            Json::String(s) if s.is_empty() && info.empty_is_null => Json::Null,
            Json::Object(ref obj) if self.ty == FieldType::Reference => {
                obj.get("id").cloned().unwrap_or(Json::Null)
            }
            Json::Array(items) if self.ty == FieldType::ReferenceList => Json::Array(
                items
                    .into_iter()
                    .map(|item| match item {
                        Json::Object(obj) => obj.get("id").cloned().unwrap_or(Json::Null),
                        other => other,
                    })
                    .collect(),
            ),
            other => other,
        };
        if value.is_null() {
            return Ok(value);
        }
        (info.validate)(self, &value)?;
        Ok(value)
    }

    /// Convert a JSON value into a SQL parameter for this field.
    pub fn to_db(&self, value: &Json) -> Value {
        if value.is_null() {
            return Value::Null;
        }
        (self.ty.info().to_db)(value)
    }

    /// Convert a stored column value back into JSON.
    pub fn from_db(&self, value: &Value) -> Json {
        if matches!(value, Value::Null) {
            return Json::Null;
        }
        (self.ty.info().from_db)(value)
    }
}

// ── FieldTypeTable ─────────────────────────────────────────────────

/// Static behavior of one field type.
pub struct FieldTypeInfo {
    pub ty: FieldType,
    /// Declared SQL column type. `None` means the type has no column.
    pub column: Option<&'static str>,
    /// Whether an empty string is stored as null.
    pub empty_is_null: bool,
    pub validate: fn(&FieldDefinition, &Json) -> Result<(), String>,
    pub to_db: fn(&Json) -> Value,
    pub from_db: fn(&Value) -> Json,
}

/// Indexed by `FieldType as usize`.
static FIELD_TYPES: [FieldTypeInfo; 13] = [
    FieldTypeInfo {
        ty: FieldType::Char,
        column: Some("VARCHAR"),
        empty_is_null: false,
        validate: validate_char,
        to_db: text_to_db,
        from_db: generic_from_db,
    },
    FieldTypeInfo {
        ty: FieldType::Text,
        column: Some("TEXT"),
        empty_is_null: false,
        validate: validate_string,
        to_db: text_to_db,
        from_db: generic_from_db,
    },
    FieldTypeInfo {
        ty: FieldType::Integer,
        column: Some("INTEGER"),
        empty_is_null: true,
        validate: validate_integer,
        to_db: integer_to_db,
        from_db: generic_from_db,
    },
    FieldTypeInfo {
        ty: FieldType::Float,
        column: Some("REAL"),
        empty_is_null: true,
        validate: validate_number,
        to_db: real_to_db,
        from_db: real_from_db,
    },
    FieldTypeInfo {
        ty: FieldType::Monetary,
        column: Some("NUMERIC"),
        empty_is_null: true,
        validate: validate_number,
        to_db: real_to_db,
        from_db: real_from_db,
    },
    FieldTypeInfo {
        ty: FieldType::Boolean,
        column: Some("BOOLEAN"),
        empty_is_null: false,
        validate: validate_boolean,
        to_db: boolean_to_db,
        from_db: boolean_from_db,
    },
    FieldTypeInfo {
        ty: FieldType::Date,
        column: Some("DATE"),
        empty_is_null: true,
        validate: validate_date,
        to_db: text_to_db,
        from_db: generic_from_db,
    },
    FieldTypeInfo {
        ty: FieldType::Datetime,
        column: Some("TIMESTAMP"),
        empty_is_null: true,
        validate: validate_datetime,
        to_db: text_to_db,
        from_db: generic_from_db,
    },
    FieldTypeInfo {
        ty: FieldType::Selection,
        column: Some("VARCHAR"),
        empty_is_null: false,
        validate: validate_selection,
        to_db: text_to_db,
        from_db: generic_from_db,
    },
    FieldTypeInfo {
        ty: FieldType::Json,
        column: Some("TEXT"),
        empty_is_null: false,
        validate: validate_any,
        to_db: json_to_db,
        from_db: json_from_db,
    },
    FieldTypeInfo {
        ty: FieldType::Reference,
        column: Some("INTEGER"),
        empty_is_null: true,
        validate: validate_integer,
        to_db: integer_to_db,
        from_db: generic_from_db,
    },
    FieldTypeInfo {
        ty: FieldType::ReferenceList,
        column: Some("TEXT"),
        empty_is_null: false,
        validate: validate_id_list,
        to_db: json_to_db,
        from_db: json_from_db,
    },
    FieldTypeInfo {
        ty: FieldType::ReferenceListInverse,
        column: None,
        empty_is_null: false,
        validate: validate_any,
        to_db: json_to_db,
        from_db: json_from_db,
    },
];

// ── Validators ─────────────────────────────────────────────────────

fn validate_any(_def: &FieldDefinition, _value: &Json) -> Result<(), String> {
    Ok(())
}

fn validate_string(_def: &FieldDefinition, value: &Json) -> Result<(), String> {
    match value {
        Json::String(_) => Ok(()),
        other => Err(format!("expected a string, got {other}")),
    }
}

fn validate_char(def: &FieldDefinition, value: &Json) -> Result<(), String> {
    validate_string(def, value)?;
    if let (Some(size), Some(s)) = (def.size, value.as_str()) {
        if s.chars().count() > size as usize {
            return Err(format!("value longer than {size} characters"));
        }
    }
    Ok(())
}

fn validate_integer(_def: &FieldDefinition, value: &Json) -> Result<(), String> {
    match value.as_i64() {
        Some(_) => Ok(()),
        None => Err(format!("expected an integer, got {value}")),
    }
}

fn validate_number(_def: &FieldDefinition, value: &Json) -> Result<(), String> {
    match value {
        Json::Number(_) => Ok(()),
        other => Err(format!("expected a number, got {other}")),
    }
}

fn validate_boolean(_def: &FieldDefinition, value: &Json) -> Result<(), String> {
    match value {
        Json::Bool(_) => Ok(()),
        other => Err(format!("expected a boolean, got {other}")),
    }
}

fn validate_date(_def: &FieldDefinition, value: &Json) -> Result<(), String> {
    let s = value
        .as_str()
        .ok_or_else(|| format!("expected a date string, got {value}"))?;
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map(|_| ())
        .map_err(|_| format!("invalid date '{s}', expected YYYY-MM-DD"))
}

fn validate_datetime(_def: &FieldDefinition, value: &Json) -> Result<(), String> {
    let s = value
        .as_str()
        .ok_or_else(|| format!("expected a datetime string, got {value}"))?;
    if NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").is_ok()
        || DateTime::parse_from_rfc3339(s).is_ok()
    {
        Ok(())
    } else {
        Err(format!("invalid datetime '{s}'"))
    }
}

fn validate_selection(def: &FieldDefinition, value: &Json) -> Result<(), String> {
    let code = value
        .as_str()
        .ok_or_else(|| format!("expected a selection code, got {value}"))?;
    if def.options.iter().any(|(c, _)| c == code) {
        Ok(())
    } else {
        Err(format!("'{code}' is not a valid choice"))
    }
}

fn validate_id_list(_def: &FieldDefinition, value: &Json) -> Result<(), String> {
    match value {
        Json::Array(items) if items.iter().all(|i| i.as_i64().is_some()) => Ok(()),
        other => Err(format!("expected a list of ids, got {other}")),
    }
}

// ── Converters ─────────────────────────────────────────────────────

fn text_to_db(value: &Json) -> Value {
    match value {
        Json::String(s) => Value::Text(s.clone()),
        other => Value::Text(other.to_string()),
    }
}

fn integer_to_db(value: &Json) -> Value {
    match value.as_i64() {
        Some(i) => Value::Integer(i),
        None => json_scalar_to_db(value),
    }
}

fn real_to_db(value: &Json) -> Value {
    match value.as_f64() {
        Some(f) => Value::Real(f),
        None => json_scalar_to_db(value),
    }
}

fn boolean_to_db(value: &Json) -> Value {
    match value {
        Json::Bool(b) => Value::from(*b),
        other => json_scalar_to_db(other),
    }
}

fn json_to_db(value: &Json) -> Value {
    Value::Text(value.to_string())
}

fn generic_from_db(value: &Value) -> Json {
    sql_to_json(value)
}

fn real_from_db(value: &Value) -> Json {
    match value {
        Value::Integer(i) => number(*i as f64),
        other => sql_to_json(other),
    }
}

fn boolean_from_db(value: &Value) -> Json {
    match value {
        Value::Integer(i) => Json::Bool(*i != 0),
        other => sql_to_json(other),
    }
}

fn json_from_db(value: &Value) -> Json {
    match value {
        Value::Text(s) => serde_json::from_str(s).unwrap_or_else(|_| Json::String(s.clone())),
        other => sql_to_json(other),
    }
}

fn number(f: f64) -> Json {
    serde_json::Number::from_f64(f)
        .map(Json::Number)
        .unwrap_or(Json::Null)
}

/// Type-agnostic conversion of a scalar JSON value into a SQL parameter.
pub fn json_scalar_to_db(value: &Json) -> Value {
    match value {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::from(*b),
        Json::Number(n) => match n.as_i64() {
            Some(i) => Value::Integer(i),
            None => Value::Real(n.as_f64().unwrap_or_default()),
        },
        Json::String(s) => Value::Text(s.clone()),
        other => Value::Text(other.to_string()),
    }
}

/// Type-agnostic conversion of a SQL value into JSON.
pub fn sql_to_json(value: &Value) -> Json {
    match value {
        Value::Null => Json::Null,
        Value::Integer(i) => Json::from(*i),
        Value::Real(f) => number(*f),
        Value::Text(s) => Json::String(s.clone()),
        Value::Blob(b) => Json::String(String::from_utf8_lossy(b).into_owned()),
    }
}
