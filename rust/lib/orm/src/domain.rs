//! Domains (structured filters) and their translation to SQL.
//!
//! A domain is exchanged as plain JSON data:
//!
//! ```json
//! [["state", "in", ["draft", "sent"]], ["amount", ">", 100]]
//! ```
//!
//! Conditions are AND-joined. The logical tokens `|`, `&` and `!` are
//! accepted by the parser but not evaluated; see [`CombinatorPolicy`].

use openerp_sql::Value;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as Json;
use tracing::warn;

use crate::config::{CombinatorPolicy, DomainConfig, UnknownOperatorPolicy};
use crate::entity::CompiledEntity;
use crate::error::OrmError;
use crate::fields::{FieldDefinition, sql_to_json};

/// One `(field, operator, value)` triple.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub field: String,
    pub operator: String,
    pub value: Json,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DomainItem {
    Condition(Condition),
    /// `|`, `&` or `!`.
    Logical(String),
}

/// An ordered list of domain items.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Domain {
    items: Vec<DomainItem>,
}

impl Domain {
    /// The empty domain (matches every row).
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a condition.
    pub fn and(mut self, field: &str, operator: &str, value: impl Into<Json>) -> Self {
        self.items.push(DomainItem::Condition(Condition {
            field: field.to_string(),
            operator: operator.to_string(),
            value: value.into(),
        }));
        self
    }

    /// Append a logical token.
    pub fn token(mut self, token: &str) -> Self {
        self.items.push(DomainItem::Logical(token.to_string()));
        self
    }

    pub fn items(&self) -> &[DomainItem] {
        &self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Parse the JSON form: an array of `[field, op, value]` triples and
    /// logical token strings.
    pub fn from_json(value: &Json) -> Result<Self, OrmError> {
        let items = value
            .as_array()
            .ok_or_else(|| OrmError::validation("domain must be an array"))?;
        let mut domain = Domain::new();
        for item in items {
            match item {
                Json::String(token) if is_logical(token) => {
                    domain.items.push(DomainItem::Logical(token.clone()));
                }
                Json::Array(triple) if triple.len() == 3 => {
                    let field = triple[0]
                        .as_str()
                        .ok_or_else(|| OrmError::validation(format!("invalid domain term {item}")))?;
                    let operator = triple[1]
                        .as_str()
                        .ok_or_else(|| OrmError::validation(format!("invalid domain term {item}")))?;
                    domain = domain.and(field, operator, triple[2].clone());
                }
                other => {
                    return Err(OrmError::validation(format!("invalid domain term {other}")));
                }
            }
        }
        Ok(domain)
    }

    /// The JSON form of this domain.
    pub fn to_json(&self) -> Json {
        Json::Array(
            self.items
                .iter()
                .map(|item| match item {
                    DomainItem::Condition(c) => Json::Array(vec![
                        Json::String(c.field.clone()),
                        Json::String(c.operator.clone()),
                        c.value.clone(),
                    ]),
                    DomainItem::Logical(t) => Json::String(t.clone()),
                })
                .collect(),
        )
    }
}

impl Serialize for Domain {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Domain {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Json::deserialize(deserializer)?;
        Domain::from_json(&value).map_err(serde::de::Error::custom)
    }
}

fn is_logical(token: &str) -> bool {
    matches!(token, "|" | "&" | "!")
}

/// The fixed operator set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
    /// Case-sensitive substring match.
    Like,
    NotLike,
    /// Case-insensitive substring match.
    ILike,
    NotILike,
    /// Case-sensitive raw pattern.
    EqLike,
    /// Case-insensitive raw pattern.
    EqILike,
}

impl Operator {
    pub fn parse(op: &str) -> Option<Self> {
        let op = match op {
            "=" | "==" => Operator::Eq,
            "!=" | "<>" => Operator::Ne,
            "<" => Operator::Lt,
            "<=" => Operator::Le,
            ">" => Operator::Gt,
            ">=" => Operator::Ge,
            "in" => Operator::In,
            "not in" => Operator::NotIn,
            "like" => Operator::Like,
            "not like" => Operator::NotLike,
            "ilike" => Operator::ILike,
            "not ilike" => Operator::NotILike,
            "=like" => Operator::EqLike,
            "=ilike" => Operator::EqILike,
            _ => return None,
        };
        Some(op)
    }
}

/// A translated filter: a clause without the `WHERE` keyword and its
/// positional parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqlFilter {
    pub clause: String,
    pub params: Vec<Value>,
}

impl SqlFilter {
    /// ` WHERE <clause>`, or nothing for the empty filter.
    pub fn where_sql(&self) -> String {
        if self.clause.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clause)
        }
    }
}

/// Quote an SQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Translate `domain` against `entity` into a parameterized filter.
///
/// Parameters are numbered from `?1`.
pub fn translate(
    entity: &CompiledEntity,
    domain: &Domain,
    config: &DomainConfig,
) -> Result<SqlFilter, OrmError> {
    let mut clauses: Vec<String> = Vec::new();
    let mut params: Vec<Value> = Vec::new();

    for item in domain.items() {
        let cond = match item {
            DomainItem::Condition(cond) => cond,
            DomainItem::Logical(token) => match config.combinators {
                CombinatorPolicy::Ignore => {
                    warn!(
                        "domain on {}: logical operator '{}' is not supported, ignoring it",
                        entity.name, token
                    );
                    continue;
                }
                CombinatorPolicy::Reject => {
                    return Err(OrmError::validation(format!(
                        "logical operator '{token}' is not supported in domains"
                    )));
                }
            },
        };

        let def = entity
            .field(&cond.field)
            .filter(|def| def.has_column())
            .ok_or_else(|| {
                OrmError::validation(format!(
                    "cannot filter '{}' on unknown or non-stored field '{}'",
                    entity.name, cond.field
                ))
            })?;

        let op = match Operator::parse(&cond.operator) {
            Some(op) => op,
            None => match config.unknown_operator {
                UnknownOperatorPolicy::Equality => {
                    warn!(
                        "domain on {}: unknown operator '{}', treating it as '='",
                        entity.name, cond.operator
                    );
                    Operator::Eq
                }
                UnknownOperatorPolicy::Reject => {
                    return Err(OrmError::validation(format!(
                        "unknown domain operator '{}'",
                        cond.operator
                    )));
                }
            },
        };

        let column = quote_ident(&cond.field);
        let n = params.len() + 1;
        let clause = match op {
            Operator::Eq if cond.value.is_null() => format!("{column} IS NULL"),
            Operator::Ne if cond.value.is_null() => format!("{column} IS NOT NULL"),
            Operator::Eq | Operator::Ne | Operator::Lt | Operator::Le | Operator::Gt | Operator::Ge => {
                let sql_op = match op {
                    Operator::Eq => "=",
                    Operator::Ne => "!=",
                    Operator::Lt => "<",
                    Operator::Le => "<=",
                    Operator::Gt => ">",
                    _ => ">=",
                };
                params.push(def.to_db(&reference_id(def, &cond.value)));
                format!("{column} {sql_op} ?{n}")
            }
            Operator::In | Operator::NotIn => {
                let items = match &cond.value {
                    Json::Array(items) => items.clone(),
                    Json::Null => Vec::new(),
                    scalar => vec![scalar.clone()],
                };
                let list: Vec<Json> = items
                    .iter()
                    .map(|v| sql_to_json(&def.to_db(&reference_id(def, v))))
                    .collect();
                params.push(Value::Text(Json::Array(list).to_string()));
                let not = if op == Operator::NotIn { "NOT " } else { "" };
                format!("{column} {not}IN (SELECT value FROM json_each(?{n}))")
            }
            Operator::Like | Operator::NotLike | Operator::EqLike => {
                params.push(Value::Text(pattern(&cond.value, op != Operator::EqLike)));
                let not = if op == Operator::NotLike { "NOT " } else { "" };
                format!("{column} {not}LIKE ?{n}")
            }
            Operator::ILike | Operator::NotILike | Operator::EqILike => {
                params.push(Value::Text(pattern(&cond.value, op != Operator::EqILike)));
                let not = if op == Operator::NotILike { "NOT " } else { "" };
                format!("LOWER({column}) {not}LIKE LOWER(?{n})")
            }
        };
        clauses.push(clause);
    }

    Ok(SqlFilter {
        clause: clauses.join(" AND "),
        params,
    })
}

/// A reference compared against a read value (`{id, name}`) matches on its id.
fn reference_id(def: &FieldDefinition, value: &Json) -> Json {
    match value {
        Json::Object(obj) if def.ty.is_relational() => obj.get("id").cloned().unwrap_or(Json::Null),
        other => other.clone(),
    }
}

fn pattern(value: &Json, wrap: bool) -> String {
    let raw = match value {
        Json::String(s) => s.clone(),
        other => other.to_string(),
    };
    if wrap { format!("%{raw}%") } else { raw }
}

/// Translate an order clause (`"name asc, id desc"`) into an `ORDER BY` body.
pub fn order_by(entity: &CompiledEntity, order: &str) -> Result<String, OrmError> {
    let mut terms = Vec::new();
    for term in order.split(',') {
        let mut parts = term.split_whitespace();
        let Some(field) = parts.next() else {
            continue;
        };
        if !entity.is_stored(field) {
            return Err(OrmError::validation(format!(
                "cannot order '{}' by unknown or non-stored field '{field}'",
                entity.name
            )));
        }
        let direction = match parts.next().map(str::to_ascii_lowercase).as_deref() {
            None | Some("asc") => "ASC",
            Some("desc") => "DESC",
            Some(other) => {
                return Err(OrmError::validation(format!("invalid order direction '{other}'")));
            }
        };
        if parts.next().is_some() {
            return Err(OrmError::validation(format!("invalid order term '{}'", term.trim())));
        }
        terms.push(format!("{} {direction}", quote_ident(field)));
    }
    Ok(terms.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityDefinition;
    use crate::fields::FieldDefinition;
    use crate::registry::ModelRegistry;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;

    fn order_entity() -> Arc<CompiledEntity> {
        let registry = ModelRegistry::new();
        registry.define(
            EntityDefinition::new("sale.order")
                .field("name", FieldDefinition::char())
                .field(
                    "state",
                    FieldDefinition::selection(&[("draft", "Draft"), ("sent", "Sent")]),
                )
                .field("amount", FieldDefinition::monetary())
                .field("locked", FieldDefinition::boolean())
                .field("label", FieldDefinition::char().computed("compute_label"))
                .method(
                    "compute_label",
                    crate::method::method(|_, _, _| async { Ok(Json::Null) }),
                ),
        );
        registry.compile("sale.order").unwrap()
    }

    #[test]
    fn parse_json_domain() {
        let domain = Domain::from_json(&json!([
            "|",
            ["state", "in", ["draft", "sent"]],
            ["amount", ">", 10]
        ]))
        .unwrap();
        assert_eq!(domain.items().len(), 3);
        assert_eq!(domain.items()[0], DomainItem::Logical("|".into()));
        assert_eq!(
            domain.to_json(),
            json!(["|", ["state", "in", ["draft", "sent"]], ["amount", ">", 10]])
        );

        assert!(Domain::from_json(&json!({"state": "draft"})).is_err());
        assert!(Domain::from_json(&json!([["state", "="]])).is_err());
    }

    #[test]
    fn translate_comparisons() {
        let entity = order_entity();
        let domain = Domain::new()
            .and("amount", ">=", 10)
            .and("state", "!=", "draft")
            .and("locked", "=", true);
        let filter = translate(&entity, &domain, &DomainConfig::default()).unwrap();
        assert_eq!(
            filter.clause,
            "\"amount\" >= ?1 AND \"state\" != ?2 AND \"locked\" = ?3"
        );
        assert_eq!(
            filter.params,
            vec![Value::Real(10.0), Value::Text("draft".into()), Value::Integer(1)]
        );
    }

    #[test]
    fn translate_ordering_operators() {
        let entity = order_entity();
        let domain = Domain::new()
            .and("amount", "<", 5)
            .and("amount", "<=", 6)
            .and("amount", ">", 1)
            .and("state", "<>", "sent");
        let filter = translate(&entity, &domain, &DomainConfig::default()).unwrap();
        assert_eq!(
            filter.clause,
            "\"amount\" < ?1 AND \"amount\" <= ?2 AND \"amount\" > ?3 AND \"state\" != ?4"
        );
        assert_eq!(filter.params.len(), 4);
    }

    #[test]
    fn reference_conditions_match_on_id() {
        let registry = ModelRegistry::new();
        registry.define(EntityDefinition::new("res.partner").field("name", FieldDefinition::char()));
        registry.define(
            EntityDefinition::new("sale.order")
                .field("partner_id", FieldDefinition::reference("res.partner")),
        );
        let entity = registry.compile("sale.order").unwrap();
        let domain = Domain::new()
            .and("partner_id", "=", json!({"id": 7, "name": "Azure"}))
            .and("partner_id", "in", json!([{"id": 7, "name": "Azure"}, 8]));
        let filter = translate(&entity, &domain, &DomainConfig::default()).unwrap();
        assert_eq!(
            filter.params,
            vec![Value::Integer(7), Value::Text("[7,8]".into())]
        );
    }

    #[test]
    fn translate_set_membership() {
        let entity = order_entity();
        let domain = Domain::new()
            .and("state", "in", json!(["draft", "sent"]))
            .and("id", "not in", json!([3]));
        let filter = translate(&entity, &domain, &DomainConfig::default()).unwrap();
        assert_eq!(
            filter.clause,
            "\"state\" IN (SELECT value FROM json_each(?1)) AND \
             \"id\" NOT IN (SELECT value FROM json_each(?2))"
        );
        assert_eq!(
            filter.params,
            vec![Value::Text("[\"draft\",\"sent\"]".into()), Value::Text("[3]".into())]
        );
    }

    #[test]
    fn translate_patterns_and_nulls() {
        let entity = order_entity();
        let domain = Domain::new()
            .and("name", "ilike", "so")
            .and("name", "=like", "SO%")
            .and("name", "not like", "x")
            .and("amount", "=", Json::Null);
        let filter = translate(&entity, &domain, &DomainConfig::default()).unwrap();
        assert_eq!(
            filter.clause,
            "LOWER(\"name\") LIKE LOWER(?1) AND \"name\" LIKE ?2 AND \
             \"name\" NOT LIKE ?3 AND \"amount\" IS NULL"
        );
        assert_eq!(
            filter.params,
            vec![
                Value::Text("%so%".into()),
                Value::Text("SO%".into()),
                Value::Text("%x%".into())
            ]
        );
    }

    #[test]
    fn logical_tokens_ignored_or_rejected() {
        let entity = order_entity();
        let domain = Domain::new()
            .token("|")
            .and("state", "=", "draft")
            .and("state", "=", "sent");
        let filter = translate(&entity, &domain, &DomainConfig::default()).unwrap();
        assert_eq!(filter.clause, "\"state\" = ?1 AND \"state\" = ?2");

        let strict = DomainConfig {
            combinators: CombinatorPolicy::Reject,
            ..DomainConfig::default()
        };
        assert!(translate(&entity, &domain, &strict).is_err());
    }

    #[test]
    fn unknown_operator_degrades_or_rejects() {
        let entity = order_entity();
        let domain = Domain::new().and("state", "child_of", "draft");
        let filter = translate(&entity, &domain, &DomainConfig::default()).unwrap();
        assert_eq!(filter.clause, "\"state\" = ?1");

        let strict = DomainConfig {
            unknown_operator: UnknownOperatorPolicy::Reject,
            ..DomainConfig::default()
        };
        assert!(translate(&entity, &domain, &strict).is_err());
    }

    #[test]
    fn unknown_and_virtual_fields_are_rejected() {
        let entity = order_entity();
        let config = DomainConfig::default();
        assert!(translate(&entity, &Domain::new().and("nope", "=", 1), &config).is_err());
        assert!(translate(&entity, &Domain::new().and("label", "=", "x"), &config).is_err());
        assert!(
            translate(&entity, &Domain::new().and("name\" OR 1=1 --", "=", 1), &config).is_err()
        );
    }

    #[test]
    fn empty_domain_has_no_where() {
        let entity = order_entity();
        let filter = translate(&entity, &Domain::new(), &DomainConfig::default()).unwrap();
        assert_eq!(filter.where_sql(), "");
    }

    #[test]
    fn order_terms() {
        let entity = order_entity();
        assert_eq!(
            order_by(&entity, "amount desc, id").unwrap(),
            "\"amount\" DESC, \"id\" ASC"
        );
        assert!(order_by(&entity, "amount sideways").is_err());
        assert!(order_by(&entity, "label").is_err());
        assert!(order_by(&entity, "id; DROP TABLE x").is_err());
    }
}
