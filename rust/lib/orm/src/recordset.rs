//! Models bound to an execution context and the recordsets they produce.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use openerp_sql::Value;
use serde_json::{Value as Json, json};
use tracing::debug;

use crate::domain::{Domain, order_by, quote_ident, translate};
use crate::entity::CompiledEntity;
use crate::env::Environment;
use crate::error::OrmError;
use crate::fields::{FieldDefinition, FieldType, RecordData};

/// Pagination and ordering for [`Model::search`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchOptions {
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    /// Overrides the entity's default order.
    pub order: Option<String>,
}

impl SearchOptions {
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn order(mut self, order: &str) -> Self {
        self.order = Some(order.to_string());
        self
    }
}

/// A compiled entity bound to an [`Environment`].
#[derive(Clone)]
pub struct Model {
    env: Environment,
    entity: Arc<CompiledEntity>,
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("entity", &self.entity.name)
            .finish_non_exhaustive()
    }
}

impl Model {
    pub(crate) fn new(env: Environment, entity: Arc<CompiledEntity>) -> Self {
        Self { env, entity }
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    pub fn entity(&self) -> &Arc<CompiledEntity> {
        &self.entity
    }

    pub fn name(&self) -> &str {
        &self.entity.name
    }

    /// A recordset with no rows.
    pub fn empty(&self) -> Recordset {
        Recordset::from_rows(self.env.clone(), Arc::clone(&self.entity), Vec::new())
    }

    /// Insert one record.
    pub async fn create(&self, values: RecordData) -> Result<Recordset, OrmError> {
        let entity = &self.entity;
        let mut values = values;

        // The sequence code is drawn only once every check below has passed.
        let numbered = entity
            .sequence
            .as_ref()
            .filter(|policy| values.get(&policy.field).is_none_or(Json::is_null));
        if let Some(policy) = numbered {
            values.remove(&policy.field);
        }

        for (name, def) in &entity.fields {
            if values.contains_key(name) || numbered.is_some_and(|p| &p.field == name) {
                continue;
            }
            if let Some(f) = &def.default_fn {
                values.insert(name.clone(), f(&self.env));
            } else if let Some(default) = &def.default {
                values.insert(name.clone(), default.clone());
            }
        }

        let mut values = normalize_values(entity, values, false)?;

        for (name, def) in entity.stored_fields() {
            let (Some(method), true) = (&def.compute, def.store) else {
                continue;
            };
            let chain = entity.action(method).ok_or_else(|| OrmError::UnknownAction {
                entity: entity.name.clone(),
                action: method.clone(),
            })?;
            let computed = chain
                .invoke(self.empty(), Json::Object(values.clone()))
                .await?;
            let computed = def.normalize(computed).map_err(|e| {
                OrmError::validation(format!("{}.{name}: {e}", entity.name))
            })?;
            values.insert(name.clone(), computed);
        }

        for (name, def) in entity.stored_fields() {
            if numbered.is_some_and(|p| &p.field == name) {
                continue;
            }
            if def.required && !def.primary_key && values.get(name).is_none_or(Json::is_null) {
                return Err(OrmError::validation(format!(
                    "{}.{name} is required",
                    entity.name
                )));
            }
        }

        if let Some(policy) = numbered {
            let code = self.env.sequences().next(&policy.code, None).await?;
            values.insert(policy.field.clone(), Json::String(code));
        }

        let mut columns = Vec::new();
        let mut placeholders = Vec::new();
        let mut params = Vec::new();
        for (name, def) in entity.stored_fields() {
            if let Some(value) = values.get(name) {
                params.push(def.to_db(value));
                columns.push(quote_ident(name));
                placeholders.push(format!("?{}", params.len()));
            }
        }
        let table = quote_ident(&entity.table);
        let sql = if columns.is_empty() {
            format!("INSERT INTO {table} DEFAULT VALUES RETURNING *")
        } else {
            format!(
                "INSERT INTO {table} ({}) VALUES ({}) RETURNING *",
                columns.join(", "),
                placeholders.join(", ")
            )
        };
        let rows = self.env.store().query(&sql, &params).await?;
        let rows: Vec<RecordData> = rows.iter().map(|r| entity.row_from_db(r)).collect();
        if rows.len() != 1 {
            return Err(OrmError::Internal(format!(
                "insert into {} returned {} rows",
                entity.table,
                rows.len()
            )));
        }
        debug!("{} created", entity.name);
        Ok(Recordset::from_rows(self.env.clone(), Arc::clone(entity), rows))
    }

    /// Records matching `domain`.
    pub async fn search(
        &self,
        domain: &Domain,
        options: SearchOptions,
    ) -> Result<Recordset, OrmError> {
        let entity = &self.entity;
        let filter = translate(entity, domain, self.env.domain_config())?;
        let mut params = filter.params.clone();

        let mut sql = format!("SELECT * FROM {}{}", quote_ident(&entity.table), filter.where_sql());
        let order = options.order.as_deref().unwrap_or(&entity.default_order);
        let order = order_by(entity, order)?;
        if !order.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&order);
        }
        if options.limit.is_some() || options.offset.is_some() {
            let limit = options.limit.map_or(-1, |l| i64::try_from(l).unwrap_or(i64::MAX));
            params.push(Value::Integer(limit));
            sql.push_str(&format!(" LIMIT ?{}", params.len()));
            if let Some(offset) = options.offset {
                params.push(Value::Integer(i64::try_from(offset).unwrap_or(i64::MAX)));
                sql.push_str(&format!(" OFFSET ?{}", params.len()));
            }
        }

        let rows = self.env.store().query(&sql, &params).await?;
        let rows = rows.iter().map(|r| entity.row_from_db(r)).collect();
        Ok(Recordset::from_rows(self.env.clone(), Arc::clone(entity), rows))
    }

    /// Number of records matching `domain`.
    pub async fn search_count(&self, domain: &Domain) -> Result<u64, OrmError> {
        let entity = &self.entity;
        let filter = translate(entity, domain, self.env.domain_config())?;
        let sql = format!(
            "SELECT COUNT(*) AS count FROM {}{}",
            quote_ident(&entity.table),
            filter.where_sql()
        );
        let rows = self.env.store().query(&sql, &filter.params).await?;
        let count = rows
            .first()
            .and_then(|r| r.get_i64("count"))
            .ok_or_else(|| OrmError::Internal("count query returned no value".into()))?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    /// Records with the given ids, in the default order.
    pub async fn browse(&self, ids: &[i64]) -> Result<Recordset, OrmError> {
        if ids.is_empty() {
            return Ok(self.empty());
        }
        let domain = Domain::new().and(self.entity.primary_key(), "in", json!(ids));
        self.search(&domain, SearchOptions::default()).await
    }
}

/// An ordered set of records of one entity.
#[derive(Clone)]
pub struct Recordset {
    env: Environment,
    entity: Arc<CompiledEntity>,
    rows: Vec<RecordData>,
    ids: Vec<i64>,
}

impl fmt::Debug for Recordset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:?}", self.entity.name, self.ids)
    }
}

impl Recordset {
    fn from_rows(env: Environment, entity: Arc<CompiledEntity>, rows: Vec<RecordData>) -> Self {
        let ids = rows
            .iter()
            .filter_map(|row| row.get(entity.primary_key()).and_then(Json::as_i64))
            .collect();
        Self {
            env,
            entity,
            rows,
            ids,
        }
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    pub fn entity(&self) -> &Arc<CompiledEntity> {
        &self.entity
    }

    pub fn ids(&self) -> &[i64] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Raw rows as loaded from the table.
    pub fn rows(&self) -> &[RecordData] {
        &self.rows
    }

    /// The single row, or a validation error.
    pub fn ensure_one(&self) -> Result<&RecordData, OrmError> {
        match self.rows.as_slice() {
            [row] => Ok(row),
            rows => Err(OrmError::validation(format!(
                "expected a single {} record, got {}",
                self.entity.name,
                rows.len()
            ))),
        }
    }

    /// Raw value of `field` on a single record.
    pub fn get(&self, field: &str) -> Result<&Json, OrmError> {
        let row = self.ensure_one()?;
        if self.entity.field(field).is_none() {
            return Err(unknown_field(&self.entity, field));
        }
        Ok(row.get(field).unwrap_or(&Json::Null))
    }

    /// The records for which `predicate` holds, in order.
    pub fn filtered(&self, predicate: impl Fn(&RecordData) -> bool) -> Recordset {
        let rows = self.rows.iter().filter(|row| predicate(row)).cloned().collect();
        Recordset::from_rows(self.env.clone(), Arc::clone(&self.entity), rows)
    }

    /// Resolve `fields` (all declared fields when `None`) for every record.
    ///
    /// References become `{id, name}` pairs and inverse lists become id
    /// lists. Each relational field costs one query for the whole set.
    pub async fn read(&self, fields: Option<&[&str]>) -> Result<Vec<RecordData>, OrmError> {
        let entity = &self.entity;
        let names: Vec<&str> = match fields {
            Some(names) => names.to_vec(),
            None => entity.fields.keys().map(String::as_str).collect(),
        };
        let mut resolved = Vec::with_capacity(names.len());
        for name in names {
            let def = entity.field(name).ok_or_else(|| unknown_field(entity, name))?;
            resolved.push((name, def));
        }

        let pk = entity.primary_key();
        let mut out: Vec<RecordData> = self
            .rows
            .iter()
            .map(|row| {
                let mut data = RecordData::new();
                data.insert(pk.to_string(), row.get(pk).cloned().unwrap_or(Json::Null));
                data
            })
            .collect();
        if self.rows.is_empty() {
            return Ok(out);
        }

        for (name, def) in resolved {
            match def.ty {
                FieldType::Reference if def.has_column() => {
                    let values = self.resolve_references(name, def).await?;
                    for (data, value) in out.iter_mut().zip(values) {
                        data.insert(name.to_string(), value);
                    }
                }
                FieldType::ReferenceListInverse => {
                    let values = self.resolve_inverse(def).await?;
                    for (data, value) in out.iter_mut().zip(values) {
                        data.insert(name.to_string(), value);
                    }
                }
                _ if def.compute.is_some() && !def.store => {
                    for (data, row) in out.iter_mut().zip(&self.rows) {
                        let value = self.compute_for(name, def, row).await?;
                        data.insert(name.to_string(), value);
                    }
                }
                _ => {
                    for (data, row) in out.iter_mut().zip(&self.rows) {
                        data.insert(name.to_string(), row.get(name).cloned().unwrap_or(Json::Null));
                    }
                }
            }
        }
        Ok(out)
    }

    async fn compute_for(
        &self,
        name: &str,
        def: &FieldDefinition,
        row: &RecordData,
    ) -> Result<Json, OrmError> {
        let method = def.compute.as_deref().unwrap_or_default();
        let chain = self.entity.action(method).ok_or_else(|| OrmError::UnknownAction {
            entity: self.entity.name.clone(),
            action: method.to_string(),
        })?;
        let record = Recordset::from_rows(
            self.env.clone(),
            Arc::clone(&self.entity),
            vec![row.clone()],
        );
        debug!("{}.{name} computed by {method}", self.entity.name);
        chain.invoke(record, Json::Object(row.clone())).await
    }

    /// `{id, name}` per row (null for empty references), in row order.
    async fn resolve_references(
        &self,
        name: &str,
        def: &FieldDefinition,
    ) -> Result<Vec<Json>, OrmError> {
        let ids: Vec<Option<i64>> = self
            .rows
            .iter()
            .map(|row| row.get(name).and_then(Json::as_i64))
            .collect();
        let distinct: BTreeSet<i64> = ids.iter().flatten().copied().collect();
        if distinct.is_empty() {
            return Ok(vec![Json::Null; ids.len()]);
        }

        let target = self.target(def)?;
        let target_pk = quote_ident(target.primary_key());
        let display = target.display_field();
        let select = match display {
            Some(field) => format!("{target_pk} AS id, {} AS name", quote_ident(field)),
            None => format!("{target_pk} AS id"),
        };
        let sql = format!(
            "SELECT {select} FROM {} WHERE {target_pk} IN (SELECT value FROM json_each(?1))",
            quote_ident(&target.table)
        );
        let param = Value::Text(json!(distinct).to_string());
        let rows = self.env.store().query(&sql, &[param]).await?;

        let names: HashMap<i64, Json> = rows
            .iter()
            .filter_map(|row| {
                let id = row.get_i64("id")?;
                let name = match (display, row.get("name")) {
                    (Some(field), Some(value)) => target
                        .field(field)
                        .map_or(Json::Null, |def| def.from_db(value)),
                    _ => Json::Null,
                };
                Some((id, name))
            })
            .collect();

        Ok(ids
            .into_iter()
            .map(|id| match id {
                Some(id) => json!({
                    "id": id,
                    "name": names.get(&id).cloned().unwrap_or(Json::Null),
                }),
                None => Json::Null,
            })
            .collect())
    }

    /// Ids of target rows pointing at each row, in row order.
    async fn resolve_inverse(&self, def: &FieldDefinition) -> Result<Vec<Json>, OrmError> {
        let target = self.target(def)?;
        let inverse = def.inverse_field.as_deref().unwrap_or_default();
        if !target.is_stored(inverse) {
            return Err(OrmError::validation(format!(
                "{}.{inverse} is not a stored field",
                target.name
            )));
        }

        let target_pk = quote_ident(target.primary_key());
        let back = quote_ident(inverse);
        let sql = format!(
            "SELECT {target_pk} AS id, {back} AS parent FROM {} \
             WHERE {back} IN (SELECT value FROM json_each(?1)) ORDER BY {target_pk}",
            quote_ident(&target.table)
        );
        let param = Value::Text(json!(self.ids).to_string());
        let rows = self.env.store().query(&sql, &[param]).await?;

        let mut children: HashMap<i64, Vec<i64>> = HashMap::new();
        for row in &rows {
            if let (Some(id), Some(parent)) = (row.get_i64("id"), row.get_i64("parent")) {
                children.entry(parent).or_default().push(id);
            }
        }
        Ok(self
            .rows
            .iter()
            .map(|row| {
                let id = row.get(self.entity.primary_key()).and_then(Json::as_i64);
                let list = id.and_then(|id| children.get(&id)).cloned().unwrap_or_default();
                json!(list)
            })
            .collect())
    }

    fn target(&self, def: &FieldDefinition) -> Result<Arc<CompiledEntity>, OrmError> {
        let relation = def.relation.as_deref().unwrap_or_default();
        self.env.registry().compile(relation)
    }

    /// Update every record with `values`.
    ///
    /// Returns `false` for an empty recordset. The in-memory rows are
    /// replaced only when the statement succeeds.
    pub async fn write(&mut self, values: RecordData) -> Result<bool, OrmError> {
        if self.is_empty() {
            return Ok(false);
        }
        let entity = Arc::clone(&self.entity);
        let values = normalize_values(&entity, values, true)?;
        if values.is_empty() {
            return Ok(true);
        }

        let mut assignments = Vec::new();
        let mut params = Vec::new();
        for (name, def) in entity.stored_fields() {
            if let Some(value) = values.get(name) {
                params.push(def.to_db(value));
                assignments.push(format!("{} = ?{}", quote_ident(name), params.len()));
            }
        }
        params.push(Value::Text(json!(self.ids).to_string()));
        let sql = format!(
            "UPDATE {} SET {} WHERE {} IN (SELECT value FROM json_each(?{})) RETURNING *",
            quote_ident(&entity.table),
            assignments.join(", "),
            quote_ident(entity.primary_key()),
            params.len()
        );
        let rows = self.env.store().query(&sql, &params).await?;

        let mut updated: HashMap<i64, RecordData> = rows
            .iter()
            .map(|r| entity.row_from_db(r))
            .filter_map(|row| {
                let id = row.get(entity.primary_key()).and_then(Json::as_i64)?;
                Some((id, row))
            })
            .collect();
        let rows = self.ids.iter().filter_map(|id| updated.remove(id)).collect();
        *self = Recordset::from_rows(self.env.clone(), entity, rows);
        Ok(true)
    }

    /// Delete every record and empty the set.
    pub async fn unlink(&mut self) -> Result<bool, OrmError> {
        if self.is_empty() {
            return Ok(true);
        }
        let sql = format!(
            "DELETE FROM {} WHERE {} IN (SELECT value FROM json_each(?1))",
            quote_ident(&self.entity.table),
            quote_ident(self.entity.primary_key())
        );
        let deleted = self
            .env
            .store()
            .exec(&sql, &[Value::Text(json!(self.ids).to_string())])
            .await?;
        debug!("{}: {deleted} rows deleted", self.entity.name);
        self.rows.clear();
        self.ids.clear();
        Ok(true)
    }

    /// Run a business method on this recordset.
    pub async fn call(&self, action: &str, args: Json) -> Result<Json, OrmError> {
        let chain = self
            .entity
            .action(action)
            .ok_or_else(|| OrmError::UnknownAction {
                entity: self.entity.name.clone(),
                action: action.to_string(),
            })?;
        chain.invoke(self.clone(), args).await
    }
}

fn unknown_field(entity: &CompiledEntity, field: &str) -> OrmError {
    OrmError::validation(format!("{} has no field '{field}'", entity.name))
}

/// Normalize incoming values and keep those with a column.
fn normalize_values(
    entity: &CompiledEntity,
    values: RecordData,
    updating: bool,
) -> Result<RecordData, OrmError> {
    let mut out = RecordData::new();
    for (name, value) in values {
        let def = entity
            .field(&name)
            .ok_or_else(|| unknown_field(entity, &name))?;
        if !def.has_column() {
            continue;
        }
        if updating && def.primary_key {
            return Err(OrmError::validation(format!(
                "{}.{name}: the primary key cannot be written",
                entity.name
            )));
        }
        let value = def
            .normalize(value)
            .map_err(|e| OrmError::validation(format!("{}.{name}: {e}", entity.name)))?;
        if updating && def.required && value.is_null() {
            return Err(OrmError::validation(format!(
                "{}.{name} is required",
                entity.name
            )));
        }
        out.insert(name, value);
    }
    Ok(out)
}
