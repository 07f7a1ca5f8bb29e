//! Entity registry and its compile cache.
//!
//! The registry is an explicit value: constructed once at startup and handed
//! to every [`Environment`](crate::env::Environment) as `Arc<ModelRegistry>`.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use indexmap::IndexMap;
use tracing::{debug, info};

use crate::entity::{CompiledEntity, EntityDefinition, EntityExtension, table_for};
use crate::error::OrmError;
use crate::fields::FieldDefinition;
use crate::method::{MethodChain, MethodFn};

#[derive(Clone, Default)]
struct RegistryState {
    bases: HashMap<String, Arc<EntityDefinition>>,
    extensions: HashMap<String, Vec<Arc<EntityExtension>>>,
    /// Entity names in registration order, one entry per define/extend.
    log: Vec<String>,
}

/// Snapshot of the registrations, restorable with [`ModelRegistry::rollback`].
#[derive(Clone)]
pub struct Checkpoint {
    state: RegistryState,
}

/// Stores entity declarations and compiles them on demand.
#[derive(Default)]
pub struct ModelRegistry {
    state: RwLock<RegistryState>,
    cache: RwLock<HashMap<String, Arc<CompiledEntity>>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace the base definition of `entity.name`.
    pub fn define(&self, entity: EntityDefinition) {
        let name = entity.name.clone();
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let replaced = state.bases.insert(name.clone(), Arc::new(entity)).is_some();
        state.log.push(name.clone());
        self.invalidate_locked(&name);
        if replaced {
            info!("entity {} redefined", name);
        } else {
            debug!("entity {} defined", name);
        }
    }

    /// Register a base definition, failing if one already exists.
    pub fn define_unique(&self, entity: EntityDefinition) -> Result<(), OrmError> {
        {
            let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
            if state.bases.contains_key(&entity.name) {
                return Err(OrmError::DuplicateDefinition(entity.name));
            }
        }
        self.define(entity);
        Ok(())
    }

    /// Append an extension. The target base may be registered later.
    pub fn extend(&self, ext: EntityExtension) {
        let name = ext.target.clone();
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state
            .extensions
            .entry(name.clone())
            .or_default()
            .push(Arc::new(ext));
        state.log.push(name.clone());
        self.invalidate_locked(&name);
        debug!("entity {} extended", name);
    }

    /// Whether a base definition exists for `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .bases
            .contains_key(name)
    }

    /// Names of all base definitions, sorted.
    pub fn names(&self) -> Vec<String> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = state.bases.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of extensions registered for `name`.
    pub fn extension_count(&self, name: &str) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .extensions
            .get(name)
            .map_or(0, Vec::len)
    }

    /// Drop the compiled entity for `name` from the cache.
    pub fn invalidate(&self, name: &str) {
        let _state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        self.invalidate_locked(name);
    }

    /// Caller holds the state write lock.
    fn invalidate_locked(&self, name: &str) {
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
    }

    /// Compile (or fetch from cache) the merged entity for `name`.
    pub fn compile(&self, name: &str) -> Result<Arc<CompiledEntity>, OrmError> {
        if let Some(hit) = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
        {
            return Ok(Arc::clone(hit));
        }

        // Hold the state lock until the result is cached so a concurrent
        // define/extend cannot be overwritten by a stale compilation.
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let compiled = Arc::new(build(&state, name)?);
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), Arc::clone(&compiled));
        info!(
            "compiled entity {} ({} fields, {} extensions)",
            name,
            compiled.fields.len(),
            state.extensions.get(name).map_or(0, Vec::len)
        );
        Ok(compiled)
    }

    /// Snapshot the current registrations.
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            state: self
                .state
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }

    /// Entity names defined or extended since `checkpoint`, first-seen order.
    pub fn touched_since(&self, checkpoint: &Checkpoint) -> Vec<String> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = Vec::new();
        for name in state.log.iter().skip(checkpoint.state.log.len()) {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        names
    }

    /// Restore the registrations captured by `checkpoint`.
    pub fn rollback(&self, checkpoint: Checkpoint) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let touched: Vec<String> = state
            .log
            .iter()
            .skip(checkpoint.state.log.len())
            .cloned()
            .collect();
        *state = checkpoint.state;
        for name in &touched {
            self.invalidate_locked(name);
        }
        info!("registry rolled back ({} registrations undone)", touched.len());
    }
}

fn build(state: &RegistryState, name: &str) -> Result<CompiledEntity, OrmError> {
    let base = state
        .bases
        .get(name)
        .ok_or_else(|| OrmError::EntityNotFound(name.to_string()))?;

    let mut fields = base.fields.clone();
    let mut chains: IndexMap<String, Vec<MethodFn>> = base
        .methods
        .iter()
        .map(|(m, f)| (m.clone(), vec![Arc::clone(f)]))
        .collect();

    for ext in state.extensions.get(name).into_iter().flatten() {
        for (field, def) in &ext.added_fields {
            // Same key overwrites in place.
            fields.insert(field.clone(), def.clone());
        }
        for (m, f) in &ext.added_methods {
            chains.entry(m.clone()).or_default().push(Arc::clone(f));
        }
    }

    let pks: Vec<String> = fields
        .iter()
        .filter(|(_, def)| def.primary_key)
        .map(|(f, _)| f.clone())
        .collect();
    let primary_key = match pks.as_slice() {
        [] => {
            let mut with_id = IndexMap::with_capacity(fields.len() + 1);
            with_id.insert(
                "id".to_string(),
                FieldDefinition::integer().primary_key().with_label("ID"),
            );
            with_id.extend(fields);
            fields = with_id;
            "id".to_string()
        }
        [pk] => pk.clone(),
        _ => {
            return Err(OrmError::validation(format!(
                "entity '{name}' declares more than one primary key"
            )));
        }
    };

    for (field, def) in &fields {
        def.check(field)
            .map_err(|e| OrmError::validation(format!("entity '{name}': {e}")))?;
        if let Some(compute) = &def.compute {
            if !chains.contains_key(compute) {
                return Err(OrmError::validation(format!(
                    "entity '{name}': field '{field}' computes with unknown method '{compute}'"
                )));
            }
        }
    }
    if let Some(rec_name) = &base.rec_name {
        if !fields.contains_key(rec_name) {
            return Err(OrmError::validation(format!(
                "entity '{name}': rec_name '{rec_name}' is not a field"
            )));
        }
    }
    if let Some(policy) = &base.sequence {
        if !fields.contains_key(&policy.field) {
            return Err(OrmError::validation(format!(
                "entity '{name}': sequence field '{}' is not a field",
                policy.field
            )));
        }
    }

    let methods = chains
        .into_iter()
        .map(|(m, impls)| {
            let chain = MethodChain::new(name, &m, impls);
            (m, chain)
        })
        .collect();

    let table = if base.table.is_empty() {
        table_for(name)
    } else {
        base.table.clone()
    };

    Ok(CompiledEntity {
        name: name.to_string(),
        table,
        fields,
        default_order: base.default_order.clone(),
        rec_name: base.rec_name.clone(),
        sequence: base.sequence.clone(),
        primary_key,
        methods,
    })
}
