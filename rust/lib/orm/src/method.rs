//! Business methods and call-parent chains.
//!
//! Each method name of a compiled entity owns a fixed, ordered list of
//! implementations: the base first, then one per extension in load order.
//! Invoking the method runs the last one and passes it a [`Parent`] handle
//! that runs the one before it. Nothing is rebound during a call, so the
//! chain behaves the same no matter what ran before.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value as Json;

use crate::error::OrmError;
use crate::recordset::Recordset;

pub type MethodFuture = BoxFuture<'static, Result<Json, OrmError>>;

/// One implementation of a business method.
///
/// Receives the recordset it was called on, the call arguments, and the
/// handle to the previous implementation.
pub type MethodFn = Arc<dyn Fn(Recordset, Json, Parent) -> MethodFuture + Send + Sync>;

/// Wrap an async closure as a [`MethodFn`].
///
/// ```ignore
/// let confirm = method(|rs, args, parent| async move {
///     let result = parent.call(rs.clone(), args).await?;
///     Ok(result)
/// });
/// ```
pub fn method<F, Fut>(f: F) -> MethodFn
where
    F: Fn(Recordset, Json, Parent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Json, OrmError>> + Send + 'static,
{
    Arc::new(move |rs, args, parent| Box::pin(f(rs, args, parent)))
}

/// The compiled implementations of one method, base first.
#[derive(Clone)]
pub struct MethodChain {
    entity: Arc<str>,
    name: Arc<str>,
    impls: Arc<[MethodFn]>,
}

impl MethodChain {
    pub(crate) fn new(entity: &str, name: &str, impls: Vec<MethodFn>) -> Self {
        Self {
            entity: Arc::from(entity),
            name: Arc::from(name),
            impls: Arc::from(impls),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of implementations (1 = base only).
    pub fn depth(&self) -> usize {
        self.impls.len()
    }

    /// Whether both chains hold the same implementations in the same order.
    pub fn same_impls(&self, other: &MethodChain) -> bool {
        self.impls.len() == other.impls.len()
            && self
                .impls
                .iter()
                .zip(other.impls.iter())
                .all(|(a, b)| Arc::ptr_eq(a, b))
    }

    /// Run the most derived implementation.
    pub async fn invoke(&self, rs: Recordset, args: Json) -> Result<Json, OrmError> {
        let top = Parent {
            chain: self.clone(),
            below: self.impls.len(),
        };
        top.call(rs, args).await
    }
}

/// Handle to the implementation directly below the running one.
#[derive(Clone)]
pub struct Parent {
    chain: MethodChain,
    below: usize,
}

impl Parent {
    /// Whether there is an implementation to call.
    pub fn exists(&self) -> bool {
        self.below > 0
    }

    /// Run the parent implementation.
    pub async fn call(&self, rs: Recordset, args: Json) -> Result<Json, OrmError> {
        if self.below == 0 {
            return Err(OrmError::NoParent {
                entity: self.chain.entity.to_string(),
                method: self.chain.name.to_string(),
            });
        }
        let index = self.below - 1;
        let f = Arc::clone(&self.chain.impls[index]);
        let parent = Parent {
            chain: self.chain.clone(),
            below: index,
        };
        f(rs, args, parent).await
    }
}
