//! Execution context: data-access handle, registry, user and locale.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use openerp_sql::SQLStore;
use serde_json::Value as Json;
use tracing::{debug, warn};

use crate::config::{DomainConfig, EngineConfig};
use crate::error::OrmError;
use crate::fields::RecordData;
use crate::recordset::Model;
use crate::registry::ModelRegistry;
use crate::sequence::SequenceGenerator;

/// Everything an operation needs besides its arguments.
///
/// Cheap to clone. The `with_*` builders return a new context and leave the
/// receiver untouched.
#[derive(Clone)]
pub struct Environment {
    store: Arc<dyn SQLStore>,
    registry: Arc<ModelRegistry>,
    uid: Option<i64>,
    lang: Arc<str>,
    context: Arc<RecordData>,
    domain: DomainConfig,
    /// Transaction nesting: 0 outside a transaction.
    depth: usize,
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("uid", &self.uid)
            .field("lang", &self.lang)
            .field("context", &self.context)
            .field("domain", &self.domain)
            .field("depth", &self.depth)
            .finish_non_exhaustive()
    }
}

impl Environment {
    pub fn new(store: Arc<dyn SQLStore>, registry: Arc<ModelRegistry>) -> Self {
        Self {
            store,
            registry,
            uid: None,
            lang: Arc::from("en_US"),
            context: Arc::new(RecordData::new()),
            domain: DomainConfig::default(),
            depth: 0,
        }
    }

    /// Context with the locale and domain policies of `config`.
    pub fn from_config(
        store: Arc<dyn SQLStore>,
        registry: Arc<ModelRegistry>,
        config: &EngineConfig,
    ) -> Self {
        Self::new(store, registry)
            .with_lang(&config.lang)
            .with_config(config.domain)
    }

    pub fn with_user(&self, uid: i64) -> Self {
        Self {
            uid: Some(uid),
            ..self.clone()
        }
    }

    pub fn with_lang(&self, lang: &str) -> Self {
        Self {
            lang: Arc::from(lang),
            ..self.clone()
        }
    }

    /// Merge `values` over the current context values.
    pub fn with_context(&self, values: RecordData) -> Self {
        let mut context = (*self.context).clone();
        context.extend(values);
        Self {
            context: Arc::new(context),
            ..self.clone()
        }
    }

    pub fn with_config(&self, domain: DomainConfig) -> Self {
        Self {
            domain,
            ..self.clone()
        }
    }

    pub fn store(&self) -> &Arc<dyn SQLStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn uid(&self) -> Option<i64> {
        self.uid
    }

    pub fn lang(&self) -> &str {
        &self.lang
    }

    pub fn context(&self) -> &RecordData {
        &self.context
    }

    pub fn context_value(&self, key: &str) -> Option<&Json> {
        self.context.get(key)
    }

    pub fn domain_config(&self) -> &DomainConfig {
        &self.domain
    }

    pub fn in_transaction(&self) -> bool {
        self.depth > 0
    }

    /// Compile `name` and bind it to this context.
    pub fn model(&self, name: &str) -> Result<Model, OrmError> {
        let entity = self.registry.compile(name)?;
        Ok(Model::new(self.clone(), entity))
    }

    pub fn sequences(&self) -> SequenceGenerator {
        SequenceGenerator::new(Arc::clone(&self.store))
    }

    /// Run `f` inside a transaction.
    ///
    /// The outermost call checks out one connection and runs `f` with a
    /// context bound to it. Commits when `f` succeeds; rolls back and returns
    /// [`OrmError::TransactionFailure`] otherwise. The connection is released
    /// in every case. Calls on a transactional context nest as savepoints.
    ///
    /// The outer context must not be used inside `f`: the default backend
    /// serializes on one connection, which the transaction holds.
    pub async fn transaction<T, F, Fut>(&self, f: F) -> Result<T, OrmError>
    where
        F: FnOnce(Environment) -> Fut,
        Fut: Future<Output = Result<T, OrmError>>,
    {
        if self.depth > 0 {
            return self.savepoint(f).await;
        }

        let conn = self.store.checkout().await?;
        let tx = Environment {
            store: Arc::clone(&conn),
            depth: 1,
            ..self.clone()
        };

        if let Err(e) = conn.exec("BEGIN", &[]).await {
            conn.release();
            return Err(OrmError::TransactionFailure(Box::new(e.into())));
        }
        debug!("transaction started");

        let outcome = match f(tx).await {
            Ok(value) => match conn.exec("COMMIT", &[]).await {
                Ok(_) => {
                    debug!("transaction committed");
                    Ok(value)
                }
                Err(e) => {
                    rollback(conn.as_ref()).await;
                    Err(OrmError::TransactionFailure(Box::new(e.into())))
                }
            },
            Err(e) => {
                rollback(conn.as_ref()).await;
                Err(OrmError::TransactionFailure(Box::new(e)))
            }
        };
        conn.release();
        outcome
    }

    async fn savepoint<T, F, Fut>(&self, f: F) -> Result<T, OrmError>
    where
        F: FnOnce(Environment) -> Fut,
        Fut: Future<Output = Result<T, OrmError>>,
    {
        let name = format!("sp_{}", self.depth);
        self.store
            .exec(&format!("SAVEPOINT {name}"), &[])
            .await
            .map_err(|e| OrmError::TransactionFailure(Box::new(e.into())))?;
        let inner = Environment {
            depth: self.depth + 1,
            ..self.clone()
        };
        match f(inner).await {
            Ok(value) => {
                self.store
                    .exec(&format!("RELEASE SAVEPOINT {name}"), &[])
                    .await
                    .map_err(|e| OrmError::TransactionFailure(Box::new(e.into())))?;
                Ok(value)
            }
            Err(e) => {
                let undo = [
                    format!("ROLLBACK TO SAVEPOINT {name}"),
                    format!("RELEASE SAVEPOINT {name}"),
                ];
                for stmt in &undo {
                    if let Err(rb) = self.store.exec(stmt, &[]).await {
                        warn!("{stmt} failed: {rb}");
                    }
                }
                Err(OrmError::TransactionFailure(Box::new(e)))
            }
        }
    }
}

async fn rollback(conn: &dyn SQLStore) {
    match conn.exec("ROLLBACK", &[]).await {
        Ok(_) => debug!("transaction rolled back"),
        Err(e) => warn!("rollback failed: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openerp_sql::{SQLError, SqliteStore};
    use serde_json::json;

    fn env() -> Environment {
        let store = SqliteStore::open_in_memory().unwrap();
        Environment::new(Arc::new(store), Arc::new(ModelRegistry::new()))
    }

    #[test]
    fn builders_do_not_touch_receiver() {
        let base = env();
        let mut extra = RecordData::new();
        extra.insert("company_id".into(), json!(1));
        let scoped = base.with_user(7).with_lang("fr_FR").with_context(extra);

        assert_eq!(base.uid(), None);
        assert_eq!(base.lang(), "en_US");
        assert!(base.context().is_empty());

        assert_eq!(scoped.uid(), Some(7));
        assert_eq!(scoped.lang(), "fr_FR");
        assert_eq!(scoped.context_value("company_id"), Some(&json!(1)));
    }

    #[test]
    fn from_config_applies_lang_and_policies() {
        let config = EngineConfig::from_toml(
            r#"
            lang = "de_DE"
            [domain]
            combinators = "reject"
            "#,
        )
        .unwrap();
        let store = SqliteStore::open_in_memory().unwrap();
        let env = Environment::from_config(Arc::new(store), Arc::new(ModelRegistry::new()), &config);
        assert_eq!(env.lang(), "de_DE");
        assert_eq!(
            env.domain_config().combinators,
            crate::config::CombinatorPolicy::Reject
        );
    }

    #[tokio::test]
    async fn transaction_commits_and_rolls_back() {
        let env = env();
        env.store()
            .exec("CREATE TABLE t (v INTEGER)", &[])
            .await
            .unwrap();

        env.transaction(|tx| async move {
            assert!(tx.in_transaction());
            tx.store().exec("INSERT INTO t VALUES (1)", &[]).await?;
            Ok::<_, OrmError>(())
        })
        .await
        .unwrap();

        let err = env
            .transaction(|tx| async move {
                tx.store().exec("INSERT INTO t VALUES (2)", &[]).await?;
                Err::<(), _>(OrmError::validation("boom"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, OrmError::TransactionFailure(_)));
        assert_eq!(err.status_code(), 400);

        let rows = env.store().query("SELECT v FROM t", &[]).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_i64("v"), Some(1));
    }

    #[tokio::test]
    async fn nested_transaction_uses_savepoint() {
        let env = env();
        env.store()
            .exec("CREATE TABLE t (v INTEGER)", &[])
            .await
            .unwrap();

        env.transaction(|tx| async move {
            tx.store().exec("INSERT INTO t VALUES (1)", &[]).await?;
            let inner = tx
                .transaction(|inner| async move {
                    inner.store().exec("INSERT INTO t VALUES (2)", &[]).await?;
                    Err::<(), _>(OrmError::validation("inner"))
                })
                .await;
            assert!(inner.is_err());
            Ok::<_, OrmError>(())
        })
        .await
        .unwrap();

        let rows = env.store().query("SELECT v FROM t", &[]).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn escaped_transaction_context_is_released() {
        let env = env();
        let tx = env.transaction(|tx| async move { Ok::<_, OrmError>(tx) }).await.unwrap();
        assert!(tx.store().query("SELECT 1", &[]).await.is_err());
        assert!(env.store().query("SELECT 1", &[]).await.is_ok());
    }

    #[tokio::test]
    async fn savepoint_on_released_connection_fails_as_transaction() {
        let env = env();
        let tx = env.transaction(|tx| async move { Ok::<_, OrmError>(tx) }).await.unwrap();
        assert!(tx.in_transaction());

        let err = tx
            .transaction(|_inner| async move { Ok::<_, OrmError>(()) })
            .await
            .unwrap_err();
        match err {
            OrmError::TransactionFailure(cause) => {
                assert!(matches!(*cause, OrmError::Storage(SQLError::Released)))
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
