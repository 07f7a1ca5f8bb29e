#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use openerp_orm::{
    EntityDefinition, EntityExtension, Environment, FieldDefinition, Module, ModelRegistry,
    ModuleLoader, ModuleManifest, OnDelete, OrmError, RecordData, SequenceCounter, method,
};
use openerp_sql::{Row, SQLError, SQLStore, SqliteStore, Value};
use serde_json::{Value as Json, json};

/// Wraps a store and records every statement sent through it.
#[derive(Clone)]
pub struct CountingStore {
    inner: Arc<dyn SQLStore>,
    statements: Arc<Mutex<Vec<String>>>,
    count: Arc<AtomicUsize>,
}

impl CountingStore {
    pub fn new(inner: Arc<dyn SQLStore>) -> Self {
        Self {
            inner,
            statements: Arc::new(Mutex::new(Vec::new())),
            count: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn statements(&self) -> Vec<String> {
        self.statements.lock().unwrap().clone()
    }

    pub fn reset(&self) {
        self.count.store(0, Ordering::SeqCst);
        self.statements.lock().unwrap().clear();
    }

    fn record(&self, sql: &str) {
        self.count.fetch_add(1, Ordering::SeqCst);
        self.statements.lock().unwrap().push(sql.to_string());
    }
}

#[async_trait]
impl SQLStore for CountingStore {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, SQLError> {
        self.record(sql);
        self.inner.query(sql, params).await
    }

    async fn exec(&self, sql: &str, params: &[Value]) -> Result<u64, SQLError> {
        self.record(sql);
        self.inner.exec(sql, params).await
    }

    async fn checkout(&self) -> Result<Arc<dyn SQLStore>, SQLError> {
        let conn = self.inner.checkout().await?;
        Ok(Arc::new(CountingStore {
            inner: conn,
            statements: Arc::clone(&self.statements),
            count: Arc::clone(&self.count),
        }))
    }

    fn release(&self) {
        self.inner.release();
    }
}

pub struct DemoModule {
    manifest: ModuleManifest,
    register: fn(&ModelRegistry),
    sequences: Vec<SequenceCounter>,
}

impl Module for DemoModule {
    fn manifest(&self) -> &ModuleManifest {
        &self.manifest
    }

    fn register(&self, registry: &ModelRegistry) -> Result<(), OrmError> {
        (self.register)(registry);
        Ok(())
    }

    fn sequences(&self) -> Vec<SequenceCounter> {
        self.sequences.clone()
    }
}

fn register_base(registry: &ModelRegistry) {
    registry.define(
        EntityDefinition::new("res.partner")
            .with_order("name")
            .field("name", FieldDefinition::char().required())
            .field("email", FieldDefinition::char())
            .field("active", FieldDefinition::boolean().with_default(json!(true)))
            .field("customer_rank", FieldDefinition::integer().with_default(json!(0)))
            .field(
                "parent_id",
                FieldDefinition::reference("res.partner").on_delete(OnDelete::SetNull),
            )
            .field("child_ids", FieldDefinition::inverse("res.partner", "parent_id"))
            .field("lang", FieldDefinition::char().with_default_fn(|env: &Environment| json!(env.lang())))
            .field(
                "display_name",
                FieldDefinition::char().computed("compute_display_name"),
            )
            .method(
                "compute_display_name",
                method(|_rs, row, _parent| async move {
                    let name = row.get("name").and_then(Json::as_str).unwrap_or_default();
                    Ok(match row.get("email").and_then(Json::as_str) {
                        Some(email) => json!(format!("{name} <{email}>")),
                        None => json!(name),
                    })
                }),
            )
            .method(
                "describe",
                method(|_rs, _args, _parent| async move { Ok(json!(["base"])) }),
            ),
    );
}

fn register_sale(registry: &ModelRegistry) {
    registry.extend(
        EntityExtension::new("res.partner")
            .field("sale_warn", FieldDefinition::text())
            .method(
                "describe",
                method(|rs, args, parent| async move {
                    let mut trail = parent.call(rs, args).await?;
                    if let Some(list) = trail.as_array_mut() {
                        list.push(json!("sale"));
                    }
                    Ok(trail)
                }),
            ),
    );

    registry.define(
        EntityDefinition::new("sale.order")
            .with_order("id desc")
            .with_sequence("name", "sale.order")
            .field("name", FieldDefinition::char().required().unique())
            .field(
                "partner_id",
                FieldDefinition::reference("res.partner")
                    .required()
                    .on_delete(OnDelete::Restrict),
            )
            .field(
                "state",
                FieldDefinition::selection(&[
                    ("draft", "Quotation"),
                    ("sent", "Quotation Sent"),
                    ("sale", "Sales Order"),
                    ("cancel", "Cancelled"),
                ])
                .with_default(json!("draft")),
            )
            .field("amount_total", FieldDefinition::monetary().with_default(json!(0.0)))
            .field("date_order", FieldDefinition::date())
            .field("line_ids", FieldDefinition::inverse("sale.order.line", "order_id"))
            .method(
                "action_confirm",
                method(|rs, _args, _parent| async move {
                    let mut rs = rs;
                    let mut values = RecordData::new();
                    values.insert("state".into(), json!("sale"));
                    rs.write(values).await?;
                    Ok(json!(rs.ids()))
                }),
            ),
    );

    registry.define(
        EntityDefinition::new("sale.order.line")
            .field(
                "order_id",
                FieldDefinition::reference("sale.order")
                    .required()
                    .on_delete(OnDelete::Cascade),
            )
            .field("product", FieldDefinition::char().required())
            .field("qty", FieldDefinition::float().with_default(json!(1.0)))
            .field("price_unit", FieldDefinition::float())
            .field(
                "price_subtotal",
                FieldDefinition::monetary()
                    .computed("compute_subtotal")
                    .stored(),
            )
            .method(
                "compute_subtotal",
                method(|_rs, row, _parent| async move {
                    let qty = row.get("qty").and_then(Json::as_f64).unwrap_or(0.0);
                    let price = row.get("price_unit").and_then(Json::as_f64).unwrap_or(0.0);
                    Ok(json!(qty * price))
                }),
            ),
    );
}

fn register_crm(registry: &ModelRegistry) {
    registry.extend(EntityExtension::new("res.partner").method(
        "describe",
        method(|rs, args, parent| async move {
            if args.get("fail").and_then(Json::as_bool) == Some(true) {
                return Err(OrmError::validation("crm refused"));
            }
            let mut trail = parent.call(rs, args).await?;
            if let Some(list) = trail.as_array_mut() {
                list.push(json!("crm"));
            }
            Ok(trail)
        }),
    ));
}

pub fn demo_modules() -> Vec<DemoModule> {
    vec![
        DemoModule {
            manifest: ModuleManifest::new("crm").depends(&["sale"]),
            register: register_crm,
            sequences: Vec::new(),
        },
        DemoModule {
            manifest: ModuleManifest::new("sale").depends(&["base"]),
            register: register_sale,
            sequences: vec![SequenceCounter::new("sale.order", "Sales Order").with_prefix("SO")],
        },
        DemoModule {
            manifest: ModuleManifest::new("base"),
            register: register_base,
            sequences: Vec::new(),
        },
    ]
}

pub struct Harness {
    pub env: Environment,
    pub store: CountingStore,
    pub registry: Arc<ModelRegistry>,
    pub loader: ModuleLoader,
}

/// In-memory database with the demo modules installed.
pub async fn setup() -> Harness {
    let sqlite: Arc<dyn SQLStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
    let store = CountingStore::new(sqlite);
    let registry = Arc::new(ModelRegistry::new());

    let mut loader = ModuleLoader::new();
    loader.add_all(demo_modules());
    loader.load(&registry).unwrap();

    let env = Environment::new(Arc::new(store.clone()), Arc::clone(&registry));
    loader.install(&env).await.unwrap();
    store.reset();

    Harness {
        env,
        store,
        registry,
        loader,
    }
}

pub fn values(value: Json) -> RecordData {
    match value {
        Json::Object(map) => map,
        other => panic!("expected an object, got {other}"),
    }
}
