pub mod config;
pub mod deps;
pub mod domain;
pub mod entity;
pub mod env;
pub mod error;
pub mod fields;
pub mod manifest;
pub mod method;
pub mod module;
pub mod recordset;
pub mod registry;
pub mod schema;
pub mod sequence;

pub use config::{CombinatorPolicy, DomainConfig, EngineConfig, UnknownOperatorPolicy};
pub use deps::{DependencyCheck, DependencyGraph, ModuleManifest, check_dependencies, topological_sort};
pub use domain::{Domain, Operator, SqlFilter};
pub use entity::{CompiledEntity, EntityDefinition, EntityExtension, SequencePolicy};
pub use env::Environment;
pub use error::OrmError;
pub use fields::{FieldDefinition, FieldType, OnDelete, RecordData};
pub use manifest::{ManifestModule, load_dir};
pub use method::{MethodChain, MethodFn, Parent, method};
pub use module::{Module, ModuleLoader};
pub use recordset::{Model, Recordset, SearchOptions};
pub use registry::{Checkpoint, ModelRegistry};
pub use schema::create_table_sql;
pub use sequence::{SequenceCounter, SequenceGenerator, format_code};
