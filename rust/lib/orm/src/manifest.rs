//! Declarative modules read from disk.
//!
//! The modules directory holds one sub-directory per module:
//!
//! ```text
//! modules/
//! ├── base/manifest.toml      → module "base"
//! └── sale/manifest.toml      → module "sale"
//! ```
//!
//! A manifest carries the module identity plus entity definitions,
//! extensions and sequence counters:
//!
//! ```toml
//! name = "sale"
//! depends_on = ["base"]
//!
//! [[entities]]
//! name = "sale.order"
//! sequence = { field = "name", code = "sale.order" }
//! fields.name = { type = "char", required = true }
//! fields.partner_id = { type = "reference", relation = "res.partner" }
//!
//! [[extensions]]
//! target = "res.partner"
//! added_fields.customer_rank = { type = "integer", default = 0 }
//!
//! [[sequences]]
//! code = "sale.order"
//! name = "Sales Order"
//! prefix = "SO"
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, warn};

use crate::deps::ModuleManifest;
use crate::entity::{EntityDefinition, EntityExtension};
use crate::error::OrmError;
use crate::module::Module;
use crate::registry::ModelRegistry;
use crate::sequence::SequenceCounter;

pub const MANIFEST_FILE: &str = "manifest.toml";

#[derive(Deserialize)]
struct ManifestFile {
    name: String,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    depends_on: Vec<String>,
    #[serde(default)]
    entities: Vec<EntityDefinition>,
    #[serde(default)]
    extensions: Vec<EntityExtension>,
    #[serde(default)]
    sequences: Vec<SequenceCounter>,
}

/// A module declared in a `manifest.toml`. Entities carry fields only.
#[derive(Debug, Clone)]
pub struct ManifestModule {
    pub manifest: ModuleManifest,
    pub entities: Vec<EntityDefinition>,
    pub extensions: Vec<EntityExtension>,
    pub sequences: Vec<SequenceCounter>,
    /// File the module was read from, if any.
    pub path: Option<PathBuf>,
}

impl ManifestModule {
    pub fn from_toml(content: &str) -> Result<Self, OrmError> {
        let file: ManifestFile =
            toml::from_str(content).map_err(|e| OrmError::Config(e.to_string()))?;
        Ok(Self {
            manifest: ModuleManifest {
                name: file.name,
                version: file.version,
                description: file.description,
                depends_on: file.depends_on,
            },
            entities: file.entities,
            extensions: file.extensions,
            sequences: file.sequences,
            path: None,
        })
    }

    pub fn load(path: &Path) -> Result<Self, OrmError> {
        let content = fs::read_to_string(path)
            .map_err(|e| OrmError::Config(format!("{}: {}", path.display(), e)))?;
        let mut module = Self::from_toml(&content)
            .map_err(|e| OrmError::Config(format!("{}: {}", path.display(), e)))?;
        module.path = Some(path.to_path_buf());
        Ok(module)
    }
}

impl Module for ManifestModule {
    fn manifest(&self) -> &ModuleManifest {
        &self.manifest
    }

    fn register(&self, registry: &ModelRegistry) -> Result<(), OrmError> {
        for entity in &self.entities {
            registry.define(entity.clone());
        }
        for ext in &self.extensions {
            registry.extend(ext.clone());
        }
        Ok(())
    }

    fn sequences(&self) -> Vec<SequenceCounter> {
        self.sequences.clone()
    }
}

/// Read every `*/manifest.toml` under `dir`, sorted by directory name.
/// A missing directory yields no modules.
pub fn load_dir(dir: &Path) -> Result<Vec<ManifestModule>, OrmError> {
    if !dir.is_dir() {
        debug!("modules dir {:?} does not exist, skipping", dir);
        return Ok(Vec::new());
    }

    let entries = fs::read_dir(dir)
        .map_err(|e| OrmError::Config(format!("{}: {}", dir.display(), e)))?;
    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| OrmError::Config(e.to_string()))?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let manifest = path.join(MANIFEST_FILE);
        if manifest.is_file() {
            paths.push(manifest);
        } else {
            warn!("{:?} has no {}, skipping", path, MANIFEST_FILE);
        }
    }
    paths.sort();

    let modules = paths
        .iter()
        .map(|path| ManifestModule::load(path))
        .collect::<Result<Vec<_>, _>>()?;
    debug!("loaded {} module manifests from {:?}", modules.len(), dir);
    Ok(modules)
}
