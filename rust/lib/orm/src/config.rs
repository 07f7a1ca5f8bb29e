//! Engine configuration.
//!
//! Read from a TOML file; every section is optional and falls back to defaults.
//!
//! ```toml
//! lang = "en_US"
//!
//! [database]
//! path = "/var/lib/openerp/data.sqlite"
//!
//! [domain]
//! unknown_operator = "equality"
//! combinators = "ignore"
//!
//! [modules]
//! dir = "/etc/openerp/modules"
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::OrmError;

/// What the domain translator does with an operator it does not know.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownOperatorPolicy {
    /// Treat the condition as `=` and log a warning.
    #[default]
    Equality,
    /// Fail with a validation error.
    Reject,
}

/// What the domain translator does with `|`, `&` and `!` tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombinatorPolicy {
    /// Skip the token; remaining conditions are AND-joined.
    #[default]
    Ignore,
    /// Fail with a validation error.
    Reject,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file. In-memory when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DomainConfig {
    #[serde(default)]
    pub unknown_operator: UnknownOperatorPolicy,
    #[serde(default)]
    pub combinators: CombinatorPolicy,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModulesConfig {
    /// Directory scanned for `*/manifest.toml`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

/// Configuration shared by the engine and the `ormctl` tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Default locale of new execution contexts.
    #[serde(default = "default_lang")]
    pub lang: String,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub domain: DomainConfig,

    #[serde(default)]
    pub modules: ModulesConfig,
}

fn default_lang() -> String {
    "en_US".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lang: default_lang(),
            database: DatabaseConfig::default(),
            domain: DomainConfig::default(),
            modules: ModulesConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load config from disk, or return default if the file doesn't exist.
    pub fn load(path: &Path) -> Result<Self, OrmError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| OrmError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    /// Parse config from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, OrmError> {
        toml::from_str(content).map_err(|e| OrmError::Config(e.to_string()))
    }

    /// Resolve the modules directory, falling back to `{base}/modules`.
    pub fn resolve_modules_dir(&self, base: &Path) -> PathBuf {
        self.modules
            .dir
            .clone()
            .unwrap_or_else(|| base.join("modules"))
    }
}
