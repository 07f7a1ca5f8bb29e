use std::collections::HashSet;
use std::sync::Arc;

use tracing::{error, info};

use crate::deps::{DependencyGraph, ModuleManifest, check_dependencies};
use crate::env::Environment;
use crate::error::OrmError;
use crate::registry::ModelRegistry;
use crate::schema::create_table_sql;
use crate::sequence::SequenceCounter;

/// A business module contributing entities to the registry.
///
/// Each module (partners, sales, projects, ...) implements this trait to
/// declare its entities and extensions. The loader collects all modules,
/// orders them by their manifests and registers them one at a time.
pub trait Module: Send + Sync {
    /// Name and dependencies of the module.
    fn manifest(&self) -> &ModuleManifest;

    /// Define and extend entities.
    fn register(&self, registry: &ModelRegistry) -> Result<(), OrmError>;

    /// Counters the module's entities number their records from.
    fn sequences(&self) -> Vec<SequenceCounter> {
        Vec::new()
    }
}

/// Loads modules into a registry in dependency order.
#[derive(Default)]
pub struct ModuleLoader {
    modules: Vec<Arc<dyn Module>>,
    /// Loaded modules with the entities each one touched, in load order.
    loaded: Vec<(String, Vec<String>)>,
}

impl ModuleLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, module: impl Module + 'static) -> &mut Self {
        self.modules.push(Arc::new(module));
        self
    }

    pub fn add_all<M: Module + 'static>(&mut self, modules: impl IntoIterator<Item = M>) -> &mut Self {
        for module in modules {
            self.add(module);
        }
        self
    }

    pub fn manifests(&self) -> Vec<ModuleManifest> {
        self.modules.iter().map(|m| m.manifest().clone()).collect()
    }

    /// Names of the loaded modules, in load order.
    pub fn loaded(&self) -> Vec<&str> {
        self.loaded.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Entities touched by the loaded modules, each once, in load order.
    pub fn entities(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.loaded
            .iter()
            .flat_map(|(_, entities)| entities.iter().map(String::as_str))
            .filter(|name| seen.insert(*name))
            .collect()
    }

    /// Register every added module that is not loaded yet.
    ///
    /// Dependencies are checked for all modules before anything is
    /// registered. A module whose registration or compilation fails is rolled
    /// back and loading stops there; modules loaded before it stay loaded.
    /// Returns the names loaded by this call.
    pub fn load(&mut self, registry: &ModelRegistry) -> Result<Vec<String>, OrmError> {
        let manifests = self.manifests();
        let installed: HashSet<String> =
            self.loaded.iter().map(|(name, _)| name.clone()).collect();

        for manifest in &manifests {
            let check = check_dependencies(&manifest.name, &manifests, &installed);
            if !check.valid {
                return Err(OrmError::MissingDependency {
                    module: manifest.name.clone(),
                    missing: check.missing,
                });
            }
        }

        let order = DependencyGraph::from_manifests(&manifests).sort()?;
        let mut newly_loaded = Vec::new();
        for name in order {
            if installed.contains(&name) {
                continue;
            }
            let Some(module) = self.modules.iter().find(|m| m.manifest().name == name) else {
                continue;
            };

            let checkpoint = registry.checkpoint();
            let result = module.register(registry).and_then(|()| {
                let touched = registry.touched_since(&checkpoint);
                for entity in &touched {
                    registry.compile(entity)?;
                }
                Ok(touched)
            });
            match result {
                Ok(touched) => {
                    info!("module {} loaded ({} entities)", name, touched.len());
                    self.loaded.push((name.clone(), touched));
                    newly_loaded.push(name);
                }
                Err(e) => {
                    error!("module {} failed to load: {}", name, e);
                    registry.rollback(checkpoint);
                    return Err(e);
                }
            }
        }
        Ok(newly_loaded)
    }

    /// Create the tables of every loaded entity and the declared counters.
    pub async fn install(&self, env: &Environment) -> Result<(), OrmError> {
        let sequences = env.sequences();
        sequences.ensure_table().await?;

        let entities = self.entities();
        for name in &entities {
            let sql = create_table_sql(env.registry(), name)?;
            env.store().exec(&sql, &[]).await?;
        }

        let mut counters = 0;
        for (name, _) in &self.loaded {
            let Some(module) = self.modules.iter().find(|m| &m.manifest().name == name) else {
                continue;
            };
            for counter in module.sequences() {
                if sequences.create(&counter).await? {
                    counters += 1;
                }
            }
        }
        info!(
            "installed {} tables and {} new sequences",
            entities.len(),
            counters
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityDefinition, EntityExtension};
    use crate::fields::FieldDefinition;

    struct TestModule {
        manifest: ModuleManifest,
        register: fn(&ModelRegistry) -> Result<(), OrmError>,
    }

    fn module(
        name: &str,
        deps: &[&str],
        register: fn(&ModelRegistry) -> Result<(), OrmError>,
    ) -> TestModule {
        TestModule {
            manifest: ModuleManifest::new(name).depends(deps),
            register,
        }
    }

    impl Module for TestModule {
        fn manifest(&self) -> &ModuleManifest {
            &self.manifest
        }

        fn register(&self, registry: &ModelRegistry) -> Result<(), OrmError> {
            (self.register)(registry)
        }
    }

    fn base(registry: &ModelRegistry) -> Result<(), OrmError> {
        registry.define(EntityDefinition::new("res.partner").field("name", FieldDefinition::char()));
        Ok(())
    }

    fn sale(registry: &ModelRegistry) -> Result<(), OrmError> {
        registry.extend(
            EntityExtension::new("res.partner").field("customer_rank", FieldDefinition::integer()),
        );
        registry.define(
            EntityDefinition::new("sale.order")
                .field("partner_id", FieldDefinition::reference("res.partner")),
        );
        Ok(())
    }

    fn broken(registry: &ModelRegistry) -> Result<(), OrmError> {
        registry.extend(
            EntityExtension::new("res.partner").field("bad", FieldDefinition::char().computed("nope")),
        );
        Ok(())
    }

    #[test]
    fn loads_in_dependency_order() {
        let registry = ModelRegistry::new();
        let mut loader = ModuleLoader::new();
        loader.add(module("sale", &["base"], sale));
        loader.add(module("base", &[], base));

        let loaded = loader.load(&registry).unwrap();
        assert_eq!(loaded, vec!["base", "sale"]);
        assert_eq!(loader.entities(), vec!["res.partner", "sale.order"]);
        let partner = registry.compile("res.partner").unwrap();
        assert!(partner.field("customer_rank").is_some());

        assert!(loader.load(&registry).unwrap().is_empty());
    }

    #[test]
    fn missing_dependency_registers_nothing() {
        let registry = ModelRegistry::new();
        let mut loader = ModuleLoader::new();
        loader.add(module("base", &[], base));
        loader.add(module("sale", &["base", "product"], sale));

        let err = loader.load(&registry).unwrap_err();
        match err {
            OrmError::MissingDependency { module, missing } => {
                assert_eq!(module, "sale");
                assert_eq!(missing, vec!["product"]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(registry.names().is_empty());
    }

    #[test]
    fn failing_module_is_rolled_back() {
        let registry = ModelRegistry::new();
        let mut loader = ModuleLoader::new();
        loader.add(module("base", &[], base));
        loader.add(module("broken", &["base"], broken));

        assert!(loader.load(&registry).is_err());
        assert_eq!(loader.loaded(), vec!["base"]);
        assert_eq!(registry.extension_count("res.partner"), 0);
        assert!(registry.compile("res.partner").unwrap().field("bad").is_none());
    }

    #[test]
    fn cycle_is_rejected() {
        let registry = ModelRegistry::new();
        let mut loader = ModuleLoader::new();
        loader.add(module("a", &["b"], base));
        loader.add(module("b", &["a"], base));
        assert!(matches!(
            loader.load(&registry),
            Err(OrmError::CircularDependency { .. })
        ));
    }
}
