use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use chrono::NaiveDate;
use openerp_orm::{
    EngineConfig, Environment, ModelRegistry, ModuleLoader, SequenceCounter, create_table_sql,
    load_dir,
};
use openerp_sql::{SQLStore, SqliteStore};
use tracing::{info, warn};

/// Read the manifests under `dir` and load them into `registry`.
fn load_modules(dir: &Path, registry: &ModelRegistry) -> anyhow::Result<ModuleLoader> {
    let modules = load_dir(dir)?;
    if modules.is_empty() {
        warn!("no modules found in {}", dir.display());
    }
    let mut loader = ModuleLoader::new();
    loader.add_all(modules);
    loader
        .load(registry)
        .with_context(|| format!("loading modules from {}", dir.display()))?;
    Ok(loader)
}

fn open_store(config: &EngineConfig) -> anyhow::Result<Arc<dyn SQLStore>> {
    let store = match &config.database.path {
        Some(path) => {
            info!("opening database {}", path.display());
            SqliteStore::open(path)
                .map_err(|e| anyhow::anyhow!("failed to open {}: {}", path.display(), e))?
        }
        None => {
            warn!("no database configured, using an in-memory database");
            SqliteStore::open_in_memory()?
        }
    };
    Ok(Arc::new(store))
}

fn environment(config: &EngineConfig, registry: Arc<ModelRegistry>) -> anyhow::Result<Environment> {
    Ok(Environment::from_config(open_store(config)?, registry, config))
}

pub fn parse_date(date: Option<&str>) -> anyhow::Result<Option<NaiveDate>> {
    date.map(|d| {
        NaiveDate::parse_from_str(d, "%Y-%m-%d")
            .with_context(|| format!("invalid date '{d}', expected YYYY-MM-DD"))
    })
    .transpose()
}

pub fn deps(dir: &Path) -> anyhow::Result<()> {
    let registry = ModelRegistry::new();
    let loader = load_modules(dir, &registry)?;
    for (i, name) in loader.loaded().iter().enumerate() {
        println!("{:>3}  {}", i + 1, name);
    }
    Ok(())
}

pub fn schema(dir: &Path, entity: Option<&str>) -> anyhow::Result<()> {
    let registry = ModelRegistry::new();
    let loader = load_modules(dir, &registry)?;
    let names: Vec<&str> = match entity {
        Some(name) => vec![name],
        None => loader.entities(),
    };
    for name in names {
        println!("{};\n", create_table_sql(&registry, name)?);
    }
    Ok(())
}

pub async fn install(config: &EngineConfig, dir: &Path) -> anyhow::Result<()> {
    let registry = Arc::new(ModelRegistry::new());
    let loader = load_modules(dir, &registry)?;
    let env = environment(config, registry)?;
    loader.install(&env).await?;
    println!(
        "installed {} modules, {} entities",
        loader.loaded().len(),
        loader.entities().len()
    );
    Ok(())
}

pub async fn seq_create(config: &EngineConfig, counter: &SequenceCounter) -> anyhow::Result<()> {
    let env = environment(config, Arc::new(ModelRegistry::new()))?;
    let sequences = env.sequences();
    sequences.ensure_table().await?;
    if sequences.create(counter).await? {
        println!("created sequence {}", counter.code);
    } else {
        println!("sequence {} already exists", counter.code);
    }
    Ok(())
}

pub async fn seq_next(
    config: &EngineConfig,
    code: &str,
    date: Option<NaiveDate>,
) -> anyhow::Result<()> {
    let env = environment(config, Arc::new(ModelRegistry::new()))?;
    println!("{}", env.sequences().next(code, date).await?);
    Ok(())
}

pub async fn seq_preview(
    config: &EngineConfig,
    code: &str,
    date: Option<NaiveDate>,
) -> anyhow::Result<()> {
    let env = environment(config, Arc::new(ModelRegistry::new()))?;
    match env.sequences().preview(code, date).await? {
        Some(next) => println!("{next}"),
        None => anyhow::bail!("no active sequence with code '{code}'"),
    }
    Ok(())
}
