//! `ormctl`: inspect and install module manifests.
//!
//! Usage:
//!   ormctl [-c <config>] deps
//!   ormctl [-c <config>] schema [entity]
//!   ormctl [-c <config>] install
//!   ormctl [-c <config>] seq next <code>

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use openerp_orm::EngineConfig;
use tracing::debug;

/// Model engine operator tool.
#[derive(Parser, Debug)]
#[command(name = "ormctl", about = "Inspect and install OpenERP module manifests")]
struct Cli {
    /// Path to the engine config file.
    #[arg(short = 'c', long = "config", global = true, default_value = "openerp.toml")]
    config: PathBuf,

    /// SQLite database file (overrides `[database] path`).
    #[arg(long = "db", global = true)]
    db: Option<PathBuf>,

    /// Modules directory (overrides `[modules] dir`).
    #[arg(long = "modules", global = true)]
    modules: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the module load order.
    Deps,

    /// Print CREATE TABLE statements.
    Schema {
        /// Only this entity (default: all loaded entities).
        entity: Option<String>,
    },

    /// Create tables and sequence counters in the database.
    Install,

    /// Sequence counters.
    Seq {
        #[command(subcommand)]
        action: SeqAction,
    },

    /// Show version.
    Version,
}

#[derive(Subcommand, Debug)]
enum SeqAction {
    /// Create a counter (no-op when the code exists).
    Create {
        code: String,
        /// Display name (default: the code).
        #[arg(long)]
        name: Option<String>,
        #[arg(long, default_value = "")]
        prefix: String,
        #[arg(long, default_value = "")]
        suffix: String,
        #[arg(long, default_value_t = 4)]
        padding: u32,
        #[arg(long, default_value_t = 1)]
        start: i64,
        #[arg(long, default_value_t = 1)]
        increment: i64,
        /// Expand %(year), %(month), %(day) in prefix and suffix.
        #[arg(long)]
        dated: bool,
    },
    /// Issue the next code.
    Next {
        code: String,
        /// Date for date tokens, YYYY-MM-DD (default: today, UTC).
        #[arg(long)]
        date: Option<String>,
    },
    /// Show the next code without issuing it.
    Preview {
        code: String,
        #[arg(long)]
        date: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = EngineConfig::load(&cli.config)?;
    if let Some(db) = cli.db {
        config.database.path = Some(db);
    }
    if let Some(dir) = cli.modules {
        config.modules.dir = Some(dir);
    }
    let base = cli
        .config
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let modules_dir = config.resolve_modules_dir(&base);
    debug!("modules dir: {}", modules_dir.display());

    match cli.command {
        Commands::Deps => commands::deps(&modules_dir)?,
        Commands::Schema { entity } => commands::schema(&modules_dir, entity.as_deref())?,
        Commands::Install => commands::install(&config, &modules_dir).await?,
        Commands::Seq { action } => match action {
            SeqAction::Create {
                code,
                name,
                prefix,
                suffix,
                padding,
                start,
                increment,
                dated,
            } => {
                let mut counter = openerp_orm::SequenceCounter::new(&code, name.as_deref().unwrap_or(&code))
                    .with_prefix(&prefix)
                    .with_suffix(&suffix)
                    .with_padding(padding)
                    .starting_at(start)
                    .with_increment(increment);
                counter.use_date_range = dated;
                commands::seq_create(&config, &counter).await?;
            }
            SeqAction::Next { code, date } => {
                let date = commands::parse_date(date.as_deref())?;
                commands::seq_next(&config, &code, date).await?;
            }
            SeqAction::Preview { code, date } => {
                let date = commands::parse_date(date.as_deref())?;
                commands::seq_preview(&config, &code, date).await?;
            }
        },
        Commands::Version => {
            println!("ormctl v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
