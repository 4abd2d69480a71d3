use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use setlog_core::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "setlog")]
#[command(about = "Turn free-text workout logs into structured records", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Override database path
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Use this config file instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database and seed the built-in exercise catalog
    Seed,

    /// Parse a workout description and store it
    Parse {
        /// Free-text workout, e.g. "Bench Press: 3x8 @ 135"
        text: String,

        /// Workout date (YYYY-MM-DD) when the text does not say
        #[arg(long)]
        date: Option<NaiveDate>,

        /// Default weight unit (lbs or kg)
        #[arg(long)]
        unit: Option<String>,
    },

    /// Show how an exercise name would resolve, without calling the LLM
    Resolve {
        name: String,
    },

    /// List auto-created exercises awaiting review
    Review {
        /// Clear the review flag on this exercise
        #[arg(long)]
        approve: Option<String>,
    },

    /// Print a stored workout as JSON
    Show {
        id: Uuid,
    },

    /// Write a config file with default settings
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    setlog_core::logging::init_with_level("warn");

    let cli = Cli::parse();

    match cli.command {
        Commands::InitConfig { force } => {
            let path = cli.config.unwrap_or_else(Config::default_config_path);
            cmd_init_config(&path, force)
        }
        Commands::Seed => {
            let (_, catalog) = open_catalog(cli.config.as_deref(), cli.db.as_deref()).await?;
            cmd_seed(&catalog).await
        }
        Commands::Parse { text, date, unit } => {
            let (config, catalog) = open_catalog(cli.config.as_deref(), cli.db.as_deref()).await?;
            cmd_parse(catalog, &config, text, date, unit).await
        }
        Commands::Resolve { name } => {
            let (config, catalog) = open_catalog(cli.config.as_deref(), cli.db.as_deref()).await?;
            cmd_resolve(catalog, &config, &name).await
        }
        Commands::Review { approve } => {
            let (_, catalog) = open_catalog(cli.config.as_deref(), cli.db.as_deref()).await?;
            cmd_review(&catalog, approve).await
        }
        Commands::Show { id } => {
            let (_, catalog) = open_catalog(cli.config.as_deref(), cli.db.as_deref()).await?;
            cmd_show(&catalog, id).await
        }
    }
}

/// Load config, then open the catalog at `--db` or the configured path
async fn open_catalog(config_path: Option<&Path>, db: Option<&Path>) -> Result<(Config, SqliteCatalog)> {
    let config = match config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    let db_path = db
        .map(Path::to_path_buf)
        .unwrap_or_else(|| config.data.database_path.clone());

    let pool = db::open(
        &db_path,
        config.data.busy_timeout(),
        config.data.max_connections,
    )
    .await?;
    tracing::debug!(db = %db_path.display(), "Opened database");
    let embedder = Arc::new(LocalHashEmbedder::new(config.embedding.dimensions));
    let catalog = SqliteCatalog::new(pool, embedder);
    Ok((config, catalog))
}

fn cmd_init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        return Err(Error::Config(format!(
            "{} already exists; pass --force to overwrite",
            path.display()
        )));
    }
    Config::default().save_to(path)?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}

async fn cmd_seed(catalog: &SqliteCatalog) -> Result<()> {
    let inserted = catalog.seed_defaults().await?;
    let total = catalog.count().await?;
    println!("Seeded {} exercises ({} in catalog)", inserted, total);
    Ok(())
}

async fn cmd_parse(
    catalog: SqliteCatalog,
    config: &Config,
    text: String,
    date: Option<NaiveDate>,
    unit: Option<String>,
) -> Result<()> {
    let mut input = RawInput::new(text);
    if let Some(date) = date {
        input = input.with_date(date);
    }
    if let Some(unit) = unit {
        let unit = WeightUnit::parse(&unit)
            .ok_or_else(|| Error::Config(format!("Unknown weight unit: {}", unit)))?;
        input = input.with_weight_unit(unit);
    }

    if catalog.count().await? == 0 {
        eprintln!("Catalog is empty; run `setlog seed` first for better matching.");
    }

    let llm = Arc::new(OpenAiCompatibleClient::new(config.llm.clone())?);
    let pipeline = Pipeline::new(llm, catalog, config);

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    match pipeline.parse(input, &cancel).await {
        Ok(parsed) => {
            println!("{}", serde_json::to_string_pretty(&parsed)?);
            for exercise in &parsed.created_exercises {
                eprintln!(
                    "New exercise '{}' ({}) added for review",
                    exercise.name, exercise.slug
                );
            }
            Ok(())
        }
        Err(failure) => {
            eprintln!("Parse failed while {}", failure.stage);
            if failure.is_retryable() {
                eprintln!("This error is transient; retrying may succeed.");
            }
            Err(failure.error)
        }
    }
}

async fn cmd_resolve(catalog: SqliteCatalog, config: &Config, name: &str) -> Result<()> {
    // Explain mode never calls the model; the client is only needed to
    // build the resolver.
    let llm = Arc::new(OpenAiCompatibleClient::new(config.llm.clone())?);
    let resolver = Resolver::new(
        Arc::new(catalog),
        llm,
        config.resolver.clone(),
        config.llm.timeout(),
    );

    let explanation = resolver.explain(name).await?;
    println!("{}", serde_json::to_string_pretty(&explanation)?);
    Ok(())
}

async fn cmd_review(catalog: &SqliteCatalog, approve: Option<String>) -> Result<()> {
    if let Some(slug) = approve {
        if !catalog.mark_reviewed(&slug).await? {
            return Err(Error::Other(format!("No exercise with slug '{}'", slug)));
        }
        println!("Approved {}", normalize_name(&slug));
        return Ok(());
    }

    let queue = catalog.list_needs_review().await?;
    if queue.is_empty() {
        println!("No exercises awaiting review");
        return Ok(());
    }

    println!("{} exercise(s) awaiting review:", queue.len());
    for exercise in queue {
        println!("  {:<32} {}", exercise.slug, exercise.name);
    }
    Ok(())
}

async fn cmd_show(catalog: &SqliteCatalog, id: Uuid) -> Result<()> {
    let store = WorkoutStore::new(catalog.pool().clone(), catalog.embedder());
    match store.load_workout(id).await? {
        Some(workout) => {
            println!("{}", serde_json::to_string_pretty(&workout)?);
            Ok(())
        }
        None => Err(Error::Other(format!("Workout {} not found", id))),
    }
}
