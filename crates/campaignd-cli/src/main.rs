mod campaign_cmds;
mod config;
mod serve;

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::fmt::writer::MakeWriterExt;

use campaignd_core::lifecycle::{self, LifecycleConfig};
use campaignd_core::notify::{Notifier, SmtpConfig};
use campaignd_db::pool;

use config::CampaigndConfig;

#[derive(Parser)]
#[command(name = "campaignd", about = "Lead-generation campaign orchestrator")]
struct Cli {
    /// Database URL (overrides CAMPAIGND_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a campaignd config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/campaignd")]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the campaignd database (requires config file or env vars)
    DbInit,
    /// Start the Management API and cron scheduler
    Serve {
        /// Port to bind (overrides config/env)
        #[arg(long)]
        port: Option<u16>,
        /// Address to bind
        #[arg(long, default_value = "0.0.0.0")]
        bind: String,
    },
    /// Campaign management
    Campaign {
        #[command(subcommand)]
        command: CampaignCommands,
    },
}

#[derive(Subcommand)]
enum CampaignCommands {
    /// Create a campaign from a JSON config file
    Create {
        /// Path to the campaign config JSON file
        file: PathBuf,
        /// Campaign name
        #[arg(long)]
        name: String,
        /// Campaign description
        #[arg(long)]
        description: Option<String>,
        /// Project ID to stamp onto every step
        #[arg(long)]
        project_id: Option<String>,
    },
    /// List campaigns
    List {
        /// Filter by status: active, paused, archived
        #[arg(long)]
        status: Option<String>,
        /// Filter by project ID
        #[arg(long)]
        project_id: Option<String>,
    },
    /// Show campaign details and recent runs
    Show {
        /// Campaign ID
        campaign_id: String,
    },
    /// Pause a campaign
    Pause {
        /// Campaign ID
        campaign_id: String,
    },
    /// Resume a paused campaign
    Resume {
        /// Campaign ID
        campaign_id: String,
    },
    /// Delete a campaign
    Delete {
        /// Campaign ID
        campaign_id: String,
    },
    /// Run a campaign to completion synchronously
    Run {
        /// Campaign ID
        campaign_id: String,
    },
}

/// Execute the `campaignd init` command: write config file.
fn cmd_init(db_url: &str, force: bool) -> anyhow::Result<()> {
    let path = config::write_starter_config(db_url, force)?;
    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!();
    println!("Next: run `campaignd db-init` to create and migrate the database.");
    Ok(())
}

/// Execute the `campaignd db-init` command: create database and run migrations.
async fn cmd_db_init(cli_db_url: Option<&str>) -> anyhow::Result<()> {
    let resolved = CampaigndConfig::resolve(cli_db_url, None)?;

    println!("Initializing campaignd database...");

    pool::ensure_database_exists(&resolved.db_config).await?;
    let db_pool = pool::create_pool(&resolved.db_config).await?;

    let migrations_path = pool::default_migrations_path();
    pool::run_migrations(&db_pool, migrations_path).await?;

    let counts = pool::table_counts(&db_pool).await?;
    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }

    db_pool.close().await;

    println!("campaignd db-init complete.");
    Ok(())
}

fn notifier_from(resolved: &CampaigndConfig) -> Notifier {
    let smtp = resolved.smtp.as_ref().map(|s| SmtpConfig {
        host: s.host.clone(),
        port: s.port,
        username: s.username.clone(),
        password: s.password.clone(),
        from: s.from.clone(),
    });
    Notifier::new(smtp.as_ref())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Resolved ahead of `Cli::parse()` so a bad CLI arg still logs at the
    // configured level; this pass ignores `--database-url`/`--port`, which
    // don't affect logging setup.
    let log_config = CampaigndConfig::resolve(None, None).ok();
    let log_level = log_config.as_ref().map(|c| c.log_level.clone()).unwrap_or_else(|| "info".to_owned());
    let log_file = log_config.as_ref().and_then(|c| c.log_file.clone());

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    // Held for the process lifetime: dropping it stops the background flush
    // thread and would silently cut off file logging.
    let _log_file_guard = if let Some(path) = log_file {
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| std::path::Path::new("."));
        let filename = path.file_name().map(|f| f.to_owned()).unwrap_or_else(|| std::ffi::OsString::from("campaignd.log"));
        let file_appender = tracing_appender::rolling::daily(dir, filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stdout.and(non_blocking))
            .init();
        Some(guard)
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
        None
    };

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { db_url, force } => {
            cmd_init(&db_url, force)?;
        }
        Commands::DbInit => {
            cmd_db_init(cli.database_url.as_deref()).await?;
        }
        Commands::Serve { port, bind } => {
            let resolved = CampaigndConfig::resolve(cli.database_url.as_deref(), port)?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;

            let pool = Arc::new(db_pool.clone());
            let client = Arc::new(reqwest::Client::new());
            let notifier = Arc::new(notifier_from(&resolved));
            let timezone = chrono_tz::Tz::from_str(&resolved.timezone).unwrap_or(chrono_tz::Tz::UTC);

            let lifecycle_config = LifecycleConfig {
                enable_cron_on_startup: resolved.enable_cron_on_startup,
                ..Default::default()
            };

            let orchestrator = lifecycle::start(Arc::clone(&pool), Arc::clone(&client), Arc::clone(&notifier), &lifecycle_config).await?;

            let state = serve::AppState {
                pool: db_pool,
                client,
                scheduler: orchestrator.scheduler,
                notifier,
                timezone,
            };

            serve::run_serve(state, &bind, resolved.port).await?;
        }
        Commands::Campaign { command } => {
            let resolved = CampaigndConfig::resolve(cli.database_url.as_deref(), None)?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;

            let result = run_campaign_command(command, &db_pool, &resolved).await;
            db_pool.close().await;
            result?;
        }
    }

    Ok(())
}

async fn run_campaign_command(command: CampaignCommands, db_pool: &sqlx::PgPool, resolved: &CampaigndConfig) -> anyhow::Result<()> {
    match command {
        CampaignCommands::Create {
            file,
            name,
            description,
            project_id,
        } => {
            campaign_cmds::run_create(db_pool, &file, &name, description.as_deref(), project_id.as_deref()).await?;
        }
        CampaignCommands::List { status, project_id } => {
            campaign_cmds::run_list(db_pool, status.as_deref(), project_id.as_deref()).await?;
        }
        CampaignCommands::Show { campaign_id } => {
            campaign_cmds::run_show(db_pool, &campaign_id).await?;
        }
        CampaignCommands::Pause { campaign_id } => {
            campaign_cmds::run_pause(db_pool, &campaign_id).await?;
        }
        CampaignCommands::Resume { campaign_id } => {
            campaign_cmds::run_resume(db_pool, &campaign_id).await?;
        }
        CampaignCommands::Delete { campaign_id } => {
            campaign_cmds::run_delete(db_pool, &campaign_id).await?;
        }
        CampaignCommands::Run { campaign_id } => {
            let client = Arc::new(reqwest::Client::new());
            let notifier = notifier_from(resolved);
            let timezone = chrono_tz::Tz::from_str(&resolved.timezone).unwrap_or(chrono_tz::Tz::UTC);
            campaign_cmds::run_trigger(db_pool, client, &notifier, timezone, &campaign_id)
                .await
                .context("campaign run failed")?;
        }
    }
    Ok(())
}
