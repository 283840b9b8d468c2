//! dsnet CLI - privacy-preserving search network client

use anyhow::{Context, anyhow};
use clap::{Parser, Subcommand};
use dsnet_core::config::Config;
use dsnet_core::credentials::{CredentialState, HttpCredentialAuthority};
use dsnet_core::engine::Engine;
use dsnet_core::index::{LocalIndex, MemoryIndex};
use dsnet_core::query::{QueryPayload, QueryRecord, QueryState};
use dsnet_core::storage::{Database, DatabaseConfig, now_millis};
use dsnet_core::transport::HttpRelay;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "dsnet")]
#[command(author, version, about = "Privacy-preserving search network client", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Anonymous credential management
    Tokens {
        #[command(subcommand)]
        action: TokenAction,
    },

    /// Submit a search query
    Query {
        /// Search terms
        text: String,
        /// Complete after this many distinct responses; identical answers count
        /// once (open-ended if omitted)
        #[arg(short, long)]
        expect: Option<u16>,
        /// Seconds before the query expires
        #[arg(short, long)]
        deadline_secs: Option<u64>,
        /// Poll for responses until the query finishes
        #[arg(short, long)]
        wait: bool,
    },

    /// Inspect and manage submitted queries
    Queries {
        #[command(subcommand)]
        action: QueryAction,
    },

    /// Expire queries whose deadline has passed
    Sweep,

    /// Answer inbound queries and collect responses until interrupted
    Listen {
        /// File with one entity name per line to answer from
        #[arg(short, long)]
        entities: Option<PathBuf>,
    },

    /// Show credential and query counts
    Status,

    /// Apply database migrations
    Migrate,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum TokenAction {
    /// Obtain new credentials from the authority
    Acquire {
        #[arg(default_value_t = 10)]
        count: u32,
    },
    /// List stored credentials
    List {
        /// Filter by state (unused, reserved, spent)
        #[arg(short, long)]
        state: Option<String>,
    },
    /// Drop unused credentials older than the configured TTL
    Expire,
}

#[derive(Subcommand)]
enum QueryAction {
    /// List queries
    List {
        /// Filter by state
        #[arg(short, long)]
        state: Option<String>,
        #[arg(short, long, default_value_t = 50)]
        limit: i64,
    },
    /// Show a query and its responses
    Show { id: Uuid },
    /// Cancel a query that has not finished
    Cancel { id: Uuid },
    /// Complete an open-ended query that has responses
    Close { id: Uuid },
    /// Retry submission of a created or submitting query
    Resume { id: Uuid },
    /// Delete finished queries past the retention window
    Purge,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a config value
    Get { key: String },
    /// Set a config value
    Set { key: String, value: String },
    /// List all config values
    List,
    /// Reset to defaults
    Reset,
    /// Show config file path
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("dsnet=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Config { action } => cmd_config(action, cli.quiet),
        Commands::Migrate => cmd_migrate(cli.quiet).await,
        Commands::Tokens { action } => {
            let engine = open_engine(None).await?;
            cmd_tokens(&engine, action, cli.quiet).await
        }
        Commands::Query {
            text,
            expect,
            deadline_secs,
            wait,
        } => {
            let engine = open_engine(None).await?;
            cmd_query(&engine, &text, expect, deadline_secs, wait, cli.quiet).await
        }
        Commands::Queries { action } => {
            let engine = open_engine(None).await?;
            cmd_queries(&engine, action, cli.quiet).await
        }
        Commands::Sweep => {
            let engine = open_engine(None).await?;
            cmd_sweep(&engine, cli.quiet).await
        }
        Commands::Listen { entities } => cmd_listen(entities, cli.quiet).await,
        Commands::Status => {
            let engine = open_engine(None).await?;
            cmd_status(&engine).await
        }
    }
}

/// Engine over the configured database, relay and authority
async fn open_engine(index: Option<Arc<dyn LocalIndex>>) -> anyhow::Result<Engine> {
    let config = Config::load()?;
    let database = Database::open(config.database_path()).await?;
    let authority = HttpCredentialAuthority::from_config(&config.network)?;
    let relay = HttpRelay::from_config(&config.network)?;

    let mut builder = Engine::builder()
        .config(config)
        .database(database)
        .authority(Arc::new(authority))
        .transport(Arc::new(relay));
    if let Some(index) = index {
        builder = builder.index(index);
    }

    Ok(builder.build()?)
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn cmd_tokens(engine: &Engine, action: TokenAction, quiet: bool) -> anyhow::Result<()> {
    match action {
        TokenAction::Acquire { count } => {
            let acquired = engine.acquire(count).await?;
            if !quiet {
                println!("Acquired {} credentials.", acquired.len());
                print_inventory(engine).await?;
            }
        }
        TokenAction::List { state } => {
            let state = state
                .as_deref()
                .map(|s| {
                    CredentialState::from_str(s).ok_or_else(|| anyhow!("Unknown credential state: {}", s))
                })
                .transpose()?;

            let credentials = engine.list_credentials(state).await?;
            if credentials.is_empty() {
                if !quiet {
                    println!("No credentials found.");
                    println!("\nAcquire some with: dsnet tokens acquire");
                }
            } else {
                for credential in credentials {
                    println!(
                        "{}  {:<8}  {}  issued {}",
                        credential.id,
                        credential.state.as_str(),
                        credential.fingerprint(),
                        credential.issued_at.format("%Y-%m-%d %H:%M")
                    );
                }
            }
        }
        TokenAction::Expire => {
            let removed = engine.expire_tokens().await?;
            if !quiet {
                println!("Expired {} unused credentials.", removed);
            }
        }
    }
    Ok(())
}

async fn cmd_query(
    engine: &Engine,
    text: &str,
    expect: Option<u16>,
    deadline_secs: Option<u64>,
    wait: bool,
    quiet: bool,
) -> anyhow::Result<()> {
    let query = engine.new_query(
        QueryPayload::cleartext(text),
        expect,
        deadline_secs.map(Duration::from_secs),
    );
    let id = query.id;

    let record = engine
        .submit(query)
        .await
        .with_context(|| format!("Query {} was not submitted", id))?;

    if !quiet {
        println!("Query {} is {}.", id, record.state);
        println!("  Deadline: {}", record.query.deadline.format("%Y-%m-%d %H:%M:%S"));
    }

    if !wait {
        if !quiet {
            println!("\nCheck progress with: dsnet queries show {}", id);
        }
        return Ok(());
    }

    let poll_every = Duration::from_millis(engine.config().aggregation.poll_interval_ms);
    let record = loop {
        tokio::time::sleep(poll_every).await;
        if let Err(e) = engine.poll_once().await {
            warn!(error = %e, "Relay poll failed");
        }

        let record = engine.get_query(id).await?;
        if record.is_terminal() {
            break record;
        }
        if now_millis() >= record.query.deadline {
            engine.sweep_expired(now_millis()).await?;
            break engine.get_query(id).await?;
        }
    };

    print_record(&record);
    Ok(())
}

async fn cmd_queries(engine: &Engine, action: QueryAction, quiet: bool) -> anyhow::Result<()> {
    match action {
        QueryAction::List { state, limit } => {
            let state = state
                .as_deref()
                .map(|s| QueryState::from_str(s).ok_or_else(|| anyhow!("Unknown query state: {}", s)))
                .transpose()?;

            let queries = engine.list_queries(state, limit).await?;
            if queries.is_empty() {
                if !quiet {
                    println!("No queries found.");
                }
                return Ok(());
            }

            for q in queries {
                let expected = q
                    .expected_responses
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| "-".to_string());
                let reason = q
                    .failure_reason
                    .map(|r| format!(" ({})", r))
                    .unwrap_or_default();
                println!(
                    "{}  {:<18}{}  responses {}/{}  created {}",
                    q.id,
                    q.state.as_str(),
                    reason,
                    q.response_count,
                    expected,
                    q.created_at.format("%Y-%m-%d %H:%M")
                );
            }
        }
        QueryAction::Show { id } => {
            let record = engine.get_query(id).await?;
            print_record(&record);
        }
        QueryAction::Cancel { id } => {
            let record = engine.cancel(id).await?;
            if !quiet {
                println!("Query {} cancelled.", record.id());
            }
        }
        QueryAction::Close { id } => {
            let record = engine.close(id).await?;
            if !quiet {
                if record.state == QueryState::Completed {
                    println!("Query {} completed with {} responses.", id, record.responses.len());
                } else {
                    println!("Query {} has no responses yet and stays {}.", id, record.state);
                }
            }
        }
        QueryAction::Resume { id } => {
            let record = engine.resume(id).await?;
            if !quiet {
                println!("Query {} is {}.", id, record.state);
            }
        }
        QueryAction::Purge => {
            let purged = engine.purge_old_records().await?;
            if !quiet {
                println!("Purged {} finished queries.", purged);
            }
        }
    }
    Ok(())
}

async fn cmd_sweep(engine: &Engine, quiet: bool) -> anyhow::Result<()> {
    let result = engine.sweep_expired(now_millis()).await?;
    if !quiet {
        println!(
            "Expired {} queries, completed {} open-ended queries.",
            result.expired.len(),
            result.completed.len()
        );
    }
    Ok(())
}

async fn cmd_listen(entities: Option<PathBuf>, quiet: bool) -> anyhow::Result<()> {
    let index: Option<Arc<dyn LocalIndex>> = match entities {
        Some(path) => {
            let index = MemoryIndex::from_file(&path).await?;
            info!(entities = index.len().await, path = %path.display(), "Loaded local index");
            Some(Arc::new(index))
        }
        None => None,
    };

    let engine = open_engine(index).await?;
    let recovered = engine.recover().await?;
    if !quiet {
        println!(
            "Recovered {} queries ({} failed), released {} credentials.",
            recovered.resumed.len(),
            recovered.failed.len(),
            recovered.released
        );
        if engine.is_answering() {
            println!("Answering inbound queries. Press Ctrl-C to stop.");
        } else {
            println!("Collecting responses only (no --entities). Press Ctrl-C to stop.");
        }
    }

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal.cancel();
        }
    });

    engine.run(shutdown).await?;
    engine.shutdown();
    engine.database().close().await;
    Ok(())
}

async fn cmd_status(engine: &Engine) -> anyhow::Result<()> {
    println!("dsnet status");
    println!("============");
    print_inventory(engine).await?;

    println!("\nQueries:");
    let counts = engine.count_by_state().await?;
    if counts.is_empty() {
        println!("  none");
    }
    for (state, count) in counts {
        println!("  {:<18} {}", state.as_str(), count);
    }
    Ok(())
}

async fn cmd_migrate(quiet: bool) -> anyhow::Result<()> {
    let config = Config::load()?;
    let path = config.database_path();
    let db = Database::new(DatabaseConfig::with_path(&path).no_migrate()).await?;

    let before = db.migration_status().await?;
    if before.needs_migration {
        db.migrate().await?;
    }

    if !quiet {
        println!("Database: {}", path.display());
        if before.needs_migration {
            println!(
                "Migrated schema from version {} to {}.",
                before.current_version, before.target_version
            );
        } else {
            println!("Schema is up to date (version {}).", before.current_version);
        }
    }
    db.close().await;
    Ok(())
}

fn cmd_config(action: ConfigAction, quiet: bool) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => {
            let config = Config::load()?;
            let value = config.get(&key)?;
            println!("{}", value);
        }
        ConfigAction::Set { key, value } => {
            let mut config = Config::load()?;
            config.set(&key, &value)?;
            config.save()?;
            if !quiet {
                println!("Set {} = {}", key, value);
            }
        }
        ConfigAction::List => {
            let config = Config::load()?;
            for (key, value) in config.list()? {
                println!("{} = {}", key, value);
            }
        }
        ConfigAction::Reset => {
            Config::reset()?;
            if !quiet {
                println!("Configuration reset to defaults.");
            }
        }
        ConfigAction::Path => {
            let path = Config::config_path()?;
            println!("{}", path.display());
        }
    }
    Ok(())
}

// ============================================================================
// Output helpers
// ============================================================================

async fn print_inventory(engine: &Engine) -> anyhow::Result<()> {
    let inventory = engine.inventory().await?;
    println!("Credentials:");
    println!("  unused:   {}", inventory.unused);
    println!("  reserved: {}", inventory.reserved);
    println!("  spent:    {}", inventory.spent);
    Ok(())
}

fn print_record(record: &QueryRecord) {
    let query = &record.query;
    println!("Query {}", query.id);
    println!("  State:     {}", record.state);
    if let Some(reason) = record.failure_reason {
        println!("  Reason:    {}", reason);
    }
    println!("  Kind:      {}", query.payload.kind);
    match query.expected_responses {
        Some(n) => println!("  Expected:  {}", n),
        None => println!("  Expected:  open-ended"),
    }
    println!("  Created:   {}", query.created_at.format("%Y-%m-%d %H:%M:%S"));
    println!("  Deadline:  {}", query.deadline.format("%Y-%m-%d %H:%M:%S"));
    println!("  Attempts:  {}", record.attempts);

    if record.responses.is_empty() {
        println!("\nNo responses.");
        return;
    }

    println!("\nResponses:");
    for stored in &record.responses {
        let late = if stored.late { " [late]" } else { "" };
        println!(
            "  {}{}  {}",
            stored.response.received_at.format("%H:%M:%S"),
            late,
            String::from_utf8_lossy(&stored.response.payload)
        );
    }
}
