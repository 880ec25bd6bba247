//! collecte - offline outbox and request cache for field data collection
//!
//! Records entities locally, queues their remote mutations in a durable
//! outbox, drains the outbox against the collector, and manages the offline
//! request cache.
//!
//! Uses XDG Base Directory specification for file locations:
//! - Store: $XDG_DATA_HOME/collecte/collecte.db (~/.local/share/collecte/collecte.db)
//! - Cache: $XDG_DATA_HOME/collecte/cache.db (~/.local/share/collecte/cache.db)
//! - Logs: $XDG_STATE_HOME/collecte/collecte.YYYY-MM-DD.log (~/.local/state/collecte/)
//! - Config: $XDG_CONFIG_HOME/collecte/config.toml (~/.config/collecte/config.toml)

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use collecte_core::cache::{Destination, Request};
use collecte_core::sync::{ConnectivityProbe, SyncScheduler};
use collecte_core::{
    Action, CacheController, CacheSettings, CacheStore, Config, Database, HttpFetcher,
    HttpTransport, NewEntity, OutboxManager, StoreHandle, SyncEngine, SyncSettings,
};
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::Level;

#[derive(Parser)]
#[command(name = "collecte")]
#[command(about = "Offline outbox sync and request cache for field data collection")]
#[command(version)]
struct Args {
    /// Also log to stderr (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show configuration, store and cache status
    Status,

    /// Record an entity locally and queue its creation on the collector
    Add {
        /// Field value as key=value (values that parse as JSON keep their type)
        #[arg(short, long = "field", value_name = "KEY=VALUE", required = true)]
        fields: Vec<String>,
    },

    /// Import entities from a JSON array (all or nothing)
    Import {
        /// JSON file containing an array of objects
        file: PathBuf,
    },

    /// List stored entities
    Entities,

    /// Queue a raw action
    Enqueue {
        /// HTTP method
        #[arg(short, long, default_value = "POST")]
        method: String,

        /// Target url; relative urls resolve against the collector
        #[arg(short, long)]
        url: Option<String>,

        /// JSON body
        #[arg(short, long, default_value = "{}")]
        body: String,
    },

    /// List pending outbox items, oldest first
    Outbox,

    /// Drop an outbox item
    Remove {
        qid: i64,
    },

    /// Deliver pending outbox items to the collector
    Flush,

    /// Flush when the collector becomes reachable, on a SYNC_OUTBOX message
    /// from stdin, and periodically
    Watch,

    /// Manage the offline request cache
    Cache {
        #[command(subcommand)]
        command: CacheCommand,
    },
}

#[derive(Subcommand)]
enum CacheCommand {
    /// Populate the shell cache from the precache manifest
    Install,

    /// Activate an installed controller now
    Activate,

    /// Show lifecycle and cache generations
    Status,

    /// Send a JSON control message (e.g. {"type":"SKIP_WAITING"})
    Message {
        message: String,
    },

    /// Fetch a url through the cache controller
    Fetch {
        /// Absolute url or path relative to the cache origin
        url: String,

        /// Treat as a full-page navigation
        #[arg(long)]
        navigate: bool,

        /// Request destination (document, style, script, image, font, other)
        #[arg(long, default_value = "other")]
        destination: String,

        /// HTTP method
        #[arg(long, default_value = "GET")]
        method: String,
    },
}

/// Returns $HOME or panics
fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .expect("HOME environment variable not set")
}

/// Sets XDG environment variables to ensure the core library uses XDG paths
fn ensure_xdg_env() {
    let home = home_dir();

    if std::env::var("XDG_DATA_HOME").is_err() {
        std::env::set_var("XDG_DATA_HOME", home.join(".local/share"));
    }

    if std::env::var("XDG_STATE_HOME").is_err() {
        std::env::set_var("XDG_STATE_HOME", home.join(".local/state"));
    }

    if std::env::var("XDG_CONFIG_HOME").is_err() {
        std::env::set_var("XDG_CONFIG_HOME", home.join(".config"));
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    ensure_xdg_env();

    // Load configuration
    let config = Config::load().context("failed to load configuration")?;

    // Initialize logging
    let console = match args.verbose {
        0 => None,
        1 => Some(Level::INFO),
        _ => Some(Level::DEBUG),
    };
    let _log_guard = collecte_core::logging::init(&config.logging, console)
        .context("failed to initialize logging")?;

    tracing::debug!("collecte starting");

    let store = StoreHandle::new(Config::database_path(), config.store.busy_timeout());

    match args.command {
        Command::Status => cmd_status(&config, &store),
        Command::Add { fields } => cmd_add(&store, &fields),
        Command::Import { file } => cmd_import(&store, &file),
        Command::Entities => cmd_entities(&store),
        Command::Enqueue { method, url, body } => cmd_enqueue(&store, &method, url, &body),
        Command::Outbox => cmd_outbox(&store),
        Command::Remove { qid } => cmd_remove(&store, qid),
        Command::Flush => cmd_flush(&config, &store).await,
        Command::Watch => cmd_watch(&config, &store).await,
        Command::Cache { command } => cmd_cache(&config, command).await,
    }
}

fn open_store(store: &StoreHandle) -> Result<Arc<Database>> {
    store.open().with_context(|| {
        format!(
            "failed to open store at {}",
            store.path().map(|p| p.display().to_string()).unwrap_or_default()
        )
    })
}

fn cmd_status(config: &Config, store: &StoreHandle) -> Result<()> {
    println!("Collecte Status");
    println!("===============");
    println!();

    println!("Collector:       {}", config.sync.collector_url);
    println!("Sync path:       {}", config.sync.sync_path);
    println!("Timeout:         {}s", config.sync.timeout_secs);
    println!("Max Retries:     {}", config.sync.max_retries);
    println!(
        "Anti-forgery:    {}",
        if config.sync.resolve_csrf_token().is_some() {
            "<set>"
        } else {
            "<not set>"
        }
    );

    let db = open_store(store)?;
    let outbox = OutboxManager::new(Arc::clone(&db));

    println!();
    println!("Store:           {}", Config::database_path().display());
    println!("Device:          {}", db.device_id()?);
    println!("Entities:        {}", db.count_entities()?);
    println!("Pending:         {}", outbox.count()?);

    let cache = open_cache(config)?;
    let status = cache.status()?;
    println!();
    println!("Cache:           {}", Config::cache_path().display());
    println!("Lifecycle:       {:?}", status.lifecycle);
    for generation in status.generations {
        println!("  {:<28} {} entries", generation.name, generation.entries);
    }

    Ok(())
}

/// Parse `key=value`; values that are valid JSON keep their JSON type
fn parse_field(raw: &str) -> Result<(String, Value)> {
    let Some((key, value)) = raw.split_once('=') else {
        bail!("invalid field '{}': expected KEY=VALUE", raw);
    };
    let key = key.trim();
    if key.is_empty() {
        bail!("invalid field '{}': empty key", raw);
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn cmd_add(store: &StoreHandle, raw_fields: &[String]) -> Result<()> {
    let fields = raw_fields
        .iter()
        .map(|raw| parse_field(raw))
        .collect::<Result<Map<String, Value>>>()?;

    let db = open_store(store)?;
    let id = db
        .add_entity(&NewEntity::new(fields.clone()))
        .context("failed to record entity")?;

    let mut body = fields;
    body.insert("client_id".to_string(), Value::from(id));
    let qid = OutboxManager::new(db)
        .enqueue(&Action::new("POST", None, Value::Object(body)))
        .context("failed to queue entity")?;

    println!("Recorded entity {} (queued as {})", id, qid);
    Ok(())
}

fn cmd_import(store: &StoreHandle, file: &Path) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let records: Vec<Map<String, Value>> =
        serde_json::from_str(&content).context("expected a JSON array of objects")?;

    let entities: Vec<NewEntity> = records
        .into_iter()
        .map(|mut fields| match fields.remove("id").and_then(|v| v.as_i64()) {
            Some(id) => NewEntity::with_id(id, fields),
            None => NewEntity::new(fields),
        })
        .collect();

    let db = open_store(store)?;
    let ids = db
        .bulk_add_entities(&entities)
        .context("import failed, nothing was stored")?;

    println!("Imported {} entities", ids.len());
    Ok(())
}

fn cmd_entities(store: &StoreHandle) -> Result<()> {
    let db = open_store(store)?;

    let mut shown = 0;
    for entity in db.iter_entities() {
        let entity = entity?;
        println!(
            "{:>6}  {:<12} {}  {}",
            entity.id,
            entity.server_id.as_deref().unwrap_or("-"),
            entity.created_at.format("%Y-%m-%d %H:%M"),
            Value::Object(entity.fields)
        );
        shown += 1;
    }

    if shown == 0 {
        println!("No entities stored.");
    }
    Ok(())
}

fn cmd_enqueue(store: &StoreHandle, method: &str, url: Option<String>, body: &str) -> Result<()> {
    let body: Value = serde_json::from_str(body).context("body must be valid JSON")?;
    let action = Action::new(method, url.as_deref(), body);

    let qid = OutboxManager::new(open_store(store)?)
        .enqueue(&action)
        .context("failed to enqueue action")?;

    println!("Queued {} {} as {}", action.method(), url.as_deref().unwrap_or("<default>"), qid);
    Ok(())
}

fn cmd_outbox(store: &StoreHandle) -> Result<()> {
    let outbox = OutboxManager::new(open_store(store)?);
    let items = outbox.list()?;

    if items.is_empty() {
        println!("Outbox is empty.");
        return Ok(());
    }

    println!("{:>6}  {:<7} {:<32} ENQUEUED", "QID", "METHOD", "URL");
    for item in items {
        println!(
            "{:>6}  {:<7} {:<32} {}",
            item.qid,
            item.action.method(),
            item.action.url().unwrap_or("<default>"),
            item.enqueued_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

fn cmd_remove(store: &StoreHandle, qid: i64) -> Result<()> {
    let outbox = OutboxManager::new(open_store(store)?);
    let existed = outbox.get(qid)?.is_some();
    outbox.remove(qid)?;

    if existed {
        println!("Removed {}", qid);
    } else {
        println!("No outbox item {}", qid);
    }
    Ok(())
}

fn build_engine(config: &Config, store: &StoreHandle) -> Result<SyncEngine<HttpTransport>> {
    let settings = SyncSettings::from_config(&config.sync).context("invalid sync settings")?;
    let transport =
        HttpTransport::new(config.sync.timeout()).context("failed to create transport")?;
    SyncEngine::new(open_store(store)?, transport, settings).context("failed to create engine")
}

async fn cmd_flush(config: &Config, store: &StoreHandle) -> Result<()> {
    let engine = build_engine(config, store)?;
    let outcome = engine.flush().await.context("flush failed")?;
    let report = outcome.report();

    println!("{}", serde_json::to_string(&report)?);
    if !report.success {
        bail!(
            "flush halted with {} item(s) still pending",
            engine.outbox().count()?
        );
    }
    Ok(())
}

async fn cmd_watch(config: &Config, store: &StoreHandle) -> Result<()> {
    let engine = Arc::new(build_engine(config, store)?);
    let probe = ConnectivityProbe::new(
        config.sync.collector_base()?,
        config.sync.probe_interval(),
        config.sync.timeout(),
    )
    .context("failed to create connectivity probe")?;

    let controller = open_cache(config)?;

    let scheduler = SyncScheduler::new(Arc::clone(&engine), probe.subscribe())
        .with_client(controller.subscribe())
        .with_periodic(config.sync.periodic_interval());

    println!(
        "Watching {} (probe every {}s). Control messages are read from stdin. Press Ctrl+C to stop.",
        config.sync.collector_url, config.sync.probe_interval_secs
    );

    tokio::select! {
        _ = probe.run() => {}
        _ = scheduler.run() => {}
        result = relay_control_messages(&controller) => {
            result.context("failed to read control messages")?;
        }
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for Ctrl+C")?;
            println!();
            println!("Stopping.");
        }
    }

    println!("Pending: {}", engine.outbox().count()?);
    Ok(())
}

/// Feed JSON control messages from stdin (one per line) to the controller.
///
/// `{"type":"SYNC_OUTBOX"}` reaches the scheduler as a sync request. Keeps
/// waiting once stdin is closed.
async fn relay_control_messages(controller: &CacheController<HttpFetcher>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Err(e) = controller.handle_raw_message(line).await {
            tracing::warn!(error = %e, "Control message failed");
        }
    }

    tracing::debug!("Control input closed");
    std::future::pending::<()>().await;
    Ok(())
}

fn open_cache(config: &Config) -> Result<CacheController<HttpFetcher>> {
    let store = CacheStore::open(&Config::cache_path(), config.store.busy_timeout())
        .context("failed to open cache")?;
    let settings = CacheSettings::from_config(config).context("invalid cache settings")?;
    let fetcher = HttpFetcher::new(config.sync.timeout()).context("failed to create fetcher")?;
    CacheController::new(store, fetcher, settings).context("failed to create cache controller")
}

async fn cmd_cache(config: &Config, command: CacheCommand) -> Result<()> {
    let controller = open_cache(config)?;

    match command {
        CacheCommand::Install => {
            let report = controller.install().await.context("install failed")?;
            println!("Precached {} entries", report.cached.len());
            for path in &report.skipped {
                println!("  skipped {}", path);
            }
            if report.activated {
                println!("Controller active");
            } else {
                println!("Controller installed, waiting for activation");
            }
        }
        CacheCommand::Activate => match controller.skip_waiting().await? {
            Some(report) => {
                println!("Controller active");
                for generation in report.deleted {
                    println!("  deleted {}", generation);
                }
            }
            None => println!("Nothing waiting to activate ({:?})", controller.lifecycle()),
        },
        CacheCommand::Status => {
            println!("{}", serde_json::to_string_pretty(&controller.status()?)?);
        }
        CacheCommand::Message { message } => {
            controller.handle_raw_message(&message).await?;
            println!("Lifecycle: {:?}", controller.lifecycle());
        }
        CacheCommand::Fetch {
            url,
            navigate,
            destination,
            method,
        } => {
            let url = controller
                .settings()
                .origin
                .join(&url)
                .with_context(|| format!("invalid url '{}'", url))?;
            let destination: Destination = destination.parse()?;
            let request = if navigate {
                Request::navigate(url)
            } else {
                Request::asset(url, destination)
            }
            .with_method(&method);

            let served = controller.handle(&request).await?;
            println!("{} ({:?})", served.response.status, served.source);
            for (name, value) in &served.response.headers {
                println!("{}: {}", name, value);
            }
            println!();
            println!("{}", String::from_utf8_lossy(&served.response.body));
        }
    }

    Ok(())
}
