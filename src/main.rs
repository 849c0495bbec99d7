use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use chrono::{Duration as ChronoDuration, Utc};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use propline::auth::generate_credential;
use propline::cache::MemoryCache;
use propline::config::{self, AppConfig, DEFAULT_ENV_KEY};
use propline::ingest::{
    DataSource, DispatchOptions, FetchRequest, LocalBackend, Pipeline, ProcessOptions,
    fetch_data_source, partner, process_data_source,
};
use propline::lease::{LeaseTable, LockOptions, Locker, SqliteLeaseTable};
use propline::registry::{PRIMARY, Registry};
use propline::server::{AppState, create_router};
use propline::store::{SqliteStore, Store};
use propline::synth::{
    HttpSearch, IndexOptions, MemorySearch, SearchCluster, SyncOptions, load_search_index,
    sync_properties,
};
use propline::types::{ApiKey, ApiKeyStatus, ApiKeyType, ApiQuota, Layouts};

#[derive(Parser)]
#[command(name = "propline")]
#[command(about = "Property data ingestion and API platform", long_about = None)]
struct Cli {
    /// Config file (toml, yaml or json). Falls back to $PROPLINE_CONFIG.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the databases and apply the schema
    Init,

    /// Mirror a partner's remote drop with rclone
    Fetch {
        #[arg(long)]
        partner: String,

        #[arg(long)]
        source: String,

        #[arg(long = "dest")]
        destination: String,
    },

    /// Catalog and load a partner's drop
    Load {
        #[arg(long)]
        partner: String,

        /// Only lease objects whose first priority matches
        #[arg(long)]
        priority_group: Option<i32>,

        /// Catalog metadata as key=value, repeatable
        #[arg(long = "meta", value_parser = parse_meta)]
        meta: Vec<(String, String)>,
    },

    /// Reconcile vendor rows into canonical properties
    Sync {
        #[arg(long)]
        index: Option<String>,
    },

    /// Stream canonical addresses into the search index
    Index {
        #[arg(long)]
        index: Option<String>,
    },

    /// API key management
    Key {
        #[command(subcommand)]
        command: KeyCommands,
    },

    /// Start the HTTP server
    Serve {
        #[arg(long)]
        host: Option<String>,

        #[arg(long, short)]
        port: Option<u16>,
    },
}

#[derive(Subcommand)]
enum KeyCommands {
    /// Create an api key and set its organization's quota
    Create {
        #[arg(long)]
        org: Uuid,

        #[arg(long)]
        daily: i64,

        #[arg(long)]
        monthly: i64,

        /// Enabled layouts, e.g. address,assessor
        #[arg(long, value_delimiter = ',')]
        layouts: Vec<String>,

        /// Seconds until the key expires
        #[arg(long)]
        expires_in: Option<i64>,
    },
}

fn parse_meta(s: &str) -> Result<(String, String), String> {
    let (k, v) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{s}'"))?;
    if k.trim().is_empty() {
        return Err("meta key cannot be empty".to_string());
    }
    Ok((k.trim().to_string(), v.to_string()))
}

fn open_store(config: &AppConfig) -> anyhow::Result<Arc<SqliteStore>> {
    fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed to create {}", config.data_dir.display()))?;

    let path = config.db_path();
    let store = SqliteStore::new(&path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    Ok(Arc::new(store))
}

fn open_lease_table(config: &AppConfig) -> anyhow::Result<Arc<SqliteLeaseTable>> {
    let path = config.coordination_db_path();
    let table = SqliteLeaseTable::new(&path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    Ok(Arc::new(table))
}

fn search_cluster(config: &AppConfig) -> Arc<dyn SearchCluster> {
    let cluster = config.search.cluster.as_str();
    if cluster.starts_with("http://") || cluster.starts_with("https://") {
        Arc::new(HttpSearch::new("opensearch", cluster))
    } else {
        Arc::new(MemorySearch::new(cluster))
    }
}

fn build_registry(config: &AppConfig) -> anyhow::Result<Registry> {
    let store = open_store(config)?;
    store.initialize()?;
    let lease_table = open_lease_table(config)?;
    lease_table.initialize()?;

    let mut registry = Registry::new()
        .with_store(PRIMARY, store)
        .with_lease_table(PRIMARY, lease_table)
        .with_cache(PRIMARY, Arc::new(MemoryCache::new()))
        .with_search(PRIMARY, search_cluster(config))
        .with_duration("lock_ttl", config.worker.lock_ttl())
        .with_duration("acquire_timeout", config.worker.acquire_timeout());

    if let Some(key) = config.tokens.symmetric_key()? {
        registry = registry.with_symmetric_key("tokens", key);
    }
    Ok(registry)
}

fn lock_options(registry: &Registry, config: &AppConfig) -> anyhow::Result<LockOptions> {
    Ok(LockOptions {
        ttl: registry.select_duration("lock_ttl")?,
        timeout: registry.select_duration("acquire_timeout")?,
        poll_interval: config.worker.poll_interval(),
        ..Default::default()
    })
}

fn locker(registry: &Registry) -> anyhow::Result<Locker> {
    Ok(Locker::new(registry.select_lease_table(PRIMARY)?))
}

/// Cancels the returned token on Ctrl-C.
fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, shutting down");
            trigger.cancel();
        }
    });
    cancel
}

fn resolve_dir(base: &Path, dir: &Path) -> PathBuf {
    if dir.is_absolute() {
        dir.to_path_buf()
    } else {
        base.join(dir)
    }
}

fn run_init(config: &AppConfig) -> anyhow::Result<()> {
    open_store(config)?.initialize()?;
    open_lease_table(config)?.initialize()?;

    println!("Initialized {}", config.db_path().display());
    println!("Initialized {}", config.coordination_db_path().display());
    Ok(())
}

async fn run_fetch(
    config: &AppConfig,
    partner_name: &str,
    source: String,
    destination: String,
) -> anyhow::Result<()> {
    let registry = build_registry(config)?;
    let data_source = partner::resolve(partner_name, &config.partners)?;

    let mut req = FetchRequest::new(source, destination);
    req.parallelism = config.worker.fetch_parallelism;

    let outcome = fetch_data_source(
        &locker(&registry)?,
        data_source.partner_id(),
        &req,
        &lock_options(&registry, config)?,
        &shutdown_token(),
    )
    .await?;

    println!("{outcome:?}");
    Ok(())
}

async fn run_load(
    config: &AppConfig,
    partner_name: &str,
    priority_group: Option<i32>,
    meta: Vec<(String, String)>,
) -> anyhow::Result<()> {
    let registry = build_registry(config)?;
    let data_source = partner::resolve(partner_name, &config.partners)?;
    let root = config
        .partners
        .get(partner_name)
        .map(|p| p.root.clone())
        .unwrap_or_else(|| PathBuf::from(partner_name));

    let pipeline = Pipeline {
        store: registry.select_store(PRIMARY)?,
        backend: Arc::new(LocalBackend::new(resolve_dir(&config.data_dir, &root))),
        source: Arc::new(data_source),
    };

    let meta = (!meta.is_empty()).then(|| {
        Value::Object(
            meta.into_iter()
                .map(|(k, v)| (k, Value::String(v)))
                .collect::<Map<String, Value>>(),
        )
    });

    let opts = ProcessOptions {
        meta,
        priority_group,
        dispatch: DispatchOptions {
            worker_id: config.worker.worker_id.unwrap_or_else(Uuid::new_v4),
            file_buffer_size: config.worker.file_buffer_size,
            limit: config.worker.dispatch_limit,
            max_idle_polls: config.worker.max_idle_polls,
            ..Default::default()
        },
        lock: lock_options(&registry, config)?,
        ..Default::default()
    };

    let stats = process_data_source(&locker(&registry)?, &pipeline, &opts, &shutdown_token()).await?;
    println!(
        "Loaded {} objects ({} records, {} skipped)",
        stats.dispatch.objects,
        stats.dispatch.records.processed_records,
        stats.dispatch.records.skipped_records
    );
    Ok(())
}

async fn run_sync(config: &AppConfig, index: Option<String>) -> anyhow::Result<()> {
    let registry = build_registry(config)?;
    let opts = SyncOptions {
        index: index.unwrap_or_else(|| config.search.index.clone()),
        batch_size: config.search.batch_size,
        lock: lock_options(&registry, config)?,
        ..Default::default()
    };

    let stats = sync_properties(
        &locker(&registry)?,
        registry.select_store(PRIMARY)?,
        registry.select_search(PRIMARY)?,
        &opts,
        &shutdown_token(),
    )
    .await?;

    println!(
        "Synced {} zip codes ({} matched in {} batches)",
        stats.zip5_count, stats.matched, stats.batches
    );
    Ok(())
}

async fn run_index(config: &AppConfig, index: Option<String>) -> anyhow::Result<()> {
    let registry = build_registry(config)?;
    let opts = IndexOptions {
        index: index.unwrap_or_else(|| config.search.index.clone()),
        batch_size: config.search.batch_size,
        file_buffer_size: config.search.file_buffer_size,
        lock: lock_options(&registry, config)?,
        ..Default::default()
    };

    let stats = load_search_index(
        &locker(&registry)?,
        registry.select_store(PRIMARY)?,
        registry.select_search(PRIMARY)?,
        &opts,
        &shutdown_token(),
    )
    .await?;

    println!(
        "Indexed {} documents across {} fips codes",
        stats.documents, stats.fips_count
    );
    Ok(())
}

fn run_key_create(
    config: &AppConfig,
    org: Uuid,
    daily: i64,
    monthly: i64,
    layouts: &[String],
    expires_in: Option<i64>,
) -> anyhow::Result<()> {
    if daily < 0 || monthly < 0 {
        bail!("quotas cannot be negative");
    }

    let names: Vec<&str> = layouts.iter().map(|s| s.trim()).filter(|s| !s.is_empty()).collect();
    let Some(enabled) = Layouts::parse_many(&names) else {
        bail!("unknown layout in {names:?}");
    };

    let store = open_store(config)?;
    store.initialize()?;

    let now = Utc::now();
    let (raw, credential) = generate_credential();

    store.upsert_api_quota(&ApiQuota {
        organization_id: org,
        daily_quota: daily,
        monthly_quota: monthly,
        enabled,
    })?;
    store.create_api_key(&ApiKey {
        id: Uuid::now_v7(),
        created_at: now,
        updated_at: now,
        organization_id: org,
        user_id: None,
        role_name: "api".to_string(),
        key_type: ApiKeyType::Legacy,
        key_hash: credential.key_hash,
        key_status: ApiKeyStatus::Active,
        expires_at: expires_in.map(|secs| now + ChronoDuration::seconds(secs)),
        last_used_at: None,
    })?;

    println!();
    println!("========================================");
    println!("API key (save this, it won't be shown again):");
    println!();
    println!("  {raw}");
    println!();
    println!("========================================");
    println!();
    Ok(())
}

async fn run_serve(
    mut config: AppConfig,
    host: Option<String>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }

    let registry = build_registry(&config)?;
    let state = Arc::new(AppState::new(
        registry.select_store(PRIMARY)?,
        registry.select_cache(PRIMARY)?,
    ));
    let app = create_router(state);
    let addr = config.server.socket_addr()?;

    info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("propline=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = config::load(cli.config.as_deref(), DEFAULT_ENV_KEY)?;

    match cli.command {
        Commands::Init => run_init(&config)?,
        Commands::Fetch {
            partner,
            source,
            destination,
        } => run_fetch(&config, &partner, source, destination).await?,
        Commands::Load {
            partner,
            priority_group,
            meta,
        } => run_load(&config, &partner, priority_group, meta).await?,
        Commands::Sync { index } => run_sync(&config, index).await?,
        Commands::Index { index } => run_index(&config, index).await?,
        Commands::Key { command } => match command {
            KeyCommands::Create {
                org,
                daily,
                monthly,
                layouts,
                expires_in,
            } => run_key_create(&config, org, daily, monthly, &layouts, expires_in)?,
        },
        Commands::Serve { host, port } => run_serve(config, host, port).await?,
    }

    Ok(())
}
