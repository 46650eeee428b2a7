//! Replibus - Broadcast SQL Replication over a Message Bus
//!
//! One binary for every role: the broker, replicas, and the write and read
//! clients.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use replibus::api::HttpServer;
use replibus::bus::{self, Broker, BrokerServer};
use replibus::client::{ReadMode, Reader, Writer};
use replibus::config::{ReplibusConfig, StoreKind};
use replibus::error::{Error, Result};
use replibus::replica::Replica;
use replibus::store;

/// Replibus - Broadcast SQL Replication over a Message Bus
#[derive(Parser)]
#[command(name = "replibus")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (defaults apply if it does not exist)
    #[arg(short, long, default_value = "replibus.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the message broker
    Broker {
        /// Address to listen on (host:port)
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// Run a replica
    Replica {
        /// Replica identity (overrides config and REPLICA_ID)
        #[arg(long)]
        id: Option<String>,
    },

    /// Broadcast a write statement to every replica
    Write {
        /// Statement words, joined with spaces
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        statement: Vec<String>,
    },

    /// Read from whichever replica answers first
    Read {
        /// Read every row instead of the most recent one
        #[arg(short, long)]
        all: bool,

        /// Run this statement instead
        #[arg(long, conflicts_with = "all")]
        sql: Option<String>,

        /// Reply deadline in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Print rows as JSON
        #[arg(long)]
        json: bool,
    },

    /// Query a replica's status API
    Status {
        /// API address to query
        #[arg(short, long, default_value = "localhost:8080")]
        address: String,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "replibus.toml")]
        output: PathBuf,

        /// Replica ID
        #[arg(long, default_value = "replica1")]
        replica_id: String,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Validate configuration file
    Validate,

    /// Show effective configuration
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init {
            output,
            replica_id,
            force,
        } => run_init(output, replica_id, force),
        Commands::Validate => run_validate(&cli.config),
        Commands::Info => run_info(&cli.config),
        Commands::Status { address } => {
            init_logging(cli.log_level.as_deref().unwrap_or("warn"), "pretty");
            run_status(address).await
        }
        Commands::Broker { listen } => {
            let config = load_config_and_logging(&cli.config, cli.log_level.as_deref())?;
            run_broker(config, listen).await
        }
        Commands::Replica { id } => {
            let config = load_config_and_logging(&cli.config, cli.log_level.as_deref())?;
            run_replica(config, id).await
        }
        Commands::Write { statement } => {
            let config = load_config_and_logging(&cli.config, cli.log_level.as_deref())?;
            run_write(config, statement).await
        }
        Commands::Read {
            all,
            sql,
            timeout_ms,
            json,
        } => {
            let config = load_config_and_logging(&cli.config, cli.log_level.as_deref())?;
            run_read(config, all, sql, timeout_ms, json).await
        }
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Load the config file if present, then apply environment overrides
fn load_config(path: &Path) -> Result<ReplibusConfig> {
    let mut config = if path.exists() {
        ReplibusConfig::from_file(path)?
    } else {
        ReplibusConfig::default()
    };
    config.apply_env()?;
    Ok(config)
}

/// Load the config and start logging at its level unless `--log-level` overrides it
fn load_config_and_logging(path: &Path, log_level: Option<&str>) -> Result<ReplibusConfig> {
    let config = load_config(path)?;
    init_logging(
        log_level.unwrap_or(&config.logging.level),
        &config.logging.format,
    );
    Ok(config)
}

/// Cancel `token` on Ctrl-C
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received Ctrl-C, shutting down...");
            token.cancel();
        }
    });
}

/// Run the message broker
async fn run_broker(config: ReplibusConfig, listen: Option<String>) -> Result<()> {
    let address = listen.unwrap_or(config.bus.listen_address);
    tracing::info!("Starting Replibus broker on {}", address);

    let server = Arc::new(BrokerServer::new(address, Broker::new()));
    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(shutdown.clone());

    let stopper = Arc::clone(&server);
    tokio::spawn(async move {
        shutdown.cancelled().await;
        stopper.stop();
    });

    server.start().await?;

    let stats = server.broker().stats();
    tracing::info!(
        "Broker stopped: {} published, {} delivered, {} acked, {} requeued, {} unroutable",
        stats.published,
        stats.delivered,
        stats.acked,
        stats.requeued,
        stats.unroutable
    );
    Ok(())
}

/// Run a replica until Ctrl-C
async fn run_replica(mut config: ReplibusConfig, id: Option<String>) -> Result<()> {
    if let Some(id) = id {
        config.replica.id = id;
        config.validate()?;
    }
    tracing::info!("Starting replica {}", config.replica.id);

    let bus = match bus::connect(&config.bus).await {
        Ok(bus) => bus,
        Err(e) => {
            tracing::error!("Failed to connect to message bus at {}: {}", config.bus.uri, e);
            return Err(e);
        }
    };

    if config.store.kind == StoreKind::Postgres {
        tracing::info!("Connecting to {}...", config.store.display_url());
    }
    let store = match store::open(&config.store).await {
        Ok(store) => store,
        Err(e) => {
            tracing::error!("Failed to open {:?} store: {}", config.store.kind, e);
            return Err(e);
        }
    };

    let replica = Arc::new(Replica::open(&config.replica, bus, store)?);
    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(shutdown.clone());

    if config.api.enabled {
        let api = HttpServer::new(config.api.clone(), Arc::clone(&replica));
        let api_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = api.start(api_shutdown).await {
                tracing::error!("HTTP API error: {}", e);
            }
        });
    }

    let result = replica.run(shutdown.clone()).await;
    shutdown.cancel();

    let stats = replica.stats().snapshot();
    tracing::info!(
        "Replica {} stopped: {} writes applied, {} reads answered, {} requeued, {} discarded",
        replica.id(),
        stats.writes_applied,
        stats.reads_answered,
        stats.requeued,
        stats.discarded
    );
    result
}

/// Broadcast one write statement
async fn run_write(config: ReplibusConfig, statement: Vec<String>) -> Result<()> {
    let query = statement.join(" ");

    let bus = bus::connect(&config.bus).await?;
    let writer = Writer::new(bus);
    let id = writer.submit(&query).await?;

    println!("Successfully published SQL query: {}", query);
    tracing::debug!("Write id {}", id);
    Ok(())
}

/// Read from the first replica to answer
async fn run_read(
    config: ReplibusConfig,
    all: bool,
    sql: Option<String>,
    timeout_ms: Option<u64>,
    json: bool,
) -> Result<()> {
    let mode = match (sql, all) {
        (Some(sql), _) => ReadMode::Sql(sql),
        (None, true) => ReadMode::All,
        (None, false) => ReadMode::Latest,
    };
    match mode {
        ReadMode::All => println!("Read all data"),
        ReadMode::Latest => println!("Read last data"),
        ReadMode::Sql(_) => println!("Read custom query"),
    }

    let bus = bus::connect(&config.bus).await?;
    let mut reader = Reader::new(bus, &config.reader);
    if let Some(ms) = timeout_ms {
        reader = reader.with_timeout(Duration::from_millis(ms));
    }

    println!("Now waiting for a response");
    let rows = reader.query_mode(mode).await?;

    println!("response received");
    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        for row in &rows {
            println!("{}", row);
        }
    }
    Ok(())
}

/// Print a replica's health and stats
async fn run_status(address: String) -> Result<()> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| Error::Transport(e.to_string()))?;

    for path in ["health", "stats"] {
        let url = format!("http://{}/{}", address, path);
        let response = match client.get(&url).send().await {
            Ok(response) => response,
            Err(e) => {
                eprintln!("Failed to get {}: {}", path, e);
                return Err(Error::Transport(e.to_string()));
            }
        };
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        println!("{}", serde_json::to_string_pretty(&body)?);
    }
    Ok(())
}

/// Initialize configuration file
fn run_init(output: PathBuf, replica_id: String, force: bool) -> Result<()> {
    if output.exists() && !force {
        eprintln!("✗ {} already exists (use --force to overwrite)", output.display());
        return Err(Error::Config(format!("{} already exists", output.display())));
    }

    let content = ReplibusConfig::template().replace(
        "id = \"replica1\"",
        &format!("id = \"{}\"", replica_id),
    );
    // Reject ids that would produce an invalid file
    ReplibusConfig::from_str(&content)?;

    std::fs::write(&output, content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to configure the bus and the replica store.");
    println!("Then start with: replibus --config {} replica", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: &Path) -> Result<()> {
    match ReplibusConfig::from_file(config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Bus: {}", config.bus.uri);
            println!("  Replica: {} (queue {})", config.replica.id, config.replica.queue_name());
            println!("  Store: {:?}", config.store.kind);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show effective configuration
fn run_info(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;

    println!("Replibus Configuration");
    println!("======================");
    println!();
    println!("Bus:");
    println!("  URI:            {}", config.bus.uri);
    println!("  Listen:         {}", config.bus.listen_address);
    println!(
        "  Connect:        {} attempts, {} ms apart",
        config.bus.connect_attempts, config.bus.connect_retry_ms
    );
    println!();
    println!("Store:");
    println!("  Kind:           {:?}", config.store.kind);
    match config.store.kind {
        StoreKind::Postgres => println!("  URL:            {}", config.store.display_url()),
        StoreKind::Sqlite => println!(
            "  Path:           {}",
            config
                .store
                .path
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_default()
        ),
    }
    println!("  Table:          {}", config.store.table);
    println!();
    println!("Replica:");
    println!("  ID:             {}", config.replica.id);
    println!("  Queue:          {}", config.replica.queue_name());
    println!("  Ledger:         {}", config.replica.ledger_path().display());
    println!("  Consumers:      {}", config.replica.consumers);
    match config.replica.max_deliveries {
        Some(limit) => println!("  Max Deliveries: {}", limit),
        None => println!("  Max Deliveries: unlimited"),
    }
    println!();
    println!("Reader:");
    println!("  Timeout:        {} ms", config.reader.timeout_ms);
    println!();
    println!(
        "API:              {}",
        if config.api.enabled {
            config.api.bind_address.as_str()
        } else {
            "disabled"
        }
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_config_commands_parse() {
        let cli = Cli::try_parse_from(["replibus", "read", "--all", "--timeout-ms", "500"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Read { all: true, sql: None, timeout_ms: Some(500), json: false }
        ));

        let cli = Cli::try_parse_from(["replibus", "write", "INSERT", "INTO", "t", "VALUES", "(1)"])
            .unwrap();
        let Commands::Write { statement } = cli.command else {
            panic!("expected write");
        };
        assert_eq!(statement.join(" "), "INSERT INTO t VALUES (1)");

        assert!(Cli::try_parse_from(["replibus", "read", "--all", "--sql", "SELECT 1"]).is_err());
    }

    #[test]
    fn test_missing_config_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).unwrap();
        assert!(config.replica.queue_name().starts_with("replica_"));
    }
}
