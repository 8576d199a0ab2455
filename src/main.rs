use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use sensor_gateway::db::{self, NodeRepo, NodeStore};
use sensor_gateway::{Config, Daemon, NodeRegistry, nodes};

/// Sensor Gateway - liveness and permission tracking for MQTT sensor nodes
#[derive(Parser)]
#[command(name = "sensor-gateway", version, about)]
struct Cli {
    /// Config file (defaults to ~/.config/sensor-gateway/config.toml)
    #[arg(short, long, env = "GATEWAY_CONFIG")]
    config: Option<PathBuf>,

    /// Broker address as host:port
    #[arg(long, env = "GATEWAY_BROKER")]
    broker: Option<String>,

    /// Database file
    #[arg(long, env = "GATEWAY_DB")]
    db: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// List stored nodes
    Nodes {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete a node and its stored reading
    DeleteNode {
        /// Node id
        id: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,sensor_gateway=info",
        1 => "info,sensor_gateway=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(broker) = &cli.broker {
        config.set_broker(broker)?;
    }
    if let Some(path) = cli.db {
        config.store.path = path;
    }
    tracing::debug!(?config, "loaded configuration");

    if let Some(cmd) = cli.command {
        return match cmd {
            Command::Nodes { json } => list_nodes(&config, json),
            Command::DeleteNode { id } => delete_node(&config, &id),
        };
    }

    tracing::info!(
        broker = %format!("{}:{}", config.transport.broker_host, config.transport.broker_port),
        store = %config.store.path.display(),
        "starting sensor gateway"
    );

    let daemon = Daemon::new(config)?;
    daemon.run().await?;

    Ok(())
}

fn open_store(config: &Config) -> anyhow::Result<NodeRepo> {
    let pool = db::init(&config.store.path, config.store.pool_size)?;
    Ok(NodeRepo::new(pool))
}

/// Print every stored node
fn list_nodes(config: &Config, json: bool) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let nodes = store.load_all_nodes()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&nodes)?);
        return Ok(());
    }

    if nodes.is_empty() {
        println!("No nodes stored.");
        return Ok(());
    }

    println!("{:<20} {:<8} {:<8} {:<20} READING", "ID", "ONLINE", "ALLOWED", "LAST SEEN");
    for node in nodes {
        let reading = node.last_reading.as_ref().map_or_else(
            || "-".to_string(),
            |r| format!("{:.1}°C {}hPa {}% {}lx", r.temperature, r.pressure, r.humidity, r.illuminance),
        );
        println!(
            "{:<20} {:<8} {:<8} {:<20} {}",
            node.id,
            node.online,
            node.allowed,
            db::format_timestamp(node.last_seen),
            reading
        );
    }

    Ok(())
}

/// Delete a node from the store
fn delete_node(config: &Config, id: &str) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let registry = NodeRegistry::new();

    if nodes::delete_node(&registry, &store, id)? {
        println!("Deleted node {id}");
    } else {
        println!("No node named {id}");
    }

    Ok(())
}
