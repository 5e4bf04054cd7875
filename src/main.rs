//! nodeplane: control plane for a fleet of proxy nodes.
//!
//! # Architecture Overview
//!
//! ```text
//!   nodeplane CLI / embedding layer
//!          │
//!          ▼
//!   ┌──────────────┐   commit    ┌──────────────┐
//!   │ ControlPlane │────────────▶│   registry   │  nodes, subscribers,
//!   │  (service)   │             │   (SQLite)   │  audit log, notifications
//!   └──────┬───────┘             └──────▲───────┘
//!          │                            │ usage / flags
//!          ▼                            │
//!   ┌──────────────┐  save   ┌────────────────────┐
//!   │ provisioning │────────▶│ document (on disk)  │ config_{id}.json
//!   └──────┬───────┘         └────────────────────┘
//!          │ restart
//!          ▼
//!   ┌──────────────┐               ┌──────────────────────────────┐
//!   │  supervisor  │── start/stop ▶│ proxy process per node        │
//!   └──────────────┘               │  stats API ◀── health, stats  │
//!                                  │  access log ──▶ traffic       │
//!                                  └──────────────────────────────┘
//!
//!   Scheduler (serve): enforcement ─┬─ metering ─┬─ health, each on its own interval
//! ```

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio::net::TcpListener;

use nodeplane::admin::{self, AdminState};
use nodeplane::config::load_or_default;
use nodeplane::lifecycle::{shutdown_signal, spawn_periodic, Shutdown};
use nodeplane::observability::{logging, metrics};
use nodeplane::registry::{NodeId, NodeSpec, NodeUpdate, Role};
use nodeplane::service::{ControlPlane, NewUser, RenewRequest};

#[derive(Parser)]
#[command(name = "nodeplane")]
#[command(about = "Provision, supervise and enforce subscriptions across proxy nodes", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "/etc/nodeplane/nodeplane.toml")]
    config: PathBuf,

    /// Name recorded in the audit log for changes made by this invocation.
    #[arg(long, default_value = "admin")]
    actor: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon: start nodes, schedule control loops, serve admin status
    Serve,
    /// Manage nodes
    #[command(subcommand)]
    Node(NodeCommand),
    /// Manage subscribers
    #[command(subcommand)]
    User(UserCommand),
    /// Refresh online flags from live session counters
    CheckOnline,
    /// Run one enforcement cycle
    Enforce,
    /// Run one traffic metering cycle
    Meter,
}

#[derive(Subcommand)]
enum NodeCommand {
    /// Register a node and start its proxy
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        address: String,
        #[arg(long, default_value_t = 12345)]
        port: u16,
        #[arg(long, default_value = "vless")]
        protocol: String,
        #[arg(long, default_value_t = 54321)]
        api_port: u16,
    },
    /// Change a node's address, ports or protocol and restart it
    Update {
        id: NodeId,
        #[command(flatten)]
        changes: NodeChanges,
    },
    /// List nodes
    List {
        /// Probe every node before listing
        #[arg(long)]
        probe: bool,
    },
}

#[derive(Args)]
struct NodeChanges {
    #[arg(long)]
    address: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    protocol: Option<String>,
    #[arg(long)]
    api_port: Option<u16>,
}

#[derive(Subcommand)]
enum UserCommand {
    /// Create a user and provision its credential
    Create {
        username: String,
        #[arg(long, default_value = "user")]
        role: Role,
        /// Traffic limit in GB, 0 for unlimited
        #[arg(long, default_value_t = 0)]
        limit_gb: u64,
        #[arg(long)]
        node: Option<NodeId>,
    },
    /// Delete a user and revoke its credential
    Delete { username: String },
    /// Flip a user's active flag
    Toggle { username: String },
    /// Set a new traffic limit and validity period
    Renew {
        username: String,
        #[arg(long)]
        limit_gb: u64,
        #[arg(long)]
        days: i64,
    },
    /// List users
    List,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let config = load_or_default(&cli.config)?;
    logging::init_logging(&config.observability.log_level);

    let plane = Arc::new(ControlPlane::open(config)?);
    let actor = cli.actor.as_str();

    match cli.command {
        Commands::Serve => serve(plane).await?,
        Commands::Node(cmd) => match cmd {
            NodeCommand::Add {
                name,
                address,
                port,
                protocol,
                api_port,
            } => {
                let spec = NodeSpec {
                    name,
                    address,
                    port,
                    protocol,
                    api_port,
                };
                print_json(&plane.create_server(actor, spec).await?)?;
            }
            NodeCommand::Update { id, changes } => {
                let current = plane.registry().require_node(id)?;
                let mut update = NodeUpdate::from(&current);
                if let Some(address) = changes.address {
                    update.address = address;
                }
                if let Some(port) = changes.port {
                    update.port = port;
                }
                if let Some(protocol) = changes.protocol {
                    update.protocol = protocol;
                }
                if let Some(api_port) = changes.api_port {
                    update.api_port = api_port;
                }
                print_json(&plane.update_server(actor, id, update).await?)?;
            }
            NodeCommand::List { probe } => print_json(&plane.list_nodes(probe).await?)?,
        },
        Commands::User(cmd) => match cmd {
            UserCommand::Create {
                username,
                role,
                limit_gb,
                node,
            } => {
                let req = NewUser {
                    username,
                    role,
                    traffic_limit_gb: limit_gb,
                    node_id: node,
                };
                print_json(&plane.create_user(actor, req).await?)?;
            }
            UserCommand::Delete { username } => {
                print_json(&plane.delete_user(actor, &username).await?)?
            }
            UserCommand::Toggle { username } => {
                print_json(&plane.toggle_active(actor, &username).await?)?
            }
            UserCommand::Renew {
                username,
                limit_gb,
                days,
            } => {
                let req = RenewRequest {
                    traffic_limit_gb: limit_gb,
                    days,
                };
                print_json(&plane.renew(actor, &username, req)?)?;
            }
            UserCommand::List => print_json(&plane.list_users()?)?,
        },
        Commands::CheckOnline => print_json(&plane.check_online(actor).await?)?,
        Commands::Enforce => print_json(&plane.run_enforcement().await?)?,
        Commands::Meter => print_json(&plane.run_metering().await)?,
    }

    Ok(())
}

async fn serve(plane: Arc<ControlPlane>) -> Result<(), Box<dyn Error>> {
    tracing::info!("nodeplane v{} starting", env!("CARGO_PKG_VERSION"));
    let config = plane.config().clone();

    if config.observability.metrics_enabled {
        if let Ok(addr) = config.observability.metrics_address.parse() {
            metrics::init_metrics(addr);
        } else {
            tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            );
        }
    }

    let started = plane.start_nodes().await?;
    tracing::info!(started, "Node processes started");

    let shutdown = Shutdown::new();
    let mut tasks = Vec::new();
    let scheduler = &config.scheduler;

    let enforcement = plane.clone();
    tasks.push(spawn_periodic(
        "enforcement",
        Duration::from_secs(scheduler.enforcement_interval_secs),
        shutdown.subscribe(),
        move || {
            let plane = enforcement.clone();
            async move {
                if let Err(e) = plane.run_enforcement().await {
                    tracing::error!(error = %e, "Enforcement cycle failed");
                }
            }
        },
    ));

    let metering = plane.clone();
    tasks.push(spawn_periodic(
        "metering",
        Duration::from_secs(scheduler.metering_interval_secs),
        shutdown.subscribe(),
        move || {
            let plane = metering.clone();
            async move {
                plane.run_metering().await;
            }
        },
    ));

    if scheduler.health_interval_secs > 0 {
        let health = plane.clone();
        tasks.push(spawn_periodic(
            "health",
            Duration::from_secs(scheduler.health_interval_secs),
            shutdown.subscribe(),
            move || {
                let plane = health.clone();
                async move {
                    plane.probe_all().await;
                }
            },
        ));
    } else {
        tracing::info!("Periodic health checks disabled");
    }

    if config.admin.enabled {
        let listener = TcpListener::bind(&config.admin.bind_address).await?;
        let state = AdminState::new(plane.registry().clone(), &config.admin.api_key);
        let rx = shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = admin::serve(listener, state, rx).await {
                tracing::error!(error = %e, "Admin surface failed");
            }
        }));
    }

    shutdown_signal().await;
    tracing::info!("Shutting down, waiting for running cycles to finish");
    shutdown.trigger();
    for task in tasks {
        let _ = task.await;
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
