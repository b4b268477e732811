//! valkey-clu - manage the topology of a Valkey/Redis cluster.
//!
//! This is the command-line entry point that:
//! - Initializes structured logging
//! - Maps flags onto node and cluster configuration
//! - Dispatches each subcommand to the library

use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use valkey_clu::client::{Connector, FredConnector, NodeAddr, NodeConfig};
use valkey_clu::cluster::{Cluster, ClusterConfig, ClusterCreator};

#[derive(Parser)]
#[command(name = "valkey-clu")]
#[command(about = "Create, rebalance and repair Valkey clusters", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Password for every node
    #[arg(long, global = true, env = "VALKEY_CLU_PASSWORD")]
    password: Option<String>,

    /// Connect with TLS
    #[arg(long, global = true)]
    tls: bool,

    /// Per-command timeout in seconds
    #[arg(long, global = true, default_value_t = 4)]
    timeout: u64,

    /// Keys moved per migration batch
    #[arg(long, global = true, default_value_t = 1, env = "VALKEY_CLU_KEY_MIGRATION_COUNT")]
    key_migration_count: usize,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new cluster from bare instances
    Create {
        /// Instances as host:port
        #[arg(required = true, num_args = 2..)]
        masters: Vec<String>,

        /// Number of masters; remaining instances become replicas
        #[arg(long)]
        master_count: Option<usize>,
    },

    /// Show cluster status
    Status {
        /// Any cluster member
        cluster: String,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Repair open slots and assign missing slots
    Fix {
        /// Any cluster member
        cluster: String,
    },

    /// Add masters to a cluster and rebalance
    Add {
        /// Any cluster member
        cluster: String,

        /// New instances as host:port
        #[arg(required = true)]
        masters: Vec<String>,
    },

    /// Rebalance slots across masters
    Reshard {
        /// Any cluster member
        cluster: String,
    },

    /// Remove a node from a cluster
    Remove {
        /// Any cluster member
        cluster: String,

        /// Node to remove
        master: String,
    },

    /// Attach a replica to a master
    Replicate {
        /// New replica
        slave: String,

        /// Master of the new replica
        master: String,
    },

    /// Flush and reset every node of a cluster
    Destroy {
        /// Any cluster member
        cluster: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_tracing(cli.log_json) {
        eprintln!("failed to initialize logging: {}", e);
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("valkey_clu=info".parse()?);

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut node_config = NodeConfig::default()
        .with_tls(cli.tls)
        .with_command_timeout(Duration::from_secs(cli.timeout));
    if let Some(password) = cli.password {
        node_config = node_config.with_password(password);
    }
    let connector = FredConnector::new(node_config);
    let config = ClusterConfig::default().with_key_migration_count(cli.key_migration_count);

    match cli.command {
        Commands::Create {
            masters,
            master_count,
        } => {
            let mut creator = ClusterCreator::connect(connector, &masters, config).await?;
            if let Some(count) = master_count {
                creator = creator.with_master_count(count);
            }
            let cluster = creator.create().await?;
            info!(nodes = cluster.nodes().len(), "Cluster created");
        }

        Commands::Status { cluster, json } => {
            let cluster = open(connector, &cluster, config).await?;
            let status = cluster.status().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                for node in &status.nodes {
                    info!(
                        id = %node.id,
                        addr = %node.addr,
                        role = %node.role,
                        slots = node.slots,
                        ranges = %node.ranges,
                        "Node"
                    );
                }
                info!(
                    consistent = status.consistent,
                    healthy = status.healthy,
                    assigned = status.assigned_slots,
                    total = status.total_slots,
                    open_slots = status.has_open_slots(),
                    "Cluster"
                );
            }
        }

        Commands::Fix { cluster } => {
            let mut cluster = open(connector, &cluster, config).await?;
            cluster.fix().await?;
            cluster.log_attempts();
        }

        Commands::Add { cluster, masters } => {
            let mut cluster = open(connector, &cluster, config).await?;
            cluster.add_nodes(&masters).await?;
            cluster.reshard().await?;
            cluster.log_attempts();
        }

        Commands::Reshard { cluster } => {
            let mut cluster = open(connector, &cluster, config).await?;
            cluster.wait().await?;
            cluster.reshard().await?;
            cluster.log_attempts();
        }

        Commands::Remove { cluster, master } => {
            let node = connector.connect(&NodeAddr::parse(&master)?).await?;
            let mut cluster = open(connector, &cluster, config).await?;
            cluster.wait().await?;
            cluster.remove_node(&node).await?;
            cluster.log_attempts();
        }

        Commands::Replicate { slave, master } => {
            let master_node = connector.connect(&NodeAddr::parse(&master)?).await?;
            let master_id = master_node.name().await?;
            let mut cluster = Cluster::from_node(connector, master_node, config).await?;
            cluster.wait().await?;
            cluster
                .replicate(&NodeAddr::parse(&slave)?, &master_id)
                .await?;
        }

        Commands::Destroy { cluster } => {
            let cluster = open(connector, &cluster, config).await?;
            cluster.destroy().await?;
        }
    }

    Ok(())
}

async fn open(
    connector: FredConnector,
    uri: &str,
    config: ClusterConfig,
) -> Result<Cluster<FredConnector>, Box<dyn std::error::Error>> {
    let seed = connector.connect(&NodeAddr::parse(uri)?).await?;
    Ok(Cluster::from_node(connector, seed, config).await?)
}
