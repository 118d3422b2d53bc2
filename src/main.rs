use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use serde::Deserialize;
use tonic::transport::{Channel, Endpoint};
use tracing_subscriber::EnvFilter;

use flowmesh::config::{NodeConfig, TlsConfig};
use flowmesh::error::FlowmeshError;
use flowmesh::node::Node;
use flowmesh::proto;
use flowmesh::proto::cluster_service_client::ClusterServiceClient;
use flowmesh::proto::workflow_service_client::WorkflowServiceClient;
use flowmesh::shutdown::install_shutdown_handler;
use flowmesh::store::MemoryStore;
use flowmesh::tls::TlsIdentity;

#[derive(Parser, Debug)]
#[command(name = "flowmesh")]
#[command(version)]
#[command(about = "A decentralized DAG workflow scheduler")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a flowmesh worker node
    Server(ServerArgs),

    /// Workflow management commands
    Workflow {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: WorkflowCommands,
    },

    /// Cluster management commands
    Cluster {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: ClusterCommands,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Address to listen on for gRPC
    #[arg(long, default_value = "127.0.0.1:7450")]
    listen_addr: SocketAddr,

    /// Address advertised to peers (defaults to the listen address)
    #[arg(long)]
    advertise_addr: Option<String>,

    /// Peer worker address (host:port); repeat for each peer
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Size of the bucket partition space (must match cluster-wide)
    #[arg(long, default_value_t = 1024)]
    bucket_count: u32,

    /// Lease renewal interval in milliseconds
    #[arg(long, default_value_t = 10_000)]
    lease_renewal_interval_ms: u64,

    /// Lease abandonment threshold in milliseconds (>= 3x renewal)
    #[arg(long, default_value_t = 30_000)]
    lease_abandon_threshold_ms: u64,

    /// Peer heartbeat interval in milliseconds
    #[arg(long, default_value_t = 1_000)]
    heartbeat_interval_ms: u64,

    /// Peer silence threshold in milliseconds (>= 3x heartbeat)
    #[arg(long, default_value_t = 5_000)]
    peer_timeout_ms: u64,

    /// Default job handler timeout in seconds
    #[arg(long, default_value_t = 3_600)]
    job_timeout_secs: u64,

    /// Path to the cluster CA certificate (enables mTLS)
    #[arg(long)]
    tls_ca_cert: Option<PathBuf>,

    /// Path to this node's certificate
    #[arg(long)]
    tls_cert: Option<PathBuf>,

    /// Path to this node's private key
    #[arg(long)]
    tls_key: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Worker address to connect to
    #[arg(long, default_value = "127.0.0.1:7450")]
    addr: String,

    /// Path to the cluster CA certificate (enables mTLS)
    #[arg(long)]
    tls_ca_cert: Option<PathBuf>,

    /// Path to the client certificate
    #[arg(long)]
    tls_cert: Option<PathBuf>,

    /// Path to the client private key
    #[arg(long)]
    tls_key: Option<PathBuf>,
}

#[derive(clap::Subcommand, Debug)]
enum WorkflowCommands {
    /// Create a workflow from a JSON definition file
    Create {
        /// Path to the workflow definition
        #[arg(long)]
        file: PathBuf,
    },
    /// Bring a workflow online (starts materializing runs)
    Online { workflow_id: i64 },
    /// Take a workflow offline (drops pending registrations)
    Offline { workflow_id: i64 },
    /// Fire a workflow once, immediately
    Trigger { workflow_id: i64 },
    /// Cancel a workflow run's active job runs
    Kill { workflow_run_id: i64 },
    /// Reset a workflow run's failed job runs and run them again
    Rerun { workflow_run_id: i64 },
    /// Reset a single failed job run
    Retry { job_run_id: i64 },
}

#[derive(clap::Subcommand, Debug)]
enum ClusterCommands {
    /// Show this worker's view of the cluster
    Status,
}

// =============================================================================
// Workflow definition file format
// =============================================================================

#[derive(Deserialize, Debug)]
struct WorkflowFile {
    name: String,
    trigger_type: String,
    #[serde(default)]
    trigger_value: String,
    #[serde(default)]
    priority: i32,
    jobs: Vec<JobFile>,
    /// Pairs of indexes into `jobs`: [child, parent].
    #[serde(default)]
    dependencies: Vec<[usize; 2]>,
}

#[derive(Deserialize, Debug)]
struct JobFile {
    name: String,
    handler: String,
    #[serde(default)]
    trigger_type: String,
    #[serde(default)]
    trigger_value: String,
    #[serde(default)]
    priority: i32,
    #[serde(default)]
    max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    backoff_ms: u64,
}

fn default_backoff_ms() -> u64 {
    1_000
}

// =============================================================================
// Command handlers
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let advertise = args
        .advertise_addr
        .unwrap_or_else(|| args.listen_addr.to_string());

    let tls = TlsConfig {
        enabled: args.tls_ca_cert.is_some(),
        ca_cert_path: args.tls_ca_cert,
        cert_path: args.tls_cert,
        key_path: args.tls_key,
    };

    let mut config = NodeConfig::new(advertise, args.listen_addr);
    for peer in args.peers {
        config = config.with_peer(peer);
    }
    config.bucket_count = args.bucket_count;
    config.lease_renewal_interval_ms = args.lease_renewal_interval_ms;
    config.lease_abandon_threshold_ms = args.lease_abandon_threshold_ms;
    config.heartbeat_interval_ms = args.heartbeat_interval_ms;
    config.peer_timeout_ms = args.peer_timeout_ms;
    config.job_timeout_secs = args.job_timeout_secs;
    config.tls = tls;

    tracing::info!(
        advertise = %config.advertise_addr,
        buckets = config.bucket_count,
        peers = config.peers.len(),
        "Starting flowmesh worker"
    );

    // In-process store; cluster deployments plug a database-backed
    // RunStore in here.
    let store = Arc::new(MemoryStore::new());
    let node = Node::new(config, store)?;
    let shutdown = install_shutdown_handler();
    node.run(shutdown).await?;
    Ok(())
}

async fn create_client_channel(args: &ClientArgs) -> Result<Channel, Box<dyn std::error::Error>> {
    let use_tls = args.tls_ca_cert.is_some();
    let scheme = if use_tls { "https" } else { "http" };
    let mut endpoint = Endpoint::from_shared(format!("{scheme}://{}", args.addr))?;

    if use_tls {
        let tls_config = TlsConfig {
            enabled: true,
            ca_cert_path: args.tls_ca_cert.clone(),
            cert_path: args.tls_cert.clone(),
            key_path: args.tls_key.clone(),
        };
        let identity = TlsIdentity::load(&tls_config)
            .await
            .map_err(|e| FlowmeshError::InvalidConfig(e.to_string()))?;
        endpoint = endpoint.tls_config(identity.client_tls_config())?;
    }

    Ok(endpoint.connect().await?)
}

async fn handle_workflow_create(
    client: &mut WorkflowServiceClient<Channel>,
    file: PathBuf,
) -> Result<(), Box<dyn std::error::Error>> {
    let content = tokio::fs::read_to_string(&file).await?;
    let definition: WorkflowFile = serde_json::from_str(&content)?;

    let jobs: Vec<proto::JobSpecProto> = definition
        .jobs
        .iter()
        .map(|job| proto::JobSpecProto {
            name: job.name.clone(),
            handler: job.handler.clone(),
            trigger_type: job.trigger_type.clone(),
            trigger_value: job.trigger_value.clone(),
            priority: job.priority,
            max_attempts: job.max_attempts,
            backoff_ms: job.backoff_ms,
        })
        .collect();

    let dependencies: Vec<proto::DependencyEdgeProto> = definition
        .dependencies
        .iter()
        .map(|[child, parent]| proto::DependencyEdgeProto {
            job_id: *child as i64,
            parent_job_id: *parent as i64,
        })
        .collect();

    let request = proto::CreateWorkflowRequest {
        workflow: Some(proto::WorkflowSpecProto {
            name: definition.name,
            trigger_type: definition.trigger_type,
            trigger_value: definition.trigger_value,
            priority: definition.priority,
        }),
        jobs,
        dependencies,
    };

    let response = client.create_workflow(request).await?.into_inner();
    if response.success {
        println!("workflow created: id={}", response.workflow_id);
        for (i, job_id) in response.job_ids.iter().enumerate() {
            println!("  job[{i}]: id={job_id}");
        }
    } else {
        eprintln!("create rejected: {}", response.error);
        std::process::exit(1);
    }
    Ok(())
}

fn print_action(name: &str, response: proto::ActionResponse) {
    if response.success {
        println!("{name} accepted: event_id={}", response.event_id);
    } else {
        eprintln!("{name} failed: {}", response.error);
        std::process::exit(1);
    }
}

async fn handle_cluster_status(
    client: &mut ClusterServiceClient<Channel>,
) -> Result<(), Box<dyn std::error::Error>> {
    let status = client
        .get_cluster_status(proto::ClusterStatusRequest {})
        .await?
        .into_inner();

    println!("worker:          {}", status.address);
    println!(
        "owned buckets:   {}/{}",
        status.owned_buckets, status.bucket_count
    );
    println!("registered runs: {}", status.registered_runs);
    println!("live workers:");
    for worker in status.live_workers {
        println!("  {worker}");
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Workflow { client, command } => {
            let channel = create_client_channel(&client).await?;
            let mut grpc_client = WorkflowServiceClient::new(channel);

            match command {
                WorkflowCommands::Create { file } => {
                    handle_workflow_create(&mut grpc_client, file).await?;
                }
                WorkflowCommands::Online { workflow_id } => {
                    let response = grpc_client
                        .online_workflow(proto::WorkflowActionRequest { workflow_id })
                        .await?
                        .into_inner();
                    print_action("online", response);
                }
                WorkflowCommands::Offline { workflow_id } => {
                    let response = grpc_client
                        .offline_workflow(proto::WorkflowActionRequest { workflow_id })
                        .await?
                        .into_inner();
                    print_action("offline", response);
                }
                WorkflowCommands::Trigger { workflow_id } => {
                    let response = grpc_client
                        .trigger_workflow(proto::WorkflowActionRequest { workflow_id })
                        .await?
                        .into_inner();
                    print_action("trigger", response);
                }
                WorkflowCommands::Kill { workflow_run_id } => {
                    let response = grpc_client
                        .kill_run(proto::RunActionRequest { workflow_run_id })
                        .await?
                        .into_inner();
                    print_action("kill", response);
                }
                WorkflowCommands::Rerun { workflow_run_id } => {
                    let response = grpc_client
                        .rerun_run(proto::RunActionRequest { workflow_run_id })
                        .await?
                        .into_inner();
                    print_action("rerun", response);
                }
                WorkflowCommands::Retry { job_run_id } => {
                    let response = grpc_client
                        .retry_job_run(proto::JobRunActionRequest { job_run_id })
                        .await?
                        .into_inner();
                    print_action("retry", response);
                }
            }
        }
        Commands::Cluster { client, command } => {
            let channel = create_client_channel(&client).await?;
            let mut grpc_client = ClusterServiceClient::new(channel);

            match command {
                ClusterCommands::Status => {
                    handle_cluster_status(&mut grpc_client).await?;
                }
            }
        }
    }

    Ok(())
}
