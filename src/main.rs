use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use calcgrid::cache::InMemoryCacheSource;
use calcgrid::config::{ContainerConfig, DispatcherConfig, NodeHostConfig, WatchdogConfig};
use calcgrid::container::CalculationNodeContainer;
use calcgrid::dispatcher::JobDispatcher;
use calcgrid::function::{ClosureInvoker, FunctionError, InMemoryFunctionRepository};
use calcgrid::identifier::PassthroughIdentifierMap;
use calcgrid::node::{create_node_id, CalculationNode};
use calcgrid::remote::{RemoteNodeClient, RemoteNodeServer};
use calcgrid::shutdown::shutdown_token;
use calcgrid::stats::TotallingStatistics;
use calcgrid::values::{CalcValue, ComputedValue};
use calcgrid::watchdog::ExecutionWatchdog;

#[derive(Parser, Debug)]
#[command(name = "calcgrid")]
#[command(version)]
#[command(about = "Job-dispatch core for a distributed analytics compute grid")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a dispatcher that accepts node-host connections
    Dispatcher(DispatcherArgs),

    /// Run a pool of calculation nodes behind a dispatcher connection
    NodeHost(NodeHostArgs),
}

#[derive(Parser, Debug)]
struct DispatcherArgs {
    /// Address to listen on for node hosts
    #[arg(long, default_value = "0.0.0.0:7470")]
    listen: SocketAddr,

    /// Terminal failure after this many attempts per job
    #[arg(long, default_value = "3")]
    max_job_attempts: usize,

    /// Wall-clock bound for one job execution, in seconds
    #[arg(long, default_value = "300")]
    max_job_execution_secs: u64,

    /// Function repository version advertised to node hosts
    #[arg(long, default_value = "0")]
    function_init_id: u64,
}

#[derive(Parser, Debug)]
struct NodeHostArgs {
    /// Dispatcher address to connect to
    #[arg(long, default_value = "127.0.0.1:7470")]
    connect: SocketAddr,

    /// Number of calculation nodes in the pool
    #[arg(long, default_value = "4")]
    nodes: usize,

    /// Interrupt any job item running longer than this many seconds
    #[arg(long)]
    max_item_execution_secs: Option<u64>,

    /// Register a small arithmetic function repository for smoke tests
    #[arg(long)]
    demo_functions: bool,
}

async fn run_dispatcher(args: DispatcherArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = DispatcherConfig::default()
        .with_max_job_attempts(args.max_job_attempts)
        .with_max_job_execution_time(Duration::from_secs(args.max_job_execution_secs));
    let dispatcher = JobDispatcher::new(config);
    let server = RemoteNodeServer::new(
        dispatcher,
        Arc::new(PassthroughIdentifierMap),
        args.function_init_id,
    );

    let shutdown = shutdown_token();
    tracing::info!(listen = %args.listen, "Starting dispatcher");
    server.run(args.listen, shutdown).await?;
    Ok(())
}

async fn run_node_host(args: NodeHostArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut watchdog_config = WatchdogConfig::default();
    if let Some(secs) = args.max_item_execution_secs {
        watchdog_config = watchdog_config.with_max_item_execution(Duration::from_secs(secs));
    }
    let config = NodeHostConfig {
        dispatcher_addr: args.connect,
        container: ContainerConfig::default().with_node_count(args.nodes),
        watchdog: watchdog_config,
        ..NodeHostConfig::default()
    };

    let cache_source = Arc::new(InMemoryCacheSource::new());
    let functions = Arc::new(InMemoryFunctionRepository::new());
    if args.demo_functions {
        register_demo_functions(&functions);
    }
    let watchdog = Arc::new(ExecutionWatchdog::new(config.watchdog.clone()));
    let statistics = Arc::new(TotallingStatistics::new());

    let nodes = (0..config.container.node_count)
        .map(|_| {
            CalculationNode::new(create_node_id(), cache_source.clone(), functions.clone())
                .with_statistics(statistics.clone())
                .with_watchdog(watchdog.clone())
        })
        .collect();
    let container = CalculationNodeContainer::new(nodes, config.container.clone());

    let client = RemoteNodeClient::new(
        container,
        functions,
        Arc::new(PassthroughIdentifierMap),
        create_node_id(),
    )
    .with_invocation_statistics(statistics)
    .with_statistics_interval(config.statistics_interval);

    let shutdown = shutdown_token();
    client.connect(config.dispatcher_addr, shutdown).await?;
    Ok(())
}

fn register_demo_functions(functions: &InMemoryFunctionRepository) {
    // Sums all numeric inputs into each requested output.
    functions.register(
        "demo/sum",
        Arc::new(ClosureInvoker::new(|_ctx, inputs, _target, outputs| {
            let total: f64 = inputs
                .values
                .iter()
                .filter_map(|v| match &v.value {
                    CalcValue::Data(data) => data.as_f64(),
                    _ => None,
                })
                .sum();
            Ok(outputs
                .iter()
                .map(|spec| ComputedValue::data(spec.clone(), serde_json::json!(total)))
                .collect())
        })),
    );
    // Multiplies the single input by a "factor" parameter.
    functions.register(
        "demo/scale",
        Arc::new(ClosureInvoker::new(|ctx, inputs, _target, outputs| {
            let factor = ctx.parameters.get("factor").and_then(|f| f.as_f64());
            let factor = factor.ok_or_else(|| {
                FunctionError::new("InvalidParametersError", "missing numeric 'factor'")
            })?;
            let input = inputs
                .values
                .first()
                .and_then(|v| match &v.value {
                    CalcValue::Data(data) => data.as_f64(),
                    _ => None,
                })
                .ok_or_else(|| {
                    FunctionError::new("InvalidParametersError", "missing numeric input")
                })?;
            Ok(outputs
                .iter()
                .map(|spec| ComputedValue::data(spec.clone(), serde_json::json!(input * factor)))
                .collect())
        })),
    );
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match args.command {
        Commands::Dispatcher(args) => run_dispatcher(args).await,
        Commands::NodeHost(args) => run_node_host(args).await,
    }
}
