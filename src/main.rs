use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

use fleet_supervisor::agents::SystemLoadSampler;
use fleet_supervisor::comm::{CommunicationLayer, HttpTransport};
use fleet_supervisor::config::FleetConfig;
use fleet_supervisor::shutdown::ShutdownCoordinator;
use fleet_supervisor::supervisor::{self, SupervisorNode};
use fleet_supervisor::telemetry::{init_telemetry, shutdown_telemetry};
use fleet_supervisor::worker::{self, RecordedSensorFeed, SensorContextExecutor, WorkerAgent};

#[derive(Parser)]
#[command(name = "fleet-supervisor")]
#[command(about = "Supervisory orchestration for fleets of edge agents")]
#[command(long_about = "Runs supervisor-capable nodes that elect a leader, track agent liveness and load, \
                       and place tasks on the least loaded capable agent, escalating to larger tiers when \
                       the edge is saturated. The same binary runs the worker agents.")]
struct Cli {
    /// Configuration file (defaults to ./fleet-supervisor.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a supervisor-capable node
    Supervisor,
    /// Run a worker agent
    Agent,
    /// Print fleet status reported by a supervisor
    Status {
        #[arg(long, default_value = "http://127.0.0.1:8080", help = "Base URL of a supervisor")]
        url: String,
    },
    /// Print the effective configuration as TOML
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Supervisor => {
            tokio::runtime::Runtime::new()?.block_on(async { supervisor_command(config_path).await })
        }
        Commands::Agent => {
            tokio::runtime::Runtime::new()?.block_on(async { agent_command(config_path).await })
        }
        Commands::Status { url } => {
            tokio::runtime::Runtime::new()?.block_on(async { status_command(&url).await })
        }
        Commands::Config => {
            let config = FleetConfig::load(config_path)?;
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

async fn until_shutdown(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }
}

async fn serve(bind: &str, app: axum::Router, shutdown: watch::Receiver<bool>) -> Result<tokio::task::JoinHandle<()>> {
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    info!(address = %listener.local_addr()?, "HTTP surface listening");

    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(until_shutdown(shutdown))
            .await
        {
            error!(error = %e, "HTTP server failed");
        }
    }))
}

async fn supervisor_command(config_path: Option<&Path>) -> Result<()> {
    let config = FleetConfig::load(config_path)?;
    init_telemetry(&config.observability)?;

    let node_id = config.node_id();
    info!(node_id = %node_id, peers = config.failover.peers.len(), "Starting supervisor node");

    let transport = Arc::new(HttpTransport::new(Duration::from_millis(config.communication.timeout_ms)));
    let node = SupervisorNode::new(node_id, transport, config.supervisor_settings());

    let mut shutdown = ShutdownCoordinator::default();
    shutdown.track_all(node.spawn_background(shutdown.subscribe()));

    let app = supervisor::router(node.clone(), config.request_window());
    shutdown.track(serve(&config.node.bind, app, shutdown.subscribe()).await?);

    #[cfg(unix)]
    shutdown.track(spawn_reload_on_hangup(
        node,
        config_path.map(Path::to_path_buf),
        shutdown.subscribe(),
    )?);

    shutdown.wait_for_shutdown().await?;
    shutdown_telemetry();
    Ok(())
}

/// Re-reads configuration on SIGHUP and pushes it into the running node.
/// An invalid file is logged and the previous settings stay in force.
#[cfg(unix)]
fn spawn_reload_on_hangup(
    node: Arc<SupervisorNode>,
    config_path: Option<PathBuf>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<tokio::task::JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangups = signal(SignalKind::hangup())?;
    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                received = hangups.recv() => {
                    if received.is_none() {
                        break;
                    }
                    match FleetConfig::load(config_path.as_deref()) {
                        Ok(config) => node.apply_settings(&config.supervisor_settings()),
                        Err(e) => error!(error = %e, "Configuration reload rejected"),
                    }
                }
            }
        }
    }))
}

async fn agent_command(config_path: Option<&Path>) -> Result<()> {
    let config = FleetConfig::load(config_path)?;
    init_telemetry(&config.observability)?;

    let registration = config.agent_registration();
    info!(
        agent_id = %registration.id,
        location = %registration.location,
        tier = %registration.tier,
        supervisors = config.worker.supervisors.len(),
        "Starting worker agent"
    );

    let queue_depth = Arc::new(AtomicU32::new(0));
    let sensors = Arc::new(RecordedSensorFeed::new(config.worker.sensor_capacity));
    let comm = Arc::new(CommunicationLayer::new(
        registration.id.as_str(),
        Arc::new(HttpTransport::new(Duration::from_millis(config.communication.timeout_ms))),
        config.retry_policy(),
    ));
    let agent = Arc::new(WorkerAgent::new(
        registration,
        config.worker.supervisors.clone(),
        comm,
        Arc::new(SystemLoadSampler::new(queue_depth.clone())),
        Arc::new(SensorContextExecutor::new(config.worker.location.clone(), sensors.clone())),
        sensors,
        queue_depth,
        Duration::from_secs(config.worker.heartbeat_interval_secs),
    ));

    let mut shutdown = ShutdownCoordinator::default();
    let app = worker::router(agent.clone(), config.request_window());
    shutdown.track(serve(&config.node.bind, app, shutdown.subscribe()).await?);
    shutdown.track(tokio::spawn(agent.run(shutdown.subscribe())));

    shutdown.wait_for_shutdown().await?;
    shutdown_telemetry();
    Ok(())
}

async fn status_command(url: &str) -> Result<()> {
    let response = reqwest::get(format!("{}/status", url.trim_end_matches('/')))
        .await
        .with_context(|| format!("supervisor at {url} is unreachable"))?
        .error_for_status()?;
    let status: serde_json::Value = response.json().await?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}
