use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{info, warn};

mod api;
mod config;
mod descriptor;
mod errors;
mod events;
mod instance_manager;
mod log_collector;
mod monitor;
mod port_manager;
mod runtime_gateway;

pub use config::DaemonConfig;
pub use errors::{DaemonError, DaemonResult};

use api::ApiState;
use descriptor::TemplateManager;
use events::EventHub;
use instance_manager::{InstanceDefaults, InstanceManager};
use log_collector::LogCollector;
use monitor::MonitorManager;
use port_manager::PortManager;
use runtime_gateway::DockerGateway;

const ORPHAN_SWEEP_INTERVAL: Duration = Duration::from_secs(300);
const EXPORT_SWEEP_INTERVAL: Duration = Duration::from_secs(86_400);

/// Flotilla - main daemon state
pub struct FlotillaDaemon {
    config: Arc<DaemonConfig>,
    instances: Arc<InstanceManager>,
    monitor: MonitorManager,
    logs: LogCollector,
    ports: Arc<PortManager>,
    events: Arc<EventHub>,
    docker: DockerGateway,
}

impl FlotillaDaemon {
    pub async fn new(config: DaemonConfig) -> DaemonResult<Self> {
        info!("Initializing flotilla daemon");

        let config = Arc::new(config);
        let docker = DockerGateway::new(&config.docker)?;
        let events = Arc::new(EventHub::new());

        let templates = Arc::new(TemplateManager::new(&config.server.data_dir));
        templates.ensure_layout().await?;

        let monitoring_config_path = config
            .server
            .data_dir
            .join("config")
            .join("monitoring.json");
        let monitoring_config = Arc::new(RwLock::new(monitor::load_or_init_config(
            &monitoring_config_path,
        )?));

        let monitor = MonitorManager::new(
            docker.clone(),
            events.clone(),
            monitoring_config.clone(),
            monitoring_config_path,
        );
        let logs = LogCollector::new(
            docker.clone(),
            events.clone(),
            monitoring_config,
            &config.server.data_dir,
        );
        let ports = Arc::new(PortManager::new(
            docker.clone(),
            templates.instances_dir().to_path_buf(),
        ));

        let instances = Arc::new(InstanceManager::new(
            docker.clone(),
            templates,
            ports.clone(),
            monitor.clone(),
            logs.clone(),
            events.clone(),
            InstanceDefaults {
                username: config.server.default_username.clone(),
                password: config.server.default_password.clone(),
            },
        ));

        Ok(Self {
            config,
            instances,
            monitor,
            logs,
            ports,
            events,
            docker,
        })
    }

    pub async fn run(&self) -> DaemonResult<()> {
        info!("Starting flotilla daemon");

        if let Err(e) = self.docker.ping().await {
            warn!("Container runtime not reachable at startup: {}", e);
        }

        match self.instances.cleanup_orphaned().await {
            Ok(cleaned) if !cleaned.is_empty() => {
                info!(
                    "Startup sweep marked {} orphaned instance(s) stopped",
                    cleaned.len()
                );
            }
            Ok(_) => {}
            Err(e) => warn!("Startup orphan sweep failed: {}", e),
        }

        // Periodic reconciliation catches drift when containers die or
        // get removed out-of-band.
        let instances = self.instances.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ORPHAN_SWEEP_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = instances.cleanup_orphaned().await {
                    warn!("Periodic orphan sweep failed: {}", e);
                }
            }
        });

        let logs = self.logs.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(EXPORT_SWEEP_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = logs.cleanup_exports().await {
                    warn!("Export retention sweep failed: {}", e);
                }
            }
        });

        let state = ApiState {
            instances: self.instances.clone(),
            monitor: self.monitor.clone(),
            logs: self.logs.clone(),
            ports: self.ports.clone(),
            events: self.events.clone(),
            docker: self.docker.clone(),
        };
        let app = api::router(state);

        let listener = tokio::net::TcpListener::bind(&self.config.server.bind_addr).await?;
        info!("API listening on {}", self.config.server.bind_addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                info!("Shutdown signal received");
            })
            .await
            .map_err(|e| DaemonError::InternalError(e.to_string()))
    }
}

#[tokio::main]
async fn main() -> DaemonResult<()> {
    let mut config_path: Option<String> = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            config_path = args.next();
        }
    }

    let config_path = config_path.as_deref().unwrap_or("./config.toml");
    // Load config first so logging level/format can be applied.
    let config = DaemonConfig::from_file(config_path)
        .or_else(|_| DaemonConfig::from_file("/etc/flotilla/config.toml"))
        .or_else(|_| DaemonConfig::from_env())
        .map_err(DaemonError::ConfigError)?;

    let filter = format!("flotilla={},tower_http=info", config.logging.level);
    if config.logging.format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("Flotilla daemon starting");
    info!("Configuration loaded: {:?}", config);

    let daemon = FlotillaDaemon::new(config).await?;
    daemon.run().await?;

    Ok(())
}
