use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::descriptor::TemplateManager;
use crate::errors::{DaemonError, DaemonResult};
use crate::events::EventHub;
use crate::log_collector::LogCollector;
use crate::monitor::MonitorManager;
use crate::port_manager::PortManager;
use crate::runtime_gateway::{runtime_id, ContainerState, DockerGateway};

const COMPOSE_UP_TIMEOUT_SECS: u64 = 30;
const COMPOSE_DOWN_TIMEOUT_SECS: u64 = 15;
const CONTAINER_STOP_GRACE_SECS: u64 = 10;
const START_SETTLE_DELAY: Duration = Duration::from_secs(2);
const RESTART_GRACE_DELAY: Duration = Duration::from_secs(1);
const METADATA_FILE: &str = "metadata.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Created,
    Starting,
    Running,
    Paused,
    Stopped,
    Error,
    Restarting,
    Deleting,
    Crashed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub id: String,
    pub client_name: String,
    pub subdomain: String,
    pub port: u16,
    pub status: InstanceStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInstanceInput {
    pub client_name: String,
    pub subdomain: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// Credentials applied when a create request omits them.
#[derive(Clone)]
pub struct InstanceDefaults {
    pub username: String,
    pub password: String,
}

/// Owns instance metadata and drives every lifecycle transition. The
/// persisted status is a cache: live container state wins whenever it
/// can be obtained, and reads re-sync it.
pub struct InstanceManager {
    docker: DockerGateway,
    templates: Arc<TemplateManager>,
    ports: Arc<PortManager>,
    monitor: MonitorManager,
    logs: LogCollector,
    events: Arc<EventHub>,
    defaults: InstanceDefaults,
}

impl InstanceManager {
    pub fn new(
        docker: DockerGateway,
        templates: Arc<TemplateManager>,
        ports: Arc<PortManager>,
        monitor: MonitorManager,
        logs: LogCollector,
        events: Arc<EventHub>,
        defaults: InstanceDefaults,
    ) -> Self {
        Self {
            docker,
            templates,
            ports,
            monitor,
            logs,
            events,
            defaults,
        }
    }

    /// Allocate a port, materialize the descriptor, persist metadata in
    /// `CREATED`. No container exists yet.
    pub async fn create(&self, input: CreateInstanceInput) -> DaemonResult<Instance> {
        if input.client_name.trim().is_empty() {
            return Err(DaemonError::InvalidRequest(
                "clientName must be non-empty".to_string(),
            ));
        }

        let id = Uuid::new_v4().to_string();
        let port = self.ports.allocate(&id).await?;

        let username = input
            .username
            .unwrap_or_else(|| self.defaults.username.clone());
        let password = input
            .password
            .unwrap_or_else(|| self.defaults.password.clone());

        if let Err(e) = self
            .templates
            .materialize(&id, port, &input.client_name, &username, &password)
            .await
        {
            self.ports.release(port);
            return Err(e);
        }

        let instance = Instance {
            id: id.clone(),
            client_name: input.client_name,
            subdomain: input.subdomain,
            port,
            status: InstanceStatus::Created,
            created_at: Utc::now(),
        };

        if let Err(e) = self.save_metadata(&instance).await {
            self.ports.release(port);
            let _ = self.templates.remove_instance_dir(&id).await;
            return Err(e);
        }

        info!(
            "Created instance {} for client {} on port {}",
            instance.id, instance.client_name, instance.port
        );
        Ok(instance)
    }

    pub async fn list(&self) -> DaemonResult<Vec<Instance>> {
        let mut instances = Vec::new();
        for id in self.templates.list_instance_dirs().await? {
            match self.refresh(&id).await {
                Ok(Some(instance)) => instances.push(instance),
                Ok(None) => {}
                Err(e) => error!("Error loading instance {}: {}", id, e),
            }
        }
        instances.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(instances)
    }

    pub async fn get(&self, id: &str) -> DaemonResult<Instance> {
        self.refresh(id)
            .await?
            .ok_or_else(|| DaemonError::NotFound(id.to_string()))
    }

    /// Start the instance's compose project and begin monitoring once the
    /// runtime reports it running. Pre-flight failures (runtime
    /// unreachable, invalid descriptor) propagate without touching the
    /// persisted status; failures after `STARTING` persist `ERROR`.
    pub async fn start(&self, id: &str) -> DaemonResult<Instance> {
        let mut instance = self
            .load_metadata(id)
            .await?
            .ok_or_else(|| DaemonError::NotFound(id.to_string()))?;

        self.docker.ping().await?;

        let diagnostics = self.templates.validate(&self.docker, id).await?;
        if !diagnostics.is_empty() {
            return Err(DaemonError::InvalidDescriptor(diagnostics));
        }

        self.set_status(&mut instance, InstanceStatus::Starting)
            .await?;

        match self.bring_up(&mut instance).await {
            Ok(()) => Ok(instance),
            Err(e) => {
                error!("Failed to start instance {}: {}", id, e);
                if let Err(persist_err) =
                    self.set_status(&mut instance, InstanceStatus::Error).await
                {
                    error!(
                        "Could not persist error status for instance {}: {}",
                        id, persist_err
                    );
                }
                Err(e)
            }
        }
    }

    async fn bring_up(&self, instance: &mut Instance) -> DaemonResult<()> {
        let dir = self.templates.instance_dir(&instance.id);
        self.docker
            .compose_up(&dir, COMPOSE_UP_TIMEOUT_SECS)
            .await?;

        tokio::time::sleep(START_SETTLE_DELAY).await;

        let derived = self.derive_status(&instance.id).await;
        self.set_status(instance, derived).await?;

        if derived == InstanceStatus::Running {
            self.start_instance_monitoring(instance).await;
        }
        Ok(())
    }

    /// Stop monitoring, bring the compose project down, persist
    /// `STOPPED`. Runtime errors and timeouts are logged, never
    /// propagated: stop must be safe on a possibly-already-gone instance.
    pub async fn stop(&self, id: &str) -> DaemonResult<Instance> {
        let mut instance = self
            .load_metadata(id)
            .await?
            .ok_or_else(|| DaemonError::NotFound(id.to_string()))?;

        self.stop_instance_monitoring(id).await;

        let dir = self.templates.instance_dir(id);
        if let Err(e) = self
            .docker
            .compose_down(&dir, COMPOSE_DOWN_TIMEOUT_SECS)
            .await
        {
            warn!("Compose down failed for instance {} (continuing): {}", id, e);
        }

        self.set_status(&mut instance, InstanceStatus::Stopped)
            .await?;
        Ok(instance)
    }

    pub async fn pause(&self, id: &str) -> DaemonResult<Instance> {
        let mut instance = self
            .load_metadata(id)
            .await?
            .ok_or_else(|| DaemonError::NotFound(id.to_string()))?;

        if let Ok(Some(_)) = self.docker.inspect(&runtime_id(id)).await {
            self.docker.pause(&runtime_id(id)).await?;
        }

        self.set_status(&mut instance, InstanceStatus::Paused)
            .await?;
        Ok(instance)
    }

    /// Resume a paused instance in place; an exited container is started
    /// directly, and a missing one goes through the full start path.
    pub async fn resume(&self, id: &str) -> DaemonResult<Instance> {
        let mut instance = self
            .load_metadata(id)
            .await?
            .ok_or_else(|| DaemonError::NotFound(id.to_string()))?;

        let name = runtime_id(id);
        match self.docker.inspect(&name).await? {
            None => return self.start(id).await,
            Some(details) => match details.state {
                ContainerState::Paused => self.docker.unpause(&name).await?,
                ContainerState::Exited | ContainerState::Created => {
                    self.docker.start(&name).await?
                }
                _ => {}
            },
        }

        let derived = self.derive_status(id).await;
        self.set_status(&mut instance, derived).await?;
        if derived == InstanceStatus::Running {
            self.start_instance_monitoring(&instance).await;
        }
        Ok(instance)
    }

    /// Run descriptor validation on demand; returns the collected
    /// diagnostics, empty when the descriptor is valid.
    pub async fn validate_descriptor(&self, id: &str) -> DaemonResult<Vec<String>> {
        if self.load_metadata(id).await?.is_none() {
            return Err(DaemonError::NotFound(id.to_string()));
        }
        self.templates.validate(&self.docker, id).await
    }

    /// Stop, short grace delay, start. A stop failure propagates without
    /// attempting the start.
    pub async fn restart(&self, id: &str) -> DaemonResult<Instance> {
        let mut instance = self
            .load_metadata(id)
            .await?
            .ok_or_else(|| DaemonError::NotFound(id.to_string()))?;
        self.set_status(&mut instance, InstanceStatus::Restarting)
            .await?;

        self.stop(id).await?;
        tokio::time::sleep(RESTART_GRACE_DELAY).await;
        self.start(id).await
    }

    /// Tear the instance down and remove everything it owns. Partial
    /// failure does not resurrect the instance; the caller retries.
    pub async fn delete(&self, id: &str) -> DaemonResult<bool> {
        let mut instance = self
            .load_metadata(id)
            .await?
            .ok_or_else(|| DaemonError::NotFound(id.to_string()))?;

        if instance.status != InstanceStatus::Stopped {
            self.set_status(&mut instance, InstanceStatus::Deleting)
                .await?;
            self.stop(id).await?;
        }

        // Compose down normally removes the container; force-remove any
        // survivor so the name can be reused.
        let name = runtime_id(id);
        if matches!(self.docker.inspect(&name).await, Ok(Some(_))) {
            if let Err(e) = self.docker.stop(&name, CONTAINER_STOP_GRACE_SECS).await {
                warn!("Could not stop container {}: {}", name, e);
            }
            if let Err(e) = self.docker.remove(&name, true).await {
                warn!("Could not remove container {}: {}", name, e);
            }
        }

        self.templates.remove_instance_dir(id).await?;
        self.ports.release_instance(id);

        info!("Deleted instance {}", id);
        Ok(true)
    }

    /// Mark persisted instances whose container disappeared as
    /// `STOPPED`. `CREATED` records are left alone: no container is
    /// expected before the first start.
    pub async fn cleanup_orphaned(&self) -> DaemonResult<Vec<String>> {
        let mut cleaned = Vec::new();

        for id in self.templates.list_instance_dirs().await? {
            let mut instance = match self.load_metadata(&id).await {
                Ok(Some(instance)) => instance,
                Ok(None) => continue,
                Err(e) => {
                    error!("Error checking instance {}: {}", id, e);
                    continue;
                }
            };

            let container_present =
                matches!(self.docker.inspect(&runtime_id(&id)).await, Ok(Some(_)));
            if container_present || instance.status == InstanceStatus::Created {
                continue;
            }

            info!("Found orphaned instance: {}", id);
            if let Err(e) = self.set_status(&mut instance, InstanceStatus::Stopped).await {
                error!("Could not mark orphan {} stopped: {}", id, e);
                continue;
            }
            cleaned.push(id);
        }

        Ok(cleaned)
    }

    async fn start_instance_monitoring(&self, instance: &Instance) {
        self.monitor
            .start_monitoring(&instance.id, instance.port)
            .await;
        self.logs.start_collection(&instance.id).await;
    }

    async fn stop_instance_monitoring(&self, id: &str) {
        self.monitor.stop_monitoring(id).await;
        self.logs.stop_collection(id).await;
    }

    /// Load a record and re-sync its cached status from the live runtime.
    async fn refresh(&self, id: &str) -> DaemonResult<Option<Instance>> {
        let Some(mut instance) = self.load_metadata(id).await? else {
            return Ok(None);
        };

        let derived = self.derive_status(id).await;
        if derived != instance.status {
            instance.status = derived;
            if let Err(e) = self.save_metadata(&instance).await {
                warn!("Could not persist refreshed status for {}: {}", id, e);
            }
        }
        Ok(Some(instance))
    }

    /// Live container state is authoritative; an absent (or unreadable)
    /// container reads as `STOPPED`.
    async fn derive_status(&self, id: &str) -> InstanceStatus {
        match self.docker.inspect(&runtime_id(id)).await {
            Ok(Some(details)) => status_from_container_state(details.state),
            Ok(None) | Err(_) => InstanceStatus::Stopped,
        }
    }

    async fn set_status(
        &self,
        instance: &mut Instance,
        status: InstanceStatus,
    ) -> DaemonResult<()> {
        let changed = instance.status != status;
        instance.status = status;
        self.save_metadata(instance).await?;
        if changed {
            self.events.publish_status(&instance.id, status);
        }
        Ok(())
    }

    fn metadata_path(&self, id: &str) -> PathBuf {
        self.templates.instance_dir(id).join(METADATA_FILE)
    }

    async fn save_metadata(&self, instance: &Instance) -> DaemonResult<()> {
        let dir = self.templates.instance_dir(&instance.id);
        tokio::fs::create_dir_all(&dir).await?;

        let path = self.metadata_path(&instance.id);
        let tmp = path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(instance)?;

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&data).await?;
        file.flush().await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn load_metadata(&self, id: &str) -> DaemonResult<Option<Instance>> {
        match tokio::fs::read(self.metadata_path(id)).await {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

fn status_from_container_state(state: ContainerState) -> InstanceStatus {
    match state {
        ContainerState::Running => InstanceStatus::Running,
        ContainerState::Paused => InstanceStatus::Paused,
        ContainerState::Exited => InstanceStatus::Stopped,
        ContainerState::Created => InstanceStatus::Created,
        _ => InstanceStatus::Error,
    }
}
