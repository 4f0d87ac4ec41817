use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::time::Duration;

use bollard::container::LogOutput;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::query_parameters::{
    InspectContainerOptions, ListContainersOptions, LogsOptionsBuilder, RemoveContainerOptions,
    RestartContainerOptions, StartContainerOptions, StatsOptionsBuilder, StopContainerOptions,
};
use bollard::Docker;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::DockerConfig;
use crate::errors::{DaemonError, DaemonResult};

/// Label identifying containers owned by this daemon.
pub const LABEL_INSTANCE_ID: &str = "flotilla.instance.id";
pub const LABEL_CLIENT_NAME: &str = "flotilla.client.name";

const PING_TIMEOUT_SECS: u64 = 5;
/// Ceiling for plain engine API calls; no runtime call may block
/// unboundedly.
const API_TIMEOUT_SECS: u64 = 30;
const EXEC_TIMEOUT_SECS: u64 = 60;
const MAX_EXEC_OUTPUT: usize = 256 * 1024;

/// The one place where an instance id becomes a container name. Every
/// component that needs to address an instance's container goes through
/// this mapping.
pub fn runtime_id(instance_id: &str) -> String {
    format!("n8n-{}", instance_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Exited,
    Dead,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct ContainerDetails {
    pub id: String,
    pub image: String,
    pub state: ContainerState,
    pub status_raw: String,
    pub created_at: Option<String>,
    pub started_at: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerBrief {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: String,
    pub public_ports: Vec<u16>,
    pub labels: HashMap<String, String>,
}

/// Raw counters needed for usage percentages; the monitor owns the math.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawStats {
    pub cpu_total_usage: u64,
    pub precpu_total_usage: u64,
    pub system_cpu_usage: u64,
    pub presystem_cpu_usage: u64,
    pub online_cpus: u64,
    pub memory_usage: u64,
    pub memory_limit: u64,
}

#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

#[derive(Debug, Clone)]
pub struct RuntimeVersion {
    pub version: String,
    pub api_version: String,
    pub os: String,
    pub arch: String,
}

#[derive(Clone)]
pub struct DockerGateway {
    docker: Docker,
    compose_bin: String,
}

impl DockerGateway {
    pub fn new(config: &DockerConfig) -> DaemonResult<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| DaemonError::RuntimeUnavailable(e.to_string()))?;
        Ok(Self {
            docker,
            compose_bin: config.compose_bin.clone(),
        })
    }

    async fn bounded<T, F>(&self, operation: &str, fut: F) -> DaemonResult<T>
    where
        F: Future<Output = Result<T, bollard::errors::Error>>,
    {
        match tokio::time::timeout(Duration::from_secs(API_TIMEOUT_SECS), fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(DaemonError::OperationTimeout {
                operation: operation.to_string(),
                seconds: API_TIMEOUT_SECS,
            }),
        }
    }

    /// Liveness check against the engine, bounded so an unreachable
    /// daemon never hangs a lifecycle operation.
    pub async fn ping(&self) -> DaemonResult<()> {
        match tokio::time::timeout(Duration::from_secs(PING_TIMEOUT_SECS), self.docker.ping())
            .await
        {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(DaemonError::RuntimeUnavailable(e.to_string())),
            Err(_) => Err(DaemonError::RuntimeUnavailable(format!(
                "ping timed out after {}s",
                PING_TIMEOUT_SECS
            ))),
        }
    }

    pub async fn version(&self) -> DaemonResult<RuntimeVersion> {
        let version = self.bounded("version", self.docker.version()).await?;
        Ok(RuntimeVersion {
            version: version.version.unwrap_or_default(),
            api_version: version.api_version.unwrap_or_default(),
            os: version.os.unwrap_or_default(),
            arch: version.arch.unwrap_or_default(),
        })
    }

    /// List all containers carrying this daemon's instance label.
    pub async fn list_managed(&self) -> DaemonResult<Vec<ContainerBrief>> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![LABEL_INSTANCE_ID.to_string()]);
        self.list_containers(true, Some(filters)).await
    }

    pub async fn list_containers(
        &self,
        all: bool,
        filters: Option<HashMap<String, Vec<String>>>,
    ) -> DaemonResult<Vec<ContainerBrief>> {
        let options = ListContainersOptions {
            all,
            filters,
            ..Default::default()
        };
        let containers = self
            .bounded("list containers", self.docker.list_containers(Some(options)))
            .await?;

        let briefs = containers
            .into_iter()
            .map(|c| ContainerBrief {
                id: c.id.unwrap_or_default(),
                name: c
                    .names
                    .unwrap_or_default()
                    .first()
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default(),
                image: c.image.unwrap_or_default(),
                state: c.state.map(|s| s.to_string()).unwrap_or_default(),
                public_ports: c
                    .ports
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|p| p.public_port.and_then(|p| u16::try_from(p).ok()))
                    .collect(),
                labels: c.labels.unwrap_or_default(),
            })
            .collect();

        Ok(briefs)
    }

    /// Inspect a container by name; `Ok(None)` means the container does
    /// not exist, which callers treat as a state of its own.
    pub async fn inspect(&self, name: &str) -> DaemonResult<Option<ContainerDetails>> {
        let result = tokio::time::timeout(
            Duration::from_secs(API_TIMEOUT_SECS),
            self.docker
                .inspect_container(name, None::<InspectContainerOptions>),
        )
        .await;

        let info = match result {
            Err(_) => {
                return Err(DaemonError::OperationTimeout {
                    operation: "inspect".to_string(),
                    seconds: API_TIMEOUT_SECS,
                })
            }
            Ok(Ok(info)) => info,
            Ok(Err(e)) if is_not_found(&e) => return Ok(None),
            Ok(Err(e)) => return Err(e.into()),
        };

        let (state, status_raw, started_at) = match info.state {
            Some(s) => {
                let raw = s
                    .status
                    .map(|st| st.to_string().to_lowercase())
                    .unwrap_or_else(|| "unknown".to_string());
                (map_state(&raw), raw, s.started_at)
            }
            None => (ContainerState::Unknown, "unknown".to_string(), None),
        };

        Ok(Some(ContainerDetails {
            id: info.id.unwrap_or_default(),
            image: info.config.and_then(|c| c.image).unwrap_or_default(),
            state,
            status_raw,
            created_at: info.created,
            started_at,
        }))
    }

    /// One-shot stats sample with the raw counters the monitor needs.
    /// Streaming is off, so the engine takes the two CPU samples itself.
    pub async fn stats(&self, name: &str) -> DaemonResult<RawStats> {
        let options = Some(
            StatsOptionsBuilder::new()
                .stream(false)
                .one_shot(false)
                .build(),
        );

        let mut stream = self.docker.stats(name, options);
        let next = tokio::time::timeout(Duration::from_secs(API_TIMEOUT_SECS), stream.next())
            .await
            .map_err(|_| DaemonError::OperationTimeout {
                operation: "stats".to_string(),
                seconds: API_TIMEOUT_SECS,
            })?;

        let stats = match next {
            Some(Ok(stats)) => stats,
            Some(Err(e)) => return Err(e.into()),
            None => {
                return Err(DaemonError::Runtime(format!(
                    "no stats returned for container {}",
                    name
                )))
            }
        };

        let mut raw = RawStats::default();
        if let Some(cpu) = stats.cpu_stats.as_ref() {
            raw.cpu_total_usage = cpu
                .cpu_usage
                .as_ref()
                .and_then(|u| u.total_usage)
                .unwrap_or(0);
            raw.system_cpu_usage = cpu.system_cpu_usage.unwrap_or(0);
            raw.online_cpus = cpu.online_cpus.map(u64::from).unwrap_or(1);
        }
        if let Some(precpu) = stats.precpu_stats.as_ref() {
            raw.precpu_total_usage = precpu
                .cpu_usage
                .as_ref()
                .and_then(|u| u.total_usage)
                .unwrap_or(0);
            raw.presystem_cpu_usage = precpu.system_cpu_usage.unwrap_or(0);
        }
        if let Some(memory) = stats.memory_stats.as_ref() {
            raw.memory_usage = memory.usage.unwrap_or(0);
            raw.memory_limit = memory.limit.unwrap_or(0);
        }

        Ok(raw)
    }

    pub async fn start(&self, name: &str) -> DaemonResult<()> {
        info!("Starting container: {}", name);
        self.bounded(
            "start container",
            self.docker
                .start_container(name, None::<StartContainerOptions>),
        )
        .await
    }

    pub async fn stop(&self, name: &str, timeout_secs: u64) -> DaemonResult<()> {
        info!("Stopping container: {}", name);
        let options = StopContainerOptions {
            t: Some(timeout_secs as i32),
            signal: None,
        };
        self.bounded(
            "stop container",
            self.docker.stop_container(name, Some(options)),
        )
        .await
    }

    pub async fn pause(&self, name: &str) -> DaemonResult<()> {
        info!("Pausing container: {}", name);
        self.bounded("pause container", self.docker.pause_container(name))
            .await
    }

    pub async fn unpause(&self, name: &str) -> DaemonResult<()> {
        info!("Unpausing container: {}", name);
        self.bounded("unpause container", self.docker.unpause_container(name))
            .await
    }

    pub async fn restart(&self, name: &str, timeout_secs: u64) -> DaemonResult<()> {
        info!("Restarting container: {}", name);
        let options = RestartContainerOptions {
            t: Some(timeout_secs as i32),
            signal: None,
        };
        self.bounded(
            "restart container",
            self.docker.restart_container(name, Some(options)),
        )
        .await
    }

    pub async fn remove(&self, name: &str, force: bool) -> DaemonResult<()> {
        info!("Removing container: {}", name);
        let options = RemoveContainerOptions {
            force,
            ..Default::default()
        };
        self.bounded(
            "remove container",
            self.docker.remove_container(name, Some(options)),
        )
        .await
    }

    pub async fn exec_command(&self, name: &str, argv: Vec<String>) -> DaemonResult<ExecOutput> {
        match tokio::time::timeout(
            Duration::from_secs(EXEC_TIMEOUT_SECS),
            self.exec_inner(name, argv),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(DaemonError::OperationTimeout {
                operation: "exec".to_string(),
                seconds: EXEC_TIMEOUT_SECS,
            }),
        }
    }

    async fn exec_inner(&self, name: &str, argv: Vec<String>) -> DaemonResult<ExecOutput> {
        let exec = self
            .docker
            .create_exec(
                name,
                CreateExecOptions {
                    cmd: Some(argv),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(false),
                    ..Default::default()
                },
            )
            .await?;

        let exec_id = exec.id.clone();
        let output = self
            .docker
            .start_exec(
                &exec_id,
                Some(StartExecOptions {
                    detach: false,
                    tty: false,
                    ..Default::default()
                }),
            )
            .await?;

        let mut stdout = String::new();
        let mut stderr = String::new();

        if let StartExecResults::Attached { output: stream, .. } = output {
            let mut stream = Box::pin(stream);
            while let Some(msg) = stream.next().await {
                if stdout.len() + stderr.len() >= MAX_EXEC_OUTPUT {
                    break;
                }
                match msg {
                    Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                        stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        }

        let inspect = self.docker.inspect_exec(&exec_id).await?;
        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code: inspect.exit_code.unwrap_or(-1),
        })
    }

    /// Follow-mode log stream with engine timestamps; each item is one
    /// raw chunk, stdout and stderr interleaved. Long-lived by design,
    /// so this is the one call without a deadline; the collector owns
    /// its cancellation.
    pub fn stream_logs(&self, name: &str) -> BoxStream<'static, DaemonResult<Bytes>> {
        debug!("Opening log stream for container: {}", name);
        let options = LogsOptionsBuilder::new()
            .follow(true)
            .stdout(true)
            .stderr(true)
            .timestamps(true)
            .build();

        self.docker
            .logs(name, Some(options))
            .map(|item| match item {
                Ok(LogOutput::StdOut { message })
                | Ok(LogOutput::StdErr { message })
                | Ok(LogOutput::Console { message })
                | Ok(LogOutput::StdIn { message }) => Ok(message),
                Err(e) => Err(DaemonError::Runtime(e.to_string())),
            })
            .boxed()
    }

    /// Bring a compose project up. The timeout is the caller's contract:
    /// exceeding it is an `OperationTimeout`, not a hang.
    pub async fn compose_up(&self, project_dir: &Path, timeout_secs: u64) -> DaemonResult<()> {
        self.run_compose(project_dir, &["up", "-d"], "compose up", timeout_secs)
            .await
    }

    pub async fn compose_down(&self, project_dir: &Path, timeout_secs: u64) -> DaemonResult<()> {
        self.run_compose(project_dir, &["down"], "compose down", timeout_secs)
            .await
    }

    /// Syntax-check a compose project. Failure detail comes back in the
    /// error so the descriptor layer can collect it as a diagnostic.
    pub async fn compose_config(&self, project_dir: &Path, timeout_secs: u64) -> DaemonResult<()> {
        self.run_compose(
            project_dir,
            &["config", "--quiet"],
            "compose config",
            timeout_secs,
        )
        .await
    }

    async fn run_compose(
        &self,
        project_dir: &Path,
        args: &[&str],
        operation: &str,
        timeout_secs: u64,
    ) -> DaemonResult<()> {
        let mut cmd = Command::new(&self.compose_bin);
        cmd.arg("compose");
        for arg in args {
            cmd.arg(arg);
        }
        cmd.current_dir(project_dir);

        let output = match tokio::time::timeout(Duration::from_secs(timeout_secs), cmd.output())
            .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(DaemonError::OperationTimeout {
                    operation: operation.to_string(),
                    seconds: timeout_secs,
                })
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DaemonError::Runtime(format!(
                "{} failed: {}",
                operation,
                stderr.trim()
            )));
        }

        Ok(())
    }
}

fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn map_state(raw: &str) -> ContainerState {
    match raw {
        "created" => ContainerState::Created,
        "running" => ContainerState::Running,
        "paused" => ContainerState::Paused,
        "restarting" => ContainerState::Restarting,
        "exited" => ContainerState::Exited,
        "dead" => ContainerState::Dead,
        _ => ContainerState::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_id_prefixes_instance_id() {
        assert_eq!(runtime_id("abc-123"), "n8n-abc-123");
    }

    #[test]
    fn maps_engine_states() {
        assert_eq!(map_state("running"), ContainerState::Running);
        assert_eq!(map_state("paused"), ContainerState::Paused);
        assert_eq!(map_state("exited"), ContainerState::Exited);
        assert_eq!(map_state("created"), ContainerState::Created);
        assert_eq!(map_state("restarting"), ContainerState::Restarting);
        assert_eq!(map_state("dead"), ContainerState::Dead);
        assert_eq!(map_state("removing"), ContainerState::Unknown);
    }
}
