use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::errors::{DaemonError, DaemonResult};
use crate::events::{AlertKind, AlertLevel, EventHub};
use crate::runtime_gateway::{runtime_id, ContainerState, DockerGateway, RawStats};

const AUTO_RESTART_STOP_GRACE_SECS: u64 = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckConfig {
    pub interval_seconds: u64,
    pub timeout_seconds: u64,
    pub retries: u32,
    pub auto_restart: bool,
    pub alert_threshold: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringConfig {
    pub health_check: HealthCheckConfig,
    pub log_buffer_size: usize,
    pub metrics_interval_seconds: u64,
    pub retention_days: u32,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            health_check: HealthCheckConfig {
                interval_seconds: 30,
                timeout_seconds: 10,
                retries: 3,
                auto_restart: true,
                alert_threshold: 3,
            },
            log_buffer_size: 1000,
            metrics_interval_seconds: 60,
            retention_days: 30,
        }
    }
}

/// Load the monitoring config from disk, writing the defaults on first
/// run so the file always exists afterwards.
pub fn load_or_init_config(path: &Path) -> DaemonResult<MonitoringConfig> {
    if path.exists() {
        let raw = std::fs::read_to_string(path)?;
        return Ok(serde_json::from_str(&raw)?);
    }

    let config = MonitoringConfig::default();
    persist_config(path, &config)?;
    Ok(config)
}

fn persist_config(path: &Path, config: &MonitoringConfig) -> DaemonResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(config)?)?;
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub is_healthy: bool,
    pub last_check: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
    pub error_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub auto_restart_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_restart: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub cpu_usage_percent: f64,
    pub memory_usage_percent: f64,
    pub memory_usage_mb: f64,
    pub uptime_seconds: i64,
    pub uptime_human: String,
    pub last_activity: DateTime<Utc>,
    pub container_id: String,
    pub image: String,
    pub created_at: Option<String>,
    pub started_at: Option<String>,
}

/// Per-instance accumulator for the monitoring session. `error_count`
/// tracks consecutive failed probes and resets on the first healthy one;
/// `auto_restart_count` only grows while the session lives.
#[derive(Debug, Default, Clone)]
struct HealthState {
    error_count: u32,
    auto_restart_count: u32,
    last_restart: Option<DateTime<Utc>>,
}

impl HealthState {
    fn record_probe(&mut self, healthy: bool) {
        if healthy {
            self.error_count = 0;
        } else {
            self.error_count += 1;
        }
    }

    fn record_restart(&mut self, at: DateTime<Utc>) {
        self.auto_restart_count += 1;
        self.last_restart = Some(at);
    }
}

fn threshold_alert_due(error_count: u32, threshold: u32) -> bool {
    threshold > 0 && error_count > 0 && error_count % threshold == 0
}

struct MonitorTasks {
    health: JoinHandle<()>,
    metrics: JoinHandle<()>,
}

/// Schedules the health-probe and metrics-sampling tasks for running
/// instances, at most one task-set per instance.
#[derive(Clone)]
pub struct MonitorManager {
    docker: DockerGateway,
    events: Arc<EventHub>,
    config: Arc<RwLock<MonitoringConfig>>,
    config_path: PathBuf,
    http: reqwest::Client,
    tasks: Arc<tokio::sync::RwLock<HashMap<String, MonitorTasks>>>,
    health_state: Arc<Mutex<HashMap<String, HealthState>>>,
}

impl MonitorManager {
    pub fn new(
        docker: DockerGateway,
        events: Arc<EventHub>,
        config: Arc<RwLock<MonitoringConfig>>,
        config_path: PathBuf,
    ) -> Self {
        Self {
            docker,
            events,
            config,
            config_path,
            http: reqwest::Client::new(),
            tasks: Arc::new(tokio::sync::RwLock::new(HashMap::new())),
            health_state: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> MonitoringConfig {
        self.config.read().clone()
    }

    /// Replace the whole config and re-persist it. Timeouts and
    /// thresholds take effect on the next scheduled probe; the tick
    /// periods of already-running task-sets were captured when
    /// monitoring started.
    pub fn update_config(&self, new: MonitoringConfig) -> DaemonResult<MonitoringConfig> {
        persist_config(&self.config_path, &new)?;
        *self.config.write() = new.clone();
        info!("Monitoring config updated");
        Ok(new)
    }

    pub async fn is_monitoring(&self, instance_id: &str) -> bool {
        self.tasks.read().await.contains_key(instance_id)
    }

    /// Start the probe and sampling tasks for an instance. A no-op when a
    /// task-set is already running.
    pub async fn start_monitoring(&self, instance_id: &str, port: u16) {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(instance_id) {
            debug!("Monitoring already active for instance {}", instance_id);
            return;
        }

        let (health_interval, metrics_interval) = {
            let config = self.config.read();
            (
                config.health_check.interval_seconds,
                config.metrics_interval_seconds,
            )
        };

        let health = {
            let monitor = self.clone();
            let id = instance_id.to_string();
            tokio::spawn(async move {
                let mut ticker =
                    tokio::time::interval(Duration::from_secs(health_interval.max(1)));
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    monitor.run_health_cycle(&id, port).await;
                }
            })
        };

        let metrics = {
            let monitor = self.clone();
            let id = instance_id.to_string();
            tokio::spawn(async move {
                let mut ticker =
                    tokio::time::interval(Duration::from_secs(metrics_interval.max(1)));
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    monitor.run_metrics_cycle(&id).await;
                }
            })
        };

        tasks.insert(instance_id.to_string(), MonitorTasks { health, metrics });
        info!("Monitoring started for instance {}", instance_id);
    }

    /// Cancel both periodic tasks and forget the session's health state.
    /// Safe to call when nothing is running.
    pub async fn stop_monitoring(&self, instance_id: &str) {
        let removed = self.tasks.write().await.remove(instance_id);
        if let Some(tasks) = removed {
            tasks.health.abort();
            tasks.metrics.abort();
            info!("Monitoring stopped for instance {}", instance_id);
        }
        self.health_state.lock().remove(instance_id);
    }

    async fn run_health_cycle(&self, instance_id: &str, port: u16) {
        let health = self.perform_health_check(instance_id, port).await;
        self.events.publish_health(instance_id, health);
    }

    async fn run_metrics_cycle(&self, instance_id: &str) {
        match self.collect_metrics(instance_id).await {
            Ok(metrics) => self.events.publish_metrics(instance_id, metrics),
            // A failed sample never stops the schedule.
            Err(e) => error!("Metrics collection failed for {}: {}", instance_id, e),
        }
    }

    /// One full probe: container state first, HTTP only when running,
    /// then the auto-restart path for unhealthy results.
    pub async fn perform_health_check(&self, instance_id: &str, port: u16) -> HealthSnapshot {
        let health_config = self.config.read().health_check.clone();
        let checked_at = Utc::now();
        let name = runtime_id(instance_id);

        let (is_healthy, response_time_ms, last_error) = match self.docker.inspect(&name).await {
            Ok(Some(details)) if details.state == ContainerState::Running => {
                self.probe_http(port, &health_config).await
            }
            Ok(Some(details)) => (
                false,
                None,
                Some(format!("container status: {}", details.status_raw)),
            ),
            Ok(None) => (false, None, Some(format!("container {} not found", name))),
            Err(e) => (false, None, Some(e.to_string())),
        };

        let error_count = {
            let mut states = self.health_state.lock();
            let state = states.entry(instance_id.to_string()).or_default();
            state.record_probe(is_healthy);
            state.error_count
        };

        if !is_healthy {
            warn!(
                "Instance {} unhealthy ({} consecutive): {}",
                instance_id,
                error_count,
                last_error.as_deref().unwrap_or("unknown")
            );

            if threshold_alert_due(error_count, health_config.alert_threshold) {
                self.events.publish_alert(
                    instance_id,
                    AlertLevel::Error,
                    AlertKind::HealthCheckFailed,
                    format!(
                        "Instance {} unhealthy after {} consecutive probes: {}",
                        instance_id,
                        error_count,
                        last_error.as_deref().unwrap_or("unknown")
                    ),
                );
            }

            if health_config.auto_restart {
                self.auto_restart(instance_id, &name).await;
            }
        }

        let (auto_restart_count, last_restart) = {
            let states = self.health_state.lock();
            states
                .get(instance_id)
                .map(|s| (s.auto_restart_count, s.last_restart))
                .unwrap_or((0, None))
        };

        HealthSnapshot {
            is_healthy,
            last_check: checked_at,
            response_time_ms,
            error_count,
            last_error,
            auto_restart_count,
            last_restart,
        }
    }

    /// Corrective restart straight at the runtime, bypassing the
    /// lifecycle state machine. Failures surface as alerts only; there is
    /// no synchronous caller to throw to.
    async fn auto_restart(&self, instance_id: &str, container_name: &str) {
        match self
            .docker
            .restart(container_name, AUTO_RESTART_STOP_GRACE_SECS)
            .await
        {
            Ok(()) => {
                let restart_count = {
                    let mut states = self.health_state.lock();
                    let state = states.entry(instance_id.to_string()).or_default();
                    state.record_restart(Utc::now());
                    state.auto_restart_count
                };
                self.events.publish_alert(
                    instance_id,
                    AlertLevel::Warning,
                    AlertKind::AutoRestart,
                    format!(
                        "Auto-restarted unhealthy instance {} (restart #{})",
                        instance_id, restart_count
                    ),
                );
            }
            Err(e) => {
                error!("Failed to auto-restart instance {}: {}", instance_id, e);
                self.events.publish_alert(
                    instance_id,
                    AlertLevel::Error,
                    AlertKind::HealthCheckFailed,
                    format!("Failed to auto-restart instance {}: {}", instance_id, e),
                );
            }
        }
    }

    async fn probe_http(
        &self,
        port: u16,
        config: &HealthCheckConfig,
    ) -> (bool, Option<u64>, Option<String>) {
        let url = format!("http://127.0.0.1:{}/healthz", port);
        let attempts = config.retries.max(1);
        let mut last_error = None;

        for _ in 0..attempts {
            let started = Instant::now();
            let result = self
                .http
                .get(&url)
                .timeout(Duration::from_secs(config.timeout_seconds))
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => {
                    return (true, Some(started.elapsed().as_millis() as u64), None);
                }
                Ok(response) => {
                    last_error = Some(format!(
                        "health endpoint returned {}",
                        response.status()
                    ));
                }
                Err(e) if e.is_timeout() => {
                    last_error = Some(format!(
                        "health check timed out after {}s",
                        config.timeout_seconds
                    ));
                }
                Err(e) => last_error = Some(e.to_string()),
            }
        }

        (false, None, last_error)
    }

    /// On-demand metrics sample; always recomputed from the runtime.
    pub async fn collect_metrics(&self, instance_id: &str) -> DaemonResult<MetricsSnapshot> {
        let name = runtime_id(instance_id);
        let details = self
            .docker
            .inspect(&name)
            .await?
            .ok_or_else(|| DaemonError::Runtime(format!("container {} not found", name)))?;
        let raw = self.docker.stats(&name).await?;

        let (cpu_usage_percent, memory_usage_percent, memory_usage_mb) = compute_usage(&raw);
        let uptime_seconds = uptime_seconds(details.started_at.as_deref(), Utc::now());

        Ok(MetricsSnapshot {
            cpu_usage_percent,
            memory_usage_percent,
            memory_usage_mb,
            uptime_seconds,
            uptime_human: format_uptime(uptime_seconds),
            last_activity: Utc::now(),
            container_id: details.id,
            image: details.image,
            created_at: details.created_at,
            started_at: details.started_at,
        })
    }
}

fn compute_usage(raw: &RawStats) -> (f64, f64, f64) {
    let cpu_delta = raw.cpu_total_usage.saturating_sub(raw.precpu_total_usage) as f64;
    let system_delta = raw
        .system_cpu_usage
        .saturating_sub(raw.presystem_cpu_usage) as f64;

    let cpu = if system_delta > 0.0 {
        cpu_delta / system_delta * raw.online_cpus.max(1) as f64 * 100.0
    } else {
        0.0
    };

    let memory_percent = if raw.memory_limit > 0 {
        raw.memory_usage as f64 / raw.memory_limit as f64 * 100.0
    } else {
        0.0
    };
    let memory_mb = raw.memory_usage as f64 / 1024.0 / 1024.0;

    (round2(cpu), round2(memory_percent), round2(memory_mb))
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn uptime_seconds(started_at: Option<&str>, now: DateTime<Utc>) -> i64 {
    let Some(raw) = started_at else { return 0 };
    match DateTime::parse_from_rfc3339(raw) {
        Ok(started) => (now - started.with_timezone(&Utc)).num_seconds().max(0),
        Err(_) => 0,
    }
}

fn format_uptime(seconds: i64) -> String {
    let seconds = seconds.max(0);
    let days = seconds / 86_400;
    let hours = (seconds % 86_400) / 3_600;
    let minutes = (seconds % 3_600) / 60;
    let secs = seconds % 60;

    if days > 0 {
        format!("{}d {}h {}m {}s", days, hours, minutes, secs)
    } else if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, secs)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DockerConfig;

    fn manager(config_path: PathBuf) -> MonitorManager {
        let docker = DockerGateway::new(&DockerConfig::default()).unwrap();
        let events = Arc::new(EventHub::new());
        let config = Arc::new(RwLock::new(MonitoringConfig::default()));
        MonitorManager::new(docker, events, config, config_path)
    }

    #[test]
    fn cpu_usage_follows_delta_formula() {
        let raw = RawStats {
            cpu_total_usage: 400,
            precpu_total_usage: 100,
            system_cpu_usage: 2000,
            presystem_cpu_usage: 1000,
            online_cpus: 4,
            memory_usage: 512 * 1024 * 1024,
            memory_limit: 1024 * 1024 * 1024,
        };
        let (cpu, mem_percent, mem_mb) = compute_usage(&raw);
        // (300 / 1000) * 4 * 100
        assert_eq!(cpu, 120.0);
        assert_eq!(mem_percent, 50.0);
        assert_eq!(mem_mb, 512.0);
    }

    #[test]
    fn usage_is_zero_without_system_delta() {
        let raw = RawStats {
            cpu_total_usage: 100,
            precpu_total_usage: 100,
            system_cpu_usage: 1000,
            presystem_cpu_usage: 1000,
            online_cpus: 2,
            memory_usage: 10,
            memory_limit: 0,
        };
        let (cpu, mem_percent, _) = compute_usage(&raw);
        assert_eq!(cpu, 0.0);
        assert_eq!(mem_percent, 0.0);
    }

    #[test]
    fn usage_rounds_to_two_decimals() {
        let raw = RawStats {
            cpu_total_usage: 1,
            precpu_total_usage: 0,
            system_cpu_usage: 3,
            presystem_cpu_usage: 0,
            online_cpus: 1,
            memory_usage: 1,
            memory_limit: 3,
        };
        let (cpu, mem_percent, _) = compute_usage(&raw);
        assert_eq!(cpu, 33.33);
        assert_eq!(mem_percent, 33.33);
    }

    #[test]
    fn uptime_formatting() {
        assert_eq!(format_uptime(12), "12s");
        assert_eq!(format_uptime(75), "1m 15s");
        assert_eq!(format_uptime(3_675), "1h 1m 15s");
        assert_eq!(format_uptime(90_075), "1d 1h 1m 15s");
    }

    #[test]
    fn uptime_from_started_at() {
        let now = DateTime::parse_from_rfc3339("2024-01-01T00:10:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(uptime_seconds(Some("2024-01-01T00:00:00Z"), now), 600);
        assert_eq!(uptime_seconds(Some("not a timestamp"), now), 0);
        assert_eq!(uptime_seconds(None, now), 0);
    }

    #[test]
    fn consecutive_failures_reset_on_healthy_probe() {
        let mut state = HealthState::default();
        state.record_probe(false);
        state.record_probe(false);
        assert_eq!(state.error_count, 2);
        state.record_probe(true);
        assert_eq!(state.error_count, 0);
    }

    #[test]
    fn restart_count_is_monotonic() {
        let mut state = HealthState::default();
        state.record_restart(Utc::now());
        state.record_probe(true);
        state.record_restart(Utc::now());
        assert_eq!(state.auto_restart_count, 2);
        assert!(state.last_restart.is_some());
    }

    #[test]
    fn threshold_alert_fires_at_each_multiple() {
        assert!(!threshold_alert_due(1, 3));
        assert!(!threshold_alert_due(2, 3));
        assert!(threshold_alert_due(3, 3));
        assert!(!threshold_alert_due(4, 3));
        assert!(threshold_alert_due(6, 3));
        assert!(!threshold_alert_due(5, 0));
    }

    #[test]
    fn config_initializes_and_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config").join("monitoring.json");

        let config = load_or_init_config(&path).unwrap();
        assert_eq!(config, MonitoringConfig::default());
        assert!(path.exists());

        let reloaded = load_or_init_config(&path).unwrap();
        assert_eq!(reloaded, config);
    }

    #[test]
    fn update_config_replaces_and_persists() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("monitoring.json");
        let monitor = manager(path.clone());

        let mut new = MonitoringConfig::default();
        new.health_check.interval_seconds = 5;
        new.log_buffer_size = 50;
        monitor.update_config(new.clone()).unwrap();

        assert_eq!(monitor.config(), new);
        let on_disk = load_or_init_config(&path).unwrap();
        assert_eq!(on_disk, new);
    }

    #[tokio::test]
    async fn at_most_one_task_set_per_instance() {
        let tmp = tempfile::tempdir().unwrap();
        let monitor = manager(tmp.path().join("monitoring.json"));

        monitor.start_monitoring("inst", 5600).await;
        monitor.start_monitoring("inst", 5600).await;
        assert!(monitor.is_monitoring("inst").await);
        assert_eq!(monitor.tasks.read().await.len(), 1);

        monitor.stop_monitoring("inst").await;
        assert!(!monitor.is_monitoring("inst").await);

        // Stopping again is a no-op.
        monitor.stop_monitoring("inst").await;
    }
}
