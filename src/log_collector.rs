use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::StreamExt;
use lazy_static::lazy_static;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::errors::DaemonResult;
use crate::events::{AlertKind, AlertLevel, EventHub};
use crate::monitor::MonitoringConfig;
use crate::runtime_gateway::{runtime_id, DockerGateway};

lazy_static! {
    // Engine log prefix: 2024-01-01T12:00:00.000000000Z message
    static ref TIMESTAMP_LINE: Regex =
        Regex::new(r"^(\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}\.\d+Z)\s+(.+)$").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "DEBUG" => Some(LogLevel::Debug),
            "INFO" => Some(LogLevel::Info),
            "WARN" => Some(LogLevel::Warn),
            "ERROR" => Some(LogLevel::Error),
            "FATAL" => Some(LogLevel::Fatal),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    pub container_id: String,
    pub source: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogFilter {
    pub level: Option<LogLevel>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub search: Option<String>,
    pub limit: Option<usize>,
}

/// Tails each running instance's container logs into a bounded
/// per-instance ring buffer and republishes entries through the hub.
#[derive(Clone)]
pub struct LogCollector {
    docker: DockerGateway,
    events: Arc<EventHub>,
    config: Arc<RwLock<MonitoringConfig>>,
    buffers: Arc<DashMap<String, VecDeque<LogEntry>>>,
    active: Arc<tokio::sync::RwLock<HashMap<String, JoinHandle<()>>>>,
    exports_dir: PathBuf,
}

impl LogCollector {
    pub fn new(
        docker: DockerGateway,
        events: Arc<EventHub>,
        config: Arc<RwLock<MonitoringConfig>>,
        data_dir: &std::path::Path,
    ) -> Self {
        Self {
            docker,
            events,
            config,
            buffers: Arc::new(DashMap::new()),
            active: Arc::new(tokio::sync::RwLock::new(HashMap::new())),
            exports_dir: data_dir.join("exports"),
        }
    }

    /// Attach to the instance's live log stream. A no-op when a stream
    /// task is already running for the instance.
    pub async fn start_collection(&self, instance_id: &str) {
        let mut active = self.active.write().await;
        if active.contains_key(instance_id) {
            debug!("Log collection already active for instance {}", instance_id);
            return;
        }

        let collector = self.clone();
        let id = instance_id.to_string();
        let handle = tokio::spawn(async move {
            collector.run_stream(&id).await;
            collector.active.write().await.remove(&id);
        });

        active.insert(instance_id.to_string(), handle);
        info!("Log collection started for instance {}", instance_id);
    }

    /// Detach from the stream and drop the instance's buffer. Safe to
    /// call when nothing is running.
    pub async fn stop_collection(&self, instance_id: &str) {
        if let Some(handle) = self.active.write().await.remove(instance_id) {
            handle.abort();
            info!("Log collection stopped for instance {}", instance_id);
        }
        self.buffers.remove(instance_id);
    }

    pub async fn is_collecting(&self, instance_id: &str) -> bool {
        self.active.read().await.contains_key(instance_id)
    }

    async fn run_stream(&self, instance_id: &str) {
        let name = runtime_id(instance_id);
        let mut stream = self.docker.stream_logs(&name);

        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => {
                    let text = String::from_utf8_lossy(&bytes);
                    for line in text.lines() {
                        if let Some(entry) = parse_line(line, &name, Utc::now()) {
                            self.push_entry(instance_id, entry);
                        }
                    }
                }
                Err(e) => {
                    // Collection restarts together with the rest of
                    // monitoring, not on its own.
                    error!("Log stream error for instance {}: {}", instance_id, e);
                    break;
                }
            }
        }

        debug!("Log stream ended for instance {}", instance_id);
    }

    fn push_entry(&self, instance_id: &str, entry: LogEntry) {
        let capacity = self.config.read().log_buffer_size.max(1);
        {
            let mut buffer = self.buffers.entry(instance_id.to_string()).or_default();
            buffer.push_back(entry.clone());
            while buffer.len() > capacity {
                buffer.pop_front();
            }
        }

        if entry.level == LogLevel::Error {
            self.events.publish_alert(
                instance_id,
                AlertLevel::Error,
                AlertKind::LogError,
                format!("Error log detected: {}", entry.message),
            );
        }
        self.events.publish_log(instance_id, entry);
    }

    pub fn query(&self, instance_id: &str, filter: &LogFilter) -> Vec<LogEntry> {
        let entries = self
            .buffers
            .get(instance_id)
            .map(|buffer| buffer.iter().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        apply_filter(entries, filter)
    }

    pub fn buffer_len(&self, instance_id: &str) -> usize {
        self.buffers
            .get(instance_id)
            .map(|buffer| buffer.len())
            .unwrap_or(0)
    }

    /// Materialize the filtered result set as a JSON artifact and return
    /// its path.
    pub async fn export(&self, instance_id: &str, filter: &LogFilter) -> DaemonResult<PathBuf> {
        let logs = self.query(instance_id, filter);
        tokio::fs::create_dir_all(&self.exports_dir).await?;

        let path = self.exports_dir.join(format!(
            "logs-{}-{}.json",
            instance_id,
            Utc::now().timestamp_millis()
        ));
        tokio::fs::write(&path, serde_json::to_vec_pretty(&logs)?).await?;

        info!(
            "Exported {} log entries for instance {} to {}",
            logs.len(),
            instance_id,
            path.display()
        );
        Ok(path)
    }

    /// Remove export artifacts older than the configured retention.
    pub async fn cleanup_exports(&self) -> DaemonResult<usize> {
        let retention_days = self.config.read().retention_days;
        let cutoff = SystemTime::now() - Duration::from_secs(u64::from(retention_days) * 86_400);

        let mut entries = match tokio::fs::read_dir(&self.exports_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(_) => continue,
            };
            let modified = match metadata.modified() {
                Ok(modified) => modified,
                Err(_) => continue,
            };
            if modified < cutoff && tokio::fs::remove_file(entry.path()).await.is_ok() {
                removed += 1;
            }
        }

        if removed > 0 {
            info!("Removed {} expired log exports", removed);
        }
        Ok(removed)
    }
}

fn parse_line(line: &str, container_id: &str, received_at: DateTime<Utc>) -> Option<LogEntry> {
    let line = line.trim_end_matches('\r');
    if line.trim().is_empty() {
        return None;
    }

    let (timestamp, message) = match TIMESTAMP_LINE.captures(line) {
        Some(caps) => {
            let timestamp = DateTime::parse_from_rfc3339(&caps[1])
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or(received_at);
            (timestamp, caps[2].to_string())
        }
        None => (received_at, line.to_string()),
    };

    Some(LogEntry {
        level: classify_level(&message),
        timestamp,
        message,
        container_id: container_id.to_string(),
        source: "docker".to_string(),
    })
}

fn classify_level(message: &str) -> LogLevel {
    let lower = message.to_lowercase();
    if lower.contains("error") || lower.contains("fatal") {
        LogLevel::Error
    } else if lower.contains("warn") {
        LogLevel::Warn
    } else if lower.contains("debug") {
        LogLevel::Debug
    } else {
        LogLevel::Info
    }
}

fn apply_filter(entries: Vec<LogEntry>, filter: &LogFilter) -> Vec<LogEntry> {
    let search = filter.search.as_ref().map(|s| s.to_lowercase());
    let mut out: Vec<LogEntry> = entries
        .into_iter()
        .filter(|e| filter.level.is_none_or(|level| e.level == level))
        .filter(|e| filter.start_time.is_none_or(|t| e.timestamp >= t))
        .filter(|e| filter.end_time.is_none_or(|t| e.timestamp <= t))
        .filter(|e| {
            search
                .as_ref()
                .is_none_or(|s| e.message.to_lowercase().contains(s))
        })
        .collect();

    // "Last N" applies after every other filter.
    if let Some(limit) = filter.limit {
        if out.len() > limit {
            out.drain(0..out.len() - limit);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DockerConfig;
    use crate::events::alerts_key;

    fn collector(data_dir: &std::path::Path, buffer_size: usize) -> LogCollector {
        let docker = DockerGateway::new(&DockerConfig::default()).unwrap();
        let events = Arc::new(EventHub::new());
        let mut config = MonitoringConfig::default();
        config.log_buffer_size = buffer_size;
        LogCollector::new(docker, events, Arc::new(RwLock::new(config)), data_dir)
    }

    fn entry(message: &str, at: &str) -> LogEntry {
        LogEntry {
            timestamp: DateTime::parse_from_rfc3339(at).unwrap().with_timezone(&Utc),
            level: classify_level(message),
            message: message.to_string(),
            container_id: "n8n-test".to_string(),
            source: "docker".to_string(),
        }
    }

    #[test]
    fn classifies_by_substring_case_insensitive() {
        assert_eq!(classify_level("Connection ERROR occurred"), LogLevel::Error);
        assert_eq!(classify_level("Fatal: out of memory"), LogLevel::Error);
        assert_eq!(classify_level("warning: disk almost full"), LogLevel::Warn);
        assert_eq!(classify_level("Debugging webhook payload"), LogLevel::Debug);
        assert_eq!(classify_level("Workflow started"), LogLevel::Info);
    }

    #[test]
    fn parses_engine_timestamp_prefix() {
        let received = Utc::now();
        let entry = parse_line(
            "2024-01-01T12:00:00.000000000Z Workflow 42 finished",
            "n8n-x",
            received,
        )
        .unwrap();

        assert_eq!(entry.message, "Workflow 42 finished");
        assert_eq!(entry.timestamp.to_rfc3339(), "2024-01-01T12:00:00+00:00");
        assert_eq!(entry.level, LogLevel::Info);
        assert_eq!(entry.source, "docker");
    }

    #[test]
    fn stamps_unparseable_lines_at_arrival() {
        let received = Utc::now();
        let entry = parse_line("plain output without timestamp", "n8n-x", received).unwrap();
        assert_eq!(entry.timestamp, received);
        assert_eq!(entry.message, "plain output without timestamp");

        assert!(parse_line("   ", "n8n-x", received).is_none());
    }

    #[test]
    fn ring_buffer_keeps_last_capacity_entries_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let collector = collector(tmp.path(), 3);

        for i in 0..5 {
            collector.push_entry(
                "inst",
                entry(&format!("line {}", i), "2024-01-01T00:00:00Z"),
            );
        }

        let entries = collector.query("inst", &LogFilter::default());
        assert_eq!(entries.len(), 3);
        let messages: Vec<_> = entries.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["line 2", "line 3", "line 4"]);
    }

    #[test]
    fn error_entries_raise_one_alert_each() {
        let tmp = tempfile::tempdir().unwrap();
        let collector = collector(tmp.path(), 10);
        let mut alerts = collector
            .events
            .subscribe("conn", &alerts_key(Some(AlertLevel::Error)));

        collector.push_entry("inst", entry("an ERROR happened", "2024-01-01T00:00:00Z"));
        collector.push_entry("inst", entry("all fine", "2024-01-01T00:00:01Z"));

        assert!(alerts.try_recv().is_ok());
        assert!(alerts.try_recv().is_err());
    }

    #[test]
    fn filters_compose_and_limit_applies_last() {
        let entries = vec![
            entry("error: one", "2024-01-01T00:00:00Z"),
            entry("plain info", "2024-01-01T00:01:00Z"),
            entry("error: two", "2024-01-01T00:02:00Z"),
            entry("error: three", "2024-01-01T00:03:00Z"),
        ];

        let filter = LogFilter {
            level: Some(LogLevel::Error),
            start_time: Some(
                DateTime::parse_from_rfc3339("2024-01-01T00:00:30Z")
                    .unwrap()
                    .with_timezone(&Utc),
            ),
            end_time: None,
            search: Some("ERROR".to_string()),
            limit: Some(1),
        };

        let out = apply_filter(entries, &filter);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].message, "error: three");
    }

    #[test]
    fn time_range_is_inclusive() {
        let entries = vec![
            entry("a", "2024-01-01T00:00:00Z"),
            entry("b", "2024-01-01T00:01:00Z"),
            entry("c", "2024-01-01T00:02:00Z"),
        ];

        let filter = LogFilter {
            start_time: Some(
                DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
                    .unwrap()
                    .with_timezone(&Utc),
            ),
            end_time: Some(
                DateTime::parse_from_rfc3339("2024-01-01T00:01:00Z")
                    .unwrap()
                    .with_timezone(&Utc),
            ),
            ..Default::default()
        };

        let out = apply_filter(entries, &filter);
        assert_eq!(out.len(), 2);
    }

    #[tokio::test]
    async fn export_writes_filtered_json() {
        let tmp = tempfile::tempdir().unwrap();
        let collector = collector(tmp.path(), 10);

        collector.push_entry("inst", entry("one", "2024-01-01T00:00:00Z"));
        collector.push_entry("inst", entry("two", "2024-01-01T00:01:00Z"));

        let path = collector
            .export("inst", &LogFilter::default())
            .await
            .unwrap();
        let raw = tokio::fs::read_to_string(&path).await.unwrap();
        let parsed: Vec<LogEntry> = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].message, "one");
    }

    #[tokio::test]
    async fn stop_collection_drops_the_buffer() {
        let tmp = tempfile::tempdir().unwrap();
        let collector = collector(tmp.path(), 10);

        collector.push_entry("inst", entry("one", "2024-01-01T00:00:00Z"));
        assert_eq!(collector.buffer_len("inst"), 1);

        collector.stop_collection("inst").await;
        assert_eq!(collector.buffer_len("inst"), 0);
        assert!(!collector.is_collecting("inst").await);
    }
}
