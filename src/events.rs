use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::instance_manager::InstanceStatus;
use crate::log_collector::LogEntry;
use crate::monitor::{HealthSnapshot, MetricsSnapshot};

/// Broadcast topic for instance status changes (no instance scoping).
pub const TOPIC_STATUS: &str = "status";

const CHANNEL_CAPACITY: usize = 256;

pub fn logs_key(instance_id: &str) -> String {
    format!("logs:{}", instance_id)
}

pub fn metrics_key(instance_id: &str) -> String {
    format!("metrics:{}", instance_id)
}

pub fn health_key(instance_id: &str) -> String {
    format!("health:{}", instance_id)
}

pub fn alerts_key(level: Option<AlertLevel>) -> String {
    match level {
        Some(level) => format!("alerts:{}", level.as_str()),
        None => "alerts:all".to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertLevel {
    Info,
    Warning,
    Error,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Info => "INFO",
            AlertLevel::Warning => "WARNING",
            AlertLevel::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "INFO" => Some(AlertLevel::Info),
            "WARNING" => Some(AlertLevel::Warning),
            "ERROR" => Some(AlertLevel::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AlertKind {
    #[serde(rename = "AUTO_RESTART")]
    AutoRestart,
    #[serde(rename = "HEALTH_CHECK_FAILED")]
    HealthCheckFailed,
    #[serde(rename = "LOG_ERROR")]
    LogError,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum Event {
    #[serde(rename_all = "camelCase")]
    Status {
        instance_id: String,
        status: InstanceStatus,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    Log {
        instance_id: String,
        entry: LogEntry,
    },
    #[serde(rename_all = "camelCase")]
    Metrics {
        instance_id: String,
        metrics: MetricsSnapshot,
    },
    #[serde(rename_all = "camelCase")]
    Health {
        instance_id: String,
        health: HealthSnapshot,
    },
    #[serde(rename_all = "camelCase")]
    Alert {
        instance_id: String,
        level: AlertLevel,
        kind: AlertKind,
        message: String,
        timestamp: DateTime<Utc>,
    },
}

/// Routes monitor and log events to topic-scoped subscribers.
///
/// Every key owns a broadcast channel; subscribing hands out an
/// independent receiver with its own cursor, so delivery to one
/// subscriber never unregisters or starves another. A subscriber that
/// falls more than the channel capacity behind loses its own oldest
/// events only.
pub struct EventHub {
    channels: RwLock<HashMap<String, broadcast::Sender<Event>>>,
    connections: RwLock<HashMap<String, HashSet<String>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Register `connection_id` on `key` and return a live receiver.
    pub fn subscribe(&self, connection_id: &str, key: &str) -> broadcast::Receiver<Event> {
        let receiver = {
            let mut channels = self.channels.write();
            let sender = channels
                .entry(key.to_string())
                .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
            sender.subscribe()
        };

        self.connections
            .write()
            .entry(connection_id.to_string())
            .or_default()
            .insert(key.to_string());

        receiver
    }

    /// Drop one of a connection's registrations. The caller must have
    /// dropped the matching receiver first.
    pub fn unsubscribe(&self, connection_id: &str, key: &str) {
        if let Some(keys) = self.connections.write().get_mut(connection_id) {
            keys.remove(key);
        }
        let mut channels = self.channels.write();
        let prune = channels
            .get(key)
            .map(|sender| sender.receiver_count() == 0)
            .unwrap_or(false);
        if prune {
            channels.remove(key);
        }
    }

    /// Drop every registration held by a connection, pruning keys that no
    /// longer have any subscriber. The caller must have dropped the
    /// connection's receivers first.
    pub fn unsubscribe_connection(&self, connection_id: &str) {
        let keys = self.connections.write().remove(connection_id);
        let Some(keys) = keys else { return };

        let mut channels = self.channels.write();
        for key in keys {
            let prune = channels
                .get(&key)
                .map(|sender| sender.receiver_count() == 0)
                .unwrap_or(false);
            if prune {
                channels.remove(&key);
            }
        }
    }

    pub fn publish_status(&self, instance_id: &str, status: InstanceStatus) {
        self.send(
            TOPIC_STATUS,
            Event::Status {
                instance_id: instance_id.to_string(),
                status,
                timestamp: Utc::now(),
            },
        );
    }

    pub fn publish_log(&self, instance_id: &str, entry: LogEntry) {
        self.send(
            &logs_key(instance_id),
            Event::Log {
                instance_id: instance_id.to_string(),
                entry,
            },
        );
    }

    pub fn publish_metrics(&self, instance_id: &str, metrics: MetricsSnapshot) {
        self.send(
            &metrics_key(instance_id),
            Event::Metrics {
                instance_id: instance_id.to_string(),
                metrics,
            },
        );
    }

    pub fn publish_health(&self, instance_id: &str, health: HealthSnapshot) {
        self.send(
            &health_key(instance_id),
            Event::Health {
                instance_id: instance_id.to_string(),
                health,
            },
        );
    }

    /// Alerts go to the level-scoped key and the all-levels key. A
    /// subscription binds to exactly one of the two, so each subscription
    /// sees each alert once.
    pub fn publish_alert(
        &self,
        instance_id: &str,
        level: AlertLevel,
        kind: AlertKind,
        message: impl Into<String>,
    ) {
        let event = Event::Alert {
            instance_id: instance_id.to_string(),
            level,
            kind,
            message: message.into(),
            timestamp: Utc::now(),
        };
        self.send(&alerts_key(Some(level)), event.clone());
        self.send(&alerts_key(None), event);
    }

    pub fn stats(&self) -> HashMap<String, usize> {
        self.channels
            .read()
            .iter()
            .map(|(key, sender)| (key.clone(), sender.receiver_count()))
            .collect()
    }

    fn send(&self, key: &str, event: Event) {
        if let Some(sender) = self.channels.read().get(key) {
            // Send only fails when no receiver is left; nothing to do.
            let _ = sender.send(event);
        }
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_event(hub: &EventHub) {
        hub.publish_status("inst", InstanceStatus::Running);
    }

    #[tokio::test]
    async fn every_subscriber_on_a_key_receives_every_event() {
        let hub = EventHub::new();
        let mut rx_a = hub.subscribe("conn-a", TOPIC_STATUS);
        let mut rx_b = hub.subscribe("conn-b", TOPIC_STATUS);

        status_event(&hub);
        status_event(&hub);

        for rx in [&mut rx_a, &mut rx_b] {
            let mut seen = 0;
            while let Ok(event) = rx.try_recv() {
                assert!(matches!(event, Event::Status { .. }));
                seen += 1;
            }
            assert_eq!(seen, 2);
        }
    }

    #[tokio::test]
    async fn delivery_does_not_unregister_other_subscribers() {
        let hub = EventHub::new();
        let mut rx_a = hub.subscribe("conn-a", TOPIC_STATUS);
        let mut rx_b = hub.subscribe("conn-b", TOPIC_STATUS);

        status_event(&hub);
        let _ = rx_a.try_recv().unwrap();

        // A second event still reaches both cursors.
        status_event(&hub);
        assert!(rx_a.try_recv().is_ok());
        assert_eq!(
            {
                let mut n = 0;
                while rx_b.try_recv().is_ok() {
                    n += 1;
                }
                n
            },
            2
        );
    }

    #[tokio::test]
    async fn alert_routes_to_level_and_all_keys() {
        let hub = EventHub::new();
        let mut rx_error = hub.subscribe("conn-a", &alerts_key(Some(AlertLevel::Error)));
        let mut rx_all = hub.subscribe("conn-b", &alerts_key(None));
        let mut rx_warning = hub.subscribe("conn-c", &alerts_key(Some(AlertLevel::Warning)));

        hub.publish_alert("inst", AlertLevel::Error, AlertKind::LogError, "boom");

        assert!(rx_error.try_recv().is_ok());
        assert!(rx_all.try_recv().is_ok());
        assert!(rx_warning.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribe_prunes_empty_keys_only() {
        let hub = EventHub::new();
        let rx_a = hub.subscribe("conn-a", TOPIC_STATUS);
        let _rx_b = hub.subscribe("conn-b", TOPIC_STATUS);

        drop(rx_a);
        hub.unsubscribe_connection("conn-a");
        // conn-b still holds a receiver, key survives.
        assert_eq!(hub.stats().get(TOPIC_STATUS), Some(&1));

        hub.unsubscribe_connection("conn-b");
        // Receiver still alive, so the key is not pruned yet.
        assert!(hub.stats().contains_key(TOPIC_STATUS));
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_a_no_op() {
        let hub = EventHub::new();
        status_event(&hub);
        hub.publish_alert("inst", AlertLevel::Warning, AlertKind::AutoRestart, "x");
        assert!(hub.stats().is_empty());
    }

    #[test]
    fn alert_level_parse_round_trips() {
        assert_eq!(AlertLevel::parse("error"), Some(AlertLevel::Error));
        assert_eq!(AlertLevel::parse("WARNING"), Some(AlertLevel::Warning));
        assert_eq!(AlertLevel::parse("nope"), None);
    }
}
