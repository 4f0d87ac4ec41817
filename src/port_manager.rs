use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, warn};

use crate::errors::{DaemonError, DaemonResult};
use crate::runtime_gateway::DockerGateway;

pub const DEFAULT_PORT_MIN: u16 = 5600;
pub const DEFAULT_PORT_MAX: u16 = 5699;

/// How long an allocated port stays claimed before the claim expires.
/// Covers the window between choosing a port and the container binding it.
const CLAIM_TTL_SECS: i64 = 300;

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortUsageStats {
    pub total: u16,
    pub used: u16,
    pub available: u16,
    pub used_ports: Vec<u16>,
}

#[derive(Debug, Clone)]
struct PortClaim {
    instance_id: String,
    claimed_at: DateTime<Utc>,
}

/// Assigns host ports from a fixed range. Holds no durable state: every
/// decision recomputes the used set from the live runtime's published
/// ports, the persisted instance metadata, and the in-memory claim table.
pub struct PortManager {
    docker: DockerGateway,
    instances_dir: PathBuf,
    range: RwLock<PortRange>,
    claims: Mutex<HashMap<u16, PortClaim>>,
}

impl PortManager {
    pub fn new(docker: DockerGateway, instances_dir: PathBuf) -> Self {
        Self {
            docker,
            instances_dir,
            range: RwLock::new(PortRange {
                min: DEFAULT_PORT_MIN,
                max: DEFAULT_PORT_MAX,
            }),
            claims: Mutex::new(HashMap::new()),
        }
    }

    pub fn range(&self) -> PortRange {
        *self.range.read()
    }

    pub fn set_range(&self, min: u16, max: u16) -> DaemonResult<()> {
        if min > max {
            return Err(DaemonError::InvalidRequest(
                "min port must not exceed max port".to_string(),
            ));
        }
        if min < 1024 {
            return Err(DaemonError::InvalidRequest(
                "port range must be between 1024 and 65535".to_string(),
            ));
        }
        *self.range.write() = PortRange { min, max };
        Ok(())
    }

    /// First free port in ascending order, recorded in the claim table
    /// under the given instance id.
    pub async fn allocate(&self, instance_id: &str) -> DaemonResult<u16> {
        let range = self.range();
        let mut used = self.scan_used_ports(range).await;

        let mut claims = self.claims.lock();
        prune_expired(&mut claims, Utc::now());
        used.extend(claims.keys().copied());

        let port = first_free(range, &used).ok_or(DaemonError::PortsExhausted {
            min: range.min,
            max: range.max,
        })?;

        claims.insert(
            port,
            PortClaim {
                instance_id: instance_id.to_string(),
                claimed_at: Utc::now(),
            },
        );
        debug!("Allocated port {} for instance {}", port, instance_id);
        Ok(port)
    }

    pub fn release(&self, port: u16) {
        self.claims.lock().remove(&port);
    }

    /// Drop every claim held by an instance; called on create failure and
    /// on delete.
    pub fn release_instance(&self, instance_id: &str) {
        self.claims
            .lock()
            .retain(|_, claim| claim.instance_id != instance_id);
    }

    pub async fn is_available(&self, port: u16) -> bool {
        let range = self.range();
        if port < range.min || port > range.max {
            return false;
        }
        let used = self.scan_used_ports(range).await;
        if used.contains(&port) {
            return false;
        }
        let mut claims = self.claims.lock();
        prune_expired(&mut claims, Utc::now());
        !claims.contains_key(&port)
    }

    pub async fn usage_stats(&self) -> PortUsageStats {
        let range = self.range();
        let mut used = self.scan_used_ports(range).await;
        {
            let mut claims = self.claims.lock();
            prune_expired(&mut claims, Utc::now());
            used.extend(claims.keys().copied());
        }

        let total = range.max - range.min + 1;
        let mut used_ports: Vec<u16> = used.into_iter().collect();
        used_ports.sort_unstable();
        let used_count = used_ports.len() as u16;

        PortUsageStats {
            total,
            used: used_count,
            available: total.saturating_sub(used_count),
            used_ports,
        }
    }

    /// Union of the runtime's published ports and the persisted instance
    /// ports, restricted to the range. Either source failing narrows the
    /// scan rather than blocking allocation.
    async fn scan_used_ports(&self, range: PortRange) -> HashSet<u16> {
        let mut used = HashSet::new();

        match self.docker.list_containers(true, None).await {
            Ok(containers) => {
                for container in containers {
                    for port in container.public_ports {
                        if port >= range.min && port <= range.max {
                            used.insert(port);
                        }
                    }
                }
            }
            Err(e) => warn!("Could not scan container ports: {}", e),
        }

        for port in metadata_ports(&self.instances_dir) {
            if port >= range.min && port <= range.max {
                used.insert(port);
            }
        }

        used
    }
}

fn first_free(range: PortRange, used: &HashSet<u16>) -> Option<u16> {
    (range.min..=range.max).find(|port| !used.contains(port))
}

fn prune_expired(claims: &mut HashMap<u16, PortClaim>, now: DateTime<Utc>) {
    claims.retain(|_, claim| now - claim.claimed_at < Duration::seconds(CLAIM_TTL_SECS));
}

/// Ports recorded in `<instances_dir>/<id>/metadata.json` files.
fn metadata_ports(instances_dir: &Path) -> Vec<u16> {
    let mut ports = Vec::new();
    let entries = match std::fs::read_dir(instances_dir) {
        Ok(entries) => entries,
        Err(_) => return ports,
    };

    for entry in entries.flatten() {
        let metadata_path = entry.path().join("metadata.json");
        let raw = match std::fs::read_to_string(&metadata_path) {
            Ok(raw) => raw,
            Err(_) => continue,
        };
        let value: serde_json::Value = match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(e) => {
                warn!(
                    "Skipping unreadable metadata at {}: {}",
                    metadata_path.display(),
                    e
                );
                continue;
            }
        };
        if let Some(port) = value.get("port").and_then(|p| p.as_u64()) {
            if let Ok(port) = u16::try_from(port) {
                ports.push(port);
            }
        }
    }

    ports
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DockerConfig;

    fn manager(instances_dir: &Path) -> PortManager {
        let docker = DockerGateway::new(&DockerConfig::default()).unwrap();
        PortManager::new(docker, instances_dir.to_path_buf())
    }

    fn write_metadata(dir: &Path, id: &str, port: u16) {
        let instance_dir = dir.join(id);
        std::fs::create_dir_all(&instance_dir).unwrap();
        std::fs::write(
            instance_dir.join("metadata.json"),
            format!(r#"{{"id":"{}","port":{}}}"#, id, port),
        )
        .unwrap();
    }

    #[test]
    fn first_free_scans_ascending() {
        let range = PortRange { min: 5600, max: 5602 };
        let used: HashSet<u16> = [5600].into_iter().collect();
        assert_eq!(first_free(range, &used), Some(5601));

        let all: HashSet<u16> = [5600, 5601, 5602].into_iter().collect();
        assert_eq!(first_free(range, &all), None);
    }

    #[test]
    fn expired_claims_are_pruned() {
        let mut claims = HashMap::new();
        claims.insert(
            5600,
            PortClaim {
                instance_id: "old".to_string(),
                claimed_at: Utc::now() - Duration::seconds(CLAIM_TTL_SECS + 1),
            },
        );
        claims.insert(
            5601,
            PortClaim {
                instance_id: "fresh".to_string(),
                claimed_at: Utc::now(),
            },
        );

        prune_expired(&mut claims, Utc::now());
        assert!(!claims.contains_key(&5600));
        assert!(claims.contains_key(&5601));
    }

    #[tokio::test]
    async fn allocation_skips_persisted_instance_ports() {
        let tmp = tempfile::tempdir().unwrap();
        write_metadata(tmp.path(), "first", 5600);

        let ports = manager(tmp.path());
        let port = ports.allocate("second").await.unwrap();
        assert_eq!(port, 5601);
    }

    #[tokio::test]
    async fn allocation_skips_live_claims() {
        let tmp = tempfile::tempdir().unwrap();
        let ports = manager(tmp.path());

        let a = ports.allocate("a").await.unwrap();
        let b = ports.allocate("b").await.unwrap();
        assert_eq!(a, 5600);
        assert_eq!(b, 5601);

        ports.release(a);
        let c = ports.allocate("c").await.unwrap();
        assert_eq!(c, 5600);
    }

    #[tokio::test]
    async fn exhausted_range_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let ports = manager(tmp.path());
        ports.set_range(5600, 5601).unwrap();

        ports.allocate("a").await.unwrap();
        ports.allocate("b").await.unwrap();
        let err = ports.allocate("c").await.unwrap_err();
        assert!(matches!(
            err,
            DaemonError::PortsExhausted { min: 5600, max: 5601 }
        ));
    }

    #[tokio::test]
    async fn release_instance_drops_all_of_its_claims() {
        let tmp = tempfile::tempdir().unwrap();
        let ports = manager(tmp.path());

        ports.allocate("inst").await.unwrap();
        ports.release_instance("inst");
        assert_eq!(ports.allocate("other").await.unwrap(), 5600);
    }

    #[test]
    fn range_validation() {
        let tmp = tempfile::tempdir().unwrap();
        let ports = manager(tmp.path());

        assert!(ports.set_range(6000, 5000).is_err());
        assert!(ports.set_range(80, 8080).is_err());
        assert!(ports.set_range(5700, 5799).is_ok());
        assert_eq!(ports.range().min, 5700);
    }

    #[tokio::test]
    async fn usage_stats_counts_metadata_and_claims() {
        let tmp = tempfile::tempdir().unwrap();
        write_metadata(tmp.path(), "first", 5600);

        let ports = manager(tmp.path());
        ports.allocate("second").await.unwrap();

        let stats = ports.usage_stats().await;
        assert_eq!(stats.total, 100);
        assert_eq!(stats.used, 2);
        assert_eq!(stats.available, 98);
        assert_eq!(stats.used_ports, vec![5600, 5601]);
    }

    #[tokio::test]
    async fn out_of_range_metadata_ports_are_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        write_metadata(tmp.path(), "outside", 9000);

        let ports = manager(tmp.path());
        assert_eq!(ports.allocate("inst").await.unwrap(), 5600);
    }
}
