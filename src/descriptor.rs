use std::path::{Path, PathBuf};

use base64::Engine;
use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::info;
use uuid::Uuid;

use crate::errors::DaemonResult;
use crate::runtime_gateway::{
    runtime_id, DockerGateway, LABEL_CLIENT_NAME, LABEL_INSTANCE_ID,
};

pub const COMPOSE_FILE: &str = "docker-compose.yml";
const ENV_FILE: &str = ".env";
const COMPOSE_VALIDATE_TIMEOUT_SECS: u64 = 10;

/// Internal port the workflow application listens on inside its container.
pub const INSTANCE_INTERNAL_PORT: u16 = 5678;

/// Materializes and validates the on-disk compose descriptor for each
/// instance. One directory per instance under `<data_dir>/instances/`.
pub struct TemplateManager {
    instances_dir: PathBuf,
}

impl TemplateManager {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            instances_dir: data_dir.join("instances"),
        }
    }

    pub fn instances_dir(&self) -> &Path {
        &self.instances_dir
    }

    pub fn instance_dir(&self, instance_id: &str) -> PathBuf {
        self.instances_dir.join(instance_id)
    }

    pub async fn ensure_layout(&self) -> DaemonResult<()> {
        tokio::fs::create_dir_all(&self.instances_dir).await?;
        Ok(())
    }

    /// Create the instance directory tree and write the compose file and
    /// `.env`. Returns the compose file path.
    pub async fn materialize(
        &self,
        instance_id: &str,
        port: u16,
        client_name: &str,
        username: &str,
        password: &str,
    ) -> DaemonResult<PathBuf> {
        let dir = self.instance_dir(instance_id);
        for sub in ["data", "workflows", "credentials", "logs"] {
            tokio::fs::create_dir_all(dir.join(sub)).await?;
        }

        let encryption_key = generate_encryption_key();
        let compose = render_compose(
            instance_id,
            port,
            client_name,
            username,
            password,
            &encryption_key,
        );
        let compose_path = dir.join(COMPOSE_FILE);
        tokio::fs::write(&compose_path, compose).await?;

        let env = render_env(instance_id, port, client_name, username, password);
        tokio::fs::write(dir.join(ENV_FILE), env).await?;

        info!(
            "Materialized descriptor for instance {} at {}",
            instance_id,
            compose_path.display()
        );
        Ok(compose_path)
    }

    /// Structural validation of an instance's descriptor. Diagnostics are
    /// collected, not short-circuited; an empty list means valid.
    pub async fn validate(
        &self,
        gateway: &DockerGateway,
        instance_id: &str,
    ) -> DaemonResult<Vec<String>> {
        let mut errors = Vec::new();
        let dir = self.instance_dir(instance_id);
        let compose_path = dir.join(COMPOSE_FILE);

        if !compose_path.exists() {
            errors.push(format!("{} not found", COMPOSE_FILE));
            return Ok(errors);
        }

        if let Err(e) = gateway
            .compose_config(&dir, COMPOSE_VALIDATE_TIMEOUT_SECS)
            .await
        {
            errors.push(format!("compose validation failed: {}", e));
        }

        Ok(errors)
    }

    pub async fn list_instance_dirs(&self) -> DaemonResult<Vec<String>> {
        let mut ids = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.instances_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Ok(name) = entry.file_name().into_string() {
                    ids.push(name);
                }
            }
        }

        Ok(ids)
    }

    pub async fn remove_instance_dir(&self, instance_id: &str) -> DaemonResult<()> {
        let dir = self.instance_dir(instance_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn generate_encryption_key() -> String {
    // 64 hex chars, 32 bytes of entropy.
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

/// Third octet of the instance's isolated bridge subnet, derived from the
/// instance id so regenerating a descriptor is stable. Range 20-249 keeps
/// clear of commonly pre-claimed docker subnets.
fn subnet_octet(instance_id: &str) -> u8 {
    let digest = Sha256::digest(instance_id.as_bytes());
    let n = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    (n % 230 + 20) as u8
}

fn render_compose(
    instance_id: &str,
    port: u16,
    client_name: &str,
    username: &str,
    password: &str,
    encryption_key: &str,
) -> String {
    let container = runtime_id(instance_id);
    let octet = subnet_octet(instance_id);
    format!(
        r#"services:
  n8n:
    image: n8nio/n8n:latest
    container_name: {container}
    restart: unless-stopped
    ports:
      - "{port}:{internal}"
    environment:
      - N8N_BASIC_AUTH_ACTIVE=true
      - N8N_BASIC_AUTH_USER={username}
      - N8N_BASIC_AUTH_PASSWORD={password}
      - N8N_HOST=0.0.0.0
      - N8N_PORT={internal}
      - N8N_PROTOCOL=http
      - N8N_ENCRYPTION_KEY={encryption_key}
      - N8N_USER_MANAGEMENT_DISABLED=false
      - N8N_DIAGNOSTICS_ENABLED=false
      - N8N_METRICS=true
      - N8N_LOG_LEVEL=info
      - N8N_LOG_OUTPUT=console
      - WEBHOOK_URL=http://localhost:{port}
      - GENERIC_TIMEZONE=UTC
    volumes:
      - n8n_data_{instance_id}:/home/node/.n8n
      - ./workflows:/home/node/workflows
      - ./credentials:/home/node/credentials
    labels:
      - "{label_instance}={instance_id}"
      - "{label_client}={client_name}"
    networks:
      - n8n_net_{instance_id}

volumes:
  n8n_data_{instance_id}:
    driver: local

networks:
  n8n_net_{instance_id}:
    driver: bridge
    ipam:
      config:
        - subnet: 10.77.{octet}.0/24
"#,
        container = container,
        port = port,
        internal = INSTANCE_INTERNAL_PORT,
        username = username,
        password = password,
        encryption_key = encryption_key,
        instance_id = instance_id,
        client_name = client_name,
        label_instance = LABEL_INSTANCE_ID,
        label_client = LABEL_CLIENT_NAME,
        octet = octet,
    )
}

fn render_env(
    instance_id: &str,
    port: u16,
    client_name: &str,
    username: &str,
    password: &str,
) -> String {
    let auth_seed =
        base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", username, password));
    format!(
        r#"# Instance configuration
INSTANCE_ID={instance_id}
PORT={port}
CLIENT_NAME={client_name}
CREATED_AT={created_at}

# Docker Compose configuration
COMPOSE_PROJECT_NAME={project}

# Basic auth seed (base64 user:password)
BASIC_AUTH_SEED={auth_seed}

# Logging
LOG_LEVEL=info
LOG_FORMAT=json
"#,
        instance_id = instance_id,
        port = port,
        client_name = client_name,
        created_at = Utc::now().to_rfc3339(),
        project = runtime_id(instance_id),
        auth_seed = auth_seed,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DockerConfig;

    #[test]
    fn compose_maps_host_port_to_internal() {
        let compose = render_compose("abc", 5600, "acme", "admin", "pw", "key");
        assert!(compose.contains("\"5600:5678\""));
        assert!(compose.contains("container_name: n8n-abc"));
        assert!(compose.contains("flotilla.instance.id=abc"));
        assert!(compose.contains("flotilla.client.name=acme"));
        assert!(compose.contains("N8N_BASIC_AUTH_USER=admin"));
    }

    #[test]
    fn subnet_octet_is_stable_and_in_range() {
        let a = subnet_octet("instance-a");
        let b = subnet_octet("instance-a");
        assert_eq!(a, b);
        for id in ["x", "y", "a-long-instance-identifier"] {
            let octet = subnet_octet(id);
            assert!((20..=249).contains(&octet), "octet {} out of range", octet);
        }
    }

    #[test]
    fn env_contains_auth_seed() {
        let env = render_env("abc", 5601, "acme", "user", "pass");
        let seed = base64::engine::general_purpose::STANDARD.encode("user:pass");
        assert!(env.contains(&seed));
        assert!(env.contains("COMPOSE_PROJECT_NAME=n8n-abc"));
    }

    #[tokio::test]
    async fn materialize_writes_descriptor_files() {
        let tmp = tempfile::tempdir().unwrap();
        let templates = TemplateManager::new(tmp.path());
        templates.ensure_layout().await.unwrap();

        let compose_path = templates
            .materialize("inst1", 5600, "acme", "admin", "pw")
            .await
            .unwrap();

        assert!(compose_path.exists());
        assert!(templates.instance_dir("inst1").join(".env").exists());
        assert!(templates.instance_dir("inst1").join("data").is_dir());
        assert_eq!(
            templates.list_instance_dirs().await.unwrap(),
            vec!["inst1".to_string()]
        );
    }

    #[tokio::test]
    async fn validate_reports_missing_compose_file() {
        let tmp = tempfile::tempdir().unwrap();
        let templates = TemplateManager::new(tmp.path());
        templates.ensure_layout().await.unwrap();
        tokio::fs::create_dir_all(templates.instance_dir("ghost"))
            .await
            .unwrap();

        let gateway = DockerGateway::new(&DockerConfig::default()).unwrap();
        let errors = templates.validate(&gateway, "ghost").await.unwrap();
        assert_eq!(errors, vec!["docker-compose.yml not found".to_string()]);
    }
}
