use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DaemonConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub docker: DockerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub data_dir: PathBuf,
    pub default_username: String,
    pub default_password: String,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("data_dir", &self.data_dir)
            .field("default_username", &self.default_username)
            .field("default_password", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DockerConfig {
    /// Binary used for compose operations; container control goes
    /// through the engine API directly.
    pub compose_bin: String,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            compose_bin: "docker".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl DaemonConfig {
    pub fn from_file(path: &str) -> Result<Self, String> {
        let content =
            std::fs::read_to_string(path).map_err(|e| format!("Failed to read config: {}", e))?;
        toml::from_str(&content).map_err(|e| format!("Failed to parse config: {}", e))
    }

    pub fn from_env() -> Result<Self, String> {
        Ok(Self {
            server: ServerConfig {
                bind_addr: std::env::var("FLOTILLA_BIND")
                    .unwrap_or_else(|_| "127.0.0.1:4000".to_string()),
                data_dir: PathBuf::from(
                    std::env::var("FLOTILLA_DATA_DIR")
                        .unwrap_or_else(|_| "/var/lib/flotilla".to_string()),
                ),
                default_username: std::env::var("FLOTILLA_DEFAULT_USERNAME")
                    .unwrap_or_else(|_| "admin".to_string()),
                default_password: std::env::var("FLOTILLA_DEFAULT_PASSWORD")
                    .map_err(|_| "FLOTILLA_DEFAULT_PASSWORD not set".to_string())?,
            },
            docker: DockerConfig {
                compose_bin: std::env::var("FLOTILLA_COMPOSE_BIN")
                    .unwrap_or_else(|_| "docker".to_string()),
            },
            logging: LoggingConfig {
                level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
                format: "json".to_string(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config_file() {
        let raw = r#"
[server]
bind_addr = "0.0.0.0:4000"
data_dir = "/tmp/flotilla"
default_username = "ops@example.com"
default_password = "hunter2"

[docker]
compose_bin = "podman"

[logging]
level = "debug"
format = "plain"
"#;
        let config: DaemonConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.server.bind_addr, "0.0.0.0:4000");
        assert_eq!(config.docker.compose_bin, "podman");
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn docker_section_is_optional() {
        let raw = r#"
[server]
bind_addr = "127.0.0.1:4000"
data_dir = "/tmp/flotilla"
default_username = "admin"
default_password = "secret"

[logging]
level = "info"
format = "json"
"#;
        let config: DaemonConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.docker.compose_bin, "docker");
    }

    #[test]
    fn debug_redacts_password() {
        let config = ServerConfig {
            bind_addr: "127.0.0.1:4000".to_string(),
            data_dir: PathBuf::from("/tmp"),
            default_username: "admin".to_string(),
            default_password: "supersecret".to_string(),
        };
        let rendered = format!("{:?}", config);
        assert!(rendered.contains("[REDACTED]"));
        assert!(!rendered.contains("supersecret"));
    }
}
