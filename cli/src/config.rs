use std::path::{Path, PathBuf};

use serde::Deserialize;
use tether_lsp::{ClientConfig, ServerConfig};

/// Contents of `tether.toml`.
#[derive(Debug, Default, Deserialize)]
pub struct TetherConfig {
    pub server: Option<ServerConfig>,
    #[serde(default)]
    pub client: ClientConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config at {}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl TetherConfig {
    /// Load `explicit` if given, else `~/.tether/config.toml` when it
    /// exists, else defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load_from(path);
        }
        match config_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("Failed to read config at {:?}: {}", path, err);
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };

        toml::from_str(&content).map_err(|err| {
            tracing::warn!("Failed to parse config at {:?}: {}", path, err);
            ConfigError::Parse {
                path: path.to_path_buf(),
                source: err,
            }
        })
    }
}

#[must_use]
pub fn config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".tether").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::time::Duration;

    use tether_lsp::StderrMode;

    use super::*;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_full_config() {
        let file = write_config(
            r#"
[server]
name = "ra"
command = "rust-analyzer"
args = ["--log-file", "/tmp/ra.log"]
stderr = "null"

[server.env]
RA_LOG = "info"

[client]
hitrate = 8
request_retry_ms = 2500
"#,
        );
        let config = TetherConfig::load(Some(file.path())).unwrap();
        let server = config.server.unwrap();
        assert_eq!(server.name(), "ra");
        assert_eq!(server.command(), "rust-analyzer");
        assert_eq!(server.args(), ["--log-file", "/tmp/ra.log"]);
        assert_eq!(server.stderr(), StderrMode::Null);
        assert_eq!(server.env().get("RA_LOG").map(String::as_str), Some("info"));
        assert_eq!(config.client.hitrate, 8);
        assert_eq!(config.client.request_retry, Duration::from_millis(2500));
        assert_eq!(config.client.max_send_attempts, 2);
    }

    #[test]
    fn test_missing_client_section_uses_defaults() {
        let file = write_config("[server]\ncommand = \"gopls\"\n");
        let config = TetherConfig::load_from(file.path()).unwrap();
        assert_eq!(config.client, ClientConfig::default());
        assert_eq!(config.server.unwrap().name(), "gopls");
    }

    #[test]
    fn test_zero_hitrate_is_parse_error() {
        let file = write_config("[client]\nhitrate = 0\n");
        let err = TetherConfig::load_from(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_empty_command_is_parse_error() {
        let file = write_config("[server]\ncommand = \"  \"\n");
        assert!(matches!(
            TetherConfig::load_from(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_explicit_missing_file_is_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let err = TetherConfig::load(Some(&path)).unwrap_err();
        match err {
            ConfigError::Read { path: reported, .. } => assert_eq!(reported, path),
            other => panic!("expected read error, got {other:?}"),
        }
    }
}
