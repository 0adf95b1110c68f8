// Configuration module for abs-toolbox
// Resolves the config directory and merges config.toml with environment overrides

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::migration::{DEFAULT_API_KEY_NAME, DEFAULT_SESSIONS_PAGE_SIZE};
use crate::services::abs::DEFAULT_TIMEOUT_SECS;

const APP_NAME: &str = "abs-toolbox";
const CONFIG_FILENAME: &str = "config.toml";

/// TOML configuration file structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    /// HTTP backend configuration
    pub server: ServerConfig,

    /// The media server the tools operate on
    pub target: TargetConfig,

    /// Migration tuning
    pub migration: MigrationConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server port (default: 8787)
    pub port: u16,

    /// Bind address (default: 127.0.0.1)
    pub bind_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8787,
            bind_address: "127.0.0.1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    /// Base URL, e.g. https://abs.example.com
    pub url: Option<String>,

    /// API token of an admin user
    pub api_token: Option<String>,

    /// Per-request timeout in seconds (default: 30)
    pub timeout_secs: u64,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            url: None,
            api_token: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Sessions requested from the old server in one call
    pub sessions_page_size: u64,

    /// Library items per page, 0 fetches every item in one call
    pub items_page_size: usize,

    /// Name given to the temporary per-user API keys
    pub api_key_name: String,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            sessions_page_size: DEFAULT_SESSIONS_PAGE_SIZE,
            items_page_size: 0,
            api_key_name: DEFAULT_API_KEY_NAME.to_string(),
        }
    }
}

/// Application configuration - combines TOML file with environment overrides
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Directory config.toml was looked up in
    pub config_dir: PathBuf,

    pub port: u16,
    pub bind_address: String,

    pub server_url: Option<String>,
    pub api_token: Option<String>,
    pub timeout: Duration,

    pub migration: MigrationConfig,
}

impl AppConfig {
    /// Load configuration from TOML file and environment
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. TOML config file
    /// 3. Default values
    pub fn load() -> Self {
        let config_dir = Self::find_config_dir();
        let config_file = Self::load_config_file(&config_dir);
        Self::build(config_dir, config_file)
    }

    /// Find the config directory (for locating config.toml)
    fn find_config_dir() -> PathBuf {
        // Environment variable takes priority
        if let Ok(path) = std::env::var("ABS_TOOLBOX_CONFIG_DIR") {
            return PathBuf::from(path);
        }

        // Then XDG config dir
        if let Some(dir) = dirs::config_dir() {
            return dir.join(APP_NAME);
        }

        // Fallback to current directory
        std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
    }

    /// Load and parse the TOML config file
    fn load_config_file(config_dir: &Path) -> ConfigFile {
        let config_path = config_dir.join(CONFIG_FILENAME);

        if !config_path.exists() {
            tracing::debug!(
                "No config file found at {}, using defaults",
                config_path.display()
            );
            return ConfigFile::default();
        }

        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded configuration from {}", config_path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to parse config file {}: {}. Using defaults.",
                        config_path.display(),
                        e
                    );
                    ConfigFile::default()
                }
            },
            Err(e) => {
                tracing::warn!(
                    "Failed to read config file {}: {}. Using defaults.",
                    config_path.display(),
                    e
                );
                ConfigFile::default()
            }
        }
    }

    /// Build configuration from config file with environment overrides
    fn build(config_dir: PathBuf, config_file: ConfigFile) -> Self {
        // Port: env > config > default
        let port = Self::env_port().unwrap_or(config_file.server.port);

        // Bind address: env > config > default
        let bind_address =
            Self::env_bind_address().unwrap_or_else(|| config_file.server.bind_address.clone());

        // Target server: env > config
        let server_url = std::env::var("ABS_SERVER_URL")
            .ok()
            .or(config_file.target.url);
        let api_token = std::env::var("ABS_API_TOKEN")
            .ok()
            .or(config_file.target.api_token);

        let timeout_secs = std::env::var("ABS_TIMEOUT_SECS")
            .ok()
            .and_then(|t| t.parse().ok())
            .unwrap_or(config_file.target.timeout_secs);

        Self {
            config_dir,
            port,
            bind_address,
            server_url,
            api_token,
            timeout: Duration::from_secs(timeout_secs),
            migration: config_file.migration,
        }
    }

    fn env_port() -> Option<u16> {
        std::env::var("ABS_TOOLBOX_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
    }

    fn env_bind_address() -> Option<String> {
        std::env::var("ABS_TOOLBOX_BIND_ADDRESS").ok()
    }

    /// Log configuration status
    pub fn log_config(&self) {
        tracing::info!("Configuration directory: {}", self.config_dir.display());
        tracing::debug!("Request timeout: {}s", self.timeout.as_secs());

        match self.server_url {
            Some(ref url) => tracing::info!("Target server: {}", url),
            None => {
                tracing::warn!("No target server configured");
                tracing::info!("Hint: Add [target] url to config.toml or set ABS_SERVER_URL env var");
            }
        }

        if self.api_token.is_none() {
            tracing::warn!("No API token configured (ABS_API_TOKEN)");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_file() {
        let config = ConfigFile::default();
        assert_eq!(config.server.port, 8787);
        assert_eq!(config.server.bind_address, "127.0.0.1");
        assert!(config.target.url.is_none());
        assert_eq!(config.target.timeout_secs, 30);
        assert_eq!(config.migration.sessions_page_size, 999_999);
        assert_eq!(config.migration.items_page_size, 0);
        assert_eq!(config.migration.api_key_name, "Migration Script");
    }

    #[test]
    fn test_parse_config_toml() {
        let toml_str = r#"
[server]
port = 9000
bind_address = "0.0.0.0"

[target]
url = "https://abs.example.com"
api_token = "secret"
timeout_secs = 120

[migration]
items_page_size = 500
api_key_name = "Move"
"#;
        let config: ConfigFile = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.bind_address, "0.0.0.0");
        assert_eq!(config.target.url.as_deref(), Some("https://abs.example.com"));
        assert_eq!(config.target.api_token.as_deref(), Some("secret"));
        assert_eq!(config.target.timeout_secs, 120);
        assert_eq!(config.migration.items_page_size, 500);
        assert_eq!(config.migration.api_key_name, "Move");
        assert_eq!(config.migration.sessions_page_size, 999_999); // default
    }

    #[test]
    fn test_partial_config_toml() {
        // Test that partial configs work (only specify what you need)
        let toml_str = r#"
[target]
url = "http://localhost:13378"
"#;
        let config: ConfigFile = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.port, 8787); // default
        assert_eq!(config.target.timeout_secs, 30); // default
        assert_eq!(config.target.url.as_deref(), Some("http://localhost:13378"));
    }

    #[test]
    fn test_malformed_config_falls_back_to_defaults() {
        let dir = std::env::temp_dir().join(format!("abs-toolbox-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(CONFIG_FILENAME), "[server\nport = ").unwrap();

        let config = AppConfig::load_config_file(&dir);
        assert_eq!(config.server.port, 8787);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_missing_config_file_uses_defaults() {
        let dir = std::env::temp_dir().join(format!("abs-toolbox-missing-{}", uuid::Uuid::new_v4()));
        let config = AppConfig::load_config_file(&dir);
        assert_eq!(config.server.bind_address, "127.0.0.1");
    }
}
