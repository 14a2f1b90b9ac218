//! Configuration storage

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

/// Application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub negotiation: NegotiationConfig,
    pub client: ClientConfig,
}

/// Coordinator settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the signaling WebSocket listens on
    pub listen: String,
    /// Code reserved for the bot participant
    pub bot_code: String,
    /// Host the bot in-process and inject it into calls
    pub bot_enabled: bool,
    /// Delay between forwarding an offer and inviting the bot
    pub bot_injection_delay_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8787".into(),
            bot_code: "000".into(),
            bot_enabled: true,
            bot_injection_delay_ms: 1000,
        }
    }
}

/// Endpoint negotiation settings, shared by the bot and the phone
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiationConfig {
    /// Upper bound on waiting for local ICE gathering
    pub ice_gathering_timeout_ms: u64,
    /// Minimum spacing between offer attempts
    pub offer_debounce_ms: u64,
    /// `host:port` of a STUN server for server-reflexive candidates; empty disables STUN
    pub stun_server: Option<String>,
    /// Local address to gather host candidates on; discovered when unset
    pub bind_ip: Option<IpAddr>,
    /// How long connectivity checks may run before ICE is declared failed
    pub connectivity_timeout_ms: u64,
    /// How long the answering side waits for the peer's ICE restart
    pub restart_wait_ms: u64,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            ice_gathering_timeout_ms: 15_000,
            offer_debounce_ms: 1000,
            stun_server: Some("stun.l.google.com:19302".into()),
            bind_ip: None,
            connectivity_timeout_ms: 10_000,
            restart_wait_ms: 20_000,
        }
    }
}

/// Endpoint client settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Coordinator URL the bot and phone connect to
    pub server_url: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:8787".into(),
        }
    }
}

impl Config {
    /// Get config directory path
    fn config_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "peercall", "peercall")
            .context("Could not determine config directory")?;
        Ok(proj_dirs.config_dir().to_path_buf())
    }

    /// Get default config file path
    pub fn default_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Resolve an explicit path or fall back to the default location
    pub fn resolve_path(explicit: Option<&Path>) -> Result<PathBuf> {
        match explicit {
            Some(path) => Ok(path.to_path_buf()),
            None => Self::default_path(),
        }
    }

    /// Load configuration from disk; a missing file yields defaults
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = Self::resolve_path(explicit)?;

        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config file")
    }

    /// Save configuration to disk
    pub fn save(&self, explicit: Option<&Path>) -> Result<PathBuf> {
        let path = Self::resolve_path(explicit)?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).context("Failed to create config directory")?;
        }

        let content = self.to_toml()?;
        fs::write(&path, content).context("Failed to write config file")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(&path, perms).context("Failed to set config permissions")?;
        }

        Ok(path)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        assert_eq!(Config::parse("").unwrap(), Config::default());
    }

    #[test]
    fn test_partial_sections_keep_other_defaults() {
        let config = Config::parse(
            r#"
            [server]
            bot_enabled = false

            [negotiation]
            offer_debounce_ms = 250
            bind_ip = "127.0.0.1"
            "#,
        )
        .unwrap();

        assert!(!config.server.bot_enabled);
        assert_eq!(config.server.bot_code, "000");
        assert_eq!(config.negotiation.offer_debounce_ms, 250);
        assert_eq!(config.negotiation.ice_gathering_timeout_ms, 15_000);
        assert_eq!(config.negotiation.bind_ip, Some("127.0.0.1".parse().unwrap()));
        assert_eq!(config.client.server_url, "ws://127.0.0.1:8787");
    }

    #[test]
    fn test_bad_toml_is_an_error() {
        tokio_test::assert_err!(Config::parse("[server\nlisten = "));
        tokio_test::assert_err!(Config::parse("[server]\nbot_injection_delay_ms = \"soon\""));
    }

    #[test]
    fn test_save_and_load() {
        let dir = std::env::temp_dir().join(format!("peercall-config-{}", uuid::Uuid::new_v4()));
        let path = dir.join("config.toml");

        let mut config = Config::default();
        config.server.listen = "127.0.0.1:9000".into();
        config.negotiation.stun_server = Some(String::new());
        assert_eq!(config.save(Some(&path)).unwrap(), path);

        let loaded = Config::load(Some(&path)).unwrap();
        assert_eq!(loaded, config);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let path = std::env::temp_dir().join(format!("peercall-missing-{}.toml", uuid::Uuid::new_v4()));
        let config = tokio_test::assert_ok!(Config::load(Some(&path)));
        assert_eq!(config, Config::default());
    }
}
