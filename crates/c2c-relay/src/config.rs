use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::fs;
use tracing::warn;

// ============================================================================
// Config (root)
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub relay: RelayConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Yaml(#[from] serde_saphyr::Error),

    #[error("environment variable '{0}' is not set")]
    MissingEnvVar(String),

    #[error("unclosed variable reference '${{' (missing '}}')")]
    UnclosedVarReference,
}

impl Config {
    /// Load the config file, falling back to defaults when it does not exist.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = match fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(ConfigError::Io(e)),
        };
        Self::parse(&contents)
    }

    /// Parse YAML text after environment expansion.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(contents)?;
        Ok(serde_saphyr::from_str(&expanded)?)
    }
}

/// Resolve a path relative to the config file directory.
pub fn resolve_path(config_path: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    config_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(path)
}

// ============================================================================
// Defaults
// ============================================================================

/// Default config file name.
pub const DEFAULT_CONFIG_FILE: &str = "c2c.yaml";
/// Default storage directory (relative to config file).
pub const DEFAULT_STORAGE_DIR: &str = ".c2c/store";
/// Inbound queue capacity when `MaxQueuePacketSize` is absent or invalid.
pub const DEFAULT_MAX_QUEUE_PACKET_SIZE: usize = 64;

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    6666
}

fn default_read_timeout_ms() -> u64 {
    10_000
}

// ============================================================================
// Environment Variable Expansion
// ============================================================================

/// Expand `${VAR}`, `${VAR:-default}` and `$$` in config text.
///
/// A lone `$` not followed by `{` or `$` is kept as-is. Nested references are
/// not supported.
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos + 1..];

        if let Some(after) = tail.strip_prefix('$') {
            out.push('$');
            rest = after;
        } else if let Some(body) = tail.strip_prefix('{') {
            let end = body.find('}').ok_or(ConfigError::UnclosedVarReference)?;
            out.push_str(&lookup_var(&body[..end])?);
            rest = &body[end + 1..];
        } else {
            out.push('$');
            rest = tail;
        }
    }

    out.push_str(rest);
    Ok(out)
}

/// Resolve the inside of a `${...}` reference.
fn lookup_var(reference: &str) -> Result<String, ConfigError> {
    let (name, fallback) = match reference.split_once(":-") {
        Some((name, fallback)) => (name, Some(fallback)),
        None => (reference, None),
    };

    match (std::env::var(name), fallback) {
        (Ok(value), _) => Ok(value),
        (Err(_), Some(fallback)) => Ok(fallback.to_string()),
        (Err(_), None) => Err(ConfigError::MissingEnvVar(name.to_string())),
    }
}

// ============================================================================
// ServerConfig
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Read loop wake-up interval per session.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

impl ServerConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

// ============================================================================
// StorageConfig
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    File,
    Memory,
}

#[derive(Debug, Default, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    /// Directory for the file backend. Defaults to [`DEFAULT_STORAGE_DIR`].
    #[serde(default)]
    pub path: Option<PathBuf>,
}

// ============================================================================
// RelayConfig
// ============================================================================

pub const KEY_CLIENT_TYPE: &str = "ClientType";
pub const KEY_MAX_QUEUE_PACKET_SIZE: &str = "MaxQueuePacketSize";
pub const KEY_MIDDLEWARE_CLIENT_LIST: &str = "MiddlewareClientList";
pub const KEY_MAX_RECEIVE_BYTES: &str = "MaxReceiveBytes";
pub const KEY_MAX_TRANSMIT_BYTES: &str = "MaxTransmitBytes";

/// A YAML scalar read as text.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ScalarValue {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl ScalarValue {
    fn into_text(self) -> String {
        match self {
            ScalarValue::Text(s) => s,
            ScalarValue::Int(i) => i.to_string(),
            ScalarValue::Float(f) => f.to_string(),
            ScalarValue::Bool(b) => b.to_string(),
        }
    }
}

/// String-keyed relay settings.
///
/// Values stay as text and are parsed by the typed accessors, which fall back
/// to defaults on absent or unparsable values.
#[derive(Debug, Clone, Default)]
pub struct RelayConfig {
    values: BTreeMap<String, String>,
}

impl<'de> Deserialize<'de> for RelayConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = BTreeMap::<String, ScalarValue>::deserialize(deserializer)?;
        Ok(Self {
            values: raw.into_iter().map(|(k, v)| (k, v.into_text())).collect(),
        })
    }
}

impl RelayConfig {
    /// Builder-style setter, mostly for embedding and tests.
    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.values.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|v| v.trim())
    }

    /// `0` disables `register` and `generate`.
    pub fn client_type(&self) -> u32 {
        self.parse_or(KEY_CLIENT_TYPE, 0)
    }

    /// Inbound queue capacity; never zero.
    pub fn max_queue_packet_size(&self) -> usize {
        match self.parse_or(KEY_MAX_QUEUE_PACKET_SIZE, DEFAULT_MAX_QUEUE_PACKET_SIZE) {
            0 => DEFAULT_MAX_QUEUE_PACKET_SIZE,
            n => n,
        }
    }

    /// Decorator names in wrapping order (last is outermost).
    pub fn middleware(&self) -> Vec<String> {
        self.get(KEY_MIDDLEWARE_CLIENT_LIST)
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Receive quota in bytes; 0 = unlimited.
    pub fn max_receive_bytes(&self) -> u64 {
        self.parse_or(KEY_MAX_RECEIVE_BYTES, 0)
    }

    /// Transmit quota in bytes; 0 = unlimited.
    pub fn max_transmit_bytes(&self) -> u64 {
        self.parse_or(KEY_MAX_TRANSMIT_BYTES, 0)
    }

    fn parse_or<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        let Some(raw) = self.get(key) else {
            return default;
        };
        match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(key = key, value = raw, "Invalid relay setting, using default");
                default
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    // ========================================================================
    // Config Tests
    // ========================================================================

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 6666);
        assert_eq!(config.server.read_timeout(), Duration::from_secs(10));
        assert_eq!(config.storage.backend, StorageBackend::File);
        assert!(config.storage.path.is_none());
        assert_eq!(config.relay.client_type(), 0);
        assert_eq!(config.relay.max_queue_packet_size(), 64);
        assert!(config.relay.middleware().is_empty());
    }

    #[tokio::test]
    async fn test_load_missing_file_returns_defaults() {
        let tmp_dir = TempDir::new().unwrap();
        let config = Config::load(tmp_dir.path().join("missing.yaml"))
            .await
            .unwrap();
        assert_eq!(config.server.port, 6666);
    }

    #[tokio::test]
    async fn test_load_valid_yaml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
server:
  host: "127.0.0.1"
  port: 7000
  read_timeout_ms: 250
storage:
  backend: memory
relay:
  ClientType: "1"
  MaxQueuePacketSize: "16"
  MiddlewareClientList: "safe, limits"
"#
        )
        .unwrap();

        let config = Config::load(file.path()).await.unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 7000);
        assert_eq!(config.server.read_timeout(), Duration::from_millis(250));
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.relay.client_type(), 1);
        assert_eq!(config.relay.max_queue_packet_size(), 16);
        assert_eq!(config.relay.middleware(), vec!["safe", "limits"]);
    }

    #[test]
    fn test_unquoted_relay_numbers_are_accepted() {
        let config = Config::parse("relay:\n  MaxQueuePacketSize: 8\n  ClientType: 2\n").unwrap();
        assert_eq!(config.relay.max_queue_packet_size(), 8);
        assert_eq!(config.relay.client_type(), 2);
    }

    // ========================================================================
    // RelayConfig Tests
    // ========================================================================

    #[test]
    fn invalid_queue_size_falls_back_to_default() {
        let relay = RelayConfig::default().with(KEY_MAX_QUEUE_PACKET_SIZE, "lots");
        assert_eq!(relay.max_queue_packet_size(), DEFAULT_MAX_QUEUE_PACKET_SIZE);

        let relay = RelayConfig::default().with(KEY_MAX_QUEUE_PACKET_SIZE, "0");
        assert_eq!(relay.max_queue_packet_size(), DEFAULT_MAX_QUEUE_PACKET_SIZE);
    }

    #[test]
    fn quotas_default_to_unlimited() {
        let relay = RelayConfig::default();
        assert_eq!(relay.max_receive_bytes(), 0);
        assert_eq!(relay.max_transmit_bytes(), 0);

        let relay = relay.with(KEY_MAX_RECEIVE_BYTES, " 1024 ");
        assert_eq!(relay.max_receive_bytes(), 1024);
    }

    #[test]
    fn middleware_skips_blank_entries() {
        let relay = RelayConfig::default().with(KEY_MIDDLEWARE_CLIENT_LIST, "limits,, safe ,");
        assert_eq!(relay.middleware(), vec!["limits", "safe"]);
    }

    // ========================================================================
    // Environment Variable Expansion Tests
    // ========================================================================

    #[test]
    fn expand_plain_text_unchanged() {
        assert_eq!(expand_env_vars("price: $100").unwrap(), "price: $100");
    }

    #[test]
    fn expand_escaped_dollar() {
        assert_eq!(expand_env_vars("a: $${X}").unwrap(), "a: ${X}");
    }

    #[test]
    fn expand_set_variable() {
        unsafe { std::env::set_var("C2C_TEST_EXPAND_SET", "9000") };
        assert_eq!(
            expand_env_vars("port: ${C2C_TEST_EXPAND_SET}").unwrap(),
            "port: 9000"
        );
    }

    #[test]
    fn expand_missing_variable_uses_default() {
        assert_eq!(
            expand_env_vars("host: ${C2C_TEST_EXPAND_UNSET:-127.0.0.1}").unwrap(),
            "host: 127.0.0.1"
        );
        assert_eq!(expand_env_vars("k: ${C2C_TEST_EXPAND_UNSET:-}").unwrap(), "k: ");
    }

    #[test]
    fn expand_missing_required_variable_errors() {
        let err = expand_env_vars("k: ${C2C_TEST_EXPAND_REQUIRED}").unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(name) if name == "C2C_TEST_EXPAND_REQUIRED"));
    }

    #[test]
    fn expand_unclosed_reference_errors() {
        assert!(matches!(
            expand_env_vars("k: ${OOPS"),
            Err(ConfigError::UnclosedVarReference)
        ));
    }

    #[test]
    fn resolve_relative_path_against_config_dir() {
        let resolved = resolve_path(Path::new("/etc/c2c/c2c.yaml"), Path::new("store"));
        assert_eq!(resolved, PathBuf::from("/etc/c2c/store"));

        let absolute = resolve_path(Path::new("/etc/c2c/c2c.yaml"), Path::new("/var/c2c"));
        assert_eq!(absolute, PathBuf::from("/var/c2c"));
    }
}
