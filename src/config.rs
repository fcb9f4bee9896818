//! Connection configuration.
//!
//! Supports configuration from:
//! - TOML config files
//! - Environment variables (`KAPSULE_DBUS_*`)
//! - CLI arguments (for the binary)

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::command::{AuthScheme, SchemeSet};
use crate::cookie::CookieStore;
use crate::error::{Error, Result};

pub const ENV_CALL_TIMEOUT_MS: &str = "KAPSULE_DBUS_CALL_TIMEOUT_MS";
pub const ENV_AUTH_TIMEOUT_MS: &str = "KAPSULE_DBUS_AUTH_TIMEOUT_MS";
pub const ENV_MECHANISMS: &str = "KAPSULE_DBUS_MECHANISMS";
pub const ENV_KEYRING_DIR: &str = "KAPSULE_DBUS_KEYRING_DIR";

/// Settings for one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Default method call timeout in milliseconds.
    pub call_timeout_ms: u64,

    /// Handshake timeout in milliseconds.
    pub auth_timeout_ms: u64,

    /// Mechanisms to offer or attempt, by wire name.
    pub mechanisms: Vec<AuthScheme>,

    /// Ask for (or agree to) file descriptor passing where the transport allows.
    pub negotiate_unix_fd: bool,

    /// DBUS_COOKIE_SHA1 keyring directory. `None` means `~/.dbus-keyrings`.
    pub keyring_dir: Option<PathBuf>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 20_000,
            auth_timeout_ms: 30_000,
            mechanisms: AuthScheme::REAL.to_vec(),
            negotiate_unix_fd: true,
            keyring_dir: None,
        }
    }
}

impl ConnectionConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {e}", path.display())))?;

        toml::from_str(&content).map_err(|e| Error::Config(format!("Failed to parse config: {e}")))
    }

    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Result<Self> {
        Self::default().with_env()
    }

    /// Overlay the process environment on this config.
    pub fn with_env(self) -> Result<Self> {
        self.with_vars(|key| std::env::var(key).ok())
    }

    /// Overlay variables from `lookup` on this config.
    pub fn with_vars<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let millis = |key: &str, value: String| {
            value
                .trim()
                .parse::<u64>()
                .map_err(|e| Error::Config(format!("{key}: {e}")))
        };

        if let Some(value) = lookup(ENV_CALL_TIMEOUT_MS) {
            self.call_timeout_ms = millis(ENV_CALL_TIMEOUT_MS, value)?;
        }
        if let Some(value) = lookup(ENV_AUTH_TIMEOUT_MS) {
            self.auth_timeout_ms = millis(ENV_AUTH_TIMEOUT_MS, value)?;
        }
        if let Some(value) = lookup(ENV_MECHANISMS) {
            self.mechanisms = parse_mechanisms(&value)?;
        }
        if let Some(value) = lookup(ENV_KEYRING_DIR) {
            self.keyring_dir = Some(PathBuf::from(value));
        }
        Ok(self)
    }

    /// Default method call timeout.
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Handshake timeout.
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }

    /// Configured mechanisms as a set.
    pub fn mechanism_set(&self) -> SchemeSet {
        self.mechanisms.iter().copied().collect()
    }

    /// Keyring for DBUS_COOKIE_SHA1, when one is configured explicitly.
    pub fn cookie_store(&self) -> Option<CookieStore> {
        self.keyring_dir.clone().map(CookieStore::new)
    }
}

/// Parse a comma- or space-separated list of mechanism wire names.
pub fn parse_mechanisms(value: &str) -> Result<Vec<AuthScheme>> {
    let mechanisms = value
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|name| !name.is_empty())
        .map(|name| {
            AuthScheme::from_wire_name(name)
                .ok_or_else(|| Error::Config(format!("Unknown auth mechanism: {name}")))
        })
        .collect::<Result<Vec<_>>>()?;
    if mechanisms.is_empty() {
        return Err(Error::Config("No auth mechanisms configured".to_string()));
    }
    Ok(mechanisms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.call_timeout(), Duration::from_secs(20));
        assert_eq!(config.auth_timeout(), Duration::from_secs(30));
        assert_eq!(config.mechanism_set(), AuthScheme::all());
        assert!(config.negotiate_unix_fd);
    }

    #[test]
    fn test_from_file_partial() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "call_timeout_ms = 500").unwrap();
        writeln!(file, "mechanisms = [\"ANONYMOUS\", \"EXTERNAL\"]").unwrap();
        writeln!(file, "keyring_dir = \"/tmp/keys\"").unwrap();

        let config = ConnectionConfig::from_file(file.path()).unwrap();
        assert_eq!(config.call_timeout_ms, 500);
        assert_eq!(config.auth_timeout_ms, 30_000);
        assert_eq!(config.mechanisms, vec![AuthScheme::Anonymous, AuthScheme::External]);
        assert_eq!(config.keyring_dir, Some(PathBuf::from("/tmp/keys")));
    }

    #[test]
    fn test_from_file_errors() {
        assert!(matches!(
            ConnectionConfig::from_file("/definitely/not/here.toml"),
            Err(Error::Config(_))
        ));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "mechanisms = [\"KERBEROS\"]").unwrap();
        assert!(matches!(
            ConnectionConfig::from_file(file.path()),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_env_overlay() {
        let vars: HashMap<&str, &str> = [
            (ENV_CALL_TIMEOUT_MS, "1500"),
            (ENV_MECHANISMS, "DBUS_COOKIE_SHA1, ANONYMOUS"),
            (ENV_KEYRING_DIR, "/var/keys"),
        ]
        .into_iter()
        .collect();

        let config = ConnectionConfig::default()
            .with_vars(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.call_timeout(), Duration::from_millis(1500));
        assert_eq!(config.auth_timeout_ms, 30_000);
        assert_eq!(
            config.mechanisms,
            vec![AuthScheme::CookieSha1, AuthScheme::Anonymous]
        );
        assert_eq!(config.keyring_dir, Some(PathBuf::from("/var/keys")));
    }

    #[test]
    fn test_env_overlay_rejects_garbage() {
        let bad_timeout = ConnectionConfig::default()
            .with_vars(|key| (key == ENV_AUTH_TIMEOUT_MS).then(|| "soon".to_string()));
        assert!(bad_timeout.is_err());

        assert!(parse_mechanisms("EXTERNAL,PLAIN").is_err());
        assert!(parse_mechanisms(" , ").is_err());
    }
}
