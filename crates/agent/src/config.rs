//! Configuration management for the node agent.
//!
//! Configuration is layered: a TOML file (see [`Config::discover`] for the
//! lookup order), then environment variables, then command-line flags.

use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("auth user and password must both be set")]
    MissingCredentials,

    #[error("server addr must be a socket address like 0.0.0.0:5678, got {0:?}")]
    InvalidAddr(String),

    #[error("cert_file and key_file must be set together")]
    IncompleteTls,

    #[error("log level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("{0} interpreter command must not be empty")]
    EmptyInterpreter(&'static str),

    #[error("probe host must be an IP address, got {0:?}")]
    InvalidProbeHost(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Directory searched for a system-wide configuration file.
pub const SYSTEM_CONFIG_DIR: &str = "/srv/node-agent";

/// File name looked up in the working directory and [`SYSTEM_CONFIG_DIR`].
pub const CONFIG_FILE_NAME: &str = "agent.toml";

/// Main configuration structure for the node agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Listener configuration.
    pub server: ServerConfig,

    /// Credentials required by every channel.
    pub auth: AuthConfig,

    /// Logging configuration.
    pub logging: LoggingConfig,

    /// Interpreter commands for script channels.
    pub scripts: ScriptsConfig,

    /// Port probe configuration.
    pub probe: ProbeConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on.
    pub addr: String,

    /// PEM certificate chain. TLS is enabled when this and `key_file` are set.
    pub cert_file: Option<PathBuf>,

    /// PEM (PKCS#8) private key.
    pub key_file: Option<PathBuf>,
}

/// HTTP Basic credentials.
#[derive(Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AuthConfig {
    pub user: String,
    pub password: String,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub level: String,

    /// Append-only log file, written in addition to stdout.
    pub file: Option<PathBuf>,
}

/// Interpreter command prefixes. The script path and the caller's args are
/// appended to these.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScriptsConfig {
    pub python: Vec<String>,
    pub shell: Vec<String>,
}

/// Port probe configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProbeConfig {
    /// Host address the probe binds on.
    pub host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:5678".to_string(),
            cert_file: None,
            key_file: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl Default for ScriptsConfig {
    fn default() -> Self {
        Self {
            python: vec!["python3".to_string(), "-u".to_string()],
            shell: vec!["sh".to_string()],
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
        }
    }
}

/// Returns the per-user configuration file path.
pub fn user_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("node-agent")
        .join("config.toml")
}

/// Candidate configuration files, in lookup order.
pub fn search_paths() -> Vec<PathBuf> {
    vec![
        PathBuf::from(CONFIG_FILE_NAME),
        Path::new(SYSTEM_CONFIG_DIR).join(CONFIG_FILE_NAME),
        user_config_path(),
    ]
}

impl Config {
    /// Pick the configuration file: `explicit` if given, otherwise the first
    /// existing file in [`search_paths`]. `None` means defaults apply.
    ///
    /// An explicitly named file must exist.
    pub fn locate(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit {
            if !path.exists() {
                anyhow::bail!("Config file not found: {}", path.display());
            }
            return Ok(Some(path.to_path_buf()));
        }

        Ok(search_paths().into_iter().find(|path| path.exists()))
    }

    /// Load the file picked by [`Config::locate`], or defaults.
    pub fn discover(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>)> {
        match Self::locate(explicit)? {
            Some(path) => Ok((Self::load(&path)?, Some(path))),
            None => Ok((Self::default(), None)),
        }
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - WEB_USER: Override auth user
    /// - WEB_PASS: Override auth password
    /// - WEB_PORT: Override the port of the listen address
    /// - NODE_AGENT_LOG_LEVEL: Override log level
    ///
    /// Returns the names of the variables that were applied, so they can be
    /// logged once logging is up.
    pub fn apply_env_overrides(&mut self) -> Vec<&'static str> {
        let mut applied = Vec::new();

        if let Some(user) = non_empty_env("WEB_USER") {
            self.auth.user = user;
            applied.push("WEB_USER");
        }

        if let Some(password) = non_empty_env("WEB_PASS") {
            self.auth.password = password;
            applied.push("WEB_PASS");
        }

        if let Some(port) = non_empty_env("WEB_PORT") {
            self.set_port(&port);
            applied.push("WEB_PORT");
        }

        if let Some(level) = non_empty_env("NODE_AGENT_LOG_LEVEL") {
            self.logging.level = level;
            applied.push("NODE_AGENT_LOG_LEVEL");
        }

        applied
    }

    /// Replace the port of `server.addr`, keeping its host.
    ///
    /// Accepts `8080` or `:8080`.
    pub fn set_port(&mut self, port: &str) {
        let port = port.trim_start_matches(':');
        let host = match self.server.addr.rsplit_once(':') {
            Some((host, _)) if !host.is_empty() => host,
            _ => "0.0.0.0",
        };
        self.server.addr = format!("{}:{}", host, port);
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.auth.user.is_empty() || self.auth.password.is_empty() {
            return Err(ConfigError::MissingCredentials);
        }

        self.socket_addr()?;

        if self.server.cert_file.is_some() != self.server.key_file.is_some() {
            return Err(ConfigError::IncompleteTls);
        }

        let level = self.logging.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.logging.level.clone()));
        }

        if self.scripts.python.is_empty() {
            return Err(ConfigError::EmptyInterpreter("python"));
        }
        if self.scripts.shell.is_empty() {
            return Err(ConfigError::EmptyInterpreter("shell"));
        }

        self.probe_host()?;

        Ok(())
    }

    /// The parsed listen address.
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.server
            .addr
            .parse()
            .map_err(|_| ConfigError::InvalidAddr(self.server.addr.clone()))
    }

    /// The parsed probe host.
    pub fn probe_host(&self) -> Result<IpAddr, ConfigError> {
        self.probe
            .host
            .parse()
            .map_err(|_| ConfigError::InvalidProbeHost(self.probe.host.clone()))
    }

    /// Certificate and key paths, when TLS is configured.
    pub fn tls_files(&self) -> Option<(&Path, &Path)> {
        match (&self.server.cert_file, &self.server.key_file) {
            (Some(cert), Some(key)) => Some((cert.as_path(), key.as_path())),
            _ => None,
        }
    }

    /// Interpreter commands that cannot be found on `PATH`.
    pub fn missing_interpreters(&self) -> Vec<&str> {
        [&self.scripts.python, &self.scripts.shell]
            .into_iter()
            .filter_map(|prefix| prefix.first())
            .filter(|program| which::which(program.as_str()).is_err())
            .map(String::as_str)
            .collect()
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Serialize configuration to a TOML string with the password masked.
    pub fn to_redacted_toml(&self) -> Result<String> {
        let mut shown = self.clone();
        if !shown.auth.password.is_empty() {
            shown.auth.password = "********".to_string();
        }
        toml::to_string_pretty(&shown).context("Failed to serialize configuration to TOML")
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    const ENV_VARS: &[&str] = &["WEB_USER", "WEB_PASS", "WEB_PORT", "NODE_AGENT_LOG_LEVEL"];

    fn clear_env() {
        for name in ENV_VARS {
            std::env::remove_var(name);
        }
    }

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.auth.user = "admin".to_string();
        config.auth.password = "secret".to_string();
        config
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.server.addr, "0.0.0.0:5678");
        assert!(config.server.cert_file.is_none());
        assert!(config.auth.user.is_empty());
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.scripts.python, vec!["python3", "-u"]);
        assert_eq!(config.scripts.shell, vec!["sh"]);
        assert_eq!(config.probe.host, "0.0.0.0");
    }

    #[test]
    fn test_from_toml_empty() {
        // Empty TOML should use all defaults
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[auth]
user = "ops"
password = "hunter2"
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.auth.user, "ops");
        assert_eq!(config.auth.password, "hunter2");
        assert_eq!(config.server.addr, "0.0.0.0:5678");
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
[server]
addr = "127.0.0.1:9000"
cert_file = "/etc/agent/cert.pem"
key_file = "/etc/agent/key.pem"

[auth]
user = "admin"
password = "secret"

[logging]
level = "debug"
file = "/var/log/agent.log"

[scripts]
python = ["/usr/bin/python3.11", "-u"]
shell = ["bash", "--noprofile"]

[probe]
host = "127.0.0.1"
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.server.addr, "127.0.0.1:9000");
        assert_eq!(
            config.tls_files(),
            Some((Path::new("/etc/agent/cert.pem"), Path::new("/etc/agent/key.pem")))
        );
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.file, Some(PathBuf::from("/var/log/agent.log")));
        assert_eq!(config.scripts.python, vec!["/usr/bin/python3.11", "-u"]);
        assert_eq!(config.scripts.shell, vec!["bash", "--noprofile"]);
        assert_eq!(config.probe.host, "127.0.0.1");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let toml = r#"
[server
addr = "0.0.0.0:1"
"#;
        let err = Config::from_toml(toml).unwrap_err().to_string();
        assert!(err.contains("Invalid TOML"));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let toml = r#"
[scripts]
python = "python3"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let config = Config::load("/nonexistent/path/agent.toml").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("agent.toml");
        fs::write(&config_path, "invalid [ toml").unwrap();

        let err = Config::load(&config_path).unwrap_err().to_string();
        assert!(err.contains("Failed to parse config file"));
    }

    #[test]
    fn test_discover_explicit_path() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("custom.toml");
        fs::write(&config_path, "[auth]\nuser = \"a\"\npassword = \"b\"\n").unwrap();

        let (config, source) = Config::discover(Some(&config_path)).unwrap();
        assert_eq!(config.auth.user, "a");
        assert_eq!(source, Some(config_path));
    }

    #[test]
    fn test_discover_explicit_missing_is_error() {
        let err = Config::discover(Some(Path::new("/nonexistent/agent.toml")))
            .unwrap_err()
            .to_string();
        assert!(err.contains("Config file not found"));
    }

    #[test]
    fn test_search_paths_order() {
        let paths = search_paths();
        assert_eq!(paths[0], PathBuf::from("agent.toml"));
        assert_eq!(paths[1], PathBuf::from("/srv/node-agent/agent.toml"));
        assert!(paths[2].ends_with("node-agent/config.toml"));
    }

    #[test]
    fn test_set_port() {
        let mut config = Config::default();
        config.set_port("8080");
        assert_eq!(config.server.addr, "0.0.0.0:8080");

        config.server.addr = "127.0.0.1:1".to_string();
        config.set_port(":9090");
        assert_eq!(config.server.addr, "127.0.0.1:9090");

        config.server.addr = "[::1]:1".to_string();
        config.set_port("7000");
        assert_eq!(config.server.addr, "[::1]:7000");
    }

    #[test]
    fn test_validate_requires_credentials() {
        assert_eq!(
            Config::default().validate(),
            Err(ConfigError::MissingCredentials)
        );
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_validate_addr() {
        let mut config = valid_config();
        config.server.addr = "localhost".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidAddr("localhost".to_string()))
        );
    }

    #[test]
    fn test_validate_incomplete_tls() {
        let mut config = valid_config();
        config.server.cert_file = Some(PathBuf::from("cert.pem"));
        assert_eq!(config.validate(), Err(ConfigError::IncompleteTls));
        assert!(config.tls_files().is_none());
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = valid_config();
        config.logging.level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );

        config.logging.level = "DEBUG".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_empty_interpreter() {
        let mut config = valid_config();
        config.scripts.shell.clear();
        assert_eq!(
            config.validate(),
            Err(ConfigError::EmptyInterpreter("shell"))
        );
    }

    #[test]
    fn test_validate_probe_host() {
        let mut config = valid_config();
        config.probe.host = "not-an-ip".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidProbeHost("not-an-ip".to_string()))
        );
    }

    #[test]
    fn test_missing_interpreters() {
        let mut config = valid_config();
        config.scripts.python = vec!["definitely-not-a-real-interpreter-xyz".to_string()];
        config.scripts.shell = vec!["sh".to_string()];
        assert_eq!(
            config.missing_interpreters(),
            vec!["definitely-not-a-real-interpreter-xyz"]
        );
    }

    #[test]
    fn test_redacted_toml_masks_password() {
        let toml = valid_config().to_redacted_toml().unwrap();
        assert!(toml.contains("[auth]"));
        assert!(toml.contains("admin"));
        assert!(!toml.contains("secret"));
        assert!(toml.contains("********"));
    }

    #[test]
    fn test_debug_masks_password() {
        let debug = format!("{:?}", valid_config().auth);
        assert!(!debug.contains("secret"));
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clear_env();
        std::env::set_var("WEB_USER", "env-user");
        std::env::set_var("WEB_PASS", "env-pass");
        std::env::set_var("WEB_PORT", "6000");
        std::env::set_var("NODE_AGENT_LOG_LEVEL", "warn");

        let mut config = Config::default();
        let applied = config.apply_env_overrides();

        assert_eq!(
            applied,
            ["WEB_USER", "WEB_PASS", "WEB_PORT", "NODE_AGENT_LOG_LEVEL"]
        );
        assert_eq!(config.auth.user, "env-user");
        assert_eq!(config.auth.password, "env-pass");
        assert_eq!(config.server.addr, "0.0.0.0:6000");
        assert_eq!(config.logging.level, "warn");

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        clear_env();
        std::env::set_var("WEB_USER", "");
        std::env::set_var("WEB_PORT", "");

        let mut config = valid_config();
        let applied = config.apply_env_overrides();

        assert!(applied.is_empty());
        assert_eq!(config.auth.user, "admin");
        assert_eq!(config.server.addr, "0.0.0.0:5678");

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_unset_does_not_override() {
        clear_env();

        let mut config = valid_config();
        assert!(config.apply_env_overrides().is_empty());

        assert_eq!(config, valid_config());
    }
}
