use std::collections::HashMap;
use std::path::PathBuf;

/// Errors raised while building a configuration record from the environment.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Immutable relay configuration, populated once at startup.
/// No other component reads the environment.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Base directory for the database, storage tree and secrets
    pub app_dir: PathBuf,
    /// Port for the machine-facing surface (node/worker sockets, frames, events)
    pub relay_port: u16,
    /// Port for the dashboard-facing API
    pub api_port: u16,
    /// Public dashboard base URL, used in authorization URLs
    pub dashboard_url: String,
    /// HS256 secret for dashboard JWTs
    pub jwt_secret: String,
    /// Seconds between extracted frames per live stream
    pub frame_interval_seconds: u64,
    /// Frames per frame_batch event
    pub batch_size: usize,
    /// Open a realtime stream for every announced camera service
    pub auto_request_realtime_stream: bool,
    /// Delete stored frames older than this many seconds (0 = keep forever)
    pub frame_retention_seconds: u64,
    /// STUN servers for WebRTC sessions
    pub stun_urls: Vec<String>,
}

impl RelayConfig {
    /// Build from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_vars(&vars)
    }

    /// Build from an explicit variable map (the testable entry point).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        Ok(Self {
            app_dir: PathBuf::from(require(vars, "APP_DIR")?),
            relay_port: parse_port(vars, "RELAY_PORT")?,
            api_port: parse_port(vars, "API_PORT")?,
            dashboard_url: require(vars, "DASHBOARD_URL")?
                .trim_end_matches('/')
                .to_string(),
            jwt_secret: require(vars, "JWT_SECRET")?,
            frame_interval_seconds: parse_or(vars, "FRAME_INTERVAL_SECONDS", 5)?,
            batch_size: parse_or(vars, "BATCH_SIZE", 10)?,
            auto_request_realtime_stream: parse_bool_or(
                vars,
                "AUTO_REQUEST_REALTIME_STREAM",
                true,
            )?,
            frame_retention_seconds: parse_or(vars, "FRAME_RETENTION_SECONDS", 0)?,
            stun_urls: vars
                .get("STUN_URLS")
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_else(default_stun_urls),
        })
    }

    /// Validate the configuration, returning a list of issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal, the relay should not start)
    /// or "WARNING:" (advisory, the relay can start but the config is likely
    /// wrong). Returns `Ok(())` if no issues.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        if self.relay_port == self.api_port {
            issues.push(format!(
                "ERROR: RELAY_PORT and API_PORT must differ, both are {}.",
                self.relay_port
            ));
        }

        if self.jwt_secret.len() < 32 {
            issues.push(format!(
                "WARNING: JWT_SECRET is only {} bytes. Use at least 32 random bytes.",
                self.jwt_secret.len()
            ));
        }

        if self.frame_interval_seconds == 0 {
            issues.push(
                "ERROR: FRAME_INTERVAL_SECONDS must be >= 1. \
                 Zero would extract frames in a busy loop."
                    .to_string(),
            );
        }

        if self.batch_size == 0 {
            issues.push("ERROR: BATCH_SIZE must be >= 1.".to_string());
        }

        if !self.dashboard_url.starts_with("http://") && !self.dashboard_url.starts_with("https://")
        {
            issues.push(format!(
                "ERROR: DASHBOARD_URL '{}' must start with http:// or https://.",
                self.dashboard_url
            ));
        }

        if self.frame_retention_seconds > 0 && self.frame_retention_seconds < 60 {
            issues.push(format!(
                "WARNING: FRAME_RETENTION_SECONDS is {}. Frames may be deleted \
                 before workers finish downloading them.",
                self.frame_retention_seconds
            ));
        }

        for url in &self.stun_urls {
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                issues.push(format!(
                    "ERROR: STUN URL '{url}' must start with 'stun:' or 'stuns:'. \
                     Example: stun:stun.l.google.com:19302"
                ));
            }
        }

        if issues.is_empty() { Ok(()) } else { Err(issues) }
    }

    /// Directory holding extracted frame files.
    pub fn frames_dir(&self) -> PathBuf {
        self.app_dir.join("storage").join("frames")
    }

    /// SQLite database path.
    pub fn db_path(&self) -> PathBuf {
        self.app_dir.join("unblink.db")
    }
}

/// Immutable node configuration, populated once at startup.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Base directory for the persisted token and service list
    pub app_dir: PathBuf,
    /// Relay WebSocket URL, e.g. wss://relay.example.com/node/connect
    pub relay_url: String,
    /// Stable node identity; generated and persisted when absent
    pub node_id: Option<String>,
    /// Redial the relay after a terminal transport error
    pub reconnect: bool,
    /// Backoff ceiling in seconds
    pub reconnect_max_seconds: u64,
    /// Give up after this many consecutive failures (0 = never)
    pub reconnect_max_attempts: u32,
}

impl NodeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_vars(&vars)
    }

    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        Ok(Self {
            app_dir: PathBuf::from(require(vars, "APP_DIR")?),
            relay_url: require(vars, "RELAY_URL")?,
            node_id: vars.get("NODE_ID").cloned().filter(|v| !v.is_empty()),
            reconnect: parse_bool_or(vars, "RECONNECT", true)?,
            reconnect_max_seconds: parse_or(vars, "RECONNECT_MAX_SECONDS", 60)?,
            reconnect_max_attempts: parse_or(vars, "RECONNECT_MAX_ATTEMPTS", 0)?,
        })
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        if !self.relay_url.starts_with("ws://") && !self.relay_url.starts_with("wss://") {
            issues.push(format!(
                "ERROR: RELAY_URL '{}' must start with ws:// or wss://.",
                self.relay_url
            ));
        }

        if self.reconnect && self.reconnect_max_seconds == 0 {
            issues.push(
                "ERROR: RECONNECT_MAX_SECONDS must be >= 1 when RECONNECT is enabled.".to_string(),
            );
        }

        if issues.is_empty() { Ok(()) } else { Err(issues) }
    }

    /// Persisted relay token path.
    pub fn token_path(&self) -> PathBuf {
        self.app_dir.join("node_token")
    }

    /// Persisted generated node id path.
    pub fn node_id_path(&self) -> PathBuf {
        self.app_dir.join("node_id")
    }

    /// Local service list announced to the relay.
    pub fn services_path(&self) -> PathBuf {
        self.app_dir.join("services.json")
    }
}

fn require(vars: &HashMap<String, String>, name: &'static str) -> Result<String, ConfigError> {
    match vars.get(name) {
        Some(v) if !v.is_empty() => Ok(v.clone()),
        _ => Err(ConfigError::Missing(name)),
    }
}

fn parse_port(vars: &HashMap<String, String>, name: &'static str) -> Result<u16, ConfigError> {
    let raw = require(vars, name)?;
    let port: u16 = raw.parse().map_err(|_| ConfigError::Invalid {
        name,
        reason: format!("'{raw}' is not a port number"),
    })?;
    if port == 0 {
        return Err(ConfigError::Invalid {
            name,
            reason: "port 0 is not usable".to_string(),
        });
    }
    Ok(port)
}

fn parse_or<T: std::str::FromStr>(
    vars: &HashMap<String, String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(name) {
        None => Ok(default),
        Some(v) if v.is_empty() => Ok(default),
        Some(v) => v.parse().map_err(|_| ConfigError::Invalid {
            name,
            reason: format!("'{v}' is not a valid value"),
        }),
    }
}

fn parse_bool_or(
    vars: &HashMap<String, String>,
    name: &'static str,
    default: bool,
) -> Result<bool, ConfigError> {
    match vars.get(name).map(|v| v.as_str()) {
        None | Some("") => Ok(default),
        Some("true") | Some("1") | Some("yes") => Ok(true),
        Some("false") | Some("0") | Some("no") => Ok(false),
        Some(other) => Err(ConfigError::Invalid {
            name,
            reason: format!("'{other}' is not a boolean (use true/false)"),
        }),
    }
}

fn default_stun_urls() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun1.l.google.com:19302".to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relay_vars() -> HashMap<String, String> {
        [
            ("APP_DIR", "/var/lib/unblink"),
            ("RELAY_PORT", "8080"),
            ("API_PORT", "8081"),
            ("DASHBOARD_URL", "https://dash.example"),
            ("JWT_SECRET", "0123456789abcdef0123456789abcdef"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn relay_config_defaults() {
        let config = RelayConfig::from_vars(&relay_vars()).unwrap();
        assert_eq!(config.frame_interval_seconds, 5);
        assert_eq!(config.batch_size, 10);
        assert!(config.auto_request_realtime_stream);
        assert_eq!(config.frame_retention_seconds, 0);
        assert_eq!(config.stun_urls.len(), 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn relay_config_missing_required_var() {
        let mut vars = relay_vars();
        vars.remove("JWT_SECRET");
        assert!(matches!(
            RelayConfig::from_vars(&vars),
            Err(ConfigError::Missing("JWT_SECRET"))
        ));
    }

    #[test]
    fn relay_config_rejects_bad_port() {
        let mut vars = relay_vars();
        vars.insert("RELAY_PORT".to_string(), "relay".to_string());
        assert!(matches!(
            RelayConfig::from_vars(&vars),
            Err(ConfigError::Invalid { name: "RELAY_PORT", .. })
        ));

        vars.insert("RELAY_PORT".to_string(), "0".to_string());
        assert!(RelayConfig::from_vars(&vars).is_err());
    }

    #[test]
    fn relay_config_overrides() {
        let mut vars = relay_vars();
        vars.insert("FRAME_INTERVAL_SECONDS".to_string(), "2".to_string());
        vars.insert("BATCH_SIZE".to_string(), "25".to_string());
        vars.insert(
            "AUTO_REQUEST_REALTIME_STREAM".to_string(),
            "false".to_string(),
        );
        vars.insert(
            "STUN_URLS".to_string(),
            "stun:stun.example.com:3478, stun:backup.example.com:3478".to_string(),
        );
        let config = RelayConfig::from_vars(&vars).unwrap();
        assert_eq!(config.frame_interval_seconds, 2);
        assert_eq!(config.batch_size, 25);
        assert!(!config.auto_request_realtime_stream);
        assert_eq!(
            config.stun_urls,
            vec!["stun:stun.example.com:3478", "stun:backup.example.com:3478"]
        );
    }

    #[test]
    fn relay_config_trailing_slash_trimmed() {
        let mut vars = relay_vars();
        vars.insert(
            "DASHBOARD_URL".to_string(),
            "https://dash.example/".to_string(),
        );
        let config = RelayConfig::from_vars(&vars).unwrap();
        assert_eq!(config.dashboard_url, "https://dash.example");
    }

    #[test]
    fn validate_same_ports_is_error() {
        let mut vars = relay_vars();
        vars.insert("API_PORT".to_string(), "8080".to_string());
        let config = RelayConfig::from_vars(&vars).unwrap();
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.starts_with("ERROR:") && i.contains("API_PORT")));
    }

    #[test]
    fn validate_zero_frame_interval_is_error() {
        let mut vars = relay_vars();
        vars.insert("FRAME_INTERVAL_SECONDS".to_string(), "0".to_string());
        let config = RelayConfig::from_vars(&vars).unwrap();
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("FRAME_INTERVAL_SECONDS")));
    }

    #[test]
    fn validate_short_secret_is_warning_only() {
        let mut vars = relay_vars();
        vars.insert("JWT_SECRET".to_string(), "short".to_string());
        let config = RelayConfig::from_vars(&vars).unwrap();
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().all(|i| i.starts_with("WARNING:")));
    }

    #[test]
    fn validate_bad_stun_url_is_error() {
        let mut vars = relay_vars();
        vars.insert("STUN_URLS".to_string(), "http://oops.example".to_string());
        let config = RelayConfig::from_vars(&vars).unwrap();
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("STUN URL")));
    }

    #[test]
    fn bad_bool_is_invalid() {
        let mut vars = relay_vars();
        vars.insert(
            "AUTO_REQUEST_REALTIME_STREAM".to_string(),
            "maybe".to_string(),
        );
        assert!(RelayConfig::from_vars(&vars).is_err());
    }

    #[test]
    fn derived_paths() {
        let config = RelayConfig::from_vars(&relay_vars()).unwrap();
        assert_eq!(
            config.frames_dir(),
            PathBuf::from("/var/lib/unblink/storage/frames")
        );
        assert_eq!(config.db_path(), PathBuf::from("/var/lib/unblink/unblink.db"));
    }

    fn node_vars() -> HashMap<String, String> {
        [
            ("APP_DIR", "/var/lib/unblink-node"),
            ("RELAY_URL", "wss://relay.example/node/connect"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn node_config_defaults() {
        let config = NodeConfig::from_vars(&node_vars()).unwrap();
        assert!(config.node_id.is_none());
        assert!(config.reconnect);
        assert_eq!(config.reconnect_max_seconds, 60);
        assert_eq!(config.reconnect_max_attempts, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn node_config_rejects_non_ws_url() {
        let mut vars = node_vars();
        vars.insert(
            "RELAY_URL".to_string(),
            "https://relay.example".to_string(),
        );
        let config = NodeConfig::from_vars(&vars).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn node_config_paths() {
        let config = NodeConfig::from_vars(&node_vars()).unwrap();
        assert_eq!(
            config.token_path(),
            PathBuf::from("/var/lib/unblink-node/node_token")
        );
        assert_eq!(
            config.services_path(),
            PathBuf::from("/var/lib/unblink-node/services.json")
        );
    }
}
