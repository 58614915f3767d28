use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_SIDECAR_HOST: &str = "127.0.0.1";
pub const DEFAULT_SIDECAR_PORT: u16 = 39741;
pub const DEFAULT_SERVICE_MARKER: &str = "wingman-sidecar";

pub const ENV_SIDECAR_PORT: &str = "WINGMAN_SIDECAR_PORT";
pub const ENV_NODE_PATH: &str = "WINGMAN_NODE_PATH";
pub const ENV_RESOURCE_DIR: &str = "WINGMAN_RESOURCE_DIR";
pub const ENV_LOG_HTTP_BODIES: &str = "WINGMAN_LOG_HTTP_BODIES";
pub const ENV_TOOLS_ENABLED: &str = "WINGMAN_TOOLS_ENABLED";
pub const ENV_TOOLS_FALLBACK: &str = "WINGMAN_TOOLS_FALLBACK";

/// Configuration shared by the lifecycle manager and the HTTP client.
#[derive(Debug, Clone)]
pub struct SidecarConfig {
    pub host: String,
    /// Well-known port the worker binds. At most one worker may own it.
    pub port: u16,
    pub health_path: String,
    /// String the health body must contain for a listener to count as ours.
    pub service_marker: String,
    pub health_timeout: Duration,
    pub request_timeout: Duration,
    /// Read timeout for prompt streams, applied per request.
    pub stream_timeout: Duration,
    /// Total attempts for plain requests.
    pub max_attempts: u32,
    /// Total attempts for auth requests.
    pub auth_max_attempts: u32,
    pub health_poll_attempts: u32,
    pub health_poll_interval: Duration,
    /// Bounded wait after signalling a stale listener on the well-known port.
    pub stale_listener_wait: Duration,
    pub log_http_bodies: bool,
    /// Explicit worker runtime executable, checked before anything else.
    pub runtime_override: Option<PathBuf>,
    /// Bundled resources (entry script under `sidecar/`, runtime under `runtime/`).
    pub resource_dir: Option<PathBuf>,
    /// Local source checkouts searched for the entry script after the bundle.
    pub source_dirs: Vec<PathBuf>,
    pub script_name: String,
    /// Extra environment for the worker. Always wins over injected defaults.
    pub extra_env: Vec<(String, String)>,
    pub working_dir: Option<PathBuf>,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_SIDECAR_HOST.to_string(),
            port: DEFAULT_SIDECAR_PORT,
            health_path: "/health".to_string(),
            service_marker: DEFAULT_SERVICE_MARKER.to_string(),
            health_timeout: Duration::from_millis(1200),
            request_timeout: Duration::from_secs(15),
            stream_timeout: Duration::from_secs(120),
            max_attempts: 3,
            auth_max_attempts: 5,
            health_poll_attempts: 20,
            health_poll_interval: Duration::from_millis(500),
            stale_listener_wait: Duration::from_secs(2),
            log_http_bodies: false,
            runtime_override: None,
            resource_dir: None,
            source_dirs: default_source_dirs(),
            script_name: "index.js".to_string(),
            extra_env: Vec::new(),
            working_dir: None,
        }
    }
}

impl SidecarConfig {
    /// Defaults overlaid with the `WINGMAN_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(port) = std::env::var(ENV_SIDECAR_PORT)
            .ok()
            .and_then(|raw| raw.trim().parse::<u16>().ok())
        {
            config.port = port;
        }
        config.runtime_override = non_empty_env(ENV_NODE_PATH).map(PathBuf::from);
        config.resource_dir = non_empty_env(ENV_RESOURCE_DIR).map(PathBuf::from);
        config.log_http_bodies = env_flag(ENV_LOG_HTTP_BODIES);
        config
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn health_url(&self) -> String {
        format!("{}{}", self.base_url(), self.health_path)
    }
}

fn default_source_dirs() -> Vec<PathBuf> {
    let Ok(cwd) = std::env::current_dir() else {
        return Vec::new();
    };
    vec![
        cwd.join("sidecar").join("dist"),
        cwd.join("..").join("sidecar").join("dist"),
    ]
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub(crate) fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| parse_flag(&v))
        .unwrap_or(false)
}

pub(crate) fn parse_flag(raw: &str) -> bool {
    let lower = raw.trim().to_ascii_lowercase();
    matches!(lower.as_str(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_timeout_budget() {
        let config = SidecarConfig::default();
        assert!(config.health_timeout <= Duration::from_millis(1200));
        assert_eq!(config.max_attempts, 3);
        assert!(config.auth_max_attempts > config.max_attempts);
        assert_eq!(config.stream_timeout, Duration::from_secs(120));
        assert_eq!(config.health_url(), "http://127.0.0.1:39741/health");
    }

    #[test]
    fn flag_parsing_accepts_common_truthy_values() {
        for raw in ["1", "true", "YES", " on "] {
            assert!(parse_flag(raw), "{raw}");
        }
        for raw in ["0", "false", "", "enabled"] {
            assert!(!parse_flag(raw), "{raw}");
        }
    }
}
