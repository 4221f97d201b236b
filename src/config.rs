//! Client configuration module
//! Handles backend endpoints, timeouts and reconnection parameters

use crate::constants::{
    API_PATH_SUFFIX, DEFAULT_API_URL, DEFAULT_MAX_RECONNECT_ATTEMPTS,
    DEFAULT_RECONNECT_DELAY_MAX_MS, DEFAULT_RECONNECT_DELAY_MS, DEFAULT_RECONNECT_JITTER,
    DEFAULT_REMOTE_TYPING_TTL_MS, DEFAULT_REQUEST_TIMEOUT_SECS, DEFAULT_TYPING_IDLE_MS,
    SOCKET_PATH,
};
use crate::error::{Result, SyncError};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Backoff parameters for the push channel
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Reconnect attempts before the connection is declared failed
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Random spread applied to each delay, 0.0 disables it
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MAX_MS),
            jitter: DEFAULT_RECONNECT_JITTER,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based), without jitter
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << exponent);
        delay.min(self.max_delay)
    }

    /// Delay before reconnect attempt `attempt`, with jitter applied
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.base_delay_for(attempt);
        if self.jitter <= 0.0 {
            return delay;
        }

        let spread = rand::random::<f64>() * self.jitter * delay.as_secs_f64();
        let jittered = if rand::random::<bool>() {
            delay.as_secs_f64() + spread
        } else {
            (delay.as_secs_f64() - spread).max(0.0)
        };
        Duration::from_secs_f64(jittered).min(self.max_delay)
    }
}

/// Client configuration parameters
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the request/response API, e.g. `http://host/api/v1`
    pub api_url: Url,
    /// URL of the push channel
    pub socket_url: Url,
    /// Per-request timeout enforced by the gateway
    pub request_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    /// Quiet period after the last keystroke before `stop_typing` is sent
    pub typing_idle: Duration,
    /// How long a remote typing indicator lives without a refresh
    pub remote_typing_ttl: Duration,
    /// File used to persist credentials (in-memory when unset)
    pub credentials_path: Option<PathBuf>,
}

impl ClientConfig {
    /// Build a configuration for the given API URL with default settings
    pub fn with_api_url(api_url: &str) -> Result<Self> {
        let api_url = parse_url(api_url, "API")?;
        let socket_url = derive_socket_url(&api_url)?;

        Ok(Self {
            api_url,
            socket_url,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            reconnect: ReconnectPolicy::default(),
            typing_idle: Duration::from_millis(DEFAULT_TYPING_IDLE_MS),
            remote_typing_ttl: Duration::from_millis(DEFAULT_REMOTE_TYPING_TTL_MS),
            credentials_path: None,
        })
    }

    /// Load configuration from environment variables if available
    pub fn from_env() -> Result<Self> {
        let api_url = env::var("RUSTY_SYNC_API_URL").unwrap_or(DEFAULT_API_URL.to_string());
        let mut config = Self::with_api_url(&api_url)?;

        if let Ok(socket_url) = env::var("RUSTY_SYNC_SOCKET_URL") {
            config.socket_url = parse_url(&socket_url, "socket")?;
            match config.socket_url.scheme() {
                "ws" | "wss" => {}
                other => {
                    return Err(SyncError::ConfigError(format!(
                        "Socket URL must use ws or wss, got '{}'",
                        other
                    )))
                }
            }
        }

        config.request_timeout = Duration::from_secs(env_or(
            "RUSTY_SYNC_REQUEST_TIMEOUT_SECS",
            DEFAULT_REQUEST_TIMEOUT_SECS,
        ));

        config.reconnect = ReconnectPolicy {
            max_attempts: env_or(
                "RUSTY_SYNC_MAX_RECONNECT_ATTEMPTS",
                DEFAULT_MAX_RECONNECT_ATTEMPTS,
            ),
            base_delay: Duration::from_millis(env_or(
                "RUSTY_SYNC_RECONNECT_DELAY_MS",
                DEFAULT_RECONNECT_DELAY_MS,
            )),
            max_delay: Duration::from_millis(env_or(
                "RUSTY_SYNC_RECONNECT_DELAY_MAX_MS",
                DEFAULT_RECONNECT_DELAY_MAX_MS,
            )),
            jitter: env_or("RUSTY_SYNC_RECONNECT_JITTER", DEFAULT_RECONNECT_JITTER),
        };

        config.typing_idle = Duration::from_millis(env_or(
            "RUSTY_SYNC_TYPING_IDLE_MS",
            DEFAULT_TYPING_IDLE_MS,
        ));
        config.remote_typing_ttl = Duration::from_millis(env_or(
            "RUSTY_SYNC_REMOTE_TYPING_TTL_MS",
            DEFAULT_REMOTE_TYPING_TTL_MS,
        ));

        config.credentials_path = env::var("RUSTY_SYNC_CREDENTIALS_PATH")
            .ok()
            .map(PathBuf::from);

        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the client misbehave
    pub fn validate(&self) -> Result<()> {
        if self.request_timeout.is_zero() {
            return Err(SyncError::ConfigError(
                "Request timeout must be greater than zero".to_string(),
            ));
        }

        if self.reconnect.max_attempts == 0 {
            return Err(SyncError::ConfigError(
                "At least one reconnect attempt is required".to_string(),
            ));
        }

        if self.reconnect.base_delay > self.reconnect.max_delay {
            return Err(SyncError::ConfigError(
                "Reconnect base delay cannot exceed the maximum delay".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.reconnect.jitter) {
            return Err(SyncError::ConfigError(
                "Reconnect jitter must be between 0.0 and 1.0".to_string(),
            ));
        }

        Ok(())
    }

    /// Resolve an endpoint path relative to the API base URL
    pub fn endpoint(&self, path: &str) -> Result<Url> {
        let mut base = self.api_url.clone();
        if !base.path().ends_with('/') {
            let with_slash = format!("{}/", base.path());
            base.set_path(&with_slash);
        }

        base.join(path.trim_start_matches('/'))
            .map_err(|e| SyncError::ConfigError(format!("Invalid endpoint '{}': {}", path, e)))
    }
}

fn parse_url(value: &str, what: &str) -> Result<Url> {
    Url::parse(value)
        .map_err(|e| SyncError::ConfigError(format!("Invalid {} URL '{}': {}", what, value, e)))
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// The push channel lives on the API host without the versioned API prefix
fn derive_socket_url(api_url: &Url) -> Result<Url> {
    let mut socket_url = api_url.clone();

    let scheme = match api_url.scheme() {
        "https" => "wss",
        "http" => "ws",
        "ws" | "wss" => api_url.scheme(),
        other => {
            return Err(SyncError::ConfigError(format!(
                "Unsupported API URL scheme '{}'",
                other
            )))
        }
    }
    .to_string();

    socket_url
        .set_scheme(&scheme)
        .map_err(|_| SyncError::ConfigError(format!("Cannot derive {} URL", scheme)))?;

    let base_path = api_url
        .path()
        .trim_end_matches('/')
        .trim_end_matches(API_PATH_SUFFIX)
        .trim_end_matches('/')
        .to_string();
    socket_url.set_path(&format!("{}/{}", base_path, SOCKET_PATH));
    socket_url.set_query(None);

    Ok(socket_url)
}
