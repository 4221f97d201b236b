// Backend endpoints
pub const DEFAULT_API_URL: &str = "http://localhost:3000/api/v1";
pub const API_PATH_SUFFIX: &str = "/api/v1";
pub const SOCKET_PATH: &str = "ws";

// Request gateway
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

// Connection manager backoff
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 1_000;
pub const DEFAULT_RECONNECT_DELAY_MAX_MS: u64 = 5_000;
pub const DEFAULT_RECONNECT_JITTER: f64 = 0.5;

// Typing indicators
pub const DEFAULT_TYPING_IDLE_MS: u64 = 1_000;
pub const DEFAULT_REMOTE_TYPING_TTL_MS: u64 = 5_000;

// Cache change notifications
pub const CACHE_EVENT_CAPACITY: usize = 256;
