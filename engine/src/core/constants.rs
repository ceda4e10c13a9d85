// =============================================================================
// Application Identity
// =============================================================================

/// Application name in lowercase (for paths and identifiers)
pub const APP_NAME_LOWER: &str = "storewatch";

/// Unix-style dotfile folder name
pub const APP_DOT_FOLDER: &str = ".storewatch";

// =============================================================================
// Configuration Files
// =============================================================================

/// Config file name
pub const CONFIG_FILE_NAME: &str = "storewatch.json";

/// Environment variable for config file path
pub const ENV_CONFIG: &str = "STOREWATCH_CONFIG";

// =============================================================================
// Environment Variables
// =============================================================================

/// Environment variable for log level/filter
pub const ENV_LOG: &str = "STOREWATCH_LOG";

/// Environment variable for the backend base URL
pub const ENV_URL: &str = "STOREWATCH_URL";

/// Environment variable for the backend API key
pub const ENV_API_KEY: &str = "STOREWATCH_API_KEY";

/// Environment variable for the scope (store/tenant) to watch
pub const ENV_SCOPE: &str = "STOREWATCH_SCOPE";

/// Environment variable for the fetch timeout in seconds
pub const ENV_TIMEOUT_SECS: &str = "STOREWATCH_TIMEOUT_SECS";

/// Environment variable for the default time range (1h, 24h, 7d)
pub const ENV_TIME_RANGE: &str = "STOREWATCH_TIME_RANGE";

/// Environment variable for the source filter
pub const ENV_SOURCE: &str = "STOREWATCH_SOURCE";

/// Environment variable for the agent filter
pub const ENV_AGENT: &str = "STOREWATCH_AGENT";

// =============================================================================
// Backend Defaults
// =============================================================================

/// Default backend base URL
pub const DEFAULT_URL: &str = "http://127.0.0.1:5388/api/v1";

/// Default bound on a single fetch (seconds)
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Connect timeout for the HTTP client (seconds)
pub const HTTP_CONNECT_TIMEOUT_SECS: u64 = 5;

// =============================================================================
// Liveness Defaults
// =============================================================================

/// A session is live while it had activity within this window
pub const DEFAULT_SESSION_LIVE_SECS: u64 = 30;

/// A trace is live while it had activity within this window
pub const DEFAULT_TRACE_LIVE_SECS: u64 = 10;

/// Entities first seen on the realtime feed count as new for this long
pub const DEFAULT_ARRIVAL_GRACE_MS: u64 = 1_000;

// =============================================================================
// Comparison Defaults
// =============================================================================

/// Population window for span comparisons (hours)
pub const DEFAULT_COMPARISON_WINDOW_HOURS: u64 = 24;

/// Rank at or above which a span is flagged slow
pub const DEFAULT_SLOW_PERCENTILE: f64 = 90.0;

/// TTL of cached comparison populations (seconds)
pub const DEFAULT_COMPARISON_CACHE_TTL_SECS: u64 = 60;

/// Max cached comparison populations
pub const COMPARISON_CACHE_MAX_CAPACITY: u64 = 1_000;

/// Attempts for a comparison population fetch on transient errors
pub const COMPARISON_FETCH_ATTEMPTS: u32 = 3;

/// Base delay between comparison fetch attempts (milliseconds)
pub const COMPARISON_RETRY_BASE_MS: u64 = 200;

// =============================================================================
// Realtime Defaults
// =============================================================================

/// First resubscribe delay after a disconnect (milliseconds)
pub const DEFAULT_RECONNECT_BASE_DELAY_MS: u64 = 500;

/// Resubscribe delay cap (milliseconds)
pub const DEFAULT_RECONNECT_MAX_DELAY_MS: u64 = 30_000;

// =============================================================================
// Engine
// =============================================================================

/// Capacity of the engine command channel
pub const ENGINE_COMMAND_BUFFER: usize = 1_024;

/// Timeout for graceful shutdown of background tasks (seconds)
pub const SHUTDOWN_TIMEOUT_SECS: u64 = 5;
