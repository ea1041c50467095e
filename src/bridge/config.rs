//! Bridge configuration with environment-variable overrides.
//!
//! Every tunable resolves through the same three tiers:
//!
//! 1. **Parameter** - explicit tool-call argument (highest priority)
//! 2. **Environment variable** - `TERMBRIDGE_*`
//! 3. **Default** - built-in value
//!
//! Invalid environment values fall through to the default.
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `TERMBRIDGE_DEFAULT_TIMEOUT` | 10s | Synchronous wait window for execute_command |
//! | `TERMBRIDGE_MAX_TIMEOUT` | 3600s | Per-command deadline (interrupt + timeout status) |
//! | `TERMBRIDGE_PROMPT_GRACE_MS` | 300ms | Quiescence window after a prompt match |
//! | `TERMBRIDGE_FORCE_GRACE_MS` | 2000ms | Secondary grace before a forced boundary |
//! | `TERMBRIDGE_MAX_HISTORY` | 50 | Retained terminal command records |
//! | `TERMBRIDGE_BUFFER_MAX_BYTES` | 8 MiB | Per-command buffer ceiling |
//! | `TERMBRIDGE_VIEWER_QUEUE` | 256 | Frames buffered per viewer before lag counting |
//! | `TERMBRIDGE_VIEWER_LAG_LIMIT` | 8 | Dropped frames before a viewer is disconnected |
//! | `TERMBRIDGE_CONNECT_TIMEOUT` | 30s | SSH connect timeout |
//! | `TERMBRIDGE_KEEPALIVE` | 30s | SSH keepalive interval |
//! | `TERMBRIDGE_MAX_RETRIES` | 3 | Connect retry attempts |
//! | `TERMBRIDGE_RETRY_DELAY_MS` | 1000ms | Initial connect retry delay |

use std::env;
use std::time::Duration;

pub(crate) const DEFAULT_TIMEOUT_SECS: u64 = 10;
pub(crate) const DEFAULT_MAX_TIMEOUT_SECS: u64 = 3600;
pub(crate) const DEFAULT_PROMPT_GRACE_MS: u64 = 300;
pub(crate) const DEFAULT_FORCE_GRACE_MS: u64 = 2000;
pub(crate) const DEFAULT_MAX_HISTORY: usize = 50;
pub(crate) const DEFAULT_BUFFER_MAX_BYTES: usize = 8 * 1024 * 1024;
pub(crate) const DEFAULT_VIEWER_QUEUE: usize = 256;
pub(crate) const DEFAULT_VIEWER_LAG_LIMIT: u32 = 8;
pub(crate) const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;
pub(crate) const DEFAULT_KEEPALIVE_SECS: u64 = 30;
pub(crate) const DEFAULT_MAX_RETRIES: u32 = 3;
pub(crate) const DEFAULT_RETRY_DELAY_MS: u64 = 1000;

/// Maximum connect retry delay cap.
pub(crate) const MAX_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Auto-mode line thresholds per command class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassThresholds {
    pub install: usize,
    pub file_listing: usize,
    pub log_search: usize,
    pub generic: usize,
}

impl Default for ClassThresholds {
    fn default() -> Self {
        Self {
            install: 100,
            file_listing: 50,
            log_search: 50,
            generic: 50,
        }
    }
}

/// Head/tail line counts for preview truncation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Truncation {
    pub head_lines: usize,
    pub tail_lines: usize,
}

impl Default for Truncation {
    fn default() -> Self {
        Self {
            head_lines: 30,
            tail_lines: 20,
        }
    }
}

/// All core tunables, resolved once at startup.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Default synchronous wait window for execute_command.
    pub default_timeout: Duration,
    /// Hard per-command deadline; expiry interrupts the shell.
    pub max_timeout: Duration,
    /// Quiescence window after the detector matches the prompt.
    pub prompt_grace: Duration,
    /// Secondary grace before forcing a boundary after interrupt.
    pub force_grace: Duration,
    /// Terminal records retained beyond any still in flight.
    pub max_history: usize,
    /// Per-command buffer ceiling before middle elision.
    pub buffer_max_bytes: usize,
    /// Auto-mode thresholds per command class.
    pub thresholds: ClassThresholds,
    /// Preview head/tail line counts.
    pub truncation: Truncation,
    /// Outbound frames buffered per viewer.
    pub viewer_queue_capacity: usize,
    /// Dropped frames tolerated before a viewer is disconnected.
    pub viewer_lag_limit: u32,
    /// SSH connect timeout.
    pub connect_timeout: Duration,
    /// SSH keepalive interval.
    pub keepalive_interval: Duration,
    /// Connect retry attempts for transient failures.
    pub max_retries: u32,
    /// Initial connect retry delay (exponential backoff from here).
    pub retry_delay: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_timeout: Duration::from_secs(DEFAULT_MAX_TIMEOUT_SECS),
            prompt_grace: Duration::from_millis(DEFAULT_PROMPT_GRACE_MS),
            force_grace: Duration::from_millis(DEFAULT_FORCE_GRACE_MS),
            max_history: DEFAULT_MAX_HISTORY,
            buffer_max_bytes: DEFAULT_BUFFER_MAX_BYTES,
            thresholds: ClassThresholds::default(),
            truncation: Truncation::default(),
            viewer_queue_capacity: DEFAULT_VIEWER_QUEUE,
            viewer_lag_limit: DEFAULT_VIEWER_LAG_LIMIT,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            keepalive_interval: Duration::from_secs(DEFAULT_KEEPALIVE_SECS),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
        }
    }
}

impl BridgeConfig {
    /// Build a configuration from environment variables over defaults.
    pub fn from_env() -> Self {
        Self {
            default_timeout: Duration::from_secs(env_u64(
                "TERMBRIDGE_DEFAULT_TIMEOUT",
                DEFAULT_TIMEOUT_SECS,
            )),
            max_timeout: Duration::from_secs(env_u64(
                "TERMBRIDGE_MAX_TIMEOUT",
                DEFAULT_MAX_TIMEOUT_SECS,
            )),
            prompt_grace: Duration::from_millis(env_u64(
                "TERMBRIDGE_PROMPT_GRACE_MS",
                DEFAULT_PROMPT_GRACE_MS,
            )),
            force_grace: Duration::from_millis(env_u64(
                "TERMBRIDGE_FORCE_GRACE_MS",
                DEFAULT_FORCE_GRACE_MS,
            )),
            max_history: env_u64("TERMBRIDGE_MAX_HISTORY", DEFAULT_MAX_HISTORY as u64) as usize,
            buffer_max_bytes: env_u64(
                "TERMBRIDGE_BUFFER_MAX_BYTES",
                DEFAULT_BUFFER_MAX_BYTES as u64,
            ) as usize,
            thresholds: ClassThresholds::default(),
            truncation: Truncation::default(),
            viewer_queue_capacity: env_u64("TERMBRIDGE_VIEWER_QUEUE", DEFAULT_VIEWER_QUEUE as u64)
                as usize,
            viewer_lag_limit: env_u64(
                "TERMBRIDGE_VIEWER_LAG_LIMIT",
                DEFAULT_VIEWER_LAG_LIMIT as u64,
            ) as u32,
            connect_timeout: Duration::from_secs(env_u64(
                "TERMBRIDGE_CONNECT_TIMEOUT",
                DEFAULT_CONNECT_TIMEOUT_SECS,
            )),
            keepalive_interval: Duration::from_secs(env_u64(
                "TERMBRIDGE_KEEPALIVE",
                DEFAULT_KEEPALIVE_SECS,
            )),
            max_retries: env_u64("TERMBRIDGE_MAX_RETRIES", DEFAULT_MAX_RETRIES as u64) as u32,
            retry_delay: Duration::from_millis(env_u64(
                "TERMBRIDGE_RETRY_DELAY_MS",
                DEFAULT_RETRY_DELAY_MS,
            )),
        }
    }

    /// Resolve the synchronous wait window: parameter, capped by the
    /// per-command maximum.
    pub fn resolve_wait_timeout(&self, timeout_param: Option<u64>) -> Duration {
        let secs = timeout_param.unwrap_or(self.default_timeout.as_secs());
        Duration::from_secs(secs.min(self.max_timeout.as_secs()))
    }

    /// Resolve the SSH connect timeout: parameter over configured value.
    pub fn resolve_connect_timeout(&self, timeout_param: Option<u64>) -> Duration {
        timeout_param
            .map(Duration::from_secs)
            .unwrap_or(self.connect_timeout)
    }
}

fn env_u64(var: &str, default: u64) -> u64 {
    if let Ok(raw) = env::var(var)
        && let Ok(value) = raw.parse::<u64>()
    {
        return value;
    }
    default
}
