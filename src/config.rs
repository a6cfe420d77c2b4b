//! Environment-driven configuration.
//!
//! Every section reads its values from environment variables at startup
//! (after `dotenvy` has loaded `.env`) and falls back to defaults chosen to
//! match a 30-second heartbeat interval: the liveness timeout is three
//! missed heartbeats.

use std::time::Duration;

/// Registry Store (Postgres) settings.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    url: String,
    pub pool_size: usize,
}

impl DatabaseConfig {
    pub fn from_env() -> Self {
        Self {
            url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost/roost".to_string()),
            pool_size: env_usize("DATABASE_POOL_SIZE", 8),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Stale worker sweep settings.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// How often the sweep runs.
    pub sweep_interval: Duration,
    /// A worker whose last heartbeat is older than this is stale.
    pub liveness_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
            liveness_timeout: Duration::from_secs(90),
        }
    }
}

impl MonitorConfig {
    pub fn from_env() -> Self {
        Self {
            sweep_interval: env_duration_secs("MONITOR_SWEEP_INTERVAL_SECS", 60),
            liveness_timeout: env_duration_secs("MONITOR_LIVENESS_TIMEOUT_SECS", 90),
        }
    }
}

/// Worker-side heartbeat settings.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Interval between heartbeat pushes.
    pub interval: Duration,
    /// Consecutive failures before the loop escalates its log level.
    pub failure_warn_threshold: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            failure_warn_threshold: 3,
        }
    }
}

impl HeartbeatConfig {
    pub fn from_env() -> Self {
        Self {
            interval: env_duration_secs("HEARTBEAT_INTERVAL_SECS", 30),
            failure_warn_threshold: env_u32("HEARTBEAT_FAILURE_WARN_THRESHOLD", 3),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

/// Worker-side startup recovery settings.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Budget for the whole recovery pass before the worker starts serving.
    pub startup_timeout: Duration,
    /// Per-call deadline for registrar and protocol calls.
    pub call_timeout: Duration,
    /// Maximum concurrent resume attempts.
    pub concurrency: usize,
    /// Abort worker startup when the registrar is unreachable instead of
    /// continuing with no recovered sessions.
    pub abort_on_unreachable: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(120),
            call_timeout: Duration::from_secs(10),
            concurrency: 4,
            abort_on_unreachable: false,
        }
    }
}

impl RecoveryConfig {
    pub fn from_env() -> Self {
        Self {
            startup_timeout: env_duration_secs("RECOVERY_STARTUP_TIMEOUT_SECS", 120),
            call_timeout: env_duration_secs("RECOVERY_CALL_TIMEOUT_SECS", 10),
            concurrency: env_usize("RECOVERY_CONCURRENCY", 4),
            abort_on_unreachable: env_bool("RECOVERY_ABORT_ON_UNREACHABLE", false),
        }
    }
}

/// Backend API server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 7070,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self {
            host: std::env::var("ROOST_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env_u16("ROOST_PORT", 7070),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub monitor: MonitorConfig,
    pub heartbeat: HeartbeatConfig,
    pub recovery: RecoveryConfig,
    pub server: ServerConfig,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            database: DatabaseConfig::from_env(),
            monitor: MonitorConfig::from_env(),
            heartbeat: HeartbeatConfig::from_env(),
            recovery: RecoveryConfig::from_env(),
            server: ServerConfig::from_env(),
        }
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

fn env_duration_secs(key: &str, default: u64) -> Duration {
    Duration::from_secs(
        std::env::var(key)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default),
    )
}
