use std::sync::OnceLock;
use std::time::Duration;

/// Default bound for convergence waits that don't name their own timeout.
pub fn default_timeout() -> Duration {
    *DEFAULT_TIMEOUT.get_or_init(|| read_ms("FLEET_DEFAULT_TIMEOUT_MS", 60000))
}

pub fn poll_interval() -> Duration {
    *POLL_INTERVAL.get_or_init(|| read_ms("FLEET_POLL_INTERVAL_MS", 200))
}

/// How long a freshly launched process has to answer `ping`.
pub fn startup_timeout() -> Duration {
    *STARTUP_TIMEOUT.get_or_init(|| read_ms("FLEET_STARTUP_TIMEOUT_MS", 30000))
}

/// Grace period between SIGTERM and the SIGKILL escalation.
pub fn shutdown_grace() -> Duration {
    *SHUTDOWN_GRACE.get_or_init(|| read_ms("FLEET_SHUTDOWN_GRACE_MS", 10000))
}

pub fn admin_timeout() -> Duration {
    *ADMIN_TIMEOUT.get_or_init(|| read_ms("FLEET_ADMIN_TIMEOUT_MS", 5000))
}

pub fn status_log_interval() -> Duration {
    *STATUS_LOG_INTERVAL.get_or_init(|| read_ms("FLEET_STATUS_LOG_INTERVAL_MS", 5000))
}

/// Pre-populate all OnceLocks with fast test values.
///
/// Must be called before any accessor is used. Uses `OnceLock::get_or_init`
/// semantics: if called first, env vars are never read.
pub fn init_test_defaults() {
    DEFAULT_TIMEOUT.get_or_init(|| Duration::from_secs(10));
    POLL_INTERVAL.get_or_init(|| Duration::from_millis(20));
    STARTUP_TIMEOUT.get_or_init(|| Duration::from_secs(3));
    SHUTDOWN_GRACE.get_or_init(|| Duration::from_millis(500));
    ADMIN_TIMEOUT.get_or_init(|| Duration::from_secs(1));
    STATUS_LOG_INTERVAL.get_or_init(|| Duration::from_secs(1));
}

static DEFAULT_TIMEOUT: OnceLock<Duration> = OnceLock::new();
static POLL_INTERVAL: OnceLock<Duration> = OnceLock::new();
static STARTUP_TIMEOUT: OnceLock<Duration> = OnceLock::new();
static SHUTDOWN_GRACE: OnceLock<Duration> = OnceLock::new();
static ADMIN_TIMEOUT: OnceLock<Duration> = OnceLock::new();
static STATUS_LOG_INTERVAL: OnceLock<Duration> = OnceLock::new();

fn read_ms(var: &str, default: u64) -> Duration {
    match std::env::var(var) {
        Ok(val) => Duration::from_millis(val.parse().unwrap_or(default)),
        Err(_) => Duration::from_millis(default),
    }
}
