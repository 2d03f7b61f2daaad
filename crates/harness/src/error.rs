use std::time::Duration;

use fleet_config::{ConfigError, HostAddr, WaitError, WaitTimeout};

use crate::admin::AdminError;
use crate::process::ExitInfo;

/// Errors from the harness. Timeout-class variants carry the last observed
/// snapshot so a failed wait can be diagnosed from the error alone.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("{name} ({addr}) did not accept connections within {waited:?}: {last_error}")]
    StartupTimeout {
        name: String,
        addr: HostAddr,
        waited: Duration,
        last_error: String,
        output: Vec<String>,
    },

    #[error("port {port} on {host} is already in use")]
    PortInUse { host: String, port: u16 },

    #[error("no free ports left in {start}..={end}")]
    PortExhaustion { start: u16, end: u16 },

    #[error("restart of {name} failed: {reason}")]
    RestartFailed { name: String, reason: String },

    #[error("process not found: {name}")]
    ProcessNotFound { name: String },

    #[error("{name} exited unexpectedly ({exit})")]
    UnexpectedExit { name: String, exit: ExitInfo, output: Vec<String> },

    #[error("failed to spawn {name}: {message}")]
    Spawn { name: String, message: String },

    #[error("invalid topology: {0}")]
    InvalidTopology(#[from] ConfigError),

    #[error("replica set {set} did not finish initiating within {waited:?}: {snapshot}")]
    InitiateTimeout { set: String, waited: Duration, snapshot: String },

    #[error("replication in {set} did not catch up within {waited:?}: {snapshot}")]
    ReplicationLagTimeout { set: String, waited: Duration, snapshot: String },

    #[error("no new primary elected in {set} to replace {old_primary}: {snapshot}")]
    NoNewPrimaryElected { set: String, old_primary: String, snapshot: String },

    #[error("reconfig of {set} rejected: {reason}")]
    ReconfigRejected { set: String, reason: String },

    #[error("shard {shard} was not registered: {reason}")]
    ShardRegistrationFailed { shard: String, reason: String },

    #[error(transparent)]
    WaitTimeoutExceeded(#[from] WaitTimeout),

    #[error("{name} has no bridge; network faults need a bridged topology")]
    BridgeRequired { name: String },

    #[error("replica set {set} has no member {id}")]
    MemberNotFound { set: String, id: u32 },

    #[error("unknown shard: {name}")]
    UnknownShard { name: String },

    #[error("replica set {set} has been torn down")]
    TornDown { set: String },

    #[error("parallel action {name} failed: {message}")]
    Parallel { name: String, message: String },

    #[error(transparent)]
    Admin(#[from] AdminError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl HarnessError {
    /// A bounded wait expired.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            HarnessError::StartupTimeout { .. }
                | HarnessError::InitiateTimeout { .. }
                | HarnessError::ReplicationLagTimeout { .. }
                | HarnessError::NoNewPrimaryElected { .. }
                | HarnessError::WaitTimeoutExceeded(_)
        )
    }

    /// The last observed state carried by timeout-class errors.
    pub fn snapshot(&self) -> Option<&str> {
        match self {
            HarnessError::StartupTimeout { last_error, .. } => Some(last_error),
            HarnessError::InitiateTimeout { snapshot, .. }
            | HarnessError::ReplicationLagTimeout { snapshot, .. }
            | HarnessError::NoNewPrimaryElected { snapshot, .. } => Some(snapshot),
            HarnessError::WaitTimeoutExceeded(t) => t.last_observed.as_deref(),
            _ => None,
        }
    }
}

impl<E: Into<HarnessError>> From<WaitError<E>> for HarnessError {
    fn from(err: WaitError<E>) -> Self {
        match err {
            WaitError::Timeout(t) => HarnessError::WaitTimeoutExceeded(t),
            WaitError::Aborted(e) => e.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, HarnessError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_expose_snapshots() {
        let err = HarnessError::ReplicationLagTimeout {
            set: "rs0".into(),
            waited: Duration::from_secs(1),
            snapshot: "rs0-1 at {ts: 3, t: 1}".into(),
        };
        assert!(err.is_timeout());
        assert_eq!(err.snapshot(), Some("rs0-1 at {ts: 3, t: 1}"));

        let wait = HarnessError::from(WaitTimeout {
            what: "x".into(),
            elapsed: Duration::from_secs(1),
            attempts: 3,
            last_observed: Some("no primary".into()),
        });
        assert!(wait.is_timeout());
        assert_eq!(wait.snapshot(), Some("no primary"));
    }

    #[test]
    fn process_errors_are_not_timeouts() {
        let err = HarnessError::PortInUse { host: "127.0.0.1".into(), port: 20000 };
        assert!(!err.is_timeout());
        assert_eq!(err.snapshot(), None);
        assert_eq!(err.to_string(), "port 20000 on 127.0.0.1 is already in use");
    }
}
