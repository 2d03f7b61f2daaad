use fleet_config::ConfigError;
use fleet_harness::{AdminError, HarnessError};

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// The topology file did not parse or validate.
    #[error("invalid topology:\n{0}")]
    Topology(ConfigError),

    /// Nothing answered at the address.
    #[error("{address} unreachable: {message}")]
    Unreachable { address: String, message: String },

    /// A wait or command ran out of time.
    #[error("{0}")]
    Timeout(String),

    /// The harness or the server refused.
    #[error("{0}")]
    Harness(HarnessError),

    #[error("{0}")]
    Io(#[from] std::io::Error),

    /// Argument validation errors.
    #[error("{0}")]
    Arg(String),
}

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        CliError::Topology(err)
    }
}

impl From<AdminError> for CliError {
    fn from(err: AdminError) -> Self {
        match err {
            AdminError::Unreachable { addr, message } => {
                CliError::Unreachable { address: addr.to_string(), message }
            }
            AdminError::Timeout { .. } => CliError::Timeout(err.to_string()),
            other => CliError::Harness(HarnessError::Admin(other)),
        }
    }
}

impl From<HarnessError> for CliError {
    fn from(err: HarnessError) -> Self {
        match err {
            HarnessError::Admin(e) => e.into(),
            HarnessError::InvalidTopology(e) => CliError::Topology(e),
            HarnessError::Io(e) => CliError::Io(e),
            e if e.is_timeout() => CliError::Timeout(e.to_string()),
            e => CliError::Harness(e),
        }
    }
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Topology(_) | CliError::Harness(_) => 1,
            CliError::Unreachable { .. } => 2,
            CliError::Timeout(_) => 3,
            CliError::Io(_) => 4,
            CliError::Arg(_) => 64, // EX_USAGE
        }
    }
}
