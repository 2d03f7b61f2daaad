/// Errors that can occur when parsing or validating a topology.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// HCL parse error.
    #[error("parse error: {0}")]
    Parse(String),
    /// A field has an invalid value (e.g. bad duration or host address).
    #[error("{path}: {message}")]
    InvalidField { path: String, message: String },
    /// The topology violates a replica set constraint (e.g. arbiter with priority).
    #[error("{path}: {message}")]
    InvalidTopology { path: String, message: String },
    /// Multiple errors collected during validation.
    #[error("{}", display_multiple(.0))]
    Multiple(Vec<ConfigError>),
}

impl ConfigError {
    /// Flatten into individual errors.
    pub fn into_vec(self) -> Vec<ConfigError> {
        match self {
            ConfigError::Multiple(errs) => errs,
            other => vec![other],
        }
    }

    /// Collapse a list of errors: `Ok` when empty, the single error, or `Multiple`.
    pub fn collect(mut errors: Vec<ConfigError>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::Multiple(errors)),
        }
    }
}

fn display_multiple(errors: &[ConfigError]) -> String {
    errors.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("\n")
}

pub type Result<T> = std::result::Result<T, ConfigError>;
