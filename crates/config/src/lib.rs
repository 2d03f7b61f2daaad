#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod env;
mod error;
mod types;
mod validate;
pub mod wait;

pub use error::{ConfigError, Result};
pub use types::*;
pub use wait::{Check, WaitError, WaitTimeout, wait_until};

/// Parse an HCL topology file into fully validated topologies.
pub fn parse(input: &str) -> Result<TopologyFile> {
    let raw = parse_raw(input)?;
    validate::resolve(raw)
}

/// Parse an HCL topology file into raw (unvalidated) structs.
pub fn parse_raw(input: &str) -> Result<RawTopologyFile> {
    hcl::from_str(input).map_err(|e| ConfigError::Parse(e.to_string()))
}
