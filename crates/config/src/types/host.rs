use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A `host:port` endpoint. Serialized as the string form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HostAddr {
    pub host: String,
    pub port: u16,
}

impl HostAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }

    pub fn localhost(port: u16) -> Self {
        Self::new("127.0.0.1", port)
    }
}

impl fmt::Display for HostAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for HostAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) =
            s.rsplit_once(':').ok_or_else(|| format!("expected host:port, got '{s}'"))?;
        if host.is_empty() {
            return Err(format!("missing host in '{s}'"));
        }
        let port = port.parse::<u16>().map_err(|e| format!("invalid port in '{s}': {e}"))?;
        Ok(Self::new(host, port))
    }
}

impl TryFrom<String> for HostAddr {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<HostAddr> for String {
    fn from(addr: HostAddr) -> Self {
        addr.to_string()
    }
}
