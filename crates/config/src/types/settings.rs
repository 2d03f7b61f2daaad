use std::path::PathBuf;

use super::data_dir::DataDir;

pub const DEFAULT_PORT_RANGE: (u16, u16) = (20000, 29999);

/// Where the harness puts things and which binaries it launches.
#[derive(Debug, Clone, PartialEq)]
pub struct HarnessSettings {
    pub data_dir: DataDir,
    /// Interface every process binds and advertises.
    pub host: String,
    pub server_bin: PathBuf,
    pub router_bin: PathBuf,
    pub bridge_bin: PathBuf,
    /// Inclusive range ports are allocated from.
    pub port_range: (u16, u16),
}

impl HarnessSettings {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self { data_dir: DataDir::new(data_dir), ..Self::default() }
    }

    pub fn port_range(mut self, start: u16, end: u16) -> Self {
        self.port_range = (start, end);
        self
    }

    pub fn binaries(
        mut self,
        server: impl Into<PathBuf>,
        router: impl Into<PathBuf>,
        bridge: impl Into<PathBuf>,
    ) -> Self {
        self.server_bin = server.into();
        self.router_bin = router.into();
        self.bridge_bin = bridge.into();
        self
    }
}

impl Default for HarnessSettings {
    fn default() -> Self {
        Self {
            data_dir: DataDir::default(),
            host: "127.0.0.1".to_owned(),
            server_bin: PathBuf::from("fleet-server"),
            router_bin: PathBuf::from("fleet-router"),
            bridge_bin: PathBuf::from("fleet-bridge"),
            port_range: DEFAULT_PORT_RANGE,
        }
    }
}
