mod binary;
mod manager;
mod ports;

use std::fmt;
use std::path::PathBuf;

use fleet_config::{HostAddr, LaunchOptions};
use serde::Serialize;

use crate::admin::BoxFuture;
use crate::error::Result;

pub use binary::BinaryLauncher;
pub use manager::ProcessManager;
pub use ports::PortAllocator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ProcessId(pub u64);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessRole {
    Server,
    Router,
    Bridge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Starting,
    Running,
    Stopped,
    /// Exited without being asked to.
    Crashed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// SIGTERM, escalating to SIGKILL after the shutdown grace period.
    Graceful,
    /// SIGKILL right away.
    Kill,
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn code(code: i32) -> Self {
        Self { code: Some(code), signal: None }
    }

    pub fn signal(signal: i32) -> Self {
        Self { code: None, signal: Some(signal) }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(sig)) => write!(f, "killed by signal {sig}"),
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}

/// Identity of one managed process. Only meaningful to the
/// [`ProcessManager`] that issued it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcessHandle {
    pub(crate) id: ProcessId,
    pub(crate) manager: u64,
    pub(crate) name: String,
    pub(crate) role: ProcessRole,
    pub(crate) addr: HostAddr,
    pub(crate) dbpath: Option<PathBuf>,
}

impl ProcessHandle {
    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> ProcessRole {
        self.role
    }

    pub fn addr(&self) -> &HostAddr {
        &self.addr
    }

    pub fn dbpath(&self) -> Option<&std::path::Path> {
        self.dbpath.as_deref()
    }
}

impl fmt::Display for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.addr)
    }
}

/// Everything needed to exec one process.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub name: String,
    pub role: ProcessRole,
    pub binary: PathBuf,
    pub addr: HostAddr,
    pub dbpath: Option<PathBuf>,
    pub options: LaunchOptions,
    pub log_path: PathBuf,
}

impl LaunchSpec {
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec!["--port".to_owned(), self.addr.port.to_string()];
        if self.role != ProcessRole::Bridge {
            args.push("--bind_ip".to_owned());
            args.push(self.addr.host.clone());
        }
        if let Some(dbpath) = &self.dbpath {
            args.push("--dbpath".to_owned());
            args.push(dbpath.display().to_string());
        }
        args.extend(self.options.to_args());
        args
    }
}

/// What to start. Build with [`StartRequest::server`], [`router`](StartRequest::router)
/// or [`bridge`](StartRequest::bridge).
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub name: String,
    pub role: ProcessRole,
    /// Fixed port, or `None` to allocate one.
    pub port: Option<u16>,
    /// Data directory override for servers.
    pub dbpath: Option<PathBuf>,
    pub options: LaunchOptions,
    /// Wipe the data directory before starting.
    pub clean_data: bool,
    /// Block until the process answers `ping`.
    pub wait_for_ready: bool,
}

impl StartRequest {
    pub fn server(name: impl Into<String>) -> Self {
        Self::new(name, ProcessRole::Server)
    }

    pub fn router(name: impl Into<String>, configdb: &str) -> Self {
        let mut req = Self::new(name, ProcessRole::Router);
        req.options.insert("configdb", configdb);
        req
    }

    /// A bridge listening on its own port and forwarding to `dest`.
    pub fn bridge(name: impl Into<String>, dest: &HostAddr) -> Self {
        let mut req = Self::new(name, ProcessRole::Bridge);
        req.options.insert("dest", dest.to_string());
        req
    }

    fn new(name: impl Into<String>, role: ProcessRole) -> Self {
        Self {
            name: name.into(),
            role,
            port: None,
            dbpath: None,
            options: LaunchOptions::new(),
            clean_data: false,
            wait_for_ready: true,
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn dbpath(mut self, dbpath: impl Into<PathBuf>) -> Self {
        self.dbpath = Some(dbpath.into());
        self
    }

    pub fn options(mut self, options: &LaunchOptions) -> Self {
        self.options = self.options.merged(options);
        self
    }

    pub fn option(mut self, name: &str, value: impl Into<String>) -> Self {
        self.options.insert(name, value);
        self
    }

    pub fn clean_data(mut self, clean: bool) -> Self {
        self.clean_data = clean;
        self
    }

    /// Return as soon as the process is spawned; finish with
    /// [`ProcessManager::await_ready`].
    pub fn no_wait(mut self) -> Self {
        self.wait_for_ready = false;
        self
    }
}

#[derive(Debug, Clone)]
pub struct RestartOptions {
    /// Applied over the options the process was last started with.
    pub options: LaunchOptions,
    /// Reuse the data directory instead of wiping it.
    pub preserve_data: bool,
}

impl Default for RestartOptions {
    fn default() -> Self {
        Self { options: LaunchOptions::new(), preserve_data: true }
    }
}

impl RestartOptions {
    pub fn wipe_data() -> Self {
        Self { preserve_data: false, ..Self::default() }
    }

    pub fn option(mut self, name: &str, value: impl Into<String>) -> Self {
        self.options.insert(name, value);
        self
    }
}

/// Spawns processes. The real implementation execs binaries; tests use an
/// in-memory fleet.
pub trait Launcher: Send + Sync {
    fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn ServerProcess>>;
}

/// A running (or exited) child process.
pub trait ServerProcess: Send + Sync {
    fn pid(&self) -> Option<u32>;

    /// Deliver SIGTERM or SIGKILL. Signalling an exited process is not an error.
    fn signal(&self, signal: StopSignal) -> Result<()>;

    /// Non-blocking exit check.
    fn try_wait(&self) -> Result<Option<ExitInfo>>;

    /// Wait for the process to exit.
    fn wait(&mut self) -> BoxFuture<'_, Result<ExitInfo>>;

    /// The last `lines` lines of output.
    fn output_tail(&self, lines: usize) -> Vec<String>;
}
