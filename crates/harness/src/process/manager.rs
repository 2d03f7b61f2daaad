use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use fleet_config::{Check, HarnessSettings, HostAddr, LaunchOptions, WaitError, env, wait_until};

use super::{
    ExitInfo, LaunchSpec, Launcher, LifecycleState, PortAllocator, ProcessHandle, ProcessId,
    ProcessRole, RestartOptions, ServerProcess, StartRequest, StopSignal,
};
use crate::admin::Admin;
use crate::error::{HarnessError, Result};

/// Lines of output attached to startup errors.
const DIAGNOSTIC_LINES: usize = 20;

static NEXT_MANAGER: AtomicU64 = AtomicU64::new(1);

struct Entry {
    handle: ProcessHandle,
    spec: LaunchSpec,
    process: Option<Box<dyn ServerProcess>>,
    state: LifecycleState,
    last_exit: Option<ExitInfo>,
}

impl Entry {
    /// State with a live exit check, without recording the result.
    fn observed_state(&self) -> LifecycleState {
        match (&self.process, self.state) {
            (Some(p), LifecycleState::Starting | LifecycleState::Running) => {
                match p.try_wait() {
                    Ok(Some(_)) => LifecycleState::Crashed,
                    _ => self.state,
                }
            }
            (_, state) => state,
        }
    }
}

/// Owns every process the harness starts.
///
/// Handles are only valid with the manager that issued them. Dropping the
/// manager kills whatever is still running.
pub struct ProcessManager {
    id: u64,
    settings: HarnessSettings,
    launcher: Arc<dyn Launcher>,
    admin: Admin,
    ports: PortAllocator,
    procs: BTreeMap<ProcessId, Entry>,
    next_id: u64,
}

impl ProcessManager {
    pub fn new(settings: HarnessSettings, launcher: Arc<dyn Launcher>, admin: Admin) -> Self {
        let ports = PortAllocator::new(settings.host.clone(), settings.port_range);
        Self {
            id: NEXT_MANAGER.fetch_add(1, Ordering::Relaxed),
            settings,
            launcher,
            admin,
            ports,
            procs: BTreeMap::new(),
            next_id: 1,
        }
    }

    pub fn settings(&self) -> &HarnessSettings {
        &self.settings
    }

    pub fn admin(&self) -> &Admin {
        &self.admin
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    /// Start a process and, unless the request says otherwise, wait until it
    /// answers `ping`.
    ///
    /// A process that misses the startup timeout is killed but stays
    /// registered, so its output and exit can still be inspected. Its port
    /// is reserved until [`remove`](Self::remove) is called on the handle
    /// from [`find`](Self::find).
    pub async fn start(&mut self, req: StartRequest) -> Result<ProcessHandle> {
        let port = match req.port {
            Some(port) => {
                self.ports.reserve(&req.name, port)?;
                port
            }
            None => self.ports.allocate(&req.name)?,
        };

        let handle = match self.spawn(req.clone(), port) {
            Ok(handle) => handle,
            Err(e) => {
                self.ports.release(port);
                return Err(e);
            }
        };

        if req.wait_for_ready
            && let Err(e) = self.await_ready(&handle).await
        {
            if matches!(e, HarnessError::StartupTimeout { .. })
                && let Err(stop_err) = self.stop(&handle, StopSignal::Kill).await
            {
                tracing::warn!(
                    name = %handle.name,
                    error = %stop_err,
                    "could not kill process after startup timeout"
                );
            }
            return Err(e);
        }
        Ok(handle)
    }

    fn spawn(&mut self, req: StartRequest, port: u16) -> Result<ProcessHandle> {
        let dbpath = match req.role {
            ProcessRole::Server => Some(
                req.dbpath.unwrap_or_else(|| self.settings.data_dir.process_dir(&req.name)),
            ),
            ProcessRole::Router | ProcessRole::Bridge => None,
        };
        if let Some(dir) = &dbpath {
            if req.clean_data {
                wipe(dir)?;
            }
            std::fs::create_dir_all(dir)?;
        }

        let binary = match req.role {
            ProcessRole::Server => &self.settings.server_bin,
            ProcessRole::Router => &self.settings.router_bin,
            ProcessRole::Bridge => &self.settings.bridge_bin,
        };
        let spec = LaunchSpec {
            name: req.name.clone(),
            role: req.role,
            binary: binary.clone(),
            addr: HostAddr::new(self.settings.host.clone(), port),
            dbpath: dbpath.clone(),
            options: req.options,
            log_path: self.settings.data_dir.log_path(&req.name),
        };
        let process = self.launcher.launch(&spec)?;

        let id = ProcessId(self.next_id);
        self.next_id += 1;
        let handle = ProcessHandle {
            id,
            manager: self.id,
            name: req.name,
            role: req.role,
            addr: spec.addr.clone(),
            dbpath,
        };
        tracing::info!(
            name = %handle.name,
            role = ?handle.role,
            addr = %handle.addr,
            pid = ?process.pid(),
            "started process"
        );
        self.procs.insert(
            id,
            Entry {
                handle: handle.clone(),
                spec,
                process: Some(process),
                state: LifecycleState::Starting,
                last_exit: None,
            },
        );
        Ok(handle)
    }

    /// Poll `ping` until the process answers. Fails fast if it exits.
    pub async fn await_ready(&mut self, handle: &ProcessHandle) -> Result<()> {
        let entry = self.entry(handle)?;
        let Some(process) = entry.process.as_deref() else {
            return Err(HarnessError::ProcessNotFound { name: handle.name.clone() });
        };
        let admin = &self.admin;
        let addr = &entry.handle.addr;
        let name = entry.handle.name.as_str();

        let what = format!("{name} to accept connections");
        let outcome = wait_until(what, env::startup_timeout(), move || async move {
            if let Some(exit) = process.try_wait()? {
                return Err(HarnessError::UnexpectedExit {
                    name: name.to_owned(),
                    exit,
                    output: process.output_tail(DIAGNOSTIC_LINES),
                });
            }
            Ok(match admin.ping(addr).await {
                Ok(()) => Check::Ready(()),
                Err(e) => Check::pending(e.to_string()),
            })
        })
        .fail_fast(|e| matches!(e, HarnessError::UnexpectedExit { .. }))
        .quiet()
        .await;

        let entry = self.entry_mut(handle)?;
        match outcome {
            Ok(()) => {
                entry.state = LifecycleState::Running;
                tracing::debug!(name = %handle.name, "process ready");
                Ok(())
            }
            Err(WaitError::Aborted(e)) => {
                if let HarnessError::UnexpectedExit { exit, .. } = &e {
                    entry.last_exit = Some(*exit);
                }
                entry.state = LifecycleState::Crashed;
                Err(e)
            }
            Err(WaitError::Timeout(t)) => Err(HarnessError::StartupTimeout {
                name: handle.name.clone(),
                addr: handle.addr.clone(),
                waited: t.elapsed,
                last_error: t.last_observed.unwrap_or_default(),
                output: entry
                    .process
                    .as_ref()
                    .map(|p| p.output_tail(DIAGNOSTIC_LINES))
                    .unwrap_or_default(),
            }),
        }
    }

    /// Stop a process and reap it. Stopping a stopped process does nothing.
    pub async fn stop(&mut self, handle: &ProcessHandle, signal: StopSignal) -> Result<()> {
        let entry = self.entry_mut(handle)?;
        let Some(mut process) = entry.process.take() else {
            return Ok(());
        };

        let exit = match process.try_wait()? {
            Some(exit) => exit,
            None => match signal {
                StopSignal::Kill => {
                    process.signal(StopSignal::Kill)?;
                    process.wait().await?
                }
                StopSignal::Graceful => {
                    process.signal(StopSignal::Graceful)?;
                    let grace = env::shutdown_grace();
                    match tokio::time::timeout(grace, process.wait()).await {
                        Ok(exit) => exit?,
                        Err(_) => {
                            tracing::warn!(name = %handle.name, ?grace, "escalating to SIGKILL");
                            process.signal(StopSignal::Kill)?;
                            process.wait().await?
                        }
                    }
                }
            },
        };

        tracing::info!(name = %handle.name, %exit, "stopped process");
        entry.state = LifecycleState::Stopped;
        entry.last_exit = Some(exit);
        Ok(())
    }

    /// Stop the process if needed and start it again on the same port.
    pub async fn restart(&mut self, handle: &ProcessHandle, opts: RestartOptions) -> Result<()> {
        self.stop(handle, StopSignal::Graceful).await?;

        let launcher = Arc::clone(&self.launcher);
        let entry = self.entry_mut(handle)?;
        let name = entry.handle.name.clone();
        let failed = |reason: String| HarnessError::RestartFailed { name: name.clone(), reason };

        if let Some(dir) = &entry.spec.dbpath {
            if opts.preserve_data {
                if !dir.is_dir() {
                    return Err(failed(format!("data directory {} is missing", dir.display())));
                }
                std::fs::read_dir(dir)
                    .map_err(|e| failed(format!("data directory {}: {e}", dir.display())))?;
            } else {
                wipe(dir)
                    .and_then(|()| std::fs::create_dir_all(dir).map_err(HarnessError::from))
                    .map_err(|e| failed(e.to_string()))?;
            }
        }

        entry.spec.options = entry.spec.options.merged(&opts.options);
        let process = launcher.launch(&entry.spec).map_err(|e| failed(e.to_string()))?;
        tracing::info!(
            name = %name,
            pid = ?process.pid(),
            preserve_data = opts.preserve_data,
            "restarted process"
        );
        entry.process = Some(process);
        entry.state = LifecycleState::Starting;

        self.await_ready(handle).await.map_err(|e| match e {
            HarnessError::StartupTimeout { .. } | HarnessError::UnexpectedExit { .. } => {
                failed(e.to_string())
            }
            other => other,
        })
    }

    /// Stop everything still running. Returns the first failure, after
    /// attempting every process.
    pub async fn stop_all(&mut self, signal: StopSignal) -> Result<()> {
        let mut first_err = None;
        for handle in self.handles() {
            if let Err(e) = self.stop(&handle, signal).await {
                tracing::warn!(name = %handle.name, error = %e, "stop failed");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Forget a process: kill it if needed, release its port, and optionally
    /// delete its data directory.
    pub async fn remove(&mut self, handle: &ProcessHandle, keep_data: bool) -> Result<()> {
        self.stop(handle, StopSignal::Kill).await?;
        if let Some(entry) = self.procs.remove(&handle.id) {
            self.ports.release(entry.handle.addr.port);
            if !keep_data && let Some(dir) = &entry.handle.dbpath {
                wipe(dir)?;
            }
        }
        Ok(())
    }

    /// Current state, checking for an exit that has not been recorded yet.
    pub fn state(&self, handle: &ProcessHandle) -> Result<LifecycleState> {
        Ok(self.entry(handle)?.observed_state())
    }

    pub fn is_running(&self, handle: &ProcessHandle) -> bool {
        matches!(self.state(handle), Ok(LifecycleState::Running))
    }

    /// Record unexpected exits as `Crashed` and return the affected handles.
    pub fn refresh(&mut self) -> Vec<ProcessHandle> {
        let mut crashed = Vec::new();
        for entry in self.procs.values_mut() {
            if entry.state == LifecycleState::Crashed
                || entry.observed_state() != LifecycleState::Crashed
            {
                continue;
            }
            entry.last_exit = entry.process.as_ref().and_then(|p| p.try_wait().ok().flatten());
            tracing::warn!(
                name = %entry.handle.name,
                exit = ?entry.last_exit,
                "process exited unexpectedly"
            );
            entry.state = LifecycleState::Crashed;
            crashed.push(entry.handle.clone());
        }
        crashed
    }

    pub fn pid(&self, handle: &ProcessHandle) -> Result<Option<u32>> {
        Ok(self.entry(handle)?.process.as_ref().and_then(|p| p.pid()))
    }

    /// The options the process was last launched with.
    pub fn options(&self, handle: &ProcessHandle) -> Result<&LaunchOptions> {
        Ok(&self.entry(handle)?.spec.options)
    }

    pub fn last_exit(&self, handle: &ProcessHandle) -> Result<Option<ExitInfo>> {
        Ok(self.entry(handle)?.last_exit)
    }

    pub fn output_tail(&self, handle: &ProcessHandle, lines: usize) -> Result<Vec<String>> {
        Ok(self.entry(handle)?.process.as_ref().map(|p| p.output_tail(lines)).unwrap_or_default())
    }

    pub fn handles(&self) -> Vec<ProcessHandle> {
        self.procs.values().map(|e| e.handle.clone()).collect()
    }

    pub fn find(&self, name: &str) -> Option<ProcessHandle> {
        self.procs.values().find(|e| e.handle.name == name).map(|e| e.handle.clone())
    }

    fn entry(&self, handle: &ProcessHandle) -> Result<&Entry> {
        self.procs
            .get(&handle.id)
            .filter(|_| handle.manager == self.id)
            .ok_or_else(|| HarnessError::ProcessNotFound { name: handle.name.clone() })
    }

    fn entry_mut(&mut self, handle: &ProcessHandle) -> Result<&mut Entry> {
        let manager = self.id;
        self.procs
            .get_mut(&handle.id)
            .filter(|_| handle.manager == manager)
            .ok_or_else(|| HarnessError::ProcessNotFound { name: handle.name.clone() })
    }
}

impl Drop for ProcessManager {
    fn drop(&mut self) {
        for entry in self.procs.values() {
            if let Some(process) = &entry.process {
                let _ = process.signal(StopSignal::Kill);
            }
        }
    }
}

fn wipe(dir: &Path) -> Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
