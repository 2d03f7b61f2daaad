use std::collections::VecDeque;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};

use super::{ExitInfo, LaunchSpec, Launcher, ServerProcess, StopSignal};
use crate::admin::BoxFuture;
use crate::error::{HarnessError, Result};

/// Lines of output kept in memory per process.
const TAIL_LINES: usize = 200;

/// Execs real binaries. Output goes to the `LaunchSpec` log file and an in-memory
/// tail used in startup diagnostics.
#[derive(Debug, Default)]
pub struct BinaryLauncher;

impl BinaryLauncher {
    pub fn new() -> Self {
        Self
    }
}

impl Launcher for BinaryLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn ServerProcess>> {
        if let Some(dir) = spec.log_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let log = std::fs::OpenOptions::new().create(true).append(true).open(&spec.log_path)?;

        let args = spec.to_args();
        tracing::debug!(name = %spec.name, binary = %spec.binary.display(), ?args, "exec");

        let mut child = Command::new(&spec.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0)
            .spawn()
            .map_err(|e| HarnessError::Spawn {
                name: spec.name.clone(),
                message: format!("{}: {e}", spec.binary.display()),
            })?;

        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(TAIL_LINES)));
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(drain(stdout, tokio::fs::File::from_std(log.try_clone()?), tail.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain(stderr, tokio::fs::File::from_std(log), tail.clone()));
        }

        Ok(Box::new(BinaryProcess { pid: child.id(), child: Mutex::new(child), tail }))
    }
}

async fn drain<R>(stream: R, mut log: tokio::fs::File, tail: Arc<Mutex<VecDeque<String>>>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let written = log.write_all(format!("{line}\n").as_bytes()).await;
        if let Err(e) = written.and(log.flush().await) {
            tracing::debug!(error = %e, "log write failed");
        }
        let mut tail = tail.lock();
        if tail.len() == TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}

struct BinaryProcess {
    pid: Option<u32>,
    child: Mutex<Child>,
    tail: Arc<Mutex<VecDeque<String>>>,
}

impl ServerProcess for BinaryProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn signal(&self, signal: StopSignal) -> Result<()> {
        // A reaped pid may already belong to someone else.
        if self.try_wait()?.is_some() {
            return Ok(());
        }
        let Some(pid) = self.pid else { return Ok(()) };
        let sig = match signal {
            StopSignal::Graceful => Signal::SIGTERM,
            StopSignal::Kill => Signal::SIGKILL,
        };
        match kill(Pid::from_raw(pid as i32), sig) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(std::io::Error::from(e).into()),
        }
    }

    fn try_wait(&self) -> Result<Option<ExitInfo>> {
        Ok(self.child.lock().try_wait()?.map(exit_info))
    }

    fn wait(&mut self) -> BoxFuture<'_, Result<ExitInfo>> {
        let child = self.child.get_mut();
        Box::pin(async move { Ok(exit_info(child.wait().await?)) })
    }

    fn output_tail(&self, lines: usize) -> Vec<String> {
        let tail = self.tail.lock();
        tail.iter().skip(tail.len().saturating_sub(lines)).cloned().collect()
    }
}

fn exit_info(status: ExitStatus) -> ExitInfo {
    ExitInfo { code: status.code(), signal: status.signal() }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use fleet_config::{HostAddr, LaunchOptions};

    use super::*;
    use crate::process::ProcessRole;

    fn spec(dir: &std::path::Path, binary: &str, options: LaunchOptions) -> LaunchSpec {
        LaunchSpec {
            name: "probe".into(),
            role: ProcessRole::Bridge,
            binary: PathBuf::from(binary),
            addr: HostAddr::localhost(20000),
            dbpath: None,
            options,
            log_path: dir.join("logs/probe.log"),
        }
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = BinaryLauncher::new()
            .launch(&spec(dir.path(), "/nonexistent/fleet-server", LaunchOptions::new()))
            .err()
            .unwrap();
        assert!(matches!(err, HarnessError::Spawn { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn output_reaches_tail_and_log() {
        let dir = tempfile::tempdir().unwrap();
        // `echo --port 20000` prints its arguments and exits.
        let mut proc =
            BinaryLauncher::new().launch(&spec(dir.path(), "echo", LaunchOptions::new())).unwrap();
        let exit = proc.wait().await.unwrap();
        assert_eq!(exit, ExitInfo::code(0));

        for _ in 0..50 {
            if !proc.output_tail(10).is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(proc.output_tail(10), vec!["--port 20000"]);
        let log = std::fs::read_to_string(dir.path().join("logs/probe.log")).unwrap();
        assert!(log.contains("--port 20000"));
    }
}
