pub mod http;
pub mod protocol;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use fleet_config::{HostAddr, env};
use serde::de::DeserializeOwned;
use serde_json::Value;

use self::protocol::*;

/// Boxed future for async trait methods that need `dyn` dispatch.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Errors from sending an administrative command.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AdminError {
    #[error("{addr} unreachable: {message}")]
    Unreachable { addr: HostAddr, message: String },

    #[error("{command} to {addr} timed out after {after:?}")]
    Timeout { addr: HostAddr, command: String, after: Duration },

    #[error("{command} failed on {addr}: {code_name} ({code}): {message}")]
    Command { addr: HostAddr, command: String, code: i32, code_name: String, message: String },

    #[error("could not decode {command} reply from {addr}: {message}")]
    Decode { addr: HostAddr, command: String, message: String },
}

impl AdminError {
    /// The connection failed or went quiet; the command may or may not have run.
    pub fn is_network(&self) -> bool {
        matches!(self, AdminError::Unreachable { .. } | AdminError::Timeout { .. })
    }

    /// Worth retrying: network trouble or a state-change error code.
    pub fn is_transient(&self) -> bool {
        self.is_network() || self.code_name().is_some_and(|n| TRANSIENT_CODE_NAMES.contains(&n))
    }

    pub fn code_name(&self) -> Option<&str> {
        match self {
            AdminError::Command { code_name, .. } => Some(code_name),
            _ => None,
        }
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            AdminError::Command { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Sends one administrative command and returns the raw reply document.
///
/// Implementations report transport failures as errors; command failures come
/// back as an `ok: 0` document and are classified by [`Admin`].
pub trait AdminTransport: Send + Sync {
    fn call(&self, addr: &HostAddr, cmd: &AdminCommand) -> BoxFuture<'_, Result<Value, AdminError>>;
}

/// Typed client over an [`AdminTransport`]. Cheap to clone.
#[derive(Clone)]
pub struct Admin {
    transport: Arc<dyn AdminTransport>,
    timeout: Duration,
}

impl Admin {
    pub fn new(transport: Arc<dyn AdminTransport>) -> Self {
        Self { transport, timeout: env::admin_timeout() }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run `cmd` against `addr`, turning `ok: 0` replies into [`AdminError::Command`].
    pub async fn run(&self, addr: &HostAddr, cmd: &AdminCommand) -> Result<Value, AdminError> {
        let reply = tokio::time::timeout(self.timeout, self.transport.call(addr, cmd))
            .await
            .map_err(|_| AdminError::Timeout {
                addr: addr.clone(),
                command: cmd.name().to_owned(),
                after: self.timeout,
            })??;
        check_reply(addr, cmd, reply)
    }

    pub async fn run_as<T: DeserializeOwned>(
        &self,
        addr: &HostAddr,
        cmd: &AdminCommand,
    ) -> Result<T, AdminError> {
        let reply = self.run(addr, cmd).await?;
        serde_json::from_value(reply).map_err(|e| AdminError::Decode {
            addr: addr.clone(),
            command: cmd.name().to_owned(),
            message: e.to_string(),
        })
    }

    pub async fn ping(&self, addr: &HostAddr) -> Result<(), AdminError> {
        self.run(addr, &AdminCommand::Ping).await.map(|_| ())
    }

    pub async fn hello(&self, addr: &HostAddr) -> Result<HelloReply, AdminError> {
        self.run_as(addr, &AdminCommand::Hello).await
    }

    pub async fn repl_status(&self, addr: &HostAddr) -> Result<ReplStatus, AdminError> {
        self.run_as(addr, &AdminCommand::ReplSetGetStatus).await
    }

    pub async fn repl_config(&self, addr: &HostAddr) -> Result<ReplSetConfig, AdminError> {
        let reply: ReplSetConfigReply = self.run_as(addr, &AdminCommand::ReplSetGetConfig).await?;
        Ok(reply.config)
    }

    pub async fn list_shards(&self, router: &HostAddr) -> Result<Vec<ShardInfo>, AdminError> {
        let reply: ShardList = self.run_as(router, &AdminCommand::ListShards).await?;
        Ok(reply.shards)
    }

    pub async fn list_chunks(
        &self,
        router: &HostAddr,
        ns: &str,
    ) -> Result<Vec<ChunkInfo>, AdminError> {
        let cmd = AdminCommand::ListChunks { ns: ns.to_owned() };
        let reply: ChunkList = self.run_as(router, &cmd).await?;
        Ok(reply.chunks)
    }

    pub async fn balancer_status(&self, router: &HostAddr) -> Result<BalancerStatus, AdminError> {
        self.run_as(router, &AdminCommand::BalancerStatus).await
    }
}

fn check_reply(addr: &HostAddr, cmd: &AdminCommand, reply: Value) -> Result<Value, AdminError> {
    if reply.get("ok").and_then(Value::as_f64).is_some_and(|ok| ok >= 1.0) {
        return Ok(reply);
    }
    Err(AdminError::Command {
        addr: addr.clone(),
        command: cmd.name().to_owned(),
        code: reply.get("code").and_then(Value::as_i64).unwrap_or(8) as i32,
        code_name: reply
            .get("codeName")
            .and_then(Value::as_str)
            .unwrap_or("UnknownError")
            .to_owned(),
        message: reply.get("errmsg").and_then(Value::as_str).unwrap_or_default().to_owned(),
    })
}
