use fleet_config::{HostAddr, env};
use serde_json::Value;

use super::protocol::AdminCommand;
use super::{AdminError, AdminTransport, BoxFuture};

/// Talks to a real process: `POST http://host:port/admin/command` with the
/// command as the JSON body.
pub struct HttpAdminTransport {
    http: reqwest::Client,
}

impl HttpAdminTransport {
    pub fn new() -> Self {
        let http =
            reqwest::Client::builder().timeout(env::admin_timeout()).build().unwrap_or_default();
        Self { http }
    }
}

impl Default for HttpAdminTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl AdminTransport for HttpAdminTransport {
    fn call(
        &self,
        addr: &HostAddr,
        cmd: &AdminCommand,
    ) -> BoxFuture<'_, Result<Value, AdminError>> {
        let url = format!("http://{addr}/admin/command");
        let addr = addr.clone();
        let cmd = cmd.clone();
        Box::pin(async move {
            let resp = self
                .http
                .post(&url)
                .json(&cmd)
                .send()
                .await
                .map_err(|e| from_reqwest(e, &addr, &cmd))?;
            // Failed commands still answer with a JSON document, whatever the status.
            resp.json::<Value>().await.map_err(|e| AdminError::Decode {
                addr: addr.clone(),
                command: cmd.name().to_owned(),
                message: e.to_string(),
            })
        })
    }
}

fn from_reqwest(err: reqwest::Error, addr: &HostAddr, cmd: &AdminCommand) -> AdminError {
    if err.is_timeout() {
        AdminError::Timeout {
            addr: addr.clone(),
            command: cmd.name().to_owned(),
            after: env::admin_timeout(),
        }
    } else {
        AdminError::Unreachable { addr: addr.clone(), message: err.to_string() }
    }
}
