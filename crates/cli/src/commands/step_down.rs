use std::sync::Arc;

use fleet_harness::admin::Admin;
use fleet_harness::admin::http::HttpAdminTransport;
use fleet_harness::admin::protocol::AdminCommand;
use serde_json::json;

use crate::error::CliError;
use crate::output::{self, OutputMode};

pub async fn step_down(
    host: &str,
    secs: u64,
    force: bool,
    mode: OutputMode,
) -> Result<(), CliError> {
    let addr = super::parse_host(host)?;
    let admin = Admin::new(Arc::new(HttpAdminTransport::new()));
    // Make sure someone is listening before a dropped connection can be read
    // as success.
    admin.ping(&addr).await?;

    let cmd = AdminCommand::ReplSetStepDown { secs: secs.max(1), force };
    match admin.run(&addr, &cmd).await {
        Ok(_) => {}
        Err(e) if e.is_network() => {
            tracing::debug!(error = %e, "connection dropped by stepdown");
        }
        Err(e) => return Err(e.into()),
    }

    let result = json!({ "host": addr, "stepped_down": true, "secs": secs.max(1) });
    output::print(mode, &result, |_| println!("{addr} stepped down for {}s", secs.max(1)));
    Ok(())
}
