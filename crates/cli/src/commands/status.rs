use fleet_harness::admin::Admin;
use fleet_harness::admin::http::HttpAdminTransport;
use std::sync::Arc;

use crate::error::CliError;
use crate::output::{self, OutputMode, table};

pub async fn status(host: &str, mode: OutputMode) -> Result<(), CliError> {
    let addr = super::parse_host(host)?;
    let admin = Admin::new(Arc::new(HttpAdminTransport::new()));
    let status = admin.repl_status(&addr).await?;

    output::print(mode, &status, |s| {
        let primary = s.primary().map_or_else(|| "none".to_owned(), |p| p.name.to_string());
        println!("SET: {} (term {}), primary: {primary}", s.set, s.term);
        println!();
        table::print_members(&s.members);
    });
    Ok(())
}
