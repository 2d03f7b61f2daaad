mod status;
mod step_down;
mod up;
pub mod validate;

use std::path::Path;

use fleet_config::{HarnessSettings, TopologyFile};

use crate::args::{Cli, Command};
use crate::error::CliError;
use crate::output::OutputMode;

pub async fn dispatch(cli: Cli, mode: OutputMode) -> Result<(), CliError> {
    match &cli.command {
        Command::Validate { file } => validate::validate(file, mode),
        Command::Up { name, file } => {
            let topology = load(file)?;
            let settings = apply_overrides(topology.harness.clone(), &cli);
            up::up(&topology, settings, name, mode).await
        }
        Command::Status { host } => status::status(host, mode).await,
        Command::StepDown { host, secs, force } => {
            step_down::step_down(host, *secs, *force, mode).await
        }
    }
}

/// Read and validate a topology file.
pub(crate) fn load(path: &Path) -> Result<TopologyFile, CliError> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        std::io::Error::new(e.kind(), format!("could not read {}: {e}", path.display()))
    })?;
    Ok(fleet_config::parse(&text)?)
}

/// Command-line flags win over the file's `harness` block.
fn apply_overrides(mut settings: HarnessSettings, cli: &Cli) -> HarnessSettings {
    if let Some(dir) = &cli.data_dir {
        settings.data_dir = fleet_config::DataDir::new(dir);
    }
    if let Some(bin) = &cli.server_bin {
        settings.server_bin = bin.clone();
    }
    if let Some(bin) = &cli.router_bin {
        settings.router_bin = bin.clone();
    }
    if let Some(bin) = &cli.bridge_bin {
        settings.bridge_bin = bin.clone();
    }
    settings
}

pub(crate) fn parse_host(host: &str) -> Result<fleet_config::HostAddr, CliError> {
    host.parse().map_err(|e| CliError::Arg(format!("--host: {e}")))
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn flags_override_file_settings() {
        let cli = Cli::parse_from([
            "fleet",
            "--data-dir",
            "/tmp/elsewhere",
            "--server-bin",
            "/opt/bin/server",
            "up",
            "rs0",
        ]);
        let file = HarnessSettings::new("/tmp/fleet").binaries("s", "r", "b");
        let settings = apply_overrides(file, &cli);
        assert_eq!(settings.data_dir.root(), Path::new("/tmp/elsewhere"));
        assert_eq!(settings.server_bin, Path::new("/opt/bin/server"));
        assert_eq!(settings.router_bin, Path::new("r"));
    }

    #[test]
    fn bad_host_is_a_usage_error() {
        let err = parse_host("no-port").unwrap_err();
        assert_eq!(err.exit_code(), 64);
    }
}
