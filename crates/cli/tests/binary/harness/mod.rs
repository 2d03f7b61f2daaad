use std::path::PathBuf;

use assert_cmd::Command;

/// Pre-configured `assert_cmd::Command` for the `fleet` binary.
///
/// Clears fleet-specific env vars so the test environment cannot leak in.
pub fn fleet_cmd() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_fleet"));
    for var in ["FLEET_DATA_DIR", "FLEET_SERVER_BIN", "FLEET_ROUTER_BIN", "FLEET_BRIDGE_BIN"] {
        cmd.env_remove(var);
    }
    cmd
}

/// A topology file from the repository's `demos/` directory.
pub fn demo(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../demos").join(name)
}
