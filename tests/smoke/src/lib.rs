// Smoke tests: the harness driving real server, router and bridge binaries.
//
// They need the binaries on disk, named by FLEET_SERVER_BIN, FLEET_ROUTER_BIN
// and FLEET_BRIDGE_BIN. Unwrap/panic are appropriate in test harness code.
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::path::PathBuf;

use fleet_config::HarnessSettings;
use fleet_harness::Harness;
use tempfile::TempDir;

/// Panics if `FLEET_SERVER_BIN` is not set. Place at the top of every smoke
/// test so that `cargo test --all` fails clearly instead of timing out on
/// missing binaries.
#[macro_export]
macro_rules! require_server {
    () => {
        if std::env::var("FLEET_SERVER_BIN").is_err() {
            panic!(
                "smoke tests need real binaries.\n\
                 Set FLEET_SERVER_BIN, FLEET_ROUTER_BIN and FLEET_BRIDGE_BIN"
            );
        }
    };
}

fn bin(var: &str, fallback: &str) -> PathBuf {
    std::env::var_os(var).map_or_else(|| PathBuf::from(fallback), PathBuf::from)
}

/// A real-binary harness with its data under a temp dir.
pub struct SmokeFleet {
    pub harness: Harness,
    _dir: TempDir,
}

impl SmokeFleet {
    pub fn new() -> Self {
        fleet_support::init_test_logging();
        let dir = tempfile::tempdir().unwrap();
        let settings = HarnessSettings::new(dir.path()).binaries(
            bin("FLEET_SERVER_BIN", "fleet-server"),
            bin("FLEET_ROUTER_BIN", "fleet-router"),
            bin("FLEET_BRIDGE_BIN", "fleet-bridge"),
        );
        Self { harness: Harness::from_settings(settings), _dir: dir }
    }
}

impl Default for SmokeFleet {
    fn default() -> Self {
        Self::new()
    }
}
