// Test support crate: unwrap/panic are appropriate in test harness code.
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::new_without_default)]

pub mod fleet;
pub mod sim;

pub use fleet::{TestFleet, fast_settings, init_test_logging};
pub use sim::{SimFleet, SimSettings};
