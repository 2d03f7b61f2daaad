#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod failover;
mod parallel;
mod partition;
mod process;
mod replset;
mod sharding;
