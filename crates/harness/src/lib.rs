#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

//! Provision replica sets and sharded clusters, drive them to a known state,
//! and inject faults while tests run against them.

pub mod admin;
mod error;
pub mod faults;
mod harness;
pub mod parallel;
pub mod process;
pub mod replset;
pub mod sharding;

pub use admin::{Admin, AdminError, AdminTransport, BoxFuture};
pub use error::{HarnessError, Result};
pub use faults::{FaultId, FaultInjector, FaultKind, FaultRecord};
pub use harness::Harness;
pub use parallel::ParallelAction;
pub use process::{
    ExitInfo, LaunchSpec, Launcher, LifecycleState, ProcessHandle, ProcessId, ProcessManager,
    ProcessRole, RestartOptions, ServerProcess, StartRequest, StopSignal,
};
pub use replset::{
    MemberSlot, MemberView, ReconfigOptions, ReplicaSetController, ReplicaSetHandle, SetState,
};
pub use sharding::{ShardedClusterController, ShardedClusterHandle};
