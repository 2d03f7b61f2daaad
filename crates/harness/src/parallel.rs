//! Out-of-band actions that run while the test keeps driving the fleet.
//!
//! Only owned, thread-safe values move into an action: an [`Admin`] clone
//! and the addresses it needs. Controllers and handles stay with the caller.
//!
//! [`Admin`]: crate::admin::Admin

use std::future::Future;

use tokio::task::JoinHandle;

use crate::error::{HarnessError, Result};

pub struct ParallelAction<T> {
    name: String,
    task: JoinHandle<Result<T>>,
}

impl<T: Send + 'static> ParallelAction<T> {
    pub fn spawn<F>(name: impl Into<String>, action: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let name = name.into();
        tracing::debug!(action = %name, "parallel action started");
        Self { name, task: tokio::spawn(action) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the action and return its result. A panic or abort becomes
    /// [`HarnessError::Parallel`].
    pub async fn join(self) -> Result<T> {
        match self.task.await {
            Ok(result) => {
                tracing::debug!(action = %self.name, ok = result.is_ok(), "parallel action joined");
                result
            }
            Err(e) => {
                let message = if e.is_panic() { "panicked".to_owned() } else { e.to_string() };
                Err(HarnessError::Parallel { name: self.name, message })
            }
        }
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}
