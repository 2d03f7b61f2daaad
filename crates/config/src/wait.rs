//! Bounded polling: the one primitive every harness wait is built on.
//!
//! A probe is re-evaluated until it reports [`Check::Ready`] or the timeout
//! elapses. Probe errors count as "not yet" unless the caller opts into
//! failing fast on them.

use std::fmt::Display;
use std::future::{Future, IntoFuture};
use std::marker::PhantomData;
use std::pin::Pin;
use std::time::Duration;

use tokio::time::Instant;

use crate::env;

/// Outcome of a single probe evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Check<T> {
    Ready(T),
    /// Not there yet; the string describes what was observed.
    Pending(String),
}

impl<T> Check<T> {
    pub fn pending(observed: impl Into<String>) -> Self {
        Check::Pending(observed.into())
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Check::Ready(_))
    }
}

impl From<bool> for Check<()> {
    fn from(ok: bool) -> Self {
        if ok { Check::Ready(()) } else { Check::Pending("condition not met".to_owned()) }
    }
}

/// A wait that ran out of time, with the last thing the probe saw.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error(
    "timed out after {elapsed:?} waiting for {what} ({attempts} attempts); last observed: {}",
    .last_observed.as_deref().unwrap_or("nothing")
)]
pub struct WaitTimeout {
    pub what: String,
    pub elapsed: Duration,
    pub attempts: u32,
    pub last_observed: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum WaitError<E> {
    #[error(transparent)]
    Timeout(WaitTimeout),
    /// The probe returned an error matching the fail-fast predicate.
    #[error("aborted: {0}")]
    Aborted(E),
}

impl<E> WaitError<E> {
    pub fn timeout(&self) -> Option<&WaitTimeout> {
        match self {
            WaitError::Timeout(t) => Some(t),
            WaitError::Aborted(_) => None,
        }
    }
}

type FailFast<'a, E> = Box<dyn Fn(&E) -> bool + Send + Sync + 'a>;

/// Poll `probe` until it is ready or `timeout` elapses.
///
/// The probe runs at least once, even with a zero timeout. Await the returned
/// builder directly, or tune it first with [`WaitUntil::interval`],
/// [`WaitUntil::fail_fast`] or [`WaitUntil::quiet`].
pub fn wait_until<'a, F, Fut, T, E>(
    what: impl Into<String>,
    timeout: Duration,
    probe: F,
) -> WaitUntil<'a, F, Fut, E>
where
    F: FnMut() -> Fut + Send + 'a,
    Fut: Future<Output = Result<Check<T>, E>> + Send + 'a,
    T: Send + 'a,
    E: Display + Send + 'a,
{
    WaitUntil {
        what: what.into(),
        timeout,
        interval: env::poll_interval(),
        quiet: false,
        fail_fast: None,
        probe,
        _fut: PhantomData,
    }
}

pub struct WaitUntil<'a, F, Fut, E> {
    what: String,
    timeout: Duration,
    interval: Duration,
    quiet: bool,
    fail_fast: Option<FailFast<'a, E>>,
    probe: F,
    _fut: PhantomData<fn() -> Fut>,
}

impl<'a, F, Fut, E> WaitUntil<'a, F, Fut, E> {
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Abort the wait when a probe error matches `pred`.
    pub fn fail_fast(mut self, pred: impl Fn(&E) -> bool + Send + Sync + 'a) -> Self {
        self.fail_fast = Some(Box::new(pred));
        self
    }

    /// Suppress the periodic "still waiting" log line.
    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }
}

impl<'a, F, Fut, T, E> IntoFuture for WaitUntil<'a, F, Fut, E>
where
    F: FnMut() -> Fut + Send + 'a,
    Fut: Future<Output = Result<Check<T>, E>> + Send + 'a,
    T: Send + 'a,
    E: Display + Send + 'a,
{
    type Output = Result<T, WaitError<E>>;
    type IntoFuture = Pin<Box<dyn Future<Output = Self::Output> + Send + 'a>>;

    fn into_future(mut self) -> Self::IntoFuture {
        Box::pin(async move {
            let start = Instant::now();
            let deadline = start + self.timeout;
            let mut last_log = start;
            let mut attempts = 0u32;
            let mut last_observed: Option<String>;

            loop {
                attempts += 1;
                match (self.probe)().await {
                    Ok(Check::Ready(value)) => {
                        tracing::debug!(what = %self.what, attempts, "wait satisfied");
                        return Ok(value);
                    }
                    Ok(Check::Pending(observed)) => last_observed = Some(observed),
                    Err(e) => {
                        if self.fail_fast.as_ref().is_some_and(|pred| pred(&e)) {
                            return Err(WaitError::Aborted(e));
                        }
                        last_observed = Some(e.to_string());
                    }
                }

                let now = Instant::now();
                if now >= deadline {
                    let timeout = WaitTimeout {
                        what: self.what,
                        elapsed: now.duration_since(start),
                        attempts,
                        last_observed,
                    };
                    tracing::warn!(error = %timeout, "wait timed out");
                    return Err(WaitError::Timeout(timeout));
                }

                if !self.quiet && now.duration_since(last_log) >= env::status_log_interval() {
                    tracing::info!(
                        what = %self.what,
                        elapsed = ?now.duration_since(start),
                        last = last_observed.as_deref().unwrap_or("-"),
                        "still waiting"
                    );
                    last_log = now;
                }

                tokio::time::sleep(self.interval.min(deadline - now)).await;
            }
        })
    }
}
