//! Execute asynchronous tasks on a deterministic, virtual-time scheduler.
//!
//! Simulated peers are ordinary `async` tasks. Every suspension point (a timed sleep, the
//! completion of a transfer, a message arriving in a mailbox) parks the task until the scheduler
//! wakes it, and the scheduler only advances virtual time once no task can make progress. Given
//! a fixed seed, the interleaving of tasks (and every random draw) is reproducible.
//!
//! The [deterministic] module provides the only scheduler. Components are written against the
//! [Spawner], [Clock] and [Metrics] traits so they never name it directly.

use futures::future::{select, Either};
use prometheus_client::registry::Metric;
use std::{
    future::Future,
    pin::pin,
    time::{Duration, SystemTime},
};
use thiserror::Error;

pub mod deterministic;
mod utils;
pub use utils::{hex, Handle, SystemTimeExt};

/// Label reserved for the scheduler's own metrics.
const RESERVED_LABEL: &str = "runtime";

/// Errors returned by the scheduler.
#[derive(Error, Debug)]
pub enum Error {
    #[error("task aborted")]
    Closed,
    #[error("timed out")]
    Timeout,
}

/// Drives a root task to completion.
pub trait Runner {
    /// Environment handed to the root task.
    type Context;

    /// Run `f` until the future it returns resolves. Every task still pending at that point is
    /// dropped.
    fn start<F, Fut>(self, f: F) -> Fut::Output
    where
        F: FnOnce(Self::Context) -> Fut,
        Fut: Future;
}

/// Starts background tasks.
pub trait Spawner: Clone + Send + Sync + 'static {
    /// Run the future built by `f` as a new task. The task receives the (consumed) context and
    /// the returned [Handle] resolves to its output.
    fn spawn<F, Fut, T>(self, f: F) -> Handle<T>
    where
        F: FnOnce(Self) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static;
}

/// Registers metrics under the label of a context.
pub trait Metrics: Clone + Send + Sync + 'static {
    /// Derive a context whose label is the current one extended by `label`.
    ///
    /// Labels may not start with `runtime`.
    fn with_label(&self, label: &str) -> Self;

    /// Register `metric` as `<label>_<name>`.
    fn register<N: Into<String>, H: Into<String>>(&self, name: N, help: H, metric: impl Metric);

    /// Encode every registered metric in the Prometheus text format.
    fn encode(&self) -> String;
}

/// Reads and waits on virtual time.
pub trait Clock: Clone + Send + Sync + 'static {
    /// Current virtual time.
    fn current(&self) -> SystemTime;

    /// Resolve once `duration` has elapsed.
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send + 'static;

    /// Resolve once the clock reads `deadline` (immediately if it already has).
    fn sleep_until(&self, deadline: SystemTime) -> impl Future<Output = ()> + Send + 'static;

    /// Resolve to the output of `future`, or to [Error::Timeout] if `duration` elapses first.
    ///
    /// ```
    /// use std::time::Duration;
    /// use keysim_runtime::{deterministic, Clock, Error, Runner};
    ///
    /// deterministic::Runner::default().start(|context| async move {
    ///     let never = futures::future::pending::<()>();
    ///     let result = context.timeout(Duration::from_secs(1), never).await;
    ///     assert!(matches!(result, Err(Error::Timeout)));
    /// });
    /// ```
    fn timeout<F, T>(
        &self,
        duration: Duration,
        future: F,
    ) -> impl Future<Output = Result<T, Error>> + Send + '_
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        async move {
            let future = pin!(future);
            let deadline = pin!(self.sleep(duration));
            match select(future, deadline).await {
                Either::Left((output, _)) => Ok(output),
                Either::Right(_) => Err(Error::Timeout),
            }
        }
    }
}
