use crate::Error;
use futures::{
    channel::oneshot,
    future::{AbortHandle, Abortable},
};
use prometheus_client::metrics::gauge::Gauge;
use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

/// Lowercase hexadecimal encoding of `bytes`.
pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

/// Read a virtual timestamp as an offset from the start of a run.
pub trait SystemTimeExt {
    /// Offset from [UNIX_EPOCH] (where every deterministic run starts).
    fn epoch(&self) -> Duration;

    /// [SystemTimeExt::epoch] in whole milliseconds.
    fn epoch_millis(&self) -> u64;
}

impl SystemTimeExt for SystemTime {
    fn epoch(&self) -> Duration {
        self.duration_since(UNIX_EPOCH)
            .expect("virtual time never precedes the epoch")
    }

    fn epoch_millis(&self) -> u64 {
        u64::try_from(self.epoch().as_millis()).unwrap_or(u64::MAX)
    }
}

/// Decrements the running gauge when a task's future is dropped (finished or aborted).
struct Running(Gauge);

impl Drop for Running {
    fn drop(&mut self) {
        self.0.dec();
    }
}

/// Output of a spawned task.
///
/// Dropping the handle detaches the task; [Handle::abort] stops it.
pub struct Handle<T> {
    abort: AbortHandle,
    output: oneshot::Receiver<T>,
}

impl<T: Send + 'static> Handle<T> {
    /// Wrap `future` so that it reports its output to the returned handle and can be aborted.
    pub(crate) fn wrap<F>(
        future: F,
        running: Gauge,
    ) -> (impl Future<Output = ()> + Send + 'static, Self)
    where
        F: Future<Output = T> + Send + 'static,
    {
        running.inc();
        let guard = Running(running);
        let (sender, output) = oneshot::channel();
        let (abort, registration) = AbortHandle::new_pair();
        let task = Abortable::new(
            async move {
                let _guard = guard;
                let _ = sender.send(future.await);
            },
            registration,
        );
        let task = async move {
            let _ = task.await;
        };
        (task, Self { abort, output })
    }

    /// Stop the task at its next suspension point. Awaiting the handle then yields
    /// [Error::Closed].
    pub fn abort(&self) {
        self.abort.abort();
    }
}

impl<T> Future for Handle<T> {
    type Output = Result<T, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.output)
            .poll(cx)
            .map(|output| output.map_err(|_| Error::Closed))
    }
}
