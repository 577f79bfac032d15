//! A single-threaded scheduler whose clock only moves when every task is parked.
//!
//! Ready tasks are polled in the order they were woken. Once none is ready, the clock jumps to
//! the earliest pending timer (timers with equal deadlines fire in registration order). The
//! clock starts at [UNIX_EPOCH] and all randomness comes from a seeded [StdRng], so a run is a
//! pure function of its seed. Every poll, random draw and metric registration is folded into
//! an [Auditor] digest that two runs can be compared by.
//!
//! # Panics
//!
//! The runner panics with `runtime stalled` if the root task is pending while no task is ready
//! and no timer is pending, and with `runtime timeout` once the clock passes
//! [Config::timeout].
//!
//! # Example
//!
//! ```rust
//! use keysim_runtime::{deterministic, Clock, Runner, Spawner};
//! use std::time::Duration;
//!
//! let runner = deterministic::Runner::seeded(7);
//! let elapsed = runner.start(|context| async move {
//!     let child = context.clone().spawn(|context| async move {
//!         context.sleep(Duration::from_secs(3)).await;
//!         "done"
//!     });
//!     assert_eq!(child.await.unwrap(), "done");
//!     context.current()
//! });
//! assert_eq!(elapsed, std::time::UNIX_EPOCH + Duration::from_secs(3));
//! ```

use crate::{hex, Clock, Handle, SystemTimeExt, RESERVED_LABEL};
use futures::{
    future::BoxFuture,
    task::{waker, waker_ref, ArcWake},
};
use prometheus_client::{
    encoding::{text::encode, EncodeLabelSet},
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::{Metric, Registry},
};
use rand::{rngs::StdRng, CryptoRng, RngCore, SeedableRng};
use sha2::{Digest, Sha256};
use std::{
    collections::{BTreeMap, VecDeque},
    future::Future,
    mem,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    task::{self, Poll, Waker},
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tracing::trace;

/// Settings of a [Runner].
#[derive(Clone, Debug)]
pub struct Config {
    /// Seed of the random number generator handed out through every [Context].
    pub seed: u64,

    /// Virtual time after which the runner panics (if the root task has not finished).
    pub timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            seed: 42,
            timeout: None,
        }
    }
}

/// Digest of everything a run has done that could differ between two runs.
pub struct Auditor {
    digest: Mutex<[u8; 32]>,
}

impl Auditor {
    fn record(&self, event: &str, detail: &[u8]) {
        let mut digest = self.digest.lock().unwrap();
        let mut hasher = Sha256::new();
        hasher.update(*digest);
        hasher.update(event.as_bytes());
        hasher.update((detail.len() as u64).to_be_bytes());
        hasher.update(detail);
        digest.copy_from_slice(&hasher.finalize());
    }

    /// Hex encoding of the current digest.
    pub fn state(&self) -> String {
        hex(&*self.digest.lock().unwrap())
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct TaskLabel {
    label: String,
}

struct Telemetry {
    spawned: Family<TaskLabel, Counter>,
    running: Family<TaskLabel, Gauge>,
    polls: Family<TaskLabel, Counter>,
}

impl Telemetry {
    fn init(registry: &mut Registry) -> Self {
        let telemetry = Self {
            spawned: Family::default(),
            running: Family::default(),
            polls: Family::default(),
        };
        registry.register("tasks_spawned", "tasks spawned", telemetry.spawned.clone());
        registry.register("tasks_running", "tasks not yet finished", telemetry.running.clone());
        registry.register("task_polls", "times a task was polled", telemetry.polls.clone());
        telemetry
    }
}

type Queue = Arc<Mutex<VecDeque<Arc<Task>>>>;

struct Task {
    id: u64,
    label: TaskLabel,
    future: Mutex<Option<BoxFuture<'static, ()>>>,

    /// Set while the task sits in the ready queue (so a task is queued at most once).
    queued: AtomicBool,
    queue: Queue,
}

impl ArcWake for Task {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        if !arc_self.queued.swap(true, Ordering::SeqCst) {
            arc_self.queue.lock().unwrap().push_back(arc_self.clone());
        }
    }
}

/// Wakes the root future, which lives on the runner's stack rather than in the queue.
struct Root {
    woken: AtomicBool,
}

impl ArcWake for Root {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.woken.store(true, Ordering::SeqCst);
    }
}

/// A timer is keyed by its deadline and registration sequence.
type TimerKey = (SystemTime, u64);

struct Scheduler {
    now: Mutex<SystemTime>,
    deadline: Option<SystemTime>,

    ready: Queue,
    timers: Mutex<BTreeMap<TimerKey, Waker>>,
    next_task: AtomicU64,
    next_timer: AtomicU64,

    rng: Mutex<StdRng>,
    auditor: Arc<Auditor>,
    registry: Mutex<Registry>,
    telemetry: Telemetry,
}

impl Scheduler {
    fn new(cfg: Config) -> Self {
        let mut registry = Registry::default();
        let telemetry = Telemetry::init(registry.sub_registry_with_prefix(RESERVED_LABEL));
        Self {
            now: Mutex::new(UNIX_EPOCH),
            deadline: cfg.timeout.map(|timeout| UNIX_EPOCH + timeout),
            ready: Arc::default(),
            timers: Mutex::default(),
            next_task: AtomicU64::new(1), // 0 is the root
            next_timer: AtomicU64::new(0),
            rng: Mutex::new(StdRng::seed_from_u64(cfg.seed)),
            auditor: Arc::new(Auditor {
                digest: Mutex::new([0; 32]),
            }),
            registry: Mutex::new(registry),
            telemetry,
        }
    }

    fn now(&self) -> SystemTime {
        *self.now.lock().unwrap()
    }

    fn submit(&self, label: TaskLabel, future: BoxFuture<'static, ()>) {
        let id = self.next_task.fetch_add(1, Ordering::SeqCst);
        let task = Arc::new(Task {
            id,
            label,
            future: Mutex::new(Some(future)),
            queued: AtomicBool::new(true),
            queue: self.ready.clone(),
        });
        self.ready.lock().unwrap().push_back(task);
    }

    fn poll(&self, job: Arc<Task>) {
        job.queued.store(false, Ordering::SeqCst);
        let mut slot = job.future.lock().unwrap();
        let Some(future) = slot.as_mut() else {
            return;
        };
        self.auditor.record("poll", &job.id.to_be_bytes());
        self.telemetry.polls.get_or_create(&job.label).inc();
        let waker = waker_ref(&job);
        let mut cx = task::Context::from_waker(&waker);
        if future.as_mut().poll(&mut cx).is_ready() {
            *slot = None;
            trace!(id = job.id, label = %job.label.label, "task finished");
        }
    }

    /// Jump to the earliest timer and wake every timer that is due. Returns `false` if there is
    /// no timer left to wait for.
    fn advance(&self) -> bool {
        let next = self.timers.lock().unwrap().keys().next().copied();
        let Some((at, _)) = next else {
            return false;
        };
        {
            let mut now = self.now.lock().unwrap();
            if at > *now {
                *now = at;
                trace!(now = at.epoch_millis(), "advanced clock");
            }
        }

        let due = {
            let mut timers = self.timers.lock().unwrap();
            let later = timers.split_off(&(at, u64::MAX));
            mem::replace(&mut *timers, later)
        };
        for waker in due.into_values() {
            waker.wake();
        }
        true
    }

    /// Drop every task and timer still held by the scheduler.
    fn shutdown(&self) {
        let timers = mem::take(&mut *self.timers.lock().unwrap());
        drop(timers);
        loop {
            let Some(task) = self.ready.lock().unwrap().pop_front() else {
                break;
            };
            let future = task.future.lock().unwrap().take();
            drop(future);
        }
    }
}

/// Runs a root task (and everything it spawns) on a virtual clock.
pub struct Runner {
    scheduler: Arc<Scheduler>,
}

impl Runner {
    pub fn new(cfg: Config) -> Self {
        Self {
            scheduler: Arc::new(Scheduler::new(cfg)),
        }
    }

    /// Runner with the default configuration and the given seed.
    pub fn seeded(seed: u64) -> Self {
        Self::new(Config {
            seed,
            ..Config::default()
        })
    }

    /// Runner with the default configuration that panics once `timeout` of virtual time passes.
    pub fn timed(timeout: Duration) -> Self {
        Self::new(Config {
            timeout: Some(timeout),
            ..Config::default()
        })
    }
}

impl Default for Runner {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl crate::Runner for Runner {
    type Context = Context;

    fn start<F, Fut>(self, f: F) -> Fut::Output
    where
        F: FnOnce(Self::Context) -> Fut,
        Fut: Future,
    {
        let scheduler = self.scheduler;
        let mut root = Box::pin(f(Context {
            label: String::new(),
            scheduler: scheduler.clone(),
        }));
        let wake = Arc::new(Root {
            woken: AtomicBool::new(true),
        });
        let root_waker = waker(wake.clone());

        let output = loop {
            if let Some(deadline) = scheduler.deadline {
                if scheduler.now() >= deadline {
                    panic!("runtime timeout");
                }
            }

            if wake.woken.swap(false, Ordering::SeqCst) {
                scheduler.auditor.record("poll", &0u64.to_be_bytes());
                let mut cx = task::Context::from_waker(&root_waker);
                if let Poll::Ready(output) = root.as_mut().poll(&mut cx) {
                    break output;
                }
            }

            let batch: Vec<_> = scheduler.ready.lock().unwrap().drain(..).collect();
            for task in batch {
                scheduler.poll(task);
            }

            let idle =
                scheduler.ready.lock().unwrap().is_empty() && !wake.woken.load(Ordering::SeqCst);
            if idle && !scheduler.advance() {
                panic!("runtime stalled");
            }
        };

        drop(root);
        scheduler.shutdown();
        output
    }
}

/// Handle through which tasks reach the scheduler: spawning, time, randomness and metrics.
#[derive(Clone)]
pub struct Context {
    label: String,
    scheduler: Arc<Scheduler>,
}

impl Context {
    /// The [Auditor] of the run this context belongs to.
    pub fn auditor(&self) -> Arc<Auditor> {
        self.scheduler.auditor.clone()
    }
}

impl crate::Spawner for Context {
    fn spawn<F, Fut, T>(self, f: F) -> Handle<T>
    where
        F: FnOnce(Self) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let label = TaskLabel {
            label: self.label.clone(),
        };
        let scheduler = self.scheduler.clone();
        scheduler.telemetry.spawned.get_or_create(&label).inc();
        let running = scheduler.telemetry.running.get_or_create(&label).clone();
        let (future, handle) = Handle::wrap(f(self), running);
        scheduler.submit(label, Box::pin(future));
        handle
    }
}

impl crate::Metrics for Context {
    fn with_label(&self, label: &str) -> Self {
        let label = match self.label.as_str() {
            "" => label.to_string(),
            prefix => format!("{prefix}_{label}"),
        };
        assert!(
            !label.starts_with(RESERVED_LABEL),
            "label is reserved for the runtime: {label}"
        );
        Self {
            label,
            scheduler: self.scheduler.clone(),
        }
    }

    fn register<N: Into<String>, H: Into<String>>(&self, name: N, help: H, metric: impl Metric) {
        let name = match (self.label.as_str(), name.into()) {
            ("", name) => name,
            (prefix, name) => format!("{prefix}_{name}"),
        };
        let help = help.into();
        self.scheduler
            .auditor
            .record("register", format!("{name}:{help}").as_bytes());
        self.scheduler
            .registry
            .lock()
            .unwrap()
            .register(name, help, metric);
    }

    fn encode(&self) -> String {
        let mut encoded = String::new();
        encode(&mut encoded, &self.scheduler.registry.lock().unwrap())
            .expect("writing to a string cannot fail");
        encoded
    }
}

/// Resolves once the clock reaches `deadline`.
struct Sleep {
    scheduler: Arc<Scheduler>,
    deadline: SystemTime,
    timer: Option<TimerKey>,
}

impl Future for Sleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.scheduler.now() >= this.deadline {
            this.timer = None;
            return Poll::Ready(());
        }
        let mut timers = this.scheduler.timers.lock().unwrap();
        match this.timer {
            Some(key) => {
                if let Some(waker) = timers.get_mut(&key) {
                    waker.clone_from(cx.waker());
                }
            }
            None => {
                let sequence = this.scheduler.next_timer.fetch_add(1, Ordering::SeqCst);
                let key = (this.deadline, sequence);
                timers.insert(key, cx.waker().clone());
                this.timer = Some(key);
            }
        }
        Poll::Pending
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        // A canceled sleep must not keep the clock moving
        if let Some(key) = self.timer.take() {
            self.scheduler.timers.lock().unwrap().remove(&key);
        }
    }
}

impl Clock for Context {
    fn current(&self) -> SystemTime {
        self.scheduler.now()
    }

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send + 'static {
        let deadline = self
            .current()
            .checked_add(duration)
            .expect("sleep deadline overflowed");
        self.sleep_until(deadline)
    }

    fn sleep_until(&self, deadline: SystemTime) -> impl Future<Output = ()> + Send + 'static {
        Sleep {
            scheduler: self.scheduler.clone(),
            deadline,
            timer: None,
        }
    }
}

impl Context {
    fn rng<T>(&self, method: &str, draw: impl FnOnce(&mut StdRng) -> T) -> T {
        self.scheduler.auditor.record("rand", method.as_bytes());
        draw(&mut self.scheduler.rng.lock().unwrap())
    }
}

impl RngCore for Context {
    fn next_u32(&mut self) -> u32 {
        self.rng("next_u32", |rng| rng.next_u32())
    }

    fn next_u64(&mut self) -> u64 {
        self.rng("next_u64", |rng| rng.next_u64())
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.rng("fill_bytes", |rng| rng.fill_bytes(dest))
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.rng("try_fill_bytes", |rng| rng.try_fill_bytes(dest))
    }
}

impl CryptoRng for Context {}
