//! The engine thread and its command dispatcher.
//!
//! All engine work runs on one dedicated thread. [`CommandDispatcher`] is
//! the only way onto it: callers submit a task, block until it ran, and get
//! its result back on their own thread.
//!
//! # Scheduling
//!
//! ```text
//! caller ──► ready queue ──► engine thread ──► result ──► caller
//!                 │  ▲
//!     loading?    ▼  │ status left Loading
//!              deferred queue
//! ```
//!
//! A task that must not run mid-navigation is parked in the deferred queue
//! while the status is [`Phase::Loading`](crate::readiness::Phase::Loading)
//! and moved back when the status changes. There is no polling.

// ============================================================================
// Imports
// ============================================================================

use std::any::Any;
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use rand::Rng;
use tracing::{debug, error, trace, warn};

use crate::driver::Settings;
use crate::error::{Error, Result};
use crate::network::NetworkGateway;
use crate::readiness::{Phase, ReadinessMonitor};

use super::engine::{self, EngineFactory, EngineHost};

// ============================================================================
// Constants
// ============================================================================

/// Bounds of the randomized pause after a settling task.
const SETTLE_PAUSE_MS: (u64, u64) = (30, 70);

// ============================================================================
// ExecOptions
// ============================================================================

/// Per-call dispatch options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOptions {
    /// Deadline for the result; `None` or zero uses the dispatcher default.
    pub timeout: Option<Duration>,
    /// Park the task while a navigation is in progress.
    pub defer_while_loading: bool,
    /// Pause 30-70 ms after the task so bursts of actions are spread out.
    pub settle: bool,
    /// Name used in logs and timeout errors.
    pub label: &'static str,
}

impl ExecOptions {
    /// Options for a task that may run at any time.
    #[must_use]
    pub const fn immediate(label: &'static str) -> Self {
        Self {
            timeout: None,
            defer_while_loading: false,
            settle: false,
            label,
        }
    }

    /// Options for a task that waits for the current navigation to end.
    #[must_use]
    pub const fn after_load(label: &'static str) -> Self {
        Self {
            timeout: None,
            defer_while_loading: true,
            settle: false,
            label,
        }
    }

    /// Sets the deadline.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Adds the settle pause.
    #[must_use]
    pub const fn with_settle(mut self) -> Self {
        self.settle = true;
        self
    }
}

// ============================================================================
// Queue
// ============================================================================

type Job = Box<dyn FnOnce(&EngineHost) + Send>;

struct QueuedJob {
    job: Job,
    label: &'static str,
    defer_while_loading: bool,
    cancelled: Arc<AtomicBool>,
}

#[derive(Default)]
struct Queue {
    ready: VecDeque<QueuedJob>,
    deferred: VecDeque<QueuedJob>,
    shutdown: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    wake: Condvar,
}

impl Shared {
    /// Moves every deferred job back to the ready queue.
    fn release_deferred(&self) {
        let mut queue = self.queue.lock();
        if queue.deferred.is_empty() {
            return;
        }
        let count = queue.deferred.len();
        let deferred = std::mem::take(&mut queue.deferred);
        queue.ready.extend(deferred);
        drop(queue);

        trace!(count, "Deferred tasks released");
        self.wake.notify_all();
    }
}

// ============================================================================
// CommandDispatcher
// ============================================================================

/// Runs tasks on the engine thread.
pub struct CommandDispatcher {
    shared: Arc<Shared>,
    monitor: ReadinessMonitor,
    engine_thread: ThreadId,
    handle: Mutex<Option<JoinHandle<()>>>,
    default_timeout: Duration,
}

impl CommandDispatcher {
    /// Starts the engine thread and builds the gateway and engine on it.
    ///
    /// # Errors
    ///
    /// Returns the error of the gateway or the engine factory, or
    /// [`Error::Io`] if the thread cannot be spawned.
    pub fn spawn(settings: &Settings, monitor: ReadinessMonitor, factory: EngineFactory) -> Result<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue::default()),
            wake: Condvar::new(),
        });

        let (init_tx, init_rx) = mpsc::sync_channel::<Result<()>>(1);
        let thread_settings = settings.clone();
        let thread_monitor = monitor.clone();
        let thread_shared = Arc::clone(&shared);

        let handle = thread::Builder::new()
            .name("engine".into())
            .spawn(move || {
                let host = match NetworkGateway::new(&thread_settings, thread_monitor.clone())
                    .and_then(|gateway| {
                        EngineHost::build(Arc::new(gateway), thread_monitor, factory)
                    }) {
                    Ok(host) => Rc::new(host),
                    Err(e) => {
                        let _ = init_tx.send(Err(e));
                        return;
                    }
                };

                engine::install(Rc::clone(&host));
                let _ = init_tx.send(Ok(()));
                drop(init_tx);

                run_loop(&thread_shared, &host);

                drop(host);
                drop(engine::uninstall());
                debug!("Engine thread stopped");
            })
            .map_err(Error::Io)?;

        let engine_thread = handle.thread().id();

        match init_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(e);
            }
            Err(_) => {
                let _ = handle.join();
                return Err(Error::EngineShutdown);
            }
        }

        let weak: Weak<Shared> = Arc::downgrade(&shared);
        monitor.status().subscribe(Arc::new(move |phase| {
            if phase != Phase::Loading
                && let Some(shared) = weak.upgrade()
            {
                shared.release_deferred();
            }
        }));

        debug!("Engine thread started");

        Ok(Self {
            shared,
            monitor,
            engine_thread,
            handle: Mutex::new(Some(handle)),
            default_timeout: settings.command_timeout(),
        })
    }

    /// Returns the readiness monitor gating deferred tasks.
    #[inline]
    #[must_use]
    pub fn monitor(&self) -> &ReadinessMonitor {
        &self.monitor
    }

    /// Returns the default deadline.
    #[inline]
    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Returns `true` when called from the engine thread.
    #[inline]
    #[must_use]
    pub fn is_engine_thread(&self) -> bool {
        thread::current().id() == self.engine_thread
    }

    /// Number of queued tasks, deferred ones included.
    #[must_use]
    pub fn queued(&self) -> usize {
        let queue = self.shared.queue.lock();
        queue.ready.len() + queue.deferred.len()
    }

    /// Runs `task` on the engine thread and returns its result.
    ///
    /// Called from the engine thread itself, the task runs inline.
    ///
    /// # Errors
    ///
    /// - [`Error::Timeout`] if the result is not ready within the deadline;
    ///   the task is cancelled and does nothing if it runs later
    /// - [`Error::TaskPanicked`] if the task panicked
    /// - [`Error::EngineShutdown`] if the engine thread is gone
    /// - Any error returned by the task
    pub fn execute<T, F>(&self, options: ExecOptions, task: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&EngineHost) -> Result<T> + Send + 'static,
    {
        if self.is_engine_thread() {
            let host = engine::current().ok_or(Error::EngineShutdown)?;
            trace!(task = options.label, "Running task inline");
            return run_caught(&host, task);
        }

        let (result_tx, result_rx) = mpsc::sync_channel::<Result<T>>(1);
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);
        let label = options.label;
        let settle = options.settle;

        let job: Job = Box::new(move |host| {
            if flag.load(Ordering::SeqCst) {
                trace!(task = label, "Skipping cancelled task");
                return;
            }

            let result = run_caught(host, task);
            if settle {
                settle_pause();
            }

            if flag.load(Ordering::SeqCst) {
                debug!(task = label, "Dropping result of timed-out task");
                return;
            }
            let _ = result_tx.send(result);
        });

        {
            let mut queue = self.shared.queue.lock();
            if queue.shutdown {
                return Err(Error::EngineShutdown);
            }
            queue.ready.push_back(QueuedJob {
                job,
                label,
                defer_while_loading: options.defer_while_loading,
                cancelled: Arc::clone(&cancelled),
            });
        }
        self.shared.wake.notify_all();

        let timeout = match options.timeout {
            Some(timeout) if !timeout.is_zero() => timeout,
            _ => self.default_timeout,
        };

        match result_rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                cancelled.store(true, Ordering::SeqCst);
                warn!(task = label, timeout_ms = timeout.as_millis(), "Task timed out");
                Err(Error::timeout(
                    label,
                    u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                ))
            }
            Err(RecvTimeoutError::Disconnected) => Err(Error::EngineShutdown),
        }
    }

    /// Stops the engine thread after the ready queue drained.
    ///
    /// Deferred tasks are dropped; their callers get
    /// [`Error::EngineShutdown`]. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut queue = self.shared.queue.lock();
            if queue.shutdown {
                return;
            }
            queue.shutdown = true;
        }
        self.shared.wake.notify_all();

        if self.is_engine_thread() {
            return;
        }
        if let Some(handle) = self.handle.lock().take()
            && handle.join().is_err()
        {
            error!("Engine thread panicked during shutdown");
        }
    }
}

impl Drop for CommandDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// Engine thread
// ============================================================================

fn run_loop(shared: &Shared, host: &EngineHost) {
    loop {
        let Some(next) = next_job(shared, host) else {
            break;
        };

        if next.cancelled.load(Ordering::SeqCst) {
            trace!(task = next.label, "Discarding cancelled task");
            continue;
        }
        trace!(task = next.label, "Running task");
        (next.job)(host);
    }

    let dropped = {
        let mut queue = shared.queue.lock();
        let deferred = std::mem::take(&mut queue.deferred);
        deferred.len()
    };
    if dropped > 0 {
        debug!(dropped, "Deferred tasks dropped at shutdown");
    }
}

/// Blocks until a runnable job exists, or returns `None` on shutdown.
fn next_job(shared: &Shared, host: &EngineHost) -> Option<QueuedJob> {
    let mut queue = shared.queue.lock();
    loop {
        while let Some(job) = queue.ready.pop_front() {
            if job.defer_while_loading && host.monitor().status().is_loading() {
                trace!(task = job.label, "Deferring task until load ends");
                queue.deferred.push_back(job);
                continue;
            }
            return Some(job);
        }

        if queue.shutdown {
            return None;
        }
        shared.wake.wait(&mut queue);
    }
}

fn run_caught<T, F>(host: &EngineHost, task: F) -> Result<T>
where
    F: FnOnce(&EngineHost) -> Result<T>,
{
    match catch_unwind(AssertUnwindSafe(|| task(host))) {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(message = %message, "Dispatched task panicked");
            Err(Error::TaskPanicked { message })
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn settle_pause() {
    let (min, max) = SETTLE_PAUSE_MS;
    let pause = rand::thread_rng().gen_range(min..=max);
    thread::sleep(Duration::from_millis(pause));
}

// ============================================================================
// Tests
// ============================================================================
