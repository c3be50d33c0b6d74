//! Command execution engine.
//!
//! One [`CommandChannel`] serves every instance: a FIFO of [`Job`]s, one
//! worker thread that runs all plugin code, and a supervisor enforcing the
//! per-command wall clock. Faults are contained per job:
//!
//! - a panic inside the entrypoint ends the job as *crashed* and the
//!   worker is replaced;
//! - a job that outlives [`COMMAND_TIMEOUT`] has its cancel token tripped
//!   (module-API calls observe it and unwind); if the worker still does
//!   not come back it is abandoned and a fresh one is spawned.
//!
//! Either way the originating channel receives exactly one
//! `"<user>: command <crashed|timeout>"` line (suppressed for
//! interval-driven modules, whose host may simply be down) and the next
//! job is served normally. Jobs whose module was unloaded after enqueue
//! are dropped without running.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::instance::InstanceCore;
use crate::plugin::api::ModuleCtx;
use crate::plugin::Module;

/// Wall-clock budget for one plugin invocation.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// One queued invocation of a module.
#[derive(Debug)]
pub struct Job {
    /// The module to invoke.
    pub module: Arc<Module>,
    /// The instance the command arrived on.
    pub link: Arc<InstanceCore>,
    /// Channel (or querying nick) the reply targets.
    pub channel: String,
    /// Invoking nick; empty for interval ticks on a quiet channel.
    pub user: String,
    /// Message text after the command token.
    pub message: String,
}

/// Panic payload used to unwind a cancelled job.
pub struct JobCancelled;

#[derive(Default)]
struct CancelInner {
    cancelled: std::sync::atomic::AtomicBool,
    deadline: Mutex<Option<Instant>>,
}

/// Cooperative cancellation observed by every module-API call.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl CancelToken {
    /// A token with no deadline.
    pub fn new() -> Self {
        Self::default()
    }

    fn arm(&self, deadline: Instant) {
        *self.inner.deadline.lock() = Some(deadline);
    }

    /// Trip the token.
    pub fn cancel(&self) {
        self.inner
            .cancelled
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    /// Whether the job is out of time.
    pub fn expired(&self) -> bool {
        if self.inner.cancelled.load(std::sync::atomic::Ordering::SeqCst) {
            return true;
        }
        matches!(*self.inner.deadline.lock(), Some(d) if Instant::now() >= d)
    }

    /// Unwind the job if it is out of time.
    pub fn check(&self) {
        if self.expired() {
            std::panic::panic_any(JobCancelled);
        }
    }
}

enum Outcome {
    Done,
    Cancelled,
    Crashed,
}

struct Task {
    job: Job,
    cancel: CancelToken,
}

struct WorkerHandle {
    task_tx: Sender<Task>,
    done_rx: Receiver<Outcome>,
    _join: JoinHandle<()>,
}

fn spawn_worker() -> WorkerHandle {
    let (task_tx, task_rx) = bounded::<Task>(1);
    let (done_tx, done_rx) = bounded::<Outcome>(1);

    let join = std::thread::Builder::new()
        .name("module-worker".into())
        .spawn(move || worker_loop(task_rx, done_tx))
        .expect("failed to spawn worker thread");

    WorkerHandle {
        task_tx,
        done_rx,
        _join: join,
    }
}

fn worker_loop(task_rx: Receiver<Task>, done_tx: Sender<Outcome>) {
    while let Ok(task) = task_rx.recv() {
        let outcome = run_job(task);
        let crashed = matches!(outcome, Outcome::Crashed);
        if done_tx.send(outcome).is_err() {
            // The supervisor abandoned us mid-job.
            return;
        }
        if crashed {
            return;
        }
    }
}

fn run_job(task: Task) -> Outcome {
    let Task { job, cancel } = task;
    let result = catch_unwind(AssertUnwindSafe(|| {
        let ctx = ModuleCtx::new(
            Arc::clone(&job.module),
            Arc::clone(&job.link),
            cancel.clone(),
        );
        job.module.run(&ctx, &job.channel, &job.user, &job.message);
    }));

    match result {
        Ok(()) => Outcome::Done,
        Err(payload) if payload.is::<JobCancelled>() => Outcome::Cancelled,
        Err(_) => Outcome::Crashed,
    }
}

/// The shared FIFO plus its supervisor and worker.
pub struct CommandChannel {
    jobs_tx: Mutex<Option<Sender<Job>>>,
    jobs_rx: Receiver<Job>,
    timeout: Duration,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl CommandChannel {
    /// A channel with the default timeout, not yet running.
    pub fn new() -> Self {
        Self::with_timeout(COMMAND_TIMEOUT)
    }

    /// A channel with a custom timeout, not yet running.
    pub fn with_timeout(timeout: Duration) -> Self {
        let (jobs_tx, jobs_rx) = unbounded();
        Self {
            jobs_tx: Mutex::new(Some(jobs_tx)),
            jobs_rx,
            timeout,
            supervisor: Mutex::new(None),
        }
    }

    /// Start the supervisor and worker. Idempotent.
    pub fn begin(&self) {
        let mut supervisor = self.supervisor.lock();
        if supervisor.is_some() {
            return;
        }
        let jobs_rx = self.jobs_rx.clone();
        let timeout = self.timeout;
        let handle = std::thread::Builder::new()
            .name("command-channel".into())
            .spawn(move || supervise(jobs_rx, timeout))
            .expect("failed to spawn supervisor thread");
        *supervisor = Some(handle);
        info!("command channel running");
    }

    /// Enqueue a job; `false` once the channel is closed.
    pub fn push(&self, job: Job) -> bool {
        match self.jobs_tx.lock().as_ref() {
            Some(tx) => tx.send(job).is_ok(),
            None => false,
        }
    }

    /// Jobs waiting in the FIFO.
    pub fn pending(&self) -> usize {
        self.jobs_rx.len()
    }

    /// Whether `begin` has been called and `close` has not.
    pub fn is_running(&self) -> bool {
        self.supervisor.lock().is_some()
    }

    /// Close the writer side, drain remaining jobs, and join.
    pub fn close(&self) {
        drop(self.jobs_tx.lock().take());
        if let Some(handle) = self.supervisor.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Default for CommandChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CommandChannel {
    fn drop(&mut self) {
        self.close();
    }
}

fn supervise(jobs_rx: Receiver<Job>, timeout: Duration) {
    let mut worker: Option<WorkerHandle> = None;

    while let Ok(job) = jobs_rx.recv() {
        // Jobs referencing an unloaded module never run.
        if job.link.modules.is_unloaded(job.module.id()) {
            debug!(module = job.module.name(), "dropping job for unloaded module");
            continue;
        }

        let link = Arc::clone(&job.link);
        let channel = job.channel.clone();
        let user = job.user.clone();
        let suppress = job.module.interval().is_some();
        let name = job.module.name().to_string();

        let cancel = CancelToken::new();
        cancel.arm(Instant::now() + timeout);

        let (task_tx, done_rx) = {
            let handle = worker.get_or_insert_with(spawn_worker);
            (handle.task_tx.clone(), handle.done_rx.clone())
        };
        if task_tx
            .send(Task {
                job,
                cancel: cancel.clone(),
            })
            .is_err()
        {
            // Worker died outside a job; replace it and drop this one.
            worker = None;
            continue;
        }

        match done_rx.recv_timeout(timeout) {
            Ok(Outcome::Done) => {
                link.wake();
            }
            Ok(Outcome::Cancelled) => {
                warn!(module = %name, "command timeout");
                report(&link, &channel, &user, "timeout", suppress);
            }
            Ok(Outcome::Crashed) => {
                warn!(module = %name, "command crashed");
                report(&link, &channel, &user, "crashed", suppress);
                worker = None;
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(module = %name, "command timeout, abandoning worker");
                cancel.cancel();
                report(&link, &channel, &user, "timeout", suppress);
                worker = None;
            }
            Err(RecvTimeoutError::Disconnected) => {
                worker = None;
            }
        }
    }
}

fn report(link: &InstanceCore, channel: &str, user: &str, adjective: &str, suppress: bool) {
    if !suppress {
        link.write(channel, &format!("{user}: command {adjective}"));
    }
    link.wake();
}
