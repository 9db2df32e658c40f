//! Queue-backed processor that delivers merged batches from a background thread.
//!
//! The producer and the consumer thread share two things: the [`DiskQueue`], behind its own
//! lock, and the processor state guarded by a mutex and paired with a condvar. Neither lock is
//! ever taken while the other is held.

use std::{
    fmt::Debug,
    path::{Path, PathBuf},
    sync::Arc,
    thread::JoinHandle,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};
use tracklog_backend::{BackendError, RemoteBackend};
use tracklog_ops::{ContainerType, Operation};
use tracklog_queue::{DEFAULT_MAX_FILE_SIZE, DiskQueue};

use crate::{
    Error, OperationProcessor, Result,
    batcher::{Batch, BatchLimits, Batcher},
    clean_uploaded_files,
    storage::{OperationStorage, ProcessorMode},
};

const CONSUMER_THREAD_NAME: &str = "tracklog-async-op-processor";

/// How often `stop` reports on a queue that is still draining.
const STOP_PROGRESS_INTERVAL: Duration = Duration::from_secs(30);

type SharedQueue = Arc<Mutex<DiskQueue<Operation>>>;

type Callback = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone)]
pub struct AsyncProcessorSettings {
    /// Base directory, each execution gets its own directory below it.
    pub data_dir: PathBuf,
    /// How long the consumer sleeps between cycles when nothing wakes it.
    pub sleep_time: Duration,
    pub batch_limits: BatchLimits,
    pub max_segment_size: u64,
    /// Attempts after the first failed one before the consumer gives up.
    pub max_retries: usize,
    pub retry_wait: Duration,
    /// Used by `stop` when no timeout is given.
    pub stop_timeout: Duration,
    pub lag_threshold: Duration,
    pub no_progress_threshold: Duration,
}

impl Default for AsyncProcessorSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".tracklog"),
            sleep_time: Duration::from_secs(5),
            batch_limits: BatchLimits::default(),
            max_segment_size: DEFAULT_MAX_FILE_SIZE,
            max_retries: 10,
            retry_wait: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(300),
            lag_threshold: Duration::from_secs(1800),
            no_progress_threshold: Duration::from_secs(300),
        }
    }
}

/// Lifecycle of the consumer thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorStatus {
    /// Created, consumer not started yet.
    Idle,
    Running,
    /// Running, but not taking new batches.
    Paused,
    /// Asked to finish, the consumer is still alive.
    Stopping,
    /// The consumer is gone, through `stop` or because delivery failed for good.
    Stopped,
}

impl ProcessorStatus {
    fn consumer_alive(&self) -> bool {
        matches!(self, Self::Running | Self::Paused | Self::Stopping)
    }
}

#[derive(Debug)]
struct ProcessorState {
    status: ProcessorStatus,
    /// Set by `stop`: the consumer wakes on every enqueue instead of sleeping out its period.
    sleep_disabled: bool,
    wake_requested: bool,
    interrupted: bool,
    last_put_version: u64,
    /// Highest acknowledged version.
    consumed_version: u64,
    last_ack: Instant,
    last_backoff: Option<Instant>,
    lag_reported: bool,
    no_progress_reported: bool,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<ProcessorState>,
    cond: Condvar,
}

impl Shared {
    fn wake(&self) {
        self.state.lock().wake_requested = true;
        self.cond.notify_all();
    }
}

#[derive(Default)]
struct Callbacks {
    lag: Option<Callback>,
    no_progress: Option<Callback>,
}

impl Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("lag", &self.lag.is_some())
            .field("no_progress", &self.no_progress.is_some())
            .finish()
    }
}

/// Persists operations to a disk queue and ships them from a background consumer thread.
#[derive(Debug)]
pub struct AsyncOperationProcessor {
    container_id: String,
    container_type: ContainerType,
    storage: OperationStorage,
    queue: SharedQueue,
    backend: Arc<dyn RemoteBackend>,
    settings: AsyncProcessorSettings,
    shared: Arc<Shared>,
    callbacks: Callbacks,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncOperationProcessor {
    pub fn new(
        container_id: impl Into<String>,
        container_type: ContainerType,
        backend: Arc<dyn RemoteBackend>,
        settings: AsyncProcessorSettings,
    ) -> Result<Self> {
        let container_id = container_id.into();
        let storage = OperationStorage::create(&settings.data_dir, &container_id, container_type)?;
        let queue = DiskQueue::open(storage.dir(), settings.max_segment_size)?;
        storage.write_metadata(ProcessorMode::Async, &container_id, container_type)?;

        let state = ProcessorState {
            status: ProcessorStatus::Idle,
            sleep_disabled: false,
            wake_requested: false,
            interrupted: false,
            last_put_version: queue.last_put_version(),
            consumed_version: queue.last_ack_version(),
            last_ack: Instant::now(),
            last_backoff: None,
            lag_reported: false,
            no_progress_reported: false,
        };

        Ok(Self {
            container_id,
            container_type,
            storage,
            queue: Arc::new(Mutex::new(queue)),
            backend,
            settings,
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                cond: Condvar::new(),
            }),
            callbacks: Callbacks::default(),
            consumer: Mutex::new(None),
        })
    }

    /// Called once per episode in which nothing was acknowledged for longer than the lag
    /// threshold.
    pub fn with_lag_callback(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.callbacks.lag = Some(Arc::new(callback));
        self
    }

    /// Called once when delivery keeps failing for longer than the no-progress threshold.
    pub fn with_no_progress_callback(
        mut self,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        self.callbacks.no_progress = Some(Arc::new(callback));
        self
    }

    /// Directory holding the queue of this execution.
    pub fn data_dir(&self) -> &Path {
        self.storage.dir()
    }

    pub fn status(&self) -> ProcessorStatus {
        self.shared.state.lock().status
    }

    /// When the consumer last started waiting to retry a failed delivery.
    pub fn last_backoff_time(&self) -> Option<Instant> {
        self.shared.state.lock().last_backoff
    }

    /// Fire the lag and no-progress callbacks if they are due.
    fn check_progress(&self) {
        let now = Instant::now();
        let (lag, no_progress) = {
            let mut state = self.shared.state.lock();
            let since_ack = now.saturating_duration_since(state.last_ack);

            let lag = !state.lag_reported && since_ack > self.settings.lag_threshold;
            if lag {
                state.lag_reported = true;
            }

            let failing = state.last_backoff.is_some_and(|b| b >= state.last_ack);
            let no_progress = failing
                && !state.no_progress_reported
                && since_ack > self.settings.no_progress_threshold;
            if no_progress {
                state.no_progress_reported = true;
            }
            (lag, no_progress)
        };

        if lag {
            warn!(
                container_id = %self.container_id,
                threshold = ?self.settings.lag_threshold,
                "operations are waiting longer than the lag threshold"
            );
            if let Some(callback) = &self.callbacks.lag {
                callback();
            }
        }
        if no_progress {
            warn!(
                container_id = %self.container_id,
                threshold = ?self.settings.no_progress_threshold,
                "no operations delivered within the no-progress threshold"
            );
            if let Some(callback) = &self.callbacks.no_progress {
                callback();
            }
        }
    }

    /// Block until the consumer thread has finished or `deadline` passes. Returns whether it
    /// finished.
    fn wait_for_consumer_exit(&self, deadline: Instant) -> bool {
        let mut state = self.shared.state.lock();
        while state.status != ProcessorStatus::Stopped {
            if self.shared.cond.wait_until(&mut state, deadline).timed_out() {
                return state.status == ProcessorStatus::Stopped;
            }
        }
        true
    }

    /// Block until `target` is acknowledged, the consumer dies, or `deadline` passes.
    fn wait_for_drain(&self, target: u64, deadline: Instant) {
        let mut state = self.shared.state.lock();
        let initial = target.saturating_sub(state.consumed_version);
        let mut next_report = Instant::now() + STOP_PROGRESS_INTERVAL;

        loop {
            if state.consumed_version >= target {
                info!(container_id = %self.container_id, "all operations delivered");
                return;
            }
            if !state.status.consumer_alive() {
                warn!(
                    container_id = %self.container_id,
                    remaining = target - state.consumed_version,
                    "consumer stopped before the queue was drained"
                );
                return;
            }

            let now = Instant::now();
            let remaining = target - state.consumed_version;
            if now >= deadline {
                warn!(
                    container_id = %self.container_id,
                    remaining,
                    storage_dir = ?self.storage.dir(),
                    "stop timed out, remaining operations are kept on disk"
                );
                return;
            }
            if now >= next_report {
                let percent_done = initial.saturating_sub(remaining) * 100 / initial.max(1);
                warn!(
                    container_id = %self.container_id,
                    remaining,
                    percent_done,
                    "still waiting for operations to be delivered"
                );
                next_report += STOP_PROGRESS_INTERVAL;
            }

            self.shared
                .cond
                .wait_until(&mut state, deadline.min(next_report));
        }
    }
}

impl OperationProcessor for AsyncOperationProcessor {
    fn enqueue_operation(&self, op: &Operation, wait: bool) -> Result<()> {
        if self.status() == ProcessorStatus::Stopped {
            return Err(Error::SynchronizationAlreadyStopped);
        }

        let (version, overflowing) = {
            let mut queue = self.queue.lock();
            let version = queue.put(op)?;
            (version, queue.is_overflowing())
        };

        let wake = {
            let mut state = self.shared.state.lock();
            state.last_put_version = version;
            let wake = overflowing || state.sleep_disabled;
            if wake {
                state.wake_requested = true;
            }
            wake
        };
        if wake {
            self.shared.cond.notify_all();
        }

        self.check_progress();

        if wait {
            self.wait()?;
        }
        Ok(())
    }

    fn wait(&self) -> Result<()> {
        self.flush()?;
        self.shared.wake();

        let mut state = self.shared.state.lock();
        let target = state.last_put_version;
        loop {
            if state.consumed_version >= target {
                return Ok(());
            }
            if !state.status.consumer_alive() {
                return Err(Error::SynchronizationAlreadyStopped);
            }
            self.shared.cond.wait(&mut state);
        }
    }

    fn flush(&self) -> Result<()> {
        Ok(self.queue.lock().flush()?)
    }

    fn start(&self) -> Result<()> {
        let mut consumer = self.consumer.lock();
        {
            let mut state = self.shared.state.lock();
            if state.status != ProcessorStatus::Idle {
                debug!(status = ?state.status, "consumer already started");
                return Ok(());
            }
            state.status = ProcessorStatus::Running;
        }

        let context = Consumer {
            container_id: self.container_id.clone(),
            container_type: self.container_type,
            queue: Arc::clone(&self.queue),
            backend: Arc::clone(&self.backend),
            batcher: Batcher::new(
                Arc::clone(&self.queue),
                Arc::clone(&self.backend),
                self.settings.batch_limits,
            ),
            shared: Arc::clone(&self.shared),
            sleep_time: self.settings.sleep_time,
            max_retries: self.settings.max_retries,
            retry_wait: self.settings.retry_wait,
        };

        let handle = std::thread::Builder::new()
            .name(CONSUMER_THREAD_NAME.to_string())
            .spawn(move || context.run())
            .map_err(|e| {
                self.shared.state.lock().status = ProcessorStatus::Stopped;
                Error::SpawnConsumer(e)
            })?;
        *consumer = Some(handle);
        info!(container_id = %self.container_id, "started async operation processor");
        Ok(())
    }

    fn pause(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            if state.status == ProcessorStatus::Running {
                state.status = ProcessorStatus::Paused;
            }
        }
        self.flush()
    }

    fn resume(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            if state.status == ProcessorStatus::Paused {
                state.status = ProcessorStatus::Running;
            }
            state.wake_requested = true;
        }
        self.shared.cond.notify_all();
        Ok(())
    }

    fn stop(&self, timeout: Option<Duration>) -> Result<()> {
        let timeout = timeout.unwrap_or(self.settings.stop_timeout);
        let deadline = Instant::now() + timeout;
        self.flush()?;

        let handle = self.consumer.lock().take();
        if let Some(handle) = handle {
            let target = {
                let mut state = self.shared.state.lock();
                state.sleep_disabled = true;
                state.wake_requested = true;
                if state.status == ProcessorStatus::Paused {
                    state.status = ProcessorStatus::Running;
                }
                state.last_put_version
            };
            self.shared.cond.notify_all();

            self.wait_for_drain(target, deadline);

            {
                let mut state = self.shared.state.lock();
                state.interrupted = true;
                if state.status.consumer_alive() {
                    state.status = ProcessorStatus::Stopping;
                }
            }
            self.shared.cond.notify_all();

            if !self.wait_for_consumer_exit(deadline) {
                // the queue stays open for the consumer, a later stop closes it
                warn!(
                    container_id = %self.container_id,
                    storage_dir = ?self.storage.dir(),
                    "consumer still busy at the stop deadline, leaving it to finish in the background"
                );
                return Ok(());
            }
            if handle.join().is_err() {
                error!(container_id = %self.container_id, "consumer thread panicked");
            }
        }

        {
            let mut state = self.shared.state.lock();
            // a consumer left running by an earlier stop still owns the queue
            if state.status.consumer_alive() {
                debug!(status = ?state.status, "consumer still running, queue left open");
                return Ok(());
            }
            state.status = ProcessorStatus::Stopped;
        }
        self.shared.cond.notify_all();

        let mut queue = self.queue.lock();
        queue.close()?;
        // already cleaned up by an earlier stop
        if !queue.dir().exists() {
            return Ok(());
        }
        if !queue.cleanup_if_empty()? {
            info!(
                storage_dir = ?self.storage.dir(),
                remaining = queue.size(),
                "undelivered operations kept for a later sync"
            );
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(self.queue.lock().close()?)
    }
}

enum Drain {
    /// Nothing left to send, or paused.
    Idle,
    Interrupted,
}

/// Everything the consumer thread owns.
struct Consumer {
    container_id: String,
    container_type: ContainerType,
    queue: SharedQueue,
    backend: Arc<dyn RemoteBackend>,
    batcher: Batcher<SharedQueue>,
    shared: Arc<Shared>,
    sleep_time: Duration,
    max_retries: usize,
    retry_wait: Duration,
}

impl Consumer {
    fn run(mut self) {
        debug!(container_id = %self.container_id, "consumer thread started");
        let mut last_flush = Instant::now();

        loop {
            if last_flush.elapsed() >= self.sleep_time {
                if let Err(error) = self.queue.lock().flush() {
                    warn!(%error, "periodic queue flush failed");
                }
                last_flush = Instant::now();
            }

            match self.drain() {
                Ok(Drain::Idle) => {}
                Ok(Drain::Interrupted) => break,
                Err(error) => {
                    error!(
                        container_id = %self.container_id,
                        %error,
                        "operation delivery stopped, remaining operations stay on disk"
                    );
                    break;
                }
            }

            let mut state = self.shared.state.lock();
            if state.interrupted {
                break;
            }
            if !state.wake_requested {
                self.shared.cond.wait_for(&mut state, self.sleep_time);
            }
            state.wake_requested = false;
            if state.interrupted {
                break;
            }
        }

        let mut state = self.shared.state.lock();
        state.status = ProcessorStatus::Stopped;
        drop(state);
        self.shared.cond.notify_all();
        debug!(container_id = %self.container_id, "consumer thread finished");
    }

    fn drain(&mut self) -> Result<Drain> {
        let mut collect_retries = 0;
        loop {
            {
                let state = self.shared.state.lock();
                if state.interrupted {
                    return Ok(Drain::Interrupted);
                }
                if state.status == ProcessorStatus::Paused {
                    return Ok(Drain::Idle);
                }
            }

            let batch = match self.batcher.collect_batch() {
                Ok(Some(batch)) => batch,
                Ok(None) => return Ok(Drain::Idle),
                // a copy source could not be fetched, the batcher kept the copy for the next try
                Err(Error::Backend(error)) if error.is_retryable() => {
                    if !self.retry(&mut collect_retries, error)? {
                        return Ok(Drain::Interrupted);
                    }
                    continue;
                }
                Err(error) => return Err(error),
            };
            collect_retries = 0;
            if !self.send(batch)? {
                return Ok(Drain::Interrupted);
            }
        }
    }

    /// Count one more failed attempt and wait before the next one. Fails once `max_retries` is
    /// used up, returns `false` if interrupted while waiting.
    fn retry(&self, retries: &mut usize, error: BackendError) -> Result<bool> {
        if *retries >= self.max_retries {
            return Err(error.into());
        }
        *retries += 1;
        warn!(
            %error,
            attempt = *retries,
            max_retries = self.max_retries,
            wait = ?self.retry_wait,
            "backend unreachable, retrying"
        );
        Ok(self.backoff())
    }

    /// Deliver one batch and acknowledge it. Returns `false` if interrupted while retrying.
    fn send(&mut self, batch: Batch) -> Result<bool> {
        let Batch {
            operations,
            dropped,
            version,
        } = batch;

        if dropped > 0 {
            warn!(dropped, version, "operations dropped from batch");
        }
        for inconsistency in &operations.errors {
            error!(path = %inconsistency.path, error = %inconsistency, "operation not applied");
        }

        let mut retries = 0;
        while operations.operations_count() > 0 {
            match self.backend.execute_operations(
                &self.container_id,
                self.container_type,
                &operations,
            ) {
                Ok((accepted, errors)) => {
                    debug!(version, accepted, rejected = errors.len(), "batch delivered");
                    for business in &errors {
                        error!(path = %business.path, error = %business, "operation rejected by the backend");
                    }
                    clean_uploaded_files(&operations);
                    break;
                }
                Err(error) if error.is_retryable() => {
                    if !self.retry(&mut retries, error)? {
                        return Ok(false);
                    }
                }
                Err(error) => {
                    error!(%error, version, "batch failed and will not be retried");
                    break;
                }
            }
        }

        self.queue.lock().ack(version)?;
        let mut state = self.shared.state.lock();
        state.consumed_version = version;
        state.last_ack = Instant::now();
        state.lag_reported = false;
        state.no_progress_reported = false;
        drop(state);
        self.shared.cond.notify_all();
        Ok(true)
    }

    /// Sleep before a retry. Returns `false` if interrupted.
    fn backoff(&self) -> bool {
        let deadline = Instant::now() + self.retry_wait;
        let mut state = self.shared.state.lock();
        state.last_backoff = Some(Instant::now());
        while !state.interrupted {
            if self.shared.cond.wait_until(&mut state, deadline).timed_out() {
                return true;
            }
        }
        false
    }
}
