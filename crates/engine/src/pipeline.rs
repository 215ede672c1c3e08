//! Concurrent Pipeline
//!
//! Two-stage producer/consumer execution over two tokio runtimes. The
//! producer runs on a single-worker I/O runtime and submits items; each item
//! is processed on the CPU runtime. Admission is bounded either by a channel
//! of buffered items or by a weight budget of in-flight tasks.
//!
//! ## Lifecycle
//!
//! 1. [`Pipeline::new`] builds both runtimes
//! 2. [`Pipeline::start`] spawns the producer on the I/O runtime
//! 3. [`Pipeline::stop`] (or a signal) cancels; dispatched tasks still finish
//! 4. [`Pipeline::join`] blocks until `on_all_tasks_complete` ran

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use binscope_core::{CoreError, CoreResult, TimeTracker};
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::combined::panic_message;

// ============================================================================
// Configuration
// ============================================================================

/// How many produced items may be in flight.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionLimit {
    /// Bounded buffer between producer and a fixed set of workers
    BufferedItems(usize),
    /// At most this many tasks dispatched at once
    MaxConcurrentTasks(u64),
    /// Budget on the summed `task_weight` of dispatched tasks
    MaxLoadedBytes(u64),
}

impl Default for AdmissionLimit {
    fn default() -> Self {
        Self::MaxLoadedBytes(256 * 1024 * 1024)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PipelineConfig {
    /// CPU worker threads, `None` for one per core
    pub cpu_threads: Option<usize>,
    pub admission: AdmissionLimit,
}

impl PipelineConfig {
    pub fn cpu_threads(&self) -> usize {
        self.cpu_threads.unwrap_or_else(num_cpus::get).max(1)
    }
}

// ============================================================================
// PipelineTask
// ============================================================================

/// Work driven by a [`Pipeline`].
#[async_trait]
pub trait PipelineTask: Send + Sync + Sized + 'static {
    type Item: Send + 'static;

    /// Produce items on the I/O runtime. Returning ends production.
    async fn produce(&self, producer: &Producer<Self>) -> CoreResult<()>;

    /// Admission weight under [`AdmissionLimit::MaxLoadedBytes`].
    fn task_weight(&self, _item: &Self::Item) -> u64 {
        1
    }

    /// Process one item on the CPU runtime.
    async fn process(&self, item: Self::Item);

    /// Runs once on the I/O runtime after production ended and every
    /// dispatched task retired.
    async fn on_all_tasks_complete(&self, _interrupted: bool) {}

    /// Runs once when a stop is requested.
    fn stop_requested(&self) {}
}

/// Task counters of a pipeline.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStats {
    pub submitted: usize,
    pub started: usize,
    pub finished: usize,
}

struct PipelineShared<T: PipelineTask> {
    task: T,
    cancel: CancellationToken,
    completed: CancellationToken,
    interrupted: AtomicBool,
    tracker: TaskTracker,
    submitted: AtomicUsize,
    started: AtomicUsize,
    finished: AtomicUsize,
}

impl<T: PipelineTask> PipelineShared<T> {
    fn stop(&self) -> bool {
        if self
            .interrupted
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        tracing::info!("pipeline stop requested");
        self.cancel.cancel();
        self.task.stop_requested();
        true
    }

    fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    async fn run_item(&self, item: T::Item) {
        self.started.fetch_add(1, Ordering::SeqCst);
        if let Err(panic) = AssertUnwindSafe(self.task.process(item)).catch_unwind().await {
            tracing::error!(panic = %panic_message(panic.as_ref()), "pipeline task panicked");
        }
        self.finished.fetch_add(1, Ordering::SeqCst);
    }

    fn stats(&self) -> PipelineStats {
        PipelineStats {
            submitted: self.submitted.load(Ordering::SeqCst),
            started: self.started.load(Ordering::SeqCst),
            finished: self.finished.load(Ordering::SeqCst),
        }
    }
}

// ============================================================================
// Weighted Admission
// ============================================================================

struct Admission {
    budget: u64,
    in_flight: Mutex<u64>,
    released: Notify,
}

impl Admission {
    fn new(budget: u64) -> Self {
        Self {
            budget,
            in_flight: Mutex::new(0),
            released: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, u64> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn try_admit(&self, weight: u64) -> bool {
        let mut in_flight = self.lock();
        if *in_flight == 0 || in_flight.saturating_add(weight) <= self.budget {
            *in_flight += weight;
            true
        } else {
            false
        }
    }

    /// Wait until `weight` fits the budget, or nothing else is in flight.
    async fn acquire(
        self: &Arc<Self>,
        weight: u64,
        cancel: &CancellationToken,
    ) -> CoreResult<WeightPermit> {
        loop {
            if cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            if self.try_admit(weight) {
                return Ok(WeightPermit {
                    admission: Arc::clone(self),
                    weight,
                });
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CoreError::Cancelled),
                _ = &mut released => {}
            }
        }
    }

    fn in_flight(&self) -> u64 {
        *self.lock()
    }
}

/// Weight held by one dispatched task, returned on drop.
struct WeightPermit {
    admission: Arc<Admission>,
    weight: u64,
}

impl Drop for WeightPermit {
    fn drop(&mut self) {
        {
            let mut in_flight = self.admission.lock();
            *in_flight = in_flight.saturating_sub(self.weight);
        }
        self.admission.released.notify_waiters();
    }
}

// ============================================================================
// Producer
// ============================================================================

enum Dispatch<T: PipelineTask> {
    Buffered(mpsc::Sender<T::Item>),
    Weighted {
        admission: Arc<Admission>,
        weighted: bool,
        cpu: Handle,
    },
}

/// Submission handle passed to [`PipelineTask::produce`].
pub struct Producer<T: PipelineTask> {
    shared: Arc<PipelineShared<T>>,
    dispatch: Dispatch<T>,
}

impl<T: PipelineTask> Producer<T> {
    /// Hand `item` to the CPU stage, waiting for admission. Fails with
    /// [`CoreError::Cancelled`] once the pipeline is stopping.
    pub async fn submit(&self, item: T::Item) -> CoreResult<()> {
        if self.shared.cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        match &self.dispatch {
            Dispatch::Buffered(sender) => {
                tokio::select! {
                    biased;
                    _ = self.shared.cancel.cancelled() => return Err(CoreError::Cancelled),
                    sent = sender.send(item) => {
                        sent.map_err(|_| CoreError::runtime("pipeline workers exited"))?;
                    }
                }
            }
            Dispatch::Weighted {
                admission,
                weighted,
                cpu,
            } => {
                let weight = if *weighted {
                    self.shared.task.task_weight(&item).max(1)
                } else {
                    1
                };
                let permit = admission.acquire(weight, &self.shared.cancel).await?;
                let shared = Arc::clone(&self.shared);
                self.shared.tracker.spawn_on(
                    async move {
                        let _permit = permit;
                        shared.run_item(item).await;
                    },
                    cpu,
                );
            }
        }
        self.shared.submitted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.shared.cancel
    }

    pub fn is_interrupted(&self) -> bool {
        self.shared.is_interrupted()
    }

    pub fn task(&self) -> &T {
        &self.shared.task
    }
}

async fn buffered_worker<T: PipelineTask>(
    shared: Arc<PipelineShared<T>>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<T::Item>>>,
) {
    loop {
        let item = {
            let mut guard = tokio::select! {
                biased;
                _ = shared.cancel.cancelled() => break,
                guard = receiver.lock() => guard,
            };
            tokio::select! {
                biased;
                _ = shared.cancel.cancelled() => None,
                item = guard.recv() => item,
            }
        };
        // Buffered items never start after a stop.
        let Some(item) = item else { break };
        if shared.is_interrupted() {
            break;
        }
        shared.run_item(item).await;
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// Drives a [`PipelineTask`] to completion.
pub struct Pipeline<T: PipelineTask> {
    shared: Arc<PipelineShared<T>>,
    config: PipelineConfig,
    io_runtime: Option<Runtime>,
    cpu_runtime: Option<Runtime>,
    driver: Mutex<Option<JoinHandle<()>>>,
    time_tracker: Mutex<TimeTracker>,
    admission: Mutex<Option<Arc<Admission>>>,
}

impl<T: PipelineTask> Pipeline<T> {
    pub fn new(task: T, config: PipelineConfig) -> CoreResult<Self> {
        if matches!(
            config.admission,
            AdmissionLimit::BufferedItems(0)
                | AdmissionLimit::MaxConcurrentTasks(0)
                | AdmissionLimit::MaxLoadedBytes(0)
        ) {
            return Err(CoreError::config("admission limit must be positive"));
        }

        let io_runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("binscope-io")
            .enable_all()
            .build()
            .map_err(|e| CoreError::runtime(format!("failed to build I/O runtime: {e}")))?;
        let cpu_runtime = Builder::new_multi_thread()
            .worker_threads(config.cpu_threads())
            .thread_name("binscope-cpu")
            .enable_all()
            .build()
            .map_err(|e| CoreError::runtime(format!("failed to build CPU runtime: {e}")))?;

        Ok(Self {
            shared: Arc::new(PipelineShared {
                task,
                cancel: CancellationToken::new(),
                completed: CancellationToken::new(),
                interrupted: AtomicBool::new(false),
                tracker: TaskTracker::new(),
                submitted: AtomicUsize::new(0),
                started: AtomicUsize::new(0),
                finished: AtomicUsize::new(0),
            }),
            config,
            io_runtime: Some(io_runtime),
            cpu_runtime: Some(cpu_runtime),
            driver: Mutex::new(None),
            time_tracker: Mutex::new(TimeTracker::new()),
            admission: Mutex::new(None),
        })
    }

    fn runtimes(&self) -> CoreResult<(&Runtime, &Runtime)> {
        match (&self.io_runtime, &self.cpu_runtime) {
            (Some(io), Some(cpu)) => Ok((io, cpu)),
            _ => Err(CoreError::runtime("pipeline runtimes already shut down")),
        }
    }

    fn lock_driver(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.driver.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_tracker(&self) -> MutexGuard<'_, TimeTracker> {
        self.time_tracker.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawn the producer. Fails when called twice.
    pub fn start(&self) -> CoreResult<()> {
        let (io, cpu) = self.runtimes()?;
        let mut driver = self.lock_driver();
        if driver.is_some() || self.shared.completed.is_cancelled() {
            return Err(CoreError::runtime("pipeline already started"));
        }

        let shared = Arc::clone(&self.shared);
        let dispatch = match self.config.admission {
            AdmissionLimit::BufferedItems(capacity) => {
                let (sender, receiver) = mpsc::channel(capacity);
                let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
                for _ in 0..self.config.cpu_threads() {
                    shared.tracker.spawn_on(
                        buffered_worker(Arc::clone(&shared), Arc::clone(&receiver)),
                        cpu.handle(),
                    );
                }
                Dispatch::Buffered(sender)
            }
            AdmissionLimit::MaxConcurrentTasks(budget) | AdmissionLimit::MaxLoadedBytes(budget) => {
                let admission = Arc::new(Admission::new(budget));
                *self.admission.lock().unwrap_or_else(|e| e.into_inner()) =
                    Some(Arc::clone(&admission));
                Dispatch::Weighted {
                    admission,
                    weighted: matches!(self.config.admission, AdmissionLimit::MaxLoadedBytes(_)),
                    cpu: cpu.handle().clone(),
                }
            }
        };

        tracing::info!(
            cpu_threads = self.config.cpu_threads(),
            admission = ?self.config.admission,
            "pipeline starting"
        );
        self.lock_tracker().start();
        *driver = Some(io.spawn(async move {
            let producer = Producer {
                shared: Arc::clone(&shared),
                dispatch,
            };
            match shared.task.produce(&producer).await {
                Ok(()) | Err(CoreError::Cancelled) => {}
                Err(err) => tracing::error!(error = %err, "producer failed"),
            }
            drop(producer);

            shared.tracker.close();
            shared.tracker.wait().await;
            let interrupted = shared.is_interrupted();
            shared.task.on_all_tasks_complete(interrupted).await;
            shared.completed.cancel();
            tracing::info!(interrupted, stats = ?shared.stats(), "pipeline finished");
        }));
        Ok(())
    }

    /// Request a stop. Returns `false` if a stop was already requested.
    pub fn stop(&self) -> bool {
        self.shared.stop()
    }

    pub fn is_interrupted(&self) -> bool {
        self.shared.is_interrupted()
    }

    /// Whether `on_all_tasks_complete` has run.
    pub fn is_completed(&self) -> bool {
        self.shared.completed.is_cancelled()
    }

    /// Stop on ctrl-c, and on SIGTERM on unix.
    pub fn enable_signal_cancellation(&self) -> CoreResult<()> {
        let (io, _) = self.runtimes()?;
        let shared = Arc::clone(&self.shared);
        io.spawn(async move {
            tokio::select! {
                _ = shared.completed.cancelled() => {}
                _ = stop_signal() => {
                    tracing::warn!("stop signal received");
                    shared.stop();
                }
            }
        });
        Ok(())
    }

    /// Block until the pipeline completed and return its timing.
    ///
    /// Must not be called from inside an async context.
    pub fn join(&self) -> CoreResult<TimeTracker> {
        let (io, _) = self.runtimes()?;
        let handle = self.lock_driver().take();
        if let Some(handle) = handle {
            io.block_on(handle)
                .map_err(|e| CoreError::runtime(format!("pipeline driver failed: {e}")))?;
            self.lock_tracker().stop(self.is_interrupted());
        }
        Ok(self.lock_tracker().clone())
    }

    pub fn stats(&self) -> PipelineStats {
        self.shared.stats()
    }

    /// Weight currently admitted, `None` unless a weighted limit is active.
    pub fn in_flight_weight(&self) -> Option<u64> {
        self.admission
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|admission| admission.in_flight())
    }

    pub fn task(&self) -> &T {
        &self.shared.task
    }
}

impl<T: PipelineTask> Drop for Pipeline<T> {
    fn drop(&mut self) {
        if !self.shared.completed.is_cancelled() {
            self.shared.stop();
        }
        if let Some(runtime) = self.io_runtime.take() {
            runtime.shutdown_background();
        }
        if let Some(runtime) = self.cpu_runtime.take() {
            runtime.shutdown_background();
        }
    }
}

async fn stop_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    result = tokio::signal::ctrl_c() => {
                        if result.is_err() {
                            terminate.recv().await;
                        }
                    }
                    _ = terminate.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "cannot listen for SIGTERM");
                ctrl_c_or_pending().await;
            }
        }
    }
    #[cfg(not(unix))]
    ctrl_c_or_pending().await;
}

async fn ctrl_c_or_pending() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "cannot listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
