//! Optional worker-pool overlay a processor can use to run per-packet work
//! asynchronously, with timeouts and cooperative interruption. The pool's
//! lifecycle is tied to the session's `begin`/`end` states rather than to
//! its own constructor, matching the session-driven start/stop contract.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::packet::{ClosePacket, Packet};
use crate::processor::ProcessorContext;
use crate::session_types::{states, StateChange};

pub const DEFAULT_WORKER_POOL_SIZE: usize = 4;
pub const DEFAULT_MAX_TASK_TIMEOUT: Duration = Duration::from_secs(60);

/// One unit of work handed to an executor. `interrupt` is the cooperative
/// cancellation signal: an executing worker that dequeues an interrupt
/// task stops the whole pool rather than running it.
pub struct Task {
    pub packet: Packet,
    pub interrupt: bool,
}

impl Task {
    pub fn new(packet: Packet) -> Self {
        Self { packet, interrupt: false }
    }

    pub fn interrupt() -> Self {
        Self {
            packet: Packet::Close(ClosePacket::new("task runner interrupt")),
            interrupt: true,
        }
    }
}

pub type TaskFuture = BoxFuture<'static, Result<()>>;
pub type TaskExecutorFn = Arc<dyn Fn(Task) -> TaskFuture + Send + Sync>;
pub type RequestBuilderFn = Arc<dyn Fn(&Packet) -> Result<Option<Task>> + Send + Sync>;
pub type LifecycleCallback = Arc<dyn Fn() + Send + Sync>;
pub type StateCallback = Arc<dyn Fn(&StateChange) + Send + Sync>;

#[derive(Clone)]
pub struct TaskRunnerConfig {
    pub worker_pool_size: usize,
    pub task_timeout: Option<Duration>,
    pub max_task_timeout: Duration,
    pub concurrent_mode: bool,
}

impl Default for TaskRunnerConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: DEFAULT_WORKER_POOL_SIZE,
            task_timeout: None,
            max_task_timeout: DEFAULT_MAX_TASK_TIMEOUT,
            concurrent_mode: true,
        }
    }
}

impl TaskRunnerConfig {
    /// Normalizes a non-positive pool size to the default, matching the
    /// "WorkerPoolSize (default 4 if <=0)" contract.
    fn effective_pool_size(&self) -> usize {
        if self.worker_pool_size == 0 {
            DEFAULT_WORKER_POOL_SIZE
        } else {
            self.worker_pool_size
        }
    }

    fn effective_timeout(&self) -> Duration {
        self.task_timeout.unwrap_or(self.max_task_timeout)
    }
}

pub struct TaskRunner {
    config: TaskRunnerConfig,
    request_builder: RequestBuilderFn,
    executor: TaskExecutorFn,
    init_callback: Option<LifecycleCallback>,
    terminate_callback: Option<LifecycleCallback>,
    state_callback: Option<StateCallback>,
    queue_tx: parking_lot::Mutex<Option<mpsc::Sender<Task>>>,
    workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    stopped: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

impl TaskRunner {
    pub fn new(config: TaskRunnerConfig, request_builder: RequestBuilderFn, executor: TaskExecutorFn) -> Self {
        Self {
            config,
            request_builder,
            executor,
            init_callback: None,
            terminate_callback: None,
            state_callback: None,
            queue_tx: parking_lot::Mutex::new(None),
            workers: parking_lot::Mutex::new(Vec::new()),
            stopped: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn with_init_callback(mut self, cb: LifecycleCallback) -> Self {
        self.init_callback = Some(cb);
        self
    }

    pub fn with_terminate_callback(mut self, cb: LifecycleCallback) -> Self {
        self.terminate_callback = Some(cb);
        self
    }

    pub fn with_state_callback(mut self, cb: StateCallback) -> Self {
        self.state_callback = Some(cb);
        self
    }

    /// Session-facing entry point: invoked for every state change. Starts
    /// the pool on `begin`, stops it on `end`; `state_callback` observes
    /// every state regardless.
    pub async fn handle_state(&self, state: &StateChange) {
        if let Some(cb) = &self.state_callback {
            cb(state);
        }
        match state.state.as_str() {
            states::BEGIN => self.start().await,
            states::END => self.stop().await,
            _ => {}
        }
    }

    async fn start(&self) {
        self.stopped.store(false, Ordering::Release);
        let pool_size = self.config.effective_pool_size();
        let (tx, rx) = mpsc::channel(pool_size * 2);
        *self.queue_tx.lock() = Some(tx);
        let rx = Arc::new(AsyncMutex::new(rx));

        let mut handles = Vec::with_capacity(pool_size);
        for worker_id in 0..pool_size {
            let rx = rx.clone();
            let executor = self.executor.clone();
            let stopped = self.stopped.clone();
            let shutdown = self.shutdown.clone();
            let timeout = self.config.effective_timeout();
            handles.push(tokio::spawn(async move {
                Self::worker_loop(worker_id, rx, executor, stopped, shutdown, timeout).await;
            }));
        }
        *self.workers.lock() = handles;

        if let Some(init) = &self.init_callback {
            init();
        }
        tracing::info!(pool_size, "task runner pool started");
    }

    async fn worker_loop(
        worker_id: usize,
        rx: Arc<AsyncMutex<mpsc::Receiver<Task>>>,
        executor: TaskExecutorFn,
        stopped: Arc<AtomicBool>,
        shutdown: Arc<Notify>,
        timeout: Duration,
    ) {
        loop {
            if stopped.load(Ordering::Acquire) {
                break;
            }

            let task = tokio::select! {
                task = async {
                    let mut guard = rx.lock().await;
                    guard.recv().await
                } => task,
                _ = shutdown.notified() => None,
            };

            let Some(task) = task else {
                break;
            };

            if task.interrupt {
                tracing::debug!(worker_id, "task runner interrupted");
                stopped.store(true, Ordering::Release);
                shutdown.notify_waiters();
                break;
            }

            match tokio::time::timeout(timeout, executor(task)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::error!(worker_id, error = %err, "task executor failed"),
                Err(_) => tracing::error!(worker_id, ?timeout, "task timed out"),
            }
        }
    }

    async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.queue_tx.lock() = None;

        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock();
            std::mem::take(&mut *workers)
        };
        for mut handle in handles {
            self.shutdown.notify_waiters();
            loop {
                tokio::select! {
                    res = &mut handle => {
                        let _ = res;
                        break;
                    }
                    _ = tokio::time::sleep(Duration::from_millis(20)) => {
                        self.shutdown.notify_waiters();
                    }
                }
            }
        }

        if let Some(term) = &self.terminate_callback {
            term();
        }
        tracing::info!("task runner pool stopped");
    }

    /// Builds a request for `packet` and either runs it inline
    /// (non-concurrent mode) or enqueues it for a pool worker.
    pub async fn handle_packet(&self, ctx: &dyn ProcessorContext, packet: &Packet) {
        let task = match (self.request_builder)(packet) {
            Ok(Some(task)) => task,
            Ok(None) => return,
            Err(err) => {
                ctx.cause_error(err);
                return;
            }
        };

        if !self.config.concurrent_mode {
            let timeout = self.config.effective_timeout();
            match tokio::time::timeout(timeout, (self.executor)(task)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => ctx.cause_error(err),
                Err(_) => ctx.cause_error(Error::Timeout(timeout)),
            }
            return;
        }

        let tx = self.queue_tx.lock().clone();
        match tx {
            Some(tx) => {
                if tx.try_send(task).is_err() {
                    tracing::warn!("task queue full or closed; dropping packet");
                }
            }
            None => {
                tracing::warn!("task queue unavailable; dropping packet");
                ctx.cause_error(Error::TaskQueueUnavailable("pool not running".to_string()));
            }
        }
    }
}
