//! Worker process pool
//!
//! The pool owns a fixed number of slots. Each slot holds the handle of one
//! worker process; when that process exits for any reason a replacement is
//! spawned into the same slot, so the pool size never changes as a side
//! effect of a crash and the round-robin cursor stays meaningful.

use crate::config::WORKER_CONFIG_ENV;
use crate::ipc::WorkerChannel;
use parking_lot::{Mutex, RwLock};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Interval for polling worker exit during shutdown (in milliseconds)
const EXIT_POLL_INTERVAL_MS: u64 = 20;

/// Lifecycle of a worker process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    /// Spawned, startup context not yet accepted
    Starting,
    /// Announced readiness over its channel
    Ready,
    /// Process has exited
    Exited,
}

/// Program and arguments used to launch a worker
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Re-execute the running binary; worker mode is selected by the environment
    pub fn current_exe() -> anyhow::Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }
}

/// Configuration for the worker pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker slots
    pub size: usize,
    /// Delay before replacing a worker that exited before becoming ready
    pub restart_backoff: Duration,
    /// Time a stopping worker gets to exit before it is killed
    pub shutdown_grace_period: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 1,
            restart_backoff: Duration::from_millis(500),
            shutdown_grace_period: Duration::from_secs(2),
        }
    }
}

/// A worker process as seen by the coordinator
pub struct WorkerHandle {
    slot: usize,
    generation: u64,
    pid: Option<u32>,
    status: Mutex<WorkerStatus>,
    channel: Arc<WorkerChannel>,
    stop_tx: watch::Sender<bool>,
}

impl WorkerHandle {
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Monotonic spawn counter, distinct for every process the pool starts
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn status(&self) -> WorkerStatus {
        *self.status.lock()
    }

    pub fn is_ready(&self) -> bool {
        self.status() == WorkerStatus::Ready
    }

    pub fn channel(&self) -> &Arc<WorkerChannel> {
        &self.channel
    }

    fn mark_ready(&self) {
        let mut status = self.status.lock();
        if *status == WorkerStatus::Starting {
            *status = WorkerStatus::Ready;
            info!(slot = self.slot, pid = ?self.pid, "Worker is ready");
        }
    }

    fn mark_exited(&self) -> WorkerStatus {
        std::mem::replace(&mut *self.status.lock(), WorkerStatus::Exited)
    }

    /// Ask the supervisor to stop this worker
    fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}

/// Fixed-size pool of supervised worker processes.
///
/// [`start`](WorkerPool::start) returns `Arc<Self>` because every worker's
/// supervisor task holds a reference back to the pool to respawn into its slot.
pub struct WorkerPool {
    slots: Vec<RwLock<Option<Arc<WorkerHandle>>>>,
    cursor: AtomicUsize,
    command: WorkerCommand,
    /// Serialized configuration handed to every worker
    context: String,
    config: PoolConfig,
    generation: AtomicU64,
    restarts: AtomicU64,
    shutting_down: AtomicBool,
}

impl WorkerPool {
    /// Spawn `config.size` workers, one per slot, in slot order
    pub async fn start(
        command: WorkerCommand,
        context: String,
        config: PoolConfig,
    ) -> anyhow::Result<Arc<Self>> {
        let pool = Arc::new(Self {
            slots: (0..config.size).map(|_| RwLock::new(None)).collect(),
            cursor: AtomicUsize::new(0),
            command,
            context,
            config,
            generation: AtomicU64::new(0),
            restarts: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
        });

        for slot in 0..pool.slots.len() {
            if let Err(e) = pool.spawn_into(slot) {
                pool.shutdown().await;
                return Err(e);
            }
        }

        info!(
            workers = pool.len(),
            program = %pool.command.program.display(),
            "Worker pool started"
        );
        Ok(pool)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Round-robin selection; `None` only when the pool has no slots
    pub fn next(&self) -> Option<Arc<WorkerHandle>> {
        let len = self.slots.len();
        if len == 0 {
            return None;
        }
        let slot = self
            .cursor
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| Some((c + 1) % len))
            .unwrap_or(0)
            % len;
        self.slots[slot].read().clone()
    }

    /// Handle currently occupying `slot`
    pub fn handle(&self, slot: usize) -> Option<Arc<WorkerHandle>> {
        self.slots.get(slot).and_then(|s| s.read().clone())
    }

    pub fn statuses(&self) -> Vec<WorkerStatus> {
        self.slots
            .iter()
            .map(|s| {
                s.read()
                    .as_ref()
                    .map(|h| h.status())
                    .unwrap_or(WorkerStatus::Exited)
            })
            .collect()
    }

    pub fn ready_count(&self) -> usize {
        self.statuses()
            .into_iter()
            .filter(|s| *s == WorkerStatus::Ready)
            .count()
    }

    /// Number of workers replaced after an exit
    pub fn restart_count(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }

    /// Requests currently awaiting a reply across all workers
    pub fn in_flight(&self) -> usize {
        self.slots
            .iter()
            .filter_map(|s| s.read().as_ref().map(|h| h.channel.in_flight()))
            .sum()
    }

    /// Wait until every slot holds a ready worker
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if self.ready_count() == self.len() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(EXIT_POLL_INTERVAL_MS)).await;
        }
        self.ready_count() == self.len()
    }

    /// Launch a worker process and install it into `slot`
    fn spawn_into(self: &Arc<Self>, slot: usize) -> anyhow::Result<Arc<WorkerHandle>> {
        let mut cmd = Command::new(&self.command.program);
        cmd.args(&self.command.args);
        cmd.env(WORKER_CONFIG_ENV, &self.context);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            anyhow::anyhow!(
                "Failed to spawn worker '{}' for slot {}: {}",
                self.command.program.display(),
                slot,
                e
            )
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("Worker stdin was not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("Worker stdout was not captured"))?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = Arc::new(WorkerHandle {
            slot,
            generation: self.generation.fetch_add(1, Ordering::Relaxed),
            pid: child.id(),
            status: Mutex::new(WorkerStatus::Starting),
            channel: Arc::new(WorkerChannel::new(stdin)),
            stop_tx,
        });

        info!(slot, pid = ?handle.pid, generation = handle.generation, "Worker process spawned");

        let reader = Arc::clone(&handle);
        tokio::spawn(async move {
            let channel = Arc::clone(&reader.channel);
            if let Err(e) = channel.read_events(stdout, |_| reader.mark_ready()).await {
                debug!(slot = reader.slot, error = %e, "Worker channel read failed");
            }
        });

        *self.slots[slot].write() = Some(Arc::clone(&handle));

        let pool = Arc::clone(self);
        let supervised = Arc::clone(&handle);
        tokio::spawn(async move {
            pool.supervise(supervised, child, stop_rx).await;
        });

        // A shutdown that took its snapshot of the slots before this write
        // never sees the new handle, so it has to be stopped here
        if self.shutting_down.load(Ordering::SeqCst) {
            debug!(slot, "Pool is shutting down, stopping freshly spawned worker");
            handle.stop();
        }

        Ok(handle)
    }

    /// Wait for a worker to exit, then replace it unless the pool is stopping
    async fn supervise(
        self: Arc<Self>,
        handle: Arc<WorkerHandle>,
        mut child: Child,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        let result = tokio::select! {
            status = child.wait() => status,
            _ = stop_rx.changed() => {
                handle.channel.close().await;
                stop_child(&mut child, handle.slot, self.config.shutdown_grace_period).await
            }
        };

        let previous = handle.mark_exited();
        handle.channel.close().await;
        let failed = handle.channel.fail_pending();

        match result {
            Ok(status) => warn!(slot = handle.slot, pid = ?handle.pid, %status, "Worker exited"),
            Err(e) => error!(slot = handle.slot, pid = ?handle.pid, error = %e, "Failed to wait for worker"),
        }
        if failed > 0 {
            warn!(slot = handle.slot, failed, "Failed requests in flight on exited worker");
        }

        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }

        if previous != WorkerStatus::Ready {
            tokio::time::sleep(self.config.restart_backoff).await;
        }
        self.restart_slot(handle.slot).await;
    }

    async fn restart_slot(self: &Arc<Self>, slot: usize) {
        loop {
            if self.shutting_down.load(Ordering::SeqCst) {
                return;
            }
            match self.spawn_into(slot) {
                Ok(handle) => {
                    self.restarts.fetch_add(1, Ordering::Relaxed);
                    info!(slot, pid = ?handle.pid, generation = handle.generation, "Replaced exited worker");
                    return;
                }
                Err(e) => {
                    error!(slot, error = %e, "Failed to replace worker, retrying");
                    tokio::time::sleep(self.config.restart_backoff).await;
                }
            }
        }
    }

    /// Stop every worker without replacing them
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);

        let handles: Vec<Arc<WorkerHandle>> =
            self.slots.iter().filter_map(|s| s.read().clone()).collect();
        for handle in &handles {
            handle.stop();
        }

        let deadline = self.config.shutdown_grace_period + Duration::from_secs(1);
        let drained = tokio::time::timeout(deadline, async {
            while handles.iter().any(|h| h.status() != WorkerStatus::Exited) {
                tokio::time::sleep(Duration::from_millis(EXIT_POLL_INTERVAL_MS)).await;
            }
        })
        .await;

        if drained.is_err() {
            warn!("Timed out waiting for workers to exit");
        }
        info!(workers = handles.len(), "Worker pool stopped");
    }
}

/// Stop a worker process: its stdin is already closed, so send SIGTERM and
/// fall back to SIGKILL after the grace period
async fn stop_child(
    child: &mut Child,
    slot: usize,
    grace_period: Duration,
) -> std::io::Result<ExitStatus> {
    if let Some(pid) = child.id() {
        debug!(slot, pid, "Sending SIGTERM to worker");

        #[cfg(unix)]
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }

        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }
    }

    match tokio::time::timeout(grace_period, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!(
                slot,
                grace_period_ms = grace_period.as_millis() as u64,
                "Grace period exceeded, killing worker"
            );
            child.kill().await?;
            child.wait().await
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::ipc::{IpcError, RoutedRequest};

    /// Announces readiness, then swallows requests without replying
    fn silent_worker() -> WorkerCommand {
        WorkerCommand::new("sh").with_args(vec![
            "-c".to_string(),
            r#"printf '{"type":"ready","pid":0}\n'; exec cat > /dev/null"#.to_string(),
        ])
    }

    fn pool_config(size: usize) -> PoolConfig {
        PoolConfig {
            size,
            restart_backoff: Duration::from_millis(50),
            shutdown_grace_period: Duration::from_secs(1),
        }
    }

    async fn wait_for<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        condition()
    }

    fn kill(pid: u32) {
        unsafe {
            libc::kill(pid as i32, libc::SIGKILL);
        }
    }

    #[tokio::test]
    async fn test_empty_pool_has_no_next() {
        let pool = WorkerPool::start(silent_worker(), "{}".to_string(), pool_config(0))
            .await
            .unwrap();
        assert!(pool.is_empty());
        assert!(pool.next().is_none());
    }

    #[tokio::test]
    async fn test_round_robin_is_cyclic_and_fair() {
        let pool = WorkerPool::start(silent_worker(), "{}".to_string(), pool_config(3))
            .await
            .unwrap();
        assert!(pool.wait_ready(Duration::from_secs(5)).await);

        let picks: Vec<usize> = (0..10).map(|_| pool.next().unwrap().slot()).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2, 0, 1, 2, 0]);

        let mut counts = [0usize; 3];
        for slot in picks {
            counts[slot] += 1;
        }
        assert_eq!(counts, [4, 3, 3]);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_crashed_worker_replaced_in_same_slot() {
        let pool = WorkerPool::start(silent_worker(), "{}".to_string(), pool_config(3))
            .await
            .unwrap();
        assert!(pool.wait_ready(Duration::from_secs(5)).await);

        let victim = pool.handle(1).unwrap();
        let untouched = pool.handle(0).unwrap();
        kill(victim.pid().unwrap());

        let replaced = wait_for(
            || {
                pool.handle(1)
                    .map(|h| h.generation() != victim.generation() && h.is_ready())
                    .unwrap_or(false)
            },
            Duration::from_secs(5),
        )
        .await;
        assert!(replaced, "slot 1 was not refilled");

        assert_eq!(pool.len(), 3);
        assert_eq!(victim.status(), WorkerStatus::Exited);
        assert_eq!(pool.handle(0).unwrap().generation(), untouched.generation());
        assert_eq!(pool.restart_count(), 1);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_in_flight_request_fails_when_worker_dies() {
        let pool = WorkerPool::start(silent_worker(), "{}".to_string(), pool_config(1))
            .await
            .unwrap();
        assert!(pool.wait_ready(Duration::from_secs(5)).await);

        let worker = pool.next().unwrap();
        let channel = Arc::clone(worker.channel());
        let pending = tokio::spawn(async move {
            channel
                .request(RoutedRequest::new("GET", "/"), Duration::from_secs(30))
                .await
        });

        assert!(wait_for(|| pool.in_flight() == 1, Duration::from_secs(5)).await);
        kill(worker.pid().unwrap());

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(IpcError::WorkerLost)));

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_does_not_restart() {
        let pool = WorkerPool::start(silent_worker(), "{}".to_string(), pool_config(2))
            .await
            .unwrap();
        assert!(pool.wait_ready(Duration::from_secs(5)).await);
        let before: Vec<u64> = (0..2).map(|s| pool.handle(s).unwrap().generation()).collect();

        pool.shutdown().await;

        assert_eq!(pool.statuses(), vec![WorkerStatus::Exited, WorkerStatus::Exited]);
        tokio::time::sleep(Duration::from_millis(200)).await;
        let after: Vec<u64> = (0..2).map(|s| pool.handle(s).unwrap().generation()).collect();
        assert_eq!(before, after);
        assert_eq!(pool.restart_count(), 0);
    }

    #[tokio::test]
    async fn test_spawn_racing_shutdown_is_stopped() {
        let pool = WorkerPool::start(silent_worker(), "{}".to_string(), pool_config(1))
            .await
            .unwrap();
        assert!(pool.wait_ready(Duration::from_secs(5)).await);
        pool.shutdown().await;

        // A replacement that lands after shutdown collected its handles
        let late = pool.spawn_into(0).unwrap();
        assert!(
            wait_for(|| late.status() == WorkerStatus::Exited, Duration::from_secs(5)).await,
            "late worker outlived shutdown"
        );
        assert_eq!(pool.restart_count(), 0);
    }

    #[tokio::test]
    async fn test_worker_that_never_becomes_ready_is_retried() {
        let failing = WorkerCommand::new("sh").with_args(vec!["-c".to_string(), "exit 3".to_string()]);
        let pool = WorkerPool::start(failing, "{}".to_string(), pool_config(1))
            .await
            .unwrap();

        assert!(wait_for(|| pool.restart_count() >= 2, Duration::from_secs(5)).await);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.ready_count(), 0);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let missing = WorkerCommand::new("/nonexistent/forkgate-worker");
        let result = WorkerPool::start(missing, "{}".to_string(), pool_config(2)).await;
        let err = result.err().unwrap().to_string();
        assert!(err.contains("Failed to spawn worker"));
    }
}
