//! Bounded-queue executor for IO-bound order commands.
//!
//! Strategies never touch the network on their hot path: they submit a
//! command here and consume the result as another message on their own
//! loop. Submission is non-blocking; a full queue returns `false` so the
//! caller can fail its plan instead of silently losing the command.

use futures_util::future::BoxFuture;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, warn};

/// Default queue depth.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// One IO-bound unit of work. The future is pre-wired to deliver its result
/// to the submitting strategy's `cmd_result` channel.
pub struct Command {
    pub name: &'static str,
    pub timeout: Duration,
    fut: BoxFuture<'static, ()>,
}

impl Command {
    pub fn new<F>(name: &'static str, timeout: Duration, fut: F) -> Self
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        Self {
            name,
            timeout,
            fut: Box::pin(fut),
        }
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Serial keeps strict submission order on a single worker; Concurrent
/// fans out across a fixed pool for strategies that declare it safe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Serial,
    Concurrent { workers: usize },
}

impl ExecutionMode {
    fn workers(&self) -> usize {
        match self {
            ExecutionMode::Serial => 1,
            ExecutionMode::Concurrent { workers } => (*workers).max(1),
        }
    }
}

#[derive(Debug, Default)]
pub struct ExecutorMetrics {
    pub submitted: AtomicU64,
    pub completed: AtomicU64,
    pub timed_out: AtomicU64,
    pub overflowed: AtomicU64,
}

impl ExecutorMetrics {
    pub fn summary(&self) -> String {
        format!(
            "submitted={} completed={} timed_out={} overflowed={}",
            self.submitted.load(Ordering::Relaxed),
            self.completed.load(Ordering::Relaxed),
            self.timed_out.load(Ordering::Relaxed),
            self.overflowed.load(Ordering::Relaxed),
        )
    }
}

pub struct CommandExecutor {
    tx: mpsc::Sender<Command>,
    stop_tx: watch::Sender<bool>,
    mode: ExecutionMode,
    metrics: Arc<ExecutorMetrics>,
}

impl CommandExecutor {
    pub fn spawn(mode: ExecutionMode, queue_capacity: usize) -> Arc<Self> {
        let capacity = queue_capacity.max(1);
        let (tx, rx) = mpsc::channel::<Command>(capacity);
        let (stop_tx, _) = watch::channel(false);
        let metrics = Arc::new(ExecutorMetrics::default());

        let shared_rx = Arc::new(Mutex::new(rx));
        for worker_id in 0..mode.workers() {
            let rx = shared_rx.clone();
            let mut stop_rx = stop_tx.subscribe();
            let metrics = metrics.clone();
            tokio::spawn(async move {
                loop {
                    if *stop_rx.borrow() {
                        // Drain the queued backlog, then exit.
                        loop {
                            let drained = rx.lock().await.try_recv();
                            match drained {
                                Ok(cmd) => run_command(worker_id, cmd, &metrics).await,
                                Err(_) => break,
                            }
                        }
                        break;
                    }
                    let cmd = {
                        let mut guard = rx.lock().await;
                        tokio::select! {
                            cmd = guard.recv() => cmd,
                            _ = stop_rx.changed() => continue,
                        }
                    };
                    match cmd {
                        Some(cmd) => run_command(worker_id, cmd, &metrics).await,
                        // Channel closed: all senders dropped.
                        None => break,
                    }
                }
                debug!(worker_id, "executor_worker_exit");
            });
        }

        Arc::new(Self {
            tx,
            stop_tx,
            mode,
            metrics,
        })
    }

    /// Non-blocking submit. `false` means the queue was full (or stopped)
    /// and the command was dropped; the caller must treat its operation as
    /// failed.
    pub fn submit(&self, cmd: Command) -> bool {
        let name = cmd.name;
        match self.tx.try_send(cmd) {
            Ok(()) => {
                self.metrics.submitted.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(err) => {
                self.metrics.overflowed.fetch_add(1, Ordering::Relaxed);
                warn!(command = name, error = %err, "executor_queue_full");
                false
            }
        }
    }

    /// Signal workers to finish the queued backlog and exit.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn metrics(&self) -> &ExecutorMetrics {
        &self.metrics
    }
}

async fn run_command(worker_id: usize, cmd: Command, metrics: &ExecutorMetrics) {
    let name = cmd.name;
    match tokio::time::timeout(cmd.timeout, cmd.fut).await {
        Ok(()) => {
            metrics.completed.fetch_add(1, Ordering::Relaxed);
        }
        Err(_) => {
            metrics.timed_out.fetch_add(1, Ordering::Relaxed);
            warn!(worker_id, command = name, timeout_ms = cmd.timeout.as_millis() as u64, "command_timeout");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    #[tokio::test]
    async fn test_serial_preserves_order() {
        let exec = CommandExecutor::spawn(ExecutionMode::Serial, 64);
        let log = Arc::new(PlMutex::new(Vec::new()));
        let (done_tx, mut done_rx) = mpsc::channel::<()>(16);

        for i in 0..10 {
            let log = log.clone();
            let done = done_tx.clone();
            let ok = exec.submit(Command::new("append", Duration::from_secs(1), async move {
                log.lock().push(i);
                let _ = done.send(()).await;
            }));
            assert!(ok);
        }
        for _ in 0..10 {
            done_rx.recv().await.unwrap();
        }
        assert_eq!(*log.lock(), (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_overflow_returns_false() {
        let exec = CommandExecutor::spawn(ExecutionMode::Serial, 1);
        let (gate_tx, gate_rx) = tokio::sync::oneshot::channel::<()>();

        // Occupy the single worker.
        assert!(exec.submit(Command::new("block", Duration::from_secs(5), async move {
            let _ = gate_rx.await;
        })));
        // Give the worker a beat to pick the first command up.
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Fill the queue slot, then overflow.
        assert!(exec.submit(Command::new("queued", Duration::from_secs(1), async {})));
        let accepted = exec.submit(Command::new("spill", Duration::from_secs(1), async {}));
        assert!(!accepted);
        assert_eq!(exec.metrics().overflowed.load(Ordering::Relaxed), 1);

        let _ = gate_tx.send(());
    }

    #[tokio::test]
    async fn test_timeout_is_recorded() {
        let exec = CommandExecutor::spawn(ExecutionMode::Serial, 8);
        let (done_tx, mut done_rx) = mpsc::channel::<()>(1);

        exec.submit(Command::new("slow", Duration::from_millis(20), async {
            tokio::time::sleep(Duration::from_secs(10)).await;
        }));
        exec.submit(Command::new("after", Duration::from_secs(1), async move {
            let _ = done_tx.send(()).await;
        }));

        done_rx.recv().await.unwrap();
        assert_eq!(exec.metrics().timed_out.load(Ordering::Relaxed), 1);
        assert_eq!(exec.metrics().completed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_pool_runs_concurrently() {
        let exec = CommandExecutor::spawn(ExecutionMode::Concurrent { workers: 4 }, 64);
        let (done_tx, mut done_rx) = mpsc::channel::<usize>(8);

        // Four sleepers in parallel finish well under the serial total.
        let start = std::time::Instant::now();
        for i in 0..4 {
            let done = done_tx.clone();
            exec.submit(Command::new("sleep", Duration::from_secs(2), async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                let _ = done.send(i).await;
            }));
        }
        for _ in 0..4 {
            done_rx.recv().await.unwrap();
        }
        assert!(start.elapsed() < Duration::from_millis(350));
    }
}
