use std::sync::Arc;
use std::time::Duration;

use structopt::StructOpt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use atelier_model::GenerateParams;

use crate::manager::TaskManager;

/// One unit of queued work. Inline reference bytes ride along in memory;
/// a process death loses them, which is fine because interrupted tasks
/// are never resumed.
#[derive(Debug)]
pub struct QueueItem {
    pub task_id: String,
    pub provider: String,
    pub params: GenerateParams,
}

#[derive(StructOpt, Clone, Debug)]
pub struct RunnerConfig {
    /// Number of parallel generation workers.
    #[structopt(long = "workers", env = "ATELIER_WORKERS", default_value = "6")]
    pub workers: usize,
    /// Capacity of the bounded submission queue.
    #[structopt(
        long = "queue-capacity",
        env = "ATELIER_QUEUE_CAPACITY",
        default_value = "100"
    )]
    pub queue_capacity: usize,
    /// Seconds granted to in-flight workers to observe shutdown.
    #[structopt(
        long = "shutdown-grace-secs",
        env = "ATELIER_SHUTDOWN_GRACE",
        default_value = "5"
    )]
    pub shutdown_grace_secs: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        RunnerConfig {
            workers: 6,
            queue_capacity: 100,
            shutdown_grace_secs: 5,
        }
    }
}

/// Fixed-size set of workers draining the bounded queue.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    grace: Duration,
}

impl WorkerPool {
    pub fn spawn(
        manager: Arc<TaskManager>,
        queue: mpsc::Receiver<QueueItem>,
        config: &RunnerConfig,
    ) -> WorkerPool {
        let queue = Arc::new(Mutex::new(queue));
        let handles = (0..config.workers.max(1))
            .map(|worker_id| {
                let manager = manager.clone();
                let queue = queue.clone();
                tokio::spawn(async move {
                    worker_loop(worker_id, manager, queue).await;
                })
            })
            .collect();
        log::info!(
            "Worker pool started: {} workers, queue capacity {}.",
            config.workers.max(1),
            config.queue_capacity
        );
        WorkerPool {
            handles,
            grace: Duration::from_secs(config.shutdown_grace_secs),
        }
    }

    /// Cancels in-flight work, waits out the grace window, then force
    /// finalizes anything still non-terminal.
    pub async fn shutdown(self, manager: &Arc<TaskManager>) {
        manager.begin_shutdown();

        let deadline = tokio::time::Instant::now() + self.grace;
        for mut handle in self.handles {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                log::warn!("Worker did not stop within the grace window, aborting.");
                handle.abort();
            }
        }

        match manager.reconcile().await {
            Ok(0) => (),
            Ok(count) => log::warn!("{} task(s) force-finalized on shutdown.", count),
            Err(error) => log::warn!("Shutdown reconciliation failed: {}", error),
        }
        log::info!("Worker pool stopped.");
    }
}

async fn worker_loop(
    worker_id: usize,
    manager: Arc<TaskManager>,
    queue: Arc<Mutex<mpsc::Receiver<QueueItem>>>,
) {
    log::debug!("Worker {} started.", worker_id);
    loop {
        let item = {
            let mut guard = queue.lock().await;
            guard.recv().await
        };
        match item {
            Some(item) => {
                log::debug!("Worker {} picked up task [{}].", worker_id, item.task_id);
                manager.process(item).await;
            }
            None => break,
        }
    }
    log::debug!("Worker {} stopped.", worker_id);
}
