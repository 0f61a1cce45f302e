//! Fixed-size pool of inference workers.
//!
//! Created once at startup and passed by reference (`SharedWorkerPool`) into
//! every session. Selection is round-robin from a shared cursor, skipping
//! workers whose process is gone.

use std::sync::{Arc, Mutex};

use thiserror::Error;

use super::process_manager::WorkerSpec;
use super::worker_bridge::Worker;
use crate::{sys_error, sys_info, sys_warn};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no inference worker could be started ({attempted} attempted)")]
    NoWorkers { attempted: usize },
}

/// Shared reference to the WorkerPool.
pub type SharedWorkerPool = Arc<WorkerPool>;

pub struct WorkerPool {
    workers: Vec<Arc<Worker>>,
    cursor: Mutex<usize>,
}

impl WorkerPool {
    /// Launch `n` workers running `spec`. Individual spawn failures are
    /// logged; the pool fails only if none started.
    pub fn start(spec: &WorkerSpec, n: usize) -> Result<Self, PoolError> {
        let mut workers = Vec::with_capacity(n);
        for index in 0..n {
            match Worker::spawn(index, spec.clone()) {
                Ok(worker) => workers.push(Arc::new(worker)),
                Err(e) => sys_error!("[POOL] Worker {index} failed to start: {e}"),
            }
        }

        if workers.is_empty() {
            return Err(PoolError::NoWorkers { attempted: n });
        }
        sys_info!("[POOL] Started {}/{n} workers", workers.len());
        Ok(Self::from_workers(workers))
    }

    /// Build a pool around existing worker handles.
    pub fn from_workers(workers: Vec<Arc<Worker>>) -> Self {
        Self {
            workers,
            cursor: Mutex::new(0),
        }
    }

    /// Next live worker in round-robin order.
    ///
    /// The cursor advances on every candidate inspected. If no worker is
    /// alive the first one is returned anyway; asking it fails fast with
    /// `worker_exited` or `write_failed`.
    pub fn pick(&self) -> Arc<Worker> {
        let mut cursor = self.cursor.lock().unwrap_or_else(|e| e.into_inner());
        let n = self.workers.len();
        for _ in 0..n {
            let worker = &self.workers[*cursor % n];
            *cursor = cursor.wrapping_add(1);
            if worker.is_alive() {
                return worker.clone();
            }
        }
        self.workers[0].clone()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn live_count(&self) -> usize {
        self.workers.iter().filter(|w| w.is_alive()).count()
    }

    /// Restart every dead worker. Returns how many came back.
    pub fn respawn_dead(&self) -> usize {
        let mut restarted = 0;
        for worker in self.workers.iter().filter(|w| !w.is_alive()) {
            match worker.restart() {
                Ok(()) => restarted += 1,
                Err(e) => sys_warn!("[POOL] Worker {} restart failed: {e}", worker.index()),
            }
        }
        restarted
    }

    /// Stop all workers. Idempotent.
    pub fn shutdown(&self) {
        sys_info!("[POOL] Shutting down {} workers", self.workers.len());
        for worker in &self.workers {
            worker.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::web::worker::worker_bridge::tests::{echo_spec, silent_spec, wait_dead};
    use std::time::Duration;

    fn dead_worker(index: usize) -> Arc<Worker> {
        let worker = Worker::spawn(index, WorkerSpec::new("sh").args(["-c", "exit 0"])).unwrap();
        worker.stop();
        Arc::new(worker)
    }

    #[tokio::test]
    async fn test_round_robin_skips_dead() {
        let a = dead_worker(0);
        let b = Arc::new(Worker::spawn(1, silent_spec()).unwrap());
        let c = Arc::new(Worker::spawn(2, silent_spec()).unwrap());
        let pool = WorkerPool::from_workers(vec![a, b, c]);

        let picked: Vec<usize> = (0..6).map(|_| pool.pick().index()).collect();
        assert_eq!(picked, vec![1, 2, 1, 2, 1, 2]);
        assert_eq!(pool.live_count(), 2);
    }

    #[tokio::test]
    async fn test_all_dead_returns_first() {
        let pool = WorkerPool::from_workers(vec![dead_worker(0), dead_worker(1)]);
        assert_eq!(pool.pick().index(), 0);
        assert_eq!(pool.pick().index(), 0);

        let reply = pool.pick().ask(b"frame", false, Duration::from_millis(200)).await;
        assert!(!reply.ok);
    }

    #[tokio::test]
    async fn test_concurrent_pick_is_fair() {
        let pool = Arc::new(
            WorkerPool::from_workers(
                (0..3)
                    .map(|i| Arc::new(Worker::spawn(i, silent_spec()).unwrap()))
                    .collect(),
            ),
        );

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || (0..30).map(|_| pool.pick().index()).collect::<Vec<_>>())
            })
            .collect();

        let mut counts = [0usize; 3];
        for handle in handles {
            for index in handle.join().unwrap() {
                counts[index] += 1;
            }
        }
        assert_eq!(counts, [40, 40, 40]);
    }

    #[tokio::test]
    async fn test_start_and_respawn() {
        let pool = WorkerPool::start(&echo_spec(), 2).unwrap();
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.live_count(), 2);

        let reply = pool.pick().ask(b"frame", false, Duration::from_secs(2)).await;
        assert!(reply.ok, "{reply:?}");

        let victim = pool.pick();
        victim.process_for_tests().kill();
        wait_dead(&victim).await;
        assert_eq!(pool.live_count(), 1);

        assert_eq!(pool.respawn_dead(), 1);
        assert_eq!(pool.live_count(), 2);
        pool.shutdown();
        pool.shutdown();
        assert_eq!(pool.live_count(), 0);
    }

    #[test]
    fn test_start_fails_without_workers() {
        let err = WorkerPool::start(&WorkerSpec::new("/nonexistent/textneck-worker"), 3)
            .err()
            .unwrap();
        assert!(matches!(err, PoolError::NoWorkers { attempted: 3 }));
    }
}
