//! Server-side handle for one inference worker process.
//!
//! Hides the child process behind a single async call, [`Worker::ask`].
//! Many sessions call `ask` concurrently; each request carries a fresh
//! correlation id and the stdout reader routes replies back by id.
//!
//! Thread design (per process incarnation):
//! - writer thread: the only writer of the child's stdin, fed through a
//!   channel, so concurrent callers never interleave partial lines
//! - stdout reader thread: parses reply lines and resolves pending waiters;
//!   on EOF resolves everything left with `worker_exited`
//! - stderr drain thread: forwards the child's log output to our logger
//!
//! None of these touch the tokio runtime threads; results come back through
//! `oneshot` channels.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::process::{ChildStderr, ChildStdin, ChildStdout};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use base64::{engine::general_purpose, Engine as _};
use crossbeam_channel::{Receiver, Sender};
use thiserror::Error;
use tokio::sync::oneshot;
use uuid::Uuid;

use textneck_types::{FrameError, FrameRequest, WorkerReply};

use super::process_manager::{ProcessManager, WorkerSpec};
use crate::{sys_debug, sys_error, sys_info, sys_warn};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("{0}")]
    Spawn(String),
    #[error("worker {0} pipe not available")]
    MissingPipe(&'static str),
    #[error("failed to start worker thread: {0}")]
    Thread(#[from] std::io::Error),
    #[error("worker was stopped")]
    Stopped,
}

/// Server-side handle to one worker process.
pub struct Worker {
    index: usize,
    process: ProcessManager,
    /// IO of the current process incarnation. Replaced on restart.
    link: Mutex<Arc<WorkerLink>>,
    stopped: AtomicBool,
}

/// Pipes and pending requests of one process incarnation.
struct WorkerLink {
    writer: Sender<WriteJob>,
    pending: Mutex<PendingTable>,
}

#[derive(Default)]
struct PendingTable {
    waiters: HashMap<String, oneshot::Sender<WorkerReply>>,
    /// Set once the stdout stream closed; no new waiters are accepted after.
    exited: bool,
}

struct WriteJob {
    line: String,
    done: oneshot::Sender<bool>,
}

impl Worker {
    /// Spawn the worker process and start its IO threads.
    pub fn spawn(index: usize, spec: WorkerSpec) -> Result<Self, WorkerError> {
        let process = ProcessManager::spawn(spec).map_err(WorkerError::Spawn)?;
        let link = start_io(index, &process)?;

        sys_info!(
            "[WORKER {index}] Started (pid={})",
            process.pid().unwrap_or_default()
        );

        Ok(Self {
            index,
            process,
            link: Mutex::new(link),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Send one frame for inference and wait up to `timeout` for the reply.
    ///
    /// Always resolves within `timeout`: failures come back as `ok: false`
    /// replies carrying `write_failed`, `timeout` or `worker_exited`. A
    /// timed-out request is not cancelled: a write still queued may reach
    /// the child later, and its late reply is dropped by the reader.
    pub async fn ask(&self, frame: &[u8], gray: bool, timeout: Duration) -> WorkerReply {
        let id = Uuid::new_v4().simple().to_string();
        let request = FrameRequest {
            id: id.clone(),
            image_b64: general_purpose::STANDARD.encode(frame),
            gray,
        };
        let mut line = match serde_json::to_string(&request) {
            Ok(json) => json,
            Err(e) => {
                sys_error!("[WORKER {}] Failed to serialize request: {e}", self.index);
                return WorkerReply::failure(Some(id), FrameError::WriteFailed);
            }
        };
        line.push('\n');

        let link = self.current_link();
        let Some(mut rx) = link.register(&id) else {
            return WorkerReply::failure(Some(id), FrameError::WorkerExited);
        };

        // One deadline covers both the write and the wait: a worker stuck in
        // inference stops reading stdin, so the write itself can block.
        let exchange = async {
            if !link.write(line).await {
                return Err(FrameError::WriteFailed);
            }
            (&mut rx).await.map_err(|_| FrameError::WorkerExited)
        };

        let outcome = tokio::time::timeout(timeout, exchange).await;
        match outcome {
            Ok(Ok(reply)) => reply,
            Ok(Err(FrameError::WriteFailed)) => {
                sys_warn!("[WORKER {}] Failed to write request {id}", self.index);
                if link.take_waiter(&id).is_some() {
                    return WorkerReply::failure(Some(id), FrameError::WriteFailed);
                }
                // Exit cleanup got there first and already resolved it.
                rx.try_recv()
                    .unwrap_or_else(|_| WorkerReply::failure(Some(id), FrameError::WriteFailed))
            }
            Ok(Err(kind)) => WorkerReply::failure(Some(id), kind),
            Err(_) => {
                if link.take_waiter(&id).is_some() {
                    sys_debug!("[WORKER {}] Request {id} timed out", self.index);
                    WorkerReply::failure(Some(id), FrameError::Timeout)
                } else {
                    // The reply raced the deadline; it was already delivered.
                    rx.try_recv()
                        .unwrap_or_else(|_| WorkerReply::failure(Some(id), FrameError::Timeout))
                }
            }
        }
    }

    /// Whether the underlying process is still running and readable.
    pub fn is_alive(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst)
            && !self.current_link().has_exited()
            && self.process.is_alive()
    }

    /// Number of requests currently awaiting a reply.
    pub fn pending_count(&self) -> usize {
        self.current_link().lock_pending().waiters.len()
    }

    /// Stop the worker: terminate the process and fail anything pending.
    /// Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        sys_info!("[WORKER {}] Stopping", self.index);
        self.process.kill();
        self.current_link().mark_exited();
    }

    /// Replace a dead process with a fresh one.
    pub fn restart(&self) -> Result<(), WorkerError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(WorkerError::Stopped);
        }
        self.process.restart().map_err(WorkerError::Spawn)?;
        let new_link = start_io(self.index, &self.process)?;

        let old_link = {
            let mut guard = self.link.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *guard, new_link)
        };
        let failed = old_link.mark_exited();
        if failed > 0 {
            sys_warn!(
                "[WORKER {}] {failed} request(s) failed by restart",
                self.index
            );
        }

        sys_info!(
            "[WORKER {}] Restarted (pid={}, restarts={})",
            self.index,
            self.process.pid().unwrap_or_default(),
            self.process.restart_count()
        );
        Ok(())
    }

    fn current_link(&self) -> Arc<WorkerLink> {
        self.link.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    #[cfg(test)]
    pub(crate) fn process_for_tests(&self) -> &ProcessManager {
        &self.process
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

impl WorkerLink {
    fn lock_pending(&self) -> MutexGuard<'_, PendingTable> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a waiter for `id`. `None` once the process has exited.
    fn register(&self, id: &str) -> Option<oneshot::Receiver<WorkerReply>> {
        let mut pending = self.lock_pending();
        if pending.exited {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        pending.waiters.insert(id.to_string(), tx);
        Some(rx)
    }

    fn take_waiter(&self, id: &str) -> Option<oneshot::Sender<WorkerReply>> {
        self.lock_pending().waiters.remove(id)
    }

    fn has_exited(&self) -> bool {
        self.lock_pending().exited
    }

    /// Fail every pending request with `worker_exited`. Returns how many.
    fn mark_exited(&self) -> usize {
        let drained: Vec<_> = {
            let mut pending = self.lock_pending();
            pending.exited = true;
            pending.waiters.drain().collect()
        };
        let count = drained.len();
        for (id, tx) in drained {
            let _ = tx.send(WorkerReply::failure(Some(id), FrameError::WorkerExited));
        }
        count
    }

    /// Queue one line for the writer thread and wait for the result.
    async fn write(&self, line: String) -> bool {
        let (done, done_rx) = oneshot::channel();
        if self.writer.send(WriteJob { line, done }).is_err() {
            return false;
        }
        done_rx.await.unwrap_or(false)
    }
}

/// Take the child's pipes and start the three IO threads.
fn start_io(index: usize, process: &ProcessManager) -> Result<Arc<WorkerLink>, WorkerError> {
    let stdin = process.take_stdin().ok_or(WorkerError::MissingPipe("stdin"))?;
    let stdout = process.take_stdout().ok_or(WorkerError::MissingPipe("stdout"))?;
    let stderr = process.take_stderr().ok_or(WorkerError::MissingPipe("stderr"))?;

    let (writer, jobs) = crossbeam_channel::unbounded::<WriteJob>();
    let link = Arc::new(WorkerLink {
        writer,
        pending: Mutex::new(PendingTable::default()),
    });

    thread::Builder::new()
        .name(format!("worker-{index}-stdin"))
        .spawn(move || stdin_writer(index, stdin, jobs))?;

    let reader_link = link.clone();
    thread::Builder::new()
        .name(format!("worker-{index}-stdout"))
        .spawn(move || stdout_reader(index, stdout, reader_link))?;

    thread::Builder::new()
        .name(format!("worker-{index}-stderr"))
        .spawn(move || stderr_drain(index, stderr))?;

    Ok(link)
}

/// Writes queued request lines to the worker's stdin, one at a time.
fn stdin_writer(index: usize, mut stdin: ChildStdin, jobs: Receiver<WriteJob>) {
    while let Ok(job) = jobs.recv() {
        let ok = stdin
            .write_all(job.line.as_bytes())
            .and_then(|()| stdin.flush())
            .is_ok();
        let _ = job.done.send(ok);
        if !ok {
            sys_warn!("[WORKER {index}] Stdin closed, writer exiting");
            break;
        }
    }
    sys_debug!("[WORKER {index}] Stdin writer thread exiting");
}

/// Reads reply lines from the worker's stdout and resolves waiters.
fn stdout_reader(index: usize, stdout: ChildStdout, link: Arc<WorkerLink>) {
    let reader = BufReader::new(stdout);
    for line in reader.lines() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                sys_warn!("[WORKER {index}] Stdout read error: {e}");
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let reply: WorkerReply = match serde_json::from_str(line) {
            Ok(r) => r,
            Err(e) => {
                sys_debug!("[WORKER {index}] Unparseable reply line dropped: {e}");
                continue;
            }
        };

        let Some(id) = reply.id.as_deref() else {
            sys_debug!("[WORKER {index}] Uncorrelated reply dropped: {line}");
            continue;
        };

        match link.take_waiter(id) {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => sys_debug!("[WORKER {index}] No pending request for id={id}, dropped"),
        }
    }

    let failed = link.mark_exited();
    sys_warn!("[WORKER {index}] Output stream closed, {failed} pending request(s) failed");
}

/// Keeps the worker's stderr from filling up by forwarding it to our log.
fn stderr_drain(index: usize, stderr: ChildStderr) {
    let reader = BufReader::new(stderr);
    for chunk in reader.split(b'\n') {
        match chunk {
            Ok(bytes) => {
                let text = String::from_utf8_lossy(&bytes);
                let text = text.trim_end();
                if !text.is_empty() {
                    sys_debug!("[WORKER {index}] {text}");
                }
            }
            Err(_) => break,
        }
    }
}
