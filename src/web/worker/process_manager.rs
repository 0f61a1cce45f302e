//! Worker process lifecycle management.
//!
//! Spawns one inference worker as a child process (by default the same
//! binary with the `--worker` flag), reports whether it is still running,
//! and restarts it on crash.

use std::path::Path;
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use crate::sys_info;

/// Command line used to launch a worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSpec {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
}

impl WorkerSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    /// Re-run the current executable in worker mode.
    pub fn current_exe(model: &Path) -> Result<Self, String> {
        let exe = std::env::current_exe().map_err(|e| format!("Cannot find own executable: {e}"))?;
        Ok(Self::new(exe.to_string_lossy())
            .args(["--worker", "--model"])
            .args([model.to_string_lossy()])
            // Inference is single-threaded per worker; parallelism comes from the pool.
            .env("OMP_NUM_THREADS", "1"))
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arg_list(&self) -> &[String] {
        &self.args
    }
}

/// Manages one worker child process.
pub struct ProcessManager {
    child: Mutex<Option<Child>>,
    spec: WorkerSpec,
    restart_count: AtomicU32,
}

impl ProcessManager {
    /// Spawn a new worker process.
    pub fn spawn(spec: WorkerSpec) -> Result<Self, String> {
        let child = spawn_worker(&spec)?;

        Ok(Self {
            child: Mutex::new(Some(child)),
            spec,
            restart_count: AtomicU32::new(0),
        })
    }

    /// Take the child's stdin handle for writing requests.
    pub fn take_stdin(&self) -> Option<ChildStdin> {
        self.child
            .lock()
            .ok()
            .and_then(|mut guard| guard.as_mut().and_then(|c| c.stdin.take()))
    }

    /// Take the child's stdout handle for reading replies.
    pub fn take_stdout(&self) -> Option<ChildStdout> {
        self.child
            .lock()
            .ok()
            .and_then(|mut guard| guard.as_mut().and_then(|c| c.stdout.take()))
    }

    /// Take the child's stderr handle for draining its log output.
    pub fn take_stderr(&self) -> Option<ChildStderr> {
        self.child
            .lock()
            .ok()
            .and_then(|mut guard| guard.as_mut().and_then(|c| c.stderr.take()))
    }

    /// Whether the child process is still running. Never blocks.
    pub fn is_alive(&self) -> bool {
        let Ok(mut guard) = self.child.lock() else {
            return false;
        };
        match guard.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.child
            .lock()
            .ok()
            .and_then(|guard| guard.as_ref().map(Child::id))
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count.load(Ordering::Relaxed)
    }

    /// Kill the worker process and reap it. Safe to call repeatedly.
    pub fn kill(&self) {
        if let Ok(mut guard) = self.child.lock() {
            if let Some(ref mut child) = *guard {
                if matches!(child.try_wait(), Ok(None)) {
                    sys_info!("[PROCESS_MGR] Killing worker process pid={}", child.id());
                    let _ = child.kill();
                }
                let _ = child.wait(); // Reap
            }
            *guard = None;
        }
    }

    /// Restart the worker process (after kill or crash).
    pub fn restart(&self) -> Result<(), String> {
        self.kill();

        let child = spawn_worker(&self.spec)?;
        if let Ok(mut guard) = self.child.lock() {
            *guard = Some(child);
        }
        let count = self.restart_count.fetch_add(1, Ordering::Relaxed) + 1;

        sys_info!("[PROCESS_MGR] Worker restarted (restart #{count})");
        Ok(())
    }
}

impl Drop for ProcessManager {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Spawn a worker child process with all three stdio streams piped.
fn spawn_worker(spec: &WorkerSpec) -> Result<Child, String> {
    sys_info!(
        "[PROCESS_MGR] Spawning worker: {} {}",
        spec.program,
        spec.args.join(" ")
    );

    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    // Own process group, so a Ctrl-C aimed at the server does not hit workers first.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    command
        .spawn()
        .map_err(|e| format!("Failed to spawn worker {}: {e}", spec.program))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_and_kill() {
        let pm = ProcessManager::spawn(WorkerSpec::new("sh").args(["-c", "sleep 5"])).unwrap();
        assert!(pm.is_alive());
        assert!(pm.pid().is_some());
        pm.kill();
        assert!(!pm.is_alive());
        assert!(pm.pid().is_none());
        pm.kill();
    }

    #[test]
    fn test_exit_is_detected() {
        let pm = ProcessManager::spawn(WorkerSpec::new("sh").args(["-c", "exit 3"])).unwrap();
        for _ in 0..100 {
            if !pm.is_alive() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(!pm.is_alive());
    }

    #[test]
    fn test_restart_counts() {
        let pm = ProcessManager::spawn(WorkerSpec::new("sh").args(["-c", "exit 0"])).unwrap();
        pm.restart().unwrap();
        assert_eq!(pm.restart_count(), 1);
        assert!(pm.take_stdin().is_some());
        assert!(pm.take_stdin().is_none());
    }

    #[test]
    fn test_spawn_failure_reported() {
        let err = ProcessManager::spawn(WorkerSpec::new("/nonexistent/textneck-worker"))
            .err()
            .unwrap();
        assert!(err.contains("Failed to spawn worker"));
    }
}
