//! Tracked bash process table backing `/cap`, `/ps`, `/interrupt [pid]`
//! (spec §4.7, §5 "Bash captures have a 3-minute hard kill").
//!
//! Grounded in the teacher's `!command` shell execution
//! (`file_ops::handle_shell_command`, spawn-and-wait over `bash -c`) and its
//! `CancelToken`/child-PID-tracking pattern, generalized into a table keyed
//! by PID instead of one slot per chat.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;

pub const CAPTURE_TIMEOUT: Duration = Duration::from_secs(180);

#[derive(Debug, Clone)]
pub struct TrackedProcess {
    pub pid: u32,
    pub command: String,
    pub chat_id: i64,
    pub thread_id: Option<i64>,
}

#[derive(Debug)]
pub struct CaptureOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

/// Table of bash processes spawned by `/cap`, so `/ps` can list them and
/// `/interrupt <pid>` can kill one of them.
#[derive(Default)]
pub struct BashTable {
    processes: HashMap<u32, TrackedProcess>,
}

impl BashTable {
    pub fn new() -> Self {
        BashTable::default()
    }

    pub fn track(&mut self, proc: TrackedProcess) {
        self.processes.insert(proc.pid, proc);
    }

    pub fn untrack(&mut self, pid: u32) {
        self.processes.remove(&pid);
    }

    pub fn list(&self) -> Vec<&TrackedProcess> {
        let mut all: Vec<&TrackedProcess> = self.processes.values().collect();
        all.sort_by_key(|p| p.pid);
        all
    }

    pub fn get(&self, pid: u32) -> Option<&TrackedProcess> {
        self.processes.get(&pid)
    }

    pub fn all_pids(&self) -> Vec<u32> {
        self.processes.keys().copied().collect()
    }
}

/// Sends SIGTERM to `pid`. Best-effort: a process that already exited is
/// not an error.
#[allow(unsafe_code)]
pub fn kill_pid(pid: u32) {
    // SAFETY: sending a signal to a PID we tracked ourselves; the syscall
    // is infallible from Rust's perspective (ESRCH just means "already gone").
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
}

/// Spawns `command` under `bash -c` in `working_dir`, returning the child
/// pid immediately so the caller can register it in the [`BashTable`]
/// before awaiting completion.
pub async fn spawn_capture(
    command: &str,
    working_dir: &str,
) -> std::io::Result<(u32, tokio::task::JoinHandle<CaptureOutput>)> {
    let mut child = Command::new("bash")
        .args(["-c", command])
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let pid = child
        .id()
        .ok_or_else(|| std::io::Error::other("child has no pid"))?;

    let handle = tokio::spawn(async move {
        match timeout(CAPTURE_TIMEOUT, child.wait_with_output()).await {
            Ok(Ok(output)) => CaptureOutput {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                exit_code: output.status.code(),
                timed_out: false,
            },
            Ok(Err(e)) => CaptureOutput {
                stdout: String::new(),
                stderr: e.to_string(),
                exit_code: None,
                timed_out: false,
            },
            Err(_) => {
                kill_pid(pid);
                CaptureOutput {
                    stdout: String::new(),
                    stderr: "command exceeded the 3-minute capture timeout".to_string(),
                    exit_code: None,
                    timed_out: true,
                }
            }
        }
    });

    Ok((pid, handle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_tracks_and_untracks() {
        let mut table = BashTable::new();
        table.track(TrackedProcess {
            pid: 42,
            command: "sleep 1".into(),
            chat_id: 1,
            thread_id: None,
        });
        assert_eq!(table.list().len(), 1);
        assert!(table.get(42).is_some());
        table.untrack(42);
        assert!(table.get(42).is_none());
    }

    #[test]
    fn list_is_sorted_by_pid() {
        let mut table = BashTable::new();
        table.track(TrackedProcess { pid: 9, command: "a".into(), chat_id: 1, thread_id: None });
        table.track(TrackedProcess { pid: 3, command: "b".into(), chat_id: 1, thread_id: None });
        let pids: Vec<u32> = table.list().iter().map(|p| p.pid).collect();
        assert_eq!(pids, vec![3, 9]);
    }

    #[tokio::test]
    async fn spawn_capture_collects_stdout() {
        let (_pid, handle) = spawn_capture("echo hello", "/tmp").await.unwrap();
        let out = handle.await.unwrap();
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.exit_code, Some(0));
        assert!(!out.timed_out);
    }
}
