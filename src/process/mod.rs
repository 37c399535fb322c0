//! # Process
//!
//! Data types for a single supervised child: its externally-visible
//! [`ProcessInfo`] snapshot and the mutable state a [`Process`] guards
//! behind one lock, per process. Grounded in the teacher's
//! `coordination::ServerProcess` (pid, child handle, started-at) generalized
//! with restart bookkeeping and a ready/done signal pair.

pub mod supervisor;

pub use supervisor::ProcessSupervisor;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// Terminal and non-terminal states of a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Running,
    Exited,
    Failed,
}

/// Restart policy for a process spawned via `SpawnWithRestart`/`SpawnRPCWithRestart`.
#[derive(Debug, Clone)]
pub struct RestartConfig {
    pub enabled: bool,
    /// Negative means unbounded restarts.
    pub max_restarts: i64,
    pub delay: std::time::Duration,
    pub restart_count: u32,
}

impl RestartConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            max_restarts: 0,
            delay: std::time::Duration::ZERO,
            restart_count: 0,
        }
    }

    /// Whether another restart is permitted given the current `restart_count`.
    pub fn may_restart(&self) -> bool {
        self.enabled && (self.max_restarts < 0 || (self.restart_count as i64) < self.max_restarts)
    }
}

/// Externally-visible snapshot of a process, returned by `GetProcess`/`ListProcesses`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProcessInfo {
    pub id: String,
    pub pid: Option<u32>,
    pub command: String,
    pub args: Vec<String>,
    pub status: ProcessStatus,
    pub exit_code: Option<i32>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub restart_count: u32,
    pub rpc: bool,
}

struct MutableState {
    info: ProcessInfo,
    restart: Option<RestartConfig>,
}

/// One supervised child. Owns its `ProcessInfo`, a cancellation handle
/// scoping the child's execution context, a `done` signal fired exactly
/// once by the reaper, a `ready` signal fired exactly once on first receipt
/// of `subprocess_ready`, and the lock guarding everything above.
pub struct Process {
    pub id: String,
    pub command: String,
    pub args: Vec<String>,
    pub rpc: bool,
    pub exec_cancel: CancellationToken,
    pub done: CancellationToken,
    pub ready: CancellationToken,
    state: Mutex<MutableState>,
}

impl Process {
    pub fn new(
        id: impl Into<String>,
        command: impl Into<String>,
        args: Vec<String>,
        rpc: bool,
        restart: Option<RestartConfig>,
        parent_cancel: &CancellationToken,
    ) -> Self {
        let id = id.into();
        let command = command.into();
        let info = ProcessInfo {
            id: id.clone(),
            pid: None,
            command: command.clone(),
            args: args.clone(),
            status: ProcessStatus::Running,
            exit_code: None,
            start_time: Utc::now(),
            end_time: None,
            restart_count: restart.as_ref().map(|r| r.restart_count).unwrap_or(0),
            rpc,
        };
        Self {
            id,
            command,
            args,
            rpc,
            exec_cancel: parent_cancel.child_token(),
            done: CancellationToken::new(),
            ready: CancellationToken::new(),
            state: Mutex::new(MutableState { info, restart }),
        }
    }

    pub fn snapshot(&self) -> ProcessInfo {
        self.state.lock().info.clone()
    }

    pub fn set_pid(&self, pid: Option<u32>) {
        self.state.lock().info.pid = pid;
    }

    pub fn mark_failed(&self) {
        let mut state = self.state.lock();
        state.info.status = ProcessStatus::Failed;
        state.info.end_time = Some(Utc::now());
    }

    pub fn mark_exited(&self, exit_code: Option<i32>) {
        let mut state = self.state.lock();
        state.info.status = ProcessStatus::Exited;
        state.info.exit_code = exit_code;
        state.info.end_time = Some(Utc::now());
    }

    /// Restart policy snapshot, if this process has one.
    pub fn restart_config(&self) -> Option<RestartConfig> {
        self.state.lock().restart.clone()
    }

    pub fn increment_restart_count(&self) -> u32 {
        let mut state = self.state.lock();
        if let Some(restart) = state.restart.as_mut() {
            restart.restart_count += 1;
        }
        let count = state.restart.as_ref().map(|r| r.restart_count).unwrap_or(0);
        state.info.restart_count = count;
        count
    }

    pub fn reset_for_restart(&self) {
        let mut state = self.state.lock();
        state.info.status = ProcessStatus::Running;
        state.info.exit_code = None;
        state.info.end_time = None;
        state.info.start_time = Utc::now();
    }
}
