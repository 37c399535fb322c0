//! # Process Supervisor
//!
//! Spawns, watches, restarts, and reaps child services. Grounded in the
//! teacher's `coordination::HostCoordinator` (`Arc<Mutex<HashMap<ProcessId,
//! ServerProcess>>>` registry, `Command`/`Child` spawning, `try_wait`/`kill`
//! lifecycle) but rebuilt around `tokio::process` so reaping is a native
//! `.await` rather than a polled `try_wait` loop, and extended with the
//! restart/ready-gate/transport-preservation machinery the benchmark
//! coordinator never needed.

use crate::bus::Bus;
use crate::defaults;
use crate::error::{BrokerError, BrokerResult};
use crate::message::{Message, MessageType};
use crate::process::{Process, ProcessInfo, ProcessStatus, RestartConfig};
use crate::transport_manager::TransportManager;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Capability the Supervisor calls into for every message read off a
/// child's transport. Implemented by the Router; expressed as a trait
/// object so the Supervisor never depends on the Router type directly.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn accept(&self, msg: Message, source_process_id: String);
}

/// Tunables fixed for the lifetime of a `ProcessSupervisor`.
pub struct SupervisorConfig {
    pub service_dir: PathBuf,
    pub ready_timeout: Duration,
    pub kill_grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            service_dir: std::env::current_exe()
                .ok()
                .and_then(|p| p.parent().map(|p| p.to_path_buf()))
                .unwrap_or_else(|| PathBuf::from(".")),
            ready_timeout: defaults::READY_TIMEOUT,
            kill_grace: defaults::KILL_GRACE,
        }
    }
}

pub struct ProcessSupervisor {
    registry: Mutex<HashMap<String, Arc<Process>>>,
    bus: Arc<Bus>,
    transport_manager: Arc<TransportManager>,
    cancel: CancellationToken,
    config: SupervisorConfig,
    message_sink: tokio::sync::RwLock<Option<Arc<dyn MessageSink>>>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl ProcessSupervisor {
    pub fn new(
        bus: Arc<Bus>,
        transport_manager: Arc<TransportManager>,
        cancel: CancellationToken,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            registry: Mutex::new(HashMap::new()),
            bus,
            transport_manager,
            cancel,
            config,
            message_sink: tokio::sync::RwLock::new(None),
            background: Mutex::new(Vec::new()),
        }
    }

    pub async fn set_message_sink(&self, sink: Arc<dyn MessageSink>) {
        *self.message_sink.write().await = Some(sink);
    }

    pub fn get_process(&self, id: &str) -> Option<ProcessInfo> {
        self.registry.lock().get(id).map(|p| p.snapshot())
    }

    pub fn list_processes(&self) -> Vec<ProcessInfo> {
        self.registry.lock().values().map(|p| p.snapshot()).collect()
    }

    fn get_process_arc(&self, id: &str) -> BrokerResult<Arc<Process>> {
        self.registry
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| BrokerError::not_found(format!("process '{id}'")))
    }

    pub async fn spawn(self: &Arc<Self>, id: &str, command: &str, args: &[String]) -> BrokerResult<()> {
        self.spawn_internal(id, command, args, false, None).await
    }

    pub async fn spawn_rpc(self: &Arc<Self>, id: &str, command: &str, args: &[String]) -> BrokerResult<()> {
        self.spawn_internal(id, command, args, true, None).await
    }

    pub async fn spawn_with_restart(
        self: &Arc<Self>,
        id: &str,
        command: &str,
        args: &[String],
        max_restarts: i64,
        delay: Duration,
    ) -> BrokerResult<()> {
        let restart = RestartConfig {
            enabled: true,
            max_restarts,
            delay: if delay.is_zero() { defaults::RESTART_DELAY } else { delay },
            restart_count: 0,
        };
        self.spawn_internal(id, command, args, false, Some(restart)).await
    }

    pub async fn spawn_rpc_with_restart(
        self: &Arc<Self>,
        id: &str,
        command: &str,
        args: &[String],
        max_restarts: i64,
        delay: Duration,
    ) -> BrokerResult<()> {
        let restart = RestartConfig {
            enabled: true,
            max_restarts,
            delay: if delay.is_zero() { defaults::RESTART_DELAY } else { delay },
            restart_count: 0,
        };
        self.spawn_internal(id, command, args, true, Some(restart)).await
    }

    async fn spawn_internal(
        self: &Arc<Self>,
        id: &str,
        command: &str,
        args: &[String],
        rpc: bool,
        restart: Option<RestartConfig>,
    ) -> BrokerResult<()> {
        if self.registry.lock().contains_key(id) {
            return Err(BrokerError::invalid_argument(format!(
                "process '{id}' already registered"
            )));
        }
        validate_command(command)?;

        let process = Arc::new(Process::new(id, command, args.to_vec(), rpc, restart, &self.cancel));

        if rpc {
            if let Err(e) = self.transport_manager.register_uds_transport(id).await {
                process.mark_failed();
                self.registry.lock().insert(id.to_string(), process.clone());
                return Err(e);
            }
        }

        let mut cmd = self.build_command(id, command, args, rpc);
        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                if rpc {
                    let _ = self.transport_manager.unregister_transport(id).await;
                }
                process.mark_failed();
                self.registry.lock().insert(id.to_string(), process.clone());
                return Err(BrokerError::illegal_state(format!("failed to spawn '{id}': {e}")));
            }
        };

        process.set_pid(child.id());
        self.registry.lock().insert(id.to_string(), process.clone());
        info!(process_id = %id, pid = ?process.snapshot().pid, "process spawned");

        let reaper = self.spawn_reaper(process.clone(), child);
        self.background.lock().push(reaper);

        if rpc {
            let read_loop = self.spawn_read_loop(process.clone());
            self.background.lock().push(read_loop);

            match tokio::time::timeout(self.config.ready_timeout, process.ready.cancelled()).await {
                Ok(()) => debug!(process_id = %id, "subprocess_ready observed"),
                Err(_) => warn!(process_id = %id, "ready timeout; process remains routable"),
            }
        }

        Ok(())
    }

    fn build_command(&self, id: &str, command: &str, args: &[String], rpc: bool) -> Command {
        let mut cmd = Command::new(command);
        cmd.args(args);
        cmd.env_clear();
        cmd.env("PROCBROKER_VERSION", crate::VERSION);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        if rpc {
            let socket_path = self.transport_manager.socket_path_for(id);
            cmd.arg("--procbroker-id").arg(id);
            cmd.arg("--procbroker-socket").arg(socket_path);
        }
        cmd
    }

    /// Re-exec a restart-enabled process under the same id, reusing its
    /// already-registered (and still-listening) transport.
    async fn respawn(
        self: &Arc<Self>,
        id: &str,
        command: &str,
        args: &[String],
        rpc: bool,
        restart: RestartConfig,
    ) -> BrokerResult<()> {
        let process = Arc::new(Process::new(id, command, args.to_vec(), rpc, Some(restart), &self.cancel));
        let mut cmd = self.build_command(id, command, args, rpc);
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                process.mark_failed();
                self.registry.lock().insert(id.to_string(), process.clone());
                return Err(BrokerError::illegal_state(format!("failed to respawn '{id}': {e}")));
            }
        };
        process.set_pid(child.id());
        self.registry.lock().insert(id.to_string(), process.clone());
        info!(process_id = %id, "process restarted");

        let reaper = self.spawn_reaper(process.clone(), child);
        self.background.lock().push(reaper);
        if rpc {
            let read_loop = self.spawn_read_loop(process.clone());
            self.background.lock().push(read_loop);
        }
        Ok(())
    }

    fn spawn_reaper(self: &Arc<Self>, process: Arc<Process>, mut child: tokio::process::Child) -> JoinHandle<()> {
        let supervisor = self.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            let exit_code = status.as_ref().ok().and_then(|s| s.code());
            let id = process.id.clone();

            process.mark_exited(exit_code);
            process.done.cancel();

            if let Ok(event) = Message::new_event(
                "process_exited",
                "broker",
                &serde_json::json!({
                    "id": id,
                    "pid": process.snapshot().pid,
                    "exit_code": exit_code,
                }),
            ) {
                supervisor.bus.send_internal(event);
            }

            let abnormal = exit_code.map(|c| c != 0).unwrap_or(true);
            let restart = process.restart_config();
            let should_restart = restart.as_ref().map(RestartConfig::may_restart).unwrap_or(false)
                && !supervisor.cancel.is_cancelled();

            if should_restart {
                if abnormal {
                    warn!(process_id = %id, "process exited abnormally, restart scheduled");
                } else {
                    info!(process_id = %id, "process exited normally, restart scheduled");
                }
                let restart_cfg = restart.expect("should_restart implies restart config present");
                let delay = restart_cfg.delay;
                supervisor.registry.lock().remove(&id);
                tokio::time::sleep(delay).await;
                if supervisor.cancel.is_cancelled() {
                    return;
                }
                process.increment_restart_count();
                let bumped = process.restart_config().unwrap_or(restart_cfg);
                let command = process.command.clone();
                let args = process.args.clone();
                let rpc = process.rpc;
                if let Err(e) = supervisor.respawn(&id, &command, &args, rpc, bumped).await {
                    error!(process_id = %id, error = %e, "restart attempt failed");
                }
            } else {
                if abnormal {
                    error!(process_id = %id, "process exited abnormally, no restart");
                } else {
                    info!(process_id = %id, "process exited normally");
                }
                if process.rpc {
                    let _ = supervisor.transport_manager.unregister_transport(&id).await;
                }
            }
        })
    }

    fn spawn_read_loop(self: &Arc<Self>, process: Arc<Process>) -> JoinHandle<()> {
        let supervisor = self.clone();
        let id = process.id.clone();
        tokio::spawn(async move {
            let transport = match supervisor.transport_manager.get_transport(&id).await {
                Some(t) => t,
                None => return,
            };
            if let Err(e) = transport.accept().await {
                if !process.done.is_cancelled() {
                    warn!(process_id = %id, error = %e, "failed accepting rpc child connection");
                    supervisor.transport_manager.report_error(&id, &e).await;
                }
                return;
            }
            loop {
                if supervisor.cancel.is_cancelled() || process.done.is_cancelled() {
                    break;
                }
                match transport.receive().await {
                    Ok(msg) => {
                        if !process.ready.is_cancelled()
                            && msg.message_type == MessageType::Event
                            && msg.id == "subprocess_ready"
                        {
                            process.ready.cancel();
                            continue;
                        }
                        if let Some(sink) = supervisor.message_sink.read().await.as_ref() {
                            sink.accept(msg, id.clone()).await;
                        }
                    }
                    Err(e) => {
                        if !process.done.is_cancelled() {
                            supervisor.transport_manager.report_error(&id, &e).await;
                        }
                        break;
                    }
                }
            }
        })
    }

    /// Send SIGTERM, wait up to the configured grace period, escalate to
    /// SIGKILL on expiry, then wait once more for the reaper to finish.
    pub async fn kill(self: &Arc<Self>, id: &str) -> BrokerResult<()> {
        let process = self.get_process_arc(id)?;
        let pid = process.snapshot().pid;

        match pid {
            Some(pid) => {
                // SAFETY: `pid` came from `Child::id()` for a process this
                // supervisor spawned; signaling a pid we own is sound.
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGTERM);
                }
            }
            None => {
                process.mark_exited(None);
                process.done.cancel();
            }
        }

        if tokio::time::timeout(self.config.kill_grace, process.done.cancelled())
            .await
            .is_err()
        {
            if let Some(pid) = pid {
                warn!(process_id = %id, "kill grace expired, sending SIGKILL");
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGKILL);
                }
            }
            let _ = tokio::time::timeout(self.config.kill_grace, process.done.cancelled()).await;
        }
        Ok(())
    }

    /// Discover co-located service binaries and start them in parallel.
    /// Every spawn is issued before any ready-wait is awaited, so one slow
    /// child never serializes the others.
    pub async fn load_processes_from_config(self: &Arc<Self>) -> BrokerResult<()> {
        let mut entries = tokio::fs::read_dir(&self.config.service_dir).await.map_err(|e| {
            BrokerError::invalid_argument(format!(
                "reading service dir {}: {e}",
                self.config.service_dir.display()
            ))
        })?;

        let mut discovered = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| BrokerError::transport_io(e.to_string()))?
        {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if let Some(stripped) = file_name.strip_prefix(defaults::SERVICE_BINARY_PREFIX) {
                if validate_service_filename(&file_name).is_ok() {
                    discovered.push((stripped.to_string(), entry.path()));
                }
            }
        }

        self.spawn_services_parallel(discovered).await
    }

    async fn spawn_services_parallel(
        self: &Arc<Self>,
        services: Vec<(String, PathBuf)>,
    ) -> BrokerResult<()> {
        let mut handles = Vec::with_capacity(services.len());
        for (id, path) in services {
            let supervisor = self.clone();
            handles.push(tokio::spawn(async move {
                let command = path.to_string_lossy().into_owned();
                (id.clone(), supervisor.spawn_rpc(&id, &command, &[]).await)
            }));
        }

        let mut first_err = None;
        for handle in handles {
            if let Ok((id, Err(e))) = handle.await {
                warn!(process_id = %id, error = %e, "auto-discovered service failed to start");
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Cancel the root context, kill every still-running process, wait for
    /// all background tasks, then close the Bus and every transport.
    pub async fn shutdown(self: &Arc<Self>) {
        self.cancel.cancel();

        let ids: Vec<String> = self.registry.lock().keys().cloned().collect();
        for id in ids {
            let running = self
                .registry
                .lock()
                .get(&id)
                .map(|p| p.snapshot().status == ProcessStatus::Running)
                .unwrap_or(false);
            if running {
                if let Err(e) = self.kill(&id).await {
                    warn!(process_id = %id, error = %e, "error killing process during shutdown");
                }
            }
        }

        let handles: Vec<JoinHandle<()>> = self.background.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }

        self.bus.close();
        self.transport_manager.close_all().await;
    }
}

/// Command-path validation shared by every spawn entry point: empty
/// commands and absolute paths are rejected outright; relative paths must
/// start with `./` or `../` and may not contain a `..` segment beyond a
/// single leading one; everything else is treated as a bare name resolved
/// via the search path.
fn validate_command(command: &str) -> BrokerResult<()> {
    if command.is_empty() {
        return Err(BrokerError::invalid_argument("command must not be empty"));
    }
    let path = Path::new(command);
    if path.is_absolute() {
        return Err(BrokerError::invalid_argument("absolute command paths are rejected"));
    }
    if !command.contains('/') {
        return Ok(());
    }
    if !(command.starts_with("./") || command.starts_with("../")) {
        return Err(BrokerError::invalid_argument(
            "relative command paths must start with './' or '../'",
        ));
    }
    for (i, component) in path.components().enumerate() {
        if component == std::path::Component::ParentDir && i != 0 {
            return Err(BrokerError::invalid_argument(
                "command path contains a '..' segment beyond a single leading one",
            ));
        }
    }
    Ok(())
}

/// Auto-discovered service filenames must consist of letters, digits, `_`,
/// `-`, `.`, with a non-digit leading character.
fn validate_service_filename(name: &str) -> BrokerResult<()> {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_digit() => {
            return Err(BrokerError::invalid_argument("service filename must not start with a digit"))
        }
        Some(c) if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' => {}
        _ => return Err(BrokerError::invalid_argument("service filename has an invalid leading character")),
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
    {
        return Err(BrokerError::invalid_argument("service filename contains invalid characters"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_absolute_commands() {
        assert!(validate_command("").is_err());
        assert!(validate_command("/usr/bin/true").is_err());
    }

    #[test]
    fn accepts_bare_names_and_relative_paths() {
        assert!(validate_command("true").is_ok());
        assert!(validate_command("./svc-worker").is_ok());
        assert!(validate_command("../bin/svc-worker").is_ok());
    }

    #[test]
    fn rejects_traversal_beyond_single_leading_parent() {
        assert!(validate_command("../../etc/passwd").is_err());
        assert!(validate_command("./a/../b").is_err());
    }

    #[test]
    fn service_filename_rejects_leading_digit_and_bad_chars() {
        assert!(validate_service_filename("9svc-worker").is_err());
        assert!(validate_service_filename("svc worker").is_err());
        assert!(validate_service_filename("svc-worker.bin").is_ok());
    }

    #[tokio::test]
    async fn spawn_rejects_duplicate_ids() {
        let bus = Arc::new(Bus::new(8));
        let dir = tempfile::tempdir().unwrap();
        let transport_manager = Arc::new(TransportManager::new(dir.path()));
        let cancel = CancellationToken::new();
        let supervisor = Arc::new(ProcessSupervisor::new(
            bus,
            transport_manager,
            cancel,
            SupervisorConfig {
                service_dir: dir.path().to_path_buf(),
                ..SupervisorConfig::default()
            },
        ));
        supervisor.spawn("p1", "true", &[]).await.unwrap();
        let err = supervisor.spawn("p1", "true", &[]).await.unwrap_err();
        assert!(matches!(err, BrokerError::InvalidArgument(_)));
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn spawn_then_shutdown_reaps_cleanly() {
        let bus = Arc::new(Bus::new(8));
        let dir = tempfile::tempdir().unwrap();
        let transport_manager = Arc::new(TransportManager::new(dir.path()));
        let cancel = CancellationToken::new();
        let supervisor = Arc::new(ProcessSupervisor::new(
            bus,
            transport_manager,
            cancel,
            SupervisorConfig {
                service_dir: dir.path().to_path_buf(),
                ..SupervisorConfig::default()
            },
        ));
        supervisor.spawn("sleeper", "sleep", &["5".to_string()]).await.unwrap();
        assert!(supervisor.get_process("sleeper").is_some());
        supervisor.shutdown().await;
        let info = supervisor.get_process("sleeper").unwrap();
        assert_ne!(info.status, ProcessStatus::Running);
    }
}
