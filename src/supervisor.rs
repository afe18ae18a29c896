use crate::config::{BackendSpec, ADAPTER_MESSAGE_PATH, ADAPTER_SSE_PATH};
use crate::ports::PortAssignment;
use serde::Serialize;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

/// Process id of the local tools process. `@` never appears in server names.
pub const LOCAL_TOOLS_ID: &str = "@local-tools";

/// How long to wait for reaping after a forced kill
const KILL_WAIT: Duration = Duration::from_secs(2);

/// Lifecycle of a supervised child
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum ProcessState {
    /// Spawn has been issued
    Starting,
    /// The OS accepted the spawn and the process has not exited yet
    Running,
    /// The process exited; `code` is absent when it was killed by a signal
    Exited { code: Option<i32> },
    /// The process could not be spawned or waited on
    Failed { reason: String },
}

impl ProcessState {
    /// Whether the process may still be running
    pub fn is_live(&self) -> bool {
        matches!(self, ProcessState::Starting | ProcessState::Running)
    }
}

/// Requests handled by the task that owns a child
enum Control {
    Terminate(oneshot::Sender<()>),
    Kill(oneshot::Sender<()>),
}

/// One supervised child process.
///
/// The OS handle is owned by a watcher task that is the only writer of the
/// state channel. Everything else talks to it through `control`, so a crash
/// notification and a termination request can never act on a reaped pid.
pub struct ManagedProcess {
    id: String,
    port: u16,
    pid: Option<u32>,
    state: watch::Receiver<ProcessState>,
    control: Option<mpsc::UnboundedSender<Control>>,
    termination_requested: AtomicBool,
}

impl ManagedProcess {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Port the process was told to listen on
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> ProcessState {
        self.state.borrow().clone()
    }

    pub fn is_live(&self) -> bool {
        self.state.borrow().is_live()
    }

    /// Wait until the process leaves the live states
    pub async fn wait_exit(&self) -> ProcessState {
        let mut rx = self.state.clone();
        if let Ok(state) = rx.wait_for(|s| !s.is_live()).await {
            return state.clone();
        }
        // Watcher gone without a final state (runtime shutting down)
        let state = rx.borrow().clone();
        state
    }

    /// Ask the process to terminate. Returns true only for the call that
    /// actually delivered the request; later calls and calls on exited
    /// processes are no-ops.
    async fn request_termination(&self) -> bool {
        if !self.is_live() {
            return false;
        }
        if self
            .termination_requested
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        self.send(Control::Terminate).await
    }

    async fn force_kill(&self) -> bool {
        if !self.is_live() {
            return false;
        }
        self.send(Control::Kill).await
    }

    async fn send(&self, make: fn(oneshot::Sender<()>) -> Control) -> bool {
        let Some(control) = &self.control else {
            return false;
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        if control.send(make(ack_tx)).is_err() {
            // Watcher already observed the exit
            return false;
        }
        ack_rx.await.is_ok()
    }

    fn snapshot(&self) -> ProcessSnapshot {
        ProcessSnapshot {
            id: self.id.clone(),
            pid: self.pid,
            port: self.port,
            state: self.state(),
        }
    }
}

/// Point-in-time view of a managed process, for diagnostics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessSnapshot {
    pub id: String,
    pub pid: Option<u32>,
    pub port: u16,
    #[serde(flatten)]
    pub state: ProcessState,
}

/// Outcome of [`ProcessSupervisor::terminate_all`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TerminationReport {
    /// Processes that received a termination request from this call
    pub signaled: usize,
    /// Processes that had to be killed after the grace period
    pub killed: usize,
}

/// Owns every child process of the gateway.
///
/// Children are spawned during a single initialization phase through the
/// `&mut self` spawn methods; once the supervisor is shared (usually behind
/// an `Arc`), [`terminate_all`](ProcessSupervisor::terminate_all) is the only
/// operation that acts on the children.
///
/// ```ignore
/// let mut supervisor = ProcessSupervisor::new(settings.adapter_command.clone(), n + 1);
/// supervisor.spawn_local_tools(&settings.local_tools_command, settings.local_tools_port);
/// for assignment in &assignments {
///     supervisor.spawn_backend_adapter(assignment);
/// }
/// let supervisor = Arc::new(supervisor);
/// ```
pub struct ProcessSupervisor {
    processes: Vec<ManagedProcess>,
    adapter_command: Vec<String>,
}

impl ProcessSupervisor {
    /// Create a supervisor that launches adapters with `adapter_command`
    /// (program plus leading arguments)
    pub fn new(adapter_command: Vec<String>, capacity: usize) -> Self {
        Self {
            processes: Vec::with_capacity(capacity),
            adapter_command,
        }
    }

    /// Launch the local tools process. It inherits the gateway's stdio and
    /// environment and is told its port through `PORT`.
    pub fn spawn_local_tools(&mut self, command_line: &[String], port: u16) -> &ManagedProcess {
        info!(command = ?command_line, port, "Starting local tools server");

        let command = command_line.first().map(String::as_str).unwrap_or_default();
        let mut cmd = Command::new(command);
        cmd.args(command_line.iter().skip(1));
        cmd.env("PORT", port.to_string());

        self.spawn(LOCAL_TOOLS_ID, port, cmd)
    }

    /// Launch the adapter fronting one backend on its assigned port. The
    /// backend's `env` is overlaid on the gateway's environment.
    pub fn spawn_backend_adapter(&mut self, assignment: &PortAssignment) -> &ManagedProcess {
        let spec = &assignment.spec;
        let port = assignment.port;
        let args = self.adapter_args(spec, port);

        info!(
            server = %spec.name,
            port,
            native = %spec.command_string(),
            "Starting adapter"
        );

        let program = self
            .adapter_command
            .first()
            .map(String::as_str)
            .unwrap_or_default();
        let mut cmd = Command::new(program);
        cmd.args(&args);
        cmd.envs(&spec.env);

        self.spawn(&spec.name, port, cmd)
    }

    /// Full adapter argument list (after the program name) for a backend
    pub fn adapter_args(&self, spec: &BackendSpec, port: u16) -> Vec<String> {
        let mut args: Vec<String> = self.adapter_command.iter().skip(1).cloned().collect();
        args.extend([
            "--stdio".to_string(),
            spec.command_string(),
            "--port".to_string(),
            port.to_string(),
            "--baseUrl".to_string(),
            format!("http://localhost:{}/{}", port, spec.name),
            "--ssePath".to_string(),
            ADAPTER_SSE_PATH.to_string(),
            "--messagePath".to_string(),
            ADAPTER_MESSAGE_PATH.to_string(),
            "--logLevel".to_string(),
            "none".to_string(),
        ]);
        args
    }

    fn spawn(&mut self, id: &str, port: u16, mut cmd: Command) -> &ManagedProcess {
        cmd.stdin(Stdio::inherit());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());
        // Last resort if the gateway unwinds without terminate_all
        cmd.kill_on_drop(true);

        let (state_tx, state_rx) = watch::channel(ProcessState::Starting);

        let (pid, control) = match cmd.spawn() {
            Ok(child) => {
                let pid = child.id();
                info!(server = id, pid, port, "Process spawned");
                state_tx.send_replace(ProcessState::Running);

                let (control_tx, control_rx) = mpsc::unbounded_channel();
                tokio::spawn(watch_child(id.to_string(), child, state_tx, control_rx));
                (pid, Some(control_tx))
            }
            Err(e) => {
                error!(server = id, error = %e, "Failed to start process");
                state_tx.send_replace(ProcessState::Failed {
                    reason: e.to_string(),
                });
                (None, None)
            }
        };

        self.processes.push(ManagedProcess {
            id: id.to_string(),
            port,
            pid,
            state: state_rx,
            control,
            termination_requested: AtomicBool::new(false),
        });
        self.processes.last().expect("process was just pushed")
    }

    /// All tracked processes in spawn order
    pub fn processes(&self) -> &[ManagedProcess] {
        &self.processes
    }

    pub fn get(&self, id: &str) -> Option<&ManagedProcess> {
        self.processes.iter().find(|p| p.id == id)
    }

    /// Number of processes that may still be running
    pub fn live_count(&self) -> usize {
        self.processes.iter().filter(|p| p.is_live()).count()
    }

    pub fn snapshot(&self) -> Vec<ProcessSnapshot> {
        self.processes.iter().map(ManagedProcess::snapshot).collect()
    }

    /// Ask every live child to terminate, wait up to `grace` for them to
    /// exit, then kill whatever is left.
    ///
    /// Safe to call repeatedly and concurrently: each child receives at most
    /// one termination request, and exited or failed children are skipped.
    pub async fn terminate_all(&self, grace: Duration) -> TerminationReport {
        let mut report = TerminationReport::default();
        let mut pending = Vec::new();

        for process in &self.processes {
            if process.request_termination().await {
                debug!(server = %process.id, pid = process.pid, "Termination requested");
                report.signaled += 1;
                pending.push(process);
            }
        }

        if pending.is_empty() {
            return report;
        }

        let exited = tokio::time::timeout(grace, async {
            for process in &pending {
                process.wait_exit().await;
            }
        })
        .await;

        if exited.is_err() {
            for process in &pending {
                if process.force_kill().await {
                    warn!(
                        server = %process.id,
                        grace_period_secs = grace.as_secs(),
                        "Grace period exceeded, killed process"
                    );
                    report.killed += 1;
                }
            }
            let _ = tokio::time::timeout(KILL_WAIT, async {
                for process in &pending {
                    process.wait_exit().await;
                }
            })
            .await;
        }

        report
    }
}

/// Owns `child` until it exits, applying termination requests and publishing
/// the final state
async fn watch_child(
    id: String,
    mut child: Child,
    state: watch::Sender<ProcessState>,
    mut control: mpsc::UnboundedReceiver<Control>,
) {
    let mut terminating = false;

    loop {
        tokio::select! {
            status = child.wait() => {
                let next = match status {
                    Ok(status) => {
                        let code = status.code();
                        if terminating {
                            info!(server = %id, ?code, "Process exited after termination request");
                        } else if status.success() {
                            info!(server = %id, "Process exited with code 0");
                        } else {
                            error!(
                                server = %id,
                                code = %code.map(|c| c.to_string()).unwrap_or_else(|| "unknown".to_string()),
                                "Process exited"
                            );
                        }
                        ProcessState::Exited { code }
                    }
                    Err(e) => {
                        error!(server = %id, error = %e, "Failed to wait for process");
                        ProcessState::Failed { reason: e.to_string() }
                    }
                };
                state.send_replace(next);
                return;
            }
            Some(request) = control.recv() => match request {
                Control::Terminate(ack) => {
                    terminating = true;
                    send_terminate(&id, &mut child);
                    let _ = ack.send(());
                }
                Control::Kill(ack) => {
                    if let Err(e) = child.start_kill() {
                        debug!(server = %id, error = %e, "Kill failed, process already gone");
                    }
                    let _ = ack.send(());
                }
            },
        }
    }
}

/// Send SIGTERM on Unix, or kill on other platforms
fn send_terminate(id: &str, child: &mut Child) {
    let Some(pid) = child.id() else {
        return;
    };
    info!(server = id, pid, "Sending SIGTERM");

    #[cfg(unix)]
    unsafe {
        libc::kill(pid as i32, libc::SIGTERM);
    }

    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::Path;

    fn spec(name: &str) -> BackendSpec {
        BackendSpec {
            name: name.to_string(),
            command: "npx".to_string(),
            args: vec!["-y".to_string(), "weather-mcp".to_string()],
            env: HashMap::new(),
        }
    }

    fn assignment(spec: BackendSpec, port: u16) -> PortAssignment {
        PortAssignment { spec, port }
    }

    /// Adapter that runs `script` with the adapter arguments as `$@`
    fn shell_adapter(script: &str) -> Vec<String> {
        vec![
            "sh".to_string(),
            "-c".to_string(),
            script.to_string(),
            "adapter".to_string(),
        ]
    }

    async fn wait_for_file(path: &Path) -> String {
        for _ in 0..100 {
            if let Ok(content) = std::fs::read_to_string(path) {
                if content.ends_with('\n') {
                    return content;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("{} was never written", path.display());
    }

    #[test]
    fn test_adapter_args() {
        let supervisor = ProcessSupervisor::new(
            vec!["npx".to_string(), "-y".to_string(), "supergateway".to_string()],
            1,
        );
        let args = supervisor.adapter_args(&spec("weather"), 8100);

        assert_eq!(
            args,
            vec![
                "-y",
                "supergateway",
                "--stdio",
                "npx -y weather-mcp",
                "--port",
                "8100",
                "--baseUrl",
                "http://localhost:8100/weather",
                "--ssePath",
                "/sse",
                "--messagePath",
                "/message",
                "--logLevel",
                "none",
            ]
        );
    }

    #[test]
    fn test_process_state_liveness() {
        assert!(ProcessState::Starting.is_live());
        assert!(ProcessState::Running.is_live());
        assert!(!ProcessState::Exited { code: Some(0) }.is_live());
        assert!(!ProcessState::Failed {
            reason: "nope".to_string()
        }
        .is_live());
    }

    #[test]
    fn test_process_state_serialization() {
        let json = serde_json::to_value(ProcessState::Exited { code: Some(3) }).unwrap();
        assert_eq!(json, serde_json::json!({"state": "exited", "code": 3}));

        let json = serde_json::to_value(ProcessState::Running).unwrap();
        assert_eq!(json, serde_json::json!({"state": "running"}));
    }

    #[tokio::test]
    async fn test_spawn_and_terminate() {
        let mut supervisor = ProcessSupervisor::new(shell_adapter("exec sleep 60"), 2);
        supervisor.spawn_backend_adapter(&assignment(spec("a"), 18100));
        supervisor.spawn_backend_adapter(&assignment(spec("b"), 18101));

        assert_eq!(supervisor.live_count(), 2);
        assert_eq!(supervisor.get("a").unwrap().state(), ProcessState::Running);
        assert!(supervisor.get("a").unwrap().pid().is_some());
        assert_eq!(supervisor.get("b").unwrap().port(), 18101);

        let report = supervisor.terminate_all(Duration::from_secs(5)).await;
        assert_eq!(report.signaled, 2);
        assert_eq!(report.killed, 0);
        assert_eq!(supervisor.live_count(), 0);

        // SIGTERM leaves no exit code
        assert_eq!(
            supervisor.get("a").unwrap().state(),
            ProcessState::Exited { code: None }
        );
    }

    #[tokio::test]
    async fn test_terminate_all_is_idempotent() {
        let mut supervisor = ProcessSupervisor::new(shell_adapter("exec sleep 60"), 1);
        supervisor.spawn_backend_adapter(&assignment(spec("a"), 18110));

        let first = supervisor.terminate_all(Duration::from_secs(5)).await;
        let second = supervisor.terminate_all(Duration::from_secs(5)).await;

        assert_eq!(first.signaled, 1);
        assert_eq!(second, TerminationReport::default());
    }

    #[tokio::test]
    async fn test_concurrent_terminate_all_signals_once() {
        let mut supervisor = ProcessSupervisor::new(shell_adapter("exec sleep 60"), 1);
        supervisor.spawn_backend_adapter(&assignment(spec("a"), 18115));

        let (first, second) = tokio::join!(
            supervisor.terminate_all(Duration::from_secs(5)),
            supervisor.terminate_all(Duration::from_secs(5)),
        );
        assert_eq!(first.signaled + second.signaled, 1);
    }

    #[tokio::test]
    async fn test_terminate_skips_exited_process() {
        let mut supervisor = ProcessSupervisor::new(shell_adapter("exit 3"), 1);
        let process = supervisor.spawn_backend_adapter(&assignment(spec("a"), 18120));

        assert_eq!(process.wait_exit().await, ProcessState::Exited { code: Some(3) });

        let report = supervisor.terminate_all(Duration::from_secs(1)).await;
        assert_eq!(report.signaled, 0);
        assert_eq!(
            supervisor.get("a").unwrap().state(),
            ProcessState::Exited { code: Some(3) }
        );
    }

    #[tokio::test]
    async fn test_spawn_failure_is_isolated() {
        let mut supervisor =
            ProcessSupervisor::new(vec!["/nonexistent/adapter-binary".to_string()], 2);
        supervisor.spawn_backend_adapter(&assignment(spec("broken"), 18130));
        supervisor.spawn_local_tools(&["sleep".to_string(), "60".to_string()], 18131);

        assert!(matches!(
            supervisor.get("broken").unwrap().state(),
            ProcessState::Failed { .. }
        ));
        assert!(supervisor.get("broken").unwrap().pid().is_none());
        assert_eq!(
            supervisor.get(LOCAL_TOOLS_ID).unwrap().state(),
            ProcessState::Running
        );

        let report = supervisor.terminate_all(Duration::from_secs(5)).await;
        assert_eq!(report.signaled, 1);
    }

    #[tokio::test]
    async fn test_grace_period_escalates_to_kill() {
        let mut supervisor =
            ProcessSupervisor::new(shell_adapter("trap '' TERM; while :; do sleep 1; done"), 1);
        supervisor.spawn_backend_adapter(&assignment(spec("stubborn"), 18140));

        // Let the shell install its trap
        tokio::time::sleep(Duration::from_millis(300)).await;

        let report = supervisor.terminate_all(Duration::from_millis(300)).await;
        assert_eq!(report.signaled, 1);
        assert_eq!(report.killed, 1);
        assert!(!supervisor.get("stubborn").unwrap().is_live());
    }

    #[tokio::test]
    async fn test_adapter_receives_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("args.txt");
        let script = format!("printf '%s\\n' \"$@\" > '{}'", out.display());

        let mut supervisor = ProcessSupervisor::new(shell_adapter(&script), 1);
        let process = supervisor.spawn_backend_adapter(&assignment(spec("weather"), 18150));
        process.wait_exit().await;

        let content = wait_for_file(&out).await;
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(
            lines,
            vec![
                "--stdio",
                "npx -y weather-mcp",
                "--port",
                "18150",
                "--baseUrl",
                "http://localhost:18150/weather",
                "--ssePath",
                "/sse",
                "--messagePath",
                "/message",
                "--logLevel",
                "none",
            ]
        );
    }

    #[tokio::test]
    async fn test_adapter_environment_overlay() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("env.txt");
        let script = format!(
            "printf '%s %s\\n' \"$API_KEY\" \"${{PATH:+path}}\" > '{}'",
            out.display()
        );

        let mut backend = spec("github");
        backend.env.insert("API_KEY".to_string(), "secret".to_string());

        let mut supervisor = ProcessSupervisor::new(shell_adapter(&script), 1);
        let process = supervisor.spawn_backend_adapter(&assignment(backend, 18160));
        process.wait_exit().await;

        // Backend env is set and the parent's PATH is still inherited
        assert_eq!(wait_for_file(&out).await, "secret path\n");
    }

    #[tokio::test]
    async fn test_local_tools_receives_port() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("port.txt");
        let command = vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("echo \"$PORT\" > '{}'", out.display()),
        ];

        let mut supervisor = ProcessSupervisor::new(Vec::new(), 1);
        let process = supervisor.spawn_local_tools(&command, 18170);
        assert_eq!(process.id(), LOCAL_TOOLS_ID);
        process.wait_exit().await;

        assert_eq!(wait_for_file(&out).await, "18170\n");
    }

    #[tokio::test]
    async fn test_snapshot_lists_processes_in_spawn_order() {
        let mut supervisor = ProcessSupervisor::new(shell_adapter("exec sleep 60"), 3);
        supervisor.spawn_local_tools(&["sleep".to_string(), "60".to_string()], 18180);
        supervisor.spawn_backend_adapter(&assignment(spec("a"), 18181));
        supervisor.spawn_backend_adapter(&assignment(spec("b"), 18182));

        let ids: Vec<String> = supervisor.snapshot().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![LOCAL_TOOLS_ID, "a", "b"]);

        supervisor.terminate_all(Duration::from_secs(5)).await;
    }
}
