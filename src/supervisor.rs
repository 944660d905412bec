use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::process::Command;
use tokio::sync::{mpsc, watch};

use crate::bridge::{Bridge, BridgeEvent, Reply};
use crate::rpc::RpcError;

const BACKOFF_INITIAL: Duration = Duration::from_millis(200);
const BACKOFF_CAP: Duration = Duration::from_secs(10);
/// After the child has been running this long, the backoff resets.
const STABLE_WINDOW: Duration = Duration::from_secs(30);
/// How many stderr lines matching /error/i the health surface retains.
const RECENT_ERRORS_CAP: usize = 5;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

/// How to launch the Pike child.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    /// Interpreter executable (`pike.pikePath`).
    pub program: String,
    /// Extra arguments (e.g. the analysis script the interpreter runs).
    pub args: Vec<String>,
    /// Environment handed to the child (`PIKE_INCLUDE_PATH` and friends).
    pub env: Vec<(String, String)>,
}

/// Lifecycle phase of the supervised child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Stopped,
    Starting,
    Running,
    CrashRecovery,
    /// Startup failed; a backoff retry is scheduled.
    Failed,
    /// Explicit shutdown. Terminal.
    ShutDown,
}

/// Interpreter identity cached after the version handshake.
#[derive(Debug, Clone)]
pub struct PikeVersion {
    pub version: String,
    pub display: String,
    pub path: String,
}

impl PikeVersion {
    fn unknown() -> Self {
        Self {
            version: "Unknown".into(),
            display: "Unknown".into(),
            path: "Unknown".into(),
        }
    }
}

struct SupState {
    bridge: Option<Arc<Bridge>>,
    child_pid: Option<u32>,
    pike_version: Option<PikeVersion>,
    recent_errors: VecDeque<String>,
    restarts: u64,
    shutting_down: bool,
}

/// Spawns and babysits the Pike child process.
///
/// Owns the restart loop: on child exit every pending request is rejected
/// with `Transport`, then the child is respawned with exponential backoff
/// (200 ms doubling to 10 s, reset after 30 s of stable running). Restarts
/// are unlimited until [`Supervisor::stop`].
pub struct Supervisor {
    config: SpawnConfig,
    state: Mutex<SupState>,
    phase_tx: watch::Sender<Phase>,
    started_at: jiff::Timestamp,
    start_instant: Instant,
}

impl Supervisor {
    /// Create the supervisor and kick off the run loop.
    pub fn start(config: SpawnConfig) -> Arc<Self> {
        let (phase_tx, _) = watch::channel(Phase::Stopped);
        let sup = Arc::new(Self {
            config,
            state: Mutex::new(SupState {
                bridge: None,
                child_pid: None,
                pike_version: None,
                recent_errors: VecDeque::new(),
                restarts: 0,
                shutting_down: false,
            }),
            phase_tx,
            started_at: jiff::Timestamp::now(),
            start_instant: Instant::now(),
        });
        tokio::spawn(run_loop(Arc::clone(&sup)));
        sup
    }

    pub fn phase(&self) -> Phase {
        *self.phase_tx.borrow()
    }

    /// Wait until the child reaches `Running`, or the deadline passes.
    pub async fn wait_until_running(&self, deadline: Duration) -> bool {
        let mut rx = self.phase_tx.subscribe();
        let wait = async {
            loop {
                if *rx.borrow_and_update() == Phase::Running {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        };
        tokio::time::timeout(deadline, wait).await.is_ok()
    }

    /// Issue an RPC through the current bridge.
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
        dedup_key: Option<&str>,
    ) -> Result<Reply, RpcError> {
        let bridge = {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.bridge.clone()
        };
        match bridge {
            Some(bridge) if !bridge.is_closed() => {
                bridge.call(method, params, timeout, dedup_key).await
            }
            _ => Err(RpcError::Transport("pike process is not running".into())),
        }
    }

    /// Request a permanent stop. The run loop kills the child and settles
    /// into `ShutDown`.
    pub fn stop(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.shutting_down = true;
            if let Some(bridge) = state.bridge.take() {
                bridge.close("supervisor shutting down");
            }
        }
        let _ = self.phase_tx.send(Phase::ShutDown);
    }

    pub fn pike_version(&self) -> Option<PikeVersion> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pike_version
            .clone()
    }

    /// Plain-text health report backing the `pike.lsp.showDiagnostics`
    /// command.
    pub fn health_report(&self) -> String {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let phase = self.phase();
        let uptime = self.start_instant.elapsed();
        let version = state
            .pike_version
            .clone()
            .unwrap_or_else(PikeVersion::unknown);

        let mut report = String::new();
        report.push_str(&format!(
            "pike-lsp {} (started {})\n",
            env!("CARGO_PKG_VERSION"),
            self.started_at
        ));
        report.push_str(&format!("uptime: {}s\n", uptime.as_secs()));
        report.push_str(&format!(
            "bridge connected: {}\n",
            phase == Phase::Running
        ));
        report.push_str(&format!("state: {phase:?}\n"));
        match state.child_pid {
            Some(pid) => report.push_str(&format!("pike pid: {pid}\n")),
            None => report.push_str("pike pid: none\n"),
        }
        report.push_str(&format!("pike version: {}\n", version.display));
        report.push_str(&format!("pike path: {}\n", version.path));
        report.push_str(&format!("restarts: {}\n", state.restarts));
        if state.recent_errors.is_empty() {
            report.push_str("recent errors: none\n");
        } else {
            report.push_str("recent errors:\n");
            for line in &state.recent_errors {
                report.push_str(&format!("  {line}\n"));
            }
        }
        report
    }

    fn set_phase(&self, phase: Phase) {
        let _ = self.phase_tx.send(phase);
    }

    fn shutting_down(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .shutting_down
    }
}

async fn run_loop(sup: Arc<Supervisor>) {
    let mut backoff = BACKOFF_INITIAL;

    loop {
        if sup.shutting_down() {
            sup.set_phase(Phase::ShutDown);
            return;
        }

        sup.set_phase(Phase::Starting);
        let mut child = match spawn_child(&sup.config) {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!(program = %sup.config.program, error = %e, "failed to spawn pike");
                sup.set_phase(Phase::Failed);
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(BACKOFF_CAP);
                continue;
            }
        };

        let pid = child.id();
        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        let (bridge, events_rx) = Bridge::new(stdin, stdout);
        bridge.watch_stderr(stderr);
        tokio::spawn(consume_events(Arc::clone(&sup), events_rx));

        {
            let mut state = sup.state.lock().unwrap_or_else(|e| e.into_inner());
            state.bridge = Some(Arc::clone(&bridge));
            state.child_pid = pid;
        }

        // Version handshake. A failure here only degrades the cached
        // version to "Unknown"; the phase still reaches Running as long as
        // the child itself is alive. Dead children are recognized by their
        // exit status (or a closed stdout), never by the RPC error variant.
        let version = match handshake(&bridge).await {
            Ok(version) => version,
            Err(e) => {
                let child_exited = matches!(child.try_wait(), Ok(Some(_)));
                if child_exited || bridge.is_closed() {
                    tracing::warn!(pid, error = %e, "pike child failed to start");
                    sup.set_phase(Phase::Failed);
                    let _ = child.kill().await;
                    bridge.close("pike startup failed");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(BACKOFF_CAP);
                    continue;
                }
                tracing::warn!(pid, error = %e, "get_version failed; serving with unknown version");
                PikeVersion::unknown()
            }
        };
        {
            let mut state = sup.state.lock().unwrap_or_else(|e| e.into_inner());
            state.pike_version = Some(version);
        }
        tracing::info!(pid, "pike child running");
        sup.set_phase(Phase::Running);

        let running_since = Instant::now();
        let exited = wait_for_exit(&sup, &mut child).await;

        bridge.close("pike process exited");
        {
            let mut state = sup.state.lock().unwrap_or_else(|e| e.into_inner());
            state.bridge = None;
            state.child_pid = None;
            if !state.shutting_down {
                state.restarts += 1;
            }
        }

        if !exited || sup.shutting_down() {
            let _ = child.kill().await;
            sup.set_phase(Phase::ShutDown);
            return;
        }

        tracing::warn!(pid, "pike child exited; scheduling restart");
        sup.set_phase(Phase::CrashRecovery);

        if running_since.elapsed() >= STABLE_WINDOW {
            backoff = BACKOFF_INITIAL;
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(BACKOFF_CAP);
    }
}

fn spawn_child(config: &SpawnConfig) -> std::io::Result<tokio::process::Child> {
    let mut command = Command::new(&config.program);
    command
        .args(&config.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in &config.env {
        command.env(key, value);
    }
    command.spawn()
}

async fn handshake(bridge: &Bridge) -> Result<PikeVersion, RpcError> {
    let reply = bridge
        .call("get_version", serde_json::json!({}), STARTUP_TIMEOUT, None)
        .await?;
    Ok(parse_version(&reply.result))
}

fn parse_version(result: &Value) -> PikeVersion {
    let field = |name: &str| {
        result
            .get(name)
            .and_then(Value::as_str)
            .unwrap_or("Unknown")
            .to_string()
    };
    PikeVersion {
        version: field("version"),
        display: field("display"),
        path: field("absolute_path"),
    }
}

/// Await child exit or an external stop request. Returns false when the
/// supervisor is shutting down (the child may still be alive and is killed
/// by the caller).
async fn wait_for_exit(sup: &Arc<Supervisor>, child: &mut tokio::process::Child) -> bool {
    let mut phase_rx = sup.phase_tx.subscribe();
    if *phase_rx.borrow_and_update() == Phase::ShutDown {
        return false;
    }
    loop {
        tokio::select! {
            status = child.wait() => {
                match status {
                    Ok(status) => tracing::debug!(%status, "pike child exited"),
                    Err(e) => tracing::warn!(error = %e, "failed waiting on pike child"),
                }
                return true;
            }
            changed = phase_rx.changed() => {
                if changed.is_err() || *phase_rx.borrow() == Phase::ShutDown {
                    return false;
                }
            }
        }
    }
}

async fn consume_events(sup: Arc<Supervisor>, mut events_rx: mpsc::UnboundedReceiver<BridgeEvent>) {
    while let Some(event) = events_rx.recv().await {
        match event {
            BridgeEvent::Stderr(line) => {
                tracing::debug!(target: "pike_stderr", "{line}");
                if line.to_ascii_lowercase().contains("error") {
                    let mut state = sup.state.lock().unwrap_or_else(|e| e.into_inner());
                    if state.recent_errors.len() == RECENT_ERRORS_CAP {
                        state.recent_errors.pop_front();
                    }
                    state.recent_errors.push_back(line);
                }
            }
            BridgeEvent::ParseError { line, error } => {
                tracing::warn!(%error, "pike produced an unparseable line: {line}");
            }
            BridgeEvent::Closed => return,
        }
    }
}
