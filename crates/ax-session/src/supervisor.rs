//! The executor that drives one agent process per task.
//!
//! Driving protocol: wait for the agent's prompt box (answering the trust
//! dialog on the way), type the prompt like a human, submit, then babysit
//! the run -- auto-answering approval dialogs and watching for idle
//! silence. The keep-alive heartbeat and the injection queue are serviced
//! by every phase, from spawn to exit: the PTY backend can suspend an
//! un-heartbeated child during a slow startup just as easily as mid-run,
//! and a corrective command queued before readiness must still reach the
//! terminal promptly. Injections never land in the middle of a typed
//! prompt; mid-typing they wait for the submit byte.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use ax_core::config::ExecutionConfig;
use ax_core::types::{AgentInstance, AgentState, TaskId};
use ax_hooks::executor::{ExecutionRequest, Executor, ExecutorError, Result, StreamChunk};

use crate::profile::AgentProfile;
use crate::pty::{PtyProcess, PtySpawner, SpawnSpec};

/// How often the driver polls output between protocol phases.
const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Window of recent output scanned for approval dialogs.
const APPROVAL_SCAN_BYTES: usize = 2_000;
/// Minimum spacing between auto-approvals.
const APPROVAL_DEBOUNCE: Duration = Duration::from_secs(2);
/// Grace between an idle interrupt and the kill.
const IDLE_KILL_GRACE: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

struct Session {
    process: PtyProcess,
    info: Mutex<AgentInstance>,
    buffer: Mutex<String>,
    /// Injections wait here until the driver is between writes.
    pending: Mutex<VecDeque<String>>,
    killed: AtomicBool,
    typing: AtomicBool,
    trust_answered: AtomicBool,
    last_approval: Mutex<Option<Instant>>,
    /// When the keep-alive newline was last written. Lives on the session,
    /// not in any one phase loop: the PTY backend can suspend a child at
    /// any point between spawn and exit, so every phase has to tick it.
    last_heartbeat: Mutex<Instant>,
    /// Monotonic count of bytes ever appended, independent of trimming.
    total_out: Mutex<usize>,
    /// High-water mark of output already scanned for dialogs, so a dialog
    /// that stays in the rolling buffer is never answered twice.
    approval_mark: Mutex<usize>,
    output_cap: usize,
}

impl Session {
    fn new(process: PtyProcess, output_cap: usize) -> Self {
        Self {
            process,
            info: Mutex::new(AgentInstance::new()),
            buffer: Mutex::new(String::new()),
            pending: Mutex::new(VecDeque::new()),
            killed: AtomicBool::new(false),
            typing: AtomicBool::new(false),
            trust_answered: AtomicBool::new(false),
            last_approval: Mutex::new(None),
            last_heartbeat: Mutex::new(Instant::now()),
            total_out: Mutex::new(0),
            approval_mark: Mutex::new(0),
            output_cap,
        }
    }

    fn set_state(&self, state: AgentState) {
        let mut info = self.info.lock().unwrap_or_else(|e| e.into_inner());
        info.state = state;
        info.last_activity = chrono::Utc::now();
    }

    fn snapshot(&self) -> AgentInstance {
        self.info.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn append_output(&self, text: &str) {
        *self.total_out.lock().unwrap_or_else(|e| e.into_inner()) += text.len();
        let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        buffer.push_str(text);
        if buffer.len() > self.output_cap {
            let half = buffer.len() / 2;
            let cut = (0..=half)
                .rev()
                .find(|i| buffer.is_char_boundary(*i))
                .unwrap_or(0);
            buffer.drain(..cut);
        }
    }

    fn output(&self) -> String {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn buffer_len(&self) -> usize {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Last `n` bytes of the buffer, aligned to a char boundary.
    fn tail(&self, n: usize) -> String {
        let buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        if buffer.len() <= n {
            return buffer.clone();
        }
        let start = (buffer.len() - n..buffer.len())
            .find(|i| buffer.is_char_boundary(*i))
            .unwrap_or(buffer.len());
        buffer[start..].to_string()
    }

    /// Output that arrived since the last answered dialog, capped at `max`.
    fn fresh_tail(&self, max: usize) -> String {
        let total = *self.total_out.lock().unwrap_or_else(|e| e.into_inner());
        let mark = *self.approval_mark.lock().unwrap_or_else(|e| e.into_inner());
        let fresh = total.saturating_sub(mark).min(max);
        self.tail(fresh)
    }

    /// Everything up to now counts as scanned for dialog purposes.
    fn mark_scanned(&self) {
        let total = *self.total_out.lock().unwrap_or_else(|e| e.into_inner());
        *self.approval_mark.lock().unwrap_or_else(|e| e.into_inner()) = total;
    }

    fn write_bytes(&self, data: &[u8]) -> Result<()> {
        self.process
            .send(data)
            .map_err(|e| ExecutorError::Injection(e.to_string()))
    }

    /// Write any queued injections, but only between complete writes -- the
    /// typing loop holds the `typing` flag across an entire prompt, so a
    /// command queued mid-typing drains on the first tick after the submit
    /// byte.
    fn flush_injections(&self) {
        if self.typing.load(Ordering::SeqCst) {
            return;
        }
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        while let Some(cmd) = pending.pop_front() {
            if let Err(e) = self.write_bytes(cmd.as_bytes()) {
                warn!(error = %e, "dropping queued injection, writer closed");
                return;
            }
        }
    }

    /// Write the keep-alive newline when `interval` has elapsed since the
    /// last one. Every polling loop calls this, so a slow startup or a long
    /// typed prompt is heartbeated just like the working phase.
    fn heartbeat_tick(&self, interval: Duration) -> Result<()> {
        {
            let mut last = self.last_heartbeat.lock().unwrap_or_else(|e| e.into_inner());
            if last.elapsed() < interval {
                return Ok(());
            }
            *last = Instant::now();
        }
        self.write_bytes(b"\n")
    }
}

// ---------------------------------------------------------------------------
// PtySupervisor
// ---------------------------------------------------------------------------

/// Executor for the `spawn` tool: one PTY-attached agent per running task.
pub struct PtySupervisor {
    profile: AgentProfile,
    config: ExecutionConfig,
    spawner: Arc<dyn PtySpawner>,
    sessions: DashMap<TaskId, Arc<Session>>,
}

impl PtySupervisor {
    pub fn new(
        profile: AgentProfile,
        config: ExecutionConfig,
        spawner: Arc<dyn PtySpawner>,
    ) -> Self {
        Self {
            profile,
            config,
            spawner,
            sessions: DashMap::new(),
        }
    }

    /// Snapshots of all live agent instances.
    pub fn instances(&self) -> Vec<AgentInstance> {
        self.sessions.iter().map(|s| s.snapshot()).collect()
    }

    fn spawn_session(&self, request: &ExecutionRequest) -> Result<Arc<Session>> {
        let mut spec = SpawnSpec::new(self.profile.resolve_binary());
        spec.args = self.profile.args.clone();
        spec.cols = self.config.pty_cols;
        spec.rows = self.config.pty_rows;
        spec.env = vec![
            ("TERM".into(), "xterm-color".into()),
            ("FORCE_COLOR".into(), "0".into()),
            ("PROMPT".into(), request.prompt.clone()),
            (
                "SYSTEM_PROMPT".into(),
                request.system_prompt.clone().unwrap_or_default(),
            ),
            ("TASK_ID".into(), request.task_id.to_string()),
        ];
        if let Some(workdir) = request.args.get("workdir").and_then(|v| v.as_str()) {
            spec.cwd = Some(workdir.into());
        }

        let process = self
            .spawner
            .spawn(&spec)
            .map_err(|e| ExecutorError::Spawn(e.to_string()))?;
        Ok(Arc::new(Session::new(
            process,
            self.config.output_cap_bytes,
        )))
    }

    /// Drain pending PTY output into the session buffer and the stream
    /// channel. Returns the number of bytes drained.
    fn pump_output(
        &self,
        task_id: TaskId,
        session: &Session,
        stream: &flume::Sender<StreamChunk>,
    ) -> usize {
        let raw = session.process.try_read_all();
        if raw.is_empty() {
            return 0;
        }
        let text = String::from_utf8_lossy(&raw).to_string();
        session.append_output(&text);
        {
            let mut info = session.info.lock().unwrap_or_else(|e| e.into_inner());
            info.last_activity = chrono::Utc::now();
        }
        let _ = stream.send(StreamChunk {
            task_id,
            data: text,
        });
        raw.len()
    }

    /// Scan recent output for interactive approval dialogs and answer them,
    /// at most once per debounce window.
    async fn auto_answer(&self, session: &Session) -> Result<()> {
        let tail = session.fresh_tail(APPROVAL_SCAN_BYTES);
        if tail.is_empty() {
            return Ok(());
        }

        // Trust dialog gets exactly one answer, ever.
        if !session.trust_answered.load(Ordering::SeqCst)
            && tail.contains(&self.profile.trust_prompt)
        {
            session.trust_answered.store(true, Ordering::SeqCst);
            session.mark_scanned();
            session.write_bytes(b"1\n")?;
            debug!("answered trust dialog");
            return Ok(());
        }

        let wants_approval = self
            .profile
            .approval_prompts
            .iter()
            .any(|(q, opt)| tail.contains(q.as_str()) && tail.contains(opt.as_str()));
        if !wants_approval {
            return Ok(());
        }

        {
            let mut last = session.last_approval.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(at) = *last {
                if at.elapsed() < APPROVAL_DEBOUNCE {
                    return Ok(());
                }
            }
            *last = Some(Instant::now());
        }
        session.mark_scanned();

        session.write_bytes(b"1")?;
        tokio::time::sleep(Duration::from_millis(100)).await;
        session.write_bytes(b"\n")?;
        debug!("auto-approved interactive prompt");
        Ok(())
    }

    /// Wait for the agent to show its prompt box (or sentinel).
    async fn await_readiness(
        &self,
        task_id: TaskId,
        session: &Session,
        stream: &flume::Sender<StreamChunk>,
    ) -> Result<()> {
        let budget = Duration::from_secs(self.config.startup_timeout_secs);
        let heartbeat = Duration::from_secs(self.config.heartbeat_secs);
        let start = Instant::now();

        loop {
            self.pump_output(task_id, session, stream);
            session.flush_injections();
            session.heartbeat_tick(heartbeat)?;
            self.auto_answer(session).await?;

            if self.profile.is_ready(&session.tail(4_096)) {
                session.set_state(AgentState::Ready);
                debug!(task_id, elapsed_ms = start.elapsed().as_millis() as u64, "agent ready");
                return Ok(());
            }
            if !session.process.is_alive() {
                return Err(ExecutorError::Spawn(
                    "agent exited before becoming ready".into(),
                ));
            }
            if start.elapsed() >= budget {
                session.process.kill();
                session.set_state(AgentState::Error);
                return Err(ExecutorError::StartupTimeout(
                    self.config.startup_timeout_secs,
                ));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Type the prompt character by character, then submit it.
    async fn submit_prompt(
        &self,
        task_id: TaskId,
        session: &Session,
        stream: &flume::Sender<StreamChunk>,
        prompt: &str,
    ) -> Result<()> {
        let (lo, hi) = self.profile.type_delay_ms;
        let heartbeat = Duration::from_secs(self.config.heartbeat_secs);

        session.typing.store(true, Ordering::SeqCst);
        let typed = async {
            let mut buf = [0u8; 4];
            for ch in prompt.chars() {
                session.write_bytes(ch.encode_utf8(&mut buf).as_bytes())?;
                self.pump_output(task_id, session, stream);
                // Queued injections stay parked while the typing flag is up;
                // the heartbeat keeps ticking so a long prompt cannot let
                // the PTY backend suspend the child.
                session.flush_injections();
                session.heartbeat_tick(heartbeat)?;
                if hi > 0 {
                    let delay = if hi > lo { fastrand::u64(lo..=hi) } else { lo };
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
            }
            if self.profile.pause_before_submit_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.profile.pause_before_submit_ms))
                    .await;
            }
            session.write_bytes(&[self.profile.submit_byte])
        }
        .await;
        session.typing.store(false, Ordering::SeqCst);
        typed?;

        // Anything injected while the prompt was being typed goes out now,
        // ahead of the fallback wait.
        session.flush_injections();

        // If the submit byte produced no visible progress, fall back to a
        // plain newline.
        if self.profile.submit_fallback_newline {
            let before = session.buffer_len();
            tokio::time::sleep(Duration::from_millis(self.profile.submit_fallback_after_ms))
                .await;
            self.pump_output(task_id, session, stream);
            session.heartbeat_tick(heartbeat)?;
            if session.buffer_len() == before {
                session.write_bytes(b"\n")?;
            }
        }

        session.set_state(AgentState::Working);
        Ok(())
    }

    /// Babysit the run until exit, kill, or idle timeout.
    async fn babysit(
        &self,
        task_id: TaskId,
        session: &Session,
        stream: &flume::Sender<StreamChunk>,
    ) -> Result<String> {
        let idle_budget = Duration::from_secs(self.config.idle_timeout_secs);
        let heartbeat = Duration::from_secs(self.config.heartbeat_secs);
        let mut last_output = Instant::now();

        loop {
            if session.killed.load(Ordering::SeqCst) {
                self.pump_output(task_id, session, stream);
                session.set_state(AgentState::Complete);
                return Ok(session.output());
            }

            if self.pump_output(task_id, session, stream) > 0 {
                last_output = Instant::now();
            }
            session.flush_injections();
            self.auto_answer(session).await?;

            if !session.process.is_alive() {
                self.pump_output(task_id, session, stream);
                let code = session.process.exit_code().unwrap_or(0);
                return if code == 0 {
                    session.set_state(AgentState::Complete);
                    info!(task_id, "agent exited cleanly");
                    Ok(session.output())
                } else {
                    session.set_state(AgentState::Error);
                    Err(ExecutorError::NonZeroExit(code))
                };
            }

            if last_output.elapsed() >= idle_budget {
                // One interrupt per idle window; if the agent wakes up the
                // window resets, otherwise the session dies here.
                warn!(task_id, idle_secs = self.config.idle_timeout_secs, "idle watchdog fired");
                session.write_bytes(&[0x03])?;
                tokio::time::sleep(IDLE_KILL_GRACE).await;
                if self.pump_output(task_id, session, stream) > 0 {
                    last_output = Instant::now();
                    continue;
                }
                session.process.kill();
                session.set_state(AgentState::Error);
                return Err(ExecutorError::IdleTimeout(self.config.idle_timeout_secs));
            }

            session.heartbeat_tick(heartbeat)?;

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl Executor for PtySupervisor {
    fn tool(&self) -> &str {
        "spawn"
    }

    async fn execute(
        &self,
        request: ExecutionRequest,
        stream: flume::Sender<StreamChunk>,
    ) -> Result<String> {
        let task_id = request.task_id;
        let session = self.spawn_session(&request)?;
        self.sessions.insert(task_id, Arc::clone(&session));
        info!(task_id, instance = %session.snapshot().id, "agent session started");

        let result = async {
            self.await_readiness(task_id, &session, &stream).await?;
            self.submit_prompt(task_id, &session, &stream, &request.prompt)
                .await?;
            self.babysit(task_id, &session, &stream).await
        }
        .await;

        if result.is_err() {
            session.process.kill();
        }
        self.sessions.remove(&task_id);
        result
    }

    fn inject(&self, task_id: TaskId, command: &str) -> Result<()> {
        let session = self
            .sessions
            .get(&task_id)
            .ok_or(ExecutorError::NoSession(task_id))?;
        if session.killed.load(Ordering::SeqCst) || !session.process.is_alive() {
            return Err(ExecutorError::Injection("session already closed".into()));
        }
        session
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(command.to_string());
        let mut info = session.info.lock().unwrap_or_else(|e| e.into_inner());
        info.intervention_count += 1;
        Ok(())
    }

    fn write(&self, task_id: TaskId, data: &str) -> Result<()> {
        let session = self
            .sessions
            .get(&task_id)
            .ok_or(ExecutorError::NoSession(task_id))?;
        session.write_bytes(&translate_escapes(data))
    }

    fn interrupt(&self, task_id: TaskId) -> Result<()> {
        let session = self
            .sessions
            .get(&task_id)
            .ok_or(ExecutorError::NoSession(task_id))?;
        session.write_bytes(&[0x03])
    }

    fn kill(&self, task_id: TaskId) {
        if let Some(session) = self.sessions.get(&task_id) {
            session.killed.store(true, Ordering::SeqCst);
            session.process.kill();
            session.set_state(AgentState::Complete);
        }
    }

    fn running(&self, task_id: TaskId) -> bool {
        self.sessions
            .get(&task_id)
            .map(|s| !s.killed.load(Ordering::SeqCst) && s.process.is_alive())
            .unwrap_or(false)
    }

    fn output(&self, task_id: TaskId) -> Option<String> {
        self.sessions.get(&task_id).map(|s| s.output())
    }
}

/// Translate backslash escape sequences in operator-supplied input into the
/// control bytes they name (`\r`, `\n`, `\t`, `\x1b`, `\x03`).
pub fn translate_escapes(input: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            let mut buf = [0u8; 4];
            out.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
            continue;
        }
        match chars.peek() {
            Some('r') => {
                chars.next();
                out.push(0x0d);
            }
            Some('n') => {
                chars.next();
                out.push(0x0a);
            }
            Some('t') => {
                chars.next();
                out.push(0x09);
            }
            Some('x') => {
                let mut lookahead = chars.clone();
                lookahead.next();
                let hex: String = lookahead.clone().take(2).collect();
                match u8::from_str_radix(&hex, 16) {
                    Ok(byte) if hex.len() == 2 => {
                        chars.next();
                        chars.next();
                        chars.next();
                        out.push(byte);
                    }
                    _ => out.push(b'\\'),
                }
            }
            _ => out.push(b'\\'),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
