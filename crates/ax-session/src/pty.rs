//! Raw PTY plumbing: spawn a child inside a pseudo-terminal and bridge its
//! I/O to async code through bounded channels.
//!
//! Each spawned process gets two background threads (reader, writer) that
//! run until the process exits or the channels close. The reader merges
//! stdout/stderr, as PTYs do. Spawning is behind [`PtySpawner`] so the
//! supervisor can be exercised with scripted processes in tests.

use std::io::{Read as IoRead, Write as IoWrite};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum PtyError {
    #[error("pty spawn failed: {0}")]
    SpawnFailed(String),
    #[error("pty I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("pty internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, PtyError>;

// ---------------------------------------------------------------------------
// SpawnSpec
// ---------------------------------------------------------------------------

/// Everything needed to start an agent process in a PTY.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub binary: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
    pub cols: u16,
    pub rows: u16,
}

impl SpawnSpec {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
            cols: 80,
            rows: 30,
        }
    }
}

// ---------------------------------------------------------------------------
// ProcessControl / PtyProcess
// ---------------------------------------------------------------------------

/// Lifecycle control over a spawned process, mockable for tests.
pub trait ProcessControl: Send + Sync {
    fn is_alive(&self) -> bool;
    /// Exit code once the process has exited; `None` while running or when
    /// the status could not be determined.
    fn exit_code(&self) -> Option<i32>;
    fn kill(&self);
}

/// A handle to one process inside a PTY.
///
/// - `reader` receives merged stdout/stderr chunks as they arrive.
/// - `writer` is the single serialised input path; everything typed into the
///   terminal goes through it in order, which is what keeps injected
///   commands from interleaving mid-write with simulated typing.
pub struct PtyProcess {
    pub id: Uuid,
    pub reader: flume::Receiver<Vec<u8>>,
    pub writer: flume::Sender<Vec<u8>>,
    control: Arc<dyn ProcessControl>,
}

impl PtyProcess {
    pub fn new(
        reader: flume::Receiver<Vec<u8>>,
        writer: flume::Sender<Vec<u8>>,
        control: Arc<dyn ProcessControl>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            reader,
            writer,
            control,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.control.is_alive()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.control.exit_code()
    }

    pub fn kill(&self) {
        self.control.kill();
    }

    /// Queue raw bytes for the writer thread.
    pub fn send(&self, data: &[u8]) -> Result<()> {
        self.writer
            .send(data.to_vec())
            .map_err(|e| PtyError::Internal(format!("writer channel closed: {e}")))
    }

    /// Drain all currently buffered output without blocking.
    pub fn try_read_all(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        while let Ok(chunk) = self.reader.try_recv() {
            buf.extend_from_slice(&chunk);
        }
        buf
    }
}

impl std::fmt::Debug for PtyProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyProcess")
            .field("id", &self.id)
            .field("alive", &self.is_alive())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// PtySpawner
// ---------------------------------------------------------------------------

/// Abstraction over PTY spawning so the supervisor can run against scripted
/// processes in tests.
pub trait PtySpawner: Send + Sync {
    fn spawn(&self, spec: &SpawnSpec) -> Result<PtyProcess>;
}

/// The production spawner backed by `portable-pty` (ConPTY on Windows).
pub struct PortablePtySpawner;

struct PortableControl {
    child: Mutex<Box<dyn portable_pty::Child + Send + Sync>>,
    exit_code: Mutex<Option<i32>>,
}

impl ProcessControl for PortableControl {
    fn is_alive(&self) -> bool {
        let mut child = self.child.lock().unwrap_or_else(|e| {
            warn!("child lock was poisoned, recovering");
            e.into_inner()
        });
        match child.try_wait() {
            Ok(Some(status)) => {
                let mut code = self.exit_code.lock().unwrap_or_else(|e| e.into_inner());
                code.get_or_insert(status.exit_code() as i32);
                false
            }
            Ok(None) => true,
            Err(_) => false,
        }
    }

    fn exit_code(&self) -> Option<i32> {
        // Refresh the cached status first.
        let _ = self.is_alive();
        *self.exit_code.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn kill(&self) {
        let mut child = self.child.lock().unwrap_or_else(|e| {
            warn!("child lock was poisoned, recovering");
            e.into_inner()
        });
        if let Err(e) = child.kill() {
            debug!(error = %e, "kill failed (process may have already exited)");
        }
    }
}

impl PtySpawner for PortablePtySpawner {
    fn spawn(&self, spec: &SpawnSpec) -> Result<PtyProcess> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: spec.rows,
                cols: spec.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;

        let mut command = CommandBuilder::new(&spec.binary);
        for arg in &spec.args {
            command.arg(arg);
        }
        for (k, v) in &spec.env {
            command.env(k, v);
        }
        if let Some(cwd) = &spec.cwd {
            command.cwd(cwd);
        }

        let child = pair
            .slave
            .spawn_command(command)
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;

        debug!(binary = %spec.binary, cols = spec.cols, rows = spec.rows, "spawned PTY process");

        // -- reader thread --
        let (read_tx, read_rx) = flume::bounded::<Vec<u8>>(256);
        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;
        std::thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if read_tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        // EIO is the normal EOF signal when the child exits.
                        if e.kind() != std::io::ErrorKind::Other {
                            debug!("pty reader error: {e}");
                        }
                        break;
                    }
                }
            }
        });

        // -- writer thread --
        let (write_tx, write_rx) = flume::bounded::<Vec<u8>>(256);
        let mut writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;
        std::thread::spawn(move || {
            while let Ok(data) = write_rx.recv() {
                if writer.write_all(&data).is_err() {
                    break;
                }
                let _ = writer.flush();
            }
        });

        let control = Arc::new(PortableControl {
            child: Mutex::new(child),
            exit_code: Mutex::new(None),
        });

        Ok(PtyProcess::new(read_rx, write_tx, control))
    }
}

// ---------------------------------------------------------------------------
// Scripted control (shared by tests across this workspace)
// ---------------------------------------------------------------------------

/// A process control whose liveness and exit code are set by the test.
pub struct ScriptedControl {
    alive: Mutex<bool>,
    exit_code: Mutex<Option<i32>>,
}

impl ScriptedControl {
    pub fn new(alive: bool) -> Arc<Self> {
        Arc::new(Self {
            alive: Mutex::new(alive),
            exit_code: Mutex::new(None),
        })
    }

    pub fn exit(&self, code: i32) {
        *self.alive.lock().unwrap_or_else(|e| e.into_inner()) = false;
        *self.exit_code.lock().unwrap_or_else(|e| e.into_inner()) = Some(code);
    }
}

impl ProcessControl for ScriptedControl {
    fn is_alive(&self) -> bool {
        *self.alive.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn exit_code(&self) -> Option<i32> {
        *self.exit_code.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn kill(&self) {
        *self.alive.lock().unwrap_or_else(|e| e.into_inner()) = false;
        let mut code = self.exit_code.lock().unwrap_or_else(|e| e.into_inner());
        code.get_or_insert(-9);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
