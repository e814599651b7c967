//! PTY supervision for axiom.
//!
//! Owns one child process per task, attached to a pseudo-terminal, and
//! drives it as if a human were typing: readiness detection, simulated
//! keystrokes, approval auto-answers, heartbeat, idle watchdog, and
//! corrective injection.

pub mod profile;
pub mod pty;
pub mod supervisor;

pub use profile::AgentProfile;
pub use pty::{PortablePtySpawner, PtyError, PtyProcess, PtySpawner, SpawnSpec};
pub use supervisor::PtySupervisor;
