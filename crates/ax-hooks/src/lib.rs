//! Hook-dispatched execution core.
//!
//! Every request, every chunk of terminal output, and every lifecycle
//! transition is routed through an ordered chain of pluggable hooks that may
//! continue, block, modify, or redirect the flow. The orchestrator owns the
//! hook registry, the executor registry, the active-task table, and the
//! monitor side-channel.

pub mod builtin;
pub mod executor;
pub mod hook;
pub mod monitor;
pub mod orchestrator;

pub use executor::{ExecutionRequest, Executor, ExecutorError, StreamChunk};
pub use hook::{Execution, Hook, HookContext, HookError, HookEvent, HookResult, Request, Stream};
pub use monitor::{MonitorBus, MonitorEvent};
pub use orchestrator::{HookOrchestrator, OrchestratorError, RequestOutcome};
