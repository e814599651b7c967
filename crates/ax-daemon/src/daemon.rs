use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use ax_bridge::handler::ToolHandler;
use ax_bridge::transport::StdioTransport;
use ax_core::config::Settings;
use ax_core::registry::TaskRegistry;
use ax_hooks::builtin::{ParallelDetectionHook, SecurityHook, ValidationHook};
use ax_hooks::orchestrator::HookOrchestrator;
use ax_scanner::controller::InterventionController;
use ax_session::profile::AgentProfile;
use ax_session::pty::PortablePtySpawner;
use ax_session::supervisor::PtySupervisor;
use ax_swarm::cleanup::CleanupRegistry;
use ax_swarm::engine::{SwarmConfig, SwarmExecutor};
use ax_telemetry::event_log::EventLog;

/// Everything a running daemon owns.
pub struct Daemon {
    pub orchestrator: Arc<HookOrchestrator>,
    pub cleanup: Arc<CleanupRegistry>,
    transport: StdioTransport,
}

impl Daemon {
    /// Wire the full stack from settings: registry, event log, hooks,
    /// executors, transport.
    pub fn build(settings: Settings) -> Self {
        let registry = Arc::new(TaskRegistry::with_output_cap(
            settings.execution.output_cap_bytes,
        ));
        let event_log = Arc::new(EventLog::new(&settings.logging.dir));
        let orchestrator = HookOrchestrator::new(Arc::clone(&registry));
        orchestrator.set_event_log(event_log);

        // Admission hooks.
        orchestrator.register_hook(Arc::new(SecurityHook::new()));
        orchestrator.register_hook(Arc::new(ValidationHook));
        orchestrator.register_hook(Arc::new(ParallelDetectionHook::new()));

        // Stream hook: the intervention controller.
        orchestrator.register_hook(Arc::new(InterventionController::new(
            settings.intervention.clone(),
        )));

        // Executors.
        let mut profile = AgentProfile::claude();
        profile.binary = settings.execution.agent_binary.clone();
        let supervisor = Arc::new(PtySupervisor::new(
            profile,
            settings.execution.clone(),
            Arc::new(PortablePtySpawner),
        ));
        orchestrator.register_executor(supervisor.clone());

        let cleanup = Arc::new(CleanupRegistry::new());
        let swarm_config = SwarmConfig {
            max_parallel: settings.execution.max_parallel,
            task_timeout_secs: settings.execution.task_timeout_secs,
            max_retries: settings.execution.max_retries,
            ..SwarmConfig::default()
        };
        let repo_root = std::env::current_dir().unwrap_or_else(|_| ".".into());
        orchestrator.register_executor(Arc::new(SwarmExecutor::new(
            supervisor,
            swarm_config,
            Arc::clone(&cleanup),
            repo_root,
        )));

        let handler = Arc::new(ToolHandler::new(Arc::clone(&orchestrator)));
        let transport = StdioTransport::new(handler);

        Self {
            orchestrator,
            cleanup,
            transport,
        }
    }

    /// Serve the stdio transport until stdin closes or a signal arrives,
    /// then drain the cleanup registry.
    pub async fn run(self) -> Result<()> {
        let cleanup = Arc::clone(&self.cleanup);

        let serve = self.transport.serve();
        tokio::pin!(serve);

        tokio::select! {
            result = &mut serve => {
                if let Err(e) = result {
                    warn!(error = %e, "transport ended with error");
                }
                info!("transport closed");
            }
            _ = shutdown_signal() => {
                info!("shutdown signal received");
            }
        }

        cleanup.cleanup_all();
        info!("daemon stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use ax_hooks::hook::HookEvent;

    #[test]
    fn build_registers_hooks_and_executors() {
        let daemon = Daemon::build(Settings::default());

        assert_eq!(
            daemon.orchestrator.hook_count(HookEvent::RequestReceived),
            3,
            "security + validation + parallel-detection"
        );
        assert_eq!(
            daemon.orchestrator.hook_count(HookEvent::ExecutionStream),
            1,
            "intervention controller"
        );
        assert!(daemon.orchestrator.executor("spawn").is_some());
        assert!(daemon.orchestrator.executor("orchestrate").is_some());
        assert!(daemon.orchestrator.executor("bogus").is_none());
    }
}
