//! Agent-specific terminal conventions.
//!
//! The prompt-box pattern, the approval dialogs, and the submit byte are all
//! properties of the agent binary being driven, not of the supervisor. They
//! live here so that targeting a different agent is a profile, not a fork.

use std::path::PathBuf;

/// Terminal conventions for one interactive coding agent.
#[derive(Debug, Clone)]
pub struct AgentProfile {
    /// Binary to launch when no env override is present.
    pub binary: String,
    /// Env var that overrides `binary` at spawn time.
    pub binary_env_var: String,
    pub args: Vec<String>,
    /// Substrings that must all be present in recent output for the agent
    /// to count as ready (the prompt box).
    pub ready_markers: Vec<String>,
    /// Optional filesystem sentinel that also signals readiness.
    pub ready_sentinel: Option<PathBuf>,
    /// Trust dialog text answered once with "1\n" during startup.
    pub trust_prompt: String,
    /// (question fragment, option fragment) pairs auto-answered with "1".
    pub approval_prompts: Vec<(String, String)>,
    /// Byte written to submit the typed prompt.
    pub submit_byte: u8,
    /// Write a plain newline when no progress follows the submit byte.
    pub submit_fallback_newline: bool,
    /// Uniform range for the simulated inter-keystroke delay.
    pub type_delay_ms: (u64, u64),
    /// Pause between the last keystroke and the submit byte.
    pub pause_before_submit_ms: u64,
    /// How long to wait for progress before the fallback newline.
    pub submit_fallback_after_ms: u64,
}

impl AgentProfile {
    /// Profile for the Claude Code CLI, the default agent.
    pub fn claude() -> Self {
        Self {
            binary: "claude".into(),
            binary_env_var: "CLAUDE_CODE_PATH".into(),
            args: Vec::new(),
            ready_markers: vec!["│ >".into(), "╭".into(), "╮".into()],
            ready_sentinel: None,
            trust_prompt: "Do you trust the files in this folder?".into(),
            approval_prompts: vec![
                ("Do you want to create".into(), "1. Yes".into()),
                ("Do you trust the files".into(), "1. Yes".into()),
            ],
            submit_byte: 0x0d,
            submit_fallback_newline: true,
            type_delay_ms: (50, 150),
            pause_before_submit_ms: 300,
            submit_fallback_after_ms: 1_000,
        }
    }

    /// Resolve the binary path, honouring the env override.
    pub fn resolve_binary(&self) -> String {
        std::env::var(&self.binary_env_var).unwrap_or_else(|_| self.binary.clone())
    }

    /// True when `output` shows the agent's input prompt box.
    pub fn is_ready(&self, output: &str) -> bool {
        if self.ready_markers.iter().all(|m| output.contains(m)) {
            return true;
        }
        self.ready_sentinel
            .as_ref()
            .map(|p| p.exists())
            .unwrap_or(false)
    }

    /// Profile variant with instant typing, for tests and batch agents.
    pub fn without_typing_delays(mut self) -> Self {
        self.type_delay_ms = (0, 0);
        self.pause_before_submit_ms = 0;
        self.submit_fallback_after_ms = 50;
        self
    }
}

impl Default for AgentProfile {
    fn default() -> Self {
        Self::claude()
    }
}
