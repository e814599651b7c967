//! Stdio JSON-lines transport: one request object per input line, one
//! response object per output line. The process stays alive until stdin
//! closes or a shutdown signal arrives.

use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info};

use crate::handler::ToolHandler;
use crate::protocol::{ToolRequest, ToolResponse};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub struct StdioTransport {
    handler: Arc<ToolHandler>,
}

impl StdioTransport {
    pub fn new(handler: Arc<ToolHandler>) -> Self {
        Self { handler }
    }

    /// Process a single input line into a response line. Blank lines are
    /// ignored; undecodable lines produce an error response rather than
    /// killing the transport.
    pub async fn handle_line(&self, line: &str) -> Option<String> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let response = match serde_json::from_str::<ToolRequest>(line) {
            Ok(request) => self.handler.handle(request).await,
            Err(e) => ToolResponse::err(None, format!("malformed request: {e}")),
        };
        Some(serde_json::to_string(&response).unwrap_or_else(|e| {
            format!(r#"{{"error":{{"message":"response serialisation failed: {e}"}}}}"#)
        }))
    }

    /// Serve stdin/stdout until EOF.
    pub async fn serve(&self) -> Result<(), TransportError> {
        let stdin = BufReader::new(tokio::io::stdin());
        let mut stdout = tokio::io::stdout();
        let mut lines = stdin.lines();

        info!("stdio transport ready");
        while let Some(line) = lines.next_line().await? {
            if let Some(response) = self.handle_line(&line).await {
                stdout.write_all(response.as_bytes()).await?;
                stdout.write_all(b"\n").await?;
                stdout.flush().await?;
            }
        }
        debug!("stdin closed, transport shutting down");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use ax_core::registry::TaskRegistry;
    use ax_hooks::orchestrator::HookOrchestrator;

    fn transport() -> StdioTransport {
        let orchestrator = HookOrchestrator::new(Arc::new(TaskRegistry::new()));
        StdioTransport::new(Arc::new(ToolHandler::new(orchestrator)))
    }

    #[tokio::test]
    async fn blank_lines_are_skipped() {
        let transport = transport();
        assert!(transport.handle_line("").await.is_none());
        assert!(transport.handle_line("   ").await.is_none());
    }

    #[tokio::test]
    async fn malformed_json_yields_error_response() {
        let transport = transport();
        let response = transport.handle_line("{not json").await.unwrap();
        assert!(response.contains("malformed request"));
    }

    #[tokio::test]
    async fn resource_request_roundtrips() {
        let transport = transport();
        let response = transport
            .handle_line(r#"{"id":9,"resource":"help"}"#)
            .await
            .unwrap();
        let parsed: ToolResponse = serde_json::from_str(&response).unwrap();
        assert_eq!(parsed.id, Some(serde_json::json!(9)));
        assert!(parsed.result.is_some());
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error_line() {
        let transport = transport();
        let response = transport
            .handle_line(r#"{"tool":"spawn","args":{"prompt":"x"}}"#)
            .await
            .unwrap();
        // No executor registered in this minimal transport.
        assert!(response.contains("no executor"));
    }
}
