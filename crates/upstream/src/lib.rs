//! HTTP + SSE client for the upstream agent runtime.
//!
//! One streaming call at a time flows through here; the orchestrator owns the
//! serialization.  The client's only jobs are the wire protocol (session
//! create/validate, prompt streaming) and telling a silently-dead socket apart
//! from a long-running tool call.

mod client;
mod error;
mod events;
mod sse;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

pub use client::AgentClient;
pub use error::AgentError;
pub use events::{PromptOutcome, StreamEvent};
pub use sse::{SseFrame, SseParser, StreamAssembler};

/// The upstream-runtime seam.  `AgentClient` is the production implementation;
/// tests drive the orchestrator with scripted fakes.
#[async_trait]
pub trait UpstreamAgent: Send + Sync {
    /// Poll the health endpoint until it answers or `timeout` elapses.
    async fn wait_for_ready(&self, timeout: Duration) -> Result<(), AgentError>;

    /// Create an upstream session with tools pre-approved; returns its id.
    async fn create_session(&self) -> Result<String, AgentError>;

    /// Whether the upstream still holds the given session.
    async fn validate_session(&self, session_id: &str) -> Result<bool, AgentError>;

    /// Stream one prompt through an existing session, publishing events as
    /// they arrive.  `abort` flipping to `true` cancels the read.
    async fn prompt_stream(
        &self,
        message: &str,
        session_id: &str,
        events: &mpsc::UnboundedSender<StreamEvent>,
        abort: &mut watch::Receiver<bool>,
    ) -> Result<PromptOutcome, AgentError>;
}
