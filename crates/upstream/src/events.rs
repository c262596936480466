use serde::{Deserialize, Serialize};

/// One event of a streaming turn, published on an unbounded channel.
///
/// `Token` through `StreamError` originate from the upstream SSE stream;
/// `Queued` is emitted by the gateway itself when a turn is parked behind a
/// busy session.  Consumers (the Telegram renderer, the SSE fan-out) see one
/// uniform stream either way.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StreamEvent {
    Token(String),
    ToolStart { name: String },
    ToolDetail { name: String, args: serde_json::Value },
    ToolEnd { name: String, success: bool },
    Queued { position: usize },
    StreamError(String),
}

/// Final result of one streamed prompt.
#[derive(Debug, Clone, Default)]
pub struct PromptOutcome {
    pub text: String,
    /// Raw `token_usage` payload, when the stream reported one.
    pub usage: Option<serde_json::Value>,
}
