use std::time::Duration;

use thiserror::Error;

/// Failures surfaced by the upstream client.
///
/// The display strings matter: the orchestrator classifies session-death by
/// substring (see `mobyclaw-runtime`), so `SocketIdle` must mention the idle
/// socket and `Timeout` must say "timed out".
#[derive(Debug, Error)]
pub enum AgentError {
    /// The health endpoint never returned 200 within the boot timeout.
    #[error("agent runtime not ready: {0}")]
    Unready(String),

    /// Non-success HTTP status on a runtime endpoint.
    #[error("agent returned HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    /// In-band `error` event with no usable content.
    #[error("stream error: {0}")]
    Stream(String),

    /// No bytes arrived for the idle window — socket idle, connection likely dead.
    #[error("no bytes for {0:?} — socket idle, connection likely dead")]
    SocketIdle(Duration),

    /// The whole call timed out.
    #[error("agent call timed out")]
    Timeout,

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl AgentError {
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            Self::Http(err) => err.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}
