use thiserror::Error;

use mobyclaw_upstream::AgentError;

/// Failures surfaced to callers of the orchestrator.
#[derive(Debug, Error)]
pub enum TurnError {
    /// The user stopped the in-flight turn.  Never retried.
    #[error("turn aborted")]
    Aborted,

    /// The entry was waiting in the queue when `stop()` cleared it.
    #[error("queue cleared")]
    QueueCleared,

    /// The entry was the oldest in a full queue and was dropped.
    #[error("queue overflow")]
    Overflow,

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error("{0}")]
    Internal(String),
}

/// Substrings that mark an upstream failure as "this session is no longer
/// usable" — clear it, create a fresh one, retry the turn once.
const SESSION_ERROR_MARKERS: &[&str] = &[
    "session",
    "sequencing",
    "tool_use_id",
    "invalid_request_error",
    "all models failed",
    "context canceled",
    "aborted",
    "timed out",
    "econnreset",
    "socket idle",
    "connection likely dead",
];

impl TurnError {
    pub fn is_session_class(&self) -> bool {
        match self {
            Self::Aborted | Self::QueueCleared | Self::Overflow => false,
            Self::Agent(err) => {
                if err.http_status() == Some(404) {
                    return true;
                }
                matches_session_marker(&err.to_string())
            }
            Self::Internal(message) => matches_session_marker(message),
        }
    }

    /// A clone-safe rendition for fanning one failure out to several waiting
    /// resolvers.  Signal variants survive; everything else flattens to its
    /// message (which keeps the classification substrings intact).
    pub fn to_shared(&self) -> Self {
        match self {
            Self::Aborted => Self::Aborted,
            Self::QueueCleared => Self::QueueCleared,
            Self::Overflow => Self::Overflow,
            other => Self::Internal(other.to_string()),
        }
    }
}

fn matches_session_marker(message: &str) -> bool {
    let message = message.to_lowercase();
    SESSION_ERROR_MARKERS
        .iter()
        .any(|marker| message.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_marker_classifies_as_session_class() {
        for marker in SESSION_ERROR_MARKERS {
            let err = TurnError::Agent(AgentError::Stream(format!("upstream said: {marker}")));
            assert!(err.is_session_class(), "marker {marker:?} not classified");
        }
    }

    #[test]
    fn http_404_is_session_class() {
        let err = TurnError::Agent(AgentError::HttpStatus {
            status: 404,
            body: "not found".into(),
        });
        assert!(err.is_session_class());
    }

    #[test]
    fn signal_variants_and_plain_failures_are_not() {
        assert!(!TurnError::Aborted.is_session_class());
        assert!(!TurnError::QueueCleared.is_session_class());
        assert!(!TurnError::Overflow.is_session_class());
        let err = TurnError::Agent(AgentError::Stream("model produced garbage".into()));
        assert!(!err.is_session_class());
    }

    #[test]
    fn shared_rendition_keeps_classification() {
        let err = TurnError::Agent(AgentError::Stream("tool_use_id not found".into()));
        assert!(err.to_shared().is_session_class());
        assert!(matches!(TurnError::Aborted.to_shared(), TurnError::Aborted));
    }
}
