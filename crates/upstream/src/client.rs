use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use mobyclaw_config::UpstreamConfig;

use crate::error::AgentError;
use crate::events::{PromptOutcome, StreamEvent};
use crate::sse::{SseParser, StreamAssembler};
use crate::UpstreamAgent;

const READY_POLL_INTERVAL: Duration = Duration::from_secs(2);
const TCP_KEEPALIVE: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP + SSE client for the upstream agent runtime.
///
/// The reqwest client carries no overall timeout: a streaming turn may
/// legitimately run for minutes while a tool executes.  Silent peers are
/// caught by the per-chunk idle watchdog instead.
#[derive(Debug, Clone)]
pub struct AgentClient {
    http: reqwest::Client,
    base_url: String,
    agent_name: String,
    socket_idle_timeout: Duration,
}

impl AgentClient {
    pub fn new(config: &UpstreamConfig) -> Result<Self, AgentError> {
        let http = reqwest::Client::builder()
            .tcp_keepalive(TCP_KEEPALIVE)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            agent_name: config.agent_name.clone(),
            socket_idle_timeout: config.socket_idle_timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

#[async_trait]
impl UpstreamAgent for AgentClient {
    async fn wait_for_ready(&self, timeout: Duration) -> Result<(), AgentError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let url = self.url("/api/ping");
        loop {
            match self.http.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    info!("agent runtime ready");
                    return Ok(());
                }
                Ok(resp) => debug!(status = %resp.status(), "agent not ready yet"),
                Err(err) => debug!(%err, "agent ping failed"),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(AgentError::Unready(format!(
                    "no healthy ping from {url} within {timeout:?}"
                )));
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    async fn create_session(&self) -> Result<String, AgentError> {
        // tools_approved pre-approves tool calls; without it the stream stalls
        // on confirmation events nobody will ever answer.
        let resp = self
            .http
            .post(self.url("/api/sessions"))
            .json(&json!({ "tools_approved": true }))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AgentError::HttpStatus {
                status: status.as_u16(),
                body: mobyclaw_config::truncate_chars(&body, 500),
            });
        }

        let payload: serde_json::Value = resp.json().await?;
        let id = payload
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AgentError::Stream("session create response missing id".into()))?;
        info!(session_id = %id, "created upstream session");
        Ok(id.to_string())
    }

    async fn validate_session(&self, session_id: &str) -> Result<bool, AgentError> {
        let resp = self
            .http
            .get(self.url(&format!("/api/sessions/{session_id}")))
            .send()
            .await?;
        Ok(resp.status().is_success())
    }

    async fn prompt_stream(
        &self,
        message: &str,
        session_id: &str,
        events: &mpsc::UnboundedSender<StreamEvent>,
        abort: &mut watch::Receiver<bool>,
    ) -> Result<PromptOutcome, AgentError> {
        let url = self.url(&format!("/api/sessions/{session_id}/agent/{}", self.agent_name));
        let resp = self
            .http
            .post(&url)
            .json(&json!([{ "role": "user", "content": message }]))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AgentError::HttpStatus {
                status: status.as_u16(),
                body: mobyclaw_config::truncate_chars(&body, 500),
            });
        }

        let mut stream = resp.bytes_stream();
        let mut parser = SseParser::new();
        let mut assembler = StreamAssembler::new();
        let mut abort_open = true;

        loop {
            tokio::select! {
                changed = abort.changed(), if abort_open => {
                    match changed {
                        Ok(()) if *abort.borrow() => {
                            debug!("prompt stream aborted");
                            return Err(AgentError::Stream("stream aborted".into()));
                        }
                        Ok(()) => {}
                        // Abort handle dropped — nobody can cancel us anymore.
                        Err(_) => abort_open = false,
                    }
                }
                chunk = tokio::time::timeout(self.socket_idle_timeout, stream.next()) => {
                    match chunk {
                        Err(_) => {
                            warn!(idle = ?self.socket_idle_timeout, "destroying silent stream");
                            return Err(AgentError::SocketIdle(self.socket_idle_timeout));
                        }
                        Ok(None) => break,
                        Ok(Some(Err(err))) => return Err(AgentError::Http(err)),
                        Ok(Some(Ok(bytes))) => {
                            for frame in parser.push(&bytes) {
                                assembler.apply(&frame, events);
                            }
                        }
                    }
                }
            }
        }

        assembler.finish()
    }
}
