//! Scripted fake upstream used by the orchestrator and heartbeat tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc, watch};

use mobyclaw_config::{SessionConfig, StmConfig};
use mobyclaw_memory::ShortTermMemory;
use mobyclaw_upstream::{AgentError, PromptOutcome, StreamEvent, UpstreamAgent};

use crate::orchestrator::Orchestrator;
use crate::session::SessionStore;

/// One scripted prompt outcome.
pub enum Script {
    /// Emit the text as a single token and succeed.
    Text(&'static str),
    /// Fail with the given error.
    Fail(AgentError),
    /// Block until the notify fires (or the turn is aborted), then succeed.
    Gated(&'static str, Arc<Notify>),
}

#[derive(Default)]
pub struct FakeAgent {
    script: Mutex<VecDeque<Script>>,
    calls: Mutex<Vec<(String, String)>>,
    sessions: AtomicU32,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    /// Notified every time a prompt begins.
    pub started: Notify,
}

impl FakeAgent {
    pub fn with_script(steps: impl IntoIterator<Item = Script>) -> Arc<Self> {
        let agent = Self::default();
        agent.script.lock().unwrap().extend(steps);
        Arc::new(agent)
    }

    /// `(session_id, message)` per prompt, in call order.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UpstreamAgent for FakeAgent {
    async fn wait_for_ready(&self, _timeout: Duration) -> Result<(), AgentError> {
        Ok(())
    }

    async fn create_session(&self) -> Result<String, AgentError> {
        let n = self.sessions.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("sess-{n}"))
    }

    async fn validate_session(&self, _session_id: &str) -> Result<bool, AgentError> {
        Ok(true)
    }

    async fn prompt_stream(
        &self,
        message: &str,
        session_id: &str,
        events: &mpsc::UnboundedSender<StreamEvent>,
        abort: &mut watch::Receiver<bool>,
    ) -> Result<PromptOutcome, AgentError> {
        self.calls
            .lock()
            .unwrap()
            .push((session_id.to_string(), message.to_string()));
        let n = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(n, Ordering::SeqCst);
        self.started.notify_one();

        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Script::Text("ok"));

        let result = match step {
            Script::Text(text) => {
                let _ = events.send(StreamEvent::Token(text.to_string()));
                Ok(PromptOutcome {
                    text: text.to_string(),
                    usage: None,
                })
            }
            Script::Fail(err) => Err(err),
            Script::Gated(text, gate) => {
                tokio::select! {
                    _ = gate.notified() => Ok(PromptOutcome {
                        text: text.to_string(),
                        usage: None,
                    }),
                    _ = abort.changed() => {
                        Err(AgentError::Stream("stream aborted".into()))
                    }
                }
            }
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Orchestrator wired to the fake agent with stores in a tempdir.
pub fn harness(
    agent: Arc<FakeAgent>,
    config: SessionConfig,
    dir: &tempfile::TempDir,
) -> (Orchestrator, Arc<SessionStore>, Arc<ShortTermMemory>) {
    let session = Arc::new(
        SessionStore::new(dir.path().join("session.json"), config.clone(), chrono_tz::UTC)
            .unwrap(),
    );
    let stm = Arc::new(
        ShortTermMemory::new(dir.path().join("stm.json"), &StmConfig::default()).unwrap(),
    );
    let orchestrator = Orchestrator::new(
        agent,
        session.clone(),
        stm.clone(),
        None,
        None,
        config,
    );
    (orchestrator, session, stm)
}

/// Poll until the queue reaches `len` (or panic after ~2s).
pub async fn wait_queue_len(session: &SessionStore, len: usize) {
    for _ in 0..1000 {
        if session.queue_len() == len {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("queue never reached length {len}");
}
