//! Streaming turn rendering: two continuously-edited message segments
//! (tool status and response text) with edit throttling, so a long turn stays
//! two messages instead of fifty.

use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, warn};

use mobyclaw_runtime::TurnError;
use mobyclaw_upstream::StreamEvent;

use crate::api::{TelegramApi, clamp_message};

#[derive(Debug, Clone)]
pub struct RenderConfig {
    /// Minimum spacing between edits of the same chat.
    pub min_edit_interval: Duration,
    /// Hold the first text-segment send back this long so a one-line answer
    /// is not posted and immediately replaced.
    pub text_first_send_delay: Duration,
    /// A token gap longer than this starts a fresh text segment.
    pub text_gap_new_msg: Duration,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            min_edit_interval: Duration::from_millis(1200),
            text_first_send_delay: Duration::from_millis(2500),
            text_gap_new_msg: Duration::from_millis(3000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ToolStatus {
    Running,
    Done,
    Failed,
}

#[derive(Debug, Clone)]
struct ToolLine {
    name: String,
    label: String,
    detail: Option<String>,
    status: ToolStatus,
}

#[derive(Debug, Default)]
struct RenderState {
    tools: Vec<ToolLine>,
    tool_msg_id: Option<i64>,
    tool_dirty: bool,
    text: String,
    text_msg_id: Option<i64>,
    text_dirty: bool,
    first_token_at: Option<Instant>,
    last_token_at: Option<Instant>,
    last_edit_at: Option<Instant>,
    edit_in_flight: bool,
    queued_msg_id: Option<i64>,
    any_sent: bool,
}

/// Drives the two segments for one streaming turn.
pub struct TurnRenderer {
    api: TelegramApi,
    chat_id: i64,
    config: RenderConfig,
    state: Mutex<RenderState>,
}

enum Flush {
    SendTool(String),
    EditTool(i64, String),
    SendText(String),
    EditText(i64, String),
}

impl TurnRenderer {
    pub fn new(api: TelegramApi, chat_id: i64, config: RenderConfig) -> Self {
        Self {
            api,
            chat_id,
            config,
            state: Mutex::new(RenderState::default()),
        }
    }

    pub async fn any_sent(&self) -> bool {
        self.state.lock().await.any_sent
    }

    pub async fn handle_event(&self, event: StreamEvent) {
        match event {
            StreamEvent::Token(token) => {
                let queued_id = {
                    let mut state = self.state.lock().await;
                    let now = Instant::now();

                    // A long silence means the previous text segment is done;
                    // the next token opens a new message.
                    if let Some(last) = state.last_token_at {
                        if last.elapsed() > self.config.text_gap_new_msg
                            && state.text_msg_id.is_some()
                        {
                            state.text.clear();
                            state.text_msg_id = None;
                            state.first_token_at = None;
                        }
                    }

                    if state.first_token_at.is_none() {
                        state.first_token_at = Some(now);
                    }
                    state.last_token_at = Some(now);
                    state.text.push_str(&token);
                    state.text_dirty = true;
                    state.queued_msg_id.take()
                };
                // The queued notice dies the moment streaming starts.
                if let Some(id) = queued_id {
                    let _ = self.api.delete_message(self.chat_id, id).await;
                }
            }
            StreamEvent::ToolStart { name } => {
                let mut state = self.state.lock().await;
                let label = tool_label(&name).to_string();
                state.tools.push(ToolLine {
                    name,
                    label,
                    detail: None,
                    status: ToolStatus::Running,
                });
                state.tool_dirty = true;
            }
            StreamEvent::ToolDetail { name, args } => {
                let mut state = self.state.lock().await;
                if let Some(line) = state
                    .tools
                    .iter_mut()
                    .rev()
                    .find(|l| l.name == name && l.status == ToolStatus::Running)
                {
                    line.detail = format_tool_detail(&name, &args);
                    state.tool_dirty = true;
                }
            }
            StreamEvent::ToolEnd { name, success } => {
                let mut state = self.state.lock().await;
                if let Some(line) = state
                    .tools
                    .iter_mut()
                    .rev()
                    .find(|l| l.name == name && l.status == ToolStatus::Running)
                {
                    line.status = if success {
                        ToolStatus::Done
                    } else {
                        ToolStatus::Failed
                    };
                    state.tool_dirty = true;
                }
            }
            StreamEvent::Queued { position } => {
                let already = self.state.lock().await.queued_msg_id.is_some();
                if !already {
                    match self
                        .api
                        .send_message(self.chat_id, &format!("Queued (position {position})"))
                        .await
                    {
                        Ok(id) => {
                            let mut state = self.state.lock().await;
                            state.queued_msg_id = Some(id);
                            state.any_sent = true;
                        }
                        Err(err) => warn!(?err, "failed to post queued notice"),
                    }
                }
            }
            StreamEvent::StreamError(message) => {
                debug!(message, "stream error event");
            }
        }
    }

    /// Flush pending segment updates, honouring the edit throttle.  Called on
    /// a short interval while the turn runs, and with `force` once it ends.
    pub async fn pump(&self, force: bool) {
        let Some(flush) = self.pick_flush(force).await else {
            return;
        };

        let result = match &flush {
            Flush::SendTool(text) | Flush::SendText(text) => {
                self.api.send_message(self.chat_id, text).await.map(Some)
            }
            Flush::EditTool(id, text) | Flush::EditText(id, text) => self
                .api
                .edit_message(self.chat_id, *id, text)
                .await
                .map(|()| None),
        };

        let mut state = self.state.lock().await;
        state.edit_in_flight = false;
        state.last_edit_at = Some(Instant::now());
        match (&flush, result) {
            (Flush::SendTool(_), Ok(Some(id))) => {
                state.tool_msg_id = Some(id);
                state.any_sent = true;
            }
            (Flush::SendText(_), Ok(Some(id))) => {
                state.text_msg_id = Some(id);
                state.any_sent = true;
            }
            (_, Ok(_)) => state.any_sent = true,
            (_, Err(err)) => {
                warn!(?err, "segment update failed");
                // Re-mark dirty so the next pump retries.
                match flush {
                    Flush::SendTool(_) | Flush::EditTool(..) => state.tool_dirty = true,
                    Flush::SendText(_) | Flush::EditText(..) => state.text_dirty = true,
                }
            }
        }
    }

    async fn pick_flush(&self, force: bool) -> Option<Flush> {
        let mut state = self.state.lock().await;
        if state.edit_in_flight {
            return None;
        }
        if !force {
            if let Some(last) = state.last_edit_at {
                if last.elapsed() < self.config.min_edit_interval {
                    return None;
                }
            }
        }

        if state.tool_dirty {
            state.tool_dirty = false;
            state.edit_in_flight = true;
            let rendered = render_tool_message(&state.tools);
            return Some(match state.tool_msg_id {
                Some(id) => Flush::EditTool(id, rendered),
                None => Flush::SendTool(rendered),
            });
        }

        if state.text_dirty && !state.text.trim().is_empty() {
            if state.text_msg_id.is_none() && !force {
                let held_back = state
                    .first_token_at
                    .is_some_and(|t| t.elapsed() < self.config.text_first_send_delay);
                if held_back {
                    return None;
                }
            }
            state.text_dirty = false;
            state.edit_in_flight = true;
            let rendered = clamp_message(&state.text);
            return Some(match state.text_msg_id {
                Some(id) => Flush::EditText(id, rendered),
                None => Flush::SendText(rendered),
            });
        }
        None
    }

    /// Final render once the turn resolves.  Aborts end silently; other
    /// failures flip running tools to ❌ and tell the user.
    pub async fn finish(&self, result: &Result<String, TurnError>) {
        let queued_id = {
            let mut state = self.state.lock().await;
            let queued_id = state.queued_msg_id.take();

            match result {
                Ok(_) => {}
                Err(TurnError::Aborted) | Err(TurnError::QueueCleared) => {}
                Err(_) => {
                    let mut flipped = false;
                    for line in state
                        .tools
                        .iter_mut()
                        .filter(|l| l.status == ToolStatus::Running)
                    {
                        line.status = ToolStatus::Failed;
                        flipped = true;
                    }
                    if flipped {
                        state.tool_dirty = true;
                    }
                    if state.text.trim().is_empty() && !state.any_sent {
                        state.text = "Something went wrong. Try again.".to_string();
                    } else {
                        state.text.push_str("\n\nSomething went wrong. Try again.");
                    }
                    state.text_dirty = true;
                }
            }
            queued_id
        };

        if let Some(id) = queued_id {
            let _ = self.api.delete_message(self.chat_id, id).await;
        }

        // Two forced pumps cover both segments being dirty.
        self.pump(true).await;
        self.pump(true).await;
    }
}

/// Render the tool segment, one line per call.
fn render_tool_message(tools: &[ToolLine]) -> String {
    tools
        .iter()
        .map(|line| {
            let marker = match line.status {
                ToolStatus::Running => "⏳",
                ToolStatus::Done => "✅",
                ToolStatus::Failed => "❌",
            };
            match &line.detail {
                Some(detail) => format!("{marker} {}: {detail}", line.label),
                None => format!("{marker} {}", line.label),
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Static label table; unknown tools show their raw name.
pub fn tool_label(name: &str) -> &str {
    match name {
        "web_fetch" | "fetch" | "http_get" => "fetching",
        "web_search" | "search" => "searching the web",
        "read_file" | "file_read" => "reading a file",
        "write_file" | "file_write" => "writing a file",
        "edit_file" => "editing a file",
        "run_shell" | "shell" | "bash" | "exec" => "running a command",
        "list_dir" | "ls" => "listing files",
        "memory" | "remember" => "updating memory",
        other => other,
    }
}

/// Per-tool detail rendering from parsed arguments: short paths, truncated
/// commands, de-schemed URLs.
pub fn format_tool_detail(name: &str, args: &serde_json::Value) -> Option<String> {
    let get = |keys: &[&str]| {
        keys.iter()
            .find_map(|k| args.get(*k).and_then(|v| v.as_str()))
            .map(str::to_string)
    };

    let detail = match name {
        "read_file" | "file_read" | "write_file" | "file_write" | "edit_file" | "list_dir"
        | "ls" => get(&["path", "file", "filename", "dir"]).map(|p| short_path(&p)),
        "run_shell" | "shell" | "bash" | "exec" => {
            get(&["command", "cmd"]).map(|c| truncate_detail(&c))
        }
        "web_fetch" | "fetch" | "http_get" => get(&["url"]).map(|u| short_url(&u)),
        "web_search" | "search" => get(&["query", "q"]).map(|q| format!("\"{}\"", truncate_detail(&q))),
        _ => args
            .as_object()
            .and_then(|map| map.values().find_map(|v| v.as_str()))
            .map(truncate_detail),
    };
    detail.filter(|d| !d.is_empty())
}

fn truncate_detail(text: &str) -> String {
    mobyclaw_config::truncate_chars(text.trim(), 60)
}

/// Keep the last two components of a path.
fn short_path(path: &str) -> String {
    let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
    if components.len() <= 2 {
        path.to_string()
    } else {
        format!("…/{}", components[components.len() - 2..].join("/"))
    }
}

/// Drop the scheme and truncate.
fn short_url(url: &str) -> String {
    let stripped = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);
    truncate_detail(stripped)
}
