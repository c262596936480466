//! SSE frame parsing and stream assembly, kept free of I/O so both are
//! testable with canned frames.

use tokio::sync::mpsc;

use crate::error::AgentError;
use crate::events::{PromptOutcome, StreamEvent};

/// One parsed `event:`/`data:` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
}

/// Incremental SSE parser.  Feed it raw byte chunks as they arrive; it yields
/// complete frames and buffers partial ones across chunk boundaries.
#[derive(Debug, Default)]
pub struct SseParser {
    buf: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buf.push_str(&String::from_utf8_lossy(chunk).replace("\r\n", "\n"));

        let mut frames = Vec::new();
        while let Some(boundary) = self.buf.find("\n\n") {
            let raw = self.buf[..boundary].to_string();
            self.buf.drain(..boundary + 2);
            if let Some(frame) = parse_frame(&raw) {
                frames.push(frame);
            }
        }
        frames
    }
}

fn parse_frame(raw: &str) -> Option<SseFrame> {
    let mut event = String::new();
    let mut data_lines = Vec::new();

    for line in raw.lines() {
        if let Some(rest) = line.strip_prefix("event:") {
            event = rest.trim().to_string();
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
        // Comment lines (":") and unknown fields are ignored per the SSE spec.
    }

    if event.is_empty() && data_lines.is_empty() {
        return None;
    }
    Some(SseFrame {
        event,
        data: data_lines.join("\n"),
    })
}

/// Applies parsed frames to an in-progress turn: accumulates token content,
/// announces tool calls once per distinct name, captures usage, and records an
/// inline `error` event without aborting the read.
#[derive(Debug, Default)]
pub struct StreamAssembler {
    text: String,
    usage: Option<serde_json::Value>,
    stream_error: Option<String>,
    current_tool: Option<String>,
    announced: Vec<String>,
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, frame: &SseFrame, events: &mpsc::UnboundedSender<StreamEvent>) {
        let data: serde_json::Value =
            serde_json::from_str(&frame.data).unwrap_or(serde_json::Value::Null);

        match frame.event.as_str() {
            "agent_choice" => {
                if let Some(content) = data.get("content").and_then(|v| v.as_str()) {
                    if !content.is_empty() {
                        self.text.push_str(content);
                        let _ = events.send(StreamEvent::Token(content.to_string()));
                    }
                }
            }
            "partial_tool_call" => {
                if let Some(name) = tool_name(&data) {
                    self.announce(&name, events);
                    self.current_tool = Some(name);
                }
            }
            "tool_call" => {
                if let Some(name) = tool_name(&data) {
                    self.announce(&name, events);
                    self.current_tool = Some(name.clone());
                    let args = parse_tool_args(&data);
                    let _ = events.send(StreamEvent::ToolDetail { name, args });
                }
            }
            "tool_call_response" => {
                let name = tool_name(&data)
                    .or_else(|| self.current_tool.clone())
                    .unwrap_or_default();
                let is_error = data
                    .pointer("/result/isError")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                let _ = events.send(StreamEvent::ToolEnd {
                    name,
                    success: !is_error,
                });
                self.current_tool = None;
            }
            "token_usage" => {
                self.usage = Some(data);
            }
            "error" => {
                let message = data
                    .get("message")
                    .or_else(|| data.get("error"))
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| frame.data.clone());
                let _ = events.send(StreamEvent::StreamError(message.clone()));
                self.stream_error = Some(message);
            }
            // Session/turn lifecycle frames carry nothing we need.
            _ => {}
        }
    }

    fn announce(&mut self, name: &str, events: &mpsc::UnboundedSender<StreamEvent>) {
        if self.announced.iter().any(|n| n == name) {
            return;
        }
        self.announced.push(name.to_string());
        let _ = events.send(StreamEvent::ToolStart {
            name: name.to_string(),
        });
    }

    /// End-of-stream policy: an inline error with no accumulated content fails
    /// the turn; otherwise the (possibly partial) text wins.
    pub fn finish(self) -> Result<PromptOutcome, AgentError> {
        if self.text.is_empty() {
            if let Some(message) = self.stream_error {
                return Err(AgentError::Stream(message));
            }
        }
        Ok(PromptOutcome {
            text: self.text,
            usage: self.usage,
        })
    }
}

fn tool_name(data: &serde_json::Value) -> Option<String> {
    data.get("name")
        .or_else(|| data.get("tool_name"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

fn parse_tool_args(data: &serde_json::Value) -> serde_json::Value {
    match data.get("arguments") {
        // Arguments may arrive as a JSON string or an already-parsed object.
        Some(serde_json::Value::String(raw)) => {
            serde_json::from_str(raw).unwrap_or(serde_json::Value::String(raw.clone()))
        }
        Some(value) => value.clone(),
        None => serde_json::Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;

    fn frame(event: &str, data: &str) -> SseFrame {
        SseFrame {
            event: event.to_string(),
            data: data.to_string(),
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[test]
    fn parser_reassembles_split_frames() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"event: agent_choice\ndata: {\"con").is_empty());
        let frames = parser.push(b"tent\":\"hi\"}\n\nevent: token_usage\ndata: {}\n\n");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].event, "agent_choice");
        assert_eq!(frames[0].data, "{\"content\":\"hi\"}");
        assert_eq!(frames[1].event, "token_usage");
    }

    #[test]
    fn parser_handles_crlf_and_comments() {
        let mut parser = SseParser::new();
        let frames = parser.push(b": ping\r\n\r\nevent: error\r\ndata: {\"message\":\"boom\"}\r\n\r\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, "error");
    }

    #[test]
    fn tokens_accumulate_and_emit() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut asm = StreamAssembler::new();
        asm.apply(&frame("agent_choice", r#"{"content":"Hel"}"#), &tx);
        asm.apply(&frame("agent_choice", r#"{"content":"lo"}"#), &tx);

        let events = drain(&mut rx);
        assert!(matches!(&events[0], StreamEvent::Token(t) if t == "Hel"));
        assert!(matches!(&events[1], StreamEvent::Token(t) if t == "lo"));
        assert_eq!(asm.finish().unwrap().text, "Hello");
    }

    #[test]
    fn tool_start_fires_once_per_distinct_name() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut asm = StreamAssembler::new();
        asm.apply(&frame("partial_tool_call", r#"{"name":"web_fetch"}"#), &tx);
        asm.apply(&frame("partial_tool_call", r#"{"name":"web_fetch"}"#), &tx);
        asm.apply(
            &frame("tool_call", r#"{"name":"web_fetch","arguments":"{\"url\":\"http://x\"}"}"#),
            &tx,
        );
        asm.apply(
            &frame("tool_call_response", r#"{"name":"web_fetch","result":{"isError":false}}"#),
            &tx,
        );

        let events = drain(&mut rx);
        let starts = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::ToolStart { .. }))
            .count();
        assert_eq!(starts, 1);
        assert!(matches!(
            &events[1],
            StreamEvent::ToolDetail { name, args }
                if name == "web_fetch" && args["url"] == "http://x"
        ));
        assert!(matches!(
            events.last().unwrap(),
            StreamEvent::ToolEnd { success: true, .. }
        ));
    }

    #[test]
    fn tool_failure_flows_through() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut asm = StreamAssembler::new();
        asm.apply(&frame("partial_tool_call", r#"{"name":"run_shell"}"#), &tx);
        asm.apply(
            &frame("tool_call_response", r#"{"result":{"isError":true}}"#),
            &tx,
        );
        let events = drain(&mut rx);
        assert!(matches!(
            events.last().unwrap(),
            StreamEvent::ToolEnd { name, success: false } if name == "run_shell"
        ));
    }

    #[test]
    fn inline_error_without_content_fails_the_turn() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut asm = StreamAssembler::new();
        asm.apply(&frame("error", r#"{"message":"tool_use_id not found"}"#), &tx);
        let err = asm.finish().unwrap_err();
        assert!(err.to_string().contains("tool_use_id not found"));
    }

    #[test]
    fn inline_error_with_content_still_succeeds() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut asm = StreamAssembler::new();
        asm.apply(&frame("agent_choice", r#"{"content":"partial answer"}"#), &tx);
        asm.apply(&frame("error", r#"{"message":"late failure"}"#), &tx);
        assert_eq!(asm.finish().unwrap().text, "partial answer");
    }

    #[test]
    fn usage_is_captured() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut asm = StreamAssembler::new();
        asm.apply(&frame("token_usage", r#"{"input":10,"output":5}"#), &tx);
        let outcome = asm.finish().unwrap();
        assert_eq!(outcome.usage.unwrap()["output"], 5);
    }
}
