//! Turn-event → SSE mapping for the streaming prompt endpoint.

use axum::response::sse::Event;
use serde_json::json;

use mobyclaw_upstream::StreamEvent;

/// Serialize one turn event as `event: <name>` + JSON data.
pub fn stream_event_to_sse(event: StreamEvent) -> Event {
    match event {
        StreamEvent::Token(text) => Event::default()
            .event("token")
            .data(json!({ "text": text }).to_string()),
        StreamEvent::ToolStart { name } => Event::default()
            .event("tool")
            .data(json!({ "name": name, "status": "start" }).to_string()),
        StreamEvent::ToolDetail { name, args } => Event::default()
            .event("tool")
            .data(json!({ "name": name, "status": "detail", "detail": args }).to_string()),
        StreamEvent::ToolEnd { name, success } => Event::default()
            .event("tool")
            .data(json!({ "name": name, "status": "done", "success": success }).to_string()),
        StreamEvent::Queued { position } => Event::default()
            .event("queued")
            .data(json!({ "position": position }).to_string()),
        StreamEvent::StreamError(message) => Event::default()
            .event("error")
            .data(json!({ "message": message }).to_string()),
    }
}
