use std::time::Duration;

use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Deserialize;
use tracing::debug;

use mobyclaw_config::DashboardConfig;

/// Read-only context fetches plus fire-and-forget logging against the
/// external dashboard.  The dashboard is a soft dependency: every call here
/// degrades to "no context" or "no log" without surfacing an error.
#[derive(Debug, Clone)]
pub struct DashboardClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct ContextResponse {
    #[serde(default)]
    context: String,
    #[serde(default)]
    sections_included: u32,
    #[serde(default)]
    sections_total: u32,
    #[serde(default)]
    total_tokens: u32,
    #[serde(default)]
    sections_pruned: u32,
}

impl DashboardClient {
    pub fn new(config: &DashboardConfig) -> Option<Self> {
        if config.base_url.trim().is_empty() {
            return None;
        }
        let http = reqwest::Client::builder()
            .timeout(config.context_timeout.max(Duration::from_secs(1)))
            .build()
            .ok()?;
        Some(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Fetch relevance-scored memory sections for a user message.  The query
    /// is capped at 300 characters before encoding.  Any failure returns `None`.
    pub async fn fetch_context(&self, query: &str, budget_tokens: u32) -> Option<String> {
        let query: String = query.chars().take(300).collect();
        let encoded = utf8_percent_encode(&query, NON_ALPHANUMERIC).to_string();
        let url = format!(
            "{}/api/context?query={encoded}&budget={budget_tokens}",
            self.base_url
        );

        let resp = self.http.get(&url).send().await.ok()?;
        if !resp.status().is_success() {
            debug!(status = %resp.status(), "context fetch failed");
            return None;
        }
        let payload: ContextResponse = resp.json().await.ok()?;
        debug!(
            included = payload.sections_included,
            total = payload.sections_total,
            pruned = payload.sections_pruned,
            tokens = payload.total_tokens,
            "context fetched"
        );
        if payload.context.trim().is_empty() {
            None
        } else {
            Some(payload.context)
        }
    }

    /// Fire-and-forget conversation log.
    pub fn log_conversation(&self, payload: serde_json::Value) {
        self.post_and_forget("/api/conversations", payload);
    }

    /// Fire-and-forget usage log.
    pub fn log_usage(&self, payload: serde_json::Value) {
        self.post_and_forget("/api/usage", payload);
    }

    fn post_and_forget(&self, path: &str, payload: serde_json::Value) {
        let http = self.http.clone();
        let url = format!("{}{path}", self.base_url);
        tokio::spawn(async move {
            if let Err(err) = http.post(&url).json(&payload).send().await {
                debug!(%err, url, "dashboard log dropped");
            }
        });
    }
}
