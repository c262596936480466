//! Thin typed wrapper over the Telegram Bot API — long polling, sends, and
//! the message edits the streaming renderer lives on.

use std::time::Duration;

use anyhow::{Result, bail};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Telegram's hard cap on message text length.
pub const TELEGRAM_MAX_LEN: usize = 4096;

#[derive(Debug, Clone)]
pub struct TelegramApi {
    http: reqwest::Client,
    base_url: String,
}

impl TelegramApi {
    pub fn new(token: &str) -> Result<Self> {
        if token.trim().is_empty() {
            bail!("telegram bot token is empty");
        }
        // Long polls run 25s; leave headroom before the client cuts them off.
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(35))
            .build()?;
        Ok(Self {
            http,
            base_url: format!("https://api.telegram.org/bot{}", token.trim()),
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, body: &impl Serialize) -> Result<T> {
        let response = self
            .http
            .post(format!("{}/{method}", self.base_url))
            .json(body)
            .send()
            .await?
            .error_for_status()?;

        let payload: TelegramResponse<T> = response.json().await?;
        if !payload.ok {
            bail!(
                payload
                    .description
                    .unwrap_or_else(|| format!("telegram {method} failed"))
            );
        }
        payload
            .result
            .ok_or_else(|| anyhow::anyhow!("telegram {method} returned no result"))
    }

    pub async fn get_updates(&self, offset: i64, timeout_s: u32) -> Result<Vec<Update>> {
        self.call(
            "getUpdates",
            &json!({ "offset": offset, "timeout": timeout_s }),
        )
        .await
    }

    /// Send a message; returns its id so it can be edited later.
    pub async fn send_message(&self, chat_id: i64, text: &str) -> Result<i64> {
        let sent: Message = self
            .call(
                "sendMessage",
                &json!({
                    "chat_id": chat_id,
                    "text": clamp_message(text),
                    "disable_web_page_preview": true,
                }),
            )
            .await?;
        Ok(sent.message_id)
    }

    pub async fn edit_message(&self, chat_id: i64, message_id: i64, text: &str) -> Result<()> {
        let result: Result<serde_json::Value> = self
            .call(
                "editMessageText",
                &json!({
                    "chat_id": chat_id,
                    "message_id": message_id,
                    "text": clamp_message(text),
                    "disable_web_page_preview": true,
                }),
            )
            .await;
        match result {
            Ok(_) => Ok(()),
            // Editing to identical content is not an error worth surfacing.
            Err(err) if err.to_string().contains("message is not modified") => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<()> {
        let _: serde_json::Value = self
            .call(
                "deleteMessage",
                &json!({ "chat_id": chat_id, "message_id": message_id }),
            )
            .await?;
        Ok(())
    }

    pub async fn send_typing(&self, chat_id: i64) -> Result<()> {
        let _: serde_json::Value = self
            .call(
                "sendChatAction",
                &json!({ "chat_id": chat_id, "action": "typing" }),
            )
            .await?;
        Ok(())
    }

    /// Whether the bot API answers at all — the liveness probe.
    pub async fn get_me(&self) -> bool {
        self.call::<serde_json::Value>("getMe", &json!({})).await.is_ok()
    }

    pub async fn delete_webhook(&self, drop_pending_updates: bool) -> Result<()> {
        let _: serde_json::Value = self
            .call(
                "deleteWebhook",
                &json!({ "drop_pending_updates": drop_pending_updates }),
            )
            .await?;
        Ok(())
    }
}

/// Clamp to the platform limit, ellipsized on a char boundary.
pub fn clamp_message(text: &str) -> String {
    mobyclaw_config::truncate_chars(text, TELEGRAM_MAX_LEN - 1)
}

/// Split a long proactive message on line boundaries.
pub fn chunk_message(text: &str, max_chars: usize) -> Vec<String> {
    if text.chars().count() <= max_chars {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for line in text.lines() {
        let line_len = line.chars().count() + 1;
        if current_len > 0 && current_len + line_len > max_chars {
            chunks.push(current.trim_end().to_string());
            current.clear();
            current_len = 0;
        }
        current.push_str(line);
        current.push('\n');
        current_len += line_len;
    }

    if !current.trim().is_empty() {
        chunks.push(current.trim_end().to_string());
    }
    if chunks.is_empty() {
        chunks.push(text.to_string());
    }
    chunks
}

#[derive(Debug, Deserialize)]
struct TelegramResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
}

#[derive(Debug, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub from: Option<User>,
    pub chat: Chat,
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct User {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
pub struct Chat {
    pub id: i64,
}
