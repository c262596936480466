use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use mobyclaw_config::persist::{atomic_write_json, load_json};
use mobyclaw_config::{StmConfig, truncate_chars};

/// One stored user↔agent exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exchange {
    pub time: DateTime<Utc>,
    pub channel: String,
    pub user: String,
    pub agent: String,
}

/// Rolling bounded buffer of the last N exchanges, injected into the first
/// turn of any fresh upstream session to restore conversational continuity.
///
/// User text is stored with the gateway's own injected prefixes stripped, so
/// a replayed history never nests context blocks inside context blocks.
pub struct ShortTermMemory {
    path: PathBuf,
    max_exchanges: usize,
    max_msg_length: usize,
    strip_patterns: Vec<Regex>,
    entries: Mutex<Vec<Exchange>>,
}

impl ShortTermMemory {
    pub fn new(path: PathBuf, config: &StmConfig) -> anyhow::Result<Self> {
        let entries = load_json::<Vec<Exchange>>(&path)
            .unwrap_or_else(|err| {
                warn!(?err, "short-term memory unreadable — starting empty");
                None
            })
            .unwrap_or_default();

        let strip_patterns = vec![
            Regex::new(r"(?s)\[MEMORY CONTEXT[^\]]*\].*?\[/MEMORY CONTEXT\]\s*")?,
            Regex::new(r"(?s)\[SHORT-TERM MEMORY[^\]]*\].*?\[/SHORT-TERM MEMORY\]\s*")?,
            Regex::new(r"^\[context:[^\]]*\]\s*")?,
            Regex::new(r"^\[\d+ messages? were queued while you were busy\. Here they are combined:\]\s*")?,
        ];

        Ok(Self {
            path,
            max_exchanges: config.max_exchanges.max(1),
            max_msg_length: config.max_msg_length,
            strip_patterns,
            entries: Mutex::new(entries),
        })
    }

    /// Record one completed exchange.  Synthetic channels (heartbeat, schedule,
    /// system) are not replay-worthy and are skipped.
    pub fn add_exchange(&self, channel: &str, user_message: &str, agent_response: &str) {
        if channel.starts_with("heartbeat:")
            || channel.starts_with("schedule:")
            || channel == "system"
        {
            return;
        }

        let user = truncate_chars(self.strip_injected(user_message).trim(), self.max_msg_length);
        let agent = truncate_chars(agent_response.trim(), self.max_msg_length);

        let mut entries = self.entries.lock().unwrap();
        entries.push(Exchange {
            time: Utc::now(),
            channel: channel.to_string(),
            user,
            agent,
        });
        let len = entries.len();
        if len > self.max_exchanges {
            entries.drain(..len - self.max_exchanges);
        }
        if let Err(err) = atomic_write_json(&self.path, &*entries) {
            warn!(?err, "failed to persist short-term memory");
        }
    }

    /// Remove every injected-prefix block the gateway itself added.
    fn strip_injected(&self, text: &str) -> String {
        let mut out = text.to_string();
        for pattern in &self.strip_patterns {
            out = pattern.replace_all(&out, "").into_owned();
        }
        out
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Render the replay block injected into the first turn of a new session.
    /// An empty buffer renders as an empty string.
    pub fn history_block(&self) -> String {
        let entries = self.entries.lock().unwrap();
        if entries.is_empty() {
            return String::new();
        }

        let mut block = format!(
            "[SHORT-TERM MEMORY — last {} conversation exchanges]\n\
             Your previous session ended; this is what was said most recently. \
             Continue naturally from here.\n",
            entries.len()
        );
        for (index, entry) in entries.iter().enumerate() {
            if index > 0 {
                block.push_str("\n---\n");
            }
            block.push_str(&format!(
                "\n[{} [{}]]\nUser: {}\nAgent: {}\n",
                entry.time.to_rfc3339_opts(SecondsFormat::Secs, true),
                entry.channel,
                entry.user,
                entry.agent,
            ));
        }
        block.push_str("[/SHORT-TERM MEMORY]");
        block
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stm(dir: &tempfile::TempDir) -> ShortTermMemory {
        ShortTermMemory::new(dir.path().join("stm.json"), &StmConfig::default()).unwrap()
    }

    #[test]
    fn memory_context_block_is_stripped_before_storage() {
        let dir = tempfile::tempdir().unwrap();
        let memory = stm(&dir);
        memory.add_exchange(
            "telegram:42",
            "[MEMORY CONTEXT — auto-loaded, memory+inner]\nsecret context\n[/MEMORY CONTEXT]\nwhat's the weather?",
            "Sunny.",
        );

        let block = memory.history_block();
        assert!(block.contains("what's the weather?"));
        assert!(!block.contains("secret context"));
        assert!(!block.contains("MEMORY CONTEXT"));
    }

    #[test]
    fn context_line_and_queue_header_are_stripped() {
        let dir = tempfile::tempdir().unwrap();
        let memory = stm(&dir);
        memory.add_exchange(
            "telegram:42",
            "[context: channel=telegram:42, time=2030-01-01T00:00:00Z]\nhello",
            "hi",
        );
        memory.add_exchange(
            "telegram:42",
            "[3 messages were queued while you were busy. Here they are combined:]\n\na\n\n---\n\nb",
            "ok",
        );

        let block = memory.history_block();
        assert!(!block.contains("[context:"));
        assert!(!block.contains("queued while you were busy"));
        assert!(block.contains("User: hello"));
    }

    #[test]
    fn synthetic_channels_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let memory = stm(&dir);
        memory.add_exchange("heartbeat:main", "reflect", "HEARTBEAT_OK");
        memory.add_exchange("schedule:sch_abc", "remind", "done");
        memory.add_exchange("system", "boot", "ok");
        assert!(memory.is_empty());
        assert_eq!(memory.history_block(), "");
    }

    #[test]
    fn buffer_is_bounded_and_sides_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let config = StmConfig {
            max_exchanges: 3,
            max_msg_length: 10,
        };
        let memory =
            ShortTermMemory::new(dir.path().join("stm.json"), &config).unwrap();
        for i in 0..5 {
            memory.add_exchange("telegram:1", &format!("message number {i}"), "a long agent reply");
        }

        assert_eq!(memory.len(), 3);
        let block = memory.history_block();
        assert!(!block.contains("message number 0"));
        assert!(block.contains("message nu…"));
        assert!(block.contains("a long age…"));
    }

    #[test]
    fn persists_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stm.json");
        {
            let memory =
                ShortTermMemory::new(path.clone(), &StmConfig::default()).unwrap();
            memory.add_exchange("telegram:42", "remember me", "will do");
        }
        let reloaded = ShortTermMemory::new(path, &StmConfig::default()).unwrap();
        assert_eq!(reloaded.len(), 1);
        assert!(reloaded.history_block().contains("remember me"));
    }
}
