use std::fs;
use std::path::PathBuf;

use serde::Deserialize;
use tracing::debug;

use mobyclaw_config::GatewayConfig;

use crate::dashboard::DashboardClient;

const SELF_MAX_SECTIONS: usize = 2;
const SELF_MAX_LINES: usize = 8;
const EXPLORATION_SCAN_CAP: usize = 50;
const EXPLORATION_EXCERPT_CHARS: usize = 500;

const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "are", "but", "not", "you", "your", "all", "can", "had", "has",
    "have", "was", "were", "with", "this", "that", "from", "they", "them", "what", "when",
    "where", "which", "will", "would", "could", "should", "about", "into", "just", "like",
    "some", "than", "then", "there", "these", "thing", "things", "how", "why", "who",
];

/// Per-turn context assembly: dashboard memory sections, inner state, the
/// self-model excerpt, and any exploration notes that match the message.
///
/// Everything here fails soft — a missing file or a dead dashboard just
/// shrinks the block, and an entirely empty block disappears.
pub struct ContextOptimizer {
    dashboard: Option<DashboardClient>,
    inner_state_file: PathBuf,
    self_file: PathBuf,
    explorations_dir: PathBuf,
    budget_tokens: u32,
    top_explorations: usize,
}

impl ContextOptimizer {
    pub fn new(config: &GatewayConfig, dashboard: Option<DashboardClient>) -> Self {
        Self {
            dashboard,
            inner_state_file: config.inner_state_file(),
            self_file: config.self_file(),
            explorations_dir: config.explorations_dir(),
            budget_tokens: config.dashboard.context_budget_tokens,
            top_explorations: 2,
        }
    }

    /// Compose the `[MEMORY CONTEXT …]` prefix for a user message.  Returns an
    /// empty string when there is nothing worth injecting.
    pub async fn compose(&self, message: &str) -> String {
        let memory = match &self.dashboard {
            Some(client) => client
                .fetch_context(message, self.budget_tokens)
                .await
                .unwrap_or_default(),
            None => String::new(),
        };
        let inner = self.inner_state_summary();
        let self_model = self.self_excerpt();
        let explorations = self.matching_explorations(message);

        if memory.is_empty() && inner.is_empty() && self_model.is_empty() && explorations.is_empty()
        {
            return String::new();
        }

        let mut block = String::from("[MEMORY CONTEXT — auto-loaded, memory+inner]\n");
        if !memory.is_empty() {
            block.push_str(&memory);
            block.push('\n');
        }
        if !inner.is_empty() {
            block.push_str("[INNER STATE — your current emotional/cognitive state]\n");
            block.push_str(&inner);
            block.push_str("\n[/INNER STATE]\n");
        }
        if !self_model.is_empty() {
            block.push_str("[SELF — who you think you are]\n");
            block.push_str(&self_model);
            block.push_str("\n[/SELF]\n");
        }
        if !explorations.is_empty() {
            block.push_str("[EXPLORATIONS — relevant things you've explored]\n");
            block.push_str(&explorations);
            block.push_str("\n[/EXPLORATIONS]\n");
        }
        block.push_str("[/MEMORY CONTEXT]\n");
        block
    }

    // ── inner state ────────────────────────────────────────────────────────────

    fn inner_state_summary(&self) -> String {
        let Ok(raw) = fs::read_to_string(&self.inner_state_file) else {
            return String::new();
        };
        let Ok(state) = serde_json::from_str::<InnerState>(&raw) else {
            debug!(path = %self.inner_state_file.display(), "inner state unparseable");
            return String::new();
        };

        let mut lines = Vec::new();
        if let Some(mood) = &state.mood {
            if let Some(primary) = &mood.primary {
                let mut line = format!("Mood: {primary}");
                if let Some(secondary) = &mood.secondary {
                    line.push_str(&format!(" ({secondary})"));
                }
                if let Some(note) = &mood.note {
                    line.push_str(&format!(" — {note}"));
                }
                lines.push(line);
            }
        }
        if let Some(energy) = &state.energy {
            lines.push(format!("Energy: {}", render_value(energy)));
        }
        if !state.preoccupations.is_empty() {
            lines.push(format!("On my mind: {}", state.preoccupations.join("; ")));
        }
        if !state.curiosity_queue.is_empty() {
            let top: Vec<&str> = state
                .curiosity_queue
                .iter()
                .take(3)
                .map(String::as_str)
                .collect();
            lines.push(format!("Curious about: {}", top.join("; ")));
        }
        if let Some(event) = state.recent_events.last() {
            lines.push(format!("Recent: {}", render_value(event)));
        }
        lines.join("\n")
    }

    // ── self-model ─────────────────────────────────────────────────────────────

    /// First two `## ` sections of SELF.md, capped at 8 non-blank lines each.
    fn self_excerpt(&self) -> String {
        let Ok(raw) = fs::read_to_string(&self.self_file) else {
            return String::new();
        };

        let mut sections: Vec<String> = Vec::new();
        let mut current: Option<(String, Vec<String>)> = None;
        for line in raw.lines() {
            if line.starts_with("## ") {
                if let Some((header, body)) = current.take() {
                    sections.push(render_section(&header, &body));
                }
                if sections.len() >= SELF_MAX_SECTIONS {
                    current = None;
                    break;
                }
                current = Some((line.to_string(), Vec::new()));
            } else if let Some((_, body)) = current.as_mut() {
                if !line.trim().is_empty() && body.len() < SELF_MAX_LINES {
                    body.push(line.to_string());
                }
            }
        }
        if let Some((header, body)) = current {
            if sections.len() < SELF_MAX_SECTIONS {
                sections.push(render_section(&header, &body));
            }
        }
        sections.join("\n")
    }

    // ── explorations ───────────────────────────────────────────────────────────

    /// Score exploration notes against the message's word tokens and return
    /// excerpts of the best matches.
    fn matching_explorations(&self, message: &str) -> String {
        let tokens = word_tokens(message);
        if tokens.is_empty() {
            return String::new();
        }

        let Ok(entries) = fs::read_dir(&self.explorations_dir) else {
            return String::new();
        };
        let mut files: Vec<(std::time::SystemTime, PathBuf)> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "md"))
            .filter_map(|e| {
                let modified = e.metadata().ok()?.modified().ok()?;
                Some((modified, e.path()))
            })
            .collect();
        files.sort_by(|a, b| b.0.cmp(&a.0));
        files.truncate(EXPLORATION_SCAN_CAP);

        let mut scored: Vec<(u32, PathBuf, String)> = Vec::new();
        for (_, path) in files {
            let Ok(content) = fs::read_to_string(&path) else {
                continue;
            };
            let lower = content.to_lowercase();
            let topic_line = frontmatter_topic(&content).unwrap_or_default();
            let mut score = 0;
            for token in &tokens {
                if lower.contains(token.as_str()) {
                    score += 1;
                }
                if topic_line.contains(token.as_str()) {
                    score += 2;
                }
            }
            if score > 0 {
                scored.push((score, path, content));
            }
        }
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        scored.truncate(self.top_explorations);

        scored
            .into_iter()
            .map(|(_, path, content)| {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let excerpt = if content.chars().count() > EXPLORATION_EXCERPT_CHARS {
                    let head: String = content.chars().take(EXPLORATION_EXCERPT_CHARS).collect();
                    format!("{head}[...truncated]")
                } else {
                    content
                };
                format!("--- {name} ---\n{excerpt}")
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn render_section(header: &str, body: &[String]) -> String {
    if body.is_empty() {
        header.to_string()
    } else {
        format!("{header}\n{}", body.join("\n"))
    }
}

fn render_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Object(map) => map
            .values()
            .filter_map(|v| v.as_str())
            .collect::<Vec<_>>()
            .join(" — "),
        other => other.to_string(),
    }
}

/// Lowercase word tokens of at least three characters, minus stop words.
fn word_tokens(message: &str) -> Vec<String> {
    let lower = message.to_lowercase();
    let mut tokens: Vec<String> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() >= 3 && !STOP_WORDS.contains(w))
        .map(str::to_string)
        .collect();
    tokens.sort();
    tokens.dedup();
    tokens
}

/// The `topic:` line of a leading `---` frontmatter block, lowercased.
fn frontmatter_topic(content: &str) -> Option<String> {
    let rest = content.strip_prefix("---")?;
    let end = rest.find("\n---")?;
    rest[..end]
        .lines()
        .find_map(|line| line.trim().strip_prefix("topic:"))
        .map(|topic| topic.trim().to_lowercase())
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct InnerState {
    mood: Option<Mood>,
    energy: Option<serde_json::Value>,
    preoccupations: Vec<String>,
    curiosity_queue: Vec<String>,
    recent_events: Vec<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Mood {
    primary: Option<String>,
    secondary: Option<String>,
    note: Option<String>,
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn optimizer(dir: &tempfile::TempDir) -> ContextOptimizer {
        let config = GatewayConfig {
            data_root: dir.path().to_path_buf(),
            ..Default::default()
        };
        ContextOptimizer::new(&config, None)
    }

    #[tokio::test]
    async fn empty_sources_compose_to_empty_string() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(optimizer(&dir).compose("hello there").await, "");
    }

    #[tokio::test]
    async fn inner_state_renders_compact_summary() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("state")).unwrap();
        fs::write(
            dir.path().join("state/inner.json"),
            serde_json::json!({
                "mood": {"primary": "curious", "secondary": "restless", "note": "new project"},
                "energy": "high",
                "preoccupations": ["the garden", "rust lifetimes"],
                "curiosity_queue": ["mycelium networks", "tide pools", "drum machines", "a fourth"],
                "recent_events": [{"what": "long walk"}]
            })
            .to_string(),
        )
        .unwrap();

        let block = optimizer(&dir).compose("anything").await;
        assert!(block.starts_with("[MEMORY CONTEXT — auto-loaded, memory+inner]"));
        assert!(block.contains("Mood: curious (restless) — new project"));
        assert!(block.contains("Energy: high"));
        assert!(block.contains("On my mind: the garden; rust lifetimes"));
        assert!(block.contains("Curious about: mycelium networks; tide pools; drum machines"));
        assert!(!block.contains("a fourth"));
        assert!(block.contains("Recent: long walk"));
        assert!(block.trim_end().ends_with("[/MEMORY CONTEXT]"));
    }

    #[tokio::test]
    async fn self_excerpt_takes_two_sections_capped() {
        let dir = tempfile::tempdir().unwrap();
        let mut self_md = String::from("# Self\n\n## Identity\n");
        for i in 0..12 {
            self_md.push_str(&format!("identity line {i}\n"));
        }
        self_md.push_str("\n## Values\nhonesty\n\n## Unused\nnever shown\n");
        fs::write(dir.path().join("SELF.md"), self_md).unwrap();

        let block = optimizer(&dir).compose("anything").await;
        assert!(block.contains("## Identity"));
        assert!(block.contains("identity line 7"));
        assert!(!block.contains("identity line 8"));
        assert!(block.contains("## Values"));
        assert!(!block.contains("never shown"));
    }

    #[tokio::test]
    async fn explorations_are_scored_and_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let explorations = dir.path().join("explorations");
        fs::create_dir_all(&explorations).unwrap();
        fs::write(
            explorations.join("2030-01-01-mycelium.md"),
            format!(
                "---\ntopic: mycelium networks\n---\n{}",
                "mycelium ".repeat(100)
            ),
        )
        .unwrap();
        fs::write(
            explorations.join("2030-01-02-unrelated.md"),
            "---\ntopic: sourdough\n---\nflour and water",
        )
        .unwrap();

        let block = optimizer(&dir).compose("tell me about mycelium").await;
        assert!(block.contains("2030-01-01-mycelium.md"));
        assert!(block.contains("[...truncated]"));
        assert!(!block.contains("sourdough"));
    }

    #[test]
    fn word_tokens_filter_short_and_stop_words() {
        let tokens = word_tokens("Tell me about the mycelium networks, and how they work!");
        assert!(tokens.contains(&"mycelium".to_string()));
        assert!(tokens.contains(&"networks".to_string()));
        assert!(!tokens.contains(&"the".to_string()));
        assert!(!tokens.contains(&"me".to_string()));
    }
}
