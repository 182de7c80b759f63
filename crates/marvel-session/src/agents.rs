//! Agent and teammate lifecycle tracking.
//!
//! Session-scoped maps with a TTL sweeper: entries older than one hour
//! (from completion, or launch when never completed) are removed, and
//! empty sessions disappear with them. Before compaction the registry is
//! serialized to a temp file so a restarted daemon can still answer the
//! post-compaction handler.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use marvel_core::fsio;

const ENTRY_TTL_SECS: i64 = 60 * 60;
const SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);
const SUMMARY_CHAR_BUDGET: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Running,
    Completed,
    Errored,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEntry {
    pub id: String,
    pub agent_type: String,
    pub session_id: String,
    pub status: AgentStatus,
    pub launch_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl AgentEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let reference = self.completed_time.unwrap_or(self.launch_time);
        (now - reference).num_seconds() > ENTRY_TTL_SECS
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SessionAgents {
    agents: HashMap<String, AgentEntry>,
    teammates: HashMap<String, String>,
}

#[derive(Debug, Default)]
pub struct AgentRegistry {
    sessions: Mutex<HashMap<String, SessionAgents>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, session_id: &str, agent_id: &str, agent_type: &str) {
        let entry = AgentEntry {
            id: agent_id.to_string(),
            agent_type: agent_type.to_string(),
            session_id: session_id.to_string(),
            status: AgentStatus::Running,
            launch_time: Utc::now(),
            completed_time: None,
            transcript_path: None,
            result_summary: None,
            error_message: None,
        };
        self.sessions
            .lock()
            .await
            .entry(session_id.to_string())
            .or_default()
            .agents
            .insert(agent_id.to_string(), entry);
    }

    pub async fn complete(
        &self,
        session_id: &str,
        agent_id: &str,
        transcript_path: Option<String>,
        result_summary: Option<String>,
    ) {
        let mut sessions = self.sessions.lock().await;
        if let Some(entry) = sessions
            .get_mut(session_id)
            .and_then(|s| s.agents.get_mut(agent_id))
        {
            entry.status = AgentStatus::Completed;
            entry.completed_time = Some(Utc::now());
            entry.transcript_path = transcript_path;
            entry.result_summary = result_summary;
        }
    }

    pub async fn error(&self, session_id: &str, agent_id: &str, message: &str) {
        let mut sessions = self.sessions.lock().await;
        if let Some(entry) = sessions
            .get_mut(session_id)
            .and_then(|s| s.agents.get_mut(agent_id))
        {
            entry.status = AgentStatus::Errored;
            entry.completed_time = Some(Utc::now());
            entry.error_message = Some(message.to_string());
        }
    }

    pub async fn list(&self, session_id: &str) -> Vec<AgentEntry> {
        let sessions = self.sessions.lock().await;
        let mut entries: Vec<AgentEntry> = sessions
            .get(session_id)
            .map(|s| s.agents.values().cloned().collect())
            .unwrap_or_default();
        entries.sort_by(|a, b| a.launch_time.cmp(&b.launch_time));
        entries
    }

    pub async fn track_teammate(&self, session_id: &str, name: &str, team: &str) {
        self.sessions
            .lock()
            .await
            .entry(session_id.to_string())
            .or_default()
            .teammates
            .insert(name.to_string(), team.to_string());
    }

    pub async fn get_team(&self, session_id: &str) -> HashMap<String, String> {
        self.sessions
            .lock()
            .await
            .get(session_id)
            .map(|s| s.teammates.clone())
            .unwrap_or_default()
    }

    pub async fn clear_session(&self, session_id: &str) {
        self.sessions.lock().await.remove(session_id);
    }

    /// Drop expired entries; sessions left with nothing are removed.
    pub async fn sweep(&self) {
        let now = Utc::now();
        let mut sessions = self.sessions.lock().await;
        for session in sessions.values_mut() {
            session.agents.retain(|_, e| !e.is_expired(now));
        }
        let before = sessions.len();
        sessions.retain(|_, s| !s.agents.is_empty() || !s.teammates.is_empty());
        let removed = before - sessions.len();
        if removed > 0 {
            debug!(removed, "swept empty agent sessions");
        }
    }

    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                registry.sweep().await;
            }
        })
    }

    /// Serialize one session's registry for the compaction handoff.
    pub async fn serialize_session(&self, session_id: &str, path: &Path) {
        let sessions = self.sessions.lock().await;
        let Some(session) = sessions.get(session_id) else {
            return;
        };
        fsio::write_json_best_effort(path, session, Some(0o600));
    }

    /// Post-compaction summary: the in-memory registry first, then the
    /// handoff file (daemon restart), which is unlinked either way.
    pub async fn post_compaction_summary(&self, session_id: &str, handoff_path: &Path) -> Option<String> {
        let mut entries = self.list(session_id).await;
        if entries.is_empty() {
            if let Some(session) = fsio::read_json::<SessionAgents>(handoff_path) {
                entries = session.agents.into_values().collect();
                entries.sort_by(|a, b| a.launch_time.cmp(&b.launch_time));
            }
        }
        let _ = std::fs::remove_file(handoff_path);

        if entries.is_empty() {
            return None;
        }
        Some(summarize(&entries))
    }
}

/// Tabular agent summary bounded to roughly 2000 characters.
fn summarize(entries: &[AgentEntry]) -> String {
    let mut out = String::from("Agents before compaction:\n\nID | Type | Status | Result\n-- | ---- | ------ | ------\n");
    for entry in entries {
        let status = match entry.status {
            AgentStatus::Running => "running",
            AgentStatus::Completed => "completed",
            AgentStatus::Errored => "errored",
        };
        let result = entry
            .error_message
            .as_deref()
            .or(entry.result_summary.as_deref())
            .unwrap_or("-");
        let mut line = format!("{} | {} | {} | {}\n", entry.id, entry.agent_type, status, result);
        if line.len() > 200 {
            let mut end = 197;
            while !line.is_char_boundary(end) {
                end -= 1;
            }
            line.truncate(end);
            line.push_str("…\n");
        }
        if out.len() + line.len() > SUMMARY_CHAR_BUDGET {
            out.push_str("… (truncated)\n");
            break;
        }
        out.push_str(&line);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn register_complete_error_lifecycle() {
        let registry = AgentRegistry::new();
        registry.register("s1", "a1", "explorer").await;
        registry.register("s1", "a2", "builder").await;

        registry
            .complete("s1", "a1", Some("/tmp/t.jsonl".into()), Some("done".into()))
            .await;
        registry.error("s1", "a2", "crashed").await;

        let entries = registry.list("s1").await;
        assert_eq!(entries.len(), 2);
        let a1 = entries.iter().find(|e| e.id == "a1").unwrap();
        assert_eq!(a1.status, AgentStatus::Completed);
        assert_eq!(a1.result_summary.as_deref(), Some("done"));
        let a2 = entries.iter().find(|e| e.id == "a2").unwrap();
        assert_eq!(a2.status, AgentStatus::Errored);
        assert_eq!(a2.error_message.as_deref(), Some("crashed"));
    }

    #[tokio::test]
    async fn sessions_are_isolated() {
        let registry = AgentRegistry::new();
        registry.register("s1", "a1", "explorer").await;
        registry.register("s2", "b1", "builder").await;

        assert_eq!(registry.list("s1").await.len(), 1);
        assert_eq!(registry.list("s2").await.len(), 1);

        registry.clear_session("s1").await;
        assert!(registry.list("s1").await.is_empty());
        assert_eq!(registry.list("s2").await.len(), 1);
    }

    #[tokio::test]
    async fn sweep_removes_stale_entries_and_empty_sessions() {
        let registry = AgentRegistry::new();
        registry.register("s1", "old", "explorer").await;
        registry.register("s1", "fresh", "builder").await;
        {
            let mut sessions = registry.sessions.lock().await;
            let entry = sessions.get_mut("s1").unwrap().agents.get_mut("old").unwrap();
            entry.launch_time = Utc::now() - chrono::Duration::hours(2);
        }

        registry.sweep().await;
        let entries = registry.list("s1").await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "fresh");

        // Expire the remaining entry; the session itself disappears.
        {
            let mut sessions = registry.sessions.lock().await;
            let entry = sessions.get_mut("s1").unwrap().agents.get_mut("fresh").unwrap();
            entry.launch_time = Utc::now() - chrono::Duration::hours(2);
        }
        registry.sweep().await;
        assert!(registry.sessions.lock().await.is_empty());
    }

    #[tokio::test]
    async fn teammates_keep_a_session_alive() {
        let registry = AgentRegistry::new();
        registry.track_teammate("s1", "reviewer", "core").await;
        registry.sweep().await;

        let team = registry.get_team("s1").await;
        assert_eq!(team.get("reviewer").map(String::as_str), Some("core"));
    }

    #[tokio::test]
    async fn handoff_survives_a_registry_restart() {
        let dir = tempdir().unwrap();
        let handoff = dir.path().join("agents-s1.json");

        let registry = AgentRegistry::new();
        registry.register("s1", "a1", "explorer").await;
        registry.complete("s1", "a1", None, Some("found it".into())).await;
        registry.serialize_session("s1", &handoff).await;

        // A fresh registry (simulated restart) falls back to the file.
        let fresh = AgentRegistry::new();
        let summary = fresh.post_compaction_summary("s1", &handoff).await.unwrap();
        assert!(summary.contains("a1"));
        assert!(summary.contains("found it"));
        // The handoff file is unlinked regardless.
        assert!(!handoff.exists());
    }

    #[tokio::test]
    async fn summary_is_bounded() {
        let registry = AgentRegistry::new();
        for i in 0..100 {
            registry.register("s1", &format!("agent-{i:03}"), "worker").await;
        }
        let dir = tempdir().unwrap();
        let summary = registry
            .post_compaction_summary("s1", &dir.path().join("none.json"))
            .await
            .unwrap();
        assert!(summary.len() <= SUMMARY_CHAR_BUDGET + 40);
        assert!(summary.contains("truncated"));
    }
}
