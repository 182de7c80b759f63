//! Pending decisions: approvals awaiting post-execution confirmation.
//!
//! A command that received `ask` or an evaluator `allow` is remembered
//! here; when the matching `post-tool-use` arrives, the entry is consumed
//! and may become a learned rule. Entries expire after five minutes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use marvel_core::command::normalize_whitespace;

use crate::evaluator::SuggestedRule;

const TTL_SECS: i64 = 5 * 60;
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct PendingDecision {
    pub command: String,
    pub description: Option<String>,
    pub reason: String,
    pub suggested_rule: Option<SuggestedRule>,
    pub timestamp: DateTime<Utc>,
}

impl PendingDecision {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        (now - self.timestamp).num_seconds() > TTL_SECS
    }
}

#[derive(Debug, Default)]
pub struct PendingDecisionTracker {
    entries: Mutex<HashMap<String, PendingDecision>>,
}

impl PendingDecisionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(
        &self,
        command: &str,
        reason: &str,
        description: Option<&str>,
        suggested_rule: Option<SuggestedRule>,
    ) {
        let key = normalize_whitespace(command);
        let entry = PendingDecision {
            command: command.to_string(),
            description: description.map(str::to_string),
            reason: reason.to_string(),
            suggested_rule,
            timestamp: Utc::now(),
        };
        self.entries.lock().await.insert(key, entry);
    }

    /// Remove and return the entry for `command`, if present and fresh.
    pub async fn consume(&self, command: &str) -> Option<PendingDecision> {
        let key = normalize_whitespace(command);
        let entry = self.entries.lock().await.remove(&key)?;
        if entry.is_expired(Utc::now()) {
            return None;
        }
        Some(entry)
    }

    pub async fn sweep(&self) {
        let now = Utc::now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        let evicted = before - entries.len();
        if evicted > 0 {
            debug!(evicted, "evicted expired pending decisions");
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Background eviction, once per minute.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                tracker.sweep().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_and_consume_uses_normalized_key() {
        let tracker = PendingDecisionTracker::new();
        tracker
            .add("gh  pr   list", "evaluator allow", None, None)
            .await;

        let entry = tracker.consume("gh pr list").await.unwrap();
        assert_eq!(entry.command, "gh  pr   list");
        assert_eq!(entry.reason, "evaluator allow");

        // Consumed entries are gone.
        assert!(tracker.consume("gh pr list").await.is_none());
    }

    #[tokio::test]
    async fn expired_entries_are_not_returned() {
        let tracker = PendingDecisionTracker::new();
        tracker.add("npm test", "ask", None, None).await;
        {
            let mut entries = tracker.entries.lock().await;
            let entry = entries.get_mut("npm test").unwrap();
            entry.timestamp = Utc::now() - chrono::Duration::seconds(TTL_SECS + 1);
        }
        assert!(tracker.consume("npm test").await.is_none());
    }

    #[tokio::test]
    async fn sweep_evicts_only_expired() {
        let tracker = PendingDecisionTracker::new();
        tracker.add("fresh cmd", "r", None, None).await;
        tracker.add("stale cmd", "r", None, None).await;
        {
            let mut entries = tracker.entries.lock().await;
            let entry = entries.get_mut("stale cmd").unwrap();
            entry.timestamp = Utc::now() - chrono::Duration::seconds(TTL_SECS + 1);
        }

        tracker.sweep().await;
        assert_eq!(tracker.len().await, 1);
        assert!(tracker.consume("fresh cmd").await.is_some());
    }
}
