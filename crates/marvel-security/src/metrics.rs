//! In-memory security gate counters.

use std::path::Path;

use serde::{Deserialize, Serialize};

use marvel_core::hook::PermissionDecision;

use crate::gate::DecisionSource;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityMetrics {
    pub allowlist: u64,
    pub denylist: u64,
    pub learned: u64,
    pub llm: u64,
    pub error: u64,

    pub allow: u64,
    pub deny: u64,
    pub ask: u64,

    pub total: u64,
    pub auto_accept_rate: f64,
}

impl SecurityMetrics {
    pub fn record(&mut self, source: DecisionSource, decision: PermissionDecision) {
        match source {
            DecisionSource::Allowlist => self.allowlist += 1,
            DecisionSource::Denylist => self.denylist += 1,
            DecisionSource::Learned => self.learned += 1,
            DecisionSource::Llm => self.llm += 1,
            DecisionSource::Error => self.error += 1,
        }
        match decision {
            PermissionDecision::Allow => self.allow += 1,
            PermissionDecision::Deny => self.deny += 1,
            PermissionDecision::Ask => self.ask += 1,
        }
        self.total += 1;
        self.auto_accept_rate = (self.allowlist + self.learned) as f64 / self.total as f64;
    }

    /// Best-effort snapshot into the run directory.
    pub fn persist(&self, run_dir: &Path) {
        marvel_core::fsio::write_json_best_effort(
            &run_dir.join("security-metrics.json"),
            self,
            None,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_accept_rate_counts_lists_and_learned() {
        let mut metrics = SecurityMetrics::default();
        metrics.record(DecisionSource::Allowlist, PermissionDecision::Allow);
        metrics.record(DecisionSource::Learned, PermissionDecision::Allow);
        metrics.record(DecisionSource::Llm, PermissionDecision::Ask);
        metrics.record(DecisionSource::Denylist, PermissionDecision::Deny);

        assert_eq!(metrics.total, 4);
        assert_eq!(metrics.allow, 2);
        assert!((metrics.auto_accept_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn persist_writes_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let mut metrics = SecurityMetrics::default();
        metrics.record(DecisionSource::Allowlist, PermissionDecision::Allow);
        metrics.persist(dir.path());

        let loaded: SecurityMetrics =
            marvel_core::fsio::read_json(&dir.path().join("security-metrics.json")).unwrap();
        assert_eq!(loaded.total, 1);
    }
}
