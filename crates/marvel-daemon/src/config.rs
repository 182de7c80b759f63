//! Daemon configuration, loaded leniently from the security directory.

use std::path::Path;

use serde::{Deserialize, Serialize};

use marvel_core::fsio;
use marvel_security::EvaluatorConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SecurityConfig {
    pub evaluator: EvaluatorConfig,
    pub debug: bool,
}

impl SecurityConfig {
    /// Missing or malformed files fall back to defaults; unknown fields
    /// are ignored.
    pub fn load(security_dir: &Path) -> Self {
        fsio::read_json(&security_dir.join("config.json")).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_when_absent() {
        let dir = tempdir().unwrap();
        let config = SecurityConfig::load(dir.path());
        assert!(config.evaluator.enabled);
        assert!((config.evaluator.cost_cap_usd - 0.50).abs() < f64::EPSILON);
        assert!((config.evaluator.deny_confidence_threshold - 0.7).abs() < f64::EPSILON);
        assert!(!config.debug);
    }

    #[test]
    fn partial_file_merges_with_defaults() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            r#"{"evaluator": {"enabled": false, "program": ["x"], "costCapUsd": 0.25, "idleTimeoutSecs": 60, "denyConfidenceThreshold": 0.9}, "unknownField": 1}"#,
        )
        .unwrap();

        let config = SecurityConfig::load(dir.path());
        assert!(!config.evaluator.enabled);
        assert!((config.evaluator.cost_cap_usd - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn malformed_file_falls_back() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), "{nope").unwrap();
        let config = SecurityConfig::load(dir.path());
        assert!(config.evaluator.enabled);
    }
}
