//! The bash security gate: a four-layer decision pipeline.
//!
//! Order matters: allowlist, then denylist, then learned rules, then the
//! external evaluator. The denylist is checked before learned rules so a
//! broad learned pattern can never grant permission for a rule the
//! denylist added later.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use marvel_core::hook::{PermissionDecision, ReadinessCheck};
use marvel_core::redact;

use crate::evaluator::{CommandEvaluator, EvaluatorError, RECURSION_FLAG};
use crate::learned::LearnedRuleStore;
use crate::metrics::SecurityMetrics;
use crate::pending::PendingDecisionTracker;
use crate::rules::{RuleSets, RuleType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionSource {
    Allowlist,
    Denylist,
    Learned,
    Llm,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GateDecision {
    pub decision: PermissionDecision,
    pub source: DecisionSource,
    pub reason: String,
}

/// Redacted, append-only audit record of one gate decision.
#[derive(Debug, Serialize, Deserialize)]
struct DecisionRecord {
    timestamp: chrono::DateTime<Utc>,
    command: String,
    decision: PermissionDecision,
    source: DecisionSource,
    reason: String,
}

/// Evaluator suggestions that failed the safety check, kept for review.
#[derive(Debug, Serialize, Deserialize)]
struct SuggestionRecord {
    timestamp: chrono::DateTime<Utc>,
    command: String,
    pattern: String,
    refused: String,
}

static MERGE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"^gh\s+pr\s+merge\b").unwrap(),
        Regex::new(r"^glab\s+mr\s+merge\b").unwrap(),
        Regex::new(r"^gh\s+api\s+\S*/merge\b").unwrap(),
        Regex::new(r"^git\s+merge\s+\S+").unwrap(),
    ]
});

static COMMIT_PUSH_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"^git\s+commit\b").unwrap(),
        Regex::new(r"^git\s+push\b").unwrap(),
    ]
});

pub fn is_merge_command(command: &str) -> bool {
    let normalized = marvel_core::command::normalize_command(command);
    MERGE_PATTERNS.iter().any(|re| re.is_match(&normalized))
}

pub fn is_commit_or_push(command: &str) -> bool {
    let normalized = marvel_core::command::normalize_command(command);
    COMMIT_PUSH_PATTERNS.iter().any(|re| re.is_match(&normalized))
}

pub struct BashGate {
    rules: RuleSets,
    learned: Mutex<LearnedRuleStore>,
    pending: Arc<PendingDecisionTracker>,
    evaluator: Arc<dyn CommandEvaluator>,
    metrics: Mutex<SecurityMetrics>,
    project_root: String,
    security_dir: PathBuf,
}

impl BashGate {
    pub fn new(
        rules: RuleSets,
        learned: LearnedRuleStore,
        pending: Arc<PendingDecisionTracker>,
        evaluator: Arc<dyn CommandEvaluator>,
        project_root: String,
        security_dir: PathBuf,
    ) -> Self {
        Self {
            rules,
            learned: Mutex::new(learned),
            pending,
            evaluator,
            metrics: Mutex::new(SecurityMetrics::default()),
            project_root,
            security_dir,
        }
    }

    /// The core decision function.
    pub async fn evaluate(&self, command: &str, description: Option<&str>) -> GateDecision {
        let decision = self.evaluate_inner(command, description).await;
        self.metrics
            .lock()
            .await
            .record(decision.source, decision.decision);
        self.audit(command, &decision);
        decision
    }

    async fn evaluate_inner(&self, command: &str, description: Option<&str>) -> GateDecision {
        // Recursion guard: requests originating from the evaluator
        // subprocess are allowed immediately.
        if std::env::var(RECURSION_FLAG).is_ok() {
            return GateDecision {
                decision: PermissionDecision::Allow,
                source: DecisionSource::Allowlist,
                reason: "evaluator-internal command".to_string(),
            };
        }

        // An allowlist hit is still vetoed by a denylist match: nothing
        // on the denylist is ever allowed, whatever the other layers say.
        let denied = self.rules.deny_match(command);

        if let Some(matched) = self.rules.allow_match(command) {
            if denied.is_none() {
                debug!(rule = %matched.rule.id, "allowlist match");
                return GateDecision {
                    decision: PermissionDecision::Allow,
                    source: DecisionSource::Allowlist,
                    reason: matched.rule.reason.clone(),
                };
            }
        }

        if let Some(matched) = denied {
            debug!(rule = %matched.rule.id, "denylist match");
            return GateDecision {
                decision: PermissionDecision::Deny,
                source: DecisionSource::Denylist,
                reason: matched.rule.reason.clone(),
            };
        }

        if let Some(rule) = self.learned.lock().await.find_match(command) {
            debug!(rule = %rule.id, "learned rule match");
            return GateDecision {
                decision: PermissionDecision::Allow,
                source: DecisionSource::Learned,
                reason: format!("previously approved: {}", rule.reason),
            };
        }

        match self.evaluator.evaluate(command, description).await {
            Ok(verdict) => {
                // Allow and ask decisions may converge to a learned rule
                // once the command executes; deny never does.
                if verdict.decision != PermissionDecision::Deny {
                    self.pending
                        .add(
                            command,
                            &verdict.reason,
                            description,
                            verdict.suggested_rule.clone(),
                        )
                        .await;
                }
                GateDecision {
                    decision: verdict.decision,
                    source: DecisionSource::Llm,
                    reason: verdict.reason,
                }
            }
            Err(EvaluatorError::CostCapExceeded) => GateDecision {
                decision: PermissionDecision::Ask,
                source: DecisionSource::Error,
                reason: "evaluator cost cap reached; please review manually".to_string(),
            },
            Err(e) => {
                warn!(error = %e, "evaluator failed, falling back to ask");
                GateDecision {
                    decision: PermissionDecision::Ask,
                    source: DecisionSource::Error,
                    reason: format!("evaluator unavailable ({e}); please review manually"),
                }
            }
        }
    }

    /// Merge commands are blocked until lint, typecheck and test have all
    /// passed this session. Returns `None` for non-merge commands.
    pub fn merge_gate(&self, command: &str, merge_readiness: &ReadinessCheck) -> Option<GateDecision> {
        if !is_merge_command(command) {
            return None;
        }
        if merge_readiness.ready {
            return None;
        }
        Some(GateDecision {
            decision: PermissionDecision::Deny,
            source: DecisionSource::Denylist,
            reason: format!(
                "merge blocked: {} not verified this session. Run the missing checks first.",
                merge_readiness.missing.join(", ")
            ),
        })
    }

    /// Commit/push get a non-blocking warning on the same flags (minus
    /// test). Returns context text to surface, never a deny.
    pub fn commit_warning(
        &self,
        command: &str,
        pre_commit_readiness: &ReadinessCheck,
    ) -> Option<String> {
        if !is_commit_or_push(command) {
            return None;
        }
        if pre_commit_readiness.ready {
            return None;
        }
        Some(format!(
            "Heads up: {} not verified this session.",
            pre_commit_readiness.missing.join(", ")
        ))
    }

    /// Consume the pending entry for an executed command and try to learn
    /// a rule from it. The evaluator's suggestion wins when safe; pattern
    /// extraction is the fallback. When both are refused, the command
    /// stays subject to the evaluator.
    pub async fn record_execution(&self, command: &str, session_id: &str) {
        let Some(pending) = self.pending.consume(command).await else {
            return;
        };

        let mut learned = self.learned.lock().await;

        if let Some(suggested) = &pending.suggested_rule {
            match learned.learn(
                &suggested.pattern,
                suggested.rule_type,
                &suggested.reason,
                command,
                session_id,
            ) {
                Ok(rule) => {
                    debug!(pattern = %rule.pattern, "learned rule from evaluator suggestion");
                    return;
                }
                Err(refused) => {
                    self.journal_refused_suggestion(command, &suggested.pattern, &refused.to_string());
                }
            }
        }

        let Some(pattern) = crate::learned::extract_pattern(command, &self.project_root) else {
            return;
        };
        match learned.learn(
            &pattern,
            RuleType::Prefix,
            &pending.reason,
            command,
            session_id,
        ) {
            Ok(rule) => {
                debug!(pattern = %rule.pattern, "learned rule from extracted pattern");
            }
            Err(refused) => {
                debug!(pattern = %pattern, %refused, "pattern refused by safety check");
            }
        }
    }

    fn audit(&self, command: &str, decision: &GateDecision) {
        marvel_core::fsio::append_jsonl_best_effort(
            &self.security_dir.join("decisions.jsonl"),
            &DecisionRecord {
                timestamp: Utc::now(),
                command: redact(command),
                decision: decision.decision,
                source: decision.source,
                reason: redact(&decision.reason),
            },
        );
    }

    fn journal_refused_suggestion(&self, command: &str, pattern: &str, refused: &str) {
        marvel_core::fsio::append_jsonl_best_effort(
            &self.security_dir.join("suggestions.jsonl"),
            &SuggestionRecord {
                timestamp: Utc::now(),
                command: redact(command),
                pattern: pattern.to_string(),
                refused: refused.to_string(),
            },
        );
    }

    pub async fn metrics_snapshot(&self) -> SecurityMetrics {
        self.metrics.lock().await.clone()
    }
}
