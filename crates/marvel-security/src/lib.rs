pub mod evaluator;
pub mod gate;
pub mod learned;
pub mod metrics;
pub mod pending;
pub mod rules;

pub use evaluator::{
    CommandEvaluator, EvaluatorConfig, EvaluatorError, EvaluatorSession, EvaluatorVerdict,
    SuggestedRule,
};
pub use gate::{BashGate, DecisionSource, GateDecision};
pub use learned::{LearnedRule, LearnedRuleStore};
pub use metrics::SecurityMetrics;
pub use pending::{PendingDecision, PendingDecisionTracker};
pub use rules::{ExternalRule, RuleKind, RuleSets, RuleType};
