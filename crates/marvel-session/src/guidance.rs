//! Guidance capture: classifying user utterances.
//!
//! Every prompt is classified into a type with a confidence score, but
//! only corrections and directions are stored (redacted). Everything
//! else is dropped.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use marvel_core::redact;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuidanceType {
    Correction,
    Direction,
    TaskStart,
    TaskEnd,
    Approval,
    Rejection,
    Clarification,
    Unknown,
}

impl GuidanceType {
    /// Only corrections and directions survive persistence.
    pub fn is_stored(&self) -> bool {
        matches!(self, Self::Correction | Self::Direction)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Guidance {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub run_id: String,
    #[serde(rename = "type")]
    pub guidance_type: GuidanceType,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub confidence: f64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub preceding_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preceding_tool: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preceding_packs: Vec<String>,
}

impl Guidance {
    pub fn new(
        run_id: &str,
        guidance_type: GuidanceType,
        content: &str,
        category: Option<String>,
        confidence: f64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            run_id: run_id.to_string(),
            guidance_type,
            content: redact(content),
            category,
            confidence,
            preceding_file: None,
            preceding_tool: None,
            preceding_packs: Vec::new(),
        }
    }

    pub fn with_context(
        mut self,
        file: Option<String>,
        tool: Option<String>,
        packs: Vec<String>,
    ) -> Self {
        self.preceding_file = file;
        self.preceding_tool = tool;
        self.preceding_packs = packs;
        self
    }
}

struct TypePattern {
    guidance_type: GuidanceType,
    pattern: Regex,
    confidence: f64,
}

static TYPE_PATTERNS: Lazy<Vec<TypePattern>> = Lazy::new(|| {
    vec![
        TypePattern {
            guidance_type: GuidanceType::Correction,
            pattern: Regex::new(
                r"(?i)^(no[,.! ]|not like that|that's (?:wrong|not)|wrong[,.! ]|stop\b|undo\b|revert\b|don't|do not\b|actually[, ]|instead[, ]|you (?:broke|removed|deleted))",
            )
            .unwrap(),
            confidence: 0.85,
        },
        TypePattern {
            guidance_type: GuidanceType::Rejection,
            pattern: Regex::new(r"(?i)^(reject|deny|cancel that|never mind|forget it)\b").unwrap(),
            confidence: 0.8,
        },
        TypePattern {
            guidance_type: GuidanceType::Approval,
            pattern: Regex::new(
                r"(?i)^(yes\b|yep\b|lgtm\b|looks good|perfect\b|approved?\b|go ahead|ship it|thanks?\b)",
            )
            .unwrap(),
            confidence: 0.8,
        },
        TypePattern {
            guidance_type: GuidanceType::Direction,
            pattern: Regex::new(
                r"(?i)\b(always|never|prefer|make sure|from now on|use \S+ instead|stick (?:to|with)|convention is)\b",
            )
            .unwrap(),
            confidence: 0.75,
        },
        TypePattern {
            guidance_type: GuidanceType::TaskEnd,
            pattern: Regex::new(r"(?i)^(that's (?:all|it|everything)|we're done|done for now)\b")
                .unwrap(),
            confidence: 0.7,
        },
        TypePattern {
            guidance_type: GuidanceType::TaskStart,
            pattern: Regex::new(
                r"(?i)^(please\s+)?(implement|add|create|build|fix|refactor|write|update|let's|can you)\b",
            )
            .unwrap(),
            confidence: 0.65,
        },
    ]
});

/// Keyword -> category, first hit wins.
const CATEGORY_KEYWORDS: &[(&str, &str)] = &[
    ("test", "testing"),
    ("spec", "testing"),
    ("lint", "style"),
    ("format", "style"),
    ("type", "types"),
    ("auth", "security"),
    ("secret", "security"),
    ("token", "security"),
    ("database", "database"),
    ("migration", "database"),
    ("sql", "database"),
    ("query", "database"),
    ("perf", "performance"),
    ("slow", "performance"),
    ("config", "configuration"),
    ("env", "configuration"),
    ("api", "api"),
    ("endpoint", "api"),
    ("route", "api"),
];

fn detect_category(prompt: &str) -> Option<String> {
    let lower = prompt.to_lowercase();
    CATEGORY_KEYWORDS
        .iter()
        .find(|(keyword, _)| lower.contains(keyword))
        .map(|(_, category)| (*category).to_string())
}

/// Classify a prompt into a guidance type with a confidence score.
pub fn classify_prompt(prompt: &str) -> (GuidanceType, Option<String>, f64) {
    let trimmed = prompt.trim();
    if trimmed.is_empty() {
        return (GuidanceType::Unknown, None, 0.0);
    }

    let category = detect_category(trimmed);

    for entry in TYPE_PATTERNS.iter() {
        if entry.pattern.is_match(trimmed) {
            return (entry.guidance_type, category, entry.confidence);
        }
    }

    if trimmed.ends_with('?') {
        return (GuidanceType::Clarification, category, 0.6);
    }
    (GuidanceType::Unknown, category, 0.3)
}
