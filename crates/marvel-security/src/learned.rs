//! Learned rules: patterns inferred from approvals.
//!
//! Session-local rules are checked before persistent ones. A pattern is
//! only learned when it passes the safety check; anything that would
//! widen the blast radius (dangerous base commands, bare subcommand
//! tools, destructive version-control subcommands) is refused.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use marvel_core::command::{
    meaningful_command, parse_segment, project_relative, ParsedCommand,
};
use marvel_core::fsio;

use crate::rules::RuleType;

/// Base commands that are never learned, regardless of pattern.
const ALWAYS_DANGEROUS: &[&str] = &[
    "sudo", "doas", "su", "rm", "dd", "mkfs", "shred", "eval", "reboot", "shutdown", "halt",
    "kill", "pkill", "chown",
];

/// Tools whose bare name says nothing about what will run.
const REQUIRE_SUBCOMMAND: &[&str] = &[
    "git", "gh", "glab", "svn", "hg", "docker", "podman", "kubectl", "helm", "npm", "pnpm",
    "yarn", "bun", "pip", "pip3", "uv", "cargo", "go", "poetry", "gem", "brew", "apt",
    "apt-get",
];

/// Version-control subcommands that can destroy work; never learned.
const VCS_DESTRUCTIVE: &[&str] = &[
    "git push", "git reset", "git clean", "git checkout", "git restore", "git stash",
    "git branch", "git filter-branch", "git update-ref",
];

/// `<exe> <flag>` pairs where the flag introduces inline code.
const FLAG_SUBCOMMANDS: &[(&str, &[&str])] = &[
    ("node", &["-e", "--eval"]),
    ("python", &["-c", "-m"]),
    ("python3", &["-c", "-m"]),
    ("ruby", &["-e"]),
    ("perl", &["-e"]),
];

static VAR_ASSIGNMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*=").unwrap());

/// Regex metacharacters disqualify a stored learned rule at match time.
static REGEX_META: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\\.+*?()|\[\]{}^$]").unwrap());

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnedRule {
    pub id: String,
    #[serde(rename = "type")]
    pub rule_type: RuleType,
    pub pattern: String,
    pub reason: String,
    #[serde(rename = "learnedAt")]
    pub learned_at: DateTime<Utc>,
    #[serde(rename = "approvedCommand")]
    pub approved_command: String,
    #[serde(rename = "sessionId")]
    pub session_id: String,
}

impl LearnedRule {
    /// Literal matching only: stored patterns containing regex
    /// metacharacters are ignored, and regex-typed rules degrade to
    /// substring matches.
    fn matches(&self, command: &str) -> bool {
        match self.rule_type {
            RuleType::Prefix => {
                command == self.pattern
                    || command.starts_with(&format!("{} ", self.pattern))
            }
            RuleType::Contains => command.contains(&self.pattern),
            RuleType::Regex => {
                if REGEX_META.is_match(&self.pattern) {
                    return false;
                }
                command.contains(&self.pattern)
            }
        }
    }
}

/// Why a candidate pattern was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafetyRefusal {
    DangerousBase(String),
    TooShort,
    BareSubcommandTool(String),
    DestructiveVcs(String),
    VariableAssignment,
}

impl std::fmt::Display for SafetyRefusal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DangerousBase(base) => write!(f, "base command '{base}' is never auto-allowed"),
            Self::TooShort => write!(f, "pattern is too short to be specific"),
            Self::BareSubcommandTool(base) => {
                write!(f, "'{base}' needs a subcommand to be a meaningful pattern")
            }
            Self::DestructiveVcs(prefix) => {
                write!(f, "'{prefix}' can destroy work and is never auto-allowed")
            }
            Self::VariableAssignment => write!(f, "a bare assignment is not a reusable pattern"),
        }
    }
}

/// All checks must pass before a pattern becomes a learned rule.
pub fn check_pattern_safety(pattern: &str) -> Result<(), SafetyRefusal> {
    let trimmed = pattern.trim();
    let parsed = parse_segment(trimmed);

    if VAR_ASSIGNMENT.is_match(&parsed.executable) {
        return Err(SafetyRefusal::VariableAssignment);
    }
    if ALWAYS_DANGEROUS.contains(&parsed.executable.as_str())
        || parsed.executable.starts_with("mkfs.")
    {
        return Err(SafetyRefusal::DangerousBase(parsed.executable));
    }
    if trimmed.len() < 5 {
        return Err(SafetyRefusal::TooShort);
    }
    if parsed.args.is_empty() && REQUIRE_SUBCOMMAND.contains(&parsed.executable.as_str()) {
        return Err(SafetyRefusal::BareSubcommandTool(parsed.executable));
    }
    for destructive in VCS_DESTRUCTIVE {
        if trimmed == *destructive || trimmed.starts_with(&format!("{destructive} ")) {
            return Err(SafetyRefusal::DestructiveVcs((*destructive).to_string()));
        }
    }
    Ok(())
}

/// Extract a candidate pattern from an approved command.
pub fn extract_pattern(command: &str, project_root: &str) -> Option<String> {
    let meaningful = meaningful_command(command)?;
    let parsed: ParsedCommand = parse_segment(&meaningful);
    if parsed.executable.is_empty() {
        return None;
    }

    if let Some(first) = parsed.args.first() {
        for (exe, flags) in FLAG_SUBCOMMANDS {
            if parsed.executable == *exe && flags.contains(&first.as_str()) {
                return Some(format!("{} {}", parsed.executable, first));
            }
        }

        if REQUIRE_SUBCOMMAND.contains(&parsed.executable.as_str())
            && !first.starts_with('-')
        {
            return Some(format!("{} {}", parsed.executable, first));
        }

        let rewritten = project_relative(project_root, first);
        if rewritten.contains('/') {
            if let Some(first_dir) = rewritten.split('/').next() {
                if !first_dir.is_empty() {
                    return Some(format!("{} {}/", parsed.executable, first_dir));
                }
            }
        }
    }

    Some(parsed.executable)
}

/// Session-local plus persistent learned rules.
///
/// The persistent file is read lazily once per process; writes append.
#[derive(Debug)]
pub struct LearnedRuleStore {
    path: PathBuf,
    session_rules: Vec<LearnedRule>,
    persistent_rules: Vec<LearnedRule>,
    loaded: bool,
}

impl LearnedRuleStore {
    pub fn new(security_dir: &Path) -> Self {
        Self {
            path: security_dir.join("learned.jsonl"),
            session_rules: Vec::new(),
            persistent_rules: Vec::new(),
            loaded: false,
        }
    }

    fn ensure_loaded(&mut self) {
        if self.loaded {
            return;
        }
        self.persistent_rules = fsio::read_jsonl(&self.path);
        self.loaded = true;
        debug!(
            count = self.persistent_rules.len(),
            path = %self.path.display(),
            "loaded persistent learned rules"
        );
    }

    /// Check the raw command and its meaningful segment, session-local
    /// rules first.
    pub fn find_match(&mut self, command: &str) -> Option<LearnedRule> {
        self.ensure_loaded();
        let trimmed = command.trim();
        let meaningful = meaningful_command(trimmed);

        for rule in self.session_rules.iter().chain(&self.persistent_rules) {
            if rule.matches(trimmed) {
                return Some(rule.clone());
            }
            if let Some(m) = &meaningful {
                if m != trimmed && rule.matches(m) {
                    return Some(rule.clone());
                }
            }
        }
        None
    }

    /// Learn a pattern after the safety check. Returns the stored rule.
    pub fn learn(
        &mut self,
        pattern: &str,
        rule_type: RuleType,
        reason: &str,
        approved_command: &str,
        session_id: &str,
    ) -> Result<LearnedRule, SafetyRefusal> {
        check_pattern_safety(pattern)?;
        self.ensure_loaded();

        let rule = LearnedRule {
            id: format!("learned-{}", Utc::now().timestamp_millis()),
            rule_type,
            pattern: pattern.trim().to_string(),
            reason: marvel_core::redact(reason),
            learned_at: Utc::now(),
            approved_command: marvel_core::redact(approved_command),
            session_id: session_id.to_string(),
        };

        if let Err(e) = fsio::append_jsonl(&self.path, &rule) {
            warn!(path = %self.path.display(), error = %e, "failed to persist learned rule");
        }
        self.session_rules.push(rule.clone());
        Ok(rule)
    }

    pub fn session_rule_count(&self) -> usize {
        self.session_rules.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, LearnedRuleStore) {
        let dir = tempdir().unwrap();
        let store = LearnedRuleStore::new(dir.path());
        (dir, store)
    }

    #[test]
    fn extraction_prefers_flag_subcommands() {
        assert_eq!(
            extract_pattern("python -c 'print(1)'", "/proj"),
            Some("python -c".to_string())
        );
        assert_eq!(
            extract_pattern("node --eval 'x'", "/proj"),
            Some("node --eval".to_string())
        );
    }

    #[test]
    fn extraction_uses_subcommand_for_known_tools() {
        assert_eq!(
            extract_pattern("gh pr list --state open", "/proj"),
            Some("gh pr".to_string())
        );
        assert_eq!(
            extract_pattern("cargo build --release", "/proj"),
            Some("cargo build".to_string())
        );
    }

    #[test]
    fn extraction_isolates_first_path_component() {
        assert_eq!(
            extract_pattern("tail /proj/logs/app.log", "/proj"),
            Some("tail logs/".to_string())
        );
        assert_eq!(
            extract_pattern("wc -l", "/proj"),
            Some("wc".to_string())
        );
    }

    #[test]
    fn extraction_skips_preamble() {
        assert_eq!(
            extract_pattern("cd /proj && gh pr view 42", "/proj"),
            Some("gh pr".to_string())
        );
    }

    #[test]
    fn safety_refuses_dangerous_bases() {
        assert!(matches!(
            check_pattern_safety("sudo apt"),
            Err(SafetyRefusal::DangerousBase(_))
        ));
        assert!(matches!(
            check_pattern_safety("rm backend/"),
            Err(SafetyRefusal::DangerousBase(_))
        ));
        assert!(matches!(
            check_pattern_safety("mkfs.ext4 /dev/sda"),
            Err(SafetyRefusal::DangerousBase(_))
        ));
    }

    #[test]
    fn safety_refuses_short_and_bare_patterns() {
        assert_eq!(check_pattern_safety("ls"), Err(SafetyRefusal::TooShort));
        assert!(matches!(
            check_pattern_safety("cargo"),
            Err(SafetyRefusal::BareSubcommandTool(_))
        ));
        assert_eq!(
            check_pattern_safety("FOO=bar"),
            Err(SafetyRefusal::VariableAssignment)
        );
    }

    #[test]
    fn safety_refuses_destructive_vcs_subcommands() {
        for pattern in [
            "git push",
            "git reset --hard",
            "git clean",
            "git checkout",
            "git stash drop",
            "git branch -D",
        ] {
            assert!(
                matches!(
                    check_pattern_safety(pattern),
                    Err(SafetyRefusal::DestructiveVcs(_))
                ),
                "{pattern} should be refused"
            );
        }
        assert!(check_pattern_safety("git fetch").is_ok());
        assert!(check_pattern_safety("gh pr").is_ok());
    }

    #[test]
    fn learn_then_match_round_trip() {
        let (_dir, mut store) = store();
        store
            .learn("gh pr", RuleType::Prefix, "read-only", "gh pr list", "s1")
            .unwrap();

        assert!(store.find_match("gh pr view 42").is_some());
        assert!(store.find_match("gh repo delete").is_none());
    }

    #[test]
    fn learned_rules_persist_across_stores() {
        let dir = tempdir().unwrap();
        {
            let mut store = LearnedRuleStore::new(dir.path());
            store
                .learn("npm test", RuleType::Prefix, "tests", "npm test", "s1")
                .unwrap();
        }
        let mut fresh = LearnedRuleStore::new(dir.path());
        assert!(fresh.find_match("npm test -- --watch=false").is_some());
    }

    #[test]
    fn meaningful_segment_of_compound_is_matched() {
        let (_dir, mut store) = store();
        store
            .learn("npm test", RuleType::Prefix, "tests", "npm test", "s1")
            .unwrap();
        assert!(store.find_match("cd web && npm test").is_some());
    }

    #[test]
    fn stored_regex_with_metacharacters_is_ignored() {
        let (_dir, mut store) = store();
        // Simulate a tampered learned-rules file entry.
        store.session_rules.push(LearnedRule {
            id: "tampered".into(),
            rule_type: RuleType::Regex,
            pattern: ".*".into(),
            reason: "broad".into(),
            learned_at: Utc::now(),
            approved_command: "x".into(),
            session_id: "s1".into(),
        });
        assert!(store.find_match("rm -rf /tmp/anything").is_none());

        // A literal regex pattern degrades to substring matching.
        store.session_rules.push(LearnedRule {
            id: "literal".into(),
            rule_type: RuleType::Regex,
            pattern: "npm run lint".into(),
            reason: "lint".into(),
            learned_at: Utc::now(),
            approved_command: "npm run lint".into(),
            session_id: "s1".into(),
        });
        assert!(store.find_match("npm run lint --fix").is_some());
    }
}
