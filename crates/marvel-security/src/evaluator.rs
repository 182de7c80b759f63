//! External LLM evaluator adapter.
//!
//! Holds one long-lived evaluator subprocess per daemon, reached over a
//! loopback stream transport, so consecutive evaluations share the
//! subprocess's prompt cache. All calls are serialized through a single
//! lock; a small TTL cache absorbs the near-simultaneous hook pair that
//! fires for the same command.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use marvel_core::command::normalize_whitespace;
use marvel_core::hook::PermissionDecision;

use crate::rules::RuleType;

/// Environment flag set for the subprocess; the recursion guard checks it.
pub const RECURSION_FLAG: &str = "MARVEL_EVALUATOR";
/// Project-directory variable cleared from the subprocess environment.
pub const PROJECT_DIR_VAR: &str = "MARVEL_PROJECT_DIR";

const RESULT_CACHE_TTL: Duration = Duration::from_secs(60 * 60);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const RESULT_TIMEOUT: Duration = Duration::from_secs(30);
const RESUME_REJECT_WINDOW: Duration = Duration::from_secs(2);

/// File tools the subprocess may use; everything else is denied.
const READ_ONLY_TOOLS: &[&str] = &["read", "search", "glob", "grep"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuggestedRule {
    #[serde(rename = "type")]
    pub rule_type: RuleType,
    pub pattern: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvaluatorVerdict {
    pub decision: PermissionDecision,
    pub reason: String,
    pub suggested_rule: Option<SuggestedRule>,
}

#[derive(Debug, Error)]
pub enum EvaluatorError {
    #[error("evaluator is disabled")]
    Disabled,
    #[error("evaluator session cost cap reached")]
    CostCapExceeded,
    #[error("failed to spawn evaluator: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("evaluator handshake failed: {0}")]
    Handshake(String),
    #[error("evaluator timed out")]
    Timeout,
    #[error("evaluator protocol error: {0}")]
    Protocol(String),
    #[error("evaluator subprocess exited")]
    ChildExited,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EvaluatorConfig {
    pub enabled: bool,
    /// argv of the evaluator subprocess; the transport address is appended.
    pub program: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub cost_cap_usd: f64,
    pub idle_timeout_secs: u64,
    pub deny_confidence_threshold: f64,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            program: vec!["marvel-evaluator".to_string()],
            model: None,
            cost_cap_usd: 0.50,
            idle_timeout_secs: 300,
            deny_confidence_threshold: 0.7,
        }
    }
}

/// Structured output returned by the subprocess for one evaluation.
#[derive(Debug, Deserialize)]
struct RawVerdict {
    decision: String,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    #[allow(dead_code)]
    investigated: Vec<String>,
    #[serde(default)]
    suggested_rule: Option<SuggestedRule>,
    #[serde(default)]
    cost_usd: f64,
    #[serde(default)]
    session_id: Option<String>,
}

/// Validate the raw shape and convert low-confidence denies to ask.
fn validate_verdict(
    raw: RawVerdict,
    deny_confidence_threshold: f64,
) -> Result<(EvaluatorVerdict, f64, Option<String>), EvaluatorError> {
    let mut decision = match raw.decision.as_str() {
        "allow" => PermissionDecision::Allow,
        "deny" => PermissionDecision::Deny,
        "ask" => PermissionDecision::Ask,
        other => {
            return Err(EvaluatorError::Protocol(format!(
                "unknown decision '{other}'"
            )))
        }
    };
    if !(0.0..=1.0).contains(&raw.confidence) {
        return Err(EvaluatorError::Protocol(format!(
            "confidence {} out of range",
            raw.confidence
        )));
    }
    if decision == PermissionDecision::Deny && raw.confidence < deny_confidence_threshold {
        decision = PermissionDecision::Ask;
    }
    Ok((
        EvaluatorVerdict {
            decision,
            reason: raw.reasoning,
            suggested_rule: raw.suggested_rule,
        },
        raw.cost_usd,
        raw.session_id,
    ))
}

struct ActiveSession {
    child: Child,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    spawned_at: Instant,
    resumed: bool,
}

#[derive(Default)]
struct Inner {
    session: Option<ActiveSession>,
    cache: HashMap<String, (EvaluatorVerdict, Instant)>,
    cumulative_cost: f64,
    last_used: Option<Instant>,
    last_session_id: Option<String>,
}

/// The seam the bash gate evaluates commands through.
#[async_trait::async_trait]
pub trait CommandEvaluator: Send + Sync {
    async fn evaluate(
        &self,
        command: &str,
        description: Option<&str>,
    ) -> Result<EvaluatorVerdict, EvaluatorError>;

    /// Best-effort session pre-warm; the default does nothing.
    async fn warmup(&self) {}

    async fn shutdown(&self);
}

pub struct EvaluatorSession {
    config: EvaluatorConfig,
    inner: Arc<Mutex<Inner>>,
    scratch_dir: PathBuf,
}

impl EvaluatorSession {
    pub fn new(config: EvaluatorConfig) -> Self {
        Self {
            config,
            inner: Arc::new(Mutex::new(Inner::default())),
            scratch_dir: std::env::temp_dir(),
        }
    }

    async fn start_session(&self, inner: &mut Inner) -> Result<(), EvaluatorError> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let mut argv = self.config.program.clone();
        let program = argv
            .first()
            .cloned()
            .ok_or_else(|| EvaluatorError::Protocol("empty evaluator program".to_string()))?;
        argv.remove(0);

        let resumed = inner.last_session_id.is_some();
        let mut command = Command::new(&program);
        command
            .args(&argv)
            .arg("--connect")
            .arg(addr.to_string())
            // The subprocess must not resolve the project and re-enter
            // the hook pipeline.
            .current_dir(&self.scratch_dir)
            .env_remove(PROJECT_DIR_VAR)
            .env(RECURSION_FLAG, "1")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(model) = &self.config.model {
            command.arg("--model").arg(model);
        }
        if let Some(session_id) = &inner.last_session_id {
            command.arg("--resume").arg(session_id);
        }

        let child = command.spawn()?;
        info!(program = %program, resumed, "spawned evaluator subprocess");

        let (stream, _) = tokio::time::timeout(HANDSHAKE_TIMEOUT, listener.accept())
            .await
            .map_err(|_| EvaluatorError::Handshake("subprocess never connected".to_string()))??;
        let (read_half, writer) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let mut line = String::new();
        tokio::time::timeout(HANDSHAKE_TIMEOUT, reader.read_line(&mut line))
            .await
            .map_err(|_| EvaluatorError::Handshake("no hello before timeout".to_string()))??;
        let hello: serde_json::Value = serde_json::from_str(line.trim())
            .map_err(|e| EvaluatorError::Handshake(format!("bad hello: {e}")))?;
        if hello.get("type").and_then(|t| t.as_str()) != Some("hello") {
            return Err(EvaluatorError::Handshake("first message was not hello".to_string()));
        }
        if let Some(session_id) = hello.get("session_id").and_then(|s| s.as_str()) {
            inner.last_session_id = Some(session_id.to_string());
        }

        inner.session = Some(ActiveSession {
            child,
            reader,
            writer,
            spawned_at: Instant::now(),
            resumed,
        });
        Ok(())
    }

    async fn teardown_session(inner: &mut Inner) {
        if let Some(mut session) = inner.session.take() {
            let _ = session.child.start_kill();
            let _ = session.child.wait().await;
            debug!("evaluator session torn down");
        }
    }

    /// Send one evaluate request and read lines until a result arrives,
    /// denying any non-read-only tool request on the way.
    async fn round_trip(
        session: &mut ActiveSession,
        request: &serde_json::Value,
    ) -> Result<RawVerdict, EvaluatorError> {
        let mut line = serde_json::to_string(request)
            .map_err(|e| EvaluatorError::Protocol(e.to_string()))?;
        line.push('\n');
        session.writer.write_all(line.as_bytes()).await?;
        session.writer.flush().await?;

        let deadline = Instant::now() + RESULT_TIMEOUT;
        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or(EvaluatorError::Timeout)?;

            let mut buf = String::new();
            let read = tokio::time::timeout(remaining, session.reader.read_line(&mut buf))
                .await
                .map_err(|_| EvaluatorError::Timeout)??;
            if read == 0 {
                return Err(EvaluatorError::ChildExited);
            }

            let message: serde_json::Value = serde_json::from_str(buf.trim())
                .map_err(|e| EvaluatorError::Protocol(format!("bad message: {e}")))?;
            match message.get("type").and_then(|t| t.as_str()) {
                Some("result") => {
                    return serde_json::from_value(message)
                        .map_err(|e| EvaluatorError::Protocol(format!("bad result: {e}")));
                }
                Some("tool_request") => {
                    let tool = message
                        .get("tool")
                        .and_then(|t| t.as_str())
                        .unwrap_or("unknown");
                    let allowed = READ_ONLY_TOOLS.contains(&tool.to_lowercase().as_str());
                    if !allowed {
                        warn!(tool, "evaluator requested a non-read-only tool, denied");
                    }
                    let reply = serde_json::json!({
                        "type": if allowed { "tool_allowed" } else { "tool_denied" },
                        "id": message.get("id").cloned().unwrap_or(serde_json::Value::Null),
                    });
                    let mut reply_line = reply.to_string();
                    reply_line.push('\n');
                    session.writer.write_all(reply_line.as_bytes()).await?;
                    session.writer.flush().await?;
                }
                _ => {
                    debug!("ignoring unexpected evaluator message");
                }
            }
        }
    }

    /// Background task that closes the session after the idle interval.
    pub fn spawn_idle_watchdog(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let session = Arc::clone(self);
        let idle = Duration::from_secs(session.config.idle_timeout_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(idle / 2);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let mut inner = session.inner.lock().await;
                let idle_for = inner.last_used.map(|t| t.elapsed());
                if inner.session.is_some() && idle_for.is_some_and(|d| d > idle) {
                    info!("closing idle evaluator session");
                    Self::teardown_session(&mut inner).await;
                }
            }
        })
    }
}

#[async_trait::async_trait]
impl CommandEvaluator for EvaluatorSession {
    async fn evaluate(
        &self,
        command: &str,
        description: Option<&str>,
    ) -> Result<EvaluatorVerdict, EvaluatorError> {
        if !self.config.enabled {
            return Err(EvaluatorError::Disabled);
        }

        // Single-writer lock: serializes lazy init, the subprocess
        // conversation, and cost accounting.
        let mut inner = self.inner.lock().await;

        let cache_key = normalize_whitespace(command);
        if let Some((verdict, at)) = inner.cache.get(&cache_key) {
            if at.elapsed() < RESULT_CACHE_TTL {
                debug!(command = %cache_key, "evaluator cache hit");
                return Ok(verdict.clone());
            }
        }

        if inner.cumulative_cost >= self.config.cost_cap_usd {
            Self::teardown_session(&mut inner).await;
            return Err(EvaluatorError::CostCapExceeded);
        }

        if inner.session.is_none() {
            self.start_session(&mut inner).await?;
        }

        let request = serde_json::json!({
            "type": "evaluate",
            "command": command,
            "description": description,
        });

        let result = match inner.session.as_mut() {
            Some(session) => Self::round_trip(session, &request).await,
            None => Err(EvaluatorError::ChildExited),
        };

        let raw = match result {
            Ok(raw) => raw,
            Err(EvaluatorError::ChildExited) => {
                // A resumed subprocess that dies right away rejected the
                // resume; clear the identifier and start fresh once.
                let rejected_resume = inner
                    .session
                    .as_ref()
                    .is_some_and(|s| s.resumed && s.spawned_at.elapsed() < RESUME_REJECT_WINDOW);
                Self::teardown_session(&mut inner).await;
                if !rejected_resume {
                    return Err(EvaluatorError::ChildExited);
                }
                info!("evaluator rejected resume, starting a fresh session");
                inner.last_session_id = None;
                self.start_session(&mut inner).await?;
                match inner.session.as_mut() {
                    Some(session) => Self::round_trip(session, &request).await?,
                    None => return Err(EvaluatorError::ChildExited),
                }
            }
            Err(e) => {
                Self::teardown_session(&mut inner).await;
                return Err(e);
            }
        };

        let (verdict, cost, session_id) =
            validate_verdict(raw, self.config.deny_confidence_threshold)?;
        inner.cumulative_cost += cost;
        inner.last_used = Some(Instant::now());
        if let Some(session_id) = session_id {
            inner.last_session_id = Some(session_id);
        }
        inner.cache.insert(cache_key, (verdict.clone(), Instant::now()));
        Ok(verdict)
    }

    async fn warmup(&self) {
        if !self.config.enabled {
            return;
        }
        let mut inner = self.inner.lock().await;
        if inner.session.is_some() || inner.cumulative_cost >= self.config.cost_cap_usd {
            return;
        }
        if let Err(e) = self.start_session(&mut inner).await {
            warn!(error = %e, "evaluator pre-warm failed");
        }
    }

    async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        Self::teardown_session(&mut inner).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(decision: &str, confidence: f64) -> RawVerdict {
        RawVerdict {
            decision: decision.to_string(),
            reasoning: "because".to_string(),
            confidence,
            investigated: vec![],
            suggested_rule: None,
            cost_usd: 0.01,
            session_id: None,
        }
    }

    #[test]
    fn low_confidence_deny_becomes_ask() {
        let (verdict, _, _) = validate_verdict(raw("deny", 0.5), 0.7).unwrap();
        assert_eq!(verdict.decision, PermissionDecision::Ask);

        let (verdict, _, _) = validate_verdict(raw("deny", 0.9), 0.7).unwrap();
        assert_eq!(verdict.decision, PermissionDecision::Deny);
    }

    #[test]
    fn allow_keeps_confidence_untouched() {
        let (verdict, cost, _) = validate_verdict(raw("allow", 0.2), 0.7).unwrap();
        assert_eq!(verdict.decision, PermissionDecision::Allow);
        assert!((cost - 0.01).abs() < f64::EPSILON);
    }

    #[test]
    fn unknown_decision_is_a_protocol_error() {
        assert!(matches!(
            validate_verdict(raw("maybe", 0.5), 0.7),
            Err(EvaluatorError::Protocol(_))
        ));
    }

    #[test]
    fn out_of_range_confidence_is_rejected() {
        assert!(matches!(
            validate_verdict(raw("allow", 1.5), 0.7),
            Err(EvaluatorError::Protocol(_))
        ));
    }

    #[test]
    fn suggested_rule_wire_shape() {
        let parsed: SuggestedRule = serde_json::from_str(
            r#"{"type":"prefix","pattern":"gh pr","reason":"read-only"}"#,
        )
        .unwrap();
        assert_eq!(parsed.rule_type, RuleType::Prefix);
        assert_eq!(parsed.pattern, "gh pr");
    }

    #[tokio::test]
    async fn disabled_evaluator_short_circuits() {
        let session = EvaluatorSession::new(EvaluatorConfig {
            enabled: false,
            ..Default::default()
        });
        assert!(matches!(
            session.evaluate("ls", None).await,
            Err(EvaluatorError::Disabled)
        ));
    }

    #[tokio::test]
    async fn cost_cap_short_circuits_before_spawn() {
        let session = EvaluatorSession::new(EvaluatorConfig::default());
        session.inner.lock().await.cumulative_cost = 1.0;
        assert!(matches!(
            session.evaluate("ls", None).await,
            Err(EvaluatorError::CostCapExceeded)
        ));
    }

    #[tokio::test]
    async fn cache_hit_skips_the_subprocess() {
        let session = EvaluatorSession::new(EvaluatorConfig::default());
        let verdict = EvaluatorVerdict {
            decision: PermissionDecision::Allow,
            reason: "cached".to_string(),
            suggested_rule: None,
        };
        session
            .inner
            .lock()
            .await
            .cache
            .insert("gh pr list".to_string(), (verdict.clone(), Instant::now()));

        // Whitespace differences share the cache entry.
        let result = session.evaluate("gh  pr   list", None).await.unwrap();
        assert_eq!(result, verdict);
    }
}
