//! Evaluator transport tests against a scripted subprocess.
//!
//! The fake evaluator is a bash script speaking the newline-JSON protocol
//! over the loopback transport the daemon binds for it.

#![cfg(unix)]

use marvel_core::hook::PermissionDecision;
use marvel_security::{CommandEvaluator, EvaluatorConfig, EvaluatorError, EvaluatorSession};

/// A well-behaved evaluator: hello, then one result per request.
const SCRIPTED_LOOP: &str = r#"
host="${1%:*}"; port="${1##*:}"
exec 3<>"/dev/tcp/$host/$port"
printf '%s\n' '{"type":"hello","session_id":"fake-1"}' >&3
while read -r request <&3; do
  printf '%s\n' '{"type":"result","decision":"allow","reasoning":"scripted","confidence":0.9,"suggested_rule":{"type":"prefix","pattern":"gh pr","reason":"read-only"},"cost_usd":0.01}' >&3
done
"#;

/// Requests a write tool first; reports deny when the transport denied it.
const TOOL_PROBING: &str = r#"
host="${1%:*}"; port="${1##*:}"
exec 3<>"/dev/tcp/$host/$port"
printf '%s\n' '{"type":"hello","session_id":"fake-2"}' >&3
read -r request <&3
printf '%s\n' '{"type":"tool_request","tool":"write","id":1}' >&3
read -r reply <&3
case "$reply" in
  *tool_denied*) decision="deny";;
  *) decision="allow";;
esac
printf '{"type":"result","decision":"%s","reasoning":"probe","confidence":0.95,"cost_usd":0.01}\n' "$decision" >&3
"#;

/// Each result costs 30 cents.
const EXPENSIVE: &str = r#"
host="${1%:*}"; port="${1##*:}"
exec 3<>"/dev/tcp/$host/$port"
printf '%s\n' '{"type":"hello","session_id":"fake-3"}' >&3
while read -r request <&3; do
  printf '%s\n' '{"type":"result","decision":"ask","reasoning":"pricey","confidence":0.5,"cost_usd":0.30}' >&3
done
"#;

fn config(script: &str) -> EvaluatorConfig {
    EvaluatorConfig {
        enabled: true,
        program: vec!["bash".to_string(), "-c".to_string(), script.to_string()],
        model: None,
        cost_cap_usd: 0.50,
        idle_timeout_secs: 300,
        deny_confidence_threshold: 0.7,
    }
}

#[tokio::test]
async fn one_subprocess_serves_many_requests() {
    let session = EvaluatorSession::new(config(SCRIPTED_LOOP));

    let first = session.evaluate("gh pr list", None).await.unwrap();
    assert_eq!(first.decision, PermissionDecision::Allow);
    assert_eq!(first.reason, "scripted");
    let suggested = first.suggested_rule.expect("suggested rule");
    assert_eq!(suggested.pattern, "gh pr");

    // A different command reuses the same live session.
    let second = session.evaluate("gh issue list", None).await.unwrap();
    assert_eq!(second.decision, PermissionDecision::Allow);

    // The same command is served from the result cache.
    let cached = session.evaluate("gh pr list", None).await.unwrap();
    assert_eq!(cached.decision, PermissionDecision::Allow);

    session.shutdown().await;
}

#[tokio::test]
async fn write_tools_are_denied_by_the_transport() {
    let session = EvaluatorSession::new(config(TOOL_PROBING));

    // The script answers deny only if its write tool was refused.
    let verdict = session.evaluate("terraform apply", None).await.unwrap();
    assert_eq!(verdict.decision, PermissionDecision::Deny);
    assert_eq!(verdict.reason, "probe");

    session.shutdown().await;
}

#[tokio::test]
async fn cost_cap_short_circuits_after_accumulation() {
    let session = EvaluatorSession::new(config(EXPENSIVE));

    assert!(session.evaluate("cmd one", None).await.is_ok());
    assert!(session.evaluate("cmd two", None).await.is_ok());

    // 0.60 accumulated against a 0.50 cap: hard stop.
    let capped = session.evaluate("cmd three", None).await;
    assert!(matches!(capped, Err(EvaluatorError::CostCapExceeded)));

    session.shutdown().await;
}

#[tokio::test]
async fn missing_program_is_a_spawn_error() {
    let session = EvaluatorSession::new(EvaluatorConfig {
        program: vec!["definitely-not-a-real-binary-mhd".to_string()],
        ..config("")
    });

    let result = session.evaluate("ls", None).await;
    assert!(matches!(result, Err(EvaluatorError::Spawn(_))));
}
