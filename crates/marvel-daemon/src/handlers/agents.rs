//! Subagent and teammate lifecycle hooks.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use marvel_core::fsio;
use marvel_core::hook::{HookInput, HookResponse};

use crate::state::DaemonState;

use super::summarize_value;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AgentEvaluationRecord {
    timestamp: chrono::DateTime<Utc>,
    agent_id: String,
    agent_type: String,
    status: String,
    summary: String,
}

fn extra_str<'a>(input: &'a HookInput, key: &str) -> Option<&'a str> {
    input.extra.get(key).and_then(|v| v.as_str())
}

pub async fn subagent_start(
    state: &Arc<DaemonState>,
    input: &HookInput,
) -> anyhow::Result<HookResponse> {
    let Some(agent_id) = input.agent_id.as_deref() else {
        return Ok(HookResponse::empty());
    };
    let agent_type = input.agent_type.as_deref().unwrap_or("unknown");
    state
        .registry
        .register(input.session_id(), agent_id, agent_type)
        .await;
    Ok(HookResponse::empty())
}

pub async fn subagent_stop(
    state: &Arc<DaemonState>,
    input: &HookInput,
) -> anyhow::Result<HookResponse> {
    let Some(agent_id) = input.agent_id.as_deref() else {
        return Ok(HookResponse::empty());
    };
    let session_id = input.session_id();

    let error = extra_str(input, "error");
    let summary = extra_str(input, "result_summary")
        .map(str::to_string)
        .unwrap_or_else(|| summarize_value(input.tool_output.as_ref(), 200));
    let transcript = extra_str(input, "transcript_path").map(str::to_string);

    let status = match error {
        Some(message) => {
            state.registry.error(session_id, agent_id, message).await;
            "errored"
        }
        None => {
            state
                .registry
                .complete(session_id, agent_id, transcript, Some(summary.clone()))
                .await;
            "completed"
        }
    };

    fsio::append_jsonl_best_effort(
        &state.paths.security_dir().join("agent-evaluations.jsonl"),
        &AgentEvaluationRecord {
            timestamp: Utc::now(),
            agent_id: agent_id.to_string(),
            agent_type: input.agent_type.clone().unwrap_or_else(|| "unknown".to_string()),
            status: status.to_string(),
            summary: error.map(str::to_string).unwrap_or(summary),
        },
    );

    Ok(HookResponse::empty())
}

pub async fn teammate_idle(
    state: &Arc<DaemonState>,
    input: &HookInput,
) -> anyhow::Result<HookResponse> {
    let Some(name) = extra_str(input, "teammate_name") else {
        return Ok(HookResponse::empty());
    };
    let team = extra_str(input, "team").unwrap_or("default");
    state
        .registry
        .track_teammate(input.session_id(), name, team)
        .await;
    Ok(HookResponse::empty())
}

pub async fn task_completed(
    state: &Arc<DaemonState>,
    input: &HookInput,
) -> anyhow::Result<HookResponse> {
    let Some(agent_id) = input.agent_id.as_deref() else {
        return Ok(HookResponse::empty());
    };
    let summary = extra_str(input, "result_summary").map(str::to_string);
    state
        .registry
        .complete(input.session_id(), agent_id, None, summary)
        .await;
    Ok(HookResponse::empty())
}
