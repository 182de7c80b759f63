//! Security hooks: the bash gate and pre-edit injection.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use marvel_core::hook::{HookEvent, HookInput, HookResponse, PermissionDecision};
use marvel_packs::relevance::{select_packs, GuidanceKind, GuidanceSignal};
use marvel_packs::Injector;
use marvel_session::guidance::GuidanceType;

use crate::state::DaemonState;

use super::{is_bash_tool, is_edit_tool};

pub async fn pre_tool_use(
    state: &Arc<DaemonState>,
    input: &HookInput,
    event: HookEvent,
) -> anyhow::Result<HookResponse> {
    let tool = input.tool_name.as_deref().unwrap_or_default();

    if is_bash_tool(tool) {
        return bash_decision(state, input, event).await;
    }

    // Injection only happens on the pre-tool-use hook proper.
    if event == HookEvent::PreToolUse && is_edit_tool(tool) {
        if let Some(file_path) = input.file_path() {
            return inject_for_file(state, input, file_path).await;
        }
    }

    Ok(HookResponse::empty())
}

async fn bash_decision(
    state: &Arc<DaemonState>,
    input: &HookInput,
    event: HookEvent,
) -> anyhow::Result<HookResponse> {
    let Some(command) = input.command() else {
        return Ok(HookResponse::empty());
    };
    let session_id = input.session_id();

    // Merge commands are additionally gated on the session's verified
    // checks, before the list pipeline can allow them.
    let session_state = state.session_state(session_id).await;
    if let Some(blocked) = state
        .gate
        .merge_gate(command, &session_state.check_merge())
    {
        return Ok(HookResponse::decision(
            event,
            blocked.decision,
            Some(blocked.reason),
        ));
    }

    let decision = state.gate.evaluate(command, input.description()).await;
    debug!(
        command,
        decision = decision.decision.as_str(),
        source = ?decision.source,
        "bash gate decision"
    );

    let mut response = match decision.decision {
        // Allow responses carry no explanation.
        PermissionDecision::Allow => {
            HookResponse::decision(event, PermissionDecision::Allow, None)
        }
        other => HookResponse::decision(event, other, Some(decision.reason)),
    };

    // Commit/push get a non-blocking warning on unverified checks.
    if decision.decision == PermissionDecision::Allow {
        if let Some(warning) = state
            .gate
            .commit_warning(command, &session_state.check_pre_commit())
        {
            if let Some(output) = response.hook_specific_output.as_mut() {
                output.additional_context = Some(warning);
            }
        }
    }

    Ok(response)
}

async fn inject_for_file(
    state: &Arc<DaemonState>,
    input: &HookInput,
    file_path: &str,
) -> anyhow::Result<HookResponse> {
    let Some(init) = state.current_init().await else {
        return Ok(HookResponse::empty());
    };
    if init.packs.is_empty() {
        return Ok(HookResponse::empty());
    }

    // Recent guidance feeds correction and category signals.
    let signals: Vec<GuidanceSignal> = {
        let run = init.run.lock().await;
        run.load_guidance()
            .into_iter()
            .map(|g| GuidanceSignal {
                kind: if g.guidance_type == GuidanceType::Correction {
                    GuidanceKind::Correction
                } else {
                    GuidanceKind::Direction
                },
                category: g.category,
                timestamp: g.timestamp,
            })
            .collect()
    };

    let relative = marvel_core::command::project_relative(
        &state.paths.project_root.to_string_lossy(),
        file_path,
    );
    let selected = select_packs(init.packs.packs(), &relative, &signals, Utc::now());
    if selected.is_empty() {
        return Ok(HookResponse::empty());
    }

    let outcome = {
        let mut dedup = state.dedup.lock().await;
        Injector::format(&selected, &relative, &mut dedup)
    };
    let Some(outcome) = outcome else {
        return Ok(HookResponse::empty());
    };

    let scores: HashMap<String, u32> = selected
        .iter()
        .map(|(pack, score)| (pack.name().to_string(), score.score))
        .collect();
    init.run
        .lock()
        .await
        .record_injection(&relative, &outcome.lessons, &outcome.packs, scores);

    state
        .set_preceding_context(input.session_id(), Some(relative), None)
        .await;

    Ok(HookResponse::context(HookEvent::PreToolUse, outcome.text))
}
