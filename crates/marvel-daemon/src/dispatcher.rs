//! Per-hook dispatch with the timeout regime.
//!
//! Security hooks get 35 s and fail-ask on timeout (deny would be unsafe,
//! allow would defeat the gate); everything else gets 9 s and `{}`. A
//! handler error never crosses the socket.

use std::sync::Arc;

use tracing::warn;

use marvel_core::hook::{HookEvent, HookRequest, HookResponse};

use crate::handlers;
use crate::state::DaemonState;

pub async fn dispatch(state: Arc<DaemonState>, request: HookRequest) -> HookResponse {
    let hook = request.hook;
    let budget = hook.timeout();

    let handled = tokio::time::timeout(budget, route(state, request)).await;
    match handled {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            warn!(hook = hook.name(), error = %e, "hook handler failed");
            HookResponse::empty()
        }
        Err(_) => {
            warn!(hook = hook.name(), "hook handler timed out");
            if hook.is_security() {
                HookResponse::fail_ask(hook, "security check timed out; please review manually")
            } else {
                HookResponse::empty()
            }
        }
    }
}

async fn route(state: Arc<DaemonState>, request: HookRequest) -> anyhow::Result<HookResponse> {
    let input = request.input;
    match request.hook {
        HookEvent::SessionStart => handlers::session::session_start(&state, &input).await,
        HookEvent::SessionEnd => handlers::session::session_end(&state, &input).await,
        HookEvent::UserPromptSubmit => handlers::prompt::user_prompt_submit(&state, &input).await,
        HookEvent::PreToolUse => {
            handlers::security::pre_tool_use(&state, &input, HookEvent::PreToolUse).await
        }
        HookEvent::PermissionRequest => {
            handlers::security::pre_tool_use(&state, &input, HookEvent::PermissionRequest).await
        }
        HookEvent::PostToolUse => handlers::post_tool::post_tool_use(&state, &input, None).await,
        HookEvent::PostToolUseFailure => {
            handlers::post_tool::post_tool_use(&state, &input, Some(false)).await
        }
        HookEvent::Stop => handlers::stop::stop(&state, &input).await,
        HookEvent::PreCompact => handlers::compact::pre_compact(&state, &input).await,
        HookEvent::PostCompactAgents => {
            handlers::compact::post_compact_agents(&state, &input).await
        }
        HookEvent::SubagentStart => handlers::agents::subagent_start(&state, &input).await,
        HookEvent::SubagentStop => handlers::agents::subagent_stop(&state, &input).await,
        HookEvent::TeammateIdle => handlers::agents::teammate_idle(&state, &input).await,
        HookEvent::TaskCompleted => handlers::agents::task_completed(&state, &input).await,
        HookEvent::Notification => Ok(HookResponse::empty()),
    }
}
