//! Compaction handoff: snapshot before, recover context after.

use std::sync::Arc;

use marvel_core::hook::{HookEvent, HookInput, HookResponse};

use crate::state::DaemonState;

pub async fn pre_compact(
    state: &Arc<DaemonState>,
    input: &HookInput,
) -> anyhow::Result<HookResponse> {
    let session_id = input.session_id();

    if let Some(init) = state.current_init().await {
        init.run.lock().await.snapshot();
    }

    state
        .registry
        .serialize_session(session_id, &state.paths.compaction_handoff_path(session_id))
        .await;

    // Compaction wipes what the model has seen; re-injection is fair
    // game afterward.
    state.dedup.lock().await.clear();

    Ok(HookResponse::empty())
}

pub async fn post_compact_agents(
    state: &Arc<DaemonState>,
    input: &HookInput,
) -> anyhow::Result<HookResponse> {
    let session_id = input.session_id();
    let handoff = state.paths.compaction_handoff_path(session_id);

    match state
        .registry
        .post_compaction_summary(session_id, &handoff)
        .await
    {
        Some(summary) => Ok(HookResponse::context(
            HookEvent::PostCompactAgents,
            summary,
        )),
        None => Ok(HookResponse::empty()),
    }
}
