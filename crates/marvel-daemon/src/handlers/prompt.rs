//! Prompt capture: classify the utterance, store what matters.

use std::sync::Arc;

use tracing::debug;

use marvel_core::hook::{HookInput, HookResponse};
use marvel_session::{classify_prompt, Guidance};

use crate::state::DaemonState;

pub async fn user_prompt_submit(
    state: &Arc<DaemonState>,
    input: &HookInput,
) -> anyhow::Result<HookResponse> {
    let Some(prompt) = input.prompt.as_deref() else {
        return Ok(HookResponse::empty());
    };

    let (guidance_type, category, confidence) = classify_prompt(prompt);
    debug!(?guidance_type, confidence, "classified prompt");

    // Only corrections and directions are stored; the rest is dropped.
    if !guidance_type.is_stored() {
        return Ok(HookResponse::empty());
    }

    let Some(init) = state.current_init().await else {
        return Ok(HookResponse::empty());
    };

    let session_id = input.session_id();
    let preceding = state.preceding_context(session_id).await;
    let preceding_packs = {
        let run = init.run.lock().await;
        run.state()
            .last_injection
            .as_ref()
            .map(|l| l.packs.clone())
            .unwrap_or_default()
    };

    let guidance = Guidance::new(
        init.run.lock().await.run_id(),
        guidance_type,
        prompt,
        category,
        confidence,
    )
    .with_context(preceding.file, preceding.tool, preceding_packs);

    init.run.lock().await.record_guidance(&guidance);
    Ok(HookResponse::empty())
}
