//! End of turn: correlate outcomes and reflect.

use std::sync::Arc;

use chrono::Utc;

use marvel_core::hook::{HookInput, HookResponse};
use marvel_session::outcome::{apply_outcomes, correlate_outcomes, journal_outcomes};

use crate::state::DaemonState;

pub async fn stop(
    state: &Arc<DaemonState>,
    _input: &HookInput,
) -> anyhow::Result<HookResponse> {
    let Some(init) = state.current_init().await else {
        return Ok(HookResponse::empty());
    };

    let (injections, guidance, tool_calls, correction_count, run_dir) = {
        let run = init.run.lock().await;
        (
            run.load_injections(),
            run.load_guidance(),
            run.load_tool_calls(),
            run.state().correction_count,
            run.dir().to_path_buf(),
        )
    };

    if !injections.is_empty() {
        let outcomes = correlate_outcomes(&injections, &guidance, &tool_calls, init.packs.packs());
        if !outcomes.is_empty() {
            journal_outcomes(&run_dir, &outcomes);
            apply_outcomes(init.packs.packs(), &outcomes, Utc::now());
        }
    }

    state.gate.metrics_snapshot().await.persist(&run_dir);

    if correction_count > 0 {
        let packs: Vec<String> = injections
            .iter()
            .flat_map(|i| i.packs_injected.iter().cloned())
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();
        let message = if packs.is_empty() {
            format!("This turn recorded {correction_count} correction(s); consider capturing them as pack lessons.")
        } else {
            format!(
                "This turn recorded {correction_count} correction(s) while guidance from [{}] was active.",
                packs.join(", ")
            )
        };
        return Ok(HookResponse::system_message(message));
    }

    Ok(HookResponse::empty())
}
