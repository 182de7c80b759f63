//! Session lifecycle: multiplexed starts, last-one-out shutdown.

use std::time::Duration;

use tracing::{debug, info};

use marvel_core::fsio;
use marvel_core::hook::{HookInput, HookResponse};
use marvel_session::SessionState;

use crate::state::DaemonState;

/// Grace period between the last session-end response and self-exit.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

pub async fn session_start(
    state: &std::sync::Arc<DaemonState>,
    input: &HookInput,
) -> anyhow::Result<HookResponse> {
    let session_id = input.session_id().to_string();

    {
        let mut sessions = state.active_sessions.lock().await;
        let was_empty = sessions.is_empty();
        let inserted = sessions.insert(session_id.clone());
        drop(sessions);

        // A start into an empty set after prior activity means the host
        // restarted mid-run; drop the stale cache before re-initializing.
        if was_empty {
            state.clear_init_cache().await;
        }
        if inserted {
            info!(session = %session_id, "session joined");
        }
    }

    // Fresh sessions always start with an empty injection dedup set.
    state.dedup.lock().await.clear();

    let init = state.init_session().await?;
    let run_id = init.run.lock().await.run_id().to_string();
    debug!(
        packs = init.packs.packs().len(),
        run = run_id,
        "session initialized"
    );

    // Pre-warm the evaluator off the request path.
    let evaluator = std::sync::Arc::clone(&state.evaluator);
    tokio::spawn(async move {
        evaluator.warmup().await;
    });

    let session_state = SessionState::new(&session_id);
    state.update_session_state(session_state).await;

    Ok(HookResponse::empty())
}

pub async fn session_end(
    state: &std::sync::Arc<DaemonState>,
    input: &HookInput,
) -> anyhow::Result<HookResponse> {
    let session_id = input.session_id().to_string();

    let now_empty = {
        let mut sessions = state.active_sessions.lock().await;
        sessions.remove(&session_id);
        sessions.is_empty()
    };

    // Persist and drop the in-memory session view.
    let session_state = state.session_state(&session_id).await;
    state.session_store(&session_id).save(&session_state);
    state.drop_session_state(&session_id).await;
    state.registry.clear_session(&session_id).await;
    info!(session = %session_id, now_empty, "session left");

    if now_empty {
        finalize_run(state).await;
        state.evaluator.shutdown().await;

        // Give the response a moment to flush, then self-terminate,
        // unless a new session slipped in during the grace period.
        let state = std::sync::Arc::clone(state);
        tokio::spawn(async move {
            tokio::time::sleep(SHUTDOWN_GRACE).await;
            if state.active_sessions.lock().await.is_empty() {
                state.signal_shutdown();
            }
        });
    }

    Ok(HookResponse::empty())
}

/// Archive guidance, stamp the run end, persist final metrics.
async fn finalize_run(state: &DaemonState) {
    let Some(init) = state.current_init().await else {
        return;
    };
    let mut run = init.run.lock().await;

    let archive = state.paths.guidance_archive_path();
    for guidance in run.load_guidance() {
        fsio::append_jsonl_best_effort(&archive, &guidance);
    }

    run.end();
    state.gate.metrics_snapshot().await.persist(run.dir());
}
