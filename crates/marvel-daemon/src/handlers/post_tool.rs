//! Post-tool bookkeeping: trace records, learning, readiness flags.

use std::sync::Arc;

use marvel_core::hook::{HookInput, HookResponse};

use crate::state::DaemonState;

use super::{is_bash_tool, is_edit_tool, summarize_value};

const SUMMARY_LIMIT: usize = 300;

/// Shared by `post-tool-use` and `post-tool-use-failure`; the failure
/// hook forces `success = false`.
pub async fn post_tool_use(
    state: &Arc<DaemonState>,
    input: &HookInput,
    forced_success: Option<bool>,
) -> anyhow::Result<HookResponse> {
    let tool = input.tool_name.as_deref().unwrap_or_default().to_string();
    let session_id = input.session_id().to_string();

    let success = forced_success.unwrap_or_else(|| {
        // The host flags failures in the tool output.
        !input
            .tool_output
            .as_ref()
            .and_then(|v| v.get("is_error"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    });

    if let Some(init) = state.current_init().await {
        let input_summary = if let Some(command) = input.command() {
            command.to_string()
        } else if let Some(file) = input.file_path() {
            file.to_string()
        } else {
            summarize_value(input.tool_input.as_ref(), SUMMARY_LIMIT)
        };
        let output_summary = summarize_value(input.tool_output.as_ref(), SUMMARY_LIMIT);
        init.run
            .lock()
            .await
            .record_tool_call(&tool, &input_summary, &output_summary, success);
    }

    if is_bash_tool(&tool) {
        if let Some(command) = input.command() {
            if success {
                // Consume the pending approval, maybe learn a rule.
                state.gate.record_execution(command, &session_id).await;

                let mut session_state = state.session_state(&session_id).await;
                if session_state.record_command_success(command) {
                    state.update_session_state(session_state).await;
                }
            }
            state
                .set_preceding_context(&session_id, None, Some(tool.clone()))
                .await;
        }
        return Ok(HookResponse::empty());
    }

    if is_edit_tool(&tool) {
        if let Some(file_path) = input.file_path() {
            if success {
                let mut session_state = state.session_state(&session_id).await;
                if session_state.invalidate_for_edit(file_path) {
                    state.update_session_state(session_state).await;
                }
            }
            state
                .set_preceding_context(
                    &session_id,
                    Some(file_path.to_string()),
                    Some(tool.clone()),
                )
                .await;
        }
    }

    Ok(HookResponse::empty())
}
