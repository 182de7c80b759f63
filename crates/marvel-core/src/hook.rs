//! Hook wire protocol: events, request envelope, response shapes.
//!
//! One request per connection, newline-delimited JSON. The empty response
//! `{}` means "no decision, no added context".

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HookEvent {
    SessionStart,
    UserPromptSubmit,
    PreToolUse,
    PostToolUse,
    PostToolUseFailure,
    Stop,
    PermissionRequest,
    PreCompact,
    PostCompactAgents,
    SessionEnd,
    SubagentStart,
    SubagentStop,
    Notification,
    TeammateIdle,
    TaskCompleted,
}

impl HookEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SessionStart => "session-start",
            Self::UserPromptSubmit => "user-prompt-submit",
            Self::PreToolUse => "pre-tool-use",
            Self::PostToolUse => "post-tool-use",
            Self::PostToolUseFailure => "post-tool-use-failure",
            Self::Stop => "stop",
            Self::PermissionRequest => "permission-request",
            Self::PreCompact => "pre-compact",
            Self::PostCompactAgents => "post-compact-agents",
            Self::SessionEnd => "session-end",
            Self::SubagentStart => "subagent-start",
            Self::SubagentStop => "subagent-stop",
            Self::Notification => "notification",
            Self::TeammateIdle => "teammate-idle",
            Self::TaskCompleted => "task-completed",
        }
    }

    /// Security hooks carry a decision and get the long timeout budget.
    pub fn is_security(&self) -> bool {
        matches!(self, Self::PreToolUse | Self::PermissionRequest)
    }

    pub fn timeout(&self) -> Duration {
        if self.is_security() {
            Duration::from_secs(35)
        } else {
            Duration::from_secs(9)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookRequest {
    pub hook: HookEvent,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    #[serde(default)]
    pub input: HookInput,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HookInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_output: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<String>,

    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl HookInput {
    pub fn session_id(&self) -> &str {
        self.session_id.as_deref().unwrap_or("unknown")
    }

    /// Bash tool command, when this input describes a Bash invocation.
    pub fn command(&self) -> Option<&str> {
        self.tool_input
            .as_ref()
            .and_then(|v| v.get("command"))
            .and_then(|v| v.as_str())
    }

    /// Bash tool description, when provided alongside the command.
    pub fn description(&self) -> Option<&str> {
        self.tool_input
            .as_ref()
            .and_then(|v| v.get("description"))
            .and_then(|v| v.as_str())
    }

    /// Target file for Edit/Write style tools.
    pub fn file_path(&self) -> Option<&str> {
        self.tool_input
            .as_ref()
            .and_then(|v| v.get("file_path").or_else(|| v.get("path")))
            .and_then(|v| v.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionDecision {
    Allow,
    Deny,
    Ask,
}

impl PermissionDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
            Self::Ask => "ask",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HookSpecificOutput {
    #[serde(rename = "hookEventName")]
    pub hook_event_name: String,

    #[serde(
        rename = "permissionDecision",
        skip_serializing_if = "Option::is_none"
    )]
    pub permission_decision: Option<PermissionDecision>,

    #[serde(
        rename = "permissionDecisionReason",
        skip_serializing_if = "Option::is_none"
    )]
    pub permission_decision_reason: Option<String>,

    #[serde(rename = "additionalContext", skip_serializing_if = "Option::is_none")]
    pub additional_context: Option<String>,
}

/// A single JSON object written back on the socket. `{}` carries nothing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HookResponse {
    #[serde(
        rename = "hookSpecificOutput",
        skip_serializing_if = "Option::is_none"
    )]
    pub hook_specific_output: Option<HookSpecificOutput>,

    #[serde(rename = "systemMessage", skip_serializing_if = "Option::is_none")]
    pub system_message: Option<String>,
}

impl HookResponse {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.hook_specific_output.is_none() && self.system_message.is_none()
    }

    pub fn context(event: HookEvent, text: impl Into<String>) -> Self {
        Self {
            hook_specific_output: Some(HookSpecificOutput {
                hook_event_name: event.name().to_string(),
                additional_context: Some(text.into()),
                ..Default::default()
            }),
            system_message: None,
        }
    }

    pub fn decision(
        event: HookEvent,
        decision: PermissionDecision,
        reason: Option<String>,
    ) -> Self {
        Self {
            hook_specific_output: Some(HookSpecificOutput {
                hook_event_name: event.name().to_string(),
                permission_decision: Some(decision),
                permission_decision_reason: reason,
                ..Default::default()
            }),
            system_message: None,
        }
    }

    /// Timed-out or failed security hooks fall back to asking the user.
    pub fn fail_ask(event: HookEvent, reason: impl Into<String>) -> Self {
        Self::decision(event, PermissionDecision::Ask, Some(reason.into()))
    }

    pub fn system_message(text: impl Into<String>) -> Self {
        Self {
            hook_specific_output: None,
            system_message: Some(text.into()),
        }
    }
}

/// Result of a readiness query against per-session pre-commit flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadinessCheck {
    pub ready: bool,
    pub missing: Vec<String>,
}

impl ReadinessCheck {
    pub fn ready() -> Self {
        Self {
            ready: true,
            missing: Vec::new(),
        }
    }

    pub fn missing(missing: Vec<String>) -> Self {
        Self {
            ready: false,
            missing,
        }
    }
}
