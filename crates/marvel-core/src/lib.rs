pub mod command;
pub mod fsio;
pub mod hook;
pub mod paths;
pub mod redact;

pub use command::{
    meaningful_command, normalize_command, normalize_whitespace, parse_segment, project_relative,
    split_compound, ParsedCommand,
};
pub use hook::{
    HookEvent, HookInput, HookRequest, HookResponse, HookSpecificOutput, PermissionDecision,
    ReadinessCheck,
};
pub use paths::{ProjectPaths, SUN_PATH_MAX};
pub use redact::redact;
