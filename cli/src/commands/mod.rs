//! Command implementations

pub mod call;
pub mod heartbeats;

use dockhand_bus::CallError;

/// Process exit status for a failed run: 2 when no reply arrived in time,
/// 3 when the agent answered with an error, 1 otherwise.
pub fn exit_code(error: &anyhow::Error) -> i32 {
    match error.downcast_ref::<CallError>() {
        Some(CallError::Timeout(_)) => 2,
        Some(CallError::Remote { .. }) => 3,
        _ => 1,
    }
}

/// Machine-readable code for the `--json` error object.
pub fn error_code(error: &anyhow::Error) -> String {
    match error.downcast_ref::<CallError>() {
        Some(CallError::Timeout(_)) => "TIMEOUT".to_string(),
        Some(CallError::Remote { code, .. }) => serde_json::to_value(code)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| "UNKNOWN".to_string()),
        Some(CallError::InvalidReply(_)) => "INVALID_REPLY".to_string(),
        Some(CallError::Transport(_)) => "TRANSPORT".to_string(),
        _ => "ERROR".to_string(),
    }
}
