//! Rendering replies and failures.

use anyhow::{Context, Result};
use serde_json::Value;

/// Reply payload as pretty or single-line JSON.
///
/// # Errors
///
/// Returns an error if JSON serialization fails.
pub fn render(payload: &Value, compact: bool) -> Result<String> {
    if compact {
        serde_json::to_string(payload)
    } else {
        serde_json::to_string_pretty(payload)
    }
    .context("JSON serialization failed")
}

/// Error object printed on stdout under `--json`:
///
/// ```json
/// { "error": true, "message": "...", "code": "..." }
/// ```
///
/// # Errors
///
/// Returns an error if JSON serialization fails.
pub fn format_error(message: &str, code: &str) -> Result<String> {
    let obj = serde_json::json!({
        "error": true,
        "message": message,
        "code": code,
    });
    serde_json::to_string_pretty(&obj).context("JSON serialization failed")
}
