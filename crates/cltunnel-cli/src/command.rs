//! Running external programs

use cltunnel_ingress::ExternalError;
use std::process::{Command, Output};
use tracing::debug;

/// Human readable form of a command line, used as the error action
pub(crate) fn describe(command: &Command) -> String {
    std::iter::once(command.get_program())
        .chain(command.get_args())
        .map(|part| part.to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Both output streams, stdout first, trimmed
pub(crate) fn combined_output(output: &Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);

    [stdout.trim(), stderr.trim()]
        .iter()
        .filter(|s| !s.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("\n")
}

/// Run to completion, failing on spawn errors and non-zero exits
pub(crate) fn run(command: &mut Command) -> Result<Output, ExternalError> {
    let action = describe(command);
    debug!(command = %action, "Running command");

    let output = command
        .output()
        .map_err(|e| ExternalError::new(&action, format!("failed to execute: {}", e)))?;

    if !output.status.success() {
        let mut diagnostics = combined_output(&output);
        if diagnostics.is_empty() {
            diagnostics = output.status.to_string();
        }
        return Err(ExternalError::new(action, diagnostics));
    }

    Ok(output)
}
