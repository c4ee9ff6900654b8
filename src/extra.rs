use std::process::Command;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use crate::process::run_with_timeout;
use crate::util::truncate;

pub const EXTRA_CMD_TIMEOUT: Duration = Duration::from_secs(3);
const MAX_OUTPUT_BYTES: usize = 10 * 1024;
const MAX_LABEL_CHARS: usize = 50;

// CSI sequences, OSC sequences ended by BEL or ST, C0 controls other than
// tab and newline, DEL, and the bidi embedding/isolate marks.
static UNSAFE_SEQUENCES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"\x1b\[[0-9;?]*[A-Za-z]",
        r"|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)",
        r"|[\x00-\x08\x0b\x0c\x0e-\x1f\x7f]",
        r"|[\x{202A}-\x{202E}\x{2066}-\x{2069}]",
    ))
    .expect("static pattern compiles")
});

#[derive(Debug, Deserialize)]
struct ExtraCmdOutput {
    label: String,
}

/// Runs the user's `--extra-cmd` through the shell and returns the label it
/// prints as `{"label": "..."}`. Every failure is logged and yields `None`.
pub fn run_extra_cmd(command: &str) -> Option<String> {
    run_extra_cmd_with(command, EXTRA_CMD_TIMEOUT)
}

fn run_extra_cmd_with(command: &str, timeout: Duration) -> Option<String> {
    let output = match run_with_timeout(&mut shell(command), timeout) {
        Ok(output) => output,
        Err(err) => {
            debug!(error = %err, code = %err.code(), "extra command failed");
            return None;
        }
    };
    if output.stdout.len() > MAX_OUTPUT_BYTES {
        debug!(bytes = output.stdout.len(), "extra command output too large");
        return None;
    }
    label_from_output(&output.stdout)
}

#[cfg(windows)]
fn shell(command: &str) -> Command {
    let mut shell = Command::new("cmd");
    shell.arg("/C").arg(command);
    shell
}

#[cfg(not(windows))]
fn shell(command: &str) -> Command {
    let mut shell = Command::new("sh");
    shell.arg("-c").arg(command);
    shell
}

fn label_from_output(stdout: &str) -> Option<String> {
    let parsed: ExtraCmdOutput = match serde_json::from_str(stdout.trim()) {
        Ok(parsed) => parsed,
        Err(err) => {
            debug!(error = %err, "extra command printed no label");
            return None;
        }
    };
    let label = sanitize(&parsed.label);
    if label.is_empty() {
        return None;
    }
    if label.chars().count() > MAX_LABEL_CHARS {
        return Some(truncate(&label, MAX_LABEL_CHARS - 3));
    }
    Some(label)
}

/// Strips terminal escape sequences and control characters so a label can
/// not move the cursor, retitle the window or reorder the line.
pub fn sanitize(input: &str) -> String {
    UNSAFE_SEQUENCES.replace_all(input, "").into_owned()
}
