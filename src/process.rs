use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::SourceError;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

pub const GIT_TIMEOUT: Duration = Duration::from_secs(3);
pub const KEYCHAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Runs `command` to completion, killing it once `timeout` elapses.
///
/// A non-zero exit status is reported as `SourceError::Exit`.
pub fn run_with_timeout(command: &mut Command, timeout: Duration) -> Result<CommandOutput, SourceError> {
    let program = command.get_program().to_string_lossy().into_owned();
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| SourceError::Spawn {
            program: program.clone(),
            source,
        })?;

    // pipes must be drained while waiting or a full buffer stalls the child
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) if Instant::now() >= deadline => {
                kill_quietly(&mut child, &program);
                return Err(SourceError::Timeout { program, timeout });
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(source) => {
                kill_quietly(&mut child, &program);
                return Err(SourceError::Spawn { program, source });
            }
        }
    };

    let stdout = stdout.join().unwrap_or_default();
    let stderr = stderr.join().unwrap_or_default();
    if !status.success() {
        debug!(program = %program, status = ?status.code(), stderr = %stderr.trim(), "command failed");
        return Err(SourceError::Exit {
            program,
            status: status.code().unwrap_or(-1),
        });
    }
    Ok(CommandOutput { stdout, stderr })
}

/// `git -C <dir> <args...>` with the standard git timeout.
pub fn git(dir: &Path, args: &[&str]) -> Result<String, SourceError> {
    let mut command = Command::new("git");
    command.arg("-C").arg(dir).args(args);
    run_with_timeout(&mut command, GIT_TIMEOUT).map(|output| output.stdout)
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn kill_quietly(child: &mut Child, program: &str) {
    if let Err(err) = child.kill() {
        debug!(program = %program, error = %err, "failed to kill child process");
    }
    let _ = child.wait();
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn captures_stdout_of_successful_command() {
        let mut command = Command::new("sh");
        command.arg("-c").arg("printf 'hello'");
        let output = run_with_timeout(&mut command, Duration::from_secs(5)).expect("run sh");
        assert_eq!(output.stdout, "hello");
    }

    #[test]
    fn non_zero_exit_is_an_error() {
        let mut command = Command::new("sh");
        command.arg("-c").arg("exit 3");
        let err = run_with_timeout(&mut command, Duration::from_secs(5)).expect_err("exit 3");
        assert!(matches!(err, SourceError::Exit { status: 3, .. }));
    }

    #[test]
    fn slow_command_is_killed_at_deadline() {
        let mut command = Command::new("sh");
        command.arg("-c").arg("sleep 5");
        let started = Instant::now();
        let err = run_with_timeout(&mut command, Duration::from_millis(100)).expect_err("timeout");
        assert!(matches!(err, SourceError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let mut command = Command::new("definitely-not-a-real-binary-hud");
        let err = run_with_timeout(&mut command, Duration::from_secs(1)).expect_err("spawn");
        assert_eq!(err.code(), "spawn");
    }
}
