//! Child processes with a timeout and cooperative cancellation
//!
//! Output pipes are drained on their own threads while the parent waits, so
//! a chatty child cannot block on a full pipe.

use std::io::{self, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::engine::CancelToken;

const WAIT_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error talking to child process: {0}")]
    Io(#[from] io::Error),

    #[error("timed out after {}s", .0.as_secs())]
    TimedOut(Duration),

    #[error("cancelled")]
    Cancelled,
}

#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Trimmed stderr, or the exit status when stderr is empty
    pub fn failure_message(&self) -> String {
        let stderr = String::from_utf8_lossy(&self.stderr).trim().to_string();
        if stderr.is_empty() {
            format!("exited with {}", self.status)
        } else {
            stderr
        }
    }
}

/// Runs `cmd` to completion.
///
/// The child is killed when `timeout` elapses or `cancel` fires.
#[instrument(skip_all, fields(program = ?cmd.get_program()))]
pub fn run_command(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Option<Duration>,
    cancel: Option<&CancelToken>,
) -> Result<CommandOutput, ProcessError> {
    let program = cmd.get_program().to_string_lossy().into_owned();
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|source| {
        error!(program = %program, err = %source, "failed to spawn command");
        ProcessError::Spawn {
            program: program.clone(),
            source,
        }
    })?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stdout_handle = thread::spawn(move || drain(stdout));
    let stderr_handle = thread::spawn(move || drain(stderr));

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        // A child that exits without reading its input is not an error here
        if let Err(e) = pipe.write_all(input) {
            if e.kind() != io::ErrorKind::BrokenPipe {
                error!(program = %program, err = %e, "failed to write stdin, killing child");
                drop(pipe);
                kill_and_reap(&mut child);
                return Err(e.into());
            }
        }
    }

    let started = Instant::now();
    let status = loop {
        if let Some(status) = child.wait_timeout(WAIT_SLICE)? {
            break status;
        }
        if cancel.is_some_and(CancelToken::is_cancelled) {
            warn!(program = %program, "cancelled, killing child");
            child.kill()?;
            child.wait()?;
            return Err(ProcessError::Cancelled);
        }
        if let Some(limit) = timeout {
            if started.elapsed() >= limit {
                warn!(program = %program, timeout_secs = limit.as_secs(), "timed out, killing child");
                child.kill()?;
                child.wait()?;
                return Err(ProcessError::TimedOut(limit));
            }
        }
    };

    let stdout = join(stdout_handle)?;
    let stderr = join(stderr_handle)?;
    debug!(exit_code = ?status.code(), "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
    })
}

/// Best-effort kill of a child we are abandoning on an error path
fn kill_and_reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn drain(stream: Option<impl Read>) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut stream) = stream {
        stream.read_to_end(&mut buf)?;
    }
    Ok(buf)
}

fn join(handle: thread::JoinHandle<io::Result<Vec<u8>>>) -> Result<Vec<u8>, ProcessError> {
    match handle.join() {
        Ok(result) => Ok(result?),
        Err(_) => Err(io::Error::other("output reader thread panicked").into()),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_output_and_stdin() {
        let output = run_command(sh("cat; echo oops >&2"), Some(b"hello"), None, None).unwrap();
        assert!(output.success());
        assert_eq!(output.stdout_text(), "hello");
        assert_eq!(output.failure_message(), "oops");
    }

    #[test]
    fn failure_message_falls_back_to_status() {
        let output = run_command(sh("exit 3"), None, None, None).unwrap();
        assert!(!output.success());
        assert!(output.failure_message().contains('3'));
    }

    #[test]
    fn kills_on_timeout() {
        let started = Instant::now();
        let result = run_command(sh("sleep 5"), None, Some(Duration::from_millis(200)), None);
        assert!(matches!(result, Err(ProcessError::TimedOut(_))));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn kills_on_cancel() {
        let token = CancelToken::new();
        let canceller = token.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            canceller.cancel();
        });

        let result = run_command(sh("sleep 5"), None, None, Some(&token));
        handle.join().unwrap();
        assert!(matches!(result, Err(ProcessError::Cancelled)));
    }

    #[test]
    fn child_ignoring_stdin_is_not_an_error() {
        let input = vec![b'x'; 1 << 20];
        let output = run_command(sh("exit 0"), Some(&input), None, None).unwrap();
        assert!(output.success());
    }

    #[test]
    fn abandoned_child_is_killed_and_reaped() {
        let started = Instant::now();
        let mut child = sh("sleep 5").spawn().unwrap();

        kill_and_reap(&mut child);

        assert!(child.try_wait().unwrap().is_some());
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let result = run_command(Command::new("beadflow-no-such-program"), None, None, None);
        assert!(matches!(result, Err(ProcessError::Spawn { .. })));
    }
}
