//! Child process execution with a timeout and bounded output capture.

use std::io::{self, Read};
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Exit code reported when a command was killed or terminated by a signal.
pub const KILLED_EXIT_CODE: i32 = -1;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.success()
    }

    /// Process exit code, or [`KILLED_EXIT_CODE`] after a timeout or signal.
    pub fn exit_code(&self) -> i32 {
        if self.timed_out {
            return KILLED_EXIT_CODE;
        }
        self.status.code().unwrap_or(KILLED_EXIT_CODE)
    }

    pub fn stdout_lossy(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stdout).into_owned();
        if self.stdout_truncated > 0 {
            text.push_str(&format!("\n[stdout truncated {} bytes]", self.stdout_truncated));
        }
        text
    }

    pub fn stderr_lossy(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stderr).into_owned();
        if self.stderr_truncated > 0 {
            text.push_str(&format!("\n[stderr truncated {} bytes]", self.stderr_truncated));
        }
        text
    }
}

/// Run `command` through `sh -c` inside `workdir`.
pub fn run_shell(
    command: &str,
    workdir: &Path,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command).current_dir(workdir);
    // Own process group so a timeout also reaches grandchildren holding the pipes.
    #[cfg(unix)]
    std::os::unix::process::CommandExt::process_group(&mut cmd, 0);
    run_command_with_timeout(cmd, timeout, output_limit_bytes)
}

/// Spawn `cmd`, wait at most `timeout`, and collect its output.
///
/// Both pipes are drained on reader threads while the child runs, so a chatty
/// command cannot block on a full pipe. Each stream keeps at most
/// `output_limit_bytes`; the rest is read and counted. A timeout kills the child
/// and is reported through [`CommandOutput::timed_out`], not as an error.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .inspect_err(|err| error!(err = %err, "spawn failed"))
        .context("spawn command")?;
    debug!(pid = child.id(), "child spawned");

    let stdout = spawn_capture(child.stdout.take(), output_limit_bytes)?;
    let stderr = spawn_capture(child.stderr.take(), output_limit_bytes)?;

    let (status, timed_out) = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => (status, false),
        None => {
            warn!(timeout_secs = timeout.as_secs(), "command timed out, killing");
            kill_process_group(child.id());
            child.kill().context("kill command")?;
            (child.wait().context("wait command after kill")?, true)
        }
    };

    let stdout = finish_capture(stdout).context("collect stdout")?;
    let stderr = finish_capture(stderr).context("collect stderr")?;
    if stdout.dropped > 0 || stderr.dropped > 0 {
        warn!(stdout_dropped = stdout.dropped, stderr_dropped = stderr.dropped, "output truncated");
    }
    debug!(exit_code = ?status.code(), timed_out, "command finished");

    Ok(CommandOutput {
        status,
        stdout: stdout.bytes,
        stderr: stderr.bytes,
        stdout_truncated: stdout.dropped,
        stderr_truncated: stderr.dropped,
        timed_out,
    })
}

/// Best effort: the group only exists when the child was spawned as its leader.
#[cfg(unix)]
fn kill_process_group(pid: u32) {
    let result = Command::new("kill")
        .arg("-KILL")
        .arg(format!("-{pid}"))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    if let Err(err) = result {
        debug!(err = %err, pid, "kill process group failed");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

/// One stream's kept bytes and how many were discarded past the limit.
struct Captured {
    bytes: Vec<u8>,
    dropped: usize,
}

type CaptureHandle = thread::JoinHandle<io::Result<Captured>>;

fn spawn_capture<R: Read + Send + 'static>(pipe: Option<R>, limit: usize) -> Result<CaptureHandle> {
    let pipe = pipe.ok_or_else(|| anyhow!("child pipe was not captured"))?;
    Ok(thread::spawn(move || capture(pipe, limit)))
}

fn finish_capture(handle: CaptureHandle) -> Result<Captured> {
    handle
        .join()
        .map_err(|_| anyhow!("output reader thread panicked"))?
        .context("read output")
}

fn capture<R: Read>(mut reader: R, limit: usize) -> io::Result<Captured> {
    let mut bytes = Vec::new();
    (&mut reader).take(limit as u64).read_to_end(&mut bytes)?;
    let dropped = io::copy(&mut reader, &mut io::sink())?;
    Ok(Captured {
        bytes,
        dropped: usize::try_from(dropped).unwrap_or(usize::MAX),
    })
}
