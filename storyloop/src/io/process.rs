//! Child process execution with timeouts and bounded output.
//!
//! Both the agent and the verification stages go through [`run_command`].

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Read, Write};
#[cfg(unix)]
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Render stdout/stderr as a single log body, with truncation notices.
    pub fn render_log(&self, label: &str) -> String {
        let mut out = String::new();
        out.push_str("=== stdout ===\n");
        out.push_str(&String::from_utf8_lossy(&self.stdout));
        if self.stdout_truncated > 0 {
            out.push_str(&format!(
                "\n[{label} stdout truncated {} bytes]\n",
                self.stdout_truncated
            ));
        }
        out.push_str("\n=== stderr ===\n");
        out.push_str(&String::from_utf8_lossy(&self.stderr));
        if self.stderr_truncated > 0 {
            out.push_str(&format!(
                "\n[{label} stderr truncated {} bytes]\n",
                self.stderr_truncated
            ));
        }
        out.push_str(&format!(
            "\n=== exit ===\nexit_code: {:?}\ntimed_out: {}\nduration_ms: {}\n",
            self.status.code(),
            self.timed_out,
            self.duration.as_millis()
        ));
        out
    }
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Stdin is fed and both output pipes are drained on helper threads while the
/// child runs. `output_limit_bytes` bounds what is kept in memory per stream;
/// bytes beyond it are discarded while the pipe keeps draining. When
/// `tee_path` is set, every stdout line is also written there as it arrives.
///
/// On unix the child leads its own process group. The whole group is killed
/// on timeout and once the child exits, so descendants holding the pipes
/// cannot outlive the call.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes, tee = tee_path.is_some()))]
pub fn run_command(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
    tee_path: Option<&Path>,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    #[cfg(unix)]
    cmd.process_group(0);

    let tee = match tee_path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create tee dir {}", parent.display()))?;
            }
            let file = File::create(path)
                .with_context(|| format!("create tee file {}", path.display()))?;
            Some(BufWriter::new(file))
        }
        None => None,
    };

    debug!("spawning child process");
    let started = Instant::now();
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdin_handle = match stdin {
        Some(input) => {
            let mut child_stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            let input = input.to_vec();
            Some(thread::spawn(move || -> Result<()> {
                match child_stdin.write_all(&input) {
                    // The child may exit without reading its input.
                    Err(err) if err.kind() == ErrorKind::BrokenPipe => Ok(()),
                    other => other.context("write stdin"),
                }
            }))
        }
        None => None,
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || read_lines_limited(stdout, output_limit_bytes, tee));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            kill_process_tree(&mut child)?;
            child.wait().context("wait command after kill")?
        }
    };
    let duration = started.elapsed();
    if !timed_out {
        // Background descendants would keep the output pipes open.
        kill_process_group(child.id())?;
    }

    if let Some(handle) = stdin_handle {
        join_thread(handle).context("join stdin writer")?;
    }
    let (stdout, stdout_truncated) = join_thread(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_thread(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, duration_ms = duration.as_millis() as u64, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        duration,
    })
}

/// Build a `Command` from an argv, rooted at `workdir`.
pub fn command_from_argv(argv: &[String], workdir: &Path) -> Result<Command> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow!("command must be a non-empty array"))?;
    let mut cmd = Command::new(program);
    cmd.args(args).current_dir(workdir);
    Ok(cmd)
}

#[cfg(unix)]
fn kill_process_group(pid: u32) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let pgid = i32::try_from(pid).context("process id out of range")?;
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        // ESRCH: every member has already exited.
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(err) => Err(anyhow!("kill process group {pgid}: {err}")),
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) -> Result<()> {
    Ok(())
}

fn kill_process_tree(child: &mut Child) -> Result<()> {
    kill_process_group(child.id())?;
    match child.kill() {
        Err(err) if err.kind() != ErrorKind::InvalidInput => Err(err).context("kill command"),
        _ => Ok(()),
    }
}

fn join_thread<T>(handle: thread::JoinHandle<Result<T>>) -> Result<T> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("helper thread panicked")),
    }
}

fn read_lines_limited<R: Read>(
    reader: R,
    limit: usize,
    mut tee: Option<BufWriter<File>>,
) -> Result<(Vec<u8>, usize)> {
    let mut reader = BufReader::new(reader);
    let mut collected = Vec::new();
    let mut truncated = 0usize;

    loop {
        let mut line = Vec::new();
        let n = reader.read_until(b'\n', &mut line).context("read line")?;
        if n == 0 {
            break;
        }

        if let Some(writer) = tee.as_mut()
            && let Err(e) = writer.write_all(&line).and_then(|()| writer.flush())
        {
            warn!(err = %e, "failed to write tee file");
            tee = None;
        }

        let remaining = limit.saturating_sub(collected.len());
        let keep = n.min(remaining);
        collected.extend_from_slice(&line[..keep]);
        truncated += n - keep;
    }

    Ok((collected, truncated))
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        let keep = n.min(remaining);
        buf.extend_from_slice(&chunk[..keep]);
        truncated += n - keep;
    }

    Ok((buf, truncated))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_stdout_stderr_and_exit_code() {
        let out = run_command(
            sh("echo out; echo err >&2; exit 3"),
            None,
            Duration::from_secs(10),
            1024,
            None,
        )
        .expect("run");
        assert_eq!(out.stdout, b"out\n");
        assert_eq!(out.stderr, b"err\n");
        assert_eq!(out.status.code(), Some(3));
        assert!(!out.timed_out);
    }

    #[test]
    fn feeds_stdin_larger_than_a_pipe_buffer() {
        let payload = vec![b'x'; 256 * 1024];
        let out = run_command(
            sh("cat"),
            Some(&payload),
            Duration::from_secs(10),
            1024,
            None,
        )
        .expect("run");
        assert!(out.status.success());
        assert_eq!(out.stdout.len(), 1024);
        assert_eq!(out.stdout_truncated, payload.len() - 1024);
    }

    #[test]
    fn kills_on_timeout() {
        let out = run_command(sh("sleep 5"), None, Duration::from_millis(200), 1024, None)
            .expect("run");
        assert!(out.timed_out);
        assert!(!out.status.success());
        assert!(out.duration < Duration::from_secs(5));
    }

    #[test]
    fn timeout_also_kills_grandchildren_holding_the_pipes() {
        let started = Instant::now();
        let out = run_command(
            sh("sleep 4; echo late"),
            None,
            Duration::from_millis(300),
            1024,
            None,
        )
        .expect("run");
        assert!(out.timed_out);
        assert!(started.elapsed() < Duration::from_secs(2), "returned after {:?}", started.elapsed());
        assert!(out.stdout.is_empty());
    }

    #[test]
    fn background_descendants_do_not_hold_the_call_open() {
        let started = Instant::now();
        let out = run_command(
            sh("sleep 4 & echo started"),
            None,
            Duration::from_secs(10),
            1024,
            None,
        )
        .expect("run");
        assert!(!out.timed_out);
        assert_eq!(out.stdout, b"started\n");
        assert!(started.elapsed() < Duration::from_secs(2), "returned after {:?}", started.elapsed());
    }

    #[test]
    fn tees_stdout_lines_to_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let tee = temp.path().join("logs").join("agent.log");
        let out = run_command(
            sh("echo one; echo two"),
            None,
            Duration::from_secs(10),
            4,
            Some(&tee),
        )
        .expect("run");
        assert_eq!(out.stdout, b"one\n");
        assert_eq!(std::fs::read_to_string(&tee).expect("read tee"), "one\ntwo\n");
    }

    #[test]
    fn argv_must_be_non_empty() {
        assert!(command_from_argv(&[], Path::new(".")).is_err());
    }
}
