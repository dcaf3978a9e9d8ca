use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::InfraError;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How a child process ended.
#[derive(Debug, Clone)]
pub enum ProcessOutcome {
    Exited {
        success: bool,
        code: Option<i32>,
        stdout: String,
        stderr: String,
        duration_ms: u64,
    },
    /// Killed after exceeding its wall-clock budget.
    TimedOut { duration_ms: u64 },
}

impl ProcessOutcome {
    pub fn duration_ms(&self) -> u64 {
        match self {
            ProcessOutcome::Exited { duration_ms, .. } | ProcessOutcome::TimedOut { duration_ms, .. } => {
                *duration_ms
            }
        }
    }

    /// stdout followed by stderr. Empty for a killed process.
    pub fn combined_output(&self) -> String {
        let (stdout, stderr) = match self {
            ProcessOutcome::Exited { stdout, stderr, .. } => (stdout, stderr),
            ProcessOutcome::TimedOut { .. } => return String::new(),
        };
        if stderr.is_empty() {
            stdout.clone()
        } else if stdout.is_empty() {
            stderr.clone()
        } else {
            format!("{}\n{}", stdout, stderr)
        }
    }
}

/// A command line with placeholders, e.g. `javac -d {out} {source}`.
///
/// The template is split on whitespace before placeholders are substituted,
/// so substituted paths may contain spaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    program: String,
    args: Vec<String>,
}

impl CommandTemplate {
    pub fn parse(template: &str) -> Result<Self, InfraError> {
        let (program, args) = parse_command(template);
        if program.is_empty() {
            return Err(InfraError::EmptyCommand);
        }
        Ok(CommandTemplate { program, args })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Expands `{name}` placeholders in every argument. Arguments that expand
    /// to an empty string are dropped.
    pub fn render(&self, vars: &[(&str, &str)]) -> (String, Vec<String>) {
        let expand = |s: &str| {
            let mut out = s.to_string();
            for (name, value) in vars {
                out = out.replace(&format!("{{{}}}", name), value);
            }
            out
        };
        let args = self
            .args
            .iter()
            .map(|a| expand(a))
            .filter(|a| !a.is_empty())
            .collect();
        (expand(&self.program), args)
    }
}

pub fn parse_command(cmd: &str) -> (String, Vec<String>) {
    let mut parts = cmd.split_whitespace();
    let program = parts.next().unwrap_or_default().to_string();
    (program, parts.map(|s| s.to_string()).collect())
}

/// Joins classpath entries with the platform separator.
pub fn join_classpath<I, P>(entries: I) -> Result<String, InfraError>
where
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
{
    let entries: Vec<PathBuf> = entries.into_iter().map(|p| p.as_ref().to_path_buf()).collect();
    match std::env::join_paths(&entries) {
        Ok(joined) => Ok(joined.to_string_lossy().to_string()),
        Err(_) => {
            let sep = if cfg!(windows) { ';' } else { ':' };
            let path = entries
                .into_iter()
                .find(|p| p.to_string_lossy().contains(sep))
                .unwrap_or_default();
            Err(InfraError::Classpath { path })
        }
    }
}

/// Runs a program to completion or until `timeout` elapses, in which case it
/// is killed along with everything it spawned.
///
/// The child leads its own process group. Output is drained on helper threads
/// so a chatty child cannot block on a full pipe, and the deadline also covers
/// waiting for that output: a background grandchild that keeps the pipes open
/// past the deadline turns the run into a timeout.
pub fn run_with_timeout(
    program: &str,
    args: &[String],
    working_dir: &Path,
    envs: &[(&str, &Path)],
    timeout: Duration,
) -> Result<ProcessOutcome, InfraError> {
    let start = Instant::now();
    let deadline = start + timeout;
    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (key, value) in envs {
        cmd.env(key, value);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let mut child = cmd.spawn().map_err(|source| InfraError::Spawn {
        program: program.to_string(),
        source,
    })?;
    let (tx, rx) = mpsc::channel();
    drain(child.stdout.take(), Stream::Stdout, tx.clone());
    drain(child.stderr.take(), Stream::Stderr, tx);

    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                if Instant::now() >= deadline {
                    kill_tree(&mut child);
                    return Ok(timed_out(program, timeout, start));
                }
                std::thread::sleep(POLL_INTERVAL);
            }
            Err(source) => {
                kill_tree(&mut child);
                return Err(InfraError::Wait {
                    program: program.to_string(),
                    source,
                });
            }
        }
    };

    let mut stdout = String::new();
    let mut stderr = String::new();
    loop {
        match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
            Ok((Stream::Stdout, text)) => stdout = text,
            Ok((Stream::Stderr, text)) => stderr = text,
            // Both readers hit end of file.
            Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                debug!(program, "output still open after exit");
                kill_group(child.id());
                return Ok(timed_out(program, timeout, start));
            }
        }
    }

    let duration_ms = start.elapsed().as_millis() as u64;
    debug!(program, code = ?status.code(), duration_ms, "process exited");
    Ok(ProcessOutcome::Exited {
        success: status.success(),
        code: status.code(),
        stdout,
        stderr,
        duration_ms,
    })
}

fn timed_out(program: &str, timeout: Duration, start: Instant) -> ProcessOutcome {
    // Readers are not joined; they finish once the killed group releases the
    // pipes.
    warn!(program, timeout_ms = timeout.as_millis() as u64, "process killed after timeout");
    ProcessOutcome::TimedOut {
        duration_ms: start.elapsed().as_millis() as u64,
    }
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>, stream: Stream, tx: Sender<(Stream, String)>) {
    if let Some(mut pipe) = pipe {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            let _ = tx.send((stream, String::from_utf8_lossy(&buf).to_string()));
        });
    }
}

fn kill_tree(child: &mut Child) {
    kill_group(child.id());
    let _ = child.kill();
    let _ = child.wait();
}

/// Sends SIGKILL to the process group led by `pid`.
fn kill_group(pid: u32) {
    #[cfg(unix)]
    {
        let Ok(pgid) = libc::pid_t::try_from(pid) else {
            return;
        };
        // SAFETY: killpg only sends a signal. The group was created for this
        // child by `process_group(0)`, so it holds nothing but its
        // descendants.
        #[allow(unsafe_code)]
        let result = unsafe { libc::killpg(pgid, libc::SIGKILL) };
        if result != 0 {
            debug!(pgid, error = %std::io::Error::last_os_error(), "killpg failed");
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
    }
}
