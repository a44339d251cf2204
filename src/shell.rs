//! Persistent shell sessions
//!
//! Spawning `su` is expensive (the root broker may even prompt the user), so a
//! single long-lived shell process is kept per `ShellSession` and every command is
//! written to its stdin. Each command is followed by an end marker carrying the
//! exit code, on both stdout and stderr, so output can be framed without
//! restarting the shell.
//!
//! Sessions are handed around explicitly as `Arc<dyn Shell>`; there is no hidden
//! global shell.

use crate::error::{InstallError, Result};
use crate::process_guard::{ChildRegistry, CommandProcessGroup};
use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Mutex;
use std::time::{Duration, Instant};

static DRY_RUN: AtomicBool = AtomicBool::new(false);

/// Log mutating commands instead of running them. Probes still run.
pub fn enable_dry_run() {
    DRY_RUN.store(true, Ordering::SeqCst);
}

pub fn disable_dry_run() {
    DRY_RUN.store(false, Ordering::SeqCst);
}

pub fn is_dry_run() -> bool {
    DRY_RUN.load(Ordering::SeqCst)
}

/// Single-quote an argument for the shell.
pub fn quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// Result of one shell command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ShellOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ShellOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failure(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        self.code == 0
    }

    /// Turn a non-zero exit into a typed failure carrying `step`.
    pub fn ensure_success(self, step: &str) -> Result<Self> {
        if self.is_success() {
            return Ok(self);
        }
        let detail = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        Err(InstallError::backend_with(step, detail.clone()))
    }
}

/// A command execution channel.
///
/// `run` blocks until the command finishes and must not be called from a UI thread.
pub trait Shell: Send + Sync {
    fn run(&self, command: &str) -> Result<ShellOutput>;

    /// `Some(true)` when the platform already knows this session is privileged.
    fn granted_hint(&self) -> Option<bool> {
        None
    }
}

/// One live shell process.
struct SessionProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: Receiver<String>,
    stderr: Receiver<String>,
    pid: u32,
    counter: u64,
    uid: Option<u32>,
}

fn spawn_line_reader<R: Read + Send + 'static>(stream: R) -> Receiver<String> {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let reader = BufReader::new(stream);
        for line in reader.lines().map_while(std::result::Result::ok) {
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

fn next_line(rx: &Receiver<String>, deadline: Option<Instant>) -> Result<String> {
    match deadline {
        Some(deadline) => {
            let remaining = deadline.saturating_duration_since(Instant::now());
            rx.recv_timeout(remaining).map_err(|e| match e {
                RecvTimeoutError::Timeout => InstallError::backend("Shell did not respond in time"),
                RecvTimeoutError::Disconnected => InstallError::backend("Shell session terminated"),
            })
        }
        None => rx
            .recv()
            .map_err(|_| InstallError::backend("Shell session terminated")),
    }
}

impl SessionProcess {
    fn spawn(command_line: &str, acquire_timeout: Duration) -> Result<Self> {
        let mut parts = command_line.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| InstallError::config("Shell command is empty"))?;

        let mut child = Command::new(program)
            .args(parts)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .in_new_process_group()
            .spawn()
            .map_err(|e| InstallError::backend_with(format!("Failed to start {program}"), e.to_string()))?;

        let pid = child.id();
        ChildRegistry::track(pid);

        let (stdin, stdout, stderr) = match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                ChildRegistry::untrack(pid);
                return Err(InstallError::backend("Failed to open shell pipes"));
            }
        };

        let mut session = Self {
            child,
            stdin,
            stdout: spawn_line_reader(stdout),
            stderr: spawn_line_reader(stderr),
            pid,
            counter: 0,
            uid: None,
        };

        let handshake = session.exec("id -u", Some(acquire_timeout))?;
        if !handshake.is_success() {
            return Err(InstallError::backend_with("Failed to acquire shell", handshake.stderr));
        }
        session.uid = handshake.stdout.trim().parse().ok();
        log::debug!("Shell session {} ready (uid {:?})", pid, session.uid);
        Ok(session)
    }

    fn exec(&mut self, command: &str, timeout: Option<Duration>) -> Result<ShellOutput> {
        self.counter += 1;
        let marker = format!("__PATCHDEPLOY_{}_{}__", self.pid, self.counter);
        let script = format!(
            "{{\n{command}\n}} </dev/null\n__pd_rc=$?\necho {marker} >&2\necho {marker}$__pd_rc\n"
        );

        self.stdin
            .write_all(script.as_bytes())
            .and_then(|_| self.stdin.flush())
            .map_err(|e| InstallError::backend_with("Shell session terminated", e.to_string()))?;

        let deadline = timeout.map(|t| Instant::now() + t);

        let mut stdout = String::new();
        let code = loop {
            let line = next_line(&self.stdout, deadline)?;
            match line.find(&marker) {
                Some(idx) => {
                    stdout.push_str(&line[..idx]);
                    break line[idx + marker.len()..].trim().parse().unwrap_or(-1);
                }
                None => {
                    stdout.push_str(&line);
                    stdout.push('\n');
                }
            }
        };

        let mut stderr = String::new();
        loop {
            let line = next_line(&self.stderr, deadline)?;
            match line.find(&marker) {
                Some(idx) => {
                    stderr.push_str(&line[..idx]);
                    break;
                }
                None => {
                    stderr.push_str(&line);
                    stderr.push('\n');
                }
            }
        }

        Ok(ShellOutput { code, stdout, stderr })
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }
}

impl Drop for SessionProcess {
    fn drop(&mut self) {
        let _ = self.stdin.write_all(b"exit\n");
        let _ = self.child.kill();
        let _ = self.child.wait();
        ChildRegistry::untrack(self.pid);
    }
}

/// Shared, lazily started shell session.
///
/// The process is spawned on first use and reused afterwards. A session whose
/// process died, or whose framing broke on an error, is discarded and replaced
/// on the next call.
pub struct ShellSession {
    command: String,
    acquire_timeout: Duration,
    process: Mutex<Option<SessionProcess>>,
}

impl ShellSession {
    pub fn new(command: impl Into<String>, acquire_timeout: Duration) -> Self {
        Self {
            command: command.into(),
            acquire_timeout,
            process: Mutex::new(None),
        }
    }

    pub fn is_open(&self) -> bool {
        self.process
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }

    /// Close the shell process; the next command starts a new one.
    pub fn close(&self) {
        let mut guard = self.process.lock().unwrap_or_else(|e| e.into_inner());
        guard.take();
    }
}

impl Shell for ShellSession {
    fn run(&self, command: &str) -> Result<ShellOutput> {
        let mut guard = self.process.lock().unwrap_or_else(|e| e.into_inner());

        let mut process = match guard.take() {
            Some(mut process) => {
                if process.is_alive() {
                    process
                } else {
                    log::debug!("Shell session {} exited, starting a new one", process.pid);
                    drop(process);
                    SessionProcess::spawn(&self.command, self.acquire_timeout)?
                }
            }
            None => SessionProcess::spawn(&self.command, self.acquire_timeout)?,
        };

        log::debug!("[{}] $ {}", self.command, command);
        let result = process.exec(command, None);
        if result.is_ok() {
            *guard = Some(process);
        } else {
            log::warn!("Discarding shell session {} after a failed command", process.pid);
        }
        result
    }

    fn granted_hint(&self) -> Option<bool> {
        let guard = self.process.lock().ok()?;
        guard
            .as_ref()
            .and_then(|process| process.uid)
            .filter(|uid| *uid == 0)
            .map(|_| true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh() -> ShellSession {
        ShellSession::new("sh", Duration::from_secs(5))
    }

    #[test]
    fn test_quote_escapes_single_quotes() {
        assert_eq!(quote("plain"), "'plain'");
        assert_eq!(quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_run_captures_stdout_and_code() {
        let shell = sh();
        let out = shell.run("echo hello; echo world").expect("run");
        assert_eq!(out.code, 0);
        assert_eq!(out.stdout, "hello\nworld\n");
        assert!(out.stderr.is_empty());
    }

    #[test]
    fn test_run_captures_stderr_and_failure_code() {
        let shell = sh();
        let out = shell.run("echo oops >&2; false").expect("run");
        assert_eq!(out.code, 1);
        assert_eq!(out.stderr, "oops\n");
    }

    #[test]
    fn test_output_without_trailing_newline() {
        let shell = sh();
        let out = shell.run("printf partial").expect("run");
        assert_eq!(out.stdout, "partial");
    }

    #[test]
    fn test_session_is_reused() {
        let shell = sh();
        let first = shell.run("echo $$").expect("run");
        let second = shell.run("echo $$").expect("run");
        assert_eq!(first.stdout, second.stdout);
        assert!(shell.is_open());
    }

    #[test]
    fn test_dead_session_is_replaced() {
        let shell = sh();
        assert!(shell.run("exit 3").is_err());
        let out = shell.run("echo back").expect("new session");
        assert_eq!(out.stdout, "back\n");
    }

    #[test]
    fn test_killed_session_is_respawned() {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let shell = sh();
        let first = shell.run("echo $$").expect("run");
        let pid: i32 = first.stdout.trim().parse().expect("pid");
        kill(Pid::from_raw(pid), Signal::SIGKILL).expect("kill");
        std::thread::sleep(Duration::from_millis(100));

        let second = shell.run("echo $$").expect("respawned session");
        assert!(second.is_success());
        assert_ne!(first.stdout, second.stdout);
        assert!(shell.is_open());
    }

    #[test]
    fn test_commands_do_not_consume_session_stdin() {
        let shell = sh();
        let out = shell.run("cat").expect("run");
        assert!(out.stdout.is_empty());
        let out = shell.run("echo still-framed").expect("run");
        assert_eq!(out.stdout, "still-framed\n");
    }

    #[test]
    fn test_ensure_success_carries_step() {
        let err = ShellOutput::failure(1, "mount: busy\n")
            .ensure_success("Failed to mount APK")
            .unwrap_err();
        assert_eq!(err.to_string(), "Failed to mount APK: mount: busy");
    }

    #[test]
    fn test_missing_shell_binary_fails() {
        let shell = ShellSession::new("/nonexistent/shell-binary", Duration::from_secs(1));
        let err = shell.run("true").unwrap_err();
        assert!(err.to_string().contains("Failed to start"));
    }

    #[test]
    fn test_close_discards_process() {
        let shell = sh();
        shell.run("true").expect("run");
        shell.close();
        assert!(!shell.is_open());
    }
}
