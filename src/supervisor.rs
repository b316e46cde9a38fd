//! Runs external commands one at a time with live, inherited standard I/O.

use crate::command::ExitCode;
use crate::interrupt::Interrupt;
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Reported when a child was cancelled by an interrupt.
pub const EXIT_INTERRUPTED: ExitCode = 130;
/// Reported when the program to run does not exist.
pub const EXIT_NOT_FOUND: ExitCode = 127;
/// Reported for any other failure of the execution layer.
pub const EXIT_FAILURE: ExitCode = 1;

pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_millis(3000);

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Failures of the execution layer. A child's own non-zero status is not one.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("nothing to run")]
    EmptyInvocation,

    #[error(
        "'{program}' requires elevated privileges, which this session does not have. \
         {hint} Elevation is never attempted from inside the running session."
    )]
    Elevation { program: String, hint: &'static str },

    #[error("working directory {} is not accessible", .0.display())]
    WorkingDirectory(PathBuf),

    #[error("{0}: command not found")]
    NotFound(String),

    #[error("can't start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("lost track of {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("arguments can't be quoted for the shell")]
    Quote,
}

impl ExecError {
    /// Process-style exit code for this failure.
    pub fn exit_code(&self) -> ExitCode {
        match self {
            ExecError::NotFound(_) => EXIT_NOT_FOUND,
            _ => EXIT_FAILURE,
        }
    }
}

/// How to run an invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Hand the invocation to the host's command interpreter as text.
    pub use_textual_shell: bool,
    /// Refuse to run unless the session is elevated.
    pub requires_elevation: bool,
}

#[derive(Debug)]
struct RunningProcess {
    child: Child,
    program: String,
    started: Instant,
    /// The child leads its own process group; signals go to the whole group.
    own_group: bool,
}

impl RunningProcess {
    /// Asks the child to stop, waits up to `grace`, then kills it.
    ///
    /// Returns the child's own code when it had already exited before the
    /// request was sent.
    fn terminate(&mut self, grace: Duration) -> Option<ExitCode> {
        if let Ok(Some(status)) = self.child.try_wait() {
            tracing::debug!(program = %self.program, ?status, "child exited before termination");
            return Some(exit_code_of(status));
        }
        request_termination(self);

        let deadline = Instant::now() + grace;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    tracing::debug!(program = %self.program, ?status, "child stopped after termination request");
                    return None;
                }
                Ok(None) if Instant::now() < deadline => thread::sleep(POLL_INTERVAL),
                Ok(None) | Err(_) => break,
            }
        }

        tracing::debug!(program = %self.program, "grace period elapsed; killing child");
        self.kill();
        None
    }

    fn kill(&mut self) {
        if self.own_group {
            kill_group(self);
        }
        if let Err(e) = self.child.kill() {
            tracing::debug!(program = %self.program, error = %e, "kill failed");
        }
        let _ = self.child.wait();
    }
}

#[cfg(unix)]
fn request_termination(running: &mut RunningProcess) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    if running.own_group {
        signal_group(running, Signal::SIGTERM);
        return;
    }
    let pid = Pid::from_raw(running.child.id() as i32);
    if let Err(e) = kill(pid, Signal::SIGTERM) {
        tracing::warn!(program = %running.program, error = %e, "can't deliver SIGTERM");
    }
}

#[cfg(unix)]
fn signal_group(running: &RunningProcess, signal: nix::sys::signal::Signal) {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    let group = Pid::from_raw(running.child.id() as i32);
    if let Err(e) = killpg(group, signal) {
        tracing::warn!(program = %running.program, ?signal, error = %e, "can't signal process group");
    }
}

#[cfg(unix)]
fn kill_group(running: &RunningProcess) {
    signal_group(running, nix::sys::signal::Signal::SIGKILL);
}

#[cfg(unix)]
fn lead_own_group(command: &mut Command) {
    use std::os::unix::process::CommandExt;
    command.process_group(0);
}

#[cfg(not(unix))]
fn kill_group(_running: &RunningProcess) {}

#[cfg(not(unix))]
fn lead_own_group(_command: &mut Command) {}

#[cfg(not(unix))]
fn request_termination(running: &mut RunningProcess) {
    if let Err(e) = running.child.kill() {
        tracing::warn!(program = %running.program, error = %e, "can't terminate child");
    }
}

/// Owner of the single child process the session may run at a time.
///
/// `run` borrows the supervisor mutably for the whole life of the child, so a
/// second invocation can only start after the first has finished.
#[derive(Debug)]
pub struct Supervisor {
    interrupt: Interrupt,
    grace: Duration,
    elevated: bool,
    own_group: bool,
    running: Option<RunningProcess>,
}

impl Supervisor {
    /// Children get their own process group only when stdin is not a terminal.
    /// On a terminal they stay in the foreground group, so they can read it
    /// and a Ctrl+C reaches their descendants too.
    pub fn new(interrupt: Interrupt, grace: Duration, elevated: bool) -> Self {
        Self {
            interrupt,
            grace,
            elevated,
            own_group: cfg!(unix) && !io::stdin().is_terminal(),
            running: None,
        }
    }

    /// Whether each child leads a process group that termination signals as a whole.
    pub fn with_own_process_group(mut self, own_group: bool) -> Self {
        self.own_group = cfg!(unix) && own_group;
        self
    }

    /// Whether a child is currently owned.
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Handle that cancels the running child when raised.
    pub fn interrupt(&self) -> &Interrupt {
        &self.interrupt
    }

    /// Runs `invocation` in `cwd` and waits for it.
    ///
    /// Returns the child's exit code, `128 + signal` if a signal killed it, or
    /// [`EXIT_INTERRUPTED`] if an interrupt arrived first. Interrupts raised
    /// before the child starts are discarded.
    pub fn run(
        &mut self,
        invocation: &[String],
        cwd: &Path,
        options: RunOptions,
    ) -> Result<ExitCode, ExecError> {
        self.interrupt.take();
        self.start(invocation, cwd, options)?;
        let result = self.wait_running();
        self.running = None;
        result
    }

    /// Stops the running child, if any, and forgets it.
    ///
    /// Returns `None` when nothing was running; calling this repeatedly is harmless.
    /// A child that already exited keeps its own code instead of 130.
    pub fn cancel(&mut self) -> Option<ExitCode> {
        let mut running = self.running.take()?;
        tracing::debug!(
            program = %running.program,
            elapsed = ?running.started.elapsed(),
            "cancelling child"
        );
        Some(running.terminate(self.grace).unwrap_or(EXIT_INTERRUPTED))
    }

    fn start(
        &mut self,
        invocation: &[String],
        cwd: &Path,
        options: RunOptions,
    ) -> Result<(), ExecError> {
        let Some(program) = invocation.first() else {
            return Err(ExecError::EmptyInvocation);
        };

        if options.requires_elevation && !self.elevated {
            return Err(ExecError::Elevation {
                program: program.clone(),
                hint: RELAUNCH_HINT,
            });
        }

        if !cwd.is_dir() {
            return Err(ExecError::WorkingDirectory(cwd.to_path_buf()));
        }

        let mut command = if options.use_textual_shell {
            textual_shell_command(invocation)?
        } else {
            let mut command = Command::new(program);
            command.args(&invocation[1..]);
            command
        };
        if self.own_group {
            lead_own_group(&mut command);
        }
        command
            .current_dir(cwd)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        let child = command.spawn().map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                ExecError::NotFound(program.clone())
            } else {
                ExecError::Spawn {
                    program: program.clone(),
                    source,
                }
            }
        })?;
        tracing::debug!(program = %program, pid = child.id(), cwd = %cwd.display(), "spawned");

        self.running = Some(RunningProcess {
            child,
            program: program.clone(),
            started: Instant::now(),
            own_group: self.own_group,
        });
        Ok(())
    }

    /// Polls the owned child until it exits or an interrupt is raised.
    ///
    /// Exit is checked before the interrupt flag, so a child that has already
    /// finished always reports its own status.
    fn wait_running(&mut self) -> Result<ExitCode, ExecError> {
        loop {
            let Some(running) = self.running.as_mut() else {
                return Ok(EXIT_INTERRUPTED);
            };
            match running.child.try_wait() {
                Ok(Some(status)) => {
                    let code = exit_code_of(status);
                    tracing::debug!(program = %running.program, code, "child exited");
                    self.running = None;
                    return Ok(code);
                }
                Ok(None) => {}
                Err(source) => {
                    running.kill();
                    let program = running.program.clone();
                    self.running = None;
                    return Err(ExecError::Wait { program, source });
                }
            }

            if self.interrupt.take() {
                return Ok(self.cancel().unwrap_or(EXIT_INTERRUPTED));
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if let Some(mut running) = self.running.take() {
            running.kill();
        }
    }
}

#[cfg(windows)]
const RELAUNCH_HINT: &str =
    "Close this session, right-click your terminal, choose 'Run as administrator', and start it again.";
#[cfg(not(windows))]
const RELAUNCH_HINT: &str = "Start the session again as root (for example with the host's sudo).";

#[cfg(windows)]
fn textual_shell_command(invocation: &[String]) -> Result<Command, ExecError> {
    use std::os::windows::process::CommandExt;
    let script = shell_script(invocation)?;
    let mut command = Command::new("cmd");
    command.arg("/C").raw_arg(script);
    Ok(command)
}

#[cfg(not(windows))]
fn textual_shell_command(invocation: &[String]) -> Result<Command, ExecError> {
    let script = shell_script(invocation)?;
    let mut command = Command::new("sh");
    command.arg("-c").arg(script);
    Ok(command)
}

/// A single element is already a script; several are quoted and joined.
fn shell_script(invocation: &[String]) -> Result<String, ExecError> {
    match invocation {
        [script] => Ok(script.clone()),
        words => crate::lexer::join_words(words).ok_or(ExecError::Quote),
    }
}

fn exit_code_of(status: ExitStatus) -> ExitCode {
    match status.code() {
        Some(x) => x,
        None => terminated_by_signal(status),
    }
}

#[cfg(unix)]
fn terminated_by_signal(exit_status: ExitStatus) -> ExitCode {
    use std::os::unix::process::ExitStatusExt;
    if let Some(signal) = ExitStatusExt::signal(&exit_status) {
        128 + signal
    } else if ExitStatusExt::core_dumped(&exit_status) {
        255
    } else {
        EXIT_FAILURE
    }
}

#[cfg(not(unix))]
fn terminated_by_signal(_exit_status: ExitStatus) -> ExitCode {
    EXIT_FAILURE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn supervisor(grace_ms: u64) -> Supervisor {
        Supervisor::new(Interrupt::new(), Duration::from_millis(grace_ms), false)
    }

    fn tmp() -> PathBuf {
        std::env::temp_dir()
    }

    #[test]
    #[cfg(unix)]
    fn reports_child_exit_code() {
        let mut sup = supervisor(100);
        let code = sup
            .run(&argv(&["sh", "-c", "exit 3"]), &tmp(), RunOptions::default())
            .unwrap();
        assert_eq!(code, 3);
        assert!(!sup.is_running());

        let code = sup
            .run(&argv(&["true"]), &tmp(), RunOptions::default())
            .unwrap();
        assert_eq!(code, 0);
    }

    #[test]
    #[cfg(unix)]
    fn child_runs_in_the_given_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = supervisor(100);
        let code = sup
            .run(
                &argv(&["sh", "-c", "touch marker"]),
                dir.path(),
                RunOptions::default(),
            )
            .unwrap();
        assert_eq!(code, 0);
        assert!(dir.path().join("marker").exists());
    }

    #[test]
    #[cfg(unix)]
    fn signal_death_maps_to_128_plus_signal() {
        let mut sup = supervisor(100);
        let code = sup
            .run(&argv(&["sh", "-c", "kill -9 $$"]), &tmp(), RunOptions::default())
            .unwrap();
        assert_eq!(code, 128 + 9);
    }

    #[test]
    fn missing_program_is_127() {
        let mut sup = supervisor(100);
        let err = sup
            .run(
                &argv(&["cmd-bridge-no-such-program-7f3a"]),
                &tmp(),
                RunOptions::default(),
            )
            .unwrap_err();
        assert!(matches!(err, ExecError::NotFound(ref p) if p == "cmd-bridge-no-such-program-7f3a"));
        assert_eq!(err.exit_code(), EXIT_NOT_FOUND);
        assert!(!sup.is_running());
    }

    #[test]
    fn empty_invocation_is_rejected() {
        let mut sup = supervisor(100);
        let err = sup.run(&[], &tmp(), RunOptions::default()).unwrap_err();
        assert!(matches!(err, ExecError::EmptyInvocation));
        assert_eq!(err.exit_code(), EXIT_FAILURE);
    }

    #[test]
    fn missing_working_directory_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let gone = dir.path().join("gone");
        let mut sup = supervisor(100);
        let err = sup
            .run(&argv(&["true"]), &gone, RunOptions::default())
            .unwrap_err();
        assert!(matches!(err, ExecError::WorkingDirectory(p) if p == gone));
    }

    #[test]
    fn elevation_is_refused_without_spawning() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = supervisor(100);
        let options = RunOptions {
            requires_elevation: true,
            ..RunOptions::default()
        };
        let err = sup
            .run(&argv(&["sh", "-c", "touch marker"]), dir.path(), options)
            .unwrap_err();
        assert!(matches!(err, ExecError::Elevation { ref program, .. } if program == "sh"));
        assert!(err.to_string().contains("requires elevated privileges"));
        assert_eq!(err.exit_code(), EXIT_FAILURE);
        assert!(!dir.path().join("marker").exists());
    }

    #[test]
    #[cfg(unix)]
    fn elevated_session_runs_elevated_commands() {
        let mut sup = Supervisor::new(Interrupt::new(), Duration::from_millis(100), true);
        let options = RunOptions {
            requires_elevation: true,
            ..RunOptions::default()
        };
        assert_eq!(sup.run(&argv(&["true"]), &tmp(), options).unwrap(), 0);
    }

    #[test]
    #[cfg(unix)]
    fn textual_shell_runs_scripts() {
        let mut sup = supervisor(100);
        let options = RunOptions {
            use_textual_shell: true,
            ..RunOptions::default()
        };
        assert_eq!(sup.run(&argv(&["exit 4"]), &tmp(), options).unwrap(), 4);
        // several words are quoted, so the space survives as one argument
        let code = sup
            .run(&argv(&["test", "a b", "=", "a b"]), &tmp(), options)
            .unwrap();
        assert_eq!(code, 0);
    }

    #[test]
    #[cfg(unix)]
    fn interrupt_terminates_a_cooperative_child() {
        let mut sup = supervisor(2000);
        let interrupt = sup.interrupt().clone();
        let raiser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            interrupt.raise();
        });

        let started = Instant::now();
        let code = sup
            .run(&argv(&["sleep", "10"]), &tmp(), RunOptions::default())
            .unwrap();
        raiser.join().unwrap();

        assert_eq!(code, EXIT_INTERRUPTED);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!sup.is_running());
    }

    #[test]
    #[cfg(unix)]
    fn interrupt_force_kills_after_grace_period() {
        let mut sup = supervisor(300);
        let interrupt = sup.interrupt().clone();
        let raiser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            interrupt.raise();
        });

        let started = Instant::now();
        let code = sup
            .run(
                &argv(&["sh", "-c", "trap '' TERM; exec sleep 10"]),
                &tmp(),
                RunOptions::default(),
            )
            .unwrap();
        raiser.join().unwrap();

        assert_eq!(code, EXIT_INTERRUPTED);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(450), "returned before grace period: {elapsed:?}");
        assert!(elapsed < Duration::from_secs(5));
        assert!(!sup.is_running());
    }

    #[test]
    #[cfg(unix)]
    fn interrupt_after_exit_keeps_the_childs_code() {
        let mut sup = supervisor(100);
        sup.start(&argv(&["sh", "-c", "exit 7"]), &tmp(), RunOptions::default())
            .unwrap();
        thread::sleep(Duration::from_millis(300));
        sup.interrupt().raise();

        assert_eq!(sup.wait_running().unwrap(), 7);
        assert!(!sup.is_running());
    }

    #[test]
    #[cfg(unix)]
    fn stale_interrupt_is_swallowed() {
        let mut sup = supervisor(100);
        sup.interrupt().raise();
        let code = sup
            .run(&argv(&["sh", "-c", "sleep 0.2; exit 5"]), &tmp(), RunOptions::default())
            .unwrap();
        assert_eq!(code, 5);
    }

    #[test]
    #[cfg(unix)]
    fn cancel_after_exit_keeps_the_childs_code() {
        let mut sup = supervisor(100);
        sup.start(&argv(&["sh", "-c", "exit 7"]), &tmp(), RunOptions::default())
            .unwrap();
        thread::sleep(Duration::from_millis(300));

        assert_eq!(sup.cancel(), Some(7));
        assert!(!sup.is_running());
        assert_eq!(sup.cancel(), None);
    }

    #[test]
    #[cfg(unix)]
    fn interrupt_stops_grandchildren_in_own_group() {
        let dir = tempfile::tempdir().unwrap();
        let ticks = dir.path().join("ticks");
        let mut sup = supervisor(300).with_own_process_group(true);
        let interrupt = sup.interrupt().clone();
        let raiser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(300));
            interrupt.raise();
        });

        let code = sup
            .run(
                &argv(&["sh", "-c", "(while :; do echo x >> ticks; sleep 0.05; done) & wait"]),
                dir.path(),
                RunOptions::default(),
            )
            .unwrap();
        raiser.join().unwrap();
        assert_eq!(code, EXIT_INTERRUPTED);

        thread::sleep(Duration::from_millis(100));
        let before = std::fs::metadata(&ticks).unwrap().len();
        thread::sleep(Duration::from_millis(400));
        assert_eq!(std::fs::metadata(&ticks).unwrap().len(), before);
    }

    #[test]
    fn cancel_without_child_is_a_no_op() {
        let mut sup = supervisor(100);
        assert_eq!(sup.cancel(), None);
        assert_eq!(sup.cancel(), None);
    }

    #[test]
    #[cfg(unix)]
    fn double_cancel_is_harmless() {
        let mut sup = supervisor(500);
        sup.start(&argv(&["sleep", "10"]), &tmp(), RunOptions::default())
            .unwrap();
        assert!(sup.is_running());

        assert_eq!(sup.cancel(), Some(EXIT_INTERRUPTED));
        assert!(!sup.is_running());
        assert_eq!(sup.cancel(), None);
    }
}
