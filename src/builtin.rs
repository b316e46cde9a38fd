use crate::command::{CommandFactory, ExecutableCommand, ExitCode, Streams};
use crate::interpreter::{Factory, Interpreter};
use crate::lexer;
use crate::supervisor::{EXIT_FAILURE, RunOptions};
use anyhow::{Result, anyhow, bail};
use argh::{EarlyExit, FromArgs};
use std::env as stdenv;
use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

/// Built-in commands known to the shell at compile time.
///
/// Builtins are parsed using the [`argh`] crate (`FromArgs`) and executed directly
/// in-process without spawning a child process of their own.
pub(crate) trait BuiltinCommand: Sized + FromArgs {
    /// Canonical name of the command, e.g. "cd" or "sudo".
    fn name() -> &'static str;

    /// Executes the command against the interpreter's state.
    ///
    /// Return value should follow shell conventions: 0 for success, non-zero for error.
    fn execute(self, interp: &mut Interpreter, io: &mut Streams<'_>) -> Result<ExitCode>;
}

impl<T: BuiltinCommand> ExecutableCommand for T {
    fn execute(self: Box<Self>, interp: &mut Interpreter, io: &mut Streams<'_>) -> ExitCode {
        match <T as BuiltinCommand>::execute(*self, interp, io) {
            Ok(x) => x,
            Err(e) => {
                let _ = writeln!(io.err, "{e:#}");
                EXIT_FAILURE
            }
        }
    }
}

struct InvalidArgs {
    output: String,
    is_error: bool,
}

impl ExecutableCommand for InvalidArgs {
    fn execute(self: Box<Self>, _interp: &mut Interpreter, io: &mut Streams<'_>) -> ExitCode {
        let sink = if self.is_error { &mut *io.err } else { &mut *io.out };
        let _ = writeln!(sink, "{}", self.output.trim_end());
        if self.is_error { EXIT_FAILURE } else { 0 }
    }
}

impl<T: BuiltinCommand + 'static> CommandFactory for Factory<T> {
    fn name(&self) -> &'static str {
        T::name()
    }

    fn try_create(&self, name: &str, args: &[&str]) -> Option<Box<dyn ExecutableCommand>> {
        if name == T::name() {
            Some(match T::from_args(&[name], args) {
                Ok(cmd) => Box::new(cmd),
                Err(EarlyExit { output, status }) => Box::new(InvalidArgs {
                    output,
                    is_error: status.is_err(),
                }),
            })
        } else {
            None
        }
    }
}

/// Every handler an internal table entry may name.
pub(crate) fn default_commands() -> Vec<Box<dyn CommandFactory>> {
    vec![
        Box::new(Factory::<Cd>::default()),
        Box::new(Factory::<Pwd>::default()),
        Box::new(Factory::<Touch>::default()),
        Box::new(Factory::<Sudo>::default()),
        Box::new(Factory::<Su>::default()),
        Box::new(Factory::<Chown>::default()),
        Box::new(Factory::<Passwd>::default()),
    ]
}

/// Joins `arg` onto `base` unless it is absolute, folding `.` and `..` lexically.
fn resolve_path(base: &Path, arg: &str) -> PathBuf {
    let joined = base.join(arg);
    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out
}

#[derive(FromArgs)]
/// Print the current working directory to standard output.
pub struct Pwd {}

impl BuiltinCommand for Pwd {
    fn name() -> &'static str {
        "pwd"
    }

    fn execute(self, interp: &mut Interpreter, io: &mut Streams<'_>) -> Result<ExitCode> {
        writeln!(io.out, "{}", interp.env().current_dir.display())?;
        Ok(0)
    }
}

#[derive(FromArgs)]
/// Change the current working directory.
/// If no target is provided, changes to the user's home directory.
pub struct Cd {
    #[argh(positional)]
    /// directory to switch to; absolute or relative to the current directory. `~` and no argument mean the home directory.
    pub target: Option<String>,
}

impl BuiltinCommand for Cd {
    fn name() -> &'static str {
        "cd"
    }

    fn execute(self, interp: &mut Interpreter, _io: &mut Streams<'_>) -> Result<ExitCode> {
        let env = interp.env_mut();
        let home = || env.home_dir().ok_or_else(|| anyhow!("cd: no target and HOME not set"));

        let new_dir = match self.target.as_deref() {
            None | Some("") | Some("~") => home()?,
            Some(t) if t.starts_with("~/") || t.starts_with("~\\") => resolve_path(&home()?, &t[2..]),
            Some(t) => resolve_path(&env.current_dir, t),
        };

        if !new_dir.is_dir() {
            bail!("cd: {}: No such directory", new_dir.display());
        }

        if let Err(e) = stdenv::set_current_dir(&new_dir) {
            // child processes still start in the logical directory
            tracing::warn!(dir = %new_dir.display(), error = %e, "can't move the process working directory");
        }
        env.current_dir = new_dir;
        Ok(0)
    }
}

#[derive(FromArgs)]
/// Create empty files, or update the modification time of existing ones.
pub struct Touch {
    #[argh(positional, greedy)]
    /// files to create or update.
    pub files: Vec<String>,
}

/// Creates `path` if missing; otherwise stamps it, directories and read-only files included.
fn touch_file(path: &Path) -> io::Result<()> {
    let now = SystemTime::now();
    let file = match fs::OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => open_for_times(path)?,
        Err(e) => return Err(e),
    };
    file.set_times(fs::FileTimes::new().set_accessed(now).set_modified(now))
}

#[cfg(windows)]
fn open_for_times(path: &Path) -> io::Result<fs::File> {
    use std::os::windows::fs::OpenOptionsExt;
    const FILE_WRITE_ATTRIBUTES: u32 = 0x0100;
    const FILE_FLAG_BACKUP_SEMANTICS: u32 = 0x0200_0000;
    fs::OpenOptions::new()
        .access_mode(FILE_WRITE_ATTRIBUTES)
        .custom_flags(FILE_FLAG_BACKUP_SEMANTICS)
        .open(path)
}

#[cfg(not(windows))]
fn open_for_times(path: &Path) -> io::Result<fs::File> {
    fs::File::open(path)
}

impl BuiltinCommand for Touch {
    fn name() -> &'static str {
        "touch"
    }

    fn execute(self, interp: &mut Interpreter, io: &mut Streams<'_>) -> Result<ExitCode> {
        if self.files.is_empty() {
            bail!("touch: missing file operand");
        }

        let cwd = interp.env().current_dir.clone();
        let mut exit_code = 0;
        for file in &self.files {
            if let Err(e) = touch_file(&resolve_path(&cwd, file)) {
                writeln!(io.err, "touch: {file}: {e}")?;
                exit_code = 1;
            }
        }
        Ok(exit_code)
    }
}

#[derive(FromArgs)]
/// Run a command line with administrator privileges.
/// Only works when the session itself was started elevated.
pub struct Sudo {
    #[argh(positional, greedy)]
    /// the command line to run.
    pub command: Vec<String>,
}

impl BuiltinCommand for Sudo {
    fn name() -> &'static str {
        "sudo"
    }

    fn execute(self, interp: &mut Interpreter, io: &mut Streams<'_>) -> Result<ExitCode> {
        if self.command.is_empty() {
            writeln!(io.err, "sudo: missing command")?;
            writeln!(io.err, "Usage: sudo <command> [arguments]")?;
            return Ok(1);
        }

        let line = lexer::join_words(&self.command)
            .ok_or_else(|| anyhow!("sudo: arguments can't be quoted"))?;
        if interp.env().elevated {
            writeln!(io.out, "Already running as administrator. Executing: {line}")?;
        }
        Ok(interp.dispatch(&line, true, io))
    }
}

#[derive(FromArgs)]
/// Switch to the administrator account.
pub struct Su {
    #[argh(positional)]
    /// user to switch to; only root or administrator is supported.
    pub user: Option<String>,
}

#[cfg(windows)]
fn host_shell(_interp: &Interpreter) -> Vec<String> {
    vec!["cmd.exe".to_string()]
}

#[cfg(not(windows))]
fn host_shell(interp: &Interpreter) -> Vec<String> {
    vec![interp.env().get_var("SHELL").unwrap_or_else(|| "sh".to_string())]
}

impl BuiltinCommand for Su {
    fn name() -> &'static str {
        "su"
    }

    fn execute(self, interp: &mut Interpreter, io: &mut Streams<'_>) -> Result<ExitCode> {
        let target = self.user.as_deref().unwrap_or("root");
        let is_admin = ["root", "administrator"]
            .iter()
            .any(|admin| target.eq_ignore_ascii_case(admin));
        if !is_admin {
            writeln!(
                io.err,
                "su: switching to '{target}' is not supported; only root/administrator is available"
            )?;
            return Ok(1);
        }

        if interp.env().elevated {
            writeln!(io.out, "Already running as administrator")?;
            return Ok(0);
        }

        writeln!(io.out, "Attempting to switch to {target}...")?;
        let shell = host_shell(interp);
        let options = RunOptions {
            requires_elevation: true,
            ..RunOptions::default()
        };
        Ok(interp.run_external(&shell, options, io))
    }
}

#[derive(FromArgs)]
/// Change the owner of files. Requires an elevated session.
pub struct Chown {
    #[argh(positional)]
    /// new owner of the files.
    pub owner: String,

    #[argh(positional, greedy)]
    /// files whose owner changes.
    pub files: Vec<String>,
}

#[cfg(windows)]
fn ownership_command(owner: &str, path: &Path) -> Vec<String> {
    vec![
        "icacls".to_string(),
        path.display().to_string(),
        "/setowner".to_string(),
        owner.to_string(),
        "/T".to_string(),
        "/C".to_string(),
    ]
}

#[cfg(not(windows))]
fn ownership_command(owner: &str, path: &Path) -> Vec<String> {
    vec!["chown".to_string(), owner.to_string(), path.display().to_string()]
}

impl BuiltinCommand for Chown {
    fn name() -> &'static str {
        "chown"
    }

    fn execute(self, interp: &mut Interpreter, io: &mut Streams<'_>) -> Result<ExitCode> {
        if self.files.is_empty() {
            writeln!(io.err, "chown: missing operand")?;
            writeln!(io.err, "Usage: chown <user> <file>...")?;
            return Ok(1);
        }
        if !interp.env().elevated {
            writeln!(io.err, "chown: requires administrator privileges. Use 'sudo chown'")?;
            return Ok(1);
        }

        let cwd = interp.env().current_dir.clone();
        let options = RunOptions {
            requires_elevation: true,
            ..RunOptions::default()
        };
        let mut exit_code = 0;
        for file in &self.files {
            let path = resolve_path(&cwd, file);
            if !path.exists() {
                writeln!(io.err, "chown: cannot access '{file}': No such file or directory")?;
                exit_code = 1;
                continue;
            }

            if interp.run_external(&ownership_command(&self.owner, &path), options, io) == 0 {
                writeln!(io.out, "Changed ownership of '{file}' to {}", self.owner)?;
            } else {
                writeln!(io.err, "chown: failed to change ownership of '{file}'")?;
                exit_code = 1;
            }
        }
        Ok(exit_code)
    }
}

#[derive(FromArgs)]
/// Explain how to change a password on this host.
pub struct Passwd {
    #[argh(positional)]
    /// account whose password should change; defaults to the current user.
    pub user: Option<String>,
}

impl BuiltinCommand for Passwd {
    fn name() -> &'static str {
        "passwd"
    }

    fn execute(self, _interp: &mut Interpreter, io: &mut Streams<'_>) -> Result<ExitCode> {
        match &self.user {
            Some(user) => writeln!(io.out, "Changing password for user '{user}'")?,
            None => writeln!(io.out, "Changing password for current user")?,
        }
        writeln!(io.out, "Password changes are not performed from this session.")?;
        if cfg!(windows) {
            let user = self.user.as_deref().unwrap_or("<username>");
            writeln!(io.out, "To change a Windows password, use one of:")?;
            writeln!(io.out, "  - net user {user} *   (from an administrator prompt)")?;
            writeln!(io.out, "  - CTRL+ALT+DEL -> Change a password")?;
            writeln!(io.out, "  - Settings -> Accounts -> Sign-in options")?;
        } else {
            writeln!(io.out, "Run the host's passwd from a regular terminal instead.")?;
        }
        Ok(0)
    }
}

/// Serializes tests that move the process working directory.
#[cfg(test)]
pub(crate) fn lock_current_dir() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};
    static MUTEX: OnceLock<Mutex<()>> = OnceLock::new();
    MUTEX
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
