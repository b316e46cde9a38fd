use crate::builtin::default_commands;
use crate::command::{CommandFactory, ExecutableCommand, ExitCode, Streams};
use crate::config::Config;
use crate::env::Environment;
use crate::interrupt::Interrupt;
use crate::locator::Locator;
use crate::resolver::{self, Resolution};
use crate::supervisor::{EXIT_FAILURE, EXIT_NOT_FOUND, ExecError, RunOptions, Supervisor};
use crate::table::{TableError, TranslationTable};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::io::{self, Write};
use std::path::{MAIN_SEPARATOR, Path, PathBuf};

/// Factory allows creating instances of ExecutableCommand.
///
/// Only supports commands defined in this crate, see [`crate::builtin`].
pub(crate) struct Factory<T> {
    _phantom: std::marker::PhantomData<T>,
}

impl<T> Default for Factory<T> {
    fn default() -> Self {
        Self {
            _phantom: std::marker::PhantomData,
        }
    }
}

/// What the input loop should do after a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue(ExitCode),
    Exit,
    ClearScreen,
}

/// The translating shell engine.
///
/// Owns the [`Environment`], the immutable [`TranslationTable`], the
/// [`Locator`] cache and the [`Supervisor`] of the single running child.
/// Lines are handled one at a time: control phrases first, then the raw
/// passthrough prefix, then table resolution.
///
/// Example
/// ```no_run
/// use cmd_bridge::{Config, Interpreter, Interrupt, TranslationTable};
/// let config = Config::new(TranslationTable::bundled().unwrap());
/// let mut sh = Interpreter::new(config, Interrupt::new()).unwrap();
/// let code = sh.run_line("pwd");
/// assert_eq!(code, 0);
/// ```
pub struct Interpreter {
    env: Environment,
    table: TranslationTable,
    locator: Locator,
    supervisor: Supervisor,
    commands: Vec<Box<dyn CommandFactory>>,
    passthrough: String,
}

impl Interpreter {
    /// Create an interpreter for the current process.
    pub fn new(config: Config, interrupt: Interrupt) -> Result<Self, TableError> {
        let env = Environment::new();
        let locator = Locator::from_env(&env);
        Self::with_parts(env, config, locator, interrupt)
    }

    /// Create an interpreter from explicit parts.
    ///
    /// Fails if an internal table entry names a handler that doesn't exist.
    pub fn with_parts(
        env: Environment,
        config: Config,
        locator: Locator,
        interrupt: Interrupt,
    ) -> Result<Self, TableError> {
        let commands = default_commands();
        for entry in config.table.entries() {
            if let Some(handler) = entry.handler()
                && !commands.iter().any(|f| f.name() == handler)
            {
                return Err(TableError::UnknownHandler {
                    pattern: entry.key().to_string(),
                    handler: handler.to_string(),
                });
            }
        }

        Ok(Self {
            supervisor: Supervisor::new(interrupt, config.grace_period, env.elevated),
            env,
            table: config.table,
            locator,
            commands,
            passthrough: config.passthrough,
        })
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    pub fn env_mut(&mut self) -> &mut Environment {
        &mut self.env
    }

    pub fn table(&self) -> &TranslationTable {
        &self.table
    }

    pub fn supervisor(&mut self) -> &mut Supervisor {
        &mut self.supervisor
    }

    /// Handle one line with output going to the process's stdout and stderr.
    pub fn execute_line(&mut self, line: &str) -> Flow {
        let mut out = io::stdout();
        let mut err = io::stderr();
        self.execute_line_with_output(line, &mut Streams::new(&mut out, &mut err))
    }

    /// Handle one line, writing the engine's own messages to `io`.
    ///
    /// Children always inherit the process's standard streams.
    pub fn execute_line_with_output(&mut self, line: &str, io: &mut Streams<'_>) -> Flow {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Flow::Continue(0);
        }

        match trimmed.to_ascii_lowercase().as_str() {
            "exit" | "quit" => {
                self.env.should_exit = true;
                return Flow::Exit;
            }
            "help" => {
                let _ = self.print_help(io.out);
                return Flow::Continue(0);
            }
            "path" => {
                let _ = self.print_search_path(io.out);
                return Flow::Continue(0);
            }
            "clear" => return Flow::ClearScreen,
            _ => {}
        }

        if let Some(script) = self.passthrough_script(trimmed) {
            tracing::debug!(script, "raw passthrough");
            let options = RunOptions {
                use_textual_shell: true,
                ..RunOptions::default()
            };
            let invocation = [script.to_string()];
            return Flow::Continue(self.run_external(&invocation, options, io));
        }

        Flow::Continue(self.dispatch(trimmed, false, io))
    }

    /// Execute one line non-interactively and return its exit code.
    pub fn run_line(&mut self, line: &str) -> ExitCode {
        match self.execute_line(line) {
            Flow::Continue(code) => code,
            Flow::Exit | Flow::ClearScreen => 0,
        }
    }

    fn passthrough_script<'a>(&self, line: &'a str) -> Option<&'a str> {
        let (word, rest) = line.split_once(char::is_whitespace)?;
        let rest = rest.trim();
        (word == self.passthrough && !rest.is_empty()).then_some(rest)
    }

    /// Resolve `line` and run whatever it maps to.
    ///
    /// With `requires_elevation` any spawned process is refused unless the
    /// session is elevated; internal handlers still run.
    pub(crate) fn dispatch(
        &mut self,
        line: &str,
        requires_elevation: bool,
        io: &mut Streams<'_>,
    ) -> ExitCode {
        let resolution = match resolver::resolve(line, &self.table) {
            Ok(r) => r,
            Err(e) => {
                let _ = writeln!(io.err, "Error parsing command: {e}");
                return EXIT_FAILURE;
            }
        };

        let options = RunOptions {
            requires_elevation,
            ..RunOptions::default()
        };
        if let Some(invocation) = resolution.invocation() {
            return self.run_external(&invocation, options, io);
        }

        match resolution {
            Resolution::Empty | Resolution::Translated { .. } => 0,
            Resolution::Internal { name, args } => self.run_internal(&name, &args, io),
            Resolution::Unmatched { name, args } => match self.locate(&name) {
                Some(path) => {
                    let mut invocation = vec![path.to_string_lossy().into_owned()];
                    invocation.extend(args);
                    self.run_external(&invocation, options, io)
                }
                None => {
                    let _ = writeln!(io.err, "Command not found: {name}");
                    let _ = writeln!(io.err, "Type 'help' to see available commands");
                    EXIT_NOT_FOUND
                }
            },
        }
    }

    fn run_internal(&mut self, name: &str, args: &[String], io: &mut Streams<'_>) -> ExitCode {
        let args_ref: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        let command = self
            .commands
            .iter()
            .find_map(|factory| factory.try_create(name, &args_ref));

        match command {
            Some(cmd) => cmd.execute(self, io),
            None => {
                tracing::error!(name, "internal entry without a handler");
                let _ = writeln!(io.err, "{name}: no built-in handler");
                EXIT_FAILURE
            }
        }
    }

    /// Run a child in the logical directory and report failures on `io.err`.
    pub(crate) fn run_external(
        &mut self,
        invocation: &[String],
        options: RunOptions,
        io: &mut Streams<'_>,
    ) -> ExitCode {
        let cwd = self.env.current_dir.clone();
        match self.supervisor.run(invocation, &cwd, options) {
            Ok(0) => 0,
            Ok(code) => {
                let _ = writeln!(io.err, "Command exited with code {code}");
                code
            }
            Err(ExecError::NotFound(program)) => {
                let _ = writeln!(io.err, "Command not found: {program}");
                EXIT_NOT_FOUND
            }
            Err(e) => {
                let _ = writeln!(io.err, "Error executing command: {e}");
                e.exit_code()
            }
        }
    }

    fn locate(&mut self, name: &str) -> Option<PathBuf> {
        let path = Path::new(name);
        if path.components().count() > 1 && path.is_relative() {
            let joined = self.env.current_dir.join(path);
            return self.locator.locate(&joined.to_string_lossy());
        }
        self.locator.locate(name)
    }

    fn print_help(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, "POSIX command translator")?;
        writeln!(out, "Type POSIX commands; they run as their native equivalents.")?;
        let privileges = if self.env.elevated { "Administrator" } else { "Standard user" };
        writeln!(out, "Current privileges: {privileges}")?;

        writeln!(out, "\nSpecial commands:")?;
        writeln!(out, "  exit, quit - Leave the session")?;
        writeln!(out, "  help - Show this help message")?;
        writeln!(out, "  {} <command> - Run a native command untranslated", self.passthrough)?;
        writeln!(out, "  path - Show the executable search directories")?;
        writeln!(out, "  clear - Clear the screen")?;
        writeln!(out, "  sudo <command> - Run a command with elevated privileges")?;
        writeln!(out, "  su [user] - Switch to the administrator account")?;

        writeln!(out, "\nAvailable commands:")?;
        for category in self.table.categories() {
            writeln!(out, "\n{}:", category.title())?;
            for entry in category.entries() {
                writeln!(out, "  {:15} - {}", entry.key(), entry.description())?;
            }
        }
        Ok(())
    }

    fn print_search_path(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, "Executable search directories:")?;
        for (i, dir) in self.locator.search_dirs().iter().enumerate() {
            writeln!(out, "  {}. {}", i + 1, dir.display())?;
        }
        Ok(())
    }

    /// `[dir]$ `, with the home directory shown as `~` and `#` when elevated.
    pub fn prompt(&self) -> String {
        let dir = &self.env.current_dir;
        let mut shown = match self.env.home_dir() {
            Some(home) => match dir.strip_prefix(&home) {
                Ok(rest) if rest.as_os_str().is_empty() => "~".to_string(),
                Ok(rest) => format!("~{MAIN_SEPARATOR}{}", rest.display()),
                Err(_) => dir.display().to_string(),
            },
            None => dir.display().to_string(),
        };
        if cfg!(windows) {
            shown = shown.replace('/', "\\");
        }
        let marker = if self.env.elevated { '#' } else { '$' };
        format!("[{shown}]{marker} ")
    }

    /// Interactive loop until `exit`, `quit` or end of input.
    pub fn repl(&mut self) -> rustyline::Result<()> {
        let mut rl = DefaultEditor::new()?;

        println!("POSIX command translator");
        println!("Type 'help' for available commands, 'exit' to quit");
        if self.env.elevated {
            println!("*** Running with administrator privileges ***");
        }

        while !self.env.should_exit {
            match rl.readline(&self.prompt()) {
                Ok(line) => {
                    if !line.trim().is_empty() {
                        rl.add_history_entry(line.as_str())?;
                    }
                    match self.execute_line(&line) {
                        Flow::Exit => break,
                        Flow::ClearScreen => rl.clear_screen()?,
                        Flow::Continue(_) => {}
                    }
                }
                Err(ReadlineError::Interrupted) => println!("^C"),
                Err(ReadlineError::Eof) => break,
                Err(err) => return Err(err),
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::lock_current_dir;
    use crate::supervisor::EXIT_INTERRUPTED;
    use std::collections::HashMap;
    use std::fs;
    use std::thread;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    const TABLE: &str = r#"
        passthrough = "raw"

        [[category]]
        name = "file_operations"
        entries = [
          { pattern = "cd", internal = true, description = "Change directory" },
          { pattern = "pwd", internal = true, description = "Print working directory" },
          { pattern = "touch", internal = true, description = "Create empty files" },
          { pattern = "sudo", internal = true },
          { pattern = "fail", target = ["sh", "-c", "exit 3"] },
          { pattern = "say", target = ["sh", "-c", "echo \"$0 $*\" > said", "said"] },
          { pattern = "say twice", target = ["sh", "-c", "echo twice > said"], forward_args = false },
          { pattern = "nap", target = ["sleep", "10"], forward_args = false },
        ]
    "#;

    fn interpreter_in(dir: &Path, elevated: bool, grace: Duration) -> Interpreter {
        let mut vars = HashMap::new();
        vars.insert("HOME".to_string(), dir.join("home").display().to_string());
        let env = Environment {
            vars,
            current_dir: dir.to_path_buf(),
            should_exit: false,
            elevated,
        };
        let mut config = Config::new(TranslationTable::from_toml_str(TABLE).unwrap());
        config.grace_period = grace;
        let locator = Locator::from_env(&Environment::new());
        Interpreter::with_parts(env, config, locator, Interrupt::new()).unwrap()
    }

    fn interpreter(dir: &Path) -> Interpreter {
        interpreter_in(dir, false, Duration::from_millis(300))
    }

    fn execute(interp: &mut Interpreter, line: &str) -> (Flow, String, String) {
        let (mut out, mut err) = (Vec::new(), Vec::new());
        let flow = interp.execute_line_with_output(line, &mut Streams::new(&mut out, &mut err));
        (
            flow,
            String::from_utf8(out).unwrap(),
            String::from_utf8(err).unwrap(),
        )
    }

    #[test]
    fn test_unknown_handler_is_rejected() {
        let table = TranslationTable::from_toml_str(
            r#"
            [[category]]
            name = "x"
            entries = [{ pattern = "whoami", internal = true }]
            "#,
        )
        .unwrap();
        let result = Interpreter::with_parts(
            Environment::new(),
            Config::new(table),
            Locator::with_dirs(Vec::new()),
            Interrupt::new(),
        );
        assert!(matches!(
            result,
            Err(TableError::UnknownHandler { ref handler, .. }) if handler == "whoami"
        ));
    }

    #[test]
    fn test_bundled_table_handlers_exist() {
        let config = Config::new(TranslationTable::bundled().unwrap());
        assert!(Interpreter::new(config, Interrupt::new()).is_ok());
    }

    #[test]
    fn test_control_phrases() {
        let temp = TempDir::new().unwrap();
        let mut interp = interpreter(temp.path());

        assert_eq!(execute(&mut interp, "  CLEAR ").0, Flow::ClearScreen);

        let (flow, out, _) = execute(&mut interp, "Help");
        assert_eq!(flow, Flow::Continue(0));
        assert!(out.contains("File Operations:"), "{out}");
        assert!(out.contains("  pwd             - Print working directory"), "{out}");
        assert!(out.contains("raw <command>"), "{out}");

        let (flow, out, _) = execute(&mut interp, "path");
        assert_eq!(flow, Flow::Continue(0));
        assert!(out.starts_with("Executable search directories:"));

        assert_eq!(execute(&mut interp, "quit").0, Flow::Exit);
        assert!(interp.env().should_exit);
    }

    #[test]
    fn test_blank_line_is_a_no_op() {
        let temp = TempDir::new().unwrap();
        let mut interp = interpreter(temp.path());
        assert_eq!(execute(&mut interp, "   "), (Flow::Continue(0), String::new(), String::new()));
    }

    #[test]
    fn test_parse_error_is_reported() {
        let temp = TempDir::new().unwrap();
        let mut interp = interpreter(temp.path());
        let (flow, _, err) = execute(&mut interp, "touch \"unterminated");
        assert_eq!(flow, Flow::Continue(EXIT_FAILURE));
        assert!(err.starts_with("Error parsing command: "), "{err}");
    }

    #[test]
    fn test_unknown_command_is_127() {
        let temp = TempDir::new().unwrap();
        let mut interp = interpreter(temp.path());
        let (flow, _, err) = execute(&mut interp, "cmd-bridge-no-such-tool-31 --flag");
        assert_eq!(flow, Flow::Continue(EXIT_NOT_FOUND));
        assert_eq!(
            err,
            "Command not found: cmd-bridge-no-such-tool-31\nType 'help' to see available commands\n"
        );

        // the session keeps going
        let (flow, out, err) = execute(&mut interp, "pwd");
        assert_eq!(flow, Flow::Continue(0), "{err}");
        assert_eq!(out, format!("{}\n", temp.path().display()));
    }

    #[test]
    #[cfg(unix)]
    fn test_non_zero_exit_is_reported() {
        let temp = TempDir::new().unwrap();
        let mut interp = interpreter(temp.path());
        let (flow, _, err) = execute(&mut interp, "fail");
        assert_eq!(flow, Flow::Continue(3));
        assert_eq!(err, "Command exited with code 3\n");
    }

    #[test]
    #[cfg(unix)]
    fn test_translated_command_forwards_arguments() {
        let temp = TempDir::new().unwrap();
        let mut interp = interpreter(temp.path());

        let (flow, _, err) = execute(&mut interp, "say hello 'big world'");
        assert_eq!(flow, Flow::Continue(0), "{err}");
        assert_eq!(
            fs::read_to_string(temp.path().join("said")).unwrap(),
            "said hello big world\n"
        );
    }

    #[test]
    #[cfg(unix)]
    fn test_exact_match_drops_arguments_when_not_forwarding() {
        let temp = TempDir::new().unwrap();
        let mut interp = interpreter(temp.path());

        let (flow, _, err) = execute(&mut interp, "say twice extra");
        assert_eq!(flow, Flow::Continue(0), "{err}");
        assert_eq!(fs::read_to_string(temp.path().join("said")).unwrap(), "twice\n");
    }

    #[test]
    #[cfg(unix)]
    fn test_located_command_runs_in_logical_dir() {
        let temp = TempDir::new().unwrap();
        let mut interp = interpreter(temp.path());

        let (flow, _, err) = execute(&mut interp, "mkdir made-here");
        assert_eq!(flow, Flow::Continue(0), "{err}");
        assert!(temp.path().join("made-here").is_dir());
    }

    #[test]
    #[cfg(unix)]
    fn test_relative_path_is_located_from_logical_dir() {
        use std::os::unix::fs::PermissionsExt;
        let temp = TempDir::new().unwrap();
        let script = temp.path().join("tool.sh");
        fs::write(&script, "#!/bin/sh\nexit 9\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        let mut interp = interpreter(temp.path());

        let (flow, _, _) = execute(&mut interp, "./tool.sh");
        assert_eq!(flow, Flow::Continue(9));
    }

    #[test]
    #[cfg(unix)]
    fn test_passthrough_runs_text_verbatim() {
        let temp = TempDir::new().unwrap();
        let mut interp = interpreter(temp.path());

        let (flow, _, err) = execute(&mut interp, "raw echo $((2 + 3)) > sum");
        assert_eq!(flow, Flow::Continue(0), "{err}");
        assert_eq!(fs::read_to_string(temp.path().join("sum")).unwrap(), "5\n");
    }

    #[test]
    fn test_passthrough_word_alone_is_resolved_normally() {
        let temp = TempDir::new().unwrap();
        let mut interp = interpreter(temp.path());
        assert_eq!(interp.passthrough_script("raw"), None);
        assert_eq!(interp.passthrough_script("raw   "), None);
        assert_eq!(interp.passthrough_script("raws ls"), None);
        assert_eq!(interp.passthrough_script("raw  ls -l "), Some("ls -l"));
    }

    #[test]
    fn test_cd_then_pwd() {
        let _lock = lock_current_dir();
        let orig = std::env::current_dir().unwrap();
        let temp = TempDir::new().unwrap();
        fs::create_dir(temp.path().join("sub")).unwrap();
        let mut interp = interpreter(temp.path());

        assert_eq!(execute(&mut interp, "cd sub").0, Flow::Continue(0));
        let (flow, out, _) = execute(&mut interp, "pwd");
        assert_eq!(flow, Flow::Continue(0));
        assert_eq!(out, format!("{}\n", temp.path().join("sub").display()));
        std::env::set_current_dir(orig).expect("failed to restore cwd");
    }

    #[test]
    #[cfg(unix)]
    fn test_sudo_refuses_translated_command_when_not_elevated() {
        let temp = TempDir::new().unwrap();
        let mut interp = interpreter(temp.path());
        let (flow, _, err) = execute(&mut interp, "sudo say hi");
        assert_eq!(flow, Flow::Continue(EXIT_FAILURE));
        assert!(err.starts_with("Error executing command: "), "{err}");
        assert!(!temp.path().join("said").exists());
    }

    #[test]
    #[cfg(unix)]
    fn test_interrupt_during_translated_command() {
        let temp = TempDir::new().unwrap();
        let mut interp = interpreter(temp.path());
        let interrupt = interp.supervisor().interrupt().clone();
        let raiser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            interrupt.raise();
        });

        let started = Instant::now();
        let (flow, _, err) = execute(&mut interp, "nap");
        raiser.join().unwrap();

        assert_eq!(flow, Flow::Continue(EXIT_INTERRUPTED));
        assert_eq!(err, "Command exited with code 130\n");
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!interp.supervisor().is_running());

        // the session keeps going
        assert_eq!(execute(&mut interp, "fail").0, Flow::Continue(3));
    }

    #[test]
    fn test_prompt_abbreviates_home() {
        let temp = TempDir::new().unwrap();
        let home = temp.path().join("home");
        let mut interp = interpreter(temp.path());

        interp.env_mut().current_dir = home.clone();
        assert_eq!(interp.prompt(), "[~]$ ");

        interp.env_mut().current_dir = home.join("src");
        assert_eq!(interp.prompt(), format!("[~{MAIN_SEPARATOR}src]$ "));

        interp.env_mut().current_dir = temp.path().to_path_buf();
        let elevated = interpreter_in(temp.path(), true, Duration::from_millis(300));
        assert_eq!(elevated.prompt(), format!("[{}]# ", temp.path().display()));
    }
}
