use crate::interpreter::Interpreter;
use std::io::Write;

/// Conventional process exit code type used by this crate.
///
/// A value of 0 indicates success; any non-zero value indicates failure.
pub type ExitCode = i32;

/// Where a command writes: regular output and diagnostics.
pub struct Streams<'a> {
    pub out: &'a mut dyn Write,
    pub err: &'a mut dyn Write,
}

impl<'a> Streams<'a> {
    pub fn new(out: &'a mut dyn Write, err: &'a mut dyn Write) -> Self {
        Self { out, err }
    }
}

/// Object-safe trait for an internal command ready to run in-process.
pub trait ExecutableCommand {
    /// Executes the command against the interpreter's state.
    ///
    /// Failures are reported on `io.err` and folded into the exit code; an
    /// internal command never aborts the session.
    fn execute(self: Box<Self>, interp: &mut Interpreter, io: &mut Streams<'_>) -> ExitCode;
}

/// Factory that creates an internal command from a name and its arguments.
///
/// Returns `None` when the factory doesn't recognize the `name`.
pub trait CommandFactory {
    /// Name of the handler this factory builds.
    fn name(&self) -> &'static str;

    /// Attempt to create a command instance for the provided name and arguments.
    fn try_create(&self, name: &str, args: &[&str]) -> Option<Box<dyn ExecutableCommand>>;
}
