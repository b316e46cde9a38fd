//! A shell front-end that runs POSIX-style command lines as host-native commands.
//!
//! Each typed line is tokenized with shell-style quoting and resolved against a
//! [`TranslationTable`]: an exact pattern, then the most specific word prefix,
//! then the first word alone. Matches either map to a built-in handler (`cd`,
//! `pwd`, `touch`, `sudo`, ...) or to a host invocation. Lines that match
//! nothing are looked up on the search path by the [`Locator`]. Every child
//! process is run by the [`Supervisor`], which can be interrupted with Ctrl+C
//! without ending the session.
//!
//! The main entry point is [`Interpreter`]. The table is plain data, see
//! [`table`] for its TOML format.

mod builtin;
pub mod command;
pub mod config;
pub mod env;
mod interpreter;
pub mod interrupt;
pub mod lexer;
pub mod locator;
pub mod resolver;
pub mod supervisor;
pub mod table;

pub use config::{Args, Config};
pub use interpreter::{Flow, Interpreter};
pub use interrupt::Interrupt;
pub use locator::Locator;
pub use resolver::{Resolution, resolve};
pub use supervisor::{ExecError, RunOptions, Supervisor};
pub use table::{Category, TableError, TranslationEntry, TranslationTable};
