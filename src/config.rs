//! Command-line surface of the binary and the settings derived from it.

use crate::supervisor::DEFAULT_GRACE_PERIOD;
use crate::table::{TableError, TranslationTable};
use argh::FromArgs;
use std::path::PathBuf;
use std::time::Duration;

/// Passthrough prefix used when neither the flag nor the table names one.
pub const DEFAULT_PASSTHROUGH: &str = "native";

#[derive(FromArgs, Debug, PartialEq)]
/// Type POSIX command lines and run their native equivalents.
pub struct Args {
    #[argh(option, short = 't')]
    /// translation table (TOML) to use instead of the bundled one.
    pub table: Option<PathBuf>,

    #[argh(option, default = "3000")]
    /// milliseconds an interrupted command gets to exit before it is killed.
    pub grace_ms: u64,

    #[argh(option)]
    /// word that sends the rest of a line to the native shell untranslated.
    pub passthrough: Option<String>,

    #[argh(option, short = 'c')]
    /// run one command line and exit with its status.
    pub command: Option<String>,
}

/// Settings the interpreter is built from.
#[derive(Debug, Clone)]
pub struct Config {
    pub table: TranslationTable,
    pub grace_period: Duration,
    pub passthrough: String,
}

impl Config {
    /// Defaults around `table`: its own passthrough word, else [`DEFAULT_PASSTHROUGH`].
    pub fn new(table: TranslationTable) -> Self {
        let passthrough = table.passthrough().unwrap_or(DEFAULT_PASSTHROUGH).to_string();
        Self {
            table,
            grace_period: DEFAULT_GRACE_PERIOD,
            passthrough,
        }
    }

    pub fn from_args(args: &Args) -> Result<Self, TableError> {
        let table = match &args.table {
            Some(path) => TranslationTable::load(path)?,
            None => TranslationTable::bundled()?,
        };

        let mut config = Self::new(table);
        config.grace_period = Duration::from_millis(args.grace_ms);
        if let Some(word) = &args.passthrough {
            config.passthrough = word.clone();
        }
        Ok(config)
    }
}
