//! Mapping of a typed line onto a translation table entry.

use crate::lexer::{self, LexingError};
use crate::table::{TranslationEntry, TranslationTable};

/// What a line resolved to. Produced fresh per line; holds no engine state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The line contained no words.
    Empty,
    /// A built-in handler. `name` is the first word as typed.
    Internal { name: String, args: Vec<String> },
    /// A table entry with an external target.
    Translated {
        target: Vec<String>,
        forward_args: bool,
        leftover: Vec<String>,
    },
    /// No entry applies; the caller should try the executable locator.
    Unmatched { name: String, args: Vec<String> },
}

impl Resolution {
    /// Final argv of a translated entry: the target, followed by the leftover
    /// arguments only when the entry forwards them.
    pub fn invocation(&self) -> Option<Vec<String>> {
        match self {
            Resolution::Translated {
                target,
                forward_args,
                leftover,
            } => {
                let mut argv = target.clone();
                if *forward_args {
                    argv.extend(leftover.iter().cloned());
                }
                Some(argv)
            }
            _ => None,
        }
    }
}

/// Resolves `line` against `table`.
///
/// Priority: a line equal to a pattern verbatim; then the longest pattern that
/// is a word-for-word prefix of the line (first declared wins ties); then the
/// first word alone. A quoting error aborts resolution for this line.
pub fn resolve(line: &str, table: &TranslationTable) -> Result<Resolution, LexingError> {
    let words = lexer::split_into_words(line)?;
    if words.is_empty() {
        return Ok(Resolution::Empty);
    }

    if let Some(entry) = table.find_key(line.trim()) {
        tracing::debug!(pattern = entry.key(), "exact match");
        return Ok(matched(entry, &words));
    }

    let mut best: Option<&TranslationEntry> = None;
    for entry in table.entries() {
        let pattern = entry.pattern();
        if words.starts_with(pattern) && best.is_none_or(|b| pattern.len() > b.pattern().len()) {
            best = Some(entry);
        }
    }
    if let Some(entry) = best {
        tracing::debug!(pattern = entry.key(), score = entry.pattern().len(), "prefix match");
        return Ok(matched(entry, &words));
    }

    if let Some(entry) = table.find_key(&words[0]) {
        tracing::debug!(pattern = entry.key(), "base command match");
        return Ok(matched(entry, &words));
    }

    tracing::debug!(name = %words[0], "no table entry");
    let mut words = words.into_iter();
    let name = words.next().unwrap_or_default();
    Ok(Resolution::Unmatched {
        name,
        args: words.collect(),
    })
}

fn matched(entry: &TranslationEntry, words: &[String]) -> Resolution {
    let consumed = entry.pattern().len().min(words.len());
    let leftover = words[consumed..].to_vec();
    if entry.is_internal() {
        Resolution::Internal {
            name: words[0].clone(),
            args: leftover,
        }
    } else {
        if !entry.forward_args() && !leftover.is_empty() {
            tracing::debug!(pattern = entry.key(), ?leftover, "entry drops extra arguments");
        }
        Resolution::Translated {
            target: entry.target().to_vec(),
            forward_args: entry.forward_args(),
            leftover,
        }
    }
}
