//! The translation table: which POSIX command lines map to which host invocations.
//!
//! The table is data, not logic. It is read once from TOML and never mutated
//! afterwards, so the resolver can treat it as a pure input.
//!
//! ```toml
//! passthrough = "win"
//!
//! [[category]]
//! name = "filesystem"
//! entries = [
//!   { pattern = "ls", target = ["cmd", "/c", "dir"], description = "List directory contents" },
//!   { pattern = "ls -la", target = ["cmd", "/c", "dir", "/a"], forward_args = false },
//!   { pattern = "cd", internal = true },
//! ]
//! ```
//!
//! Iteration order is category declaration order, then entry declaration order.
//! The resolver breaks specificity ties by that order, so it is part of the
//! table's contract.

use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

const BUNDLED_TABLE: &str = include_str!("../data/translations.toml");

/// Errors raised while loading or validating a table.
#[derive(Debug, Error)]
pub enum TableError {
    #[error("can't read translation table {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed translation table: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("category '{category}' contains an entry with an empty pattern")]
    EmptyPattern { category: String },

    #[error("entry '{pattern}' is not internal but has no target invocation")]
    EmptyTarget { pattern: String },

    #[error("internal entry '{pattern}' names no built-in handler '{handler}'")]
    UnknownHandler { pattern: String, handler: String },
}

/// One mapping from a POSIX command pattern to a host invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslationEntry {
    key: String,
    pattern: Vec<String>,
    target: Vec<String>,
    description: String,
    forward_args: bool,
    internal: bool,
}

impl TranslationEntry {
    /// Creates an external entry that forwards leftover arguments.
    pub fn new(pattern: &str, target: &[&str]) -> Self {
        Self {
            key: pattern.trim().to_string(),
            pattern: pattern.split_whitespace().map(str::to_string).collect(),
            target: target.iter().map(|s| s.to_string()).collect(),
            description: String::new(),
            forward_args: true,
            internal: false,
        }
    }

    /// Creates an entry handled by the built-in handler named by the pattern's
    /// first word.
    pub fn internal(pattern: &str) -> Self {
        Self {
            internal: true,
            forward_args: false,
            ..Self::new(pattern, &[])
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_forward_args(mut self, forward_args: bool) -> Self {
        self.forward_args = forward_args;
        self
    }

    /// The pattern exactly as declared, used for full-line matches.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn pattern(&self) -> &[String] {
        &self.pattern
    }

    pub fn target(&self) -> &[String] {
        &self.target
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn forward_args(&self) -> bool {
        self.forward_args
    }

    pub fn is_internal(&self) -> bool {
        self.internal
    }

    /// Name of the built-in handler for an internal entry.
    pub fn handler(&self) -> Option<&str> {
        if self.internal {
            self.pattern.first().map(String::as_str)
        } else {
            None
        }
    }
}

/// A named, ordered group of entries. Only used for ordering and help output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Category {
    name: String,
    entries: Vec<TranslationEntry>,
}

impl Category {
    pub fn new(name: impl Into<String>, entries: Vec<TranslationEntry>) -> Self {
        Self {
            name: name.into(),
            entries,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entries(&self) -> &[TranslationEntry] {
        &self.entries
    }

    /// `file_operations` becomes `File Operations`.
    pub fn title(&self) -> String {
        self.name
            .split('_')
            .filter(|w| !w.is_empty())
            .map(|w| {
                let mut chars = w.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                    None => String::new(),
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Immutable translation table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranslationTable {
    categories: Vec<Category>,
    passthrough: Option<String>,
}

impl TranslationTable {
    /// Builds a table from already-constructed categories, validating entries.
    pub fn new(categories: Vec<Category>) -> Result<Self, TableError> {
        let table = Self {
            categories,
            passthrough: None,
        };
        table.validate()?;
        Ok(table)
    }

    /// The POSIX-to-Windows table compiled into the binary.
    pub fn bundled() -> Result<Self, TableError> {
        Self::from_toml_str(BUNDLED_TABLE)
    }

    /// Reads and parses a table file.
    pub fn load(path: &Path) -> Result<Self, TableError> {
        let text = std::fs::read_to_string(path).map_err(|source| TableError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, TableError> {
        let raw: RawTable = toml::from_str(text)?;
        let categories = raw
            .categories
            .into_iter()
            .map(|c| {
                let entries = c.entries.into_iter().map(RawEntry::into_entry).collect();
                Category::new(c.name, entries)
            })
            .collect();
        let table = Self {
            categories,
            passthrough: raw.passthrough,
        };
        table.validate()?;
        Ok(table)
    }

    fn validate(&self) -> Result<(), TableError> {
        let mut seen = HashSet::new();
        for category in &self.categories {
            for entry in &category.entries {
                if entry.pattern.is_empty() {
                    return Err(TableError::EmptyPattern {
                        category: category.name.clone(),
                    });
                }
                if !entry.internal && entry.target.is_empty() {
                    return Err(TableError::EmptyTarget {
                        pattern: entry.key.clone(),
                    });
                }
                if !seen.insert(entry.key.as_str()) {
                    tracing::warn!(
                        pattern = %entry.key,
                        category = %category.name,
                        "duplicate pattern; the first declaration wins"
                    );
                }
            }
        }
        Ok(())
    }

    pub fn categories(&self) -> &[Category] {
        &self.categories
    }

    /// Every entry in resolution order.
    pub fn entries(&self) -> impl Iterator<Item = &TranslationEntry> {
        self.categories.iter().flat_map(|c| c.entries.iter())
    }

    /// First entry whose declared pattern equals `key` verbatim.
    pub fn find_key(&self, key: &str) -> Option<&TranslationEntry> {
        self.entries().find(|e| e.key == key)
    }

    /// Word that sends the rest of a line to the host shell untranslated.
    pub fn passthrough(&self) -> Option<&str> {
        self.passthrough.as_deref()
    }

    pub fn len(&self) -> usize {
        self.categories.iter().map(|c| c.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTable {
    passthrough: Option<String>,
    #[serde(default, rename = "category")]
    categories: Vec<RawCategory>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCategory {
    name: String,
    #[serde(default)]
    entries: Vec<RawEntry>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawEntry {
    pattern: String,
    #[serde(default)]
    target: Vec<String>,
    #[serde(default)]
    description: String,
    #[serde(default = "default_forward_args")]
    forward_args: bool,
    #[serde(default)]
    internal: bool,
}

fn default_forward_args() -> bool {
    true
}

impl RawEntry {
    fn into_entry(self) -> TranslationEntry {
        TranslationEntry {
            key: self.pattern.trim().to_string(),
            pattern: self.pattern.split_whitespace().map(str::to_string).collect(),
            target: self.target,
            description: self.description,
            forward_args: self.forward_args,
            internal: self.internal,
        }
    }
}
