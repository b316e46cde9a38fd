//! Quote-aware splitting of a command line into words.
//!
//! Follows POSIX shell quoting rules and nothing else: no expansions, no
//! operators. The result is the argv a user meant to type.

use thiserror::Error;

/// Errors that can occur while splitting a line.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LexingError {
    /// A closing quote (single or double) was not found.
    #[error("no closing quotation")]
    UnfinishedQuote,
    /// The line ended right after a backslash.
    #[error("no escaped character")]
    UnfinishedEscape,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LexingState {
    Start,
    ReadingWord,
    ReadingSingleQuote,
    ReadingDoubleQuote,
}

struct LexingFSM {
    input: Vec<char>,
    pos: usize,
    state: LexingState,
    buffer: String,
}

impl LexingFSM {
    fn new(line: &str) -> Self {
        LexingFSM {
            input: line.chars().collect(),
            pos: 0,
            state: LexingState::Start,
            buffer: String::new(),
        }
    }

    /// Runs the machine over the whole input and returns the collected words.
    fn make_words(&mut self) -> Result<Vec<String>, LexingError> {
        let mut out = Vec::new();

        while let Some(ch) = self.read_char() {
            match self.state {
                LexingState::Start => self.handle_start(ch)?,
                LexingState::ReadingWord => self.handle_word(ch, &mut out)?,
                LexingState::ReadingSingleQuote => self.handle_single_quote(ch),
                LexingState::ReadingDoubleQuote => self.handle_double_quote(ch)?,
            }
        }

        match self.state {
            LexingState::ReadingSingleQuote | LexingState::ReadingDoubleQuote => {
                return Err(LexingError::UnfinishedQuote);
            }
            LexingState::ReadingWord => out.push(std::mem::take(&mut self.buffer)),
            LexingState::Start => {}
        }

        Ok(out)
    }

    fn read_char(&mut self) -> Option<char> {
        let ch = self.input.get(self.pos).copied();
        if ch.is_some() {
            self.pos += 1;
        }
        ch
    }

    fn peek_char(&self) -> Option<char> {
        self.input.get(self.pos).copied()
    }

    fn handle_start(&mut self, ch: char) -> Result<(), LexingError> {
        match ch {
            c if c.is_whitespace() => {}
            '\'' => self.state = LexingState::ReadingSingleQuote,
            '"' => self.state = LexingState::ReadingDoubleQuote,
            '\\' => {
                self.push_escaped()?;
                self.state = LexingState::ReadingWord;
            }
            c => {
                self.buffer.push(c);
                self.state = LexingState::ReadingWord;
            }
        }
        Ok(())
    }

    fn handle_word(&mut self, ch: char, out: &mut Vec<String>) -> Result<(), LexingError> {
        match ch {
            c if c.is_whitespace() => {
                out.push(std::mem::take(&mut self.buffer));
                self.state = LexingState::Start;
            }
            '\'' => self.state = LexingState::ReadingSingleQuote,
            '"' => self.state = LexingState::ReadingDoubleQuote,
            '\\' => self.push_escaped()?,
            c => self.buffer.push(c),
        }
        Ok(())
    }

    fn handle_single_quote(&mut self, ch: char) {
        match ch {
            '\'' => self.state = LexingState::ReadingWord,
            c => self.buffer.push(c),
        }
    }

    fn handle_double_quote(&mut self, ch: char) -> Result<(), LexingError> {
        match ch {
            '"' => self.state = LexingState::ReadingWord,
            '\\' => match self.peek_char() {
                Some('\\' | '"' | '$' | '`') => {
                    self.push_escaped()?;
                }
                Some('\n') => {
                    // line continuation
                    self.read_char();
                }
                Some(_) => self.buffer.push('\\'),
                None => return Err(LexingError::UnfinishedQuote),
            },
            c => self.buffer.push(c),
        }
        Ok(())
    }

    /// Consumes the character after a backslash and appends it literally.
    fn push_escaped(&mut self) -> Result<(), LexingError> {
        match self.read_char() {
            Some(c) => {
                self.buffer.push(c);
                Ok(())
            }
            None => Err(LexingError::UnfinishedEscape),
        }
    }
}

/// Splits `line` into words the way a POSIX shell would before expansion.
///
/// Adjacent quoted and unquoted runs form a single word, so `a"b c"'d'` is one
/// word `ab cd`. An explicitly quoted empty string (`''`) yields an empty word.
pub fn split_into_words(line: &str) -> Result<Vec<String>, LexingError> {
    let mut lexer = LexingFSM::new(line);
    lexer.make_words()
}

/// Inverse of [`split_into_words`]: quotes each word so that splitting the
/// result gives the same words back.
///
/// Returns `None` when a word cannot be represented (it contains a NUL byte).
pub fn join_words<S: AsRef<str>>(words: &[S]) -> Option<String> {
    shlex::try_join(words.iter().map(AsRef::as_ref)).ok()
}
