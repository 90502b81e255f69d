//! Argument string tokenizer.
//!
//! Commands take their arguments as one string. Tokens split on unquoted
//! whitespace. `'` and `"` group text into a single token and may start or
//! end in the middle of one; inside a quoted region the other quote character
//! is literal. A backslash before `'`, `"` or another backslash yields that
//! character literally, inside or outside quotes. Any other backslash is kept
//! as-is.

use std::path::Path;

use crate::error::ProcError;

/// Default upper bound on argv length, program path included.
pub const DEFAULT_MAX_ARGS: usize = 100;

#[derive(Debug, Clone, Copy)]
pub struct ArgTokenizer {
    max_args: usize,
}

impl Default for ArgTokenizer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ARGS)
    }
}

impl ArgTokenizer {
    pub fn new(max_args: usize) -> Self {
        Self { max_args }
    }

    /// Split `input` into arguments, not counting any program path.
    pub fn tokenize(&self, input: &str) -> Result<Vec<String>, ProcError> {
        let mut tokens = Vec::new();
        let mut current = String::new();
        let mut in_token = false;
        let mut quote: Option<char> = None;
        let mut chars = input.chars().peekable();

        while let Some(ch) = chars.next() {
            match ch {
                '\\' if matches!(chars.peek(), Some('\'' | '"' | '\\')) => {
                    if let Some(escaped) = chars.next() {
                        current.push(escaped);
                    }
                    in_token = true;
                }
                c if Some(c) == quote => quote = None,
                c if quote.is_some() => current.push(c),
                '\'' | '"' => {
                    quote = Some(ch);
                    in_token = true;
                }
                c if c.is_whitespace() => {
                    if in_token {
                        self.push_token(&mut tokens, std::mem::take(&mut current))?;
                        in_token = false;
                    }
                }
                c => {
                    current.push(c);
                    in_token = true;
                }
            }
        }

        if let Some(q) = quote {
            return Err(ProcError::Argument(format!(
                "unterminated {q} quote in arguments"
            )));
        }
        if in_token {
            self.push_token(&mut tokens, current)?;
        }
        Ok(tokens)
    }

    /// Build a full argv: the program path followed by the tokenized arguments.
    pub fn argv(&self, program: &Path, input: &str) -> Result<Vec<String>, ProcError> {
        let mut argv = Vec::with_capacity(8);
        argv.push(program.to_string_lossy().into_owned());
        argv.extend(self.tokenize(input)?);
        Ok(argv)
    }

    fn push_token(&self, tokens: &mut Vec<String>, token: String) -> Result<(), ProcError> {
        // argv[0] takes one slot
        if tokens.len() + 1 >= self.max_args {
            return Err(ProcError::Argument(format!(
                "too many arguments (limit {}); pass long lists through a response file",
                self.max_args
            )));
        }
        tokens.push(token);
        Ok(())
    }
}

/// Quote `arg` so that [`ArgTokenizer::tokenize`] yields it back as one token.
pub fn quote(arg: &str) -> String {
    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('\'');
    for ch in arg.chars() {
        if matches!(ch, '\'' | '\\') {
            quoted.push('\\');
        }
        quoted.push(ch);
    }
    quoted.push('\'');
    quoted
}
