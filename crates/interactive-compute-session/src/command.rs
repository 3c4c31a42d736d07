//! Command line building for `RUN` tasks.

use std::fmt;

use thiserror::Error;

/// Command line build error.
#[derive(Debug, Error)]
pub enum CommandLineError {
    #[error("Command line cannot be parsed: {0}")]
    InvalidBase(String),
    #[error("Command line is empty after parsing")]
    EmptyCommand,
    #[error("Failed to quote command: {0}")]
    QuoteError(#[from] shlex::QuoteError),
}

/// A program and its arguments, rendered as one shell-quoted line.
///
/// The worker splits `RUN` payloads on unquoted spaces, so every argument is
/// quoted on the way out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    program: String,
    args: Vec<String>,
    rendered: String,
}

impl CommandLine {
    /// Build from a program and arguments.
    ///
    /// # Errors
    /// Returns error if a part contains a NUL byte.
    pub fn new<I>(program: impl Into<String>, args: I) -> Result<Self, CommandLineError>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let program = program.into();
        if program.is_empty() {
            return Err(CommandLineError::EmptyCommand);
        }
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        let rendered = shlex::try_join(
            std::iter::once(program.as_str()).chain(args.iter().map(String::as_str)),
        )?;
        Ok(Self {
            program,
            args,
            rendered,
        })
    }

    /// Parse a shell-style command line.
    ///
    /// # Errors
    /// Returns error if quoting is unbalanced or the line is empty.
    pub fn parse(input: &str) -> Result<Self, CommandLineError> {
        let mut parts = shlex::split(input)
            .ok_or_else(|| CommandLineError::InvalidBase(input.to_string()))?;
        if parts.is_empty() {
            return Err(CommandLineError::EmptyCommand);
        }
        let program = parts.remove(0);
        Self::new(program, parts)
    }

    /// Append arguments.
    ///
    /// # Errors
    /// Returns error if an argument contains a NUL byte.
    pub fn extend_args<I>(self, more: I) -> Result<Self, CommandLineError>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let Self { program, mut args, .. } = self;
        args.extend(more.into_iter().map(Into::into));
        Self::new(program, args)
    }

    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// The quoted line sent as the `RUN` payload.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.rendered
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rendered)
    }
}
