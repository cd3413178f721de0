//! Commands, acceptable exit codes and command results

use crate::errors::{HarnessError, Result};
use std::collections::BTreeSet;
use std::fmt;

/// Shell used for [`ShellCommand::Shell`] commands
pub const DEFAULT_SHELL: &str = "/bin/sh";

/// A command to run inside a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellCommand {
    /// Command line interpreted by `/bin/sh -c` (pipes, `&`, `$VARS` work)
    Shell(String),
    /// Argument vector executed without a shell
    Argv(Vec<String>),
}

impl ShellCommand {
    /// Build a shell command
    pub fn shell(script: impl Into<String>) -> Self {
        Self::Shell(script.into())
    }

    /// Build an argv command
    pub fn argv<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Argv(args.into_iter().map(Into::into).collect())
    }

    /// Argument vector handed to the runtime's exec
    pub fn to_argv(&self) -> Vec<String> {
        match self {
            Self::Shell(script) => vec![
                DEFAULT_SHELL.to_string(),
                "-c".to_string(),
                script.clone(),
            ],
            Self::Argv(args) => args.clone(),
        }
    }

    /// Whether there is anything to run
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Shell(script) => script.trim().is_empty(),
            Self::Argv(args) => args.is_empty(),
        }
    }
}

impl fmt::Display for ShellCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shell(script) => f.write_str(script),
            Self::Argv(args) => f.write_str(&shell_words::join(args)),
        }
    }
}

impl From<&str> for ShellCommand {
    fn from(script: &str) -> Self {
        Self::Shell(script.to_string())
    }
}

impl From<String> for ShellCommand {
    fn from(script: String) -> Self {
        Self::Shell(script)
    }
}

impl From<&String> for ShellCommand {
    fn from(script: &String) -> Self {
        Self::Shell(script.clone())
    }
}

impl From<Vec<String>> for ShellCommand {
    fn from(args: Vec<String>) -> Self {
        Self::Argv(args)
    }
}

impl<const N: usize> From<[&str; N]> for ShellCommand {
    fn from(args: [&str; N]) -> Self {
        Self::argv(args)
    }
}

/// Non-empty set of exit codes a command may produce without failing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitCodes(BTreeSet<i32>);

impl ExitCodes {
    /// Create a set from the given codes; an empty set is rejected
    pub fn new<I: IntoIterator<Item = i32>>(codes: I) -> Result<Self> {
        let codes: BTreeSet<i32> = codes.into_iter().collect();
        if codes.is_empty() {
            return Err(HarnessError::InvalidArgument {
                message: "acceptable exit code set cannot be empty".to_string(),
            });
        }
        Ok(Self(codes))
    }

    /// `{0}`
    pub fn success() -> Self {
        Self(BTreeSet::from([0]))
    }

    pub fn contains(&self, code: i32) -> bool {
        self.0.contains(&code)
    }

    pub fn iter(&self) -> impl Iterator<Item = i32> + '_ {
        self.0.iter().copied()
    }
}

impl Default for ExitCodes {
    fn default() -> Self {
        Self::success()
    }
}

impl From<i32> for ExitCodes {
    fn from(code: i32) -> Self {
        Self(BTreeSet::from([code]))
    }
}

impl fmt::Display for ExitCodes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let codes: Vec<String> = self.0.iter().map(|c| c.to_string()).collect();
        write!(f, "{{{}}}", codes.join(", "))
    }
}

/// Outcome of one command execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    /// Exit code of the command
    pub exit_code: i32,
    /// Standard output, captured in full
    pub stdout: String,
    /// Standard error, captured in full
    pub stderr: String,
}

impl CommandResult {
    /// Standard output with surrounding whitespace removed
    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }
}
