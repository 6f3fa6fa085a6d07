//! One typed command: an owned, ordered argument list.

use std::ffi::CString;

use crate::errors::ShellError;

/// Upper bound on arguments per command; extra tokens are dropped.
pub const MAX_ARGS: usize = 164;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    argv: Vec<String>,
}

impl Command {
    /// Tokenize one line (or one pipe segment) on whitespace runs.
    pub fn create(line: &str) -> Result<Command, ShellError> {
        let argv: Vec<String> = line
            .split_whitespace()
            .take(MAX_ARGS)
            .map(str::to_owned)
            .collect();
        if argv.is_empty() {
            return Err(ShellError::EmptyInput);
        }
        Ok(Command { argv })
    }

    /// Wrap an already-tokenized argument list (redirection trimming).
    pub(crate) fn from_args(argv: Vec<String>) -> Command {
        debug_assert!(!argv.is_empty());
        Command { argv }
    }

    pub fn argc(&self) -> usize {
        self.argv.len()
    }

    /// Bounds-checked accessor; out-of-range indices are `None`, never a
    /// panic.
    pub fn arg(&self, index: usize) -> Option<&str> {
        self.argv.get(index).map(String::as_str)
    }

    pub fn args(&self) -> &[String] {
        &self.argv
    }

    /// The command name. Construction guarantees at least one argument.
    pub fn name(&self) -> &str {
        &self.argv[0]
    }

    pub fn is_valid(&self) -> bool {
        (1..=MAX_ARGS).contains(&self.argv.len())
    }

    /// The argument vector as it will be handed to process replacement.
    pub fn to_exec_argv(&self) -> Result<Vec<CString>, ShellError> {
        self.argv
            .iter()
            .map(|arg| CString::new(arg.as_str()).map_err(|_| ShellError::InvalidArgument))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_whitespace_runs() {
        let cmd = Command::create("  cat   notes.txt\t\n").expect("create");
        assert_eq!(cmd.argc(), 2);
        assert_eq!(cmd.arg(0), Some("cat"));
        assert_eq!(cmd.arg(1), Some("notes.txt"));
        assert!(cmd.is_valid());
    }

    #[test]
    fn rejects_blank_input() {
        assert!(matches!(Command::create(""), Err(ShellError::EmptyInput)));
        assert!(matches!(
            Command::create("   \t "),
            Err(ShellError::EmptyInput)
        ));
    }

    #[test]
    fn out_of_range_access_is_none() {
        let cmd = Command::create("test command").expect("create");
        assert_eq!(cmd.arg(2), None);
        assert_eq!(cmd.arg(usize::MAX), None);
    }

    #[test]
    fn caps_the_argument_count() {
        let line = vec!["a"; MAX_ARGS + 20].join(" ");
        let cmd = Command::create(&line).expect("create");
        assert_eq!(cmd.argc(), MAX_ARGS);
        assert!(cmd.is_valid());
    }

    #[test]
    fn exec_argv_matches_tokens() {
        let cmd = Command::create("wc -l").expect("create");
        let argv = cmd.to_exec_argv().expect("argv");
        assert_eq!(argv.len(), 2);
        assert_eq!(argv[0].to_bytes(), b"wc");
        assert_eq!(argv[1].to_bytes(), b"-l");
    }
}
