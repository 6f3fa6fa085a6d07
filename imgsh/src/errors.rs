use exfat::VolumeError;
use thiserror::Error;

/// Everything the shell can report without dying. Parse and syntax errors
/// never reach process-spawning code; runtime errors inside a forked child
/// surface as that child's exit status instead of a value of this type.
#[derive(Debug, Error)]
pub enum ShellError {
    #[error("empty command")]
    EmptyInput,
    #[error("argument contains a NUL byte")]
    InvalidArgument,
    #[error("command not found in mounted volume: {0}")]
    CommandNotFound(String),
    #[error("redirection input not found: {0}")]
    RedirectNotFound(String),
    #[error("malformed redirection: {0}")]
    MalformedRedirection(&'static str),
    #[error("pipe operator not used properly")]
    InvalidPipeUsage,
    #[error("invalid path: {0}")]
    PathInvalid(String),
    #[error("out of resources: {0}")]
    Resource(#[source] nix::Error),
    #[error(transparent)]
    Volume(#[from] VolumeError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
