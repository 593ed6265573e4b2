use std::fmt;
use std::io;

/// Error taxonomy for the sandbox core.
///
/// Mirrors the five kinds a caller needs to distinguish: a bad parameter
/// caught before anything was started, a privileged syscall that failed, a
/// handshake that never completed, a child that built its environment but
/// reported a setup failure over the pipe, and plain I/O. Guest termination
/// (exit code or signal) is never represented here — see `ExecutionResult`.
#[derive(Debug)]
pub enum Error {
    /// An invariant was violated at call time: empty controller/group name,
    /// a non-absolute mount destination, a path that doesn't exist.
    Configuration(String),
    /// A privileged syscall failed; `op` names the operation for
    /// observability, `source` is the underlying errno.
    Syscall {
        op: &'static str,
        source: nix::errno::Errno,
    },
    /// The child exited or failed to signal readiness within the handshake
    /// deadline.
    Handshake(String),
    /// The child built its environment but reported a setup failure over
    /// the error pipe before (or instead of) calling exec.
    ChildSetup(String),
    /// Plain I/O failure not otherwise classified.
    Io(io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        Error::Configuration(msg.into())
    }

    pub fn syscall(op: &'static str, source: nix::errno::Errno) -> Self {
        Error::Syscall { op, source }
    }

    pub fn handshake<S: Into<String>>(msg: S) -> Self {
        Error::Handshake(msg.into())
    }

    pub fn child_setup<S: Into<String>>(msg: S) -> Self {
        Error::ChildSetup(msg.into())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Configuration(msg) => write!(f, "configuration error: {msg}"),
            Error::Syscall { op, source } => write!(f, "syscall `{op}` failed: {source}"),
            Error::Handshake(msg) => write!(f, "handshake failed: {msg}"),
            Error::ChildSetup(msg) => write!(f, "child process reported: {msg}"),
            Error::Io(err) => write!(f, "I/O error: {err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Syscall { source, .. } => Some(source),
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(err: nix::errno::Errno) -> Self {
        Error::Syscall {
            op: "syscall",
            source: err,
        }
    }
}

impl From<std::ffi::NulError> for Error {
    fn from(_: std::ffi::NulError) -> Self {
        Error::Configuration("argument, environment or path contained a NUL byte".into())
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(err: std::string::FromUtf8Error) -> Self {
        Error::Io(io::Error::new(io::ErrorKind::InvalidData, err))
    }
}
