// Error kinds and exit-code mapping.
//
// Configuration and I/O failures abort before any read is processed.
// During alignment, resource exhaustion is absorbed into counters and
// never surfaces here; invariant violations only trip under sanity
// mode.

use std::fmt;
use std::io;

#[derive(Debug)]
pub enum AlnError {
    /// Bad flag combination or out-of-range value.
    Config(String),
    /// Index, read-file or output I/O failure.
    Io(io::Error),
    /// Malformed index or reference input.
    IndexFormat(String),
    /// A cache insert failed; callers normally demote this to a
    /// counter before it reaches the top level.
    ResourceExhausted(String),
    /// The DP engine the configuration requires is unavailable.
    DpUnsupported(String),
    /// Invariant violation caught under sanity mode.
    Bug(String),
}

impl AlnError {
    pub fn config(msg: impl Into<String>) -> Self {
        AlnError::Config(msg.into())
    }

    /// Process exit code: 0 is success, 1 is configuration/I-O, other
    /// nonzero values are internal errors.
    pub fn exit_code(&self) -> i32 {
        match self {
            AlnError::Config(_) | AlnError::Io(_) | AlnError::IndexFormat(_) => 1,
            AlnError::ResourceExhausted(_) => 2,
            AlnError::DpUnsupported(_) => 3,
            AlnError::Bug(_) => 4,
        }
    }
}

impl fmt::Display for AlnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlnError::Config(m) => write!(f, "configuration error: {}", m),
            AlnError::Io(e) => write!(f, "i/o error: {}", e),
            AlnError::IndexFormat(m) => write!(f, "index format error: {}", m),
            AlnError::ResourceExhausted(m) => write!(f, "resource exhausted: {}", m),
            AlnError::DpUnsupported(m) => write!(f, "dp engine unavailable: {}", m),
            AlnError::Bug(m) => write!(f, "internal error: {}", m),
        }
    }
}

impl std::error::Error for AlnError {}

impl From<io::Error> for AlnError {
    fn from(e: io::Error) -> Self {
        AlnError::Io(e)
    }
}
