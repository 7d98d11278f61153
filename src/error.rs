use std::fmt;
use std::io;

/// Result alias for vdex/dex conversion operations.
pub type VdexResult<T> = Result<T, VdexError>;

/// Errors surfaced by the vdex conversion pipeline.
///
/// Every failure is terminal for the current invocation: either a complete,
/// valid dex file is written, or nothing replaces the destination path.
#[derive(Debug)]
pub enum VdexError {
    /// Malformed container or archive structure.
    Format(String),
    /// Checksum mismatch or a violated quickening invariant. The input is
    /// treated as untrusted and nothing is emitted.
    Integrity(String),
    /// Failure at the filesystem boundary, with the underlying cause.
    Io(io::Error),
}

impl fmt::Display for VdexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VdexError::Format(msg) => write!(f, "format error: {msg}"),
            VdexError::Integrity(msg) => write!(f, "integrity error: {msg}"),
            VdexError::Io(err) => write!(f, "I/O error: {err}"),
        }
    }
}

impl std::error::Error for VdexError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VdexError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for VdexError {
    fn from(value: io::Error) -> Self {
        VdexError::Io(value)
    }
}

/// Returns early with a `VdexError::Format`.
macro_rules! fail_format {
    ($($args:tt)*) => {
        return Err($crate::error::VdexError::Format(format!($($args)*)))
    };
}

/// Returns early with a `VdexError::Integrity`.
macro_rules! fail_integrity {
    ($($args:tt)*) => {
        return Err($crate::error::VdexError::Integrity(format!($($args)*)))
    };
}

pub(crate) use fail_format;
pub(crate) use fail_integrity;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_taxonomy() {
        let e = VdexError::Format("bad magic".to_string());
        assert_eq!(e.to_string(), "format error: bad magic");
        let e = VdexError::Integrity("checksum mismatch".to_string());
        assert!(e.to_string().starts_with("integrity error"));
    }

    #[test]
    fn io_errors_keep_their_source() {
        let e = VdexError::from(io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert!(std::error::Error::source(&e).is_some());
    }
}
