#![forbid(unsafe_code)]
//! Error types for OrderFS.
//!
//! The engine distinguishes three failure classes:
//!
//! | Class | Handling |
//! |-------|----------|
//! | Protocol invariant violations | `panic!` — the ordering protocol itself is broken and continuing risks silent on-disk corruption |
//! | I/O failures on engine-initiated flushes | `OrdfsError`, reported through the diagnostic hook and surfaced where a caller can retry |
//! | Resource pressure | never an error; absorbed by backpressure as added latency |
//!
//! `OrdfsError` is the single user-facing error type. Crate-internal typed
//! errors (codec errors in `ordfs-ondisk`, state-transition errors in
//! `ordfs-core`) convert into it at crate boundaries. All string payloads are
//! owned so errors can cross thread boundaries freely.

use thiserror::Error;

/// Unified error type for all OrderFS operations.
#[derive(Debug, Error)]
pub enum OrdfsError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Metadata inconsistency detected at a known block.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// A buffer, mount, or record the caller named does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A flush could not drain every dependency within its retry limit.
    ///
    /// Callers such as unmount may retry; the count reports how many
    /// dependencies were still outstanding.
    #[error("flush incomplete: {remaining} dependencies outstanding")]
    FlushIncomplete { remaining: usize },

    /// An illegal dependency state transition was requested.
    #[error("illegal state transition: {0}")]
    State(String),

    /// Structurally invalid argument (geometry, byte range, buffer size).
    #[error("invalid argument: {0}")]
    Invalid(String),
}

impl OrdfsError {
    /// Convert this error into a POSIX errno.
    ///
    /// The mapping is exhaustive — adding a variant without assigning an
    /// errno is a compile error.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } => libc::EIO,
            Self::NotFound(_) => libc::ENOENT,
            Self::FlushIncomplete { .. } => libc::EBUSY,
            Self::State(_) | Self::Invalid(_) => libc::EINVAL,
        }
    }
}

/// Result alias using `OrdfsError`.
pub type Result<T> = std::result::Result<T, OrdfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(OrdfsError, libc::c_int)> = vec![
            (OrdfsError::Io(std::io::Error::other("x")), libc::EIO),
            (
                OrdfsError::Corruption {
                    block: 7,
                    detail: "x".into(),
                },
                libc::EIO,
            ),
            (OrdfsError::NotFound("buf 3".into()), libc::ENOENT),
            (OrdfsError::FlushIncomplete { remaining: 2 }, libc::EBUSY),
            (OrdfsError::State("x".into()), libc::EINVAL),
            (OrdfsError::Invalid("x".into()), libc::EINVAL),
        ];
        for (error, expected) in &cases {
            assert_eq!(error.to_errno(), *expected, "wrong errno for {error:?}");
        }
    }

    #[test]
    fn io_error_preserves_raw_os_error() {
        let raw = std::io::Error::from_raw_os_error(libc::EPERM);
        assert_eq!(OrdfsError::Io(raw).to_errno(), libc::EPERM);
    }

    #[test]
    fn display_formatting() {
        let err = OrdfsError::Corruption {
            block: 42,
            detail: "stale pointer".into(),
        };
        assert_eq!(err.to_string(), "corrupt metadata at block 42: stale pointer");
        assert_eq!(
            OrdfsError::FlushIncomplete { remaining: 3 }.to_string(),
            "flush incomplete: 3 dependencies outstanding"
        );
    }
}
