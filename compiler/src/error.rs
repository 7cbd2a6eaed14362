// error.rs — Fatal error kinds for the backend
//
// Every error here aborts the compilation unit; nothing is recoverable
// inside the backend. Errors propagate to the caller unchanged, and the
// caller is responsible for discarding partial output.
//
// Preconditions: none (types only).
// Postconditions: none (types only).
// Failure modes: none.
// Side effects: none.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, BackendError>;

/// Fatal backend error.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Unsupported thread count, malformed architecture, or a layout that
    /// cannot be realized (e.g. instruction wider than the packing word).
    #[error("configuration error: {0}")]
    Config(String),

    /// An operand does not fit its instruction field.
    #[error("encoding error: {field} value {value} exceeds {width}-bit field")]
    Encoding {
        field: &'static str,
        value: u64,
        width: u32,
    },

    /// Read/write failure on a segment store or an output stream.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Tile grouping or segment lifecycle produced an impossible shape.
    #[error("invariant violation: {0}")]
    Invariant(String),
}

impl BackendError {
    pub fn config(msg: impl Into<String>) -> Self {
        BackendError::Config(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        BackendError::Invariant(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_display() {
        let e = BackendError::Encoding {
            field: "local address",
            value: 4096,
            width: 11,
        };
        assert_eq!(
            format!("{e}"),
            "encoding error: local address value 4096 exceeds 11-bit field"
        );
    }

    #[test]
    fn io_is_transparent() {
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "truncated");
        let e = BackendError::from(io);
        assert!(format!("{e}").contains("truncated"));
    }
}
