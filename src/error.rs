//! Error types for the i2_s kernels.

use thiserror::Error;

use crate::backend::Backend;

/// Result type alias for kernel operations.
pub type Result<T> = std::result::Result<T, KernelError>;

/// Errors reported at the kernel boundary.
///
/// Numeric degeneracies (a zero activation scale, reserved codes in the
/// packed data) are not errors; they produce defined output.
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum KernelError {
    /// A matrix dimension is zero, or `rows * cols` does not fit in `usize`.
    #[error("invalid dimension: {rows}x{cols} matrix")]
    InvalidDimension {
        /// Requested rows
        rows: usize,
        /// Requested columns
        cols: usize,
    },

    /// A caller buffer has the wrong number of elements.
    #[error("invalid dimension: `{buffer}` has {actual} elements, expected {expected}")]
    LengthMismatch {
        /// Which argument was wrong (`dst`, `vec`, `qvec`, ...)
        buffer: &'static str,
        /// Required length
        expected: usize,
        /// Supplied length
        actual: usize,
    },

    /// The packed buffer is shorter than the block layout requires.
    #[error("invalid dimension: packed buffer has {actual} bytes, layout needs {expected}")]
    PackedTooShort {
        /// Required bytes
        expected: usize,
        /// Supplied bytes
        actual: usize,
    },

    /// An activation row too long for its code sum to fit the `i32`
    /// `act_sum` the fused kernels take.
    #[error("invalid dimension: {len} activations, at most {max} fit an i32 code sum")]
    ActivationsTooLong {
        /// Supplied activations
        len: usize,
        /// Longest accepted row
        max: usize,
    },

    /// A serialized tensor ended before its trailing scale.
    #[error("truncated i2_s tensor: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Bytes needed for packed data plus scale
        expected: usize,
        /// Bytes supplied
        actual: usize,
    },

    /// Backend name could not be parsed.
    #[error("unknown backend: {0:?} (expected auto, scalar, lanes or avx2)")]
    UnknownBackend(String),

    /// Backend was requested explicitly but this CPU cannot run it.
    #[error("backend {0} is not available on this CPU")]
    BackendUnavailable(Backend),
}

impl KernelError {
    /// True for every variant in the dimension/contract-violation class.
    #[must_use]
    pub fn is_invalid_dimension(&self) -> bool {
        matches!(
            self,
            Self::InvalidDimension { .. }
                | Self::LengthMismatch { .. }
                | Self::PackedTooShort { .. }
                | Self::ActivationsTooLong { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dimension_class() {
        assert!(KernelError::InvalidDimension { rows: 0, cols: 4 }.is_invalid_dimension());
        assert!(KernelError::LengthMismatch { buffer: "dst", expected: 4, actual: 3 }
            .is_invalid_dimension());
        assert!(KernelError::PackedTooShort { expected: 32, actual: 8 }.is_invalid_dimension());
        assert!(KernelError::ActivationsTooLong { len: 1 << 25, max: 1 << 24 }.is_invalid_dimension());
        assert!(!KernelError::UnknownBackend("neon".into()).is_invalid_dimension());
    }

    #[test]
    fn test_messages() {
        let err = KernelError::LengthMismatch { buffer: "vec", expected: 7, actual: 6 };
        assert_eq!(err.to_string(), "invalid dimension: `vec` has 6 elements, expected 7");

        let err = KernelError::BackendUnavailable(Backend::Avx2);
        assert_eq!(err.to_string(), "backend avx2 is not available on this CPU");
    }
}
