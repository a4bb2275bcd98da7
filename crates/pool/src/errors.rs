use std::collections::TryReserveError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Pool needs more than one buffer, got {count}")]
    InvalidCapacity { count: usize },

    #[error("Frame size must be non-zero")]
    EmptyFrame,

    #[error("Failed to allocate {frame_size} byte frame buffer: {source}")]
    Allocation {
        frame_size: usize,
        #[source]
        source: TryReserveError,
    },

    #[error("Frame belongs to a different pool")]
    ForeignFrame,

    #[error("Reader count underflow on buffer {index}")]
    ReaderCountUnderflow { index: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_formatting() {
        let err = PoolError::InvalidCapacity { count: 1 };
        assert_eq!(
            err.to_string(),
            "Pool needs more than one buffer, got 1",
            "InvalidCapacity should report the rejected count"
        );

        let err = PoolError::EmptyFrame;
        assert_eq!(err.to_string(), "Frame size must be non-zero");

        let err = PoolError::ForeignFrame;
        assert_eq!(err.to_string(), "Frame belongs to a different pool");

        let err = PoolError::ReaderCountUnderflow { index: 3 };
        assert_eq!(
            err.to_string(),
            "Reader count underflow on buffer 3",
            "ReaderCountUnderflow should name the buffer"
        );
    }

    #[test]
    fn test_allocation_error_keeps_source() {
        use std::error::Error as _;

        let source = Vec::<u8>::new().try_reserve_exact(usize::MAX).unwrap_err();
        let err = PoolError::Allocation {
            frame_size: usize::MAX,
            source,
        };

        assert!(err.to_string().starts_with("Failed to allocate"));
        assert!(err.source().is_some(), "Allocation should expose its source");
    }
}
