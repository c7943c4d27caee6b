use std::io;

use thiserror::Error;

/// Reasons a limiter refuses to admit a transfer.
///
/// Limiting failures are detected before the wrapped stream is touched, so a call that
/// fails with a `LimitError` has transferred zero bytes. On the `AsyncRead`/`AsyncWrite`
/// surface the error travels inside `io::Error::other(...)`; use [`LimitError::from_io`]
/// to tell it apart from stream failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LimitError {
    /// The listener's cancellation token fired before the limiter admitted the request.
    #[error("bandwidth wait cancelled")]
    Cancelled,

    /// The request is larger than the limiter's burst and can never be admitted.
    #[error("requested {requested} bytes exceeds limiter burst of {burst} bytes")]
    CapacityExceeded { requested: usize, burst: usize },
}

impl LimitError {
    /// Returns the `LimitError` carried by `err`, if any.
    pub fn from_io(err: &io::Error) -> Option<&LimitError> {
        err.get_ref()?.downcast_ref::<LimitError>()
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, LimitError::Cancelled)
    }
}

impl From<LimitError> for io::Error {
    fn from(err: LimitError) -> Self {
        io::Error::other(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_io_error() {
        let err: io::Error = LimitError::CapacityExceeded {
            requested: 10,
            burst: 5,
        }
        .into();

        assert_eq!(err.kind(), io::ErrorKind::Other);
        assert_eq!(
            LimitError::from_io(&err),
            Some(&LimitError::CapacityExceeded {
                requested: 10,
                burst: 5
            })
        );
        assert_eq!(
            err.to_string(),
            "requested 10 bytes exceeds limiter burst of 5 bytes"
        );
    }

    #[test]
    fn foreign_io_errors_are_not_limit_errors() {
        let err = io::Error::new(io::ErrorKind::BrokenPipe, "pipe");
        assert!(LimitError::from_io(&err).is_none());
        assert!(LimitError::from_io(&io::Error::other("boom")).is_none());
    }
}
