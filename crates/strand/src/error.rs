//! Runtime error taxonomy

/// Errors surfaced by the runtime to fibers.
///
/// Precondition violations are not represented here; those are programming
/// errors and panic. A panic escaping a fiber entry function is captured on
/// the fiber and re-raised in its resumer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The operation was cancelled at its suspension point.
    #[error("operation cancelled")]
    Cancelled,

    /// The operation's deadline passed before it completed.
    #[error("operation timed out")]
    TimedOut,

    /// The peer closed its read side; writes can no longer be delivered.
    #[error("broken pipe")]
    BrokenPipe,

    /// A delimiter search hit the end of the readable data.
    #[error("unexpected end of buffer")]
    UnexpectedEof,

    /// A kernel-side failure from a syscall.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error is a cancellation (including timeouts, which are
    /// cancellations with a deadline disposition).
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled | Error::TimedOut)
    }
}

/// Result alias used throughout the runtime.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", Error::Cancelled), "operation cancelled");
        assert_eq!(format!("{}", Error::TimedOut), "operation timed out");
    }

    #[test]
    fn test_cancelled_covers_timeouts() {
        assert!(Error::Cancelled.is_cancelled());
        assert!(Error::TimedOut.is_cancelled());
        assert!(!Error::BrokenPipe.is_cancelled());
    }

    #[test]
    fn test_io_conversion() {
        let err: Error = std::io::Error::from_raw_os_error(libc::EBADF).into();
        assert!(matches!(err, Error::Io(_)));
    }
}
