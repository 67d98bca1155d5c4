//! # Errors and Status Codes
//!
//! Every failure the throttle can produce is a [`ThrottleError`]. In-process
//! callers get the enum directly; foreign callers get the matching status code
//! from [`ThrottleError::status_code`].
//!
//! ```text
//!     ThrottleError                 status code
//!     ─────────────────────────     ──────────────────────────────
//!     InvalidArgument           ──► E_ARGUMENT_OUT_OF_RANGE
//!     NullPointer               ──► E_POINTER
//!     Cancelled                 ──► E_OPERATION_CANCELED
//!     PlatformResourceExhausted ──► HRESULT of the OS error
//!     UnexpectedFailure         ──► carried status, else E_FAIL
//! ```

use std::io;

/// Result type for throttle operations.
pub type Result<T> = std::result::Result<T, ThrottleError>;

/// Stable status codes returned across the C ABI.
///
/// The values are HRESULT-shaped so Windows callers can feed them straight
/// into their usual error plumbing. They never change between releases.
pub mod status {
    /// The call succeeded.
    pub const OK: i32 = 0;
    /// A required pointer argument was null.
    pub const E_POINTER: i32 = 0x8000_4003_u32 as i32;
    /// An argument was outside its allowed range (e.g. a negative rate).
    pub const E_ARGUMENT_OUT_OF_RANGE: i32 = 0x8013_1502_u32 as i32;
    /// The operation observed a cancellation request.
    pub const E_OPERATION_CANCELED: i32 = 0x8013_153B_u32 as i32;
    /// Generic failure.
    pub const E_FAIL: i32 = 0x8000_4005_u32 as i32;
    /// The OS refused to hand out a resource and gave no further detail.
    pub const E_OUTOFMEMORY: i32 = 0x8007_000E_u32 as i32;

    /// Wraps a raw OS error number the way `HRESULT_FROM_WIN32` does.
    pub const fn from_os_error(code: i32) -> i32 {
        if code <= 0 {
            code
        } else {
            ((code as u32 & 0xFFFF) | 0x8007_0000) as i32
        }
    }
}

/// Errors produced by the throttle engine, the delay primitive and the
/// foreign boundary.
#[derive(Debug, thiserror::Error)]
pub enum ThrottleError {
    /// A configuration value was rejected.
    #[error("invalid argument `{name}`: {reason}")]
    InvalidArgument {
        /// Which argument was rejected.
        name: &'static str,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// A boundary call was missing a required pointer.
    #[error("required pointer `{0}` was null")]
    NullPointer(&'static str),

    /// Cooperative cancellation was observed.
    #[error("operation was cancelled")]
    Cancelled,

    /// The OS could not create a timer, wait registration or event.
    #[error("failed to create {resource}: {source}")]
    PlatformResourceExhausted {
        /// The kind of OS object that could not be created.
        resource: &'static str,
        /// The underlying OS error.
        #[source]
        source: io::Error,
    },

    /// Catch-all for failures that should not happen in normal operation.
    #[error("unexpected failure: {message}")]
    UnexpectedFailure {
        /// Human readable description.
        message: String,
        /// Native status code of the underlying failure, when one exists.
        status: Option<i32>,
    },
}

impl ThrottleError {
    pub(crate) fn invalid(name: &'static str, reason: &'static str) -> Self {
        Self::InvalidArgument { name, reason }
    }

    pub(crate) fn platform(resource: &'static str, source: io::Error) -> Self {
        Self::PlatformResourceExhausted { resource, source }
    }

    pub(crate) fn unexpected(message: impl Into<String>) -> Self {
        Self::UnexpectedFailure {
            message: message.into(),
            status: None,
        }
    }

    /// Returns `true` for [`ThrottleError::Cancelled`].
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Maps the error onto its stable boundary status code.
    pub fn status_code(&self) -> i32 {
        match self {
            Self::InvalidArgument { .. } => status::E_ARGUMENT_OUT_OF_RANGE,
            Self::NullPointer(_) => status::E_POINTER,
            Self::Cancelled => status::E_OPERATION_CANCELED,
            Self::PlatformResourceExhausted { source, .. } => source
                .raw_os_error()
                .filter(|code| *code > 0)
                .map(status::from_os_error)
                .unwrap_or(status::E_OUTOFMEMORY),
            Self::UnexpectedFailure { status, .. } => status.unwrap_or(status::E_FAIL),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_are_stable() {
        assert_eq!(status::OK, 0);
        assert_eq!(status::E_POINTER as u32, 0x8000_4003);
        assert_eq!(status::E_ARGUMENT_OUT_OF_RANGE as u32, 0x8013_1502);
        assert_eq!(status::E_OPERATION_CANCELED as u32, 0x8013_153B);
        assert_eq!(status::E_FAIL as u32, 0x8000_4005);
    }

    #[test]
    fn test_error_mapping() {
        assert_eq!(
            ThrottleError::invalid("rate", "negative").status_code(),
            status::E_ARGUMENT_OUT_OF_RANGE
        );
        assert_eq!(
            ThrottleError::NullPointer("state").status_code(),
            status::E_POINTER
        );
        assert_eq!(
            ThrottleError::Cancelled.status_code(),
            status::E_OPERATION_CANCELED
        );
        assert_eq!(ThrottleError::unexpected("boom").status_code(), status::E_FAIL);

        let carried = ThrottleError::UnexpectedFailure {
            message: "carried".into(),
            status: Some(42),
        };
        assert_eq!(carried.status_code(), 42);
    }

    #[test]
    fn test_platform_error_uses_os_code() {
        let err = ThrottleError::platform("timer", io::Error::from_raw_os_error(24));
        assert_eq!(err.status_code() as u32, 0x8007_0018);

        let opaque = ThrottleError::platform("timer", io::Error::other("no code"));
        assert_eq!(opaque.status_code(), status::E_OUTOFMEMORY);
    }

    #[test]
    fn test_display() {
        let err = ThrottleError::invalid("rate_bytes_per_sec", "must not be negative");
        assert_eq!(
            err.to_string(),
            "invalid argument `rate_bytes_per_sec`: must not be negative"
        );
        assert!(ThrottleError::Cancelled.is_cancelled());
        assert!(!ThrottleError::NullPointer("x").is_cancelled());
    }
}
