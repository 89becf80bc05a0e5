use crate::prelude::*;
use core::fmt;

#[cfg(feature = "use_backtrace")]
use backtrace::Backtrace;
use log::error;

use crate::policy::error::{ChannelError, ChannelErrorKind, ErrorClass};

/// gRPC compatible error status
#[derive(Clone, PartialEq)]
pub struct Status {
    /// The gRPC status code, found in the `grpc-status` header.
    code: Code,
    /// A relevant error message, found in the `grpc-message` header.
    message: String,
}

/// gRPC compatible error status code
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Code {
    /// The operation completed successfully.
    Ok = 0,

    /// Client specified an invalid argument.
    InvalidArgument = 3,

    /// Some requested entity was not found.
    NotFound = 5,

    /// The system is not in a state required for the operation’s execution.
    FailedPrecondition = 9,

    /// The operation was aborted, typically due to a concurrency issue.
    Aborted = 10,

    /// Internal error.
    Internal = 13,

    /// The service is currently unavailable.
    Unavailable = 14,
}

impl Status {
    /// Create a new `Status` with the associated code and message.
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Status { code, message: message.into() }
    }

    /// Get the gRPC `Code` of this `Status`.
    pub fn code(&self) -> Code {
        self.code
    }

    /// Get the text error message of this `Status`.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Construct an invalid argument status
    pub fn invalid_argument(message: impl Into<String>) -> Status {
        Self::new(Code::InvalidArgument, message)
    }

    /// Construct an internal error status
    pub fn internal(message: impl Into<String>) -> Status {
        Self::new(Code::Internal, message)
    }

    /// Construct an unavailable status, the caller may retry
    pub fn unavailable(message: impl Into<String>) -> Status {
        Self::new(Code::Unavailable, message)
    }

    /// Construct an aborted status
    pub fn aborted(message: impl Into<String>) -> Status {
        Self::new(Code::Aborted, message)
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // A manual impl to reduce the noise of frequently empty fields.
        let mut builder = f.debug_struct("Status");

        builder.field("code", &self.code);

        if !self.message.is_empty() {
            builder.field("message", &self.message);
        }

        builder.finish()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "status: {:?}, message: {:?}", self.code(), self.message())
    }
}

impl std::error::Error for Status {}

/// An invalid argument was detected
pub fn invalid_argument(msg: impl Into<String>) -> Status {
    let s = msg.into();
    error!("INVALID ARGUMENT: {}", &s);
    #[cfg(feature = "use_backtrace")]
    error!("BACKTRACE:\n{:?}", Backtrace::new());
    Status::invalid_argument(s)
}

/// An internal error, not recoverable by the caller
pub fn internal_error(msg: impl Into<String>) -> Status {
    let s = msg.into();
    error!("INTERNAL ERROR: {}", &s);
    #[cfg(feature = "use_backtrace")]
    error!("BACKTRACE:\n{:?}", Backtrace::new());
    Status::internal(s)
}

/// A collaborator could not be reached, the caller may retry
pub fn unavailable(msg: impl Into<String>) -> Status {
    let s = msg.into();
    error!("UNAVAILABLE: {}", &s);
    Status::unavailable(s)
}

impl From<ChannelError> for Status {
    fn from(ce: ChannelError) -> Self {
        let class = ce.class();
        let s: String = ce.clone().into();
        let code = match class {
            ErrorClass::Construction | ErrorClass::ResourceExhausted => Code::InvalidArgument,
            ErrorClass::Validation
            | ErrorClass::ProtocolViolation
            | ErrorClass::BreachDetected => Code::FailedPrecondition,
            ErrorClass::Unavailable => match ce.kind {
                ChannelErrorKind::Cancelled => Code::Aborted,
                _ => Code::Unavailable,
            },
        };
        error!("{:?}: {}", code, &s);
        #[cfg(feature = "use_backtrace")]
        error!("BACKTRACE:\n{:?}", &ce.resolved_backtrace());
        Status::new(code, s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::error::{construction_error, insufficient_balance, signature_invalid};

    #[test]
    fn status_from_channel_error_test() {
        let s: Status = construction_error("bad key").into();
        assert_eq!(s.code(), Code::InvalidArgument);
        assert_eq!(s.message(), "construction: bad key");

        let s: Status = signature_invalid("stale").into();
        assert_eq!(s.code(), Code::FailedPrecondition);

        let s: Status = insufficient_balance(10, 5).into();
        assert_eq!(s.code(), Code::InvalidArgument);

        let s: Status = ChannelError::new(ChannelErrorKind::Cancelled).into();
        assert_eq!(s.code(), Code::Aborted);
    }

    #[test]
    fn status_display_test() {
        let s = Status::unavailable("down");
        assert_eq!(format!("{}", s), "status: Unavailable, message: \"down\"");
        assert_eq!(format!("{:?}", Status::new(Code::Ok, "")), "Status { code: Ok }");
    }
}
