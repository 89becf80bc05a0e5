#[cfg(feature = "use_backtrace")]
use backtrace::Backtrace;

use ChannelErrorKind::*;

use crate::htlc::HtlcId;
use crate::persist;
use crate::prelude::*;
use crate::util::status::Status;

/// Kind of channel error
#[derive(Clone, Debug, PartialEq)]
pub enum ChannelErrorKind {
    /// A key, amount or script could not be used to build a transaction
    Construction(String),
    /// The operation is not allowed in the current channel state
    InvalidState(String),
    /// A counterparty signature did not verify against the expected transaction
    SignatureInvalid(String),
    /// A disclosed revocation secret does not match its commitment hash
    RevocationMismatch(String),
    /// An update was rejected and the channel stays on its current commitment
    UpdateRejected(String),
    /// A message referred to a different commitment than the one being superseded
    SequenceMismatch {
        /// The commitment number we expected
        expected: u64,
        /// The commitment number we received
        actual: u64,
    },
    /// A revocation secret was requested before its commitment was superseded
    PrematureDisclosure {
        /// The requested commitment number
        index: u64,
        /// The current commitment number
        current: u64,
    },
    /// The counterparty broke the protocol
    ProtocolViolation(String),
    /// The offerer cannot back the conditional payment
    InsufficientBalance {
        /// Total pending value that would be needed
        needed_sat: u64,
        /// Spendable value above the reserve
        available_sat: u64,
    },
    /// The pending HTLC count would exceed the negotiated cap
    TooManyHtlcs {
        /// The cap
        max: u16,
    },
    /// The preimage does not hash to the HTLC's payment hash
    InvalidPreimage(HtlcId),
    /// No HTLC with this id
    UnknownHtlc(HtlcId),
    /// The HTLC is no longer pending
    AlreadyResolved(HtlcId),
    /// The HTLC cannot be timed out yet
    NotYetExpired {
        /// The HTLC expiry height
        expiry: u32,
        /// The current height
        height: u32,
    },
    /// A revoked commitment was broadcast
    BreachDetected(u64),
    /// The operation was cancelled by channel shutdown
    Cancelled,
    /// A collaborator (signer, notifier, counterparty) failed
    Collaborator(String),
    /// The persister failed
    Persist(String),
}

/// Error class, used to decide how an error propagates
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed keys, amounts or misuse; fatal to the operation only
    Construction,
    /// Rejected update; the channel stays on the prior commitment and a retry is allowed
    Validation,
    /// Escalates to a forced unilateral close
    ProtocolViolation,
    /// Local limits hit; channel state unchanged
    ResourceExhausted,
    /// Terminal; surfaced with the data needed to claim the penalty
    BreachDetected,
    /// A collaborator failed; the caller may retry with backoff
    Unavailable,
}

// Explicit PartialEq which ignores backtrace.
impl PartialEq for ChannelError {
    fn eq(&self, other: &ChannelError) -> bool {
        self.kind == other.kind
    }
}

/// Channel error
#[derive(Clone)]
pub struct ChannelError {
    /// The kind of error
    pub kind: ChannelErrorKind,
    /// A non-resolved backtrace
    #[cfg(feature = "use_backtrace")]
    pub bt: Backtrace,
}

impl ChannelError {
    /// Create an error of the given kind, capturing a backtrace if enabled
    pub fn new(kind: ChannelErrorKind) -> Self {
        ChannelError {
            kind,
            #[cfg(feature = "use_backtrace")]
            bt: Backtrace::new_unresolved(),
        }
    }

    /// Resolve the backtrace for display to the user
    #[cfg(feature = "use_backtrace")]
    pub fn resolved_backtrace(&self) -> Backtrace {
        let mut mce = self.clone();
        mce.bt.resolve();
        mce.bt
    }

    /// The class of this error
    pub fn class(&self) -> ErrorClass {
        match &self.kind {
            Construction(_) | InvalidState(_) => ErrorClass::Construction,
            SignatureInvalid(_)
            | RevocationMismatch(_)
            | UpdateRejected(_)
            | InvalidPreimage(_)
            | UnknownHtlc(_)
            | AlreadyResolved(_)
            | NotYetExpired { .. } => ErrorClass::Validation,
            SequenceMismatch { .. } | PrematureDisclosure { .. } | ProtocolViolation(_) =>
                ErrorClass::ProtocolViolation,
            InsufficientBalance { .. } | TooManyHtlcs { .. } => ErrorClass::ResourceExhausted,
            BreachDetected(_) => ErrorClass::BreachDetected,
            Cancelled | Collaborator(_) | Persist(_) => ErrorClass::Unavailable,
        }
    }

    /// Whether this error requires a forced unilateral close
    pub fn is_protocol_violation(&self) -> bool {
        self.class() == ErrorClass::ProtocolViolation
    }

    /// Return a new ChannelError with the message prepended
    pub fn prepend_msg(&self, premsg: String) -> ChannelError {
        let modkind = match &self.kind {
            Construction(s0) => Construction(premsg + &s0),
            InvalidState(s0) => InvalidState(premsg + &s0),
            SignatureInvalid(s0) => SignatureInvalid(premsg + &s0),
            RevocationMismatch(s0) => RevocationMismatch(premsg + &s0),
            UpdateRejected(s0) => UpdateRejected(premsg + &s0),
            ProtocolViolation(s0) => ProtocolViolation(premsg + &s0),
            Collaborator(s0) => Collaborator(premsg + &s0),
            Persist(s0) => Persist(premsg + &s0),
            other => other.clone(),
        };
        ChannelError {
            kind: modkind,
            #[cfg(feature = "use_backtrace")]
            bt: self.bt.clone(),
        }
    }
}

impl core::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "{:?}", self.kind)
    }
}

impl core::fmt::Debug for ChannelError {
    #[cfg(not(feature = "use_backtrace"))]
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("ChannelError").field("kind", &self.kind).finish()
    }
    #[cfg(feature = "use_backtrace")]
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("ChannelError")
            .field("kind", &self.kind)
            .field("bt", &self.resolved_backtrace())
            .finish()
    }
}

impl std::error::Error for ChannelError {}

impl Into<String> for ChannelError {
    fn into(self) -> String {
        match self.kind {
            Construction(s) => "construction: ".to_string() + &s,
            InvalidState(s) => "invalid state: ".to_string() + &s,
            SignatureInvalid(s) => "signature invalid: ".to_string() + &s,
            RevocationMismatch(s) => "revocation mismatch: ".to_string() + &s,
            UpdateRejected(s) => "update rejected: ".to_string() + &s,
            SequenceMismatch { expected, actual } =>
                format!("sequence mismatch: expected {} got {}", expected, actual),
            PrematureDisclosure { index, current } =>
                format!("premature disclosure: secret {} at commitment {}", index, current),
            ProtocolViolation(s) => "protocol violation: ".to_string() + &s,
            InsufficientBalance { needed_sat, available_sat } =>
                format!("insufficient balance: need {} have {}", needed_sat, available_sat),
            TooManyHtlcs { max } => format!("too many htlcs: max {}", max),
            InvalidPreimage(id) => format!("invalid preimage for {}", id),
            UnknownHtlc(id) => format!("unknown htlc {}", id),
            AlreadyResolved(id) => format!("htlc {} already resolved", id),
            NotYetExpired { expiry, height } =>
                format!("not yet expired: expiry {} height {}", expiry, height),
            BreachDetected(num) => format!("breach detected: revoked commitment {}", num),
            Cancelled => "cancelled".to_string(),
            Collaborator(s) => "collaborator: ".to_string() + &s,
            Persist(s) => "persist: ".to_string() + &s,
        }
    }
}

impl From<Status> for ChannelError {
    fn from(s: Status) -> Self {
        collaborator_error(format!("{:?}: {}", s.code(), s.message()))
    }
}

impl From<persist::Error> for ChannelError {
    fn from(e: persist::Error) -> Self {
        persist_error(format!("{:?}", e))
    }
}

/// Malformed keys or amounts
pub fn construction_error(msg: impl Into<String>) -> ChannelError {
    ChannelError::new(Construction(msg.into()))
}

/// The channel is in the wrong state for the operation
pub fn invalid_state_error(msg: impl Into<String>) -> ChannelError {
    ChannelError::new(InvalidState(msg.into()))
}

/// A counterparty signature failed to verify
pub fn signature_invalid(msg: impl Into<String>) -> ChannelError {
    ChannelError::new(SignatureInvalid(msg.into()))
}

/// A disclosed secret does not match the revocation hash
pub fn revocation_mismatch(msg: impl Into<String>) -> ChannelError {
    ChannelError::new(RevocationMismatch(msg.into()))
}

/// An update was rejected without touching channel state
pub fn update_rejected(msg: impl Into<String>) -> ChannelError {
    ChannelError::new(UpdateRejected(msg.into()))
}

/// A message referred to the wrong commitment number
pub fn sequence_mismatch(expected: u64, actual: u64) -> ChannelError {
    ChannelError::new(SequenceMismatch { expected, actual })
}

/// A revocation secret was requested too early
pub fn premature_disclosure(index: u64, current: u64) -> ChannelError {
    ChannelError::new(PrematureDisclosure { index, current })
}

/// The counterparty broke the protocol
pub fn protocol_violation(msg: impl Into<String>) -> ChannelError {
    ChannelError::new(ProtocolViolation(msg.into()))
}

/// The offerer cannot back an HTLC
pub fn insufficient_balance(needed_sat: u64, available_sat: u64) -> ChannelError {
    ChannelError::new(InsufficientBalance { needed_sat, available_sat })
}

/// HTLC cap reached
pub fn too_many_htlcs(max: u16) -> ChannelError {
    ChannelError::new(TooManyHtlcs { max })
}

/// Preimage hash mismatch
pub fn invalid_preimage(id: HtlcId) -> ChannelError {
    ChannelError::new(InvalidPreimage(id))
}

/// No such HTLC
pub fn unknown_htlc(id: HtlcId) -> ChannelError {
    ChannelError::new(UnknownHtlc(id))
}

/// HTLC not pending
pub fn already_resolved(id: HtlcId) -> ChannelError {
    ChannelError::new(AlreadyResolved(id))
}

/// HTLC expiry not reached
pub fn not_yet_expired(expiry: u32, height: u32) -> ChannelError {
    ChannelError::new(NotYetExpired { expiry, height })
}

/// A revoked commitment was observed
pub fn breach_detected(commitment_number: u64) -> ChannelError {
    ChannelError::new(BreachDetected(commitment_number))
}

/// The operation was cancelled
pub fn cancelled() -> ChannelError {
    ChannelError::new(Cancelled)
}

/// A collaborator failed
pub fn collaborator_error(msg: impl Into<String>) -> ChannelError {
    ChannelError::new(Collaborator(msg.into()))
}

/// The persister failed
pub fn persist_error(msg: impl Into<String>) -> ChannelError {
    ChannelError::new(Persist(msg.into()))
}

/// Return a construction error from the current function
#[doc(hidden)]
#[macro_export]
macro_rules! construction_err {
	($($arg:tt)*) => (
        return Err($crate::policy::error::construction_error(format!(
            "{}: {}",
            $crate::short_function!(),
            format!($($arg)*)
        )))
    )
}

/// Return an invalid state error from the current function
#[doc(hidden)]
#[macro_export]
macro_rules! invalid_state_err {
	($($arg:tt)*) => (
        return Err($crate::policy::error::invalid_state_error(format!(
            "{}: {}",
            $crate::short_function!(),
            format!($($arg)*)
        )))
    )
}

/// Return a signature error from the current function
#[doc(hidden)]
#[macro_export]
macro_rules! signature_err {
	($($arg:tt)*) => (
        return Err($crate::policy::error::signature_invalid(format!(
            "{}: {}",
            $crate::short_function!(),
            format!($($arg)*)
        )))
    )
}

/// Return a rejected update error from the current function
#[doc(hidden)]
#[macro_export]
macro_rules! update_rejected_err {
	($($arg:tt)*) => (
        return Err($crate::policy::error::update_rejected(format!(
            "{}: {}",
            $crate::short_function!(),
            format!($($arg)*)
        )))
    )
}

/// Return a protocol violation from the current function
#[doc(hidden)]
#[macro_export]
macro_rules! protocol_err {
	($($arg:tt)*) => (
        return Err($crate::policy::error::protocol_violation(format!(
            "{}: {}",
            $crate::short_function!(),
            format!($($arg)*)
        )))
    )
}
