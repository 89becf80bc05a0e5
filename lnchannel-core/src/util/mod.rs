/// Signature encoding and hashing helpers
pub mod crypto_utils;
/// Logging macros
#[macro_use]
pub mod macro_logger;
/// Debug printers and logging helpers
#[macro_use]
pub mod debug_utils;
/// Mock collaborators for tests
#[cfg(any(test, feature = "test_utils"))]
pub mod mocks;
/// An in-process counterparty, for tests
#[cfg(any(test, feature = "test_utils"))]
pub mod loopback;
/// Serialization helpers
pub mod ser_util;
/// gRPC compatible status
pub mod status;
/// Test utilities
#[cfg(any(test, feature = "test_utils"))]
#[macro_use]
pub mod test_utils;

/// The number of commitment indices available, the width of the
/// commitment number encoded in a commitment transaction.
pub const COMMITMENT_NUMBER_BITS: u32 = 48;

/// The revocation derivation index of commitment number zero.
/// Commitment `i` uses derivation index `INITIAL_COMMITMENT_NUMBER - i`.
pub const INITIAL_COMMITMENT_NUMBER: u64 = (1 << COMMITMENT_NUMBER_BITS) - 1;
