#![crate_name = "lnchannel"]

//! A bidirectional payment channel state machine.
//! See [`channel::Channel`] for the synchronous state machine and
//! [`session::ChannelSession`] for the asynchronous update driver.

#![forbid(unsafe_code)]
#![warn(rustdoc::broken_intra_doc_links)]
#![warn(missing_docs)]

#[macro_use]
extern crate alloc;
extern crate core;

pub use bitcoin;
pub use lightning;

/// Various utilities
#[macro_use]
pub mod util;
/// Channel parameters, local limits and error types
#[macro_use]
pub mod policy;
/// Chain notification interface
pub mod chain;
/// Channel state machine
pub mod channel;
/// In-flight conditional payments
pub mod htlc;
/// Persistence
pub mod persist;
/// Revocation secret chains
pub mod revocation;
/// Asynchronous update cycle and chain watch
pub mod session;
/// Signing backend
pub mod signer;
/// Script templates and transaction construction
pub mod tx;

pub use alloc::sync::{Arc, Weak};

/// Common imports
pub mod prelude {
    pub use alloc::{boxed::Box, string::String, vec, vec::Vec};

    pub use std::collections::HashMap as Map;
    pub use std::collections::HashSet as UnorderedSet;

    pub use alloc::collections::BTreeMap as OrderedMap;
    pub use alloc::collections::BTreeSet as OrderedSet;

    pub use alloc::borrow::ToOwned;
    pub use alloc::string::ToString;

    pub use std::sync::{Mutex, MutexGuard};

    /// Convenience trait for Send + Sync
    pub trait SendSync: Send + Sync {}
}

pub use prelude::SendSync;

#[cfg(test)]
mod channel_update_tests;
#[cfg(test)]
mod session_tests;
