use crate::channel::ChannelId;
use crate::prelude::*;

/// Models for persistence
pub mod model;

#[derive(Clone, Debug, PartialEq)]
/// Error returned by persister
pub enum Error {
    /// Persister is temporarily unavailable, might work later
    Unavailable(String),
    /// Inconsistent state, needed resource is missing
    NotFound(String),
    /// Inconsistent state, resource already present
    AlreadyExists(String),
    /// A concurrent writer got there first
    VersionMismatch(String),
    /// Non-recoverable internal error
    Internal(String),
}

/// Persister of channels
///
/// A [`crate::session::ChannelSession`] calls the relevant methods here
/// after every successful state change.
///
/// Implementations must replace an entry atomically: after a crash the
/// store holds either the old entry or the new one, never a mix.
/// They should persist durably before returning.
pub trait Persist: SendSync {
    /// Create a channel entry.  Will error if it exists.
    fn new_channel(&self, id: &ChannelId, entry: &model::ChannelEntry) -> Result<(), Error>;

    /// Replace a channel entry.  Will error if it doesn't exist.
    fn update_channel(&self, id: &ChannelId, entry: &model::ChannelEntry) -> Result<(), Error>;

    /// Get a channel entry
    fn get_channel(&self, id: &ChannelId) -> Result<model::ChannelEntry, Error>;

    /// Get all channel entries
    fn get_channels(&self) -> Result<Vec<(ChannelId, model::ChannelEntry)>, Error>;

    /// Delete a channel entry.  Used once a closed channel is fully swept.
    fn delete_channel(&self, id: &ChannelId) -> Result<(), Error>;

    /// Clears the database.  Not for production use.
    fn clear_database(&self) -> Result<(), Error>;
}

/// A null persister for testing
pub struct DummyPersister;

impl SendSync for DummyPersister {}

#[allow(unused_variables)]
impl Persist for DummyPersister {
    fn new_channel(&self, id: &ChannelId, entry: &model::ChannelEntry) -> Result<(), Error> {
        Ok(())
    }

    fn update_channel(&self, id: &ChannelId, entry: &model::ChannelEntry) -> Result<(), Error> {
        Ok(())
    }

    fn get_channel(&self, id: &ChannelId) -> Result<model::ChannelEntry, Error> {
        Err(Error::NotFound(format!("get_channel unimplemented")))
    }

    fn get_channels(&self) -> Result<Vec<(ChannelId, model::ChannelEntry)>, Error> {
        Ok(Vec::new())
    }

    fn delete_channel(&self, id: &ChannelId) -> Result<(), Error> {
        Ok(())
    }

    fn clear_database(&self) -> Result<(), Error> {
        Ok(())
    }
}
