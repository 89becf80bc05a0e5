#![allow(missing_docs)]

use core::sync::atomic::{AtomicBool, Ordering};

use bitcoin::{OutPoint, Transaction};
use tokio::sync::{mpsc, oneshot};

use crate::chain::{ChainNotifier, Confirmation};
use crate::channel::ChannelId;
use crate::persist::model::ChannelEntry;
use crate::persist::{Error, Persist};
use crate::prelude::*;
use crate::util::status::{unavailable, Status};

/// A chain notifier driven by the test
#[derive(Default)]
pub struct MockChainNotifier {
    confirmations: Mutex<Map<OutPoint, Vec<oneshot::Sender<Confirmation>>>>,
    spends: Mutex<Map<OutPoint, Vec<mpsc::UnboundedSender<Transaction>>>>,
    failing: AtomicBool,
}

impl SendSync for MockChainNotifier {}

impl MockChainNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subscriptions fail
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Deliver a confirmation to every subscriber of `outpoint`.
    /// Returns how many were notified.
    pub fn confirm(&self, outpoint: &OutPoint, block_height: u32) -> usize {
        let senders = self.confirmations.lock().unwrap().remove(outpoint).unwrap_or_default();
        senders
            .into_iter()
            .filter_map(|sender| sender.send(Confirmation { block_height }).ok())
            .count()
    }

    /// Deliver a spend to every subscriber of `outpoint`.
    /// Returns how many were notified.
    pub fn spend(&self, outpoint: &OutPoint, tx: &Transaction) -> usize {
        let mut spends = self.spends.lock().unwrap();
        let senders = spends.entry(*outpoint).or_default();
        senders.retain(|sender| sender.send(tx.clone()).is_ok());
        senders.len()
    }

    fn check(&self) -> Result<(), Status> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(unavailable("chain notifier down"));
        }
        Ok(())
    }
}

impl ChainNotifier for MockChainNotifier {
    fn notify_confirmation(
        &self,
        outpoint: &OutPoint,
        _min_depth: u32,
    ) -> Result<oneshot::Receiver<Confirmation>, Status> {
        self.check()?;
        let (sender, receiver) = oneshot::channel();
        self.confirmations.lock().unwrap().entry(*outpoint).or_default().push(sender);
        Ok(receiver)
    }

    fn notify_spend(
        &self,
        outpoint: &OutPoint,
    ) -> Result<mpsc::UnboundedReceiver<Transaction>, Status> {
        self.check()?;
        let (sender, receiver) = mpsc::unbounded_channel();
        self.spends.lock().unwrap().entry(*outpoint).or_default().push(sender);
        Ok(receiver)
    }
}

/// An in-memory persister that can be made to fail
#[derive(Default)]
pub struct MockPersister {
    entries: Mutex<OrderedMap<ChannelId, ChannelEntry>>,
    failing: AtomicBool,
}

impl SendSync for MockPersister {}

impl MockPersister {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make writes fail
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// The stored entry, if any
    pub fn entry(&self, id: &ChannelId) -> Option<ChannelEntry> {
        self.entries.lock().unwrap().get(id).cloned()
    }

    fn check(&self) -> Result<(), Error> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Unavailable("mock persister down".to_string()));
        }
        Ok(())
    }
}

impl Persist for MockPersister {
    fn new_channel(&self, id: &ChannelId, entry: &ChannelEntry) -> Result<(), Error> {
        self.check()?;
        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(id) {
            return Err(Error::AlreadyExists(id.to_string()));
        }
        entries.insert(id.clone(), entry.clone());
        Ok(())
    }

    fn update_channel(&self, id: &ChannelId, entry: &ChannelEntry) -> Result<(), Error> {
        self.check()?;
        match self.entries.lock().unwrap().get_mut(id) {
            Some(stored) => *stored = entry.clone(),
            None => return Err(Error::NotFound(id.to_string())),
        }
        Ok(())
    }

    fn get_channel(&self, id: &ChannelId) -> Result<ChannelEntry, Error> {
        self.entry(id).ok_or_else(|| Error::NotFound(id.to_string()))
    }

    fn get_channels(&self) -> Result<Vec<(ChannelId, ChannelEntry)>, Error> {
        Ok(self.entries.lock().unwrap().iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    fn delete_channel(&self, id: &ChannelId) -> Result<(), Error> {
        self.check()?;
        self.entries.lock().unwrap().remove(id);
        Ok(())
    }

    fn clear_database(&self) -> Result<(), Error> {
        self.entries.lock().unwrap().clear();
        Ok(())
    }
}
