use core::mem;
use std::sync::RwLock;

use async_trait::async_trait;
use bitcoin::{Transaction, Txid};
use log::*;
use tokio::sync::{broadcast, oneshot, Notify};
use tokio::task::JoinHandle;
use triggered::{Listener, Trigger};

use crate::chain::{ChainNotifier, Confirmation};
use crate::channel::{
    Channel, ChannelId, ChannelState, ChannelUpdate, CommitAcceptance, CommitmentProposal,
    FundingSpend, RevocationMessage,
};
use crate::htlc::HtlcId;
use crate::persist::{model::ChannelEntry, Persist};
use crate::policy::error::{cancelled, ChannelError};
use crate::policy::validator::Validator;
use crate::prelude::*;
use crate::signer::Signer;
use crate::util::status::Status;
use crate::{Arc, Weak};

/// Capacity of the event channel; slow subscribers lose older events
const EVENT_CAPACITY: usize = 16;

/// The transport to the counterparty's session
#[async_trait]
pub trait Counterparty: SendSync {
    /// Deliver a proposal and wait for the acceptance
    async fn propose(&self, proposal: CommitmentProposal) -> Result<CommitAcceptance, Status>;
    /// Deliver the revocation completing an update cycle
    async fn revoke(&self, revocation: RevocationMessage) -> Result<(), Status>;
}

/// The result of a submitted update
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UpdateOutcome {
    /// The commitment the update was included in
    pub commitment_number: u64,
    /// The id of an added HTLC
    pub htlc_id: Option<HtlcId>,
}

/// Channel events published to subscribers
#[derive(Clone, Debug, PartialEq)]
pub enum ChannelEvent {
    /// The funding reached its minimum depth and the channel opened
    FundingLocked,
    /// A transaction spending the funding output confirmed
    FundingSpent(FundingSpend),
}

type UpdateReply = oneshot::Sender<Result<UpdateOutcome, ChannelError>>;

/// Drives a [`Channel`] from concurrent callers.
///
/// Updates submitted concurrently are batched into a single update cycle,
/// in submission order.  Only one cycle is in flight at a time.  The
/// channel is locked only between awaits, so incoming counterparty
/// messages and balance queries are served while a cycle waits for the
/// counterparty.
pub struct ChannelSession {
    id: ChannelId,
    channel: RwLock<Channel>,
    counterparty: Arc<dyn Counterparty>,
    persister: Arc<dyn Persist>,
    queue: Mutex<Vec<(ChannelUpdate, UpdateReply)>>,
    // Held for the duration of an update cycle
    cycle: tokio::sync::Mutex<()>,
    // Our revocation, if delivering it failed
    pending_revocation: Mutex<Option<RevocationMessage>>,
    revoked: Notify,
    seen_spends: Mutex<OrderedSet<Txid>>,
    events: broadcast::Sender<ChannelEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown_trigger: Trigger,
    shutdown_signal: Listener,
}

impl SendSync for ChannelSession {}

impl ChannelSession {
    fn make(
        channel: Channel,
        counterparty: Arc<dyn Counterparty>,
        persister: Arc<dyn Persist>,
    ) -> Arc<Self> {
        let (shutdown_trigger, shutdown_signal) = triggered::trigger();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(ChannelSession {
            id: channel.id().clone(),
            channel: RwLock::new(channel),
            counterparty,
            persister,
            queue: Mutex::new(Vec::new()),
            cycle: tokio::sync::Mutex::new(()),
            pending_revocation: Mutex::new(None),
            revoked: Notify::new(),
            seen_spends: Mutex::new(OrderedSet::new()),
            events,
            tasks: Mutex::new(Vec::new()),
            shutdown_trigger,
            shutdown_signal,
        })
    }

    /// Start a session for a new channel, creating its persisted entry
    pub fn new(
        channel: Channel,
        counterparty: Arc<dyn Counterparty>,
        persister: Arc<dyn Persist>,
    ) -> Result<Arc<Self>, ChannelError> {
        persister.new_channel(channel.id(), &channel.to_entry())?;
        info!("session for new channel {}", channel.id());
        Ok(Self::make(channel, counterparty, persister))
    }

    /// Start a session for a persisted channel
    pub fn restore(
        id: ChannelId,
        signer: Arc<dyn Signer>,
        validator: Arc<dyn Validator>,
        counterparty: Arc<dyn Counterparty>,
        persister: Arc<dyn Persist>,
    ) -> Result<Arc<Self>, ChannelError> {
        let entry = persister.get_channel(&id)?;
        let channel = Channel::restore(id, entry, signer, validator)?;
        info!(
            "session for restored channel {} at {} in {:?}",
            channel.id(),
            channel.commitment_number(),
            channel.state()
        );
        Ok(Self::make(channel, counterparty, persister))
    }

    /// The channel id
    pub fn id(&self) -> &ChannelId {
        &self.id
    }

    /// Run `f` with read access to the channel
    pub fn with_channel<F, T>(&self, f: F) -> T
    where
        F: FnOnce(&Channel) -> T,
    {
        let channel = self.channel.read().unwrap();
        f(&*channel)
    }

    /// Our committed balance
    pub fn our_balance(&self) -> u64 {
        self.with_channel(|c| c.our_balance())
    }

    /// Their committed balance
    pub fn their_balance(&self) -> u64 {
        self.with_channel(|c| c.their_balance())
    }

    /// The channel state
    pub fn state(&self) -> ChannelState {
        self.with_channel(|c| c.state())
    }

    /// The current commitment number
    pub fn commitment_number(&self) -> u64 {
        self.with_channel(|c| c.commitment_number())
    }

    /// Updates waiting for the next cycle
    pub fn queued_updates(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// Subscribe to channel events
    pub fn subscribe_events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    fn persist(&self, entry: &ChannelEntry) -> Result<(), ChannelError> {
        self.persister.update_channel(&self.id, entry).map_err(|e| {
            error!("channel {} persist failed: {:?}", self.id, e);
            ChannelError::from(e)
        })
    }

    // Apply `f` to a copy of the channel and keep the copy only if it
    // was persisted
    fn mutate<F, T>(&self, f: F) -> Result<T, ChannelError>
    where
        F: FnOnce(&mut Channel) -> Result<T, ChannelError>,
    {
        let mut channel = self.channel.write().unwrap();
        let mut candidate = channel.clone();
        let result = f(&mut candidate);
        self.persist(&candidate.to_entry())?;
        *channel = candidate;
        result
    }

    fn publish(&self, event: ChannelEvent) {
        debug!("channel {} event {:?}", self.id, event);
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    /// Submit an update and wait until it is committed or rejected.
    ///
    /// Updates submitted while a cycle is in flight are proposed together
    /// in the next cycle.  Each is checked against the ones submitted
    /// before it, so a rejected update does not affect the others.
    pub async fn submit(
        &self,
        update: ChannelUpdate,
    ) -> Result<UpdateOutcome, ChannelError> {
        if self.shutdown_signal.is_triggered() {
            return Err(cancelled());
        }
        let (reply, outcome) = oneshot::channel();
        self.queue.lock().unwrap().push((update, reply));
        {
            let _cycle = self.cycle.lock().await;
            let batch = mem::take(&mut *self.queue.lock().unwrap());
            if !batch.is_empty() {
                self.run_cycle(batch).await;
            }
        }
        outcome.await.unwrap_or_else(|_| Err(cancelled()))
    }

    // Reply to every caller in the batch
    async fn run_cycle(&self, batch: Vec<(ChannelUpdate, UpdateReply)>) {
        if self.shutdown_signal.is_triggered() {
            for (_, reply) in batch {
                let _ = reply.send(Err(cancelled()));
            }
            return;
        }
        if let Err(err) = self.prepare_cycle().await {
            for (_, reply) in batch {
                let _ = reply.send(Err(err.clone()));
            }
            return;
        }

        let (updates, replies): (Vec<_>, Vec<_>) = batch.into_iter().unzip();
        let mut accepted = Vec::new();
        let proposal = {
            let mut channel = self.channel.write().unwrap();
            let results = channel.compose(&updates);
            for ((update, reply), result) in updates.into_iter().zip(replies).zip(results) {
                match result {
                    Ok(htlc_id) => accepted.push((update, htlc_id, reply)),
                    Err(err) => {
                        debug!("channel {} rejected {:?}: {}", self.id, update, err);
                        let _ = reply.send(Err(err));
                    }
                }
            }
            if accepted.is_empty() {
                return;
            }
            channel.propose_update(accepted.iter().map(|(u, _, _)| u.clone()).collect())
        };

        let result = match proposal {
            Ok(proposal) => self.complete_cycle(proposal).await,
            Err(err) => Err(err),
        };
        match result {
            Ok(commitment_number) =>
                for (_, htlc_id, reply) in accepted {
                    let _ = reply.send(Ok(UpdateOutcome { commitment_number, htlc_id }));
                },
            Err(err) => {
                warn!("channel {} update cycle failed: {}", self.id, err);
                for (_, _, reply) in accepted {
                    let _ = reply.send(Err(err.clone()));
                }
            }
        }
    }

    // Deliver an undelivered revocation, and wait until the counterparty
    // revoked the commitment we accepted from it
    async fn prepare_cycle(&self) -> Result<(), ChannelError> {
        let undelivered = self.pending_revocation.lock().unwrap().take();
        if let Some(revocation) = undelivered {
            info!(
                "channel {} resending revocation of {}",
                self.id, revocation.revocation.commitment_number
            );
            if let Err(status) = self.counterparty.revoke(revocation.clone()).await {
                *self.pending_revocation.lock().unwrap() = Some(revocation);
                return Err(status.into());
            }
        }
        loop {
            let revoked = self.revoked.notified();
            let awaiting = self.with_channel(|c| c.awaiting_revocation());
            if awaiting.is_none() {
                return Ok(());
            }
            debug!("channel {} waiting for revocation of {:?}", self.id, awaiting);
            tokio::select! {
                _ = revoked => {}
                _ = self.shutdown_signal.clone() => return Err(cancelled()),
            }
        }
    }

    // Send the proposal, commit the acceptance and revoke.
    // Returns the new commitment number.
    async fn complete_cycle(&self, proposal: CommitmentProposal) -> Result<u64, ChannelError> {
        let commitment_number = proposal.commitment_number;
        // Falls back to the current commitment unless the cycle completes
        let abandon = scopeguard::guard((), |_| {
            self.channel.write().unwrap().abandon_pending();
        });

        let acceptance = tokio::select! {
            result = self.counterparty.propose(proposal) => result?,
            _ = self.shutdown_signal.clone() => {
                info!("channel {} cancelled proposal {}", self.id, commitment_number);
                self.channel.write().unwrap().cancel();
                return Err(cancelled());
            }
        };

        let (result, entry) = {
            let mut channel = self.channel.write().unwrap();
            let result = channel.commit_accepted(&acceptance);
            (result, channel.to_entry())
        };
        let revocation = match result {
            Ok(revocation) => revocation,
            Err(err) => {
                // A protocol violation moved the channel to closing.  The
                // caller gets the protocol error; a persist failure is only
                // logged, and shutdown persists the closing state again.
                if self.persist(&entry).is_err() {
                    warn!("channel {} closing state not persisted", self.id);
                }
                return Err(err);
            }
        };
        scopeguard::ScopeGuard::into_inner(abandon);

        // The new commitment must be durable before the old one is revoked
        if let Err(err) = self.persist(&entry) {
            *self.pending_revocation.lock().unwrap() = Some(revocation);
            return Err(err);
        }
        if let Err(status) = self.counterparty.revoke(revocation.clone()).await {
            warn!("channel {} revocation not delivered: {}", self.id, status.message());
            *self.pending_revocation.lock().unwrap() = Some(revocation);
        }
        Ok(commitment_number)
    }

    /// Handle a counterparty proposal.
    ///
    /// The accepted commitment is persisted before the acceptance is
    /// returned.  If persisting fails the channel is left unchanged.
    pub fn handle_proposal(
        &self,
        proposal: &CommitmentProposal,
    ) -> Result<CommitAcceptance, ChannelError> {
        self.mutate(|channel| channel.receive_proposal(proposal))
    }

    /// Handle the counterparty's revocation completing its update cycle.
    /// If persisting fails the channel is left unchanged and the
    /// counterparty resends the revocation.
    pub fn handle_revocation(&self, revocation: &RevocationMessage) -> Result<(), ChannelError> {
        let result = self.mutate(|channel| channel.receive_revocation(revocation));
        self.revoked.notify_waiters();
        result
    }

    /// Watch the funding output.
    ///
    /// Opens the channel once the funding has `min_depth` confirmations and
    /// classifies transactions spending it.  Duplicate notifications are
    /// ignored.
    pub fn start_chain_watch(
        self: &Arc<Self>,
        notifier: &dyn ChainNotifier,
        min_depth: u32,
    ) -> Result<(), ChannelError> {
        let outpoint = self.with_channel(|c| c.setup().funding_outpoint);
        let confirmation = notifier.notify_confirmation(&outpoint, min_depth)?;
        let mut spends = notifier.notify_spend(&outpoint)?;

        let session = Arc::downgrade(self);
        let shutdown_signal = self.shutdown_signal.clone();
        let confirmation_task = tokio::spawn(async move {
            tokio::select! {
                _ = shutdown_signal => {}
                result = confirmation => match (result, session.upgrade()) {
                    (Ok(confirmation), Some(session)) => session.on_confirmation(confirmation),
                    (Err(_), _) => debug!("confirmation subscription closed"),
                    (_, None) => {}
                },
            }
        });

        let session: Weak<Self> = Arc::downgrade(self);
        let shutdown_signal = self.shutdown_signal.clone();
        let spend_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_signal.clone() => break,
                    tx = spends.recv() => match (tx, session.upgrade()) {
                        (Some(tx), Some(session)) => session.on_funding_spent(&tx),
                        _ => break,
                    },
                }
            }
        });

        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(confirmation_task);
        tasks.push(spend_task);
        Ok(())
    }

    fn on_confirmation(&self, confirmation: Confirmation) {
        let (result, entry) = {
            let mut channel = self.channel.write().unwrap();
            (channel.funding_confirmed(), channel.to_entry())
        };
        match result {
            Ok(true) => {
                info!("channel {} locked at height {}", self.id, confirmation.block_height);
                if self.persist(&entry).is_ok() {
                    self.publish(ChannelEvent::FundingLocked);
                }
            }
            Ok(false) => {}
            Err(err) => error!("channel {} funding confirmation: {}", self.id, err),
        }
    }

    fn on_funding_spent(&self, tx: &Transaction) {
        let txid = tx.compute_txid();
        if !self.seen_spends.lock().unwrap().insert(txid) {
            debug!("channel {} duplicate spend {}", self.id, txid);
            return;
        }
        let (result, entry) = {
            let mut channel = self.channel.write().unwrap();
            (channel.funding_spent(tx), channel.to_entry())
        };
        match result {
            Ok(spend) => {
                let _ = self.persist(&entry);
                self.publish(ChannelEvent::FundingSpent(spend));
            }
            Err(err) => error!("channel {} funding spend {}: {}", self.id, txid, err),
        }
    }

    /// Our latest commitment, ready to broadcast
    pub fn force_close(&self) -> Result<Transaction, ChannelError> {
        self.mutate(|channel| channel.force_close())
    }

    /// Stop the session.
    ///
    /// An in-flight proposal is cancelled, queued updates fail with a
    /// cancellation error, the chain watch stops and the channel moves to
    /// closing.  The last mutually signed commitment stays valid.
    pub async fn shutdown(&self) -> Result<(), ChannelError> {
        info!("channel {} shutting down", self.id);
        self.shutdown_trigger.trigger();
        let _cycle = self.cycle.lock().await;
        for (_, reply) in mem::take(&mut *self.queue.lock().unwrap()) {
            let _ = reply.send(Err(cancelled()));
        }
        let tasks = mem::take(&mut *self.tasks.lock().unwrap());
        for task in tasks {
            let _ = task.await;
        }
        let entry = {
            let mut channel = self.channel.write().unwrap();
            channel.cancel();
            channel.to_entry()
        };
        self.persist(&entry)
    }
}
