use core::fmt;

use lightning::types::payment::{PaymentHash, PaymentPreimage};
use log::*;
use serde_derive::{Deserialize, Serialize};
use serde_with::serde_as;

use crate::policy::error::{
    already_resolved, insufficient_balance, invalid_preimage, not_yet_expired, protocol_violation,
    too_many_htlcs, unknown_htlc, ChannelError,
};
use crate::prelude::*;
use crate::util::crypto_utils::sha256;
use crate::util::debug_utils::DebugBytes;
use crate::util::ser_util::PaymentHashDef;

/// Direction of an HTLC, from the point of view of the ledger owner
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HtlcDirection {
    /// We offered it, the value comes out of our balance
    Offered,
    /// The counterparty offered it, the value comes out of their balance
    Received,
}

impl HtlcDirection {
    /// The same HTLC as seen by the counterparty
    pub fn mirrored(self) -> Self {
        match self {
            HtlcDirection::Offered => HtlcDirection::Received,
            HtlcDirection::Received => HtlcDirection::Offered,
        }
    }
}

/// HTLC identifier. Each direction has its own index sequence, allocated
/// by the offerer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HtlcId {
    /// Who offered it
    pub direction: HtlcDirection,
    /// Index allocated by the offerer
    pub index: u64,
}

impl HtlcId {
    /// Create an id
    pub fn new(direction: HtlcDirection, index: u64) -> Self {
        HtlcId { direction, index }
    }

    /// The same id as seen by the counterparty
    pub fn mirrored(&self) -> Self {
        HtlcId { direction: self.direction.mirrored(), index: self.index }
    }
}

impl fmt::Display for HtlcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dir = match self.direction {
            HtlcDirection::Offered => "offered",
            HtlcDirection::Received => "received",
        };
        write!(f, "{}#{}", dir, self.index)
    }
}

/// HTLC lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HtlcState {
    /// In flight
    Pending,
    /// Paid to the receiver with a preimage
    Settled,
    /// Refunded to the offerer after expiry
    TimedOut,
    /// Failed back by the receiver before expiry
    Cancelled,
}

/// A hash-time-locked conditional payment
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Htlc {
    /// Identifier
    pub id: HtlcId,
    /// Value
    pub amount_sat: u64,
    /// Hash lock
    #[serde(with = "PaymentHashDef")]
    pub payment_hash: PaymentHash,
    /// Absolute expiry height
    pub cltv_expiry: u32,
    /// Lifecycle state
    pub state: HtlcState,
    /// The commitment number at which the resolution took effect
    pub resolved_at: Option<u64>,
}

impl fmt::Debug for Htlc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Htlc")
            .field("id", &format_args!("{}", self.id))
            .field("amount_sat", &self.amount_sat)
            .field("payment_hash", &DebugBytes(&self.payment_hash.0))
            .field("cltv_expiry", &self.cltv_expiry)
            .field("state", &self.state)
            .field("resolved_at", &self.resolved_at)
            .finish()
    }
}

impl Htlc {
    /// A new pending HTLC
    pub fn new(id: HtlcId, amount_sat: u64, payment_hash: PaymentHash, cltv_expiry: u32) -> Self {
        Htlc {
            id,
            amount_sat,
            payment_hash,
            cltv_expiry,
            state: HtlcState::Pending,
            resolved_at: None,
        }
    }

    /// The same HTLC as seen by the counterparty
    pub fn mirrored(&self) -> Self {
        Htlc { id: self.id.mirrored(), ..self.clone() }
    }

    /// Whether it is still in flight
    pub fn is_pending(&self) -> bool {
        self.state == HtlcState::Pending
    }
}

/// The outcome of resolving an HTLC, used to move balances
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HtlcResolution {
    /// Which HTLC
    pub id: HtlcId,
    /// Its value
    pub amount_sat: u64,
    /// The final state
    pub state: HtlcState,
}

impl HtlcResolution {
    /// Whether the value moves from the offerer to the receiver
    pub fn pays_receiver(&self) -> bool {
        self.state == HtlcState::Settled
    }
}

/// Tracks in-flight HTLCs of a channel and enforces the reserve and
/// count limits.
///
/// The value of a pending HTLC stays in the offerer's committed balance
/// until it is settled.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HtlcLedger {
    #[serde_as(as = "Vec<(_, _)>")]
    htlcs: OrderedMap<HtlcId, Htlc>,
    next_offered_index: u64,
    next_received_index: u64,
    reserve_sat: u64,
    max_htlcs: u16,
}

impl HtlcLedger {
    /// An empty ledger
    pub fn new(reserve_sat: u64, max_htlcs: u16) -> Self {
        HtlcLedger {
            htlcs: OrderedMap::new(),
            next_offered_index: 0,
            next_received_index: 0,
            reserve_sat,
            max_htlcs,
        }
    }

    /// The reserve floor
    pub fn reserve_sat(&self) -> u64 {
        self.reserve_sat
    }

    /// The pending HTLC cap
    pub fn max_htlcs(&self) -> u16 {
        self.max_htlcs
    }

    /// Look up an HTLC
    pub fn get(&self, id: &HtlcId) -> Option<&Htlc> {
        self.htlcs.get(id)
    }

    /// All known HTLCs, pending and resolved
    pub fn htlcs(&self) -> impl Iterator<Item = &Htlc> {
        self.htlcs.values()
    }

    /// Pending HTLCs
    pub fn pending(&self) -> impl Iterator<Item = &Htlc> {
        self.htlcs.values().filter(|h| h.is_pending())
    }

    /// Number of pending HTLCs, both directions
    pub fn pending_count(&self) -> usize {
        self.pending().count()
    }

    /// Total pending value offered in `direction`
    pub fn pending_sat(&self, direction: HtlcDirection) -> u64 {
        self.pending().filter(|h| h.id.direction == direction).map(|h| h.amount_sat).sum()
    }

    /// The next unused index for HTLCs offered in `direction`.
    /// Indices are never reused, even after pruning.
    pub fn next_index(&self, direction: HtlcDirection) -> u64 {
        match direction {
            HtlcDirection::Offered => self.next_offered_index,
            HtlcDirection::Received => self.next_received_index,
        }
    }

    /// Add a pending HTLC.
    ///
    /// `offerer_balance_sat` is the offerer's committed balance, which
    /// still includes the value of its pending HTLCs.
    pub fn add_htlc(&mut self, htlc: Htlc, offerer_balance_sat: u64) -> Result<(), ChannelError> {
        if htlc.id.index < self.next_index(htlc.id.direction) {
            return Err(protocol_violation(format!("duplicate or reused htlc id {}", htlc.id)));
        }
        if self.pending_count() >= self.max_htlcs as usize {
            return Err(too_many_htlcs(self.max_htlcs));
        }
        let available_sat = offerer_balance_sat.saturating_sub(self.reserve_sat);
        let needed_sat = self
            .pending_sat(htlc.id.direction)
            .checked_add(htlc.amount_sat)
            .ok_or_else(|| insufficient_balance(u64::MAX, available_sat))?;
        if needed_sat > available_sat {
            return Err(insufficient_balance(needed_sat, available_sat));
        }
        debug!("add {:?}", htlc);
        match htlc.id.direction {
            HtlcDirection::Offered => self.next_offered_index = htlc.id.index + 1,
            HtlcDirection::Received => self.next_received_index = htlc.id.index + 1,
        }
        self.htlcs.insert(htlc.id, Htlc { state: HtlcState::Pending, resolved_at: None, ..htlc });
        Ok(())
    }

    fn pending_mut(&mut self, id: &HtlcId) -> Result<&mut Htlc, ChannelError> {
        let htlc = self.htlcs.get_mut(id).ok_or_else(|| unknown_htlc(*id))?;
        if !htlc.is_pending() {
            return Err(already_resolved(*id));
        }
        Ok(htlc)
    }

    fn resolve(htlc: &mut Htlc, state: HtlcState, commitment_number: u64) -> HtlcResolution {
        htlc.state = state;
        htlc.resolved_at = Some(commitment_number);
        debug!("resolve {:?}", htlc);
        HtlcResolution { id: htlc.id, amount_sat: htlc.amount_sat, state }
    }

    /// Settle with the payment preimage
    pub fn settle_htlc(
        &mut self,
        id: &HtlcId,
        preimage: &PaymentPreimage,
        commitment_number: u64,
    ) -> Result<HtlcResolution, ChannelError> {
        let htlc = self.pending_mut(id)?;
        if sha256(&preimage.0) != htlc.payment_hash.0 {
            return Err(invalid_preimage(*id));
        }
        Ok(Self::resolve(htlc, HtlcState::Settled, commitment_number))
    }

    /// Refund to the offerer once `current_height` reaches the expiry
    pub fn timeout_htlc(
        &mut self,
        id: &HtlcId,
        current_height: u32,
        commitment_number: u64,
    ) -> Result<HtlcResolution, ChannelError> {
        let htlc = self.pending_mut(id)?;
        if current_height < htlc.cltv_expiry {
            return Err(not_yet_expired(htlc.cltv_expiry, current_height));
        }
        Ok(Self::resolve(htlc, HtlcState::TimedOut, commitment_number))
    }

    /// Fail back to the offerer before expiry
    pub fn cancel_htlc(
        &mut self,
        id: &HtlcId,
        commitment_number: u64,
    ) -> Result<HtlcResolution, ChannelError> {
        let htlc = self.pending_mut(id)?;
        Ok(Self::resolve(htlc, HtlcState::Cancelled, commitment_number))
    }

    /// Forget HTLCs resolved before `commitment_number`
    pub fn prune_resolved(&mut self, commitment_number: u64) -> usize {
        let before = self.htlcs.len();
        self.htlcs.retain(|_, h| h.resolved_at.map_or(true, |at| at >= commitment_number));
        before - self.htlcs.len()
    }

    /// The same ledger as seen by the counterparty
    pub fn mirrored(&self) -> Self {
        HtlcLedger {
            htlcs: self.htlcs.values().map(|h| (h.id.mirrored(), h.mirrored())).collect(),
            next_offered_index: self.next_received_index,
            next_received_index: self.next_offered_index,
            reserve_sat: self.reserve_sat,
            max_htlcs: self.max_htlcs,
        }
    }
}
