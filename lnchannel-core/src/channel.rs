use core::fmt::{self, Debug, Formatter};

use bitcoin::absolute::LockTime;
use bitcoin::secp256k1::{ecdsa::Signature, PublicKey};
use bitcoin::{Network, OutPoint, ScriptBuf, Sequence, Transaction, Txid};
use lightning::types::payment::{PaymentHash, PaymentPreimage};
use serde_derive::{Deserialize, Serialize};
use serde_with::{hex::Hex, serde_as, Bytes, IfIsHumanReadable};
use tracing::*;

use crate::htlc::{Htlc, HtlcDirection, HtlcId, HtlcLedger, HtlcResolution};
use crate::persist::model::ChannelEntry;
use crate::policy::error::{
    breach_detected, construction_error, insufficient_balance, invalid_state_error,
    protocol_violation, revocation_mismatch, sequence_mismatch, update_rejected, ChannelError,
};
use crate::policy::validator::Validator;
use crate::prelude::*;
use crate::revocation::{verify_revocation, RevocationChain, RevocationSecret, RevocationStore};
use crate::signer::Signer;
use crate::tx::script::{
    funding_cooperative_witness, funding_redeemscript, funding_timeout_witness,
    to_them_witness, to_us_delayed_witness, to_us_redeemscript, to_us_revocation_witness,
    FundingVariant,
};
use crate::tx::tx::{
    build_closing_tx, build_commitment_tx, build_sweep_tx, decode_commitment_number, spends,
    CommitmentInfo, CommitmentTx,
};
use crate::util::crypto_utils::sha256;
use crate::util::debug_utils::{script_debug, DebugBytes};
use crate::Arc;

/// Channel identifier
///
/// This ID is chosen by the parties at open and is not derived from the
/// funding outpoint.
#[serde_as]
#[derive(PartialEq, Eq, Clone, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId(#[serde_as(as = "IfIsHumanReadable<Hex, Bytes>")] Vec<u8>);

impl ChannelId {
    /// Create an ID
    pub fn new(inner: &[u8]) -> Self {
        Self(inner.to_vec())
    }

    /// Convert to a byte slice
    pub fn as_slice(&self) -> &[u8] {
        self.0.as_slice()
    }

    /// Get a reference to the byte vector
    pub fn inner(&self) -> &Vec<u8> {
        &self.0
    }
}

impl Debug for ChannelId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

/// The negotiated parameters of a [`Channel`], from the holder's point of view.
///
/// The counterparty holds the same parameters with holder and counterparty
/// swapped.
#[serde_as]
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSetup {
    /// The network, used for logging addresses
    pub network: Network,
    /// Whether we initiated the channel.  The initiator pays the
    /// commitment and closing fees and is the funder of a
    /// [`FundingVariant::SingleFunderTimeout`] channel.
    pub is_outbound: bool,
    /// The total the channel was funded with
    pub channel_value_sat: u64,
    /// The funding output variant
    pub funding_variant: FundingVariant,
    /// The funding outpoint
    pub funding_outpoint: OutPoint,
    /// Our key in the funding output
    pub holder_funding_pubkey: PublicKey,
    /// Their key in the funding output
    pub counterparty_funding_pubkey: PublicKey,
    /// Our key in commitment outputs
    pub holder_commit_pubkey: PublicKey,
    /// Their key in commitment outputs
    pub counterparty_commit_pubkey: PublicKey,
    /// The counterparty's node
    pub counterparty_node_id: PublicKey,
    /// locally imposed requirement on the counterparty's to-us output delay
    pub holder_selected_contest_delay: u16,
    /// remotely imposed requirement on our to-us output delay
    pub counterparty_selected_contest_delay: u16,
    /// Balance each party must keep above its pending HTLCs
    pub channel_reserve_sat: u64,
    /// Cap on pending HTLCs, both directions
    pub max_accepted_htlcs: u16,
    /// Fixed fee of each commitment transaction, paid by the initiator
    pub commitment_fee_sat: u64,
    /// Our balance at open
    pub holder_initial_sat: u64,
    /// The counterparty's revocation hash for commitment zero
    #[serde_as(as = "IfIsHumanReadable<Hex, Bytes>")]
    pub counterparty_initial_revocation_hash: [u8; 32],
    /// The counterparty's revocation hash for commitment one
    #[serde_as(as = "IfIsHumanReadable<Hex, Bytes>")]
    pub counterparty_second_revocation_hash: [u8; 32],
}

// Implement manually so we can have hex encoded revocation hashes.
impl Debug for ChannelSetup {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSetup")
            .field("network", &self.network)
            .field("is_outbound", &self.is_outbound)
            .field("channel_value_sat", &self.channel_value_sat)
            .field("funding_variant", &self.funding_variant)
            .field("funding_outpoint", &self.funding_outpoint)
            .field("holder_funding_pubkey", &self.holder_funding_pubkey)
            .field("counterparty_funding_pubkey", &self.counterparty_funding_pubkey)
            .field("holder_commit_pubkey", &self.holder_commit_pubkey)
            .field("counterparty_commit_pubkey", &self.counterparty_commit_pubkey)
            .field("counterparty_node_id", &self.counterparty_node_id)
            .field("holder_selected_contest_delay", &self.holder_selected_contest_delay)
            .field("counterparty_selected_contest_delay", &self.counterparty_selected_contest_delay)
            .field("channel_reserve_sat", &self.channel_reserve_sat)
            .field("max_accepted_htlcs", &self.max_accepted_htlcs)
            .field("commitment_fee_sat", &self.commitment_fee_sat)
            .field("holder_initial_sat", &self.holder_initial_sat)
            .field(
                "counterparty_initial_revocation_hash",
                &DebugBytes(&self.counterparty_initial_revocation_hash),
            )
            .field(
                "counterparty_second_revocation_hash",
                &DebugBytes(&self.counterparty_second_revocation_hash),
            )
            .finish()
    }
}

impl ChannelSetup {
    /// The funding key of the initiator
    pub fn funder_funding_pubkey(&self) -> &PublicKey {
        if self.is_outbound {
            &self.holder_funding_pubkey
        } else {
            &self.counterparty_funding_pubkey
        }
    }

    /// The funding key of the non-initiator
    pub fn fundee_funding_pubkey(&self) -> &PublicKey {
        if self.is_outbound {
            &self.counterparty_funding_pubkey
        } else {
            &self.holder_funding_pubkey
        }
    }

    /// The funding output redeem script
    pub fn funding_redeemscript(&self) -> Result<ScriptBuf, ChannelError> {
        funding_redeemscript(
            &self.funding_variant,
            self.funder_funding_pubkey(),
            self.fundee_funding_pubkey(),
        )
    }

    /// The fee we pay on each commitment and closing transaction
    pub fn holder_fee_sat(&self, fee_sat: u64) -> u64 {
        if self.is_outbound {
            fee_sat
        } else {
            0
        }
    }

    /// The fee the counterparty pays on each commitment and closing transaction
    pub fn counterparty_fee_sat(&self, fee_sat: u64) -> u64 {
        if self.is_outbound {
            0
        } else {
            fee_sat
        }
    }
}

/// Channel lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelState {
    /// Funding not yet confirmed
    Pending,
    /// Funding confirmed, commitments can be exchanged
    Open,
    /// A new commitment was proposed and awaits the counterparty
    Updating,
    /// Cooperative or unilateral close in progress
    Closing,
    /// The funding output was spent by a close
    Closed,
    /// The counterparty broadcast a revoked commitment
    Breached,
}

impl ChannelState {
    /// Whether no further state change is possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChannelState::Closed | ChannelState::Breached)
    }
}

/// A change to the channel, from the point of view of the party proposing it
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelUpdate {
    /// Move value between the parties.  Positive values move to the proposer.
    BalanceDelta {
        /// Value moved to the proposer
        to_us_sat: i64,
    },
    /// Offer a conditional payment to the counterparty.  The index is
    /// allocated in proposal order.
    AddHtlc {
        /// Value
        amount_sat: u64,
        /// Hash lock
        payment_hash: PaymentHash,
        /// Absolute expiry height
        cltv_expiry: u32,
    },
    /// Claim a received HTLC with its preimage
    SettleHtlc {
        /// The HTLC
        id: HtlcId,
        /// The preimage of its payment hash
        preimage: PaymentPreimage,
    },
    /// Reclaim an offered HTLC after its expiry
    TimeoutHtlc {
        /// The HTLC
        id: HtlcId,
        /// The height the proposer observes
        current_height: u32,
    },
    /// Fail a received HTLC back to its offerer
    CancelHtlc {
        /// The HTLC
        id: HtlcId,
    },
}

impl ChannelUpdate {
    /// The same update as seen by the counterparty.
    ///
    /// A delta of `i64::MIN` has no counterpart and saturates; such an
    /// update is rejected before it is mirrored.
    pub fn mirrored(&self) -> Self {
        match self {
            ChannelUpdate::BalanceDelta { to_us_sat } =>
                ChannelUpdate::BalanceDelta { to_us_sat: to_us_sat.saturating_neg() },
            ChannelUpdate::AddHtlc { .. } => self.clone(),
            ChannelUpdate::SettleHtlc { id, preimage } =>
                ChannelUpdate::SettleHtlc { id: id.mirrored(), preimage: *preimage },
            ChannelUpdate::TimeoutHtlc { id, current_height } =>
                ChannelUpdate::TimeoutHtlc { id: id.mirrored(), current_height: *current_height },
            ChannelUpdate::CancelHtlc { id } => ChannelUpdate::CancelHtlc { id: id.mirrored() },
        }
    }

    // Only the receiver may settle or cancel, only the offerer may time out
    fn check_origin(&self) -> Result<(), String> {
        match self {
            ChannelUpdate::BalanceDelta { to_us_sat } if to_us_sat.checked_neg().is_none() =>
                Err(format!("balance delta {} out of range", to_us_sat)),
            ChannelUpdate::SettleHtlc { id, .. } | ChannelUpdate::CancelHtlc { id }
                if id.direction != HtlcDirection::Received =>
                Err(format!("{} can only be resolved by its receiver", id)),
            ChannelUpdate::TimeoutHtlc { id, .. } if id.direction != HtlcDirection::Offered =>
                Err(format!("{} can only be timed out by its offerer", id)),
            _ => Ok(()),
        }
    }
}

/// A proposed new commitment, sent to the counterparty
#[derive(Clone, Debug, PartialEq)]
pub struct CommitmentProposal {
    /// The commitment number being proposed
    pub commitment_number: u64,
    /// The updates, from the proposer's point of view
    pub updates: Vec<ChannelUpdate>,
    /// The proposer's signature on the counterparty's new commitment
    pub signature: Signature,
}

/// The counterparty's acceptance of a [`CommitmentProposal`]
#[derive(Clone, Debug, PartialEq)]
pub struct CommitAcceptance {
    /// The accepted commitment number
    pub commitment_number: u64,
    /// The acceptor's signature on the proposer's new commitment
    pub signature: Signature,
    /// The acceptor's secret for its superseded commitment
    pub revocation: RevocationSecret,
    /// The acceptor's revocation hash for the commitment after the accepted one
    pub next_revocation_hash: [u8; 32],
}

/// The proposer's revocation, completing an update cycle
#[derive(Clone, Debug, PartialEq)]
pub struct RevocationMessage {
    /// The proposer's secret for its superseded commitment
    pub revocation: RevocationSecret,
    /// The proposer's revocation hash for the commitment after the accepted one
    pub next_revocation_hash: [u8; 32],
}

/// What is needed to claim the to-us output of a revoked commitment
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BreachRemedy {
    /// The revoked commitment that was broadcast
    pub commitment_number: u64,
    /// Its revocation secret
    pub revocation: RevocationSecret,
    /// The broadcast transaction
    pub txid: Txid,
    /// The breacher's to-us output and its value, absent if it was dust
    pub to_us_output: Option<(OutPoint, u64)>,
    /// The witness script of the to-us output
    pub witness_script: ScriptBuf,
}

/// How the funding output was spent
#[derive(Clone, Debug, PartialEq)]
pub enum FundingSpend {
    /// By the agreed cooperative closing transaction
    CooperativeClose,
    /// By our latest commitment
    HolderCommitment(u64),
    /// By a counterparty commitment that is not revoked
    CounterpartyCommitment(u64),
    /// By the funder's timeout path
    FundingRefund,
    /// By a revoked counterparty commitment
    Breach(BreachRemedy),
    /// By something we don't recognize
    Unknown(Txid),
}

/// A cooperative close in progress
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClosingState {
    pub fee_sat: u64,
    pub holder_script: ScriptBuf,
    pub counterparty_script: ScriptBuf,
    pub transaction: Transaction,
    pub holder_sig: Signature,
    pub counterparty_sig: Option<Signature>,
}

/// A proposed cooperative closing transaction
#[derive(Clone, Debug, PartialEq)]
pub struct ClosingProposal {
    /// Fee, paid by the initiator
    pub fee_sat: u64,
    /// Where the proposer is paid
    pub proposer_script: ScriptBuf,
    /// Where the acceptor is paid
    pub acceptor_script: ScriptBuf,
    /// The proposer's signature on the closing transaction
    pub signature: Signature,
}

/// The acceptor's signature on a [`ClosingProposal`]
#[derive(Clone, Debug, PartialEq)]
pub struct ClosingAcceptance {
    /// The acceptor's signature on the closing transaction
    pub signature: Signature,
}

// Balances and HTLCs of a candidate commitment
#[derive(Clone, Debug)]
struct ChannelScratch {
    to_us_sat: u64,
    to_them_sat: u64,
    htlcs: HtlcLedger,
}

impl ChannelScratch {
    fn resolve(&mut self, resolution: &HtlcResolution) {
        if !resolution.pays_receiver() {
            return;
        }
        match resolution.id.direction {
            HtlcDirection::Offered => {
                self.to_us_sat -= resolution.amount_sat;
                self.to_them_sat += resolution.amount_sat;
            }
            HtlcDirection::Received => {
                self.to_them_sat -= resolution.amount_sat;
                self.to_us_sat += resolution.amount_sat;
            }
        }
    }
}

// A proposal awaiting acceptance
#[derive(Clone, Debug)]
struct PendingUpdate {
    commitment_number: u64,
    scratch: ChannelScratch,
    holder_commitment: CommitmentTx,
    counterparty_commitment: CommitmentTx,
}

/// A payment channel between the holder and a counterparty.
///
/// Both parties advance their commitments together.  Commitment `n` of
/// each party is replaced by commitment `n + 1` in one update cycle:
///
/// 1. the proposer calls [`Channel::propose_update`] and sends the
///    [`CommitmentProposal`]
/// 2. the counterparty calls [`Channel::receive_proposal`], which makes
///    `n + 1` current on its side and revokes its commitment `n`
/// 3. the proposer calls [`Channel::commit_accepted`], which makes `n + 1`
///    current on its side and revokes its commitment `n`
/// 4. the counterparty calls [`Channel::receive_revocation`]
///
/// The value of a pending HTLC stays in the offerer's output until it is
/// settled.  The commitment fee is deducted from the initiator's output.
#[derive(Clone)]
pub struct Channel {
    id: ChannelId,
    setup: ChannelSetup,
    state: ChannelState,
    commitment_number: u64,
    // Both include the value of pending HTLCs offered by that party
    to_us_sat: u64,
    to_them_sat: u64,
    htlcs: HtlcLedger,
    revocation: RevocationChain,
    counterparty_secrets: RevocationStore,
    // For the counterparty's current commitment
    counterparty_revocation_hash: [u8; 32],
    // For the counterparty's next commitment
    counterparty_next_revocation_hash: [u8; 32],
    funding_redeemscript: ScriptBuf,
    holder_commitment: CommitmentTx,
    holder_commitment_sig: Option<Signature>,
    counterparty_commitment: CommitmentTx,
    // The commitment we revoked in `receive_proposal`, whose counterparty
    // revocation we still wait for
    awaiting_revocation: Option<u64>,
    pending: Option<PendingUpdate>,
    closing: Option<ClosingState>,
    breach: Option<BreachRemedy>,
    signer: Arc<dyn Signer>,
    validator: Arc<dyn Validator>,
}

impl Debug for Channel {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("commitment_number", &self.commitment_number)
            .field("to_us_sat", &self.to_us_sat)
            .field("to_them_sat", &self.to_them_sat)
            .field("htlcs", &self.htlcs)
            .field("revocation", &self.revocation)
            .field("counterparty_secrets", &self.counterparty_secrets)
            .field("awaiting_revocation", &self.awaiting_revocation)
            .field("pending", &self.pending.as_ref().map(|p| p.commitment_number))
            .field("breach", &self.breach)
            .finish()
    }
}

impl Channel {
    /// Create a channel after successful funding negotiation.
    ///
    /// Builds commitment zero for both parties.  The channel is
    /// [`ChannelState::Pending`] until the funding confirms.
    pub fn new(
        id: ChannelId,
        setup: ChannelSetup,
        holder_seed: [u8; 32],
        signer: Arc<dyn Signer>,
        validator: Arc<dyn Validator>,
    ) -> Result<Channel, ChannelError> {
        validator.validate_setup(&setup)?;
        let funding_redeemscript = setup.funding_redeemscript()?;
        let revocation = RevocationChain::new(holder_seed);
        let htlcs = HtlcLedger::new(setup.channel_reserve_sat, setup.max_accepted_htlcs);
        let scratch = ChannelScratch {
            to_us_sat: setup.holder_initial_sat,
            to_them_sat: setup.channel_value_sat - setup.holder_initial_sat,
            htlcs: htlcs.clone(),
        };
        let holder_commitment =
            Self::build_holder_commitment(&setup, &revocation, 0, &scratch)?;
        let counterparty_commitment = Self::build_counterparty_commitment(
            &setup,
            0,
            &setup.counterparty_initial_revocation_hash,
            &scratch,
        )?;
        info!(
            "new channel {} value {} to_us {} to_them {}",
            id, setup.channel_value_sat, scratch.to_us_sat, scratch.to_them_sat
        );
        Ok(Channel {
            id,
            state: ChannelState::Pending,
            commitment_number: 0,
            to_us_sat: scratch.to_us_sat,
            to_them_sat: scratch.to_them_sat,
            htlcs,
            revocation,
            counterparty_secrets: RevocationStore::new(),
            counterparty_revocation_hash: setup.counterparty_initial_revocation_hash,
            counterparty_next_revocation_hash: setup.counterparty_second_revocation_hash,
            funding_redeemscript,
            holder_commitment,
            holder_commitment_sig: None,
            counterparty_commitment,
            awaiting_revocation: None,
            pending: None,
            closing: None,
            breach: None,
            setup,
            signer,
            validator,
        })
    }

    /// Restore a channel from its persisted entry
    pub fn restore(
        id: ChannelId,
        entry: ChannelEntry,
        signer: Arc<dyn Signer>,
        validator: Arc<dyn Validator>,
    ) -> Result<Channel, ChannelError> {
        let setup = entry.setup;
        let funding_redeemscript = setup.funding_redeemscript()?;
        let holder_commitment =
            build_commitment_tx(&setup.funding_outpoint, &entry.holder_commitment)?;
        let counterparty_commitment =
            build_commitment_tx(&setup.funding_outpoint, &entry.counterparty_commitment)?;
        let state = match entry.state {
            ChannelState::Updating => ChannelState::Open,
            s => s,
        };
        let channel = Channel {
            id,
            setup,
            state,
            commitment_number: entry.commitment_number,
            to_us_sat: entry.to_us_sat,
            to_them_sat: entry.to_them_sat,
            htlcs: entry.htlcs,
            revocation: entry.holder_revocation,
            counterparty_secrets: entry.counterparty_secrets,
            counterparty_revocation_hash: entry.counterparty_revocation_hash,
            counterparty_next_revocation_hash: entry.counterparty_next_revocation_hash,
            funding_redeemscript,
            holder_commitment,
            holder_commitment_sig: entry.holder_commitment_sig,
            counterparty_commitment,
            awaiting_revocation: entry.awaiting_revocation,
            pending: None,
            closing: entry.closing,
            breach: entry.breach,
            signer,
            validator,
        };
        debug!("restored {:?}", channel);
        Ok(channel)
    }

    /// The persistable state.  An in-flight proposal is not included.
    pub fn to_entry(&self) -> ChannelEntry {
        let state = match self.state {
            ChannelState::Updating => ChannelState::Open,
            s => s,
        };
        ChannelEntry {
            setup: self.setup.clone(),
            state,
            commitment_number: self.commitment_number,
            to_us_sat: self.to_us_sat,
            to_them_sat: self.to_them_sat,
            htlcs: self.htlcs.clone(),
            holder_revocation: self.revocation.clone(),
            counterparty_secrets: self.counterparty_secrets.clone(),
            counterparty_revocation_hash: self.counterparty_revocation_hash,
            counterparty_next_revocation_hash: self.counterparty_next_revocation_hash,
            holder_commitment: self.holder_commitment.info.clone(),
            holder_commitment_sig: self.holder_commitment_sig,
            counterparty_commitment: self.counterparty_commitment.info.clone(),
            awaiting_revocation: self.awaiting_revocation,
            closing: self.closing.clone(),
            breach: self.breach.clone(),
        }
    }

    /// The channel id
    pub fn id(&self) -> &ChannelId {
        &self.id
    }

    /// The negotiated parameters
    pub fn setup(&self) -> &ChannelSetup {
        &self.setup
    }

    /// The lifecycle state
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// The number of the current mutually signed commitments
    pub fn commitment_number(&self) -> u64 {
        self.commitment_number
    }

    /// Our committed balance, excluding our pending offered HTLCs
    pub fn our_balance(&self) -> u64 {
        self.to_us_sat - self.htlcs.pending_sat(HtlcDirection::Offered)
    }

    /// Their committed balance, excluding their pending offered HTLCs
    pub fn their_balance(&self) -> u64 {
        self.to_them_sat - self.htlcs.pending_sat(HtlcDirection::Received)
    }

    /// The HTLCs of the current commitment
    pub fn htlcs(&self) -> &HtlcLedger {
        &self.htlcs
    }

    /// The funding output redeem script
    pub fn funding_redeemscript(&self) -> &ScriptBuf {
        &self.funding_redeemscript
    }

    /// Our current commitment
    pub fn holder_commitment(&self) -> &CommitmentTx {
        &self.holder_commitment
    }

    /// The counterparty's signature on our current commitment
    pub fn holder_commitment_signature(&self) -> Option<Signature> {
        self.holder_commitment_sig
    }

    /// The counterparty's current commitment
    pub fn counterparty_commitment(&self) -> &CommitmentTx {
        &self.counterparty_commitment
    }

    /// Our proposed commitment, while [`ChannelState::Updating`]
    pub fn pending_commitment(&self) -> Option<&CommitmentTx> {
        self.pending.as_ref().map(|p| &p.holder_commitment)
    }

    /// The commitment whose counterparty revocation we are waiting for
    pub fn awaiting_revocation(&self) -> Option<u64> {
        self.awaiting_revocation
    }

    /// Our revocation hash for commitment `commitment_number`, for the
    /// counterparty's setup at open
    pub fn holder_revocation_hash(
        &self,
        commitment_number: u64,
    ) -> Result<[u8; 32], ChannelError> {
        self.revocation.commitment_at(commitment_number)
    }

    /// The counterparty's revocation secret for `commitment_number`, if disclosed
    pub fn counterparty_revocation_secret(&self, commitment_number: u64) -> Option<[u8; 32]> {
        self.counterparty_secrets.get(commitment_number)
    }

    /// The breach, once detected
    pub fn breach_remedy(&self) -> Option<&BreachRemedy> {
        self.breach.as_ref()
    }

    /// The fully signed cooperative closing transaction, once both parties signed
    pub fn closing_tx(&self) -> Option<Transaction> {
        let closing = self.closing.as_ref()?;
        let counterparty_sig = closing.counterparty_sig?;
        let mut tx = closing.transaction.clone();
        tx.input[0].witness = funding_cooperative_witness(
            &self.setup.funding_variant,
            &self.funding_redeemscript,
            &self.setup.holder_funding_pubkey,
            &closing.holder_sig,
            &self.setup.counterparty_funding_pubkey,
            &counterparty_sig,
        );
        Some(tx)
    }

    /// Our revocation secret for a superseded commitment.
    ///
    /// Fails with a premature disclosure error unless commitment
    /// `commitment_number + 1` has been accepted.
    pub fn holder_revocation_secret(
        &self,
        commitment_number: u64,
    ) -> Result<RevocationSecret, ChannelError> {
        let mut chain = self.revocation.clone();
        chain.disclose(commitment_number, self.commitment_number)
    }

    fn check_state(&self, allowed: &[ChannelState]) -> Result<(), ChannelError> {
        if let Some(breach) = &self.breach {
            return Err(breach_detected(breach.commitment_number));
        }
        if !allowed.contains(&self.state) {
            return Err(invalid_state_error(format!(
                "channel {} is {:?}, expected one of {:?}",
                self.id, self.state, allowed
            )));
        }
        Ok(())
    }

    // Protocol violations force a unilateral close
    fn escalate<T>(&mut self, result: Result<T, ChannelError>) -> Result<T, ChannelError> {
        if let Err(err) = &result {
            if err.is_protocol_violation() && !self.state.is_terminal() {
                warn!("channel {} forcing close after {}", self.id, err);
                self.pending = None;
                self.state = ChannelState::Closing;
            }
        }
        result
    }

    fn scratch(&self) -> ChannelScratch {
        ChannelScratch {
            to_us_sat: self.to_us_sat,
            to_them_sat: self.to_them_sat,
            htlcs: self.htlcs.clone(),
        }
    }

    fn build_holder_commitment(
        setup: &ChannelSetup,
        revocation: &RevocationChain,
        commitment_number: u64,
        scratch: &ChannelScratch,
    ) -> Result<CommitmentTx, ChannelError> {
        let fee = setup.commitment_fee_sat;
        let info = CommitmentInfo {
            commitment_number,
            owner_key: setup.holder_commit_pubkey,
            counterparty_key: setup.counterparty_commit_pubkey,
            revocation_hash: revocation.commitment_at(commitment_number)?,
            to_self_delay: setup.counterparty_selected_contest_delay,
            to_owner_value_sat: after_fee(scratch.to_us_sat, setup.holder_fee_sat(fee))?,
            to_counterparty_value_sat: after_fee(
                scratch.to_them_sat,
                setup.counterparty_fee_sat(fee),
            )?,
        };
        build_commitment_tx(&setup.funding_outpoint, &info)
    }

    fn build_counterparty_commitment(
        setup: &ChannelSetup,
        commitment_number: u64,
        revocation_hash: &[u8; 32],
        scratch: &ChannelScratch,
    ) -> Result<CommitmentTx, ChannelError> {
        let fee = setup.commitment_fee_sat;
        let info = CommitmentInfo {
            commitment_number,
            owner_key: setup.counterparty_commit_pubkey,
            counterparty_key: setup.holder_commit_pubkey,
            revocation_hash: *revocation_hash,
            to_self_delay: setup.holder_selected_contest_delay,
            to_owner_value_sat: after_fee(scratch.to_them_sat, setup.counterparty_fee_sat(fee))?,
            to_counterparty_value_sat: after_fee(scratch.to_us_sat, setup.holder_fee_sat(fee))?,
        };
        build_commitment_tx(&setup.funding_outpoint, &info)
    }

    fn sign_funding_spend(&self, tx: &Transaction) -> Result<Signature, ChannelError> {
        Ok(self.signer.sign(
            &self.funding_redeemscript,
            tx,
            0,
            self.setup.channel_value_sat,
            &self.setup.holder_funding_pubkey,
        )?)
    }

    fn verify_funding_spend(
        &self,
        tx: &Transaction,
        sig: &Signature,
    ) -> Result<(), ChannelError> {
        let valid = self.signer.verify(
            sig,
            &self.funding_redeemscript,
            tx,
            0,
            self.setup.channel_value_sat,
            &self.setup.counterparty_funding_pubkey,
        )?;
        if !valid {
            signature_err!("counterparty signature does not match {}", tx.compute_txid());
        }
        Ok(())
    }

    // The value `payer` can give away, above its reserve, pending HTLCs and fee
    fn spendable_sat(&self, scratch: &ChannelScratch, holder_pays: bool) -> u64 {
        let fee = self.setup.commitment_fee_sat;
        let (value, pending, fee) = if holder_pays {
            (
                scratch.to_us_sat,
                scratch.htlcs.pending_sat(HtlcDirection::Offered),
                self.setup.holder_fee_sat(fee),
            )
        } else {
            (
                scratch.to_them_sat,
                scratch.htlcs.pending_sat(HtlcDirection::Received),
                self.setup.counterparty_fee_sat(fee),
            )
        };
        value
            .saturating_sub(pending)
            .saturating_sub(fee)
            .saturating_sub(self.setup.channel_reserve_sat)
    }

    // Apply an update, given from our point of view, to a candidate commitment.
    // Returns the id of an added HTLC.
    fn apply_update(
        &self,
        scratch: &mut ChannelScratch,
        update: &ChannelUpdate,
        local: bool,
        commitment_number: u64,
    ) -> Result<Option<HtlcId>, ChannelError> {
        match update {
            ChannelUpdate::BalanceDelta { to_us_sat } => {
                if *to_us_sat == 0 {
                    update_rejected_err!("zero balance delta");
                }
                let amount = to_us_sat.unsigned_abs();
                let holder_pays = *to_us_sat < 0;
                let available = self.spendable_sat(scratch, holder_pays);
                if amount > available {
                    return Err(insufficient_balance(amount, available));
                }
                if holder_pays {
                    scratch.to_us_sat -= amount;
                    scratch.to_them_sat += amount;
                } else {
                    scratch.to_them_sat -= amount;
                    scratch.to_us_sat += amount;
                }
                Ok(None)
            }
            ChannelUpdate::AddHtlc { amount_sat, payment_hash, cltv_expiry } => {
                self.validator.validate_htlc(&self.setup, *amount_sat, *cltv_expiry)?;
                let fee = self.setup.commitment_fee_sat;
                let (direction, offerer_sat) = if local {
                    (
                        HtlcDirection::Offered,
                        after_fee(scratch.to_us_sat, self.setup.holder_fee_sat(fee))?,
                    )
                } else {
                    (
                        HtlcDirection::Received,
                        after_fee(scratch.to_them_sat, self.setup.counterparty_fee_sat(fee))?,
                    )
                };
                let id = HtlcId::new(direction, scratch.htlcs.next_index(direction));
                scratch
                    .htlcs
                    .add_htlc(Htlc::new(id, *amount_sat, *payment_hash, *cltv_expiry), offerer_sat)?;
                Ok(Some(id))
            }
            ChannelUpdate::SettleHtlc { id, preimage } => {
                let resolution = scratch.htlcs.settle_htlc(id, preimage, commitment_number)?;
                scratch.resolve(&resolution);
                Ok(None)
            }
            ChannelUpdate::TimeoutHtlc { id, current_height } => {
                let resolution =
                    scratch.htlcs.timeout_htlc(id, *current_height, commitment_number)?;
                scratch.resolve(&resolution);
                Ok(None)
            }
            ChannelUpdate::CancelHtlc { id } => {
                let resolution = scratch.htlcs.cancel_htlc(id, commitment_number)?;
                scratch.resolve(&resolution);
                Ok(None)
            }
        }
    }

    /// Check local updates one by one against the composition of the ones
    /// before them, as [`Channel::propose_update`] would apply them.
    ///
    /// Returns, for each update, the error that rejects it, or the id of
    /// the HTLC it adds.  The channel is not changed.
    pub fn compose(&self, updates: &[ChannelUpdate]) -> Vec<Result<Option<HtlcId>, ChannelError>> {
        let commitment_number = self.commitment_number + 1;
        let mut scratch = self.scratch();
        updates
            .iter()
            .map(|update| -> Result<Option<HtlcId>, ChannelError> {
                let mut candidate = scratch.clone();
                update.check_origin().map_err(update_rejected)?;
                let result = self.apply_update(&mut candidate, update, true, commitment_number);
                if result.is_ok() {
                    scratch = candidate;
                }
                result
            })
            .collect()
    }

    /// Sign the counterparty's current commitment, for the initial
    /// signature exchange before the funding is broadcast
    #[instrument(skip(self))]
    pub fn sign_counterparty_commitment(&self) -> Result<Signature, ChannelError> {
        self.check_state(&[ChannelState::Pending, ChannelState::Open])?;
        self.sign_funding_spend(&self.counterparty_commitment.transaction)
    }

    /// Validate the counterparty's signature on our commitment zero
    #[instrument(skip(self))]
    pub fn validate_holder_commitment_signature(
        &mut self,
        sig: &Signature,
    ) -> Result<(), ChannelError> {
        self.check_state(&[ChannelState::Pending])?;
        self.verify_funding_spend(&self.holder_commitment.transaction, sig)?;
        self.holder_commitment_sig = Some(*sig);
        debug!("channel {} holder commitment 0 signed", self.id);
        Ok(())
    }

    /// The funding transaction reached its minimum depth.
    ///
    /// Returns whether the channel became open.  Repeated notifications
    /// have no effect.
    pub fn funding_confirmed(&mut self) -> Result<bool, ChannelError> {
        if self.state != ChannelState::Pending {
            debug!("channel {} duplicate funding confirmation in {:?}", self.id, self.state);
            return Ok(false);
        }
        if self.holder_commitment_sig.is_none() {
            invalid_state_err!("channel {} funding confirmed before holder commitment signed", self.id);
        }
        self.state = ChannelState::Open;
        info!("channel {} funding locked at {}", self.id, self.setup.funding_outpoint);
        trace_channel_state!(self);
        Ok(true)
    }

    /// Propose a new commitment applying `updates`.
    ///
    /// Balances do not move until [`Channel::commit_accepted`].
    #[instrument(skip(self))]
    pub fn propose_update(
        &mut self,
        updates: Vec<ChannelUpdate>,
    ) -> Result<CommitmentProposal, ChannelError> {
        let result = self.do_propose_update(updates);
        self.escalate(result)
    }

    fn do_propose_update(
        &mut self,
        updates: Vec<ChannelUpdate>,
    ) -> Result<CommitmentProposal, ChannelError> {
        self.check_state(&[ChannelState::Open])?;
        if let Some(num) = self.awaiting_revocation {
            invalid_state_err!("awaiting counterparty revocation of {}", num);
        }
        if updates.is_empty() {
            update_rejected_err!("no updates");
        }
        let commitment_number = self.commitment_number + 1;
        // the revocation for the commitment after this one must exist too
        self.revocation.commitment_at(commitment_number + 1)?;
        let mut scratch = self.scratch();
        for update in &updates {
            update.check_origin().map_err(update_rejected)?;
            self.apply_update(&mut scratch, update, true, commitment_number)?;
        }
        let holder_commitment = Self::build_holder_commitment(
            &self.setup,
            &self.revocation,
            commitment_number,
            &scratch,
        )?;
        let counterparty_commitment = Self::build_counterparty_commitment(
            &self.setup,
            commitment_number,
            &self.counterparty_next_revocation_hash,
            &scratch,
        )?;
        let signature = self.sign_funding_spend(&counterparty_commitment.transaction)?;
        info!(
            "channel {} proposing {} with {} updates",
            self.id,
            commitment_number,
            updates.len()
        );
        self.pending = Some(PendingUpdate {
            commitment_number,
            scratch,
            holder_commitment,
            counterparty_commitment,
        });
        self.state = ChannelState::Updating;
        Ok(CommitmentProposal { commitment_number, updates, signature })
    }

    /// The counterparty accepted our proposal.
    ///
    /// Verifies its signature on our new commitment and the secret revoking
    /// its previous one, then makes the new commitment current and returns
    /// our revocation of the previous one.
    ///
    /// A bad signature or secret leaves the proposal pending, so the
    /// acceptance can be retried.  A sequence mismatch forces a close.
    #[instrument(skip(self))]
    pub fn commit_accepted(
        &mut self,
        acceptance: &CommitAcceptance,
    ) -> Result<RevocationMessage, ChannelError> {
        let result = self.do_commit_accepted(acceptance);
        self.escalate(result)
    }

    fn do_commit_accepted(
        &mut self,
        acceptance: &CommitAcceptance,
    ) -> Result<RevocationMessage, ChannelError> {
        let mut debug_on_return = scoped_debug_return!(acceptance);
        self.check_state(&[ChannelState::Updating])?;
        let pending =
            self.pending.take().ok_or_else(|| invalid_state_error("no pending update"))?;
        let secrets = match self.check_acceptance(&pending, acceptance) {
            Ok(secrets) => secrets,
            Err(err) => {
                self.pending = Some(pending);
                return Err(err);
            }
        };

        let previous = self.commitment_number;
        let next_revocation_hash = self.revocation.commitment_at(pending.commitment_number + 1)?;
        let revocation = self.revocation.disclose(previous, pending.commitment_number)?;
        self.counterparty_secrets = secrets;
        self.counterparty_revocation_hash = self.counterparty_next_revocation_hash;
        self.counterparty_next_revocation_hash = acceptance.next_revocation_hash;
        self.install(pending, acceptance.signature);
        self.state = ChannelState::Open;
        info!(
            "channel {} committed {} to_us {} to_them {}",
            self.id, self.commitment_number, self.to_us_sat, self.to_them_sat
        );
        trace_channel_state!(self);
        *debug_on_return = false;
        Ok(RevocationMessage { revocation, next_revocation_hash })
    }

    fn check_acceptance(
        &self,
        pending: &PendingUpdate,
        acceptance: &CommitAcceptance,
    ) -> Result<RevocationStore, ChannelError> {
        if acceptance.commitment_number != pending.commitment_number {
            return Err(sequence_mismatch(pending.commitment_number, acceptance.commitment_number));
        }
        if acceptance.revocation.commitment_number != self.commitment_number {
            return Err(sequence_mismatch(
                self.commitment_number,
                acceptance.revocation.commitment_number,
            ));
        }
        self.verify_funding_spend(&pending.holder_commitment.transaction, &acceptance.signature)?;
        self.check_revocation(&acceptance.revocation)
    }

    // Verify a counterparty secret for its current commitment and return
    // the secret store including it
    fn check_revocation(
        &self,
        revocation: &RevocationSecret,
    ) -> Result<RevocationStore, ChannelError> {
        if !verify_revocation(&self.counterparty_revocation_hash, &revocation.secret) {
            return Err(revocation_mismatch(format!(
                "secret for {} does not match {:?}",
                revocation.commitment_number,
                DebugBytes(&self.counterparty_revocation_hash)
            )));
        }
        let mut secrets = self.counterparty_secrets.clone();
        secrets.provide(revocation.commitment_number, revocation.secret).map_err(|_| {
            revocation_mismatch(format!(
                "secret for {} inconsistent with earlier secrets",
                revocation.commitment_number
            ))
        })?;
        Ok(secrets)
    }

    fn install(&mut self, pending: PendingUpdate, holder_commitment_sig: Signature) {
        self.commitment_number = pending.commitment_number;
        self.to_us_sat = pending.scratch.to_us_sat;
        self.to_them_sat = pending.scratch.to_them_sat;
        self.htlcs = pending.scratch.htlcs;
        self.htlcs.prune_resolved(self.commitment_number);
        self.holder_commitment = pending.holder_commitment;
        self.holder_commitment_sig = Some(holder_commitment_sig);
        self.counterparty_commitment = pending.counterparty_commitment;
    }

    /// Handle a counterparty proposal.
    ///
    /// Applies the mirrored updates, verifies the proposer's signature on
    /// our new commitment, makes it current, and returns our signature on
    /// the proposer's new commitment along with the revocation of our
    /// previous commitment.
    #[instrument(skip(self))]
    pub fn receive_proposal(
        &mut self,
        proposal: &CommitmentProposal,
    ) -> Result<CommitAcceptance, ChannelError> {
        let result = self.do_receive_proposal(proposal);
        self.escalate(result)
    }

    fn do_receive_proposal(
        &mut self,
        proposal: &CommitmentProposal,
    ) -> Result<CommitAcceptance, ChannelError> {
        let mut debug_on_return = scoped_debug_return!(proposal);
        self.check_state(&[ChannelState::Open])?;
        if let Some(num) = self.awaiting_revocation {
            protocol_err!("proposal before revocation of {}", num);
        }
        let commitment_number = self.commitment_number + 1;
        if proposal.commitment_number != commitment_number {
            return Err(sequence_mismatch(commitment_number, proposal.commitment_number));
        }
        if proposal.updates.is_empty() {
            protocol_err!("empty proposal");
        }
        let mut scratch = self.scratch();
        for update in &proposal.updates {
            update.check_origin().map_err(protocol_violation)?;
            self.apply_update(&mut scratch, &update.mirrored(), false, commitment_number)?;
        }
        let holder_commitment = Self::build_holder_commitment(
            &self.setup,
            &self.revocation,
            commitment_number,
            &scratch,
        )?;
        self.verify_funding_spend(&holder_commitment.transaction, &proposal.signature)?;
        let counterparty_commitment = Self::build_counterparty_commitment(
            &self.setup,
            commitment_number,
            &self.counterparty_next_revocation_hash,
            &scratch,
        )?;
        let signature = self.sign_funding_spend(&counterparty_commitment.transaction)?;
        let next_revocation_hash = self.revocation.commitment_at(commitment_number + 1)?;

        let previous = self.commitment_number;
        let revocation = self.revocation.disclose(previous, commitment_number)?;
        self.install(
            PendingUpdate {
                commitment_number,
                scratch,
                holder_commitment,
                counterparty_commitment,
            },
            proposal.signature,
        );
        self.awaiting_revocation = Some(previous);
        info!(
            "channel {} accepted {} to_us {} to_them {}",
            self.id, self.commitment_number, self.to_us_sat, self.to_them_sat
        );
        trace_channel_state!(self);
        *debug_on_return = false;
        Ok(CommitAcceptance { commitment_number, signature, revocation, next_revocation_hash })
    }

    /// Handle the proposer's revocation, completing the cycle started by
    /// [`Channel::receive_proposal`]
    #[instrument(skip(self))]
    pub fn receive_revocation(&mut self, msg: &RevocationMessage) -> Result<(), ChannelError> {
        let result = self.do_receive_revocation(msg);
        self.escalate(result)
    }

    fn do_receive_revocation(&mut self, msg: &RevocationMessage) -> Result<(), ChannelError> {
        self.check_state(&[ChannelState::Open])?;
        let expected = match self.awaiting_revocation {
            Some(num) => num,
            None => protocol_err!("unexpected revocation of {}", msg.revocation.commitment_number),
        };
        if msg.revocation.commitment_number != expected {
            return Err(sequence_mismatch(expected, msg.revocation.commitment_number));
        }
        let secrets = self.check_revocation(&msg.revocation)?;
        self.counterparty_secrets = secrets;
        self.counterparty_revocation_hash = self.counterparty_next_revocation_hash;
        self.counterparty_next_revocation_hash = msg.next_revocation_hash;
        self.awaiting_revocation = None;
        debug!("channel {} counterparty revoked {}", self.id, expected);
        Ok(())
    }

    /// Drop the pending proposal, staying on the current commitment
    pub fn abandon_pending(&mut self) {
        if self.pending.take().is_some() {
            debug!("channel {} abandoned pending update", self.id);
        }
        if self.state == ChannelState::Updating {
            self.state = ChannelState::Open;
        }
    }

    /// Channel shutdown: drop the pending proposal and start closing.
    /// The last mutually signed commitment stays valid.
    pub fn cancel(&mut self) {
        self.pending = None;
        if !self.state.is_terminal() && self.state != ChannelState::Closing {
            info!("channel {} cancelled in {:?}", self.id, self.state);
            self.state = ChannelState::Closing;
        }
    }

    /// Our latest commitment with a complete witness, for unilateral close
    #[instrument(skip(self))]
    pub fn force_close(&mut self) -> Result<Transaction, ChannelError> {
        self.check_state(&[
            ChannelState::Pending,
            ChannelState::Open,
            ChannelState::Updating,
            ChannelState::Closing,
        ])?;
        let counterparty_sig = match self.holder_commitment_sig {
            Some(sig) => sig,
            None => invalid_state_err!("holder commitment not signed by the counterparty"),
        };
        let holder_sig = self.sign_funding_spend(&self.holder_commitment.transaction)?;
        let mut tx = self.holder_commitment.transaction.clone();
        tx.input[0].witness = funding_cooperative_witness(
            &self.setup.funding_variant,
            &self.funding_redeemscript,
            &self.setup.holder_funding_pubkey,
            &holder_sig,
            &self.setup.counterparty_funding_pubkey,
            &counterparty_sig,
        );
        self.pending = None;
        self.state = ChannelState::Closing;
        warn!(
            "channel {} force closing with commitment {} {}",
            self.id,
            self.commitment_number,
            tx.compute_txid()
        );
        Ok(tx)
    }

    // Closing output values, after the initiator pays `fee_sat`
    fn closing_values(&self, fee_sat: u64) -> Result<(u64, u64), ChannelError> {
        Ok((
            after_fee(self.to_us_sat, self.setup.holder_fee_sat(fee_sat))?,
            after_fee(self.to_them_sat, self.setup.counterparty_fee_sat(fee_sat))?,
        ))
    }

    fn check_closable(&self) -> Result<(), ChannelError> {
        self.check_state(&[ChannelState::Open])?;
        if let Some(num) = self.awaiting_revocation {
            invalid_state_err!("awaiting counterparty revocation of {}", num);
        }
        if self.htlcs.pending_count() > 0 {
            update_rejected_err!("{} pending htlcs", self.htlcs.pending_count());
        }
        Ok(())
    }

    /// Propose a cooperative close paying our balance to `holder_script`
    /// and theirs to `counterparty_script`.  The initiator pays `fee_sat`.
    #[instrument(skip(self))]
    pub fn propose_closing(
        &mut self,
        holder_script: ScriptBuf,
        counterparty_script: ScriptBuf,
        fee_sat: u64,
    ) -> Result<ClosingProposal, ChannelError> {
        self.check_closable()?;
        self.validator.validate_closing_fee(&self.setup, fee_sat)?;
        let (holder_value, counterparty_value) = self.closing_values(fee_sat)?;
        let transaction = build_closing_tx(
            &self.setup.funding_outpoint,
            holder_value,
            counterparty_value,
            &holder_script,
            &counterparty_script,
        )?;
        let signature = self.sign_funding_spend(&transaction)?;
        info!(
            "channel {} proposing close to {} fee {}",
            self.id,
            script_debug(&holder_script, self.setup.network),
            fee_sat
        );
        self.closing = Some(ClosingState {
            fee_sat,
            holder_script: holder_script.clone(),
            counterparty_script: counterparty_script.clone(),
            transaction,
            holder_sig: signature,
            counterparty_sig: None,
        });
        self.state = ChannelState::Closing;
        Ok(ClosingProposal {
            fee_sat,
            proposer_script: holder_script,
            acceptor_script: counterparty_script,
            signature,
        })
    }

    /// Accept a counterparty closing proposal.
    ///
    /// Afterwards [`Channel::closing_tx`] returns the signed closing transaction.
    #[instrument(skip(self))]
    pub fn accept_closing(
        &mut self,
        proposal: &ClosingProposal,
    ) -> Result<ClosingAcceptance, ChannelError> {
        self.check_closable()?;
        self.validator.validate_closing_fee(&self.setup, proposal.fee_sat)?;
        let (holder_value, counterparty_value) = self.closing_values(proposal.fee_sat)?;
        let transaction = build_closing_tx(
            &self.setup.funding_outpoint,
            holder_value,
            counterparty_value,
            &proposal.acceptor_script,
            &proposal.proposer_script,
        )?;
        self.verify_funding_spend(&transaction, &proposal.signature)?;
        let signature = self.sign_funding_spend(&transaction)?;
        info!(
            "channel {} accepting close to {} fee {}",
            self.id,
            script_debug(&proposal.acceptor_script, self.setup.network),
            proposal.fee_sat
        );
        self.closing = Some(ClosingState {
            fee_sat: proposal.fee_sat,
            holder_script: proposal.acceptor_script.clone(),
            counterparty_script: proposal.proposer_script.clone(),
            transaction,
            holder_sig: signature,
            counterparty_sig: Some(proposal.signature),
        });
        self.state = ChannelState::Closing;
        Ok(ClosingAcceptance { signature })
    }

    /// Complete our closing proposal with the counterparty's signature,
    /// returning the signed closing transaction
    #[instrument(skip(self))]
    pub fn finalize_closing(
        &mut self,
        acceptance: &ClosingAcceptance,
    ) -> Result<Transaction, ChannelError> {
        self.check_state(&[ChannelState::Closing])?;
        let transaction = match &self.closing {
            Some(closing) if closing.counterparty_sig.is_none() => closing.transaction.clone(),
            Some(_) => invalid_state_err!("closing already signed"),
            None => invalid_state_err!("no closing proposal"),
        };
        self.verify_funding_spend(&transaction, &acceptance.signature)?;
        if let Some(closing) = self.closing.as_mut() {
            closing.counterparty_sig = Some(acceptance.signature);
        }
        self.closing_tx().ok_or_else(|| invalid_state_error("closing not signed"))
    }

    /// Check whether `tx` is a revoked counterparty commitment.
    ///
    /// If it is, the channel becomes [`ChannelState::Breached`] and the
    /// returned remedy holds the revocation secret needed to sweep the
    /// breacher's to-us output.  Calling again with the same transaction
    /// returns the same remedy.
    #[instrument(skip(self, tx), fields(txid = %tx.compute_txid()))]
    pub fn verify_breach(
        &mut self,
        tx: &Transaction,
    ) -> Result<Option<BreachRemedy>, ChannelError> {
        let txid = tx.compute_txid();
        if let Some(remedy) = &self.breach {
            return Ok(if remedy.txid == txid { Some(remedy.clone()) } else { None });
        }
        if !spends(tx, &self.setup.funding_outpoint) {
            return Ok(None);
        }
        let commitment_number = match decode_commitment_number(tx) {
            Some(num) if num < self.commitment_number => num,
            _ => return Ok(None),
        };
        let secret = match self.counterparty_secrets.get(commitment_number) {
            Some(secret) => secret,
            None => return Ok(None),
        };
        let witness_script = to_us_redeemscript(
            &self.setup.counterparty_commit_pubkey,
            &self.setup.holder_commit_pubkey,
            &sha256(&secret),
            self.setup.holder_selected_contest_delay,
        )?;
        let script_pubkey = witness_script.to_p2wsh();
        let to_us_output = tx
            .output
            .iter()
            .enumerate()
            .find(|(_, out)| out.script_pubkey == script_pubkey)
            .map(|(vout, out)| (OutPoint { txid, vout: vout as u32 }, out.value.to_sat()));
        let remedy = BreachRemedy {
            commitment_number,
            revocation: RevocationSecret { commitment_number, secret },
            txid,
            to_us_output,
            witness_script,
        };
        error!(
            "channel {} breach: revoked commitment {} broadcast in {}, current is {}",
            self.id, commitment_number, txid, self.commitment_number
        );
        self.pending = None;
        self.state = ChannelState::Breached;
        self.breach = Some(remedy.clone());
        Ok(Some(remedy))
    }

    /// Classify a confirmed transaction spending the funding output and
    /// move to the matching state
    #[instrument(skip(self, tx), fields(txid = %tx.compute_txid()))]
    pub fn funding_spent(&mut self, tx: &Transaction) -> Result<FundingSpend, ChannelError> {
        if !spends(tx, &self.setup.funding_outpoint) {
            construction_err!("{} does not spend the funding output", tx.compute_txid());
        }
        let txid = tx.compute_txid();
        if let Some(remedy) = self.verify_breach(tx)? {
            return Ok(FundingSpend::Breach(remedy));
        }
        if self.state.is_terminal() {
            debug!("channel {} already {:?}, ignoring {}", self.id, self.state, txid);
        }
        let is_closing_tx =
            self.closing.as_ref().map_or(false, |c| c.transaction.compute_txid() == txid);
        let spend = if is_closing_tx {
            FundingSpend::CooperativeClose
        } else if txid == self.holder_commitment.txid() {
            FundingSpend::HolderCommitment(self.commitment_number)
        } else if txid == self.counterparty_commitment.txid() {
            FundingSpend::CounterpartyCommitment(self.commitment_number)
        } else if let Some(num) = decode_commitment_number(tx).filter(|num| {
            // the counterparty may still broadcast the commitment we wait
            // for it to revoke
            Some(*num) == self.awaiting_revocation
        }) {
            FundingSpend::CounterpartyCommitment(num)
        } else if self.is_funding_refund(tx) {
            FundingSpend::FundingRefund
        } else {
            FundingSpend::Unknown(txid)
        };
        match &spend {
            FundingSpend::CooperativeClose | FundingSpend::FundingRefund => {
                if self.state != ChannelState::Closed {
                    info!("channel {} closed by {:?} {}", self.id, spend, txid);
                    self.state = ChannelState::Closed;
                }
            }
            FundingSpend::Unknown(_) => {
                warn!("channel {} funding spent by unknown {}", self.id, txid);
                self.cancel();
            }
            _ => {
                info!("channel {} unilateral close by {:?}", self.id, spend);
                self.cancel();
            }
        }
        Ok(spend)
    }

    fn is_funding_refund(&self, tx: &Transaction) -> bool {
        match self.setup.funding_variant {
            FundingVariant::SingleFunderTimeout { timeout_height } =>
                tx.lock_time.to_consensus_u32() >= timeout_height
                    && tx.input.len() == 1
                    && tx.input[0].witness.len() == 2,
            FundingVariant::DualFunderMultisig => false,
        }
    }

    /// Sweep the to-us output of a revoked commitment through its
    /// revocation path
    #[instrument(skip(self))]
    pub fn build_justice_tx(
        &self,
        remedy: &BreachRemedy,
        destination: ScriptBuf,
        fee_sat: u64,
    ) -> Result<Transaction, ChannelError> {
        let (outpoint, value_sat) = match remedy.to_us_output {
            Some(output) => output,
            None => construction_err!("commitment {} has no to-us output", remedy.commitment_number),
        };
        let mut tx = build_sweep_tx(
            outpoint,
            value_sat,
            destination,
            fee_sat,
            Sequence::MAX,
            LockTime::ZERO,
        )?;
        let sig = self.signer.sign(
            &remedy.witness_script,
            &tx,
            0,
            value_sat,
            &self.setup.holder_commit_pubkey,
        )?;
        tx.input[0].witness =
            to_us_revocation_witness(&remedy.witness_script, &sig, &remedy.revocation.secret);
        Ok(tx)
    }

    /// Sweep the to-us output of our current commitment after its relative delay
    #[instrument(skip(self))]
    pub fn build_delayed_sweep_tx(
        &self,
        destination: ScriptBuf,
        fee_sat: u64,
    ) -> Result<Transaction, ChannelError> {
        let (outpoint, value_sat) = match self.holder_commitment.to_us_output() {
            Some(output) => output,
            None => construction_err!("commitment {} has no to-us output", self.commitment_number),
        };
        let mut tx = build_sweep_tx(
            outpoint,
            value_sat,
            destination,
            fee_sat,
            Sequence::from_height(self.setup.counterparty_selected_contest_delay),
            LockTime::ZERO,
        )?;
        let witness_script = &self.holder_commitment.to_us_redeemscript;
        let sig =
            self.signer.sign(witness_script, &tx, 0, value_sat, &self.setup.holder_commit_pubkey)?;
        tx.input[0].witness = to_us_delayed_witness(witness_script, &sig);
        Ok(tx)
    }

    /// Sweep our output of the counterparty's current commitment, after
    /// the counterparty broadcast it
    #[instrument(skip(self))]
    pub fn build_counterparty_output_sweep_tx(
        &self,
        destination: ScriptBuf,
        fee_sat: u64,
    ) -> Result<Transaction, ChannelError> {
        let (outpoint, value_sat) = match self.counterparty_commitment.to_them_output() {
            Some(output) => output,
            None => construction_err!(
                "counterparty commitment {} has no output for us",
                self.commitment_number
            ),
        };
        let mut tx = build_sweep_tx(
            outpoint,
            value_sat,
            destination,
            fee_sat,
            Sequence::MAX,
            LockTime::ZERO,
        )?;
        let witness_script = &self.counterparty_commitment.to_them_redeemscript;
        let sig =
            self.signer.sign(witness_script, &tx, 0, value_sat, &self.setup.holder_commit_pubkey)?;
        tx.input[0].witness =
            to_them_witness(witness_script, &sig, &self.setup.holder_commit_pubkey);
        Ok(tx)
    }

    /// Reclaim a single funder channel's funding output through the
    /// timeout path.  Only the funder can do this.
    #[instrument(skip(self))]
    pub fn build_funding_refund_tx(
        &self,
        destination: ScriptBuf,
        fee_sat: u64,
    ) -> Result<Transaction, ChannelError> {
        let timeout_height = match self.setup.funding_variant {
            FundingVariant::SingleFunderTimeout { timeout_height } => timeout_height,
            FundingVariant::DualFunderMultisig =>
                construction_err!("dual funder channel has no refund path"),
        };
        if !self.setup.is_outbound {
            invalid_state_err!("only the funder can reclaim the funding");
        }
        let lock_time = LockTime::from_height(timeout_height)
            .map_err(|e| construction_error(format!("bad timeout: {}", e)))?;
        let mut tx = build_sweep_tx(
            self.setup.funding_outpoint,
            self.setup.channel_value_sat,
            destination,
            fee_sat,
            Sequence::ENABLE_LOCKTIME_NO_RBF,
            lock_time,
        )?;
        let sig = self.sign_funding_spend(&tx)?;
        tx.input[0].witness = funding_timeout_witness(&self.funding_redeemscript, &sig);
        Ok(tx)
    }
}

fn after_fee(value_sat: u64, fee_sat: u64) -> Result<u64, ChannelError> {
    value_sat
        .checked_sub(fee_sat)
        .ok_or_else(|| construction_error(format!("value {} cannot pay fee {}", value_sat, fee_sat)))
}
