use bitcoin::secp256k1::ecdsa::Signature;
use serde_derive::{Deserialize, Serialize};
use serde_with::{hex::Hex, serde_as, Bytes, IfIsHumanReadable};

use crate::channel::{BreachRemedy, ChannelSetup, ChannelState, ClosingState};
use crate::htlc::HtlcLedger;
use crate::revocation::{RevocationChain, RevocationStore};
use crate::tx::tx::CommitmentInfo;

/// A persistence layer entry for a channel.
///
/// Commitment transactions are stored as their [`CommitmentInfo`] and
/// rebuilt on restore, since construction is deterministic.
/// An in-flight proposal is not stored; a restored channel falls back to
/// the last mutually signed commitment.
#[allow(missing_docs)]
#[serde_as]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelEntry {
    pub setup: ChannelSetup,
    pub state: ChannelState,
    pub commitment_number: u64,
    pub to_us_sat: u64,
    pub to_them_sat: u64,
    pub htlcs: HtlcLedger,
    pub holder_revocation: RevocationChain,
    pub counterparty_secrets: RevocationStore,
    #[serde_as(as = "IfIsHumanReadable<Hex, Bytes>")]
    pub counterparty_revocation_hash: [u8; 32],
    #[serde_as(as = "IfIsHumanReadable<Hex, Bytes>")]
    pub counterparty_next_revocation_hash: [u8; 32],
    pub holder_commitment: CommitmentInfo,
    pub holder_commitment_sig: Option<Signature>,
    pub counterparty_commitment: CommitmentInfo,
    pub awaiting_revocation: Option<u64>,
    pub closing: Option<ClosingState>,
    pub breach: Option<BreachRemedy>,
}
