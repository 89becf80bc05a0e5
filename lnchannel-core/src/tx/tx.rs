use crate::prelude::*;
use core::fmt;

use bitcoin::absolute::LockTime;
use bitcoin::secp256k1::PublicKey;
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};
use serde_derive::{Deserialize, Serialize};
use serde_with::{hex::Hex, serde_as, Bytes, IfIsHumanReadable};

use crate::policy::error::ChannelError;
use crate::tx::script::{
    funding_redeemscript, to_them_redeemscript, to_us_redeemscript, FundingVariant,
};
use crate::util::debug_utils::DebugBytes;
use crate::util::INITIAL_COMMITMENT_NUMBER;

/// Outputs below this value are omitted from the transactions we build
pub const DUST_LIMIT_SAT: u64 = 546;

/// Weight of the version, locktime, counts and segwit marker
const TX_BASE_WEIGHT: u64 = 4 * 10 + 2;
/// Wallet inputs are assumed to be P2WPKH
const WALLET_INPUT_WEIGHT: u64 = 4 * 41 + 108;

const COMMITMENT_LOCKTIME_TAG: u32 = 0x2000_0000;
const COMMITMENT_SEQUENCE_TAG: u32 = 0x8000_0000;
const LOW_24_BITS: u64 = 0x00ff_ffff;

fn output_weight(script_pubkey: &ScriptBuf) -> u64 {
    4 * (8 + 1 + script_pubkey.len() as u64)
}

/// The locktime and input sequence carrying a commitment number.
///
/// The lower 24 bits go in the locktime, tagged to be a timestamp in the past.
/// The upper 24 bits go in the sequence, tagged to disable relative locktime.
pub fn encode_commitment_number(
    commitment_number: u64,
) -> Result<(LockTime, Sequence), ChannelError> {
    if commitment_number > INITIAL_COMMITMENT_NUMBER {
        construction_err!("commitment number {} too large", commitment_number);
    }
    let low = (commitment_number & LOW_24_BITS) as u32;
    let high = ((commitment_number >> 24) & LOW_24_BITS) as u32;
    Ok((
        LockTime::from_consensus(COMMITMENT_LOCKTIME_TAG | low),
        Sequence(COMMITMENT_SEQUENCE_TAG | high),
    ))
}

/// Recover the commitment number from a transaction that looks like a commitment
pub fn decode_commitment_number(tx: &Transaction) -> Option<u64> {
    if tx.input.len() != 1 {
        return None;
    }
    let lock = tx.lock_time.to_consensus_u32();
    let seq = tx.input[0].sequence.0;
    if lock & 0xff00_0000 != COMMITMENT_LOCKTIME_TAG {
        return None;
    }
    if seq & 0xff00_0000 != COMMITMENT_SEQUENCE_TAG {
        return None;
    }
    let low = (lock as u64) & LOW_24_BITS;
    let high = (seq as u64) & LOW_24_BITS;
    Some((high << 24) | low)
}

/// The inputs to one party's commitment transaction.
///
/// Both parties hold the same `CommitmentInfo` for each commitment and
/// therefore build byte-identical transactions.
#[serde_as]
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitmentInfo {
    /// Commitment number, starting at zero
    pub commitment_number: u64,
    /// The party that can broadcast this commitment
    pub owner_key: PublicKey,
    /// The other party
    pub counterparty_key: PublicKey,
    /// Hash of the owner's revocation secret for this commitment
    #[serde_as(as = "IfIsHumanReadable<Hex, Bytes>")]
    pub revocation_hash: [u8; 32],
    /// Relative delay on the owner's output
    pub to_self_delay: u16,
    /// Value paid to the owner, after fees
    pub to_owner_value_sat: u64,
    /// Value paid to the counterparty, after fees
    pub to_counterparty_value_sat: u64,
}

// Implement manually so we can have hex encoded revocation_hash.
impl fmt::Debug for CommitmentInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommitmentInfo")
            .field("commitment_number", &self.commitment_number)
            .field("owner_key", &self.owner_key)
            .field("counterparty_key", &self.counterparty_key)
            .field("revocation_hash", &DebugBytes(&self.revocation_hash))
            .field("to_self_delay", &self.to_self_delay)
            .field("to_owner_value_sat", &self.to_owner_value_sat)
            .field("to_counterparty_value_sat", &self.to_counterparty_value_sat)
            .finish()
    }
}

/// A built commitment transaction with its output scripts
#[derive(Clone, Debug, PartialEq)]
pub struct CommitmentTx {
    /// What was built
    pub info: CommitmentInfo,
    /// The unsigned transaction
    pub transaction: Transaction,
    /// Redeem script of the owner's output
    pub to_us_redeemscript: ScriptBuf,
    /// Redeem script of the counterparty's output
    pub to_them_redeemscript: ScriptBuf,
    /// Output index of the owner's output, if not dust
    pub to_us_vout: Option<u32>,
    /// Output index of the counterparty's output, if not dust
    pub to_them_vout: Option<u32>,
}

impl CommitmentTx {
    /// The transaction id
    pub fn txid(&self) -> Txid {
        self.transaction.compute_txid()
    }

    /// The owner's output and its value, if present
    pub fn to_us_output(&self) -> Option<(OutPoint, u64)> {
        self.to_us_vout.map(|vout| {
            let value = self.transaction.output[vout as usize].value.to_sat();
            (OutPoint { txid: self.txid(), vout }, value)
        })
    }

    /// The counterparty's output and its value, if present
    pub fn to_them_output(&self) -> Option<(OutPoint, u64)> {
        self.to_them_vout.map(|vout| {
            let value = self.transaction.output[vout as usize].value.to_sat();
            (OutPoint { txid: self.txid(), vout }, value)
        })
    }
}

/// Build a commitment transaction spending the funding output.
///
/// Outputs are always ordered to-us then to-them. An output below
/// [`DUST_LIMIT_SAT`] is omitted and its value added to the other output.
pub fn build_commitment_tx(
    funding_outpoint: &OutPoint,
    info: &CommitmentInfo,
) -> Result<CommitmentTx, ChannelError> {
    let to_us_redeemscript = to_us_redeemscript(
        &info.owner_key,
        &info.counterparty_key,
        &info.revocation_hash,
        info.to_self_delay,
    )?;
    let to_them_redeemscript = to_them_redeemscript(&info.counterparty_key);

    let mut to_us = info.to_owner_value_sat;
    let mut to_them = info.to_counterparty_value_sat;
    let us_is_dust = to_us < DUST_LIMIT_SAT;
    let them_is_dust = to_them < DUST_LIMIT_SAT;
    if us_is_dust && them_is_dust {
        construction_err!("both outputs are dust: {} {}", to_us, to_them);
    }
    if us_is_dust {
        to_them += to_us;
        to_us = 0;
    }
    if them_is_dust {
        to_us += to_them;
        to_them = 0;
    }

    let mut output = Vec::with_capacity(2);
    let mut to_us_vout = None;
    let mut to_them_vout = None;
    if to_us > 0 {
        to_us_vout = Some(output.len() as u32);
        output.push(TxOut {
            value: Amount::from_sat(to_us),
            script_pubkey: to_us_redeemscript.to_p2wsh(),
        });
    }
    if to_them > 0 {
        to_them_vout = Some(output.len() as u32);
        output.push(TxOut {
            value: Amount::from_sat(to_them),
            script_pubkey: to_them_redeemscript.to_p2wsh(),
        });
    }

    let (lock_time, sequence) = encode_commitment_number(info.commitment_number)?;
    let transaction = Transaction {
        version: Version::TWO,
        lock_time,
        input: vec![TxIn {
            previous_output: *funding_outpoint,
            script_sig: ScriptBuf::new(),
            sequence,
            witness: Witness::new(),
        }],
        output,
    };
    Ok(CommitmentTx {
        info: info.clone(),
        transaction,
        to_us_redeemscript,
        to_them_redeemscript,
        to_us_vout,
        to_them_vout,
    })
}

/// A wallet input contributed to the funding transaction
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingInput {
    /// The wallet output being spent
    pub outpoint: OutPoint,
    /// Its value
    pub value_sat: u64,
}

/// The funding transaction and its output
#[derive(Clone, Debug, PartialEq)]
pub struct FundingTx {
    /// The unsigned transaction, inputs are signed by the wallets
    pub transaction: Transaction,
    /// Redeem script of the funding output
    pub redeemscript: ScriptBuf,
    /// The funding output
    pub outpoint: OutPoint,
}

/// Estimated fee of a funding transaction
pub fn estimate_funding_fee(num_inputs: usize, change: &[TxOut], feerate_per_kw: u32) -> u64 {
    let funding_spk_len = 34u64;
    let weight = TX_BASE_WEIGHT
        + WALLET_INPUT_WEIGHT * num_inputs as u64
        + 4 * (8 + 1 + funding_spk_len)
        + change.iter().map(|o| output_weight(&o.script_pubkey)).sum::<u64>();
    weight * feerate_per_kw as u64 / 1000
}

/// Build the funding transaction.
///
/// Inputs are sorted by outpoint. The funding output is first, followed by
/// the change outputs sorted by value and script. UTXO selection is left
/// to the wallets providing the inputs.
pub fn build_funding_tx(
    our_inputs: &[FundingInput],
    their_inputs: &[FundingInput],
    variant: &FundingVariant,
    funder_key: &PublicKey,
    fundee_key: &PublicKey,
    channel_value_sat: u64,
    feerate_per_kw: u32,
    mut change: Vec<TxOut>,
) -> Result<FundingTx, ChannelError> {
    if let FundingVariant::SingleFunderTimeout { .. } = variant {
        if !their_inputs.is_empty() {
            construction_err!("single funder channel with inputs from both parties");
        }
    }
    let mut inputs: Vec<FundingInput> = our_inputs.iter().chain(their_inputs).cloned().collect();
    if inputs.is_empty() {
        construction_err!("no inputs");
    }
    inputs.sort_by_key(|i| i.outpoint);
    if inputs.windows(2).any(|w| w[0].outpoint == w[1].outpoint) {
        construction_err!("duplicate input");
    }
    if channel_value_sat < DUST_LIMIT_SAT {
        construction_err!("channel value {} is dust", channel_value_sat);
    }
    if let Some(o) = change.iter().find(|o| o.value.to_sat() < DUST_LIMIT_SAT) {
        construction_err!("change output {} is dust", o.value);
    }

    let fee = estimate_funding_fee(inputs.len(), &change, feerate_per_kw);
    let total_in = inputs.iter().try_fold(0u64, |acc, i| acc.checked_add(i.value_sat));
    let total_change: u64 = change.iter().map(|o| o.value.to_sat()).sum();
    let needed = channel_value_sat + total_change + fee;
    match total_in {
        Some(total) if total >= needed => {}
        Some(total) => construction_err!("inputs {} less than needed {}", total, needed),
        None => construction_err!("input value overflow"),
    }

    let redeemscript = funding_redeemscript(variant, funder_key, fundee_key)?;
    change.sort_by(|a, b| {
        (a.value, a.script_pubkey.as_bytes()).cmp(&(b.value, b.script_pubkey.as_bytes()))
    });
    let mut output = vec![TxOut {
        value: Amount::from_sat(channel_value_sat),
        script_pubkey: redeemscript.to_p2wsh(),
    }];
    output.extend(change);

    let transaction = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: inputs
            .iter()
            .map(|i| TxIn {
                previous_output: i.outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_LOCKTIME_NO_RBF,
                witness: Witness::new(),
            })
            .collect(),
        output,
    };
    let outpoint = OutPoint { txid: transaction.compute_txid(), vout: 0 };
    Ok(FundingTx { transaction, redeemscript, outpoint })
}

/// Build a cooperative closing transaction.
///
/// Dust outputs are omitted. Outputs are sorted by value and script so both
/// parties produce the same transaction.
pub fn build_closing_tx(
    funding_outpoint: &OutPoint,
    holder_value_sat: u64,
    counterparty_value_sat: u64,
    holder_script: &ScriptBuf,
    counterparty_script: &ScriptBuf,
) -> Result<Transaction, ChannelError> {
    let mut output: Vec<TxOut> = [
        (holder_value_sat, holder_script),
        (counterparty_value_sat, counterparty_script),
    ]
    .iter()
    .filter(|(value, _)| *value >= DUST_LIMIT_SAT)
    .map(|(value, script)| TxOut {
        value: Amount::from_sat(*value),
        script_pubkey: (*script).clone(),
    })
    .collect();
    if output.is_empty() {
        construction_err!("both closing outputs are dust");
    }
    output.sort_by(|a, b| {
        (a.value, a.script_pubkey.as_bytes()).cmp(&(b.value, b.script_pubkey.as_bytes()))
    });
    Ok(Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: *funding_outpoint,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output,
    })
}

/// Build a single-input single-output sweep
pub fn build_sweep_tx(
    input: OutPoint,
    input_value_sat: u64,
    destination: ScriptBuf,
    fee_sat: u64,
    sequence: Sequence,
    lock_time: LockTime,
) -> Result<Transaction, ChannelError> {
    let value = match input_value_sat.checked_sub(fee_sat) {
        Some(v) if v >= DUST_LIMIT_SAT => v,
        _ => construction_err!("sweep of {} with fee {} is dust", input_value_sat, fee_sat),
    };
    Ok(Transaction {
        version: Version::TWO,
        lock_time,
        input: vec![TxIn {
            previous_output: input,
            script_sig: ScriptBuf::new(),
            sequence,
            witness: Witness::new(),
        }],
        output: vec![TxOut { value: Amount::from_sat(value), script_pubkey: destination }],
    })
}

/// Whether a transaction spends the outpoint
pub fn spends(tx: &Transaction, outpoint: &OutPoint) -> bool {
    tx.input.iter().any(|i| i.previous_output == *outpoint)
}
