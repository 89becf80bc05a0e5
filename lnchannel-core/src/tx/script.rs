use bitcoin::blockdata::opcodes::all::{
    OP_CHECKSIG, OP_CHECKSIGVERIFY, OP_CLTV, OP_CSV, OP_DEPTH, OP_DROP, OP_ELSE, OP_ENDIF,
    OP_EQUAL, OP_IF, OP_PUSHNUM_2, OP_SHA256,
};
use bitcoin::blockdata::opcodes::{self, Class, ClassifyContext};
use bitcoin::blockdata::script::{read_scriptint, Builder, Instruction, Instructions};
use bitcoin::blockdata::locktime::absolute::LOCK_TIME_THRESHOLD;
use bitcoin::secp256k1::{ecdsa::Signature, PublicKey};
use bitcoin::{Script, ScriptBuf, Witness};
use lightning::ln::chan_utils::make_funding_redeemscript;
use serde_derive::{Deserialize, Serialize};

use crate::policy::error::{construction_error, ChannelError};
use crate::prelude::*;
use crate::util::crypto_utils::signature_to_bitcoin_vec;

/// Largest witness script we produce, the standardness limit for P2WSH
pub const MAX_SCRIPT_SIZE: usize = 3600;

/// The shape of the funding output, selected at channel open
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FundingVariant {
    /// One party funds. The output is spendable by both signatures at any
    /// time, or by the funder alone once `timeout_height` is reached.
    SingleFunderTimeout {
        /// Absolute block height of the funder's refund path
        timeout_height: u32,
    },
    /// Both parties may fund. The output is a plain sorted 2-of-2 multisig.
    DualFunderMultisig,
}

fn check_size(script: ScriptBuf) -> Result<ScriptBuf, ChannelError> {
    if script.len() > MAX_SCRIPT_SIZE {
        return Err(construction_error(format!(
            "script size {} exceeds {}",
            script.len(),
            MAX_SCRIPT_SIZE
        )));
    }
    Ok(script)
}

/// Keys in the order their signatures are checked by the funding script
pub fn sorted_keys<'a>(a: &'a PublicKey, b: &'a PublicKey) -> (&'a PublicKey, &'a PublicKey) {
    if a.serialize()[..] < b.serialize()[..] {
        (a, b)
    } else {
        (b, a)
    }
}

/// Funding redeem script.
///
/// For [`FundingVariant::DualFunderMultisig`] this is the standard sorted
/// 2-of-2 `OP_CHECKMULTISIG`. For [`FundingVariant::SingleFunderTimeout`]:
///
/// ```text
/// OP_DEPTH OP_2 OP_EQUAL
/// OP_IF
///     <key_a> OP_CHECKSIGVERIFY <key_b> OP_CHECKSIG
/// OP_ELSE
///     <timeout_height> OP_CHECKLOCKTIMEVERIFY OP_DROP <funder_key> OP_CHECKSIG
/// OP_ENDIF
/// ```
///
/// where `key_a` sorts before `key_b`.
pub fn funding_redeemscript(
    variant: &FundingVariant,
    funder_key: &PublicKey,
    fundee_key: &PublicKey,
) -> Result<ScriptBuf, ChannelError> {
    if funder_key == fundee_key {
        construction_err!("funding keys are identical");
    }
    match variant {
        FundingVariant::DualFunderMultisig =>
            check_size(make_funding_redeemscript(funder_key, fundee_key)),
        FundingVariant::SingleFunderTimeout { timeout_height } => {
            if *timeout_height == 0 || *timeout_height >= LOCK_TIME_THRESHOLD {
                construction_err!("timeout {} is not a block height", timeout_height);
            }
            let (key_a, key_b) = sorted_keys(funder_key, fundee_key);
            let script = Builder::new()
                .push_opcode(OP_DEPTH)
                .push_opcode(OP_PUSHNUM_2)
                .push_opcode(OP_EQUAL)
                .push_opcode(OP_IF)
                .push_slice(key_a.serialize())
                .push_opcode(OP_CHECKSIGVERIFY)
                .push_slice(key_b.serialize())
                .push_opcode(OP_CHECKSIG)
                .push_opcode(OP_ELSE)
                .push_int(*timeout_height as i64)
                .push_opcode(OP_CLTV)
                .push_opcode(OP_DROP)
                .push_slice(funder_key.serialize())
                .push_opcode(OP_CHECKSIG)
                .push_opcode(OP_ENDIF)
                .into_script();
            check_size(script)
        }
    }
}

/// The "to-us" output redeem script of a commitment owned by `owner_key`.
///
/// ```text
/// OP_SHA256 <revocation_hash> OP_EQUAL
/// OP_IF
///     <counterparty_key>
/// OP_ELSE
///     <to_self_delay> OP_CHECKSEQUENCEVERIFY OP_DROP <owner_key>
/// OP_ENDIF
/// OP_CHECKSIG
/// ```
pub fn to_us_redeemscript(
    owner_key: &PublicKey,
    counterparty_key: &PublicKey,
    revocation_hash: &[u8; 32],
    to_self_delay: u16,
) -> Result<ScriptBuf, ChannelError> {
    if owner_key == counterparty_key {
        construction_err!("owner and counterparty keys are identical");
    }
    let script = Builder::new()
        .push_opcode(OP_SHA256)
        .push_slice(revocation_hash)
        .push_opcode(OP_EQUAL)
        .push_opcode(OP_IF)
        .push_slice(counterparty_key.serialize())
        .push_opcode(OP_ELSE)
        .push_int(to_self_delay as i64)
        .push_opcode(OP_CSV)
        .push_opcode(OP_DROP)
        .push_slice(owner_key.serialize())
        .push_opcode(OP_ENDIF)
        .push_opcode(OP_CHECKSIG)
        .into_script();
    check_size(script)
}

/// The "to-them" output redeem script, a plain key-hash lock
pub fn to_them_redeemscript(their_key: &PublicKey) -> ScriptBuf {
    ScriptBuf::new_p2pkh(&bitcoin::PublicKey::new(*their_key).pubkey_hash())
}

/// Witness for the cooperative path of the funding output.
/// Signatures are given per key and placed in the order the script checks them.
pub fn funding_cooperative_witness(
    variant: &FundingVariant,
    redeemscript: &Script,
    key1: &PublicKey,
    sig1: &Signature,
    key2: &PublicKey,
    sig2: &Signature,
) -> Witness {
    let (first_sig, second_sig) =
        if key1.serialize()[..] < key2.serialize()[..] { (sig1, sig2) } else { (sig2, sig1) };
    let first = signature_to_bitcoin_vec(*first_sig);
    let second = signature_to_bitcoin_vec(*second_sig);
    match variant {
        FundingVariant::DualFunderMultisig =>
            Witness::from_slice(&[vec![], first, second, redeemscript.to_bytes()]),
        // OP_CHECKSIGVERIFY consumes the top item first, so the first key's
        // signature goes last
        FundingVariant::SingleFunderTimeout { .. } =>
            Witness::from_slice(&[second, first, redeemscript.to_bytes()]),
    }
}

/// Witness for the funder's refund path of a [`FundingVariant::SingleFunderTimeout`] output
pub fn funding_timeout_witness(redeemscript: &Script, funder_sig: &Signature) -> Witness {
    Witness::from_slice(&[signature_to_bitcoin_vec(*funder_sig), redeemscript.to_bytes()])
}

/// Witness for the counterparty's revocation path of a to-us output
pub fn to_us_revocation_witness(
    redeemscript: &Script,
    sig: &Signature,
    revocation_secret: &[u8; 32],
) -> Witness {
    Witness::from_slice(&[
        signature_to_bitcoin_vec(*sig),
        revocation_secret.to_vec(),
        redeemscript.to_bytes(),
    ])
}

/// Witness for the owner's delayed path of a to-us output
pub fn to_us_delayed_witness(redeemscript: &Script, sig: &Signature) -> Witness {
    Witness::from_slice(&[signature_to_bitcoin_vec(*sig), vec![], redeemscript.to_bytes()])
}

/// Witness for a to-them output
pub fn to_them_witness(redeemscript: &Script, sig: &Signature, their_key: &PublicKey) -> Witness {
    Witness::from_slice(&[
        signature_to_bitcoin_vec(*sig),
        their_key.serialize().to_vec(),
        redeemscript.to_bytes(),
    ])
}

#[inline]
fn expect_next<'a>(iter: &mut Instructions<'a>) -> Result<Instruction<'a>, ChannelError> {
    iter.next()
        .ok_or_else(|| construction_error("unexpected end"))?
        .map_err(|_| construction_error("unparseable opcode"))
}

#[inline]
pub(crate) fn expect_op(iter: &mut Instructions, op: opcodes::Opcode) -> Result<(), ChannelError> {
    let ins = expect_next(iter)?;
    match ins {
        Instruction::Op(o) =>
            if o == op {
                Ok(())
            } else {
                Err(construction_error(format!("expected op {}, saw {}", op, o)))
            },
        _ => Err(construction_error(format!("expected op, saw {:?}", ins))),
    }
}

#[inline]
pub(crate) fn expect_number(iter: &mut Instructions) -> Result<i64, ChannelError> {
    let ins = expect_next(iter)?;
    match ins {
        Instruction::Op(op) => {
            let cls = op.classify(ClassifyContext::Legacy);
            match cls {
                Class::PushNum(i) => Ok(i as i64),
                _ => Err(construction_error(format!("expected PushNum, saw {:?}", cls))),
            }
        }
        Instruction::PushBytes(d) => read_scriptint(d.as_bytes())
            .map_err(|err| construction_error(format!("read_scriptint failed: {:?}", err))),
    }
}

#[inline]
pub(crate) fn expect_data(iter: &mut Instructions) -> Result<Vec<u8>, ChannelError> {
    let ins = expect_next(iter)?;
    match ins {
        Instruction::PushBytes(d) => Ok(d.as_bytes().to_vec()),
        _ => Err(construction_error(format!("expected data, saw {:?}", ins))),
    }
}

#[inline]
pub(crate) fn expect_script_end(iter: &mut Instructions) -> Result<(), ChannelError> {
    match iter.next() {
        None => Ok(()),
        Some(ins) => Err(construction_error(format!("expected script end, saw {:?}", ins))),
    }
}

fn expect_key(iter: &mut Instructions) -> Result<PublicKey, ChannelError> {
    let data = expect_data(iter)?;
    PublicKey::from_slice(&data).map_err(|e| construction_error(format!("bad key: {}", e)))
}

/// The components of a to-us redeem script
#[derive(Clone, Debug, PartialEq)]
pub struct ToUsScriptInfo {
    /// The owner's delayed key
    pub owner_key: PublicKey,
    /// The counterparty's revocation path key
    pub counterparty_key: PublicKey,
    /// SHA256 of the revocation secret
    pub revocation_hash: [u8; 32],
    /// Relative delay of the owner's path
    pub to_self_delay: u16,
}

/// Parse a script produced by [`to_us_redeemscript`]
pub fn parse_to_us_redeemscript(script: &Script) -> Result<ToUsScriptInfo, ChannelError> {
    let iter = &mut script.instructions();
    expect_op(iter, OP_SHA256)?;
    let hash_vec = expect_data(iter)?;
    let revocation_hash: [u8; 32] = hash_vec
        .as_slice()
        .try_into()
        .map_err(|_| construction_error(format!("bad revocation hash len {}", hash_vec.len())))?;
    expect_op(iter, OP_EQUAL)?;
    expect_op(iter, OP_IF)?;
    let counterparty_key = expect_key(iter)?;
    expect_op(iter, OP_ELSE)?;
    let delay = expect_number(iter)?;
    let to_self_delay = u16::try_from(delay)
        .map_err(|_| construction_error(format!("delay {} out of range", delay)))?;
    expect_op(iter, OP_CSV)?;
    expect_op(iter, OP_DROP)?;
    let owner_key = expect_key(iter)?;
    expect_op(iter, OP_ENDIF)?;
    expect_op(iter, OP_CHECKSIG)?;
    expect_script_end(iter)?;
    Ok(ToUsScriptInfo { owner_key, counterparty_key, revocation_hash, to_self_delay })
}
