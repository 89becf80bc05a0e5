use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{self, ecdsa::Signature, All, Message, PublicKey, Secp256k1, SecretKey};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{Amount, Script, Transaction};
use log::*;

use crate::prelude::*;
use crate::util::crypto_utils::public_key_of;
use crate::util::status::{internal_error, invalid_argument, Status};

/// The segwit v0 SIGHASH_ALL message for spending a P2WSH input
pub fn p2wsh_sighash(
    tx: &Transaction,
    input_index: usize,
    witness_script: &Script,
    value_sat: u64,
) -> Result<Message, Status> {
    if input_index >= tx.input.len() {
        return Err(invalid_argument(format!(
            "input index {} out of range {}",
            input_index,
            tx.input.len()
        )));
    }
    let sighash = SighashCache::new(tx)
        .p2wsh_signature_hash(
            input_index,
            witness_script,
            Amount::from_sat(value_sat),
            EcdsaSighashType::All,
        )
        .map_err(|e| internal_error(format!("sighash failed: {}", e)))?;
    Ok(Message::from_digest(sighash.to_byte_array()))
}

/// Signing backend.
///
/// Holds the private keys of the local party. It may be shared by many
/// channels and must be safe to call concurrently.
pub trait Signer: SendSync {
    /// Sign P2WSH input `input_index` of `tx`, which spends `value_sat`
    /// locked by `witness_script`, with the private key of `key`
    fn sign(
        &self,
        witness_script: &Script,
        tx: &Transaction,
        input_index: usize,
        value_sat: u64,
        key: &PublicKey,
    ) -> Result<Signature, Status>;

    /// Verify a signature made by [`Signer::sign`] or by the counterparty
    fn verify(
        &self,
        sig: &Signature,
        witness_script: &Script,
        tx: &Transaction,
        input_index: usize,
        value_sat: u64,
        key: &PublicKey,
    ) -> Result<bool, Status> {
        let message = p2wsh_sighash(tx, input_index, witness_script, value_sat)?;
        Ok(Secp256k1::verification_only().verify_ecdsa(&message, sig, key).is_ok())
    }
}

/// A signer keeping its keys in memory
pub struct LocalSigner {
    secp_ctx: Secp256k1<All>,
    keys: Mutex<Map<PublicKey, SecretKey>>,
}

impl SendSync for LocalSigner {}

impl LocalSigner {
    /// An empty signer
    pub fn new() -> Self {
        LocalSigner { secp_ctx: Secp256k1::new(), keys: Mutex::new(Map::new()) }
    }

    /// Add a private key, returning its public key
    pub fn add_key(&self, key: SecretKey) -> PublicKey {
        let pubkey = public_key_of(&self.secp_ctx, &key);
        self.keys.lock().unwrap().insert(pubkey, key);
        pubkey
    }

    /// Generate a new private key, returning its public key
    pub fn new_key(&self) -> PublicKey {
        let (key, _) = self.secp_ctx.generate_keypair(&mut secp256k1::rand::thread_rng());
        self.add_key(key)
    }

    /// Whether the signer holds the private key of `key`
    pub fn has_key(&self, key: &PublicKey) -> bool {
        self.keys.lock().unwrap().contains_key(key)
    }
}

impl Default for LocalSigner {
    fn default() -> Self {
        Self::new()
    }
}

impl Signer for LocalSigner {
    fn sign(
        &self,
        witness_script: &Script,
        tx: &Transaction,
        input_index: usize,
        value_sat: u64,
        key: &PublicKey,
    ) -> Result<Signature, Status> {
        let secret = *self
            .keys
            .lock()
            .unwrap()
            .get(key)
            .ok_or_else(|| invalid_argument(format!("unknown key {}", key)))?;
        let message = p2wsh_sighash(tx, input_index, witness_script, value_sat)?;
        trace!("sign input {} of {} with {}", input_index, tx.compute_txid(), key);
        Ok(self.secp_ctx.sign_ecdsa(&message, &secret))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tx::script::to_us_redeemscript;
    use crate::util::status::Code;
    use crate::util::test_utils::{make_test_outpoint, make_test_privkey, make_test_pubkey};
    use bitcoin::absolute::LockTime;
    use bitcoin::transaction::Version;
    use bitcoin::{ScriptBuf, Sequence, TxIn, Witness};
    use test_log::test;

    fn make_tx() -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: make_test_outpoint(1),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![],
        }
    }

    #[test]
    fn sign_verify_test() {
        let signer = LocalSigner::new();
        let key = signer.add_key(make_test_privkey(1));
        assert_eq!(key, make_test_pubkey(1));
        let script = to_us_redeemscript(&key, &make_test_pubkey(2), &[3; 32], 144).unwrap();
        let tx = make_tx();
        let sig = signer.sign(&script, &tx, 0, 10_000, &key).unwrap();
        assert!(signer.verify(&sig, &script, &tx, 0, 10_000, &key).unwrap());
        // the value is committed to by the sighash
        assert!(!signer.verify(&sig, &script, &tx, 0, 10_001, &key).unwrap());
        assert!(!signer.verify(&sig, &script, &tx, 0, 10_000, &make_test_pubkey(2)).unwrap());
    }

    #[test]
    fn unknown_key_test() {
        let signer = LocalSigner::new();
        let new_key = signer.new_key();
        assert!(signer.has_key(&new_key));
        let script = ScriptBuf::new();
        let err = signer.sign(&script, &make_tx(), 0, 1, &make_test_pubkey(1)).unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
        let err = signer.sign(&script, &make_tx(), 1, 1, &new_key).unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }
}
