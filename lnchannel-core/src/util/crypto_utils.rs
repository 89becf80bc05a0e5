use crate::prelude::*;
use bitcoin::hashes::sha256::Hash as BitcoinSha256;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{self, ecdsa::Signature, PublicKey, Secp256k1, SecretKey};
use bitcoin::sighash::EcdsaSighashType;

/// SHA256 of the data, as a byte array
pub fn sha256(data: &[u8]) -> [u8; 32] {
    BitcoinSha256::hash(data).to_byte_array()
}

/// Convert a [Signature] to Bitcoin signature bytes, with SIGHASH_ALL
pub fn signature_to_bitcoin_vec(sig: Signature) -> Vec<u8> {
    let mut sigvec = sig.serialize_der().to_vec();
    sigvec.push(EcdsaSighashType::All as u8);
    sigvec
}

/// The public key of a secret key
pub fn public_key_of<C: secp256k1::Signing>(secp_ctx: &Secp256k1<C>, key: &SecretKey) -> PublicKey {
    PublicKey::from_secret_key(secp_ctx, key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_vec_test() {
        let secp_ctx = Secp256k1::new();
        let key = SecretKey::from_slice(&[3u8; 32]).unwrap();
        let msg = secp256k1::Message::from_digest(sha256(b"hello"));
        let sig = secp_ctx.sign_ecdsa(&msg, &key);
        let v = signature_to_bitcoin_vec(sig);
        assert_eq!(*v.last().unwrap(), EcdsaSighashType::All as u8);
        assert_eq!(Signature::from_der(&v[..v.len() - 1]).unwrap(), sig);
    }

    #[test]
    fn sha256_test() {
        assert_eq!(
            hex::encode(sha256(b"")),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
