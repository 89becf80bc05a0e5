//! By convention, structs ending with `Def` are serde local types
//! describing how to serialize a remote type via `serde(remote)`.

use lightning::types::payment::{PaymentHash, PaymentPreimage};
use serde_derive::{Deserialize, Serialize};
use serde_with::{hex::Hex, serde_as, Bytes, IfIsHumanReadable};

/// A helper for serializing PaymentHash
#[serde_as]
#[derive(Serialize, Deserialize)]
#[serde(remote = "PaymentHash")]
pub struct PaymentHashDef(#[serde_as(as = "IfIsHumanReadable<Hex, Bytes>")] pub [u8; 32]);

/// A helper for serializing PaymentPreimage
#[serde_as]
#[derive(Serialize, Deserialize)]
#[serde(remote = "PaymentPreimage")]
pub struct PaymentPreimageDef(#[serde_as(as = "IfIsHumanReadable<Hex, Bytes>")] pub [u8; 32]);

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Holder {
        #[serde(with = "PaymentHashDef")]
        hash: PaymentHash,
        #[serde(with = "PaymentPreimageDef")]
        preimage: PaymentPreimage,
    }

    #[test]
    fn payment_hash_json_test() {
        let holder = Holder { hash: PaymentHash([0xab; 32]), preimage: PaymentPreimage([1; 32]) };
        let json = serde_json::to_string(&holder).unwrap();
        assert!(json.contains(&"ab".repeat(32)), "{}", json);
        let back: Holder = serde_json::from_str(&json).unwrap();
        assert_eq!(back, holder);
    }
}
