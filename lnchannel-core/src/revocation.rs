use core::fmt::{self, Debug, Formatter};

use bitcoin::hashes::sha256::Hash as Sha256;
use bitcoin::hashes::Hash;
use lightning::ln::chan_utils::build_commitment_secret;
use serde_derive::{Deserialize, Serialize};
use serde_with::{hex::Hex, serde_as, Bytes, IfIsHumanReadable};

use crate::policy::error::{construction_error, premature_disclosure, ChannelError};
use crate::prelude::*;
use crate::util::crypto_utils::sha256;
use crate::util::debug_utils::{DebugBytes, DebugRedacted};
use crate::util::INITIAL_COMMITMENT_NUMBER;

/// A disclosed revocation secret and the commitment it revokes
#[serde_as]
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevocationSecret {
    /// The revoked commitment
    pub commitment_number: u64,
    /// The secret, whose SHA256 is the commitment's revocation hash
    #[serde_as(as = "IfIsHumanReadable<Hex, Bytes>")]
    pub secret: [u8; 32],
}

impl Debug for RevocationSecret {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("RevocationSecret")
            .field("commitment_number", &self.commitment_number)
            .field("secret", &DebugBytes(&self.secret))
            .finish()
    }
}

impl RevocationSecret {
    /// The revocation hash this secret opens
    pub fn hash(&self) -> [u8; 32] {
        sha256(&self.secret)
    }
}

/// Whether `secret` opens `revocation_hash`
pub fn verify_revocation(revocation_hash: &[u8; 32], secret: &[u8; 32]) -> bool {
    sha256(secret) == *revocation_hash
}

/// One party's chain of revocation secrets.
///
/// Secrets are derived from the seed on demand, so the chain can be
/// arbitrarily deep without storing anything but the seed and the
/// highest commitment number disclosed so far.
#[serde_as]
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevocationChain {
    #[serde_as(as = "IfIsHumanReadable<Hex, Bytes>")]
    seed: [u8; 32],
    disclosed_through: Option<u64>,
}

impl Debug for RevocationChain {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("RevocationChain")
            .field("seed", &DebugRedacted(&self.seed))
            .field("disclosed_through", &self.disclosed_through)
            .finish()
    }
}

impl RevocationChain {
    /// Create a chain from a seed
    pub fn new(seed: [u8; 32]) -> Self {
        RevocationChain { seed, disclosed_through: None }
    }

    /// The secret for commitment `commitment_number`.
    /// The chain ends at [`INITIAL_COMMITMENT_NUMBER`].
    pub fn secret_at(&self, commitment_number: u64) -> Result<[u8; 32], ChannelError> {
        let index = INITIAL_COMMITMENT_NUMBER
            .checked_sub(commitment_number)
            .ok_or_else(|| construction_error(format!("commitment {} past chain end", commitment_number)))?;
        Ok(build_commitment_secret(&self.seed, index))
    }

    /// The revocation hash for commitment `commitment_number`
    pub fn commitment_at(&self, commitment_number: u64) -> Result<[u8; 32], ChannelError> {
        Ok(sha256(&self.secret_at(commitment_number)?))
    }

    /// Whether `secret` is the secret for commitment `commitment_number`
    pub fn verify(&self, commitment_number: u64, secret: &[u8; 32]) -> bool {
        self.commitment_at(commitment_number)
            .map_or(false, |hash| verify_revocation(&hash, secret))
    }

    /// The highest commitment number whose secret was disclosed
    pub fn disclosed_through(&self) -> Option<u64> {
        self.disclosed_through
    }

    /// Disclose the secret for `commitment_number`, which must already be
    /// superseded by `current_commitment_number`.
    pub fn disclose(
        &mut self,
        commitment_number: u64,
        current_commitment_number: u64,
    ) -> Result<RevocationSecret, ChannelError> {
        if commitment_number >= current_commitment_number {
            return Err(premature_disclosure(commitment_number, current_commitment_number));
        }
        let secret = self.secret_at(commitment_number)?;
        if self.disclosed_through.map_or(true, |d| commitment_number > d) {
            self.disclosed_through = Some(commitment_number);
        }
        Ok(RevocationSecret { commitment_number, secret })
    }
}

/// Compact storage of the counterparty's disclosed revocation secrets.
///
/// Holds at most 49 secrets and derives the rest, as described in BOLT 3.
/// Secrets must be provided in commitment number order.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevocationStore {
    old_secrets: Vec<([u8; 32], u64)>,
}

impl Debug for RevocationStore {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("RevocationStore")
            .field("min_seen", &self.get_min_seen_secret())
            .field("old_secrets", &DebugOldSecrets(&self.old_secrets))
            .finish()
    }
}

struct DebugOldSecrets<'a>(pub &'a Vec<([u8; 32], u64)>);
impl<'a> core::fmt::Debug for DebugOldSecrets<'a> {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> Result<(), core::fmt::Error> {
        f.debug_list()
            .entries(self.0.iter().filter(|(_, idx)| *idx != 1 << 48).map(|os| DebugOldSecret(os)))
            .finish()
    }
}

struct DebugOldSecret<'a>(pub &'a ([u8; 32], u64));
impl<'a> core::fmt::Debug for DebugOldSecret<'a> {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> Result<(), core::fmt::Error> {
        f.debug_tuple("OldSecret").field(&DebugBytes(&self.0 .0)).field(&self.0 .1).finish()
    }
}

impl Default for RevocationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RevocationStore {
    /// Creates an empty store
    pub fn new() -> Self {
        let old_secrets = (0..49).map(|_| ([0; 32], 1 << 48)).collect::<Vec<_>>();
        Self { old_secrets }
    }

    #[inline]
    fn place_secret(idx: u64) -> u8 {
        for i in 0..48 {
            if idx & (1 << i) == (1 << i) {
                return i;
            }
        }
        48
    }

    /// Returns the minimum derivation index of all stored secrets.
    /// Indexes start at 1 << 48 and get decremented by one for each new secret.
    pub fn get_min_seen_secret(&self) -> u64 {
        self.old_secrets.iter().map(|&(_, idx)| idx).min().unwrap_or(1 << 48)
    }

    #[inline]
    fn derive_secret(secret: [u8; 32], bits: u8, idx: u64) -> [u8; 32] {
        let mut res: [u8; 32] = secret;
        for i in 0..bits {
            let bitpos = bits - 1 - i;
            if idx & (1 << bitpos) == (1 << bitpos) {
                res[(bitpos / 8) as usize] ^= 1 << (bitpos & 7);
                res = Sha256::hash(&res).to_byte_array();
            }
        }
        res
    }

    fn provide_secret(&mut self, idx: u64, secret: [u8; 32]) -> Result<(), ()> {
        let pos = Self::place_secret(idx);
        for i in 0..pos {
            let (old_secret, old_idx) = self.old_secrets[i as usize];
            if Self::derive_secret(secret, pos, old_idx) != old_secret {
                return Err(());
            }
        }
        if self.get_min_seen_secret() <= idx {
            return Ok(());
        }
        self.old_secrets[pos as usize] = (secret, idx);
        Ok(())
    }

    fn get_secret(&self, idx: u64) -> Option<[u8; 32]> {
        for i in 0..self.old_secrets.len() {
            if (idx & (!((1 << i) - 1))) == self.old_secrets[i].1 {
                return Some(Self::derive_secret(self.old_secrets[i].0, i as u8, idx));
            }
        }
        debug_assert!(idx < self.get_min_seen_secret());
        None
    }

    /// Store the secret for `commitment_number`.
    /// Fails if it is inconsistent with the secrets already stored.
    pub fn provide(&mut self, commitment_number: u64, secret: [u8; 32]) -> Result<(), ()> {
        self.provide_secret(INITIAL_COMMITMENT_NUMBER - commitment_number, secret)
    }

    /// The secret for `commitment_number`, if it was disclosed
    pub fn get(&self, commitment_number: u64) -> Option<[u8; 32]> {
        if commitment_number > INITIAL_COMMITMENT_NUMBER {
            return None;
        }
        self.get_secret(INITIAL_COMMITMENT_NUMBER - commitment_number)
    }

    /// The highest commitment number disclosed so far
    pub fn highest_revoked(&self) -> Option<u64> {
        let min = self.get_min_seen_secret();
        if min == 1 << 48 {
            None
        } else {
            Some(INITIAL_COMMITMENT_NUMBER - min)
        }
    }
}
