#![allow(missing_docs)]

use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use bitcoin::{CompressedPublicKey, Network, OutPoint, ScriptBuf, Transaction, TxOut, Txid};
use bitcoin::hashes::Hash;
use lightning::types::payment::{PaymentHash, PaymentPreimage};

use crate::channel::{Channel, ChannelId, ChannelSetup, ChannelUpdate};
use crate::policy::error::ChannelError;
use crate::policy::validator::make_simple_validator;
use crate::prelude::*;
use crate::revocation::RevocationChain;
use crate::signer::{LocalSigner, Signer};
use crate::tx::script::{funding_cooperative_witness, FundingVariant};
use crate::tx::tx::{build_funding_tx, FundingInput};
use crate::util::crypto_utils::{public_key_of, sha256};
use crate::Arc;

pub const TEST_HOLDER_SEED: [u8; 32] = [0x11; 32];
pub const TEST_COUNTERPARTY_SEED: [u8; 32] = [0x22; 32];
pub const TEST_CHANNEL_ID: [u8; 32] = [0x33; 32];
pub const TEST_TIMEOUT_HEIGHT: u32 = 800_000;

// Status assertions:

#[cfg(test)]
macro_rules! assert_status_ok {
    ($status: expr) => {
        if $status.is_err() {
            panic!("unexpected Status: {:#?}", $status.unwrap_err());
        }
    };
}

// ChannelError assertions:

#[cfg(test)]
macro_rules! assert_channel_err {
    ($res: expr, $kind: pat) => {
        match $res {
            Err(ref e) if matches!(e.kind, $kind) => {}
            Err(e) => panic!("unexpected ChannelError: {:?}", e),
            Ok(_) => panic!("expected {}", stringify!($kind)),
        }
    };
}

pub fn make_test_privkey(n: u8) -> SecretKey {
    SecretKey::from_slice(&[n; 32]).unwrap()
}

pub fn make_test_pubkey(n: u8) -> PublicKey {
    public_key_of(&Secp256k1::signing_only(), &make_test_privkey(n))
}

pub fn make_test_outpoint(n: u8) -> OutPoint {
    OutPoint { txid: Txid::from_byte_array([n; 32]), vout: 0 }
}

pub fn make_test_p2wpkh(n: u8) -> ScriptBuf {
    ScriptBuf::new_p2wpkh(&CompressedPublicKey(make_test_pubkey(n)).wpubkey_hash())
}

pub fn make_test_preimage(n: u8) -> (PaymentPreimage, PaymentHash) {
    let preimage = PaymentPreimage([n; 32]);
    (preimage, PaymentHash(sha256(&preimage.0)))
}

/// A signer holding the private keys `make_test_privkey(n)` for each `n`
pub fn make_test_signer(keys: &[u8]) -> Arc<LocalSigner> {
    let signer = LocalSigner::new();
    for n in keys {
        signer.add_key(make_test_privkey(*n));
    }
    Arc::new(signer)
}

/// The holder's setup.  The holder owns keys 1 and 2, the counterparty 3 and 4.
pub fn make_test_channel_setup() -> ChannelSetup {
    let counterparty_chain = RevocationChain::new(TEST_COUNTERPARTY_SEED);
    ChannelSetup {
        network: Network::Regtest,
        is_outbound: true,
        channel_value_sat: 1_000_000,
        funding_variant: FundingVariant::DualFunderMultisig,
        funding_outpoint: make_test_outpoint(7),
        holder_funding_pubkey: make_test_pubkey(1),
        counterparty_funding_pubkey: make_test_pubkey(3),
        holder_commit_pubkey: make_test_pubkey(2),
        counterparty_commit_pubkey: make_test_pubkey(4),
        counterparty_node_id: make_test_pubkey(9),
        holder_selected_contest_delay: 144,
        counterparty_selected_contest_delay: 144,
        channel_reserve_sat: 10_000,
        max_accepted_htlcs: 30,
        commitment_fee_sat: 0,
        holder_initial_sat: 600_000,
        counterparty_initial_revocation_hash: counterparty_chain.commitment_at(0).unwrap(),
        counterparty_second_revocation_hash: counterparty_chain.commitment_at(1).unwrap(),
    }
}

/// The counterparty's view of `setup`
pub fn mirror_setup(setup: &ChannelSetup, holder_seed: [u8; 32]) -> ChannelSetup {
    let holder_chain = RevocationChain::new(holder_seed);
    ChannelSetup {
        is_outbound: !setup.is_outbound,
        holder_funding_pubkey: setup.counterparty_funding_pubkey,
        counterparty_funding_pubkey: setup.holder_funding_pubkey,
        holder_commit_pubkey: setup.counterparty_commit_pubkey,
        counterparty_commit_pubkey: setup.holder_commit_pubkey,
        counterparty_node_id: make_test_pubkey(8),
        holder_selected_contest_delay: setup.counterparty_selected_contest_delay,
        counterparty_selected_contest_delay: setup.holder_selected_contest_delay,
        holder_initial_sat: setup.channel_value_sat - setup.holder_initial_sat,
        counterparty_initial_revocation_hash: holder_chain.commitment_at(0).unwrap(),
        counterparty_second_revocation_hash: holder_chain.commitment_at(1).unwrap(),
        ..setup.clone()
    }
}

/// Both ends of a funded and confirmed channel.
/// `a` is the initiator.
pub struct TestChannelPair {
    pub a: Channel,
    pub b: Channel,
    pub funding_tx: Transaction,
    pub funding_txout: TxOut,
}

impl TestChannelPair {
    /// Run a full update cycle proposed by `a`
    pub fn update_a(&mut self, updates: Vec<ChannelUpdate>) -> Result<(), ChannelError> {
        run_update(&mut self.a, &mut self.b, updates)
    }

    /// Run a full update cycle proposed by `b`
    pub fn update_b(&mut self, updates: Vec<ChannelUpdate>) -> Result<(), ChannelError> {
        run_update(&mut self.b, &mut self.a, updates)
    }

    /// The funding output, for consensus checks
    pub fn funding_prevout(&self) -> (OutPoint, TxOut) {
        (self.a.setup().funding_outpoint, self.funding_txout.clone())
    }
}

pub fn run_update(
    proposer: &mut Channel,
    acceptor: &mut Channel,
    updates: Vec<ChannelUpdate>,
) -> Result<(), ChannelError> {
    let proposal = proposer.propose_update(updates)?;
    let acceptance = acceptor.receive_proposal(&proposal)?;
    let revocation = proposer.commit_accepted(&acceptance)?;
    acceptor.receive_revocation(&revocation)
}

pub fn make_test_channel_pair() -> TestChannelPair {
    make_test_channel_pair_with(FundingVariant::DualFunderMultisig, 0)
}

/// Fund both ends, exchange the initial signatures and confirm
pub fn make_test_channel_pair_with(
    variant: FundingVariant,
    commitment_fee_sat: u64,
) -> TestChannelPair {
    let (a, b, funding_tx) = make_test_unconfirmed_pair(variant, commitment_fee_sat);
    let mut pair = TestChannelPair {
        funding_txout: funding_tx.output[0].clone(),
        a,
        b,
        funding_tx,
    };
    assert!(pair.a.funding_confirmed().unwrap());
    assert!(pair.b.funding_confirmed().unwrap());
    pair
}

/// Both ends with signed commitment zero, before the funding confirms
pub fn make_test_unconfirmed_pair(
    variant: FundingVariant,
    commitment_fee_sat: u64,
) -> (Channel, Channel, Transaction) {
    let mut setup = make_test_channel_setup();
    setup.funding_variant = variant;
    setup.commitment_fee_sat = commitment_fee_sat;
    let funding = build_funding_tx(
        &[FundingInput { outpoint: make_test_outpoint(5), value_sat: 2_000_000 }],
        &[],
        &variant,
        setup.funder_funding_pubkey(),
        setup.fundee_funding_pubkey(),
        setup.channel_value_sat,
        253,
        vec![],
    )
    .unwrap();
    setup.funding_outpoint = funding.outpoint;
    let counterparty_setup = mirror_setup(&setup, TEST_HOLDER_SEED);

    let id = ChannelId::new(&TEST_CHANNEL_ID);
    let mut a = Channel::new(
        id.clone(),
        setup,
        TEST_HOLDER_SEED,
        make_test_signer(&[1, 2]),
        make_simple_validator(),
    )
    .unwrap();
    let mut b = Channel::new(
        id,
        counterparty_setup,
        TEST_COUNTERPARTY_SEED,
        make_test_signer(&[3, 4]),
        make_simple_validator(),
    )
    .unwrap();
    let sig_for_b = a.sign_counterparty_commitment().unwrap();
    let sig_for_a = b.sign_counterparty_commitment().unwrap();
    a.validate_holder_commitment_signature(&sig_for_a).unwrap();
    b.validate_holder_commitment_signature(&sig_for_b).unwrap();
    (a, b, funding.transaction)
}

/// Panic unless `tx` validly spends `prevouts` under consensus rules
pub fn assert_spend_valid(tx: &Transaction, prevouts: &[(OutPoint, TxOut)]) {
    tx.verify(|outpoint| {
        prevouts.iter().find(|(op, _)| op == outpoint).map(|(_, txout)| txout.clone())
    })
    .unwrap_or_else(|e| panic!("invalid spend {:?} of {:?}", e, tx));
}

/// The output `vout` of `tx`, for consensus checks
pub fn prevout(tx: &Transaction, vout: u32) -> (OutPoint, TxOut) {
    (OutPoint { txid: tx.compute_txid(), vout }, tx.output[vout as usize].clone())
}

/// The channel's current holder commitment with a complete witness, signed
/// by `signer` without changing the channel.  Used to broadcast a
/// commitment that is later revoked.
pub fn make_signed_holder_commitment(channel: &Channel, signer: &LocalSigner) -> Transaction {
    let setup = channel.setup();
    let mut tx = channel.holder_commitment().transaction.clone();
    let sig = signer
        .sign(
            channel.funding_redeemscript(),
            &tx,
            0,
            setup.channel_value_sat,
            &setup.holder_funding_pubkey,
        )
        .unwrap();
    let counterparty_sig = channel.holder_commitment_signature().unwrap();
    tx.input[0].witness = funding_cooperative_witness(
        &setup.funding_variant,
        channel.funding_redeemscript(),
        &setup.holder_funding_pubkey,
        &sig,
        &setup.counterparty_funding_pubkey,
        &counterparty_sig,
    );
    tx
}
