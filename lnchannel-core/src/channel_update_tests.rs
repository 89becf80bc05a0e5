#[cfg(test)]
mod tests {
    use crate::channel::{Channel, ChannelId, ChannelState, ChannelUpdate};
    use crate::htlc::{HtlcDirection, HtlcId, HtlcState};
    use crate::persist::model::ChannelEntry;
    use crate::policy::error::ChannelErrorKind;
    use crate::policy::validator::make_simple_validator;
    use crate::revocation::{verify_revocation, RevocationChain};
    use crate::tx::script::FundingVariant;
    use crate::tx::tx::decode_commitment_number;
    use crate::util::test_utils::*;
    use test_log::test;

    fn delta(to_us_sat: i64) -> ChannelUpdate {
        ChannelUpdate::BalanceDelta { to_us_sat }
    }

    fn add(amount_sat: u64, preimage_n: u8, cltv_expiry: u32) -> ChannelUpdate {
        let (_, payment_hash) = make_test_preimage(preimage_n);
        ChannelUpdate::AddHtlc { amount_sat, payment_hash, cltv_expiry }
    }

    fn offered(index: u64) -> HtlcId {
        HtlcId::new(HtlcDirection::Offered, index)
    }

    fn received(index: u64) -> HtlcId {
        HtlcId::new(HtlcDirection::Received, index)
    }

    fn output_total(channel: &Channel) -> u64 {
        channel.holder_commitment().transaction.output.iter().map(|o| o.value.to_sat()).sum()
    }

    #[test]
    fn balance_update_test() {
        let mut pair = make_test_channel_pair();
        assert_eq!(pair.a.our_balance(), 600_000);
        assert_eq!(pair.b.our_balance(), 400_000);

        pair.update_a(vec![delta(50_000)]).unwrap();

        assert_eq!(pair.a.commitment_number(), 1);
        assert_eq!(pair.b.commitment_number(), 1);
        assert_eq!(pair.a.our_balance(), 650_000);
        assert_eq!(pair.a.their_balance(), 350_000);
        assert_eq!(pair.b.our_balance(), 350_000);
        assert_eq!(pair.b.their_balance(), 650_000);
        assert_eq!(pair.a.state(), ChannelState::Open);
        assert_eq!(pair.b.state(), ChannelState::Open);
        assert_eq!(pair.b.awaiting_revocation(), None);

        // each side holds the other's view of the same transactions
        assert_eq!(
            pair.a.holder_commitment().transaction,
            pair.b.counterparty_commitment().transaction
        );
        assert_eq!(
            pair.b.holder_commitment().transaction,
            pair.a.counterparty_commitment().transaction
        );
        assert_eq!(decode_commitment_number(&pair.a.holder_commitment().transaction), Some(1));
    }

    #[test]
    fn balance_update_from_counterparty_test() {
        let mut pair = make_test_channel_pair();
        pair.update_b(vec![delta(100_000)]).unwrap();
        assert_eq!(pair.a.our_balance(), 500_000);
        assert_eq!(pair.b.our_balance(), 500_000);
        pair.update_a(vec![delta(-20_000), delta(5_000)]).unwrap();
        assert_eq!(pair.a.our_balance(), 485_000);
        assert_eq!(pair.b.our_balance(), 515_000);
        assert_eq!(pair.a.commitment_number(), 2);
    }

    #[test]
    fn revocation_disclosure_test() {
        let mut pair = make_test_channel_pair();
        assert_channel_err!(
            pair.a.holder_revocation_secret(0),
            ChannelErrorKind::PrematureDisclosure { index: 0, current: 0 }
        );

        let proposal = pair.a.propose_update(vec![delta(1_000)]).unwrap();
        // not yet accepted
        assert_channel_err!(
            pair.a.holder_revocation_secret(0),
            ChannelErrorKind::PrematureDisclosure { .. }
        );
        let acceptance = pair.b.receive_proposal(&proposal).unwrap();
        assert_eq!(acceptance.revocation.commitment_number, 0);
        assert_eq!(pair.b.awaiting_revocation(), Some(0));
        let revocation = pair.a.commit_accepted(&acceptance).unwrap();
        pair.b.receive_revocation(&revocation).unwrap();

        let secret = pair.a.holder_revocation_secret(0).unwrap();
        assert!(verify_revocation(
            &RevocationChain::new(TEST_HOLDER_SEED).commitment_at(0).unwrap(),
            &secret.secret
        ));
        assert_eq!(pair.b.counterparty_revocation_secret(0), Some(secret.secret));
        assert_eq!(
            pair.a.counterparty_revocation_secret(0),
            Some(RevocationChain::new(TEST_COUNTERPARTY_SEED).secret_at(0).unwrap())
        );
        assert_channel_err!(
            pair.a.holder_revocation_secret(1),
            ChannelErrorKind::PrematureDisclosure { index: 1, current: 1 }
        );
    }

    #[test]
    fn stale_signature_test() {
        let mut pair = make_test_channel_pair();
        let stale = pair.a.holder_commitment_signature().unwrap();
        let proposal = pair.a.propose_update(vec![delta(10_000)]).unwrap();
        let mut acceptance = pair.b.receive_proposal(&proposal).unwrap();
        let good = acceptance.signature;

        acceptance.signature = stale;
        assert_channel_err!(
            pair.a.commit_accepted(&acceptance),
            ChannelErrorKind::SignatureInvalid(_)
        );
        assert_eq!(pair.a.state(), ChannelState::Updating);
        assert_eq!(pair.a.commitment_number(), 0);
        assert_eq!(pair.a.our_balance(), 600_000);
        assert!(pair.a.pending_commitment().is_some());

        acceptance.signature = good;
        let revocation = pair.a.commit_accepted(&acceptance).unwrap();
        pair.b.receive_revocation(&revocation).unwrap();
        assert_eq!(pair.a.our_balance(), 610_000);
        assert_eq!(pair.a.state(), ChannelState::Open);
    }

    #[test]
    fn bad_revocation_secret_test() {
        let mut pair = make_test_channel_pair();
        let proposal = pair.a.propose_update(vec![delta(10_000)]).unwrap();
        let mut acceptance = pair.b.receive_proposal(&proposal).unwrap();
        let good = acceptance.revocation.secret;
        acceptance.revocation.secret = [0; 32];
        assert_channel_err!(
            pair.a.commit_accepted(&acceptance),
            ChannelErrorKind::RevocationMismatch(_)
        );
        assert_eq!(pair.a.state(), ChannelState::Updating);
        acceptance.revocation.secret = good;
        pair.a.commit_accepted(&acceptance).unwrap();
    }

    #[test]
    fn sequence_mismatch_test() {
        let mut pair = make_test_channel_pair();
        let proposal = pair.a.propose_update(vec![delta(10_000)]).unwrap();
        let mut acceptance = pair.b.receive_proposal(&proposal).unwrap();
        acceptance.commitment_number = 5;
        assert_channel_err!(
            pair.a.commit_accepted(&acceptance),
            ChannelErrorKind::SequenceMismatch { expected: 1, actual: 5 }
        );
        assert_eq!(pair.a.state(), ChannelState::Closing);
        assert!(pair.a.pending_commitment().is_none());
        assert_eq!(pair.a.commitment_number(), 0);
    }

    #[test]
    fn proposal_sequence_mismatch_test() {
        let mut pair = make_test_channel_pair();
        let mut proposal = pair.a.propose_update(vec![delta(10_000)]).unwrap();
        proposal.commitment_number = 3;
        assert_channel_err!(
            pair.b.receive_proposal(&proposal),
            ChannelErrorKind::SequenceMismatch { expected: 1, actual: 3 }
        );
        assert_eq!(pair.b.state(), ChannelState::Closing);
    }

    #[test]
    fn proposal_before_revocation_test() {
        let mut pair = make_test_channel_pair();
        let proposal = pair.a.propose_update(vec![delta(10_000)]).unwrap();
        let acceptance = pair.b.receive_proposal(&proposal).unwrap();
        // the revocation is never delivered
        pair.a.commit_accepted(&acceptance).unwrap();
        let proposal = pair.a.propose_update(vec![delta(10_000)]).unwrap();
        assert_channel_err!(
            pair.b.receive_proposal(&proposal),
            ChannelErrorKind::ProtocolViolation(_)
        );
        assert_eq!(pair.b.state(), ChannelState::Closing);
    }

    #[test]
    fn propose_while_awaiting_revocation_test() {
        let mut pair = make_test_channel_pair();
        let proposal = pair.a.propose_update(vec![delta(10_000)]).unwrap();
        pair.b.receive_proposal(&proposal).unwrap();
        assert_channel_err!(
            pair.b.propose_update(vec![delta(1_000)]),
            ChannelErrorKind::InvalidState(_)
        );
        assert_eq!(pair.b.state(), ChannelState::Open);
    }

    #[test]
    fn unexpected_revocation_test() {
        let mut pair = make_test_channel_pair();
        pair.update_a(vec![delta(10_000)]).unwrap();
        let proposal = pair.a.propose_update(vec![delta(10_000)]).unwrap();
        let acceptance = pair.b.receive_proposal(&proposal).unwrap();
        let mut revocation = pair.a.commit_accepted(&acceptance).unwrap();
        revocation.revocation.commitment_number = 0;
        assert_channel_err!(
            pair.b.receive_revocation(&revocation),
            ChannelErrorKind::SequenceMismatch { expected: 1, actual: 0 }
        );
        assert_eq!(pair.b.state(), ChannelState::Closing);
    }

    #[test]
    fn reserve_test() {
        let mut pair = make_test_channel_pair();
        assert_channel_err!(
            pair.a.propose_update(vec![delta(-595_000)]),
            ChannelErrorKind::InsufficientBalance { needed_sat: 595_000, available_sat: 590_000 }
        );
        assert_eq!(pair.a.state(), ChannelState::Open);
        pair.update_a(vec![delta(-590_000)]).unwrap();
        assert_eq!(pair.a.our_balance(), 10_000);
        assert_channel_err!(
            pair.a.propose_update(vec![delta(-1)]),
            ChannelErrorKind::InsufficientBalance { needed_sat: 1, available_sat: 0 }
        );
    }

    #[test]
    fn zero_delta_test() {
        let mut pair = make_test_channel_pair();
        assert_channel_err!(pair.a.propose_update(vec![delta(0)]), ChannelErrorKind::UpdateRejected(_));
        assert_channel_err!(pair.a.propose_update(vec![]), ChannelErrorKind::UpdateRejected(_));
        assert_eq!(pair.a.state(), ChannelState::Open);
    }

    #[test]
    fn compose_test() {
        let pair = make_test_channel_pair();
        let results = pair.a.compose(&[delta(300_000), delta(300_000), delta(-1), add(1_000, 1, 700_000), add(1_000, 2, 700_000)]);
        assert_eq!(results[0], Ok(None));
        assert!(matches!(
            results[1].as_ref().unwrap_err().kind,
            ChannelErrorKind::InsufficientBalance { needed_sat: 300_000, available_sat: 90_000 }
        ));
        assert_eq!(results[2], Ok(None));
        assert_eq!(results[3], Ok(Some(offered(0))));
        assert_eq!(results[4], Ok(Some(offered(1))));
        // nothing changed
        assert_eq!(pair.a.our_balance(), 600_000);
        assert_eq!(pair.a.htlcs().pending_count(), 0);
    }

    #[test]
    fn htlc_settle_test() {
        let mut pair = make_test_channel_pair();
        let (preimage, _) = make_test_preimage(1);
        pair.update_a(vec![add(100_000, 1, 700_000)]).unwrap();
        assert_eq!(pair.a.our_balance(), 500_000);
        assert_eq!(pair.a.their_balance(), 400_000);
        assert_eq!(pair.b.our_balance(), 400_000);
        assert_eq!(pair.b.their_balance(), 500_000);
        assert_eq!(pair.a.htlcs().get(&offered(0)).unwrap().state, HtlcState::Pending);
        assert_eq!(pair.b.htlcs().get(&received(0)).unwrap().amount_sat, 100_000);
        // the pending value stays in the offerer's output
        assert_eq!(pair.a.holder_commitment().transaction.output[0].value.to_sat(), 600_000);

        pair.update_b(vec![ChannelUpdate::SettleHtlc { id: received(0), preimage }]).unwrap();
        assert_eq!(pair.a.our_balance(), 500_000);
        assert_eq!(pair.a.their_balance(), 500_000);
        assert_eq!(pair.b.our_balance(), 500_000);
        assert_eq!(pair.a.htlcs().get(&offered(0)).unwrap().state, HtlcState::Settled);

        // resolved entries are pruned by the next commitment
        pair.update_a(vec![delta(1_000)]).unwrap();
        assert!(pair.a.htlcs().get(&offered(0)).is_none());
        assert!(pair.b.htlcs().get(&received(0)).is_none());
        assert_eq!(pair.a.htlcs().next_index(HtlcDirection::Offered), 1);
    }

    #[test]
    fn htlc_invalid_preimage_test() {
        let mut pair = make_test_channel_pair();
        pair.update_a(vec![add(100_000, 1, 700_000)]).unwrap();
        let (wrong, _) = make_test_preimage(2);
        assert_channel_err!(
            pair.b.propose_update(vec![ChannelUpdate::SettleHtlc { id: received(0), preimage: wrong }]),
            ChannelErrorKind::InvalidPreimage(_)
        );
        assert_channel_err!(
            pair.b.propose_update(vec![ChannelUpdate::CancelHtlc { id: received(7) }]),
            ChannelErrorKind::UnknownHtlc(_)
        );
        assert_eq!(pair.b.state(), ChannelState::Open);
    }

    #[test]
    fn htlc_timeout_test() {
        let mut pair = make_test_channel_pair();
        pair.update_a(vec![add(100_000, 1, 700_000)]).unwrap();
        assert_channel_err!(
            pair.a.propose_update(vec![ChannelUpdate::TimeoutHtlc {
                id: offered(0),
                current_height: 699_999
            }]),
            ChannelErrorKind::NotYetExpired { expiry: 700_000, height: 699_999 }
        );
        pair.update_a(vec![ChannelUpdate::TimeoutHtlc { id: offered(0), current_height: 700_000 }])
            .unwrap();
        assert_eq!(pair.a.our_balance(), 600_000);
        assert_eq!(pair.b.our_balance(), 400_000);
        assert_eq!(pair.a.htlcs().get(&offered(0)).unwrap().state, HtlcState::TimedOut);
    }

    #[test]
    fn htlc_cancel_test() {
        let mut pair = make_test_channel_pair();
        pair.update_b(vec![add(50_000, 3, 700_000)]).unwrap();
        assert_eq!(pair.b.our_balance(), 350_000);
        pair.update_a(vec![ChannelUpdate::CancelHtlc { id: received(0) }]).unwrap();
        assert_eq!(pair.b.our_balance(), 400_000);
        assert_eq!(pair.a.our_balance(), 600_000);
        assert_channel_err!(
            pair.a.propose_update(vec![ChannelUpdate::CancelHtlc { id: received(0) }]),
            ChannelErrorKind::AlreadyResolved(_)
        );
    }

    #[test]
    fn htlc_wrong_resolver_test() {
        let mut pair = make_test_channel_pair();
        let (preimage, _) = make_test_preimage(1);
        pair.update_a(vec![add(100_000, 1, 700_000)]).unwrap();
        // the offerer cannot settle its own htlc
        assert_channel_err!(
            pair.a.propose_update(vec![ChannelUpdate::SettleHtlc { id: offered(0), preimage }]),
            ChannelErrorKind::UpdateRejected(_)
        );
        assert_eq!(pair.a.state(), ChannelState::Open);

        // a counterparty proposal doing so breaks the protocol
        let mut proposal =
            pair.b.propose_update(vec![ChannelUpdate::SettleHtlc { id: received(0), preimage }]).unwrap();
        proposal.updates = vec![ChannelUpdate::TimeoutHtlc { id: received(0), current_height: 800_000 }];
        assert_channel_err!(
            pair.a.receive_proposal(&proposal),
            ChannelErrorKind::ProtocolViolation(_)
        );
        assert_eq!(pair.a.state(), ChannelState::Closing);
    }

    #[test]
    fn extreme_delta_proposal_test() {
        let mut pair = make_test_channel_pair();
        assert_channel_err!(
            pair.a.propose_update(vec![delta(i64::MIN)]),
            ChannelErrorKind::UpdateRejected(_)
        );
        assert_eq!(pair.a.state(), ChannelState::Open);

        let mut proposal = pair.a.propose_update(vec![delta(1_000)]).unwrap();
        proposal.updates = vec![delta(i64::MIN)];
        assert_channel_err!(
            pair.b.receive_proposal(&proposal),
            ChannelErrorKind::ProtocolViolation(_)
        );
        assert_eq!(pair.b.state(), ChannelState::Closing);
        assert_eq!(pair.b.commitment_number(), 0);
        assert_eq!(pair.b.our_balance(), 400_000);
    }

    #[test]
    fn oversized_htlc_proposal_test() {
        let mut pair = make_test_channel_pair();
        pair.update_a(vec![add(20_000, 1, 700_000)]).unwrap();
        let mut proposal = pair.a.propose_update(vec![add(1_000, 2, 700_000)]).unwrap();
        proposal.updates = vec![add(u64::MAX - 10_000, 2, 700_000)];
        assert_channel_err!(
            pair.b.receive_proposal(&proposal),
            ChannelErrorKind::UpdateRejected(_)
        );
        assert_eq!(pair.b.state(), ChannelState::Open);
        assert_eq!(pair.b.commitment_number(), 1);
        assert_eq!(pair.b.their_balance(), 580_000);
        assert_eq!(pair.b.htlcs().pending_count(), 1);
    }

    #[test]
    fn htlc_reserve_test() {
        let mut pair = make_test_channel_pair();
        pair.update_b(vec![add(300_000, 1, 700_000)]).unwrap();
        assert_channel_err!(
            pair.b.propose_update(vec![add(90_001, 2, 700_000)]),
            ChannelErrorKind::InsufficientBalance { needed_sat: 390_001, available_sat: 390_000 }
        );
        // balance moves cannot spend the pending value either
        assert_channel_err!(
            pair.b.propose_update(vec![delta(-90_001)]),
            ChannelErrorKind::InsufficientBalance { needed_sat: 90_001, available_sat: 90_000 }
        );
        pair.update_b(vec![add(90_000, 2, 700_000)]).unwrap();
        assert_eq!(pair.b.our_balance(), 10_000);
    }

    #[test]
    fn too_many_htlcs_test() {
        let mut pair = make_test_channel_pair();
        let updates: Vec<_> = (0..31).map(|i| add(1_000, i as u8 + 1, 700_000)).collect();
        assert_channel_err!(
            pair.a.propose_update(updates),
            ChannelErrorKind::TooManyHtlcs { max: 30 }
        );
        let updates: Vec<_> = (0..30).map(|i| add(1_000, i as u8 + 1, 700_000)).collect();
        pair.update_a(updates).unwrap();
        assert_eq!(pair.b.htlcs().pending_count(), 30);
        assert_channel_err!(
            pair.b.propose_update(vec![add(1_000, 99, 700_000)]),
            ChannelErrorKind::TooManyHtlcs { max: 30 }
        );
    }

    #[test]
    fn commitment_fee_test() {
        let mut pair = make_test_channel_pair_with(FundingVariant::DualFunderMultisig, 1_000);
        assert_eq!(output_total(&pair.a), 999_000);
        assert_eq!(output_total(&pair.b), 999_000);
        // the initiator pays
        assert_eq!(pair.a.holder_commitment().transaction.output[0].value.to_sat(), 599_000);
        assert_eq!(pair.b.holder_commitment().transaction.output[0].value.to_sat(), 400_000);

        pair.update_b(vec![delta(200_000)]).unwrap();
        pair.update_a(vec![add(50_000, 1, 700_000)]).unwrap();
        assert_eq!(output_total(&pair.a), 999_000);
        assert_eq!(output_total(&pair.b), 999_000);
        assert_eq!(
            pair.a.our_balance() + pair.a.their_balance() + 50_000,
            pair.a.setup().channel_value_sat
        );
        // the fee counts against the initiator's spendable value
        assert_channel_err!(
            pair.a.propose_update(vec![delta(-340_000)]),
            ChannelErrorKind::InsufficientBalance { needed_sat: 340_000, available_sat: 339_000 }
        );
    }

    #[test]
    fn funding_confirmation_test() {
        let (mut a, _b, _tx) = make_test_unconfirmed_pair(FundingVariant::DualFunderMultisig, 0);
        assert_eq!(a.state(), ChannelState::Pending);
        assert_channel_err!(a.propose_update(vec![delta(1)]), ChannelErrorKind::InvalidState(_));
        assert!(a.funding_confirmed().unwrap());
        assert!(!a.funding_confirmed().unwrap());
        assert_eq!(a.state(), ChannelState::Open);
    }

    #[test]
    fn funding_confirmation_unsigned_test() {
        let mut a = Channel::new(
            ChannelId::new(&TEST_CHANNEL_ID),
            make_test_channel_setup(),
            TEST_HOLDER_SEED,
            make_test_signer(&[1, 2]),
            make_simple_validator(),
        )
        .unwrap();
        assert_channel_err!(a.funding_confirmed(), ChannelErrorKind::InvalidState(_));
        assert_eq!(a.state(), ChannelState::Pending);
    }

    #[test]
    fn initial_signature_test() {
        let (a, mut b, _tx) = make_test_unconfirmed_pair(FundingVariant::DualFunderMultisig, 0);
        // a signature over a different transaction
        let sig = a.holder_commitment_signature().unwrap();
        let mut c = Channel::new(
            ChannelId::new(&TEST_CHANNEL_ID),
            b.setup().clone(),
            TEST_COUNTERPARTY_SEED,
            make_test_signer(&[3, 4]),
            make_simple_validator(),
        )
        .unwrap();
        assert_channel_err!(
            c.validate_holder_commitment_signature(&sig),
            ChannelErrorKind::SignatureInvalid(_)
        );
        // already signed channels accept no new initial signature after opening
        b.funding_confirmed().unwrap();
        assert_channel_err!(
            b.validate_holder_commitment_signature(&sig),
            ChannelErrorKind::InvalidState(_)
        );
    }

    #[test]
    fn restore_test() {
        let mut pair = make_test_channel_pair();
        pair.update_a(vec![delta(50_000), add(10_000, 1, 700_000)]).unwrap();
        let entry = pair.a.to_entry();
        let json = serde_json::to_string(&entry).unwrap();
        let entry: ChannelEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(entry, pair.a.to_entry());

        let restored = Channel::restore(
            ChannelId::new(&TEST_CHANNEL_ID),
            entry,
            make_test_signer(&[1, 2]),
            make_simple_validator(),
        )
        .unwrap();
        assert_eq!(restored.holder_commitment(), pair.a.holder_commitment());
        assert_eq!(restored.counterparty_commitment(), pair.a.counterparty_commitment());
        assert_eq!(restored.our_balance(), 640_000);

        pair.a = restored;
        pair.update_a(vec![delta(1_000)]).unwrap();
        pair.update_b(vec![delta(1_000)]).unwrap();
        assert_eq!(pair.a.commitment_number(), 3);
    }

    #[test]
    fn restore_in_flight_test() {
        let mut pair = make_test_channel_pair();
        pair.a.propose_update(vec![delta(50_000)]).unwrap();
        let entry = pair.a.to_entry();
        assert_eq!(entry.state, ChannelState::Open);
        let restored = Channel::restore(
            ChannelId::new(&TEST_CHANNEL_ID),
            entry,
            make_test_signer(&[1, 2]),
            make_simple_validator(),
        )
        .unwrap();
        assert_eq!(restored.state(), ChannelState::Open);
        assert_eq!(restored.commitment_number(), 0);
        assert!(restored.pending_commitment().is_none());
    }

    #[test]
    fn abandon_test() {
        let mut pair = make_test_channel_pair();
        pair.a.propose_update(vec![delta(50_000)]).unwrap();
        pair.a.abandon_pending();
        assert_eq!(pair.a.state(), ChannelState::Open);
        pair.update_a(vec![delta(10_000)]).unwrap();
        assert_eq!(pair.a.our_balance(), 610_000);
    }
}
