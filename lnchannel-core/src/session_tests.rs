#[cfg(test)]
mod tests {
    use core::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::broadcast::error::TryRecvError;
    use tokio::sync::Semaphore;

    use crate::channel::{
        Channel, ChannelState, ChannelUpdate, CommitAcceptance, CommitmentProposal, FundingSpend,
        RevocationMessage,
    };
    use crate::htlc::{HtlcDirection, HtlcId};
    use crate::policy::error::ChannelErrorKind;
    use crate::policy::validator::make_simple_validator;
    use crate::prelude::*;
    use crate::session::{ChannelEvent, ChannelSession, Counterparty, UpdateOutcome};
    use crate::tx::script::FundingVariant;
    use crate::util::loopback::LoopbackCounterparty;
    use crate::util::mocks::{MockChainNotifier, MockPersister};
    use crate::util::status::Status;
    use crate::util::test_utils::*;
    use crate::Arc;

    fn delta(to_us_sat: i64) -> ChannelUpdate {
        ChannelUpdate::BalanceDelta { to_us_sat }
    }

    /// Holds proposals until the test releases them
    struct GatedCounterparty {
        inner: Arc<LoopbackCounterparty>,
        gate: Semaphore,
        proposals: Mutex<Vec<usize>>,
    }

    impl SendSync for GatedCounterparty {}

    impl GatedCounterparty {
        fn new(inner: Arc<LoopbackCounterparty>) -> Arc<Self> {
            Arc::new(GatedCounterparty {
                inner,
                gate: Semaphore::new(0),
                proposals: Mutex::new(Vec::new()),
            })
        }

        fn release(&self, n: usize) {
            self.gate.add_permits(n);
        }

        // Update counts of the proposals seen so far
        fn proposals(&self) -> Vec<usize> {
            self.proposals.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Counterparty for GatedCounterparty {
        async fn propose(&self, proposal: CommitmentProposal) -> Result<CommitAcceptance, Status> {
            self.proposals.lock().unwrap().push(proposal.updates.len());
            let permit = self.gate.acquire().await.map_err(|_| Status::aborted("gate closed"))?;
            permit.forget();
            self.inner.propose(proposal).await
        }

        async fn revoke(&self, revocation: RevocationMessage) -> Result<(), Status> {
            self.inner.revoke(revocation).await
        }
    }

    /// Corrupts the commitment number of every acceptance
    struct RenumberingCounterparty {
        inner: Arc<LoopbackCounterparty>,
    }

    impl SendSync for RenumberingCounterparty {}

    #[async_trait]
    impl Counterparty for RenumberingCounterparty {
        async fn propose(&self, proposal: CommitmentProposal) -> Result<CommitAcceptance, Status> {
            let mut acceptance = self.inner.propose(proposal).await?;
            acceptance.commitment_number += 1;
            Ok(acceptance)
        }

        async fn revoke(&self, revocation: RevocationMessage) -> Result<(), Status> {
            self.inner.revoke(revocation).await
        }
    }

    struct TestSessions {
        a: Arc<ChannelSession>,
        b: Arc<ChannelSession>,
        a_persister: Arc<MockPersister>,
        b_persister: Arc<MockPersister>,
        // a's transport, when gated
        gated: Option<Arc<GatedCounterparty>>,
    }

    fn connect(a: Channel, b: Channel, gated: bool) -> TestSessions {
        let to_b = LoopbackCounterparty::new();
        let to_a = LoopbackCounterparty::new();
        let a_persister = Arc::new(MockPersister::new());
        let b_persister = Arc::new(MockPersister::new());
        let gated = if gated { Some(GatedCounterparty::new(to_b.clone())) } else { None };
        let a_counterparty: Arc<dyn Counterparty> = match &gated {
            Some(gated) => gated.clone() as Arc<dyn Counterparty>,
            None => to_b.clone() as Arc<dyn Counterparty>,
        };
        let a = ChannelSession::new(a, a_counterparty, a_persister.clone()).unwrap();
        let b = ChannelSession::new(b, to_a.clone(), b_persister.clone()).unwrap();
        to_b.connect(&b);
        to_a.connect(&a);
        TestSessions { a, b, a_persister, b_persister, gated }
    }

    fn make_sessions() -> TestSessions {
        let pair = make_test_channel_pair();
        connect(pair.a, pair.b, false)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn submit_test() {
        let s = make_sessions();
        let outcome = s.a.submit(delta(50_000)).await.unwrap();
        assert_eq!(outcome, UpdateOutcome { commitment_number: 1, htlc_id: None });
        assert_eq!(s.a.our_balance(), 650_000);
        assert_eq!(s.a.their_balance(), 350_000);
        assert_eq!(s.b.our_balance(), 350_000);
        assert_eq!(s.b.commitment_number(), 1);
        assert_eq!(s.b.with_channel(|c| c.awaiting_revocation()), None);

        let a_entry = s.a_persister.entry(s.a.id()).unwrap();
        assert_eq!(a_entry.commitment_number, 1);
        assert_eq!(a_entry.to_us_sat, 650_000);
        assert_eq!(s.b_persister.entry(s.b.id()).unwrap().awaiting_revocation, None);
    }

    #[tokio::test]
    async fn htlc_through_sessions_test() {
        let s = make_sessions();
        let (preimage, payment_hash) = make_test_preimage(1);
        let outcome = s
            .a
            .submit(ChannelUpdate::AddHtlc { amount_sat: 20_000, payment_hash, cltv_expiry: 700_000 })
            .await
            .unwrap();
        let id = outcome.htlc_id.unwrap();
        assert_eq!(id, HtlcId::new(HtlcDirection::Offered, 0));
        assert_eq!(s.a.our_balance(), 580_000);

        let outcome =
            s.b.submit(ChannelUpdate::SettleHtlc { id: id.mirrored(), preimage }).await.unwrap();
        assert_eq!(outcome.commitment_number, 2);
        assert_eq!(s.a.our_balance(), 580_000);
        assert_eq!(s.b.our_balance(), 420_000);
    }

    #[tokio::test]
    async fn rejected_update_test() {
        let s = make_sessions();
        let err = s.a.submit(delta(-595_000)).await.unwrap_err();
        assert_eq!(
            err.kind,
            ChannelErrorKind::InsufficientBalance { needed_sat: 595_000, available_sat: 590_000 }
        );
        assert_eq!(s.a.commitment_number(), 0);
        assert_eq!(s.a.state(), ChannelState::Open);
        // the channel is still usable
        s.a.submit(delta(1_000)).await.unwrap();
    }

    #[tokio::test]
    async fn batching_test() {
        let pair = make_test_channel_pair();
        let s = connect(pair.a, pair.b, true);
        let gated = s.gated.clone().unwrap();

        let release = async {
            while gated.proposals().len() < 1 || s.a.queued_updates() < 3 {
                tokio::task::yield_now().await;
            }
            gated.release(2);
        };
        let (first, second, third, fourth, _) = tokio::join!(
            s.a.submit(delta(1_000)),
            s.a.submit(delta(2_000)),
            s.a.submit(delta(-1_000_000)),
            s.a.submit(delta(3_000)),
            release,
        );

        assert_eq!(first.unwrap().commitment_number, 1);
        assert_eq!(second.unwrap().commitment_number, 2);
        assert!(matches!(third.unwrap_err().kind, ChannelErrorKind::InsufficientBalance { .. }));
        assert_eq!(fourth.unwrap().commitment_number, 2);
        // the three queued updates went into one cycle, minus the rejected one
        assert_eq!(gated.proposals(), vec![1, 2]);
        assert_eq!(s.a.our_balance(), 606_000);
        assert_eq!(s.b.our_balance(), 394_000);
    }

    #[tokio::test]
    async fn shutdown_cancels_proposal_test() {
        let pair = make_test_channel_pair();
        let s = connect(pair.a, pair.b, true);
        let gated = s.gated.clone().unwrap();

        let stop = async {
            while gated.proposals().is_empty() {
                tokio::task::yield_now().await;
            }
            s.a.shutdown().await
        };
        let (result, stopped) = tokio::join!(s.a.submit(delta(1_000)), stop);

        assert_eq!(result.unwrap_err().kind, ChannelErrorKind::Cancelled);
        stopped.unwrap();
        assert_eq!(s.a.state(), ChannelState::Closing);
        assert_eq!(s.a.commitment_number(), 0);
        assert_eq!(s.a.our_balance(), 600_000);
        assert_eq!(s.b.commitment_number(), 0);
        assert_eq!(s.a_persister.entry(s.a.id()).unwrap().state, ChannelState::Closing);

        assert_eq!(s.a.submit(delta(1_000)).await.unwrap_err().kind, ChannelErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn persist_failure_test() {
        let s = make_sessions();
        s.a_persister.set_failing(true);
        let err = s.a.submit(delta(1_000)).await.unwrap_err();
        assert!(matches!(err.kind, ChannelErrorKind::Persist(_)));
        // committed in memory, the revocation is held back
        assert_eq!(s.a.commitment_number(), 1);
        assert_eq!(s.b.with_channel(|c| c.awaiting_revocation()), Some(0));
        assert_eq!(s.a_persister.entry(s.a.id()).unwrap().commitment_number, 0);

        s.a_persister.set_failing(false);
        let outcome = s.a.submit(delta(1_000)).await.unwrap();
        assert_eq!(outcome.commitment_number, 2);
        assert_eq!(s.b.with_channel(|c| c.awaiting_revocation()), None);
        assert_eq!(s.b.our_balance(), 398_000);
        assert_eq!(s.a_persister.entry(s.a.id()).unwrap().commitment_number, 2);
    }

    #[tokio::test]
    async fn acceptor_persist_failure_test() {
        let s = make_sessions();
        s.b_persister.set_failing(true);
        let err = s.a.submit(delta(1_000)).await.unwrap_err();
        assert!(matches!(err.kind, ChannelErrorKind::Collaborator(_)));
        // neither side moved
        assert_eq!(s.a.commitment_number(), 0);
        assert_eq!(s.a.state(), ChannelState::Open);
        assert_eq!(s.b.commitment_number(), 0);
        assert_eq!(s.b.state(), ChannelState::Open);
        assert_eq!(s.b.with_channel(|c| c.awaiting_revocation()), None);
        assert!(s.b.with_channel(|c| c.holder_revocation_secret(0)).is_err());

        s.b_persister.set_failing(false);
        let outcome = s.a.submit(delta(1_000)).await.unwrap();
        assert_eq!(outcome.commitment_number, 1);
        assert_eq!(s.b.state(), ChannelState::Open);
        assert_eq!(s.b.our_balance(), 399_000);
        assert_eq!(s.b_persister.entry(s.b.id()).unwrap().commitment_number, 1);
    }

    #[tokio::test]
    async fn escalation_persist_failure_test() {
        let pair = make_test_channel_pair();
        let to_b = LoopbackCounterparty::new();
        let to_a = LoopbackCounterparty::new();
        let a_persister = Arc::new(MockPersister::new());
        let a = ChannelSession::new(
            pair.a,
            Arc::new(RenumberingCounterparty { inner: to_b.clone() }),
            a_persister.clone(),
        )
        .unwrap();
        let b = ChannelSession::new(pair.b, to_a.clone(), Arc::new(MockPersister::new())).unwrap();
        to_b.connect(&b);
        to_a.connect(&a);

        a_persister.set_failing(true);
        let err = a.submit(delta(1_000)).await.unwrap_err();
        // the caller sees the protocol error, not the persist failure
        assert!(matches!(err.kind, ChannelErrorKind::SequenceMismatch { .. }));
        assert_eq!(a.state(), ChannelState::Closing);
        assert_eq!(a.commitment_number(), 0);
        assert_eq!(a_persister.entry(a.id()).unwrap().state, ChannelState::Open);

        a_persister.set_failing(false);
        a.shutdown().await.unwrap();
        assert_eq!(a_persister.entry(a.id()).unwrap().state, ChannelState::Closing);
    }

    #[tokio::test]
    async fn restore_session_test() {
        let s = make_sessions();
        s.a.submit(delta(50_000)).await.unwrap();
        let restored = ChannelSession::restore(
            s.a.id().clone(),
            make_test_signer(&[1, 2]),
            make_simple_validator(),
            LoopbackCounterparty::new(),
            s.a_persister.clone(),
        )
        .unwrap();
        assert_eq!(restored.commitment_number(), 1);
        assert_eq!(restored.our_balance(), 650_000);
        assert_eq!(restored.state(), ChannelState::Open);
    }

    #[tokio::test]
    async fn funding_locked_test() {
        let (a, b, _funding_tx) = make_test_unconfirmed_pair(FundingVariant::DualFunderMultisig, 0);
        let s = connect(a, b, false);
        let notifier = MockChainNotifier::new();
        let mut events = s.a.subscribe_events();
        // resubscribing makes the notifier deliver twice
        s.a.start_chain_watch(&notifier, 3).unwrap();
        s.a.start_chain_watch(&notifier, 3).unwrap();
        assert_eq!(s.a.state(), ChannelState::Pending);

        let outpoint = s.a.with_channel(|c| c.setup().funding_outpoint);
        assert_eq!(notifier.confirm(&outpoint, 100), 2);
        assert_eq!(events.recv().await.unwrap(), ChannelEvent::FundingLocked);
        settle().await;
        assert_eq!(events.try_recv(), Err(TryRecvError::Empty));
        assert_eq!(s.a.state(), ChannelState::Open);
        assert_eq!(s.a_persister.entry(s.a.id()).unwrap().state, ChannelState::Open);
    }

    #[tokio::test]
    async fn breach_event_test() {
        let mut pair = make_test_channel_pair();
        pair.update_a(vec![delta(10_000)]).unwrap();
        let revoked = make_signed_holder_commitment(&pair.b, &make_test_signer(&[3]));
        pair.update_a(vec![delta(10_000)]).unwrap();
        let s = connect(pair.a, pair.b, false);
        let notifier = MockChainNotifier::new();
        let mut events = s.a.subscribe_events();
        s.a.start_chain_watch(&notifier, 3).unwrap();

        let outpoint = s.a.with_channel(|c| c.setup().funding_outpoint);
        assert_eq!(notifier.spend(&outpoint, &revoked), 1);
        assert_eq!(notifier.spend(&outpoint, &revoked), 1);
        match events.recv().await.unwrap() {
            ChannelEvent::FundingSpent(FundingSpend::Breach(remedy)) => {
                assert_eq!(remedy.commitment_number, 1);
                assert_eq!(remedy.txid, revoked.compute_txid());
            }
            other => panic!("unexpected {:?}", other),
        }
        settle().await;
        assert_eq!(events.try_recv(), Err(TryRecvError::Empty));
        assert_eq!(s.a.state(), ChannelState::Breached);
        assert!(s.a_persister.entry(s.a.id()).unwrap().breach.is_some());
        assert_eq!(
            s.a.submit(delta(1_000)).await.unwrap_err().kind,
            ChannelErrorKind::BreachDetected(1)
        );
    }

    #[tokio::test]
    async fn failing_notifier_test() {
        let s = make_sessions();
        let notifier = MockChainNotifier::new();
        notifier.set_failing(true);
        let err = s.a.start_chain_watch(&notifier, 3).unwrap_err();
        assert!(matches!(err.kind, ChannelErrorKind::Collaborator(_)));
    }

    #[tokio::test]
    async fn shutdown_stops_chain_watch_test() {
        let s = make_sessions();
        let notifier = MockChainNotifier::new();
        s.a.start_chain_watch(&notifier, 3).unwrap();
        s.a.shutdown().await.unwrap();
        let outpoint = s.a.with_channel(|c| c.setup().funding_outpoint);
        let tx = s.a.with_channel(|c| c.holder_commitment().transaction.clone());
        // the watch dropped its subscription
        assert_eq!(notifier.spend(&outpoint, &tx), 0);
    }

    #[tokio::test]
    async fn session_force_close_test() {
        let s = make_sessions();
        s.a.submit(delta(50_000)).await.unwrap();
        let tx = s.a.force_close().unwrap();
        assert_eq!(tx.compute_txid(), s.a.with_channel(|c| c.holder_commitment().txid()));
        assert_eq!(s.a.state(), ChannelState::Closing);
        assert_eq!(s.a_persister.entry(s.a.id()).unwrap().state, ChannelState::Closing);
    }
}
