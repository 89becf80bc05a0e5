#![allow(missing_docs)]

use async_trait::async_trait;
use log::*;

use crate::channel::{CommitAcceptance, CommitmentProposal, RevocationMessage};
use crate::prelude::*;
use crate::session::{ChannelSession, Counterparty};
use crate::util::status::{unavailable, Status};
use crate::{Arc, Weak};

/// Delivers messages directly to another in-process session
pub struct LoopbackCounterparty {
    peer: Mutex<Weak<ChannelSession>>,
}

impl SendSync for LoopbackCounterparty {}

impl LoopbackCounterparty {
    pub fn new() -> Arc<Self> {
        Arc::new(LoopbackCounterparty { peer: Mutex::new(Weak::new()) })
    }

    /// Connect to the peer session, which must outlive its use
    pub fn connect(&self, peer: &Arc<ChannelSession>) {
        *self.peer.lock().unwrap() = Arc::downgrade(peer);
    }

    fn peer(&self) -> Result<Arc<ChannelSession>, Status> {
        self.peer.lock().unwrap().upgrade().ok_or_else(|| unavailable("peer disconnected"))
    }
}

#[async_trait]
impl Counterparty for LoopbackCounterparty {
    async fn propose(&self, proposal: CommitmentProposal) -> Result<CommitAcceptance, Status> {
        let peer = self.peer()?;
        peer.handle_proposal(&proposal).map_err(|e| {
            debug!("loopback proposal failed: {}", e);
            Status::aborted(Into::<String>::into(e))
        })
    }

    async fn revoke(&self, revocation: RevocationMessage) -> Result<(), Status> {
        let peer = self.peer()?;
        peer.handle_revocation(&revocation).map_err(|e| Status::aborted(Into::<String>::into(e)))
    }
}
