use bitcoin::{OutPoint, Transaction};
use tokio::sync::{mpsc, oneshot};

use crate::prelude::*;
use crate::util::status::Status;

/// A confirmation of a watched output
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Confirmation {
    /// The height of the confirming block
    pub block_height: u32,
}

/// Chain connectivity.
///
/// Delivery is at-least-once: a subscriber may see the same confirmation or
/// spend more than once, for example across reorgs or resubscriptions.
/// Implementations are shared between channels.
pub trait ChainNotifier: SendSync {
    /// Notify once the transaction creating `outpoint` has `min_depth` confirmations
    fn notify_confirmation(
        &self,
        outpoint: &OutPoint,
        min_depth: u32,
    ) -> Result<oneshot::Receiver<Confirmation>, Status>;

    /// Stream the confirmed transactions spending `outpoint`
    fn notify_spend(
        &self,
        outpoint: &OutPoint,
    ) -> Result<mpsc::UnboundedReceiver<Transaction>, Status>;
}
