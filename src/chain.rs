//! Chain access collaborator interface.
//!
//! The swap core never talks to a blockchain backend directly; it consumes
//! this trait. Implementations wrap a full node, an Electrum server or a
//! compact-block filter client, and are expected to be internally
//! thread-safe.

use crate::error::Result;
use bitcoin::{ScriptBuf, Transaction, Txid};
use futures::stream::BoxStream;
use std::future::Future;
use std::pin::Pin;

/// Type alias for chain client futures.
pub type ChainFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// What a confirmation subscription watches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchTarget {
    /// Any transaction paying this output script.
    Script(ScriptBuf),
    /// One specific transaction.
    Transaction(Txid),
}

/// Events delivered by a confirmation subscription.
///
/// `Seen` carries the full transaction so the core can validate outputs
/// without issuing its own chain queries. The stream ends once the watched
/// transaction is buried deeply enough that the backend stops tracking
/// reorgs for it.
#[derive(Debug, Clone)]
pub enum ConfirmationEvent {
    /// A matching transaction entered the mempool or a block.
    Seen { tx: Transaction, height: u32 },
    /// The transaction reached the requested depth.
    Confirmed { txid: Txid, height: u32 },
    /// A previously reported confirmation was undone by a reorg.
    Reorged { txid: Txid },
}

/// Blockchain access used by the swap core.
pub trait ChainClient: Send + Sync + 'static {
    /// Current best-chain height.
    fn current_height(&self) -> ChainFuture<'_, u32>;

    /// Hand a transaction to the network. Idempotent by txid: re-broadcasting
    /// a known transaction succeeds and returns the same id. Templates
    /// without inputs are funded and signed by the backing wallet.
    fn broadcast(&self, tx: &Transaction) -> ChainFuture<'_, Txid>;

    /// Subscribe to confirmations of the target, reporting `Confirmed` once
    /// `min_depth` is reached.
    fn subscribe_confirmations(
        &self,
        target: WatchTarget,
        min_depth: u32,
    ) -> ChainFuture<'_, BoxStream<'static, ConfirmationEvent>>;

    /// Fee-rate estimate in sat/vbyte for confirmation within
    /// `target_blocks`.
    fn estimate_fee(&self, target_blocks: u32) -> ChainFuture<'_, u64>;
}
