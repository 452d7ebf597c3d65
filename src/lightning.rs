//! Lightning node collaborator interface.
//!
//! Invoice creation, payment dispatch and routing all live behind this
//! trait; the swap core only sequences calls and reacts to the resulting
//! payment updates.

use crate::error::Result;
use crate::types::{Preimage, SwapHash};
use bitcoin::secp256k1::PublicKey;
use futures::stream::BoxStream;
use std::future::Future;
use std::pin::Pin;

/// Type alias for lightning client futures.
pub type LightningFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Parameters for dispatching a payment.
#[derive(Debug, Clone)]
pub struct PayRequest {
    pub bolt11: String,
    /// Hash of the swap this payment belongs to. Dispatches are
    /// deduplicated by the invoice's own payment hash, decoded from
    /// `bolt11`.
    pub payment_hash: SwapHash,
    /// Upper bound on the amount paid, in satoshis.
    pub amount_limit: u64,
    /// Upper bound on the routing fee, in satoshis.
    pub fee_limit: u64,
    /// Restrict the first hop to this channel.
    pub outgoing_channel: Option<u64>,
    /// Require the route to end through this node.
    pub last_hop: Option<PublicKey>,
}

/// Updates on an in-flight payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentUpdate {
    InFlight,
    Succeeded {
        preimage: Preimage,
        /// Routing fee actually paid, in satoshis.
        routing_fee: u64,
    },
    Failed {
        reason: String,
    },
}

/// State of an invoice held by the local node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvoiceState {
    Open,
    /// Payment arrived and is held pending settlement.
    Accepted,
    Settled(Preimage),
    Cancelled,
}

/// Lightning node access used by the swap core.
pub trait LightningClient: Send + Sync + 'static {
    /// Create an invoice for `amount` sat locked to an externally supplied
    /// payment hash. Returns the BOLT11 string.
    fn add_invoice(
        &self,
        amount: u64,
        preimage_hash: SwapHash,
        cltv_delta: u32,
    ) -> LightningFuture<'_, String>;

    /// Dispatch a payment. Idempotent by payment hash: dispatching an
    /// already-known payment returns the status stream of the existing
    /// attempt.
    fn pay_invoice(
        &self,
        request: PayRequest,
    ) -> LightningFuture<'_, BoxStream<'static, PaymentUpdate>>;

    /// Look up the state of an invoice created with [`add_invoice`].
    fn lookup_invoice(&self, preimage_hash: SwapHash) -> LightningFuture<'_, InvoiceState>;

    /// Settle a held invoice with its preimage.
    fn settle_invoice(&self, preimage: Preimage) -> LightningFuture<'_, ()>;

    /// Cancel a held invoice, releasing any held payment.
    fn cancel_invoice(&self, preimage_hash: SwapHash) -> LightningFuture<'_, ()>;
}
