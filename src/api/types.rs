//! Wire types for the swap server API.
//!
//! These types match the server's REST schema and are used for
//! request/response serialization. All amounts are satoshis.

use crate::types::{ProtocolVersion, SwapHash};
use bitcoin::secp256k1::PublicKey;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Published swap terms for one direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapTerms {
    pub min_swap_amount: u64,
    pub max_swap_amount: u64,
}

/// Server cost estimates for a prospective Loop Out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopOutQuote {
    /// Service fee the server will charge.
    pub swap_fee: u64,
    /// No-show penalty the client pays up front.
    pub prepay_amount: u64,
    /// Estimated miner fee for the sweep at current rates.
    pub miner_fee: u64,
}

/// Server cost estimates for a prospective Loop In.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopInQuote {
    /// Service fee the server will charge.
    pub swap_fee: u64,
    /// Estimated miner fee for the HTLC funding at current rates.
    pub miner_fee: u64,
    /// The swap hash the server pre-commits to. Only the server knows the
    /// preimage; the client learns it from the settled invoice.
    pub swap_hash: SwapHash,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewLoopOutSwapRequest {
    /// Client key for the HTLC success path.
    pub receiver_key: PublicKey,
    pub swap_hash: SwapHash,
    pub amount: u64,
    /// Latest wall-clock time at which the server HTLC may appear on chain.
    #[serde(with = "time::serde::timestamp")]
    pub publication_deadline: OffsetDateTime,
    pub protocol_version: ProtocolVersion,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewLoopOutSwapResponse {
    /// Invoice whose payment reveals the preimage to the server.
    pub swap_invoice: String,
    /// No-show penalty invoice.
    pub prepay_invoice: String,
    /// Server key for the HTLC refund path.
    pub sender_key: PublicKey,
    /// Absolute block height of the HTLC timeout.
    pub expiry: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewLoopInSwapRequest {
    /// Client key for the HTLC refund path.
    pub sender_key: PublicKey,
    pub swap_hash: SwapHash,
    pub amount: u64,
    pub protocol_version: ProtocolVersion,
    /// Invoice the server pays once the on-chain HTLC is confirmed, created
    /// by the client against the server-committed hash.
    pub swap_invoice: String,
    /// Route constraint for the server's payment.
    pub last_hop: Option<PublicKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewLoopInSwapResponse {
    /// Server key for the HTLC success path.
    pub receiver_key: PublicKey,
    /// Absolute block height of the HTLC timeout.
    pub expiry: u32,
}

/// Error body returned by the server on non-2xx responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
}
