//! Shared types for the Loopswap Client SDK.

use bitcoin::secp256k1::PublicKey;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

/// Serde module for serializing `[u8; 32]` as hex strings.
mod hex_bytes32 {
    use super::*;

    pub fn serialize<S>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

/// Bitcoin network type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    /// Bitcoin mainnet.
    Bitcoin,
    /// Bitcoin testnet.
    Testnet,
    /// Bitcoin regtest (local development).
    Regtest,
    /// Signet.
    Signet,
}

impl Network {
    /// Convert to bitcoin crate's Network type.
    pub fn to_bitcoin_network(self) -> bitcoin::Network {
        match self {
            Network::Bitcoin => bitcoin::Network::Bitcoin,
            Network::Testnet => bitcoin::Network::Testnet,
            Network::Regtest => bitcoin::Network::Regtest,
            Network::Signet => bitcoin::Network::Signet,
        }
    }
}

impl std::str::FromStr for Network {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bitcoin" | "mainnet" => Ok(Network::Bitcoin),
            "testnet" | "testnet3" => Ok(Network::Testnet),
            "regtest" => Ok(Network::Regtest),
            "signet" => Ok(Network::Signet),
            _ => Err(crate::error::Error::Parse(format!(
                "Unknown network: {}",
                s
            ))),
        }
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Network::Bitcoin => write!(f, "bitcoin"),
            Network::Testnet => write!(f, "testnet"),
            Network::Regtest => write!(f, "regtest"),
            Network::Signet => write!(f, "signet"),
        }
    }
}

/// The 32-byte secret whose hash locks both the on-chain HTLC and the
/// off-chain payment.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preimage(#[serde(with = "hex_bytes32")] pub [u8; 32]);

impl Preimage {
    /// Generate a fresh random preimage.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Preimage(bytes)
    }

    /// SHA-256 of the preimage, the swap identity.
    pub fn hash(&self) -> SwapHash {
        SwapHash(Sha256::digest(self.0).into())
    }
}

impl std::fmt::Debug for Preimage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Preimage({})", hex::encode(self.0))
    }
}

/// SHA-256 digest of the swap preimage. Identifies a swap everywhere.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SwapHash(#[serde(with = "hex_bytes32")] pub [u8; 32]);

impl SwapHash {
    /// Parse from a hex string.
    pub fn from_hex(s: &str) -> crate::Result<Self> {
        let bytes = hex::decode(s)
            .map_err(|e| crate::Error::Parse(format!("Invalid swap hash hex: {}", e)))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| crate::Error::Parse("Swap hash must be 32 bytes".to_string()))?;
        Ok(SwapHash(bytes))
    }

    /// Hex representation, used as the storage key.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for SwapHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::fmt::Debug for SwapHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SwapHash({})", self.to_hex())
    }
}

/// Swap direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwapDirection {
    /// Loop Out: off-chain balance converted into on-chain coins.
    Out,
    /// Loop In: on-chain coins converted into off-chain balance.
    In,
}

impl std::fmt::Display for SwapDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SwapDirection::Out => write!(f, "loop out"),
            SwapDirection::In => write!(f, "loop in"),
        }
    }
}

/// Capability set advertised to the swap server.
///
/// Feature gating is explicit at each call site; nothing is derived from the
/// enum ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolVersion {
    /// No special features.
    Legacy,
    /// The server may split the swap payment into multiple parts.
    MultiPart,
    /// The client accepts both P2WSH and NP2WSH Loop In HTLCs.
    NativeSegwitIn,
}

impl ProtocolVersion {
    /// Whether the client accepts a native-segwit Loop In HTLC, which also
    /// implies the nested address is offered to the server.
    pub fn supports_native_segwit_in(&self) -> bool {
        matches!(self, ProtocolVersion::NativeSegwitIn)
    }

    /// Whether the server may deliver the swap payment in multiple parts.
    pub fn supports_multi_part(&self) -> bool {
        matches!(
            self,
            ProtocolVersion::MultiPart | ProtocolVersion::NativeSegwitIn
        )
    }
}

/// Who broadcasts the Loop In HTLC transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HtlcBroadcaster {
    /// The executor builds and broadcasts the HTLC itself.
    Internal,
    /// An external wallet funds the HTLC; the executor only observes the
    /// chain. The point of no return moves out of the core with it.
    External,
}

/// Immutable parameters fixed at swap creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contract {
    pub direction: SwapDirection,
    /// Swap principal in satoshis.
    pub amount: u64,
    pub swap_hash: SwapHash,
    /// Key of the party that can reclaim the HTLC after timeout.
    pub sender_key: PublicKey,
    /// Key of the party that can claim the HTLC with the preimage.
    pub receiver_key: PublicKey,
    /// Absolute block height after which the refund path becomes spendable.
    pub cltv_expiry: u32,
    /// Hard ceiling on the on-chain fee the client will pay.
    pub max_miner_fee: u64,
    /// Hard ceiling on the server's service fee.
    pub max_swap_fee: u64,
    pub max_swap_routing_fee: Option<u64>,
    pub max_prepay_routing_fee: Option<u64>,
    /// Loop Out only.
    pub max_prepay_amount: Option<u64>,
    /// Chain tip at creation.
    pub initiation_height: u32,
    pub creation_time: OffsetDateTime,
    pub protocol_version: ProtocolVersion,
    /// Loop In only; `Internal` for Loop Out.
    pub htlc_broadcaster: HtlcBroadcaster,
    /// Agreed server fee from the accepted quote.
    pub swap_fee: u64,
    /// BOLT11 invoice the client pays (Loop Out) or the server pays (Loop In).
    pub swap_invoice: String,
    /// Loop Out no-show penalty invoice.
    pub prepay_invoice: Option<String>,
    /// Wall-clock deadline for the server HTLC to appear on chain (Loop Out).
    pub publication_deadline: Option<OffsetDateTime>,
    /// Where a Loop Out sweep or a Loop In refund pays out.
    pub payout_script: bitcoin::ScriptBuf,
    /// Constrains the route of the server's Loop In payment; also the key
    /// for the per-peer concurrency bound.
    pub last_hop: Option<PublicKey>,
    /// Restricts the client's Loop Out payments to this outgoing channel.
    pub outgoing_channel: Option<u64>,
    pub network: Network,
}

/// Actually-paid swap costs. Monotonic accumulators: the `add_*` methods are
/// the only mutators and never decrease a field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapCosts {
    /// Service fee paid to the swap server, in satoshis.
    pub server: u64,
    /// On-chain miner fees paid, in satoshis.
    pub onchain: u64,
    /// Off-chain routing fees paid, in satoshis.
    pub offchain: u64,
}

impl SwapCosts {
    pub fn add_server(&mut self, sat: u64) {
        self.server += sat;
    }

    pub fn add_onchain(&mut self, sat: u64) {
        self.onchain += sat;
    }

    pub fn add_offchain(&mut self, sat: u64) {
        self.offchain += sat;
    }

    /// Total satoshis spent on the swap so far.
    pub fn total(&self) -> u64 {
        self.server + self.onchain + self.offchain
    }
}

/// Terminal tag for a failed swap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    QuoteExceedsLimit,
    ProtocolViolation(String),
    InsufficientConfirmations,
    OffchainPaymentFailed,
    OnchainBroadcastFailed,
    UserCancelled,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::QuoteExceedsLimit => write!(f, "quote exceeds limit"),
            FailureReason::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
            FailureReason::InsufficientConfirmations => write!(f, "insufficient confirmations"),
            FailureReason::OffchainPaymentFailed => write!(f, "off-chain payment failed"),
            FailureReason::OnchainBroadcastFailed => write!(f, "on-chain broadcast failed"),
            FailureReason::UserCancelled => write!(f, "cancelled by user"),
        }
    }
}

/// Final outcome committed to the store when a swap ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalOutcome {
    Succeeded,
    Failed(FailureReason),
    Refunded,
}

/// Status record surfaced to observers on every state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapStatus {
    pub swap_hash: SwapHash,
    pub direction: SwapDirection,
    /// Human-readable phase name.
    pub phase: String,
    pub amount: u64,
    /// HTLC addresses derived for this swap (P2WSH first, NP2WSH second
    /// where offered).
    pub htlc_addresses: Vec<String>,
    pub last_update: OffsetDateTime,
    /// Actually-paid costs; populated only once the swap has progressed far
    /// enough for the numbers to be meaningful.
    pub costs: Option<SwapCosts>,
}
