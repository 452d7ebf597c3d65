//! HTLC (Hash Time-Locked Contract) script and transaction construction.
//!
//! This module derives the on-chain side of a swap: the HTLC witness script,
//! the addresses the server may pay to, and the sweep/refund transaction
//! templates. It is deterministic and pure given its inputs; signing and
//! funding are the chain collaborator's concern.

use crate::error::{Error, Result};
use crate::types::Contract;
use crate::types::SwapHash;
use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::hashes::ripemd160;
use bitcoin::opcodes::all::{
    OP_CHECKSIG, OP_CLTV, OP_DROP, OP_ELSE, OP_ENDIF, OP_EQUAL, OP_EQUALVERIFY, OP_HASH160, OP_IF,
    OP_SIZE,
};
use bitcoin::script::Builder;
use bitcoin::secp256k1::PublicKey;
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness,
};

/// Locktimes at or above this value are interpreted as timestamps, not
/// block heights.
const LOCKTIME_HEIGHT_THRESHOLD: u32 = 500_000_000;

/// Outputs below this value are unspendable in practice.
const DUST_LIMIT_SAT: u64 = 546;

/// Conservative virtual-size estimate for a one-input one-output sweep
/// (success-path witness: signature, preimage, witness script).
pub const SWEEP_TX_VSIZE: u64 = 160;

/// Conservative virtual-size estimate for a one-input one-output refund
/// (timeout-path witness: signature, empty, witness script).
pub const REFUND_TX_VSIZE: u64 = 150;

/// The on-chain contract of a swap.
///
/// Success path: `(receiver_sig, preimage)` where `SHA-256(preimage)` equals
/// the swap hash. Refund path: `(sender_sig)` once `cltv_expiry` has passed.
#[derive(Debug, Clone)]
pub struct SwapHtlc {
    sender_key: PublicKey,
    receiver_key: PublicKey,
    swap_hash: SwapHash,
    cltv_expiry: u32,
    network: bitcoin::Network,
}

impl SwapHtlc {
    /// Construct the HTLC for the given swap parameters.
    pub fn new(
        sender_key: PublicKey,
        receiver_key: PublicKey,
        swap_hash: SwapHash,
        cltv_expiry: u32,
        network: bitcoin::Network,
    ) -> Result<Self> {
        if cltv_expiry >= LOCKTIME_HEIGHT_THRESHOLD {
            return Err(Error::Bitcoin(format!(
                "cltv expiry {} is not a block height",
                cltv_expiry
            )));
        }

        Ok(Self {
            sender_key,
            receiver_key,
            swap_hash,
            cltv_expiry,
            network,
        })
    }

    /// Construct the HTLC from a swap contract.
    pub fn from_contract(contract: &Contract) -> Result<Self> {
        Self::new(
            contract.sender_key,
            contract.receiver_key,
            contract.swap_hash,
            contract.cltv_expiry,
            contract.network.to_bitcoin_network(),
        )
    }

    /// The HTLC witness script.
    ///
    /// The size check distinguishes the two spend paths without a dedicated
    /// opcode: the success witness pushes the 32-byte preimage, the refund
    /// witness pushes an empty element.
    pub fn script(&self) -> ScriptBuf {
        let payment_hash = ripemd160::Hash::hash(&self.swap_hash.0);

        Builder::new()
            .push_opcode(OP_SIZE)
            .push_int(32)
            .push_opcode(OP_EQUAL)
            .push_opcode(OP_IF)
            .push_opcode(OP_HASH160)
            .push_slice(payment_hash.to_byte_array())
            .push_opcode(OP_EQUALVERIFY)
            .push_key(&bitcoin::PublicKey::new(self.receiver_key))
            .push_opcode(OP_ELSE)
            .push_opcode(OP_DROP)
            .push_int(self.cltv_expiry as i64)
            .push_opcode(OP_CLTV)
            .push_opcode(OP_DROP)
            .push_key(&bitcoin::PublicKey::new(self.sender_key))
            .push_opcode(OP_ENDIF)
            .push_opcode(OP_CHECKSIG)
            .into_script()
    }

    /// Native-segwit (P2WSH) output script.
    pub fn script_pubkey(&self) -> ScriptBuf {
        self.script().to_p2wsh()
    }

    /// Nested-segwit (NP2WSH) output script, offered for Loop In so older
    /// wallets can fund the swap.
    pub fn nested_script_pubkey(&self) -> ScriptBuf {
        self.script_pubkey().to_p2sh()
    }

    /// Native-segwit address.
    pub fn address(&self) -> Result<Address> {
        Address::from_script(&self.script_pubkey(), self.network)
            .map_err(|e| Error::Bitcoin(format!("Failed to derive HTLC address: {}", e)))
    }

    /// Nested-segwit address.
    pub fn nested_address(&self) -> Result<Address> {
        Address::from_script(&self.nested_script_pubkey(), self.network)
            .map_err(|e| Error::Bitcoin(format!("Failed to derive nested HTLC address: {}", e)))
    }

    /// Unfunded transaction paying `amount` into the HTLC.
    ///
    /// Inputs, change and signatures are added by the wallet behind the
    /// chain collaborator.
    pub fn funding_template(&self, amount: u64) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![],
            output: vec![TxOut {
                value: Amount::from_sat(amount),
                script_pubkey: self.script_pubkey(),
            }],
        }
    }

    /// Sweep transaction claiming the HTLC output via the success path.
    ///
    /// Returns the unsigned template and the miner fee it commits to, at
    /// `fee_rate` sat/vbyte against a conservative size estimate.
    pub fn sweep_template(
        &self,
        htlc_outpoint: OutPoint,
        htlc_value: u64,
        fee_rate: u64,
        payout_script: ScriptBuf,
    ) -> Result<(Transaction, u64)> {
        let fee = fee_rate * SWEEP_TX_VSIZE;
        let tx = self.spend_template(htlc_outpoint, htlc_value, fee, payout_script, None)?;
        Ok((tx, fee))
    }

    /// Refund transaction reclaiming the HTLC output via the timeout path.
    /// Valid for broadcast only once the chain reaches `cltv_expiry`.
    pub fn refund_template(
        &self,
        htlc_outpoint: OutPoint,
        htlc_value: u64,
        fee_rate: u64,
        payout_script: ScriptBuf,
    ) -> Result<(Transaction, u64)> {
        let fee = fee_rate * REFUND_TX_VSIZE;
        let tx = self.spend_template(
            htlc_outpoint,
            htlc_value,
            fee,
            payout_script,
            Some(self.cltv_expiry),
        )?;
        Ok((tx, fee))
    }

    fn spend_template(
        &self,
        htlc_outpoint: OutPoint,
        htlc_value: u64,
        fee: u64,
        payout_script: ScriptBuf,
        locktime_height: Option<u32>,
    ) -> Result<Transaction> {
        if htlc_value <= fee + DUST_LIMIT_SAT {
            return Err(Error::Bitcoin(format!(
                "Fee of {} sat leaves no spendable value from a {} sat HTLC",
                fee, htlc_value
            )));
        }

        let (lock_time, sequence) = match locktime_height {
            Some(height) => {
                let lock_time = LockTime::from_height(height)
                    .map_err(|e| Error::Bitcoin(format!("Invalid locktime: {}", e)))?;
                // Locktime is only enforced with a non-final sequence.
                (lock_time, Sequence::ENABLE_LOCKTIME_NO_RBF)
            }
            None => (LockTime::ZERO, Sequence::ENABLE_RBF_NO_LOCKTIME),
        };

        Ok(Transaction {
            version: Version::TWO,
            lock_time,
            input: vec![TxIn {
                previous_output: htlc_outpoint,
                script_sig: ScriptBuf::new(),
                sequence,
                witness: Witness::default(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(htlc_value - fee),
                script_pubkey: payout_script,
            }],
        })
    }
}
