//! The swap kernel: a pure, side-effect-free transition function.
//!
//! Given the current swap state and an input event, [`transition`] returns
//! the next state plus the actions the executor must perform. The kernel
//! never talks to the outside world; replaying a recorded event log through
//! it reproduces the recorded states exactly.

use crate::htlc::SwapHtlc;
use crate::policy;
use crate::types::{
    Contract, FailureReason, HtlcBroadcaster, Preimage, SwapCosts, SwapDirection, SwapStatus,
    TerminalOutcome,
};
use bitcoin::{OutPoint, ScriptBuf, Txid};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Kernel timing parameters, in blocks relative to the HTLC expiry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct KernelConfig {
    /// A Loop Out aborts instead of revealing the preimage once the chain
    /// tip is within this many blocks of `cltv_expiry`.
    pub reveal_safety_margin: u32,
    /// A Loop In initiates its refund once the chain tip is within this many
    /// blocks of `cltv_expiry`.
    pub refund_safety_margin: u32,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            reveal_safety_margin: 20,
            refund_safety_margin: 6,
        }
    }
}

/// Outcome of an off-chain payment attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PaymentResult {
    Succeeded {
        /// Preimage pulled by the payment, when the payment reveals one.
        preimage: Option<Preimage>,
        /// Routing fee actually paid, in satoshis.
        routing_fee: u64,
    },
    Failed {
        reason: String,
    },
}

/// An input to the kernel. Events are recorded in the swap's event log in
/// the exact order they were applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SwapEvent {
    /// Kick-off for a freshly created swap.
    Start,
    /// The prepay payment resolved.
    PrepayResult { result: PaymentResult },
    /// A transaction paying the HTLC address appeared on chain.
    HtlcSeen {
        outpoint: OutPoint,
        value: u64,
        script_pubkey: ScriptBuf,
    },
    /// The HTLC transaction reached its target confirmation depth.
    HtlcConfirmed { txid: Txid, height: u32 },
    /// The swap invoice payment resolved.
    SwapPaymentResult { result: PaymentResult },
    /// The Loop In invoice settled, revealing the preimage.
    InvoiceSettled { preimage: Preimage },
    /// The sweep transaction was handed to the network.
    SweepPublished { txid: Txid, fee: u64 },
    /// The sweep transaction reached its target depth.
    SweepConfirmed { txid: Txid, height: u32 },
    /// The refund transaction was handed to the network.
    RefundPublished { txid: Txid, fee: u64 },
    /// The refund transaction reached its target depth.
    RefundConfirmed { txid: Txid, height: u32 },
    /// A previously confirmed transaction was reorged out.
    Reorged { txid: Txid },
    /// The chain tip moved.
    BlockHeight { height: u32 },
    /// The wall-clock deadline for the server HTLC passed.
    PublicationDeadlineExpired,
    /// The user asked to abandon the swap.
    Cancel,
    /// An on-chain broadcast failed permanently (retries exhausted).
    BroadcastFailed { context: String },
}

/// The per-swap phase. Transitions produce fresh values; a terminal phase is
/// never left again, with the single exception of the sweep-reorg regression
/// (`Succeeded` → `Sweeping`) that runs until the sweep watcher closes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum SwapPhase {
    Created,
    /// Loop Out: the prepay payment has been dispatched.
    PrepayInFlight,
    /// Loop Out: prepay accepted; the server HTLC is due on chain.
    PrepayPaid,
    /// Loop In: the funding broadcast has been handed to the wallet but the
    /// HTLC has not been observed on chain yet. Recorded before the
    /// broadcast runs, since the wallet may fund the template differently
    /// on a second attempt.
    HtlcPublishing,
    HtlcPublished,
    HtlcConfirmed,
    /// Loop Out: the swap invoice was paid, pulling the preimage.
    PreimageRevealed,
    /// Loop Out: the sweep claiming the HTLC is unconfirmed.
    Sweeping,
    /// Loop In success terminal: the invoice settled and the preimage is
    /// known. Surfaced as `Succeeded`.
    InvoiceSettled,
    /// Loop In: the refund transaction is pending.
    Refunding,
    Succeeded,
    Refunded,
    Failed { reason: FailureReason },
}

impl SwapPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SwapPhase::Succeeded
                | SwapPhase::Refunded
                | SwapPhase::InvoiceSettled
                | SwapPhase::Failed { .. }
        )
    }

    /// The outcome committed to the store for a terminal phase.
    pub fn terminal_outcome(&self) -> Option<TerminalOutcome> {
        match self {
            SwapPhase::Succeeded | SwapPhase::InvoiceSettled => Some(TerminalOutcome::Succeeded),
            SwapPhase::Refunded => Some(TerminalOutcome::Refunded),
            SwapPhase::Failed { reason } => Some(TerminalOutcome::Failed(reason.clone())),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SwapPhase::Created => "created",
            SwapPhase::PrepayInFlight => "prepay_in_flight",
            SwapPhase::PrepayPaid => "prepay_paid",
            SwapPhase::HtlcPublishing => "htlc_publishing",
            SwapPhase::HtlcPublished => "htlc_published",
            SwapPhase::HtlcConfirmed => "htlc_confirmed",
            SwapPhase::PreimageRevealed => "preimage_revealed",
            SwapPhase::Sweeping => "sweeping",
            SwapPhase::InvoiceSettled => "invoice_settled",
            SwapPhase::Refunding => "refunding",
            SwapPhase::Succeeded => "succeeded",
            SwapPhase::Refunded => "refunded",
            SwapPhase::Failed { .. } => "failed",
        }
    }
}

/// The evolving record of one swap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapState {
    pub contract: Contract,
    pub phase: SwapPhase,
    pub htlc_outpoint: Option<OutPoint>,
    pub htlc_conf_height: Option<u32>,
    pub preimage: Option<Preimage>,
    pub sweep_txid: Option<Txid>,
    pub refund_txid: Option<Txid>,
    pub costs: SwapCosts,
    pub last_update: OffsetDateTime,
}

impl SwapState {
    /// Fresh state for a newly written contract.
    pub fn initial(contract: Contract) -> Self {
        let creation_time = contract.creation_time;
        Self {
            contract,
            phase: SwapPhase::Created,
            htlc_outpoint: None,
            htlc_conf_height: None,
            preimage: None,
            sweep_txid: None,
            refund_txid: None,
            costs: SwapCosts::default(),
            last_update: creation_time,
        }
    }

    pub fn htlc_txid(&self) -> Option<Txid> {
        self.htlc_outpoint.map(|outpoint| outpoint.txid)
    }

    /// Whether cancelling now would cost the client more than proceeding.
    ///
    /// Loop Out: set when the kernel authorises paying the swap invoice,
    /// which reveals the preimage to the server. Loop In: set when the HTLC
    /// transaction exists on chain.
    pub fn past_point_of_no_return(&self) -> bool {
        match self.contract.direction {
            SwapDirection::Out => matches!(
                self.phase,
                SwapPhase::HtlcConfirmed
                    | SwapPhase::PreimageRevealed
                    | SwapPhase::Sweeping
                    | SwapPhase::Succeeded
                    | SwapPhase::Refunded
            ),
            SwapDirection::In => !matches!(
                self.phase,
                SwapPhase::Created | SwapPhase::Failed { .. }
            ),
        }
    }

    /// The observer-facing status record for the current state.
    pub fn status(&self) -> SwapStatus {
        let htlc_addresses = match SwapHtlc::from_contract(&self.contract) {
            Ok(htlc) => {
                let mut addresses = Vec::new();
                if let Ok(address) = htlc.address() {
                    addresses.push(address.to_string());
                }
                if self.contract.direction == SwapDirection::In
                    && self.contract.protocol_version.supports_native_segwit_in()
                {
                    if let Ok(address) = htlc.nested_address() {
                        addresses.push(address.to_string());
                    }
                }
                addresses
            }
            Err(_) => Vec::new(),
        };

        // Cost numbers are only meaningful once the swap has left the early
        // phases: before that, nothing the user pays for has settled.
        let costs = match self.phase {
            SwapPhase::Sweeping
            | SwapPhase::InvoiceSettled
            | SwapPhase::Refunding
            | SwapPhase::Succeeded
            | SwapPhase::Refunded
            | SwapPhase::Failed { .. } => Some(self.costs),
            _ => None,
        };

        SwapStatus {
            swap_hash: self.contract.swap_hash,
            direction: self.contract.direction,
            phase: self.phase.name().to_string(),
            amount: self.contract.amount,
            htlc_addresses,
            last_update: self.last_update,
            costs,
        }
    }
}

/// A request the executor must satisfy after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwapAction {
    /// Dispatch the prepay payment.
    PayPrepay,
    /// Dispatch the swap invoice payment, revealing the preimage to the
    /// server on success. Loop Out point of no return.
    PaySwapInvoice,
    /// Broadcast the Loop In HTLC funding transaction.
    PublishHtlc,
    /// Subscribe to confirmations on the HTLC address.
    WatchHtlc,
    /// Build and broadcast the sweep claiming the HTLC.
    PublishSweep,
    /// Build and broadcast the timeout refund.
    PublishRefund,
    /// Subscribe to confirmations of the sweep transaction.
    WatchSweep { txid: Txid },
    /// Subscribe to confirmations of the refund transaction.
    WatchRefund { txid: Txid },
    /// Cancel the held Loop In invoice.
    CancelInvoice,
    /// Commit the final outcome to the store and release the executor.
    MarkTerminal { outcome: TerminalOutcome },
}

/// Result of applying one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub state: SwapState,
    pub actions: Vec<SwapAction>,
}

/// Apply `event` to `state`.
///
/// `at` stamps `last_update` on any change; passing recorded timestamps
/// during replay reproduces historic states bit-for-bit. Events that do not
/// apply in the current phase leave the state untouched.
pub fn transition(
    state: &SwapState,
    event: &SwapEvent,
    config: &KernelConfig,
    at: OffsetDateTime,
) -> Transition {
    let mut next = state.clone();
    let mut actions = Vec::new();

    if state.phase.is_terminal() {
        apply_terminal(state, &mut next, event, &mut actions);
    } else {
        match state.contract.direction {
            SwapDirection::Out => apply_out(state, &mut next, event, config, &mut actions),
            SwapDirection::In => apply_in(state, &mut next, event, config, &mut actions),
        }
    }

    if next != *state {
        next.last_update = at;
    }

    Transition { state: next, actions }
}

/// Actions to re-issue when an executor rehydrates a swap from the store.
pub fn resume_actions(state: &SwapState) -> Vec<SwapAction> {
    if let Some(outcome) = state.phase.terminal_outcome() {
        // Crash between the terminal transition and the terminal record:
        // re-commit the outcome.
        return vec![SwapAction::MarkTerminal { outcome }];
    }

    match (state.contract.direction, &state.phase) {
        (_, SwapPhase::Created) => Vec::new(),
        (SwapDirection::Out, SwapPhase::PrepayInFlight) => {
            vec![SwapAction::PayPrepay, SwapAction::WatchHtlc]
        }
        (SwapDirection::Out, SwapPhase::PrepayPaid) => vec![SwapAction::WatchHtlc],
        (SwapDirection::Out, SwapPhase::HtlcPublished) => vec![SwapAction::WatchHtlc],
        (SwapDirection::Out, SwapPhase::HtlcConfirmed) => {
            vec![SwapAction::WatchHtlc, SwapAction::PaySwapInvoice]
        }
        (SwapDirection::Out, SwapPhase::PreimageRevealed) => vec![SwapAction::PublishSweep],
        (SwapDirection::Out, SwapPhase::Sweeping) => match state.sweep_txid {
            Some(txid) => vec![SwapAction::WatchSweep { txid }],
            None => vec![SwapAction::PublishSweep],
        },
        // The funding broadcast may already have reached the wallet before
        // the crash; re-issuing it could fund a second HTLC. Watch only.
        (
            SwapDirection::In,
            SwapPhase::HtlcPublishing | SwapPhase::HtlcPublished | SwapPhase::HtlcConfirmed,
        ) => {
            vec![SwapAction::WatchHtlc]
        }
        (SwapDirection::In, SwapPhase::Refunding) => vec![SwapAction::PublishRefund],
        _ => Vec::new(),
    }
}

fn apply_terminal(
    state: &SwapState,
    next: &mut SwapState,
    event: &SwapEvent,
    actions: &mut Vec<SwapAction>,
) {
    // The only exit from a terminal phase: the sweep confirmation was
    // reorged out before the watcher closed.
    if let (SwapPhase::Succeeded, SwapEvent::Reorged { txid }) = (&state.phase, event) {
        if state.sweep_txid == Some(*txid) {
            next.phase = SwapPhase::Sweeping;
            actions.push(SwapAction::PublishSweep);
        }
    }
}

fn apply_out(
    state: &SwapState,
    next: &mut SwapState,
    event: &SwapEvent,
    config: &KernelConfig,
    actions: &mut Vec<SwapAction>,
) {
    let contract = &state.contract;

    match (&state.phase, event) {
        (SwapPhase::Created, SwapEvent::Start) => {
            next.phase = SwapPhase::PrepayInFlight;
            actions.push(SwapAction::PayPrepay);
            actions.push(SwapAction::WatchHtlc);
        }

        (_, SwapEvent::PrepayResult { result }) => match result {
            PaymentResult::Succeeded { routing_fee, .. } => {
                if !state.past_point_of_no_return()
                    && !policy::observed_cost_within(*routing_fee, contract.max_prepay_routing_fee)
                {
                    fail(next, actions, FailureReason::QuoteExceedsLimit);
                    return;
                }
                next.costs.add_offchain(*routing_fee);
                if state.phase == SwapPhase::PrepayInFlight {
                    next.phase = SwapPhase::PrepayPaid;
                }
            }
            PaymentResult::Failed { .. } => {
                if !state.past_point_of_no_return() {
                    fail(next, actions, FailureReason::OffchainPaymentFailed);
                }
            }
        },

        (
            SwapPhase::PrepayInFlight | SwapPhase::PrepayPaid,
            SwapEvent::HtlcSeen {
                outpoint,
                value,
                script_pubkey,
            },
        ) => match expected_script_pubkeys(contract) {
            Ok(expected) => {
                if !expected.contains(script_pubkey) {
                    fail(
                        next,
                        actions,
                        FailureReason::ProtocolViolation(
                            "server HTLC pays an unexpected script".to_string(),
                        ),
                    );
                } else if *value != contract.amount {
                    fail(
                        next,
                        actions,
                        FailureReason::ProtocolViolation(format!(
                            "server HTLC pays {} sat instead of {} sat",
                            value, contract.amount
                        )),
                    );
                } else {
                    next.phase = SwapPhase::HtlcPublished;
                    next.htlc_outpoint = Some(*outpoint);
                }
            }
            Err(e) => fail(
                next,
                actions,
                FailureReason::ProtocolViolation(e.to_string()),
            ),
        },

        // Later candidates for an already accepted HTLC are ignored: the
        // earliest seen transaction wins.
        (SwapPhase::HtlcPublished | SwapPhase::HtlcConfirmed, SwapEvent::HtlcSeen { .. }) => {}

        (SwapPhase::HtlcPublished, SwapEvent::HtlcConfirmed { txid, height }) => {
            if state.htlc_txid() == Some(*txid) {
                if *height >= expiry_cutoff(contract.cltv_expiry, config.reveal_safety_margin) {
                    // Too close to expiry to safely reveal the preimage.
                    fail(next, actions, FailureReason::InsufficientConfirmations);
                } else {
                    next.phase = SwapPhase::HtlcConfirmed;
                    next.htlc_conf_height = Some(*height);
                    actions.push(SwapAction::PaySwapInvoice);
                }
            }
        }

        (SwapPhase::HtlcConfirmed, SwapEvent::SwapPaymentResult { result }) => match result {
            PaymentResult::Succeeded {
                preimage: Some(preimage),
                routing_fee,
            } => {
                if preimage.hash() != contract.swap_hash {
                    fail(
                        next,
                        actions,
                        FailureReason::ProtocolViolation(
                            "preimage does not match swap hash".to_string(),
                        ),
                    );
                    return;
                }
                next.preimage = Some(*preimage);
                next.costs.add_offchain(*routing_fee);
                next.costs.add_server(contract.swap_fee);
                next.phase = SwapPhase::PreimageRevealed;
                actions.push(SwapAction::PublishSweep);
            }
            PaymentResult::Succeeded { preimage: None, .. } => {
                fail(
                    next,
                    actions,
                    FailureReason::ProtocolViolation(
                        "swap payment settled without a preimage".to_string(),
                    ),
                );
            }
            PaymentResult::Failed { .. } => {
                fail(next, actions, FailureReason::OffchainPaymentFailed);
            }
        },

        (
            SwapPhase::PreimageRevealed | SwapPhase::Sweeping,
            SwapEvent::SweepPublished { txid, fee },
        ) => {
            // Re-broadcasts of the same transaction must not double-count.
            if state.sweep_txid != Some(*txid) {
                next.costs.add_onchain(*fee);
                next.sweep_txid = Some(*txid);
            }
            next.phase = SwapPhase::Sweeping;
            actions.push(SwapAction::WatchSweep { txid: *txid });
        }

        (SwapPhase::Sweeping, SwapEvent::SweepConfirmed { txid, .. }) => {
            if state.sweep_txid == Some(*txid) {
                next.phase = SwapPhase::Succeeded;
                actions.push(SwapAction::MarkTerminal {
                    outcome: TerminalOutcome::Succeeded,
                });
            }
        }

        (SwapPhase::HtlcConfirmed, SwapEvent::Reorged { txid }) => {
            if state.htlc_txid() == Some(*txid) {
                next.phase = SwapPhase::HtlcPublished;
                next.htlc_conf_height = None;
            }
        }

        (SwapPhase::Sweeping, SwapEvent::Reorged { txid }) => {
            if state.sweep_txid == Some(*txid) {
                actions.push(SwapAction::PublishSweep);
            }
        }

        (
            SwapPhase::PrepayInFlight | SwapPhase::PrepayPaid | SwapPhase::HtlcPublished,
            SwapEvent::PublicationDeadlineExpired,
        ) => {
            fail(next, actions, FailureReason::InsufficientConfirmations);
        }

        (
            SwapPhase::PrepayInFlight | SwapPhase::PrepayPaid | SwapPhase::HtlcPublished,
            SwapEvent::BlockHeight { height },
        ) => {
            if *height >= expiry_cutoff(contract.cltv_expiry, config.reveal_safety_margin) {
                fail(next, actions, FailureReason::InsufficientConfirmations);
            }
        }

        (_, SwapEvent::Cancel) => {
            if !state.past_point_of_no_return() {
                fail(next, actions, FailureReason::UserCancelled);
            }
        }

        (_, SwapEvent::BroadcastFailed { .. }) => {
            fail(next, actions, FailureReason::OnchainBroadcastFailed);
        }

        _ => {}
    }
}

fn apply_in(
    state: &SwapState,
    next: &mut SwapState,
    event: &SwapEvent,
    config: &KernelConfig,
    actions: &mut Vec<SwapAction>,
) {
    let contract = &state.contract;

    match (&state.phase, event) {
        (SwapPhase::Created, SwapEvent::Start) => {
            if contract.htlc_broadcaster == HtlcBroadcaster::Internal {
                // The phase advance is durable before the broadcast runs.
                next.phase = SwapPhase::HtlcPublishing;
                actions.push(SwapAction::PublishHtlc);
            }
            actions.push(SwapAction::WatchHtlc);
        }

        (
            SwapPhase::Created | SwapPhase::HtlcPublishing,
            SwapEvent::HtlcSeen {
                outpoint,
                value,
                script_pubkey,
            },
        ) => match expected_script_pubkeys(contract) {
            Ok(expected) => {
                if !expected.contains(script_pubkey) {
                    fail_in(
                        next,
                        actions,
                        FailureReason::ProtocolViolation(
                            "HTLC funding pays an unexpected script".to_string(),
                        ),
                    );
                } else if *value != contract.amount {
                    fail_in(
                        next,
                        actions,
                        FailureReason::ProtocolViolation(format!(
                            "HTLC funding pays {} sat instead of {} sat",
                            value, contract.amount
                        )),
                    );
                } else {
                    next.phase = SwapPhase::HtlcPublished;
                    next.htlc_outpoint = Some(*outpoint);
                }
            }
            Err(e) => fail_in(
                next,
                actions,
                FailureReason::ProtocolViolation(e.to_string()),
            ),
        },

        (SwapPhase::HtlcPublished, SwapEvent::HtlcSeen { .. }) => {}

        (SwapPhase::HtlcPublished, SwapEvent::HtlcConfirmed { txid, height }) => {
            if state.htlc_txid() == Some(*txid) {
                next.phase = SwapPhase::HtlcConfirmed;
                next.htlc_conf_height = Some(*height);
            }
        }

        (
            SwapPhase::HtlcPublished | SwapPhase::HtlcConfirmed | SwapPhase::Refunding,
            SwapEvent::InvoiceSettled { preimage },
        ) => {
            if preimage.hash() != contract.swap_hash {
                fail_in(
                    next,
                    actions,
                    FailureReason::ProtocolViolation(
                        "settled preimage does not match swap hash".to_string(),
                    ),
                );
                return;
            }
            next.preimage = Some(*preimage);
            next.costs.add_server(contract.swap_fee);
            next.phase = SwapPhase::InvoiceSettled;
            actions.push(SwapAction::MarkTerminal {
                outcome: TerminalOutcome::Succeeded,
            });
        }

        (
            SwapPhase::HtlcPublished | SwapPhase::HtlcConfirmed,
            SwapEvent::BlockHeight { height },
        ) => {
            if *height >= expiry_cutoff(contract.cltv_expiry, config.refund_safety_margin) {
                next.phase = SwapPhase::Refunding;
                actions.push(SwapAction::PublishRefund);
                actions.push(SwapAction::CancelInvoice);
            }
        }

        (SwapPhase::Refunding, SwapEvent::RefundPublished { txid, fee }) => {
            if state.refund_txid != Some(*txid) {
                next.costs.add_onchain(*fee);
                next.refund_txid = Some(*txid);
            }
            actions.push(SwapAction::WatchRefund { txid: *txid });
        }

        (SwapPhase::Refunding, SwapEvent::RefundConfirmed { txid, .. }) => {
            if state.refund_txid == Some(*txid) {
                next.phase = SwapPhase::Refunded;
                actions.push(SwapAction::MarkTerminal {
                    outcome: TerminalOutcome::Refunded,
                });
            }
        }

        (SwapPhase::Refunding, SwapEvent::Reorged { txid }) => {
            if state.refund_txid == Some(*txid) {
                actions.push(SwapAction::PublishRefund);
            }
        }

        (SwapPhase::HtlcConfirmed, SwapEvent::Reorged { txid }) => {
            if state.htlc_txid() == Some(*txid) {
                next.phase = SwapPhase::HtlcPublished;
                next.htlc_conf_height = None;
            }
        }

        (_, SwapEvent::Cancel) => {
            if !state.past_point_of_no_return() {
                fail_in(next, actions, FailureReason::UserCancelled);
            }
        }

        (
            SwapPhase::Created | SwapPhase::HtlcPublishing | SwapPhase::Refunding,
            SwapEvent::BroadcastFailed { .. },
        ) => {
            fail_in(next, actions, FailureReason::OnchainBroadcastFailed);
        }

        _ => {}
    }
}

/// The scripts an on-chain HTLC for this contract may legitimately pay.
fn expected_script_pubkeys(contract: &Contract) -> crate::Result<Vec<ScriptBuf>> {
    let htlc = SwapHtlc::from_contract(contract)?;
    let mut scripts = vec![htlc.script_pubkey()];
    if contract.direction == SwapDirection::In
        && contract.protocol_version.supports_native_segwit_in()
    {
        scripts.push(htlc.nested_script_pubkey());
    }
    Ok(scripts)
}

fn expiry_cutoff(cltv_expiry: u32, margin: u32) -> u32 {
    cltv_expiry.saturating_sub(margin)
}

fn fail(next: &mut SwapState, actions: &mut Vec<SwapAction>, reason: FailureReason) {
    next.phase = SwapPhase::Failed {
        reason: reason.clone(),
    };
    actions.push(SwapAction::MarkTerminal {
        outcome: TerminalOutcome::Failed(reason),
    });
}

/// Loop In failure additionally releases the held invoice.
fn fail_in(next: &mut SwapState, actions: &mut Vec<SwapAction>, reason: FailureReason) {
    actions.push(SwapAction::CancelInvoice);
    fail(next, actions, reason);
}
