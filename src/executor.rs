//! The swap executor: drives one swap from creation to its terminal state.
//!
//! One executor owns one swap. All event sources (chain watchers, payment
//! status readers, the height ticker, deadline timers, user cancels) funnel
//! into a single ordered queue; between queue receives the kernel is invoked
//! synchronously and each state advance is made durable before any
//! externally visible action derived from it.

use crate::chain::{ChainClient, ConfirmationEvent, WatchTarget};
use crate::error::{Error, Result};
use crate::htlc::{REFUND_TX_VSIZE, SWEEP_TX_VSIZE, SwapHtlc};
use crate::kernel::{
    self, KernelConfig, PaymentResult, SwapAction, SwapEvent, SwapPhase, SwapState,
};
use crate::lightning::{InvoiceState, LightningClient, PayRequest, PaymentUpdate};
use crate::store::SwapStore;
use crate::types::{SwapDirection, SwapHash, SwapStatus, TerminalOutcome};
use bitcoin::secp256k1::PublicKey;
use bitcoin::{OutPoint, ScriptBuf, Txid};
use futures::StreamExt;
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Retry/backoff configuration for transient collaborator errors.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Base delay between retries.
    pub base_delay: Duration,
    /// Maximum backoff delay.
    pub max_delay: Duration,
    /// Maximum number of retries before giving up.
    pub max_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            max_retries: 5,
        }
    }
}

/// Executor configuration.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Confirmation depth required for the HTLC.
    pub htlc_confirmations: u32,
    /// Confirmation depth required for sweeps and refunds.
    pub sweep_confirmations: u32,
    /// Fee-estimate target in blocks for sweeps and refunds.
    pub fee_conf_target: u32,
    /// Interval for polling the chain tip and held invoices.
    pub poll_interval: Duration,
    pub retry: RetryConfig,
    pub kernel: KernelConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            htlc_confirmations: 3,
            sweep_confirmations: 3,
            fee_conf_target: 6,
            poll_interval: Duration::from_secs(30),
            retry: RetryConfig::default(),
            kernel: KernelConfig::default(),
        }
    }
}

/// Why an executor released its swap.
#[derive(Debug, Clone)]
pub enum ExitReason {
    Terminal(TerminalOutcome),
    /// The store failed; the swap stays as it is until restart.
    StorageFailure(String),
}

/// Sent to the supervisor when an executor finishes.
#[derive(Debug, Clone)]
pub struct ExecutorExit {
    pub swap_hash: SwapHash,
    pub direction: SwapDirection,
    pub last_hop: Option<PublicKey>,
    pub reason: ExitReason,
}

/// Messages on the executor's input queue.
enum ExecutorMsg {
    Apply(SwapEvent),
    WatchClosed(WatchRole),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatchRole {
    Htlc,
    Sweep,
    Refund,
}

#[derive(Debug, Clone, Copy)]
enum PaymentKind {
    Prepay,
    Swap,
}

/// Handle through which the supervisor drives a running executor.
pub struct ExecutorHandle {
    swap_hash: SwapHash,
    events_tx: mpsc::Sender<ExecutorMsg>,
    state: Arc<RwLock<SwapState>>,
    pub(crate) join: JoinHandle<()>,
}

impl ExecutorHandle {
    pub fn swap_hash(&self) -> SwapHash {
        self.swap_hash
    }

    /// Snapshot of the swap's current state.
    pub fn state(&self) -> SwapState {
        self.state.read().expect("state lock poisoned").clone()
    }

    /// Current status record.
    pub fn status(&self) -> SwapStatus {
        self.state().status()
    }

    /// Request cancellation. Rejected once the swap is past its point of no
    /// return; before that the cancel is delivered as a regular event.
    pub async fn cancel(&self) -> Result<()> {
        if self.state().past_point_of_no_return() {
            return Err(Error::PastPointOfNoReturn);
        }
        self.events_tx
            .send(ExecutorMsg::Apply(SwapEvent::Cancel))
            .await
            .map_err(|_| Error::SwapNotFound(self.swap_hash.to_string()))
    }
}

/// Drives a single swap.
pub struct Executor<C, L, S> {
    state: SwapState,
    chain: Arc<C>,
    lightning: Arc<L>,
    store: Arc<S>,
    config: ExecutorConfig,
    msgs_rx: mpsc::Receiver<ExecutorMsg>,
    msgs_tx: mpsc::Sender<ExecutorMsg>,
    status_tx: broadcast::Sender<SwapStatus>,
    exit_tx: mpsc::Sender<ExecutorExit>,
    shared_state: Arc<RwLock<SwapState>>,
    /// Payments dispatched in this process, keyed by invoice. The lightning
    /// client additionally deduplicates across restarts by payment hash.
    dispatched_payments: HashSet<String>,
    /// Transactions already being watched.
    watched_txs: HashSet<Txid>,
    tasks: Vec<JoinHandle<()>>,
    sweep_watch_open: bool,
    /// Success outcome held back until the sweep watcher closes, so a late
    /// reorg can still regress the phase before the terminal record lands.
    pending_terminal: Option<TerminalOutcome>,
}

impl<C, L, S> Executor<C, L, S>
where
    C: ChainClient,
    L: LightningClient,
    S: SwapStore + 'static,
{
    /// Spawn an executor task for `state` and return its handle.
    pub fn spawn(
        state: SwapState,
        chain: Arc<C>,
        lightning: Arc<L>,
        store: Arc<S>,
        config: ExecutorConfig,
        status_tx: broadcast::Sender<SwapStatus>,
        exit_tx: mpsc::Sender<ExecutorExit>,
    ) -> ExecutorHandle {
        let (msgs_tx, msgs_rx) = mpsc::channel(64);
        let shared_state = Arc::new(RwLock::new(state.clone()));
        let swap_hash = state.contract.swap_hash;

        let executor = Executor {
            state,
            chain,
            lightning,
            store,
            config,
            msgs_rx,
            msgs_tx: msgs_tx.clone(),
            status_tx,
            exit_tx,
            shared_state: shared_state.clone(),
            dispatched_payments: HashSet::new(),
            watched_txs: HashSet::new(),
            tasks: Vec::new(),
            sweep_watch_open: false,
            pending_terminal: None,
        };

        let join = tokio::spawn(executor.run());

        ExecutorHandle {
            swap_hash,
            events_tx: msgs_tx,
            state: shared_state,
            join,
        }
    }

    async fn run(mut self) {
        let swap_hash = self.state.contract.swap_hash;
        log::info!(
            "Executor started for {} swap {} in phase {}",
            self.state.contract.direction,
            swap_hash,
            self.state.phase.name()
        );

        self.start_height_ticker();
        if self.state.contract.direction == SwapDirection::In {
            self.start_invoice_poller();
        }
        self.start_deadline_timer();

        let startup = if self.state.phase == SwapPhase::Created {
            self.step(SwapEvent::Start).await
        } else {
            self.resync().await
        };
        let mut done = match startup {
            Ok(done) => done,
            Err(e) => {
                self.fatal_storage(e).await;
                true
            }
        };

        while !done {
            let Some(msg) = self.msgs_rx.recv().await else {
                break;
            };
            let result = match msg {
                ExecutorMsg::Apply(event) => self.step(event).await,
                ExecutorMsg::WatchClosed(role) => self.watch_closed(role).await,
            };
            match result {
                Ok(finished) => done = finished,
                Err(e) => {
                    self.fatal_storage(e).await;
                    done = true;
                }
            }
        }

        for task in &self.tasks {
            task.abort();
        }
    }

    /// Re-derive effects for a rehydrated swap: re-open subscriptions,
    /// re-dispatch in-flight payments, re-issue pending broadcasts.
    async fn resync(&mut self) -> Result<bool> {
        let actions = kernel::resume_actions(&self.state);
        log::info!(
            "Resuming swap {} with {} pending action(s)",
            self.state.contract.swap_hash,
            actions.len()
        );
        let mut done = false;
        for action in actions {
            if self.perform(action).await? {
                done = true;
            }
        }
        Ok(done)
    }

    /// Apply one event: kernel transition, durable append, then effects.
    async fn step(&mut self, event: SwapEvent) -> Result<bool> {
        let transition = kernel::transition(
            &self.state,
            &event,
            &self.config.kernel,
            OffsetDateTime::now_utc(),
        );
        if transition.state == self.state && transition.actions.is_empty() {
            return Ok(false);
        }

        let swap_hash = self.state.contract.swap_hash;
        if transition.state != self.state {
            // The state advance must be durable before any externally
            // visible action below.
            self.store
                .append_event(swap_hash, &event, &transition.state)
                .await?;
            log::debug!(
                "Swap {}: phase {} -> {}",
                swap_hash,
                self.state.phase.name(),
                transition.state.phase.name()
            );
            self.state = transition.state;
            *self.shared_state.write().expect("state lock poisoned") = self.state.clone();
            let _ = self.status_tx.send(self.state.status());

            if !self.state.phase.is_terminal() {
                self.pending_terminal = None;
            }
        }

        let mut done = false;
        for action in transition.actions {
            if self.perform(action).await? {
                done = true;
            }
        }
        Ok(done)
    }

    async fn perform(&mut self, action: SwapAction) -> Result<bool> {
        match action {
            SwapAction::PayPrepay => {
                let contract = &self.state.contract;
                let Some(invoice) = contract.prepay_invoice.clone() else {
                    // A loop out without a prepay invoice cannot exist; the
                    // supervisor builds the contract from the server response.
                    panic!("loop out contract without prepay invoice");
                };
                let amount_limit = contract.max_prepay_amount.unwrap_or(u64::MAX);
                let fee_limit = contract.max_prepay_routing_fee.unwrap_or(u64::MAX);
                self.dispatch_payment(PaymentKind::Prepay, invoice, amount_limit, fee_limit);
            }
            SwapAction::PaySwapInvoice => {
                let contract = &self.state.contract;
                let invoice = contract.swap_invoice.clone();
                let amount_limit = contract.amount + contract.swap_fee;
                let fee_limit = contract.max_swap_routing_fee.unwrap_or(u64::MAX);
                self.dispatch_payment(PaymentKind::Swap, invoice, amount_limit, fee_limit);
            }
            SwapAction::PublishHtlc => self.publish_htlc(),
            SwapAction::WatchHtlc => self.watch_htlc(),
            SwapAction::PublishSweep => self.publish_claim(WatchRole::Sweep),
            SwapAction::PublishRefund => self.publish_claim(WatchRole::Refund),
            SwapAction::WatchSweep { txid } => {
                if self.watched_txs.insert(txid) {
                    self.spawn_watcher(
                        WatchRole::Sweep,
                        WatchTarget::Transaction(txid),
                        self.config.sweep_confirmations,
                        Vec::new(),
                    );
                }
                self.sweep_watch_open = true;
            }
            SwapAction::WatchRefund { txid } => {
                if self.watched_txs.insert(txid) {
                    self.spawn_watcher(
                        WatchRole::Refund,
                        WatchTarget::Transaction(txid),
                        self.config.sweep_confirmations,
                        Vec::new(),
                    );
                }
            }
            SwapAction::CancelInvoice => {
                let swap_hash = self.state.contract.swap_hash;
                let retry = self.config.retry.clone();
                let result =
                    with_retry(&retry, || self.lightning.cancel_invoice(swap_hash)).await;
                if let Err(e) = result {
                    log::warn!("Failed to cancel invoice for swap {}: {}", swap_hash, e);
                }
            }
            SwapAction::MarkTerminal { outcome } => {
                let defer = outcome == TerminalOutcome::Succeeded
                    && self.state.contract.direction == SwapDirection::Out
                    && self.sweep_watch_open;
                if defer {
                    self.pending_terminal = Some(outcome);
                } else {
                    self.commit_terminal(outcome).await?;
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    async fn watch_closed(&mut self, role: WatchRole) -> Result<bool> {
        if role == WatchRole::Sweep {
            self.sweep_watch_open = false;
            if let Some(outcome) = self.pending_terminal.take() {
                self.commit_terminal(outcome).await?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn commit_terminal(&mut self, outcome: TerminalOutcome) -> Result<()> {
        let swap_hash = self.state.contract.swap_hash;
        self.store.mark_terminal(swap_hash, outcome.clone()).await?;
        log::info!("Swap {} finished: {:?}", swap_hash, outcome);

        let _ = self
            .exit_tx
            .send(ExecutorExit {
                swap_hash,
                direction: self.state.contract.direction,
                last_hop: self.state.contract.last_hop,
                reason: ExitReason::Terminal(outcome),
            })
            .await;
        Ok(())
    }

    async fn fatal_storage(&mut self, error: Error) {
        let swap_hash = self.state.contract.swap_hash;
        log::error!(
            "Storage failure on swap {}; freezing swap until restart: {}",
            swap_hash,
            error
        );
        let _ = self
            .exit_tx
            .send(ExecutorExit {
                swap_hash,
                direction: self.state.contract.direction,
                last_hop: self.state.contract.last_hop,
                reason: ExitReason::StorageFailure(error.to_string()),
            })
            .await;
    }

    fn dispatch_payment(
        &mut self,
        kind: PaymentKind,
        bolt11: String,
        amount_limit: u64,
        fee_limit: u64,
    ) {
        if !self.dispatched_payments.insert(bolt11.clone()) {
            return;
        }

        let request = PayRequest {
            bolt11,
            payment_hash: self.state.contract.swap_hash,
            amount_limit,
            fee_limit,
            outgoing_channel: self.state.contract.outgoing_channel,
            last_hop: None,
        };
        let lightning = self.lightning.clone();
        let msgs_tx = self.msgs_tx.clone();
        let retry = self.config.retry.clone();

        self.tasks.push(tokio::spawn(async move {
            let wrap = |result: PaymentResult| match kind {
                PaymentKind::Prepay => SwapEvent::PrepayResult { result },
                PaymentKind::Swap => SwapEvent::SwapPaymentResult { result },
            };

            let mut stream =
                match with_retry(&retry, || lightning.pay_invoice(request.clone())).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        let result = PaymentResult::Failed {
                            reason: e.to_string(),
                        };
                        let _ = msgs_tx.send(ExecutorMsg::Apply(wrap(result))).await;
                        return;
                    }
                };

            while let Some(update) = stream.next().await {
                let result = match update {
                    PaymentUpdate::InFlight => continue,
                    PaymentUpdate::Succeeded {
                        preimage,
                        routing_fee,
                    } => PaymentResult::Succeeded {
                        preimage: Some(preimage),
                        routing_fee,
                    },
                    PaymentUpdate::Failed { reason } => PaymentResult::Failed { reason },
                };
                let _ = msgs_tx.send(ExecutorMsg::Apply(wrap(result))).await;
                break;
            }
        }));
    }

    /// Broadcast the Loop In HTLC funding template. The wallet behind the
    /// chain client funds and signs it; the address watcher picks up the
    /// resulting transaction.
    fn publish_htlc(&mut self) {
        let htlc = match SwapHtlc::from_contract(&self.state.contract) {
            Ok(htlc) => htlc,
            Err(e) => {
                self.enqueue_broadcast_failure(format!("HTLC derivation failed: {}", e));
                return;
            }
        };
        let template = htlc.funding_template(self.state.contract.amount);
        let chain = self.chain.clone();
        let msgs_tx = self.msgs_tx.clone();
        let retry = self.config.retry.clone();

        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = with_retry(&retry, || chain.broadcast(&template)).await {
                let event = SwapEvent::BroadcastFailed {
                    context: format!("HTLC broadcast failed: {}", e),
                };
                let _ = msgs_tx.send(ExecutorMsg::Apply(event)).await;
            }
        }));
    }

    /// Build and broadcast the transaction claiming the HTLC output: the
    /// preimage sweep for Loop Out, the timeout refund for Loop In.
    fn publish_claim(&mut self, role: WatchRole) {
        let contract = &self.state.contract;
        let Some(outpoint) = self.state.htlc_outpoint else {
            // The kernel only requests a claim once the HTLC is known.
            panic!("swap {}: claim requested without an HTLC outpoint", contract.swap_hash);
        };
        let htlc = match SwapHtlc::from_contract(contract) {
            Ok(htlc) => htlc,
            Err(e) => {
                self.enqueue_broadcast_failure(format!("HTLC derivation failed: {}", e));
                return;
            }
        };

        let amount = contract.amount;
        let max_miner_fee = contract.max_miner_fee;
        let payout = contract.payout_script.clone();
        let target = self.config.fee_conf_target;
        let chain = self.chain.clone();
        let msgs_tx = self.msgs_tx.clone();
        let retry = self.config.retry.clone();
        let vsize = match role {
            WatchRole::Refund => REFUND_TX_VSIZE,
            _ => SWEEP_TX_VSIZE,
        };

        self.tasks.push(tokio::spawn(async move {
            let failed = |context: String| ExecutorMsg::Apply(SwapEvent::BroadcastFailed { context });

            let fee_rate = match with_retry(&retry, || chain.estimate_fee(target)).await {
                Ok(rate) => rate,
                Err(e) => {
                    let _ = msgs_tx.send(failed(format!("fee estimate failed: {}", e))).await;
                    return;
                }
            };
            // The miner-fee ceiling is a hard limit: clamp the rate rather
            // than exceed it in a fee spike.
            let fee_rate = fee_rate.min(max_miner_fee / vsize);

            let template = match role {
                WatchRole::Refund => htlc.refund_template(outpoint, amount, fee_rate, payout),
                _ => htlc.sweep_template(outpoint, amount, fee_rate, payout),
            };
            let (tx, fee) = match template {
                Ok(built) => built,
                Err(e) => {
                    let _ = msgs_tx.send(failed(format!("claim template failed: {}", e))).await;
                    return;
                }
            };

            match with_retry(&retry, || chain.broadcast(&tx)).await {
                Ok(txid) => {
                    let event = match role {
                        WatchRole::Refund => SwapEvent::RefundPublished { txid, fee },
                        _ => SwapEvent::SweepPublished { txid, fee },
                    };
                    let _ = msgs_tx.send(ExecutorMsg::Apply(event)).await;
                }
                Err(e) => {
                    let _ = msgs_tx.send(failed(format!("broadcast failed: {}", e))).await;
                }
            }
        }));
    }

    fn watch_htlc(&mut self) {
        let contract = &self.state.contract;
        let htlc = match SwapHtlc::from_contract(contract) {
            Ok(htlc) => htlc,
            Err(e) => {
                self.enqueue_broadcast_failure(format!("HTLC derivation failed: {}", e));
                return;
            }
        };

        let mut scripts = vec![htlc.script_pubkey()];
        if contract.direction == SwapDirection::In
            && contract.protocol_version.supports_native_segwit_in()
        {
            scripts.push(htlc.nested_script_pubkey());
        }

        for script in scripts.clone() {
            self.spawn_watcher(
                WatchRole::Htlc,
                WatchTarget::Script(script),
                self.config.htlc_confirmations,
                scripts.clone(),
            );
        }
    }

    fn spawn_watcher(
        &mut self,
        role: WatchRole,
        target: WatchTarget,
        min_depth: u32,
        expected_scripts: Vec<ScriptBuf>,
    ) {
        let chain = self.chain.clone();
        let msgs_tx = self.msgs_tx.clone();
        let retry = self.config.retry.clone();

        self.tasks.push(tokio::spawn(async move {
            let mut stream = match with_retry(&retry, || {
                chain.subscribe_confirmations(target.clone(), min_depth)
            })
            .await
            {
                Ok(stream) => stream,
                Err(e) => {
                    log::error!("Confirmation subscription failed: {}", e);
                    let _ = msgs_tx.send(ExecutorMsg::WatchClosed(role)).await;
                    return;
                }
            };

            while let Some(event) = stream.next().await {
                let mapped = match (role, event) {
                    (WatchRole::Htlc, ConfirmationEvent::Seen { tx, .. }) => tx
                        .output
                        .iter()
                        .enumerate()
                        .find(|(_, output)| expected_scripts.contains(&output.script_pubkey))
                        .map(|(vout, output)| SwapEvent::HtlcSeen {
                            outpoint: OutPoint {
                                txid: tx.compute_txid(),
                                vout: vout as u32,
                            },
                            value: output.value.to_sat(),
                            script_pubkey: output.script_pubkey.clone(),
                        }),
                    (WatchRole::Htlc, ConfirmationEvent::Confirmed { txid, height }) => {
                        Some(SwapEvent::HtlcConfirmed { txid, height })
                    }
                    (WatchRole::Sweep, ConfirmationEvent::Confirmed { txid, height }) => {
                        Some(SwapEvent::SweepConfirmed { txid, height })
                    }
                    (WatchRole::Refund, ConfirmationEvent::Confirmed { txid, height }) => {
                        Some(SwapEvent::RefundConfirmed { txid, height })
                    }
                    (_, ConfirmationEvent::Reorged { txid }) => Some(SwapEvent::Reorged { txid }),
                    _ => None,
                };
                if let Some(event) = mapped {
                    if msgs_tx.send(ExecutorMsg::Apply(event)).await.is_err() {
                        return;
                    }
                }
            }
            let _ = msgs_tx.send(ExecutorMsg::WatchClosed(role)).await;
        }));
    }

    /// Poll the chain tip and reify it as kernel events.
    fn start_height_ticker(&mut self) {
        let chain = self.chain.clone();
        let msgs_tx = self.msgs_tx.clone();
        let interval = self.config.poll_interval;

        self.tasks.push(tokio::spawn(async move {
            let mut last_height = 0u32;
            loop {
                match chain.current_height().await {
                    Ok(height) if height != last_height => {
                        last_height = height;
                        if msgs_tx
                            .send(ExecutorMsg::Apply(SwapEvent::BlockHeight { height }))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => log::debug!("Height poll failed: {}", e),
                }
                tokio::time::sleep(interval).await;
            }
        }));
    }

    /// Loop In: poll the held invoice until it settles or is cancelled.
    fn start_invoice_poller(&mut self) {
        let lightning = self.lightning.clone();
        let msgs_tx = self.msgs_tx.clone();
        let interval = self.config.poll_interval;
        let swap_hash = self.state.contract.swap_hash;

        self.tasks.push(tokio::spawn(async move {
            loop {
                match lightning.lookup_invoice(swap_hash).await {
                    Ok(InvoiceState::Settled(preimage)) => {
                        let _ = msgs_tx
                            .send(ExecutorMsg::Apply(SwapEvent::InvoiceSettled { preimage }))
                            .await;
                        return;
                    }
                    Ok(InvoiceState::Cancelled) => return,
                    Ok(_) => {}
                    Err(e) => log::debug!("Invoice poll for {} failed: {}", swap_hash, e),
                }
                tokio::time::sleep(interval).await;
            }
        }));
    }

    /// Loop Out: reify the wall-clock publication deadline as an event.
    fn start_deadline_timer(&mut self) {
        let Some(deadline) = self.state.contract.publication_deadline else {
            return;
        };
        // Once the HTLC is confirmed the deadline no longer applies.
        if !matches!(
            self.state.phase,
            SwapPhase::Created
                | SwapPhase::PrepayInFlight
                | SwapPhase::PrepayPaid
                | SwapPhase::HtlcPublished
        ) {
            return;
        }

        let msgs_tx = self.msgs_tx.clone();
        self.tasks.push(tokio::spawn(async move {
            let remaining = deadline - OffsetDateTime::now_utc();
            if remaining.is_positive() {
                tokio::time::sleep(Duration::from_secs_f64(remaining.as_seconds_f64())).await;
            }
            let _ = msgs_tx
                .send(ExecutorMsg::Apply(SwapEvent::PublicationDeadlineExpired))
                .await;
        }));
    }

    fn enqueue_broadcast_failure(&mut self, context: String) {
        let msgs_tx = self.msgs_tx.clone();
        self.tasks.push(tokio::spawn(async move {
            let _ = msgs_tx
                .send(ExecutorMsg::Apply(SwapEvent::BroadcastFailed { context }))
                .await;
        }));
    }
}

/// Retry `op` with exponential backoff on transient errors.
pub(crate) async fn with_retry<T, F, Fut>(config: &RetryConfig, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = config.base_delay;
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                attempt += 1;
                if attempt > config.max_retries {
                    return Err(e);
                }
                log::warn!("Transient error (attempt {}), retrying in {:?}: {}", attempt, delay, e);
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(config.max_delay);
            }
        }
    }
}
