//! End-to-end swap scenarios driven through scripted mock collaborators.
//!
//! Every test runs the real supervisor, executor, kernel and file store; only
//! the chain, lightning and swap-server collaborators are mocked.

use bitcoin::absolute::LockTime;
use bitcoin::secp256k1::PublicKey;
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};
use futures::StreamExt;
use futures::channel::mpsc as channel_mpsc;
use futures::stream::{self, BoxStream};
use loopswap_core::api::{
    LoopInQuote, LoopOutQuote, NewLoopInSwapRequest, NewLoopOutSwapRequest,
    NewLoopInSwapResponse, NewLoopOutSwapResponse, ServerFuture, SwapServer, SwapTerms,
};
use loopswap_core::chain::{ChainClient, ChainFuture, ConfirmationEvent, WatchTarget};
use loopswap_core::executor::{ExecutorConfig, RetryConfig};
use loopswap_core::htlc::SwapHtlc;
use loopswap_core::kernel::KernelConfig;
use loopswap_core::lightning::{
    InvoiceState, LightningClient, LightningFuture, PayRequest, PaymentUpdate,
};
use loopswap_core::policy::{PolicyConfig, SwapLimits};
use loopswap_core::store::{FileSwapStore, SwapStore};
use loopswap_core::supervisor::{LoopInRequest, LoopOutRequest, Supervisor, SupervisorConfig};
use loopswap_core::types::{
    HtlcBroadcaster, Network, Preimage, ProtocolVersion, SwapHash, SwapStatus,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

const CLIENT_KEY: &str = "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798";
const SERVER_KEY: &str = "02c6047f9441ed7d6d3045406e95c07cd85c778e4b8cef3ca7abac09b95c709ee5";
const PEER_KEY: &str = "02f9308a019258c31049344f85f89d5229b531c845836f99b08601f113bce036f9";

const SWAP_INVOICE: &str = "lnbcrt1mockswapinvoice";
const PREPAY_INVOICE: &str = "lnbcrt1mockprepayinvoice";

const START_HEIGHT: u32 = 1000;

fn client_key() -> PublicKey {
    PublicKey::from_str(CLIENT_KEY).unwrap()
}

fn server_key() -> PublicKey {
    PublicKey::from_str(SERVER_KEY).unwrap()
}

fn payout_script() -> ScriptBuf {
    // Arbitrary P2WPKH-shaped destination.
    ScriptBuf::from_bytes(vec![0x00, 0x14, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7])
}

/// A transaction with one output paying `script` the given amount.
fn tx_paying(script: ScriptBuf, value: u64) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
            witness: Witness::default(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(value),
            script_pubkey: script,
        }],
    }
}

// ============================================================================
// Mock collaborators
// ============================================================================

struct MockChain {
    height: Arc<AtomicU32>,
    fee_rate: u64,
    /// Minimum height reported by auto-confirmations.
    confirm_floor: Arc<AtomicU32>,
    script_watchers: Mutex<HashMap<ScriptBuf, Vec<channel_mpsc::UnboundedSender<ConfirmationEvent>>>>,
    /// Scripted confirmation sequences for specific transactions.
    tx_scripts: Mutex<HashMap<Txid, Vec<ConfirmationEvent>>>,
    broadcasts: Mutex<Vec<Transaction>>,
}

impl MockChain {
    fn new(height: u32, fee_rate: u64) -> Arc<Self> {
        Arc::new(Self {
            height: Arc::new(AtomicU32::new(height)),
            fee_rate,
            confirm_floor: Arc::new(AtomicU32::new(0)),
            script_watchers: Mutex::new(HashMap::new()),
            tx_scripts: Mutex::new(HashMap::new()),
            broadcasts: Mutex::new(Vec::new()),
        })
    }

    fn set_height(&self, height: u32) {
        self.height.store(height, Ordering::SeqCst);
    }

    fn set_confirm_floor(&self, height: u32) {
        self.confirm_floor.store(height, Ordering::SeqCst);
    }

    fn script_tx_events(&self, txid: Txid, events: Vec<ConfirmationEvent>) {
        self.tx_scripts.lock().unwrap().insert(txid, events);
    }

    fn broadcast_count(&self, txid: Txid) -> usize {
        self.broadcasts
            .lock()
            .unwrap()
            .iter()
            .filter(|tx| tx.compute_txid() == txid)
            .count()
    }

    /// Deliver an event to the watcher of `script`, waiting until the
    /// executor has subscribed.
    async fn push_script_event(&self, script: &ScriptBuf, event: ConfirmationEvent) {
        for _ in 0..500 {
            {
                let watchers = self.script_watchers.lock().unwrap();
                if let Some(senders) = watchers.get(script) {
                    if !senders.is_empty() {
                        for sender in senders {
                            let _ = sender.unbounded_send(event.clone());
                        }
                        return;
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no watcher subscribed to script within timeout");
    }

    async fn wait_for_broadcast(&self, pred: impl Fn(&Transaction) -> bool) -> Transaction {
        for _ in 0..500 {
            {
                let broadcasts = self.broadcasts.lock().unwrap();
                if let Some(tx) = broadcasts.iter().find(|tx| pred(tx)) {
                    return tx.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected broadcast did not happen within timeout");
    }
}

impl ChainClient for MockChain {
    fn current_height(&self) -> ChainFuture<'_, u32> {
        let height = self.height.load(Ordering::SeqCst);
        Box::pin(async move { Ok(height) })
    }

    fn broadcast(&self, tx: &Transaction) -> ChainFuture<'_, Txid> {
        let txid = tx.compute_txid();
        self.broadcasts.lock().unwrap().push(tx.clone());
        Box::pin(async move { Ok(txid) })
    }

    fn subscribe_confirmations(
        &self,
        target: WatchTarget,
        _min_depth: u32,
    ) -> ChainFuture<'_, BoxStream<'static, ConfirmationEvent>> {
        let stream: BoxStream<'static, ConfirmationEvent> = match target {
            WatchTarget::Script(script) => {
                let (sender, receiver) = channel_mpsc::unbounded();
                self.script_watchers
                    .lock()
                    .unwrap()
                    .entry(script)
                    .or_default()
                    .push(sender);
                receiver.boxed()
            }
            WatchTarget::Transaction(txid) => {
                let scripted = self.tx_scripts.lock().unwrap().remove(&txid);
                match scripted {
                    Some(events) => stream::iter(events).boxed(),
                    None => {
                        let height = self.height.clone();
                        let floor = self.confirm_floor.clone();
                        stream::once(async move {
                            tokio::time::sleep(Duration::from_millis(40)).await;
                            ConfirmationEvent::Confirmed {
                                txid,
                                height: (height.load(Ordering::SeqCst) + 1)
                                    .max(floor.load(Ordering::SeqCst)),
                            }
                        })
                        .boxed()
                    }
                }
            }
        };
        Box::pin(async move { Ok(stream) })
    }

    fn estimate_fee(&self, _target_blocks: u32) -> ChainFuture<'_, u64> {
        let rate = self.fee_rate;
        Box::pin(async move { Ok(rate) })
    }
}

#[derive(Clone)]
enum PaymentScript {
    Succeed {
        preimage: Preimage,
        routing_fee: u64,
    },
    Fail(String),
    Hang,
}

#[derive(Default)]
struct MockLightning {
    scripts: Mutex<HashMap<String, PaymentScript>>,
    dispatched: Mutex<Vec<PayRequest>>,
    added_invoices: Mutex<Vec<(u64, SwapHash, u32)>>,
    invoice_states: Mutex<HashMap<SwapHash, InvoiceState>>,
    cancelled: Mutex<Vec<SwapHash>>,
}

impl MockLightning {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn script_payment(&self, bolt11: &str, script: PaymentScript) {
        self.scripts.lock().unwrap().insert(bolt11.to_string(), script);
    }

    fn dispatched_invoices(&self) -> Vec<String> {
        self.dispatched
            .lock()
            .unwrap()
            .iter()
            .map(|request| request.bolt11.clone())
            .collect()
    }

    fn cancelled_invoices(&self) -> Vec<SwapHash> {
        self.cancelled.lock().unwrap().clone()
    }
}

impl LightningClient for MockLightning {
    fn add_invoice(
        &self,
        amount: u64,
        preimage_hash: SwapHash,
        cltv_delta: u32,
    ) -> LightningFuture<'_, String> {
        self.added_invoices
            .lock()
            .unwrap()
            .push((amount, preimage_hash, cltv_delta));
        self.invoice_states
            .lock()
            .unwrap()
            .insert(preimage_hash, InvoiceState::Open);
        let bolt11 = format!("lnbcrt1held{}", preimage_hash);
        Box::pin(async move { Ok(bolt11) })
    }

    fn pay_invoice(
        &self,
        request: PayRequest,
    ) -> LightningFuture<'_, BoxStream<'static, PaymentUpdate>> {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(&request.bolt11)
            .cloned()
            .unwrap_or(PaymentScript::Fail("no route".to_string()));
        self.dispatched.lock().unwrap().push(request);

        let stream: BoxStream<'static, PaymentUpdate> = match script {
            PaymentScript::Succeed {
                preimage,
                routing_fee,
            } => stream::iter(vec![
                PaymentUpdate::InFlight,
                PaymentUpdate::Succeeded {
                    preimage,
                    routing_fee,
                },
            ])
            .boxed(),
            PaymentScript::Fail(reason) => {
                stream::iter(vec![PaymentUpdate::Failed { reason }]).boxed()
            }
            PaymentScript::Hang => stream::pending().boxed(),
        };
        Box::pin(async move { Ok(stream) })
    }

    fn lookup_invoice(&self, preimage_hash: SwapHash) -> LightningFuture<'_, InvoiceState> {
        let state = self
            .invoice_states
            .lock()
            .unwrap()
            .get(&preimage_hash)
            .cloned()
            .unwrap_or(InvoiceState::Open);
        Box::pin(async move { Ok(state) })
    }

    fn settle_invoice(&self, preimage: Preimage) -> LightningFuture<'_, ()> {
        self.invoice_states
            .lock()
            .unwrap()
            .insert(preimage.hash(), InvoiceState::Settled(preimage));
        Box::pin(async move { Ok(()) })
    }

    fn cancel_invoice(&self, preimage_hash: SwapHash) -> LightningFuture<'_, ()> {
        self.cancelled.lock().unwrap().push(preimage_hash);
        self.invoice_states
            .lock()
            .unwrap()
            .insert(preimage_hash, InvoiceState::Cancelled);
        Box::pin(async move { Ok(()) })
    }
}

struct MockServer {
    out_quote: Mutex<LoopOutQuote>,
    in_quote_fee: u64,
    expiry: u32,
    out_requests: Mutex<Vec<NewLoopOutSwapRequest>>,
    in_requests: Mutex<Vec<NewLoopInSwapRequest>>,
    /// Preimages behind the hashes committed in Loop In quotes.
    in_preimages: Mutex<Vec<Preimage>>,
}

impl MockServer {
    fn new(expiry: u32) -> Arc<Self> {
        Arc::new(Self {
            out_quote: Mutex::new(LoopOutQuote {
                swap_fee: 1000,
                prepay_amount: 3000,
                miner_fee: 150,
            }),
            in_quote_fee: 500,
            expiry,
            out_requests: Mutex::new(Vec::new()),
            in_requests: Mutex::new(Vec::new()),
            in_preimages: Mutex::new(Vec::new()),
        })
    }

    fn set_out_quote(&self, quote: LoopOutQuote) {
        *self.out_quote.lock().unwrap() = quote;
    }

    fn out_request_count(&self) -> usize {
        self.out_requests.lock().unwrap().len()
    }
}

impl SwapServer for MockServer {
    fn loop_out_terms(&self) -> ServerFuture<'_, SwapTerms> {
        Box::pin(async move {
            Ok(SwapTerms {
                min_swap_amount: 10_000,
                max_swap_amount: 10_000_000,
            })
        })
    }

    fn loop_out_quote(&self, _amount: u64) -> ServerFuture<'_, LoopOutQuote> {
        let quote = self.out_quote.lock().unwrap().clone();
        Box::pin(async move { Ok(quote) })
    }

    fn new_loop_out_swap(
        &self,
        request: NewLoopOutSwapRequest,
    ) -> ServerFuture<'_, NewLoopOutSwapResponse> {
        self.out_requests.lock().unwrap().push(request);
        let response = NewLoopOutSwapResponse {
            swap_invoice: SWAP_INVOICE.to_string(),
            prepay_invoice: PREPAY_INVOICE.to_string(),
            sender_key: server_key(),
            expiry: self.expiry,
        };
        Box::pin(async move { Ok(response) })
    }

    fn loop_in_terms(&self) -> ServerFuture<'_, SwapTerms> {
        Box::pin(async move {
            Ok(SwapTerms {
                min_swap_amount: 10_000,
                max_swap_amount: 10_000_000,
            })
        })
    }

    fn loop_in_quote(&self, _amount: u64) -> ServerFuture<'_, LoopInQuote> {
        let preimage = Preimage::generate();
        self.in_preimages.lock().unwrap().push(preimage);
        let quote = LoopInQuote {
            swap_fee: self.in_quote_fee,
            miner_fee: 150,
            swap_hash: preimage.hash(),
        };
        Box::pin(async move { Ok(quote) })
    }

    fn new_loop_in_swap(
        &self,
        request: NewLoopInSwapRequest,
    ) -> ServerFuture<'_, NewLoopInSwapResponse> {
        self.in_requests.lock().unwrap().push(request);
        let response = NewLoopInSwapResponse {
            receiver_key: server_key(),
            expiry: self.expiry,
        };
        Box::pin(async move { Ok(response) })
    }
}

// ============================================================================
// Harness
// ============================================================================

fn temp_root() -> PathBuf {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    std::env::temp_dir().join(format!(
        "loopswap-scenario-{}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::SeqCst)
    ))
}

fn test_config() -> SupervisorConfig {
    SupervisorConfig {
        network: Network::Regtest,
        max_active_swaps: 8,
        max_loop_in_per_peer: 2,
        cltv_safety_margin: 10,
        publication_window: Duration::from_secs(60),
        loop_in_cltv_delta: 144,
        policy: PolicyConfig::default(),
        executor: ExecutorConfig {
            htlc_confirmations: 1,
            sweep_confirmations: 1,
            fee_conf_target: 6,
            poll_interval: Duration::from_millis(10),
            retry: RetryConfig {
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                max_retries: 2,
            },
            kernel: KernelConfig::default(),
        },
    }
}

struct Harness {
    chain: Arc<MockChain>,
    lightning: Arc<MockLightning>,
    server: Arc<MockServer>,
    store: Arc<FileSwapStore>,
    root: PathBuf,
    supervisor: Arc<Supervisor<MockChain, MockLightning, FileSwapStore, MockServer>>,
}

impl Harness {
    fn new(
        expiry: u32,
        mutate: impl FnOnce(&mut SupervisorConfig),
    ) -> (Self, broadcast::Receiver<SwapStatus>) {
        Self::with_root(temp_root(), expiry, mutate)
    }

    fn with_root(
        root: PathBuf,
        expiry: u32,
        mutate: impl FnOnce(&mut SupervisorConfig),
    ) -> (Self, broadcast::Receiver<SwapStatus>) {
        let chain = MockChain::new(START_HEIGHT, 5);
        let lightning = MockLightning::new();
        let server = MockServer::new(expiry);
        let store = Arc::new(FileSwapStore::open(&root).unwrap());

        let mut config = test_config();
        mutate(&mut config);

        let supervisor = Supervisor::new(
            chain.clone(),
            lightning.clone(),
            store.clone(),
            server.clone(),
            config,
        );
        let status_rx = supervisor.subscribe();

        (
            Self {
                chain,
                lightning,
                server,
                store,
                root,
                supervisor,
            },
            status_rx,
        )
    }

    fn loop_out_request(&self) -> LoopOutRequest {
        LoopOutRequest {
            amount: 500_000,
            receiver_key: client_key(),
            payout_script: payout_script(),
            limits: SwapLimits {
                max_swap_fee: Some(1000),
                max_prepay_amount: Some(3000),
                max_swap_routing_fee: Some(400),
                max_prepay_routing_fee: Some(100),
                max_miner_fee: None,
            },
            protocol_version: ProtocolVersion::MultiPart,
            outgoing_channel: None,
        }
    }

    /// The on-chain HTLC for a Loop Out swap as the server must publish it.
    fn loop_out_htlc(&self, swap_hash: SwapHash) -> SwapHtlc {
        SwapHtlc::new(
            server_key(),
            client_key(),
            swap_hash,
            self.server.expiry,
            bitcoin::Network::Regtest,
        )
        .unwrap()
    }

    /// Wait until the swap's terminal record is committed to the store.
    async fn wait_terminal_committed(&self, swap_hash: SwapHash) {
        let path = self.root.join(swap_hash.to_hex()).join("terminal.json");
        for _ in 0..500 {
            if path.exists() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("terminal record for {} not committed within timeout", swap_hash);
    }

    fn terminal_record(&self, swap_hash: SwapHash) -> String {
        std::fs::read_to_string(self.root.join(swap_hash.to_hex()).join("terminal.json")).unwrap()
    }
}

/// The client-generated preimage, read back from the swap's first durable
/// snapshot (the mocks cannot know it otherwise).
async fn stored_preimage(root: &Path, swap_hash: SwapHash) -> Preimage {
    let path = root.join(swap_hash.to_hex()).join("events.log");
    for _ in 0..500 {
        if let Ok(data) = std::fs::read_to_string(&path) {
            if let Some(line) = data.lines().next() {
                let value: serde_json::Value = serde_json::from_str(line).unwrap();
                if let Some(hex) = value["state"]["preimage"].as_str() {
                    let bytes: [u8; 32] = hex::decode(hex).unwrap().try_into().unwrap();
                    return Preimage(bytes);
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("preimage for {} not persisted within timeout", swap_hash);
}

async fn wait_for_phase(
    status_rx: &mut broadcast::Receiver<SwapStatus>,
    swap_hash: SwapHash,
    phase: &str,
) -> SwapStatus {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let status = status_rx.recv().await.expect("status stream closed");
            if status.swap_hash == swap_hash && status.phase == phase {
                return status;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("swap {} never reached phase {}", swap_hash, phase))
}

// ============================================================================
// Scenarios
// ============================================================================

/// Loop Out happy path: prepay, server HTLC, swap payment, sweep.
#[tokio::test]
async fn loop_out_happy_path() {
    let (harness, mut status_rx) = Harness::new(1120, |_| {});
    harness.lightning.script_payment(
        PREPAY_INVOICE,
        PaymentScript::Succeed {
            preimage: Preimage([9; 32]),
            routing_fee: 2,
        },
    );

    let swap_hash = harness
        .supervisor
        .loop_out(harness.loop_out_request())
        .await
        .unwrap();

    let preimage = stored_preimage(&harness.root, swap_hash).await;
    assert_eq!(preimage.hash(), swap_hash);
    harness.lightning.script_payment(
        SWAP_INVOICE,
        PaymentScript::Succeed {
            preimage,
            routing_fee: 4,
        },
    );

    // The server HTLC appears on chain and confirms.
    let htlc = harness.loop_out_htlc(swap_hash);
    let htlc_tx = tx_paying(htlc.script_pubkey(), 500_000);
    harness
        .chain
        .push_script_event(
            &htlc.script_pubkey(),
            ConfirmationEvent::Seen {
                tx: htlc_tx.clone(),
                height: 1001,
            },
        )
        .await;
    harness
        .chain
        .push_script_event(
            &htlc.script_pubkey(),
            ConfirmationEvent::Confirmed {
                txid: htlc_tx.compute_txid(),
                height: 1003,
            },
        )
        .await;

    let status = wait_for_phase(&mut status_rx, swap_hash, "succeeded").await;
    let costs = status.costs.expect("terminal status must report costs");
    assert_eq!(costs.offchain, 6);
    assert_eq!(costs.server, 1000);
    assert_eq!(costs.onchain, 800);
    // Total spend stays under the negotiated ceilings.
    assert!(costs.total() <= 1000 + 15_000 + 400 + 100);

    harness.wait_terminal_committed(swap_hash).await;
    assert!(harness.terminal_record(swap_hash).contains("succeeded"));
    assert!(harness.store.load_all().await.unwrap().is_empty());
}

/// A quote above the declared limit is rejected before any external action.
#[tokio::test]
async fn loop_out_quote_rejection() {
    let (harness, _status_rx) = Harness::new(1120, |_| {});
    harness.server.set_out_quote(LoopOutQuote {
        swap_fee: 2000,
        prepay_amount: 3000,
        miner_fee: 150,
    });

    let err = harness
        .supervisor
        .loop_out(harness.loop_out_request())
        .await
        .expect_err("quote above the limit must be rejected");
    assert!(matches!(
        err,
        loopswap_core::Error::QuoteExceedsLimit { field: "swap_fee", quoted: 2000, limit: 1000 }
    ));

    // Nothing was asked of the server, the node or the chain.
    assert_eq!(harness.server.out_request_count(), 0);
    assert!(harness.lightning.dispatched_invoices().is_empty());
    assert!(harness.chain.broadcasts.lock().unwrap().is_empty());
    assert!(harness.store.load_all().await.unwrap().is_empty());
}

/// Loop In whose invoice is never settled refunds after the safety margin.
#[tokio::test]
async fn loop_in_refund_path() {
    let (harness, mut status_rx) = Harness::new(1144, |_| {});
    harness.chain.set_confirm_floor(1144);

    let swap_hash = harness
        .supervisor
        .loop_in(LoopInRequest {
            amount: 1_000_000,
            sender_key: client_key(),
            payout_script: payout_script(),
            limits: SwapLimits {
                max_swap_fee: Some(500),
                ..Default::default()
            },
            protocol_version: ProtocolVersion::NativeSegwitIn,
            last_hop: None,
            htlc_broadcaster: HtlcBroadcaster::Internal,
        })
        .await
        .unwrap();

    // The held invoice is for the principal minus the server fee.
    {
        let added = harness.lightning.added_invoices.lock().unwrap();
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].0, 1_000_000 - 500);
        assert_eq!(added[0].1, swap_hash);
    }

    // The executor broadcasts the HTLC funding template; the wallet-funded
    // transaction is then observed on chain.
    let funding = harness
        .chain
        .wait_for_broadcast(|tx| {
            tx.output
                .iter()
                .any(|output| output.value == Amount::from_sat(1_000_000))
        })
        .await;
    let htlc_script = funding.output[0].script_pubkey.clone();
    harness
        .chain
        .push_script_event(
            &htlc_script,
            ConfirmationEvent::Seen {
                tx: funding.clone(),
                height: 1001,
            },
        )
        .await;
    harness
        .chain
        .push_script_event(
            &htlc_script,
            ConfirmationEvent::Confirmed {
                txid: funding.compute_txid(),
                height: 1002,
            },
        )
        .await;
    wait_for_phase(&mut status_rx, swap_hash, "htlc_confirmed").await;

    // The server never settles; the chain reaches expiry minus the margin.
    harness.chain.set_height(1144 - 6);

    let status = wait_for_phase(&mut status_rx, swap_hash, "refunded").await;
    let costs = status.costs.unwrap();
    assert_eq!(costs.server, 0);
    assert_eq!(costs.offchain, 0);
    // Refund miner fee at 5 sat/vb over the refund size estimate.
    assert_eq!(costs.onchain, 750);

    // The refund transaction is locked to the HTLC expiry.
    let refund = harness
        .chain
        .wait_for_broadcast(|tx| tx.lock_time == LockTime::from_height(1144).unwrap())
        .await;
    assert_eq!(refund.output[0].script_pubkey, payout_script());

    // The held invoice was released.
    assert_eq!(harness.lightning.cancelled_invoices(), vec![swap_hash]);

    harness.wait_terminal_committed(swap_hash).await;
    assert!(harness.terminal_record(swap_hash).contains("refunded"));
}

/// A reorg after sweep confirmation regresses the swap, re-broadcasts, and
/// succeeds again without double-counting costs.
#[tokio::test]
async fn reorg_during_sweep_reconfirms() {
    let (harness, mut status_rx) = Harness::new(1120, |_| {});
    harness.lightning.script_payment(
        PREPAY_INVOICE,
        PaymentScript::Succeed {
            preimage: Preimage([9; 32]),
            routing_fee: 2,
        },
    );

    let swap_hash = harness
        .supervisor
        .loop_out(harness.loop_out_request())
        .await
        .unwrap();
    let preimage = stored_preimage(&harness.root, swap_hash).await;
    harness.lightning.script_payment(
        SWAP_INVOICE,
        PaymentScript::Succeed {
            preimage,
            routing_fee: 4,
        },
    );

    // Precompute the sweep txid so its confirmation stream can be scripted:
    // confirm, reorg, confirm again.
    let htlc = harness.loop_out_htlc(swap_hash);
    let htlc_tx = tx_paying(htlc.script_pubkey(), 500_000);
    let outpoint = OutPoint {
        txid: htlc_tx.compute_txid(),
        vout: 0,
    };
    let (sweep_tx, _fee) = htlc
        .sweep_template(outpoint, 500_000, 5, payout_script())
        .unwrap();
    let sweep_txid = sweep_tx.compute_txid();
    harness.chain.script_tx_events(
        sweep_txid,
        vec![
            ConfirmationEvent::Confirmed {
                txid: sweep_txid,
                height: 1005,
            },
            ConfirmationEvent::Reorged { txid: sweep_txid },
            ConfirmationEvent::Confirmed {
                txid: sweep_txid,
                height: 1007,
            },
        ],
    );

    harness
        .chain
        .push_script_event(
            &htlc.script_pubkey(),
            ConfirmationEvent::Seen {
                tx: htlc_tx.clone(),
                height: 1001,
            },
        )
        .await;
    harness
        .chain
        .push_script_event(
            &htlc.script_pubkey(),
            ConfirmationEvent::Confirmed {
                txid: htlc_tx.compute_txid(),
                height: 1003,
            },
        )
        .await;

    // First confirmation, the reorg regression, then the re-confirmation.
    wait_for_phase(&mut status_rx, swap_hash, "succeeded").await;
    wait_for_phase(&mut status_rx, swap_hash, "sweeping").await;
    let status = wait_for_phase(&mut status_rx, swap_hash, "succeeded").await;

    // No duplicate cost accounting across the re-broadcast.
    assert_eq!(status.costs.unwrap().onchain, 800);

    harness.wait_terminal_committed(swap_hash).await;
    // The same sweep was broadcast twice.
    for _ in 0..100 {
        if harness.chain.broadcast_count(sweep_txid) == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(harness.chain.broadcast_count(sweep_txid), 2);
}

/// Crash between prepay and HTLC publication; the restarted process resumes
/// from durable state and completes the swap.
#[tokio::test]
async fn restart_resumes_mid_swap() {
    let root = temp_root();

    // First process: swap reaches PrepayPaid, then the process dies.
    let swap_hash = {
        let (harness, mut status_rx) = Harness::with_root(root.clone(), 1120, |_| {});
        harness.lightning.script_payment(
            PREPAY_INVOICE,
            PaymentScript::Succeed {
                preimage: Preimage([9; 32]),
                routing_fee: 2,
            },
        );
        let swap_hash = harness
            .supervisor
            .loop_out(harness.loop_out_request())
            .await
            .unwrap();
        wait_for_phase(&mut status_rx, swap_hash, "prepay_paid").await;
        harness.supervisor.shutdown();
        swap_hash
    };

    // Second process over the same store.
    let (harness, mut status_rx) = Harness::with_root(root, 1120, |_| {});
    let resumed = harness.supervisor.resume().await.unwrap();
    assert_eq!(resumed, 1);
    assert_eq!(
        harness.supervisor.swap_status(swap_hash).unwrap().phase,
        "prepay_paid"
    );
    // The prepay already resolved before the crash; it is not re-dispatched.
    assert!(harness.lightning.dispatched_invoices().is_empty());

    let preimage = stored_preimage(&harness.root, swap_hash).await;
    harness.lightning.script_payment(
        SWAP_INVOICE,
        PaymentScript::Succeed {
            preimage,
            routing_fee: 4,
        },
    );

    // The re-opened confirmation subscription picks up the server HTLC.
    let htlc = harness.loop_out_htlc(swap_hash);
    let htlc_tx = tx_paying(htlc.script_pubkey(), 500_000);
    harness
        .chain
        .push_script_event(
            &htlc.script_pubkey(),
            ConfirmationEvent::Seen {
                tx: htlc_tx.clone(),
                height: 1004,
            },
        )
        .await;
    harness
        .chain
        .push_script_event(
            &htlc.script_pubkey(),
            ConfirmationEvent::Confirmed {
                txid: htlc_tx.compute_txid(),
                height: 1006,
            },
        )
        .await;

    let status = wait_for_phase(&mut status_rx, swap_hash, "succeeded").await;
    assert_eq!(status.costs.unwrap().offchain, 6);
    harness.wait_terminal_committed(swap_hash).await;
}

/// Crash right after a Loop In starts: the funding broadcast was durably
/// recorded first, so the restarted process only watches the chain instead
/// of handing the wallet a second funding template.
#[tokio::test]
async fn loop_in_restart_does_not_rebroadcast_htlc() {
    let root = temp_root();

    // First process: the swap reaches HtlcPublishing and the funding
    // template goes out, then the process dies.
    let (swap_hash, server_preimage, funding) = {
        let (harness, mut status_rx) = Harness::with_root(root.clone(), 1144, |_| {});
        let swap_hash = harness
            .supervisor
            .loop_in(LoopInRequest {
                amount: 1_000_000,
                sender_key: client_key(),
                payout_script: payout_script(),
                limits: SwapLimits::default(),
                protocol_version: ProtocolVersion::NativeSegwitIn,
                last_hop: None,
                htlc_broadcaster: HtlcBroadcaster::Internal,
            })
            .await
            .unwrap();
        wait_for_phase(&mut status_rx, swap_hash, "htlc_publishing").await;
        let funding = harness
            .chain
            .wait_for_broadcast(|tx| {
                tx.output
                    .iter()
                    .any(|output| output.value == Amount::from_sat(1_000_000))
            })
            .await;
        let server_preimage = {
            let preimages = harness.server.in_preimages.lock().unwrap();
            *preimages.first().unwrap()
        };
        harness.supervisor.shutdown();
        (swap_hash, server_preimage, funding)
    };

    // Second process over the same store.
    let (harness, mut status_rx) = Harness::with_root(root, 1144, |_| {});
    assert_eq!(harness.supervisor.resume().await.unwrap(), 1);
    assert_eq!(
        harness.supervisor.swap_status(swap_hash).unwrap().phase,
        "htlc_publishing"
    );

    // No second funding broadcast.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(harness.chain.broadcasts.lock().unwrap().is_empty());

    // The re-opened watcher picks up the HTLC the first process funded.
    let htlc_script = funding.output[0].script_pubkey.clone();
    harness
        .chain
        .push_script_event(
            &htlc_script,
            ConfirmationEvent::Seen {
                tx: funding.clone(),
                height: 1001,
            },
        )
        .await;
    harness
        .chain
        .push_script_event(
            &htlc_script,
            ConfirmationEvent::Confirmed {
                txid: funding.compute_txid(),
                height: 1002,
            },
        )
        .await;
    wait_for_phase(&mut status_rx, swap_hash, "htlc_confirmed").await;

    harness
        .lightning
        .invoice_states
        .lock()
        .unwrap()
        .insert(swap_hash, InvoiceState::Settled(server_preimage));
    wait_for_phase(&mut status_rx, swap_hash, "invoice_settled").await;
    harness.wait_terminal_committed(swap_hash).await;
    assert!(harness.terminal_record(swap_hash).contains("succeeded"));
}

/// The server publishes an output under a different hash: the watcher never
/// matches it, and the swap fails at the publication deadline having paid
/// nothing but the prepay.
#[tokio::test]
async fn preimage_mismatch_attack_times_out() {
    let (harness, mut status_rx) = Harness::new(1120, |config| {
        config.publication_window = Duration::from_millis(300);
    });
    harness.lightning.script_payment(
        PREPAY_INVOICE,
        PaymentScript::Succeed {
            preimage: Preimage([9; 32]),
            routing_fee: 2,
        },
    );

    let swap_hash = harness
        .supervisor
        .loop_out(harness.loop_out_request())
        .await
        .unwrap();

    // An output under a different hash pays a different script; it never
    // matches the watched HTLC.
    let attacker_htlc = SwapHtlc::new(
        server_key(),
        client_key(),
        Preimage([0xee; 32]).hash(),
        1120,
        bitcoin::Network::Regtest,
    )
    .unwrap();
    let htlc = harness.loop_out_htlc(swap_hash);
    harness
        .chain
        .push_script_event(
            &htlc.script_pubkey(),
            ConfirmationEvent::Seen {
                tx: tx_paying(attacker_htlc.script_pubkey(), 500_000),
                height: 1001,
            },
        )
        .await;

    wait_for_phase(&mut status_rx, swap_hash, "failed").await;
    harness.wait_terminal_committed(swap_hash).await;
    assert!(
        harness
            .terminal_record(swap_hash)
            .contains("insufficient_confirmations")
    );

    // Only the no-show penalty was ever paid.
    assert_eq!(
        harness.lightning.dispatched_invoices(),
        vec![PREPAY_INVOICE.to_string()]
    );
}

/// A Loop In whose invoice settles completes as a success.
#[tokio::test]
async fn loop_in_settles_when_server_pays() {
    let (harness, mut status_rx) = Harness::new(1144, |_| {});

    let swap_hash = harness
        .supervisor
        .loop_in(LoopInRequest {
            amount: 1_000_000,
            sender_key: client_key(),
            payout_script: payout_script(),
            limits: SwapLimits::default(),
            protocol_version: ProtocolVersion::NativeSegwitIn,
            last_hop: None,
            htlc_broadcaster: HtlcBroadcaster::Internal,
        })
        .await
        .unwrap();

    let funding = harness
        .chain
        .wait_for_broadcast(|tx| {
            tx.output
                .iter()
                .any(|output| output.value == Amount::from_sat(1_000_000))
        })
        .await;
    let htlc_script = funding.output[0].script_pubkey.clone();
    harness
        .chain
        .push_script_event(
            &htlc_script,
            ConfirmationEvent::Seen {
                tx: funding.clone(),
                height: 1001,
            },
        )
        .await;
    harness
        .chain
        .push_script_event(
            &htlc_script,
            ConfirmationEvent::Confirmed {
                txid: funding.compute_txid(),
                height: 1002,
            },
        )
        .await;
    wait_for_phase(&mut status_rx, swap_hash, "htlc_confirmed").await;

    // The server, having seen the confirmed HTLC, settles the held invoice.
    let server_preimage = {
        let preimages = harness.server.in_preimages.lock().unwrap();
        *preimages.first().unwrap()
    };
    harness
        .lightning
        .invoice_states
        .lock()
        .unwrap()
        .insert(swap_hash, InvoiceState::Settled(server_preimage));

    let status = wait_for_phase(&mut status_rx, swap_hash, "invoice_settled").await;
    assert_eq!(status.costs.unwrap().server, 500);

    harness.wait_terminal_committed(swap_hash).await;
    assert!(harness.terminal_record(swap_hash).contains("succeeded"));
}

/// Cancelling before the point of no return fails the swap benignly; after
/// it, cancellation is rejected and the swap continues.
#[tokio::test]
async fn cancel_respects_point_of_no_return() {
    let (harness, mut status_rx) = Harness::new(1120, |_| {});
    // Prepay hangs so the swap sits before its point of no return.
    harness
        .lightning
        .script_payment(PREPAY_INVOICE, PaymentScript::Hang);

    let swap_hash = harness
        .supervisor
        .loop_out(harness.loop_out_request())
        .await
        .unwrap();
    wait_for_phase(&mut status_rx, swap_hash, "prepay_in_flight").await;

    harness.supervisor.cancel_swap(swap_hash).await.unwrap();
    wait_for_phase(&mut status_rx, swap_hash, "failed").await;
    harness.wait_terminal_committed(swap_hash).await;
    assert!(harness.terminal_record(swap_hash).contains("user_cancelled"));
}

#[tokio::test]
async fn cancel_after_point_of_no_return_is_rejected() {
    let (harness, mut status_rx) = Harness::new(1120, |_| {});
    harness.lightning.script_payment(
        PREPAY_INVOICE,
        PaymentScript::Succeed {
            preimage: Preimage([9; 32]),
            routing_fee: 2,
        },
    );
    // The swap payment hangs, holding the swap in HtlcConfirmed.
    harness
        .lightning
        .script_payment(SWAP_INVOICE, PaymentScript::Hang);

    let swap_hash = harness
        .supervisor
        .loop_out(harness.loop_out_request())
        .await
        .unwrap();

    let htlc = harness.loop_out_htlc(swap_hash);
    let htlc_tx = tx_paying(htlc.script_pubkey(), 500_000);
    harness
        .chain
        .push_script_event(
            &htlc.script_pubkey(),
            ConfirmationEvent::Seen {
                tx: htlc_tx.clone(),
                height: 1001,
            },
        )
        .await;
    harness
        .chain
        .push_script_event(
            &htlc.script_pubkey(),
            ConfirmationEvent::Confirmed {
                txid: htlc_tx.compute_txid(),
                height: 1003,
            },
        )
        .await;
    wait_for_phase(&mut status_rx, swap_hash, "htlc_confirmed").await;

    let err = harness
        .supervisor
        .cancel_swap(swap_hash)
        .await
        .expect_err("cancel past the point of no return must be rejected");
    assert!(matches!(err, loopswap_core::Error::PastPointOfNoReturn));
}

/// The global concurrency bound rejects excess swaps.
#[tokio::test]
async fn global_swap_bound_enforced() {
    let (harness, _status_rx) = Harness::new(1120, |config| {
        config.max_active_swaps = 1;
    });
    harness
        .lightning
        .script_payment(PREPAY_INVOICE, PaymentScript::Hang);

    harness
        .supervisor
        .loop_out(harness.loop_out_request())
        .await
        .unwrap();
    let err = harness
        .supervisor
        .loop_out(harness.loop_out_request())
        .await
        .expect_err("second swap must hit the global bound");
    assert!(matches!(err, loopswap_core::Error::SwapLimitReached(_)));
}

/// The per-peer Loop In bound prevents griefing through one peer.
#[tokio::test]
async fn per_peer_loop_in_bound_enforced() {
    let (harness, _status_rx) = Harness::new(1144, |config| {
        config.max_loop_in_per_peer = 1;
    });
    let peer = PublicKey::from_str(PEER_KEY).unwrap();

    let request = LoopInRequest {
        amount: 1_000_000,
        sender_key: client_key(),
        payout_script: payout_script(),
        limits: SwapLimits::default(),
        protocol_version: ProtocolVersion::NativeSegwitIn,
        last_hop: Some(peer),
        // External broadcaster: the executor only watches the chain.
        htlc_broadcaster: HtlcBroadcaster::External,
    };

    harness.supervisor.loop_in(request.clone()).await.unwrap();
    let err = harness
        .supervisor
        .loop_in(request)
        .await
        .expect_err("second loop in through the same peer must be rejected");
    assert!(matches!(err, loopswap_core::Error::SwapLimitReached(_)));
}
