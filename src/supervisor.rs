//! The supervisor: process-lifetime owner of the executor population.
//!
//! Creates swaps (quote, policy check, contract, executor), resumes
//! non-terminal swaps from the store on startup, bounds concurrency, and
//! exposes the status subscription the outer RPC surface consumes.

use crate::api::{NewLoopInSwapRequest, NewLoopOutSwapRequest, SwapServer};
use crate::chain::ChainClient;
use crate::error::{Error, Result};
use crate::executor::{Executor, ExecutorConfig, ExecutorExit, ExecutorHandle, ExitReason};
use crate::htlc::SwapHtlc;
use crate::kernel::SwapState;
use crate::lightning::LightningClient;
use crate::policy::{self, PolicyConfig, SwapLimits};
use crate::store::SwapStore;
use crate::types::{
    Contract, HtlcBroadcaster, Network, Preimage, ProtocolVersion, SwapDirection, SwapHash,
    SwapStatus,
};
use bitcoin::ScriptBuf;
use bitcoin::secp256k1::PublicKey;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::{broadcast, mpsc};

/// Supervisor configuration.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub network: Network,
    /// Global bound on concurrently active swaps.
    pub max_active_swaps: usize,
    /// Per-peer bound on concurrent Loop Ins, keyed by last-hop node.
    pub max_loop_in_per_peer: usize,
    /// Minimum distance between the chain tip at creation and the HTLC
    /// expiry the server hands back.
    pub cltv_safety_margin: u32,
    /// Wall-clock window the server gets to publish its Loop Out HTLC.
    pub publication_window: Duration,
    /// CLTV delta for the Loop In invoice held by the local node.
    pub loop_in_cltv_delta: u32,
    pub policy: PolicyConfig,
    pub executor: ExecutorConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            network: Network::Bitcoin,
            max_active_swaps: 16,
            max_loop_in_per_peer: 2,
            cltv_safety_margin: 20,
            publication_window: Duration::from_secs(30 * 60),
            loop_in_cltv_delta: 144,
            policy: PolicyConfig::default(),
            executor: ExecutorConfig::default(),
        }
    }
}

/// Parameters for a new Loop Out swap.
#[derive(Debug, Clone)]
pub struct LoopOutRequest {
    pub amount: u64,
    /// Client key for the HTLC success path; held by the external signer.
    pub receiver_key: PublicKey,
    /// Where the sweep pays out.
    pub payout_script: ScriptBuf,
    pub limits: SwapLimits,
    pub protocol_version: ProtocolVersion,
    /// Restrict off-chain payments to this channel.
    pub outgoing_channel: Option<u64>,
}

/// Parameters for a new Loop In swap.
#[derive(Debug, Clone)]
pub struct LoopInRequest {
    pub amount: u64,
    /// Client key for the HTLC refund path; held by the external signer.
    pub sender_key: PublicKey,
    /// Where a refund pays out.
    pub payout_script: ScriptBuf,
    pub limits: SwapLimits,
    pub protocol_version: ProtocolVersion,
    /// Require the server's payment to arrive through this peer.
    pub last_hop: Option<PublicKey>,
    /// Whether this process broadcasts the HTLC or an external wallet does.
    pub htlc_broadcaster: HtlcBroadcaster,
}

/// Owns every live executor. Collaborators are injected at construction;
/// there is no global state.
pub struct Supervisor<C, L, S, A> {
    chain: Arc<C>,
    lightning: Arc<L>,
    store: Arc<S>,
    server: Arc<A>,
    config: SupervisorConfig,
    executors: Mutex<HashMap<SwapHash, Arc<ExecutorHandle>>>,
    loop_in_peers: Mutex<HashMap<PublicKey, usize>>,
    status_tx: broadcast::Sender<SwapStatus>,
    exit_tx: mpsc::Sender<ExecutorExit>,
    /// Set on the first storage failure; refuses new swaps afterwards.
    storage_poisoned: AtomicBool,
}

impl<C, L, S, A> Supervisor<C, L, S, A>
where
    C: ChainClient,
    L: LightningClient,
    S: SwapStore + 'static,
    A: SwapServer,
{
    /// Construct a supervisor. Must be called within a tokio runtime; the
    /// internal reaper task starts immediately.
    pub fn new(
        chain: Arc<C>,
        lightning: Arc<L>,
        store: Arc<S>,
        server: Arc<A>,
        config: SupervisorConfig,
    ) -> Arc<Self> {
        let (status_tx, _) = broadcast::channel(256);
        let (exit_tx, exit_rx) = mpsc::channel(32);

        let supervisor = Arc::new(Self {
            chain,
            lightning,
            store,
            server,
            config,
            executors: Mutex::new(HashMap::new()),
            loop_in_peers: Mutex::new(HashMap::new()),
            status_tx,
            exit_tx,
            storage_poisoned: AtomicBool::new(false),
        });

        tokio::spawn(Self::reap(Arc::downgrade(&supervisor), exit_rx));
        supervisor
    }

    /// Subscribe to status records for every swap, terminal changes
    /// included.
    pub fn subscribe(&self) -> broadcast::Receiver<SwapStatus> {
        self.status_tx.subscribe()
    }

    /// Status snapshots of all live swaps.
    pub fn list_active(&self) -> Vec<SwapStatus> {
        let executors = self.executors.lock().expect("executor map poisoned");
        executors.values().map(|handle| handle.status()).collect()
    }

    /// Status of one live swap.
    pub fn swap_status(&self, swap_hash: SwapHash) -> Result<SwapStatus> {
        let executors = self.executors.lock().expect("executor map poisoned");
        executors
            .get(&swap_hash)
            .map(|handle| handle.status())
            .ok_or_else(|| Error::SwapNotFound(swap_hash.to_string()))
    }

    /// Request cancellation of a live swap. Rejected once the swap is past
    /// its point of no return.
    pub async fn cancel_swap(&self, swap_hash: SwapHash) -> Result<()> {
        let handle = {
            let executors = self.executors.lock().expect("executor map poisoned");
            executors.get(&swap_hash).cloned()
        };
        match handle {
            Some(handle) => handle.cancel().await,
            None => Err(Error::SwapNotFound(swap_hash.to_string())),
        }
    }

    /// Rehydrate every non-terminal swap from the store and schedule an
    /// executor for each. Returns the number of resumed swaps.
    pub async fn resume(&self) -> Result<usize> {
        let swaps = self.store.load_all().await?;
        let count = swaps.len();
        for stored in swaps {
            let state = stored.latest_state();
            log::info!(
                "Resuming {} swap {} in phase {}",
                state.contract.direction,
                state.contract.swap_hash,
                state.phase.name()
            );
            self.launch(state);
        }
        Ok(count)
    }

    /// Create and start a Loop Out swap: off-chain balance out to chain.
    pub async fn loop_out(&self, request: LoopOutRequest) -> Result<SwapHash> {
        self.ensure_accepting_swaps()?;

        let preimage = Preimage::generate();
        let swap_hash = preimage.hash();

        let terms = self.server.loop_out_terms().await?;
        self.check_terms(request.amount, &terms)?;
        let quote = self.server.loop_out_quote(request.amount).await?;
        let ceilings =
            policy::validate_loop_out_quote(&quote, &request.limits, &self.config.policy)?;

        let initiation_height = self.chain.current_height().await?;
        let now = OffsetDateTime::now_utc();
        let publication_deadline = now + self.config.publication_window;

        let response = self
            .server
            .new_loop_out_swap(NewLoopOutSwapRequest {
                receiver_key: request.receiver_key,
                swap_hash,
                amount: request.amount,
                publication_deadline,
                protocol_version: request.protocol_version,
            })
            .await?;
        self.check_expiry(response.expiry, initiation_height)?;

        let contract = Contract {
            direction: SwapDirection::Out,
            amount: request.amount,
            swap_hash,
            sender_key: response.sender_key,
            receiver_key: request.receiver_key,
            cltv_expiry: response.expiry,
            max_miner_fee: ceilings.max_miner_fee,
            max_swap_fee: ceilings.max_swap_fee,
            max_swap_routing_fee: ceilings.max_swap_routing_fee,
            max_prepay_routing_fee: ceilings.max_prepay_routing_fee,
            max_prepay_amount: ceilings.max_prepay_amount,
            initiation_height,
            creation_time: now,
            protocol_version: request.protocol_version,
            htlc_broadcaster: HtlcBroadcaster::Internal,
            swap_fee: quote.swap_fee,
            swap_invoice: response.swap_invoice,
            prepay_invoice: Some(response.prepay_invoice),
            publication_deadline: Some(publication_deadline),
            payout_script: request.payout_script,
            last_hop: None,
            outgoing_channel: request.outgoing_channel,
            network: self.config.network,
        };
        // Rejects impossible parameters before anything is persisted.
        SwapHtlc::from_contract(&contract)?;

        self.store.put_contract(swap_hash, &contract).await?;

        let mut state = SwapState::initial(contract);
        // The client generated the preimage; it is known from the start.
        state.preimage = Some(preimage);
        self.launch(state);

        log::info!("Created loop out swap {} for {} sat", swap_hash, request.amount);
        Ok(swap_hash)
    }

    /// Create and start a Loop In swap: on-chain coins in to off-chain
    /// balance.
    pub async fn loop_in(&self, request: LoopInRequest) -> Result<SwapHash> {
        self.ensure_accepting_swaps()?;
        if let Some(peer) = request.last_hop {
            let peers = self.loop_in_peers.lock().expect("peer map poisoned");
            if peers.get(&peer).copied().unwrap_or(0) >= self.config.max_loop_in_per_peer {
                return Err(Error::SwapLimitReached(format!(
                    "Too many active loop ins through peer {}",
                    peer
                )));
            }
        }

        let terms = self.server.loop_in_terms().await?;
        self.check_terms(request.amount, &terms)?;
        let quote = self.server.loop_in_quote(request.amount).await?;
        let ceilings =
            policy::validate_loop_in_quote(&quote, &request.limits, &self.config.policy)?;
        // The server committed to this hash; only it knows the preimage.
        let swap_hash = quote.swap_hash;

        let invoice_amount = request
            .amount
            .checked_sub(quote.swap_fee)
            .ok_or_else(|| Error::ProtocolViolation("swap fee exceeds principal".to_string()))?;
        let swap_invoice = self
            .lightning
            .add_invoice(invoice_amount, swap_hash, self.config.loop_in_cltv_delta)
            .await?;

        let initiation_height = self.chain.current_height().await?;
        let response = self
            .server
            .new_loop_in_swap(NewLoopInSwapRequest {
                sender_key: request.sender_key,
                swap_hash,
                amount: request.amount,
                protocol_version: request.protocol_version,
                swap_invoice: swap_invoice.clone(),
                last_hop: request.last_hop,
            })
            .await?;
        self.check_expiry(response.expiry, initiation_height)?;

        let contract = Contract {
            direction: SwapDirection::In,
            amount: request.amount,
            swap_hash,
            sender_key: request.sender_key,
            receiver_key: response.receiver_key,
            cltv_expiry: response.expiry,
            max_miner_fee: ceilings.max_miner_fee,
            max_swap_fee: ceilings.max_swap_fee,
            max_swap_routing_fee: ceilings.max_swap_routing_fee,
            max_prepay_routing_fee: None,
            max_prepay_amount: None,
            initiation_height,
            creation_time: OffsetDateTime::now_utc(),
            protocol_version: request.protocol_version,
            htlc_broadcaster: request.htlc_broadcaster,
            swap_fee: quote.swap_fee,
            swap_invoice,
            prepay_invoice: None,
            publication_deadline: None,
            payout_script: request.payout_script,
            last_hop: request.last_hop,
            outgoing_channel: None,
            network: self.config.network,
        };
        SwapHtlc::from_contract(&contract)?;

        self.store.put_contract(swap_hash, &contract).await?;
        self.launch(SwapState::initial(contract));

        log::info!("Created loop in swap {} for {} sat", swap_hash, request.amount);
        Ok(swap_hash)
    }

    fn launch(&self, state: SwapState) {
        if state.contract.direction == SwapDirection::In {
            if let Some(peer) = state.contract.last_hop {
                let mut peers = self.loop_in_peers.lock().expect("peer map poisoned");
                *peers.entry(peer).or_insert(0) += 1;
            }
        }

        let handle = Executor::spawn(
            state,
            self.chain.clone(),
            self.lightning.clone(),
            self.store.clone(),
            self.config.executor.clone(),
            self.status_tx.clone(),
            self.exit_tx.clone(),
        );
        let mut executors = self.executors.lock().expect("executor map poisoned");
        executors.insert(handle.swap_hash(), Arc::new(handle));
    }

    /// Abort all executor tasks. In-flight swaps stay as persisted and are
    /// picked up by [`Supervisor::resume`] on the next start.
    pub fn shutdown(&self) {
        let mut executors = self.executors.lock().expect("executor map poisoned");
        for (_, handle) in executors.drain() {
            handle.join.abort();
        }
    }

    fn ensure_accepting_swaps(&self) -> Result<()> {
        if self.storage_poisoned.load(Ordering::SeqCst) {
            return Err(Error::Storage(
                "Store failed earlier; refusing new swaps until restart".to_string(),
            ));
        }
        let executors = self.executors.lock().expect("executor map poisoned");
        if executors.len() >= self.config.max_active_swaps {
            return Err(Error::SwapLimitReached(format!(
                "{} swaps already active",
                executors.len()
            )));
        }
        Ok(())
    }

    fn check_terms(&self, amount: u64, terms: &crate::api::SwapTerms) -> Result<()> {
        if amount < terms.min_swap_amount || amount > terms.max_swap_amount {
            return Err(Error::SwapLimitReached(format!(
                "Amount {} sat outside server terms [{}, {}]",
                amount, terms.min_swap_amount, terms.max_swap_amount
            )));
        }
        Ok(())
    }

    fn check_expiry(&self, expiry: u32, initiation_height: u32) -> Result<()> {
        let min_expiry = initiation_height + self.config.cltv_safety_margin;
        if expiry <= min_expiry {
            return Err(Error::ProtocolViolation(format!(
                "Server HTLC expiry {} is below the safety margin (tip {}, margin {})",
                expiry, initiation_height, self.config.cltv_safety_margin
            )));
        }
        Ok(())
    }

    /// Collects finished executors, maintains the per-peer counters, and
    /// poisons the supervisor on storage failures.
    async fn reap(supervisor: Weak<Self>, mut exit_rx: mpsc::Receiver<ExecutorExit>) {
        while let Some(exit) = exit_rx.recv().await {
            let Some(supervisor) = supervisor.upgrade() else {
                break;
            };

            {
                let mut executors = supervisor.executors.lock().expect("executor map poisoned");
                executors.remove(&exit.swap_hash);
            }
            if exit.direction == SwapDirection::In {
                if let Some(peer) = exit.last_hop {
                    let mut peers = supervisor.loop_in_peers.lock().expect("peer map poisoned");
                    if let Some(count) = peers.get_mut(&peer) {
                        *count = count.saturating_sub(1);
                        if *count == 0 {
                            peers.remove(&peer);
                        }
                    }
                }
            }

            match exit.reason {
                ExitReason::Terminal(outcome) => {
                    log::debug!("Swap {} released: {:?}", exit.swap_hash, outcome);
                }
                ExitReason::StorageFailure(message) => {
                    log::error!(
                        "Swap {} hit a storage failure, refusing new swaps: {}",
                        exit.swap_hash,
                        message
                    );
                    supervisor.storage_poisoned.store(true, Ordering::SeqCst);
                }
            }
        }
    }
}
