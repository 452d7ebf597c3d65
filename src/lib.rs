//! Loopswap Client SDK - Core Library
//!
//! Non-custodial submarine swaps between off-chain Lightning balance and
//! on-chain coins: "loop out" converts channel balance into on-chain funds,
//! "loop in" the other way around, via hash-locked atomic swaps with a
//! cooperating server.
//!
//! The crate is the sequencing core only. Chain access, Lightning access and
//! the swap server are consumed through traits ([`ChainClient`],
//! [`LightningClient`]) and a thin REST client; signing, routing and script
//! execution live behind those seams.
//!
//! # Example
//!
//! ```rust,ignore
//! use loopswap_core::{Supervisor, SupervisorConfig, LoopOutRequest, ServerClient};
//!
//! let supervisor = Supervisor::new(chain, lightning, store, server, config);
//! supervisor.resume().await?;
//!
//! let swap_hash = supervisor.loop_out(request).await?;
//! let mut updates = supervisor.subscribe();
//! while let Ok(status) = updates.recv().await {
//!     println!("{}: {}", status.swap_hash, status.phase);
//! }
//! ```

pub mod api;
pub mod chain;
pub mod error;
pub mod executor;
pub mod htlc;
pub mod kernel;
pub mod lightning;
pub mod policy;
pub mod store;
pub mod supervisor;
pub mod types;

pub use api::{ServerClient, SwapServer};
pub use chain::{ChainClient, ConfirmationEvent, WatchTarget};
pub use error::{Error, Result};
pub use executor::{ExecutorConfig, RetryConfig};
pub use kernel::{KernelConfig, SwapEvent, SwapPhase, SwapState};
pub use lightning::{InvoiceState, LightningClient, PayRequest, PaymentUpdate};
pub use policy::{PolicyConfig, SwapLimits};
pub use store::{FileSwapStore, StoreFuture, StoredSwap, SwapStore};
pub use supervisor::{LoopInRequest, LoopOutRequest, Supervisor, SupervisorConfig};
pub use types::{
    Contract, FailureReason, HtlcBroadcaster, Network, Preimage, ProtocolVersion, SwapCosts,
    SwapDirection, SwapHash, SwapStatus, TerminalOutcome,
};
