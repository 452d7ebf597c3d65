//! Swap server API client and types.
//!
//! This module provides types and an HTTP client for the swap server's REST
//! API: terms, quotes and swap creation for both directions.

mod client;
mod types;

pub use client::{ServerClient, ServerFuture, SwapServer};
pub use types::*;
