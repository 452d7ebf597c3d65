//! HTTP client for the swap server API.

use crate::error::{Error, Result};
use std::future::Future;
use std::pin::Pin;

use super::types::*;

/// Type alias for swap server futures.
pub type ServerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// The swap server as seen by the core: terms, quotes, swap creation.
///
/// [`ServerClient`] is the REST implementation; tests substitute their own.
pub trait SwapServer: Send + Sync + 'static {
    fn loop_out_terms(&self) -> ServerFuture<'_, SwapTerms>;
    fn loop_out_quote(&self, amount: u64) -> ServerFuture<'_, LoopOutQuote>;
    fn new_loop_out_swap(
        &self,
        request: NewLoopOutSwapRequest,
    ) -> ServerFuture<'_, NewLoopOutSwapResponse>;
    fn loop_in_terms(&self) -> ServerFuture<'_, SwapTerms>;
    fn loop_in_quote(&self, amount: u64) -> ServerFuture<'_, LoopInQuote>;
    fn new_loop_in_swap(
        &self,
        request: NewLoopInSwapRequest,
    ) -> ServerFuture<'_, NewLoopInSwapResponse>;
}

impl SwapServer for ServerClient {
    fn loop_out_terms(&self) -> ServerFuture<'_, SwapTerms> {
        Box::pin(async move { self.loop_out_terms().await })
    }

    fn loop_out_quote(&self, amount: u64) -> ServerFuture<'_, LoopOutQuote> {
        Box::pin(async move { self.loop_out_quote(amount).await })
    }

    fn new_loop_out_swap(
        &self,
        request: NewLoopOutSwapRequest,
    ) -> ServerFuture<'_, NewLoopOutSwapResponse> {
        Box::pin(async move { self.new_loop_out_swap(&request).await })
    }

    fn loop_in_terms(&self) -> ServerFuture<'_, SwapTerms> {
        Box::pin(async move { self.loop_in_terms().await })
    }

    fn loop_in_quote(&self, amount: u64) -> ServerFuture<'_, LoopInQuote> {
        Box::pin(async move { self.loop_in_quote(amount).await })
    }

    fn new_loop_in_swap(
        &self,
        request: NewLoopInSwapRequest,
    ) -> ServerFuture<'_, NewLoopInSwapResponse> {
        Box::pin(async move { self.new_loop_in_swap(&request).await })
    }
}

/// Swap server API client.
#[derive(Debug, Clone)]
pub struct ServerClient {
    base_url: String,
    client: reqwest::Client,
}

impl ServerClient {
    /// Create a new API client.
    ///
    /// # Arguments
    /// * `base_url` - Base URL of the swap server (e.g., "https://swap.example.com")
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Get the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Published Loop Out terms.
    pub async fn loop_out_terms(&self) -> Result<SwapTerms> {
        let url = format!("{}/v1/loop/out/terms", self.base_url);
        self.get_json(&url).await
    }

    /// Quote a Loop Out of the given amount.
    pub async fn loop_out_quote(&self, amount: u64) -> Result<LoopOutQuote> {
        let url = format!("{}/v1/loop/out/quote?amount={}", self.base_url, amount);
        self.get_json(&url).await
    }

    /// Initiate a Loop Out swap.
    pub async fn new_loop_out_swap(
        &self,
        request: &NewLoopOutSwapRequest,
    ) -> Result<NewLoopOutSwapResponse> {
        let url = format!("{}/v1/loop/out", self.base_url);
        self.post_json(&url, request).await
    }

    /// Published Loop In terms.
    pub async fn loop_in_terms(&self) -> Result<SwapTerms> {
        let url = format!("{}/v1/loop/in/terms", self.base_url);
        self.get_json(&url).await
    }

    /// Quote a Loop In of the given amount. The response carries the swap
    /// hash the server commits to.
    pub async fn loop_in_quote(&self, amount: u64) -> Result<LoopInQuote> {
        let url = format!("{}/v1/loop/in/quote?amount={}", self.base_url, amount);
        self.get_json(&url).await
    }

    /// Initiate a Loop In swap.
    pub async fn new_loop_in_swap(
        &self,
        request: &NewLoopInSwapRequest,
    ) -> Result<NewLoopInSwapResponse> {
        let url = format!("{}/v1/loop/in", self.base_url);
        self.post_json(&url, request).await
    }

    // Helper methods

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        self.dispatch(url, self.client.get(url)).await
    }

    async fn post_json<T: serde::de::DeserializeOwned, B: serde::Serialize>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<T> {
        self.dispatch(url, self.client.post(url).json(body)).await
    }

    /// Send a prepared request and decode the JSON body. Non-2xx responses
    /// are surfaced with the server's error message when it sent one.
    async fn dispatch<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<T> {
        let response = request
            .send()
            .await
            .map_err(|e| Error::Network(format!("Request to {} failed: {}", url, e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Network(format!("Could not read body from {}: {}", url, e)))?;
        log::debug!("{} -> {}: {}", url, status, body);

        if !status.is_success() {
            let message = serde_json::from_str::<ApiError>(&body)
                .map(|api_error| api_error.error)
                .unwrap_or_else(|_| format!("HTTP {}", status));
            return Err(Error::Network(format!(
                "Swap server rejected {}: {}",
                url, message
            )));
        }

        serde_json::from_str(&body).map_err(|e| {
            Error::Parse(format!(
                "Unexpected response from {}: {} (body: {})",
                url, e, body
            ))
        })
    }
}
