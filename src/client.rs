//! bitbank REST API client
//!
//! Provides point-in-time market snapshots from the public endpoints.

use std::time::Duration;

use reqwest::Client;
use tracing::{debug, instrument};

use crate::error::BitbankError;
use crate::types::{ApiErrorData, ApiResponse, Tick};

/// Base URL for the public (unauthenticated) REST API
const PUBLIC_API_BASE: &str = "https://public.bitbank.cc";

/// Default request timeout
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// bitbank public REST client
#[derive(Clone)]
pub struct BitbankClient {
    client: Client,
    base_url: String,
}

impl BitbankClient {
    /// Create a client against the production public endpoint.
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            base_url: PUBLIC_API_BASE.to_string(),
        }
    }

    /// Create a client with an injected HTTP transport and base URL.
    ///
    /// Tests point this at a stub server; callers that need custom
    /// transport settings (proxies, timeouts) pass their own `Client`.
    pub fn with_http_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Fetch the current ticker snapshot for a trading pair.
    ///
    /// The pair is not validated locally; an unknown pair is rejected by
    /// the exchange with an API error code.
    #[instrument(skip(self))]
    pub async fn get_ticker(&self, pair: &str) -> Result<Tick, BitbankError> {
        let url = format!("{}/{}/ticker", self.base_url, pair);

        debug!("Fetching bitbank ticker from: {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| BitbankError::network(format!("Failed to fetch ticker: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| BitbankError::network(format!("Failed to read response body: {}", e)))?;

        if !status.is_success() {
            return Err(Self::decode_error("GET", &url, status.as_u16(), body));
        }

        let envelope: ApiResponse<Tick> =
            serde_json::from_str(&body).map_err(|e| BitbankError::Parse {
                message: format!("Failed to parse ticker response: {}", e),
                body,
            })?;

        Ok(envelope.data)
    }

    /// Map a non-2xx response to a structured error, falling back to the
    /// raw body when the error payload itself does not decode.
    fn decode_error(method: &str, url: &str, status: u16, body: String) -> BitbankError {
        match serde_json::from_str::<ApiResponse<ApiErrorData>>(&body) {
            Ok(envelope) => BitbankError::Api {
                method: method.to_string(),
                url: url.to_string(),
                status,
                code: envelope.data.code,
            },
            Err(_) => BitbankError::ApiOpaque {
                method: method.to_string(),
                url: url.to_string(),
                status,
                body,
            },
        }
    }
}

impl Default for BitbankClient {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BitbankClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BitbankClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}
