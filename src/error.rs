//! Error types for the bitbank client

use thiserror::Error;

/// Crate-wide error type
#[derive(Error, Debug)]
pub enum BitbankError {
    /// Failure building or executing an HTTP request.
    #[error("network error: {0}")]
    Network(String),

    /// A response body that did not match the expected envelope shape.
    /// Carries the raw body so the caller can debug it.
    #[error("parse error: {message} (response body: {body})")]
    Parse { message: String, body: String },

    /// A non-2xx response with a decodable `{code}` error payload.
    #[error("{method} {url}: {status}, API error code: {code}. See https://docs.bitbank.cc/error_code/ for more information")]
    Api {
        method: String,
        url: String,
        status: u16,
        code: i64,
    },

    /// A non-2xx response whose error payload could not be decoded.
    #[error("{method} {url}: {status}, error decoding response error message. Please see the response body for more information: {body}")]
    ApiOpaque {
        method: String,
        url: String,
        status: u16,
        body: String,
    },

    /// A decimal string field that failed to parse.
    #[error("invalid decimal in field {field}: {value:?}")]
    Decimal { field: &'static str, value: String },

    /// Invalid client or stream configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// An inbound stream frame that matched no recognized shape.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A data frame for a channel the provider never acknowledged.
    #[error("data frame for unbound channel: {0}")]
    UnboundChannel(String),

    /// An error reported on the stream (provider error or transport failure).
    #[error("stream error: {0}")]
    Stream(String),

    /// No frame arrived within the subscribe timeout window.
    #[error("subscribe timeout")]
    Timeout,
}

impl BitbankError {
    pub fn network(msg: impl Into<String>) -> Self {
        BitbankError::Network(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        BitbankError::Config(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        BitbankError::Protocol(msg.into())
    }

    pub fn stream(msg: impl Into<String>) -> Self {
        BitbankError::Stream(msg.into())
    }
}

/// Result type alias for bitbank operations
pub type BitbankResult<T> = Result<T, BitbankError>;
