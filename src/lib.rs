//! bitbank.cc market-data client
//!
//! This crate provides a client for the bitbank public API, including
//! point-in-time ticker snapshots over REST and realtime ticker
//! streaming with per-channel delivery queues.

pub mod client;
pub mod error;
pub mod types;
pub mod websocket;

pub use client::BitbankClient;
pub use error::{BitbankError, BitbankResult};
pub use types::{
    ApiErrorData, ApiResponse, Tick, BTC_JPY, CHANNEL_CANDLESTICK, CHANNEL_DEPTH, CHANNEL_TICKER,
    CHANNEL_TRANSACTIONS, LTC_BTC, XRP_JPY,
};
pub use websocket::{BitbankStream, StreamConfig, StreamController, StreamState};
