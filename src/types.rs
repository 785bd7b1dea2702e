//! bitbank API types
//!
//! Wire-level types shared by the REST client and the realtime stream.
//! Prices and volumes stay as the exact decimal strings the exchange
//! sends; go through the `Decimal` accessors when arithmetic is needed.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::BitbankError;

// Trading pairs. Illustrative; any pair the exchange accepts works.
pub const BTC_JPY: &str = "btc_jpy";
pub const XRP_JPY: &str = "xrp_jpy";
pub const LTC_BTC: &str = "ltc_btc";

// Realtime channel prefixes. A full channel name is prefix + pair,
// e.g. "ticker_btc_jpy". Only `ticker_` payloads are decoded by this
// crate; the rest are named here for callers building channel names.
pub const CHANNEL_TICKER: &str = "ticker_";
pub const CHANNEL_DEPTH: &str = "depth_";
pub const CHANNEL_TRANSACTIONS: &str = "transactions_";
pub const CHANNEL_CANDLESTICK: &str = "candlestick_";

/// Generic `{success, data}` envelope wrapping every REST response.
///
/// The concrete payload shape depends on the request, so the call site
/// picks `T`.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiResponse<T> {
    pub success: i64,
    pub data: T,
}

/// Error payload carried in the envelope on non-2xx responses.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorData {
    pub code: i64,
}

/// One ticker snapshot for a trading pair.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Tick {
    /// Best ask price
    pub sell: String,
    /// Best bid price
    pub buy: String,
    /// Session high
    pub high: String,
    /// Session low
    pub low: String,
    /// Last trade price
    pub last: String,
    /// Traded volume
    pub vol: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
}

impl Tick {
    /// Snapshot time as a calendar timestamp.
    ///
    /// Returns `None` if the millisecond value is outside chrono's range.
    pub fn time(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.timestamp)
    }

    /// Best ask price as a `Decimal`.
    pub fn sell(&self) -> Result<Decimal, BitbankError> {
        Self::parse_decimal("sell", &self.sell)
    }

    /// Best bid price as a `Decimal`.
    pub fn buy(&self) -> Result<Decimal, BitbankError> {
        Self::parse_decimal("buy", &self.buy)
    }

    /// Session high as a `Decimal`.
    pub fn high(&self) -> Result<Decimal, BitbankError> {
        Self::parse_decimal("high", &self.high)
    }

    /// Session low as a `Decimal`.
    pub fn low(&self) -> Result<Decimal, BitbankError> {
        Self::parse_decimal("low", &self.low)
    }

    /// Last trade price as a `Decimal`.
    pub fn last(&self) -> Result<Decimal, BitbankError> {
        Self::parse_decimal("last", &self.last)
    }

    /// Traded volume as a `Decimal`.
    pub fn vol(&self) -> Result<Decimal, BitbankError> {
        Self::parse_decimal("vol", &self.vol)
    }

    fn parse_decimal(field: &'static str, value: &str) -> Result<Decimal, BitbankError> {
        value.parse().map_err(|_| BitbankError::Decimal {
            field,
            value: value.to_string(),
        })
    }
}
