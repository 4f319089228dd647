// =============================================================================
// Shared types for the unified market-data feed
// =============================================================================

use std::sync::Arc;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Stream classification
// ---------------------------------------------------------------------------

/// The kind of data carried by a stream topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Candles,
    Depth,
    Ticker,
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Candles => write!(f, "candles"),
            Self::Depth => write!(f, "depth"),
            Self::Ticker => write!(f, "ticker"),
        }
    }
}

/// Bucketing granularity for aggregated candle series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupBy {
    Hour,
    Day,
    Week,
    Month,
}

impl Default for GroupBy {
    fn default() -> Self {
        Self::Day
    }
}

// ---------------------------------------------------------------------------
// Connection status
// ---------------------------------------------------------------------------

/// Transport status as surfaced to subscribers via `on_connection_status`.
///
/// `Failed` is terminal: the client has exhausted its reconnection attempts
/// and will not retry until a fresh `subscribe` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
    Failed,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Error => write!(f, "Error"),
            Self::Failed => write!(f, "Failed to reconnect"),
        }
    }
}

// ---------------------------------------------------------------------------
// Market data values
// ---------------------------------------------------------------------------

/// One OHLCV bucket of an aggregated candle series.
///
/// `time` is the bucket key the aggregator filed this candle under (full
/// RFC 3339 timestamp, date, or first-of-month date depending on the
/// subscription's [`GroupBy`]). Past buckets never change; the most recent
/// bucket is rewritten in place until its interval boundary passes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub time: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// Percentage change over the bucket: `(close - open) / open * 100`.
    pub change: f64,
    pub symbol: String,
}

/// Percentage change between an open and a close price.
pub fn change_pct(open: f64, close: f64) -> f64 {
    if open == 0.0 {
        0.0
    } else {
        (close - open) / open * 100.0
    }
}

/// RFC 3339 timestamp (millisecond precision, UTC) for a unix-millis value.
/// `None` if the value is outside chrono's representable range.
pub fn iso_millis(ms: i64) -> Option<String> {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
}

/// A single `(price, quantity)` level on one side of the order book.
/// Quantity `0` in a depth update means "remove this level".
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OrderBookLevel {
    pub price: f64,
    pub qty: f64,
}

/// Top-N order book for a single symbol.
///
/// Invariant: `bids` are sorted descending and `asks` ascending by price,
/// each side de-duplicated by price and capped after every mutation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderBook {
    pub bids: Vec<OrderBookLevel>,
    pub asks: Vec<OrderBookLevel>,
    pub last_update_id: u64,
}

/// One sequenced order-book diff, normalized from either wire shape.
///
/// Valid to apply only when
/// `first_update_id <= book.last_update_id + 1 <= final_update_id`;
/// anything else is discarded whole, never partially applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepthUpdate {
    pub first_update_id: u64,
    pub final_update_id: u64,
    pub bids: Vec<OrderBookLevel>,
    pub asks: Vec<OrderBookLevel>,
}

/// 24 h rolling statistics for one symbol. Stateless: each update replaces
/// the previous one wholesale, there is no merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub last_price: f64,
    pub price_change: f64,
    pub price_change_percent: f64,
    pub weighted_avg_price: f64,
    pub prev_close_price: f64,
    pub open_price: f64,
    pub high_price: f64,
    pub low_price: f64,
    pub best_bid: f64,
    pub best_ask: f64,
    pub volume: f64,
    pub quote_volume: f64,
    pub trade_count: u64,
}

// ---------------------------------------------------------------------------
// Consumer callbacks
// ---------------------------------------------------------------------------

pub type CandleHandler = Arc<dyn Fn(&[Candle], &str, &str) + Send + Sync>;
pub type OrderBookHandler = Arc<dyn Fn(&OrderBook, &str) + Send + Sync>;
pub type TickerHandler = Arc<dyn Fn(&Ticker, &str) + Send + Sync>;
pub type StatusHandler = Arc<dyn Fn(ConnectionStatus) + Send + Sync>;

/// Callback bundle attached to a subscription. Every handler is optional;
/// re-subscribing with the same key replaces the whole bundle.
#[derive(Clone, Default)]
pub struct FeedCallbacks {
    /// `(series, symbol, interval)` — the full sorted, truncated series for
    /// one (symbol, interval), re-emitted on every change.
    pub on_candle_update: Option<CandleHandler>,
    /// `(order_book, symbol)` — an owned copy of the reconciled book.
    pub on_order_book_update: Option<OrderBookHandler>,
    /// `(ticker, symbol)`.
    pub on_ticker_update: Option<TickerHandler>,
    pub on_connection_status: Option<StatusHandler>,
}

impl std::fmt::Debug for FeedCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedCallbacks")
            .field("on_candle_update", &self.on_candle_update.is_some())
            .field("on_order_book_update", &self.on_order_book_update.is_some())
            .field("on_ticker_update", &self.on_ticker_update.is_some())
            .field("on_connection_status", &self.on_connection_status.is_some())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_match_consumer_contract() {
        assert_eq!(ConnectionStatus::Connected.to_string(), "Connected");
        assert_eq!(ConnectionStatus::Connecting.to_string(), "Connecting");
        assert_eq!(ConnectionStatus::Disconnected.to_string(), "Disconnected");
        assert_eq!(ConnectionStatus::Error.to_string(), "Error");
        assert_eq!(ConnectionStatus::Failed.to_string(), "Failed to reconnect");
    }

    #[test]
    fn change_pct_basic() {
        assert!((change_pct(100.0, 110.0) - 10.0).abs() < 1e-9);
        assert!((change_pct(100.0, 95.0) + 5.0).abs() < 1e-9);
    }

    #[test]
    fn change_pct_zero_open_is_zero() {
        assert_eq!(change_pct(0.0, 42.0), 0.0);
    }

    #[test]
    fn stream_kind_ordering_is_stable() {
        // Subscription keys rely on a stable sort order.
        let mut kinds = vec![StreamKind::Ticker, StreamKind::Candles, StreamKind::Depth];
        kinds.sort();
        assert_eq!(
            kinds,
            vec![StreamKind::Candles, StreamKind::Depth, StreamKind::Ticker]
        );
    }
}
