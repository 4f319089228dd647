// =============================================================================
// unifeed — unified real-time market-data feed client
// =============================================================================
//
// One multiplexed WebSocket transport fanned out to many independent
// subscribers (symbols × intervals × stream kinds). The client reconciles
// incremental order-book diffs against REST snapshots, aggregates streaming
// klines into time buckets, coalesces bursts of updates, and recovers from
// connection loss with a bounded linear backoff.
// =============================================================================

pub mod binance;
pub mod client;
pub mod coalesce;
pub mod config;
pub mod market_data;
pub mod registry;
pub mod types;

pub use client::{FeedClient, SubscriptionHandle};
pub use config::FeedConfig;
pub use registry::SubscriptionKey;
pub use types::{
    Candle, ConnectionStatus, DepthUpdate, FeedCallbacks, GroupBy, OrderBook, OrderBookLevel,
    StreamKind, Ticker,
};
