// =============================================================================
// unifeed demo — subscribe to a few streams and log what arrives
// =============================================================================

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use unifeed::{
    Candle, ConnectionStatus, FeedCallbacks, FeedClient, FeedConfig, GroupBy, OrderBook,
    StreamKind, Ticker,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("unifeed demo starting");

    let mut config = match std::env::var("UNIFEED_CONFIG") {
        Ok(path) => FeedConfig::load(&path).unwrap_or_else(|e| {
            warn!(error = %e, "failed to load config, using defaults");
            FeedConfig::default()
        }),
        Err(_) => FeedConfig::default(),
    };

    if let Ok(url) = std::env::var("UNIFEED_WS_URL") {
        config.ws_url = url;
    }
    if let Ok(url) = std::env::var("UNIFEED_REST_URL") {
        config.rest_url = url;
    }

    let symbols: Vec<String> = std::env::var("UNIFEED_SYMBOLS")
        .unwrap_or_else(|_| "BTCUSDT,ETHUSDT".to_string())
        .split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect();

    info!(symbols = ?symbols, ws_url = %config.ws_url, "subscribing");

    let client = FeedClient::new(config);

    let callbacks = FeedCallbacks {
        on_candle_update: Some(Arc::new(|series: &[Candle], symbol: &str, interval: &str| {
            if let Some(last) = series.last() {
                info!(
                    symbol,
                    interval,
                    buckets = series.len(),
                    close = last.close,
                    change = last.change,
                    "candle series updated"
                );
            }
        })),
        on_order_book_update: Some(Arc::new(|book: &OrderBook, symbol: &str| {
            let best_bid = book.bids.first().map(|l| l.price).unwrap_or(0.0);
            let best_ask = book.asks.first().map(|l| l.price).unwrap_or(0.0);
            info!(
                symbol,
                best_bid,
                best_ask,
                last_update_id = book.last_update_id,
                "order book updated"
            );
        })),
        on_ticker_update: Some(Arc::new(|ticker: &Ticker, symbol: &str| {
            info!(
                symbol,
                last_price = ticker.last_price,
                change_pct = ticker.price_change_percent,
                "ticker updated"
            );
        })),
        on_connection_status: Some(Arc::new(|status: ConnectionStatus| {
            if status == ConnectionStatus::Failed {
                error!(status = %status, "connection status");
            } else {
                info!(status = %status, "connection status");
            }
        })),
    };

    let handle = client.subscribe(
        &symbols,
        &["1h".to_string()],
        &[StreamKind::Candles, StreamKind::Depth, StreamKind::Ticker],
        callbacks,
        GroupBy::Hour,
        24,
    );

    info!("feed running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;

    warn!("shutdown signal received");
    handle.unsubscribe();
    info!("unifeed demo shut down");
    Ok(())
}
