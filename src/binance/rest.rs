// =============================================================================
// REST Snapshot Fetcher — historical candles and order-book snapshots
// =============================================================================
//
// Two idempotent request/response operations against the market-data
// provider. Neither lets an error escape: on any failure (network, status,
// parse) they log and return an empty series / `None`, so the subscribe
// path always has something to deliver.
// =============================================================================

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::binance::frame::parse_levels;
use crate::market_data::book::sort_and_cap;
use crate::types::{change_pct, iso_millis, Candle, OrderBook};

/// The provider caps kline requests at this many rows.
const MAX_KLINE_LIMIT: usize = 1000;

/// Thin REST client for the public market-data endpoints.
#[derive(Debug, Clone)]
pub struct MarketDataApi {
    client: reqwest::Client,
    base_url: String,
}

impl MarketDataApi {
    pub fn new(base_url: impl Into<String>, timeout_secs: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .expect("failed to build reqwest client");

        Self {
            client,
            base_url: base_url.into(),
        }
    }

    // -------------------------------------------------------------------------
    // Candles
    // -------------------------------------------------------------------------

    /// GET /api/v3/klines. Returns an empty vec on any failure.
    pub async fn fetch_candles(&self, symbol: &str, interval: &str, limit: usize) -> Vec<Candle> {
        match self.try_fetch_candles(symbol, interval, limit).await {
            Ok(candles) => candles,
            Err(e) => {
                warn!(symbol, interval, error = %e, "candle fetch failed, returning empty series");
                Vec::new()
            }
        }
    }

    async fn try_fetch_candles(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        let limit = limit.min(MAX_KLINE_LIMIT);
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit={}",
            self.base_url,
            symbol.to_uppercase(),
            interval,
            limit
        );

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /api/v3/klines request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse klines response")?;

        if !status.is_success() {
            anyhow::bail!("GET /api/v3/klines returned {}: {}", status, body);
        }

        let candles = parse_klines_body(&body, &symbol.to_uppercase())?;
        debug!(symbol, interval, count = candles.len(), "klines fetched");
        Ok(candles)
    }

    // -------------------------------------------------------------------------
    // Order-book snapshot
    // -------------------------------------------------------------------------

    /// GET /api/v3/depth. Returns `None` on any failure.
    pub async fn fetch_depth_snapshot(&self, symbol: &str, limit: usize) -> Option<OrderBook> {
        match self.try_fetch_depth_snapshot(symbol, limit).await {
            Ok(book) => Some(book),
            Err(e) => {
                warn!(symbol, error = %e, "depth snapshot fetch failed");
                None
            }
        }
    }

    async fn try_fetch_depth_snapshot(&self, symbol: &str, limit: usize) -> Result<OrderBook> {
        let url = format!(
            "{}/api/v3/depth?symbol={}&limit={}",
            self.base_url,
            symbol.to_uppercase(),
            limit
        );

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /api/v3/depth request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse depth response")?;

        if !status.is_success() {
            anyhow::bail!("GET /api/v3/depth returned {}: {}", status, body);
        }

        let book = parse_depth_body(&body, limit)?;
        debug!(
            symbol,
            bids = book.bids.len(),
            asks = book.asks.len(),
            last_update_id = book.last_update_id,
            "depth snapshot fetched"
        );
        Ok(book)
    }
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

/// Parse the klines array-of-arrays response.
///
/// Array indices: [0] openTime, [1] open, [2] high, [3] low, [4] close,
/// [5] volume. Malformed rows are skipped, not fatal.
fn parse_klines_body(body: &serde_json::Value, symbol: &str) -> Result<Vec<Candle>> {
    let raw = body.as_array().context("klines response is not an array")?;

    let mut candles = Vec::with_capacity(raw.len());
    for entry in raw {
        let arr = match entry.as_array() {
            Some(a) if a.len() >= 6 => a,
            _ => {
                warn!("skipping malformed kline entry: {entry}");
                continue;
            }
        };

        let open_time = arr[0].as_i64().unwrap_or(0);
        let time = match iso_millis(open_time) {
            Some(t) => t,
            None => {
                warn!(open_time, "skipping kline with out-of-range open time");
                continue;
            }
        };

        let fields: Option<Vec<f64>> = arr[1..6].iter().map(parse_str_f64).collect();
        let Some(fields) = fields else {
            warn!("skipping kline entry with malformed numeric field: {entry}");
            continue;
        };
        let (open, high, low, close, volume) =
            (fields[0], fields[1], fields[2], fields[3], fields[4]);

        candles.push(Candle {
            time,
            open,
            high,
            low,
            close,
            volume,
            change: change_pct(open, close),
            symbol: symbol.to_string(),
        });
    }

    Ok(candles)
}

/// Snapshot response shape: `{ "lastUpdateId": .., "bids": [..], "asks": [..] }`.
#[derive(Debug, Deserialize)]
struct RawDepthBody {
    #[serde(rename = "lastUpdateId")]
    last_update_id: u64,
    bids: Vec<[String; 2]>,
    asks: Vec<[String; 2]>,
}

fn parse_depth_body(body: &serde_json::Value, depth: usize) -> Result<OrderBook> {
    let raw: RawDepthBody =
        serde_json::from_value(body.clone()).context("malformed depth snapshot body")?;

    let mut book = OrderBook {
        bids: parse_levels(&raw.bids),
        asks: parse_levels(&raw.asks),
        last_update_id: raw.last_update_id,
    };
    sort_and_cap(&mut book.bids, true, depth);
    sort_and_cap(&mut book.asks, false, depth);
    Ok(book)
}

/// Parse a JSON value that may be either a string or a number into `f64`.
fn parse_str_f64(val: &serde_json::Value) -> Option<f64> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>().ok()
    } else {
        val.as_f64()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_klines_body_happy_path() {
        let body: serde_json::Value = serde_json::from_str(
            r#"[
                [1704067200000, "100.0", "105.0", "99.0", "104.0", "12.5", 1704070799999],
                [1704070800000, "104.0", "106.0", "103.0", "105.5", "8.0", 1704074399999]
            ]"#,
        )
        .unwrap();

        let candles = parse_klines_body(&body, "BTCUSDT").unwrap();
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].time, "2024-01-01T00:00:00.000Z");
        assert_eq!(candles[0].open, 100.0);
        assert_eq!(candles[0].close, 104.0);
        assert!((candles[0].change - 4.0).abs() < 1e-9);
        assert_eq!(candles[1].symbol, "BTCUSDT");
    }

    #[test]
    fn parse_klines_body_skips_malformed_rows() {
        let body: serde_json::Value = serde_json::from_str(
            r#"[
                [1704067200000, "100.0", "105.0", "99.0", "104.0", "12.5"],
                [1704070800000, "oops", "106.0", "103.0", "105.5", "8.0"],
                [1704074400000]
            ]"#,
        )
        .unwrap();

        let candles = parse_klines_body(&body, "BTCUSDT").unwrap();
        assert_eq!(candles.len(), 1);
    }

    #[test]
    fn parse_depth_body_sorts_and_caps() {
        let body: serde_json::Value = serde_json::from_str(
            r#"{
                "lastUpdateId": 321,
                "bids": [["99.0","1.0"], ["100.0","2.0"], ["98.0","3.0"]],
                "asks": [["102.0","1.0"], ["101.0","2.0"], ["103.0","3.0"]]
            }"#,
        )
        .unwrap();

        let book = parse_depth_body(&body, 2).unwrap();
        assert_eq!(book.last_update_id, 321);
        assert_eq!(book.bids.len(), 2);
        assert_eq!(book.bids[0].price, 100.0);
        assert_eq!(book.asks.len(), 2);
        assert_eq!(book.asks[0].price, 101.0);
    }

    #[tokio::test]
    async fn fetch_failures_degrade_to_empty_results() {
        // Nothing listens here; both calls must swallow the error.
        let api = MarketDataApi::new("http://127.0.0.1:9", 1);
        assert!(api.fetch_candles("BTCUSDT", "1h", 24).await.is_empty());
        assert!(api.fetch_depth_snapshot("BTCUSDT", 20).await.is_none());
    }
}
