// =============================================================================
// Stream wire format — topic names, control frames, payload normalization
// =============================================================================
//
// Everything provider-specific about the combined stream lives here: how
// topics are spelled, how SUBSCRIBE/UNSUBSCRIBE control frames look, and how
// the three inbound payload shapes are parsed. Raw wire structs with their
// single-letter field names never leave this module; each payload is
// normalized into the crate's own types at this boundary.
// =============================================================================

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::warn;

use crate::types::{DepthUpdate, OrderBookLevel, StreamKind, Ticker};

// ---------------------------------------------------------------------------
// Topics and control frames
// ---------------------------------------------------------------------------

/// Provider topic name for one (symbol, kind, interval) stream.
///
/// Candle topics carry the interval; depth and ticker topics do not.
pub fn topic_for(symbol: &str, kind: StreamKind, interval: Option<&str>) -> String {
    let lower = symbol.to_lowercase();
    match kind {
        StreamKind::Candles => format!("{lower}@kline_{}", interval.unwrap_or("1h")),
        StreamKind::Depth => format!("{lower}@depth"),
        StreamKind::Ticker => format!("{lower}@ticker"),
    }
}

/// Build an outbound `SUBSCRIBE` / `UNSUBSCRIBE` control frame.
pub fn control_frame(method: &str, topics: &[String], id: u64) -> String {
    serde_json::json!({
        "method": method,
        "params": topics,
        "id": id,
    })
    .to_string()
}

/// Split a combined-stream topic label into `(symbol, kind, interval)`.
///
/// Returns `None` for labels this client does not recognize.
pub fn parse_topic(stream: &str) -> Option<(String, StreamKind, Option<String>)> {
    let (symbol, suffix) = stream.split_once('@')?;
    let symbol = symbol.to_uppercase();

    if let Some(interval) = suffix.strip_prefix("kline_") {
        Some((symbol, StreamKind::Candles, Some(interval.to_string())))
    } else if suffix.starts_with("depth") {
        Some((symbol, StreamKind::Depth, None))
    } else if suffix == "ticker" {
        Some((symbol, StreamKind::Ticker, None))
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Inbound frames
// ---------------------------------------------------------------------------

/// One classified inbound frame.
#[derive(Debug, Clone)]
pub enum InboundFrame {
    /// Control acknowledgement (`{"result":null,"id":n}`).
    Ack { id: u64 },
    /// A classified stream update ready for dispatch.
    Update(StreamUpdate),
}

/// A stream update tagged with its routing information.
#[derive(Debug, Clone)]
pub struct StreamUpdate {
    pub symbol: String,
    pub kind: StreamKind,
    pub interval: Option<String>,
    pub payload: StreamPayload,
}

/// Normalized payload of one stream update.
#[derive(Debug, Clone)]
pub enum StreamPayload {
    Candle(CandleTick),
    Depth(DepthUpdate),
    Ticker(Ticker),
}

/// One streaming OHLCV tick, before bucket aggregation.
#[derive(Debug, Clone)]
pub struct CandleTick {
    pub open_time_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Classify one raw inbound text frame.
///
/// Errors mean the frame is undeliverable (unparseable JSON, unknown topic,
/// malformed payload); the caller logs and drops it — never fatal.
pub fn classify(text: &str) -> Result<InboundFrame> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse stream frame JSON")?;

    // Control acks carry `result` + `id` and no stream envelope.
    if root.get("stream").is_none() {
        if let (Some(_), Some(id)) = (root.get("result"), root.get("id").and_then(|v| v.as_u64()))
        {
            return Ok(InboundFrame::Ack { id });
        }
        anyhow::bail!("frame has neither stream envelope nor ack shape");
    }

    let stream = root["stream"]
        .as_str()
        .context("stream field is not a string")?;
    let data = root
        .get("data")
        .context("stream frame missing data payload")?;

    let (symbol, kind, interval) = parse_topic(stream)
        .with_context(|| format!("unknown stream topic: {stream}"))?;

    let payload = match kind {
        StreamKind::Candles => StreamPayload::Candle(parse_kline_payload(data)?),
        StreamKind::Depth => StreamPayload::Depth(parse_depth_payload(data)?),
        StreamKind::Ticker => StreamPayload::Ticker(parse_ticker_payload(data)?),
    };

    Ok(InboundFrame::Update(StreamUpdate {
        symbol,
        kind,
        interval,
        payload,
    }))
}

// ---------------------------------------------------------------------------
// Kline payload
// ---------------------------------------------------------------------------

/// Raw kline object nested under `data.k`. Numeric values arrive as strings.
#[derive(Debug, Deserialize)]
struct RawKline {
    #[serde(rename = "t")]
    open_time: i64,
    #[serde(rename = "o")]
    open: String,
    #[serde(rename = "h")]
    high: String,
    #[serde(rename = "l")]
    low: String,
    #[serde(rename = "c")]
    close: String,
    #[serde(rename = "v")]
    volume: String,
}

fn parse_kline_payload(data: &serde_json::Value) -> Result<CandleTick> {
    let k = data.get("k").context("kline payload missing k object")?;
    let raw: RawKline =
        serde_json::from_value(k.clone()).context("malformed kline object")?;

    Ok(CandleTick {
        open_time_ms: raw.open_time,
        open: parse_f64(&raw.open, "k.o")?,
        high: parse_f64(&raw.high, "k.h")?,
        low: parse_f64(&raw.low, "k.l")?,
        close: parse_f64(&raw.close, "k.c")?,
        volume: parse_f64(&raw.volume, "k.v")?,
    })
}

// ---------------------------------------------------------------------------
// Depth payload — two wire shapes, one internal type
// ---------------------------------------------------------------------------

/// Incremental diff shape: `{ "U": .., "u": .., "b": [..], "a": [..] }`.
#[derive(Debug, Deserialize)]
struct RawDepthDiff {
    #[serde(rename = "U")]
    first_update_id: u64,
    #[serde(rename = "u")]
    final_update_id: u64,
    #[serde(rename = "b")]
    bids: Vec<[String; 2]>,
    #[serde(rename = "a")]
    asks: Vec<[String; 2]>,
}

/// Full snapshot shape: `{ "lastUpdateId": .., "bids": [..], "asks": [..] }`.
#[derive(Debug, Deserialize)]
struct RawDepthSnapshot {
    #[serde(rename = "lastUpdateId")]
    last_update_id: u64,
    bids: Vec<[String; 2]>,
    asks: Vec<[String; 2]>,
}

/// The depth stream can carry either shape; both normalize to [`DepthUpdate`].
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DepthFrame {
    Diff(RawDepthDiff),
    Snapshot(RawDepthSnapshot),
}

fn parse_depth_payload(data: &serde_json::Value) -> Result<DepthUpdate> {
    let frame: DepthFrame =
        serde_json::from_value(data.clone()).context("malformed depth payload")?;

    Ok(match frame {
        DepthFrame::Diff(d) => DepthUpdate {
            first_update_id: d.first_update_id,
            final_update_id: d.final_update_id,
            bids: parse_levels(&d.bids),
            asks: parse_levels(&d.asks),
        },
        // A snapshot replaces the book wholesale; modelling it as a diff
        // whose window is exactly lastUpdateId keeps one apply path.
        DepthFrame::Snapshot(s) => DepthUpdate {
            first_update_id: s.last_update_id,
            final_update_id: s.last_update_id,
            bids: parse_levels(&s.bids),
            asks: parse_levels(&s.asks),
        },
    })
}

/// Parse `[["price","qty"], ...]` pairs, skipping any point with a malformed
/// number rather than rejecting the whole update.
pub fn parse_levels(raw: &[[String; 2]]) -> Vec<OrderBookLevel> {
    raw.iter()
        .filter_map(|pair| {
            match (pair[0].parse::<f64>(), pair[1].parse::<f64>()) {
                (Ok(price), Ok(qty)) => Some(OrderBookLevel { price, qty }),
                _ => {
                    warn!(price = %pair[0], qty = %pair[1], "skipping malformed book level");
                    None
                }
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Ticker payload
// ---------------------------------------------------------------------------

/// Raw 24 h ticker event (`<symbol>@ticker`). Numeric values arrive as
/// strings.
#[derive(Debug, Deserialize)]
struct RawTicker {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "c")]
    last_price: String,
    #[serde(rename = "p")]
    price_change: String,
    #[serde(rename = "P")]
    price_change_percent: String,
    #[serde(rename = "w")]
    weighted_avg_price: String,
    #[serde(rename = "x")]
    prev_close_price: String,
    #[serde(rename = "o")]
    open_price: String,
    #[serde(rename = "h")]
    high_price: String,
    #[serde(rename = "l")]
    low_price: String,
    #[serde(rename = "b")]
    best_bid: String,
    #[serde(rename = "a")]
    best_ask: String,
    #[serde(rename = "v")]
    volume: String,
    #[serde(rename = "q")]
    quote_volume: String,
    #[serde(rename = "n")]
    trade_count: u64,
}

fn parse_ticker_payload(data: &serde_json::Value) -> Result<Ticker> {
    let raw: RawTicker =
        serde_json::from_value(data.clone()).context("malformed ticker payload")?;

    Ok(Ticker {
        symbol: raw.symbol.to_uppercase(),
        last_price: parse_f64(&raw.last_price, "c")?,
        price_change: parse_f64(&raw.price_change, "p")?,
        price_change_percent: parse_f64(&raw.price_change_percent, "P")?,
        weighted_avg_price: parse_f64(&raw.weighted_avg_price, "w")?,
        prev_close_price: parse_f64(&raw.prev_close_price, "x")?,
        open_price: parse_f64(&raw.open_price, "o")?,
        high_price: parse_f64(&raw.high_price, "h")?,
        low_price: parse_f64(&raw.low_price, "l")?,
        best_bid: parse_f64(&raw.best_bid, "b")?,
        best_ask: parse_f64(&raw.best_ask, "a")?,
        volume: parse_f64(&raw.volume, "v")?,
        quote_volume: parse_f64(&raw.quote_volume, "q")?,
        trade_count: raw.trade_count,
    })
}

/// Helper: the provider sends numeric values as JSON strings.
fn parse_f64(s: &str, name: &str) -> Result<f64> {
    s.parse::<f64>()
        .with_context(|| format!("failed to parse {name} as f64: {s}"))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_names() {
        assert_eq!(
            topic_for("BTCUSDT", StreamKind::Candles, Some("1h")),
            "btcusdt@kline_1h"
        );
        assert_eq!(topic_for("ETHUSDT", StreamKind::Depth, None), "ethusdt@depth");
        assert_eq!(topic_for("BNBUSDT", StreamKind::Ticker, None), "bnbusdt@ticker");
    }

    #[test]
    fn topic_roundtrip() {
        let (sym, kind, iv) = parse_topic("btcusdt@kline_4h").unwrap();
        assert_eq!(sym, "BTCUSDT");
        assert_eq!(kind, StreamKind::Candles);
        assert_eq!(iv.as_deref(), Some("4h"));

        let (sym, kind, iv) = parse_topic("ethusdt@depth").unwrap();
        assert_eq!(sym, "ETHUSDT");
        assert_eq!(kind, StreamKind::Depth);
        assert!(iv.is_none());

        assert!(parse_topic("btcusdt@trade").is_none());
        assert!(parse_topic("garbage").is_none());
    }

    #[test]
    fn control_frame_shape() {
        let frame = control_frame("SUBSCRIBE", &["btcusdt@ticker".to_string()], 7);
        let v: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(v["method"], "SUBSCRIBE");
        assert_eq!(v["params"][0], "btcusdt@ticker");
        assert_eq!(v["id"], 7);
    }

    #[test]
    fn classify_ack() {
        let frame = classify(r#"{"result":null,"id":3}"#).unwrap();
        match frame {
            InboundFrame::Ack { id } => assert_eq!(id, 3),
            other => panic!("expected ack, got {other:?}"),
        }
    }

    #[test]
    fn classify_kline_frame() {
        let json = r#"{
            "stream": "btcusdt@kline_1h",
            "data": {
                "e": "kline", "s": "BTCUSDT",
                "k": {
                    "t": 1700000000000, "T": 1700003599999, "i": "1h",
                    "o": "37000.0", "h": "37100.0", "l": "36900.0",
                    "c": "37050.0", "v": "12.5", "x": false
                }
            }
        }"#;
        let update = match classify(json).unwrap() {
            InboundFrame::Update(u) => u,
            other => panic!("expected update, got {other:?}"),
        };
        assert_eq!(update.symbol, "BTCUSDT");
        assert_eq!(update.kind, StreamKind::Candles);
        assert_eq!(update.interval.as_deref(), Some("1h"));
        match update.payload {
            StreamPayload::Candle(tick) => {
                assert_eq!(tick.open_time_ms, 1_700_000_000_000);
                assert!((tick.close - 37050.0).abs() < f64::EPSILON);
            }
            other => panic!("expected candle payload, got {other:?}"),
        }
    }

    #[test]
    fn classify_depth_diff_frame() {
        let json = r#"{
            "stream": "ethusdt@depth",
            "data": {
                "e": "depthUpdate", "s": "ETHUSDT",
                "U": 101, "u": 105,
                "b": [["2000.0", "1.5"], ["1999.5", "0"]],
                "a": [["2000.5", "2.0"]]
            }
        }"#;
        let update = match classify(json).unwrap() {
            InboundFrame::Update(u) => u,
            other => panic!("expected update, got {other:?}"),
        };
        match update.payload {
            StreamPayload::Depth(d) => {
                assert_eq!(d.first_update_id, 101);
                assert_eq!(d.final_update_id, 105);
                assert_eq!(d.bids.len(), 2);
                assert_eq!(d.bids[1].qty, 0.0);
                assert_eq!(d.asks.len(), 1);
            }
            other => panic!("expected depth payload, got {other:?}"),
        }
    }

    #[test]
    fn snapshot_shape_normalizes_to_point_window() {
        let json = r#"{
            "stream": "ethusdt@depth",
            "data": {
                "lastUpdateId": 500,
                "bids": [["2000.0", "1.0"]],
                "asks": [["2001.0", "1.0"]]
            }
        }"#;
        let update = match classify(json).unwrap() {
            InboundFrame::Update(u) => u,
            other => panic!("expected update, got {other:?}"),
        };
        match update.payload {
            StreamPayload::Depth(d) => {
                assert_eq!(d.first_update_id, 500);
                assert_eq!(d.final_update_id, 500);
            }
            other => panic!("expected depth payload, got {other:?}"),
        }
    }

    #[test]
    fn classify_ticker_frame() {
        let json = r#"{
            "stream": "btcusdt@ticker",
            "data": {
                "e": "24hrTicker", "s": "BTCUSDT",
                "p": "500.0", "P": "1.37", "w": "36800.0", "x": "36500.0",
                "c": "37000.0", "b": "36999.0", "a": "37001.0",
                "o": "36500.0", "h": "37200.0", "l": "36400.0",
                "v": "1234.5", "q": "45000000.0", "n": 98765
            }
        }"#;
        let update = match classify(json).unwrap() {
            InboundFrame::Update(u) => u,
            other => panic!("expected update, got {other:?}"),
        };
        match update.payload {
            StreamPayload::Ticker(t) => {
                assert_eq!(t.symbol, "BTCUSDT");
                assert!((t.last_price - 37000.0).abs() < f64::EPSILON);
                assert_eq!(t.trade_count, 98765);
            }
            other => panic!("expected ticker payload, got {other:?}"),
        }
    }

    #[test]
    fn unknown_topic_is_an_error_not_a_panic() {
        let json = r#"{"stream":"btcusdt@aggTrade","data":{}}"#;
        assert!(classify(json).is_err());
    }

    #[test]
    fn malformed_level_is_skipped_not_fatal() {
        let raw = vec![
            ["100.0".to_string(), "1.0".to_string()],
            ["oops".to_string(), "2.0".to_string()],
            ["99.0".to_string(), "3.0".to_string()],
        ];
        let levels = parse_levels(&raw);
        assert_eq!(levels.len(), 2);
        assert_eq!(levels[0].price, 100.0);
        assert_eq!(levels[1].price, 99.0);
    }
}
