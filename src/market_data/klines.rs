// =============================================================================
// Kline Aggregator — time-bucketed candle series per subscription
// =============================================================================
//
// Maintains an ordered bucket-key → candle map per (subscription, symbol,
// interval). Series parameters (`group_by`, `limit`) belong to the
// subscription, so two subscriptions watching the same symbol never share
// state. Buckets are keyed by time, not arrival order: a late tick for a
// past bucket merges into that bucket, while the newest tick for the open
// bucket always wins its `close`.
// =============================================================================

use std::collections::{BTreeMap, HashMap};

use chrono::DateTime;
use parking_lot::RwLock;
use tracing::warn;

use crate::registry::SubscriptionKey;
use crate::types::{change_pct, iso_millis, Candle, GroupBy};

/// Identity of one aggregated series.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SeriesKey {
    pub subscription: SubscriptionKey,
    pub symbol: String,
    pub interval: String,
}

/// Bucket key for a tick's open time under the given granularity.
///
/// Sub-day grouping keys on the full timestamp, daily and weekly on the
/// date, monthly on the first of the month. Keys sort chronologically as
/// strings.
pub fn bucket_key(open_time_ms: i64, group_by: GroupBy) -> Option<String> {
    let dt = DateTime::from_timestamp_millis(open_time_ms)?;
    Some(match group_by {
        GroupBy::Hour => iso_millis(open_time_ms)?,
        GroupBy::Day | GroupBy::Week => dt.format("%Y-%m-%d").to_string(),
        GroupBy::Month => dt.format("%Y-%m-01").to_string(),
    })
}

/// Per-subscription candle series, keyed by bucket.
#[derive(Default)]
pub struct KlineAggregator {
    series: RwLock<HashMap<SeriesKey, BTreeMap<String, Candle>>>,
}

impl KlineAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one streaming tick into its bucket and return the updated,
    /// sorted, truncated series.
    #[allow(clippy::too_many_arguments)]
    pub fn apply_tick(
        &self,
        key: &SeriesKey,
        open_time_ms: i64,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
        group_by: GroupBy,
        limit: usize,
    ) -> Vec<Candle> {
        let bucket = match bucket_key(open_time_ms, group_by) {
            Some(b) => b,
            None => {
                warn!(open_time_ms, "tick with out-of-range timestamp dropped");
                return self.emit(key);
            }
        };

        let mut series = self.series.write();
        let map = series.entry(key.clone()).or_default();
        merge_point(map, bucket, &key.symbol, open, high, low, close, volume);
        trim(map, limit);
        map.values().cloned().collect()
    }

    /// Seed a series from REST-fetched candles, merging through the same
    /// bucket path as streaming ticks. Candles whose `time` cannot be
    /// parsed are skipped. Returns the resulting series.
    pub fn seed(
        &self,
        key: &SeriesKey,
        candles: &[Candle],
        group_by: GroupBy,
        limit: usize,
    ) -> Vec<Candle> {
        let mut series = self.series.write();
        let map = series.entry(key.clone()).or_default();

        for c in candles {
            let open_time_ms = match DateTime::parse_from_rfc3339(&c.time) {
                Ok(dt) => dt.timestamp_millis(),
                Err(e) => {
                    warn!(time = %c.time, error = %e, "skipping candle with unparseable time");
                    continue;
                }
            };
            let bucket = match bucket_key(open_time_ms, group_by) {
                Some(b) => b,
                None => continue,
            };
            merge_point(map, bucket, &key.symbol, c.open, c.high, c.low, c.close, c.volume);
        }

        trim(map, limit);
        map.values().cloned().collect()
    }

    /// Current series for `key` (sorted by bucket).
    pub fn emit(&self, key: &SeriesKey) -> Vec<Candle> {
        self.series
            .read()
            .get(key)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop every series owned by `subscription`.
    pub fn drop_for_subscription(&self, subscription: &SubscriptionKey) {
        self.series
            .write()
            .retain(|k, _| &k.subscription != subscription);
    }

    pub fn clear_all(&self) {
        self.series.write().clear();
    }
}

/// Merge one OHLCV point into its bucket: extremes widen, volume sums, the
/// newest close wins, `open` stays with the bucket's first point, and
/// `change` is recomputed from the bucket's final open/close.
#[allow(clippy::too_many_arguments)]
fn merge_point(
    map: &mut BTreeMap<String, Candle>,
    bucket: String,
    symbol: &str,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
) {
    match map.get_mut(&bucket) {
        Some(existing) => {
            existing.high = existing.high.max(high);
            existing.low = existing.low.min(low);
            existing.volume += volume;
            existing.close = close;
            existing.change = change_pct(existing.open, close);
        }
        None => {
            let candle = Candle {
                time: bucket.clone(),
                open,
                high,
                low,
                close,
                volume,
                change: change_pct(open, close),
                symbol: symbol.to_string(),
            };
            map.insert(bucket, candle);
        }
    }
}

/// Keep only the most recent `limit` buckets.
fn trim(map: &mut BTreeMap<String, Candle>, limit: usize) {
    if limit == 0 {
        return;
    }
    while map.len() > limit {
        map.pop_first();
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StreamKind;

    const HOUR_MS: i64 = 3_600_000;
    // 2024-01-01T00:00:00Z
    const BASE_MS: i64 = 1_704_067_200_000;

    fn series_key(symbol: &str, interval: &str) -> SeriesKey {
        SeriesKey {
            subscription: SubscriptionKey::new(
                &[symbol.to_string()],
                &[interval.to_string()],
                &[StreamKind::Candles],
            ),
            symbol: symbol.to_string(),
            interval: interval.to_string(),
        }
    }

    fn rest_candle(open_time_ms: i64, open: f64, close: f64) -> Candle {
        Candle {
            time: iso_millis(open_time_ms).unwrap(),
            open,
            high: open.max(close) + 1.0,
            low: open.min(close) - 1.0,
            close,
            volume: 10.0,
            change: change_pct(open, close),
            symbol: "BTCUSDT".to_string(),
        }
    }

    #[test]
    fn bucket_keys_per_granularity() {
        // 2024-03-15T13:45:00Z
        let ms = 1_710_510_300_000;
        assert_eq!(
            bucket_key(ms, GroupBy::Hour).unwrap(),
            "2024-03-15T13:45:00.000Z"
        );
        assert_eq!(bucket_key(ms, GroupBy::Day).unwrap(), "2024-03-15");
        assert_eq!(bucket_key(ms, GroupBy::Week).unwrap(), "2024-03-15");
        assert_eq!(bucket_key(ms, GroupBy::Month).unwrap(), "2024-03-01");
    }

    #[test]
    fn same_bucket_merges_extremes_volume_and_close() {
        let agg = KlineAggregator::new();
        let key = series_key("BTCUSDT", "1h");

        agg.apply_tick(&key, BASE_MS, 100.0, 105.0, 98.0, 102.0, 5.0, GroupBy::Hour, 30);
        let series =
            agg.apply_tick(&key, BASE_MS, 102.0, 110.0, 95.0, 104.0, 3.0, GroupBy::Hour, 30);

        assert_eq!(series.len(), 1);
        let bucket = &series[0];
        assert_eq!(bucket.high, 110.0);
        assert_eq!(bucket.low, 95.0);
        assert_eq!(bucket.volume, 8.0);
        assert_eq!(bucket.close, 104.0);
        // Open belongs to the first point of the bucket.
        assert_eq!(bucket.open, 100.0);
        // Change follows the bucket's own open/close.
        assert!((bucket.change - change_pct(100.0, 104.0)).abs() < 1e-9);
    }

    #[test]
    fn distinct_buckets_stay_separate_and_sorted() {
        let agg = KlineAggregator::new();
        let key = series_key("BTCUSDT", "1h");

        // Out of arrival order on purpose.
        agg.apply_tick(&key, BASE_MS + HOUR_MS, 101.0, 102.0, 100.0, 101.5, 1.0, GroupBy::Hour, 30);
        let series =
            agg.apply_tick(&key, BASE_MS, 100.0, 101.0, 99.0, 100.5, 1.0, GroupBy::Hour, 30);

        assert_eq!(series.len(), 2);
        assert!(series[0].time < series[1].time);
        assert_eq!(series[0].open, 100.0);
    }

    #[test]
    fn limit_keeps_most_recent_buckets() {
        let agg = KlineAggregator::new();
        let key = series_key("BTCUSDT", "1h");

        let mut series = Vec::new();
        for i in 0..5 {
            series = agg.apply_tick(
                &key,
                BASE_MS + i * HOUR_MS,
                100.0,
                101.0,
                99.0,
                100.0 + i as f64,
                1.0,
                GroupBy::Hour,
                3,
            );
        }

        assert_eq!(series.len(), 3);
        assert_eq!(series[0].close, 102.0);
        assert_eq!(series[2].close, 104.0);
    }

    #[test]
    fn late_tick_for_past_bucket_is_merged() {
        let agg = KlineAggregator::new();
        let key = series_key("BTCUSDT", "1h");

        agg.apply_tick(&key, BASE_MS, 100.0, 101.0, 99.0, 100.0, 1.0, GroupBy::Hour, 30);
        agg.apply_tick(&key, BASE_MS + HOUR_MS, 100.0, 102.0, 99.5, 101.0, 1.0, GroupBy::Hour, 30);
        // Late arrival for the first bucket.
        let series =
            agg.apply_tick(&key, BASE_MS, 100.0, 108.0, 99.0, 100.2, 2.0, GroupBy::Hour, 30);

        assert_eq!(series.len(), 2);
        assert_eq!(series[0].high, 108.0);
        assert_eq!(series[0].volume, 3.0);
    }

    #[test]
    fn rest_seed_then_live_ticks_for_open_hour() {
        let agg = KlineAggregator::new();
        let key = series_key("BTCUSDT", "1h");

        // 24 sequential hourly candles from the REST fetch.
        let candles: Vec<Candle> = (0..24)
            .map(|i| rest_candle(BASE_MS + i * HOUR_MS, 100.0 + i as f64, 101.0 + i as f64))
            .collect();
        let series = agg.seed(&key, &candles, GroupBy::Hour, 24);
        assert_eq!(series.len(), 24);

        // Three streaming ticks for the in-progress 24th hour.
        let open_ms = BASE_MS + 23 * HOUR_MS;
        agg.apply_tick(&key, open_ms, 123.0, 125.0, 122.0, 124.2, 1.0, GroupBy::Hour, 24);
        agg.apply_tick(&key, open_ms, 123.0, 126.0, 121.0, 123.8, 1.0, GroupBy::Hour, 24);
        let series =
            agg.apply_tick(&key, open_ms, 123.0, 126.5, 121.5, 125.1, 1.0, GroupBy::Hour, 24);

        assert_eq!(series.len(), 24);
        assert_eq!(series.last().unwrap().close, 125.1);
    }

    #[test]
    fn seed_skips_unparseable_times() {
        let agg = KlineAggregator::new();
        let key = series_key("BTCUSDT", "1h");

        let mut candles = vec![rest_candle(BASE_MS, 100.0, 101.0)];
        candles.push(Candle {
            time: "not-a-timestamp".to_string(),
            ..rest_candle(BASE_MS + HOUR_MS, 100.0, 101.0)
        });

        let series = agg.seed(&key, &candles, GroupBy::Hour, 30);
        assert_eq!(series.len(), 1);
    }

    #[test]
    fn subscriptions_do_not_share_series_state() {
        let agg = KlineAggregator::new();
        let a = series_key("BTCUSDT", "1h");
        let mut b = series_key("BTCUSDT", "1h");
        b.subscription = SubscriptionKey::new(
            &["BTCUSDT".to_string(), "ETHUSDT".to_string()],
            &["1h".to_string()],
            &[StreamKind::Candles],
        );

        agg.apply_tick(&a, BASE_MS, 100.0, 101.0, 99.0, 100.0, 1.0, GroupBy::Hour, 30);
        assert!(agg.emit(&b).is_empty());

        agg.drop_for_subscription(&a.subscription);
        assert!(agg.emit(&a).is_empty());
    }

    #[test]
    fn month_grouping_collapses_a_quarter_into_three_buckets() {
        let agg = KlineAggregator::new();
        let key = series_key("BTCUSDT", "1d");

        // Daily candles across Jan-Mar 2024.
        let day = 86_400_000;
        let mut series = Vec::new();
        for i in 0..90 {
            series = agg.apply_tick(
                &key,
                BASE_MS + i * day,
                100.0,
                101.0,
                99.0,
                100.5,
                1.0,
                GroupBy::Month,
                12,
            );
        }

        assert_eq!(series.len(), 3);
        assert_eq!(series[0].time, "2024-01-01");
        assert_eq!(series[1].time, "2024-02-01");
        assert_eq!(series[2].time, "2024-03-01");
        assert_eq!(series[0].volume, 31.0);
    }
}
