// =============================================================================
// Subscription Registry — composite-keyed callback bundles
// =============================================================================
//
// Owns the map from subscription key to subscription. The key is a value
// type built from the sorted, de-duplicated symbols, intervals, and stream
// kinds, which makes `subscribe` idempotent per distinct parameter set: a
// repeat call replaces the callback bundle instead of creating a second
// live subscription.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::debug;

use crate::types::{ConnectionStatus, FeedCallbacks, GroupBy, StreamKind};

// ---------------------------------------------------------------------------
// Key
// ---------------------------------------------------------------------------

/// Identity of one subscription: sorted symbols × sorted intervals × sorted
/// stream kinds.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    symbols: Vec<String>,
    intervals: Vec<String>,
    kinds: Vec<StreamKind>,
}

impl SubscriptionKey {
    /// Build a key, normalizing the inputs: symbols are uppercased, all
    /// three components sorted and de-duplicated.
    pub fn new(symbols: &[String], intervals: &[String], kinds: &[StreamKind]) -> Self {
        let mut symbols: Vec<String> = symbols.iter().map(|s| s.to_uppercase()).collect();
        symbols.sort();
        symbols.dedup();

        let mut intervals: Vec<String> = intervals.to_vec();
        intervals.sort();
        intervals.dedup();

        let mut kinds: Vec<StreamKind> = kinds.to_vec();
        kinds.sort();
        kinds.dedup();

        Self {
            symbols,
            intervals,
            kinds,
        }
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub fn intervals(&self) -> &[String] {
        &self.intervals
    }

    pub fn kinds(&self) -> &[StreamKind] {
        &self.kinds
    }

    pub fn has_symbol(&self, symbol: &str) -> bool {
        self.symbols.iter().any(|s| s == symbol)
    }

    pub fn has_kind(&self, kind: StreamKind) -> bool {
        self.kinds.contains(&kind)
    }

    pub fn has_interval(&self, interval: &str) -> bool {
        self.intervals.iter().any(|i| i == interval)
    }
}

impl std::fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kinds: Vec<String> = self.kinds.iter().map(|k| k.to_string()).collect();
        write!(
            f,
            "{}|{}|{}",
            self.symbols.join("|"),
            self.intervals.join("|"),
            kinds.join("|")
        )
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// One live subscription: key, callbacks, and series parameters.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub key: SubscriptionKey,
    pub callbacks: FeedCallbacks,
    pub group_by: GroupBy,
    pub limit: usize,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Exclusive owner of the key → subscription map.
#[derive(Default)]
pub struct SubscriptionRegistry {
    subs: RwLock<HashMap<SubscriptionKey, Subscription>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a subscription. Returns `true` when the key was
    /// new; `false` when an existing entry had its callbacks and parameters
    /// replaced.
    pub fn upsert(&self, sub: Subscription) -> bool {
        let mut subs = self.subs.write();
        let replaced = subs.insert(sub.key.clone(), sub);
        if let Some(old) = &replaced {
            debug!(key = %old.key, "subscription callbacks replaced");
        }
        replaced.is_none()
    }

    /// Remove a subscription by key. Idempotent.
    pub fn remove(&self, key: &SubscriptionKey) -> Option<Subscription> {
        self.subs.write().remove(key)
    }

    /// Owned clone of the subscription at `key`.
    pub fn get(&self, key: &SubscriptionKey) -> Option<Subscription> {
        self.subs.read().get(key).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.subs.read().is_empty()
    }

    pub fn len(&self) -> usize {
        self.subs.read().len()
    }

    /// All subscriptions covering `(symbol, kind)`.
    ///
    /// Returns owned clones so no lock is held while callbacks run.
    pub fn matching(&self, symbol: &str, kind: StreamKind) -> Vec<Subscription> {
        self.subs
            .read()
            .values()
            .filter(|s| s.key.has_symbol(symbol) && s.key.has_kind(kind))
            .cloned()
            .collect()
    }

    /// All candle subscriptions covering `(symbol, interval)`.
    pub fn matching_candles(&self, symbol: &str, interval: &str) -> Vec<Subscription> {
        self.subs
            .read()
            .values()
            .filter(|s| {
                s.key.has_symbol(symbol)
                    && s.key.has_kind(StreamKind::Candles)
                    && s.key.has_interval(interval)
            })
            .cloned()
            .collect()
    }

    /// Whether any subscription covers `(symbol, kind)`.
    pub fn any_match(&self, symbol: &str, kind: StreamKind) -> bool {
        self.subs
            .read()
            .values()
            .any(|s| s.key.has_symbol(symbol) && s.key.has_kind(kind))
    }

    /// Owned snapshot of every live subscription.
    pub fn snapshot(&self) -> Vec<Subscription> {
        self.subs.read().values().cloned().collect()
    }

    /// Notify every subscription's status callback.
    pub fn broadcast_status(&self, status: ConnectionStatus) {
        let handlers: Vec<_> = self
            .subs
            .read()
            .values()
            .filter_map(|s| s.callbacks.on_connection_status.clone())
            .collect();
        for handler in handlers {
            handler(status);
        }
    }

    pub fn clear(&self) {
        self.subs.write().clear();
    }
}
