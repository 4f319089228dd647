// =============================================================================
// Feed Client — one multiplexed transport fanned out to many subscribers
// =============================================================================
//
// Owns the single WebSocket connection and everything attached to it: the
// subscription registry, the order-book reconciler, the kline aggregator,
// and the update coalescer. All stream processing happens on one path:
//
//   inbound frame -> classify -> (pre-snapshot buffer | coalescer queue)
//                 -> flush -> reconciler/aggregator/ticker -> callbacks
//
// The connection task is the only owner of the socket; subscribe and
// unsubscribe talk to it over a command channel. Reconnection is bounded
// with a linear backoff; after the last failed attempt the client
// broadcasts one terminal `Failed to reconnect` and stops until a fresh
// `subscribe` call.
// =============================================================================

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::binance::frame::{self, InboundFrame, StreamPayload, StreamUpdate};
use crate::binance::rest::MarketDataApi;
use crate::coalesce::UpdateQueue;
use crate::config::FeedConfig;
use crate::market_data::book::BookReconciler;
use crate::market_data::klines::{KlineAggregator, SeriesKey};
use crate::registry::{Subscription, SubscriptionKey, SubscriptionRegistry};
use crate::types::{ConnectionStatus, FeedCallbacks, GroupBy, StreamKind};

// ---------------------------------------------------------------------------
// Connection state machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

/// Commands from the facade to the connection task.
enum ConnCommand {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
    Shutdown,
}

/// Why the read loop for one transport session ended.
enum Disconnect {
    Shutdown,
    Error,
    Closed,
}

struct ConnHandle {
    state: ConnState,
    cmd_tx: Option<mpsc::UnboundedSender<ConnCommand>>,
    /// Incremented whenever a connection task is spawned or torn down, so a
    /// task that outlived its teardown cannot stomp the state of its
    /// successor.
    epoch: u64,
}

// ---------------------------------------------------------------------------
// Client facade
// ---------------------------------------------------------------------------

/// Handle returned by [`FeedClient::subscribe`]. The only cancellation
/// primitive: `unsubscribe` is idempotent and a no-op once the client (or
/// the subscription) is already gone.
pub struct SubscriptionHandle {
    key: SubscriptionKey,
    inner: Weak<FeedInner>,
}

impl SubscriptionHandle {
    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    pub fn unsubscribe(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.unsubscribe(&self.key);
        }
    }
}

/// Multiplexed market-data feed client.
///
/// Explicitly constructed and owned; cloning shares the same underlying
/// connection. Methods that spawn background work (`subscribe`) must be
/// called from within a Tokio runtime.
#[derive(Clone)]
pub struct FeedClient {
    inner: Arc<FeedInner>,
}

impl FeedClient {
    pub fn new(config: FeedConfig) -> Self {
        let api = MarketDataApi::new(config.rest_url.clone(), config.request_timeout_secs);
        let inner = FeedInner {
            books: BookReconciler::new(config.depth_limit),
            klines: KlineAggregator::new(),
            registry: SubscriptionRegistry::new(),
            queue: UpdateQueue::new(config.coalesce_window_ms),
            conn: Mutex::new(ConnHandle {
                state: ConnState::Disconnected,
                cmd_tx: None,
                epoch: 0,
            }),
            frame_id: AtomicU64::new(0),
            api,
            config,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Register (or refresh) a subscription and return its handle.
    ///
    /// The key is the sorted union of symbols, intervals, and stream kinds;
    /// a second call with identical parameters replaces the callback bundle
    /// instead of creating a duplicate live subscription, duplicate network
    /// topics, or duplicate REST fetches. Initial state is primed in the
    /// background: historical candles and a depth snapshot are fetched (or
    /// served from cache) and delivered immediately.
    pub fn subscribe(
        &self,
        symbols: &[String],
        intervals: &[String],
        kinds: &[StreamKind],
        callbacks: FeedCallbacks,
        group_by: GroupBy,
        limit: usize,
    ) -> SubscriptionHandle {
        let key = SubscriptionKey::new(symbols, intervals, kinds);
        let fresh = self.inner.registry.upsert(Subscription {
            key: key.clone(),
            callbacks,
            group_by,
            limit,
        });
        info!(key = %key, fresh, "subscribe");

        let inner = self.inner.clone();
        let prime_key = key.clone();
        tokio::spawn(async move {
            inner.prime_subscription(&prime_key).await;
        });

        self.inner.ensure_connection();

        SubscriptionHandle {
            key,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Tear everything down: every subscription, all cached state, and the
    /// transport.
    pub fn close(&self) {
        self.inner.registry.clear();
        self.inner.teardown();
    }

    pub fn active_subscriptions(&self) -> usize {
        self.inner.registry.len()
    }
}

// ---------------------------------------------------------------------------
// Inner state
// ---------------------------------------------------------------------------

struct FeedInner {
    config: FeedConfig,
    api: MarketDataApi,
    registry: SubscriptionRegistry,
    books: BookReconciler,
    klines: KlineAggregator,
    queue: UpdateQueue,
    conn: Mutex<ConnHandle>,
    frame_id: AtomicU64,
}

impl FeedInner {
    fn next_frame_id(&self) -> u64 {
        self.frame_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Update the connection state, but only on behalf of the current
    /// connection task.
    fn set_state_if(&self, epoch: u64, state: ConnState) {
        let mut conn = self.conn.lock();
        if conn.epoch == epoch {
            conn.state = state;
        }
    }

    // -- topic bookkeeping ---------------------------------------------------

    /// Sorted union of every topic implied by the live subscriptions.
    fn desired_topics(&self) -> Vec<String> {
        let mut topics = BTreeSet::new();
        for sub in self.registry.snapshot() {
            for topic in topics_for_subscription(&sub.key) {
                topics.insert(topic);
            }
        }
        topics.into_iter().collect()
    }

    // -- subscribe path ------------------------------------------------------

    /// Prime a fresh (or refreshed) subscription: deliver cached series and
    /// books where they exist, REST-fetch where they do not. "No data" is a
    /// valid outcome — candle callbacks fire even with an empty series.
    async fn prime_subscription(self: &Arc<Self>, key: &SubscriptionKey) {
        let Some(sub) = self.registry.get(key) else {
            return;
        };

        if sub.key.has_kind(StreamKind::Candles) {
            for symbol in sub.key.symbols() {
                for interval in sub.key.intervals() {
                    let series_key = SeriesKey {
                        subscription: key.clone(),
                        symbol: symbol.clone(),
                        interval: interval.clone(),
                    };
                    let mut series = self.klines.emit(&series_key);
                    if series.is_empty() {
                        let fetched = self.api.fetch_candles(symbol, interval, sub.limit).await;
                        if !fetched.is_empty() {
                            series =
                                self.klines
                                    .seed(&series_key, &fetched, sub.group_by, sub.limit);
                        }
                    }
                    // Callbacks may have been replaced while we fetched.
                    if let Some(cb) = self
                        .registry
                        .get(key)
                        .and_then(|s| s.callbacks.on_candle_update)
                    {
                        cb(&series, symbol, interval);
                    }
                }
            }
        }

        if sub.key.has_kind(StreamKind::Depth) {
            for symbol in sub.key.symbols() {
                let book = match self.books.get(symbol) {
                    Some(book) => Some(book),
                    None => self
                        .api
                        .fetch_depth_snapshot(symbol, self.config.depth_limit)
                        .await
                        .map(|snapshot| self.books.install_snapshot(symbol, snapshot)),
                };
                if let Some(book) = book {
                    if let Some(cb) = self
                        .registry
                        .get(key)
                        .and_then(|s| s.callbacks.on_order_book_update)
                    {
                        cb(&book, symbol);
                    }
                }
            }
        }
    }

    /// Make sure a transport exists (or is being established) and carries
    /// every desired topic.
    fn ensure_connection(self: &Arc<Self>) {
        let mut conn = self.conn.lock();
        match conn.state {
            ConnState::Connected => {
                // Re-issue the full union; the provider treats duplicate
                // subscribes as no-ops.
                let topics = self.desired_topics();
                if let (Some(tx), false) = (&conn.cmd_tx, topics.is_empty()) {
                    let _ = tx.send(ConnCommand::Subscribe(topics));
                }
            }
            ConnState::Connecting | ConnState::Reconnecting => {
                // The resubscribe-on-open path will pick the new topics up.
            }
            ConnState::Disconnected | ConnState::Failed => {
                let (tx, rx) = mpsc::unbounded_channel();
                conn.cmd_tx = Some(tx);
                conn.state = ConnState::Connecting;
                conn.epoch += 1;
                let epoch = conn.epoch;
                let inner = self.clone();
                tokio::spawn(async move {
                    inner.run_connection(rx, epoch).await;
                });
            }
        }
    }

    // -- unsubscribe path ----------------------------------------------------

    fn unsubscribe(self: &Arc<Self>, key: &SubscriptionKey) {
        let Some(removed) = self.registry.remove(key) else {
            return;
        };
        info!(key = %key, "unsubscribe");

        self.klines.drop_for_subscription(key);
        for symbol in removed.key.symbols() {
            if !self.registry.any_match(symbol, StreamKind::Depth) {
                self.books.clear_symbol(symbol);
            }
        }

        if self.registry.is_empty() {
            self.teardown();
            return;
        }

        // Drop only the topics no surviving subscription still wants.
        let desired: BTreeSet<String> = self.desired_topics().into_iter().collect();
        let stale: Vec<String> = topics_for_subscription(&removed.key)
            .into_iter()
            .filter(|t| !desired.contains(t))
            .collect();
        if !stale.is_empty() {
            let conn = self.conn.lock();
            if conn.state == ConnState::Connected {
                if let Some(tx) = &conn.cmd_tx {
                    let _ = tx.send(ConnCommand::Unsubscribe(stale));
                }
            }
        }
    }

    /// Full transport teardown with the "no dangling state" policy: every
    /// buffered book, series, and pending update is cleared.
    fn teardown(&self) {
        {
            let mut conn = self.conn.lock();
            if let Some(tx) = conn.cmd_tx.take() {
                let _ = tx.send(ConnCommand::Shutdown);
            }
            conn.state = ConnState::Disconnected;
            conn.epoch += 1;
        }
        self.books.clear_all();
        self.klines.clear_all();
        self.queue.clear();
        info!("transport torn down, all buffered state cleared");
    }

    // -- connection task -----------------------------------------------------

    async fn run_connection(
        self: Arc<Self>,
        mut cmd_rx: mpsc::UnboundedReceiver<ConnCommand>,
        epoch: u64,
    ) {
        let mut attempt: u32 = 0;
        let mut sessions: u32 = 0;

        loop {
            self.registry.broadcast_status(ConnectionStatus::Connecting);

            match connect_async(&self.config.ws_url).await {
                Ok((ws, _response)) => {
                    info!(url = %self.config.ws_url, "stream connected");
                    attempt = 0;
                    self.set_state_if(epoch, ConnState::Connected);
                    self.registry.broadcast_status(ConnectionStatus::Connected);

                    let (mut write, mut read) = ws.split();

                    let topics = self.desired_topics();
                    if !topics.is_empty() {
                        let frame =
                            frame::control_frame("SUBSCRIBE", &topics, self.next_frame_id());
                        debug!(count = topics.len(), "subscribing stream topics");
                        if let Err(e) = write.send(Message::Text(frame)).await {
                            warn!(error = %e, "failed to send subscribe frame");
                        }
                    }

                    if sessions > 0 {
                        // Book state does not survive a reconnect; candle and
                        // ticker state resumes from streaming.
                        self.refetch_depth_snapshots();
                    }
                    sessions += 1;

                    let reason = loop {
                        tokio::select! {
                            cmd = cmd_rx.recv() => match cmd {
                                Some(ConnCommand::Subscribe(topics)) => {
                                    let frame = frame::control_frame(
                                        "SUBSCRIBE", &topics, self.next_frame_id());
                                    if let Err(e) = write.send(Message::Text(frame)).await {
                                        error!(error = %e, "subscribe frame send failed");
                                        break Disconnect::Error;
                                    }
                                }
                                Some(ConnCommand::Unsubscribe(topics)) => {
                                    let frame = frame::control_frame(
                                        "UNSUBSCRIBE", &topics, self.next_frame_id());
                                    if let Err(e) = write.send(Message::Text(frame)).await {
                                        error!(error = %e, "unsubscribe frame send failed");
                                        break Disconnect::Error;
                                    }
                                }
                                Some(ConnCommand::Shutdown) | None => {
                                    let _ = write.send(Message::Close(None)).await;
                                    break Disconnect::Shutdown;
                                }
                            },
                            msg = read.next() => match msg {
                                Some(Ok(Message::Text(text))) => self.handle_frame(&text),
                                Some(Ok(Message::Ping(data))) => {
                                    if write.send(Message::Pong(data)).await.is_err() {
                                        break Disconnect::Error;
                                    }
                                }
                                Some(Ok(Message::Close(_))) => {
                                    info!("close frame received");
                                    break Disconnect::Closed;
                                }
                                Some(Ok(_)) => {}
                                Some(Err(e)) => {
                                    error!(error = %e, "stream read error");
                                    break Disconnect::Error;
                                }
                                None => {
                                    warn!("stream ended");
                                    break Disconnect::Closed;
                                }
                            }
                        }
                    };

                    match reason {
                        Disconnect::Shutdown => {
                            self.set_state_if(epoch, ConnState::Disconnected);
                            return;
                        }
                        Disconnect::Error => {
                            self.registry.broadcast_status(ConnectionStatus::Error)
                        }
                        Disconnect::Closed => {
                            self.registry.broadcast_status(ConnectionStatus::Disconnected)
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, url = %self.config.ws_url, "stream connect failed");
                    self.registry.broadcast_status(ConnectionStatus::Error);
                }
            }

            // -- reconnection policy: bounded, linear backoff ---------------
            if self.registry.is_empty() {
                self.set_state_if(epoch, ConnState::Disconnected);
                return;
            }
            attempt += 1;
            if attempt > self.config.max_reconnect_attempts {
                warn!(
                    attempts = self.config.max_reconnect_attempts,
                    "reconnect attempts exhausted"
                );
                self.set_state_if(epoch, ConnState::Failed);
                self.registry.broadcast_status(ConnectionStatus::Failed);
                return;
            }
            self.set_state_if(epoch, ConnState::Reconnecting);
            let delay =
                Duration::from_millis(self.config.reconnect_base_delay_ms * u64::from(attempt));
            info!(
                attempt,
                max = self.config.max_reconnect_attempts,
                delay_ms = delay.as_millis() as u64,
                "reconnecting"
            );

            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    cmd = cmd_rx.recv() => match cmd {
                        Some(ConnCommand::Shutdown) | None => {
                            self.set_state_if(epoch, ConnState::Disconnected);
                            return;
                        }
                        // Topic changes are picked up by resubscribe-on-open.
                        Some(_) => {}
                    }
                }
            }
        }
    }

    /// Clear and re-fetch the book of every symbol with a live depth
    /// subscription.
    fn refetch_depth_snapshots(self: &Arc<Self>) {
        let mut symbols = BTreeSet::new();
        for sub in self.registry.snapshot() {
            if sub.key.has_kind(StreamKind::Depth) {
                for symbol in sub.key.symbols() {
                    symbols.insert(symbol.clone());
                }
            }
        }

        for symbol in symbols {
            self.books.clear_symbol(&symbol);
            let inner = self.clone();
            tokio::spawn(async move {
                let snapshot = inner
                    .api
                    .fetch_depth_snapshot(&symbol, inner.config.depth_limit)
                    .await;
                if let Some(snapshot) = snapshot {
                    let book = inner.books.install_snapshot(&symbol, snapshot);
                    for sub in inner.registry.matching(&symbol, StreamKind::Depth) {
                        if let Some(cb) = sub.callbacks.on_order_book_update {
                            cb(&book, &symbol);
                        }
                    }
                }
            });
        }
    }

    // -- demultiplexing ------------------------------------------------------

    fn handle_frame(self: &Arc<Self>, text: &str) {
        match frame::classify(text) {
            Ok(InboundFrame::Ack { id }) => debug!(id, "subscription ack"),
            Ok(InboundFrame::Update(update)) => self.route_update(update),
            Err(e) => warn!(error = %e, "dropping undeliverable frame"),
        }
    }

    /// Route one classified update: pre-snapshot depth diffs go to the
    /// per-symbol buffer, everything else onto the coalescer queue.
    fn route_update(self: &Arc<Self>, update: StreamUpdate) {
        if !self.registry.any_match(&update.symbol, update.kind) {
            warn!(symbol = %update.symbol, kind = %update.kind, "no subscription for stream update");
            return;
        }

        if update.kind == StreamKind::Depth {
            if let StreamPayload::Depth(depth) = &update.payload {
                if self.books.buffer_if_absent(&update.symbol, depth) {
                    return;
                }
            }
        }

        if self.queue.push(update) {
            let inner = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(inner.queue.window()).await;
                inner.flush_pending();
            });
        }
    }

    /// Drain the coalescer and dispatch every item in arrival order.
    fn flush_pending(&self) {
        for update in self.queue.drain() {
            self.dispatch(update);
        }
    }

    fn dispatch(&self, update: StreamUpdate) {
        match update.payload {
            StreamPayload::Candle(tick) => {
                let Some(interval) = update.interval else {
                    warn!(symbol = %update.symbol, "candle update without interval");
                    return;
                };
                for sub in self.registry.matching_candles(&update.symbol, &interval) {
                    let series_key = SeriesKey {
                        subscription: sub.key.clone(),
                        symbol: update.symbol.clone(),
                        interval: interval.clone(),
                    };
                    let series = self.klines.apply_tick(
                        &series_key,
                        tick.open_time_ms,
                        tick.open,
                        tick.high,
                        tick.low,
                        tick.close,
                        tick.volume,
                        sub.group_by,
                        sub.limit,
                    );
                    if let Some(cb) = sub.callbacks.on_candle_update {
                        cb(&series, &update.symbol, &interval);
                    }
                }
            }
            StreamPayload::Depth(depth) => {
                if let Some(book) = self.books.apply_update(&update.symbol, &depth) {
                    for sub in self.registry.matching(&update.symbol, StreamKind::Depth) {
                        if let Some(cb) = sub.callbacks.on_order_book_update {
                            cb(&book, &update.symbol);
                        }
                    }
                }
            }
            StreamPayload::Ticker(ticker) => {
                for sub in self.registry.matching(&update.symbol, StreamKind::Ticker) {
                    if let Some(cb) = sub.callbacks.on_ticker_update {
                        cb(&ticker, &update.symbol);
                    }
                }
            }
        }
    }
}

/// Every provider topic one subscription implies.
fn topics_for_subscription(key: &SubscriptionKey) -> Vec<String> {
    let mut topics = Vec::new();
    for symbol in key.symbols() {
        for kind in key.kinds() {
            match kind {
                StreamKind::Candles => {
                    for interval in key.intervals() {
                        topics.push(frame::topic_for(symbol, *kind, Some(interval)));
                    }
                }
                StreamKind::Depth | StreamKind::Ticker => {
                    topics.push(frame::topic_for(symbol, *kind, None));
                }
            }
        }
    }
    topics
}
