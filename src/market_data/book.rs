// =============================================================================
// Order Book Reconciler — sequenced diffs over REST snapshots
// =============================================================================
//
// Owns per-symbol book state. Diffs are applied under a strict contiguity
// check (`U <= last_update_id + 1 <= u`); anything gapped or stale is dropped
// whole. Diffs that arrive before a symbol's snapshot exists are buffered
// per symbol and replayed in `u` order once the snapshot is installed.
//
// Lock order is books -> pending everywhere, so the buffer-or-apply decision
// and snapshot installation cannot interleave and lose a diff.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::types::{DepthUpdate, OrderBook, OrderBookLevel};

/// Sort one book side and cap it to `depth` levels.
///
/// Bids sort descending, asks ascending; ties cannot occur because levels
/// are upserted by exact price.
pub fn sort_and_cap(levels: &mut Vec<OrderBookLevel>, descending: bool, depth: usize) {
    if descending {
        levels.sort_by(|a, b| b.price.total_cmp(&a.price));
    } else {
        levels.sort_by(|a, b| a.price.total_cmp(&b.price));
    }
    levels.truncate(depth);
}

/// Apply one side's level changes in place: qty 0 removes the exact price,
/// anything else replaces or inserts.
fn apply_side(levels: &mut Vec<OrderBookLevel>, changes: &[OrderBookLevel]) {
    for change in changes {
        let existing = levels.iter().position(|l| l.price == change.price);
        match (existing, change.qty == 0.0) {
            (Some(i), true) => {
                levels.remove(i);
            }
            (Some(i), false) => {
                levels[i] = *change;
            }
            (None, false) => {
                levels.push(*change);
            }
            (None, true) => {}
        }
    }
}

/// Apply one diff to `book` under the strict contiguity check. Returns
/// `false` (book untouched) for gapped or stale updates.
fn apply_to_book(symbol: &str, book: &mut OrderBook, update: &DepthUpdate, depth: usize) -> bool {
    let next = book.last_update_id + 1;
    if update.first_update_id > next {
        warn!(
            symbol,
            last = book.last_update_id,
            first = update.first_update_id,
            "gap in depth stream, dropping update"
        );
        return false;
    }
    if update.final_update_id < next {
        debug!(
            symbol,
            last = book.last_update_id,
            final_id = update.final_update_id,
            "stale depth update dropped"
        );
        return false;
    }

    apply_side(&mut book.bids, &update.bids);
    apply_side(&mut book.asks, &update.asks);
    sort_and_cap(&mut book.bids, true, depth);
    sort_and_cap(&mut book.asks, false, depth);
    book.last_update_id = update.final_update_id;
    true
}

/// Per-symbol order-book state with pre-snapshot diff buffering.
pub struct BookReconciler {
    books: RwLock<HashMap<String, OrderBook>>,
    pending: RwLock<HashMap<String, Vec<DepthUpdate>>>,
    depth: usize,
}

impl BookReconciler {
    /// Create a reconciler that caps each book side at `depth` levels.
    pub fn new(depth: usize) -> Self {
        Self {
            books: RwLock::new(HashMap::new()),
            pending: RwLock::new(HashMap::new()),
            depth,
        }
    }

    /// Whether a snapshot has been installed for `symbol`.
    pub fn has_book(&self, symbol: &str) -> bool {
        self.books.read().contains_key(symbol)
    }

    /// Current book for `symbol`, if any.
    pub fn get(&self, symbol: &str) -> Option<OrderBook> {
        self.books.read().get(symbol).cloned()
    }

    /// Buffer `update` when the symbol has no snapshot yet. Returns `false`
    /// when a book exists and the update should take the normal apply path.
    pub fn buffer_if_absent(&self, symbol: &str, update: &DepthUpdate) -> bool {
        let books = self.books.read();
        if books.contains_key(symbol) {
            return false;
        }
        debug!(symbol, u = update.final_update_id, "buffering pre-snapshot depth update");
        self.pending
            .write()
            .entry(symbol.to_string())
            .or_default()
            .push(update.clone());
        true
    }

    /// Install a fresh snapshot for `symbol`, replaying any buffered diffs
    /// in `final_update_id` order through the normal contiguity check.
    /// Returns the book after replay.
    pub fn install_snapshot(&self, symbol: &str, mut book: OrderBook) -> OrderBook {
        sort_and_cap(&mut book.bids, true, self.depth);
        sort_and_cap(&mut book.asks, false, self.depth);

        let mut books = self.books.write();
        books.insert(symbol.to_string(), book);

        let mut buffered = self.pending.write().remove(symbol).unwrap_or_default();
        buffered.sort_by_key(|u| u.final_update_id);

        let entry = books.get_mut(symbol).expect("book inserted above");
        let mut applied = 0usize;
        for update in &buffered {
            if apply_to_book(symbol, entry, update, self.depth) {
                applied += 1;
            }
        }
        if !buffered.is_empty() {
            debug!(
                symbol,
                buffered = buffered.len(),
                applied,
                "replayed buffered depth updates over snapshot"
            );
        }

        entry.clone()
    }

    /// Apply one diff to the symbol's book.
    ///
    /// Returns the updated book, or `None` when no book exists yet or the
    /// diff fails the contiguity check (gapped or stale — dropped whole,
    /// `last_update_id` untouched).
    pub fn apply_update(&self, symbol: &str, update: &DepthUpdate) -> Option<OrderBook> {
        let mut books = self.books.write();
        let book = match books.get_mut(symbol) {
            Some(b) => b,
            None => {
                warn!(symbol, "depth update for symbol without a book");
                return None;
            }
        };

        if apply_to_book(symbol, book, update, self.depth) {
            Some(book.clone())
        } else {
            None
        }
    }

    /// Drop all state for one symbol (book and any buffered diffs).
    pub fn clear_symbol(&self, symbol: &str) {
        let mut books = self.books.write();
        books.remove(symbol);
        self.pending.write().remove(symbol);
    }

    /// Drop all books and buffers.
    pub fn clear_all(&self) {
        let mut books = self.books.write();
        books.clear();
        self.pending.write().clear();
    }
}
