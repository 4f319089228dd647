pub mod book;
pub mod klines;

pub use book::BookReconciler;
pub use klines::{KlineAggregator, SeriesKey};
