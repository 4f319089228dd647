pub mod frame;
pub mod rest;

pub use frame::{InboundFrame, StreamPayload, StreamUpdate};
pub use rest::MarketDataApi;
