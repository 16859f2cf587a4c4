//! Data Structures Module
//!
//! Order book views over the ledger: open orders of a symbol in price-time
//! priority, read either as a committed snapshot or under row locks.

pub mod orderbook;

pub use orderbook::{OrderBook, OrderBookRepo};
