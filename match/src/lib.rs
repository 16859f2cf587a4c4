//! Spot order matching and settlement over a transactional ledger.
//!
//! [`MatchEngine`] is the entry point: it places and cancels limit orders,
//! runs the batch matching pass and answers book and affordability queries.
//! State lives entirely in a [`LedgerStore`]; [`MySqlLedger`] backs
//! production and [`MemLedger`] keeps everything in process.

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod metrics;
pub mod server;

pub use config::{EngineConfig, RuntimeConfig};
pub use engine::data::OrderBook;
pub use engine::entry::{
    Asset, Order, OrderId, OrderStatus, Portfolio, Side, Trade, TradeId, User, UserId,
};
pub use engine::matchengine::MatchEngine;
pub use engine::spot::{OrderPreview, OrderRequest, COMMISSION_RATE};
pub use engine::store::{LedgerStore, MemLedger, MySqlLedger, OrderFilter, StoreError};
pub use error::ExchangeError;
pub use events::{BalanceReason, ChannelSink, EventSink, LedgerEvent, LogSink, NullSink};
