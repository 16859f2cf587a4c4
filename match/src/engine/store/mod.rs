//! Ledger Store
//!
//! Transactional row storage for users, assets, orders and trades. All shared
//! ledger state lives here; the engine keeps nothing between transactions.
//!
//! - `memory`: in-process rows with per-row locks and buffered writes
//! - `mysql`: InnoDB through sqlx, row locks via `SELECT ... FOR UPDATE`
//!
//! Dropping a [`LedgerTx`] without calling [`LedgerTx::commit`] rolls it back.

pub mod memory;
pub mod mysql;

pub use memory::MemLedger;
pub use mysql::MySqlLedger;

use crate::engine::entry::{
    Asset, NewOrder, NewTrade, Order, OrderId, OrderStatus, Side, Trade, User, UserId,
};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("deadlock detected")]
    Deadlock,

    #[error("lock wait timeout on {0}")]
    LockTimeout(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("inconsistent ledger row: {0}")]
    Inconsistent(String),

    #[error("undecodable row: {0}")]
    Decode(String),

    #[error("transaction already finished")]
    Finished,

    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Deadlock | StoreError::LockTimeout(_) | StoreError::Unavailable(_)
        )
    }
}

/// Optional criteria for [`LedgerStore::find_orders`]; `None` matches anything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderFilter {
    pub symbol: Option<String>,
    pub side: Option<Side>,
    pub status: Option<OrderStatus>,
    pub user_id: Option<UserId>,
}

impl OrderFilter {
    pub fn matches(&self, order: &Order) -> bool {
        self.symbol.as_deref().map_or(true, |s| s == order.symbol)
            && self.side.map_or(true, |s| s == order.side)
            && self.status.map_or(true, |s| s == order.status)
            && self.user_id.map_or(true, |u| u == order.user_id)
    }
}

/// Committed-state reads and the entry point for transactions.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn begin<'a>(&'a self) -> Result<Box<dyn LedgerTx + 'a>, StoreError>;

    async fn user(&self, id: UserId) -> Result<Option<User>, StoreError>;

    async fn asset(&self, user_id: UserId, symbol: &str) -> Result<Option<Asset>, StoreError>;

    /// Every holding of `user_id`, ordered by symbol.
    async fn assets_of(&self, user_id: UserId) -> Result<Vec<Asset>, StoreError>;

    /// Open orders of one side of a book, in ascending id order.
    async fn open_orders(&self, symbol: &str, side: Side) -> Result<Vec<Order>, StoreError>;

    /// Orders matching `filter`, newest first.
    async fn find_orders(&self, filter: &OrderFilter) -> Result<Vec<Order>, StoreError>;

    /// Up to `limit` trades, newest first.
    async fn recent_trades(&self, limit: usize) -> Result<Vec<Trade>, StoreError>;
}

/// One open transaction. `lock_*` calls take an exclusive row lock held until
/// the transaction ends; a lock on a missing asset row still reserves the key.
/// `save_*` calls are only issued for rows this transaction has locked.
#[async_trait]
pub trait LedgerTx: Send {
    async fn lock_user(&mut self, id: UserId) -> Result<Option<User>, StoreError>;

    async fn save_user(&mut self, user: &User) -> Result<(), StoreError>;

    async fn lock_asset(
        &mut self,
        user_id: UserId,
        symbol: &str,
    ) -> Result<Option<Asset>, StoreError>;

    /// Inserts or overwrites the (user, symbol) row.
    async fn save_asset(&mut self, asset: &Asset) -> Result<(), StoreError>;

    async fn lock_order(&mut self, id: OrderId) -> Result<Option<Order>, StoreError>;

    /// Non-locking read of one side's open orders, in ascending id order,
    /// including this transaction's own writes.
    async fn open_orders(&mut self, symbol: &str, side: Side) -> Result<Vec<Order>, StoreError>;

    /// Locks every open order of `symbol` (both sides) in ascending id order
    /// and returns them in that order.
    async fn lock_open_orders(&mut self, symbol: &str) -> Result<Vec<Order>, StoreError>;

    async fn insert_order(&mut self, order: NewOrder) -> Result<Order, StoreError>;

    async fn save_order(&mut self, order: &Order) -> Result<(), StoreError>;

    async fn insert_trade(&mut self, trade: NewTrade) -> Result<Trade, StoreError>;

    async fn commit(&mut self) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn filter_matches_on_every_given_field() {
        let order = NewOrder {
            user_id: 4,
            symbol: "BTC/USDT".to_string(),
            side: Side::Sell,
            price: dec!(1),
            amount: dec!(1),
            created_at: 0,
        }
        .into_order(1);

        assert!(OrderFilter::default().matches(&order));
        let filter = OrderFilter {
            symbol: Some("BTC/USDT".to_string()),
            side: Some(Side::Sell),
            status: Some(OrderStatus::Open),
            user_id: Some(4),
        };
        assert!(filter.matches(&order));
        let other_user = OrderFilter {
            user_id: Some(5),
            ..filter
        };
        assert!(!other_user.matches(&order));
    }
}
