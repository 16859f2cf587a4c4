//! MySQL ledger
//!
//! Expects InnoDB tables shaped as follows (provisioning is left to the
//! deployment):
//!
//! ```sql
//! CREATE TABLE users (
//!     id       BIGINT UNSIGNED NOT NULL AUTO_INCREMENT PRIMARY KEY,
//!     balance  DECIMAL(20,8)   NOT NULL DEFAULT 0
//! );
//! CREATE TABLE assets (
//!     user_id        BIGINT UNSIGNED NOT NULL,
//!     symbol         VARCHAR(10)     NOT NULL,
//!     amount         DECIMAL(20,8)   NOT NULL DEFAULT 0,
//!     locked_amount  DECIMAL(20,8)   NOT NULL DEFAULT 0,
//!     PRIMARY KEY (user_id, symbol)
//! );
//! CREATE TABLE orders (
//!     id          BIGINT UNSIGNED  NOT NULL AUTO_INCREMENT PRIMARY KEY,
//!     user_id     BIGINT UNSIGNED  NOT NULL,
//!     symbol      VARCHAR(10)      NOT NULL,
//!     side        VARCHAR(4)       NOT NULL,  -- 'buy' | 'sell'
//!     price       DECIMAL(20,8)    NOT NULL,
//!     amount      DECIMAL(20,8)    NOT NULL,
//!     status      TINYINT UNSIGNED NOT NULL,  -- 1 open, 2 filled, 3 canceled
//!     created_at  BIGINT UNSIGNED  NOT NULL,  -- unix millis
//!     KEY idx_book (symbol, status, side)
//! );
//! CREATE TABLE trades (
//!     id             BIGINT UNSIGNED NOT NULL AUTO_INCREMENT PRIMARY KEY,
//!     symbol         VARCHAR(10)     NOT NULL,
//!     buy_order_id   BIGINT UNSIGNED NOT NULL,
//!     sell_order_id  BIGINT UNSIGNED NOT NULL,
//!     price          DECIMAL(20,8)   NOT NULL,
//!     amount         DECIMAL(20,8)   NOT NULL,
//!     commission     DECIMAL(20,8)   NOT NULL,
//!     created_at     BIGINT UNSIGNED NOT NULL
//! );
//! ```
//!
//! Row locks are `SELECT ... FOR UPDATE` inside the transaction. Locking a
//! missing asset key takes InnoDB's gap lock on it, so two transactions can not
//! both create the same row.

use super::{LedgerStore, LedgerTx, OrderFilter, StoreError};
use crate::engine::entry::{
    Asset, NewOrder, NewTrade, Order, OrderId, OrderStatus, Side, Trade, User, UserId,
};
use async_trait::async_trait;
use sqlx::mysql::{MySql, MySqlConnection, MySqlDatabaseError, MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::{QueryBuilder, Row, Transaction};

const ORDER_COLUMNS: &str = "id, user_id, symbol, side, price, amount, status, created_at";
const TRADE_COLUMNS: &str =
    "id, symbol, buy_order_id, sell_order_id, price, amount, commission, created_at";

const ER_LOCK_WAIT_TIMEOUT: u16 = 1205;
const ER_LOCK_DEADLOCK: u16 = 1213;

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if let Some(mysql_err) = db_err.try_downcast_ref::<MySqlDatabaseError>() {
                match mysql_err.number() {
                    ER_LOCK_DEADLOCK => return StoreError::Deadlock,
                    ER_LOCK_WAIT_TIMEOUT => {
                        return StoreError::LockTimeout(mysql_err.message().to_string())
                    }
                    _ => {}
                }
            }
        }
        match err {
            sqlx::Error::Io(e) => StoreError::Unavailable(e.to_string()),
            sqlx::Error::PoolTimedOut => StoreError::Unavailable("pool timed out".to_string()),
            other => StoreError::Database(other),
        }
    }
}

#[derive(Clone)]
pub struct MySqlLedger {
    pool: MySqlPool,
}

impl MySqlLedger {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = MySqlPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: MySqlPool) -> Self {
        MySqlLedger { pool }
    }
}

fn decode_err(column: &str, err: impl std::fmt::Display) -> StoreError {
    StoreError::Decode(format!("{}: {}", column, err))
}

fn user_from_row(row: &MySqlRow) -> Result<User, StoreError> {
    Ok(User {
        id: row.try_get("id")?,
        balance: row.try_get("balance")?,
    })
}

fn asset_from_row(row: &MySqlRow) -> Result<Asset, StoreError> {
    Ok(Asset {
        user_id: row.try_get("user_id")?,
        symbol: row.try_get("symbol")?,
        amount: row.try_get("amount")?,
        locked_amount: row.try_get("locked_amount")?,
    })
}

fn order_from_row(row: &MySqlRow) -> Result<Order, StoreError> {
    let side: String = row.try_get("side")?;
    let status: u8 = row.try_get("status")?;
    Ok(Order {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        symbol: row.try_get("symbol")?,
        side: side.parse::<Side>().map_err(|e| decode_err("side", e))?,
        price: row.try_get("price")?,
        amount: row.try_get("amount")?,
        status: OrderStatus::from_code(status)
            .ok_or_else(|| decode_err("status", format!("unknown code {}", status)))?,
        created_at: row.try_get("created_at")?,
    })
}

fn trade_from_row(row: &MySqlRow) -> Result<Trade, StoreError> {
    Ok(Trade {
        id: row.try_get("id")?,
        symbol: row.try_get("symbol")?,
        buy_order_id: row.try_get("buy_order_id")?,
        sell_order_id: row.try_get("sell_order_id")?,
        price: row.try_get("price")?,
        amount: row.try_get("amount")?,
        commission: row.try_get("commission")?,
        created_at: row.try_get("created_at")?,
    })
}

fn orders_from_rows(rows: &[MySqlRow]) -> Result<Vec<Order>, StoreError> {
    rows.iter().map(order_from_row).collect()
}

#[async_trait]
impl LedgerStore for MySqlLedger {
    async fn begin<'a>(&'a self) -> Result<Box<dyn LedgerTx + 'a>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(MySqlTx { tx: Some(tx) }))
    }

    async fn user(&self, id: UserId) -> Result<Option<User>, StoreError> {
        let row = sqlx::query("SELECT id, balance FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn asset(&self, user_id: UserId, symbol: &str) -> Result<Option<Asset>, StoreError> {
        let row = sqlx::query(
            "SELECT user_id, symbol, amount, locked_amount FROM assets \
             WHERE user_id = ? AND symbol = ?",
        )
        .bind(user_id)
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(asset_from_row).transpose()
    }

    async fn assets_of(&self, user_id: UserId) -> Result<Vec<Asset>, StoreError> {
        let rows = sqlx::query(
            "SELECT user_id, symbol, amount, locked_amount FROM assets \
             WHERE user_id = ? ORDER BY symbol",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(asset_from_row).collect()
    }

    async fn open_orders(&self, symbol: &str, side: Side) -> Result<Vec<Order>, StoreError> {
        let sql = format!(
            "SELECT {} FROM orders WHERE symbol = ? AND side = ? AND status = ? ORDER BY id",
            ORDER_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(symbol)
            .bind(side.as_str())
            .bind(OrderStatus::Open.code())
            .fetch_all(&self.pool)
            .await?;
        orders_from_rows(&rows)
    }

    async fn find_orders(&self, filter: &OrderFilter) -> Result<Vec<Order>, StoreError> {
        let mut query: QueryBuilder<MySql> =
            QueryBuilder::new(format!("SELECT {} FROM orders WHERE 1 = 1", ORDER_COLUMNS));
        if let Some(symbol) = &filter.symbol {
            query.push(" AND symbol = ").push_bind(symbol.clone());
        }
        if let Some(side) = filter.side {
            query.push(" AND side = ").push_bind(side.as_str());
        }
        if let Some(status) = filter.status {
            query.push(" AND status = ").push_bind(status.code());
        }
        if let Some(user_id) = filter.user_id {
            query.push(" AND user_id = ").push_bind(user_id);
        }
        query.push(" ORDER BY created_at DESC, id DESC");
        let rows = query.build().fetch_all(&self.pool).await?;
        orders_from_rows(&rows)
    }

    async fn recent_trades(&self, limit: usize) -> Result<Vec<Trade>, StoreError> {
        let sql = format!(
            "SELECT {} FROM trades ORDER BY id DESC LIMIT ?",
            TRADE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(limit as u64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(trade_from_row).collect()
    }
}

/// Rolled back by sqlx when dropped before [`LedgerTx::commit`].
struct MySqlTx {
    tx: Option<Transaction<'static, MySql>>,
}

impl MySqlTx {
    fn conn(&mut self) -> Result<&mut MySqlConnection, StoreError> {
        self.tx.as_deref_mut().ok_or(StoreError::Finished)
    }
}

#[async_trait]
impl LedgerTx for MySqlTx {
    async fn lock_user(&mut self, id: UserId) -> Result<Option<User>, StoreError> {
        let row = sqlx::query("SELECT id, balance FROM users WHERE id = ? FOR UPDATE")
            .bind(id)
            .fetch_optional(self.conn()?)
            .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn save_user(&mut self, user: &User) -> Result<(), StoreError> {
        sqlx::query("UPDATE users SET balance = ? WHERE id = ?")
            .bind(user.balance)
            .bind(user.id)
            .execute(self.conn()?)
            .await?;
        Ok(())
    }

    async fn lock_asset(
        &mut self,
        user_id: UserId,
        symbol: &str,
    ) -> Result<Option<Asset>, StoreError> {
        let row = sqlx::query(
            "SELECT user_id, symbol, amount, locked_amount FROM assets \
             WHERE user_id = ? AND symbol = ? FOR UPDATE",
        )
        .bind(user_id)
        .bind(symbol)
        .fetch_optional(self.conn()?)
        .await?;
        row.as_ref().map(asset_from_row).transpose()
    }

    async fn save_asset(&mut self, asset: &Asset) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO assets (user_id, symbol, amount, locked_amount) VALUES (?, ?, ?, ?) \
             ON DUPLICATE KEY UPDATE amount = VALUES(amount), locked_amount = VALUES(locked_amount)",
        )
        .bind(asset.user_id)
        .bind(&asset.symbol)
        .bind(asset.amount)
        .bind(asset.locked_amount)
        .execute(self.conn()?)
        .await?;
        Ok(())
    }

    async fn lock_order(&mut self, id: OrderId) -> Result<Option<Order>, StoreError> {
        let sql = format!("SELECT {} FROM orders WHERE id = ? FOR UPDATE", ORDER_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(self.conn()?)
            .await?;
        row.as_ref().map(order_from_row).transpose()
    }

    async fn open_orders(&mut self, symbol: &str, side: Side) -> Result<Vec<Order>, StoreError> {
        let sql = format!(
            "SELECT {} FROM orders WHERE symbol = ? AND side = ? AND status = ? ORDER BY id",
            ORDER_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(symbol)
            .bind(side.as_str())
            .bind(OrderStatus::Open.code())
            .fetch_all(self.conn()?)
            .await?;
        orders_from_rows(&rows)
    }

    async fn lock_open_orders(&mut self, symbol: &str) -> Result<Vec<Order>, StoreError> {
        let sql = format!(
            "SELECT {} FROM orders WHERE symbol = ? AND status = ? ORDER BY id FOR UPDATE",
            ORDER_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(symbol)
            .bind(OrderStatus::Open.code())
            .fetch_all(self.conn()?)
            .await?;
        orders_from_rows(&rows)
    }

    async fn insert_order(&mut self, order: NewOrder) -> Result<Order, StoreError> {
        let result = sqlx::query(
            "INSERT INTO orders (user_id, symbol, side, price, amount, status, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(order.user_id)
        .bind(&order.symbol)
        .bind(order.side.as_str())
        .bind(order.price)
        .bind(order.amount)
        .bind(OrderStatus::Open.code())
        .bind(order.created_at)
        .execute(self.conn()?)
        .await?;
        Ok(order.into_order(result.last_insert_id()))
    }

    async fn save_order(&mut self, order: &Order) -> Result<(), StoreError> {
        sqlx::query("UPDATE orders SET status = ?, amount = ? WHERE id = ?")
            .bind(order.status.code())
            .bind(order.amount)
            .bind(order.id)
            .execute(self.conn()?)
            .await?;
        Ok(())
    }

    async fn insert_trade(&mut self, trade: NewTrade) -> Result<Trade, StoreError> {
        let result = sqlx::query(
            "INSERT INTO trades \
             (symbol, buy_order_id, sell_order_id, price, amount, commission, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&trade.symbol)
        .bind(trade.buy_order_id)
        .bind(trade.sell_order_id)
        .bind(trade.price)
        .bind(trade.amount)
        .bind(trade.commission)
        .bind(trade.created_at)
        .execute(self.conn()?)
        .await?;
        Ok(trade.into_trade(result.last_insert_id()))
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let tx = self.tx.take().ok_or(StoreError::Finished)?;
        tx.commit().await?;
        Ok(())
    }
}
