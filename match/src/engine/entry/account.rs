use crate::engine::entry::UserId;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    /// Spendable quote cash. BUY reservations are debited from it directly.
    pub balance: Decimal,
}

impl User {
    pub fn new(id: UserId, balance: Decimal) -> Self {
        Self { id, balance }
    }
}

/// Holding of one base asset; one row per (user, symbol).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub user_id: UserId,
    pub symbol: String,
    pub amount: Decimal,
    /// Part of `amount` reserved by open SELL orders.
    pub locked_amount: Decimal,
}

impl Asset {
    pub fn new(user_id: UserId, symbol: &str, amount: Decimal) -> Self {
        Self {
            user_id,
            symbol: symbol.to_string(),
            amount,
            locked_amount: Decimal::ZERO,
        }
    }

    pub fn empty(user_id: UserId, symbol: &str) -> Self {
        Self::new(user_id, symbol, Decimal::ZERO)
    }

    pub fn available_amount(&self) -> Decimal {
        self.amount - self.locked_amount
    }
}

/// A user's cash balance with every asset holding, ordered by symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Portfolio {
    pub user: User,
    pub assets: Vec<Asset>,
}
