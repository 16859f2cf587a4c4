//! Trade Types and Structures
//!
//! This module defines the trade structure and related functionality.
//! A trade represents a completed transaction between a buyer and seller.

use crate::engine::entry::OrderId;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub type TradeId = u64;

/// Represents a settled trade
/// Contains information about the matched orders and trade details
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    /// Unique identifier for the trade
    pub id: TradeId,
    /// Trading symbol for the trade
    pub symbol: String,
    /// ID of the buyer's order
    pub buy_order_id: OrderId,
    /// ID of the seller's order
    pub sell_order_id: OrderId,
    /// Price at which the trade was executed (the resting order's price)
    pub price: Decimal,
    /// Quantity of the trade
    pub amount: Decimal,
    /// Execution fee withheld from the seller's proceeds
    pub commission: Decimal,
    /// Milliseconds since the Unix epoch
    pub created_at: u64,
}

impl Trade {
    /// Calculates the total value of the trade
    ///
    /// # Returns
    /// The product of price and amount
    pub fn notional(&self) -> Decimal {
        self.price * self.amount
    }
}

/// A trade row that has not been assigned an id yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTrade {
    pub symbol: String,
    pub buy_order_id: OrderId,
    pub sell_order_id: OrderId,
    pub price: Decimal,
    pub amount: Decimal,
    pub commission: Decimal,
    pub created_at: u64,
}

impl NewTrade {
    pub fn into_trade(self, id: TradeId) -> Trade {
        Trade {
            id,
            symbol: self.symbol,
            buy_order_id: self.buy_order_id,
            sell_order_id: self.sell_order_id,
            price: self.price,
            amount: self.amount,
            commission: self.commission,
            created_at: self.created_at,
        }
    }
}
