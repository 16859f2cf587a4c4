use crate::engine::entry::money;
use crate::error::ExchangeError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

pub type UserId = u64;
pub type OrderId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    /// Whether an order on this side at `own` price can trade against a
    /// counter-order resting at `counter`.
    pub fn crosses(self, own: Decimal, counter: Decimal) -> bool {
        match self {
            Side::Buy => own >= counter,
            Side::Sell => own <= counter,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = ExchangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "buy" => Ok(Side::Buy),
            "sell" => Ok(Side::Sell),
            other => Err(ExchangeError::InvalidInput(format!(
                "side must be buy or sell, got {:?}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    #[default]
    Open,
    Filled,
    Canceled,
}

impl OrderStatus {
    /// Persisted representation.
    pub fn code(self) -> u8 {
        match self {
            OrderStatus::Open => 1,
            OrderStatus::Filled => 2,
            OrderStatus::Canceled => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<OrderStatus> {
        match code {
            1 => Some(OrderStatus::Open),
            2 => Some(OrderStatus::Filled),
            3 => Some(OrderStatus::Canceled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, OrderStatus::Open)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OrderStatus::Open => "OPEN",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Canceled => "CANCELED",
        };
        f.write_str(name)
    }
}

impl FromStr for OrderStatus {
    type Err = ExchangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "open" => Ok(OrderStatus::Open),
            "filled" => Ok(OrderStatus::Filled),
            "canceled" | "cancelled" => Ok(OrderStatus::Canceled),
            other => Err(ExchangeError::InvalidInput(format!(
                "unknown order status {:?}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub user_id: UserId,
    pub symbol: String,
    pub side: Side,
    pub price: Decimal,
    pub amount: Decimal,
    pub status: OrderStatus,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
}

impl Order {
    pub fn is_open(&self) -> bool {
        self.status == OrderStatus::Open
    }

    /// Base asset of the order's trading pair ("BTC" for "BTC/USDT").
    pub fn base_asset(&self) -> &str {
        self.symbol.split('/').next().unwrap_or(&self.symbol)
    }

    /// Cash held back by a BUY order: `price * amount` at 8 digits.
    pub fn reserved_value(&self) -> Result<Decimal, ExchangeError> {
        money::product(self.price, self.amount)
    }

    pub fn fill(&mut self) -> Result<(), ExchangeError> {
        self.transition(OrderStatus::Filled)
    }

    pub fn cancel(&mut self) -> Result<(), ExchangeError> {
        self.transition(OrderStatus::Canceled)
    }

    fn transition(&mut self, to: OrderStatus) -> Result<(), ExchangeError> {
        if self.status.is_terminal() {
            return Err(ExchangeError::InvalidState(format!(
                "order {} is already {}",
                self.id, self.status
            )));
        }
        self.status = to;
        Ok(())
    }
}

/// An order row that has not been assigned an id yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOrder {
    pub user_id: UserId,
    pub symbol: String,
    pub side: Side,
    pub price: Decimal,
    pub amount: Decimal,
    pub created_at: u64,
}

impl NewOrder {
    pub fn into_order(self, id: OrderId) -> Order {
        Order {
            id,
            user_id: self.user_id,
            symbol: self.symbol,
            side: self.side,
            price: self.price,
            amount: self.amount,
            status: OrderStatus::Open,
            created_at: self.created_at,
        }
    }
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn open_buy() -> Order {
        NewOrder {
            user_id: 1,
            symbol: "BTC/USDT".to_string(),
            side: Side::Buy,
            price: dec!(50000),
            amount: dec!(0.1),
            created_at: 1,
        }
        .into_order(7)
    }

    #[test]
    fn crossing_depends_on_side() {
        assert!(Side::Buy.crosses(dec!(100), dec!(99)));
        assert!(Side::Buy.crosses(dec!(100), dec!(100)));
        assert!(!Side::Buy.crosses(dec!(100), dec!(101)));
        assert!(Side::Sell.crosses(dec!(100), dec!(101)));
        assert!(!Side::Sell.crosses(dec!(100), dec!(99)));
    }

    #[test]
    fn side_parsing_rejects_unknown_values() {
        assert_eq!("BUY".parse::<Side>().unwrap(), Side::Buy);
        assert_eq!("sell".parse::<Side>().unwrap(), Side::Sell);
        assert!(matches!(
            "hold".parse::<Side>(),
            Err(ExchangeError::InvalidInput(_))
        ));
    }

    #[test]
    fn status_codes_round_trip() {
        for status in [OrderStatus::Open, OrderStatus::Filled, OrderStatus::Canceled] {
            assert_eq!(OrderStatus::from_code(status.code()), Some(status));
        }
        assert_eq!(OrderStatus::from_code(9), None);
    }

    #[test]
    fn terminal_states_are_immutable() {
        let mut order = open_buy();
        order.fill().unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert!(order.cancel().is_err());
        assert!(order.fill().is_err());
        assert_eq!(order.status, OrderStatus::Filled);
    }

    #[test]
    fn reserved_value_is_scaled_to_eight_digits() {
        let order = open_buy();
        assert_eq!(order.reserved_value().unwrap().to_string(), "5000.00000000");
        assert_eq!(order.base_asset(), "BTC");
    }
}
