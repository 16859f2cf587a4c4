pub mod account;
pub mod money;
pub mod order;
pub mod symbol;
pub mod trade;

pub use account::{Asset, Portfolio, User};
pub use order::{now_millis, NewOrder, Order, OrderId, OrderStatus, Side, UserId};
pub use symbol::Symbol;
pub use trade::{NewTrade, Trade, TradeId};
