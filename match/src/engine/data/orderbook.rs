use crate::engine::entry::{Order, OrderId, Side};
use crate::engine::store::{LedgerStore, LedgerTx, StoreError};
use log::debug;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Open orders of one symbol, each side in price-time priority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBook {
    pub symbol: String,
    pub buy_orders: Vec<Order>,  // best (highest) price first
    pub sell_orders: Vec<Order>, // best (lowest) price first
}

impl OrderBook {
    /// Builds a book from unsorted open orders of `symbol`.
    pub fn new(symbol: &str, orders: Vec<Order>) -> Self {
        let (mut buy_orders, mut sell_orders): (Vec<Order>, Vec<Order>) =
            orders.into_iter().partition(|o| o.side == Side::Buy);
        sort_price_time(Side::Buy, &mut buy_orders);
        sort_price_time(Side::Sell, &mut sell_orders);
        Self {
            symbol: symbol.to_string(),
            buy_orders,
            sell_orders,
        }
    }

    pub fn get_best_bid(&self) -> Option<Decimal> {
        self.buy_orders.first().map(|o| o.price)
    }

    pub fn get_best_ask(&self) -> Option<Decimal> {
        self.sell_orders.first().map(|o| o.price)
    }

    pub fn get_spread(&self) -> Option<Decimal> {
        match (self.get_best_ask(), self.get_best_bid()) {
            (Some(ask), Some(bid)) => Some(ask - bid),
            _ => None,
        }
    }
}

/// Priority of `a` relative to `b` on `side`: better price first, then older,
/// then lower id.
pub fn price_time_cmp(side: Side, a: &Order, b: &Order) -> Ordering {
    let by_price = match side {
        Side::Buy => b.price.cmp(&a.price),
        Side::Sell => a.price.cmp(&b.price),
    };
    by_price
        .then(a.created_at.cmp(&b.created_at))
        .then(a.id.cmp(&b.id))
}

pub fn sort_price_time(side: Side, orders: &mut [Order]) {
    orders.sort_by(|a, b| price_time_cmp(side, a, b));
}

/// Read access to the open orders of a book.
pub struct OrderBookRepo;

impl OrderBookRepo {
    /// Committed view of both sides without taking locks.
    pub async fn snapshot(store: &dyn LedgerStore, symbol: &str) -> Result<OrderBook, StoreError> {
        let mut orders = store.open_orders(symbol, Side::Buy).await?;
        orders.extend(store.open_orders(symbol, Side::Sell).await?);
        Ok(OrderBook::new(symbol, orders))
    }

    /// One side as the transaction sees it, in priority order. No locks.
    pub async fn open_orders(
        tx: &mut dyn LedgerTx,
        symbol: &str,
        side: Side,
    ) -> Result<Vec<Order>, StoreError> {
        let mut orders = tx.open_orders(symbol, side).await?;
        sort_price_time(side, &mut orders);
        Ok(orders)
    }

    /// Locks the orders `ids` of one side in ascending id and returns those
    /// still open once locked, in priority order.
    pub async fn lock_orders(
        tx: &mut dyn LedgerTx,
        side: Side,
        ids: &[OrderId],
    ) -> Result<Vec<Order>, StoreError> {
        let mut ids = ids.to_vec();
        ids.sort_unstable();
        ids.dedup();
        let mut orders = Vec::with_capacity(ids.len());
        for id in ids {
            match tx.lock_order(id).await? {
                Some(order) if order.is_open() => orders.push(order),
                _ => debug!("order {} closed before it could be locked", id),
            }
        }
        sort_price_time(side, &mut orders);
        Ok(orders)
    }

    /// Locks every open order of `symbol` in ascending id, then hands both
    /// sides back in priority order. The locks last until the transaction ends.
    pub async fn lock_book(tx: &mut dyn LedgerTx, symbol: &str) -> Result<OrderBook, StoreError> {
        let orders = tx.lock_open_orders(symbol).await?;
        Ok(OrderBook::new(symbol, orders))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::entry::NewOrder;
    use rust_decimal_macros::dec;

    fn order(id: u64, side: Side, price: Decimal, created_at: u64) -> Order {
        NewOrder {
            user_id: id,
            symbol: "BTC/USDT".to_string(),
            side,
            price,
            amount: dec!(1),
            created_at,
        }
        .into_order(id)
    }

    fn ids(orders: &[Order]) -> Vec<u64> {
        orders.iter().map(|o| o.id).collect()
    }

    #[test]
    fn bids_sort_highest_first_then_oldest() {
        let book = OrderBook::new(
            "BTC/USDT",
            vec![
                order(1, Side::Buy, dec!(100), 10),
                order(2, Side::Buy, dec!(101), 20),
                order(3, Side::Buy, dec!(100), 5),
                order(4, Side::Sell, dec!(105), 1),
            ],
        );
        assert_eq!(ids(&book.buy_orders), vec![2, 3, 1]);
        assert_eq!(ids(&book.sell_orders), vec![4]);
    }

    #[test]
    fn asks_sort_lowest_first_ties_by_id() {
        let mut asks = vec![
            order(5, Side::Sell, dec!(99), 7),
            order(3, Side::Sell, dec!(99), 7),
            order(1, Side::Sell, dec!(101), 1),
        ];
        sort_price_time(Side::Sell, &mut asks);
        assert_eq!(ids(&asks), vec![3, 5, 1]);
    }

    #[test]
    fn best_prices_and_spread() {
        let book = OrderBook::new(
            "BTC/USDT",
            vec![
                order(1, Side::Buy, dec!(99), 1),
                order(2, Side::Sell, dec!(101.5), 1),
            ],
        );
        assert_eq!(book.get_best_bid(), Some(dec!(99)));
        assert_eq!(book.get_best_ask(), Some(dec!(101.5)));
        assert_eq!(book.get_spread(), Some(dec!(2.5)));
        assert_eq!(OrderBook::new("BTC/USDT", vec![]).get_spread(), None);
    }
}
