#![allow(dead_code)]

use rust_decimal::Decimal;
use spot_match::engine::entry::NewOrder;
use spot_match::engine::store::LedgerTx;
use spot_match::{
    Asset, ChannelSink, EngineConfig, ExchangeError, LedgerEvent, LedgerStore, MatchEngine,
    MemLedger, Order, OrderRequest, Side, User, UserId,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

pub const SYMBOL: &str = "BTC/USDT";

pub struct Harness {
    pub ledger: Arc<MemLedger>,
    pub engine: MatchEngine,
    pub events: UnboundedReceiver<LedgerEvent>,
}

pub fn harness() -> Harness {
    harness_with(
        Duration::from_millis(200),
        EngineConfig {
            max_retries: 5,
            retry_backoff: Duration::from_millis(2),
        },
    )
}

pub fn harness_with(lock_wait: Duration, config: EngineConfig) -> Harness {
    let ledger = Arc::new(MemLedger::new(lock_wait));
    let (sink, events) = ChannelSink::new();
    let engine = MatchEngine::new(ledger.clone(), Arc::new(sink), config);
    Harness {
        ledger,
        engine,
        events,
    }
}

impl Harness {
    pub fn user(&self, id: UserId, balance: Decimal) {
        self.ledger.insert_user(User::new(id, balance));
    }

    pub fn holding(&self, id: UserId, symbol: &str, amount: Decimal) {
        self.ledger.insert_asset(Asset::new(id, symbol, amount));
    }

    pub async fn buy(&self, user_id: UserId, price: Decimal, amount: Decimal) -> Result<Order, ExchangeError> {
        self.place(user_id, Side::Buy, price, amount).await
    }

    pub async fn sell(&self, user_id: UserId, price: Decimal, amount: Decimal) -> Result<Order, ExchangeError> {
        self.place(user_id, Side::Sell, price, amount).await
    }

    pub async fn place(
        &self,
        user_id: UserId,
        side: Side,
        price: Decimal,
        amount: Decimal,
    ) -> Result<Order, ExchangeError> {
        self.engine
            .create_order(OrderRequest {
                user_id,
                symbol: SYMBOL.to_string(),
                side,
                price,
                amount,
            })
            .await
    }

    /// Puts an order on the book with its reservation but without running the
    /// immediate match, so crossing orders can rest side by side.
    pub async fn rest(&self, user_id: UserId, side: Side, price: Decimal, amount: Decimal) -> Order {
        let mut tx = self.ledger.begin().await.unwrap();
        match side {
            Side::Buy => {
                let mut user = tx.lock_user(user_id).await.unwrap().unwrap();
                user.balance -= price * amount;
                tx.save_user(&user).await.unwrap();
            }
            Side::Sell => {
                let mut asset = tx.lock_asset(user_id, "BTC").await.unwrap().unwrap();
                asset.locked_amount += amount;
                tx.save_asset(&asset).await.unwrap();
            }
        }
        let order = tx
            .insert_order(NewOrder {
                user_id,
                symbol: SYMBOL.to_string(),
                side,
                price,
                amount,
                created_at: spot_match::engine::entry::now_millis(),
            })
            .await
            .unwrap();
        tx.commit().await.unwrap();
        order
    }

    pub fn balance(&self, id: UserId) -> Decimal {
        self.ledger
            .users()
            .into_iter()
            .find(|u| u.id == id)
            .map(|u| u.balance)
            .unwrap()
    }

    pub fn asset(&self, id: UserId, symbol: &str) -> Option<Asset> {
        self.ledger
            .assets()
            .into_iter()
            .find(|a| a.user_id == id && a.symbol == symbol)
    }

    pub fn order(&self, id: u64) -> Order {
        self.ledger.orders().into_iter().find(|o| o.id == id).unwrap()
    }

    pub fn drain_events(&mut self) -> Vec<LedgerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

pub fn event_names(events: &[LedgerEvent]) -> Vec<&'static str> {
    events.iter().map(|e| e.name()).collect()
}

/// Panics on any broken ledger invariant.
pub fn audit(ledger: &MemLedger) {
    for user in ledger.users() {
        assert!(user.balance >= Decimal::ZERO, "user {} balance {}", user.id, user.balance);
    }
    for asset in ledger.assets() {
        assert!(
            asset.available_amount() >= Decimal::ZERO,
            "user {} {} available {}",
            asset.user_id,
            asset.symbol,
            asset.available_amount()
        );
    }
    let orders = ledger.orders();
    let mut traded = HashSet::new();
    for trade in ledger.trades() {
        let buy = orders.iter().find(|o| o.id == trade.buy_order_id).unwrap();
        let sell = orders.iter().find(|o| o.id == trade.sell_order_id).unwrap();
        assert_eq!(buy.side, Side::Buy);
        assert_eq!(sell.side, Side::Sell);
        assert_ne!(buy.user_id, sell.user_id, "trade {} is a self-trade", trade.id);
        assert!(traded.insert(buy.id), "order {} traded twice", buy.id);
        assert!(traded.insert(sell.id), "order {} traded twice", sell.id);
    }
}

/// Sum of every holding of `symbol`.
pub fn supply(ledger: &MemLedger, symbol: &str) -> Decimal {
    ledger
        .assets()
        .iter()
        .filter(|a| a.symbol == symbol)
        .map(|a| a.amount)
        .sum()
}

/// Base quantity credited to buyers across all trades. Sellers only have
/// their lock released, so supply grows by exactly this much.
pub fn traded(ledger: &MemLedger) -> Decimal {
    ledger.trades().iter().map(|t| t.amount).sum()
}
