//! Order Processing Module
//!
//! Lifecycle of a spot order inside one ledger transaction: validation, fund
//! reservation, persistence and immediate matching on submit; ownership and
//! state checks followed by the release on cancel. Read-only helpers answer
//! affordability questions against committed state.

use crate::engine::entry::{money, now_millis, NewOrder, Order, OrderId, Side, Symbol, Trade, UserId};
use crate::engine::matchlogic::Matcher;
use crate::engine::spot::settlement::COMMISSION_RATE;
use crate::engine::spot::{FundReservation, SettlementWriter};
use crate::engine::store::{LedgerStore, LedgerTx};
use crate::error::ExchangeError;
use crate::events::{LedgerEvent, Outbox};
use log::info;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A limit order as submitted by a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub user_id: UserId,
    pub symbol: String,
    pub side: Side,
    pub price: Decimal,
    pub amount: Decimal,
}

/// Cost breakdown of a prospective order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderPreview {
    pub symbol: String,
    pub side: Side,
    pub price: Decimal,
    pub amount: Decimal,
    /// `price * amount`
    pub volume: Decimal,
    pub commission: Decimal,
    /// `volume + commission`, BUY only
    pub total_cost: Option<Decimal>,
    pub you_will_pay: Decimal,
    pub pay_asset: String,
    pub you_will_receive: Decimal,
    pub receive_asset: String,
    pub can_afford: bool,
}

/// Drives create and cancel for every symbol
#[derive(Debug, Clone, Default)]
pub struct OrderProcessor;

impl OrderProcessor {
    pub fn new() -> Self {
        OrderProcessor
    }

    /// Places a new order
    ///
    /// # Arguments
    /// * `tx` - Transaction the whole placement runs in
    /// * `outbox` - Collects the events to publish after commit
    /// * `request` - The order as submitted
    ///
    /// # Returns
    /// * `Ok((Order, Vec<Trade>))` - The persisted order, FILLED when it
    ///   matched, and the trades it produced
    /// * `Err(ExchangeError)` - Validation or reservation failure; nothing
    ///   has been written
    pub async fn place_order(
        &self,
        tx: &mut dyn LedgerTx,
        outbox: &mut Outbox,
        request: OrderRequest,
    ) -> Result<(Order, Vec<Trade>), ExchangeError> {
        let symbol = Symbol::parse(&request.symbol)?;
        symbol.validate_price(request.price)?;
        symbol.validate_amount(request.amount)?;

        let new_order = NewOrder {
            user_id: request.user_id,
            symbol: symbol.name.clone(),
            side: request.side,
            price: money::scaled(request.price),
            amount: money::scaled(request.amount),
            created_at: now_millis(),
        };
        // orders, then users, then assets; the new order's own row is
        // invisible to other transactions until commit
        let counters = Matcher::lock_counter_orders(tx, &new_order).await?;
        // the first trade fills the incoming order, so only the best
        // counter-order's owner can take part
        let mut parties = vec![new_order.user_id];
        parties.extend(counters.first().map(|counter| counter.user_id));
        SettlementWriter::lock_parties(tx, &parties, &symbol.base).await?;
        FundReservation::reserve(tx, outbox, &symbol, &new_order).await?;

        let mut order = tx.insert_order(new_order).await?;
        info!(
            "order {} created: user {} {} {} {}@{}",
            order.id, order.user_id, order.side, order.symbol, order.amount, order.price
        );
        outbox.push(LedgerEvent::OrderCreated {
            order: order.clone(),
        });

        let trades = Matcher::match_incoming(tx, outbox, &mut order, counters).await?;
        Ok((order, trades))
    }

    /// Cancels an open order owned by `user_id` and returns what it reserved
    ///
    /// # Returns
    /// * `Ok(Order)` - The order, now CANCELED
    /// * `Err(NotFound | Forbidden | InvalidState)` - Unknown order, someone
    ///   else's order, or an order that is no longer open
    pub async fn cancel_order(
        &self,
        tx: &mut dyn LedgerTx,
        outbox: &mut Outbox,
        user_id: UserId,
        order_id: OrderId,
    ) -> Result<Order, ExchangeError> {
        let mut order = tx
            .lock_order(order_id)
            .await?
            .ok_or_else(|| ExchangeError::NotFound(format!("order {}", order_id)))?;
        if order.user_id != user_id {
            return Err(ExchangeError::Forbidden(format!(
                "order {} belongs to another user",
                order_id
            )));
        }
        if !order.is_open() {
            return Err(ExchangeError::InvalidState(format!(
                "order {} is {}",
                order_id, order.status
            )));
        }

        FundReservation::release(tx, outbox, &order).await?;
        order.cancel()?;
        tx.save_order(&order).await?;
        info!("order {} canceled by user {}", order.id, user_id);
        outbox.push(LedgerEvent::OrderCanceled {
            order: order.clone(),
        });
        Ok(order)
    }

    /// Whether `user_id` could cover the order. A BUY needs the volume plus
    /// commission in cash; a SELL needs the amount available in the base asset.
    pub async fn can_afford(
        &self,
        store: &dyn LedgerStore,
        request: &OrderRequest,
    ) -> Result<bool, ExchangeError> {
        Ok(self.preview(store, request).await?.can_afford)
    }

    /// Volume, commission and what each side of the exchange amounts to.
    pub async fn preview(
        &self,
        store: &dyn LedgerStore,
        request: &OrderRequest,
    ) -> Result<OrderPreview, ExchangeError> {
        let symbol = Symbol::parse(&request.symbol)?;
        symbol.validate_price(request.price)?;
        symbol.validate_amount(request.amount)?;
        let user = store
            .user(request.user_id)
            .await?
            .ok_or_else(|| ExchangeError::NotFound(format!("user {}", request.user_id)))?;

        let volume = money::product(request.price, request.amount)?;
        let commission = money::product(volume, COMMISSION_RATE)?;
        let amount = money::scaled(request.amount);

        let preview = match request.side {
            Side::Buy => {
                let total_cost = money::scaled(volume + commission);
                OrderPreview {
                    total_cost: Some(total_cost),
                    you_will_pay: total_cost,
                    pay_asset: symbol.quote.clone(),
                    you_will_receive: amount,
                    receive_asset: symbol.base.clone(),
                    can_afford: user.balance >= total_cost,
                    ..Self::blank_preview(&symbol, request, volume, commission)
                }
            }
            Side::Sell => {
                let available = store
                    .asset(user.id, &symbol.base)
                    .await?
                    .map(|asset| asset.available_amount())
                    .unwrap_or(Decimal::ZERO);
                OrderPreview {
                    total_cost: None,
                    you_will_pay: amount,
                    pay_asset: symbol.base.clone(),
                    you_will_receive: money::scaled(volume - commission),
                    receive_asset: symbol.quote.clone(),
                    can_afford: available >= amount,
                    ..Self::blank_preview(&symbol, request, volume, commission)
                }
            }
        };
        Ok(preview)
    }

    fn blank_preview(
        symbol: &Symbol,
        request: &OrderRequest,
        volume: Decimal,
        commission: Decimal,
    ) -> OrderPreview {
        OrderPreview {
            symbol: symbol.name.clone(),
            side: request.side,
            price: money::scaled(request.price),
            amount: money::scaled(request.amount),
            volume,
            commission,
            total_cost: None,
            you_will_pay: Decimal::ZERO,
            pay_asset: String::new(),
            you_will_receive: Decimal::ZERO,
            receive_asset: String::new(),
            can_afford: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::entry::{Asset, OrderStatus, User};
    use crate::engine::store::MemLedger;
    use rust_decimal_macros::dec;

    fn request(user_id: UserId, side: Side, price: Decimal, amount: Decimal) -> OrderRequest {
        OrderRequest {
            user_id,
            symbol: "BTC/USDT".to_string(),
            side,
            price,
            amount,
        }
    }

    fn ledger() -> MemLedger {
        let ledger = MemLedger::default();
        ledger.insert_user(User::new(1, dec!(10000)));
        ledger.insert_user(User::new(2, dec!(0)));
        ledger.insert_asset(Asset::new(2, "BTC", dec!(1)));
        ledger
    }

    #[tokio::test]
    async fn invalid_input_writes_nothing() {
        let ledger = ledger();
        let processor = OrderProcessor::new();
        let mut outbox = Outbox::new();
        let mut tx = ledger.begin().await.unwrap();
        for bad in [
            request(1, Side::Buy, dec!(0), dec!(1)),
            request(1, Side::Buy, dec!(1), dec!(-1)),
            request(1, Side::Buy, dec!(1), dec!(0.000000001)),
            OrderRequest {
                symbol: "BTCUSDT".to_string(),
                ..request(1, Side::Buy, dec!(1), dec!(1))
            },
        ] {
            let err = processor
                .place_order(tx.as_mut(), &mut outbox, bad)
                .await
                .unwrap_err();
            assert_eq!(err.code(), "invalid_input");
        }
        assert!(outbox.is_empty());
    }

    #[tokio::test]
    async fn unmatched_order_rests_open() {
        let ledger = ledger();
        let processor = OrderProcessor::new();
        let mut outbox = Outbox::new();
        let mut tx = ledger.begin().await.unwrap();
        let (order, trades) = processor
            .place_order(tx.as_mut(), &mut outbox, request(1, Side::Buy, dec!(50000), dec!(0.1)))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert!(trades.is_empty());
        assert_eq!(order.status, OrderStatus::Open);
        assert_eq!(order.price.to_string(), "50000.00000000");
        assert_eq!(
            ledger.user(1).await.unwrap().unwrap().balance.to_string(),
            "5000.00000000"
        );
        // balance change, then creation
        assert_eq!(outbox.len(), 2);
    }

    #[tokio::test]
    async fn cancel_checks_owner_then_state() {
        let ledger = ledger();
        let processor = OrderProcessor::new();
        let mut outbox = Outbox::new();
        let mut tx = ledger.begin().await.unwrap();
        let (order, _) = processor
            .place_order(tx.as_mut(), &mut outbox, request(2, Side::Sell, dec!(100), dec!(0.5)))
            .await
            .unwrap();

        let err = processor
            .cancel_order(tx.as_mut(), &mut outbox, 1, order.id)
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Forbidden(_)));
        let err = processor
            .cancel_order(tx.as_mut(), &mut outbox, 2, order.id + 100)
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::NotFound(_)));

        let canceled = processor
            .cancel_order(tx.as_mut(), &mut outbox, 2, order.id)
            .await
            .unwrap();
        assert_eq!(canceled.status, OrderStatus::Canceled);
        let err = processor
            .cancel_order(tx.as_mut(), &mut outbox, 2, order.id)
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::InvalidState(_)));
        let asset = tx.lock_asset(2, "BTC").await.unwrap().unwrap();
        assert_eq!(asset.locked_amount, dec!(0));
    }

    #[tokio::test]
    async fn preview_includes_commission() {
        let ledger = ledger();
        let processor = OrderProcessor::new();

        let buy = processor
            .preview(&ledger, &request(1, Side::Buy, dec!(50000), dec!(0.2)))
            .await
            .unwrap();
        assert_eq!(buy.volume, dec!(10000));
        assert_eq!(buy.commission, dec!(150));
        assert_eq!(buy.total_cost, Some(dec!(10150)));
        assert_eq!(buy.pay_asset, "USDT");
        assert!(!buy.can_afford);

        let sell = processor
            .preview(&ledger, &request(2, Side::Sell, dec!(50000), dec!(0.2)))
            .await
            .unwrap();
        assert_eq!(sell.you_will_receive, dec!(9850));
        assert_eq!(sell.receive_asset, "USDT");
        assert!(sell.can_afford);
    }

    #[tokio::test]
    async fn affordability_of_unknown_user() {
        let ledger = ledger();
        let err = OrderProcessor::new()
            .can_afford(&ledger, &request(9, Side::Buy, dec!(1), dec!(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::NotFound(_)));
    }
}
