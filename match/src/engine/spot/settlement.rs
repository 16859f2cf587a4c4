//! Trade settlement
//!
//! Writes one trade and every balance movement it implies inside the caller's
//! transaction. Rows are locked users first, then asset holdings, each in
//! ascending user id; callers normally hold them already via
//! [`SettlementWriter::lock_parties`].

use crate::engine::entry::{money, Asset, NewTrade, Order, Side, Trade, User, UserId};
use crate::engine::store::{LedgerTx, StoreError};
use crate::error::ExchangeError;
use crate::events::{BalanceReason, LedgerEvent, Outbox};
use log::info;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::BTreeSet;

/// Fee withheld from the seller, as a fraction of the notional.
pub const COMMISSION_RATE: Decimal = dec!(0.015);

pub struct SettlementWriter;

impl SettlementWriter {
    /// Settles `buy` against `sell` at the price of the `resting` side's order.
    ///
    /// Both orders end up FILLED whatever the executed quantity. The buyer
    /// receives the base asset and a refund of whatever its reservation
    /// exceeds `notional + commission`; the seller receives
    /// `notional - commission` and has the locked base asset released.
    pub async fn settle(
        tx: &mut dyn LedgerTx,
        outbox: &mut Outbox,
        buy: &mut Order,
        sell: &mut Order,
        resting: Side,
    ) -> Result<Trade, ExchangeError> {
        Self::check_pair(buy, sell)?;

        let amount = buy.amount.min(sell.amount);
        let price = match resting {
            Side::Buy => buy.price,
            Side::Sell => sell.price,
        };
        let notional = money::product(price, amount)?;
        let commission = money::product(notional, COMMISSION_RATE)?;
        let refund = buy.reserved_value()? - (notional + commission);

        let trade = tx
            .insert_trade(NewTrade {
                symbol: buy.symbol.clone(),
                buy_order_id: buy.id,
                sell_order_id: sell.id,
                price,
                amount,
                commission,
                created_at: crate::engine::entry::now_millis(),
            })
            .await?;

        buy.fill()?;
        sell.fill()?;
        tx.save_order(buy).await?;
        tx.save_order(sell).await?;

        let (mut buyer, mut seller) = Self::lock_users(tx, buy.user_id, sell.user_id).await?;
        let base = buy.base_asset().to_string();
        let (mut buyer_asset, mut seller_asset) =
            Self::lock_assets(tx, buy.user_id, sell.user_id, &base).await?;

        buyer_asset.amount = money::scaled(buyer_asset.amount + amount);
        if seller_asset.locked_amount < amount {
            return Err(StoreError::Inconsistent(format!(
                "order {} settles {} {} but only {} is locked",
                sell.id, amount, base, seller_asset.locked_amount
            ))
            .into());
        }
        // only the lock is released; the seller's holding keeps its amount
        seller_asset.locked_amount = money::scaled(seller_asset.locked_amount - amount);
        tx.save_asset(&buyer_asset).await?;
        tx.save_asset(&seller_asset).await?;

        let buyer_previous = buyer.balance;
        if refund > Decimal::ZERO {
            buyer.balance = money::scaled(buyer.balance + refund);
            tx.save_user(&buyer).await?;
        }
        let seller_previous = seller.balance;
        seller.balance = money::scaled(seller.balance + notional - commission);
        tx.save_user(&seller).await?;

        info!(
            "trade {} {} buy {} sell {} {}@{} commission {}",
            trade.id, trade.symbol, buy.id, sell.id, amount, price, commission
        );
        outbox.push(LedgerEvent::OrderMatched {
            trade: trade.clone(),
            buyer_id: buyer.id,
            seller_id: seller.id,
        });
        outbox.push(LedgerEvent::BalanceChanged {
            user_id: buyer.id,
            previous: buyer_previous,
            current: buyer.balance,
            reason: BalanceReason::OrderMatched,
        });
        outbox.push(LedgerEvent::BalanceChanged {
            user_id: seller.id,
            previous: seller_previous,
            current: seller.balance,
            reason: BalanceReason::OrderMatched,
        });
        Ok(trade)
    }

    /// Locks the user rows of `parties` in ascending id, then their `base`
    /// holdings in the same order. Call it after the order locks and before
    /// any reservation or settlement: transactions lock orders, then users,
    /// then assets.
    pub async fn lock_parties(
        tx: &mut dyn LedgerTx,
        parties: &[UserId],
        base: &str,
    ) -> Result<(), ExchangeError> {
        let parties: BTreeSet<UserId> = parties.iter().copied().collect();
        for id in &parties {
            tx.lock_user(*id).await?;
        }
        for id in &parties {
            tx.lock_asset(*id, base).await?;
        }
        Ok(())
    }

    fn check_pair(buy: &Order, sell: &Order) -> Result<(), ExchangeError> {
        let refuse = |why: &str| {
            Err(ExchangeError::InvalidState(format!(
                "can not settle {} against {}: {}",
                buy.id, sell.id, why
            )))
        };
        if buy.side != Side::Buy || sell.side != Side::Sell {
            return refuse("sides do not oppose");
        }
        if buy.symbol != sell.symbol {
            return refuse("symbols differ");
        }
        if buy.user_id == sell.user_id {
            return refuse("same owner");
        }
        if !buy.is_open() || !sell.is_open() {
            return refuse("order no longer open");
        }
        Ok(())
    }

    async fn lock_users(
        tx: &mut dyn LedgerTx,
        buyer_id: UserId,
        seller_id: UserId,
    ) -> Result<(User, User), ExchangeError> {
        let (first, second) = if buyer_id < seller_id {
            (buyer_id, seller_id)
        } else {
            (seller_id, buyer_id)
        };
        let first = Self::locked_user(tx, first).await?;
        let second = Self::locked_user(tx, second).await?;
        if first.id == buyer_id {
            Ok((first, second))
        } else {
            Ok((second, first))
        }
    }

    async fn locked_user(tx: &mut dyn LedgerTx, id: UserId) -> Result<User, ExchangeError> {
        Ok(tx
            .lock_user(id)
            .await?
            .ok_or_else(|| StoreError::Inconsistent(format!("order owner {} missing", id)))?)
    }

    /// Locks both holdings of `base`. The buyer's row is created when absent;
    /// the seller's must exist since it backs the SELL reservation.
    async fn lock_assets(
        tx: &mut dyn LedgerTx,
        buyer_id: UserId,
        seller_id: UserId,
        base: &str,
    ) -> Result<(Asset, Asset), ExchangeError> {
        let (buyer_asset, seller_asset) = if buyer_id < seller_id {
            let buyer_asset = tx.lock_asset(buyer_id, base).await?;
            (buyer_asset, tx.lock_asset(seller_id, base).await?)
        } else {
            let seller_asset = tx.lock_asset(seller_id, base).await?;
            (tx.lock_asset(buyer_id, base).await?, seller_asset)
        };
        let seller_asset = seller_asset.ok_or_else(|| {
            StoreError::Inconsistent(format!("seller {} holds no {}", seller_id, base))
        })?;
        Ok((
            buyer_asset.unwrap_or_else(|| Asset::empty(buyer_id, base)),
            seller_asset,
        ))
    }
}
