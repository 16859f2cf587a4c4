//! Fund reservation
//!
//! A BUY order holds back its full `price * amount` by debiting the user's
//! cash balance; there is no separate locked-cash column. A SELL order moves
//! `amount` of the base asset into `locked_amount`.

use crate::engine::entry::{money, NewOrder, Order, Side, Symbol, User, UserId};
use crate::engine::store::{LedgerTx, StoreError};
use crate::error::ExchangeError;
use crate::events::{BalanceReason, LedgerEvent, Outbox};
use log::debug;

pub struct FundReservation;

impl FundReservation {
    /// Earmarks the funds `order` needs. Fails without side effects when the
    /// user can not cover it.
    pub async fn reserve(
        tx: &mut dyn LedgerTx,
        outbox: &mut Outbox,
        symbol: &Symbol,
        order: &NewOrder,
    ) -> Result<(), ExchangeError> {
        match order.side {
            Side::Buy => {
                let mut user = Self::user(tx, order.user_id).await?;
                let cost = money::product(order.price, order.amount)?;
                if user.balance < cost {
                    return Err(ExchangeError::InsufficientFunds);
                }
                let previous = user.balance;
                user.balance = money::scaled(user.balance - cost);
                tx.save_user(&user).await?;
                debug!("user {} reserved {} {}", user.id, cost, symbol.quote);
                outbox.push(LedgerEvent::BalanceChanged {
                    user_id: user.id,
                    previous,
                    current: user.balance,
                    reason: BalanceReason::FundsLocked,
                });
            }
            Side::Sell => {
                let insufficient = || ExchangeError::InsufficientAsset(symbol.base.clone());
                let mut asset = tx
                    .lock_asset(order.user_id, &symbol.base)
                    .await?
                    .ok_or_else(insufficient)?;
                if asset.available_amount() < order.amount {
                    return Err(insufficient());
                }
                asset.locked_amount = money::scaled(asset.locked_amount + order.amount);
                tx.save_asset(&asset).await?;
                debug!(
                    "user {} locked {} {}",
                    asset.user_id, order.amount, symbol.base
                );
            }
        }
        Ok(())
    }

    /// Returns what an OPEN order had reserved. The caller moves the order to
    /// CANCELED in the same transaction.
    pub async fn release(
        tx: &mut dyn LedgerTx,
        outbox: &mut Outbox,
        order: &Order,
    ) -> Result<(), ExchangeError> {
        if !order.is_open() {
            return Err(ExchangeError::InvalidState(format!(
                "order {} is {}, only open orders can be released",
                order.id, order.status
            )));
        }
        match order.side {
            Side::Buy => {
                let mut user = tx.lock_user(order.user_id).await?.ok_or_else(|| {
                    StoreError::Inconsistent(format!("owner {} of order {}", order.user_id, order.id))
                })?;
                let previous = user.balance;
                user.balance = money::scaled(user.balance + order.reserved_value()?);
                tx.save_user(&user).await?;
                outbox.push(LedgerEvent::BalanceChanged {
                    user_id: user.id,
                    previous,
                    current: user.balance,
                    reason: BalanceReason::FundsReleased,
                });
            }
            Side::Sell => {
                let base = order.base_asset();
                let mut asset = tx
                    .lock_asset(order.user_id, base)
                    .await?
                    .ok_or_else(|| {
                        StoreError::Inconsistent(format!(
                            "no {} holding behind order {}",
                            base, order.id
                        ))
                    })?;
                if asset.locked_amount < order.amount {
                    return Err(StoreError::Inconsistent(format!(
                        "order {} releases {} {} but only {} is locked",
                        order.id, order.amount, base, asset.locked_amount
                    ))
                    .into());
                }
                asset.locked_amount = money::scaled(asset.locked_amount - order.amount);
                tx.save_asset(&asset).await?;
            }
        }
        Ok(())
    }

    async fn user(tx: &mut dyn LedgerTx, id: UserId) -> Result<User, ExchangeError> {
        tx.lock_user(id)
            .await?
            .ok_or_else(|| ExchangeError::NotFound(format!("user {}", id)))
    }
}
