//! Match Engine Module
//!
//! The public face of the matching core. Every state-changing call runs in
//! its own ledger transaction; events gathered during the attempt are
//! published once the commit went through. An attempt that fails on a
//! deadlock, a lock wait timeout or a lost connection is replayed from a
//! fresh transaction with exponential backoff.

pub use super::entry::{Order, Side, Trade, UserId};
pub use super::spot::{OrderPreview, OrderProcessor, OrderRequest};

use super::data::{OrderBook, OrderBookRepo};
use super::entry::{OrderId, Portfolio, Symbol};
use super::matchlogic::Matcher;
use super::store::{LedgerStore, OrderFilter};
use crate::config::EngineConfig;
use crate::error::ExchangeError;
use crate::events::{EventSink, Outbox};
use crate::metrics;
use log::{info, warn};
use rust_decimal::Decimal;
use std::future::Future;
use std::sync::Arc;

#[derive(Clone)]
pub struct MatchEngine {
    store: Arc<dyn LedgerStore>,
    sink: Arc<dyn EventSink>,
    processor: OrderProcessor,
    config: EngineConfig,
}

impl MatchEngine {
    pub fn new(store: Arc<dyn LedgerStore>, sink: Arc<dyn EventSink>, config: EngineConfig) -> Self {
        MatchEngine {
            store,
            sink,
            processor: OrderProcessor::new(),
            config,
        }
    }

    /// Reserves funds, persists the order and matches it against the book.
    /// The returned order is FILLED when it traded.
    pub async fn create_order(&self, request: OrderRequest) -> Result<Order, ExchangeError> {
        metrics::record_metrics("create_order", move || async move {
            let (order, trades) = self
                .retrying("create_order", || self.try_create_order(request.clone()))
                .await?;
            metrics::TRADE_COUNTER_VEC
                .with_label_values(&["immediate"])
                .inc_by(trades.len() as f64);
            Ok(order)
        })
        .await
    }

    pub async fn cancel_order(
        &self,
        user_id: UserId,
        order_id: OrderId,
    ) -> Result<Order, ExchangeError> {
        metrics::record_metrics("cancel_order", move || async move {
            self.retrying("cancel_order", || self.try_cancel_order(user_id, order_id))
                .await
        })
        .await
    }

    /// Open orders of both sides in price-time priority.
    pub async fn get_orderbook(&self, symbol: &str) -> Result<OrderBook, ExchangeError> {
        let symbol = Symbol::parse(symbol)?;
        metrics::record_metrics("get_orderbook", move || async move {
            let (store, name) = (self.store.as_ref(), symbol.name.as_str());
            self.retrying("get_orderbook", move || async move {
                let book = OrderBookRepo::snapshot(store, name).await?;
                Ok((book, Outbox::new()))
            })
            .await
        })
        .await
    }

    /// One batch pass over `symbol`. All or nothing.
    pub async fn match_orders(&self, symbol: &str) -> Result<Vec<Trade>, ExchangeError> {
        let symbol = Symbol::parse(symbol)?;
        metrics::record_metrics("match_orders", move || async move {
            let name = symbol.name.as_str();
            let trades = self
                .retrying("match_orders", move || self.try_match_orders(name))
                .await?;
            info!("batch pass {}: {} trades", symbol, trades.len());
            metrics::TRADE_COUNTER_VEC
                .with_label_values(&["batch"])
                .inc_by(trades.len() as f64);
            Ok(trades)
        })
        .await
    }

    pub async fn can_afford(
        &self,
        user_id: UserId,
        side: Side,
        price: Decimal,
        amount: Decimal,
        symbol: &str,
    ) -> Result<bool, ExchangeError> {
        let request = OrderRequest {
            user_id,
            symbol: symbol.to_string(),
            side,
            price,
            amount,
        };
        metrics::record_metrics("can_afford", move || async move {
            let request = &request;
            self.retrying("can_afford", move || async move {
                let affordable = self
                    .processor
                    .can_afford(self.store.as_ref(), request)
                    .await?;
                Ok((affordable, Outbox::new()))
            })
            .await
        })
        .await
    }

    pub async fn preview_order(&self, request: OrderRequest) -> Result<OrderPreview, ExchangeError> {
        metrics::record_metrics("preview_order", move || async move {
            let request = &request;
            self.retrying("preview_order", move || async move {
                let preview = self.processor.preview(self.store.as_ref(), request).await?;
                Ok((preview, Outbox::new()))
            })
            .await
        })
        .await
    }

    /// Orders matching `filter`, newest first.
    pub async fn list_orders(&self, filter: OrderFilter) -> Result<Vec<Order>, ExchangeError> {
        metrics::record_metrics("list_orders", move || async move {
            let filter = &filter;
            self.retrying("list_orders", move || async move {
                Ok((self.store.find_orders(filter).await?, Outbox::new()))
            })
            .await
        })
        .await
    }

    /// Cash balance and every asset holding of `user_id`.
    pub async fn portfolio(&self, user_id: UserId) -> Result<Portfolio, ExchangeError> {
        metrics::record_metrics("portfolio", move || async move {
            self.retrying("portfolio", move || async move {
                let user = self
                    .store
                    .user(user_id)
                    .await?
                    .ok_or_else(|| ExchangeError::NotFound(format!("user {}", user_id)))?;
                let assets = self.store.assets_of(user_id).await?;
                Ok((Portfolio { user, assets }, Outbox::new()))
            })
            .await
        })
        .await
    }

    /// Up to `limit` trades, newest first.
    pub async fn recent_trades(&self, limit: usize) -> Result<Vec<Trade>, ExchangeError> {
        metrics::record_metrics("recent_trades", move || async move {
            self.retrying("recent_trades", move || async move {
                Ok((self.store.recent_trades(limit).await?, Outbox::new()))
            })
            .await
        })
        .await
    }

    async fn try_create_order(
        &self,
        request: OrderRequest,
    ) -> Result<((Order, Vec<Trade>), Outbox), ExchangeError> {
        let mut tx = self.store.begin().await?;
        let mut outbox = Outbox::new();
        let placed = self
            .processor
            .place_order(tx.as_mut(), &mut outbox, request)
            .await?;
        tx.commit().await?;
        Ok((placed, outbox))
    }

    async fn try_cancel_order(
        &self,
        user_id: UserId,
        order_id: OrderId,
    ) -> Result<(Order, Outbox), ExchangeError> {
        let mut tx = self.store.begin().await?;
        let mut outbox = Outbox::new();
        let order = self
            .processor
            .cancel_order(tx.as_mut(), &mut outbox, user_id, order_id)
            .await?;
        tx.commit().await?;
        Ok((order, outbox))
    }

    async fn try_match_orders(&self, symbol: &str) -> Result<(Vec<Trade>, Outbox), ExchangeError> {
        let mut tx = self.store.begin().await?;
        let mut outbox = Outbox::new();
        let trades = Matcher::match_book(tx.as_mut(), &mut outbox, symbol).await?;
        tx.commit().await?;
        Ok((trades, outbox))
    }

    /// Runs `attempt` until it succeeds, fails for good or runs out of
    /// retries, then publishes the events of the successful attempt.
    async fn retrying<T, F, Fut>(&self, method: &'static str, mut attempt: F) -> Result<T, ExchangeError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(T, Outbox), ExchangeError>>,
    {
        let mut retries: u32 = 0;
        loop {
            match attempt().await {
                Ok((value, outbox)) => {
                    outbox.publish_to(self.sink.as_ref());
                    return Ok(value);
                }
                Err(e) if e.is_retryable() && retries < self.config.max_retries => {
                    retries += 1;
                    let backoff = self
                        .config
                        .retry_backoff
                        .saturating_mul(2u32.saturating_pow(retries - 1));
                    warn!(
                        "{} attempt {} failed with {:?}, retrying in {:?}",
                        method, retries, e, backoff
                    );
                    metrics::RETRY_COUNTER_VEC.with_label_values(&[method]).inc();
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
