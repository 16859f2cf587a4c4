//! In-process ledger
//!
//! Rows live in ordered maps behind one short-lived mutex that is never held
//! across an await. Each row key additionally owns an async lock; a
//! transaction keeps the guards of every row it touched until it commits or is
//! dropped. Writes are buffered in the transaction and applied in one step on
//! commit, so a dropped transaction leaves no trace.
//!
//! A lock that is not granted within the configured wait surfaces as
//! [`StoreError::LockTimeout`], which is how lock cycles between transactions
//! are broken.

use super::{LedgerStore, LedgerTx, OrderFilter, StoreError};
use crate::engine::entry::{
    Asset, NewOrder, NewTrade, Order, OrderId, Side, Trade, TradeId, User, UserId,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex as RowLock, OwnedMutexGuard};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum RowKey {
    User(UserId),
    Asset(UserId, String),
    Order(OrderId),
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowKey::User(id) => write!(f, "users row {}", id),
            RowKey::Asset(user_id, symbol) => write!(f, "assets row {}/{}", user_id, symbol),
            RowKey::Order(id) => write!(f, "orders row {}", id),
        }
    }
}

type AssetKey = (UserId, String);

#[derive(Debug, Default)]
struct Tables {
    users: BTreeMap<UserId, User>,
    assets: BTreeMap<AssetKey, Asset>,
    orders: BTreeMap<OrderId, Order>,
    trades: BTreeMap<TradeId, Trade>,
}

pub struct MemLedger {
    tables: Mutex<Tables>,
    row_locks: Mutex<HashMap<RowKey, Arc<RowLock<()>>>>,
    next_order_id: AtomicU64,
    next_trade_id: AtomicU64,
    lock_wait: Duration,
}

impl MemLedger {
    pub fn new(lock_wait: Duration) -> Self {
        MemLedger {
            tables: Mutex::new(Tables::default()),
            row_locks: Mutex::new(HashMap::new()),
            next_order_id: AtomicU64::new(1),
            next_trade_id: AtomicU64::new(1),
            lock_wait,
        }
    }

    /// Loads a user row outside of any transaction.
    pub fn insert_user(&self, user: User) {
        self.tables().users.insert(user.id, user);
    }

    /// Loads an asset row outside of any transaction.
    pub fn insert_asset(&self, asset: Asset) {
        self.tables()
            .assets
            .insert((asset.user_id, asset.symbol.clone()), asset);
    }

    pub fn users(&self) -> Vec<User> {
        self.tables().users.values().cloned().collect()
    }

    pub fn assets(&self) -> Vec<Asset> {
        self.tables().assets.values().cloned().collect()
    }

    pub fn orders(&self) -> Vec<Order> {
        self.tables().orders.values().cloned().collect()
    }

    pub fn trades(&self) -> Vec<Trade> {
        self.tables().trades.values().cloned().collect()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn acquire(&self, key: &RowKey) -> Result<OwnedMutexGuard<()>, StoreError> {
        let lock = self
            .row_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.clone())
            .or_default()
            .clone();
        match tokio::time::timeout(self.lock_wait, lock.lock_owned()).await {
            Ok(guard) => Ok(guard),
            Err(_) => {
                self.forget_idle([key]);
                Err(StoreError::LockTimeout(key.to_string()))
            }
        }
    }

    /// Drops the lock entries of `keys` that nobody holds or waits for.
    fn forget_idle<'k>(&self, keys: impl IntoIterator<Item = &'k RowKey>) {
        let mut locks = self.row_locks.lock().unwrap_or_else(PoisonError::into_inner);
        for key in keys {
            if locks.get(key).map_or(false, |lock| Arc::strong_count(lock) == 1) {
                locks.remove(key);
            }
        }
    }
}

impl Default for MemLedger {
    fn default() -> Self {
        MemLedger::new(Duration::from_millis(2000))
    }
}

#[async_trait]
impl LedgerStore for MemLedger {
    async fn begin<'a>(&'a self) -> Result<Box<dyn LedgerTx + 'a>, StoreError> {
        Ok(Box::new(MemTx::new(self)))
    }

    async fn user(&self, id: UserId) -> Result<Option<User>, StoreError> {
        let user = self.tables().users.get(&id).cloned();
        Ok(user)
    }

    async fn asset(&self, user_id: UserId, symbol: &str) -> Result<Option<Asset>, StoreError> {
        let asset = self
            .tables()
            .assets
            .get(&(user_id, symbol.to_string()))
            .cloned();
        Ok(asset)
    }

    async fn assets_of(&self, user_id: UserId) -> Result<Vec<Asset>, StoreError> {
        let assets = self
            .tables()
            .assets
            .range((user_id, String::new())..)
            .take_while(|((owner, _), _)| *owner == user_id)
            .map(|(_, asset)| asset.clone())
            .collect();
        Ok(assets)
    }

    async fn open_orders(&self, symbol: &str, side: Side) -> Result<Vec<Order>, StoreError> {
        let orders = self
            .tables()
            .orders
            .values()
            .filter(|o| o.is_open() && o.side == side && o.symbol == symbol)
            .cloned()
            .collect();
        Ok(orders)
    }

    async fn find_orders(&self, filter: &OrderFilter) -> Result<Vec<Order>, StoreError> {
        let mut orders: Vec<Order> = self
            .tables()
            .orders
            .values()
            .filter(|o| filter.matches(o))
            .cloned()
            .collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(orders)
    }

    async fn recent_trades(&self, limit: usize) -> Result<Vec<Trade>, StoreError> {
        let trades = self
            .tables()
            .trades
            .values()
            .rev()
            .take(limit)
            .cloned()
            .collect();
        Ok(trades)
    }
}

struct MemTx<'a> {
    ledger: &'a MemLedger,
    held: HashMap<RowKey, OwnedMutexGuard<()>>,
    users: BTreeMap<UserId, User>,
    assets: BTreeMap<AssetKey, Asset>,
    orders: BTreeMap<OrderId, Order>,
    trades: Vec<Trade>,
    finished: bool,
}

impl<'a> MemTx<'a> {
    fn new(ledger: &'a MemLedger) -> Self {
        MemTx {
            ledger,
            held: HashMap::new(),
            users: BTreeMap::new(),
            assets: BTreeMap::new(),
            orders: BTreeMap::new(),
            trades: Vec::new(),
            finished: false,
        }
    }

    fn release_locks(&mut self) {
        let keys: Vec<RowKey> = self
            .held
            .drain()
            .map(|(key, guard)| {
                drop(guard);
                key
            })
            .collect();
        self.ledger.forget_idle(&keys);
    }

    fn ensure_active(&self) -> Result<(), StoreError> {
        if self.finished {
            Err(StoreError::Finished)
        } else {
            Ok(())
        }
    }

    async fn lock(&mut self, key: RowKey) -> Result<(), StoreError> {
        self.ensure_active()?;
        if !self.held.contains_key(&key) {
            let guard = self.ledger.acquire(&key).await?;
            self.held.insert(key, guard);
        }
        Ok(())
    }

    fn read_user(&self, id: UserId) -> Option<User> {
        self.users
            .get(&id)
            .cloned()
            .or_else(|| self.ledger.tables().users.get(&id).cloned())
    }

    fn read_asset(&self, key: &AssetKey) -> Option<Asset> {
        self.assets
            .get(key)
            .cloned()
            .or_else(|| self.ledger.tables().assets.get(key).cloned())
    }

    fn read_order(&self, id: OrderId) -> Option<Order> {
        self.orders
            .get(&id)
            .cloned()
            .or_else(|| self.ledger.tables().orders.get(&id).cloned())
    }

    /// Ids of open orders for `symbol` as this transaction sees them.
    fn open_order_ids(&self, symbol: &str, side: Option<Side>) -> BTreeSet<OrderId> {
        let wanted =
            |o: &Order| o.is_open() && o.symbol == symbol && side.map_or(true, |s| s == o.side);
        let mut ids: BTreeSet<OrderId> = self
            .ledger
            .tables()
            .orders
            .values()
            .filter(|o| wanted(o))
            .map(|o| o.id)
            .collect();
        for order in self.orders.values() {
            if wanted(order) {
                ids.insert(order.id);
            } else {
                ids.remove(&order.id);
            }
        }
        ids
    }
}

#[async_trait]
impl<'a> LedgerTx for MemTx<'a> {
    async fn lock_user(&mut self, id: UserId) -> Result<Option<User>, StoreError> {
        self.lock(RowKey::User(id)).await?;
        Ok(self.read_user(id))
    }

    async fn save_user(&mut self, user: &User) -> Result<(), StoreError> {
        self.lock(RowKey::User(user.id)).await?;
        self.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn lock_asset(
        &mut self,
        user_id: UserId,
        symbol: &str,
    ) -> Result<Option<Asset>, StoreError> {
        self.lock(RowKey::Asset(user_id, symbol.to_string())).await?;
        Ok(self.read_asset(&(user_id, symbol.to_string())))
    }

    async fn save_asset(&mut self, asset: &Asset) -> Result<(), StoreError> {
        self.lock(RowKey::Asset(asset.user_id, asset.symbol.clone()))
            .await?;
        self.assets
            .insert((asset.user_id, asset.symbol.clone()), asset.clone());
        Ok(())
    }

    async fn lock_order(&mut self, id: OrderId) -> Result<Option<Order>, StoreError> {
        self.lock(RowKey::Order(id)).await?;
        Ok(self.read_order(id))
    }

    async fn open_orders(&mut self, symbol: &str, side: Side) -> Result<Vec<Order>, StoreError> {
        self.ensure_active()?;
        let ids = self.open_order_ids(symbol, Some(side));
        Ok(ids.into_iter().filter_map(|id| self.read_order(id)).collect())
    }

    async fn lock_open_orders(&mut self, symbol: &str) -> Result<Vec<Order>, StoreError> {
        let ids = self.open_order_ids(symbol, None);
        for id in &ids {
            self.lock(RowKey::Order(*id)).await?;
        }
        // re-read under the locks: a competing transaction may have closed some
        Ok(ids
            .into_iter()
            .filter_map(|id| self.read_order(id))
            .filter(|o| o.is_open())
            .collect())
    }

    async fn insert_order(&mut self, order: NewOrder) -> Result<Order, StoreError> {
        self.ensure_active()?;
        let id = self.ledger.next_order_id.fetch_add(1, Ordering::SeqCst);
        self.lock(RowKey::Order(id)).await?;
        let order = order.into_order(id);
        self.orders.insert(id, order.clone());
        Ok(order)
    }

    async fn save_order(&mut self, order: &Order) -> Result<(), StoreError> {
        self.lock(RowKey::Order(order.id)).await?;
        self.orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn insert_trade(&mut self, trade: NewTrade) -> Result<Trade, StoreError> {
        self.ensure_active()?;
        let id = self.ledger.next_trade_id.fetch_add(1, Ordering::SeqCst);
        let trade = trade.into_trade(id);
        self.trades.push(trade.clone());
        Ok(trade)
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        self.ensure_active()?;
        {
            let mut tables = self.ledger.tables();
            for (id, user) in std::mem::take(&mut self.users) {
                tables.users.insert(id, user);
            }
            for (key, asset) in std::mem::take(&mut self.assets) {
                tables.assets.insert(key, asset);
            }
            for (id, order) in std::mem::take(&mut self.orders) {
                tables.orders.insert(id, order);
            }
            for trade in std::mem::take(&mut self.trades) {
                tables.trades.insert(trade.id, trade);
            }
        }
        self.finished = true;
        self.release_locks();
        Ok(())
    }
}

impl Drop for MemTx<'_> {
    fn drop(&mut self) {
        self.release_locks();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::entry::OrderStatus;
    use rust_decimal_macros::dec;

    fn ledger() -> MemLedger {
        let ledger = MemLedger::new(Duration::from_millis(50));
        ledger.insert_user(User::new(1, dec!(100)));
        ledger.insert_user(User::new(2, dec!(100)));
        ledger
    }

    fn sell(user_id: UserId) -> NewOrder {
        NewOrder {
            user_id,
            symbol: "BTC/USDT".to_string(),
            side: Side::Sell,
            price: dec!(10),
            amount: dec!(1),
            created_at: 1,
        }
    }

    #[tokio::test]
    async fn commit_publishes_buffered_writes() {
        let ledger = ledger();
        let mut tx = ledger.begin().await.unwrap();
        let mut user = tx.lock_user(1).await.unwrap().unwrap();
        user.balance = dec!(40);
        tx.save_user(&user).await.unwrap();
        tx.save_asset(&Asset::new(1, "BTC", dec!(2))).await.unwrap();

        assert_eq!(ledger.user(1).await.unwrap().unwrap().balance, dec!(100));
        tx.commit().await.unwrap();
        assert_eq!(ledger.user(1).await.unwrap().unwrap().balance, dec!(40));
        assert_eq!(ledger.asset(1, "BTC").await.unwrap().unwrap().amount, dec!(2));
        assert!(matches!(tx.commit().await, Err(StoreError::Finished)));
    }

    #[tokio::test]
    async fn dropped_transaction_rolls_back() {
        let ledger = ledger();
        {
            let mut tx = ledger.begin().await.unwrap();
            tx.insert_order(sell(1)).await.unwrap();
            tx.save_user(&User::new(2, dec!(0))).await.unwrap();
        }
        assert!(ledger.orders().is_empty());
        assert_eq!(ledger.user(2).await.unwrap().unwrap().balance, dec!(100));
    }

    #[tokio::test]
    async fn locked_row_blocks_other_transactions_until_release() {
        let ledger = ledger();
        let mut first = ledger.begin().await.unwrap();
        first.lock_user(1).await.unwrap();

        let mut second = ledger.begin().await.unwrap();
        assert!(matches!(
            second.lock_user(1).await,
            Err(StoreError::LockTimeout(_))
        ));
        // unrelated rows stay available
        assert!(second.lock_user(2).await.unwrap().is_some());

        first.commit().await.unwrap();
        assert!(second.lock_user(1).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn holdings_of_one_user_by_symbol() {
        let ledger = ledger();
        ledger.insert_asset(Asset::new(2, "ETH", dec!(3)));
        ledger.insert_asset(Asset::new(1, "ETH", dec!(1)));
        ledger.insert_asset(Asset::new(1, "BTC", dec!(2)));
        let symbols: Vec<String> = ledger
            .assets_of(1)
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.symbol)
            .collect();
        assert_eq!(symbols, vec!["BTC", "ETH"]);
        assert!(ledger.assets_of(9).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn finished_transactions_leave_no_lock_entries() {
        let ledger = ledger();
        let mut tx = ledger.begin().await.unwrap();
        tx.lock_user(1).await.unwrap();
        tx.insert_order(sell(1)).await.unwrap();
        tx.commit().await.unwrap();
        assert!(ledger.row_locks.lock().unwrap().is_empty());

        {
            let mut first = ledger.begin().await.unwrap();
            first.lock_user(1).await.unwrap();
            let mut second = ledger.begin().await.unwrap();
            assert!(matches!(
                second.lock_user(1).await,
                Err(StoreError::LockTimeout(_))
            ));
            assert_eq!(ledger.row_locks.lock().unwrap().len(), 1);
        }
        assert!(ledger.row_locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_asset_key_is_still_locked() {
        let ledger = ledger();
        let mut first = ledger.begin().await.unwrap();
        assert!(first.lock_asset(1, "ETH").await.unwrap().is_none());

        let mut second = ledger.begin().await.unwrap();
        assert!(second.lock_asset(1, "ETH").await.is_err());
    }

    #[tokio::test]
    async fn locked_book_skips_orders_closed_by_a_committed_transaction() {
        let ledger = ledger();
        let mut setup = ledger.begin().await.unwrap();
        let first = setup.insert_order(sell(1)).await.unwrap();
        let second = setup.insert_order(sell(2)).await.unwrap();
        setup.commit().await.unwrap();

        let mut closer = ledger.begin().await.unwrap();
        let mut closed = closer.lock_order(first.id).await.unwrap().unwrap();
        closed.status = OrderStatus::Canceled;
        closer.save_order(&closed).await.unwrap();
        closer.commit().await.unwrap();

        let mut batch = ledger.begin().await.unwrap();
        let locked = batch.lock_open_orders("BTC/USDT").await.unwrap();
        assert_eq!(locked.iter().map(|o| o.id).collect::<Vec<_>>(), vec![second.id]);
    }

    #[tokio::test]
    async fn transaction_reads_its_own_writes() {
        let ledger = ledger();
        let mut tx = ledger.begin().await.unwrap();
        let order = tx.insert_order(sell(1)).await.unwrap();
        assert_eq!(tx.open_orders("BTC/USDT", Side::Sell).await.unwrap().len(), 1);
        assert!(ledger.open_orders("BTC/USDT", Side::Sell).await.unwrap().is_empty());

        let mut filled = order.clone();
        filled.status = OrderStatus::Filled;
        tx.save_order(&filled).await.unwrap();
        assert!(tx.open_orders("BTC/USDT", Side::Sell).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn listings_are_newest_first() {
        let ledger = ledger();
        let mut tx = ledger.begin().await.unwrap();
        let older = tx.insert_order(sell(1)).await.unwrap();
        let newer = tx
            .insert_order(NewOrder {
                created_at: 5,
                ..sell(2)
            })
            .await
            .unwrap();
        for _ in 0..3 {
            tx.insert_trade(NewTrade {
                symbol: "BTC/USDT".to_string(),
                buy_order_id: newer.id,
                sell_order_id: older.id,
                price: dec!(10),
                amount: dec!(1),
                commission: dec!(0.15),
                created_at: 5,
            })
            .await
            .unwrap();
        }
        tx.commit().await.unwrap();

        let orders = ledger.find_orders(&OrderFilter::default()).await.unwrap();
        assert_eq!(orders[0].id, newer.id);
        let trades = ledger.recent_trades(2).await.unwrap();
        assert_eq!(trades.len(), 2);
        assert!(trades[0].id > trades[1].id);
    }
}
