use crate::engine::data::{OrderBook, OrderBookRepo};
use crate::engine::entry::{NewOrder, Order, Side, Trade, UserId};
use crate::engine::spot::SettlementWriter;
use crate::engine::store::LedgerTx;
use crate::error::ExchangeError;
use crate::events::Outbox;
use log::debug;

/// The two matching policies. Both run inside the caller's transaction and
/// never pair orders of the same owner.
pub struct Matcher;

impl Matcher {
    /// Locks, in ascending id, the open counter-orders `incoming` crosses
    /// and does not own, then returns the ones still open in priority order.
    /// Runs before the incoming order reserves funds so that order rows are
    /// always locked ahead of user and asset rows.
    pub async fn lock_counter_orders(
        tx: &mut dyn LedgerTx,
        incoming: &NewOrder,
    ) -> Result<Vec<Order>, ExchangeError> {
        let counter_side = incoming.side.opposite();
        let ids: Vec<_> = OrderBookRepo::open_orders(tx, &incoming.symbol, counter_side)
            .await?
            .into_iter()
            .take_while(|o| incoming.side.crosses(incoming.price, o.price))
            .filter(|o| {
                if o.user_id == incoming.user_id {
                    debug!("user {} skips own order {}", incoming.user_id, o.id);
                }
                o.user_id != incoming.user_id
            })
            .map(|o| o.id)
            .collect();
        Ok(OrderBookRepo::lock_orders(tx, counter_side, &ids).await?)
    }

    /// Matches a freshly persisted order against `counters`, the result of
    /// [`Matcher::lock_counter_orders`]. Execution happens at the
    /// counter-order's price; the scan ends once `incoming` is filled.
    pub async fn match_incoming(
        tx: &mut dyn LedgerTx,
        outbox: &mut Outbox,
        incoming: &mut Order,
        counters: Vec<Order>,
    ) -> Result<Vec<Trade>, ExchangeError> {
        let mut trades = Vec::new();
        for mut counter in counters {
            if !incoming.is_open() {
                break;
            }
            let trade = match incoming.side {
                Side::Buy => {
                    SettlementWriter::settle(tx, outbox, incoming, &mut counter, Side::Sell).await?
                }
                Side::Sell => {
                    SettlementWriter::settle(tx, outbox, &mut counter, incoming, Side::Buy).await?
                }
            };
            trades.push(trade);
        }
        Ok(trades)
    }

    /// Batch pass over a whole book under lock. Only exactly equal amounts
    /// pair up; the SELL order's price is the execution price and a matched
    /// SELL order is out of the pass.
    pub async fn match_book(
        tx: &mut dyn LedgerTx,
        outbox: &mut Outbox,
        symbol: &str,
    ) -> Result<Vec<Trade>, ExchangeError> {
        let book = OrderBookRepo::lock_book(tx, symbol).await?;
        debug!(
            "batch pass {}: {} bids, {} asks locked",
            symbol,
            book.buy_orders.len(),
            book.sell_orders.len()
        );
        let pairs = Self::pair_book(book);
        let base = match pairs.first() {
            Some((bid, _)) => bid.base_asset().to_string(),
            None => return Ok(Vec::new()),
        };
        let parties: Vec<UserId> = pairs
            .iter()
            .flat_map(|(bid, ask)| [bid.user_id, ask.user_id])
            .collect();
        SettlementWriter::lock_parties(tx, &parties, &base).await?;

        let mut trades = Vec::with_capacity(pairs.len());
        for (mut bid, mut ask) in pairs {
            trades.push(SettlementWriter::settle(tx, outbox, &mut bid, &mut ask, Side::Sell).await?);
        }
        Ok(trades)
    }

    /// Each bid, best first, takes the first crossing ask of equal amount
    /// from another owner that no earlier bid took.
    fn pair_book(book: OrderBook) -> Vec<(Order, Order)> {
        let mut asks: Vec<Option<Order>> = book.sell_orders.into_iter().map(Some).collect();
        let mut pairs = Vec::new();
        for bid in book.buy_orders {
            for slot in asks.iter_mut() {
                let ask = match slot.as_ref() {
                    Some(ask) => ask,
                    None => continue,
                };
                if !Side::Buy.crosses(bid.price, ask.price) {
                    break;
                }
                if ask.user_id == bid.user_id || ask.amount != bid.amount {
                    continue;
                }
                if let Some(ask) = slot.take() {
                    pairs.push((bid, ask));
                }
                break;
            }
        }
        pairs
    }
}
