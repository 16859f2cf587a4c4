use clap::Parser;
use hdrhistogram::Histogram;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use spot_match::{
    Asset, MatchEngine, MemLedger, NullSink, OrderFilter, OrderRequest,
    OrderStatus, RuntimeConfig, Side, User,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of concurrent clients
    #[arg(short, long, default_value = "8")]
    concurrency: usize,

    /// Number of seeded users the clients trade as
    #[arg(short, long, default_value = "16")]
    users: u64,

    /// Pause between two requests of one client, ms
    #[arg(short, long, default_value = "0")]
    interval: u64,

    /// Duration of the benchmark in seconds
    #[arg(short, long, default_value = "10")]
    duration: u64,

    /// Book the clients trade on
    #[arg(short, long, default_value = "BTC/USDT")]
    symbol: String,

    /// Runtime config supplying the lock wait and retry policy
    #[arg(long, default_value = "config.toml")]
    config: String,
}

/// Outcome counters shared by all clients.
struct Stats {
    latency: Histogram<u64>,
    completed: u64,
    rejected: u64,
}

impl Stats {
    fn new() -> anyhow::Result<Self> {
        Ok(Stats {
            latency: Histogram::new(3)?,
            completed: 0,
            rejected: 0,
        })
    }

    fn report(&self, seconds: u64, trades: usize) {
        println!("\nBenchmark Results:");
        println!("Completed: {}  Rejected: {}  Trades: {}", self.completed, self.rejected, trades);
        println!("Throughput: {:.2} ops/s", self.completed as f64 / seconds.max(1) as f64);
        println!("\nLatency (microseconds):");
        for percentile in [50.0, 90.0, 95.0, 99.0, 99.9] {
            println!("  p{:<5} {}", percentile, self.latency.value_at_percentile(percentile));
        }
        println!("  max    {}", self.latency.max());
    }
}

const START_BALANCE: Decimal = dec!(1000000);
const START_BASE: Decimal = dec!(100);

fn seed(ledger: &MemLedger, users: u64, base: &str) {
    for id in 1..=users {
        ledger.insert_user(User::new(id, START_BALANCE));
        ledger.insert_asset(Asset::new(id, base, START_BASE));
    }
}

/// Checks the ledger after the run; returns the violations found.
fn audit(ledger: &MemLedger, users: u64, base: &str) -> Vec<String> {
    let mut violations = Vec::new();
    for user in ledger.users() {
        if user.balance < Decimal::ZERO {
            violations.push(format!("user {} balance {}", user.id, user.balance));
        }
    }

    let mut open_sells: HashMap<u64, Decimal> = HashMap::new();
    for order in ledger.orders() {
        if order.status == OrderStatus::Open && order.side == Side::Sell {
            *open_sells.entry(order.user_id).or_default() += order.amount;
        }
    }
    let mut total_base = Decimal::ZERO;
    for asset in ledger.assets().iter().filter(|a| a.symbol == base) {
        total_base += asset.amount;
        if asset.available_amount() < Decimal::ZERO {
            violations.push(format!(
                "user {} {} available {}",
                asset.user_id,
                base,
                asset.available_amount()
            ));
        }
        let open = open_sells.get(&asset.user_id).copied().unwrap_or_default();
        if asset.locked_amount < open {
            violations.push(format!(
                "user {} locks {} {} behind {} of open sells",
                asset.user_id, asset.locked_amount, base, open
            ));
        }
    }
    // buyers are credited, sellers only see their lock released
    let traded: Decimal = ledger.trades().iter().map(|t| t.amount).sum();
    if total_base != START_BASE * Decimal::from(users) + traded {
        violations.push(format!(
            "{} supply is {} after {} traded",
            base, total_base, traded
        ));
    }

    let orders: HashMap<u64, _> = ledger.orders().into_iter().map(|o| (o.id, o)).collect();
    for trade in ledger.trades() {
        match (orders.get(&trade.buy_order_id), orders.get(&trade.sell_order_id)) {
            (Some(buy), Some(sell)) if buy.user_id != sell.user_id => {}
            _ => violations.push(format!("trade {} pairs invalid orders", trade.id)),
        }
    }
    violations
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::try_init().unwrap_or_default();
    let args = Args::parse();
    let base = args
        .symbol
        .split('/')
        .next()
        .unwrap_or(&args.symbol)
        .to_string();

    let config = RuntimeConfig::from_toml(&args.config);
    let ledger = Arc::new(MemLedger::new(config.lock_wait()));
    seed(&ledger, args.users, &base);
    let engine = MatchEngine::new(ledger.clone(), Arc::new(NullSink), config.engine());
    let stats = Arc::new(Mutex::new(Stats::new()?));

    println!(
        "Benchmarking {} with {} clients over {} users for {}s",
        args.symbol, args.concurrency, args.users, args.duration
    );

    let mut clients = Vec::with_capacity(args.concurrency);
    for client in 0..args.concurrency {
        let engine = engine.clone();
        let stats = stats.clone();
        let symbol = args.symbol.clone();
        let (users, interval) = (args.users, args.interval);

        clients.push(tokio::spawn(async move {
            let mut rng = StdRng::seed_from_u64(client as u64);
            for iteration in 1u64.. {
                let user_id = rng.gen_range(1..=users);
                let started = Instant::now();

                let outcome = if iteration % 50 == 0 {
                    engine.match_orders(&symbol).await.map(|_| ())
                } else if iteration % 7 == 0 {
                    let filter = OrderFilter {
                        user_id: Some(user_id),
                        status: Some(OrderStatus::Open),
                        ..OrderFilter::default()
                    };
                    match engine.list_orders(filter).await {
                        Ok(open) => match open.first() {
                            Some(order) => engine.cancel_order(user_id, order.id).await.map(|_| ()),
                            None => Ok(()),
                        },
                        Err(e) => Err(e),
                    }
                } else {
                    let side = if rng.gen_bool(0.5) { Side::Buy } else { Side::Sell };
                    let price = Decimal::from(rng.gen_range(95..=105u32));
                    let amount = Decimal::new(rng.gen_range(1..=5i64), 1);
                    engine
                        .create_order(OrderRequest {
                            user_id,
                            symbol: symbol.clone(),
                            side,
                            price,
                            amount,
                        })
                        .await
                        .map(|_| ())
                };

                let elapsed = started.elapsed();
                {
                    let mut stats = stats.lock().await;
                    match outcome {
                        Ok(()) => {
                            stats.latency.saturating_record(elapsed.as_micros() as u64);
                            stats.completed += 1;
                        }
                        Err(e) => {
                            log::debug!("request rejected: {}", e);
                            stats.rejected += 1;
                        }
                    }
                }

                if interval > 0 {
                    sleep(Duration::from_millis(interval)).await;
                } else {
                    tokio::task::yield_now().await;
                }
            }
        }));
    }

    sleep(Duration::from_secs(args.duration)).await;
    for client in clients {
        client.abort();
    }
    stats.lock().await.report(args.duration, ledger.trades().len());

    // aborted clients may still hold row locks until they are dropped
    sleep(config.lock_wait()).await;
    let violations = audit(&ledger, args.users, &base);
    if !violations.is_empty() {
        println!("\nLedger audit: {} violations", violations.len());
        for violation in &violations {
            println!("  {}", violation);
        }
        anyhow::bail!("ledger invariants violated");
    }
    println!("\nLedger audit: ok");
    Ok(())
}
