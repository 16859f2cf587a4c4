use anyhow::Context;
use clap::{Parser, Subcommand};
use spot_match::config::RuntimeConfig;
use spot_match::server::Server;
use spot_match::{LogSink, MatchEngine, MySqlLedger};
use std::sync::Arc;
use tokio::signal;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Runtime config file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the scheduled batch pass and the metrics endpoint until interrupted
    Serve,
    /// Run one batch pass and print the resulting trades
    MatchOrders {
        #[arg(short, long)]
        symbol: String,
    },
    /// Print the open orders of a book
    Orderbook {
        #[arg(short, long)]
        symbol: String,
    },
    /// Print a user's balance and asset holdings
    Portfolio {
        #[arg(short, long)]
        user: u64,
    },
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::try_init().unwrap_or_default();
    let args = Args::parse();
    let config = RuntimeConfig::from_toml(&args.config);

    let ledger = MySqlLedger::connect(&config.database_url, config.max_connections)
        .await
        .with_context(|| format!("connecting to {}", config.database_url))?;
    let engine = MatchEngine::new(Arc::new(ledger), Arc::new(LogSink), config.engine());

    match args.command {
        Command::Serve => {
            let mut server = Server::new(engine, config);
            server.start().await?;
            shutdown_signal().await;
            server.stop();
        }
        Command::MatchOrders { symbol } => {
            let trades = engine.match_orders(&symbol).await?;
            println!("{}", serde_json::to_string_pretty(&trades)?);
        }
        Command::Orderbook { symbol } => {
            let book = engine.get_orderbook(&symbol).await?;
            println!("{}", serde_json::to_string_pretty(&book)?);
        }
        Command::Portfolio { user } => {
            let portfolio = engine.portfolio(user).await?;
            println!("{}", serde_json::to_string_pretty(&portfolio)?);
        }
    }
    Ok(())
}
