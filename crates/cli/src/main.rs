use anyhow::Result;
use clap::{Parser, Subcommand};
use signal_trade_angelone::{AngelOneBroker, AngelOneClientConfig};
use signal_trade_core::{Broker, BrokerId, Exchange};
use signal_trade_execution::BrokerRegistry;
use signal_trade_instruments::{InstrumentIndex, InstrumentIndexConfig, SymbolResolver};
use signal_trade_shoonya::{NorenClientConfig, ShoonyaBroker};
use signal_trade_zerodha::{KiteClientConfig, ZerodhaBroker};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "signal-trade")]
#[command(about = "Signal-driven trading engine for Indian markets", long_about = None)]
struct Cli {
    /// Instrument cache file
    #[arg(long, default_value = "data/scripmaster.json", global = true)]
    cache: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve a raw signal symbol to a broker-tradeable ticker
    Resolve {
        /// Symbol as it appears in the signal (e.g. "NIFTY 25000 CE")
        symbol: String,
        /// Target exchange for equities
        #[arg(short, long, default_value = "NSE")]
        exchange: String,
    },
    /// Search the instrument master
    Search {
        /// Substring to match against symbols and names
        query: String,
        /// Restrict to one exchange segment
        #[arg(short, long)]
        exchange: Option<String>,
        /// Maximum results
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },
    /// Force a refresh of the instrument master
    RefreshInstruments,
    /// List registered broker backends
    Brokers,
}

fn build_index(cache: &str) -> Result<Arc<InstrumentIndex>> {
    let config = InstrumentIndexConfig::default().with_cache_path(cache);
    Ok(Arc::new(InstrumentIndex::new(config)?))
}

fn build_registry(index: Arc<InstrumentIndex>) -> Arc<BrokerRegistry> {
    let registry = Arc::new(BrokerRegistry::new());

    let angel_index = index;
    registry.register(
        BrokerId::AngelOne,
        Arc::new(move || {
            let broker = AngelOneBroker::new(AngelOneClientConfig::default(), angel_index.clone())?;
            Ok(Arc::new(broker) as Arc<dyn Broker>)
        }),
    );
    registry.register(
        BrokerId::Zerodha,
        Arc::new(|| {
            let broker = ZerodhaBroker::new(KiteClientConfig::default())?;
            Ok(Arc::new(broker) as Arc<dyn Broker>)
        }),
    );
    registry.register(
        BrokerId::Shoonya,
        Arc::new(|| {
            let broker = ShoonyaBroker::new(NorenClientConfig::default())?;
            Ok(Arc::new(broker) as Arc<dyn Broker>)
        }),
    );

    registry
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let index = build_index(&cli.cache)?;

    match cli.command {
        Commands::Resolve { symbol, exchange } => {
            let resolver = SymbolResolver::new(index);
            let result = resolver.resolve(&symbol, &Exchange::parse(&exchange)).await;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Search {
            query,
            exchange,
            limit,
        } => {
            let exchange = exchange.map(|e| Exchange::parse(&e));
            let hits = index.search(&query, exchange.as_ref(), limit).await;
            if hits.is_empty() {
                println!("no instruments matched '{query}'");
            }
            for inst in hits {
                println!(
                    "{:<6} {:<24} {:<10} {}",
                    inst.exchange, inst.symbol, inst.token, inst.name
                );
            }
        }
        Commands::RefreshInstruments => {
            let refreshed = index.load(true).await?;
            if refreshed {
                println!("instrument master refreshed ({} instruments)", index.len());
            } else {
                println!("refresh already in progress, not restarted");
            }
        }
        Commands::Brokers => {
            let registry = build_registry(index);
            for id in registry.list_available() {
                let broker = registry.create(id, true)?;
                let status = if broker.is_logged_in() {
                    "logged in"
                } else {
                    "logged out"
                };
                let default = if registry.default_broker() == Some(id) {
                    " (default)"
                } else {
                    ""
                };
                println!("{id}{default}: {status}");
            }
        }
    }

    Ok(())
}
