use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use scalpbot::exchange::{
    BinanceFuturesClient, Exchange, MarketScenario, PaperExchange, SyntheticMarket,
};
use scalpbot::trading::{prepare_account, BotState, Runner, StopReason};
use scalpbot::StrategyConfig;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "scalpbot=info";

#[derive(Parser, Debug)]
#[command(
    name = "scalpbot",
    version,
    about = "EMA/RSI crossover scalping bot for Binance USDT-M futures"
)]
struct Cli {
    /// TOML config file; SCALPBOT_* environment variables override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Trade against an in-memory account fed by synthetic bars
    #[arg(long)]
    paper: bool,

    /// Use the live Binance endpoint instead of the testnet
    #[arg(long, conflicts_with = "paper")]
    mainnet: bool,

    /// Run a single cycle and exit
    #[arg(long)]
    once: bool,

    /// Log level for the bot (overrides RUST_LOG)
    #[arg(long)]
    log_level: Option<String>,

    /// Seed for the synthetic market in paper mode
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Synthetic market behaviour in paper mode: swings, sideways or volatile
    #[arg(long, default_value = "swings")]
    scenario: MarketScenario,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    setup_logging(cli.log_level.as_deref())?;

    tracing::info!("=== SCALPING BOT ===");
    let mut interrupted = listen_for_interrupt()?;

    let mut config =
        StrategyConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    if cli.mainnet {
        config.testnet = false;
    }

    let exchange: Arc<dyn Exchange> = if cli.paper {
        tracing::warn!(
            "📝 PAPER MODE - orders are simulated in memory ({:?} market)",
            cli.scenario
        );
        let interval = chrono::Duration::from_std(config.timeframe_duration()?)
            .context("timeframe out of range")?;
        Arc::new(PaperExchange::new().with_market(
            SyntheticMarket::new(cli.seed, 2_000.0).with_scenario(cli.scenario),
            interval,
            config.lookback,
        ))
    } else {
        if config.testnet {
            tracing::warn!("⚠️ TESTNET MODE - no real funds are used");
        } else {
            tracing::warn!("💰 MAINNET MODE - trading real funds");
        }
        let api_key = std::env::var("BINANCE_API_KEY").context("BINANCE_API_KEY not set")?;
        let api_secret =
            std::env::var("BINANCE_API_SECRET").context("BINANCE_API_SECRET not set")?;

        let client = BinanceFuturesClient::new(api_key, api_secret, config.testnet)?;
        if let Err(e) = client.sync_time().await {
            tracing::warn!("Could not sync clock with Binance, using local time: {}", e);
        }
        Arc::new(client)
    };

    let config = prepare_account(exchange.as_ref(), &config)
        .await
        .context("failed to configure account")?;
    log_configuration(&config);

    let mut state = BotState::new(&config);
    let mut runner = Runner::new(exchange, config);
    if cli.once {
        runner = runner.with_max_cycles(1);
    }

    if *interrupted.borrow() {
        tracing::info!("👋 Interrupted before the first cycle, nothing to do");
        return Ok(());
    }
    let shutdown = async move {
        if interrupted.wait_for(|set| *set).await.is_err() {
            // Listener gone without an interrupt
            std::future::pending::<()>().await;
        }
    };

    match runner.run(&mut state, shutdown).await? {
        StopReason::Interrupted | StopReason::CycleLimit => {
            tracing::info!("👋 Bot stopped after {} cycles", state.cycles);
            Ok(())
        }
        StopReason::PermanentFailures(n) => {
            anyhow::bail!("stopped after {} consecutive permanent exchange errors", n)
        }
    }
}

/// Install the Ctrl+C handler before any order can be sent
///
/// The flag stays set, so an interrupt that lands mid-cycle is seen as soon
/// as the cycle finishes.
fn listen_for_interrupt() -> anyhow::Result<watch::Receiver<bool>> {
    let (tx, rx) = watch::channel(false);

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint =
            signal(SignalKind::interrupt()).context("failed to install Ctrl+C handler")?;
        tokio::spawn(async move {
            if sigint.recv().await.is_some() {
                tracing::info!("🛑 Ctrl+C received, stopping after the current cycle");
                let _ = tx.send(true);
            }
        });
    }

    #[cfg(not(unix))]
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("🛑 Ctrl+C received, stopping after the current cycle");
                let _ = tx.send(true);
            }
            Err(e) => tracing::error!("Failed to listen for Ctrl+C: {}", e),
        }
    });

    Ok(rx)
}

fn setup_logging(level: Option<&str>) -> anyhow::Result<()> {
    let filter = match level {
        Some(level) => EnvFilter::try_new(format!("scalpbot={}", level))
            .with_context(|| format!("invalid log level '{}'", level))?,
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

fn log_configuration(config: &StrategyConfig) {
    tracing::info!("📊 Configuration:");
    tracing::info!("  Symbol: {} ({})", config.symbol, config.timeframe);
    tracing::info!(
        "  Size: {} x{} leverage ({:?} margin)",
        config.amount,
        config.leverage,
        config.margin_mode
    );
    tracing::info!(
        "  SL / TP: {:.2}% / {:.2}%",
        config.stop_loss_pct * 100.0,
        config.take_profit_pct * 100.0
    );
    tracing::info!(
        "  EMA {}/{}, RSI {} ({}/{})",
        config.ema_fast_period,
        config.ema_slow_period,
        config.rsi_period,
        config.rsi_oversold,
        config.rsi_overbought
    );
    if config.volume_filter {
        tracing::info!("  Volume filter: {}-bar average", config.volume_window);
    }
}
