//! HYPE Martingale Bot
//!
//! Runs a leveraged martingale cycle per user on Binance USDT-M futures or
//! Bybit linear perpetuals, controlled from Telegram.

mod api;
mod bot;
mod db;
mod models;
mod notify;
mod registry;
mod trading;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::bot::{Bot, BotConfig};
use crate::db::{Database, RecordStore};
use crate::notify::{LogNotifier, Notifier, TelegramClient};
use crate::registry::{AuthOutcome, RegistrySettings, UserProfile, UserRegistry};
use crate::trading::{calculator, StrategyConfig};

/// Martingale futures bot CLI.
#[derive(Parser)]
#[command(name = "hype-martingale")]
#[command(about = "Per-user martingale futures trading driven from Telegram", long_about = None)]
struct Cli {
    /// Database URL
    #[arg(short, long, env = "DATABASE_URL", default_value = "sqlite:./hype_martingale.db?mode=rwc")]
    database: String,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Telegram bot token; without it notifications only go to the log
    #[arg(long, env = "TELEGRAM_BOT_TOKEN", default_value = "", hide_env_values = true)]
    telegram_token: String,

    /// Access code users send with /start
    #[arg(long, env = "AUTHORIZATION_CODE", default_value = "HYPE2025", hide_env_values = true)]
    authorization_code: String,

    /// Telegram user id allowed to run admin commands
    #[arg(long, env = "ADMIN_USER_ID")]
    admin_user_id: Option<i64>,

    /// Use exchange testnets
    #[arg(long, env = "SANDBOX")]
    sandbox: bool,

    #[command(flatten)]
    strategy: StrategyArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Strategy overrides; anything left out keeps its default.
#[derive(Args)]
struct StrategyArgs {
    /// Futures leverage (1-100)
    #[arg(long, env = "LEVERAGE")]
    leverage: Option<u32>,

    /// Take profit on price (percent)
    #[arg(long, env = "TAKE_PROFIT_PCT")]
    take_profit: Option<Decimal>,

    /// Fraction of balance used as the base margin
    #[arg(long, env = "BALANCE_FRACTION")]
    balance_fraction: Option<Decimal>,

    /// Price drop that adds a level (percent)
    #[arg(long, env = "PRICE_DROP_TRIGGER_PCT")]
    drop_trigger: Option<Decimal>,

    /// Margin multiplier between levels
    #[arg(long, env = "MARTINGALE_MULTIPLIER")]
    multiplier: Option<Decimal>,

    /// Number of martingale levels (3-20)
    #[arg(long, env = "MAX_LEVELS")]
    max_levels: Option<usize>,

    /// Minimum balance to open a cycle (USDT)
    #[arg(long, env = "MIN_BALANCE")]
    min_balance: Option<Decimal>,

    /// Traded symbol (unified form)
    #[arg(long, env = "SYMBOL")]
    symbol: Option<String>,
}

impl StrategyArgs {
    fn into_config(self) -> StrategyConfig {
        let defaults = StrategyConfig::default();
        StrategyConfig {
            leverage: self.leverage.unwrap_or(defaults.leverage),
            take_profit_pct: self.take_profit.unwrap_or(defaults.take_profit_pct),
            balance_fraction: self.balance_fraction.unwrap_or(defaults.balance_fraction),
            price_drop_trigger_pct: self.drop_trigger.unwrap_or(defaults.price_drop_trigger_pct),
            multiplier: self.multiplier.unwrap_or(defaults.multiplier),
            max_levels: self.max_levels.unwrap_or(defaults.max_levels),
            min_balance: self.min_balance.unwrap_or(defaults.min_balance),
            symbol: self.symbol.unwrap_or(defaults.symbol),
            ..defaults
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Start the bot: command intake, trading and maintenance loops
    Run {
        /// Trading pass interval in seconds
        #[arg(short, long, default_value = "5")]
        interval: u64,

        /// Maintenance (backup / eviction) interval in seconds
        #[arg(long, default_value = "3600")]
        maintenance_interval: u64,
    },

    /// Authorize a user id directly
    Authorize {
        /// Telegram user id
        user_id: i64,

        /// Access code
        code: String,
    },

    /// List users and registry counts
    Users,

    /// Show the validated strategy configuration
    Config,

    /// Disable trading for every user and flatten open positions
    EmergencyStop {
        /// Seconds to wait for a running bot to carry out the stop
        #[arg(long, default_value = "120")]
        wait: u64,
    },

    /// Back up every user record now
    Backup,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_level.to_lowercase()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let strategy = cli.strategy.into_config();
    strategy.validate()?;

    let settings = RegistrySettings {
        authorization_code: cli.authorization_code.clone(),
        sandbox: cli.sandbox,
        ..Default::default()
    };

    // Initialize database
    let db = Arc::new(Database::new(&cli.database).await?);
    let registry = Arc::new(UserRegistry::new(db.clone(), strategy.clone(), settings));

    match cli.command {
        Commands::Run {
            interval,
            maintenance_interval,
        } => {
            registry.restore(true).await?;

            let telegram = TelegramClient::new(&cli.telegram_token).map(Arc::new);
            let notifier: Arc<dyn Notifier> = match &telegram {
                Some(client) => client.clone(),
                None => Arc::new(LogNotifier),
            };

            let bot_config = BotConfig {
                trade_interval_secs: interval,
                maintenance_interval_secs: maintenance_interval,
                admin_user_id: cli.admin_user_id,
                ..Default::default()
            };

            info!(
                symbol = %strategy.symbol,
                leverage = strategy.leverage,
                sandbox = cli.sandbox,
                "Starting martingale bot"
            );

            let counts = registry.counts().await;
            println!("\n=== HYPE Martingale Bot ===");
            println!("Symbol:          {}", strategy.symbol);
            println!("Leverage:        {}x", strategy.leverage);
            println!("Pass interval:   {}s", interval);
            println!("Mode:            {}", if cli.sandbox { "TESTNET" } else { "LIVE TRADING" });
            println!("Telegram:        {}", if telegram.is_some() { "enabled" } else { "log only" });
            println!("Users:           {} authorized, {} trading", counts.authorized, counts.trading_enabled);
            println!("\nPress Ctrl+C to stop.\n");

            let bot = Arc::new(Bot::new(bot_config, registry, notifier, telegram));
            bot.clone().run().await?;

            let stats = bot.stats().await;
            println!("\n{}", stats);
        }

        Commands::Authorize { user_id, code } => {
            registry.restore(false).await?;

            match registry.authorize(user_id, &code, UserProfile::default()).await? {
                AuthOutcome::Authorized => println!("Authorized user {}", user_id),
                AuthOutcome::AlreadyAuthorized => println!("User {} is already authorized", user_id),
            }
        }

        Commands::Users => {
            registry.restore(false).await?;
            let counts = registry.counts().await;
            let summaries = registry.summaries().await;

            println!("\n{}\n", counts);

            if summaries.is_empty() {
                println!("No users yet. Users join by sending /start <code> to the bot.");
                return Ok(());
            }

            println!(
                "{:<12} {:<18} {:<8} {:<8} {:>6} {:>7} {:>12} {:>12}",
                "USER ID", "NAME", "EXCHANGE", "TRADING", "LEVEL", "CYCLES", "PROFIT", "BALANCE"
            );
            println!("{}", "-".repeat(90));

            for s in summaries {
                let level = if s.is_active {
                    (s.current_step + 1).to_string()
                } else {
                    "-".to_string()
                };
                println!(
                    "{:<12} {:<18} {:<8} {:<8} {:>6} {:>7} {:>12} {:>12}",
                    s.user_id,
                    truncate(&s.name, 18),
                    s.exchange.map(|e| e.as_str()).unwrap_or("-"),
                    if s.trading_enabled { "yes" } else { "no" },
                    level,
                    s.cycle_count,
                    format!("${:.4}", s.total_profit),
                    format!("${:.2}", s.current_balance),
                );
            }
        }

        Commands::Config => {
            let sequence = calculator::martingale_sequence(
                calculator::base_amount(strategy.placeholder_balance, strategy.balance_fraction),
                strategy.multiplier,
                strategy.max_levels,
            );
            let total_risk = calculator::total_risk(&sequence);

            println!("\n=== Strategy Configuration ===\n");
            println!("Market:");
            println!("  Symbol:               {}", strategy.symbol);
            println!("  Leverage:             {}x", strategy.leverage);

            println!("\nCycle Rules:");
            println!("  Take Profit:          {}% on price", strategy.take_profit_pct);
            println!("  Martingale Trigger:   {}% drop", strategy.price_drop_trigger_pct);
            println!("  Multiplier:           {}", strategy.multiplier);
            println!("  Max Levels:           {}", strategy.max_levels);

            println!("\nSizing:");
            println!("  Balance Fraction:     {}", strategy.balance_fraction);
            println!("  Min Balance:          ${}", strategy.min_balance);
            println!("  Resize Threshold:     {}%", strategy.rebalance_threshold * Decimal::from(100));

            println!("\nSequence for ${} balance:", strategy.placeholder_balance);
            for (i, margin) in sequence.iter().enumerate() {
                println!("  Level {:>2}:             ${}", i + 1, margin);
            }
            println!("  Total Risk:           ${}", total_risk);
        }

        Commands::EmergencyStop { wait } => {
            // A running bot holds the live records; it has to do the flattening
            if let Some(last_seen) = bot::live_bot(&*db).await? {
                println!(
                    "A running bot was active at {}; handing the emergency stop to it...",
                    last_seen.format("%Y-%m-%d %H:%M:%S UTC")
                );
                bot::queue_emergency_stop(&*db).await?;

                match bot::await_emergency_stop(&*db, Duration::from_secs(wait)).await? {
                    Some(summary) => {
                        println!("Running bot completed the emergency stop: {}", summary);
                        println!("Per-user results were sent to each user.");
                    }
                    None => anyhow::bail!(
                        "running bot has not picked up the emergency stop after {}s; \
                         the request stays queued and runs on its next pass",
                        wait
                    ),
                }
                return Ok(());
            }

            registry.restore(true).await?;

            let notifier: Arc<dyn Notifier> = match TelegramClient::new(&cli.telegram_token) {
                Some(client) => Arc::new(client),
                None => Arc::new(LogNotifier),
            };
            let bot = Bot::new(BotConfig::default(), registry, notifier, None);

            let results = bot.emergency_stop_all().await;
            if results.is_empty() {
                println!("No users loaded.");
                return Ok(());
            }

            println!("\n{:<12} {}", "USER ID", "RESULT");
            println!("{}", "-".repeat(60));
            for (user_id, result) in results {
                let outcome = match result {
                    Ok(Some(_)) => "position closed, trading disabled".to_string(),
                    Ok(None) => "no position, trading disabled".to_string(),
                    Err(e) => format!("FAILED: {}", e),
                };
                println!("{:<12} {}", user_id, outcome);
            }
        }

        Commands::Backup => {
            registry.restore(false).await?;
            let written = registry.backup_all().await;
            let stats = db.storage_stats().await?;

            println!("Backed up {} records", written);
            println!("Storage: {}", stats);
        }
    }

    Ok(())
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
