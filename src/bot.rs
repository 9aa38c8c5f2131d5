//! Bot runner: the three scheduled loops over one registry.
//!
//! Handles:
//! - Command intake from Telegram long polling
//! - Trading passes over every loaded user, concurrently, at a fixed cadence
//! - Maintenance: backups, backup pruning and eviction of inactive users
//! - Emergency stops queued by the command line through the database
//! - Final backup and shutdown broadcast

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::db::RecordStore;
use crate::notify::{self, commands::CommandHandler, render, Notifier, TelegramClient};
use crate::registry::{RegistryCounts, RegistryError, SessionHandle, UserRegistry, UserSession};
use crate::trading::{PassAction, TradeEvent};

const HEARTBEAT_KEY: &str = "heartbeat";
const EMERGENCY_STOP_KEY: &str = "emergency_stop";
const EMERGENCY_RESULT_KEY: &str = "emergency_stop_result";

/// Bot configuration.
#[derive(Debug, Clone)]
pub struct BotConfig {
    /// Trading pass interval (seconds)
    pub trade_interval_secs: u64,

    /// Upper bound for one user's pass (seconds)
    pub pass_timeout_secs: u64,

    /// Backup / eviction interval (seconds)
    pub maintenance_interval_secs: u64,

    /// Backups older than this are pruned (days)
    pub backup_retention_days: i64,

    /// Telegram long-poll timeout (seconds)
    pub poll_timeout_secs: u64,

    /// User allowed to run admin commands
    pub admin_user_id: Option<i64>,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            trade_interval_secs: 5,
            pass_timeout_secs: 60,
            maintenance_interval_secs: 3600,
            backup_retention_days: 7,
            poll_timeout_secs: 30,
            admin_user_id: None,
        }
    }
}

#[derive(Debug, Default)]
struct PassCounters {
    passes: AtomicU64,
    cycles_opened: AtomicU64,
    levels_added: AtomicU64,
    cycles_closed: AtomicU64,
    failed_transitions: AtomicU64,
    timeouts: AtomicU64,
}

/// Result of one user's pass, for the loop summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PassOutcome {
    Busy,
    NoGateway,
    Done,
    Failed,
    TimedOut,
}

/// Main bot runner.
pub struct Bot {
    config: BotConfig,
    registry: Arc<UserRegistry>,
    notifier: Arc<dyn Notifier>,
    telegram: Option<Arc<TelegramClient>>,
    counters: PassCounters,
    started_at: Instant,

    // Shutdown signal
    shutdown: Arc<AtomicBool>,
}

impl Bot {
    pub fn new(
        config: BotConfig,
        registry: Arc<UserRegistry>,
        notifier: Arc<dyn Notifier>,
        telegram: Option<Arc<TelegramClient>>,
    ) -> Self {
        Self {
            config,
            registry,
            notifier,
            telegram,
            counters: PassCounters::default(),
            started_at: Instant::now(),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Run every loop until shutdown.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        info!(
            trade_interval = self.config.trade_interval_secs,
            maintenance_interval = self.config.maintenance_interval_secs,
            telegram = self.telegram.is_some(),
            "Starting bot loops"
        );

        // Register shutdown handler
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received");
            shutdown.store(true, Ordering::SeqCst);
        });

        let intake = self
            .telegram
            .clone()
            .map(|telegram| tokio::spawn(self.clone().intake_loop(telegram)));
        let maintenance = tokio::spawn(self.clone().maintenance_loop());

        self.trading_loop().await;

        if let Some(handle) = intake {
            handle.abort();
        }
        maintenance.abort();

        self.shutdown().await;
        Ok(())
    }

    // ==================== Trading ====================

    async fn trading_loop(&self) {
        let mut ticker = interval(Duration::from_secs(self.config.trade_interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while !self.shutdown.load(Ordering::SeqCst) {
            ticker.tick().await;
            self.poll_control().await;
            self.trading_pass().await;
        }
    }

    /// Offer every loaded user to the engine once, concurrently.
    pub async fn trading_pass(&self) {
        let sessions = self.registry.sessions().await;
        if sessions.is_empty() {
            return;
        }

        let outcomes = join_all(
            sessions
                .into_iter()
                .map(|(user_id, handle)| self.process_session(user_id, handle)),
        )
        .await;

        self.counters.passes.fetch_add(1, Ordering::Relaxed);
        let busy = outcomes.iter().filter(|o| **o == PassOutcome::Busy).count();
        let failed = outcomes
            .iter()
            .filter(|o| matches!(o, PassOutcome::Failed | PassOutcome::TimedOut))
            .count();
        debug!(users = outcomes.len(), busy, failed, "Trading pass complete");
    }

    async fn process_session(&self, user_id: i64, handle: SessionHandle) -> PassOutcome {
        // One pass per user at a time; a user still busy is picked up next tick
        let Ok(mut guard) = handle.try_lock() else {
            debug!(user_id, "Previous pass still running, skipping");
            return PassOutcome::Busy;
        };
        let UserSession { record, gateway } = &mut *guard;
        if !record.trading_enabled {
            return PassOutcome::Done;
        }
        let Some(gateway) = gateway.as_ref() else {
            warn!(user_id, "Trading enabled without an exchange connection");
            return PassOutcome::NoGateway;
        };

        let timeout = Duration::from_secs(self.config.pass_timeout_secs);
        let report = match tokio::time::timeout(timeout, self.registry.engine().process_user(record, gateway)).await {
            Ok(report) => report,
            Err(_) => {
                // The cancelled transition never committed; close reconciles
                // against the exchange size.
                let interrupted = record.in_flight.take();
                warn!(
                    user_id,
                    timeout_secs = timeout.as_secs(),
                    transition = ?interrupted,
                    "Trading pass timed out"
                );
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                self.registry.save(record).await;
                return PassOutcome::TimedOut;
            }
        };

        let outcome = match &report.action {
            Ok(action) => {
                let counter = match action {
                    PassAction::Opened => Some(&self.counters.cycles_opened),
                    PassAction::LevelAdded => Some(&self.counters.levels_added),
                    PassAction::Closed => Some(&self.counters.cycles_closed),
                    _ => None,
                };
                if let Some(counter) = counter {
                    counter.fetch_add(1, Ordering::Relaxed);
                }
                PassOutcome::Done
            }
            Err(e) => {
                debug!(user_id, error = %e, "Pass ended without a transition");
                self.counters.failed_transitions.fetch_add(1, Ordering::Relaxed);
                PassOutcome::Failed
            }
        };

        if report.should_persist() {
            self.registry.save(record).await;
        }
        drop(guard);

        notify::deliver_events(self.notifier.as_ref(), user_id, &report.events).await;
        outcome
    }

    // ==================== Maintenance ====================

    async fn maintenance_loop(self: Arc<Self>) {
        let period = Duration::from_secs(self.config.maintenance_interval_secs);
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            self.maintenance().await;
        }
    }

    /// Back up every record, prune old backups and unload idle users.
    pub async fn maintenance(&self) {
        let now = Utc::now();

        let backed_up = self.registry.backup_all().await;

        let cutoff = now - chrono::Duration::days(self.config.backup_retention_days);
        let pruned = match self.registry.store().prune_backups(cutoff).await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "Failed to prune backups");
                0
            }
        };

        let evicted = self.registry.evict_inactive(now).await;
        let counts = self.registry.counts().await;

        info!(
            backed_up,
            pruned,
            evicted = evicted.len(),
            authorized = counts.authorized,
            trading = counts.trading_enabled,
            in_cycle = counts.in_cycle,
            "Maintenance complete"
        );
    }

    // ==================== Intake ====================

    async fn intake_loop(self: Arc<Self>, telegram: Arc<TelegramClient>) {
        info!("Command intake started");
        let handler = CommandHandler::new(&self.registry, self.config.admin_user_id);
        let poll_timeout = Duration::from_secs(self.config.poll_timeout_secs);
        let mut offset = 0;

        while !self.shutdown.load(Ordering::SeqCst) {
            let messages = match telegram.get_updates(offset, poll_timeout).await {
                Ok((next_offset, messages)) => {
                    offset = next_offset;
                    messages
                }
                Err(e) => {
                    warn!(error = %e, "Failed to fetch Telegram updates");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
            };

            for message in messages {
                if let Some(reply) = handler.handle(&message).await {
                    notify::deliver(telegram.as_ref(), message.chat_id, &reply).await;
                }
            }
        }
    }

    // ==================== Control ====================

    /// Flatten and disable every user, notifying each one.
    pub async fn emergency_stop_all(&self) -> Vec<(i64, Result<Option<TradeEvent>, RegistryError>)> {
        warn!("Emergency stop for all users");
        let results = self.registry.emergency_stop_all().await;

        for (user_id, result) in &results {
            let text = match result {
                Ok(Some(event)) => render::event(event),
                Ok(None) => render::text("Emergency stop: trading disabled, no open position."),
                Err(e) => render::text(&format!("Emergency stop failed: {}. Trading is disabled.", e)),
            };
            notify::deliver(self.notifier.as_ref(), *user_id, &text).await;
        }
        results
    }

    /// Write the liveness heartbeat and run an emergency stop queued by
    /// another process.
    pub async fn poll_control(&self) {
        let store = self.registry.store();
        let stale_after = 2 * self.config.trade_interval_secs + self.config.pass_timeout_secs;
        if let Err(e) = store.set_control(HEARTBEAT_KEY, &stale_after.to_string()).await {
            warn!(error = %e, "Failed to write heartbeat");
        }

        let requested_at = match store.get_control(EMERGENCY_STOP_KEY).await {
            Ok(Some((_, at))) => at,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "Failed to read control flags");
                return;
            }
        };

        warn!(requested_at = %requested_at, "Emergency stop requested from the command line");
        let results = self.emergency_stop_all().await;
        let summary = EmergencySummary::from_results(&results);
        info!(%summary, "Queued emergency stop complete");

        if let Err(e) = store.set_control(EMERGENCY_RESULT_KEY, &summary.to_string()).await {
            warn!(error = %e, "Failed to record emergency stop result");
        }
        if let Err(e) = store.clear_control(EMERGENCY_STOP_KEY).await {
            warn!(error = %e, "Failed to clear emergency stop request");
        }
    }

    async fn shutdown(&self) {
        info!("Shutting down bot...");

        let backed_up = self.registry.backup_all().await;
        info!(backed_up, "Final backup written");

        if let Err(e) = self.registry.store().clear_control(HEARTBEAT_KEY).await {
            warn!(error = %e, "Failed to clear heartbeat");
        }

        let text = render::text("Bot is shutting down. Open cycles resume when it restarts.");
        for (user_id, handle) in self.registry.sessions().await {
            let trading = handle.lock().await.record.trading_enabled;
            if trading || self.config.admin_user_id == Some(user_id) {
                notify::deliver(self.notifier.as_ref(), user_id, &text).await;
            }
        }

        let stats = self.stats().await;
        info!("\n{}", stats);
    }

    pub async fn stats(&self) -> BotStats {
        BotStats {
            users: self.registry.counts().await,
            passes: self.counters.passes.load(Ordering::Relaxed),
            cycles_opened: self.counters.cycles_opened.load(Ordering::Relaxed),
            levels_added: self.counters.levels_added.load(Ordering::Relaxed),
            cycles_closed: self.counters.cycles_closed.load(Ordering::Relaxed),
            failed_transitions: self.counters.failed_transitions.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            uptime: self.started_at.elapsed(),
        }
    }
}

/// Per-user outcome counts of an emergency stop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmergencySummary {
    pub closed: usize,
    pub flat: usize,
    pub failed: usize,
}

impl EmergencySummary {
    pub fn from_results(results: &[(i64, Result<Option<TradeEvent>, RegistryError>)]) -> Self {
        let mut summary = Self::default();
        for (_, result) in results {
            match result {
                Ok(Some(_)) => summary.closed += 1,
                Ok(None) => summary.flat += 1,
                Err(_) => summary.failed += 1,
            }
        }
        summary
    }
}

impl std::fmt::Display for EmergencySummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} positions closed, {} already flat, {} failed",
            self.closed, self.flat, self.failed
        )
    }
}

/// When the running bot last wrote its heartbeat, if it is still fresh.
pub async fn live_bot(store: &dyn RecordStore) -> Result<Option<DateTime<Utc>>> {
    let Some((value, at)) = store.get_control(HEARTBEAT_KEY).await? else {
        return Ok(None);
    };
    Ok(heartbeat_is_fresh(&value, at, Utc::now()).then_some(at))
}

fn heartbeat_is_fresh(stale_after_secs: &str, written_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    // Unreadable values wait out the longest window rather than bypass a live bot
    const MAX_STALE_SECS: i64 = 86_400;
    let stale_after = stale_after_secs
        .parse::<i64>()
        .unwrap_or(MAX_STALE_SECS)
        .clamp(0, MAX_STALE_SECS);
    now - written_at < chrono::Duration::seconds(stale_after)
}

/// Queue an emergency stop for the running bot.
pub async fn queue_emergency_stop(store: &dyn RecordStore) -> Result<()> {
    store.clear_control(EMERGENCY_RESULT_KEY).await?;
    store.set_control(EMERGENCY_STOP_KEY, "all").await
}

/// Wait for the running bot to finish a queued emergency stop. Returns its
/// summary, or `None` if the request is still pending after `wait`.
pub async fn await_emergency_stop(store: &dyn RecordStore, wait: Duration) -> Result<Option<String>> {
    let deadline = Instant::now() + wait;
    loop {
        if store.get_control(EMERGENCY_STOP_KEY).await?.is_none() {
            let summary = store.get_control(EMERGENCY_RESULT_KEY).await?;
            return Ok(Some(summary.map(|(value, _)| value).unwrap_or_default()));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

/// Bot statistics.
#[derive(Debug, Clone)]
pub struct BotStats {
    pub users: RegistryCounts,
    pub passes: u64,
    pub cycles_opened: u64,
    pub levels_added: u64,
    pub cycles_closed: u64,
    pub failed_transitions: u64,
    pub timeouts: u64,
    pub uptime: Duration,
}

impl std::fmt::Display for BotStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Bot Statistics ===")?;
        writeln!(f, "{}", self.users)?;
        writeln!(f, "Passes:         {}", self.passes)?;
        writeln!(f, "Cycles opened:  {}", self.cycles_opened)?;
        writeln!(f, "Levels added:   {}", self.levels_added)?;
        writeln!(f, "Cycles closed:  {}", self.cycles_closed)?;
        writeln!(f, "Failed:         {} ({} timed out)", self.failed_transitions, self.timeouts)?;
        writeln!(f, "Uptime:         {}s", self.uptime.as_secs())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::mock::MockGateway;
    use crate::api::{ApiCredentials, ExchangeGateway, GatewaySettings};
    use crate::db::Database;
    use crate::models::ExchangeKind;
    use crate::notify::NotifyError;
    use crate::registry::{Connector, RegistrySettings, UserProfile};
    use crate::trading::StrategyConfig;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<(i64, String)>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send(&self, chat_id: i64, text: &str) -> Result<(), NotifyError> {
            self.sent.lock().unwrap().push((chat_id, text.to_string()));
            Ok(())
        }
    }

    fn fast_gateway() -> GatewaySettings {
        GatewaySettings {
            call_timeout: Duration::from_millis(200),
            retry_initial_interval: Duration::from_millis(5),
            retry_max_elapsed: Duration::from_millis(100),
        }
    }

    /// Bot whose connector hands out the mock registered under the API key.
    async fn make_bot_with(
        mocks: Vec<(&'static str, Arc<MockGateway>)>,
        config: BotConfig,
        gateway: GatewaySettings,
    ) -> (Arc<Bot>, Arc<RecordingNotifier>) {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let connector: Connector = Arc::new(move |_: ExchangeKind, credentials: &ApiCredentials, _: bool| -> anyhow::Result<Arc<dyn ExchangeGateway>> {
            let mock = mocks
                .iter()
                .find(|(key, _)| *key == credentials.api_key)
                .map(|(_, mock)| mock.clone())
                .ok_or_else(|| anyhow::anyhow!("unknown api key"))?;
            let gateway: Arc<dyn ExchangeGateway> = mock;
            Ok(gateway)
        });
        let settings = RegistrySettings {
            gateway,
            ..Default::default()
        };
        let registry = Arc::new(
            UserRegistry::new(db, StrategyConfig::default(), settings).with_connector(connector),
        );
        let notifier = Arc::new(RecordingNotifier::default());
        let bot = Bot::new(config, registry, notifier.clone(), None);
        (Arc::new(bot), notifier)
    }

    async fn make_bot(mock: &Arc<MockGateway>) -> (Arc<Bot>, Arc<RecordingNotifier>) {
        make_bot_with(vec![("k", mock.clone())], BotConfig::default(), fast_gateway()).await
    }

    async fn start_trading(bot: &Bot, user_id: i64) {
        start_trading_as(bot, user_id, "k").await;
    }

    async fn start_trading_as(bot: &Bot, user_id: i64, api_key: &str) {
        let registry = &bot.registry;
        registry
            .authorize(user_id, "HYPE2025", UserProfile::default())
            .await
            .unwrap();
        registry.select_exchange(user_id, ExchangeKind::Binance).await.unwrap();
        registry
            .connect_exchange(
                user_id,
                ApiCredentials {
                    api_key: api_key.to_string(),
                    api_secret: "s".to_string(),
                },
            )
            .await
            .unwrap();
        registry.request_start(user_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_trading_pass_opens_and_notifies() {
        let mock = MockGateway::new(dec!(100), dec!(100));
        let (bot, notifier) = make_bot(&mock).await;
        start_trading(&bot, 1).await;

        bot.trading_pass().await;

        let handle = bot.registry.session(1).await.unwrap();
        assert!(handle.lock().await.record.is_active);
        assert_eq!(mock.orders().len(), 1);

        let sent = notifier.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, 1);
        assert!(sent[0].1.contains("Cycle started"));

        let stats = bot.stats().await;
        assert_eq!(stats.cycles_opened, 1);
        assert_eq!(stats.passes, 1);
    }

    #[tokio::test]
    async fn test_busy_session_is_skipped() {
        let mock = MockGateway::new(dec!(100), dec!(100));
        let (bot, _) = make_bot(&mock).await;
        start_trading(&bot, 2).await;

        let handle = bot.registry.session(2).await.unwrap();
        let guard = handle.lock().await;
        bot.trading_pass().await;
        assert!(mock.orders().is_empty());
        drop(guard);

        bot.trading_pass().await;
        assert_eq!(mock.orders().len(), 1);
    }

    #[tokio::test]
    async fn test_users_are_isolated() {
        let mock = MockGateway::new(dec!(100), dec!(100));
        let (bot, _) = make_bot(&mock).await;
        start_trading(&bot, 3).await;
        bot.registry.authorize(4, "HYPE2025", UserProfile::default()).await.unwrap();

        bot.trading_pass().await;

        let trading = bot.registry.session(3).await.unwrap();
        let idle = bot.registry.session(4).await.unwrap();
        assert!(trading.lock().await.record.is_active);
        assert!(!idle.lock().await.record.is_active);
    }

    #[tokio::test]
    async fn test_emergency_stop_all() {
        let mock = MockGateway::new(dec!(100), dec!(100));
        let (bot, notifier) = make_bot(&mock).await;
        start_trading(&bot, 5).await;
        bot.trading_pass().await;

        let results = bot.emergency_stop_all().await;
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0].1, Ok(Some(TradeEvent::EmergencyClosed { .. }))));
        assert_eq!(mock.position(), rust_decimal::Decimal::ZERO);

        let sent = notifier.sent.lock().unwrap().clone();
        assert!(sent.last().unwrap().1.contains("Emergency close"));
    }

    #[tokio::test]
    async fn test_maintenance_backs_up() {
        let mock = MockGateway::new(dec!(100), dec!(100));
        let (bot, _) = make_bot(&mock).await;
        start_trading(&bot, 6).await;

        bot.maintenance().await;
        let stats = bot.registry.store().storage_stats().await.unwrap();
        assert_eq!(stats.backups, 1);
    }

    #[tokio::test]
    async fn test_hung_pass_times_out_without_blocking_others() {
        let slow = MockGateway::new(dec!(100), dec!(100));
        let fast = MockGateway::new(dec!(100), dec!(100));
        let config = BotConfig {
            pass_timeout_secs: 1,
            ..Default::default()
        };
        // Exchange calls outlive the pass budget
        let gateway = GatewaySettings {
            call_timeout: Duration::from_secs(30),
            ..fast_gateway()
        };
        let (bot, _) = make_bot_with(vec![("slow", slow.clone()), ("fast", fast.clone())], config, gateway).await;
        start_trading_as(&bot, 7, "slow").await;
        start_trading_as(&bot, 8, "fast").await;
        slow.state.lock().unwrap().hang_orders = true;

        let handle = bot.registry.session(7).await.unwrap();
        assert_eq!(bot.process_session(7, handle.clone()).await, PassOutcome::TimedOut);
        {
            let session = handle.lock().await;
            assert!(!session.record.trade_in_progress());
            assert!(!session.record.is_active);
            assert!(session.record.trading_enabled);
        }
        assert_eq!(bot.stats().await.timeouts, 1);

        // The hung user times out again while the other one trades
        bot.trading_pass().await;
        assert_eq!(bot.stats().await.timeouts, 2);
        let other = bot.registry.session(8).await.unwrap();
        assert!(other.lock().await.record.is_active);
        assert_eq!(fast.orders().len(), 1);
        assert!(slow.orders().is_empty());

        // Next tick recovers once the exchange answers again
        slow.state.lock().unwrap().hang_orders = false;
        bot.trading_pass().await;
        assert!(handle.lock().await.record.is_active);
        assert_eq!(slow.position(), dec!(0.05));

        let results = bot.emergency_stop_all().await;
        assert_eq!(results.len(), 2);
        assert!(results
            .iter()
            .all(|(_, result)| matches!(result, Ok(Some(TradeEvent::EmergencyClosed { .. })))));
        assert_eq!(slow.position(), rust_decimal::Decimal::ZERO);
        assert_eq!(fast.position(), rust_decimal::Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_queued_emergency_stop_runs_on_next_tick() {
        let mock = MockGateway::new(dec!(100), dec!(100));
        let (bot, notifier) = make_bot(&mock).await;
        start_trading(&bot, 9).await;
        bot.trading_pass().await;
        assert_eq!(mock.position(), dec!(0.05));

        let store = bot.registry.store().clone();
        assert!(live_bot(&*store).await.unwrap().is_none());

        queue_emergency_stop(&*store).await.unwrap();
        assert_eq!(await_emergency_stop(&*store, Duration::ZERO).await.unwrap(), None);

        bot.poll_control().await;
        assert!(live_bot(&*store).await.unwrap().is_some());
        let summary = await_emergency_stop(&*store, Duration::from_secs(1)).await.unwrap();
        assert_eq!(summary.as_deref(), Some("1 positions closed, 0 already flat, 0 failed"));
        assert_eq!(mock.position(), rust_decimal::Decimal::ZERO);
        assert!(notifier
            .sent
            .lock()
            .unwrap()
            .iter()
            .any(|(chat_id, text)| *chat_id == 9 && text.contains("Emergency close")));

        // The live record stays disabled, so the next pass does not reopen
        let orders = mock.orders().len();
        bot.poll_control().await;
        bot.trading_pass().await;
        assert_eq!(mock.orders().len(), orders);
        let handle = bot.registry.session(9).await.unwrap();
        assert!(!handle.lock().await.record.trading_enabled);

        bot.shutdown().await;
        assert!(live_bot(&*store).await.unwrap().is_none());
    }

    #[test]
    fn test_heartbeat_freshness() {
        let now = Utc::now();
        assert!(heartbeat_is_fresh("70", now - chrono::Duration::seconds(30), now));
        assert!(!heartbeat_is_fresh("70", now - chrono::Duration::seconds(71), now));
        assert!(heartbeat_is_fresh("garbage", now - chrono::Duration::hours(1), now));
        assert!(!heartbeat_is_fresh("garbage", now - chrono::Duration::days(2), now));
    }

    #[test]
    fn test_emergency_summary() {
        let results: Vec<(i64, Result<Option<TradeEvent>, RegistryError>)> = vec![
            (1, Ok(None)),
            (2, Err(RegistryError::NotConnected)),
            (3, Ok(None)),
        ];
        let summary = EmergencySummary::from_results(&results);
        assert_eq!(summary, EmergencySummary { closed: 0, flat: 2, failed: 1 });
        assert_eq!(summary.to_string(), "0 positions closed, 2 already flat, 1 failed");
    }
}
