//! User and session registry.
//!
//! Owns every authorized user's record together with their exchange handle.
//! Each session sits behind its own `tokio::sync::Mutex`, so a user's record
//! is only ever mutated by one task at a time while different users proceed
//! independently. Durability is delegated to a [`RecordStore`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::api::{self, ApiCredentials, ExchangeGateway, GatewayAdapter, GatewaySettings};
use crate::db::RecordStore;
use crate::models::{ExchangeKind, UserRecord};
use crate::trading::{StrategyConfig, TradeEvent, TradingEngine, TransitionError};

/// Builds an authenticated exchange client.
pub type Connector =
    Arc<dyn Fn(ExchangeKind, &ApiCredentials, bool) -> Result<Arc<dyn ExchangeGateway>> + Send + Sync>;

/// A user's record plus the exchange handle trading runs through.
pub struct UserSession {
    pub record: UserRecord,
    pub gateway: Option<GatewayAdapter>,
}

pub type SessionHandle = Arc<Mutex<UserSession>>;

/// Registry-level failures surfaced to the user.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid authorization code")]
    InvalidCode,

    #[error("user {0} is not authorized")]
    NotAuthorized(i64),

    #[error("choose an exchange first")]
    ExchangeNotSelected,

    #[error("exchange is not connected")]
    NotConnected,

    #[error("could not connect to {exchange}: {reason}")]
    ConnectFailed { exchange: ExchangeKind, reason: String },

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    Authorized,
    AlreadyAuthorized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafeStopOutcome {
    /// No cycle open; trading disabled immediately
    Stopped,
    /// Will disable after the active cycle closes
    Pending,
    /// Trading was not enabled
    NotTrading,
}

/// Optional profile fields picked up from the chat front end.
#[derive(Debug, Clone, Default)]
pub struct UserProfile {
    pub username: Option<String>,
    pub first_name: Option<String>,
}

/// Aggregate counts for operational visibility.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryCounts {
    pub authorized: usize,
    pub loaded: usize,
    pub setup_complete: usize,
    pub trading_enabled: usize,
    pub in_cycle: usize,
}

impl std::fmt::Display for RegistryCounts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Authorized:     {}", self.authorized)?;
        writeln!(f, "Loaded:         {}", self.loaded)?;
        writeln!(f, "Setup complete: {}", self.setup_complete)?;
        writeln!(f, "Trading:        {}", self.trading_enabled)?;
        write!(f, "In cycle:       {}", self.in_cycle)
    }
}

/// One line of the user listing.
#[derive(Debug, Clone)]
pub struct UserSummary {
    pub user_id: i64,
    pub name: String,
    pub exchange: Option<ExchangeKind>,
    pub trading_enabled: bool,
    pub is_active: bool,
    pub current_step: usize,
    pub cycle_count: u32,
    pub total_profit: Decimal,
    pub current_balance: Decimal,
}

#[derive(Clone)]
pub struct RegistrySettings {
    /// Shared secret users send to get access
    pub authorization_code: String,

    /// Idle time after which a user without an open cycle is unloaded
    pub inactivity: Duration,

    /// Use exchange testnets
    pub sandbox: bool,

    pub gateway: GatewaySettings,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            authorization_code: "HYPE2025".to_string(),
            inactivity: Duration::days(30),
            sandbox: false,
            gateway: GatewaySettings::default(),
        }
    }
}

/// Explicit registry of user sessions, shared by `Arc` between loops.
pub struct UserRegistry {
    store: Arc<dyn RecordStore>,
    engine: TradingEngine,
    settings: RegistrySettings,
    connector: Connector,
    sessions: RwLock<HashMap<i64, SessionHandle>>,
    authorized: RwLock<HashSet<i64>>,
}

impl UserRegistry {
    pub fn new(store: Arc<dyn RecordStore>, strategy: StrategyConfig, settings: RegistrySettings) -> Self {
        Self {
            store,
            engine: TradingEngine::new(strategy),
            settings,
            connector: Arc::new(api::connect),
            sessions: RwLock::new(HashMap::new()),
            authorized: RwLock::new(HashSet::new()),
        }
    }

    /// Replace how exchange clients are built.
    pub fn with_connector(mut self, connector: Connector) -> Self {
        self.connector = connector;
        self
    }

    pub fn engine(&self) -> &TradingEngine {
        &self.engine
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    // ==================== Startup ====================

    /// Load the roster and every stored record. When `connect` is set, saved
    /// credentials are used to rebuild exchange handles.
    pub async fn restore(&self, connect: bool) -> Result<usize> {
        let roster = self.store.load_authorized().await?;
        let records = self.store.load_all_records().await?;

        self.authorized.write().await.extend(roster.iter().copied());

        let mut restored = 0;
        for record in records {
            if !roster.contains(&record.user_id) {
                debug!(user_id = record.user_id, "Skipping record of unauthorized user");
                continue;
            }
            let session = if connect {
                self.hydrate(record).await
            } else {
                UserSession { record, gateway: None }
            };
            self.sessions
                .write()
                .await
                .insert(session.record.user_id, Arc::new(Mutex::new(session)));
            restored += 1;
        }

        info!(authorized = roster.len(), restored, "Registry restored");
        Ok(restored)
    }

    /// Attach an exchange handle from saved credentials, if any.
    async fn hydrate(&self, record: UserRecord) -> UserSession {
        let gateway = match self.store.load_credentials(record.user_id).await {
            Ok(Some((exchange, credentials))) => match self.build_gateway(exchange, &credentials) {
                Ok((gateway, _)) => Some(gateway),
                Err(e) => {
                    warn!(user_id = record.user_id, error = %e, "Could not rebuild exchange client");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(user_id = record.user_id, error = %e, "Could not load credentials");
                None
            }
        };

        UserSession { record, gateway }
    }

    fn build_gateway(
        &self,
        exchange: ExchangeKind,
        credentials: &ApiCredentials,
    ) -> Result<(GatewayAdapter, Arc<dyn ExchangeGateway>)> {
        let raw = (self.connector)(exchange, credentials, self.settings.sandbox)?;
        let adapter = GatewayAdapter::new(raw.clone(), self.settings.gateway.clone());
        Ok((adapter, raw))
    }

    // ==================== Authorization ====================

    pub async fn is_authorized(&self, user_id: i64) -> bool {
        self.authorized.read().await.contains(&user_id)
    }

    /// Grant access with the shared code. Re-authorizing is a no-op success.
    pub async fn authorize(
        &self,
        user_id: i64,
        code: &str,
        profile: UserProfile,
    ) -> Result<AuthOutcome, RegistryError> {
        if self.is_authorized(user_id).await {
            if let Some(handle) = self.session(user_id).await {
                let mut session = handle.lock().await;
                session.record.touch();
            }
            return Ok(AuthOutcome::AlreadyAuthorized);
        }

        if code.trim() != self.settings.authorization_code {
            warn!(user_id, "Authorization attempt with wrong code");
            return Err(RegistryError::InvalidCode);
        }

        self.store.save_authorized(user_id).await?;
        self.authorized.write().await.insert(user_id);

        let record = match self.store.load_record(user_id).await? {
            Some(existing) => existing,
            None => {
                let strategy = self.engine.config();
                let mut record = UserRecord::new(
                    user_id,
                    &strategy.symbol,
                    strategy.params(),
                    strategy.placeholder_balance,
                );
                record.username = profile.username;
                record.first_name = profile.first_name;
                self.store.save_record(&record).await?;
                record
            }
        };

        let session = self.hydrate(record).await;
        self.sessions
            .write()
            .await
            .insert(user_id, Arc::new(Mutex::new(session)));

        info!(user_id, "User authorized");
        Ok(AuthOutcome::Authorized)
    }

    /// Session for an authorized user, reloading it from the store if it was
    /// evicted from memory.
    pub async fn session(&self, user_id: i64) -> Option<SessionHandle> {
        if let Some(handle) = self.sessions.read().await.get(&user_id) {
            return Some(handle.clone());
        }
        if !self.is_authorized(user_id).await {
            return None;
        }

        let record = match self.store.load_record(user_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                let strategy = self.engine.config();
                UserRecord::new(user_id, &strategy.symbol, strategy.params(), strategy.placeholder_balance)
            }
            Err(e) => {
                warn!(user_id, error = %e, "Could not reload user record, trying latest backup");
                match self.store.latest_backup(user_id).await {
                    Ok(Some(record)) => {
                        info!(user_id, "User record recovered from backup");
                        record
                    }
                    _ => return None,
                }
            }
        };

        let session = self.hydrate(record).await;
        let mut sessions = self.sessions.write().await;
        let handle = sessions
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(session)))
            .clone();

        debug!(user_id, "Session reloaded");
        Some(handle)
    }

    async fn require_session(&self, user_id: i64) -> Result<SessionHandle, RegistryError> {
        self.session(user_id)
            .await
            .ok_or(RegistryError::NotAuthorized(user_id))
    }

    /// Snapshot of loaded sessions.
    pub async fn sessions(&self) -> Vec<(i64, SessionHandle)> {
        self.sessions
            .read()
            .await
            .iter()
            .map(|(id, handle)| (*id, handle.clone()))
            .collect()
    }

    // ==================== Setup ====================

    /// Choose the exchange. Clears a previous connection.
    pub async fn select_exchange(&self, user_id: i64, exchange: ExchangeKind) -> Result<(), RegistryError> {
        let handle = self.require_session(user_id).await?;
        let mut session = handle.lock().await;

        if session.record.is_active {
            return Err(TransitionError::AlreadyActive.into());
        }

        if session.record.exchange != Some(exchange) {
            session.record.exchange = Some(exchange);
            session.record.setup_complete = false;
            session.record.trading_enabled = false;
            session.gateway = None;
        }
        session.record.touch();
        self.save(&session.record).await;

        info!(user_id, exchange = %exchange, "Exchange selected");
        Ok(())
    }

    /// Build and verify the exchange client, store the credentials and finish
    /// setup. Returns the verified balance.
    pub async fn connect_exchange(
        &self,
        user_id: i64,
        credentials: ApiCredentials,
    ) -> Result<Decimal, RegistryError> {
        let handle = self.require_session(user_id).await?;
        let mut session = handle.lock().await;

        let exchange = session.record.exchange.ok_or(RegistryError::ExchangeNotSelected)?;
        if session.record.is_active {
            return Err(TransitionError::AlreadyActive.into());
        }

        let (gateway, raw) =
            self.build_gateway(exchange, &credentials)
                .map_err(|e| RegistryError::ConnectFailed {
                    exchange,
                    reason: e.to_string(),
                })?;

        // Probe without the adapter so a rejected key is not mistaken for an
        // empty account.
        let balance = raw.get_balance().await.map_err(|e| RegistryError::ConnectFailed {
            exchange,
            reason: e.to_string(),
        })?;

        self.store.save_credentials(user_id, exchange, &credentials).await?;

        let record = &mut session.record;
        if balance > Decimal::ZERO {
            self.engine.apply_balance(record, balance);
        }
        record.setup_complete = true;
        record.touch();
        session.gateway = Some(gateway);
        self.save(&session.record).await;

        info!(user_id, exchange = %exchange, balance = %balance, "Exchange connected");
        Ok(balance)
    }

    // ==================== Control ====================

    /// Enable trading once the user passes the readiness check.
    pub async fn request_start(&self, user_id: i64) -> Result<Decimal, RegistryError> {
        let handle = self.require_session(user_id).await?;
        let mut session = handle.lock().await;
        let gateway = session.gateway.clone().ok_or(RegistryError::NotConnected)?;

        let balance = self.engine.readiness(&session.record, &gateway).await?;

        session.record.trading_enabled = true;
        session.record.safe_stop_requested = false;
        session.record.touch();
        self.save(&session.record).await;

        info!(user_id, balance = %balance, "Trading enabled");
        Ok(balance)
    }

    /// Stop opening new cycles. An open cycle runs to take profit first.
    pub async fn request_safe_stop(&self, user_id: i64) -> Result<SafeStopOutcome, RegistryError> {
        let handle = self.require_session(user_id).await?;
        let mut session = handle.lock().await;
        let record = &mut session.record;
        record.touch();

        let outcome = if !record.trading_enabled {
            SafeStopOutcome::NotTrading
        } else if record.is_active {
            record.safe_stop_requested = true;
            SafeStopOutcome::Pending
        } else {
            record.trading_enabled = false;
            record.safe_stop_requested = false;
            SafeStopOutcome::Stopped
        };
        self.save(&session.record).await;

        info!(user_id, outcome = ?outcome, "Safe stop requested");
        Ok(outcome)
    }

    /// Disable trading and flatten the position immediately.
    pub async fn emergency_stop(&self, user_id: i64) -> Result<Option<TradeEvent>, RegistryError> {
        let handle = self.require_session(user_id).await?;
        let mut session = handle.lock().await;
        let UserSession { record, gateway } = &mut *session;
        record.touch();

        let result = match gateway {
            Some(gateway) => self.engine.emergency_close(record, gateway).await,
            None => {
                record.trading_enabled = false;
                record.safe_stop_requested = false;
                Ok(None)
            }
        };
        self.save(record).await;

        Ok(result?)
    }

    /// Emergency stop every loaded user.
    pub async fn emergency_stop_all(&self) -> Vec<(i64, Result<Option<TradeEvent>, RegistryError>)> {
        let mut results = Vec::new();
        for (user_id, _) in self.sessions().await {
            results.push((user_id, self.emergency_stop(user_id).await));
        }
        results
    }

    // ==================== Reporting ====================

    pub async fn counts(&self) -> RegistryCounts {
        let mut counts = RegistryCounts {
            authorized: self.authorized.read().await.len(),
            ..Default::default()
        };

        for (_, handle) in self.sessions().await {
            let session = handle.lock().await;
            counts.loaded += 1;
            if session.record.setup_complete {
                counts.setup_complete += 1;
            }
            if session.record.trading_enabled {
                counts.trading_enabled += 1;
            }
            if session.record.is_active {
                counts.in_cycle += 1;
            }
        }

        counts
    }

    pub async fn summaries(&self) -> Vec<UserSummary> {
        let mut summaries = Vec::new();
        for (_, handle) in self.sessions().await {
            let session = handle.lock().await;
            let r = &session.record;
            summaries.push(UserSummary {
                user_id: r.user_id,
                name: r.display_name(),
                exchange: r.exchange,
                trading_enabled: r.trading_enabled,
                is_active: r.is_active,
                current_step: r.current_step,
                cycle_count: r.cycle_count,
                total_profit: r.total_profit,
                current_balance: r.current_balance,
            });
        }
        summaries.sort_by_key(|s| s.user_id);
        summaries
    }

    // ==================== Persistence ====================

    /// Best-effort save; the in-memory record stays authoritative.
    pub async fn save(&self, record: &UserRecord) -> bool {
        match self.store.save_record(record).await {
            Ok(()) => true,
            Err(e) => {
                warn!(user_id = record.user_id, error = %e, "Failed to persist user record");
                false
            }
        }
    }

    /// Back up every loaded record. Returns how many were written.
    pub async fn backup_all(&self) -> usize {
        let mut written = 0;
        for (user_id, handle) in self.sessions().await {
            let record = handle.lock().await.record.clone();
            match self.store.backup_record(&record).await {
                Ok(()) => written += 1,
                Err(e) => warn!(user_id, error = %e, "Backup failed"),
            }
        }
        written
    }

    /// Unload users idle longer than the inactivity window. Users with an
    /// open cycle, enabled trading or a pass in progress are kept.
    pub async fn evict_inactive(&self, now: DateTime<Utc>) -> Vec<i64> {
        let mut evicted = Vec::new();

        for (user_id, handle) in self.sessions().await {
            let Ok(session) = handle.try_lock() else {
                continue;
            };
            let record = &session.record;
            if record.is_active || record.trading_enabled || record.idle_for(now) < self.settings.inactivity {
                continue;
            }

            if let Err(e) = self.store.backup_record(record).await {
                warn!(user_id, error = %e, "Backup before eviction failed, keeping session");
                continue;
            }
            self.save(record).await;
            drop(session);

            self.sessions.write().await.remove(&user_id);
            evicted.push(user_id);
        }

        if !evicted.is_empty() {
            info!(count = evicted.len(), "Evicted inactive users");
        }
        evicted
    }
}
