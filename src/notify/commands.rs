//! Chat command parsing and dispatch onto the registry.

use tracing::{debug, info};

use crate::api::ApiCredentials;
use crate::models::ExchangeKind;
use crate::registry::{AuthOutcome, RegistryError, SafeStopOutcome, UserProfile, UserRegistry};
use crate::trading::TradingEngine;

use super::render;
use super::ChatMessage;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `/start` with an optional access code
    Start(Option<String>),
    Exchange(Option<String>),
    SetApi { key: String, secret: String },
    /// `/setapi` with the wrong number of arguments
    SetApiUsage,
    Trade,
    Stop,
    Emergency,
    Status,
    Balance,
    Position,
    Users,
    Help,
    Unknown(String),
}

impl Command {
    /// Parse a message. Returns `None` for text that is not a command.
    pub fn parse(text: &str) -> Option<Command> {
        let text = text.trim();
        let mut parts = text.split_whitespace();
        let head = parts.next()?;
        let args: Vec<&str> = parts.collect();

        if !head.starts_with('/') {
            // Exchange names are also accepted as plain replies
            return match head.to_lowercase().as_str() {
                "binance" | "bybit" if args.is_empty() => Some(Command::Exchange(Some(head.to_lowercase()))),
                _ => None,
            };
        }

        // "/status@my_bot" -> "status"
        let name = head[1..].split('@').next().unwrap_or_default().to_lowercase();
        let first = args.first().map(|s| s.to_string());

        let command = match name.as_str() {
            "start" | "authorize" => Command::Start(first),
            "exchange" => Command::Exchange(first),
            "setapi" => match args.as_slice() {
                [key, secret] => Command::SetApi {
                    key: key.to_string(),
                    secret: secret.to_string(),
                },
                _ => Command::SetApiUsage,
            },
            "trade" | "starttrading" => Command::Trade,
            "stop" | "safestop" => Command::Stop,
            "emergency" => Command::Emergency,
            "status" => Command::Status,
            "balance" => Command::Balance,
            "position" => Command::Position,
            "users" => Command::Users,
            "help" => Command::Help,
            other => Command::Unknown(other.to_string()),
        };
        Some(command)
    }

    fn requires_authorization(&self) -> bool {
        !matches!(self, Command::Start(_) | Command::Help)
    }
}

/// Routes chat commands to registry operations and renders the replies.
pub struct CommandHandler<'a> {
    registry: &'a UserRegistry,
    admin_user_id: Option<i64>,
}

impl<'a> CommandHandler<'a> {
    pub fn new(registry: &'a UserRegistry, admin_user_id: Option<i64>) -> Self {
        Self {
            registry,
            admin_user_id,
        }
    }

    fn engine(&self) -> &TradingEngine {
        self.registry.engine()
    }

    /// Handle one message and return the reply text, if any.
    pub async fn handle(&self, message: &ChatMessage) -> Option<String> {
        let user_id = message.user_id;
        let authorized = self.registry.is_authorized(user_id).await;

        let Some(command) = Command::parse(&message.text) else {
            return Some(if authorized {
                render::text("Unknown command. Send /help for the list.")
            } else {
                render::text("Send /start <code> to get access.")
            });
        };

        debug!(user_id, command = command_name(&command), "Handling command");

        if command.requires_authorization() && !authorized {
            return Some(render::text("Not authorized. Send /start <code> to get access."));
        }

        let reply = match command {
            Command::Start(code) => self.start(message, code).await,
            Command::Exchange(name) => self.exchange(user_id, name).await,
            Command::SetApi { key, secret } => self.set_api(user_id, key, secret).await,
            Command::SetApiUsage => render::text("Usage: /setapi <key> <secret>"),
            Command::Trade => self.trade(user_id).await,
            Command::Stop => self.stop(user_id).await,
            Command::Emergency => self.emergency(user_id).await,
            Command::Status => self.status(user_id).await,
            Command::Balance => self.balance(user_id).await,
            Command::Position => self.position(user_id).await,
            Command::Users => self.users(user_id).await,
            Command::Help => render::help(),
            Command::Unknown(name) => render::text(&format!("Unknown command /{}. Send /help for the list.", name)),
        };
        Some(reply)
    }

    async fn start(&self, message: &ChatMessage, code: Option<String>) -> String {
        let user_id = message.user_id;

        if self.registry.is_authorized(user_id).await {
            return self.status(user_id).await;
        }
        let Some(code) = code else {
            return render::text("Welcome! Send /start <code> with your access code.");
        };

        let profile = UserProfile {
            username: message.username.clone(),
            first_name: message.first_name.clone(),
        };
        match self.registry.authorize(user_id, &code, profile).await {
            Ok(AuthOutcome::Authorized) => {
                info!(user_id, "New user authorized via chat");
                render::text("Access granted. Choose your exchange: /exchange binance or /exchange bybit")
            }
            Ok(AuthOutcome::AlreadyAuthorized) => render::text("You are already authorized."),
            Err(e) => reply_error(&e),
        }
    }

    async fn exchange(&self, user_id: i64, name: Option<String>) -> String {
        let Some(name) = name else {
            return render::text("Usage: /exchange <binance|bybit>");
        };
        let exchange: ExchangeKind = match name.parse() {
            Ok(exchange) => exchange,
            Err(e) => return render::text(&e.to_string()),
        };

        match self.registry.select_exchange(user_id, exchange).await {
            Ok(()) => render::text(&format!(
                "Exchange set to {}. Now send /setapi <key> <secret> with futures trading enabled keys.",
                exchange
            )),
            Err(e) => reply_error(&e),
        }
    }

    async fn set_api(&self, user_id: i64, key: String, secret: String) -> String {
        let credentials = ApiCredentials {
            api_key: key,
            api_secret: secret,
        };
        match self.registry.connect_exchange(user_id, credentials).await {
            Ok(balance) => render::text(&format!(
                "Connected. Free balance ${:.2}. Send /trade to start trading.",
                balance
            )),
            Err(e) => reply_error(&e),
        }
    }

    async fn trade(&self, user_id: i64) -> String {
        match self.registry.request_start(user_id).await {
            Ok(balance) => render::text(&format!(
                "Trading started with ${:.2}. The first cycle opens on the next pass.",
                balance
            )),
            Err(e) => reply_error(&e),
        }
    }

    async fn stop(&self, user_id: i64) -> String {
        match self.registry.request_safe_stop(user_id).await {
            Ok(SafeStopOutcome::Stopped) => render::text("Trading stopped."),
            Ok(SafeStopOutcome::Pending) => {
                render::text("Safe stop requested. Trading stops once the current cycle takes profit.")
            }
            Ok(SafeStopOutcome::NotTrading) => render::text("Trading is not running."),
            Err(e) => reply_error(&e),
        }
    }

    async fn emergency(&self, user_id: i64) -> String {
        match self.registry.emergency_stop(user_id).await {
            Ok(Some(event)) => render::event(&event),
            Ok(None) => render::text("No open position. Trading disabled."),
            Err(e) => render::text(&format!("Emergency close failed: {}. Trading is disabled.", e)),
        }
    }

    async fn status(&self, user_id: i64) -> String {
        let Some(handle) = self.registry.session(user_id).await else {
            return render::text("Not authorized.");
        };
        let (record, gateway) = {
            let session = handle.lock().await;
            (session.record.clone(), session.gateway.clone())
        };

        let status = match &gateway {
            Some(gateway) => self.engine().trading_status(&record, gateway).await,
            None => TradingEngine::status_from(&record, record.current_balance, None, None),
        };
        render::status(&record, &status)
    }

    async fn balance(&self, user_id: i64) -> String {
        match self.gateway_for(user_id).await {
            Ok(gateway) => render::balance(gateway.get_balance().await),
            Err(e) => reply_error(&e),
        }
    }

    async fn position(&self, user_id: i64) -> String {
        let Some(handle) = self.registry.session(user_id).await else {
            return render::text("Not authorized.");
        };
        let (record, gateway) = {
            let session = handle.lock().await;
            (session.record.clone(), session.gateway.clone())
        };
        let Some(gateway) = gateway else {
            return reply_error(&RegistryError::NotConnected);
        };

        let position = gateway.get_open_position(&record.symbol).await;
        render::position(&record, position.as_ref())
    }

    async fn users(&self, user_id: i64) -> String {
        if self.admin_user_id != Some(user_id) {
            return render::text("This command is for the administrator only.");
        }
        let counts = self.registry.counts().await;
        let summaries = self.registry.summaries().await;
        render::users(&counts, &summaries)
    }

    async fn gateway_for(&self, user_id: i64) -> Result<crate::api::GatewayAdapter, RegistryError> {
        let handle = self
            .registry
            .session(user_id)
            .await
            .ok_or(RegistryError::NotAuthorized(user_id))?;
        let session = handle.lock().await;
        session.gateway.clone().ok_or(RegistryError::NotConnected)
    }
}

fn reply_error(error: &RegistryError) -> String {
    let hint = match error {
        RegistryError::ExchangeNotSelected => " Send /exchange <binance|bybit>.",
        RegistryError::NotConnected => " Send /setapi <key> <secret>.",
        _ => "",
    };
    render::text(&format!("❌ {}.{}", capitalize(&error.to_string()), hint))
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn command_name(command: &Command) -> &'static str {
    match command {
        Command::Start(_) => "start",
        Command::Exchange(_) => "exchange",
        Command::SetApi { .. } | Command::SetApiUsage => "setapi",
        Command::Trade => "trade",
        Command::Stop => "stop",
        Command::Emergency => "emergency",
        Command::Status => "status",
        Command::Balance => "balance",
        Command::Position => "position",
        Command::Users => "users",
        Command::Help => "help",
        Command::Unknown(_) => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::mock::MockGateway;
    use crate::api::{ExchangeGateway, GatewaySettings};
    use crate::db::Database;
    use crate::registry::{Connector, RegistrySettings};
    use crate::trading::StrategyConfig;
    use rust_decimal_macros::dec;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("/start HYPE2025"), Some(Command::Start(Some("HYPE2025".into()))));
        assert_eq!(Command::parse("/start"), Some(Command::Start(None)));
        assert_eq!(Command::parse("/status@hype_bot"), Some(Command::Status));
        assert_eq!(Command::parse("  /TRADE "), Some(Command::Trade));
        assert_eq!(
            Command::parse("/setapi k s"),
            Some(Command::SetApi {
                key: "k".into(),
                secret: "s".into()
            })
        );
        assert_eq!(Command::parse("/setapi k"), Some(Command::SetApiUsage));
        assert_eq!(Command::parse("Bybit"), Some(Command::Exchange(Some("bybit".into()))));
        assert_eq!(Command::parse("hello"), None);
        assert_eq!(Command::parse(""), None);
        assert_eq!(Command::parse("/foo"), Some(Command::Unknown("foo".into())));
    }

    async fn make_registry() -> UserRegistry {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let mock = MockGateway::new(dec!(100), dec!(100));
        let connector: Connector = Arc::new(move |_: ExchangeKind, _: &ApiCredentials, _: bool| {
            let gateway: Arc<dyn ExchangeGateway> = mock.clone();
            Ok(gateway)
        });
        let settings = RegistrySettings {
            gateway: GatewaySettings {
                call_timeout: Duration::from_millis(200),
                retry_initial_interval: Duration::from_millis(5),
                retry_max_elapsed: Duration::from_millis(100),
            },
            ..Default::default()
        };
        UserRegistry::new(db, StrategyConfig::default(), settings).with_connector(connector)
    }

    fn message(user_id: i64, text: &str) -> ChatMessage {
        ChatMessage {
            update_id: 1,
            chat_id: user_id,
            user_id,
            username: Some("trader".to_string()),
            first_name: None,
            text: text.to_string(),
        }
    }

    #[tokio::test]
    async fn test_unauthorized_user_is_gated() {
        let registry = make_registry().await;
        let handler = CommandHandler::new(&registry, None);

        let reply = handler.handle(&message(1, "/trade")).await.unwrap();
        assert!(reply.contains("Not authorized"));

        let reply = handler.handle(&message(1, "/start wrong")).await.unwrap();
        assert!(reply.contains("Invalid authorization code"));
        assert!(!registry.is_authorized(1).await);
    }

    #[tokio::test]
    async fn test_onboarding_conversation() {
        let registry = make_registry().await;
        let handler = CommandHandler::new(&registry, Some(1));

        let reply = handler.handle(&message(1, "/start HYPE2025")).await.unwrap();
        assert!(reply.contains("Access granted"));

        let reply = handler.handle(&message(1, "/setapi key secret")).await.unwrap();
        assert!(reply.contains("Choose an exchange first"));

        let reply = handler.handle(&message(1, "binance")).await.unwrap();
        assert!(reply.contains("Exchange set to binance"));

        let reply = handler.handle(&message(1, "/setapi key secret")).await.unwrap();
        assert!(reply.contains("Connected"));

        let reply = handler.handle(&message(1, "/trade")).await.unwrap();
        assert!(reply.contains("Trading started"));

        let reply = handler.handle(&message(1, "/stop")).await.unwrap();
        assert!(reply.contains("Trading stopped"));

        let reply = handler.handle(&message(1, "/users")).await.unwrap();
        assert!(reply.contains("Authorized: 1"));

        let reply = handler.handle(&message(1, "/status")).await.unwrap();
        assert!(reply.contains("Status"));
    }

    #[tokio::test]
    async fn test_users_is_admin_only() {
        let registry = make_registry().await;
        let handler = CommandHandler::new(&registry, Some(999));
        handler.handle(&message(2, "/start HYPE2025")).await;

        let reply = handler.handle(&message(2, "/users")).await.unwrap();
        assert!(reply.contains("administrator only"));
    }
}
