//! Telegram MarkdownV2 rendering of events, status and replies.

use std::fmt::Write;

use rust_decimal::Decimal;

use crate::models::{ExchangePosition, UserRecord};
use crate::registry::{RegistryCounts, UserSummary};
use crate::trading::{TradeEvent, TradingStatus};

/// Escape characters that have special meaning in Telegram's MarkdownV2.
pub fn escape(text: &str) -> String {
    let special_chars = r"_*[]()~`>#+-=|{}.!\";
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if special_chars.contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn bold(text: &str) -> String {
    format!("*{}*", escape(text))
}

fn usd(value: Decimal) -> String {
    escape(&format!("${:.2}", value))
}

fn usd4(value: Decimal) -> String {
    escape(&format!("${:.4}", value))
}

fn pct(value: Decimal) -> String {
    escape(&format!("{:+.2}%", value))
}

fn num(value: Decimal) -> String {
    escape(&value.normalize().to_string())
}

pub fn event(event: &TradeEvent) -> String {
    match event {
        TradeEvent::CycleStarted { price, amount, margin } => format!(
            "🟢 {}\nPrice: {}\nAmount: {}\nMargin: {}",
            bold("Cycle started"),
            num(*price),
            num(*amount),
            usd4(*margin)
        ),
        TradeEvent::MartingaleAdded {
            level,
            price,
            amount,
            margin,
        } => format!(
            "🔻 {}\nPrice: {}\nAmount: {}\nMargin: {}",
            bold(&format!("Martingale level {}", level)),
            num(*price),
            num(*amount),
            usd4(*margin)
        ),
        TradeEvent::CycleCompleted {
            profit_pct,
            profit_usd,
            amount,
            cycle,
        } => format!(
            "✅ {}\nProfit: {} \\({}\\)\nAmount: {}",
            bold(&format!("Cycle {} completed", cycle)),
            usd4(*profit_usd),
            pct(*profit_pct),
            num(*amount)
        ),
        TradeEvent::BalanceUpdated {
            old_balance,
            new_balance,
            old_base,
            new_base,
        } => format!(
            "💰 {}\nBalance: {} → {}\nBase amount: {} → {}",
            bold("Strategy resized"),
            usd(*old_balance),
            usd(*new_balance),
            usd4(*old_base),
            usd4(*new_base)
        ),
        TradeEvent::EmergencyClosed {
            amount,
            price,
            profit_usd,
        } => format!(
            "🚨 {}\nAmount: {}\nPrice: {}\nResult: {}",
            bold("Emergency close"),
            num(*amount),
            num(*price),
            usd4(*profit_usd)
        ),
        TradeEvent::SafeStopCompleted => format!(
            "🛑 {}\nTrading is now disabled\\. Use /trade to start again\\.",
            bold("Safe stop completed")
        ),
    }
}

pub fn status(record: &UserRecord, status: &TradingStatus) -> String {
    let mut out = String::new();
    let exchange = record.exchange.map(|e| e.as_str()).unwrap_or("not selected");

    let _ = writeln!(out, "📊 {}", bold("Status"));
    let _ = writeln!(out, "Exchange: {}", escape(exchange));
    let _ = writeln!(out, "Symbol: {}", escape(&record.symbol));
    let _ = writeln!(out, "Phase: {}", escape(&status.phase.to_string()));
    let _ = writeln!(
        out,
        "Trading: {}{}",
        if status.trading_enabled { "on" } else { "off" },
        if status.safe_stop_requested { " \\(safe stop pending\\)" } else { "" }
    );
    let _ = writeln!(out, "Balance: {}", usd(status.balance));
    if let Some(price) = status.price {
        let _ = writeln!(out, "Price: {}", num(price));
    }

    if let Some(entry) = status.weighted_entry {
        let _ = writeln!(out);
        let _ = writeln!(out, "Level: {}/{}", status.current_step + 1, status.max_steps);
        let _ = writeln!(out, "Avg entry: {}", num(entry.round_dp(4)));
        if let (Some(p), Some(m)) = (status.profit_pct, status.margin_return) {
            let _ = writeln!(out, "PnL: {} on price, {} on margin", pct(p), pct(m));
        }
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "Base amount: {}", usd4(status.base_amount));
    let _ = writeln!(out, "Total risk: {}", usd(status.total_risk));
    if let Some(ratio) = status.safety_ratio {
        let _ = writeln!(out, "Safety ratio: {}x", escape(&format!("{:.1}", ratio)));
    }
    let _ = writeln!(out, "Cycles: {}", status.cycle_count);
    let _ = writeln!(out, "Trades: {}", status.total_trades);
    let _ = writeln!(out, "Total profit: {}", usd4(status.total_profit));
    let _ = write!(out, "ROI: {}", pct(status.roi));
    out
}

pub fn balance(balance: Decimal) -> String {
    format!("💰 {} {}", bold("Balance:"), usd(balance))
}

pub fn position(record: &UserRecord, exchange_position: Option<&ExchangePosition>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "📈 {}", bold("Position"));

    match exchange_position.filter(|p| p.is_open()) {
        Some(p) => {
            let _ = writeln!(out, "Exchange size: {}", num(p.size));
            let _ = writeln!(out, "Entry: {}", num(p.entry_price));
            let _ = writeln!(out, "Mark: {}", num(p.mark_price));
            let _ = writeln!(out, "Unrealized: {}", usd4(p.unrealized_pnl));
        }
        None => {
            let _ = writeln!(out, "No open position on the exchange");
        }
    }

    if record.is_active {
        let _ = writeln!(out, "Local levels: {}", record.position_levels.len());
        let _ = writeln!(out, "Local contracts: {}", num(record.total_contracts()));
        let _ = write!(out, "Margin used: {}", usd4(record.total_margin()));
    } else {
        let _ = write!(out, "No active cycle");
    }
    out
}

pub fn users(counts: &RegistryCounts, summaries: &[UserSummary]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "👥 {}", bold("Users"));
    let _ = writeln!(out, "Authorized: {}", counts.authorized);
    let _ = writeln!(out, "Setup complete: {}", counts.setup_complete);
    let _ = writeln!(out, "Trading: {}", counts.trading_enabled);
    let _ = writeln!(out, "In cycle: {}", counts.in_cycle);

    for s in summaries.iter().take(10) {
        let _ = write!(
            out,
            "\n{} {} {} cycles, {}",
            if s.trading_enabled { "🟢" } else { "⚪" },
            escape(&s.name),
            s.cycle_count,
            usd4(s.total_profit)
        );
    }
    if summaries.len() > 10 {
        let _ = write!(out, "\n\\.\\.\\. and {} more", summaries.len() - 10);
    }
    out
}

pub fn help() -> String {
    [
        format!("🤖 {}", bold("Commands")),
        escape("/start <code> - authorize with the access code"),
        escape("/exchange <binance|bybit> - choose the exchange"),
        escape("/setapi <key> <secret> - connect your API keys"),
        escape("/trade - start trading"),
        escape("/stop - stop after the current cycle"),
        escape("/emergency - close everything now and stop"),
        escape("/status - strategy and cycle status"),
        escape("/balance - free USDT balance"),
        escape("/position - open position"),
        escape("/help - this message"),
    ]
    .join("\n")
}

/// Plain text reply, escaped.
pub fn text(message: &str) -> String {
    escape(message)
}
