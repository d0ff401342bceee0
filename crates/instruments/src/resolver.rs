//! Resolves loosely-specified signal symbols to broker-tradeable tickers.
//!
//! Signals name instruments informally ("RELIANCE", "NIFTY 25000 CE",
//! "TCS FUT"); brokers want the exchange-specific encoded ticker plus the
//! numeric instrument token. Derivative tickers are confirmed against the
//! instrument index when possible; otherwise a best-effort construction is
//! returned unconfirmed with a warning, and the caller decides whether to
//! proceed.

use crate::index::{Instrument, InstrumentIndex};
use chrono::{DateTime, Datelike, Duration, Timelike, Utc, Weekday};
use regex::Regex;
use serde::{Deserialize, Serialize};
use signal_trade_core::{Exchange, InstrumentKind};
use std::collections::HashMap;
use std::sync::Arc;

/// Common colloquial names mapped to canonical ticker roots.
const STOCK_ALIASES: &[(&str, &[&str])] = &[
    ("RELIANCE", &["RIL", "RELIANCE INDUSTRIES", "RELIANCE IND"]),
    ("TATASTEEL", &["TATA STEEL", "TATA STEEL LTD"]),
    ("TATAMOTORS", &["TATA MOTORS", "TATAMOT"]),
    ("HDFCBANK", &["HDFC BANK", "HDFC"]),
    ("ICICIBANK", &["ICICI BANK", "ICICI"]),
    ("SBIN", &["SBI", "STATE BANK", "STATE BANK OF INDIA"]),
    ("INFY", &["INFOSYS", "INFOSYS LTD"]),
    ("TCS", &["TATA CONSULTANCY", "TATA CONSULTANCY SERVICES"]),
    ("WIPRO", &["WIPRO LTD"]),
    ("BHARTIARTL", &["AIRTEL", "BHARTI AIRTEL", "BHARTI"]),
    ("AXISBANK", &["AXIS BANK", "AXIS"]),
    ("KOTAKBANK", &["KOTAK", "KOTAK MAHINDRA", "KOTAK BANK"]),
    ("HINDUNILVR", &["HUL", "HINDUSTAN UNILEVER"]),
    ("MARUTI", &["MARUTI SUZUKI", "MSIL"]),
    ("BAJFINANCE", &["BAJAJ FINANCE", "BAJ FINANCE"]),
    ("BAJAJFINSV", &["BAJAJ FINSERV"]),
    ("ASIANPAINT", &["ASIAN PAINTS"]),
    ("ULTRACEMCO", &["ULTRATECH", "ULTRATECH CEMENT"]),
    ("SUNPHARMA", &["SUN PHARMA"]),
    ("DRREDDY", &["DR REDDY", "DR REDDYS"]),
    ("CIPLA", &["CIPLA LTD"]),
    ("ONGC", &["OIL AND NATURAL GAS", "OIL INDIA"]),
    ("NTPC", &["NTPC LTD"]),
    ("POWERGRID", &["POWER GRID"]),
    ("COALINDIA", &["COAL INDIA"]),
    ("JSWSTEEL", &["JSW STEEL"]),
    ("HINDALCO", &["HINDALCO INDUSTRIES"]),
    ("ADANIENT", &["ADANI ENT", "ADANI ENTERPRISES"]),
    ("ADANIPORTS", &["ADANI PORTS"]),
    ("LT", &["L&T", "LARSEN", "LARSEN & TOUBRO", "LARSEN AND TOUBRO"]),
    ("TECHM", &["TECH MAHINDRA"]),
    ("HCLTECH", &["HCL TECH", "HCL TECHNOLOGIES"]),
    ("M&M", &["MAHINDRA", "M AND M", "MAHINDRA AND MAHINDRA"]),
    ("EICHERMOT", &["EICHER", "EICHER MOTORS"]),
    ("HEROMOTOCO", &["HERO", "HERO MOTOCORP"]),
    ("BAJAJ-AUTO", &["BAJAJ AUTO", "BAJAJAUTO"]),
    ("DIVISLAB", &["DIVIS LAB", "DIVIS LABORATORIES"]),
    ("GRASIM", &["GRASIM INDUSTRIES"]),
    ("BRITANNIA", &["BRITANNIA INDUSTRIES"]),
    ("NESTLEIND", &["NESTLE", "NESTLE INDIA"]),
    ("TITAN", &["TITAN COMPANY"]),
    ("ITC", &["ITC LTD"]),
];

const MONTH_CODES: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];

/// Weekly option expiry is Thursday; past this hour on a Thursday the
/// current week's expiry is treated as gone.
const EXPIRY_CUTOFF_HOUR: u32 = 15;

/// Resolution outcome. Ephemeral; consumed immediately by order placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedSymbol {
    pub original: String,
    pub resolved_symbol: String,
    /// `None` means the ticker was constructed but never confirmed against
    /// the instrument index.
    pub token: Option<String>,
    pub exchange: Exchange,
    pub instrument_type: InstrumentKind,
    pub success: bool,
    pub message: String,
}

#[derive(Debug)]
struct OptionParse {
    symbol: String,
    strike: String,
    option_type: String,
    expiry_hint: Option<String>,
}

#[derive(Debug)]
struct FutureParse {
    symbol: String,
    expiry_hint: Option<String>,
}

#[derive(Debug)]
enum DerivativeParse {
    Option(OptionParse),
    Future(FutureParse),
}

/// The symbol resolver. Cheap to clone via `Arc<InstrumentIndex>` sharing.
pub struct SymbolResolver {
    index: Arc<InstrumentIndex>,
    option_re: Regex,
    future_re: Regex,
    reverse_aliases: HashMap<String, String>,
}

impl SymbolResolver {
    #[must_use]
    pub fn new(index: Arc<InstrumentIndex>) -> Self {
        let mut reverse_aliases = HashMap::new();
        for (canonical, aliases) in STOCK_ALIASES {
            for alias in *aliases {
                reverse_aliases.insert((*alias).to_string(), (*canonical).to_string());
            }
        }
        Self {
            index,
            // SYMBOL STRIKE CE/PE [EXPIRY]; the strike may butt up against
            // the option type ("SENSEX 85500CE").
            option_re: Regex::new(r"^(\w+)\s*(\d+(?:\.\d+)?)\s*(CE|PE|CALL|PUT)(?:\s+(\w+))?$")
                .expect("option grammar is a valid regex"),
            // SYMBOL FUT [EXPIRY]
            future_re: Regex::new(r"^(\w+)\s+FUT(?:URE)?(?:\s+(\w+))?$")
                .expect("future grammar is a valid regex"),
            reverse_aliases,
        }
    }

    /// Exchange segment a derivative underlying routes to: BSE indices go
    /// to BFO, everything else to NFO.
    fn derivative_exchange(symbol: &str) -> Exchange {
        match symbol {
            "SENSEX" | "BANKEX" => Exchange::Bfo,
            _ => Exchange::Nfo,
        }
    }

    /// Resolves a raw signal symbol against the live clock.
    pub async fn resolve(&self, raw_symbol: &str, exchange: &Exchange) -> ResolvedSymbol {
        self.resolve_at(raw_symbol, exchange, Utc::now()).await
    }

    /// Resolves with an explicit clock. Deterministic for a fixed index
    /// snapshot and fixed `now`.
    pub async fn resolve_at(
        &self,
        raw_symbol: &str,
        exchange: &Exchange,
        now: DateTime<Utc>,
    ) -> ResolvedSymbol {
        let raw = raw_symbol.trim().to_ascii_uppercase();
        tracing::info!(symbol = %raw, exchange = %exchange, "resolving symbol");

        match self.parse_derivative(&raw) {
            Some(DerivativeParse::Option(parsed)) => self.resolve_option(&raw, parsed, now).await,
            Some(DerivativeParse::Future(parsed)) => self.resolve_future(&raw, parsed, now).await,
            None => self.resolve_equity(&raw, exchange).await,
        }
    }

    fn parse_derivative(&self, raw: &str) -> Option<DerivativeParse> {
        if let Some(caps) = self.option_re.captures(raw) {
            let option_type = match &caps[3] {
                "CALL" => "CE".to_string(),
                "PUT" => "PE".to_string(),
                other => other.to_string(),
            };
            return Some(DerivativeParse::Option(OptionParse {
                symbol: caps[1].to_string(),
                strike: normalize_strike(&caps[2]),
                option_type,
                expiry_hint: caps.get(4).map(|m| m.as_str().to_string()),
            }));
        }
        if let Some(caps) = self.future_re.captures(raw) {
            return Some(DerivativeParse::Future(FutureParse {
                symbol: caps[1].to_string(),
                expiry_hint: caps.get(2).map(|m| m.as_str().to_string()),
            }));
        }
        None
    }

    async fn resolve_option(
        &self,
        original: &str,
        parsed: OptionParse,
        now: DateTime<Utc>,
    ) -> ResolvedSymbol {
        let exchange = Self::derivative_exchange(&parsed.symbol);

        let matches = self
            .search_options(
                &parsed.symbol,
                &parsed.strike,
                &parsed.option_type,
                parsed.expiry_hint.as_deref(),
                &exchange,
            )
            .await;

        if let Some(best) = matches.first() {
            tracing::info!(
                original,
                resolved = %best.symbol,
                token = %best.token,
                exchange = %best.exchange,
                "confirmed option against instrument index"
            );
            return ResolvedSymbol {
                original: original.to_string(),
                resolved_symbol: best.symbol.clone(),
                token: Some(best.token.clone()),
                exchange: best.exchange.clone(),
                instrument_type: InstrumentKind::Option,
                success: true,
                message: format!("Found match: {}", best.symbol),
            };
        }

        // Fall back to the weekly-expiry construction, unconfirmed.
        let expiry = weekly_expiry_code(now, parsed.expiry_hint.as_deref());
        let resolved = format!(
            "{}{}{}{}",
            parsed.symbol, expiry, parsed.strike, parsed.option_type
        );
        tracing::warn!(symbol = %resolved, "could not validate option against index");
        ResolvedSymbol {
            original: original.to_string(),
            resolved_symbol: resolved.clone(),
            token: None,
            exchange,
            instrument_type: InstrumentKind::Option,
            success: true,
            message: format!("Constructed symbol (unvalidated): {resolved}"),
        }
    }

    /// Searches the index for options matching symbol + strike + type,
    /// narrowing by expiry hint when one was given.
    ///
    /// Multiple hits are ordered lexicographically by symbol and the first
    /// is taken. For date-encoded tickers this approximates nearest expiry;
    /// it is a documented approximation, not a calendar computation.
    async fn search_options(
        &self,
        symbol: &str,
        strike: &str,
        option_type: &str,
        expiry_hint: Option<&str>,
        exchange: &Exchange,
    ) -> Vec<Instrument> {
        let query = format!("{symbol}{strike}{option_type}");
        tracing::debug!(query = %query, exchange = %exchange, "searching options");

        let mut results = self.index.search(&query, Some(exchange), 20).await;
        if results.is_empty() {
            tracing::debug!(symbol, exchange = %exchange, "falling back to underlying search");
            results = self.index.search(symbol, Some(exchange), 50).await;
        }

        let mut matching: Vec<Instrument> = results
            .into_iter()
            .filter(|inst| {
                inst.symbol.contains(strike)
                    && inst.symbol.contains(option_type)
                    && inst.symbol.contains(symbol)
            })
            .collect();
        matching.sort_by(|a, b| a.symbol.cmp(&b.symbol));

        if let Some(hint) = expiry_hint {
            let hint_upper = hint.to_ascii_uppercase();
            let filtered: Vec<Instrument> = matching
                .iter()
                .filter(|inst| inst.symbol.to_ascii_uppercase().contains(&hint_upper))
                .cloned()
                .collect();
            if !filtered.is_empty() {
                return filtered;
            }
        }

        matching
    }

    async fn resolve_future(
        &self,
        original: &str,
        parsed: FutureParse,
        now: DateTime<Utc>,
    ) -> ResolvedSymbol {
        let exchange = Self::derivative_exchange(&parsed.symbol);
        let expiry = monthly_expiry_code(now, parsed.expiry_hint.as_deref());
        let resolved = format!("{}{}FUT", parsed.symbol, expiry);

        if let Some(token) = self.index.get_token(&resolved, &exchange).await {
            tracing::info!(original, resolved = %resolved, token = %token, "resolved future");
            return ResolvedSymbol {
                original: original.to_string(),
                resolved_symbol: resolved.clone(),
                token: Some(token),
                exchange,
                instrument_type: InstrumentKind::Future,
                success: true,
                message: format!("Resolved to {resolved}"),
            };
        }

        tracing::warn!(symbol = %resolved, "could not validate future against index");
        ResolvedSymbol {
            original: original.to_string(),
            resolved_symbol: resolved.clone(),
            token: None,
            exchange,
            instrument_type: InstrumentKind::Future,
            success: true,
            message: format!("Constructed symbol (unvalidated): {resolved}"),
        }
    }

    async fn resolve_equity(&self, raw: &str, exchange: &Exchange) -> ResolvedSymbol {
        let canonical = self
            .reverse_aliases
            .get(raw)
            .cloned()
            .unwrap_or_else(|| raw.to_string());

        let candidates: Vec<String> = if *exchange == Exchange::Nse {
            vec![
                format!("{canonical}-EQ"),
                canonical.clone(),
                format!("{raw}-EQ"),
                raw.to_string(),
            ]
        } else {
            vec![canonical.clone(), raw.to_string()]
        };

        for candidate in &candidates {
            if let Some(token) = self.index.get_token(candidate, exchange).await {
                tracing::info!(original = raw, resolved = %candidate, token = %token, "resolved equity");
                return ResolvedSymbol {
                    original: raw.to_string(),
                    resolved_symbol: candidate.clone(),
                    token: Some(token),
                    exchange: exchange.clone(),
                    instrument_type: InstrumentKind::Equity,
                    success: true,
                    message: format!("Resolved to {candidate}"),
                };
            }
        }

        let results = self.index.search(&canonical, Some(exchange), 10).await;
        if !results.is_empty() {
            let suffixed = format!("{canonical}-EQ");
            let preferred = results.iter().find(|r| {
                r.name.eq_ignore_ascii_case(&canonical)
                    || r.symbol.eq_ignore_ascii_case(&suffixed)
            });
            let (best, message) = match preferred {
                Some(hit) => (hit, format!("Found match: {}", hit.symbol)),
                None => (&results[0], format!("Best match: {}", results[0].symbol)),
            };
            tracing::info!(original = raw, resolved = %best.symbol, token = %best.token, "equity search match");
            return ResolvedSymbol {
                original: raw.to_string(),
                resolved_symbol: best.symbol.clone(),
                token: Some(best.token.clone()),
                exchange: best.exchange.clone(),
                instrument_type: InstrumentKind::Equity,
                success: true,
                message,
            };
        }

        let resolved = if *exchange == Exchange::Nse {
            format!("{canonical}-EQ")
        } else {
            canonical
        };
        tracing::warn!(symbol = %resolved, "could not validate equity symbol");
        ResolvedSymbol {
            original: raw.to_string(),
            resolved_symbol: resolved.clone(),
            token: None,
            exchange: exchange.clone(),
            instrument_type: InstrumentKind::Equity,
            success: false,
            message: format!("Could not validate symbol: {resolved}"),
        }
    }
}

/// Strips a redundant decimal part: "25000.0" -> "25000", "85500.5" stays.
fn normalize_strike(raw: &str) -> String {
    match raw.split_once('.') {
        Some((whole, frac)) if frac.chars().all(|c| c == '0') => whole.to_string(),
        _ => raw.to_string(),
    }
}

/// Month code for a 1-based month number.
fn month_code(month: u32) -> &'static str {
    MONTH_CODES[(month as usize) - 1]
}

/// 1-based month number for a month code, if recognized.
fn month_number(code: &str) -> Option<u32> {
    MONTH_CODES
        .iter()
        .position(|m| m.eq_ignore_ascii_case(code))
        .map(|i| (i + 1) as u32)
}

/// Weekly option expiry code, `DDMMMYY`.
///
/// Defaults to the next Thursday (or Thursday + 7 past the cutoff hour on a
/// Thursday). A month hint pins the 2nd of that month, rolling to next year
/// when the month has already passed. Both are approximations with no
/// holiday calendar behind them.
pub(crate) fn weekly_expiry_code(now: DateTime<Utc>, hint: Option<&str>) -> String {
    if let Some(hint) = hint {
        if let Some(month) = month_number(hint) {
            let mut year = now.year();
            if month < now.month() {
                year += 1;
            }
            return format!("02{}{:02}", month_code(month), year % 100);
        }
    }

    let weekday_offset = now.weekday().num_days_from_monday();
    let mut days_until_thursday =
        (Weekday::Thu.num_days_from_monday() + 7 - weekday_offset) % 7;
    if days_until_thursday == 0 && now.hour() >= EXPIRY_CUTOFF_HOUR {
        days_until_thursday = 7;
    }

    let expiry = now + Duration::days(i64::from(days_until_thursday));
    format!(
        "{:02}{}{:02}",
        expiry.day(),
        month_code(expiry.month()),
        expiry.year() % 100
    )
}

/// Monthly future expiry code, `YYMMM`, current month or hinted month with
/// year rollover.
pub(crate) fn monthly_expiry_code(now: DateTime<Utc>, hint: Option<&str>) -> String {
    if let Some(hint) = hint {
        if let Some(month) = month_number(hint) {
            let mut year = now.year();
            if month < now.month() {
                year += 1;
            }
            return format!("{:02}{}", year % 100, month_code(month));
        }
    }
    format!("{:02}{}", now.year() % 100, month_code(now.month()))
}
