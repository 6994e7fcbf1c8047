//! Interactive Brokers Client Portal gateway provider.
//!
//! Talks to a locally running gateway (default `https://localhost:5000/v1/api`)
//! that holds an authenticated brokerage session. The gateway serves a
//! self-signed certificate, so certificate validation is disabled for this
//! client only.
//!
//! | Data | Endpoint |
//! |------|----------|
//! | Session | `/iserver/auth/status` |
//! | Contract id | `/iserver/secdef/search` |
//! | Quote, option greeks | `/iserver/marketdata/snapshot` |
//! | Daily bars | `/iserver/marketdata/history` |
//! | Chain strikes and contracts | `/iserver/secdef/strikes`, `/iserver/secdef/info` |
//!
//! Snapshot fields are numeric tags: 31 last, 84 bid, 86 ask, 7295 open,
//! 70 high, 71 low, 87 volume, 7308-7311 delta/gamma/theta/vega,
//! 7633 implied volatility (percent).

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::AcquisitionError;
use crate::models::{
    DataRequestKind, DateRange, Greeks, OptionChain, OptionContract, OptionQuote, OptionType,
    Quote,
};
use crate::provider::http::{parse_json, send};
use crate::provider::{ProviderAdapter, ProviderCapabilities, RateLimit};

pub const DEFAULT_GATEWAY_URL: &str = "https://localhost:5000/v1/api";
const PROVIDER_ID: &str = "IBKR";

const QUOTE_FIELDS: &str = "31,84,86,7295,70,71,87";
const OPTION_FIELDS: &str = "31,84,86,87,7308,7309,7310,7311,7633";

/// Strikes on each side of spot included in a chain.
const DEFAULT_STRIKE_WINDOW: usize = 5;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// API Response Structures
// ============================================================================

#[derive(Debug, Deserialize)]
struct AuthStatus {
    #[serde(default)]
    authenticated: bool,
    #[serde(default)]
    connected: bool,
}

#[derive(Debug, Deserialize)]
struct SecdefSearchItem {
    /// Sent as a string by some gateway versions and as a number by others
    conid: Value,
    symbol: Option<String>,
    #[serde(default)]
    sections: Vec<SecdefSection>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SecdefSection {
    sec_type: String,
}

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    #[serde(default)]
    data: Vec<HistoryBar>,
}

#[derive(Debug, Deserialize)]
struct HistoryBar {
    o: Option<f64>,
    c: f64,
    h: Option<f64>,
    l: Option<f64>,
    v: Option<f64>,
    /// Milliseconds since epoch
    t: i64,
}

#[derive(Debug, Deserialize)]
struct StrikesResponse {
    #[serde(default)]
    call: Vec<f64>,
    #[serde(default)]
    put: Vec<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContractInfo {
    conid: i64,
    strike: f64,
    right: String,
    maturity_date: String,
}

/// One option contract resolved to a gateway conid.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ResolvedOption {
    pub conid: i64,
    pub contract: OptionContract,
}

// ============================================================================
// Parsing
// ============================================================================

fn unavailable(message: String) -> AcquisitionError {
    AcquisitionError::DataUnavailable {
        provider: PROVIDER_ID.to_string(),
        message,
    }
}

fn conid_from(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Snapshot values carry status prefixes ("C" closing, "H" halted) and
/// magnitude suffixes ("61.2M").
pub(crate) fn parse_field(raw: &str) -> Option<f64> {
    let trimmed = raw.trim().trim_start_matches(|c: char| c.is_ascii_alphabetic());
    let cleaned: String = trimmed.chars().filter(|c| *c != ',').collect();
    let (number, multiplier) = match cleaned.chars().last()? {
        'K' => (&cleaned[..cleaned.len() - 1], 1e3),
        'M' => (&cleaned[..cleaned.len() - 1], 1e6),
        'B' => (&cleaned[..cleaned.len() - 1], 1e9),
        '%' => (&cleaned[..cleaned.len() - 1], 1.0),
        _ => (cleaned.as_str(), 1.0),
    };
    number.parse::<f64>().ok().map(|v| v * multiplier)
}

fn snapshot_field(row: &Value, tag: &str) -> Option<f64> {
    match row.get(tag)? {
        Value::String(s) => parse_field(s),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

pub(crate) fn parse_auth_status(body: &str) -> bool {
    serde_json::from_str::<AuthStatus>(body)
        .map(|s| s.authenticated && s.connected)
        .unwrap_or(false)
}

/// Stock conid for `symbol`.
pub(crate) fn parse_stock_conid(symbol: &str, body: &str) -> Result<i64, AcquisitionError> {
    let items: Vec<SecdefSearchItem> = parse_json(PROVIDER_ID, body)?;
    items
        .iter()
        .filter(|i| {
            i.symbol
                .as_deref()
                .map_or(true, |s| s.eq_ignore_ascii_case(symbol))
        })
        .find(|i| i.sections.is_empty() || i.sections.iter().any(|s| s.sec_type == "STK"))
        .and_then(|i| conid_from(&i.conid))
        .ok_or_else(|| unavailable(format!("No stock contract for {}", symbol)))
}

pub(crate) fn parse_snapshot_quote(symbol: &str, body: &str) -> Result<Quote, AcquisitionError> {
    let rows: Vec<Value> = parse_json(PROVIDER_ID, body)?;
    let row = rows
        .first()
        .ok_or_else(|| unavailable(format!("Empty snapshot for {}", symbol)))?;

    // The first snapshot after subscribing only echoes the conid
    let last = snapshot_field(row, "31")
        .ok_or_else(|| unavailable(format!("Snapshot not yet populated for {}", symbol)))?;
    let close = Decimal::try_from(last)
        .map_err(|_| unavailable(format!("Invalid last price: {}", last)))?;

    let timestamp = row
        .get("_updated")
        .and_then(Value::as_i64)
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now);
    let decimal = |tag: &str| snapshot_field(row, tag).and_then(|v| Decimal::try_from(v).ok());

    let mut quote = Quote::new(symbol, timestamp, close, "USD", PROVIDER_ID);
    quote.bid = decimal("84");
    quote.ask = decimal("86");
    quote.open = decimal("7295");
    quote.high = decimal("70");
    quote.low = decimal("71");
    quote.volume = decimal("87");
    Ok(quote)
}

pub(crate) fn parse_history(symbol: &str, body: &str) -> Result<Vec<Quote>, AcquisitionError> {
    let response: HistoryResponse = parse_json(PROVIDER_ID, body)?;
    let mut quotes: Vec<Quote> = response
        .data
        .into_iter()
        .filter_map(|bar| {
            let timestamp = Utc.timestamp_millis_opt(bar.t).single()?;
            let close = Decimal::try_from(bar.c).ok()?;
            let mut quote = Quote::new(symbol, timestamp, close, "USD", PROVIDER_ID);
            quote.open = bar.o.and_then(|v| Decimal::try_from(v).ok());
            quote.high = bar.h.and_then(|v| Decimal::try_from(v).ok());
            quote.low = bar.l.and_then(|v| Decimal::try_from(v).ok());
            // Volume is reported in hundreds of shares
            quote.volume = bar.v.and_then(|v| Decimal::try_from(v * 100.0).ok());
            Some(quote)
        })
        .collect();
    quotes.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
    Ok(quotes)
}

/// Strikes listed for both rights, sorted.
pub(crate) fn parse_strikes(body: &str) -> Result<Vec<f64>, AcquisitionError> {
    let response: StrikesResponse = parse_json(PROVIDER_ID, body)?;
    let mut strikes: Vec<f64> = response.call;
    strikes.extend(response.put);
    strikes.retain(|s| s.is_finite() && *s > 0.0);
    strikes.sort_by(|a, b| a.total_cmp(b));
    strikes.dedup_by(|a, b| (*a - *b).abs() < 1e-9);
    Ok(strikes)
}

/// The `window` strikes on each side of `spot`.
pub(crate) fn strikes_near(strikes: &[f64], spot: f64, window: usize) -> Vec<f64> {
    let pivot = strikes.partition_point(|s| *s < spot);
    let start = pivot.saturating_sub(window);
    let end = (pivot + window).min(strikes.len());
    strikes[start..end].to_vec()
}

/// Contracts from /secdef/info that expire on `expiry`.
pub(crate) fn parse_contract_info(
    underlying: &str,
    expiry: NaiveDate,
    body: &str,
) -> Result<Vec<ResolvedOption>, AcquisitionError> {
    let items: Vec<ContractInfo> = parse_json(PROVIDER_ID, body)?;
    Ok(items
        .into_iter()
        .filter_map(|info| {
            let maturity = NaiveDate::parse_from_str(&info.maturity_date, "%Y%m%d").ok()?;
            if maturity != expiry {
                return None;
            }
            let option_type = match info.right.as_str() {
                "C" => OptionType::Call,
                "P" => OptionType::Put,
                _ => return None,
            };
            Some(ResolvedOption {
                conid: info.conid,
                contract: OptionContract::new(
                    underlying.to_uppercase(),
                    info.strike,
                    maturity,
                    option_type,
                ),
            })
        })
        .collect())
}

/// Option snapshot rows keyed by conid.
pub(crate) fn parse_option_snapshot(body: &str) -> Result<HashMap<i64, OptionQuote>, AcquisitionError> {
    let rows: Vec<Value> = parse_json(PROVIDER_ID, body)?;
    let mut quotes = HashMap::new();
    for row in rows {
        let Some(conid) = row.get("conid").and_then(conid_from) else {
            continue;
        };
        // Contract is filled in by the caller
        let mut quote = OptionQuote::new(OptionContract::new(
            "",
            0.0,
            NaiveDate::MIN,
            OptionType::Call,
        ));
        quote.last = snapshot_field(&row, "31");
        quote.bid = snapshot_field(&row, "84");
        quote.ask = snapshot_field(&row, "86");
        quote.volume = snapshot_field(&row, "87").map(|v| v.max(0.0) as u64);
        quote.greeks = snapshot_field(&row, "7308").map(|delta| Greeks {
            delta,
            gamma: snapshot_field(&row, "7309").unwrap_or_default(),
            theta: snapshot_field(&row, "7310").unwrap_or_default(),
            vega: snapshot_field(&row, "7311").unwrap_or_default(),
            rho: 0.0,
            implied_volatility: snapshot_field(&row, "7633").map(|pct| pct / 100.0),
        });
        quotes.insert(conid, quote);
    }
    Ok(quotes)
}

// ============================================================================
// IbkrProvider
// ============================================================================

/// Client for the gateway's self-signed certificate. A build failure falls
/// back to a default client, which will reject that certificate.
fn gateway_client(timeout: Duration) -> Client {
    Client::builder()
        .timeout(timeout)
        .danger_accept_invalid_certs(true)
        .build()
        .unwrap_or_else(|e| {
            warn!(
                "IBKR gateway client build failed, falling back to default client: {}",
                e
            );
            Client::new()
        })
}

/// Client Portal gateway provider.
pub struct IbkrProvider {
    client: Client,
    timeout: Duration,
    base_url: Option<String>,
    strike_window: usize,
    conids: Mutex<HashMap<String, i64>>,
}

impl IbkrProvider {
    /// Without a gateway URL the provider is disabled.
    pub fn new(gateway_url: Option<String>) -> Self {
        Self {
            client: gateway_client(DEFAULT_TIMEOUT),
            timeout: DEFAULT_TIMEOUT,
            base_url: gateway_url
                .map(|u| u.trim().trim_end_matches('/').to_string())
                .filter(|u| !u.is_empty()),
            strike_window: DEFAULT_STRIKE_WINDOW,
            conids: Mutex::new(HashMap::new()),
        }
    }

    /// Network timeout for gateway calls.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = gateway_client(timeout);
        self.timeout = timeout;
        self
    }

    pub fn with_strike_window(mut self, window: usize) -> Self {
        self.strike_window = window.max(1);
        self
    }

    fn lock_conids(&self) -> MutexGuard<'_, HashMap<String, i64>> {
        self.conids.lock().unwrap_or_else(|poisoned| {
            warn!("IBKR conid cache mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    async fn fetch(&self, endpoint: &str, params: &[(&str, &str)]) -> Result<String, AcquisitionError> {
        let base = self
            .base_url
            .as_deref()
            .ok_or_else(|| AcquisitionError::Config("IBKR gateway URL not configured".to_string()))?;
        let request = self
            .client
            .get(format!("{}{}", base, endpoint))
            .query(params);
        send(&self.client, PROVIDER_ID, request).await
    }

    async fn stock_conid(&self, symbol: &str) -> Result<i64, AcquisitionError> {
        let key = symbol.to_uppercase();
        if let Some(conid) = self.lock_conids().get(&key).copied() {
            return Ok(conid);
        }
        let text = self
            .fetch("/iserver/secdef/search", &[("symbol", key.as_str())])
            .await?;
        let conid = parse_stock_conid(&key, &text)?;
        self.lock_conids().insert(key, conid);
        Ok(conid)
    }

    async fn resolve_options(
        &self,
        underlying: &str,
        expiry: NaiveDate,
        strikes: &[f64],
        right: Option<OptionType>,
    ) -> Result<Vec<ResolvedOption>, AcquisitionError> {
        let conid = self.stock_conid(underlying).await?.to_string();
        let month = expiry.format("%b%y").to_string().to_uppercase();
        let mut resolved = Vec::new();
        for strike in strikes {
            let strike = strike.to_string();
            let mut params = vec![
                ("conid", conid.as_str()),
                ("sectype", "OPT"),
                ("month", month.as_str()),
                ("strike", strike.as_str()),
            ];
            if let Some(right) = right {
                params.push(("right", if right == OptionType::Call { "C" } else { "P" }));
            }
            let text = self.fetch("/iserver/secdef/info", &params).await?;
            resolved.extend(parse_contract_info(underlying, expiry, &text)?);
        }
        Ok(resolved)
    }

    async fn option_snapshot(
        &self,
        options: &[ResolvedOption],
    ) -> Result<Vec<OptionQuote>, AcquisitionError> {
        if options.is_empty() {
            return Ok(Vec::new());
        }
        let conids = options
            .iter()
            .map(|o| o.conid.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let text = self
            .fetch(
                "/iserver/marketdata/snapshot",
                &[("conids", conids.as_str()), ("fields", OPTION_FIELDS)],
            )
            .await?;
        let mut rows = parse_option_snapshot(&text)?;
        Ok(options
            .iter()
            .map(|o| {
                let mut quote = rows
                    .remove(&o.conid)
                    .unwrap_or_else(|| OptionQuote::new(o.contract.clone()));
                quote.contract = o.contract.clone();
                quote
            })
            .collect())
    }
}

#[async_trait]
impl ProviderAdapter for IbkrProvider {
    fn id(&self) -> &'static str {
        PROVIDER_ID
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            kinds: &[
                DataRequestKind::Quote,
                DataRequestKind::Historical,
                DataRequestKind::OptionChain,
                DataRequestKind::OptionGreeks,
                DataRequestKind::ImpliedVolatility,
            ],
        }
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn rate_limit(&self) -> RateLimit {
        // Gateway pacing is 10 requests per second across all endpoints
        RateLimit {
            min_interval: Duration::from_millis(200),
            requests_per_minute: None,
            daily_cap: None,
        }
    }

    fn is_enabled(&self) -> bool {
        self.base_url.is_some()
    }

    async fn is_connected(&self) -> bool {
        if !self.is_enabled() {
            return false;
        }
        match self.fetch("/iserver/auth/status", &[]).await {
            Ok(text) => parse_auth_status(&text),
            Err(e) => {
                debug!("IBKR gateway not reachable: {}", e);
                false
            }
        }
    }

    async fn fetch_quote(&self, symbol: &str) -> Result<Quote, AcquisitionError> {
        let conid = self.stock_conid(symbol).await?.to_string();
        let text = self
            .fetch(
                "/iserver/marketdata/snapshot",
                &[("conids", conid.as_str()), ("fields", QUOTE_FIELDS)],
            )
            .await?;
        parse_snapshot_quote(symbol, &text)
    }

    async fn fetch_historical(
        &self,
        symbol: &str,
        range: DateRange,
    ) -> Result<Vec<Quote>, AcquisitionError> {
        let conid = self.stock_conid(symbol).await?.to_string();
        let days = (Utc::now().date_naive() - range.start).num_days().max(1) + 1;
        let period = format!("{}d", days);
        let text = self
            .fetch(
                "/iserver/marketdata/history",
                &[("conid", conid.as_str()), ("period", period.as_str()), ("bar", "1d")],
            )
            .await?;
        let bars: Vec<Quote> = parse_history(symbol, &text)?
            .into_iter()
            .filter(|q| {
                let day = q.timestamp.date_naive();
                day >= range.start && day <= range.end
            })
            .collect();
        Ok(bars)
    }

    async fn fetch_option_chain(
        &self,
        symbol: &str,
        expiry: Option<NaiveDate>,
    ) -> Result<OptionChain, AcquisitionError> {
        let expiry = expiry.ok_or_else(|| AcquisitionError::ClientError {
            provider: PROVIDER_ID.to_string(),
            status: 400,
            message: "IBKR option chains require an expiry".to_string(),
        })?;

        let spot = self.fetch_quote(symbol).await?.close;
        let spot = f64::try_from(spot).unwrap_or_default();
        let conid = self.stock_conid(symbol).await?.to_string();
        let month = expiry.format("%b%y").to_string().to_uppercase();
        let text = self
            .fetch(
                "/iserver/secdef/strikes",
                &[("conid", conid.as_str()), ("sectype", "OPT"), ("month", month.as_str())],
            )
            .await?;
        let strikes = strikes_near(&parse_strikes(&text)?, spot, self.strike_window);

        let options = self.resolve_options(symbol, expiry, &strikes, None).await?;
        let contracts = self.option_snapshot(&options).await?;
        Ok(OptionChain {
            underlying: symbol.to_uppercase(),
            expiry: Some(expiry),
            contracts,
        })
    }

    async fn fetch_greeks(&self, contract: &OptionContract) -> Result<Greeks, AcquisitionError> {
        let options = self
            .resolve_options(
                &contract.underlying,
                contract.expiry,
                &[contract.strike],
                Some(contract.option_type),
            )
            .await?;
        let quotes = self.option_snapshot(&options).await?;
        quotes
            .into_iter()
            .find(|q| q.contract.option_type == contract.option_type)
            .and_then(|q| q.greeks)
            .ok_or_else(|| unavailable(format!("No greeks for {}", contract.occ_symbol())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_auth_status() {
        assert!(parse_auth_status(
            r#"{"authenticated":true,"competing":false,"connected":true,"message":""}"#
        ));
        assert!(!parse_auth_status(r#"{"authenticated":false,"connected":true}"#));
        assert!(!parse_auth_status("<html>login</html>"));
    }

    #[test]
    fn test_stock_conid_string_or_number() {
        let json = r#"[
            {"conid":"756733","companyName":"SPDR S&P 500 ETF TRUST","symbol":"SPY","sections":[{"secType":"STK"},{"secType":"OPT","months":"JAN24;FEB24"}]},
            {"conid":"12345","symbol":"SPY","sections":[{"secType":"IND"}]}
        ]"#;
        assert_eq!(parse_stock_conid("SPY", json).unwrap(), 756733);

        let numeric = r#"[{"conid":265598,"symbol":"AAPL","sections":[{"secType":"STK"}]}]"#;
        assert_eq!(parse_stock_conid("aapl", numeric).unwrap(), 265598);

        assert!(parse_stock_conid("SPY", "[]").is_err());
    }

    #[test]
    fn test_parse_field_prefixes_and_suffixes() {
        assert_eq!(parse_field("512.34"), Some(512.34));
        assert_eq!(parse_field("C512.34"), Some(512.34));
        assert_eq!(parse_field("61.2M"), Some(61_200_000.0));
        assert_eq!(parse_field("1,234"), Some(1234.0));
        assert_eq!(parse_field("15.2%"), Some(15.2));
        assert_eq!(parse_field(""), None);
    }

    #[test]
    fn test_snapshot_quote() {
        let json = r#"[{"conid":756733,"31":"512.34","84":"512.33","86":"512.35","7295":"510.00","70":"513.20","71":"509.80","87":"61.2M","_updated":1714766400000}]"#;
        let quote = parse_snapshot_quote("SPY", json).unwrap();
        assert_eq!(quote.close, dec!(512.34));
        assert_eq!(quote.bid, Some(dec!(512.33)));
        assert_eq!(quote.volume, Some(dec!(61200000)));
        assert_eq!(quote.timestamp.timestamp(), 1714766400);
    }

    #[test]
    fn test_preflight_snapshot_unavailable() {
        let json = r#"[{"conid":756733,"conidEx":"756733"}]"#;
        let err = parse_snapshot_quote("SPY", json).unwrap_err();
        assert!(matches!(err, AcquisitionError::DataUnavailable { .. }));
    }

    #[test]
    fn test_history_volume_scaled() {
        let json = r#"{"symbol":"SPY","data":[
            {"o":472.0,"c":472.6,"h":473.0,"l":469.0,"v":1234.0,"t":1704153600000},
            {"o":470.0,"c":467.3,"h":471.0,"l":466.0,"v":1500.0,"t":1704240000000}
        ]}"#;
        let bars = parse_history("SPY", json).unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].volume, Some(dec!(123400)));
        assert_eq!(bars[1].close, dec!(467.3));
    }

    #[test]
    fn test_strike_window() {
        let strikes = parse_strikes(r#"{"call":[440,445,450,455,460],"put":[435,445,450]}"#).unwrap();
        assert_eq!(strikes, vec![435.0, 440.0, 445.0, 450.0, 455.0, 460.0]);
        assert_eq!(strikes_near(&strikes, 451.0, 2), vec![445.0, 450.0, 455.0, 460.0]);
        assert_eq!(strikes_near(&strikes, 400.0, 2), vec![435.0, 440.0]);
    }

    #[test]
    fn test_contract_info_filters_expiry() {
        let json = r#"[
            {"conid":687891,"symbol":"SPY","secType":"OPT","exchange":"SMART","right":"C","strike":450.0,"maturityDate":"20240119"},
            {"conid":687892,"symbol":"SPY","secType":"OPT","exchange":"SMART","right":"P","strike":450.0,"maturityDate":"20240119"},
            {"conid":687893,"symbol":"SPY","secType":"OPT","exchange":"SMART","right":"C","strike":450.0,"maturityDate":"20240117"}
        ]"#;
        let expiry = NaiveDate::from_ymd_opt(2024, 1, 19).unwrap();
        let resolved = parse_contract_info("spy", expiry, json).unwrap();
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[0].contract.occ_symbol(), "SPY240119C00450000");
        assert_eq!(resolved[1].contract.option_type, OptionType::Put);
    }

    #[test]
    fn test_option_snapshot_greeks() {
        let json = r#"[
            {"conid":687891,"31":"12.20","84":"12.10","86":"12.30","7308":"0.62","7309":"0.011","7310":"-0.21","7311":"0.35","7633":"14.8%"},
            {"conid":687892,"84":"2.00","86":"2.10"}
        ]"#;
        let rows = parse_option_snapshot(json).unwrap();
        let call = rows[&687891].greeks.clone().unwrap();
        assert_eq!(call.delta, 0.62);
        assert!((call.implied_volatility.unwrap() - 0.148).abs() < 1e-12);
        assert!(rows[&687892].greeks.is_none());
        assert_eq!(rows[&687892].bid, Some(2.0));
    }

    #[test]
    fn test_disabled_without_gateway() {
        assert!(!IbkrProvider::new(None).is_enabled());
        let provider = IbkrProvider::new(Some(format!("{}/", DEFAULT_GATEWAY_URL)));
        assert!(provider.is_enabled());
        assert_eq!(provider.base_url.as_deref(), Some(DEFAULT_GATEWAY_URL));
    }

    #[test]
    fn test_timeout_configurable() {
        let provider = IbkrProvider::new(Some(DEFAULT_GATEWAY_URL.to_string()));
        assert_eq!(provider.timeout(), DEFAULT_TIMEOUT);

        let provider = provider.with_timeout(Duration::from_secs(45));
        assert_eq!(provider.timeout(), Duration::from_secs(45));
        assert!(provider.is_enabled());
    }
}
