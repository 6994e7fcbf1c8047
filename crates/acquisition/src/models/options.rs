use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// Seconds in a 365-day year, used for time-to-expiry.
const SECONDS_PER_YEAR: f64 = 365.0 * 24.0 * 3600.0;

/// US equity options expire at the 16:00 ET close; 21:00 UTC covers both
/// daylight and standard time closely enough for pricing purposes.
const EXPIRY_HOUR_UTC: u32 = 21;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionType {
    Call,
    Put,
}

impl OptionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Call => "call",
            Self::Put => "put",
        }
    }

    /// Single-letter code used in OCC symbols.
    pub fn occ_code(&self) -> char {
        match self {
            Self::Call => 'C',
            Self::Put => 'P',
        }
    }
}

/// A single listed option contract.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionContract {
    pub underlying: String,
    pub strike: f64,
    pub expiry: NaiveDate,
    pub option_type: OptionType,
}

impl OptionContract {
    pub fn new(
        underlying: impl Into<String>,
        strike: f64,
        expiry: NaiveDate,
        option_type: OptionType,
    ) -> Self {
        Self {
            underlying: underlying.into(),
            strike,
            expiry,
            option_type,
        }
    }

    /// OCC-style symbol, e.g. `SPY240119C00450000`.
    pub fn occ_symbol(&self) -> String {
        format!(
            "{}{}{}{:08}",
            self.underlying.to_uppercase(),
            self.expiry.format("%y%m%d"),
            self.option_type.occ_code(),
            (self.strike * 1000.0).round() as u64
        )
    }

    /// Years until expiry (ACT/365), floored at zero.
    pub fn time_to_expiry(&self, as_of: DateTime<Utc>) -> f64 {
        let expiry_time = NaiveTime::from_hms_opt(EXPIRY_HOUR_UTC, 0, 0).unwrap_or_default();
        let expiry = self.expiry.and_time(expiry_time).and_utc();
        let seconds = (expiry - as_of).num_seconds() as f64;
        (seconds / SECONDS_PER_YEAR).max(0.0)
    }
}

/// Option sensitivities.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Greeks {
    pub delta: f64,
    pub gamma: f64,
    /// Per calendar day
    pub theta: f64,
    /// Per 1 vol point
    pub vega: f64,
    /// Per 1 rate point
    pub rho: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub implied_volatility: Option<f64>,
}

/// Quote for one contract within a chain.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionQuote {
    pub contract: OptionContract,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bid: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ask: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_interest: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub greeks: Option<Greeks>,
}

impl OptionQuote {
    pub fn new(contract: OptionContract) -> Self {
        Self {
            contract,
            bid: None,
            ask: None,
            last: None,
            volume: None,
            open_interest: None,
            greeks: None,
        }
    }

    /// Mid price when both sides are quoted, else the last trade.
    pub fn mid(&self) -> Option<f64> {
        match (self.bid, self.ask) {
            (Some(bid), Some(ask)) if bid > 0.0 && ask >= bid => Some((bid + ask) / 2.0),
            _ => self.last,
        }
    }
}

/// Option chain for one underlying, optionally restricted to one expiry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionChain {
    pub underlying: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiry: Option<NaiveDate>,
    pub contracts: Vec<OptionQuote>,
}

impl OptionChain {
    /// Find the quote for a specific contract.
    pub fn find(&self, contract: &OptionContract) -> Option<&OptionQuote> {
        self.contracts.iter().find(|q| {
            q.contract.option_type == contract.option_type
                && q.contract.expiry == contract.expiry
                && (q.contract.strike - contract.strike).abs() < 1e-6
        })
    }
}
