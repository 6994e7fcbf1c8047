use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Scheduled or reported earnings release.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EarningsEvent {
    pub symbol: String,
    pub date: NaiveDate,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eps_estimate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eps_actual: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revenue_estimate: Option<f64>,
    /// Release timing as reported (bmo, amc, dmh)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hour: Option<String>,
}

/// Declared or historical dividend.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DividendEvent {
    pub symbol: String,
    pub ex_date: NaiveDate,
    pub amount: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_date: Option<NaiveDate>,
}

/// Annualized risk-free rate as a decimal fraction (0.0525 = 5.25%).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskFreeRate {
    pub rate: f64,
    /// Series identifier, e.g. DGS3MO
    pub series: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub as_of: Option<NaiveDate>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolatilityMethod {
    Implied,
    Historical,
}

/// Annualized volatility as a decimal fraction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volatility {
    pub value: f64,
    pub method: VolatilityMethod,
    /// Number of returns used (historical only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window: Option<usize>,
}
