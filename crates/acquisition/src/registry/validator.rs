//! Payload validation.
//!
//! Validates provider payloads before they are accepted:
//! - Quote invariants (positive close, high >= low, non-negative volume)
//! - Non-empty series and chains
//! - Finite, plausible option sensitivities, rates and volatilities
//!
//! Hard failures turn a provider success into `DataUnavailable`, so the
//! orchestrator moves on to the next provider without retrying.

use log::warn;
use rust_decimal::Decimal;

use crate::errors::AcquisitionError;
use crate::models::{DataPayload, Greeks, Quote};

/// Validation severity levels.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ValidationSeverity {
    /// Hard failure - reject payload, try next provider.
    Hard,
    /// Soft warning - accept payload but log warning.
    Soft,
}

/// Validation result details.
#[derive(Clone, Debug)]
pub struct ValidationIssue {
    pub severity: ValidationSeverity,
    pub message: String,
}

impl ValidationIssue {
    fn hard(message: impl Into<String>) -> Self {
        Self {
            severity: ValidationSeverity::Hard,
            message: message.into(),
        }
    }

    fn soft(message: impl Into<String>) -> Self {
        Self {
            severity: ValidationSeverity::Soft,
            message: message.into(),
        }
    }
}

/// Payload validator configuration.
#[derive(Clone, Debug)]
pub struct ValidatorConfig {
    /// Maximum allowed price value (for sanity check).
    pub max_price: Option<Decimal>,
    /// Plausible bounds for an annualized risk-free rate.
    pub rate_bounds: (f64, f64),
    /// Upper bound for an annualized volatility.
    pub max_volatility: f64,
    /// Whether to warn on zero volume.
    pub warn_on_zero_volume: bool,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            max_price: Some(Decimal::from(1_000_000_000i64)), // 1 billion as sanity check
            rate_bounds: (-0.05, 0.25),
            max_volatility: 5.0,
            warn_on_zero_volume: false,
        }
    }
}

/// Provider payload validator.
pub struct PayloadValidator {
    config: ValidatorConfig,
}

impl PayloadValidator {
    pub fn new() -> Self {
        Self {
            config: ValidatorConfig::default(),
        }
    }

    pub fn with_config(config: ValidatorConfig) -> Self {
        Self { config }
    }

    /// Validate a payload returned by `provider`.
    ///
    /// Invalid bars and contracts are dropped from series and chains; the
    /// payload is rejected only when nothing usable remains.
    pub fn validate(
        &self,
        provider: &str,
        payload: DataPayload,
    ) -> Result<DataPayload, AcquisitionError> {
        let unavailable = |message: String| AcquisitionError::DataUnavailable {
            provider: provider.to_string(),
            message,
        };

        match payload {
            DataPayload::Quote(quote) => {
                self.check(&quote.symbol, self.quote_issues(&quote))
                    .map_err(unavailable)?;
                Ok(DataPayload::Quote(quote))
            }
            DataPayload::Historical(bars) => {
                let total = bars.len();
                let valid: Vec<Quote> = bars
                    .into_iter()
                    .filter(|bar| {
                        !self
                            .quote_issues(bar)
                            .iter()
                            .any(|i| i.severity == ValidationSeverity::Hard)
                    })
                    .collect();
                if valid.is_empty() {
                    return Err(unavailable(format!(
                        "No valid bars in historical series ({} received)",
                        total
                    )));
                }
                if valid.len() < total {
                    warn!(
                        "Dropped {} invalid bars from {} historical series",
                        total - valid.len(),
                        provider
                    );
                }
                Ok(DataPayload::Historical(valid))
            }
            DataPayload::OptionChain(mut chain) => {
                chain.contracts.retain(|q| {
                    let negative = |v: Option<f64>| v.map(|x| x < 0.0 || !x.is_finite()).unwrap_or(false);
                    !(negative(q.bid) || negative(q.ask) || negative(q.last))
                        && q.contract.strike > 0.0
                });
                if chain.contracts.is_empty() {
                    return Err(unavailable(format!(
                        "Empty option chain for {}",
                        chain.underlying
                    )));
                }
                Ok(DataPayload::OptionChain(chain))
            }
            DataPayload::Greeks(greeks) => {
                self.check("greeks", self.greeks_issues(&greeks))
                    .map_err(unavailable)?;
                Ok(DataPayload::Greeks(greeks))
            }
            DataPayload::RiskFreeRate(rate) => {
                let (lo, hi) = self.config.rate_bounds;
                if !rate.rate.is_finite() || rate.rate < lo || rate.rate > hi {
                    return Err(unavailable(format!(
                        "Risk-free rate {} outside plausible range",
                        rate.rate
                    )));
                }
                Ok(DataPayload::RiskFreeRate(rate))
            }
            DataPayload::Volatility(vol) => {
                if !vol.value.is_finite() || vol.value <= 0.0 || vol.value > self.config.max_volatility
                {
                    return Err(unavailable(format!(
                        "Volatility {} outside plausible range",
                        vol.value
                    )));
                }
                Ok(DataPayload::Volatility(vol))
            }
            DataPayload::EarningsCalendar(events) => Ok(DataPayload::EarningsCalendar(events)),
            DataPayload::DividendCalendar(events) => {
                if events.iter().any(|e| e.amount < Decimal::ZERO) {
                    return Err(unavailable("Negative dividend amount".to_string()));
                }
                Ok(DataPayload::DividendCalendar(events))
            }
            DataPayload::Unavailable { reason } => Err(unavailable(reason)),
        }
    }

    /// Fail on hard issues, log soft ones.
    fn check(&self, subject: &str, issues: Vec<ValidationIssue>) -> Result<(), String> {
        let errors: Vec<&str> = issues
            .iter()
            .filter(|i| i.severity == ValidationSeverity::Hard)
            .map(|i| i.message.as_str())
            .collect();

        if !errors.is_empty() {
            return Err(errors.join("; "));
        }

        for issue in issues.iter().filter(|i| i.severity == ValidationSeverity::Soft) {
            warn!("Validation warning for {}: {}", subject, issue.message);
        }

        Ok(())
    }

    fn quote_issues(&self, quote: &Quote) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        // Several providers report 0 for unknown symbols instead of an error
        if quote.close <= Decimal::ZERO {
            issues.push(ValidationIssue::hard(format!(
                "Non-positive close price: {}",
                quote.close
            )));
        }

        if let (Some(high), Some(low)) = (quote.high, quote.low) {
            if high < low {
                issues.push(ValidationIssue::hard(format!(
                    "High ({}) is less than Low ({})",
                    high, low
                )));
            } else if quote.close < low || quote.close > high {
                issues.push(ValidationIssue::soft(format!(
                    "Close ({}) is outside High/Low range ({}-{})",
                    quote.close, low, high
                )));
            }
        }

        if let (Some(bid), Some(ask)) = (quote.bid, quote.ask) {
            if bid > Decimal::ZERO && ask > Decimal::ZERO && bid > ask {
                issues.push(ValidationIssue::soft(format!(
                    "Crossed market: bid {} > ask {}",
                    bid, ask
                )));
            }
        }

        if let Some(max_price) = self.config.max_price {
            if quote.close > max_price {
                issues.push(ValidationIssue::hard(format!(
                    "Price {} exceeds sanity limit {}",
                    quote.close, max_price
                )));
            }
        }

        if let Some(volume) = quote.volume {
            if volume < Decimal::ZERO {
                issues.push(ValidationIssue::hard(format!("Negative volume: {}", volume)));
            } else if self.config.warn_on_zero_volume && volume == Decimal::ZERO {
                issues.push(ValidationIssue::soft("Zero volume (market may be closed)"));
            }
        }

        issues
    }

    fn greeks_issues(&self, greeks: &Greeks) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        let values = [
            ("delta", greeks.delta),
            ("gamma", greeks.gamma),
            ("theta", greeks.theta),
            ("vega", greeks.vega),
            ("rho", greeks.rho),
        ];
        for (name, value) in values {
            if !value.is_finite() {
                issues.push(ValidationIssue::hard(format!("Non-finite {}", name)));
            }
        }
        if greeks.delta.abs() > 1.0 + 1e-9 {
            issues.push(ValidationIssue::hard(format!(
                "Delta {} outside [-1, 1]",
                greeks.delta
            )));
        }
        if greeks.gamma < 0.0 {
            issues.push(ValidationIssue::soft(format!("Negative gamma {}", greeks.gamma)));
        }
        if let Some(iv) = greeks.implied_volatility {
            if !iv.is_finite() || iv < 0.0 {
                issues.push(ValidationIssue::hard(format!("Invalid implied volatility {}", iv)));
            }
        }
        issues
    }
}

impl Default for PayloadValidator {
    fn default() -> Self {
        Self::new()
    }
}
