//! Self-computation bridge.
//!
//! The orchestrator falls back to this interface when every provider in a
//! chain has failed. It takes explicit numbers only and never reaches back
//! into providers or the cache.
//!
//! [`BlackScholesBridge`] is the built-in implementation: closed-form
//! European pricing with an Abramowitz-Stegun normal CDF, Newton-Raphson
//! implied volatility with a bisection fallback, and close-to-close
//! historical volatility annualized over 252 trading days.

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{Greeks, OptionType};

/// Trading days per year used to annualize historical volatility.
pub const TRADING_DAYS_PER_YEAR: f64 = 252.0;

pub const MIN_VOL: f64 = 1e-4;
pub const MAX_VOL: f64 = 5.0;

/// Smallest time-to-expiry used in the closed form (one second).
const MIN_TIME: f64 = 1.0 / (365.0 * 24.0 * 3600.0);
const PRICE_TOLERANCE: f64 = 1e-6;
const NEWTON_ITERATIONS: u32 = 100;
const BISECTION_ITERATIONS: u32 = 200;
const MIN_CLOSES: usize = 3;

/// Errors raised by a computation bridge.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ComputationError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Solver did not converge after {iterations} iterations")]
    NonConvergent { iterations: u32 },

    #[error("Insufficient data: needed {needed}, got {got}")]
    InsufficientData { needed: usize, got: usize },
}

/// Inputs for pricing one European option.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PricingInputs {
    pub spot: f64,
    pub strike: f64,
    /// Years
    pub time_to_expiry: f64,
    /// Annualized, decimal
    pub volatility: f64,
    /// Annualized, decimal, continuously compounded
    pub risk_free_rate: f64,
    pub option_type: OptionType,
}

impl PricingInputs {
    fn validate(&self, needs_volatility: bool) -> Result<(), ComputationError> {
        let positive = |name: &str, v: f64| {
            if v.is_finite() && v > 0.0 {
                Ok(())
            } else {
                Err(ComputationError::InvalidInput(format!(
                    "{} must be positive, got {}",
                    name, v
                )))
            }
        };

        positive("spot", self.spot)?;
        positive("strike", self.strike)?;
        if needs_volatility {
            positive("volatility", self.volatility)?;
        }
        if !self.time_to_expiry.is_finite() || self.time_to_expiry < 0.0 {
            return Err(ComputationError::InvalidInput(format!(
                "time to expiry must be non-negative, got {}",
                self.time_to_expiry
            )));
        }
        if !self.risk_free_rate.is_finite() {
            return Err(ComputationError::InvalidInput(
                "risk-free rate must be finite".to_string(),
            ));
        }
        Ok(())
    }

    fn with_volatility(self, volatility: f64) -> Self {
        Self { volatility, ..self }
    }
}

/// Narrow pricing interface used by the orchestrator.
pub trait ComputationBridge: Send + Sync {
    fn compute_theoretical_price(&self, inputs: &PricingInputs) -> Result<f64, ComputationError>;

    fn compute_greeks(&self, inputs: &PricingInputs) -> Result<Greeks, ComputationError>;

    /// Volatility that reprices `market_price`. `inputs.volatility` is ignored.
    fn compute_implied_volatility(
        &self,
        market_price: f64,
        inputs: &PricingInputs,
    ) -> Result<f64, ComputationError>;

    /// Annualized volatility of close-to-close log returns, oldest close first.
    fn compute_historical_volatility(&self, closes: &[f64]) -> Result<f64, ComputationError>;
}

/// Closed-form Black-Scholes bridge.
#[derive(Clone, Copy, Debug, Default)]
pub struct BlackScholesBridge;

impl BlackScholesBridge {
    pub fn new() -> Self {
        Self
    }
}

pub fn norm_pdf(x: f64) -> f64 {
    (1.0 / (2.0 * PI).sqrt()) * (-0.5 * x * x).exp()
}

/// Abramowitz-Stegun 26.2.17, absolute error below 7.5e-8.
pub fn norm_cdf(x: f64) -> f64 {
    let k = 1.0 / (1.0 + 0.231_641_9 * x.abs());
    let poly = k
        * (0.319_381_530
            + k * (-0.356_563_782 + k * (1.781_477_937 + k * (-1.821_255_978 + k * 1.330_274_429))));
    let approx = 1.0 - norm_pdf(x) * poly;
    if x >= 0.0 {
        approx
    } else {
        1.0 - approx
    }
}

fn d1_d2(inputs: &PricingInputs) -> (f64, f64) {
    let t = inputs.time_to_expiry.max(MIN_TIME);
    let v = inputs.volatility;
    let sqrt_t = t.sqrt();
    let d1 = ((inputs.spot / inputs.strike).ln() + (inputs.risk_free_rate + 0.5 * v * v) * t)
        / (v * sqrt_t);
    (d1, d1 - v * sqrt_t)
}

pub fn intrinsic_value(spot: f64, strike: f64, option_type: OptionType) -> f64 {
    match option_type {
        OptionType::Call => (spot - strike).max(0.0),
        OptionType::Put => (strike - spot).max(0.0),
    }
}

fn price_unchecked(inputs: &PricingInputs) -> f64 {
    if inputs.time_to_expiry <= 0.0 {
        return intrinsic_value(inputs.spot, inputs.strike, inputs.option_type);
    }
    let (d1, d2) = d1_d2(inputs);
    let t = inputs.time_to_expiry;
    let discount = (-inputs.risk_free_rate * t).exp();
    let price = match inputs.option_type {
        OptionType::Call => inputs.spot * norm_cdf(d1) - inputs.strike * discount * norm_cdf(d2),
        OptionType::Put => inputs.strike * discount * norm_cdf(-d2) - inputs.spot * norm_cdf(-d1),
    };
    price.max(0.0)
}

/// Vega per unit of volatility (not per point).
fn raw_vega(inputs: &PricingInputs) -> f64 {
    let t = inputs.time_to_expiry.max(MIN_TIME);
    let (d1, _) = d1_d2(inputs);
    inputs.spot * norm_pdf(d1) * t.sqrt()
}

impl ComputationBridge for BlackScholesBridge {
    fn compute_theoretical_price(&self, inputs: &PricingInputs) -> Result<f64, ComputationError> {
        inputs.validate(true)?;
        Ok(price_unchecked(inputs))
    }

    fn compute_greeks(&self, inputs: &PricingInputs) -> Result<Greeks, ComputationError> {
        inputs.validate(true)?;

        let (d1, d2) = d1_d2(inputs);
        let s = inputs.spot;
        let k = inputs.strike;
        let t = inputs.time_to_expiry.max(MIN_TIME);
        let v = inputs.volatility;
        let r = inputs.risk_free_rate;
        let pdf = norm_pdf(d1);
        let sqrt_t = t.sqrt();
        let discount = (-r * t).exp();

        let delta = match inputs.option_type {
            OptionType::Call => norm_cdf(d1),
            OptionType::Put => norm_cdf(d1) - 1.0,
        };
        let gamma = pdf / (s * v * sqrt_t);
        let vega = s * pdf * sqrt_t;
        let theta = match inputs.option_type {
            OptionType::Call => -(s * pdf * v) / (2.0 * sqrt_t) - r * k * discount * norm_cdf(d2),
            OptionType::Put => -(s * pdf * v) / (2.0 * sqrt_t) + r * k * discount * norm_cdf(-d2),
        };
        let rho = match inputs.option_type {
            OptionType::Call => k * t * discount * norm_cdf(d2),
            OptionType::Put => -k * t * discount * norm_cdf(-d2),
        };

        Ok(Greeks {
            delta,
            gamma,
            theta: theta / 365.0,
            vega: vega / 100.0,
            rho: rho / 100.0,
            implied_volatility: Some(v),
        })
    }

    fn compute_implied_volatility(
        &self,
        market_price: f64,
        inputs: &PricingInputs,
    ) -> Result<f64, ComputationError> {
        inputs.validate(false)?;
        if !market_price.is_finite() || market_price <= 0.0 {
            return Err(ComputationError::InvalidInput(format!(
                "market price must be positive, got {}",
                market_price
            )));
        }
        if inputs.time_to_expiry <= 0.0 {
            return Err(ComputationError::InvalidInput(
                "implied volatility is undefined at expiry".to_string(),
            ));
        }

        let discount = (-inputs.risk_free_rate * inputs.time_to_expiry).exp();
        let (lower, upper) = match inputs.option_type {
            OptionType::Call => (
                (inputs.spot - inputs.strike * discount).max(0.0),
                inputs.spot,
            ),
            OptionType::Put => (
                (inputs.strike * discount - inputs.spot).max(0.0),
                inputs.strike * discount,
            ),
        };
        if market_price < lower - PRICE_TOLERANCE || market_price >= upper {
            return Err(ComputationError::InvalidInput(format!(
                "market price {} outside no-arbitrage bounds [{}, {})",
                market_price, lower, upper
            )));
        }

        // Newton-Raphson from a mid-range guess
        let mut vol = 0.3;
        for _ in 0..NEWTON_ITERATIONS {
            let trial = inputs.with_volatility(vol);
            let diff = price_unchecked(&trial) - market_price;
            if diff.abs() < PRICE_TOLERANCE {
                return Ok(vol);
            }
            let vega = raw_vega(&trial);
            if vega.abs() < 1e-8 {
                break;
            }
            vol = (vol - diff / vega).clamp(MIN_VOL, MAX_VOL);
        }

        // Price is monotone in volatility, so bisection converges whenever
        // the target lies between the prices at the bounds
        let mut lo = MIN_VOL;
        let mut hi = MAX_VOL;
        let price_lo = price_unchecked(&inputs.with_volatility(lo));
        let price_hi = price_unchecked(&inputs.with_volatility(hi));
        if market_price < price_lo - PRICE_TOLERANCE || market_price > price_hi + PRICE_TOLERANCE {
            return Err(ComputationError::NonConvergent {
                iterations: NEWTON_ITERATIONS,
            });
        }
        for _ in 0..BISECTION_ITERATIONS {
            let mid = 0.5 * (lo + hi);
            let diff = price_unchecked(&inputs.with_volatility(mid)) - market_price;
            if diff.abs() < PRICE_TOLERANCE || (hi - lo) < 1e-10 {
                return Ok(mid);
            }
            if diff > 0.0 {
                hi = mid;
            } else {
                lo = mid;
            }
        }

        Err(ComputationError::NonConvergent {
            iterations: NEWTON_ITERATIONS + BISECTION_ITERATIONS,
        })
    }

    fn compute_historical_volatility(&self, closes: &[f64]) -> Result<f64, ComputationError> {
        if closes.len() < MIN_CLOSES {
            return Err(ComputationError::InsufficientData {
                needed: MIN_CLOSES,
                got: closes.len(),
            });
        }
        if let Some(bad) = closes.iter().find(|c| !c.is_finite() || **c <= 0.0) {
            return Err(ComputationError::InvalidInput(format!(
                "closing prices must be positive, got {}",
                bad
            )));
        }

        let returns: Vec<f64> = closes.windows(2).map(|w| (w[1] / w[0]).ln()).collect();
        let n = returns.len() as f64;
        let mean = returns.iter().sum::<f64>() / n;
        let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);

        Ok(variance.sqrt() * TRADING_DAYS_PER_YEAR.sqrt())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn atm_call() -> PricingInputs {
        PricingInputs {
            spot: 100.0,
            strike: 100.0,
            time_to_expiry: 0.5,
            volatility: 0.25,
            risk_free_rate: 0.05,
            option_type: OptionType::Call,
        }
    }

    #[test]
    fn test_norm_cdf_symmetry_and_tails() {
        assert!((norm_cdf(0.5) + norm_cdf(-0.5) - 1.0).abs() < 1e-10);
        assert!((norm_cdf(0.0) - 0.5).abs() < 1e-7);
        assert!((norm_cdf(10.0) - 1.0).abs() < 1e-10);
        assert!(norm_cdf(-10.0).abs() < 1e-10);
    }

    #[test]
    fn test_reference_price() {
        // Hull: S=42, K=40, r=10%, sigma=20%, T=0.5 gives call 4.76, put 0.81
        let bridge = BlackScholesBridge::new();
        let call = PricingInputs {
            spot: 42.0,
            strike: 40.0,
            time_to_expiry: 0.5,
            volatility: 0.2,
            risk_free_rate: 0.1,
            option_type: OptionType::Call,
        };
        let put = PricingInputs {
            option_type: OptionType::Put,
            ..call
        };
        assert!((bridge.compute_theoretical_price(&call).unwrap() - 4.76).abs() < 0.01);
        assert!((bridge.compute_theoretical_price(&put).unwrap() - 0.81).abs() < 0.01);
    }

    #[test]
    fn test_put_call_parity() {
        let bridge = BlackScholesBridge::new();
        let call = atm_call();
        let put = PricingInputs {
            option_type: OptionType::Put,
            ..call
        };
        let lhs = bridge.compute_theoretical_price(&call).unwrap()
            - bridge.compute_theoretical_price(&put).unwrap();
        let rhs = call.spot - call.strike * (-call.risk_free_rate * call.time_to_expiry).exp();
        assert!((lhs - rhs).abs() < 1e-4);
    }

    #[test]
    fn test_expired_option_is_intrinsic() {
        let bridge = BlackScholesBridge::new();
        let inputs = PricingInputs {
            spot: 110.0,
            time_to_expiry: 0.0,
            ..atm_call()
        };
        assert_eq!(bridge.compute_theoretical_price(&inputs).unwrap(), 10.0);
    }

    #[test]
    fn test_greeks_signs_and_units() {
        let bridge = BlackScholesBridge::new();
        let call = bridge.compute_greeks(&atm_call()).unwrap();
        assert!(call.delta > 0.5 && call.delta < 0.7);
        assert!(call.gamma > 0.0);
        assert!(call.theta < 0.0);
        assert!(call.vega > 0.0 && call.vega < 1.0);
        assert_eq!(call.implied_volatility, Some(0.25));

        let put = bridge
            .compute_greeks(&PricingInputs {
                option_type: OptionType::Put,
                ..atm_call()
            })
            .unwrap();
        assert!((call.delta - put.delta - 1.0).abs() < 1e-9);
        assert!(put.rho < 0.0);
    }

    #[test]
    fn test_invalid_inputs_rejected() {
        let bridge = BlackScholesBridge::new();
        let bad = PricingInputs {
            spot: -1.0,
            ..atm_call()
        };
        assert!(matches!(
            bridge.compute_theoretical_price(&bad),
            Err(ComputationError::InvalidInput(_))
        ));

        let no_vol = PricingInputs {
            volatility: 0.0,
            ..atm_call()
        };
        assert!(bridge.compute_greeks(&no_vol).is_err());
    }

    #[test]
    fn test_implied_vol_roundtrip() {
        let bridge = BlackScholesBridge::new();
        for (strike, vol) in [(80.0, 0.4), (100.0, 0.25), (130.0, 0.6)] {
            let inputs = PricingInputs {
                strike,
                volatility: vol,
                ..atm_call()
            };
            let price = bridge.compute_theoretical_price(&inputs).unwrap();
            let iv = bridge.compute_implied_volatility(price, &inputs).unwrap();
            assert!((iv - vol).abs() < 1e-3, "strike {strike}: {iv} vs {vol}");
        }
    }

    #[test]
    fn test_implied_vol_rejects_arbitrage_price() {
        let bridge = BlackScholesBridge::new();
        // Call worth more than the underlying
        assert!(matches!(
            bridge.compute_implied_volatility(150.0, &atm_call()),
            Err(ComputationError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_implied_vol_beyond_max_vol_is_non_convergent() {
        let bridge = BlackScholesBridge::new();
        let inputs = PricingInputs {
            strike: 300.0,
            time_to_expiry: 0.05,
            ..atm_call()
        };
        // Far OTM call priced above what even MAX_VOL can produce
        let ceiling = bridge
            .compute_theoretical_price(&inputs.with_volatility(MAX_VOL))
            .unwrap();
        let result = bridge.compute_implied_volatility(ceiling + 1.0, &inputs);
        assert!(matches!(result, Err(ComputationError::NonConvergent { .. })));
    }

    #[test]
    fn test_historical_volatility() {
        let bridge = BlackScholesBridge::new();
        // Alternating +1%/-1% moves
        let mut closes = vec![100.0];
        for i in 0..40 {
            let last = *closes.last().unwrap();
            closes.push(if i % 2 == 0 { last * 1.01 } else { last / 1.01 });
        }
        let hv = bridge.compute_historical_volatility(&closes).unwrap();
        let expected = 0.01f64.ln_1p() * TRADING_DAYS_PER_YEAR.sqrt();
        assert!((hv - expected).abs() < 0.005, "{hv} vs {expected}");

        let flat = bridge
            .compute_historical_volatility(&[50.0, 50.0, 50.0, 50.0])
            .unwrap();
        assert_eq!(flat, 0.0);
    }

    #[test]
    fn test_historical_volatility_needs_data() {
        let bridge = BlackScholesBridge::new();
        assert_eq!(
            bridge.compute_historical_volatility(&[100.0, 101.0]),
            Err(ComputationError::InsufficientData { needed: 3, got: 2 })
        );
        assert!(matches!(
            bridge.compute_historical_volatility(&[100.0, 0.0, 101.0]),
            Err(ComputationError::InvalidInput(_))
        ));
    }
}
