//! External data provider abstractions and implementations.
//!
//! This module contains:
//! - The `ProviderAdapter` trait that all providers implement
//! - Provider capabilities and rate limit declarations
//! - The shared HTTP helper that maps transport results into the error taxonomy
//! - Concrete adapters
//!
//! | Adapter | Id | Serves |
//! |---------|----|--------|
//! | [`ibkr::IbkrProvider`] | `IBKR` | quote, historical, chain, greeks, IV |
//! | [`tradier::TradierProvider`] | `TRADIER` | quote, historical, chain, greeks, IV |
//! | [`finnhub::FinnhubProvider`] | `FINNHUB` | quote, historical, earnings |
//! | [`fred::FredProvider`] | `FRED` | risk-free rate |
//! | [`yahoo_scrape::YahooScrapeProvider`] | `YAHOO_SCRAPE` | quote |
//! | [`fmp::FmpProvider`] | `FMP` | quote, earnings, dividends |
//!
//! Adapters know nothing about priorities, retries or quotas. They make one
//! attempt and report the outcome; the orchestrator decides what happens next.

mod capabilities;
pub(crate) mod http;
mod traits;

pub mod finnhub;
pub mod fmp;
pub mod fred;
pub mod ibkr;
pub mod tradier;
pub mod yahoo_scrape;

pub use capabilities::{ProviderCapabilities, RateLimit};
pub use traits::{fetch_payload, ProviderAdapter, DEFAULT_TIMEOUT};
