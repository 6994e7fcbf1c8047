//! Acquisition data models
//!
//! This module contains the core data types passed through the acquisition layer:
//! - `types` - Type aliases for common identifiers (ProviderId)
//! - `request` - What the caller asks for (DataRequestKind, DataRequest, ComputationInputs)
//! - `quote` - Equity quote and historical bar (Quote)
//! - `options` - Contracts, chains and sensitivities (OptionContract, OptionChain, Greeks)
//! - `calendar` - Earnings/dividend events, risk-free rate and volatility values
//! - `result` - What the caller gets back (DataPayload, ProviderResult, ChosenSource)
//!   plus the immutable FallbackRecord and FailureRecord

mod calendar;
mod options;
mod quote;
mod request;
mod result;
mod types;

pub use calendar::{DividendEvent, EarningsEvent, RiskFreeRate, Volatility, VolatilityMethod};
pub use options::{Greeks, OptionChain, OptionContract, OptionQuote, OptionType};
pub use quote::Quote;
pub use request::{ComputationInputs, DataRequest, DataRequestKind, DateRange};
pub use result::{
    ChosenSource, DataPayload, FailureRecord, FallbackRecord, ProviderResult, DEFAULT_SOURCE,
    SELF_CALCULATED,
};
pub use types::ProviderId;
