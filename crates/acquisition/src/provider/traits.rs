//! Provider adapter trait definitions.
//!
//! This module defines the `ProviderAdapter` trait that every external data
//! source implements, and the dispatch from a [`DataRequest`] to the matching
//! capability method.

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::errors::AcquisitionError;
use crate::models::{
    DataPayload, DataRequest, DataRequestKind, DateRange, DividendEvent, EarningsEvent, Greeks,
    OptionChain, OptionContract, Quote, RiskFreeRate, Volatility, VolatilityMethod,
};

use super::capabilities::{ProviderCapabilities, RateLimit};

/// Default network timeout for a single provider call.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Trait for external data providers.
///
/// Implement this trait to add support for a new data source. The
/// orchestrator uses the capabilities to decide whether the adapter can serve
/// a request kind, and the rate limit to configure the ledger.
///
/// Every capability method defaults to `NotSupported`, which is classified
/// as a client error and never retried.
///
/// # Example
///
/// ```ignore
/// use async_trait::async_trait;
/// use optionsdesk_acquisition::provider::{ProviderAdapter, ProviderCapabilities, RateLimit};
///
/// struct MyProvider {
///     api_key: String,
/// }
///
/// #[async_trait]
/// impl ProviderAdapter for MyProvider {
///     fn id(&self) -> &'static str {
///         "MY_PROVIDER"
///     }
///
///     fn capabilities(&self) -> ProviderCapabilities {
///         ProviderCapabilities {
///             kinds: &[DataRequestKind::Quote],
///         }
///     }
///
///     fn rate_limit(&self) -> RateLimit {
///         RateLimit::default()
///     }
///
///     // ... implement fetch_quote
/// }
/// ```
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Unique identifier for this provider.
    ///
    /// Should be a constant string like "TRADIER", "FRED", etc. Used in
    /// priority lists, ledger keys, failure records and `chosen_source`.
    fn id(&self) -> &'static str;

    /// Request kinds this adapter can serve.
    fn capabilities(&self) -> ProviderCapabilities;

    /// Rate limiting configuration.
    fn rate_limit(&self) -> RateLimit;

    /// Network timeout applied to every call.
    fn timeout(&self) -> Duration {
        DEFAULT_TIMEOUT
    }

    /// Whether the adapter is configured for use (credentials present).
    fn is_enabled(&self) -> bool {
        true
    }

    /// Whether the adapter can reach its backend right now.
    ///
    /// Defaults to `is_enabled()`; adapters with a session (the brokerage
    /// gateway) probe it.
    async fn is_connected(&self) -> bool {
        self.is_enabled()
    }

    async fn fetch_quote(&self, symbol: &str) -> Result<Quote, AcquisitionError> {
        let _ = symbol;
        Err(self.not_supported("quote"))
    }

    /// Daily bars ordered by timestamp ascending.
    async fn fetch_historical(
        &self,
        symbol: &str,
        range: DateRange,
    ) -> Result<Vec<Quote>, AcquisitionError> {
        let _ = (symbol, range);
        Err(self.not_supported("historical"))
    }

    async fn fetch_option_chain(
        &self,
        symbol: &str,
        expiry: Option<NaiveDate>,
    ) -> Result<OptionChain, AcquisitionError> {
        let _ = (symbol, expiry);
        Err(self.not_supported("option_chain"))
    }

    async fn fetch_greeks(&self, contract: &OptionContract) -> Result<Greeks, AcquisitionError> {
        let _ = contract;
        Err(self.not_supported("option_greeks"))
    }

    async fn fetch_earnings_calendar(
        &self,
        symbol: Option<&str>,
        range: DateRange,
    ) -> Result<Vec<EarningsEvent>, AcquisitionError> {
        let _ = (symbol, range);
        Err(self.not_supported("earnings_calendar"))
    }

    async fn fetch_dividend_calendar(
        &self,
        symbol: Option<&str>,
        range: DateRange,
    ) -> Result<Vec<DividendEvent>, AcquisitionError> {
        let _ = (symbol, range);
        Err(self.not_supported("dividend_calendar"))
    }

    async fn fetch_risk_free_rate(&self) -> Result<RiskFreeRate, AcquisitionError> {
        Err(self.not_supported("risk_free_rate"))
    }

    /// Helper for the default method bodies.
    fn not_supported(&self, operation: &str) -> AcquisitionError {
        AcquisitionError::NotSupported {
            operation: operation.to_string(),
            provider: self.id().to_string(),
        }
    }
}

/// Route a request to the adapter method for its kind.
///
/// Implied volatility is served from the adapter's greeks. Historical
/// volatility has no provider method and is left to the computation bridge.
pub async fn fetch_payload(
    adapter: &dyn ProviderAdapter,
    request: &DataRequest,
) -> Result<DataPayload, AcquisitionError> {
    let missing = |what: &str| AcquisitionError::ClientError {
        provider: adapter.id().to_string(),
        status: 400,
        message: format!("{} request requires {}", request.kind, what),
    };
    let symbol = || request.symbol.as_deref().ok_or_else(|| missing("a symbol"));
    let range = || request.range.ok_or_else(|| missing("a date range"));
    let contract = || request.contract.as_ref().ok_or_else(|| missing("a contract"));

    match request.kind {
        DataRequestKind::Quote => Ok(DataPayload::Quote(adapter.fetch_quote(symbol()?).await?)),
        DataRequestKind::Historical => Ok(DataPayload::Historical(
            adapter.fetch_historical(symbol()?, range()?).await?,
        )),
        DataRequestKind::OptionChain => Ok(DataPayload::OptionChain(
            adapter.fetch_option_chain(symbol()?, request.expiry).await?,
        )),
        DataRequestKind::OptionGreeks => {
            Ok(DataPayload::Greeks(adapter.fetch_greeks(contract()?).await?))
        }
        DataRequestKind::EarningsCalendar => Ok(DataPayload::EarningsCalendar(
            adapter
                .fetch_earnings_calendar(request.symbol.as_deref(), range()?)
                .await?,
        )),
        DataRequestKind::DividendCalendar => Ok(DataPayload::DividendCalendar(
            adapter
                .fetch_dividend_calendar(request.symbol.as_deref(), range()?)
                .await?,
        )),
        DataRequestKind::RiskFreeRate => Ok(DataPayload::RiskFreeRate(
            adapter.fetch_risk_free_rate().await?,
        )),
        DataRequestKind::ImpliedVolatility => {
            let greeks = adapter.fetch_greeks(contract()?).await?;
            let value = greeks
                .implied_volatility
                .ok_or_else(|| AcquisitionError::DataUnavailable {
                    provider: adapter.id().to_string(),
                    message: "Greeks carry no implied volatility".to_string(),
                })?;
            Ok(DataPayload::Volatility(Volatility {
                value,
                method: VolatilityMethod::Implied,
                window: None,
            }))
        }
        DataRequestKind::HistoricalVolatility => {
            Err(adapter.not_supported(DataRequestKind::HistoricalVolatility.as_str()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};
    use rust_decimal_macros::dec;

    use crate::models::OptionType;

    struct QuoteOnly;

    #[async_trait]
    impl ProviderAdapter for QuoteOnly {
        fn id(&self) -> &'static str {
            "QUOTE_ONLY"
        }

        fn capabilities(&self) -> ProviderCapabilities {
            ProviderCapabilities {
                kinds: &[DataRequestKind::Quote, DataRequestKind::ImpliedVolatility],
            }
        }

        fn rate_limit(&self) -> RateLimit {
            RateLimit::unlimited()
        }

        async fn fetch_quote(&self, symbol: &str) -> Result<Quote, AcquisitionError> {
            Ok(Quote::new(symbol, Utc::now(), dec!(10), "USD", self.id()))
        }

        async fn fetch_greeks(&self, _contract: &OptionContract) -> Result<Greeks, AcquisitionError> {
            Ok(Greeks {
                delta: 0.5,
                implied_volatility: Some(0.31),
                ..Greeks::default()
            })
        }
    }

    #[tokio::test]
    async fn test_dispatch_quote() {
        let payload = fetch_payload(&QuoteOnly, &DataRequest::quote("SPY"))
            .await
            .unwrap();
        assert!(matches!(payload, DataPayload::Quote(q) if q.symbol == "SPY"));
    }

    #[tokio::test]
    async fn test_unimplemented_method_is_not_supported() {
        let err = fetch_payload(&QuoteOnly, &DataRequest::risk_free_rate())
            .await
            .unwrap_err();
        assert!(matches!(err, AcquisitionError::NotSupported { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_implied_volatility_from_greeks() {
        let contract = OptionContract::new(
            "SPY",
            450.0,
            NaiveDate::from_ymd_opt(2024, 1, 19).unwrap(),
            OptionType::Call,
        );
        let payload = fetch_payload(&QuoteOnly, &DataRequest::implied_volatility(contract))
            .await
            .unwrap();
        match payload {
            DataPayload::Volatility(v) => {
                assert_eq!(v.value, 0.31);
                assert_eq!(v.method, VolatilityMethod::Implied);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_parameters_are_client_errors() {
        let request = DataRequest {
            symbol: None,
            ..DataRequest::quote("SPY")
        };
        let err = fetch_payload(&QuoteOnly, &request).await.unwrap_err();
        assert_eq!(err.http_status(), Some(400));
    }

    #[tokio::test]
    async fn test_default_is_connected_follows_enabled() {
        assert!(QuoteOnly.is_connected().await);
        assert_eq!(QuoteOnly.timeout(), DEFAULT_TIMEOUT);
    }
}
