//! Shared HTTP plumbing for the REST adapters.
//!
//! Maps transport outcomes onto the acquisition error taxonomy:
//!
//! | Outcome | Error |
//! |---------|-------|
//! | HTTP 429 | `RateLimited` (with `Retry-After` when sent) |
//! | HTTP 5xx | `ServerError` |
//! | Other HTTP 4xx | `ClientError` |
//! | reqwest timeout | `Timeout` |
//! | Connect/DNS/TLS/body failure | `Network` |
//!
//! Error messages carry the request URL so the failure registry can store a
//! sanitized copy. Nothing here logs an unredacted URL.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::errors::AcquisitionError;
use crate::redact::redact_url;

/// Longest error body excerpt kept in a message.
const MAX_BODY_EXCERPT: usize = 200;

/// Build a client with the adapter's timeout.
pub(crate) fn build_client(timeout: Duration) -> Client {
    Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// Send a request and return the body of a successful response.
pub(crate) async fn send(
    client: &Client,
    provider: &str,
    builder: RequestBuilder,
) -> Result<String, AcquisitionError> {
    let request = builder.build().map_err(|e| AcquisitionError::ClientError {
        provider: provider.to_string(),
        status: 400,
        message: format!("Invalid request: {}", e),
    })?;
    let url = request.url().to_string();
    debug!("{} request: {}", provider, redact_url(&url));

    let response = client
        .execute(request)
        .await
        .map_err(|e| map_send_error(provider, &url, &e))?;

    let status = response.status();
    if !status.is_success() {
        let retry_after = parse_retry_after(response.headers(), Utc::now());
        let body = response.text().await.unwrap_or_default();
        return Err(classify_status(provider, &url, status, &body, retry_after));
    }

    response.text().await.map_err(|e| AcquisitionError::Network {
        provider: provider.to_string(),
        message: format!("GET {}: failed to read response: {}", url, e),
    })
}

/// Map a reqwest send failure.
pub(crate) fn map_send_error(provider: &str, url: &str, error: &reqwest::Error) -> AcquisitionError {
    if error.is_timeout() {
        AcquisitionError::Timeout {
            provider: provider.to_string(),
        }
    } else {
        AcquisitionError::Network {
            provider: provider.to_string(),
            message: format!("GET {}: {}", url, error),
        }
    }
}

/// Map a non-success HTTP status.
pub(crate) fn classify_status(
    provider: &str,
    url: &str,
    status: StatusCode,
    body: &str,
    retry_after: Option<Duration>,
) -> AcquisitionError {
    let excerpt = body_excerpt(body);
    if status == StatusCode::TOO_MANY_REQUESTS {
        AcquisitionError::RateLimited {
            provider: provider.to_string(),
            retry_after,
        }
    } else if status.is_server_error() {
        AcquisitionError::ServerError {
            provider: provider.to_string(),
            status: status.as_u16(),
            message: format!("GET {} - {}", url, excerpt),
        }
    } else {
        AcquisitionError::ClientError {
            provider: provider.to_string(),
            status: status.as_u16(),
            message: format!("GET {} - {}", url, excerpt),
        }
    }
}

/// `Retry-After` as delta-seconds or an HTTP date.
pub(crate) fn parse_retry_after(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    (at - now).to_std().ok()
}

/// Deserialize a JSON body. Malformed payloads are `DataUnavailable`.
pub(crate) fn parse_json<T: DeserializeOwned>(
    provider: &str,
    body: &str,
) -> Result<T, AcquisitionError> {
    serde_json::from_str(body).map_err(|e| AcquisitionError::DataUnavailable {
        provider: provider.to_string(),
        message: format!("Failed to parse response: {}", e),
    })
}

fn body_excerpt(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= MAX_BODY_EXCERPT {
        trimmed.to_string()
    } else {
        let cut: String = trimmed.chars().take(MAX_BODY_EXCERPT).collect();
        format!("{}...", cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use reqwest::header::HeaderValue;

    use crate::errors::StatusClass;

    const URL: &str = "https://api.example.test/v1/quote?symbol=SPY&apikey=secret";

    #[test]
    fn test_classify_statuses() {
        let e = classify_status("X", URL, StatusCode::TOO_MANY_REQUESTS, "", None);
        assert_eq!(e.status_class(), StatusClass::RateLimited);

        let e = classify_status("X", URL, StatusCode::BAD_GATEWAY, "upstream", None);
        assert_eq!(e.status_class(), StatusClass::ServerError);
        assert_eq!(e.http_status(), Some(502));

        let e = classify_status("X", URL, StatusCode::NOT_FOUND, "missing", None);
        assert_eq!(e.status_class(), StatusClass::ClientError);
        // URL kept for the failure registry to sanitize
        assert!(e.to_string().contains("api.example.test"));
    }

    #[test]
    fn test_retry_after_seconds_and_date() {
        let now = Utc.with_ymd_and_hms(2024, 5, 6, 12, 0, 0).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("42"));
        assert_eq!(parse_retry_after(&headers, now), Some(Duration::from_secs(42)));

        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Mon, 06 May 2024 12:01:30 GMT"),
        );
        assert_eq!(parse_retry_after(&headers, now), Some(Duration::from_secs(90)));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("soon"));
        assert_eq!(parse_retry_after(&headers, now), None);
    }

    #[test]
    fn test_parse_json_failure_is_data_unavailable() {
        let result: Result<serde_json::Value, _> = parse_json("X", "<html>");
        assert_eq!(
            result.unwrap_err().status_class(),
            StatusClass::DataUnavailable
        );
    }

    #[test]
    fn test_body_excerpt_truncates() {
        let long = "x".repeat(500);
        let excerpt = body_excerpt(&long);
        assert!(excerpt.ends_with("..."));
        assert_eq!(excerpt.len(), MAX_BODY_EXCERPT + 3);
    }
}
