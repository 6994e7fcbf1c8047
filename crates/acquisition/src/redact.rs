//! Credential redaction for anything that gets stored or logged.
//!
//! Sensitive keys are matched case-insensitively and also when they are part
//! of a longer name (`X-Finnhub-Token`, `client_secret`). Values are replaced
//! with [`REDACTED`].

use std::collections::BTreeMap;

use lazy_static::lazy_static;
use regex::{Captures, Regex};

/// Fixed marker that replaces every redacted value.
pub const REDACTED: &str = "[REDACTED]";

lazy_static! {
    /// Parameter or header names whose values are secrets.
    static ref SENSITIVE_KEY_REGEX: Regex =
        Regex::new(r"(?i)(api[_-]?key|token|secret|authorization|password|passwd|^key$)")
            .expect("Invalid regex pattern");

    /// `key=value` pairs inside a query string: `?api_key=abc&symbol=SPY`
    static ref QUERY_PAIR_REGEX: Regex =
        Regex::new(r"([?&;])([^=&?#\s]+)=([^&#\s)\]]*)")
            .expect("Invalid regex pattern");

    /// `Authorization: Bearer abc` style credentials in free text
    static ref AUTH_SCHEME_REGEX: Regex =
        Regex::new(r"(?i)\b(bearer|basic)\s+[A-Za-z0-9._~+/=-]+")
            .expect("Invalid regex pattern");

    /// `"token": "abc"` or `apikey=abc` outside a query string
    static ref INLINE_PAIR_REGEX: Regex = Regex::new(
        r#"(?i)\b([A-Za-z0-9_-]*(?:api[_-]?key|token|secret|authorization|password)[A-Za-z0-9_-]*)(["']?\s*[:=]\s*["']?)([^"'&\s,;})\]\[][^"'&\s,;})\]]*)"#
    )
    .expect("Invalid regex pattern");

    /// First http(s) URL in a message
    static ref URL_REGEX: Regex =
        Regex::new(r#"https?://[^\s"'<>)]+"#).expect("Invalid regex pattern");
}

/// Whether a parameter or header name carries a credential.
pub fn is_sensitive_key(key: &str) -> bool {
    SENSITIVE_KEY_REGEX.is_match(key.trim())
}

/// Redact sensitive query parameters in a URL.
pub fn redact_url(url: &str) -> String {
    QUERY_PAIR_REGEX
        .replace_all(url, |caps: &Captures| {
            let key = &caps[2];
            let decoded = urlencoding::decode(key)
                .map(|k| k.into_owned())
                .unwrap_or_else(|_| key.to_string());
            if is_sensitive_key(&decoded) {
                format!("{}{}={}", &caps[1], key, REDACTED)
            } else {
                caps[0].to_string()
            }
        })
        .into_owned()
}

/// Redact a parameter map.
pub fn redact_params<'a, I>(params: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (&'a String, &'a String)>,
{
    params
        .into_iter()
        .map(|(k, v)| {
            let value = if is_sensitive_key(k) {
                REDACTED.to_string()
            } else {
                redact_text(v)
            };
            (k.clone(), value)
        })
        .collect()
}

/// Redact credentials anywhere in free text (error messages, log lines).
pub fn redact_text(text: &str) -> String {
    let text = redact_url(text);
    let text = AUTH_SCHEME_REGEX.replace_all(&text, |caps: &Captures| {
        format!("{} {}", &caps[1], REDACTED)
    });
    INLINE_PAIR_REGEX
        .replace_all(&text, |caps: &Captures| {
            let value = &caps[3];
            if value.eq_ignore_ascii_case("bearer") || value.eq_ignore_ascii_case("basic") {
                caps[0].to_string()
            } else {
                format!("{}{}{}", &caps[1], &caps[2], REDACTED)
            }
        })
        .into_owned()
}

/// First URL found in a message, unredacted.
pub fn find_url(text: &str) -> Option<&str> {
    URL_REGEX.find(text).map(|m| m.as_str())
}
