use std::{net::SocketAddr, path::PathBuf, time::Duration};

pub struct Config {
    pub listen_addr: SocketAddr,
    pub db_path: String,
    /// Optional JSON file with priorities, TTLs and provider overrides.
    pub acquisition_config: Option<PathBuf>,
    pub request_timeout: Duration,
    /// Upper bound on one fallback walk started by an API request.
    pub acquire_timeout: Duration,
    pub log_format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let listen_addr: SocketAddr = std::env::var("OD_LISTEN_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse()
            .expect("Invalid OD_LISTEN_ADDR");
        let db_path = std::env::var("OD_DB_PATH").unwrap_or_else(|_| "./db/acquisition.db".into());
        let acquisition_config = std::env::var("OD_ACQUISITION_CONFIG")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);
        let timeout_ms: u64 = std::env::var("OD_REQUEST_TIMEOUT_MS")
            .unwrap_or_else(|_| "180000".into())
            .parse()
            .unwrap_or(180000);
        let acquire_ms: u64 = std::env::var("OD_ACQUIRE_TIMEOUT_MS")
            .unwrap_or_else(|_| "150000".into())
            .parse()
            .unwrap_or(150000);
        let log_format = match std::env::var("OD_LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };
        Self {
            listen_addr,
            db_path,
            acquisition_config,
            request_timeout: Duration::from_millis(timeout_ms),
            acquire_timeout: Duration::from_millis(acquire_ms),
            log_format,
        }
    }
}
