use std::sync::Arc;
use std::time::Duration;

use optionsdesk_acquisition::{
    AcquisitionConfig, DataSourceOrchestrator, ProviderCredentials, SystemClock,
};
use optionsdesk_storage_sqlite::SqliteKeyValueStore;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{Config, LogFormat};

pub struct AppState {
    pub orchestrator: Arc<DataSourceOrchestrator>,
    pub acquire_timeout: Duration,
}

pub fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(false))
            .init(),
        LogFormat::Text => registry
            .with(fmt::layer().with_target(true).with_line_number(true))
            .init(),
    }
}

pub async fn build_state(config: &Config) -> anyhow::Result<Arc<AppState>> {
    let store = SqliteKeyValueStore::open(&config.db_path)?;
    tracing::info!("Database path in use: {}", config.db_path);

    let acquisition_config = match &config.acquisition_config {
        Some(path) => {
            tracing::info!("Loading acquisition config from {}", path.display());
            AcquisitionConfig::from_json_file(path)?
        }
        None => AcquisitionConfig::default(),
    };

    let credentials = ProviderCredentials::from_env();
    tracing::debug!("Provider credentials: {:?}", credentials);

    let orchestrator =
        acquisition_config.build_orchestrator(&credentials, Arc::new(store), Arc::new(SystemClock));

    let report = orchestrator.diagnostics().await;
    let enabled: Vec<&str> = report
        .providers
        .iter()
        .filter(|p| p.enabled)
        .map(|p| p.id.as_str())
        .collect();
    tracing::info!("Enabled providers: {:?}", enabled);

    Ok(Arc::new(AppState {
        orchestrator: Arc::new(orchestrator),
        acquire_timeout: config.acquire_timeout,
    }))
}
