use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use frontdesk_agent::{
    BookingDispatcher, HttpLlmClient, IntakeRuntime, LlmFieldExtractor, NoopDispatcher,
};
use frontdesk_agent::dispatch::WebhookDispatcher;
use frontdesk_agent::runtime::RuntimeConfig;
use frontdesk_core::config::{AppConfig, ConfigError, LoadOptions};
use frontdesk_core::ClinicHours;
use frontdesk_store::InMemorySessionStore;

pub type AppRuntime = IntakeRuntime<
    Arc<InMemorySessionStore>,
    LlmFieldExtractor<HttpLlmClient>,
    Arc<dyn BookingDispatcher>,
>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchMode {
    /// No webhook configured; bookings are logged and acknowledged.
    Preview,
    Webhook,
}

pub struct Application {
    pub config: AppConfig,
    pub store: Arc<InMemorySessionStore>,
    pub runtime: Arc<AppRuntime>,
    pub dispatch_mode: DispatchMode,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("llm client setup failed: {0}")]
    Llm(#[source] anyhow::Error),
    #[error("dispatcher setup failed: {0}")]
    Dispatcher(#[source] anyhow::Error),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let store = Arc::new(InMemorySessionStore::new());

    let llm = HttpLlmClient::from_config(&config.llm).map_err(BootstrapError::Llm)?;
    let extractor = LlmFieldExtractor::new(llm);

    let (dispatcher, dispatch_mode): (Arc<dyn BookingDispatcher>, DispatchMode) =
        match WebhookDispatcher::from_config(&config.dispatch)
            .map_err(BootstrapError::Dispatcher)?
        {
            Some(webhook) => (Arc::new(webhook), DispatchMode::Webhook),
            None => (Arc::new(NoopDispatcher), DispatchMode::Preview),
        };

    let runtime = Arc::new(IntakeRuntime::new(
        Arc::clone(&store),
        extractor,
        dispatcher,
        ClinicHours::from_config(&config.clinic),
        RuntimeConfig::from_app_config(&config),
    ));

    info!(
        event_name = "system.bootstrap.ready",
        correlation_id = "bootstrap",
        llm_model = %config.llm.model,
        "intake runtime wired"
    );

    Ok(Application { config, store, runtime, dispatch_mode })
}
