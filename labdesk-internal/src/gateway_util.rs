use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;

use crate::backend::{InMemoryBackend, PostgrestBackend, SubscriptionSource, UsageSource};
use crate::config_parser::{BackendConfig, Config, NotificationStoreConfig};
use crate::error::{Error, ErrorDetails};
use crate::notification::{
    FileNotificationStore, LogNotifier, MemoryNotificationStore, NotificationStore, Notifier,
    NotifierSet, RedisNotificationStore, WebhookNotifier,
};
use crate::usage_limit::FreemiumLimiter;

/// State for the gateway's axum handlers
#[derive(Clone)]
pub struct AppStateData {
    pub config: Arc<Config>,
    pub limiter: Arc<FreemiumLimiter>,
}
pub type AppState = State<AppStateData>;

impl AppStateData {
    pub async fn new(config: Arc<Config>) -> Result<Self, Error> {
        let (subscriptions, usage) = setup_backend(&config.backend)?;
        let store = setup_notification_store(&config.notifications.store)?;
        let notifiers = setup_notifiers(&config)?;
        let limiter = FreemiumLimiter::new(
            subscriptions,
            usage,
            store,
            notifiers,
            config.limits.clone(),
        );
        Ok(Self::new_with_limiter(config, Arc::new(limiter)))
    }

    pub fn new_with_limiter(config: Arc<Config>, limiter: Arc<FreemiumLimiter>) -> Self {
        Self { config, limiter }
    }
}

type Sources = (Arc<dyn SubscriptionSource>, Arc<dyn UsageSource>);

fn setup_backend(backend: &BackendConfig) -> Result<Sources, Error> {
    match backend {
        BackendConfig::Memory => {
            tracing::warn!("Using the in-memory backend: every tenant starts with no usage");
            let backend = Arc::new(InMemoryBackend::new());
            let subscriptions: Arc<dyn SubscriptionSource> = backend.clone();
            let usage: Arc<dyn UsageSource> = backend;
            Ok((subscriptions, usage))
        }
        BackendConfig::Postgrest {
            url, timeout_ms, ..
        } => {
            let api_key = backend.api_key()?.ok_or_else(|| {
                Error::new(ErrorDetails::AppState {
                    message: "PostgREST backend requires a service key".to_string(),
                })
            })?;
            let backend = Arc::new(PostgrestBackend::new(
                url,
                api_key,
                Duration::from_millis(*timeout_ms),
            )?);
            tracing::info!("Reading usage from PostgREST at {url}");
            let subscriptions: Arc<dyn SubscriptionSource> = backend.clone();
            let usage: Arc<dyn UsageSource> = backend;
            Ok((subscriptions, usage))
        }
    }
}

fn setup_notification_store(
    store: &NotificationStoreConfig,
) -> Result<Arc<dyn NotificationStore>, Error> {
    let store: Arc<dyn NotificationStore> = match store {
        NotificationStoreConfig::Memory => Arc::new(MemoryNotificationStore::new()),
        NotificationStoreConfig::File { path } => {
            tracing::info!("Persisting notification state to `{}`", path.display());
            Arc::new(FileNotificationStore::new(path))
        }
        NotificationStoreConfig::Redis {
            url,
            key_prefix,
            timeout_ms,
        } => Arc::new(RedisNotificationStore::new(
            url,
            key_prefix.clone(),
            Duration::from_millis(*timeout_ms),
        )?),
    };
    Ok(store)
}

fn setup_notifiers(config: &Config) -> Result<NotifierSet, Error> {
    let mut notifiers: Vec<Arc<dyn Notifier>> = vec![Arc::new(LogNotifier)];
    if let Some(url) = &config.notifications.webhook_url {
        notifiers.push(Arc::new(WebhookNotifier::new(
            url.clone(),
            Duration::from_millis(config.notifications.webhook_timeout_ms),
        )?));
        tracing::info!("Delivering usage notifications to webhook {url}");
    }
    Ok(NotifierSet::new(notifiers))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_default_config_builds_state() {
        let state = AppStateData::new(Arc::new(Config::default())).await.unwrap();
        assert_eq!(state.limiter.metrics().evaluations, 0);
    }

    #[test]
    fn test_notifiers_include_webhook_when_configured() {
        let config = Config::load_from_str(
            "[notifications]\nwebhook_url = \"http://127.0.0.1:9/usage\"",
        )
        .unwrap();
        assert_eq!(setup_notifiers(&config).unwrap().len(), 2);
        assert_eq!(setup_notifiers(&Config::default()).unwrap().len(), 1);
    }

    #[test]
    fn test_postgrest_backend_requires_api_key() {
        let config = Config::load_from_str(
            "[backend]\ntype = \"postgrest\"\nurl = \"https://db.example.co\"\napi_key_env = \"LABDESK_TEST_UNSET_SERVICE_KEY\"",
        )
        .unwrap();
        assert!(setup_backend(&config.backend).is_err());
    }
}
