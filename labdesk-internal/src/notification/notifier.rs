use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{info, warn};
use url::Url;

use super::{NotificationEvent, Severity};
use crate::error::{Error, ErrorDetails};

/// Outbound delivery of a fired notification
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &'static str;

    async fn notify(&self, event: &NotificationEvent) -> Result<(), Error>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn notify(&self, event: &NotificationEvent) -> Result<(), Error> {
        match event.severity {
            Severity::Alert => info!(
                tenant_id = %event.tenant_id,
                resource = %event.resource,
                threshold = event.threshold.percent(),
                "{}",
                event.title
            ),
            Severity::Critical => warn!(
                tenant_id = %event.tenant_id,
                resource = %event.resource,
                threshold = event.threshold.percent(),
                "{}",
                event.title
            ),
        }
        Ok(())
    }
}

/// POSTs each event as JSON
pub struct WebhookNotifier {
    client: Client,
    url: Url,
}

impl WebhookNotifier {
    pub fn new(url: Url, timeout: Duration) -> Result<Self, Error> {
        let client = Client::builder().timeout(timeout).build().map_err(|e| {
            Error::new(ErrorDetails::NotificationDelivery {
                message: format!("Failed to build webhook client: {e}"),
            })
        })?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn notify(&self, event: &NotificationEvent) -> Result<(), Error> {
        let response = self
            .client
            .post(self.url.clone())
            .json(event)
            .send()
            .await
            .map_err(|e| {
                Error::new(ErrorDetails::NotificationDelivery {
                    message: format!("Webhook request failed: {e}"),
                })
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::new(ErrorDetails::NotificationDelivery {
                message: format!("Webhook responded with {status}"),
            }));
        }
        Ok(())
    }
}

/// Fans each event out to every configured notifier.
#[derive(Clone, Default)]
pub struct NotifierSet {
    notifiers: Vec<Arc<dyn Notifier>>,
}

impl NotifierSet {
    pub fn new(notifiers: Vec<Arc<dyn Notifier>>) -> Self {
        Self { notifiers }
    }

    pub fn len(&self) -> usize {
        self.notifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notifiers.is_empty()
    }

    /// Returns the number of failed deliveries. Failures are logged and otherwise ignored.
    pub async fn deliver(&self, events: &[NotificationEvent]) -> u64 {
        let mut failures = 0;
        for event in events {
            for notifier in &self.notifiers {
                if let Err(e) = notifier.notify(event).await {
                    failures += 1;
                    warn!(
                        tenant_id = %event.tenant_id,
                        notifier = notifier.name(),
                        "Failed to deliver usage notification: {e}"
                    );
                }
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::Threshold;
    use crate::usage_limit::{Limit, PlanId, ResourceKind, ResourceLimit};
    use std::sync::Mutex;
    use tracing_test::traced_test;
    use uuid::Uuid;

    struct Recording(Mutex<Vec<NotificationEvent>>);

    #[async_trait]
    impl Notifier for Recording {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn notify(&self, event: &NotificationEvent) -> Result<(), Error> {
            self.0.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl Notifier for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn notify(&self, _event: &NotificationEvent) -> Result<(), Error> {
            Err(Error::new_without_logging(ErrorDetails::NotificationDelivery {
                message: "unreachable".to_string(),
            }))
        }
    }

    fn event(threshold: Threshold) -> NotificationEvent {
        NotificationEvent::new(
            Uuid::now_v7(),
            PlanId::Free,
            &ResourceLimit {
                resource: ResourceKind::Orders,
                current: 46,
                limit: Limit::Bounded(50),
                percentage: 92.0,
                allowed: true,
                degraded: false,
            },
            threshold,
            "2025-1".to_string(),
        )
    }

    #[tokio::test]
    #[traced_test]
    async fn test_failed_delivery_does_not_stop_others() {
        let recording = Arc::new(Recording(Mutex::new(Vec::new())));
        let notifiers: Vec<Arc<dyn Notifier>> = vec![Arc::new(Failing), recording.clone()];
        let set = NotifierSet::new(notifiers);
        let events = [event(Threshold::Ninety)];

        assert_eq!(set.deliver(&events).await, 1);
        assert_eq!(recording.0.lock().unwrap().len(), 1);
        assert!(logs_contain("Failed to deliver usage notification"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_log_notifier_logs_title() {
        let alert = event(Threshold::Seventy);
        LogNotifier.notify(&alert).await.unwrap();
        assert!(logs_contain("You are approaching your orders limit"));
    }

    #[tokio::test]
    async fn test_webhook_to_closed_port_fails() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let notifier = WebhookNotifier::new(
            Url::parse(&format!("http://{addr}/hooks/usage")).unwrap(),
            Duration::from_millis(500),
        )
        .unwrap();
        assert!(notifier.notify(&event(Threshold::Ninety)).await.is_err());
    }
}
