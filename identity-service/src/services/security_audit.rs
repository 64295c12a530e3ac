//! Security event recording.
//!
//! Events are traced on the `security` target and appended to the event sink
//! on a spawned task. Callers never wait on, or fail because of, the sink.

use std::sync::Arc;

use super::store::EventSink;
use crate::models::SecurityEvent;

#[derive(Clone)]
pub struct SecurityEventRecorder {
    sink: Arc<dyn EventSink>,
}

impl SecurityEventRecorder {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink }
    }

    fn trace(event: &SecurityEvent) {
        if event.success {
            tracing::info!(
                target: "security",
                event_kind = event.kind.as_str(),
                account_id = event.account_id,
                client_ip = event.client_ip.as_deref(),
                detail = %event.detail,
                "Security event"
            );
        } else {
            tracing::warn!(
                target: "security",
                event_kind = event.kind.as_str(),
                account_id = event.account_id,
                client_ip = event.client_ip.as_deref(),
                detail = %event.detail,
                "Security event"
            );
        }
    }

    /// Fire-and-forget append.
    pub fn record(&self, event: SecurityEvent) {
        Self::trace(&event);
        let sink = self.sink.clone();
        tokio::spawn(async move {
            if let Err(e) = sink.append(&event).await {
                tracing::error!(
                    error = %e,
                    event_kind = event.kind.as_str(),
                    "Failed to append security event"
                );
            }
        });
    }

    /// Awaited append, for callers that need the event durable before replying.
    pub async fn record_and_wait(&self, event: SecurityEvent) {
        Self::trace(&event);
        if let Err(e) = self.sink.append(&event).await {
            tracing::error!(
                error = %e,
                event_kind = event.kind.as_str(),
                "Failed to append security event"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SecurityEventKind;
    use crate::services::memory::InMemoryStore;
    use crate::services::store::StoreError;
    use async_trait::async_trait;

    struct BrokenSink;

    #[async_trait]
    impl EventSink for BrokenSink {
        async fn append(&self, _event: &SecurityEvent) -> Result<(), StoreError> {
            Err(StoreError::Backend(anyhow::anyhow!("sink offline")))
        }
    }

    #[tokio::test]
    async fn awaited_record_lands_in_sink() {
        let store = Arc::new(InMemoryStore::new());
        let recorder = SecurityEventRecorder::new(store.clone());
        recorder
            .record_and_wait(
                SecurityEvent::failed(SecurityEventKind::LoginFailed)
                    .subject("mallory@example.com")
                    .detail("invalid_credentials"),
            )
            .await;

        let events = store.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, SecurityEventKind::LoginFailed);
        assert!(!events[0].success);
    }

    #[tokio::test]
    async fn sink_failure_does_not_propagate() {
        let recorder = SecurityEventRecorder::new(Arc::new(BrokenSink));
        recorder.record(SecurityEvent::succeeded(SecurityEventKind::LoggedOut));
        recorder
            .record_and_wait(SecurityEvent::succeeded(SecurityEventKind::LoggedOut))
            .await;
    }
}
