//! Background queue workers.
//!
//! `start_queue` attaches N listeners to the injected queue; each pops
//! envelopes and dispatches by kind to the inbound or outbound handler.
//! Workers run until the cancellation token fires and drain in-flight
//! handlers before resolving.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::federation::Federation;
use crate::inbound::InboundTask;
use crate::outbound::OutboundTask;
use crate::queue::{HandlerResult, MessageHandler, QueueError, QueueMessage};

/// One queued unit of work, tagged by pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum TaskEnvelope {
    /// Deliver an activity to one inbox.
    Outbound(OutboundTask),
    /// Dispatch a received activity to inbox listeners.
    Inbound(InboundTask),
}

/// Queue handler bridging envelopes into the facade.
struct QueueWorker<T> {
    federation: Federation<T>,
    data: T,
}

#[async_trait]
impl<T> MessageHandler for QueueWorker<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn handle(&self, message: QueueMessage) -> HandlerResult {
        let envelope: TaskEnvelope = match serde_json::from_value(message.payload) {
            Ok(envelope) => envelope,
            Err(error) => {
                // A payload that never parses would redeliver forever; log
                // and acknowledge instead.
                tracing::error!(%error, message_id = %message.id, "dropping unparseable envelope");
                return Ok(());
            }
        };
        self.federation
            .process_queued_task(self.data.clone(), envelope)
            .await
            .map_err(|error| -> Box<dyn std::error::Error + Send + Sync> { Box::new(error) })
    }
}

/// Runs `count` workers until `cancel` fires; resolves once every worker
/// has drained its in-flight handler.
pub(crate) async fn run_workers<T>(
    federation: Federation<T>,
    data: T,
    count: usize,
    cancel: CancellationToken,
) -> Result<(), QueueError>
where
    T: Clone + Send + Sync + 'static,
{
    tracing::info!(workers = count, "starting queue workers");
    let queue = federation.queue();
    let listeners = (0..count).map(|_| {
        let handler: Arc<dyn MessageHandler> = Arc::new(QueueWorker {
            federation: federation.clone(),
            data: data.clone(),
        });
        let queue = Arc::clone(&queue);
        let cancel = cancel.clone();
        async move { queue.listen(handler, cancel).await }
    });
    futures::future::try_join_all(listeners).await?;
    tracing::info!("queue workers drained and stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;
    use url::Url;

    #[test]
    fn envelopes_round_trip_with_kind_tags() {
        let inbound = TaskEnvelope::Inbound(InboundTask {
            recipient: "alice".into(),
            activity: json!({"type": "Create", "id": "https://b.example/c/1"}),
            signing_key_id: None,
            origin: Url::parse("https://a.example").unwrap(),
            trace_context: HashMap::new(),
            attempt: 2,
        });
        let encoded = serde_json::to_value(&inbound).unwrap();
        assert_eq!(encoded["kind"], json!("inbound"));
        assert_eq!(serde_json::from_value::<TaskEnvelope>(encoded).unwrap(), inbound);

        let outbound = TaskEnvelope::Outbound(OutboundTask {
            activity: json!({"type": "Create", "id": "https://a.example/c/1"}),
            activity_id: Url::parse("https://a.example/c/1").unwrap(),
            activity_type: "Create".into(),
            inbox: Url::parse("https://b.example/inbox").unwrap(),
            keys: vec![Url::parse("https://a.example/u/alice#main").unwrap()],
            actor_ids: vec![Url::parse("https://b.example/u/bob").unwrap()],
            shared_inbox: false,
            origin: Url::parse("https://a.example").unwrap(),
            trace_context: HashMap::new(),
            attempt: 0,
        });
        let encoded = serde_json::to_value(&outbound).unwrap();
        assert_eq!(encoded["kind"], json!("outbound"));
        assert_eq!(encoded["sharedInbox"], json!(false));
        assert_eq!(
            serde_json::from_value::<TaskEnvelope>(encoded).unwrap(),
            outbound
        );
    }
}
