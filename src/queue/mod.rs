//! Message queue contract underpinning both delivery pipelines.
//!
//! The queue is at-least-once: a handler that returns an error causes
//! redelivery with a bumped attempt counter. An ordering key serializes
//! related messages — across every listener sharing the queue, at most one
//! message per key is in flight at any instant. Concrete transports are
//! injected by the host; [`InProcessQueue`] is the in-process reference
//! implementation.

mod memory;

pub use memory::InProcessQueue;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// A message handed to a listener.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    /// Receipt id, unique per enqueue.
    pub id: Uuid,
    /// Opaque payload.
    pub payload: Value,
    /// Serialization tag, if any.
    pub ordering_key: Option<String>,
    /// Zero-based delivery attempt counter, bumped on redelivery.
    pub attempt: u32,
}

/// Options accepted by [`MessageQueue::enqueue`].
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// The message is not eligible for delivery before this delay elapses.
    pub delay: Option<Duration>,
    /// Serializes this message with others carrying the same key.
    pub ordering_key: Option<String>,
}

/// Errors surfaced by queue implementations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The backing transport failed; the operation is retriable.
    #[error("queue transport failure: {source}")]
    Transport {
        /// The underlying transport error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The queue was dropped and accepts no further messages.
    #[error("queue is shut down")]
    Closed,
}

/// Result a handler returns: `Ok` acknowledges the message, `Err` requests
/// redelivery.
pub type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Consumer of queued messages.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Processes one message.
    async fn handle(&self, message: QueueMessage) -> HandlerResult;
}

/// Adapts an async closure into a [`MessageHandler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(QueueMessage) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = HandlerResult> + Send,
{
    async fn handle(&self, message: QueueMessage) -> HandlerResult {
        (self.0)(message).await
    }
}

/// At-least-once, optionally-ordered message queue.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Enqueues one message.
    async fn enqueue(&self, payload: Value, options: EnqueueOptions) -> Result<(), QueueError>;

    /// Enqueues several messages sharing the same options.
    async fn enqueue_many(
        &self,
        payloads: Vec<Value>,
        options: EnqueueOptions,
    ) -> Result<(), QueueError> {
        for payload in payloads {
            self.enqueue(payload, options.clone()).await?;
        }
        Ok(())
    }

    /// Pulls messages and feeds them to `handler` until `cancel` fires.
    ///
    /// Resolves only after the in-flight handler invocation, if any, has
    /// settled. Each message goes to exactly one listener.
    async fn listen(
        &self,
        handler: Arc<dyn MessageHandler>,
        cancel: CancellationToken,
    ) -> Result<(), QueueError>;

    /// Discards all pending state. Intended for test teardown.
    async fn drop_queue(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

/// Shared queue handle.
pub type SharedQueue = Arc<dyn MessageQueue>;
