//! Observer hooks and tracing spans around pipeline events.
//!
//! Observers are host-registered listeners with two optional hooks. Hook
//! failures are logged and never reach the pipelines. The engine
//! additionally emits `activitypub.*` tracing spans carrying activity and
//! inbox attributes.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::Span;
use url::Url;

use crate::activity::Activity;
use crate::federation::Context;

/// Error an observer hook may surface; it is logged, never propagated.
pub type ObserverError = Box<dyn std::error::Error + Send + Sync>;

/// Host-registered listener of engine events.
///
/// Both hooks default to no-ops; implement only what you need.
#[async_trait]
pub trait Observer<T>: Send + Sync
where
    T: Clone + Send + Sync + 'static,
{
    /// Fired after an inbound activity's first successful dispatch.
    async fn on_inbound_activity(
        &self,
        context: &Context<T>,
        activity: &Activity,
    ) -> Result<(), ObserverError> {
        let _ = (context, activity);
        Ok(())
    }

    /// Fired once per outbound enqueue.
    async fn on_outbound_activity(
        &self,
        context: &Context<T>,
        activity: &Activity,
    ) -> Result<(), ObserverError> {
        let _ = (context, activity);
        Ok(())
    }
}

/// Fan-out over the facade's observer list.
pub(crate) async fn notify_inbound<T>(
    observers: &[Arc<dyn Observer<T>>],
    context: &Context<T>,
    activity: &Activity,
) where
    T: Clone + Send + Sync + 'static,
{
    for observer in observers {
        if let Err(error) = observer.on_inbound_activity(context, activity).await {
            tracing::warn!(
                activity_id = ?activity.id().map(Url::as_str),
                %error,
                "inbound observer hook failed",
            );
        }
    }
}

/// Fan-out over the facade's observer list.
pub(crate) async fn notify_outbound<T>(
    observers: &[Arc<dyn Observer<T>>],
    context: &Context<T>,
    activity: &Activity,
) where
    T: Clone + Send + Sync + 'static,
{
    for observer in observers {
        if let Err(error) = observer.on_outbound_activity(context, activity).await {
            tracing::warn!(
                activity_id = ?activity.id().map(Url::as_str),
                %error,
                "outbound observer hook failed",
            );
        }
    }
}

/// Span around one outbound delivery.
pub(crate) fn send_activity_span(
    activity_id: &Url,
    activity_type: &str,
    inbox: &Url,
) -> Span {
    tracing::info_span!(
        "activitypub.send_activity",
        activity_id = %activity_id,
        activity_type = %activity_type,
        inbox = %inbox,
    )
}

/// Span around one inbound receipt.
pub(crate) fn receive_activity_span(activity_id: &Url, activity_type: &str) -> Span {
    tracing::info_span!(
        "activitypub.receive_activity",
        activity_id = %activity_id,
        activity_type = %activity_type,
    )
}
