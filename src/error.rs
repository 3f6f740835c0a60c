//! Crate-level error type aggregating the subsystem errors.

use thiserror::Error;

use crate::activity::ActivityError;
use crate::docloader::LoaderError;
use crate::kv::KvError;
use crate::outbound::DeliveryInfraError;
use crate::queue::QueueError;
use crate::routes::RouterError;
use crate::sig::SigError;

/// Errors surfaced by facade operations.
#[derive(Debug, Error)]
pub enum FederationError {
    /// Route registration or rendering failed.
    #[error(transparent)]
    Router(#[from] RouterError),

    /// The KV store failed.
    #[error(transparent)]
    Kv(#[from] KvError),

    /// The message queue failed.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Signing or verification failed.
    #[error(transparent)]
    Sig(#[from] SigError),

    /// A remote document could not be loaded.
    #[error(transparent)]
    Loader(#[from] LoaderError),

    /// A document could not be interpreted as an activity or actor.
    #[error(transparent)]
    Activity(#[from] ActivityError),

    /// An operation needs a dispatcher that was never registered.
    #[error("no {kind} dispatcher registered")]
    MissingDispatcher {
        /// The missing dispatcher kind.
        kind: &'static str,
    },

    /// A registration was rejected.
    #[error("invalid registration: {reason}")]
    Registration {
        /// Why the registration is invalid.
        reason: String,
    },

    /// A host dispatcher failed.
    #[error("dispatcher failure: {source}")]
    Dispatch {
        /// The dispatcher's error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl From<DeliveryInfraError> for FederationError {
    fn from(error: DeliveryInfraError) -> Self {
        match error {
            DeliveryInfraError::Kv(source) => Self::Kv(source),
            DeliveryInfraError::Queue(source) => Self::Queue(source),
        }
    }
}
