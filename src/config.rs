//! Engine configuration.
//!
//! One record covers both pipelines; the [`development`],
//! [`production`], and [`testing`] constructors bake in sensible profiles
//! the way deployments actually differ.
//!
//! [`development`]: FederationConfig::development
//! [`production`]: FederationConfig::production
//! [`testing`]: FederationConfig::testing

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain_types::WorkerCount;
use crate::retry::RetryPolicy;
use crate::sig::DEFAULT_TIME_WINDOW;

/// Configuration record consumed by the federation builder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FederationConfig {
    /// Coalesce recipients onto origin shared inboxes when possible.
    pub prefer_shared_inbox: bool,

    /// Accept inbound activities without verifying signatures. Test only.
    pub skip_signature_verification: bool,

    /// Do not start workers implicitly; the host calls `start_queue`.
    pub manually_start_queue: bool,

    /// Backoff schedule for outbound deliveries.
    pub outbox_retry_policy: RetryPolicy,

    /// Backoff schedule for inbound listener dispatch.
    pub inbox_retry_policy: RetryPolicy,

    /// User-Agent sent on every outgoing request.
    pub user_agent: String,

    /// Permit the document loader to fetch private address ranges.
    pub allow_private_address: bool,

    /// Tolerance around a signature's `created` instant.
    pub time_window: Duration,

    /// Number of queue workers `start_queue` attaches.
    pub worker_count: WorkerCount,

    /// Serialize deliveries to one (key, inbox) pair through the queue's
    /// ordering-key mechanism.
    pub ordered_delivery: bool,

    /// Treat `/users/alice` and `/users/alice/` as the same path.
    pub trailing_slash_insensitive: bool,
}

impl FederationConfig {
    /// Production profile: verification on, per-CPU workers.
    #[must_use]
    pub fn production() -> Self {
        Self {
            prefer_shared_inbox: true,
            skip_signature_verification: false,
            manually_start_queue: false,
            outbox_retry_policy: RetryPolicy::outbound_default(),
            inbox_retry_policy: RetryPolicy::inbound_default(),
            user_agent: default_user_agent(),
            allow_private_address: false,
            time_window: DEFAULT_TIME_WINDOW,
            worker_count: WorkerCount::per_cpu(),
            ordered_delivery: false,
            trailing_slash_insensitive: false,
        }
    }

    /// Development profile: production semantics, fewer workers, private
    /// addresses allowed so a local peer is reachable.
    #[must_use]
    pub fn development() -> Self {
        Self {
            allow_private_address: true,
            worker_count: WorkerCount::default(),
            ..Self::production()
        }
    }

    /// Testing profile: signature verification skipped, queue started
    /// manually, single worker.
    #[must_use]
    pub fn testing() -> Self {
        Self {
            skip_signature_verification: true,
            manually_start_queue: true,
            allow_private_address: true,
            worker_count: WorkerCount::try_new(1).expect("1 is a valid worker count"),
            ..Self::production()
        }
    }
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self::production()
    }
}

fn default_user_agent() -> String {
    concat!("weft/", env!("CARGO_PKG_VERSION")).to_owned()
}
