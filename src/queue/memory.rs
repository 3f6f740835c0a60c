//! In-process queue implementing the contract on tokio primitives.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde_json::Value;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::clock::{SharedClock, SystemClock};

use super::{EnqueueOptions, MessageHandler, MessageQueue, QueueError, QueueMessage};

/// Redelivery backoff applied when a handler fails; pipeline-level retry
/// policies schedule their own, longer delays.
const REDELIVERY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct Pending {
    message: QueueMessage,
    not_before: Option<DateTime<Utc>>,
}

/// Outcome of one pop attempt.
#[derive(Debug)]
enum Popped {
    /// A message was claimed; its ordering key, if any, is now in flight.
    Message(QueueMessage),
    /// Nothing dispatchable; the instant the next scheduled message becomes
    /// eligible, if one exists.
    Empty(Option<DateTime<Utc>>),
}

#[derive(Debug, Default)]
struct State {
    ready: VecDeque<Pending>,
    scheduled: Vec<Pending>,
    keys_in_flight: HashSet<String>,
    closed: bool,
}

/// In-process [`MessageQueue`] for tests and single-node deployments.
///
/// Multiple concurrent `listen` calls share one pending set; the pop is
/// mutex-guarded, so each message reaches exactly one listener. An ordering
/// key is marked in flight when its message is popped and released exactly
/// once when the handler settles.
pub struct InProcessQueue {
    state: Mutex<State>,
    notify: Notify,
    clock: SharedClock,
}

impl InProcessQueue {
    /// Creates an empty queue on the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(SystemClock::shared())
    }

    /// Creates an empty queue on the given clock.
    #[must_use]
    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            clock,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("queue mutex poisoned")
    }

    /// Pops the next dispatchable message, marking its ordering key in
    /// flight. Returns the message, or the instant the next scheduled
    /// message becomes eligible.
    fn try_pop(&self) -> Popped {
        let now = self.clock.now();
        let mut state = self.lock();

        let mut next_wake: Option<DateTime<Utc>> = None;
        let mut still_scheduled = Vec::new();
        let drained: Vec<_> = state.scheduled.drain(..).collect();
        for pending in drained {
            match pending.not_before {
                Some(at) if at > now => {
                    next_wake = Some(next_wake.map_or(at, |cur| cur.min(at)));
                    still_scheduled.push(pending);
                }
                _ => state.ready.push_back(pending),
            }
        }
        state.scheduled = still_scheduled;

        let position = state.ready.iter().position(|pending| {
            pending
                .message
                .ordering_key
                .as_ref()
                .is_none_or(|key| !state.keys_in_flight.contains(key))
        });
        match position {
            Some(index) => {
                let pending = state.ready.remove(index).expect("index in bounds");
                if let Some(key) = &pending.message.ordering_key {
                    state.keys_in_flight.insert(key.clone());
                }
                Popped::Message(pending.message)
            }
            None => Popped::Empty(next_wake),
        }
    }

    /// Settles a dispatched message: the ordering key is released exactly
    /// once, and a failed message is requeued with a bumped attempt.
    fn settle(&self, message: QueueMessage, failed: bool) {
        let mut state = self.lock();
        if let Some(key) = &message.ordering_key {
            state.keys_in_flight.remove(key);
        }
        if failed && !state.closed {
            let not_before = Some(self.clock.now() + delta(REDELIVERY_DELAY));
            state.scheduled.push(Pending {
                message: QueueMessage {
                    attempt: message.attempt + 1,
                    ..message
                },
                not_before,
            });
        }
        drop(state);
        // Wake a listener that may have been blocked on this ordering key.
        self.notify.notify_one();
    }
}

impl Default for InProcessQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

#[async_trait]
impl MessageQueue for InProcessQueue {
    async fn enqueue(&self, payload: Value, options: EnqueueOptions) -> Result<(), QueueError> {
        let not_before = options.delay.map(|d| self.clock.now() + delta(d));
        let message = QueueMessage {
            id: Uuid::new_v4(),
            payload,
            ordering_key: options.ordering_key,
            attempt: 0,
        };
        {
            let mut state = self.lock();
            if state.closed {
                return Err(QueueError::Closed);
            }
            match not_before {
                Some(_) => state.scheduled.push(Pending { message, not_before }),
                None => state.ready.push_back(Pending {
                    message,
                    not_before: None,
                }),
            }
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn listen(
        &self,
        handler: Arc<dyn MessageHandler>,
        cancel: CancellationToken,
    ) -> Result<(), QueueError> {
        loop {
            if cancel.is_cancelled() || self.lock().closed {
                return Ok(());
            }
            match self.try_pop() {
                Popped::Message(message) => {
                    let outcome = handler.handle(message.clone()).await;
                    self.settle(message, outcome.is_err());
                }
                Popped::Empty(next_wake) => {
                    let sleep: std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> =
                        match next_wake {
                            Some(at) => {
                                let wait = (at - self.clock.now())
                                    .to_std()
                                    .unwrap_or(Duration::ZERO);
                                Box::pin(self.clock.sleep(wait))
                            }
                            None => Box::pin(std::future::pending()),
                        };
                    tokio::select! {
                        () = cancel.cancelled() => return Ok(()),
                        () = self.notify.notified() => {}
                        () = sleep => {}
                    }
                }
            }
        }
    }

    async fn drop_queue(&self) -> Result<(), QueueError> {
        {
            let mut state = self.lock();
            state.closed = true;
            state.ready.clear();
            state.scheduled.clear();
            state.keys_in_flight.clear();
        }
        self.notify.notify_waiters();
        Ok(())
    }
}
