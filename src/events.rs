//! In-process early-completion signals
//!
//! Subscriptions are one-shot and keyed by session. A publish wakes every
//! current subscriber for that (session, signal) pair and removes them, so a
//! listener can never fire twice.

use crate::types::{RoundId, SessionId};
use std::collections::HashMap;
use tokio::sync::{oneshot, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    /// Every player in the session has submitted an entry
    AllSubmitted,
    /// Every eligible judge has ranked the entries
    AllJudged,
}

#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<HashMap<(SessionId, Signal), Vec<oneshot::Sender<RoundId>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in the next `signal` for `session_id`.
    ///
    /// The receiver yields the id of the round the signal was published for;
    /// it errors if the subscription is dropped via [`EventBus::unsubscribe`].
    pub async fn subscribe_once(
        &self,
        session_id: &SessionId,
        signal: Signal,
    ) -> oneshot::Receiver<RoundId> {
        let (tx, rx) = oneshot::channel();
        self.subscribers
            .lock()
            .await
            .entry((session_id.clone(), signal))
            .or_default()
            .push(tx);
        rx
    }

    /// Publish `signal` for a round. Returns how many listeners were woken.
    pub async fn publish(&self, session_id: &SessionId, signal: Signal, round_id: &RoundId) -> usize {
        let senders = self
            .subscribers
            .lock()
            .await
            .remove(&(session_id.clone(), signal))
            .unwrap_or_default();

        let mut delivered = 0;
        for tx in senders {
            if tx.send(round_id.clone()).is_ok() {
                delivered += 1;
            }
        }
        tracing::debug!(
            "Published {:?} for session {} (round {}) to {} listener(s)",
            signal,
            session_id,
            round_id,
            delivered
        );
        delivered
    }

    /// Drop pending subscriptions for one signal
    pub async fn unsubscribe(&self, session_id: &SessionId, signal: Signal) {
        self.subscribers
            .lock()
            .await
            .remove(&(session_id.clone(), signal));
    }

    /// Drop every pending subscription of a session
    pub async fn unsubscribe_all(&self, session_id: &SessionId) {
        self.subscribers
            .lock()
            .await
            .retain(|(sid, _), _| sid != session_id);
    }

    pub async fn subscriber_count(&self, session_id: &SessionId, signal: Signal) -> usize {
        self.subscribers
            .lock()
            .await
            .get(&(session_id.clone(), signal))
            .map(Vec::len)
            .unwrap_or(0)
    }
}
