// Routes inbound LDAPMessages to the request that owns their message
// id. One queue per outstanding request; search responses can stack
// several messages before the consumer drains them.
//
// A single mutex guards both the queue map and the terminal failure,
// and wakeups go through per-queue Notify handles whose permits cover
// the deliver-before-await race.

use crate::error::{LdapError, Result};
use crate::protocol::LdapMessage;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

struct PendingQueue {
    messages: VecDeque<LdapMessage>,
    notify: Arc<Notify>,
}

struct DispatchState {
    queues: HashMap<i32, PendingQueue>,
    failure: Option<LdapError>,
}

pub struct RequestDispatcher {
    state: Mutex<DispatchState>,
}

impl Default for RequestDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestDispatcher {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DispatchState {
                queues: HashMap::new(),
                failure: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DispatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a queue for a freshly allocated message id. Must happen
    /// before the request bytes reach the wire, or the response could
    /// arrive with nowhere to go.
    pub fn register(&self, message_id: i32) -> Result<()> {
        let mut state = self.lock();
        if let Some(err) = &state.failure {
            return Err(err.clone());
        }
        if state.queues.contains_key(&message_id) {
            return Err(LdapError::InvalidState(format!(
                "message id {} already has a pending queue",
                message_id
            )));
        }
        state.queues.insert(
            message_id,
            PendingQueue {
                messages: VecDeque::new(),
                notify: Arc::new(Notify::new()),
            },
        );
        Ok(())
    }

    /// Hand an inbound message to its owner. Returns false when no
    /// request owns the id (late arrival after timeout/cancel, or a
    /// server bug); such messages are dropped.
    pub fn deliver(&self, message: LdapMessage) -> bool {
        let mut state = self.lock();
        match state.queues.get_mut(&message.message_id) {
            Some(queue) => {
                queue.messages.push_back(message);
                queue.notify.notify_one();
                true
            }
            None => {
                debug!(message_id = message.message_id, "dropping unroutable message");
                false
            }
        }
    }

    /// Await the next message for `message_id`. On timeout or
    /// cancellation the queue is removed, so stragglers for this id
    /// are discarded on arrival.
    pub async fn wait_for_message(
        &self,
        message_id: i32,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<LdapMessage> {
        let deadline = Instant::now() + timeout;
        loop {
            let notify = {
                let mut state = self.lock();
                let queued = state
                    .queues
                    .get_mut(&message_id)
                    .map(|queue| queue.messages.pop_front());
                if let Some(Some(message)) = queued {
                    return Ok(message);
                }
                if let Some(err) = &state.failure {
                    return Err(err.clone());
                }
                match state.queues.get(&message_id) {
                    Some(queue) => queue.notify.clone(),
                    None => {
                        return Err(LdapError::InvalidState(format!(
                            "no pending queue for message id {}",
                            message_id
                        )))
                    }
                }
            };
            tokio::select! {
                _ = notify.notified() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    self.remove(message_id);
                    return Err(LdapError::Timeout);
                }
                _ = cancel.cancelled() => {
                    // the connection token is cancelled on every driver
                    // exit; a delivered message or the stored terminal
                    // failure must still win over plain Cancelled
                    let mut state = self.lock();
                    if let Some(message) = state
                        .queues
                        .get_mut(&message_id)
                        .and_then(|queue| queue.messages.pop_front())
                    {
                        return Ok(message);
                    }
                    if let Some(err) = state.failure.clone() {
                        state.queues.remove(&message_id);
                        return Err(err);
                    }
                    state.queues.remove(&message_id);
                    return Err(LdapError::Cancelled);
                }
            }
        }
    }

    /// Close a request's queue once its final response was consumed.
    pub fn remove(&self, message_id: i32) {
        self.lock().queues.remove(&message_id);
    }

    /// Terminal connection failure: every current and future waiter
    /// gets a clone of `error`. The first failure wins.
    pub fn fail_all(&self, error: LdapError) {
        let mut state = self.lock();
        if state.failure.is_none() {
            state.failure = Some(error);
        }
        for queue in state.queues.values() {
            // notify_one leaves a permit if the waiter is between its
            // lock release and the await
            queue.notify.notify_one();
        }
    }

    pub fn pending_count(&self) -> usize {
        self.lock().queues.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{LdapResult, ProtocolOp, SearchResultDone};
    use std::sync::Arc;

    fn done_msg(id: i32) -> LdapMessage {
        LdapMessage {
            message_id: id,
            protocol_op: ProtocolOp::SearchResultDone(SearchResultDone {
                result: LdapResult::success(),
            }),
            controls: None,
        }
    }

    fn long_timeout() -> Duration {
        Duration::from_secs(5)
    }

    #[tokio::test]
    async fn delivers_queued_message() {
        let dispatcher = RequestDispatcher::new();
        dispatcher.register(1).unwrap();
        assert!(dispatcher.deliver(done_msg(1)));
        let msg = dispatcher
            .wait_for_message(1, long_timeout(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(msg.message_id, 1);
    }

    #[tokio::test]
    async fn wakes_waiter_on_delivery() {
        let dispatcher = Arc::new(RequestDispatcher::new());
        dispatcher.register(5).unwrap();
        let waiter = {
            let d = dispatcher.clone();
            tokio::spawn(async move {
                d.wait_for_message(5, long_timeout(), &CancellationToken::new())
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert!(dispatcher.deliver(done_msg(5)));
        let msg = waiter.await.unwrap().unwrap();
        assert_eq!(msg.message_id, 5);
    }

    #[tokio::test]
    async fn preserves_delivery_order() {
        let dispatcher = RequestDispatcher::new();
        dispatcher.register(2).unwrap();
        let mut first = done_msg(2);
        first.controls = Some(vec![]);
        dispatcher.deliver(first.clone());
        dispatcher.deliver(done_msg(2));
        let cancel = CancellationToken::new();
        let a = dispatcher
            .wait_for_message(2, long_timeout(), &cancel)
            .await
            .unwrap();
        let b = dispatcher
            .wait_for_message(2, long_timeout(), &cancel)
            .await
            .unwrap();
        assert_eq!(a, first);
        assert_eq!(b, done_msg(2));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_removes_queue() {
        let dispatcher = RequestDispatcher::new();
        dispatcher.register(3).unwrap();
        let err = dispatcher
            .wait_for_message(3, Duration::from_millis(50), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, LdapError::Timeout);
        // late arrival has nowhere to go
        assert!(!dispatcher.deliver(done_msg(3)));
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn cancellation_removes_queue() {
        let dispatcher = Arc::new(RequestDispatcher::new());
        dispatcher.register(4).unwrap();
        let cancel = CancellationToken::new();
        let waiter = {
            let d = dispatcher.clone();
            let c = cancel.clone();
            tokio::spawn(async move { d.wait_for_message(4, long_timeout(), &c).await })
        };
        tokio::task::yield_now().await;
        cancel.cancel();
        assert_eq!(waiter.await.unwrap().unwrap_err(), LdapError::Cancelled);
        assert!(!dispatcher.deliver(done_msg(4)));
    }

    #[tokio::test]
    async fn fail_all_fans_out_to_every_waiter() {
        let dispatcher = Arc::new(RequestDispatcher::new());
        let mut waiters = Vec::new();
        for id in 1..=3 {
            dispatcher.register(id).unwrap();
            let d = dispatcher.clone();
            waiters.push(tokio::spawn(async move {
                d.wait_for_message(id, long_timeout(), &CancellationToken::new())
                    .await
            }));
        }
        tokio::task::yield_now().await;
        dispatcher.fail_all(LdapError::ConnectionClosed("peer went away".to_string()));
        for waiter in waiters {
            assert_eq!(
                waiter.await.unwrap().unwrap_err(),
                LdapError::ConnectionClosed("peer went away".to_string())
            );
        }
    }

    #[tokio::test]
    async fn first_failure_wins() {
        let dispatcher = RequestDispatcher::new();
        dispatcher.fail_all(LdapError::Timeout);
        dispatcher.fail_all(LdapError::Cancelled);
        assert_eq!(dispatcher.register(1).unwrap_err(), LdapError::Timeout);
    }

    #[tokio::test]
    async fn queued_message_beats_failure() {
        let dispatcher = RequestDispatcher::new();
        dispatcher.register(9).unwrap();
        dispatcher.deliver(done_msg(9));
        dispatcher.fail_all(LdapError::ConnectionClosed("eof".to_string()));
        // the already-delivered response is still consumable
        let msg = dispatcher
            .wait_for_message(9, long_timeout(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(msg.message_id, 9);
        // after draining, the failure surfaces
        let err = dispatcher
            .wait_for_message(9, long_timeout(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LdapError::ConnectionClosed(_)));
    }

    #[tokio::test]
    async fn delivered_message_survives_cancelled_token() {
        // the transport driver cancels the shared token right after
        // fail_all; neither the queued message nor the stored failure
        // may be masked by Cancelled
        let dispatcher = RequestDispatcher::new();
        dispatcher.register(6).unwrap();
        dispatcher.deliver(done_msg(6));
        dispatcher.fail_all(LdapError::ConnectionClosed("eof".to_string()));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let msg = dispatcher
            .wait_for_message(6, long_timeout(), &cancel)
            .await
            .unwrap();
        assert_eq!(msg.message_id, 6);
        let err = dispatcher
            .wait_for_message(6, long_timeout(), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, LdapError::ConnectionClosed("eof".to_string()));
    }

    #[tokio::test]
    async fn parked_waiter_sees_failure_not_cancelled() {
        let dispatcher = Arc::new(RequestDispatcher::new());
        dispatcher.register(8).unwrap();
        let cancel = CancellationToken::new();
        let waiter = {
            let d = dispatcher.clone();
            let c = cancel.clone();
            tokio::spawn(async move { d.wait_for_message(8, long_timeout(), &c).await })
        };
        tokio::task::yield_now().await;
        // driver failure path: fail_all then cancel, back to back
        dispatcher.fail_all(LdapError::ConnectionClosed("peer went away".to_string()));
        cancel.cancel();
        assert_eq!(
            waiter.await.unwrap().unwrap_err(),
            LdapError::ConnectionClosed("peer went away".to_string())
        );
    }

    #[tokio::test]
    async fn duplicate_register_rejected() {
        let dispatcher = RequestDispatcher::new();
        dispatcher.register(7).unwrap();
        assert!(matches!(
            dispatcher.register(7),
            Err(LdapError::InvalidState(_))
        ));
    }
}
