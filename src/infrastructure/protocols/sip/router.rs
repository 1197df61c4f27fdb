//! Message router - mailbox for every framed inbound message
//!
//! Each message is appended to an ordered queue consulted by the handshake
//! matchers. INVITEs are additionally fanned out to the registered
//! listeners, each on its own task.

use super::connection::WeakConnection;
use super::handler::{SipEventHandler, SipInviteEvent};
use super::message::{RawMessage, SipMethod};
use futures::FutureExt;
use std::collections::{HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{debug, error, trace, warn};

/// Oldest queued messages are discarded beyond this depth
pub const MAX_QUEUED_MESSAGES: usize = 256;

/// Listener compared by identity, so registering the same `Arc` twice is a no-op
#[derive(Clone)]
struct ListenerRef(Arc<dyn SipEventHandler>);

impl ListenerRef {
    fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

impl PartialEq for ListenerRef {
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

impl Eq for ListenerRef {}

impl Hash for ListenerRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

pub struct MessageRouter {
    queue: Mutex<VecDeque<RawMessage>>,
    arrived: Notify,
    listeners: RwLock<HashSet<ListenerRef>>,
    connection: OnceLock<WeakConnection>,
    dispatches: Mutex<JoinSet<()>>,
    closed: AtomicBool,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            arrived: Notify::new(),
            listeners: RwLock::new(HashSet::new()),
            connection: OnceLock::new(),
            dispatches: Mutex::new(JoinSet::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Bind the connection handed to listeners. Only the first call has effect.
    pub(crate) fn attach(&self, connection: WeakConnection) {
        if self.connection.set(connection).is_err() {
            debug!("Router already attached to a connection");
        }
    }

    /// Accept one framed message. Never waits on listeners.
    pub fn route(&self, message: RawMessage) {
        if self.closed.load(Ordering::Acquire) {
            trace!("Router closed, dropping message: {}", message.start_line());
            return;
        }

        if message.is_method(SipMethod::Invite) && !message.is_response() {
            self.dispatch_invite(&message);
        }

        {
            let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            if queue.len() >= MAX_QUEUED_MESSAGES {
                if let Some(dropped) = queue.pop_front() {
                    debug!("Queue full, discarding oldest message: {}", dropped.start_line());
                }
            }
            queue.push_back(message);
        }

        self.arrived.notify_waiters();
    }

    /// Point-in-time copy of the queue
    pub fn get_messages(&self) -> Vec<RawMessage> {
        let queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.iter().cloned().collect()
    }

    /// Remove one occurrence of `message`
    pub fn remove(&self, message: &RawMessage) -> bool {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        match queue.iter().position(|queued| queued == message) {
            Some(index) => {
                queue.remove(index);
                true
            }
            None => false,
        }
    }

    /// Remove and return the first queued message matching `predicate`
    pub fn take_first<F>(&self, predicate: F) -> Option<RawMessage>
    where
        F: Fn(&RawMessage) -> bool,
    {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        let index = queue.iter().position(|message| predicate(message))?;
        queue.remove(index)
    }

    /// Future resolved by the next `route` call or by `shutdown`
    pub fn arrived(&self) -> Notified<'_> {
        self.arrived.notified()
    }

    /// Add a listener; returns `false` if it was already registered
    pub fn add_listener(&self, listener: Arc<dyn SipEventHandler>) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        listeners.insert(ListenerRef(listener))
    }

    /// Replace the listener set wholesale
    pub fn set_listeners<I>(&self, listeners: I)
    where
        I: IntoIterator<Item = Arc<dyn SipEventHandler>>,
    {
        let replacement: HashSet<ListenerRef> = listeners.into_iter().map(ListenerRef).collect();
        let mut current = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        *current = replacement;
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop accepting messages and abort in-flight listener dispatches
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut dispatches = self.dispatches.lock().unwrap_or_else(|e| e.into_inner());
        dispatches.abort_all();
        self.arrived.notify_waiters();
        debug!("Router shut down");
    }

    fn dispatch_invite(&self, message: &RawMessage) {
        let invite = match SipInviteEvent::try_from(message) {
            Ok(invite) => invite,
            Err(e) => {
                warn!("Not dispatching INVITE: {}", e);
                return;
            }
        };

        let Some(connection) = self.connection.get().and_then(WeakConnection::upgrade) else {
            debug!("INVITE {} arrived before registration, not dispatched", invite.call_id);
            return;
        };

        let listeners: Vec<ListenerRef> = {
            let listeners = self.listeners.read().unwrap_or_else(|e| e.into_inner());
            listeners.iter().cloned().collect()
        };

        let mut dispatches = self.dispatches.lock().unwrap_or_else(|e| e.into_inner());
        // reap finished dispatches
        while dispatches.try_join_next().is_some() {}

        for listener in listeners {
            let connection = connection.clone();
            let invite = invite.clone();
            dispatches.spawn(async move {
                trace!("RING RING to listener {:#x}", listener.addr());
                let outcome = AssertUnwindSafe(listener.0.on_ring(connection, invite.clone()))
                    .catch_unwind()
                    .await;

                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        error!("Listener failed on INVITE {}: {:#}", invite.call_id, e);
                    }
                    Err(_) => {
                        error!("Listener panicked on INVITE {}", invite.call_id);
                    }
                }
            });
        }
    }
}

impl Default for MessageRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(cseq: u32, status: &str) -> RawMessage {
        RawMessage::parse(format!("SIP/2.0 {}\nCSeq: {} REGISTER\n\n", status, cseq)).unwrap()
    }

    #[test]
    fn test_queue_keeps_arrival_order() {
        let router = MessageRouter::new();
        router.route(response(10, "401 Unauthorized"));
        router.route(response(11, "200 OK"));

        let queued = router.get_messages();
        assert_eq!(queued.len(), 2);
        assert_eq!(queued[0].cseq(), Some(10));
        assert_eq!(queued[1].cseq(), Some(11));
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let router = MessageRouter::new();
        router.route(response(10, "401 Unauthorized"));

        let snapshot = router.get_messages();
        router.route(response(11, "200 OK"));

        assert_eq!(snapshot.len(), 1);
        assert_eq!(router.get_messages().len(), 2);
    }

    #[test]
    fn test_remove_deletes_one_occurrence() {
        let router = MessageRouter::new();
        let message = response(10, "401 Unauthorized");
        router.route(message.clone());
        router.route(message.clone());

        assert!(router.remove(&message));
        assert_eq!(router.get_messages().len(), 1);
        assert!(router.remove(&message));
        assert!(!router.remove(&message));
    }

    #[test]
    fn test_take_first_matching() {
        let router = MessageRouter::new();
        router.route(response(10, "401 Unauthorized"));
        router.route(response(11, "200 OK"));

        let ok = router.take_first(|m| m.status_code() == Some(200)).unwrap();
        assert_eq!(ok.cseq(), Some(11));
        assert!(router.take_first(|m| m.status_code() == Some(200)).is_none());
        assert_eq!(router.get_messages().len(), 1);
    }

    #[test]
    fn test_queue_is_bounded() {
        let router = MessageRouter::new();
        for cseq in 0..(MAX_QUEUED_MESSAGES as u32 + 5) {
            router.route(response(cseq, "200 OK"));
        }

        let queued = router.get_messages();
        assert_eq!(queued.len(), MAX_QUEUED_MESSAGES);
        assert_eq!(queued[0].cseq(), Some(5));
    }

    #[test]
    fn test_closed_router_drops_messages() {
        let router = MessageRouter::new();
        router.shutdown();
        router.route(response(10, "200 OK"));

        assert!(router.is_closed());
        assert!(router.get_messages().is_empty());
    }

    struct Noop;

    #[async_trait::async_trait]
    impl SipEventHandler for Noop {
        async fn on_ring(
            &self,
            _connection: super::super::connection::RegisteredSipConnection,
            _invite: SipInviteEvent,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_duplicate_listener_is_noop() {
        let router = MessageRouter::new();
        let listener: Arc<dyn SipEventHandler> = Arc::new(Noop);

        assert!(router.add_listener(listener.clone()));
        assert!(!router.add_listener(listener.clone()));
        assert!(router.add_listener(Arc::new(Noop)));
        assert_eq!(router.listener_count(), 2);

        router.set_listeners(vec![listener]);
        assert_eq!(router.listener_count(), 1);
    }
}
