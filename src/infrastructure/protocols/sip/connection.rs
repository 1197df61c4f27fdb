//! Connection handle - socket, writer, reader task and per-connection identity

use super::builder::MessageBuilder;
use super::framer::run_reader;
use super::handler::{SipEventHandler, SipInviteEvent};
use super::matcher::{await_match, LoginMatcher};
use super::router::MessageRouter;
use crate::domain::registration::RegistrationState;
use crate::domain::shared::error::SipError;
use crate::domain::shared::result::Result;
use crate::infrastructure::shutdown::ConnectionRegistry;
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::RngCore;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// First CSeq number used on a connection
pub const INITIAL_CSEQ: u32 = 10;

fn random_token() -> String {
    let mut bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE.encode(bytes)
}

/// Identity of one connection attempt: dialog identifiers, addresses and
/// the CSeq counter
#[derive(Debug)]
pub struct ConnectionIdentity {
    id: Uuid,
    tag: String,
    call_id: String,
    local_addr: SocketAddr,
    public_ip: Ipv4Addr,
    cseq: AtomicU32,
}

impl ConnectionIdentity {
    /// Fresh random tag and Call-ID
    pub fn generate(local_addr: SocketAddr, public_ip: Ipv4Addr) -> Self {
        Self::with_values(random_token(), random_token(), local_addr, public_ip)
    }

    pub fn with_values(
        tag: impl Into<String>,
        call_id: impl Into<String>,
        local_addr: SocketAddr,
        public_ip: Ipv4Addr,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tag: tag.into(),
            call_id: call_id.into(),
            local_addr,
            public_ip,
            cseq: AtomicU32::new(INITIAL_CSEQ),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn public_ip(&self) -> Ipv4Addr {
        self.public_ip
    }

    /// Take the next CSeq number; every call returns a distinct value
    pub fn next_cseq(&self) -> u32 {
        self.cseq.fetch_add(1, Ordering::AcqRel)
    }
}

/// Shared state behind every handle of one connection
pub(crate) struct Connection {
    identity: ConnectionIdentity,
    builder: MessageBuilder,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    router: Arc<MessageRouter>,
    cancel: CancellationToken,
    reader: Mutex<Option<JoinHandle<()>>>,
    authorization: OnceLock<String>,
    state: Mutex<RegistrationState>,
    registered_at: OnceLock<DateTime<Utc>>,
    closing: AtomicBool,
    unregister_grace: Duration,
    registry: Arc<ConnectionRegistry>,
}

impl Connection {
    /// Split the socket, start the reader task and bind the router
    pub(crate) fn open(
        stream: TcpStream,
        public_ip: Ipv4Addr,
        builder: MessageBuilder,
        unregister_grace: Duration,
        registry: Arc<ConnectionRegistry>,
    ) -> Result<Arc<Self>> {
        let local_addr = stream.local_addr()?;
        let (read_half, write_half) = stream.into_split();

        let identity = ConnectionIdentity::generate(local_addr, public_ip);
        let router = Arc::new(MessageRouter::new());
        let cancel = CancellationToken::new();

        let connection = Arc::new(Self {
            identity,
            builder,
            writer: tokio::sync::Mutex::new(write_half),
            router: router.clone(),
            cancel: cancel.clone(),
            reader: Mutex::new(None),
            authorization: OnceLock::new(),
            state: Mutex::new(RegistrationState::Disconnected),
            registered_at: OnceLock::new(),
            closing: AtomicBool::new(false),
            unregister_grace,
            registry,
        });
        router.attach(WeakConnection(Arc::downgrade(&connection)));

        let id = connection.identity.id();
        let reader = tokio::spawn(async move {
            match run_reader(read_half, router, cancel.clone()).await {
                Ok(()) => debug!("Reader for connection {} finished", id),
                Err(e) => error!("Reader for connection {} failed: {}", id, e),
            }
            // no more replies can arrive; wake any waiting matcher
            cancel.cancel();
        });
        *connection.reader.lock().unwrap_or_else(|e| e.into_inner()) = Some(reader);

        connection.transition(RegistrationState::SocketOpen)?;
        Ok(connection)
    }

    pub(crate) fn identity(&self) -> &ConnectionIdentity {
        &self.identity
    }

    pub(crate) fn builder(&self) -> &MessageBuilder {
        &self.builder
    }

    pub(crate) fn router(&self) -> &MessageRouter {
        &self.router
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn state(&self) -> RegistrationState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn transition(&self, next: RegistrationState) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let previous = *state;
        *state = previous.transition(next)?;
        info!("Connection {}: {} -> {}", self.identity.id(), previous, next);

        if next == RegistrationState::Registered {
            let _ = self.registered_at.set(Utc::now());
        }
        Ok(())
    }

    /// Cache the login `Authorization` value for the un-REGISTER
    pub(crate) fn cache_authorization(&self, authorization: String) {
        if self.authorization.set(authorization).is_err() {
            warn!("Authorization already cached for connection {}", self.identity.id());
        }
    }

    fn is_connected(&self) -> bool {
        !self.cancel.is_cancelled() && !self.closing.load(Ordering::Acquire)
    }

    /// Write one complete message; concurrent writers never interleave
    pub(crate) async fn send(&self, message: &str) -> Result<()> {
        if self.closing.load(Ordering::Acquire) {
            return Err(SipError::NotRegistered);
        }

        trace!("Sending message:\n[{}]", message);
        let mut writer = self.writer.lock().await;
        writer.write_all(message.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Best-effort un-REGISTER followed by teardown. Safe to call repeatedly.
    ///
    /// The work runs on its own task, so a listener that closes the
    /// connection from `on_ring` cannot cut it short when the router aborts
    /// its dispatches.
    pub(crate) async fn close(self: &Arc<Self>) {
        if self.closing.swap(true, Ordering::AcqRel) {
            debug!("Connection {} already closing", self.identity.id());
            return;
        }

        let connection = self.clone();
        self.finish(async move {
            if connection.state().is_registered() && !connection.cancel.is_cancelled() {
                connection.unregister().await;
            }
            connection.teardown().await;
        })
        .await;
    }

    /// Teardown without un-REGISTER, used when the handshake fails
    pub(crate) async fn abort(self: &Arc<Self>) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }

        let connection = self.clone();
        self.finish(async move { connection.teardown().await }).await;
    }

    async fn finish<F>(&self, work: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        if let Err(e) = tokio::spawn(work).await {
            warn!("Teardown of connection {} failed: {}", self.identity.id(), e);
        }
    }

    async fn unregister(&self) {
        if let Err(e) = self.transition(RegistrationState::Unregistering) {
            warn!("{}", e);
            return;
        }

        let cseq = self.identity.next_cseq();
        let message = self.builder.unregister(
            &self.identity,
            cseq,
            self.authorization.get().map(String::as_str),
        );

        trace!("Sending message:\n[{}]", message);
        let written = tokio::time::timeout(self.unregister_grace, async {
            let mut writer = self.writer.lock().await;
            writer.write_all(message.as_bytes()).await?;
            writer.flush().await
        })
        .await;
        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("Could not send un-REGISTER: {}", e);
                return;
            }
            Err(_) => {
                warn!("Writer busy, un-REGISTER not sent");
                return;
            }
        }

        match await_match(&self.router, LoginMatcher::new(cseq), self.unregister_grace, &self.cancel).await {
            Ok(()) => info!("Unregistered connection {}", self.identity.id()),
            Err(e) => debug!("No un-REGISTER confirmation: {}", e),
        }
    }

    async fn teardown(&self) {
        self.cancel.cancel();
        self.router.shutdown();

        let reader = self.reader.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(reader) = reader {
            if let Err(e) = reader.await {
                debug!("Reader task ended abnormally: {}", e);
            }
        }

        let shutdown = tokio::time::timeout(self.unregister_grace, async {
            self.writer.lock().await.shutdown().await
        })
        .await;
        match shutdown {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Socket shutdown: {}", e),
            // the write half closes when the connection is dropped
            Err(_) => warn!("Writer busy, socket shutdown skipped for {}", self.identity.id()),
        }

        self.registry.deregister(self.identity.id());
        if let Err(e) = self.transition(RegistrationState::Closed) {
            debug!("{}", e);
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Handle to a registered connection; clones share the same socket
#[derive(Clone)]
pub struct RegisteredSipConnection {
    inner: Arc<Connection>,
}

impl RegisteredSipConnection {
    pub(crate) fn new(inner: Arc<Connection>) -> Self {
        Self { inner }
    }

    /// Add an INVITE listener; returns `false` if it was already registered
    pub fn listen(&self, listener: Arc<dyn SipEventHandler>) -> bool {
        self.inner.router.add_listener(listener)
    }

    /// Replace all INVITE listeners
    pub fn set_listeners<I>(&self, listeners: I)
    where
        I: IntoIterator<Item = Arc<dyn SipEventHandler>>,
    {
        self.inner.router.set_listeners(listeners)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    pub fn is_registered(&self) -> bool {
        self.is_connected() && self.inner.state().is_registered()
    }

    pub fn public_ip(&self) -> Ipv4Addr {
        self.inner.identity.public_ip()
    }

    pub fn identity(&self) -> &ConnectionIdentity {
        &self.inner.identity
    }

    pub fn state(&self) -> RegistrationState {
        self.inner.state()
    }

    pub fn registered_at(&self) -> Option<DateTime<Utc>> {
        self.inner.registered_at.get().copied()
    }

    /// Reject an inbound call with `486 Busy Here`
    pub async fn send_busy(&self, invite: &SipInviteEvent) -> Result<()> {
        self.ensure_registered()?;
        let reply = self.inner.builder.busy(invite, self.inner.identity.tag());
        self.inner.send(&reply).await?;
        info!("Sent 486 Busy Here for call {}", invite.call_id);
        Ok(())
    }

    /// Signal an inbound call with `180 Ringing`
    pub async fn send_ringing(&self, invite: &SipInviteEvent) -> Result<()> {
        self.ensure_registered()?;
        let reply = self.inner.builder.ringing(invite, self.inner.identity.tag());
        self.inner.send(&reply).await?;
        info!("Sent 180 Ringing for call {}", invite.call_id);
        Ok(())
    }

    /// Un-REGISTER and close the socket. A second call does nothing.
    pub async fn close(&self) {
        self.inner.close().await
    }

    fn ensure_registered(&self) -> Result<()> {
        if self.is_registered() {
            Ok(())
        } else {
            Err(SipError::NotRegistered)
        }
    }
}

impl std::fmt::Debug for RegisteredSipConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredSipConnection")
            .field("id", &self.inner.identity.id())
            .field("state", &self.inner.state())
            .field("public_ip", &self.inner.identity.public_ip())
            .finish()
    }
}

/// Non-owning reference held by the router, so the router never keeps
/// its connection alive
#[derive(Clone)]
pub(crate) struct WeakConnection(Weak<Connection>);

impl WeakConnection {
    /// Handle for listeners, only while the connection is registered
    pub(crate) fn upgrade(&self) -> Option<RegisteredSipConnection> {
        let inner = self.0.upgrade()?;
        if inner.state().is_registered() {
            Some(RegisteredSipConnection::new(inner))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::protocols::sip::matcher::ChallengeMatcher;
    use std::collections::HashSet;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn open_loopback(grace: Duration) -> (Arc<Connection>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        let connection = Connection::open(
            client,
            Ipv4Addr::LOCALHOST,
            MessageBuilder::new("sip.example.com", "+4912345", "sipper/test", 600),
            grace,
            Arc::new(ConnectionRegistry::new()),
        )
        .unwrap();
        (connection, server)
    }

    fn mark_registered(connection: &Connection) {
        for state in [
            RegistrationState::PreflightSent,
            RegistrationState::ChallengeReceived,
            RegistrationState::LoginSent,
            RegistrationState::Registered,
        ] {
            connection.transition(state).unwrap();
        }
    }

    #[tokio::test]
    async fn test_abort_cancels_waiting_matcher() {
        let (connection, _server) = open_loopback(Duration::from_millis(100)).await;

        let waiting = connection.clone();
        let matcher = tokio::spawn(async move {
            await_match(
                waiting.router(),
                ChallengeMatcher::new(10),
                Duration::from_secs(10),
                waiting.cancel_token(),
            )
            .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        connection.abort().await;

        let result = tokio::time::timeout(Duration::from_secs(1), matcher)
            .await
            .expect("matcher still waiting")
            .unwrap();
        assert!(matches!(result, Err(SipError::Cancelled(_))));
        assert_eq!(connection.state(), RegistrationState::Closed);
    }

    #[tokio::test]
    async fn test_close_returns_when_peer_hangs_up_during_grace() {
        let (connection, mut server) = open_loopback(Duration::from_secs(30)).await;
        mark_registered(&connection);

        let closing = connection.clone();
        let close = tokio::spawn(async move { closing.close().await });

        // read the un-REGISTER, then hang up without answering
        let mut received = Vec::new();
        let mut buf = [0u8; 1024];
        while !received.windows(4).any(|w| w == b"\r\n\r\n") {
            let read = server.read(&mut buf).await.unwrap();
            assert!(read > 0, "client hung up first");
            received.extend_from_slice(&buf[..read]);
        }
        assert!(String::from_utf8_lossy(&received).contains("Expires: 0"));
        drop(server);

        tokio::time::timeout(Duration::from_secs(2), close)
            .await
            .expect("close blocked on the un-REGISTER reply")
            .unwrap();
        assert_eq!(connection.state(), RegistrationState::Closed);
        assert!(!connection.is_connected());
    }

    #[tokio::test]
    async fn test_close_does_not_wait_on_a_held_writer() {
        let (connection, _server) = open_loopback(Duration::from_millis(100)).await;
        mark_registered(&connection);

        let writer = connection.writer.lock().await;
        tokio::time::timeout(Duration::from_secs(1), connection.close())
            .await
            .expect("close blocked on the writer lock");
        drop(writer);

        assert_eq!(connection.state(), RegistrationState::Closed);
        assert!(connection.registry.is_empty());
    }

    fn identity() -> ConnectionIdentity {
        ConnectionIdentity::generate("127.0.0.1:5070".parse().unwrap(), Ipv4Addr::LOCALHOST)
    }

    #[test]
    fn test_cseq_starts_at_ten_and_increments() {
        let identity = identity();
        assert_eq!(identity.next_cseq(), 10);
        assert_eq!(identity.next_cseq(), 11);
        assert_eq!(identity.next_cseq(), 12);
    }

    #[test]
    fn test_cseq_is_unique_across_threads() {
        let identity = Arc::new(identity());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let identity = identity.clone();
                std::thread::spawn(move || (0..100).map(|_| identity.next_cseq()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for cseq in handle.join().unwrap() {
                assert!(seen.insert(cseq));
            }
        }
        assert_eq!(seen.len(), 400);
        assert_eq!(seen.iter().min(), Some(&10));
        assert_eq!(seen.iter().max(), Some(&409));
    }

    #[test]
    fn test_generated_identifiers_are_url_safe() {
        let identity = identity();
        assert_eq!(identity.tag().len(), 16);
        assert_eq!(identity.call_id().len(), 16);
        assert_ne!(identity.tag(), identity.call_id());
        assert!(identity
            .tag()
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }
}
