//! Registration orchestrator
//!
//! Drives one connection through the REGISTER handshake:
//!
//! ```text
//! Disconnected -> SocketOpen -> PreflightSent -> ChallengeReceived
//!              -> LoginSent -> Registered
//! ```
//!
//! Any failure tears the socket down and is returned to the caller as a
//! single error. Nothing is retried.

use super::auth::DigestAuthenticator;
use super::builder::MessageBuilder;
use super::connection::{Connection, RegisteredSipConnection};
use super::matcher::{await_match, ChallengeMatcher, LoginMatcher};
use super::message::SipMethod;
use crate::config::SipConfiguration;
use crate::domain::registration::RegistrationState;
use crate::domain::shared::error::SipError;
use crate::domain::shared::result::Result;
use crate::infrastructure::net::{
    HttpPublicIpResolver, PublicIpResolver, RegistrarResolver, SrvRegistrarResolver,
};
use crate::infrastructure::shutdown::ConnectionRegistry;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{debug, error, info};

/// Nonce count of the single authenticated REGISTER per connection
const LOGIN_NONCE_COUNT: u32 = 1;

pub struct SipClient {
    config: SipConfiguration,
    resolver: Arc<dyn RegistrarResolver>,
    public_ip: Arc<dyn PublicIpResolver>,
    registry: Arc<ConnectionRegistry>,
}

impl SipClient {
    /// Client with DNS SRV resolution and HTTP public IP discovery
    pub fn new(config: SipConfiguration) -> Result<Self> {
        config.validate()?;
        Ok(Self::with_collaborators(
            config,
            Arc::new(SrvRegistrarResolver::new()),
            Arc::new(HttpPublicIpResolver::new()?),
        ))
    }

    pub fn with_collaborators(
        config: SipConfiguration,
        resolver: Arc<dyn RegistrarResolver>,
        public_ip: Arc<dyn PublicIpResolver>,
    ) -> Self {
        Self {
            config,
            resolver,
            public_ip,
            registry: ConnectionRegistry::global(),
        }
    }

    /// Track registrations in `registry` instead of the process-wide one
    pub fn with_registry(mut self, registry: Arc<ConnectionRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn config(&self) -> &SipConfiguration {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Open a socket to the registrar and register.
    ///
    /// The returned handle is tracked by the client's registry until closed.
    pub async fn connect(&self) -> Result<RegisteredSipConnection> {
        let host = self
            .resolver
            .resolve_registrar_host(&self.config.registrar)
            .await?;
        let public_ip = self.public_ip.discover_public_ipv4().await?;
        let stream = self.open_socket(&host).await?;

        let connection = Connection::open(
            stream,
            public_ip,
            MessageBuilder::from_config(&self.config),
            self.config.unregister_grace(),
            self.registry.clone(),
        )?;

        match self.register(&connection).await {
            Ok(()) => {
                let handle = RegisteredSipConnection::new(connection);
                self.registry.register(handle.clone());
                info!(
                    "Registered {} at {} as {}",
                    self.config.sip_id,
                    self.config.registrar,
                    handle.public_ip()
                );
                Ok(handle)
            }
            Err(e) => {
                error!("Registration at {} failed: {}", self.config.registrar, e);
                connection.abort().await;
                Err(e)
            }
        }
    }

    async fn open_socket(&self, host: &str) -> Result<TcpStream> {
        let port = self.config.registrar_port;
        let timeout = self.config.connect_timeout();
        debug!("Connecting to {}:{}", host, port);

        let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| {
                SipError::Connect(format!("{}:{} not reachable within {:?}", host, port, timeout))
            })?
            .map_err(|e| SipError::Connect(format!("{}:{}: {}", host, port, e)))?;

        if let Err(e) = stream.set_nodelay(true) {
            debug!("TCP_NODELAY not set: {}", e);
        }
        Ok(stream)
    }

    async fn register(&self, connection: &Connection) -> Result<()> {
        let identity = connection.identity();
        let builder = connection.builder();
        let router = connection.router();
        let cancel = connection.cancel_token();
        let read_timeout = self.config.read_timeout();

        let preflight_cseq = identity.next_cseq();
        connection
            .send(&builder.register_preflight(identity, preflight_cseq))
            .await?;
        connection.transition(RegistrationState::PreflightSent)?;

        let challenge =
            await_match(router, ChallengeMatcher::new(preflight_cseq), read_timeout, cancel).await?;
        connection.transition(RegistrationState::ChallengeReceived)?;

        let response = DigestAuthenticator::respond(
            &challenge,
            SipMethod::Register.as_str(),
            &builder.registrar_uri(),
            &self.config.login_user_id,
            &self.config.login_password,
            LOGIN_NONCE_COUNT,
        )?;
        let authorization = builder.authorization_value(
            &challenge,
            &self.config.login_user_id,
            &response,
            LOGIN_NONCE_COUNT,
        );

        let login_cseq = identity.next_cseq();
        connection
            .send(&builder.login(identity, login_cseq, &authorization))
            .await?;
        connection.cache_authorization(authorization);
        connection.transition(RegistrationState::LoginSent)?;

        await_match(router, LoginMatcher::new(login_cseq), read_timeout, cancel).await?;
        connection.transition(RegistrationState::Registered)
    }
}
