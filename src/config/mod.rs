//! Configuration management

use crate::domain::shared::error::SipError;
use crate::domain::shared::result::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_REGISTRAR_PORT: u16 = 5060;

/// Client configuration
///
/// Durations are stored in milliseconds so that TOML files and
/// `SIPPER_*` environment variables stay plain integers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SipConfiguration {
    /// Domain of the SIP provider, e.g. `tel.t-online.de`
    pub registrar: String,
    /// SIP account id, usually the phone number
    pub sip_id: String,
    /// User name for digest authentication
    pub login_user_id: String,
    pub login_password: String,
    pub registrar_port: u16,
    pub connect_timeout_ms: u64,
    /// Bound for each handshake step (401 challenge, 200 OK)
    pub read_timeout_ms: u64,
    /// Wait for an un-REGISTER reply on close
    pub unregister_grace_ms: u64,
    /// `Expires` value of the REGISTER requests, in seconds
    pub register_expires: u32,
    pub user_agent: String,
}

impl Default for SipConfiguration {
    fn default() -> Self {
        Self {
            registrar: String::new(),
            sip_id: String::new(),
            login_user_id: String::new(),
            login_password: String::new(),
            registrar_port: DEFAULT_REGISTRAR_PORT,
            connect_timeout_ms: 2_000,
            read_timeout_ms: 2_000,
            unregister_grace_ms: 100,
            register_expires: 600,
            user_agent: format!("sipper/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl SipConfiguration {
    pub fn new(
        registrar: impl Into<String>,
        sip_id: impl Into<String>,
        login_user_id: impl Into<String>,
        login_password: impl Into<String>,
    ) -> Self {
        Self {
            registrar: registrar.into(),
            sip_id: sip_id.into(),
            login_user_id: login_user_id.into(),
            login_password: login_password.into(),
            ..Self::default()
        }
    }

    /// Load from a TOML file, overridden by `SIPPER_*` environment variables
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()).required(false))
            .add_source(config::Environment::with_prefix("SIPPER"))
            .build()?;

        let configuration: SipConfiguration = settings.try_deserialize()?;
        configuration.validate()?;
        Ok(configuration)
    }

    /// Parse a TOML document
    pub fn from_toml(document: &str) -> Result<Self> {
        let configuration: SipConfiguration =
            toml::from_str(document).map_err(|e| SipError::Config(e.to_string()))?;
        configuration.validate()?;
        Ok(configuration)
    }

    pub fn validate(&self) -> Result<()> {
        if self.registrar.trim().is_empty() {
            return Err(SipError::Config("registrar must not be empty".to_string()));
        }
        if self.sip_id.trim().is_empty() {
            return Err(SipError::Config("sip_id must not be empty".to_string()));
        }
        if self.login_user_id.trim().is_empty() {
            return Err(SipError::Config("login_user_id must not be empty".to_string()));
        }
        if self.connect_timeout_ms == 0 || self.read_timeout_ms == 0 {
            return Err(SipError::Config("timeouts must be greater than zero".to_string()));
        }
        Ok(())
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_registrar_port(mut self, port: u16) -> Self {
        self.registrar_port = port;
        self
    }

    pub fn with_unregister_grace(mut self, grace: Duration) -> Self {
        self.unregister_grace_ms = grace.as_millis() as u64;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn unregister_grace(&self) -> Duration {
        Duration::from_millis(self.unregister_grace_ms)
    }
}
