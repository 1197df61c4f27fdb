//! Public IPv4 discovery

use crate::domain::shared::error::SipError;
use crate::domain::shared::result::Result;
use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::{debug, info};

pub const DEFAULT_IP_ECHO_URL: &str = "https://ident.me/";
pub const DEFAULT_IP_ECHO_TIMEOUT: Duration = Duration::from_millis(1500);

/// Source of the externally visible IPv4 address placed in `Contact`
#[async_trait]
pub trait PublicIpResolver: Send + Sync {
    async fn discover_public_ipv4(&self) -> Result<Ipv4Addr>;
}

/// Parse the plain-text body of an IP echo service
pub fn parse_ipv4_body(body: &str) -> Result<Ipv4Addr> {
    body.trim()
        .parse::<Ipv4Addr>()
        .map_err(|e| SipError::PublicIp(format!("not an IPv4 address: {:?} ({})", body.trim(), e)))
}

/// Asks an HTTP echo service such as ident.me
pub struct HttpPublicIpResolver {
    client: reqwest::Client,
    url: String,
}

impl HttpPublicIpResolver {
    pub fn new() -> Result<Self> {
        Self::with_url(DEFAULT_IP_ECHO_URL, DEFAULT_IP_ECHO_TIMEOUT)
    }

    pub fn with_url(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SipError::PublicIp(e.to_string()))?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl PublicIpResolver for HttpPublicIpResolver {
    async fn discover_public_ipv4(&self) -> Result<Ipv4Addr> {
        debug!("Querying {} for public IP", self.url);

        let response = self
            .client
            .get(&self.url)
            .header(reqwest::header::ACCEPT, "text/plain")
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| SipError::PublicIp(e.to_string()))?;

        let body = response
            .text()
            .await
            .map_err(|e| SipError::PublicIp(e.to_string()))?;

        let ip = parse_ipv4_body(&body)?;
        info!("Public IP: {}", ip);
        Ok(ip)
    }
}

/// Fixed address, e.g. behind a known NAT or in tests
#[derive(Debug, Clone, Copy)]
pub struct StaticPublicIp(pub Ipv4Addr);

#[async_trait]
impl PublicIpResolver for StaticPublicIp {
    async fn discover_public_ipv4(&self) -> Result<Ipv4Addr> {
        Ok(self.0)
    }
}
