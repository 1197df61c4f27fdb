//! Registrar host resolution via DNS SRV

use crate::domain::shared::error::SipError;
use crate::domain::shared::result::Result;
use async_trait::async_trait;
use tracing::{debug, info};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

/// Maps a SIP provider domain to the host the client connects to
#[async_trait]
pub trait RegistrarResolver: Send + Sync {
    async fn resolve_registrar_host(&self, domain: &str) -> Result<String>;
}

/// One SRV answer reduced to what target selection needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvTarget {
    pub priority: u16,
    pub weight: u16,
    pub target: String,
}

/// Lowest priority wins; ties go to the highest weight, then the lexically first target
pub fn select_first_target(records: &[SrvTarget]) -> Option<&SrvTarget> {
    records.iter().min_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then_with(|| b.weight.cmp(&a.weight))
            .then_with(|| a.target.cmp(&b.target))
    })
}

/// `_sip._udp.<domain>` SRV lookup
pub struct SrvRegistrarResolver {
    resolver: TokioAsyncResolver,
}

impl SrvRegistrarResolver {
    /// Resolver using the default upstream configuration
    pub fn new() -> Self {
        Self::with_config(ResolverConfig::default(), ResolverOpts::default())
    }

    pub fn with_config(config: ResolverConfig, opts: ResolverOpts) -> Self {
        Self {
            resolver: TokioAsyncResolver::tokio(config, opts),
        }
    }
}

impl Default for SrvRegistrarResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RegistrarResolver for SrvRegistrarResolver {
    async fn resolve_registrar_host(&self, domain: &str) -> Result<String> {
        let name = format!("_sip._udp.{}", domain);
        debug!("Looking up SRV records for {}", name);

        let lookup = self
            .resolver
            .srv_lookup(name.as_str())
            .await
            .map_err(|e| SipError::Resolve(format!("{}: {}", name, e)))?;

        let records: Vec<SrvTarget> = lookup
            .iter()
            .map(|rec| SrvTarget {
                priority: rec.priority(),
                weight: rec.weight(),
                target: rec.target().to_utf8().trim_end_matches('.').to_string(),
            })
            .collect();

        let host = select_first_target(&records)
            .map(|record| record.target.clone())
            .ok_or_else(|| SipError::Resolve(format!("no SRV records for {}", name)))?;

        info!("Resolved registrar {} to {}", domain, host);
        Ok(host)
    }
}

/// Fixed registrar host, for private PBXs and tests
#[derive(Debug, Clone)]
pub struct StaticRegistrarResolver {
    host: String,
}

impl StaticRegistrarResolver {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }
}

#[async_trait]
impl RegistrarResolver for StaticRegistrarResolver {
    async fn resolve_registrar_host(&self, _domain: &str) -> Result<String> {
        Ok(self.host.clone())
    }
}
