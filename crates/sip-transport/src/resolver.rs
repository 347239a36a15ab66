//! DNS SRV resolution (RFC 3263) for outbound requests.
//!
//! The resolver is injected into the [`TransportLayer`](crate::TransportLayer)
//! at construction. [`HickoryResolver`] is the production implementation;
//! [`StaticResolver`] serves fixed records for tests and lab setups.

use std::collections::HashMap;
use std::net::IpAddr;

use async_trait::async_trait;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use parking_lot::RwLock;
use sipflow_sip_core::{join_host_port, TransportKind};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::target::Target;

/// One SRV answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvRecord {
    pub priority: u16,
    pub weight: u16,
    pub port: u16,
    /// Target host, possibly with a trailing root dot
    pub target: String,
}

#[async_trait]
pub trait Resolver: Send + Sync {
    /// Look up SRV records for a fully formed `_service._proto.name`
    async fn lookup_srv(&self, name: &str) -> Result<Vec<SrvRecord>>;

    async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>>;
}

/// Resolver backed by `hickory-resolver`
pub struct HickoryResolver {
    inner: TokioAsyncResolver,
}

impl HickoryResolver {
    /// Use the system resolver configuration, falling back to the library
    /// defaults when it cannot be read.
    pub fn new() -> Self {
        let inner = match TokioAsyncResolver::tokio_from_system_conf() {
            Ok(resolver) => resolver,
            Err(e) => {
                warn!("failed to read system resolver configuration, using defaults: {}", e);
                TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
            }
        };
        HickoryResolver { inner }
    }

    pub fn with_config(config: ResolverConfig, opts: ResolverOpts) -> Self {
        HickoryResolver {
            inner: TokioAsyncResolver::tokio(config, opts),
        }
    }
}

impl Default for HickoryResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Resolver for HickoryResolver {
    async fn lookup_srv(&self, name: &str) -> Result<Vec<SrvRecord>> {
        let lookup = self.inner.srv_lookup(name).await.map_err(|e| Error::Resolve {
            target: name.to_string(),
            reason: e.to_string(),
        })?;
        Ok(lookup
            .iter()
            .map(|srv| SrvRecord {
                priority: srv.priority(),
                weight: srv.weight(),
                port: srv.port(),
                target: srv.target().to_utf8(),
            })
            .collect())
    }

    async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>> {
        let lookup = self.inner.lookup_ip(host).await.map_err(|e| Error::Resolve {
            target: host.to_string(),
            reason: e.to_string(),
        })?;
        Ok(lookup.iter().collect())
    }
}

/// Resolver answering from fixed tables
#[derive(Default)]
pub struct StaticResolver {
    srv: RwLock<HashMap<String, Vec<SrvRecord>>>,
    hosts: RwLock<HashMap<String, Vec<IpAddr>>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_srv(&self, name: impl Into<String>, record: SrvRecord) {
        self.srv.write().entry(name.into()).or_default().push(record);
    }

    pub fn add_host(&self, host: impl Into<String>, ip: IpAddr) {
        self.hosts.write().entry(host.into()).or_default().push(ip);
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn lookup_srv(&self, name: &str) -> Result<Vec<SrvRecord>> {
        self.srv.read().get(name).cloned().ok_or_else(|| Error::Resolve {
            target: name.to_string(),
            reason: "no SRV records".to_string(),
        })
    }

    async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>> {
        let host = host.trim_end_matches('.');
        self.hosts.read().get(host).cloned().ok_or_else(|| Error::Resolve {
            target: host.to_string(),
            reason: "no address records".to_string(),
        })
    }
}

/// Resolve `_sip._<proto>.<host>` to an IP target.
///
/// Records are ordered by priority, then by descending weight, and the first
/// one wins. Returns `None` when there is no usable record so the caller can
/// fall back to a plain host lookup.
pub async fn resolve_srv(
    resolver: &dyn Resolver,
    network: TransportKind,
    host: &str,
) -> Option<Target> {
    let name = format!("_sip._{}.{}", network.srv_proto(), host);
    let mut records = match resolver.lookup_srv(&name).await {
        Ok(records) => records,
        Err(e) => {
            debug!("SRV lookup for {} failed: {}", name, e);
            return None;
        }
    };
    records.sort_by(|a, b| a.priority.cmp(&b.priority).then(b.weight.cmp(&a.weight)));
    let record = records.first()?;
    let srv_host = record.target.trim_end_matches('.');

    let ip = match resolver.lookup_ip(srv_host).await {
        Ok(ips) => *ips.first()?,
        Err(e) => {
            debug!("address lookup for SRV target {} failed: {}", srv_host, e);
            return None;
        }
    };
    debug!("resolved {} to {}:{}", name, ip, record.port);
    Some(Target::new(join_host_port(&ip.to_string(), None), Some(record.port)))
}
