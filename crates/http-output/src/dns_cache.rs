// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Caching hostname resolver used by the outbound [`crate::dialer::Dialer`].
//!
//! Entries expire lazily: an entry past its deadline is only refreshed by the next
//! caller that needs it, there is no background sweep. Concurrent cold lookups of
//! the same host wait on a per-host gate so that only one of them reaches the
//! system resolver.

use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::Mutex as TokioMutex;
use tokio::time::Instant;
use tracing::debug;

use crate::error::ResolutionError;

pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Source of truth for hostname resolution.
#[async_trait]
pub trait HostLookup: Send + Sync {
    /// Returns every address of `host` in resolver preference order.
    async fn lookup(&self, host: &str) -> io::Result<Vec<IpAddr>>;
}

/// Resolves through the operating system (`getaddrinfo`).
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLookup;

#[async_trait]
impl HostLookup for SystemLookup {
    async fn lookup(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((host, 0)).await?;
        Ok(addrs.map(|addr| addr.ip()).collect())
    }
}

#[derive(Debug, Clone)]
pub struct DnsCacheEntry {
    pub host: String,
    pub addresses: Vec<IpAddr>,
    pub expires_at: Instant,
}

impl DnsCacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

pub struct DnsCache {
    entries: RwLock<HashMap<String, DnsCacheEntry>>,
    inflight: Mutex<HashMap<String, Arc<TokioMutex<()>>>>,
    lookup: Arc<dyn HostLookup>,
    ttl: Duration,
}

impl DnsCache {
    pub fn new(ttl: Duration) -> Self {
        Self::with_lookup(ttl, Arc::new(SystemLookup))
    }

    pub fn with_lookup(ttl: Duration, lookup: Arc<dyn HostLookup>) -> Self {
        DnsCache {
            entries: RwLock::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            lookup,
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Number of cached hosts, expired entries included.
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops the entry for `host` so the next resolution goes to the resolver.
    pub fn invalidate(&self, host: &str) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&host.to_ascii_lowercase());
    }

    /// Resolves `host` (no port) to its candidate addresses, first-try first.
    ///
    /// IP literals are returned as-is. Failed lookups are never cached.
    pub async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, ResolutionError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        let key = host.to_ascii_lowercase();
        if let Some(addresses) = self.cached(&key) {
            return Ok(addresses);
        }

        let gate = self.gate(&key);
        let result = {
            let _guard = gate.lock().await;
            // Another caller may have filled the entry while we waited on the gate.
            match self.cached(&key) {
                Some(addresses) => Ok(addresses),
                None => self.refresh(&key).await,
            }
        };
        self.release_gate(&key, gate);
        result
    }

    fn cached(&self, key: &str) -> Option<Vec<IpAddr>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(key)
            .filter(|entry| !entry.is_expired(Instant::now()))
            .map(|entry| entry.addresses.clone())
    }

    async fn refresh(&self, key: &str) -> Result<Vec<IpAddr>, ResolutionError> {
        debug!("DNS cache miss for {key}, resolving");
        let addresses =
            self.lookup
                .lookup(key)
                .await
                .map_err(|source| ResolutionError::Lookup {
                    host: key.to_string(),
                    source,
                })?;
        if addresses.is_empty() {
            return Err(ResolutionError::NoAddresses {
                host: key.to_string(),
            });
        }

        let entry = DnsCacheEntry {
            host: key.to_string(),
            addresses: addresses.clone(),
            expires_at: Instant::now() + self.ttl,
        };
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), entry);
        debug!("Resolved {key} to {} address(es)", addresses.len());
        Ok(addresses)
    }

    fn gate(&self, key: &str) -> Arc<TokioMutex<()>> {
        let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(inflight.entry(key.to_string()).or_default())
    }

    fn release_gate(&self, key: &str, gate: Arc<TokioMutex<()>>) {
        let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        // The map holds one reference and we hold another; anything above that is a
        // caller still queued on the gate.
        if Arc::strong_count(&gate) <= 2 {
            inflight.remove(key);
        }
    }
}

impl Default for DnsCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}
