// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Batch delivery: serialize, send and resolve one batch at a time.
//!
//! A batch is delivered event by event, in order. The first failure stops the
//! batch: a serialization failure hands the whole batch back for retry, a send
//! failure leaves it unresolved (or retried, per [`SendFailurePolicy`]). Only a
//! batch whose every event got a `200 OK` is acknowledged.

use hyper::StatusCode;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::{HttpOutputConfig, SendFailurePolicy};
use crate::dialer::Dialer;
use crate::dns_cache::DnsCache;
use crate::error::{BuildError, SendError, SerializationError, TransportError};
use crate::event::{Batch, Event, ShipperInfo};
use crate::observer::Observer;
use crate::request_pool::{RequestPool, RequestSettings};
use crate::serializer::{serializer_from_config, Serializer};
use crate::transport::{Transport, TransportConfig};

/// How a batch ended.
#[derive(Debug)]
pub enum DeliveryOutcome {
    /// Every event was delivered and the batch acknowledged.
    Acked(usize),
    /// Serialization failed; the whole batch went back to the pipeline.
    Retried(usize),
    /// Sending failed part-way; the batch was not acknowledged.
    Failed(usize, SendError),
}

impl DeliveryOutcome {
    pub fn is_acked(&self) -> bool {
        matches!(self, DeliveryOutcome::Acked(_))
    }
}

enum Abort {
    Serialize(SerializationError),
    Send(SendError),
}

pub struct HttpOutput {
    url: String,
    serializer: Box<dyn Serializer>,
    pool: RequestPool,
    transport: Transport,
    observer: Arc<dyn Observer>,
    send_failure_policy: SendFailurePolicy,
}

impl HttpOutput {
    pub fn new(
        config: &HttpOutputConfig,
        info: &ShipperInfo,
        observer: Arc<dyn Observer>,
    ) -> Result<Self, BuildError> {
        let serializer = serializer_from_config(config, info)?;
        let dns_cache = Arc::new(DnsCache::new(config.dns_cache_ttl()));
        Self::with_parts(config, info, serializer, dns_cache, observer)
    }

    /// Builds the output around an explicit serialization strategy and DNS cache.
    pub fn with_parts(
        config: &HttpOutputConfig,
        info: &ShipperInfo,
        serializer: Box<dyn Serializer>,
        dns_cache: Arc<DnsCache>,
        observer: Arc<dyn Observer>,
    ) -> Result<Self, BuildError> {
        config.validate()?;

        let user_agent = config
            .user_agent
            .clone()
            .unwrap_or_else(|| format!("beat {}", info.version));
        let settings = RequestSettings::new(
            &config.url,
            &user_agent,
            config.credentials(),
            config.compression,
            config.keep_alive,
        )?;
        let dialer = Dialer::new(dns_cache, config.dial_timeout());
        let transport = Transport::new(&TransportConfig::from(config), dialer);

        info!("Initialized http output: {config}");

        Ok(HttpOutput {
            url: config.url.clone(),
            serializer,
            pool: RequestPool::new(settings),
            transport,
            observer,
            send_failure_policy: config.send_failure_policy,
        })
    }

    /// Delivers one batch and resolves it through `ack`/`retry` (or neither).
    ///
    /// Never fails: every error is logged and folded into the outcome.
    pub async fn publish<B: Batch>(&self, batch: B) -> DeliveryOutcome {
        let count = batch.events().len();
        self.observer.new_batch(count);

        if count == 0 {
            batch.ack();
            return DeliveryOutcome::Acked(0);
        }

        let abort = self.deliver(batch.events()).await;
        match abort {
            None => {
                batch.ack();
                self.observer.acked(count);
                debug!("Delivered batch of {count} events");
                DeliveryOutcome::Acked(count)
            }
            Some(Abort::Serialize(_)) => {
                let events = batch.events().to_vec();
                batch.retry(events);
                self.observer.failed(count);
                DeliveryOutcome::Retried(count)
            }
            Some(Abort::Send(cause)) => {
                match self.send_failure_policy {
                    SendFailurePolicy::LeaveUnresolved => drop(batch),
                    SendFailurePolicy::RetryBatch => {
                        let events = batch.events().to_vec();
                        batch.retry(events);
                    }
                }
                self.observer.failed(count);
                DeliveryOutcome::Failed(count, cause)
            }
        }
    }

    async fn deliver(&self, events: &[Event]) -> Option<Abort> {
        for event in events {
            let payload = match self.serializer.serialize(event) {
                Ok(payload) => payload,
                Err(e) => {
                    if event.guaranteed {
                        error!("Failed to serialize the event: {e}");
                    } else {
                        warn!("Failed to serialize the event: {e}");
                    }
                    debug!("Failed event: {event:?}");
                    return Some(Abort::Serialize(e));
                }
            };

            if let Err(e) = self.send(&payload).await {
                if event.guaranteed {
                    error!("Writing event to http failed with: {e}");
                } else {
                    warn!("Writing event to http failed with: {e}");
                }
                return Some(Abort::Send(e));
            }
        }
        None
    }

    /// POSTs one serialized event; only `200 OK` counts as delivered.
    pub async fn send(&self, payload: &[u8]) -> Result<(), SendError> {
        let mut request = self.pool.acquire(payload)?;
        let status = self.transport.send(request.to_http_request()).await?;
        self.pool.release(request);

        if status != StatusCode::OK {
            return Err(TransportError::BadStatus(status).into());
        }
        Ok(())
    }

    /// Closes idle keep-alive connections; the output stays usable.
    pub fn close(&self) {
        self.transport.close_idle();
        info!("Closed http output {}", self.url);
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Idle request objects currently held by the pool.
    pub fn pooled_requests(&self) -> usize {
        self.pool.idle_count()
    }
}

impl fmt::Display for HttpOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "http({})", self.url)
    }
}
