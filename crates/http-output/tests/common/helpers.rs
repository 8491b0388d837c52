// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helper functions for building events and outputs in tests

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use http_output::config::HttpOutputConfig;
use http_output::dns_cache::{DnsCache, HostLookup};
use http_output::event::{Event, ShipperInfo};
use http_output::observer::CountingObserver;
use http_output::publisher::HttpOutput;
use http_output::serializer::serializer_from_config;
use serde_json::Value;
use std::io;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub fn shipper_info() -> ShipperInfo {
    ShipperInfo {
        beat: "filebeat".to_string(),
        version: "8.0.0".to_string(),
    }
}

pub fn create_event(fields: Value) -> Event {
    let timestamp = Utc
        .with_ymd_and_hms(2024, 5, 17, 9, 30, 0)
        .single()
        .expect("valid timestamp");
    Event::new(
        timestamp,
        fields.as_object().cloned().expect("fields must be an object"),
    )
}

pub fn test_config(url: &str) -> HttpOutputConfig {
    HttpOutputConfig {
        url: url.to_string(),
        response_header_timeout: 5_000,
        dial_timeout: 5_000,
        ..Default::default()
    }
}

/// Resolver answering a fixed address list and counting lookups
pub struct FixedLookup {
    pub addresses: Vec<IpAddr>,
    pub calls: AtomicUsize,
    pub delay: Duration,
}

impl FixedLookup {
    pub fn new(addresses: Vec<IpAddr>) -> Self {
        FixedLookup {
            addresses,
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HostLookup for FixedLookup {
    async fn lookup(&self, _host: &str) -> io::Result<Vec<IpAddr>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self.addresses.clone())
    }
}

pub fn create_output(
    config: &HttpOutputConfig,
    lookup: Arc<FixedLookup>,
) -> (HttpOutput, Arc<CountingObserver>) {
    let info = shipper_info();
    let observer = Arc::new(CountingObserver::default());
    let serializer = serializer_from_config(config, &info).expect("valid serializer");
    let dns_cache = Arc::new(DnsCache::with_lookup(Duration::from_secs(60), lookup));
    let output = HttpOutput::with_parts(config, &info, serializer, dns_cache, observer.clone())
        .expect("valid output");
    (output, observer)
}
