// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::sync::oneshot;

/// One structured record handed over by the upstream pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub fields: Map<String, Value>,
    /// Pipeline metadata merged into `@metadata` by the JSON codec.
    pub meta: Map<String, Value>,
    /// The pipeline requires durable delivery for this event. Only affects log
    /// severity here.
    pub guaranteed: bool,
}

impl Event {
    pub fn new(timestamp: DateTime<Utc>, fields: Map<String, Value>) -> Self {
        Event {
            timestamp,
            fields,
            meta: Map::new(),
            guaranteed: false,
        }
    }

    #[must_use]
    pub fn guaranteed(mut self, guaranteed: bool) -> Self {
        self.guaranteed = guaranteed;
        self
    }
}

/// Identity of the shipper, used for `@metadata` and the default user agent.
#[derive(Debug, Clone)]
pub struct ShipperInfo {
    pub beat: String,
    pub version: String,
}

impl Default for ShipperInfo {
    fn default() -> Self {
        ShipperInfo {
            beat: "http-output".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// A batch of events owned by the upstream pipeline.
///
/// `ack` and `retry` consume the batch, so at most one of them can be called and
/// only once. Dropping a batch without calling either leaves it unresolved.
pub trait Batch: Send {
    fn events(&self) -> &[Event];

    /// Every event of the batch was delivered.
    fn ack(self);

    /// Hand `events` back to the pipeline for another attempt.
    fn retry(self, events: Vec<Event>);
}

/// Resolution signalled by a [`VecBatch`].
#[derive(Debug, PartialEq)]
pub enum BatchSignal {
    Acked,
    Retry(Vec<Event>),
}

/// A [`Batch`] over an owned vector reporting its resolution through a oneshot
/// channel. The receiver sees a closed channel when the batch was dropped
/// unresolved.
pub struct VecBatch {
    events: Vec<Event>,
    signal: oneshot::Sender<BatchSignal>,
}

impl VecBatch {
    pub fn new(events: Vec<Event>) -> (Self, oneshot::Receiver<BatchSignal>) {
        let (signal, rx) = oneshot::channel();
        (VecBatch { events, signal }, rx)
    }
}

impl Batch for VecBatch {
    fn events(&self) -> &[Event] {
        &self.events
    }

    fn ack(self) {
        // The pipeline may have stopped listening; nothing to do then.
        let _ = self.signal.send(BatchSignal::Acked);
    }

    fn retry(self, events: Vec<Event>) {
        let _ = self.signal.send(BatchSignal::Retry(events));
    }
}
