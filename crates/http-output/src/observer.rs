// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicU64, Ordering};

/// Receives delivery counters. Purely observational.
pub trait Observer: Send + Sync {
    fn new_batch(&self, events: usize);
    fn acked(&self, events: usize);
    fn failed(&self, events: usize);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl Observer for NoopObserver {
    fn new_batch(&self, _events: usize) {}
    fn acked(&self, _events: usize) {}
    fn failed(&self, _events: usize) {}
}

#[derive(Debug, Default)]
pub struct CountingObserver {
    batches: AtomicU64,
    events: AtomicU64,
    acked: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Counters {
    pub batches: u64,
    pub events: u64,
    pub acked: u64,
    pub failed: u64,
}

impl CountingObserver {
    pub fn snapshot(&self) -> Counters {
        Counters {
            batches: self.batches.load(Ordering::Relaxed),
            events: self.events.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

impl Observer for CountingObserver {
    fn new_batch(&self, events: usize) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.events.fetch_add(events as u64, Ordering::Relaxed);
    }

    fn acked(&self, events: usize) {
        self.acked.fetch_add(events as u64, Ordering::Relaxed);
    }

    fn failed(&self, events: usize) {
        self.failed.fetch_add(events as u64, Ordering::Relaxed);
    }
}
