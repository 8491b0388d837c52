// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delivery engine of an HTTP event output.
//!
//! [`publisher::HttpOutput`] takes batches handed over by an upstream pipeline and
//! POSTs their events one by one to a single endpoint. New connections are opened
//! by a [`dialer::Dialer`] backed by a shared [`dns_cache::DnsCache`], and request
//! objects are recycled through a [`request_pool::RequestPool`].

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod config;
pub mod dialer;
pub mod dns_cache;
pub mod error;
pub mod event;
pub mod observer;
pub mod publisher;
pub mod request_pool;
pub mod serializer;
pub mod transport;
