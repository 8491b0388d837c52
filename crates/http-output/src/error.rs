// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Failure classes of the delivery engine.
//!
//! Every error here is handled inside [`crate::publisher::HttpOutput::publish`] and
//! translated into a [`crate::publisher::DeliveryOutcome`]; none of them reach the
//! host pipeline.

use hyper::StatusCode;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// The system resolver could not produce an address for a host.
#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("failed to resolve {host}: {source}")]
    Lookup {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("no addresses found for {host}")]
    NoAddresses { host: String },
}

/// No candidate address of the endpoint accepted a connection.
#[derive(Debug, Error)]
pub enum DialError {
    #[error("invalid address {0:?}")]
    InvalidAddress(String),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error("dial {addr} failed after {attempted} candidate(s): {source}")]
    AllCandidatesFailed {
        addr: String,
        attempted: usize,
        #[source]
        source: io::Error,
    },

    #[error("dial {addr} exceeded its deadline after {attempted} candidate(s)")]
    DeadlineExceeded { addr: String, attempted: usize },
}

/// An event could not be turned into bytes.
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("json encoding failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("field {0:?} is missing")]
    MissingField(String),

    #[error("field {field:?} is not a string")]
    NotAString { field: String },

    #[error("log line has {found} tokens, at least {expected} required")]
    TooFewTokens { expected: usize, found: usize },

    #[error("invalid format string: {0}")]
    InvalidFormat(String),
}

/// The HTTP exchange with the endpoint failed.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection to endpoint failed: {0}")]
    Connect(#[source] hyper_util::client::legacy::Error),

    #[error("request failed: {0}")]
    Request(#[source] hyper_util::client::legacy::Error),

    #[error("no connection established within {0:?}")]
    ConnectTimeout(Duration),

    #[error("no response headers received within {0:?}")]
    Timeout(Duration),

    #[error("bad response code: {}", .0.as_u16())]
    BadStatus(StatusCode),
}

/// A request object could not be constructed.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("invalid endpoint uri {uri:?}: {source}")]
    InvalidUri {
        uri: String,
        #[source]
        source: hyper::http::uri::InvalidUri,
    },

    #[error("invalid value for header {name}: {source}")]
    InvalidHeader {
        name: &'static str,
        #[source]
        source: hyper::header::InvalidHeaderValue,
    },
}

/// Why sending a single serialized event failed.
#[derive(Debug, Error)]
pub enum SendError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Errors raised while building an [`crate::publisher::HttpOutput`].
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("invalid configuration: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Serializer(#[from] SerializationError),
}
