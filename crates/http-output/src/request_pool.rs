// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Free list of reusable outbound request objects.
//!
//! A [`PooledRequest`] keeps its parsed URI and body buffer between sends, and
//! header values are validated once per pool, so the hot path only assembles
//! them. Borrowing goes through [`PooledRequestGuard`], which hands the object
//! back on drop.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::{Bytes, BytesMut};
use http_body_util::Full;
use hyper::header::{
    HeaderMap, HeaderValue, ACCEPT_ENCODING, AUTHORIZATION, CONNECTION, CONTENT_TYPE, USER_AGENT,
};
use hyper::{Method, Request, Uri};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::error::PoolError;

const DEFAULT_MAX_IDLE: usize = 64;

/// Values every request carries, validated once when the pool is built.
#[derive(Debug, Clone)]
pub struct RequestSettings {
    url: String,
    user_agent: HeaderValue,
    authorization: Option<HeaderValue>,
    compression: bool,
    keep_alive: bool,
}

impl RequestSettings {
    pub fn new(
        url: &str,
        user_agent: &str,
        credentials: Option<(&str, &str)>,
        compression: bool,
        keep_alive: bool,
    ) -> Result<Self, PoolError> {
        let user_agent = HeaderValue::from_str(user_agent).map_err(|source| {
            PoolError::InvalidHeader {
                name: "user-agent",
                source,
            }
        })?;
        let authorization = credentials
            .map(|(username, password)| {
                let token = STANDARD.encode(format!("{username}:{password}"));
                let mut value = HeaderValue::from_str(&format!("Basic {token}")).map_err(
                    |source| PoolError::InvalidHeader {
                        name: "authorization",
                        source,
                    },
                )?;
                value.set_sensitive(true);
                Ok::<_, PoolError>(value)
            })
            .transpose()?;

        Ok(RequestSettings {
            url: url.to_string(),
            user_agent,
            authorization,
            compression,
            keep_alive,
        })
    }

    fn apply_headers(&self, headers: &mut HeaderMap) {
        headers.clear();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(USER_AGENT, self.user_agent.clone());
        if let Some(authorization) = &self.authorization {
            headers.insert(AUTHORIZATION, authorization.clone());
        }
        if self.compression {
            headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
        }
        if !self.keep_alive {
            headers.insert(CONNECTION, HeaderValue::from_static("close"));
        }
    }
}

#[derive(Debug)]
pub struct PooledRequest {
    uri: Uri,
    headers: HeaderMap,
    body: BytesMut,
}

impl PooledRequest {
    fn build(settings: &RequestSettings) -> Result<Self, PoolError> {
        let uri = settings
            .url
            .parse::<Uri>()
            .map_err(|source| PoolError::InvalidUri {
                uri: settings.url.clone(),
                source,
            })?;
        Ok(PooledRequest {
            uri,
            headers: HeaderMap::with_capacity(5),
            body: BytesMut::new(),
        })
    }

    /// Overwrites the whole body with `payload` and re-applies the standard headers.
    fn reset(&mut self, payload: &[u8], settings: &RequestSettings) {
        self.body.clear();
        self.body.extend_from_slice(payload);
        settings.apply_headers(&mut self.headers);
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Builds the `POST` for the current payload, moving the body and headers out.
    ///
    /// The buffer keeps its allocation and reclaims it on the next reset once the
    /// request body has been dropped. Headers are re-applied on the next reset.
    pub fn to_http_request(&mut self) -> Request<Full<Bytes>> {
        let mut request = Request::new(Full::new(self.body.split().freeze()));
        *request.method_mut() = Method::POST;
        *request.uri_mut() = self.uri.clone();
        *request.headers_mut() = std::mem::take(&mut self.headers);
        request
    }
}

pub struct RequestPool {
    settings: RequestSettings,
    idle: Mutex<Vec<PooledRequest>>,
    max_idle: usize,
    created: AtomicUsize,
}

impl RequestPool {
    pub fn new(settings: RequestSettings) -> Self {
        Self::with_max_idle(settings, DEFAULT_MAX_IDLE)
    }

    pub fn with_max_idle(settings: RequestSettings, max_idle: usize) -> Self {
        RequestPool {
            settings,
            idle: Mutex::new(Vec::new()),
            max_idle,
            created: AtomicUsize::new(0),
        }
    }

    /// Lends a request whose body is exactly `payload`.
    pub fn acquire(&self, payload: &[u8]) -> Result<PooledRequestGuard<'_>, PoolError> {
        let reused = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        let mut request = match reused {
            Some(request) => request,
            None => {
                let request = PooledRequest::build(&self.settings)?;
                self.created.fetch_add(1, Ordering::Relaxed);
                request
            }
        };
        request.reset(payload, &self.settings);
        Ok(PooledRequestGuard {
            pool: self,
            request: Some(request),
        })
    }

    /// Hands a borrowed request back. Equivalent to dropping the guard.
    pub fn release(&self, guard: PooledRequestGuard<'_>) {
        drop(guard);
    }

    fn put(&self, request: PooledRequest) {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < self.max_idle {
            idle.push(request);
        }
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Number of request objects built since the pool was created.
    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }
}

/// Exclusive loan of a [`PooledRequest`]; returns it to the pool when dropped.
pub struct PooledRequestGuard<'a> {
    pool: &'a RequestPool,
    request: Option<PooledRequest>,
}

impl Deref for PooledRequestGuard<'_> {
    type Target = PooledRequest;

    #[allow(clippy::expect_used)]
    fn deref(&self) -> &PooledRequest {
        self.request.as_ref().expect("request is present until drop")
    }
}

impl DerefMut for PooledRequestGuard<'_> {
    #[allow(clippy::expect_used)]
    fn deref_mut(&mut self) -> &mut PooledRequest {
        self.request.as_mut().expect("request is present until drop")
    }
}

impl Drop for PooledRequestGuard<'_> {
    fn drop(&mut self) {
        if let Some(request) = self.request.take() {
            self.pool.put(request);
        }
    }
}
