// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Incoming;
use hyper::{Request, StatusCode};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::capture_connection;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::HttpOutputConfig;
use crate::dialer::Dialer;
use crate::error::TransportError;

/// Response bytes read back before the connection is given up instead.
pub const MAX_DRAIN_BYTES: usize = 64 * 1024;

/// Connection policy of the shared HTTP client.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Idle connections kept per host, 0 for no limit
    pub max_idle_conns: usize,
    pub idle_conn_timeout: Option<Duration>,
    /// Budget for getting a usable connection: resolve, dial and TLS handshake
    pub connect_timeout: Duration,
    /// Starts once the request has a connection; also bounds the body drain
    pub response_header_timeout: Duration,
    pub keep_alive: bool,
}

impl From<&HttpOutputConfig> for TransportConfig {
    fn from(config: &HttpOutputConfig) -> Self {
        TransportConfig {
            max_idle_conns: config.max_idle_conns,
            idle_conn_timeout: config.idle_conn_timeout(),
            connect_timeout: config.dial_timeout(),
            response_header_timeout: config.response_header_timeout(),
            keep_alive: config.keep_alive,
        }
    }
}

impl TransportConfig {
    fn idle_pool_size(&self) -> usize {
        match (self.keep_alive, self.max_idle_conns) {
            (false, _) => 0,
            (true, 0) => usize::MAX,
            (true, max) => max,
        }
    }
}

type PooledClient = Client<HttpsConnector<Dialer>, Full<Bytes>>;

/// Pooled HTTP/1 client whose new connections are opened by [`Dialer`].
pub struct Transport {
    client: RwLock<PooledClient>,
    config: TransportConfig,
    dialer: Dialer,
}

impl Transport {
    pub fn new(config: &TransportConfig, dialer: Dialer) -> Self {
        Transport {
            client: RwLock::new(build_client(config, dialer.clone())),
            config: config.clone(),
            dialer,
        }
    }

    /// Drops every idle pooled connection. In-flight requests keep theirs.
    pub fn close_idle(&self) {
        let fresh = build_client(&self.config, self.dialer.clone());
        let previous = {
            let mut client = self.client.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *client, fresh)
        };
        drop(previous);
        debug!("Closed idle connections");
    }

    fn client(&self) -> PooledClient {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Issues `request` and returns the response status.
    ///
    /// Getting a connection is bounded by `connect_timeout`; the response
    /// header timeout only starts once the request holds a connection, pooled
    /// or new.
    pub async fn send(
        &self,
        mut request: Request<Full<Bytes>>,
    ) -> Result<StatusCode, TransportError> {
        let mut connection = capture_connection(&mut request);
        let response = self.client().request(request);
        tokio::pin!(response);

        let connect_timeout = self.config.connect_timeout;
        let early = tokio::select! {
            biased;
            result = &mut response => Some(result),
            _ = async { connection.wait_for_connection_metadata().await.is_some() } => None,
            _ = tokio::time::sleep(connect_timeout) => {
                return Err(TransportError::ConnectTimeout(connect_timeout));
            }
        };

        let result = match early {
            Some(result) => result,
            None => {
                let timeout = self.config.response_header_timeout;
                match tokio::time::timeout(timeout, &mut response).await {
                    Ok(result) => result,
                    Err(_) => return Err(TransportError::Timeout(timeout)),
                }
            }
        };
        let response = match result {
            Ok(response) => response,
            Err(e) if e.is_connect() => return Err(TransportError::Connect(e)),
            Err(e) => return Err(TransportError::Request(e)),
        };

        let status = response.status();
        self.drain(status, response.into_body()).await;
        Ok(status)
    }

    /// Reads the body back so the connection can return to the idle pool.
    ///
    /// Bounded in time and size; past either limit the body is dropped, which
    /// discards the connection. Never fails the exchange.
    async fn drain(&self, status: StatusCode, body: Incoming) {
        let budget = self.config.response_header_timeout;
        let limited = Limited::new(body, MAX_DRAIN_BYTES);
        match tokio::time::timeout(budget, limited.collect()).await {
            Ok(Ok(body)) => debug!(
                "Endpoint answered {status} with {} body bytes",
                body.to_bytes().len()
            ),
            Ok(Err(e)) => warn!("Close response body error: {e}"),
            Err(_) => warn!("Close response body error: body not read within {budget:?}"),
        }
    }
}

fn build_client(config: &TransportConfig, dialer: Dialer) -> PooledClient {
    let connector = HttpsConnectorBuilder::new()
        .with_webpki_roots()
        .https_or_http()
        .enable_http1()
        .wrap_connector(dialer);

    Client::builder(TokioExecutor::new())
        .pool_max_idle_per_host(config.idle_pool_size())
        .pool_idle_timeout(config.idle_conn_timeout)
        .pool_timer(TokioTimer::new())
        .build(connector)
}
