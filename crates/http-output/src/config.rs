// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use hyper::Uri;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

const ENV_PREFIX: &str = "HTTP_OUTPUT_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("invalid value {value:?} for {name}")]
    InvalidValue { name: String, value: String },

    #[error("response_header_timeout must be greater than zero")]
    ZeroResponseHeaderTimeout,

    #[error("failed to parse configuration: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodecConfig {
    Json {
        #[serde(default)]
        pretty: bool,
    },
    Format {
        string: String,
    },
}

impl Default for CodecConfig {
    fn default() -> Self {
        CodecConfig::Json { pretty: false }
    }
}

/// What to do with a batch whose send failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendFailurePolicy {
    /// Neither acknowledge nor retry; the pipeline's own redelivery decides.
    #[default]
    LeaveUnresolved,
    /// Hand the whole batch back for another attempt.
    RetryBatch,
}

impl FromStr for SendFailurePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "leave_unresolved" => Ok(SendFailurePolicy::LeaveUnresolved),
            "retry_batch" => Ok(SendFailurePolicy::RetryBatch),
            _ => Err(ConfigError::InvalidValue {
                name: "send_failure_policy".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

/// Options recognized by the HTTP output.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct HttpOutputConfig {
    pub url: String,
    pub codec: CodecConfig,
    /// Ship the extracted fields of the `body` log line instead of the encoded event
    pub only_fields: bool,
    /// Extra fields merged into every event by the field extractor
    pub add_fields: Map<String, Value>,
    /// Enforced by the host pipeline; -1 retries forever
    pub max_retries: i64,
    pub compression: bool,
    pub keep_alive: bool,
    /// Idle keep-alive connections kept to the endpoint, 0 for no limit
    pub max_idle_conns: usize,
    /// Idle connection timeout in seconds, 0 keeps idle connections forever
    pub idle_conn_timeout: u64,
    /// Time allowed for the response headers, in milliseconds
    pub response_header_timeout: u64,
    /// Connect deadline across all candidate addresses, in milliseconds
    pub dial_timeout: u64,
    /// Lifetime of cached DNS answers, in seconds
    pub dns_cache_ttl: u64,
    pub username: String,
    pub password: String,
    pub user_agent: Option<String>,
    pub send_failure_policy: SendFailurePolicy,
}

impl Default for HttpOutputConfig {
    fn default() -> Self {
        HttpOutputConfig {
            url: "http://127.0.0.1:8090/message".to_string(),
            codec: CodecConfig::default(),
            only_fields: false,
            add_fields: Map::new(),
            max_retries: -1,
            compression: false,
            keep_alive: true,
            max_idle_conns: 1,
            idle_conn_timeout: 0,
            response_header_timeout: 100,
            dial_timeout: 30_000,
            dns_cache_ttl: 300,
            username: String::new(),
            password: String::new(),
            user_agent: None,
            send_failure_policy: SendFailurePolicy::default(),
        }
    }
}

impl HttpOutputConfig {
    /// Reads `HTTP_OUTPUT_*` environment variables on top of the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let codec = match env_string("CODEC_FORMAT") {
            Some(string) => CodecConfig::Format { string },
            None => CodecConfig::Json {
                pretty: env_parse("CODEC_PRETTY")?.unwrap_or(false),
            },
        };
        let add_fields = match env_string("ADD_FIELDS") {
            Some(raw) => serde_json::from_str(&raw)?,
            None => Map::new(),
        };

        let config = HttpOutputConfig {
            url: env_string("URL").unwrap_or(defaults.url),
            codec,
            only_fields: env_parse("ONLY_FIELDS")?.unwrap_or(defaults.only_fields),
            add_fields,
            max_retries: env_parse("MAX_RETRIES")?.unwrap_or(defaults.max_retries),
            compression: env_parse("COMPRESSION")?.unwrap_or(defaults.compression),
            keep_alive: env_parse("KEEP_ALIVE")?.unwrap_or(defaults.keep_alive),
            max_idle_conns: env_parse("MAX_IDLE_CONNS")?.unwrap_or(defaults.max_idle_conns),
            idle_conn_timeout: env_parse("IDLE_CONN_TIMEOUT")?
                .unwrap_or(defaults.idle_conn_timeout),
            response_header_timeout: env_parse("RESPONSE_HEADER_TIMEOUT")?
                .unwrap_or(defaults.response_header_timeout),
            dial_timeout: env_parse("DIAL_TIMEOUT")?.unwrap_or(defaults.dial_timeout),
            dns_cache_ttl: env_parse("DNS_CACHE_TTL")?.unwrap_or(defaults.dns_cache_ttl),
            username: env_string("USERNAME").unwrap_or_default(),
            password: env_string("PASSWORD").unwrap_or_default(),
            user_agent: env_string("USER_AGENT"),
            send_failure_policy: env_parse("SEND_FAILURE_POLICY")?
                .unwrap_or(defaults.send_failure_policy),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: HttpOutputConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidUrl {
            url: self.url.clone(),
            reason: reason.to_string(),
        };
        let uri = self
            .url
            .parse::<Uri>()
            .map_err(|e| invalid(&e.to_string()))?;
        match uri.scheme_str() {
            Some("http") | Some("https") => {}
            Some(_) => return Err(invalid("scheme must be http or https")),
            None => return Err(invalid("missing scheme")),
        }
        if uri.host().map_or(true, str::is_empty) {
            return Err(invalid("missing host"));
        }
        if self.response_header_timeout == 0 {
            return Err(ConfigError::ZeroResponseHeaderTimeout);
        }
        Ok(())
    }

    /// Basic credentials, present when a username is configured.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        (!self.username.is_empty()).then_some((self.username.as_str(), self.password.as_str()))
    }

    pub fn idle_conn_timeout(&self) -> Option<Duration> {
        (self.idle_conn_timeout > 0).then(|| Duration::from_secs(self.idle_conn_timeout))
    }

    pub fn response_header_timeout(&self) -> Duration {
        Duration::from_millis(self.response_header_timeout)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout)
    }

    pub fn dns_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.dns_cache_ttl)
    }
}

impl fmt::Display for HttpOutputConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "url={} codec={:?} only_fields={} max_retries={} compression={} keep_alive={} \
             max_idle_conns={} idle_conn_timeout={}s response_header_timeout={}ms \
             dial_timeout={}ms dns_cache_ttl={}s username={} password={} send_failure_policy={:?}",
            self.url,
            self.codec,
            self.only_fields,
            self.max_retries,
            self.compression,
            self.keep_alive,
            self.max_idle_conns,
            self.idle_conn_timeout,
            self.response_header_timeout,
            self.dial_timeout,
            self.dns_cache_ttl,
            self.username,
            mask_password(&self.password),
            self.send_failure_policy,
        )
    }
}

/// Masks a password for logging. Passwords longer than 8 characters keep their
/// first two and last two characters.
pub fn mask_password(password: &str) -> String {
    let len = password.chars().count();
    if len <= 8 {
        return "*".repeat(len);
    }
    password
        .chars()
        .enumerate()
        .map(|(i, c)| if i > 1 && i < len - 2 { '*' } else { c })
        .collect()
}

fn env_string(name: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}{name}"))
        .ok()
        .filter(|val| !val.is_empty())
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    env_string(name)
        .map(|val| {
            val.trim()
                .to_lowercase()
                .parse::<T>()
                .map_err(|_| ConfigError::InvalidValue {
                    name: format!("{ENV_PREFIX}{name}"),
                    value: val.clone(),
                })
        })
        .transpose()
}
