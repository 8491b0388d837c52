// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::{env, sync::Arc};
use tokio::{
    io::{self, AsyncBufReadExt, BufReader},
    time::{sleep, Duration},
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use http_output::{
    config::HttpOutputConfig,
    event::{BatchSignal, Event, ShipperInfo, VecBatch},
    observer::CountingObserver,
    publisher::HttpOutput,
};

const DEFAULT_BATCH_SIZE: usize = 50;
const RETRY_BACKOFF_BASE: Duration = Duration::from_millis(100);
const RETRY_BACKOFF_MAX: Duration = Duration::from_secs(5);

#[tokio::main]
pub async fn main() {
    let log_level = env::var("HTTP_OUTPUT_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let env_filter = format!("h2=off,hyper=off,rustls=off,{}", log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_writer(std::io::stderr)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    if let Err(e) = run().await {
        error!("Shipper stopped: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let config = load_config()?;
    let batch_size = match env::var("HTTP_OUTPUT_BATCH_SIZE") {
        Ok(raw) => match raw.parse::<usize>() {
            Ok(size) if size > 0 => size,
            _ => bail!("invalid HTTP_OUTPUT_BATCH_SIZE: {raw}"),
        },
        Err(_) => DEFAULT_BATCH_SIZE,
    };

    let observer = Arc::new(CountingObserver::default());
    let output = HttpOutput::new(&config, &ShipperInfo::default(), observer.clone())
        .context("could not build http output")?;

    let mut lines = BufReader::new(io::stdin()).lines();
    let mut pending = Vec::with_capacity(batch_size);
    while let Some(line) = lines.next_line().await.context("reading stdin")? {
        if line.trim().is_empty() {
            continue;
        }
        match parse_event(&line) {
            Ok(event) => pending.push(event),
            Err(e) => warn!("Skipping malformed input line: {e}"),
        }
        if pending.len() >= batch_size {
            let batch = std::mem::replace(&mut pending, Vec::with_capacity(batch_size));
            publish_with_retries(&output, batch, config.max_retries).await;
        }
    }
    if !pending.is_empty() {
        publish_with_retries(&output, pending, config.max_retries).await;
    }

    output.close();
    let counters = observer.snapshot();
    info!(
        "Shipped {} batches: {} events acked, {} failed",
        counters.batches, counters.acked, counters.failed
    );
    Ok(())
}

/// Reads the JSON file named by `HTTP_OUTPUT_CONFIG_FILE`, or the `HTTP_OUTPUT_*` environment.
fn load_config() -> anyhow::Result<HttpOutputConfig> {
    match env::var("HTTP_OUTPUT_CONFIG_FILE") {
        Ok(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("could not read config file {path}"))?;
            HttpOutputConfig::from_json_str(&raw)
                .with_context(|| format!("invalid config file {path}"))
        }
        Err(_) => HttpOutputConfig::from_env().context("invalid environment configuration"),
    }
}

/// One input line is a JSON object; an RFC 3339 `@timestamp` member becomes the event time.
fn parse_event(line: &str) -> anyhow::Result<Event> {
    let mut fields: Map<String, Value> = match serde_json::from_str(line)? {
        Value::Object(fields) => fields,
        other => bail!("expected a JSON object, got {other}"),
    };

    let timestamp = match fields.get("@timestamp").and_then(Value::as_str) {
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .with_context(|| format!("invalid @timestamp {raw}"))?
            .with_timezone(&Utc),
        None => Utc::now(),
    };
    fields.remove("@timestamp");

    let guaranteed = matches!(fields.remove("@guaranteed"), Some(Value::Bool(true)));
    Ok(Event::new(timestamp, fields).guaranteed(guaranteed))
}

/// Publishes until the batch is acked, left unresolved, or out of retries.
///
/// A negative `max_retries` retries forever.
async fn publish_with_retries(output: &HttpOutput, mut events: Vec<Event>, max_retries: i64) {
    let mut attempt: u32 = 0;
    loop {
        let count = events.len();
        let (batch, signal) = VecBatch::new(events);
        output.publish(batch).await;

        match signal.await {
            Ok(BatchSignal::Acked) => return,
            Ok(BatchSignal::Retry(returned)) => {
                attempt += 1;
                if max_retries >= 0 && i64::from(attempt) > max_retries {
                    error!("Dropping batch of {count} events after {max_retries} retries");
                    return;
                }
                let backoff = RETRY_BACKOFF_BASE
                    .saturating_mul(1 << attempt.min(6))
                    .min(RETRY_BACKOFF_MAX);
                debug!("Retrying batch of {count} events in {backoff:?} (attempt {attempt})");
                sleep(backoff).await;
                events = returned;
            }
            Err(_) => {
                warn!("Batch of {count} events left unresolved by {output}");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_event_takes_timestamp_and_guarantee() {
        let event = parse_event(
            r#"{"@timestamp":"2024-05-17T09:30:00Z","@guaranteed":true,"message":"hi"}"#,
        )
        .unwrap();

        assert_eq!(event.timestamp.to_rfc3339(), "2024-05-17T09:30:00+00:00");
        assert!(event.guaranteed);
        assert_eq!(event.fields.len(), 1);
        assert_eq!(event.fields["message"], "hi");
    }

    #[test]
    fn test_parse_event_defaults() {
        let before = Utc::now();
        let event = parse_event(r#"{"message":"hi"}"#).unwrap();

        assert!(event.timestamp >= before);
        assert!(!event.guaranteed);
    }

    #[test]
    fn test_parse_event_rejects_non_objects() {
        assert!(parse_event("[1, 2]").is_err());
        assert!(parse_event("not json").is_err());
        assert!(parse_event(r#"{"@timestamp":"yesterday"}"#).is_err());
    }
}
