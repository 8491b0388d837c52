// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Strategies turning an [`Event`] into the request body.
//!
//! The strategy is picked once at startup by [`serializer_from_config`]; the
//! delivery path only sees `dyn Serializer`.

use chrono::SecondsFormat;
use serde_json::{Map, Value};

use crate::config::{CodecConfig, HttpOutputConfig};
use crate::error::SerializationError;
use crate::event::{Event, ShipperInfo};

pub trait Serializer: Send + Sync {
    fn serialize(&self, event: &Event) -> Result<Vec<u8>, SerializationError>;
}

pub fn serializer_from_config(
    config: &HttpOutputConfig,
    info: &ShipperInfo,
) -> Result<Box<dyn Serializer>, SerializationError> {
    if config.only_fields {
        return Ok(Box::new(FieldExtractSerializer::new(
            config.add_fields.clone(),
        )));
    }
    let codec = match &config.codec {
        CodecConfig::Json { pretty } => Codec::Json { pretty: *pretty },
        CodecConfig::Format { string } => Codec::Format(FormatString::parse(string)?),
    };
    Ok(Box::new(CodecSerializer::new(codec, info.clone())))
}

fn timestamp_millis(event: &Event) -> String {
    event.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Debug, Clone)]
pub enum Codec {
    Json { pretty: bool },
    Format(FormatString),
}

/// Full structured encode of the event through the configured codec.
pub struct CodecSerializer {
    codec: Codec,
    info: ShipperInfo,
}

impl CodecSerializer {
    pub fn new(codec: Codec, info: ShipperInfo) -> Self {
        CodecSerializer { codec, info }
    }

    fn document(&self, event: &Event) -> Map<String, Value> {
        let mut metadata = Map::new();
        metadata.insert("beat".to_string(), Value::from(self.info.beat.as_str()));
        metadata.insert("type".to_string(), Value::from("_doc"));
        metadata.insert(
            "version".to_string(),
            Value::from(self.info.version.as_str()),
        );
        metadata.extend(event.meta.clone());

        let mut document = Map::new();
        document.insert("@timestamp".to_string(), Value::from(timestamp_millis(event)));
        document.insert("@metadata".to_string(), Value::Object(metadata));
        document.extend(event.fields.clone());
        document
    }
}

impl Serializer for CodecSerializer {
    fn serialize(&self, event: &Event) -> Result<Vec<u8>, SerializationError> {
        match &self.codec {
            Codec::Json { pretty: false } => Ok(serde_json::to_vec(&self.document(event))?),
            Codec::Json { pretty: true } => {
                Ok(serde_json::to_vec_pretty(&self.document(event))?)
            }
            Codec::Format(format) => format.render(event).map(String::into_bytes),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Field(Vec<String>),
}

/// `%{[field][nested]}` template rendered against the event fields.
#[derive(Debug, Clone, PartialEq)]
pub struct FormatString {
    segments: Vec<Segment>,
}

impl FormatString {
    pub fn parse(template: &str) -> Result<Self, SerializationError> {
        let mut segments = Vec::new();
        let mut rest = template;
        while let Some(start) = rest.find("%{") {
            if start > 0 {
                segments.push(Segment::Literal(rest[..start].to_string()));
            }
            let after = &rest[start + 2..];
            let end = after.find('}').ok_or_else(|| {
                SerializationError::InvalidFormat(format!("unclosed field in {template:?}"))
            })?;
            segments.push(Segment::Field(Self::parse_path(&after[..end], template)?));
            rest = &after[end + 1..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }
        Ok(FormatString { segments })
    }

    /// Accepts `[a][b]` and `a.b`.
    fn parse_path(expr: &str, template: &str) -> Result<Vec<String>, SerializationError> {
        let path: Vec<String> = if expr.starts_with('[') {
            expr.trim_start_matches('[')
                .trim_end_matches(']')
                .split("][")
                .map(str::to_string)
                .collect()
        } else {
            expr.split('.').map(str::to_string).collect()
        };
        if path.iter().any(String::is_empty) {
            return Err(SerializationError::InvalidFormat(format!(
                "empty field name in {template:?}"
            )));
        }
        Ok(path)
    }

    pub fn render(&self, event: &Event) -> Result<String, SerializationError> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Field(path) if path.len() == 1 && path[0] == "@timestamp" => {
                    out.push_str(&timestamp_millis(event));
                }
                Segment::Field(path) => match lookup(&event.fields, path) {
                    Some(Value::String(text)) => out.push_str(text),
                    Some(value) => out.push_str(&value.to_string()),
                    None => return Err(SerializationError::MissingField(path.join("."))),
                },
            }
        }
        Ok(out)
    }
}

fn lookup<'a>(fields: &'a Map<String, Value>, path: &[String]) -> Option<&'a Value> {
    let (first, rest) = path.split_first()?;
    rest.iter()
        .try_fold(fields.get(first)?, |value, key| value.as_object()?.get(key))
}

/// Token positions of the fixed-format firewall log line carried in `body`.
const EXTRACTED_TOKENS: [(usize, &str); 17] = [
    (3, "ifindex"),
    (4, "actionCode"),
    (6, "aclTag"),
    (8, "ruleDesc"),
    (9, "protocol"),
    (10, "NFFOrDash"),
    (11, "srcIp"),
    (12, "srcPort"),
    (13, "dstIp"),
    (14, "dstPort"),
    (17, "octProto"),
    (19, "isInput"),
    (21, "isSlowpath"),
    (23, "hexFlegs"),
    (25, "invalidOrDash"),
    (26, "tcpflags"),
    (28, "rsvd"),
];

/// Present only on session-close lines.
const SESSION_TOKENS: [(usize, &str); 3] = [(30, "dur"), (32, "pkts"), (34, "bytes")];

const BODY_FIELD: &str = "body";

/// Re-maps the whitespace-separated tokens of the `body` field to named fields.
///
/// Tied to one upstream log layout; a change in that layout shows up as wrong
/// field values, not as an error.
pub struct FieldExtractSerializer {
    add_fields: Map<String, Value>,
}

impl FieldExtractSerializer {
    pub fn new(add_fields: Map<String, Value>) -> Self {
        FieldExtractSerializer { add_fields }
    }
}

impl Serializer for FieldExtractSerializer {
    fn serialize(&self, event: &Event) -> Result<Vec<u8>, SerializationError> {
        let mut fields = event.fields.clone();
        fields.insert(
            "@timestamp".to_string(),
            Value::from(event.timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        );
        fields.extend(self.add_fields.clone());

        let body = match fields.get(BODY_FIELD) {
            Some(Value::String(body)) => body.clone(),
            Some(_) => {
                return Err(SerializationError::NotAString {
                    field: BODY_FIELD.to_string(),
                })
            }
            None => return Err(SerializationError::MissingField(BODY_FIELD.to_string())),
        };

        let tokens: Vec<&str> = body.split(' ').collect();
        let required = EXTRACTED_TOKENS[EXTRACTED_TOKENS.len() - 1].0 + 1;
        if tokens.len() < required {
            return Err(SerializationError::TooFewTokens {
                expected: required,
                found: tokens.len(),
            });
        }
        for (index, name) in EXTRACTED_TOKENS {
            fields.insert(name.to_string(), Value::from(tokens[index]));
        }
        if tokens.len() > SESSION_TOKENS[SESSION_TOKENS.len() - 1].0 {
            for (index, name) in SESSION_TOKENS {
                fields.insert(name.to_string(), Value::from(tokens[index]));
            }
        }

        Ok(serde_json::to_vec(&fields)?)
    }
}
