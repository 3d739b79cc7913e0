// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publishing
//!
//! Encoding of outbound messages and the [`PublishResult`] every publish call
//! returns. Transport-level failures are reported inside the result rather than
//! raised, so request-handling code can branch on them without error plumbing.

use crate::{errors::AmqpError, otel, topology::BindingId};
use lapin::{
    types::{
        AMQPValue, Boolean, FieldTable, LongInt, LongLongInt, LongString, LongUInt, ShortInt,
        ShortString,
    },
    BasicProperties,
};
use opentelemetry::Context;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

/// Content type of string payloads
pub const TEXT_CONTENT_TYPE: &str = "text/plain";
/// Content type of mapping and model payloads
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Outcome of a publish call.
#[derive(Debug, Clone)]
pub struct PublishResult {
    /// `None` when the broker accepted the message.
    pub error: Option<AmqpError>,
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: BasicProperties,
}

impl PublishResult {
    /// Whether the broker accepted the message.
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Converts the outcome into a `Result`, for callers that prefer `?`.
    pub fn into_result(self) -> Result<(), AmqpError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// A message on its way to the client loop.
#[derive(Debug, Clone)]
pub(crate) struct PublishRequest {
    pub(crate) exchange: String,
    pub(crate) routing_key: String,
    pub(crate) body: Vec<u8>,
    pub(crate) properties: BasicProperties,
    /// Binding that must be in place, for strict routing.
    pub(crate) route: Option<BindingId>,
}

impl PublishRequest {
    /// Builds a request, stamping a message id when the caller set none and
    /// injecting the current trace context into the headers.
    pub(crate) fn new(
        exchange: String,
        routing_key: &str,
        body: Vec<u8>,
        properties: BasicProperties,
    ) -> Self {
        let properties = if properties.message_id().is_none() {
            properties.with_message_id(ShortString::from(Uuid::new_v4().to_string()))
        } else {
            properties
        };

        PublishRequest {
            exchange,
            routing_key: routing_key.to_owned(),
            body,
            properties: otel::inject_context(&Context::current(), properties),
            route: None,
        }
    }

    pub(crate) fn on_route(mut self, binding: BindingId) -> Self {
        self.route = Some(binding);
        self
    }

    pub(crate) fn into_result(self, error: Option<AmqpError>) -> PublishResult {
        PublishResult {
            error,
            exchange: self.exchange,
            routing_key: self.routing_key,
            body: self.body,
            properties: self.properties,
        }
    }
}

/// Encodes a string payload as `text/plain`.
pub(crate) fn encode_text(body: &str, properties: Option<BasicProperties>) -> (Vec<u8>, BasicProperties) {
    (
        body.as_bytes().to_vec(),
        properties
            .unwrap_or_default()
            .with_content_type(ShortString::from(TEXT_CONTENT_TYPE)),
    )
}

/// Encodes a mapping as compact JSON with keys in lexicographic order.
///
/// `serde_json::Value` cannot hold NaN or infinite numbers, so a mapping that
/// reaches this point is always valid JSON.
pub(crate) fn encode_json(
    body: &Map<String, Value>,
    properties: Option<BasicProperties>,
) -> Result<(Vec<u8>, BasicProperties), AmqpError> {
    let data = serde_json::to_vec(body).map_err(|err| AmqpError::ParsePayloadError(err.to_string()))?;

    Ok((
        data,
        properties
            .unwrap_or_default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE)),
    ))
}

/// Serializes `model` to a mapping and encodes it like [`encode_json`].
/// Non-finite floats in the model become `null`.
pub(crate) fn encode_model<T: Serialize>(
    model: &T,
    properties: Option<BasicProperties>,
) -> Result<(Vec<u8>, BasicProperties), AmqpError> {
    match serde_json::to_value(model) {
        Ok(Value::Object(map)) => encode_json(&map, properties),
        Ok(other) => Err(AmqpError::ParsePayloadError(format!(
            "expected an object, got `{other}`"
        ))),
        Err(err) => Err(AmqpError::ParsePayloadError(err.to_string())),
    }
}

/// Header value accepted by [`headers`], mapped onto the matching AMQP field type.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    ShortString(String),
    LongString(String),
    Bool(bool),
    Int(i16),
    LongInt(i32),
    LongLongInt(i64),
    LongUint(u32),
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::LongString(value.to_owned())
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::LongLongInt(value)
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

/// Builds an AMQP header table.
///
/// # Parameters
/// * `values` - Header names and their values
///
/// # Returns
/// A field table ready for `BasicProperties::with_headers`
///
/// # Example
///
/// ```rust
/// use rabbitmq_topology::publisher::{headers, HeaderValue};
/// use std::collections::HashMap;
///
/// let table = headers(HashMap::from([
///     ("tenant".to_owned(), HeaderValue::from("acme")),
///     ("attempt".to_owned(), HeaderValue::from(2i64)),
/// ]));
/// assert_eq!(table.inner().len(), 2);
/// ```
pub fn headers(values: HashMap<String, HeaderValue>) -> FieldTable {
    let mut btree = BTreeMap::<ShortString, AMQPValue>::default();

    for (key, value) in values {
        let amqp_value = match value {
            HeaderValue::ShortString(v) => AMQPValue::ShortString(ShortString::from(v)),
            HeaderValue::LongString(v) => AMQPValue::LongString(LongString::from(v)),
            HeaderValue::Bool(v) => AMQPValue::Boolean(Boolean::from(v)),
            HeaderValue::Int(v) => AMQPValue::ShortInt(ShortInt::from(v)),
            HeaderValue::LongInt(v) => AMQPValue::LongInt(LongInt::from(v)),
            HeaderValue::LongLongInt(v) => AMQPValue::LongLongInt(LongLongInt::from(v)),
            HeaderValue::LongUint(v) => AMQPValue::LongUInt(LongUInt::from(v)),
        };

        btree.insert(ShortString::from(key), amqp_value);
    }

    FieldTable::from(btree)
}
