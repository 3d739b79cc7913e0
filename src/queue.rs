// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Builders for queue declarations and for the consumer attached to a queue.

use lapin::types::{AMQPValue, FieldTable, LongInt, ShortString};
use std::{collections::BTreeMap, time::Duration};

/// Constant for the header field used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the header field used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the header field used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// How long shutdown waits for a queue's in-flight handlers by default.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(20);

/// Consumer configuration of a queue.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerDefinition {
    pub(crate) tag: Option<String>,
    pub(crate) auto_ack: bool,
    pub(crate) exclusive: bool,
    pub(crate) arguments: BTreeMap<ShortString, AMQPValue>,
    pub(crate) allow_consuming: bool,
}

impl Default for ConsumerDefinition {
    fn default() -> Self {
        ConsumerDefinition {
            tag: None,
            auto_ack: false,
            exclusive: false,
            arguments: BTreeMap::default(),
            allow_consuming: true,
        }
    }
}

impl ConsumerDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a specific consumer tag instead of a server generated one.
    pub fn tag(mut self, tag: &str) -> Self {
        self.tag = Some(tag.to_owned());
        self
    }

    /// Deliveries are considered acknowledged as soon as the broker sends them.
    pub fn auto_ack(mut self) -> Self {
        self.auto_ack = true;
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn param(mut self, key: ShortString, value: AMQPValue) -> Self {
        self.arguments.insert(key, value);
        self
    }

    /// Declares and binds the queue without ever consuming from it.
    pub fn no_consuming(mut self) -> Self {
        self.allow_consuming = false;
        self
    }

    pub fn is_auto_ack(&self) -> bool {
        self.auto_ack
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn allows_consuming(&self) -> bool {
        self.allow_consuming
    }

    pub(crate) fn field_table(&self) -> FieldTable {
        FieldTable::from(self.arguments.clone())
    }
}

/// Definition of a RabbitMQ queue with its configuration parameters.
///
/// An empty name asks the broker to generate one; the generated name is
/// recorded when the declaration is acknowledged.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) passive: bool,
    pub(crate) ttl: Option<i32>,
    pub(crate) max_length: Option<i32>,
    pub(crate) max_length_bytes: Option<i32>,
    pub(crate) params: BTreeMap<ShortString, AMQPValue>,
    pub(crate) consumer: ConsumerDefinition,
    pub(crate) shutdown_timeout: Duration,
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name and default settings.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.trim().to_owned(),
            durable: false,
            delete: false,
            exclusive: false,
            passive: false,
            ttl: None,
            max_length: None,
            max_length_bytes: None,
            params: BTreeMap::default(),
            consumer: ConsumerDefinition::default(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn consumer_definition(&self) -> &ConsumerDefinition {
        &self.consumer
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the queue to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Sets the message Time-To-Live (TTL) for the queue, in milliseconds.
    pub fn ttl(mut self, ttl: i32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets the maximum number of messages the queue can hold.
    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Sets the maximum size in bytes the queue can hold.
    pub fn max_length_bytes(mut self, max_bytes: i32) -> Self {
        self.max_length_bytes = Some(max_bytes);
        self
    }

    /// Adds a single declare argument.
    pub fn param(mut self, key: ShortString, value: AMQPValue) -> Self {
        self.params.insert(key, value);
        self
    }

    pub fn consumer(mut self, consumer: ConsumerDefinition) -> Self {
        self.consumer = consumer;
        self
    }

    /// Bounds how long shutdown waits for this queue's in-flight handlers.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Declare arguments, with the TTL and length limits folded in.
    pub(crate) fn arguments(&self) -> FieldTable {
        let mut args = self.params.clone();

        if let Some(ttl) = self.ttl {
            args.insert(
                ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
                AMQPValue::LongInt(LongInt::from(ttl)),
            );
        }

        if let Some(max) = self.max_length {
            args.insert(
                ShortString::from(AMQP_HEADERS_MAX_LENGTH),
                AMQPValue::LongInt(LongInt::from(max)),
            );
        }

        if let Some(max) = self.max_length_bytes {
            args.insert(
                ShortString::from(AMQP_HEADERS_MAX_LENGTH_BYTES),
                AMQPValue::LongInt(LongInt::from(max)),
            );
        }

        FieldTable::from(args)
    }
}
