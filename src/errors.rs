// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ Client
//!
//! `AmqpError` covers both the errors raised while registering topology (programmer
//! errors caught at startup) and the errors reported by the transport at runtime.
//! Runtime publish failures are never raised: they travel inside a
//! [`PublishResult`](crate::publisher::PublishResult).

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// An exchange with the same (case-insensitive) name is already registered
    #[error("exchange `{0}` already exists")]
    ExchangeAlreadyExists(String),

    /// The exchange is neither registered nor a broker-reserved name
    #[error("exchange `{0}` not found")]
    ExchangeNotFound(String),

    /// The referenced queue is not registered in this topology
    #[error("queue not found{}", .0.as_deref().map(|n| format!(" `{n}`")).unwrap_or_default())]
    QueueNotFound(Option<String>),

    /// The routing key is not registered on the exchange
    #[error("routing key `{0}` not found")]
    RoutingKeyNotFound(String),

    /// The routing key is registered but its binding is not in place on the current channel
    #[error("routing key `{routing_key}` of exchange `{exchange}` not loaded")]
    RoutingKeyNotLoaded {
        routing_key: String,
        exchange: String,
    },

    /// There is no open channel to the broker
    #[error("channel not loaded")]
    ChannelNotLoaded,

    /// The client was never started or is not connected
    #[error("client not active")]
    ClientNotActive,

    /// The client is shutting down
    #[error("client in disconnecting state")]
    Disconnecting,

    /// The exchange type name is unknown
    #[error("invalid exchange kind `{0}`")]
    InvalidExchangeKind(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// Error creating or using a channel
    #[error("failure to create a channel `{0}`")]
    ChannelError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error starting a consumer on a queue
    #[error("failure to declare consumer `{0}`")]
    ConsumerDeclarationError(String),

    /// Error cancelling a consumer
    #[error("failure to cancel consumer `{0}`")]
    CancelConsumerError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error publishing a message
    #[error("failure to publish `{0}`")]
    PublishingError(String),

    /// Error encoding a message payload
    #[error("failure to parse payload `{0}`")]
    ParsePayloadError(String),
}
