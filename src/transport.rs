// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Transport Boundary
//!
//! The client drives the broker through the [`Transport`] trait: one connection and
//! one channel at a time, with async declare/bind/consume/publish primitives. The
//! byte-level protocol is the transport's business; [`LapinTransport`] is the
//! production implementation.
//!
//! Asynchronous notifications flow back through callbacks: a [`CloseCallback`] for
//! connection and channel closure, and a [`DeliverySink`] per consumer.
//!
//! [`LapinTransport`]: crate::channel::LapinTransport

use crate::{
    configs::ClientIdentity, errors::AmqpError, exchange::ExchangeDefinition,
    queue::QueueDefinition,
};
use async_trait::async_trait;
use lapin::BasicProperties;
use std::sync::Arc;

/// Why a connection or channel went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The broker closed it, e.g. a node restart or an operator action.
    ByBroker { code: u16, text: String },
    /// The client closed it on purpose.
    ByClient,
    /// Protocol, channel or I/O failure.
    Error(String),
}

/// A message delivered to one of our consumers.
#[derive(Debug, Clone)]
pub struct InboundDelivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub body: Vec<u8>,
}

/// Something that happened to a consumer.
#[derive(Debug, Clone)]
pub enum ConsumerEvent {
    Delivery(InboundDelivery),
    /// The consumer stopped receiving, either cancelled by the broker or because its
    /// channel went away.
    Cancelled,
}

pub type CloseCallback = Arc<dyn Fn(CloseReason) + Send + Sync>;

pub type DeliverySink = Arc<dyn Fn(ConsumerEvent) + Send + Sync>;

/// Async AMQP primitives over a single connection/channel pair.
///
/// Opening a connection replaces the previous one wholesale. Channel-level
/// operations fail with [`AmqpError::ChannelNotLoaded`] when no channel is open.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens the connection. `on_close` fires when it is lost.
    async fn open(
        &self,
        uri: &str,
        identity: &ClientIdentity,
        on_close: CloseCallback,
    ) -> Result<(), AmqpError>;

    /// Opens the channel on the current connection. `on_close` fires when it is lost.
    async fn open_channel(&self, on_close: CloseCallback) -> Result<(), AmqpError>;

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    /// Declares the queue and returns the name the broker assigned to it.
    async fn queue_declare(&self, def: &QueueDefinition) -> Result<String, AmqpError>;

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError>;

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    /// Puts the channel in publisher-confirm mode.
    async fn confirm_select(&self) -> Result<(), AmqpError>;

    /// Starts consuming and returns the consumer tag the broker confirmed.
    async fn basic_consume(
        &self,
        queue: &str,
        def: &QueueDefinition,
        sink: DeliverySink,
    ) -> Result<String, AmqpError>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    /// Rejects the delivery and asks the broker to requeue it.
    async fn basic_nack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;

    async fn close_channel(&self) -> Result<(), AmqpError>;

    /// Closes the connection (and its channel).
    async fn close(&self) -> Result<(), AmqpError>;
}
