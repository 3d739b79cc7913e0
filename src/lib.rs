// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Client
//!
//! Declares a registered AMQP topology (exchanges, queues, bindings), keeps it
//! declared across reconnections, dispatches deliveries to registered handlers
//! and publishes messages. See [`client::AmqpClient`] for the entry point.

mod consumer;
mod dispatcher;
mod otel;
mod session;
mod setup;

pub mod channel;
pub mod client;
pub mod configs;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod publisher;
pub mod queue;
pub mod topology;
pub mod transport;

pub use client::{AmqpClient, ClientStatus};
pub use errors::AmqpError;
pub use publisher::PublishResult;
pub use topology::Topology;
