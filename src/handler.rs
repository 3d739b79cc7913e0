// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Handlers
//!
//! Application code receives deliveries through [`ConsumerHandler`]
//! implementations registered on the [`Topology`](crate::topology::Topology).

use crate::topology::QueueId;
use async_trait::async_trait;
use lapin::BasicProperties;
use opentelemetry::Context;
use std::{fmt, future::Future, marker::PhantomData, sync::Arc};

/// Error type handlers may fail with. Failures are logged and the delivery acked.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// What to do with a delivery once its handler returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HandlerResult {
    #[default]
    Ack,
    /// Reject and requeue.
    Nack,
}

/// A delivery as seen by a handler.
#[derive(Debug, Clone)]
pub struct ConsumerMessage {
    pub queue: String,
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub body: Vec<u8>,
}

#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    /// Processes one delivery. `ctx` carries the trace context propagated by the
    /// publisher, if any.
    async fn exec(&self, ctx: &Context, msg: &ConsumerMessage)
        -> Result<HandlerResult, HandlerError>;
}

/// Adapter turning an async closure into a [`ConsumerHandler`].
pub struct FnHandler<F, Fut> {
    func: F,
    _fut: PhantomData<fn() -> Fut>,
}

/// Wraps `func` as a shareable handler.
pub fn handler_fn<F, Fut>(func: F) -> Arc<dyn ConsumerHandler>
where
    F: Fn(ConsumerMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HandlerResult, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler {
        func,
        _fut: PhantomData,
    })
}

#[async_trait]
impl<F, Fut> ConsumerHandler for FnHandler<F, Fut>
where
    F: Fn(ConsumerMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HandlerResult, HandlerError>> + Send + 'static,
{
    async fn exec(
        &self,
        _ctx: &Context,
        msg: &ConsumerMessage,
    ) -> Result<HandlerResult, HandlerError> {
        (self.func)(msg.clone()).await
    }
}

/// A handler bound to a queue and an optional routing-key filter.
#[derive(Clone)]
pub struct HandlerRegistration {
    pub(crate) queue: QueueId,
    pub(crate) routing_key: Option<String>,
    pub(crate) handler: Arc<dyn ConsumerHandler>,
}

impl HandlerRegistration {
    pub fn queue(&self) -> QueueId {
        self.queue
    }

    pub fn routing_key(&self) -> Option<&str> {
        self.routing_key.as_deref()
    }

    pub(crate) fn matches(&self, queue: QueueId, routing_key: &str) -> bool {
        self.queue == queue
            && self
                .routing_key
                .as_deref()
                .map_or(true, |filter| filter == routing_key)
    }
}

impl fmt::Debug for HandlerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistration")
            .field("queue", &self.queue)
            .field("routing_key", &self.routing_key)
            .finish_non_exhaustive()
    }
}
