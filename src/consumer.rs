// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Processing
//!
//! Runs one inbound delivery through the first matching handler and settles it
//! with the broker. Handler failures, including panics, are logged and the
//! delivery is acked so that a poison message cannot block its queue through
//! endless redelivery.

use crate::{
    errors::AmqpError,
    handler::{ConsumerMessage, HandlerResult},
    otel,
    topology::{QueueId, Topology},
    transport::{InboundDelivery, Transport},
};
use futures_util::FutureExt;
use opentelemetry::{
    global,
    trace::{Span, Status},
};
use std::{
    borrow::Cow,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tracing::{debug, error};

/// Everything a delivery task needs, shared by all of them.
pub(crate) struct DispatchContext {
    pub(crate) topology: Arc<Topology>,
    pub(crate) transport: Arc<dyn Transport>,
    /// Generation of the connection currently open.
    pub(crate) generation: Arc<AtomicU64>,
    pub(crate) debug: bool,
}

/// Processes a delivery received on `queue` (known to the broker as `queue_name`)
/// over the connection of generation `generation`.
///
/// Returns the result applied to the delivery. Settling is skipped for auto-ack
/// queues and when the connection the delivery came from is gone, since its
/// delivery tag means nothing on a newer channel.
pub(crate) async fn consume(
    ctx: &DispatchContext,
    generation: u64,
    queue: QueueId,
    queue_name: String,
    delivery: InboundDelivery,
) -> Result<HandlerResult, AmqpError> {
    let tracer = global::tracer(otel::CONSUMER_TRACER);
    let (cx, mut span) = otel::new_span(&delivery.properties, &tracer, &delivery.routing_key);

    let auto_ack = ctx
        .topology
        .queue(queue)
        .is_some_and(|def| def.consumer.auto_ack);
    let delivery_tag = delivery.delivery_tag;

    let msg = ConsumerMessage {
        queue: queue_name,
        delivery_tag,
        exchange: delivery.exchange,
        routing_key: delivery.routing_key,
        redelivered: delivery.redelivered,
        properties: delivery.properties,
        body: delivery.body,
    };

    let result = match ctx.topology.resolve_handler(queue, &msg.routing_key) {
        None => {
            if ctx.debug {
                debug!(
                    queue = msg.queue,
                    exchange = msg.exchange,
                    routing_key = msg.routing_key,
                    "unhandled delivery"
                );
            }
            HandlerResult::default()
        }

        Some(registration) => {
            match AssertUnwindSafe(registration.handler.exec(&cx, &msg))
                .catch_unwind()
                .await
            {
                Ok(Ok(result)) => result,
                Ok(Err(err)) => {
                    error!(
                        error = err.to_string(),
                        queue = msg.queue,
                        exchange = msg.exchange,
                        routing_key = msg.routing_key,
                        delivery_tag,
                        redelivered = msg.redelivered,
                        "handler failed, acking delivery"
                    );
                    span.record_error(&*err);
                    span.set_status(Status::Error {
                        description: Cow::from("handler failed"),
                    });
                    HandlerResult::Ack
                }
                Err(_) => {
                    error!(
                        queue = msg.queue,
                        exchange = msg.exchange,
                        routing_key = msg.routing_key,
                        delivery_tag,
                        redelivered = msg.redelivered,
                        "handler panicked, acking delivery"
                    );
                    span.set_status(Status::Error {
                        description: Cow::from("handler panicked"),
                    });
                    HandlerResult::Ack
                }
            }
        }
    };

    if auto_ack {
        return Ok(result);
    }

    if ctx.generation.load(Ordering::SeqCst) != generation {
        if ctx.debug {
            debug!(delivery_tag, "channel replaced, skipping settlement");
        }
        return Ok(result);
    }

    let settled = match result {
        HandlerResult::Ack => ctx.transport.basic_ack(delivery_tag).await,
        HandlerResult::Nack => ctx.transport.basic_nack(delivery_tag).await,
    };

    if let Err(err) = settled {
        span.record_error(&err);
        span.set_status(Status::Error {
            description: Cow::from("error to settle msg"),
        });
        return Err(err);
    }

    span.set_status(Status::Ok);
    Ok(result)
}
