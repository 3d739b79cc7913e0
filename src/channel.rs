// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel Management
//!
//! [`LapinTransport`] implements [`Transport`] on top of lapin. It owns the current
//! connection and channel, installs the close notifications, forwards consumer
//! streams into delivery sinks and maps lapin errors into [`AmqpError`].

use crate::{
    configs::ClientIdentity,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::QueueDefinition,
    transport::{
        CloseCallback, CloseReason, ConsumerEvent, DeliverySink, InboundDelivery, Transport,
    },
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

const REPLY_SUCCESS: u16 = 200;

/// lapin-backed transport holding one connection/channel pair at a time.
#[derive(Default)]
pub struct LapinTransport {
    connection: RwLock<Option<Connection>>,
    channel: RwLock<Option<Channel>>,
    confirms: AtomicBool,
}

impl LapinTransport {
    pub fn new() -> Self {
        Self::default()
    }

    async fn channel(&self) -> Result<Channel, AmqpError> {
        self.channel
            .read()
            .await
            .clone()
            .ok_or(AmqpError::ChannelNotLoaded)
    }
}

/// Maps a lapin error reported by a close notification.
fn close_reason(err: &lapin::Error) -> CloseReason {
    match err {
        lapin::Error::ProtocolError(amqp) => CloseReason::ByBroker {
            code: amqp.get_id(),
            text: amqp.get_message().to_string(),
        },
        other => CloseReason::Error(other.to_string()),
    }
}

fn connection_properties(identity: &ClientIdentity) -> ConnectionProperties {
    let mut props = ConnectionProperties::default()
        .with_connection_name(LongString::from(identity.product.clone()));

    props.client_properties.insert(
        ShortString::from("product"),
        AMQPValue::LongString(LongString::from(identity.product.clone())),
    );
    if let Some(info) = &identity.information {
        props.client_properties.insert(
            ShortString::from("information"),
            AMQPValue::LongString(LongString::from(info.clone())),
        );
    }

    props
}

impl From<Delivery> for InboundDelivery {
    fn from(delivery: Delivery) -> Self {
        InboundDelivery {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            redelivered: delivery.redelivered,
            properties: delivery.properties,
            body: delivery.data,
        }
    }
}

#[async_trait]
impl Transport for LapinTransport {
    async fn open(
        &self,
        uri: &str,
        identity: &ClientIdentity,
        on_close: CloseCallback,
    ) -> Result<(), AmqpError> {
        debug!("creating amqp connection...");

        let conn = match Connection::connect(uri, connection_properties(identity)).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }?;

        conn.on_error(move |err| on_close(close_reason(&err)));
        debug!("amqp connected");

        self.channel.write().await.take();
        self.confirms.store(false, Ordering::Release);
        *self.connection.write().await = Some(conn);
        Ok(())
    }

    async fn open_channel(&self, on_close: CloseCallback) -> Result<(), AmqpError> {
        debug!("creating amqp channel...");

        let guard = self.connection.read().await;
        let Some(conn) = guard.as_ref() else {
            return Err(AmqpError::ConnectionError("no open connection".to_owned()));
        };

        let channel = match conn.create_channel().await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }?;
        drop(guard);

        channel.on_error(move |err| on_close(close_reason(&err)));
        debug!("channel created");

        *self.channel.write().await = Some(channel);
        Ok(())
    }

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let channel = self.channel().await?;

        channel
            .exchange_declare(
                &def.name,
                def.kind.into(),
                ExchangeDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: def.internal,
                    nowait: false,
                },
                FieldTable::from(def.params.clone()),
            )
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    name = def.name,
                    "error to declare the exchange"
                );
                AmqpError::DeclareExchangeError(def.name.clone())
            })
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<String, AmqpError> {
        let channel = self.channel().await?;

        match channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: false,
                },
                def.arguments(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name = def.name, "error to declare the queue");
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
            Ok(queue) => Ok(queue.name().to_string()),
        }
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        let channel = self.channel().await?;

        channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                AmqpError::BindingExchangeToQueueError(exchange.to_owned(), queue.to_owned())
            })
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        let channel = self.channel().await?;

        channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn confirm_select(&self) -> Result<(), AmqpError> {
        let channel = self.channel().await?;

        channel
            .confirm_select(ConfirmSelectOptions { nowait: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to enable publisher confirms");
                AmqpError::ChannelError(err.to_string())
            })?;

        self.confirms.store(true, Ordering::Release);
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        def: &QueueDefinition,
        sink: DeliverySink,
    ) -> Result<String, AmqpError> {
        let channel = self.channel().await?;

        let mut consumer = channel
            .basic_consume(
                queue,
                def.consumer.tag.as_deref().unwrap_or_default(),
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: def.consumer.auto_ack,
                    exclusive: def.consumer.exclusive,
                    nowait: false,
                },
                def.consumer.field_table(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), queue, "error to create the consumer");
                AmqpError::ConsumerDeclarationError(queue.to_owned())
            })?;

        let tag = consumer.tag().to_string();

        tokio::spawn(async move {
            while let Some(result) = consumer.next().await {
                match result {
                    Ok(delivery) => sink(ConsumerEvent::Delivery(delivery.into())),
                    Err(err) => error!(error = err.to_string(), "errors consume msg"),
                }
            }
            sink(ConsumerEvent::Cancelled);
        });

        Ok(tag)
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        let channel = self.channel().await?;

        channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), delivery_tag, "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn basic_nack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        let channel = self.channel().await?;

        channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue: true,
                },
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), delivery_tag, "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        let channel = self.channel().await?;

        channel
            .basic_cancel(consumer_tag, BasicCancelOptions { nowait: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), consumer_tag, "error to cancel the consumer");
                AmqpError::CancelConsumerError(consumer_tag.to_owned())
            })
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        let channel = self.channel().await?;

        let confirm = channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                body,
                properties,
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error publishing message");
                AmqpError::PublishingError(err.to_string())
            })?;

        if self.confirms.load(Ordering::Acquire) {
            tokio::spawn(async move {
                match confirm.await {
                    Ok(Confirmation::Ack(_)) => debug!("received publisher ack"),
                    Ok(Confirmation::Nack(_)) => warn!("received publisher nack"),
                    Ok(Confirmation::NotRequested) => {}
                    Err(err) => error!(error = err.to_string(), "publisher confirm failed"),
                }
            });
        }

        Ok(())
    }

    async fn close_channel(&self) -> Result<(), AmqpError> {
        let Some(channel) = self.channel.write().await.take() else {
            return Ok(());
        };

        debug!("closing amqp channel");
        channel
            .close(REPLY_SUCCESS, "closing channel")
            .await
            .map_err(|err| {
                warn!(error = err.to_string(), "error to close the channel");
                AmqpError::ChannelError(err.to_string())
            })
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.channel.write().await.take();
        let Some(conn) = self.connection.write().await.take() else {
            return Ok(());
        };

        debug!("closing amqp connection");
        conn.close(REPLY_SUCCESS, "closing connection")
            .await
            .map_err(|err| {
                warn!(error = err.to_string(), "error to close the connection");
                AmqpError::ConnectionError(err.to_string())
            })
    }
}
