// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Registry
//!
//! The registry holds the exchanges, queues, bindings, routing keys and handler
//! registrations the application declares at startup. It is pure data: nothing
//! here talks to the broker. Once handed to an
//! [`AmqpClient`](crate::client::AmqpClient) the topology is frozen and redeclared
//! on every connection.
//!
//! Identity rules:
//! - exchanges are unique by case-insensitive name
//! - queues are unique by exact name, except exclusive consumers (always new) and
//!   auto-ack queues (never reused)
//! - a queue has at most one binding per (exchange, routing key) pair

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    handler::{ConsumerHandler, HandlerRegistration},
    queue::QueueDefinition,
};
use std::sync::Arc;
use tracing::debug;

/// Handle to a registered exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExchangeId(pub(crate) usize);

/// Handle to a registered queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueId(pub(crate) usize);

/// Handle to a registered binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindingId(pub(crate) usize);

/// Handle to a registered routing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RoutingKeyId(pub(crate) usize);

/// Handle to a registered consumer handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(pub(crate) usize);

/// Association between a queue and an exchange, optionally filtered by a routing key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub(crate) exchange: ExchangeId,
    pub(crate) routing_key: Option<RoutingKeyId>,
    pub(crate) queue: QueueId,
}

impl Binding {
    /// Exchange the queue is bound to.
    pub fn exchange(&self) -> ExchangeId {
        self.exchange
    }

    /// Routing key filtering the binding. `None` binds with the queue name.
    pub fn routing_key(&self) -> Option<RoutingKeyId> {
        self.routing_key
    }

    pub fn queue(&self) -> QueueId {
        self.queue
    }
}

/// Routing key scoped to one exchange and pointing at one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingKey {
    pub(crate) name: String,
    pub(crate) exchange: ExchangeId,
    pub(crate) queue: QueueId,
    pub(crate) binding: BindingId,
}

impl RoutingKey {
    /// The key as sent to the broker, trimmed.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Binding created for this key.
    pub fn binding(&self) -> BindingId {
        self.binding
    }
}

/// How [`Topology::add_routing_key`] finds the target queue.
#[derive(Debug, Clone)]
pub enum QueueRef {
    /// Resolve (or create) the queue through [`Topology::add_queue`].
    Definition(QueueDefinition),
    /// A queue that must already be registered.
    Id(QueueId),
}

impl From<QueueDefinition> for QueueRef {
    fn from(def: QueueDefinition) -> Self {
        QueueRef::Definition(def)
    }
}

impl From<QueueId> for QueueRef {
    fn from(id: QueueId) -> Self {
        QueueRef::Id(id)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct RegisteredExchange {
    pub(crate) def: ExchangeDefinition,
    pub(crate) routing_keys: Vec<RoutingKeyId>,
}

#[derive(Debug, Clone)]
pub(crate) struct RegisteredQueue {
    pub(crate) def: QueueDefinition,
    pub(crate) bindings: Vec<BindingId>,
}

/// Registry of the exchanges, queues, bindings and handlers of one client.
#[derive(Default, Clone)]
pub struct Topology {
    pub(crate) exchanges: Vec<RegisteredExchange>,
    pub(crate) queues: Vec<RegisteredQueue>,
    pub(crate) bindings: Vec<Binding>,
    pub(crate) routing_keys: Vec<RoutingKey>,
    pub(crate) handlers: Vec<HandlerRegistration>,
}

impl Topology {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the exchange registered under `def`'s name (case-insensitive), or
    /// registers `def`.
    ///
    /// # Parameters
    /// * `def` - Exchange to register when no exchange of that name exists
    ///
    /// # Returns
    /// The id of the existing or newly registered exchange
    pub fn add_exchange(&mut self, def: ExchangeDefinition) -> ExchangeId {
        match self.find_exchange_ignore_case(&def.name) {
            Some(id) => id,
            None => self.push_exchange(def),
        }
    }

    /// Registers `def`, failing if an exchange with the same case-insensitive name
    /// already exists.
    ///
    /// # Parameters
    /// * `def` - Exchange to register
    ///
    /// # Returns
    /// The new exchange id, or `ExchangeAlreadyExists` carrying the name
    pub fn insert_exchange(&mut self, def: ExchangeDefinition) -> Result<ExchangeId, AmqpError> {
        if self.find_exchange_ignore_case(&def.name).is_some() {
            return Err(AmqpError::ExchangeAlreadyExists(def.name));
        }

        Ok(self.push_exchange(def))
    }

    fn push_exchange(&mut self, def: ExchangeDefinition) -> ExchangeId {
        debug!(name = def.name, "registering exchange");
        self.exchanges.push(RegisteredExchange {
            def,
            routing_keys: vec![],
        });
        ExchangeId(self.exchanges.len() - 1)
    }

    fn find_exchange_ignore_case(&self, name: &str) -> Option<ExchangeId> {
        self.exchanges
            .iter()
            .position(|e| e.def.same_name(name))
            .map(ExchangeId)
    }

    /// Exact-name lookup, as used when publishing.
    pub fn find_exchange(&self, name: &str) -> Option<ExchangeId> {
        self.exchanges
            .iter()
            .position(|e| e.def.name == name)
            .map(ExchangeId)
    }

    /// Returns the queue registered under `def`'s name, or registers `def`.
    ///
    /// Exclusive consumers always get a new queue, and queues consumed with
    /// auto-ack are never reused since such queues may coexist.
    ///
    /// # Parameters
    /// * `def` - Queue and consumer settings
    ///
    /// # Returns
    /// The id of the reused or newly registered queue
    pub fn add_queue(&mut self, def: QueueDefinition) -> QueueId {
        if !def.consumer.exclusive {
            let existing = self
                .queues
                .iter()
                .position(|q| !q.def.consumer.auto_ack && q.def.name == def.name);
            if let Some(idx) = existing {
                return QueueId(idx);
            }
        }

        debug!(name = def.name, "registering queue");
        self.queues.push(RegisteredQueue {
            def,
            bindings: vec![],
        });
        QueueId(self.queues.len() - 1)
    }

    /// Routes `routing_key` on `exchange` to a queue.
    ///
    /// With [`QueueRef::Definition`] an existing routing key of the same name on the
    /// exchange is returned as is (unless the consumer is exclusive); otherwise the
    /// queue is resolved through [`add_queue`](Self::add_queue). With [`QueueRef::Id`]
    /// the queue must be registered, and the queue's existing binding for the same
    /// (exchange, key) pair is reused.
    ///
    /// # Parameters
    /// * `exchange` - Exchange the key is published on
    /// * `routing_key` - Key to route; surrounding whitespace is ignored
    /// * `queue` - Target queue, as a definition or a registered id
    ///
    /// # Returns
    /// The routing key id, or `ExchangeNotFound`/`QueueNotFound` for unknown ids
    pub fn add_routing_key(
        &mut self,
        exchange: ExchangeId,
        routing_key: &str,
        queue: impl Into<QueueRef>,
    ) -> Result<RoutingKeyId, AmqpError> {
        let routing_key = routing_key.trim();
        self.exchange_entry(exchange)?;

        let queue = match queue.into() {
            QueueRef::Definition(def) => {
                if !def.consumer.exclusive {
                    if let Some(id) = self.find_routing_key(exchange, routing_key, None) {
                        return Ok(id);
                    }
                }
                self.add_queue(def)
            }
            QueueRef::Id(id) => {
                let entry = self
                    .queues
                    .get(id.0)
                    .ok_or(AmqpError::QueueNotFound(None))?;
                if !entry.def.consumer.exclusive {
                    if let Some(existing) = self.find_routing_key(exchange, routing_key, Some(id))
                    {
                        return Ok(existing);
                    }
                }
                id
            }
        };

        let key_id = RoutingKeyId(self.routing_keys.len());
        let binding = self.push_binding(exchange, Some(key_id), queue);
        self.routing_keys.push(RoutingKey {
            name: routing_key.to_owned(),
            exchange,
            queue,
            binding,
        });
        self.exchanges[exchange.0].routing_keys.push(key_id);

        Ok(key_id)
    }

    /// Binds `queue` to `exchange` without a routing key. The broker binding then
    /// uses the queue's name as key. Binding twice returns the first binding.
    ///
    /// # Returns
    /// The binding id, or `ExchangeNotFound`/`QueueNotFound` for unknown ids
    pub fn bind_queue(
        &mut self,
        queue: QueueId,
        exchange: ExchangeId,
    ) -> Result<BindingId, AmqpError> {
        self.exchange_entry(exchange)?;
        let entry = self
            .queues
            .get(queue.0)
            .ok_or(AmqpError::QueueNotFound(None))?;

        let existing = entry.bindings.iter().copied().find(|b| {
            let binding = &self.bindings[b.0];
            binding.exchange == exchange && binding.routing_key.is_none()
        });

        Ok(match existing {
            Some(id) => id,
            None => self.push_binding(exchange, None, queue),
        })
    }

    /// Registers an exchange and routes `routing_key` from it to `queue`.
    ///
    /// # Parameters
    /// * `exchange` - Exchange to find or register, see [`add_exchange`](Self::add_exchange)
    /// * `routing_key` - Key routed from the exchange to the queue
    /// * `queue` - Queue to find or register, see [`add_queue`](Self::add_queue)
    ///
    /// # Returns
    /// The exchange id
    pub fn add_pipeline(
        &mut self,
        exchange: ExchangeDefinition,
        routing_key: &str,
        queue: QueueDefinition,
    ) -> Result<ExchangeId, AmqpError> {
        let id = self.add_exchange(exchange);
        self.add_routing_key(id, routing_key, queue)?;
        Ok(id)
    }

    /// Registers a handler for deliveries on `queue`, optionally only for one
    /// routing key. Handlers are evaluated in registration order and the first
    /// match wins.
    ///
    /// # Parameters
    /// * `queue` - Registered queue the handler consumes from
    /// * `routing_key` - Only handle deliveries with this key; `None` handles all
    /// * `handler` - Handler invoked once per delivery
    ///
    /// # Returns
    /// The handler id, or `QueueNotFound` when `queue` is not registered
    pub fn register_handler(
        &mut self,
        queue: QueueId,
        routing_key: Option<&str>,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<HandlerId, AmqpError> {
        if queue.0 >= self.queues.len() {
            return Err(AmqpError::QueueNotFound(None));
        }

        self.handlers.push(HandlerRegistration {
            queue,
            routing_key: routing_key.map(|k| k.trim().to_owned()),
            handler,
        });
        Ok(HandlerId(self.handlers.len() - 1))
    }

    /// First registration matching the queue and, when it filters on one, the
    /// routing key.
    pub fn resolve_handler(&self, queue: QueueId, routing_key: &str) -> Option<&HandlerRegistration> {
        self.handlers.iter().find(|h| h.matches(queue, routing_key))
    }

    /// Looks up a routing key registered on `exchange`.
    pub fn routing_key(
        &self,
        exchange: ExchangeId,
        routing_key: &str,
    ) -> Result<RoutingKeyId, AmqpError> {
        self.find_routing_key(exchange, routing_key.trim(), None)
            .ok_or_else(|| AmqpError::RoutingKeyNotFound(routing_key.to_owned()))
    }

    /// Definition of a registered exchange.
    pub fn exchange(&self, id: ExchangeId) -> Option<&ExchangeDefinition> {
        self.exchanges.get(id.0).map(|e| &e.def)
    }

    /// Definition of a registered queue.
    pub fn queue(&self, id: QueueId) -> Option<&QueueDefinition> {
        self.queues.get(id.0).map(|q| &q.def)
    }

    pub fn binding(&self, id: BindingId) -> Option<&Binding> {
        self.bindings.get(id.0)
    }

    pub fn routing_key_entry(&self, id: RoutingKeyId) -> Option<&RoutingKey> {
        self.routing_keys.get(id.0)
    }

    pub fn exchange_count(&self) -> usize {
        self.exchanges.len()
    }

    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    pub fn binding_count(&self) -> usize {
        self.bindings.len()
    }

    /// Bindings owned by `queue`, in registration order.
    pub fn queue_bindings(&self, queue: QueueId) -> &[BindingId] {
        self.queues
            .get(queue.0)
            .map(|q| q.bindings.as_slice())
            .unwrap_or_default()
    }

    /// Routing keys owned by `exchange`, in registration order.
    pub fn exchange_routing_keys(&self, exchange: ExchangeId) -> &[RoutingKeyId] {
        self.exchanges
            .get(exchange.0)
            .map(|e| e.routing_keys.as_slice())
            .unwrap_or_default()
    }

    fn exchange_entry(&self, id: ExchangeId) -> Result<&RegisteredExchange, AmqpError> {
        self.exchanges
            .get(id.0)
            .ok_or_else(|| AmqpError::ExchangeNotFound(format!("#{}", id.0)))
    }

    fn find_routing_key(
        &self,
        exchange: ExchangeId,
        routing_key: &str,
        queue: Option<QueueId>,
    ) -> Option<RoutingKeyId> {
        self.exchanges.get(exchange.0)?.routing_keys.iter().copied().find(|id| {
            let key = &self.routing_keys[id.0];
            key.name == routing_key && queue.map_or(true, |q| key.queue == q)
        })
    }

    fn push_binding(
        &mut self,
        exchange: ExchangeId,
        routing_key: Option<RoutingKeyId>,
        queue: QueueId,
    ) -> BindingId {
        let id = BindingId(self.bindings.len());
        self.bindings.push(Binding {
            exchange,
            routing_key,
            queue,
        });
        self.queues[queue.0].bindings.push(id);
        id
    }
}
