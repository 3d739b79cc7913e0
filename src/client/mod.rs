// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Client
//!
//! [`AmqpClient`] is a cheap, cloneable handle onto a single event-loop task. The
//! loop owns every piece of mutable state (connection flags, the per-connection
//! [`Session`], in-flight handler tasks, the reconnect timer) and is the only place
//! it is touched. Transport calls run in spawned tasks that post their outcome back
//! to the loop as an [`Event`].
//!
//! Every connection attempt gets a new generation number. Events carry the
//! generation they were produced under and are discarded once it is superseded, so
//! callbacks bound to a dead connection cannot disturb its successor.
//!
//! ## Example
//!
//! ```rust,no_run
//! use rabbitmq_topology::{
//!     client::AmqpClient,
//!     configs::RabbitMQConfigs,
//!     exchange::ExchangeDefinition,
//!     handler::{handler_fn, HandlerResult},
//!     queue::QueueDefinition,
//!     topology::Topology,
//! };
//!
//! # async fn run() -> Result<(), rabbitmq_topology::errors::AmqpError> {
//! let mut topology = Topology::new();
//! let orders = topology.add_exchange(ExchangeDefinition::new("orders").durable());
//! let inbox = topology.add_queue(QueueDefinition::new("orders.inbox").durable());
//! topology.add_routing_key(orders, "created", inbox)?;
//! topology.register_handler(
//!     inbox,
//!     Some("created"),
//!     handler_fn(|_msg| async { Ok(HandlerResult::Ack) }),
//! )?;
//!
//! let client = AmqpClient::new(&RabbitMQConfigs::default(), topology);
//! client.start().await?;
//! client.wait_ready().await?;
//!
//! let result = client.publish_string("orders", "created", "{}", None).await?;
//! if let Some(err) = result.error {
//!     eprintln!("publish failed: {err}");
//! }
//!
//! client.shutdown().await?;
//! # Ok(())
//! # }
//! ```

mod reconnect;
mod shutdown;

use crate::{
    channel::LapinTransport,
    configs::{ClientIdentity, RabbitMQConfigs},
    consumer::{self, DispatchContext},
    errors::AmqpError,
    exchange::is_reserved_exchange,
    publisher::{self, PublishRequest, PublishResult},
    session::{BindState, Session},
    setup::{SetupAck, SetupOptions, SetupStep},
    topology::{QueueId, Topology},
    transport::{
        CloseCallback, CloseReason, ConsumerEvent, DeliverySink, InboundDelivery, Transport,
    },
};
use lapin::BasicProperties;
use reconnect::Reconnect;
use serde::Serialize;
use serde_json::{Map, Value};
use std::{
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::AbortHandle,
};
use tracing::{debug, error, info, warn};

/// Observable client state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientStatus {
    /// `start()` was called and the client has not been closed since.
    pub active: bool,
    /// The whole topology is declared, bound and consuming.
    pub ready: bool,
    pub reconnect_scheduled: bool,
}

pub(crate) enum Event {
    Start(oneshot::Sender<Result<(), AmqpError>>),
    Shutdown(oneshot::Sender<()>),
    Publish(PublishRequest, oneshot::Sender<PublishResult>),

    Opened(u64),
    OpenFailed(u64, AmqpError),
    ChannelOpened(u64),
    Closed(u64, CloseReason),
    ChannelClosed(u64, CloseReason),

    Setup(u64, SetupAck),
    SetupFailed(u64, AmqpError),

    Consumer(u64, QueueId, ConsumerEvent),
    HandlerFinished {
        generation: u64,
        queue: QueueId,
        task: u64,
    },

    DrainTimeout(u64, QueueId),
    CancelOk(u64, QueueId),
    ReconnectTimer,
}

impl Event {
    /// Generation an event is bound to, if any.
    fn generation(&self) -> Option<u64> {
        match self {
            Event::Opened(g)
            | Event::OpenFailed(g, _)
            | Event::ChannelOpened(g)
            | Event::Closed(g, _)
            | Event::ChannelClosed(g, _)
            | Event::Setup(g, _)
            | Event::SetupFailed(g, _)
            | Event::Consumer(g, _, _)
            | Event::HandlerFinished { generation: g, .. }
            | Event::DrainTimeout(g, _)
            | Event::CancelOk(g, _) => Some(*g),
            Event::Start(_) | Event::Shutdown(_) | Event::Publish(..) | Event::ReconnectTimer => {
                None
            }
        }
    }
}

/// Sending half used by the loop's own tasks and callbacks. It does not keep the
/// loop alive: once every [`AmqpClient`] handle is dropped the loop stops.
#[derive(Clone)]
pub(crate) struct EventSink(mpsc::WeakUnboundedSender<Event>);

impl EventSink {
    pub(crate) fn new(events: &mpsc::UnboundedSender<Event>) -> Self {
        EventSink(events.downgrade())
    }

    pub(crate) fn send(&self, event: Event) {
        if let Some(events) = self.0.upgrade() {
            let _ = events.send(event);
        }
    }
}

/// Handle onto a running client. Clones share the same connection.
#[derive(Clone)]
pub struct AmqpClient {
    topology: Arc<Topology>,
    events: mpsc::UnboundedSender<Event>,
    status: watch::Receiver<ClientStatus>,
}

impl AmqpClient {
    /// Creates a client over lapin. Must be called within a Tokio runtime.
    ///
    /// # Parameters
    /// * `cfg` - Connection settings and client behaviour flags
    /// * `topology` - Registry declared on every connection; frozen from here on
    ///
    /// # Returns
    /// An idle client. Nothing connects until [`start`](Self::start)
    pub fn new(cfg: &RabbitMQConfigs, topology: Topology) -> Self {
        Self::with_transport(cfg, topology, Arc::new(LapinTransport::new()))
    }

    /// Creates a client over any [`Transport`]. Must be called within a Tokio
    /// runtime.
    pub fn with_transport(
        cfg: &RabbitMQConfigs,
        topology: Topology,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let topology = Arc::new(topology);
        let (events, rx) = mpsc::unbounded_channel();
        let (client_loop, status) =
            ClientLoop::new(cfg, topology.clone(), transport, EventSink::new(&events));
        tokio::spawn(client_loop.run(rx));

        AmqpClient {
            topology,
            events,
            status,
        }
    }

    /// The registry this client declares.
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Latest status published by the event loop.
    pub fn status(&self) -> ClientStatus {
        *self.status.borrow()
    }

    /// Waits until the topology is fully declared and every consumer confirmed.
    pub async fn wait_ready(&self) -> Result<(), AmqpError> {
        let mut status = self.status.clone();
        status
            .wait_for(|s| s.ready)
            .await
            .map(|_| ())
            .map_err(|_| AmqpError::InternalError)
    }

    /// Begins connecting. Returns once the attempt is under way; it is a no-op
    /// while the client is already active.
    ///
    /// # Returns
    /// `Disconnecting` while a shutdown is in progress, otherwise Ok(())
    pub async fn start(&self) -> Result<(), AmqpError> {
        self.request(Event::Start).await?
    }

    /// Stops consuming, drains in-flight handlers within each queue's shutdown
    /// timeout and closes the connection. No reconnection happens afterwards.
    pub async fn shutdown(&self) -> Result<(), AmqpError> {
        self.request(Event::Shutdown).await
    }

    /// Publishes raw bytes to `exchange`, which must be registered or be the
    /// default/`amq.*` exchange.
    ///
    /// Only an unknown exchange is raised; every other failure is reported in
    /// the returned [`PublishResult`].
    ///
    /// # Parameters
    /// * `exchange` - Exchange name, matched exactly
    /// * `routing_key` - Routing key of the message
    /// * `body` - Raw payload
    /// * `properties` - Message properties; a message id is added when missing
    ///
    /// # Returns
    /// The publish outcome, or `ExchangeNotFound`
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: Option<BasicProperties>,
    ) -> Result<PublishResult, AmqpError> {
        let exchange = self.resolve_exchange(exchange)?;
        self.send_publish(PublishRequest::new(
            exchange,
            routing_key,
            body.to_vec(),
            properties.unwrap_or_default(),
        ))
        .await
    }

    /// Publishes a string as `text/plain`.
    pub async fn publish_string(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &str,
        properties: Option<BasicProperties>,
    ) -> Result<PublishResult, AmqpError> {
        let exchange = self.resolve_exchange(exchange)?;
        let (body, properties) = publisher::encode_text(body, properties);
        self.send_publish(PublishRequest::new(exchange, routing_key, body, properties))
            .await
    }

    /// Publishes a mapping as `application/json`, keys sorted.
    ///
    /// # Returns
    /// The publish outcome, or `ExchangeNotFound`/`ParsePayloadError`
    pub async fn publish_json(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &Map<String, Value>,
        properties: Option<BasicProperties>,
    ) -> Result<PublishResult, AmqpError> {
        let exchange = self.resolve_exchange(exchange)?;
        let (body, properties) = publisher::encode_json(body, properties)?;
        self.send_publish(PublishRequest::new(exchange, routing_key, body, properties))
            .await
    }

    /// Publishes a serializable model as `application/json`. The model must
    /// serialize to an object; non-finite floats are written as `null`.
    ///
    /// # Returns
    /// The publish outcome, or `ExchangeNotFound`/`ParsePayloadError`
    pub async fn publish_model<T: Serialize>(
        &self,
        exchange: &str,
        routing_key: &str,
        model: &T,
        properties: Option<BasicProperties>,
    ) -> Result<PublishResult, AmqpError> {
        let exchange = self.resolve_exchange(exchange)?;
        let (body, properties) = publisher::encode_model(model, properties)?;
        self.send_publish(PublishRequest::new(exchange, routing_key, body, properties))
            .await
    }

    /// Publishes through a routing key registered on `exchange`. The message is
    /// only sent when the key's binding is in place on the current channel.
    ///
    /// # Parameters
    /// * `exchange` - Registered exchange name
    /// * `routing_key` - Key registered on that exchange
    /// * `body` - Raw payload
    /// * `properties` - Message properties
    ///
    /// # Returns
    /// `ExchangeNotFound` or `RoutingKeyNotFound` for unregistered names. A
    /// binding not yet in place is reported as `RoutingKeyNotLoaded` in the result
    pub async fn publish_on_route(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: Option<BasicProperties>,
    ) -> Result<PublishResult, AmqpError> {
        let exchange_id = self
            .topology
            .find_exchange(exchange)
            .ok_or_else(|| AmqpError::ExchangeNotFound(exchange.to_owned()))?;
        let key = self.topology.routing_key(exchange_id, routing_key)?;
        let binding = self
            .topology
            .routing_key_entry(key)
            .map(|entry| entry.binding())
            .ok_or_else(|| AmqpError::RoutingKeyNotFound(routing_key.to_owned()))?;

        let request = PublishRequest::new(
            exchange.to_owned(),
            routing_key,
            body.to_vec(),
            properties.unwrap_or_default(),
        )
        .on_route(binding);
        self.send_publish(request).await
    }

    fn resolve_exchange(&self, name: &str) -> Result<String, AmqpError> {
        if let Some(def) = self
            .topology
            .find_exchange(name)
            .and_then(|id| self.topology.exchange(id))
        {
            return Ok(def.name().to_owned());
        }

        if is_reserved_exchange(name) {
            return Ok(name.to_owned());
        }

        Err(AmqpError::ExchangeNotFound(name.to_owned()))
    }

    async fn send_publish(&self, request: PublishRequest) -> Result<PublishResult, AmqpError> {
        self.request(|reply| Event::Publish(request, reply)).await
    }

    async fn request<T>(
        &self,
        event: impl FnOnce(oneshot::Sender<T>) -> Event,
    ) -> Result<T, AmqpError> {
        let (tx, rx) = oneshot::channel();
        self.events
            .send(event(tx))
            .map_err(|_| AmqpError::InternalError)?;
        rx.await.map_err(|_| AmqpError::InternalError)
    }
}

/// State owned by the event loop.
pub(crate) struct ClientLoop {
    topology: Arc<Topology>,
    transport: Arc<dyn Transport>,
    context: Arc<DispatchContext>,
    uri: String,
    identity: ClientIdentity,
    opts: SetupOptions,
    reconnect_enabled: bool,
    debug: bool,
    sink: EventSink,
    status: watch::Sender<ClientStatus>,
    generation: Arc<AtomicU64>,
    session: Session,

    active: bool,
    /// Whether a close should be followed by a reconnect.
    recover: bool,
    connected: bool,
    channel_open: bool,
    /// The current connection is being closed by us.
    closing: bool,
    ready: bool,
    connect_task: Option<AbortHandle>,
    reconnect: Reconnect,

    shutdown_requested: bool,
    shutdown_waiters: Vec<oneshot::Sender<()>>,
    draining: bool,
    drain_timers: Vec<AbortHandle>,
    pending_cancels: usize,
}

impl ClientLoop {
    fn new(
        cfg: &RabbitMQConfigs,
        topology: Arc<Topology>,
        transport: Arc<dyn Transport>,
        sink: EventSink,
    ) -> (Self, watch::Receiver<ClientStatus>) {
        let (status_tx, status) = watch::channel(ClientStatus::default());
        let generation = Arc::new(AtomicU64::new(0));

        let client_loop = ClientLoop {
            context: Arc::new(DispatchContext {
                topology: topology.clone(),
                transport: transport.clone(),
                generation: generation.clone(),
                debug: cfg.debug,
            }),
            topology: topology.clone(),
            transport,
            uri: cfg.uri(),
            identity: cfg.identity(),
            opts: SetupOptions {
                prefetch_count: cfg.prefetch_count,
                allow_publishing: cfg.allow_publishing,
                debug: cfg.debug,
            },
            reconnect_enabled: cfg.reconnect,
            debug: cfg.debug,
            sink,
            status: status_tx,
            generation,
            session: Session::new(&topology),
            active: false,
            recover: false,
            connected: false,
            channel_open: false,
            closing: false,
            ready: false,
            connect_task: None,
            reconnect: Reconnect::new(cfg.reconnect_delay()),
            shutdown_requested: false,
            shutdown_waiters: vec![],
            draining: false,
            drain_timers: vec![],
            pending_cancels: 0,
        };
        (client_loop, status)
    }

    async fn run(mut self, mut events: mpsc::UnboundedReceiver<Event>) {
        while let Some(event) = events.recv().await {
            self.handle(event);
            self.publish_status();
        }

        if self.debug {
            debug!("all client handles dropped, stopping");
        }
        self.reconnect.cancel();
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
        if self.connected {
            let transport = self.transport.clone();
            tokio::spawn(async move {
                let _ = transport.close().await;
            });
        }
    }

    fn handle(&mut self, event: Event) {
        if let Some(generation) = event.generation() {
            if generation != self.current_generation() {
                if let Event::Opened(_) = event {
                    self.close_orphan();
                }
                return;
            }
        }

        match event {
            Event::Start(reply) => {
                let _ = reply.send(self.start());
            }
            Event::Shutdown(reply) => self.on_shutdown(reply),
            Event::Publish(request, reply) => self.on_publish(request, reply),

            Event::Opened(generation) => self.on_opened(generation),
            Event::OpenFailed(_, err) => self.on_open_failed(err),
            Event::ChannelOpened(generation) => {
                self.channel_open = true;
                // Shutdown already decided to close this connection.
                if self.closing {
                    return;
                }
                if self.debug {
                    debug!("channel opened, declaring topology");
                }
                let steps = self.session.begin(&self.topology, self.opts);
                self.execute(generation, steps);
            }
            Event::Closed(_, reason) => self.on_closed(reason),
            Event::ChannelClosed(generation, reason) => {
                if self.closing {
                    return;
                }
                self.channel_open = false;
                self.fail_session(generation, format!("channel closed: {reason:?}"));
            }

            Event::Setup(generation, ack) => {
                if self.closing {
                    return;
                }
                let steps = self.session.acknowledge(&self.topology, self.opts, ack);
                self.execute(generation, steps);
            }
            Event::SetupFailed(generation, err) => {
                error!(error = err.to_string(), "topology setup failed");
                self.fail_session(generation, err.to_string());
            }

            Event::Consumer(generation, queue, ConsumerEvent::Delivery(delivery)) => {
                self.dispatch(generation, queue, delivery)
            }
            Event::Consumer(generation, queue, ConsumerEvent::Cancelled) => {
                self.on_consumer_cancelled(generation, queue)
            }
            Event::HandlerFinished { queue, task, .. } => {
                if let Some(state) = self.session.queue_mut(queue) {
                    state.in_flight.remove(task);
                }
                self.check_drained();
            }

            Event::DrainTimeout(_, queue) => self.on_drain_timeout(queue),
            Event::CancelOk(_, queue) => self.on_cancel_ok(queue),
            Event::ReconnectTimer => self.on_reconnect_timer(),
        }
    }

    fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn bump_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn publish_status(&self) {
        let status = ClientStatus {
            active: self.active,
            ready: self.ready,
            reconnect_scheduled: self.reconnect.is_scheduled(),
        };
        self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }

    fn start(&mut self) -> Result<(), AmqpError> {
        if self.shutdown_requested {
            return Err(AmqpError::Disconnecting);
        }
        if self.active {
            return Ok(());
        }

        self.active = true;
        self.recover = true;
        self.closing = false;
        self.ready = false;
        self.session = Session::new(&self.topology);
        let generation = self.bump_generation();

        info!(generation, "connecting to broker");
        let transport = self.transport.clone();
        let uri = self.uri.clone();
        let identity = self.identity.clone();
        let sink = self.sink.clone();
        let on_close = self.close_callback(generation, Event::Closed);
        let task = tokio::spawn(async move {
            match transport.open(&uri, &identity, on_close).await {
                Ok(()) => sink.send(Event::Opened(generation)),
                Err(err) => sink.send(Event::OpenFailed(generation, err)),
            }
        });
        self.connect_task = Some(task.abort_handle());
        Ok(())
    }

    fn on_opened(&mut self, generation: u64) {
        self.connect_task = None;
        self.reconnect.in_flight = false;
        self.connected = true;
        info!("connection opened");

        let transport = self.transport.clone();
        let sink = self.sink.clone();
        let on_close = self.close_callback(generation, Event::ChannelClosed);
        tokio::spawn(async move {
            match transport.open_channel(on_close).await {
                Ok(()) => sink.send(Event::ChannelOpened(generation)),
                Err(err) => sink.send(Event::SetupFailed(generation, err)),
            }
        });
    }

    fn on_open_failed(&mut self, err: AmqpError) {
        self.connect_task = None;
        self.reconnect.in_flight = false;
        self.active = false;
        error!(error = err.to_string(), "failure to connect");

        if self.reconnect_enabled && !self.shutdown_requested {
            self.schedule_reconnect();
        }
    }

    fn on_closed(&mut self, reason: CloseReason) {
        self.bump_generation();
        self.active = false;
        self.connected = false;
        self.channel_open = false;
        self.closing = false;
        self.ready = false;
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }

        match &reason {
            CloseReason::ByBroker { code, text } => {
                warn!(code, text, "connection closed by broker");
            }
            CloseReason::ByClient => {
                info!("connection closed by client");
                self.recover = false;
            }
            CloseReason::Error(err) => error!(error = err, "connection closed with error"),
        }

        if self.shutdown_requested {
            self.recover = false;
            self.complete_shutdown();
        }

        if self.recover && self.reconnect_enabled {
            self.schedule_reconnect();
        }
    }

    /// Tears the current connection down after an unrecoverable session error.
    /// The close is reported as an error so that the client recovers.
    fn fail_session(&mut self, generation: u64, reason: String) {
        if self.closing {
            return;
        }
        self.closing = true;
        self.ready = false;

        let transport = self.transport.clone();
        let sink = self.sink.clone();
        let verbose = self.debug;
        tokio::spawn(async move {
            if let Err(err) = transport.close().await {
                if verbose {
                    debug!(error = err.to_string(), "closing failed session");
                }
            }
            sink.send(Event::Closed(generation, CloseReason::Error(reason)));
        });
    }

    /// A connection opened after its attempt was superseded while the client
    /// is idle. Nothing else will ever use it.
    fn close_orphan(&self) {
        if self.active {
            return;
        }
        let transport = self.transport.clone();
        tokio::spawn(async move {
            let _ = transport.close().await;
        });
    }

    fn close_callback(&self, generation: u64, event: fn(u64, CloseReason) -> Event) -> CloseCallback {
        let sink = self.sink.clone();
        Arc::new(move |reason| sink.send(event(generation, reason)))
    }

    fn execute(&mut self, generation: u64, steps: Vec<SetupStep>) {
        for step in steps {
            match step {
                SetupStep::DeclareExchange(id) => {
                    let Some(def) = self.topology.exchange(id).cloned() else {
                        continue;
                    };
                    let transport = self.transport.clone();
                    self.spawn_step(generation, async move {
                        transport.exchange_declare(&def).await?;
                        Ok(Some(SetupAck::ExchangeDeclared(id)))
                    });
                }

                SetupStep::DeclareQueue(id) => {
                    let Some(def) = self.topology.queue(id).cloned() else {
                        continue;
                    };
                    let transport = self.transport.clone();
                    self.spawn_step(generation, async move {
                        let name = transport.queue_declare(&def).await?;
                        Ok(Some(SetupAck::QueueDeclared(id, name)))
                    });
                }

                SetupStep::Bind(id) => {
                    let Some(binding) = self.topology.binding(id) else {
                        continue;
                    };
                    let queue = self.session.queue_name(&self.topology, binding.queue()).to_owned();
                    let exchange = self
                        .topology
                        .exchange(binding.exchange())
                        .map(|def| def.name().to_owned())
                        .unwrap_or_default();
                    let routing_key = binding
                        .routing_key()
                        .and_then(|key| self.topology.routing_key_entry(key))
                        .map(|key| key.name().to_owned())
                        .unwrap_or_else(|| queue.clone());

                    let transport = self.transport.clone();
                    self.spawn_step(generation, async move {
                        transport.queue_bind(&queue, &exchange, &routing_key).await?;
                        Ok(Some(SetupAck::Bound(id)))
                    });
                }

                SetupStep::ConfirmSelect => {
                    let transport = self.transport.clone();
                    self.spawn_step(generation, async move {
                        transport.confirm_select().await?;
                        Ok(None)
                    });
                }

                SetupStep::Qos(prefetch_count) => {
                    let transport = self.transport.clone();
                    self.spawn_step(generation, async move {
                        transport.basic_qos(prefetch_count).await?;
                        Ok(Some(SetupAck::QosConfigured))
                    });
                }

                SetupStep::Consume(id) => {
                    let Some(def) = self.topology.queue(id).cloned() else {
                        continue;
                    };
                    let queue = self.session.queue_name(&self.topology, id).to_owned();
                    let events = self.sink.clone();
                    let sink: DeliverySink = Arc::new(move |event| {
                        events.send(Event::Consumer(generation, id, event))
                    });

                    let transport = self.transport.clone();
                    self.spawn_step(generation, async move {
                        let tag = transport.basic_consume(&queue, &def, sink).await?;
                        Ok(Some(SetupAck::Consuming(id, tag)))
                    });
                }

                SetupStep::Ready => {
                    self.ready = true;
                    info!("client ready");
                }
            }
        }
    }

    fn spawn_step<F>(&self, generation: u64, step: F)
    where
        F: Future<Output = Result<Option<SetupAck>, AmqpError>> + Send + 'static,
    {
        let sink = self.sink.clone();
        tokio::spawn(async move {
            match step.await {
                Ok(Some(ack)) => sink.send(Event::Setup(generation, ack)),
                Ok(None) => {}
                Err(err) => sink.send(Event::SetupFailed(generation, err)),
            }
        });
    }

    fn on_publish(&mut self, request: PublishRequest, reply: oneshot::Sender<PublishResult>) {
        let error = if !self.active {
            Some(AmqpError::ClientNotActive)
        } else if !self.channel_open {
            Some(AmqpError::ChannelNotLoaded)
        } else {
            request
                .route
                .filter(|binding| self.session.binding(*binding) != BindState::Bound)
                .map(|_| AmqpError::RoutingKeyNotLoaded {
                    routing_key: request.routing_key.clone(),
                    exchange: request.exchange.clone(),
                })
        };

        if let Some(error) = error {
            let _ = reply.send(request.into_result(Some(error)));
            return;
        }

        let transport = self.transport.clone();
        tokio::spawn(async move {
            let error = transport
                .basic_publish(
                    &request.exchange,
                    &request.routing_key,
                    &request.body,
                    request.properties.clone(),
                )
                .await
                .err();
            let _ = reply.send(request.into_result(error));
        });
    }

    fn dispatch(&mut self, generation: u64, queue: QueueId, delivery: InboundDelivery) {
        let queue_name = self.session.queue_name(&self.topology, queue).to_owned();
        let Some(state) = self.session.queue_mut(queue) else {
            return;
        };

        if !state.accepts_deliveries() {
            if self.debug {
                debug!(
                    queue = queue_name,
                    delivery_tag = delivery.delivery_tag,
                    "queue not consuming, dropping delivery"
                );
            }
            return;
        }

        let task = state.in_flight.next_id();
        let ctx = self.context.clone();
        let sink = self.sink.clone();
        let handle = tokio::spawn(async move {
            if let Err(err) = consumer::consume(&ctx, generation, queue, queue_name, delivery).await {
                error!(error = err.to_string(), "failure to settle delivery");
            }
            sink.send(Event::HandlerFinished {
                generation,
                queue,
                task,
            });
        });
        state.in_flight.insert(task, handle.abort_handle());
    }

    fn on_consumer_cancelled(&mut self, generation: u64, queue: QueueId) {
        if self.closing || self.shutdown_requested {
            return;
        }

        let name = self.session.queue_name(&self.topology, queue).to_owned();
        warn!(queue = name, "consumer cancelled by broker");
        self.fail_session(generation, format!("consumer of `{name}` cancelled"));
    }
}

#[cfg(test)]
mod tests;
