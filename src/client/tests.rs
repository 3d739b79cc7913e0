// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use super::*;
use crate::{
    exchange::ExchangeDefinition,
    handler::{handler_fn, ConsumerMessage, HandlerError, HandlerResult},
    queue::QueueDefinition,
    session::{ConsumerState, DeclareState},
    topology::BindingId,
    transport::MockTransport,
};
use std::{
    future,
    sync::{atomic::AtomicUsize, Mutex},
    time::Duration,
};
use tokio::time::Instant;

/// Broker double: records calls and keeps the callbacks the client hands over.
#[derive(Default)]
struct Broker {
    opens: AtomicUsize,
    exchange_declares: AtomicUsize,
    queue_declares: AtomicUsize,
    binds: AtomicUsize,
    consumes: AtomicUsize,
    acks: AtomicUsize,
    nacks: AtomicUsize,
    cancels: AtomicUsize,
    publishes: AtomicUsize,
    closes: AtomicUsize,
    on_close: Mutex<Option<CloseCallback>>,
    sinks: Mutex<Vec<DeliverySink>>,
}

impl Broker {
    fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    fn close_connection(&self, reason: CloseReason) {
        let on_close = self.on_close.lock().unwrap().clone().unwrap();
        on_close(reason);
    }

    fn deliver(&self, tag: u64, routing_key: &str) {
        let sink = self.sinks.lock().unwrap().last().cloned().unwrap();
        sink(ConsumerEvent::Delivery(InboundDelivery {
            delivery_tag: tag,
            exchange: "orders".to_owned(),
            routing_key: routing_key.to_owned(),
            redelivered: false,
            properties: BasicProperties::default(),
            body: b"{}".to_vec(),
        }));
    }

    fn cancel_consumer(&self) {
        let sink = self.sinks.lock().unwrap().last().cloned().unwrap();
        sink(ConsumerEvent::Cancelled);
    }
}

fn transport(broker: &Arc<Broker>) -> Arc<dyn Transport> {
    let mut mock = MockTransport::new();

    let b = broker.clone();
    mock.expect_open().returning(move |_, identity, on_close| {
        assert!(identity.product.starts_with("rabbitmq-topology"));
        b.opens.fetch_add(1, Ordering::SeqCst);
        *b.on_close.lock().unwrap() = Some(on_close);
        Ok(())
    });
    mock.expect_open_channel().returning(|_| Ok(()));

    let b = broker.clone();
    mock.expect_exchange_declare().returning(move |_| {
        b.exchange_declares.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    let b = broker.clone();
    mock.expect_queue_declare().returning(move |def| {
        b.queue_declares.fetch_add(1, Ordering::SeqCst);
        Ok(def.name().to_owned())
    });
    let b = broker.clone();
    mock.expect_queue_bind().returning(move |_, _, _| {
        b.binds.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    mock.expect_basic_qos().returning(|_| Ok(()));
    mock.expect_confirm_select().returning(|| Ok(()));

    let b = broker.clone();
    mock.expect_basic_consume().returning(move |_, _, sink| {
        let n = b.consumes.fetch_add(1, Ordering::SeqCst);
        b.sinks.lock().unwrap().push(sink);
        Ok(format!("ctag-{n}"))
    });
    let b = broker.clone();
    mock.expect_basic_ack().returning(move |_| {
        b.acks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    let b = broker.clone();
    mock.expect_basic_nack().returning(move |_| {
        b.nacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    let b = broker.clone();
    mock.expect_basic_cancel().returning(move |_| {
        b.cancels.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    let b = broker.clone();
    mock.expect_basic_publish().returning(move |_, _, _, _| {
        b.publishes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    mock.expect_close_channel().returning(|| Ok(()));
    let b = broker.clone();
    mock.expect_close().returning(move || {
        b.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    Arc::new(mock)
}

fn configs() -> RabbitMQConfigs {
    RabbitMQConfigs {
        prefetch_count: 4,
        reconnect_delay_secs: 10,
        debug: true,
        ..Default::default()
    }
}

/// Exchange "orders" with key "created" bound to queue "orders.inbox".
fn orders_topology() -> (Topology, QueueId) {
    let mut topology = Topology::new();
    let orders = topology.add_exchange(ExchangeDefinition::new("orders").durable());
    let inbox = topology.add_queue(QueueDefinition::new("orders.inbox").durable());
    topology.add_routing_key(orders, "created", inbox).unwrap();
    (topology, inbox)
}

async fn ready_client(topology: Topology, broker: &Arc<Broker>) -> AmqpClient {
    let client = AmqpClient::with_transport(&configs(), topology, transport(broker));
    client.start().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), client.wait_ready())
        .await
        .unwrap()
        .unwrap();
    client
}

/// A client loop driven by hand: events produced by its tasks queue up until the
/// test feeds them back, so they can be held, reordered or replayed.
struct Driver {
    client_loop: ClientLoop,
    events: mpsc::UnboundedReceiver<Event>,
    _sender: mpsc::UnboundedSender<Event>,
}

impl Driver {
    fn new(topology: Topology, broker: &Arc<Broker>) -> Self {
        let (sender, events) = mpsc::unbounded_channel();
        let (client_loop, _) = ClientLoop::new(
            &configs(),
            Arc::new(topology),
            transport(broker),
            EventSink::new(&sender),
        );
        Driver {
            client_loop,
            events,
            _sender: sender,
        }
    }

    async fn next(&mut self) -> Event {
        tokio::time::timeout(Duration::from_secs(5), self.events.recv())
            .await
            .unwrap()
            .unwrap()
    }

    async fn run_until(&mut self, done: impl Fn(&ClientLoop) -> bool) {
        while !done(&self.client_loop) {
            let event = self.next().await;
            self.client_loop.handle(event);
        }
    }

    fn publish(&mut self, request: PublishRequest) -> oneshot::Receiver<PublishResult> {
        let (reply, result) = oneshot::channel();
        self.client_loop.handle(Event::Publish(request, reply));
        result
    }
}

fn order_created() -> PublishRequest {
    PublishRequest::new(
        "orders".to_owned(),
        "created",
        b"{}".to_vec(),
        BasicProperties::default(),
    )
}

fn created_binding(topology: &Topology) -> BindingId {
    let orders = topology.find_exchange("orders").unwrap();
    let key = topology.routing_key(orders, "created").unwrap();
    topology.routing_key_entry(key).unwrap().binding()
}

async fn eventually(condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met in time");
}

#[tokio::test]
async fn handshake_declares_each_object_once() {
    let broker = Arc::new(Broker::default());
    let (topology, _) = orders_topology();

    let client = ready_client(topology, &broker).await;

    assert_eq!(Broker::count(&broker.opens), 1);
    assert_eq!(Broker::count(&broker.exchange_declares), 1);
    assert_eq!(Broker::count(&broker.queue_declares), 1);
    assert_eq!(Broker::count(&broker.binds), 1);
    assert_eq!(Broker::count(&broker.consumes), 1);
    assert_eq!(
        client.status(),
        ClientStatus {
            active: true,
            ready: true,
            reconnect_scheduled: false
        }
    );
}

#[tokio::test]
async fn start_is_idempotent() {
    let broker = Arc::new(Broker::default());
    let (topology, _) = orders_topology();

    let client = ready_client(topology, &broker).await;
    client.start().await.unwrap();

    assert_eq!(Broker::count(&broker.opens), 1);
}

#[tokio::test]
async fn deliveries_reach_first_matching_handler() {
    let broker = Arc::new(Broker::default());
    let (mut topology, inbox) = orders_topology();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let first = tx.clone();
    topology
        .register_handler(
            inbox,
            Some("created"),
            handler_fn(move |msg: ConsumerMessage| {
                let first = first.clone();
                async move {
                    let _ = first.send(("created", msg.routing_key));
                    Ok(HandlerResult::Ack)
                }
            }),
        )
        .unwrap();
    topology
        .register_handler(
            inbox,
            None,
            handler_fn(move |msg: ConsumerMessage| {
                let fallback = tx.clone();
                async move {
                    let _ = fallback.send(("fallback", msg.routing_key));
                    Ok(HandlerResult::Ack)
                }
            }),
        )
        .unwrap();

    let _client = ready_client(topology, &broker).await;

    broker.deliver(1, "created");
    assert_eq!(rx.recv().await, Some(("created", "created".to_owned())));

    broker.deliver(2, "shipped");
    assert_eq!(rx.recv().await, Some(("fallback", "shipped".to_owned())));

    eventually(|| Broker::count(&broker.acks) == 2).await;
}

#[tokio::test]
async fn failing_handler_acks_exactly_once() {
    let broker = Arc::new(Broker::default());
    let (mut topology, inbox) = orders_topology();
    topology
        .register_handler(
            inbox,
            None,
            handler_fn(|_msg| async {
                Err::<HandlerResult, HandlerError>("cannot parse order".into())
            }),
        )
        .unwrap();

    let _client = ready_client(topology, &broker).await;
    broker.deliver(1, "created");

    eventually(|| Broker::count(&broker.acks) == 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(Broker::count(&broker.acks), 1);
    assert_eq!(Broker::count(&broker.nacks), 0);
}

#[tokio::test(start_paused = true)]
async fn broker_close_arms_one_reconnect() {
    let broker = Arc::new(Broker::default());
    let (topology, _) = orders_topology();
    let client = ready_client(topology, &broker).await;

    broker.close_connection(CloseReason::ByBroker {
        code: 320,
        text: "CONNECTION_FORCED".to_owned(),
    });
    broker.close_connection(CloseReason::ByBroker {
        code: 320,
        text: "CONNECTION_FORCED".to_owned(),
    });

    let mut status = client.status.clone();
    status.wait_for(|s| s.reconnect_scheduled).await.unwrap();
    assert!(!client.status().active);
    assert!(!client.status().ready);

    tokio::time::sleep(Duration::from_secs(11)).await;
    client.wait_ready().await.unwrap();

    assert_eq!(Broker::count(&broker.opens), 2);
    assert_eq!(Broker::count(&broker.consumes), 2);
}

#[tokio::test(start_paused = true)]
async fn shutdown_before_timer_prevents_reconnect() {
    let broker = Arc::new(Broker::default());
    let (topology, _) = orders_topology();
    let client = ready_client(topology, &broker).await;

    broker.close_connection(CloseReason::Error("connection reset".to_owned()));
    let mut status = client.status.clone();
    status.wait_for(|s| s.reconnect_scheduled).await.unwrap();

    client.shutdown().await.unwrap();
    assert!(!client.status().reconnect_scheduled);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(Broker::count(&broker.opens), 1);
}

#[tokio::test(start_paused = true)]
async fn client_close_does_not_reconnect() {
    let broker = Arc::new(Broker::default());
    let (topology, _) = orders_topology();
    let client = ready_client(topology, &broker).await;

    broker.close_connection(CloseReason::ByClient);
    let mut status = client.status.clone();
    status.wait_for(|s| !s.active).await.unwrap();

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(Broker::count(&broker.opens), 1);
    assert!(!client.status().reconnect_scheduled);
}

#[tokio::test(start_paused = true)]
async fn cancelled_consumer_recovers_the_session() {
    let broker = Arc::new(Broker::default());
    let (topology, _) = orders_topology();
    let client = ready_client(topology, &broker).await;

    broker.cancel_consumer();
    let mut status = client.status.clone();
    status.wait_for(|s| s.reconnect_scheduled).await.unwrap();
    assert_eq!(Broker::count(&broker.closes), 1);

    tokio::time::sleep(Duration::from_secs(11)).await;
    client.wait_ready().await.unwrap();
    assert_eq!(Broker::count(&broker.opens), 2);
}

/// Sets its flag when dropped, i.e. when the task owning it is cancelled.
struct DropFlag(Arc<AtomicUsize>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_hung_handler_after_timeout() {
    let broker = Arc::new(Broker::default());
    let (mut topology, inbox) = orders_topology();
    let dropped = Arc::new(AtomicUsize::new(0));
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();

    let flag = dropped.clone();
    topology
        .register_handler(
            inbox,
            None,
            handler_fn(move |_msg| {
                let guard = DropFlag(flag.clone());
                let started = started_tx.clone();
                async move {
                    let _guard = guard;
                    let _ = started.send(());
                    future::pending::<()>().await;
                    Ok(HandlerResult::Ack)
                }
            }),
        )
        .unwrap();

    let client = ready_client(topology, &broker).await;
    broker.deliver(1, "created");
    started_rx.recv().await.unwrap();

    let begun = Instant::now();
    let closing = client.clone();
    let shutdown = tokio::spawn(async move { closing.shutdown().await });

    while client.status().ready {
        tokio::task::yield_now().await;
    }
    assert_eq!(client.start().await, Err(AmqpError::Disconnecting));

    shutdown.await.unwrap().unwrap();
    let elapsed = begun.elapsed();
    assert!(elapsed >= Duration::from_secs(20), "{elapsed:?}");
    assert!(elapsed <= Duration::from_millis(20_500), "{elapsed:?}");

    eventually(|| dropped.load(Ordering::SeqCst) == 1).await;
    assert_eq!(Broker::count(&broker.acks), 0);
    assert_eq!(Broker::count(&broker.cancels), 1);
    assert_eq!(Broker::count(&broker.closes), 1);
    assert!(!client.status().active);
}

#[tokio::test]
async fn shutdown_waits_for_running_handlers() {
    let broker = Arc::new(Broker::default());
    let (mut topology, inbox) = orders_topology();
    let (release_tx, release_rx) = tokio::sync::watch::channel(false);
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();

    topology
        .register_handler(
            inbox,
            None,
            handler_fn(move |_msg| {
                let mut release = release_rx.clone();
                let started = started_tx.clone();
                async move {
                    let _ = started.send(());
                    let _ = release.changed().await;
                    Ok(HandlerResult::Ack)
                }
            }),
        )
        .unwrap();

    let client = ready_client(topology, &broker).await;
    broker.deliver(1, "created");
    started_rx.recv().await.unwrap();

    let closing = client.clone();
    let shutdown = tokio::spawn(async move { closing.shutdown().await });
    while client.status().ready {
        tokio::task::yield_now().await;
    }

    // Deliveries arriving while stopping are left for redelivery.
    broker.deliver(2, "created");
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!shutdown.is_finished());
    assert_eq!(Broker::count(&broker.cancels), 0);

    release_tx.send(true).unwrap();
    shutdown.await.unwrap().unwrap();

    assert_eq!(Broker::count(&broker.acks), 1);
    assert_eq!(Broker::count(&broker.cancels), 1);
    assert_eq!(Broker::count(&broker.closes), 1);
}

#[tokio::test]
async fn restart_after_shutdown() {
    let broker = Arc::new(Broker::default());
    let (topology, _) = orders_topology();
    let client = ready_client(topology, &broker).await;

    client.shutdown().await.unwrap();
    client.start().await.unwrap();
    client.wait_ready().await.unwrap();

    assert_eq!(Broker::count(&broker.opens), 2);
}

#[tokio::test]
async fn shutdown_of_idle_client_returns_immediately() {
    let broker = Arc::new(Broker::default());
    let (topology, _) = orders_topology();
    let client = AmqpClient::with_transport(&configs(), topology, transport(&broker));

    client.shutdown().await.unwrap();
    assert_eq!(Broker::count(&broker.closes), 0);
}

#[tokio::test]
async fn publish_checks_exchange_and_client_state() {
    let broker = Arc::new(Broker::default());
    let (topology, _) = orders_topology();
    let client = AmqpClient::with_transport(&configs(), topology, transport(&broker));

    assert_eq!(
        client
            .publish("nonexistent-exchange", "k", b"x", None)
            .await
            .unwrap_err(),
        AmqpError::ExchangeNotFound("nonexistent-exchange".to_owned())
    );

    let result = client.publish("", "k", b"x", None).await.unwrap();
    assert_eq!(result.error, Some(AmqpError::ClientNotActive));

    client.start().await.unwrap();
    client.wait_ready().await.unwrap();

    let result = client.publish("", "k", b"x", None).await.unwrap();
    assert!(result.is_ok(), "{:?}", result.error);
    assert!(result.properties.message_id().is_some());

    let result = client
        .publish_string("amq.topic", "orders.created", "hello", None)
        .await
        .unwrap();
    assert!(result.is_ok());

    assert_eq!(Broker::count(&broker.publishes), 2);
}

#[tokio::test]
async fn publish_variants_encode_payloads() {
    let broker = Arc::new(Broker::default());
    let (topology, _) = orders_topology();
    let client = ready_client(topology, &broker).await;

    let serde_json::Value::Object(map) = serde_json::json!({"id": 1, "status": "created"}) else {
        unreachable!()
    };
    let result = client
        .publish_json("orders", "created", &map, None)
        .await
        .unwrap();
    assert_eq!(result.body, br#"{"id":1,"status":"created"}"#);

    #[derive(serde::Serialize)]
    struct OrderShipped {
        id: u32,
    }
    let result = client
        .publish_model("orders", "shipped", &OrderShipped { id: 2 }, None)
        .await
        .unwrap();
    assert!(result.is_ok());
    assert_eq!(
        result.properties.content_type().as_ref().map(|c| c.as_str()),
        Some(publisher::JSON_CONTENT_TYPE)
    );
}

#[tokio::test]
async fn strict_routing_requires_registered_and_bound_key() {
    let broker = Arc::new(Broker::default());
    let (topology, _) = orders_topology();
    let client = AmqpClient::with_transport(&configs(), topology, transport(&broker));

    assert_eq!(
        client
            .publish_on_route("orders", "deleted", b"x", None)
            .await
            .unwrap_err(),
        AmqpError::RoutingKeyNotFound("deleted".to_owned())
    );

    client.start().await.unwrap();
    client.wait_ready().await.unwrap();

    let result = client
        .publish_on_route("orders", "created", b"x", None)
        .await
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn failed_connection_is_retried() {
    let mut mock = MockTransport::new();
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    mock.expect_open().returning(move |_, _, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        Err(AmqpError::ConnectionError("connection refused".to_owned()))
    });

    let client = AmqpClient::with_transport(&configs(), Topology::new(), Arc::new(mock));
    client.start().await.unwrap();

    let mut status = client.status.clone();
    status.wait_for(|s| s.reconnect_scheduled).await.unwrap();
    assert!(!client.status().active);
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn publish_before_channel_opens_reports_channel_not_loaded() {
    let broker = Arc::new(Broker::default());
    let (topology, _) = orders_topology();
    let mut driver = Driver::new(topology, &broker);

    driver.client_loop.start().unwrap();
    driver.run_until(|l| l.connected).await;
    assert!(driver.client_loop.active);
    assert!(!driver.client_loop.channel_open);

    let result = driver.publish(order_created()).await.unwrap();
    assert_eq!(result.error, Some(AmqpError::ChannelNotLoaded));
    assert_eq!(result.routing_key, "created");
    assert_eq!(Broker::count(&broker.publishes), 0);

    driver.run_until(|l| l.channel_open).await;
    let result = driver.publish(order_created()).await.unwrap();
    assert!(result.is_ok(), "{:?}", result.error);
    assert_eq!(Broker::count(&broker.publishes), 1);
}

#[tokio::test]
async fn route_publish_before_binding_reports_not_loaded() {
    let broker = Arc::new(Broker::default());
    let (topology, _) = orders_topology();
    let binding = created_binding(&topology);
    let mut driver = Driver::new(topology, &broker);

    driver.client_loop.start().unwrap();
    driver.run_until(|l| l.channel_open).await;
    assert_eq!(driver.client_loop.session.binding(binding), BindState::Unbound);

    let result = driver
        .publish(order_created().on_route(binding))
        .await
        .unwrap();
    assert_eq!(
        result.error,
        Some(AmqpError::RoutingKeyNotLoaded {
            routing_key: "created".to_owned(),
            exchange: "orders".to_owned(),
        })
    );
    assert_eq!(Broker::count(&broker.publishes), 0);

    driver.run_until(|l| l.ready).await;
    assert_eq!(driver.client_loop.session.binding(binding), BindState::Bound);
    let result = driver
        .publish(order_created().on_route(binding))
        .await
        .unwrap();
    assert!(result.is_ok(), "{:?}", result.error);
    assert_eq!(Broker::count(&broker.publishes), 1);
}

#[tokio::test]
async fn callbacks_of_a_replaced_connection_are_discarded() {
    let broker = Arc::new(Broker::default());
    let (topology, inbox) = orders_topology();
    let orders = topology.find_exchange("orders").unwrap();
    let binding = created_binding(&topology);
    let mut driver = Driver::new(topology, &broker);

    driver.client_loop.start().unwrap();
    driver.run_until(|l| l.ready).await;
    let old = driver.client_loop.current_generation();

    driver.client_loop.handle(Event::Closed(
        old,
        CloseReason::ByBroker {
            code: 320,
            text: "CONNECTION_FORCED".to_owned(),
        },
    ));
    assert!(driver.client_loop.reconnect.is_scheduled());
    driver.client_loop.handle(Event::ReconnectTimer);
    driver.run_until(|l| l.channel_open).await;
    assert_ne!(driver.client_loop.current_generation(), old);

    // The new handshake is waiting on its exchange declare.
    driver
        .client_loop
        .handle(Event::Setup(old, SetupAck::ExchangeDeclared(orders)));
    driver.client_loop.handle(Event::Setup(
        old,
        SetupAck::QueueDeclared(inbox, "orders.inbox".to_owned()),
    ));
    driver.client_loop.handle(Event::ChannelOpened(old));
    driver.client_loop.handle(Event::ChannelClosed(
        old,
        CloseReason::Error("channel reset".to_owned()),
    ));

    let session = &driver.client_loop.session;
    assert_eq!(session.exchanges[orders.0], DeclareState::Declaring);
    assert_eq!(session.queues[inbox.0].state, DeclareState::Unregistered);
    assert_eq!(session.binding(binding), BindState::Unbound);
    assert!(driver.client_loop.channel_open);
    assert!(!driver.client_loop.closing);
    assert!(!driver.client_loop.ready);

    driver.run_until(|l| l.ready).await;

    driver.client_loop.handle(Event::Setup(
        old,
        SetupAck::Consuming(inbox, "ctag-0".to_owned()),
    ));
    driver.client_loop.handle(Event::ChannelClosed(
        old,
        CloseReason::Error("channel reset".to_owned()),
    ));
    driver
        .client_loop
        .handle(Event::SetupFailed(old, AmqpError::ChannelNotLoaded));

    assert!(driver.client_loop.ready);
    assert!(!driver.client_loop.closing);
    assert_eq!(
        driver.client_loop.session.queues[inbox.0].consumer,
        ConsumerState::Consuming {
            tag: "ctag-1".to_owned()
        }
    );

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(Broker::count(&broker.opens), 2);
    assert_eq!(Broker::count(&broker.exchange_declares), 2);
    assert_eq!(Broker::count(&broker.closes), 0);
}

#[tokio::test]
async fn channel_opening_during_shutdown_declares_nothing() {
    let broker = Arc::new(Broker::default());
    let (topology, _) = orders_topology();
    let mut driver = Driver::new(topology, &broker);

    driver.client_loop.start().unwrap();
    driver.run_until(|l| l.connected).await;
    let channel_opened = driver.next().await;
    assert!(matches!(channel_opened, Event::ChannelOpened(_)));

    let (reply, done) = oneshot::channel();
    driver.client_loop.handle(Event::Shutdown(reply));
    driver.client_loop.handle(channel_opened);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(Broker::count(&broker.exchange_declares), 0);
    assert_eq!(Broker::count(&broker.queue_declares), 0);

    driver.run_until(|l| !l.active).await;
    done.await.unwrap();
    assert_eq!(Broker::count(&broker.closes), 1);
    assert!(!driver.client_loop.shutdown_requested);
}
