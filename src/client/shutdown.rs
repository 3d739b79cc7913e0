// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Ordered teardown: stop accepting deliveries, drain in-flight handlers within
//! each queue's bound, cancel consumers, then close channel and connection.

use super::{ClientLoop, Event};
use crate::{session::ConsumerState, topology::QueueId, transport::CloseReason};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

impl ClientLoop {
    pub(super) fn on_shutdown(&mut self, reply: oneshot::Sender<()>) {
        self.shutdown_waiters.push(reply);
        if self.shutdown_requested {
            return;
        }

        self.shutdown_requested = true;
        self.recover = false;
        self.reconnect.cancel();

        if !self.active {
            self.complete_shutdown();
            return;
        }

        if !self.connected {
            if let Some(task) = self.connect_task.take() {
                task.abort();
            }
            self.bump_generation();
            self.active = false;
            self.complete_shutdown();
            return;
        }

        info!("shutting down");
        self.ready = false;

        // A session already being torn down reports Closed on its own.
        if self.closing {
            return;
        }
        self.closing = true;
        self.draining = true;

        let generation = self.current_generation();
        for idx in 0..self.session.queues.len() {
            let queue = QueueId(idx);
            let timeout = self
                .topology
                .queue(queue)
                .map(|def| def.shutdown_timeout)
                .unwrap_or_default();

            let state = &mut self.session.queues[idx];
            state.stopping = true;
            if state.in_flight.is_empty() {
                continue;
            }
            if self.debug {
                debug!(
                    queue = idx,
                    in_flight = state.in_flight.len(),
                    timeout_secs = timeout.as_secs(),
                    "draining handlers"
                );
            }

            let sink = self.sink.clone();
            let timer = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                sink.send(Event::DrainTimeout(generation, queue));
            });
            self.drain_timers.push(timer.abort_handle());
        }

        self.check_drained();
    }

    pub(super) fn on_drain_timeout(&mut self, queue: QueueId) {
        if !self.draining {
            return;
        }

        let name = self.session.queue_name(&self.topology, queue).to_owned();
        if let Some(state) = self.session.queue_mut(queue) {
            let cancelled = state.in_flight.abort_all();
            if cancelled > 0 {
                warn!(queue = name, cancelled, "shutdown timeout, cancelling handlers");
            }
        }

        self.check_drained();
    }

    pub(super) fn check_drained(&mut self) {
        if !self.draining || self.session.has_in_flight() {
            return;
        }

        self.draining = false;
        for timer in self.drain_timers.drain(..) {
            timer.abort();
        }
        self.stop_consuming();
    }

    fn stop_consuming(&mut self) {
        if self.channel_open {
            let generation = self.current_generation();

            for (idx, state) in self.session.queues.iter_mut().enumerate() {
                let ConsumerState::Consuming { tag } = &state.consumer else {
                    continue;
                };
                let tag = tag.clone();
                state.consumer = ConsumerState::Cancelling { tag: tag.clone() };
                self.pending_cancels += 1;

                let transport = self.transport.clone();
                let sink = self.sink.clone();
                let queue = QueueId(idx);
                tokio::spawn(async move {
                    if let Err(err) = transport.basic_cancel(&tag).await {
                        error!(error = err.to_string(), consumer_tag = tag, "failure to cancel consumer");
                    }
                    sink.send(Event::CancelOk(generation, queue));
                });
            }
        }

        if self.pending_cancels == 0 {
            self.close_transport();
        }
    }

    pub(super) fn on_cancel_ok(&mut self, queue: QueueId) {
        if let Some(state) = self.session.queue_mut(queue) {
            state.consumer = ConsumerState::Idle;
        }

        self.pending_cancels = self.pending_cancels.saturating_sub(1);
        if self.pending_cancels == 0 {
            self.close_transport();
        }
    }

    fn close_transport(&mut self) {
        if !self.connected {
            self.active = false;
            self.complete_shutdown();
            return;
        }

        let generation = self.current_generation();
        let channel_open = self.channel_open;
        let transport = self.transport.clone();
        let sink = self.sink.clone();
        tokio::spawn(async move {
            if channel_open {
                if let Err(err) = transport.close_channel().await {
                    warn!(error = err.to_string(), "failure to close channel");
                }
            }
            if let Err(err) = transport.close().await {
                warn!(error = err.to_string(), "failure to close connection");
            }
            sink.send(Event::Closed(generation, CloseReason::ByClient));
        });
    }

    /// Releases every `shutdown()` caller. The client may be started again.
    pub(super) fn complete_shutdown(&mut self) {
        self.shutdown_requested = false;
        self.draining = false;
        self.pending_cancels = 0;
        for timer in self.drain_timers.drain(..) {
            timer.abort();
        }

        info!("client shut down");
        for waiter in self.shutdown_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }
}
