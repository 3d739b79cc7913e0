// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Setup State Machine
//!
//! Drives the ordered handshake that follows a channel opening:
//!
//! 1. declare every exchange
//! 2. declare every queue
//! 3. bind every queue
//! 4. publisher confirms, QoS, then one consumer per consuming queue
//!
//! Each stage fans out one request per object and waits until every sibling has
//! been acknowledged before advancing, since AMQP has no atomic multi-declare.
//! The machine does no I/O: [`Session::begin`] and [`Session::acknowledge`] return
//! the [`SetupStep`]s the caller must issue.

use crate::{
    session::{BindState, ConsumerState, DeclareState, QosState, Session},
    topology::{BindingId, ExchangeId, QueueId, Topology},
};
use tracing::debug;

/// A request the client must send to the broker, or the readiness signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SetupStep {
    DeclareExchange(ExchangeId),
    DeclareQueue(QueueId),
    Bind(BindingId),
    ConfirmSelect,
    Qos(u16),
    Consume(QueueId),
    /// Every object is declared, bound and consuming.
    Ready,
}

/// A broker acknowledgement fed back into the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SetupAck {
    ExchangeDeclared(ExchangeId),
    QueueDeclared(QueueId, String),
    Bound(BindingId),
    QosConfigured,
    Consuming(QueueId, String),
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SetupOptions {
    pub(crate) prefetch_count: u16,
    pub(crate) allow_publishing: bool,
    /// Log each acknowledged object.
    pub(crate) debug: bool,
}

impl Session {
    /// Stage 1, issued once the channel is open.
    pub(crate) fn begin(&mut self, topology: &Topology, opts: SetupOptions) -> Vec<SetupStep> {
        if self.exchanges.is_empty() {
            return self.declare_queues(topology, opts);
        }

        self.exchanges
            .iter_mut()
            .enumerate()
            .filter(|(_, state)| **state == DeclareState::Unregistered)
            .map(|(idx, state)| {
                *state = DeclareState::Declaring;
                SetupStep::DeclareExchange(ExchangeId(idx))
            })
            .collect()
    }

    /// Applies one acknowledgement. Acknowledgements for objects that are not
    /// waiting for one are ignored.
    pub(crate) fn acknowledge(
        &mut self,
        topology: &Topology,
        opts: SetupOptions,
        ack: SetupAck,
    ) -> Vec<SetupStep> {
        match ack {
            SetupAck::ExchangeDeclared(id) => {
                if !advance(self.exchanges.get_mut(id.0)) {
                    return vec![];
                }
                if self.exchanges.iter().all(|s| *s == DeclareState::Declared) {
                    return self.declare_queues(topology, opts);
                }
                vec![]
            }

            SetupAck::QueueDeclared(id, name) => {
                let Some(queue) = self.queues.get_mut(id.0) else {
                    return vec![];
                };
                if !advance(Some(&mut queue.state)) {
                    return vec![];
                }
                if opts.debug {
                    debug!(queue = name, "queue declared");
                }
                queue.server_name = Some(name);

                if !self.all_queues_declared() {
                    return vec![];
                }
                if self.bindings.is_empty() {
                    return self.setup_consumers(topology, opts);
                }
                self.bind_queues()
            }

            SetupAck::Bound(id) => {
                match self.bindings.get_mut(id.0) {
                    Some(state @ BindState::Binding) => *state = BindState::Bound,
                    _ => return vec![],
                }
                if self.all_queues_declared() && self.all_bound() {
                    return self.setup_consumers(topology, opts);
                }
                vec![]
            }

            SetupAck::QosConfigured => {
                if self.qos != QosState::Requested {
                    return vec![];
                }
                self.qos = QosState::Configured;

                let mut steps = vec![];
                for (idx, queue) in self.queues.iter_mut().enumerate() {
                    let wants = topology
                        .queue(QueueId(idx))
                        .is_some_and(|def| def.consumer.allow_consuming);
                    if wants && queue.consumer == ConsumerState::Idle {
                        queue.consumer = ConsumerState::Subscribing;
                        steps.push(SetupStep::Consume(QueueId(idx)));
                    }
                }
                steps
            }

            SetupAck::Consuming(id, tag) => {
                let Some(queue) = self.queues.get_mut(id.0) else {
                    return vec![];
                };
                if queue.consumer != ConsumerState::Subscribing {
                    return vec![];
                }
                if opts.debug {
                    debug!(consumer_tag = tag, "consumer confirmed");
                }
                queue.consumer = ConsumerState::Consuming { tag };

                let all_consuming = self.consuming_queues(topology).all(|q| {
                    matches!(self.queues[q.0].consumer, ConsumerState::Consuming { .. })
                });
                if all_consuming {
                    return self.mark_ready(topology);
                }
                vec![]
            }
        }
    }

    /// Recomputes the readiness invariant from the object states.
    pub(crate) fn is_ready(&self, topology: &Topology) -> bool {
        if !(self.exchanges.iter().all(|s| *s == DeclareState::Declared)
            && self.all_queues_declared()
            && self.all_bound())
        {
            return false;
        }

        let mut consuming = self.consuming_queues(topology).peekable();
        if consuming.peek().is_none() {
            return true;
        }

        self.qos == QosState::Configured
            && consuming.all(|q| matches!(self.queues[q.0].consumer, ConsumerState::Consuming { .. }))
    }

    fn declare_queues(&mut self, topology: &Topology, opts: SetupOptions) -> Vec<SetupStep> {
        if self.queues.is_empty() {
            return self.setup_consumers(topology, opts);
        }

        self.queues
            .iter_mut()
            .enumerate()
            .filter(|(_, q)| q.state == DeclareState::Unregistered)
            .map(|(idx, q)| {
                q.state = DeclareState::Declaring;
                SetupStep::DeclareQueue(QueueId(idx))
            })
            .collect()
    }

    fn bind_queues(&mut self) -> Vec<SetupStep> {
        self.bindings
            .iter_mut()
            .enumerate()
            .filter(|(_, state)| **state == BindState::Unbound)
            .map(|(idx, state)| {
                *state = BindState::Binding;
                SetupStep::Bind(BindingId(idx))
            })
            .collect()
    }

    fn setup_consumers(&mut self, topology: &Topology, opts: SetupOptions) -> Vec<SetupStep> {
        if self.qos != QosState::Unset || self.ready {
            return vec![];
        }

        let mut steps = vec![];
        if opts.allow_publishing {
            steps.push(SetupStep::ConfirmSelect);
        }

        if self.consuming_queues(topology).next().is_some() {
            self.qos = QosState::Requested;
            steps.push(SetupStep::Qos(opts.prefetch_count));
        } else {
            steps.extend(self.mark_ready(topology));
        }
        steps
    }

    fn mark_ready(&mut self, topology: &Topology) -> Vec<SetupStep> {
        if self.ready || !self.is_ready(topology) {
            return vec![];
        }
        self.ready = true;
        vec![SetupStep::Ready]
    }

    fn all_queues_declared(&self) -> bool {
        self.queues.iter().all(|q| q.state == DeclareState::Declared)
    }

    fn all_bound(&self) -> bool {
        self.bindings.iter().all(|s| *s == BindState::Bound)
    }

    fn consuming_queues<'a>(&self, topology: &'a Topology) -> impl Iterator<Item = QueueId> + 'a {
        (0..topology.queue_count())
            .map(QueueId)
            .filter(|q| topology.queue(*q).is_some_and(|def| def.consumer.allow_consuming))
    }
}

/// Declaring -> Declared, the only legal acknowledgement transition.
fn advance(state: Option<&mut DeclareState>) -> bool {
    match state {
        Some(state @ DeclareState::Declaring) => {
            *state = DeclareState::Declared;
            true
        }
        _ => false,
    }
}
