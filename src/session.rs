// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Per-connection runtime state of the topology.
//!
//! A fresh [`Session`] is built from the [`Topology`] every time the client
//! connects, so nothing declared on a previous connection leaks into the next one.

use crate::{
    dispatcher::InFlight,
    topology::{BindingId, QueueId, Topology},
};

/// Declaration progress of an exchange or a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeclareState {
    #[default]
    Unregistered,
    Declaring,
    Declared,
}

/// Progress of a queue binding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BindState {
    #[default]
    Unbound,
    Binding,
    Bound,
}

/// Consumer lifecycle of a queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ConsumerState {
    #[default]
    Idle,
    /// `basic_consume` issued, waiting for the broker to confirm.
    Subscribing,
    /// The broker confirmed the consumer.
    Consuming { tag: String },
    /// `basic_cancel` issued during shutdown.
    Cancelling { tag: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) enum QosState {
    #[default]
    Unset,
    Requested,
    Configured,
}

#[derive(Debug, Default)]
pub(crate) struct QueueSession {
    pub(crate) state: DeclareState,
    /// Name assigned by the broker on declare-ok.
    pub(crate) server_name: Option<String>,
    pub(crate) consumer: ConsumerState,
    pub(crate) stopping: bool,
    pub(crate) in_flight: InFlight,
}

impl QueueSession {
    /// Deliveries are accepted from the moment `basic_consume` is issued.
    pub(crate) fn accepts_deliveries(&self) -> bool {
        !self.stopping
            && matches!(
                self.consumer,
                ConsumerState::Subscribing | ConsumerState::Consuming { .. }
            )
    }
}

#[derive(Debug)]
pub(crate) struct Session {
    pub(crate) exchanges: Vec<DeclareState>,
    pub(crate) queues: Vec<QueueSession>,
    pub(crate) bindings: Vec<BindState>,
    pub(crate) qos: QosState,
    pub(crate) ready: bool,
}

impl Session {
    pub(crate) fn new(topology: &Topology) -> Self {
        Session {
            exchanges: vec![DeclareState::default(); topology.exchange_count()],
            queues: (0..topology.queue_count())
                .map(|_| QueueSession::default())
                .collect(),
            bindings: vec![BindState::default(); topology.binding_count()],
            qos: QosState::default(),
            ready: false,
        }
    }

    pub(crate) fn queue_mut(&mut self, id: QueueId) -> Option<&mut QueueSession> {
        self.queues.get_mut(id.0)
    }

    pub(crate) fn binding(&self, id: BindingId) -> BindState {
        self.bindings.get(id.0).copied().unwrap_or_default()
    }

    /// Name to use on the wire for `queue`: the broker-assigned one when known.
    pub(crate) fn queue_name<'a>(&'a self, topology: &'a Topology, queue: QueueId) -> &'a str {
        self.queues
            .get(queue.0)
            .and_then(|q| q.server_name.as_deref())
            .or_else(|| topology.queue(queue).map(|def| def.name()))
            .unwrap_or_default()
    }

    pub(crate) fn has_in_flight(&self) -> bool {
        self.queues.iter().any(|q| !q.in_flight.is_empty())
    }
}
