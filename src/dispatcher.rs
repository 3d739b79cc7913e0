// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-flight Handler Tracking
//!
//! Every delivery accepted by the dispatcher runs in its own tokio task. Each queue
//! keeps the abort handles of its running tasks so that shutdown can wait for them
//! to drain and, past the queue's timeout, cancel the stragglers.

use std::collections::HashMap;
use tokio::task::AbortHandle;

/// Handler tasks currently running for one queue.
#[derive(Debug, Default)]
pub(crate) struct InFlight {
    next_id: u64,
    tasks: HashMap<u64, AbortHandle>,
}

impl InFlight {
    /// Reserves the id under which the next task will be tracked.
    pub(crate) fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub(crate) fn insert(&mut self, id: u64, task: AbortHandle) {
        self.tasks.insert(id, task);
    }

    /// Forgets a finished task. Returns whether it was still tracked.
    pub(crate) fn remove(&mut self, id: u64) -> bool {
        self.tasks.remove(&id).is_some()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Cancels every tracked task. Cancellation is best-effort: a task is only
    /// stopped at its next suspension point.
    pub(crate) fn abort_all(&mut self) -> usize {
        let count = self.tasks.len();
        for (_, task) in self.tasks.drain() {
            task.abort();
        }
        count
    }
}
