// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Single-shot delayed reconnection.

use super::{ClientLoop, Event, EventSink};
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{info, warn};

/// At most one pending timer and one reconnect attempt at a time, however many
/// close events overlap.
#[derive(Debug)]
pub(crate) struct Reconnect {
    delay: Duration,
    timer: Option<AbortHandle>,
    /// A connection attempt started by the timer has not reported back yet.
    pub(crate) in_flight: bool,
}

impl Reconnect {
    pub(crate) fn new(delay: Duration) -> Self {
        Reconnect {
            delay,
            timer: None,
            in_flight: false,
        }
    }

    pub(crate) fn is_scheduled(&self) -> bool {
        self.timer.is_some()
    }

    /// Starts the timer unless one is already pending.
    pub(crate) fn arm(&mut self, sink: &EventSink) -> bool {
        if self.timer.is_some() {
            return false;
        }

        let sink = sink.clone();
        let delay = self.delay;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            sink.send(Event::ReconnectTimer);
        });
        self.timer = Some(timer.abort_handle());
        true
    }

    /// The timer fired. Returns whether an attempt should be made now.
    pub(crate) fn fire(&mut self) -> bool {
        self.timer = None;
        if self.in_flight {
            return false;
        }
        self.in_flight = true;
        true
    }

    pub(crate) fn cancel(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.in_flight = false;
    }
}

impl ClientLoop {
    pub(super) fn schedule_reconnect(&mut self) {
        if self.reconnect.arm(&self.sink) {
            info!(
                delay_secs = self.reconnect.delay.as_secs(),
                "reconnect scheduled"
            );
        }
    }

    pub(super) fn on_reconnect_timer(&mut self) {
        if self.shutdown_requested {
            self.reconnect.cancel();
            return;
        }
        if !self.reconnect.fire() {
            return;
        }
        if self.active {
            self.reconnect.in_flight = false;
            return;
        }

        info!("reconnecting");
        if let Err(err) = self.start() {
            warn!(error = err.to_string(), "reconnect attempt rejected");
            self.reconnect.in_flight = false;
        }
    }
}
