//! Alert sinks for state transitions and escalations.
//!
//! Supervisors call [`AlertSink::notify`] inline, so every sink must be
//! non-blocking: a slow consumer loses events rather than stalling a
//! tunnel's cycle.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use vortex_core::{HealthState, TunnelName};

use crate::error::EscalationRequired;

/// Event emitted by a supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HealthEvent {
    Transition {
        tunnel: TunnelName,
        from: HealthState,
        to: HealthState,
        at: u64,
    },
    Escalated(EscalationRequired),
}

impl HealthEvent {
    pub fn tunnel(&self) -> &str {
        match self {
            HealthEvent::Transition { tunnel, .. } => tunnel,
            HealthEvent::Escalated(e) => &e.tunnel,
        }
    }
}

/// Fire-and-forget event consumer.
pub trait AlertSink: Send + Sync {
    fn notify(&self, event: HealthEvent);
}

/// Writes events to the tracing log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn notify(&self, event: HealthEvent) {
        match event {
            HealthEvent::Transition { tunnel, from, to, .. } => {
                info!(%tunnel, %from, %to, "tunnel health changed");
            }
            HealthEvent::Escalated(e) => {
                error!(
                    tunnel = %e.tunnel,
                    attempts = e.attempts,
                    window_secs = e.window_secs,
                    "automatic recovery exhausted, manual reset required"
                );
            }
        }
    }
}

/// Forwards events into a bounded channel, dropping them when it is full.
#[derive(Debug, Clone)]
pub struct ChannelAlertSink {
    tx: mpsc::Sender<HealthEvent>,
}

impl ChannelAlertSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<HealthEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl AlertSink for ChannelAlertSink {
    fn notify(&self, event: HealthEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(tunnel = %event.tunnel(), "alert channel full, event dropped");
            }
            // Nobody is listening any more.
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

/// Sends each event to several sinks.
pub struct FanoutAlertSink {
    sinks: Vec<Arc<dyn AlertSink>>,
}

impl FanoutAlertSink {
    pub fn new(sinks: Vec<Arc<dyn AlertSink>>) -> Self {
        Self { sinks }
    }
}

impl AlertSink for FanoutAlertSink {
    fn notify(&self, event: HealthEvent) {
        for sink in &self.sinks {
            sink.notify(event.clone());
        }
    }
}
