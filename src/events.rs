//! Hub event stream
//!
//! Components publish state changes and alerts on an [`EventBus`]; observers
//! hold an explicit [`Subscription`]. Dropping the subscription unsubscribes,
//! and [`EventBus::close`] ends every subscription at shutdown.

use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::lb::alerts::Alert;
use crate::pool::circuit::CircuitPhase;
use crate::pool::connection::ConnectionState;

/// Outcome reported for a recovery probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryOutcome {
    Started,
    Succeeded,
    Failed,
    Exhausted,
}

/// Event published by the hub
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubEvent {
    ServerAdded {
        server: String,
    },
    ServerRemoved {
        server: String,
    },
    ConnectionStateChanged {
        server: String,
        from: ConnectionState,
        to: ConnectionState,
    },
    CircuitStateChanged {
        server: String,
        from: CircuitPhase,
        to: CircuitPhase,
    },
    Recovery {
        server: String,
        outcome: RecoveryOutcome,
    },
    Alert(Alert),
}

impl HubEvent {
    /// Server the event concerns, if any
    pub fn server(&self) -> Option<&str> {
        match self {
            HubEvent::ServerAdded { server }
            | HubEvent::ServerRemoved { server }
            | HubEvent::ConnectionStateChanged { server, .. }
            | HubEvent::CircuitStateChanged { server, .. }
            | HubEvent::Recovery { server, .. } => Some(server),
            HubEvent::Alert(alert) => alert.server.as_deref(),
        }
    }
}

enum Staging {
    Holding(Vec<HubEvent>),
    Released,
    Discarded,
}

/// Broadcast bus shared by every hub component
///
/// Publishing is serialized through one lock so events from a single
/// component reach subscribers in the order they were produced.
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<Mutex<Option<broadcast::Sender<HubEvent>>>>,
    staging: Option<Arc<Mutex<Staging>>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(Mutex::new(Some(sender))),
            staging: None,
        }
    }

    /// A handle on the same bus whose events are held back until
    /// [`StagedEvents::commit`], or dropped by [`StagedEvents::discard`]
    pub fn staged(&self) -> (EventBus, StagedEvents) {
        let staging = Arc::new(Mutex::new(Staging::Holding(Vec::new())));
        let bus = EventBus {
            sender: Arc::clone(&self.sender),
            staging: Some(Arc::clone(&staging)),
        };
        let handle = StagedEvents {
            staging,
            bus: EventBus {
                sender: Arc::clone(&self.sender),
                staging: None,
            },
        };
        (bus, handle)
    }

    /// Publish an event to all current subscribers
    pub fn publish(&self, event: HubEvent) {
        if let Some(staging) = &self.staging {
            let Ok(mut staging) = staging.lock() else {
                return;
            };
            match &mut *staging {
                Staging::Holding(held) => {
                    held.push(event);
                    return;
                }
                Staging::Discarded => return,
                Staging::Released => {}
            }
        }
        self.send(event);
    }

    fn send(&self, event: HubEvent) {
        debug!(event = ?event, "hub event");
        if let Ok(guard) = self.sender.lock() {
            if let Some(sender) = guard.as_ref() {
                // No receivers is not an error
                let _ = sender.send(event);
            }
        }
    }

    /// Open a new subscription; events published before this call are not seen
    pub fn subscribe(&self) -> Subscription {
        let receiver = match self.sender.lock() {
            Ok(guard) => guard.as_ref().map(|s| s.subscribe()),
            Err(_) => None,
        };

        let receiver = receiver.unwrap_or_else(|| {
            // Closed bus: hand out a receiver whose sender is already gone
            let (_, receiver) = broadcast::channel(1);
            receiver
        });

        Subscription { receiver }
    }

    /// Close the bus; subscribers drain what is buffered and then end
    pub fn close(&self) {
        if let Ok(mut guard) = self.sender.lock() {
            guard.take();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender.lock().map(|g| g.is_none()).unwrap_or(true)
    }
}

/// Controls the events held back by a bus from [`EventBus::staged`]
pub struct StagedEvents {
    staging: Arc<Mutex<Staging>>,
    bus: EventBus,
}

impl StagedEvents {
    /// Publish the held events in order; later events go straight through
    pub fn commit(self) {
        let Ok(mut staging) = self.staging.lock() else {
            return;
        };
        if let Staging::Holding(held) = std::mem::replace(&mut *staging, Staging::Released) {
            for event in held {
                self.bus.send(event);
            }
        }
    }

    /// Drop the held events and every later one
    pub fn discard(self) {
        if let Ok(mut staging) = self.staging.lock() {
            *staging = Staging::Discarded;
        }
    }
}

/// Explicit subscription handle returned by [`EventBus::subscribe`]
pub struct Subscription {
    receiver: broadcast::Receiver<HubEvent>,
}

impl Subscription {
    /// Wait for the next event; `None` once the bus is closed and drained
    pub async fn recv(&mut self) -> Option<HubEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped = skipped, "event subscriber lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking receive
    pub fn try_recv(&mut self) -> Option<HubEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped = skipped, "event subscriber lagged, events dropped");
                }
                Err(_) => return None,
            }
        }
    }

    /// Drain everything currently buffered
    pub fn drain(&mut self) -> Vec<HubEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.try_recv() {
            events.push(event);
        }
        events
    }
}
