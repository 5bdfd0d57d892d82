//! Fan-out of run events over a tokio broadcast channel.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::types::{Event, EventEnvelope};

const DEFAULT_CAPACITY: usize = 256;

/// Cheap to clone; every clone feeds the same subscribers.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
    emitted: Arc<AtomicUsize>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// `capacity` bounds how far a slow subscriber may fall behind before it lags.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            emitted: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Returns how many subscribers the envelope reached; with none it is discarded.
    pub fn publish(&self, envelope: EventEnvelope) -> usize {
        self.emitted.fetch_add(1, Ordering::Relaxed);
        self.sender.send(envelope).unwrap_or(0)
    }

    pub fn emit(&self, event: Event) -> usize {
        self.publish(EventEnvelope::new(event))
    }

    /// Receives every envelope published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    /// Follows the first run that starts after this call, ignoring every other run.
    pub fn subscribe_next_run(&self) -> RunSubscription {
        RunSubscription {
            run_id: None,
            receiver: self.sender.subscribe(),
            finished: false,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn event_count(&self) -> usize {
        self.emitted.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver filtered to one run that ends after its `RunFinished` event
pub struct RunSubscription {
    run_id: Option<Uuid>,
    receiver: broadcast::Receiver<EventEnvelope>,
    finished: bool,
}

impl RunSubscription {
    /// `None` until the followed run has started.
    pub fn run_id(&self) -> Option<Uuid> {
        self.run_id
    }

    /// Next event of the run, or `None` once the run finished or the bus is gone.
    ///
    /// Lagged receivers skip the events they missed.
    pub async fn recv(&mut self) -> Option<Event> {
        if self.finished {
            return None;
        }

        loop {
            match self.receiver.recv().await {
                Ok(envelope) => {
                    let event = envelope.event;
                    match self.run_id {
                        Some(run_id) if event.run_id() != run_id => continue,
                        Some(_) => {}
                        None if matches!(event, Event::RunStarted { .. }) => {
                            self.run_id = Some(event.run_id());
                        }
                        None => continue,
                    }
                    self.finished = event.is_terminal();
                    return Some(event);
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
