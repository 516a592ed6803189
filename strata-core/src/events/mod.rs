//! Event bus for Strata build and container events.
//!
//! Builds publish progress here (step started, cached, finished, output
//! lines); the CLI subscribes to render it.
//!
//! # Example
//!
//! ```ignore
//! let bus = EventBus::new();
//!
//! // Subscribe to step events
//! let mut rx = bus.subscribe(vec!["step.*".to_string()]);
//!
//! bus.publish(Event::new("build-1", EventKind::StepCached { step: 2, cache_key: key }));
//!
//! while let Some(event) = rx.recv().await {
//!     println!("Received: {:?}", event);
//! }
//! ```

use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tracing::debug;

/// Maximum number of events buffered in the broadcast channel.
const EVENT_BUFFER_SIZE: usize = 1024;

/// Which stream an output line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// What happened.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    // Build events
    BuildStarted { total_steps: usize },
    BuildCompleted { image_id: String, cached_steps: usize, total_steps: usize },
    BuildFailed { step: Option<usize>, error: String },

    // Step events
    StepStarted { step: usize, total: usize, instruction: String },
    StepCached { step: usize, cache_key: String },
    StepFinished { step: usize, duration_ms: u64, layer: Option<String> },
    StepOutput { step: usize, stream: OutputStream, line: String },

    // Image events
    ImagePulled { reference: String, image_id: String },

    // Container events
    ContainerStarted { image_id: String },
    ContainerExited { exit_code: i32 },
}

impl EventKind {
    /// Get the event type string (e.g., "step.cached").
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::BuildStarted { .. } => "build.started",
            EventKind::BuildCompleted { .. } => "build.completed",
            EventKind::BuildFailed { .. } => "build.failed",
            EventKind::StepStarted { .. } => "step.started",
            EventKind::StepCached { .. } => "step.cached",
            EventKind::StepFinished { .. } => "step.finished",
            EventKind::StepOutput { .. } => "step.output",
            EventKind::ImagePulled { .. } => "image.pulled",
            EventKind::ContainerStarted { .. } => "container.started",
            EventKind::ContainerExited { .. } => "container.exited",
        }
    }
}

/// An event with its source and time.
#[derive(Debug, Clone)]
pub struct Event {
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
    /// Build or container ID
    pub resource_id: String,
    pub kind: EventKind,
}

impl Event {
    pub fn new(resource_id: &str, kind: EventKind) -> Self {
        Self {
            timestamp: SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64,
            resource_id: resource_id.to_string(),
            kind,
        }
    }

    pub fn event_type(&self) -> &'static str {
        self.kind.as_str()
    }
}

/// Event bus for publishing and subscribing to events.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new event bus.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: Event) {
        // Output lines are too chatty for debug logs
        if !matches!(event.kind, EventKind::StepOutput { .. }) {
            debug!(event_type = event.event_type(), resource_id = %event.resource_id, "Publishing event");
        }
        // Ignore send errors (no subscribers)
        let _ = self.sender.send(event);
    }

    /// Shorthand for `publish(Event::new(..))`.
    pub fn emit(&self, resource_id: &str, kind: EventKind) {
        self.publish(Event::new(resource_id, kind));
    }

    /// Subscribe to events, optionally filtered by event type patterns.
    ///
    /// # Filter patterns
    ///
    /// - `"step.*"` - All step events
    /// - `"build.failed"` - Only build failures
    /// - Empty list - All events
    pub fn subscribe(&self, filters: Vec<String>) -> EventSubscriber {
        EventSubscriber { receiver: self.sender.subscribe(), filters }
    }

    /// Get the number of current subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Event subscriber with optional filtering.
pub struct EventSubscriber {
    receiver: broadcast::Receiver<Event>,
    filters: Vec<String>,
}

impl EventSubscriber {
    /// Receive the next matching event; `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if self.matches(&event) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!("Event subscriber lagged by {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return None;
                }
            }
        }
    }

    /// Check if an event matches the filters.
    fn matches(&self, event: &Event) -> bool {
        if self.filters.is_empty() {
            return true;
        }

        let event_type = event.event_type();
        self.filters.iter().any(|filter| match filter.strip_suffix(".*") {
            Some(prefix) => event_type.split('.').next() == Some(prefix),
            None => filter == event_type,
        })
    }
}
