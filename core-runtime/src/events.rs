//! # Event Bus System
//!
//! Library-wide notifications over `tokio::sync::broadcast`, for hosts that
//! would rather consume a stream than register auth-state observers.
//!
//! ## Overview
//!
//! - **Event Types**: [`CoreEvent`] wrapping the domain enum [`AuthEvent`]
//! - **EventBus**: central broadcast channel for publishing events
//! - **EventStream**: receiver wrapper with filtering
//!
//! Observers registered through the auth context are the authoritative,
//! ordered notification path; the bus is a best-effort mirror. A slow
//! subscriber lags and receives `RecvError::Lagged`, it never slows the
//! emitter down.
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{AuthEvent, CoreEvent, EventBus};
//!
//! let event_bus = EventBus::new(100);
//! let mut subscriber = event_bus.subscribe();
//!
//! event_bus
//!     .emit(CoreEvent::Auth(AuthEvent::PopupOpened {
//!         correlation_id: "c-1".to_string(),
//!         provider_id: "google.com".to_string(),
//!     }))
//!     .ok();
//!
//! assert!(subscriber.try_recv().is_ok());
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

pub use tokio::sync::broadcast::error::{RecvError, SendError};
pub use tokio::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 100;

/// Top-level event published on the bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    /// Session and sign-in events
    Auth(AuthEvent),
}

impl CoreEvent {
    /// Returns a human-readable description of the event.
    pub fn description(&self) -> &str {
        match self {
            CoreEvent::Auth(e) => e.description(),
        }
    }

    pub fn severity(&self) -> EventSeverity {
        match self {
            CoreEvent::Auth(AuthEvent::PopupSettled { code: Some(_), .. })
            | CoreEvent::Auth(AuthEvent::RedirectResolved { code: Some(_), .. })
            | CoreEvent::Auth(AuthEvent::VerificationCompleted { code: Some(_), .. }) => {
                EventSeverity::Warning
            }
            CoreEvent::Auth(AuthEvent::StateChanged { .. })
            | CoreEvent::Auth(AuthEvent::PersistenceMigrated { .. }) => EventSeverity::Info,
            _ => EventSeverity::Debug,
        }
    }
}

/// Event severity levels for filtering and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

/// How a settled flow ended, as carried on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettledAs {
    Success,
    Error,
    Cancelled,
}

/// Events related to the session and the sign-in flows.
///
/// Payloads carry identifiers only; credentials never travel on the bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum AuthEvent {
    /// The current user changed.
    StateChanged {
        /// Uid of the new current user, `None` when signed out.
        uid: Option<String>,
        /// Whether the change was observed from another execution context.
        cross_context: bool,
    },
    /// A popup handoff window was opened.
    PopupOpened {
        correlation_id: String,
        provider_id: String,
    },
    /// A popup handoff produced its outcome.
    PopupSettled {
        correlation_id: String,
        settled_as: SettledAs,
        /// Error or cancellation code, if any.
        code: Option<String>,
    },
    /// Navigation to the provider was requested for a redirect handoff.
    RedirectRequested {
        correlation_id: String,
        provider_id: String,
    },
    /// A pending redirect was completed after reload.
    RedirectResolved {
        correlation_id: String,
        settled_as: SettledAs,
        code: Option<String>,
    },
    /// A verification code was dispatched.
    VerificationCodeSent { verification_id: String },
    /// A verification session reached a terminal state.
    VerificationCompleted {
        verification_id: String,
        code: Option<String>,
    },
    /// The user record moved to another persistence backend.
    PersistenceMigrated { from: String, to: String },
}

impl AuthEvent {
    fn description(&self) -> &str {
        match self {
            AuthEvent::StateChanged { .. } => "Auth state changed",
            AuthEvent::PopupOpened { .. } => "Popup sign-in started",
            AuthEvent::PopupSettled { .. } => "Popup sign-in settled",
            AuthEvent::RedirectRequested { .. } => "Redirect sign-in started",
            AuthEvent::RedirectResolved { .. } => "Redirect sign-in resolved",
            AuthEvent::VerificationCodeSent { .. } => "Verification code sent",
            AuthEvent::VerificationCompleted { .. } => "Verification completed",
            AuthEvent::PersistenceMigrated { .. } => "Persistence backend switched",
        }
    }
}

/// Central event bus for publishing and subscribing to events.
///
/// Cloning the bus yields another producer for the same channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// Creates a new event bus with the specified buffer size.
    ///
    /// Subscribers that fall behind by more than `capacity` events receive
    /// `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishes an event to all subscribers.
    ///
    /// Returns the number of subscribers that received the event, or an
    /// error if there are none.
    pub fn emit(&self, event: CoreEvent) -> Result<usize, SendError<CoreEvent>> {
        self.sender.send(event)
    }

    /// Creates a new subscriber. Past events are not replayed.
    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

type EventFilter = Box<dyn Fn(&CoreEvent) -> bool + Send + Sync>;

/// A wrapper around `broadcast::Receiver` with filtering.
///
/// ```rust
/// use core_runtime::events::{AuthEvent, CoreEvent, EventBus, EventStream};
///
/// let event_bus = EventBus::new(100);
/// let stream = EventStream::new(event_bus.subscribe())
///     .filter(|event| matches!(event, CoreEvent::Auth(AuthEvent::StateChanged { .. })));
/// ```
pub struct EventStream {
    receiver: Receiver<CoreEvent>,
    filter: Option<EventFilter>,
}

impl EventStream {
    pub fn new(receiver: Receiver<CoreEvent>) -> Self {
        Self {
            receiver,
            filter: None,
        }
    }

    /// Only events that match `predicate` will be returned.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CoreEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(predicate));
        self
    }

    /// Receives the next event that passes the filter.
    ///
    /// # Errors
    ///
    /// Returns `RecvError::Lagged(n)` if the subscriber fell behind by `n` events.
    /// Returns `RecvError::Closed` if all senders have been dropped.
    pub async fn recv(&mut self) -> Result<CoreEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.accepts(&event) {
                return Ok(event);
            }
        }
    }

    /// Attempts to receive an event without waiting.
    ///
    /// Returns `None` if no matching event is currently available.
    pub fn try_recv(&mut self) -> Option<Result<CoreEvent, RecvError>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if self.accepts(&event) {
                        return Some(Ok(event));
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    return Some(Err(RecvError::Lagged(n)))
                }
                Err(broadcast::error::TryRecvError::Closed) => return Some(Err(RecvError::Closed)),
            }
        }
    }

    fn accepts(&self, event: &CoreEvent) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(event))
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_changed(uid: &str) -> CoreEvent {
        CoreEvent::Auth(AuthEvent::StateChanged {
            uid: Some(uid.to_string()),
            cross_context: false,
        })
    }

    #[tokio::test]
    async fn test_event_emission_no_subscribers() {
        let bus = EventBus::new(10);
        assert!(bus.emit(state_changed("u-1")).is_err());
    }

    #[tokio::test]
    async fn test_multiple_subscribers_receive_same_event() {
        let bus = EventBus::new(10);
        let mut sub1 = bus.subscribe();
        let mut sub2 = bus.subscribe();

        assert_eq!(bus.emit(state_changed("u-1")).unwrap(), 2);
        assert_eq!(sub1.recv().await.unwrap(), state_changed("u-1"));
        assert_eq!(sub2.recv().await.unwrap(), state_changed("u-1"));
    }

    #[tokio::test]
    async fn test_event_stream_with_filter() {
        let bus = EventBus::new(10);
        let mut stream = EventStream::new(bus.subscribe()).filter(|event| {
            matches!(event, CoreEvent::Auth(AuthEvent::PersistenceMigrated { .. }))
        });

        bus.emit(state_changed("u-1")).unwrap();
        bus.emit(CoreEvent::Auth(AuthEvent::PersistenceMigrated {
            from: "tab".to_string(),
            to: "origin".to_string(),
        }))
        .unwrap();

        let event = stream.recv().await.unwrap();
        assert_eq!(event.description(), "Persistence backend switched");
        assert!(stream.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_lagged_subscriber() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe();
        for i in 0..5 {
            bus.emit(state_changed(&format!("u-{}", i))).unwrap();
        }

        assert!(matches!(sub.recv().await, Err(RecvError::Lagged(_))));
    }

    #[test]
    fn test_event_severity() {
        let failed = CoreEvent::Auth(AuthEvent::PopupSettled {
            correlation_id: "c".to_string(),
            settled_as: SettledAs::Cancelled,
            code: Some("popup-closed-by-user".to_string()),
        });
        assert_eq!(failed.severity(), EventSeverity::Warning);
        assert_eq!(state_changed("u").severity(), EventSeverity::Info);

        let opened = CoreEvent::Auth(AuthEvent::PopupOpened {
            correlation_id: "c".to_string(),
            provider_id: "google.com".to_string(),
        });
        assert_eq!(opened.severity(), EventSeverity::Debug);
    }

    #[test]
    fn test_event_serialization() {
        let event = CoreEvent::Auth(AuthEvent::VerificationCodeSent {
            verification_id: "v-1".to_string(),
        });
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"Auth\""));
        assert!(json.contains("\"event\":\"VerificationCodeSent\""));

        let back: CoreEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
