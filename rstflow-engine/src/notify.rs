//! Post-commit notifications.
//!
//! Sinks only ever see committed facts. Delivery is at-most-once: a sink
//! error is logged by the caller and never undoes a commit.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;

/// Something that happened to a workflow instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    /// First dispatch for an unseen id.
    Created {
        type_name: String,
        instance_id: String,
        initial_state: String,
        timestamp: DateTime<Utc>,
    },
    /// One realized transition.
    Transitioned {
        type_name: String,
        instance_id: String,
        from_state: String,
        to_state: String,
        event_type: String,
        event_payload: Value,
        timestamp: DateTime<Utc>,
    },
    /// The sweeper delivered a timeout event.
    TimeoutTriggered {
        type_name: String,
        instance_id: String,
        state: String,
        expired_at: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },
}

impl Notification {
    pub fn type_name(&self) -> &str {
        match self {
            Notification::Created { type_name, .. }
            | Notification::Transitioned { type_name, .. }
            | Notification::TimeoutTriggered { type_name, .. } => type_name,
        }
    }

    pub fn instance_id(&self) -> &str {
        match self {
            Notification::Created { instance_id, .. }
            | Notification::Transitioned { instance_id, .. }
            | Notification::TimeoutTriggered { instance_id, .. } => instance_id,
        }
    }

    fn from_state(&self) -> Option<&str> {
        match self {
            Notification::Transitioned { from_state, .. } => Some(from_state),
            Notification::TimeoutTriggered { state, .. } => Some(state),
            Notification::Created { .. } => None,
        }
    }

    fn to_state(&self) -> Option<&str> {
        match self {
            Notification::Transitioned { to_state, .. } => Some(to_state),
            Notification::Created { initial_state, .. } => Some(initial_state),
            Notification::TimeoutTriggered { .. } => None,
        }
    }

    fn event_type(&self) -> Option<&str> {
        match self {
            Notification::Transitioned { event_type, .. } => Some(event_type),
            _ => None,
        }
    }
}

/// Notification delivery failure.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification sink closed")]
    Closed,

    #[error("notification rejected: {0}")]
    Rejected(String),
}

/// Receives notifications after commit.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: Notification) -> Result<(), NotifyError>;
}

/// Discards every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl NotificationSink for NoopSink {
    fn notify(&self, _notification: Notification) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// Filter for global subscriptions. Empty lists match everything.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub types: Vec<String>,
    pub from_states: Vec<String>,
    pub to_states: Vec<String>,
    pub event_types: Vec<String>,
}

impl EventFilter {
    /// Returns true if the notification matches this filter.
    pub fn matches(&self, notification: &Notification) -> bool {
        fn allows(list: &[String], value: Option<&str>) -> bool {
            list.is_empty() || value.map(|v| list.iter().any(|l| l == v)).unwrap_or(false)
        }

        allows(&self.types, Some(notification.type_name()))
            && allows(&self.from_states, notification.from_state())
            && allows(&self.to_states, notification.to_state())
            && allows(&self.event_types, notification.event_type())
    }
}

/// A filtered view over the global channel.
pub struct Subscription {
    filter: EventFilter,
    receiver: broadcast::Receiver<Notification>,
}

impl Subscription {
    /// Next matching notification; `None` once the broadcaster is gone.
    pub async fn recv(&mut self) -> Option<Notification> {
        loop {
            match self.receiver.recv().await {
                Ok(n) if self.filter.matches(&n) => return Some(n),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "subscriber lagged, notifications dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Fans notifications out over `tokio` broadcast channels.
///
/// Each notification goes to the channel of its instance, if anyone watches
/// it, and to the global channel.
pub struct Broadcaster {
    channels: DashMap<String, broadcast::Sender<Notification>>,
    global_sender: broadcast::Sender<Notification>,
    channel_capacity: usize,
}

impl Broadcaster {
    pub fn new(channel_capacity: usize) -> Self {
        let (global_sender, _) = broadcast::channel(channel_capacity);
        Self {
            channels: DashMap::new(),
            global_sender,
            channel_capacity,
        }
    }

    /// Subscribes to one instance's notifications.
    pub fn subscribe_instance(&self, instance_id: &str) -> broadcast::Receiver<Notification> {
        self.channels
            .entry(instance_id.to_string())
            .or_insert_with(|| broadcast::channel(self.channel_capacity).0)
            .subscribe()
    }

    /// Subscribes to every notification matching `filter`.
    pub fn subscribe_all(&self, filter: EventFilter) -> Subscription {
        Subscription {
            filter,
            receiver: self.global_sender.subscribe(),
        }
    }

    /// Number of instances with a dedicated channel.
    pub fn watched_instances(&self) -> usize {
        self.channels.len()
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl NotificationSink for Broadcaster {
    fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        let instance_id = notification.instance_id().to_string();

        let abandoned = match self.channels.get(&instance_id) {
            Some(sender) => sender.send(notification.clone()).is_err(),
            None => false,
        };
        if abandoned {
            self.channels
                .remove_if(&instance_id, |_, sender| sender.receiver_count() == 0);
        }

        // no receivers is not an error
        let _ = self.global_sender.send(notification);
        Ok(())
    }
}
