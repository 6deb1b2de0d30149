// libs/scheduling-cell/src/events.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::debug;
use uuid::Uuid;

use crate::models::AppointmentStatus;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DomainEventKind {
    AppointmentBooked,
    AppointmentConfirmed,
    AppointmentCancelled,
    AppointmentRescheduled,
    ArrivalRecorded,
    SessionStarted,
    SessionCompleted,
    MarkedNoShow,
    ReminderSent,
}

/// Emitted after every successful transition, for the audit-log and
/// notification collaborators. Consumers read asynchronously; emission never
/// delays or fails the transition itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    pub event_id: Uuid,
    pub appointment_id: Uuid,
    pub kind: DomainEventKind,
    pub actor: Option<Uuid>,
    pub previous_status: Option<AppointmentStatus>,
    pub new_status: AppointmentStatus,
    pub occurred_at: DateTime<Utc>,
}

pub struct EventPublisher {
    sender: UnboundedSender<DomainEvent>,
}

impl EventPublisher {
    /// Publisher with a live subscriber. The receiver is the event stream.
    pub fn attached() -> (Self, UnboundedReceiver<DomainEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    /// Publisher with no subscriber; events are dropped on publish.
    pub fn unattached() -> Self {
        let (sender, _receiver) = mpsc::unbounded_channel();
        Self { sender }
    }

    pub fn publish(&self, event: DomainEvent) {
        if self.sender.send(event).is_err() {
            debug!("no active event subscriber, dropping domain event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn attached_publisher_delivers_events() {
        let (publisher, mut receiver) = EventPublisher::attached();
        publisher.publish(DomainEvent {
            event_id: Uuid::new_v4(),
            appointment_id: Uuid::new_v4(),
            kind: DomainEventKind::AppointmentBooked,
            actor: None,
            previous_status: None,
            new_status: AppointmentStatus::Pending,
            occurred_at: Utc::now(),
        });

        let event = receiver.recv().await.expect("event delivered");
        assert_eq!(event.kind, DomainEventKind::AppointmentBooked);
    }

    #[test]
    fn unattached_publisher_drops_events_silently() {
        let publisher = EventPublisher::unattached();
        publisher.publish(DomainEvent {
            event_id: Uuid::new_v4(),
            appointment_id: Uuid::new_v4(),
            kind: DomainEventKind::SessionStarted,
            actor: None,
            previous_status: Some(AppointmentStatus::Confirmed),
            new_status: AppointmentStatus::InProgress,
            occurred_at: Utc::now(),
        });
    }
}
