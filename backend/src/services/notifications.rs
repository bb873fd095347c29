//! # Notifications
//!
//! The core emits events after a unit of work commits and never waits on
//! their delivery. Formatting and transport belong to the sink; the
//! production sink is the WebSocket registry.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::db::{CancellationReason, RescheduleStatus};

/// Events emitted by the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CoreEvent {
    #[serde(rename_all = "camelCase")]
    ClassCreated {
        class_id: String,
        tutor_id: String,
        student_id: Option<String>,
        lesson_count: usize,
    },
    #[serde(rename_all = "camelCase")]
    RequestAccepted {
        request_id: String,
        application_id: String,
        class_id: String,
        student_id: String,
        tutor_id: String,
    },
    #[serde(rename_all = "camelCase")]
    ApplicationRejected {
        application_id: String,
        request_id: String,
        tutor_id: String,
    },
    #[serde(rename_all = "camelCase")]
    ClassCancelled {
        class_id: String,
        tutor_id: String,
        reason: CancellationReason,
        student_ids: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    EscrowHeld {
        escrow_id: String,
        class_id: String,
        student_id: String,
        amount: i64,
    },
    #[serde(rename_all = "camelCase")]
    EscrowReleased {
        escrow_id: String,
        class_id: String,
        tutor_id: String,
        net_amount: i64,
        commission_amount: i64,
    },
    #[serde(rename_all = "camelCase")]
    EscrowRefunded {
        escrow_id: String,
        class_id: String,
        student_id: String,
        refunded_amount: i64,
    },
    #[serde(rename_all = "camelCase")]
    RescheduleProposed {
        reschedule_id: String,
        lesson_id: String,
        requester_id: String,
        responder_id: String,
    },
    #[serde(rename_all = "camelCase")]
    RescheduleResolved {
        reschedule_id: String,
        lesson_id: String,
        requester_id: String,
        responder_id: String,
        status: RescheduleStatus,
    },
    #[serde(rename_all = "camelCase")]
    RequestExpired { request_id: String, student_id: String },
}

impl CoreEvent {
    pub fn name(&self) -> &'static str {
        match self {
            CoreEvent::ClassCreated { .. } => "class_created",
            CoreEvent::RequestAccepted { .. } => "request_accepted",
            CoreEvent::ApplicationRejected { .. } => "application_rejected",
            CoreEvent::ClassCancelled { .. } => "class_cancelled",
            CoreEvent::EscrowHeld { .. } => "escrow_held",
            CoreEvent::EscrowReleased { .. } => "escrow_released",
            CoreEvent::EscrowRefunded { .. } => "escrow_refunded",
            CoreEvent::RescheduleProposed { .. } => "reschedule_proposed",
            CoreEvent::RescheduleResolved { .. } => "reschedule_resolved",
            CoreEvent::RequestExpired { .. } => "request_expired",
        }
    }

    /// Users the event concerns.
    pub fn recipients(&self) -> Vec<String> {
        match self {
            CoreEvent::ClassCreated { tutor_id, student_id, .. } => {
                let mut users = vec![tutor_id.clone()];
                users.extend(student_id.iter().cloned());
                users
            }
            CoreEvent::RequestAccepted { student_id, tutor_id, .. } => {
                vec![student_id.clone(), tutor_id.clone()]
            }
            CoreEvent::ApplicationRejected { tutor_id, .. } => vec![tutor_id.clone()],
            CoreEvent::ClassCancelled { tutor_id, student_ids, .. } => {
                let mut users = vec![tutor_id.clone()];
                users.extend(student_ids.iter().cloned());
                users
            }
            CoreEvent::EscrowHeld { student_id, .. } => vec![student_id.clone()],
            CoreEvent::EscrowReleased { tutor_id, .. } => vec![tutor_id.clone()],
            CoreEvent::EscrowRefunded { student_id, .. } => vec![student_id.clone()],
            CoreEvent::RescheduleProposed { requester_id, responder_id, .. }
            | CoreEvent::RescheduleResolved { requester_id, responder_id, .. } => {
                vec![requester_id.clone(), responder_id.clone()]
            }
            CoreEvent::RequestExpired { student_id, .. } => vec![student_id.clone()],
        }
    }
}

/// Fire-and-forget event consumer.
pub trait NotificationSink: Send + Sync {
    fn dispatch(&self, event: CoreEvent);
}

/// Dispatch every event in order.
pub fn dispatch_all(sink: &dyn NotificationSink, events: Vec<CoreEvent>) {
    for event in events {
        sink.dispatch(event);
    }
}

/// Keeps every event in memory. Used by tests and by the memory backend.
#[derive(Clone, Default)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<CoreEvent>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<CoreEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events().iter().filter(|e| e.name() == name).count()
    }
}

impl NotificationSink for RecordingSink {
    fn dispatch(&self, event: CoreEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_name_tag() {
        let event = CoreEvent::EscrowRefunded {
            escrow_id: "e1".into(),
            class_id: "c1".into(),
            student_id: "s1".into(),
            refunded_amount: 500,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], event.name());
        assert_eq!(value["refundedAmount"], 500);
        assert_eq!(event.recipients(), vec!["s1".to_string()]);
    }

    #[test]
    fn test_recording_sink_counts_by_name() {
        let sink = RecordingSink::new();
        dispatch_all(
            &sink,
            vec![
                CoreEvent::RequestExpired { request_id: "r1".into(), student_id: "s1".into() },
                CoreEvent::RequestExpired { request_id: "r2".into(), student_id: "s1".into() },
            ],
        );
        assert_eq!(sink.count("request_expired"), 2);
        assert_eq!(sink.count("class_created"), 0);
    }
}
