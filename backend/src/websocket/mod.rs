//! # WebSocket Module
//!
//! This module pushes core events to connected clients. The registry is the
//! production [`NotificationSink`]: every event a service dispatches after
//! commit is fanned out to the sessions of its recipients.
//!
//! ## Connection Flow
//!
//! ```text
//! 1. Client connects to /ws/:user
//!              ↓
//! 2. Server registers the session under the user id
//!              ↓
//! 3. Events concerning the user are pushed as they occur:
//!    - class_created, class_cancelled
//!    - escrow_held, escrow_released, escrow_refunded
//!    - reschedule_proposed, reschedule_resolved
//!    - ...
//! ```
//!
//! ## Message Format
//!
//! All messages are JSON:
//!
//! ```json
//! {
//!     "event": "escrow_refunded",
//!     "data": {
//!         "event": "escrow_refunded",
//!         "escrowId": "9b1f...",
//!         "classId": "c7d2...",
//!         "studentId": "student-1",
//!         "refundedAmount": 500000
//!     },
//!     "timestamp": "2025-01-05T08:00:00Z"
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use actix_web::{web, HttpRequest, HttpResponse};
use actix_ws::Message;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

use crate::services::notifications::{CoreEvent, NotificationSink};
use crate::AppState;

/// Buffered messages per session before a slow client starts lagging.
const SESSION_BUFFER: usize = 100;

/// WebSocket message wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsMessage<T> {
    /// Event name, e.g. `class_cancelled`.
    pub event: String,
    /// Event data.
    pub data: T,
    pub timestamp: DateTime<Utc>,
}

impl<T: Serialize> WsMessage<T> {
    pub fn new(event: impl Into<String>, data: T) -> Self {
        Self {
            event: event.into(),
            data,
            timestamp: Utc::now(),
        }
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// WebSocket connection registry.
///
/// Tracks active WebSocket sessions per user. A user can hold several
/// sessions (tabs, devices); each gets its own broadcast channel.
#[derive(Clone, Default)]
pub struct WsRegistry {
    sessions: Arc<Mutex<HashMap<String, Vec<broadcast::Sender<String>>>>>,
}

impl WsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session for a user and return its message stream.
    pub async fn register(&self, user: String) -> broadcast::Receiver<String> {
        let mut sessions = self.sessions.lock().await;
        let (tx, rx) = broadcast::channel(SESSION_BUFFER);

        let senders = sessions.entry(user.clone()).or_insert_with(Vec::new);
        senders.push(tx);

        info!("Registered WebSocket for user: {} (total connections: {})", user, senders.len());
        rx
    }

    /// Drop the sessions of `user` whose receivers are gone.
    pub async fn unregister(&self, user: &str) {
        let mut sessions = self.sessions.lock().await;
        if let Some(senders) = sessions.get_mut(user) {
            senders.retain(|tx| tx.receiver_count() > 0);

            if senders.is_empty() {
                sessions.remove(user);
                info!("Unregistered all WebSocket connections for user: {}", user);
            } else {
                info!(
                    "Unregistered one WebSocket connection for user: {} (remaining: {})",
                    user,
                    senders.len()
                );
            }
        }
    }

    /// Send a serialized message to every session of `user`.
    ///
    /// A user without sessions is not an error.
    pub async fn send_to_user(&self, user: &str, json: &str) {
        let mut sessions = self.sessions.lock().await;

        let Some(senders) = sessions.get_mut(user) else {
            debug!("No active WebSocket connections for user: {}", user);
            return;
        };

        // A send fails only when every receiver of that channel is gone.
        senders.retain(|sender| sender.send(json.to_string()).is_ok());
        let sent = senders.len();
        if senders.is_empty() {
            sessions.remove(user);
        }

        if sent > 0 {
            debug!("Sent message to user {} ({} connections)", user, sent);
        }
    }

    /// Serialize `event` once and deliver it to each recipient.
    pub async fn send_event(&self, event: &CoreEvent) {
        let message = WsMessage::new(event.name(), event);
        let json = match message.to_json() {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize {} event: {}", event.name(), e);
                return;
            }
        };

        for user in event.recipients() {
            self.send_to_user(&user, &json).await;
        }
    }

    pub async fn connection_count(&self, user: &str) -> usize {
        let sessions = self.sessions.lock().await;
        sessions.get(user).map(|v| v.len()).unwrap_or(0)
    }

    pub async fn total_connections(&self) -> usize {
        let sessions = self.sessions.lock().await;
        sessions.values().map(|v| v.len()).sum()
    }
}

impl NotificationSink for WsRegistry {
    /// Delivery runs on its own task; the caller never waits on sockets.
    fn dispatch(&self, event: CoreEvent) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime to deliver {} event; dropped", event.name());
            return;
        };

        let registry = self.clone();
        runtime.spawn(async move {
            registry.send_event(&event).await;
        });
    }
}

/// Configure WebSocket routes.
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/ws/{user}", web::get().to(websocket_handler));
}

/// WebSocket connection handler.
///
/// ## Endpoint
///
/// `GET /ws/:user`
///
/// ## Example (JavaScript)
///
/// ```javascript
/// const ws = new WebSocket('ws://localhost:8080/ws/student-1');
///
/// ws.onmessage = (event) => {
///     const message = JSON.parse(event.data);
///     console.log('Event:', message.event);
///     console.log('Data:', message.data);
/// };
/// ```
pub async fn websocket_handler(
    req: HttpRequest,
    path: web::Path<String>,
    body: web::Payload,
    state: web::Data<Arc<AppState>>,
) -> Result<HttpResponse, actix_web::Error> {
    let user = path.into_inner();
    info!("WebSocket connection request for user: {}", user);

    let (response, mut session, mut msg_stream) = actix_ws::handle(&req, body)?;

    let registry = state.ws_registry.clone();
    let mut rx = registry.register(user.clone()).await;

    actix_rt::spawn(async move {
        info!("WebSocket connected for user: {}", user);

        let welcome = WsMessage::new(
            "connected",
            serde_json::json!({
                "user": user,
                "message": "You will receive class, escrow and reschedule events"
            }),
        );
        if let Ok(json) = welcome.to_json() {
            if let Err(e) = session.text(json).await {
                error!("Failed to send welcome message: {}", e);
            }
        }

        // Forward registry messages to the socket.
        let mut forward_session = session.clone();
        let forward_user = user.clone();
        let forward_registry = registry.clone();
        actix_rt::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(msg) => {
                        if let Err(e) = forward_session.text(msg).await {
                            debug!("WebSocket session closed for {}: {}", forward_user, e);
                            forward_registry.unregister(&forward_user).await;
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("WebSocket for {} lagged, {} messages skipped", forward_user, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        while let Some(Ok(msg)) = msg_stream.next().await {
            match msg {
                Message::Ping(bytes) => {
                    let _ = session.pong(&bytes).await;
                }
                Message::Pong(_) => {}
                Message::Text(text) => {
                    debug!("Received text from {}: {}", user, text);
                    let reply = WsMessage::new("pong", serde_json::json!({ "received": text.to_string() }));
                    if let Ok(json) = reply.to_json() {
                        let _ = session.text(json).await;
                    }
                }
                Message::Binary(_) => {
                    warn!("Received unexpected binary message from {}", user);
                }
                Message::Close(reason) => {
                    info!("WebSocket closed for {}: {:?}", user, reason);
                    break;
                }
                _ => {}
            }
        }

        registry.unregister(&user).await;
        info!("WebSocket disconnected for user: {}", user);
    });

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::CancellationReason;

    fn cancelled() -> CoreEvent {
        CoreEvent::ClassCancelled {
            class_id: "c1".into(),
            tutor_id: "t1".into(),
            reason: CancellationReason::AdminForced,
            student_ids: vec!["s1".into()],
        }
    }

    #[tokio::test]
    async fn test_event_reaches_every_recipient() {
        let registry = WsRegistry::new();
        let mut tutor = registry.register("t1".into()).await;
        let mut student = registry.register("s1".into()).await;
        let mut bystander = registry.register("s2".into()).await;

        registry.send_event(&cancelled()).await;

        for rx in [&mut tutor, &mut student] {
            let json = rx.recv().await.unwrap();
            let message: WsMessage<serde_json::Value> = serde_json::from_str(&json).unwrap();
            assert_eq!(message.event, "class_cancelled");
            assert_eq!(message.data["classId"], "c1");
            assert_eq!(message.data["reason"], "admin_forced");
        }
        assert!(bystander.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dispatch_delivers_in_background() {
        let registry = WsRegistry::new();
        let mut student = registry.register("s1".into()).await;

        registry.dispatch(cancelled());

        let json = student.recv().await.unwrap();
        assert!(json.contains("class_cancelled"));
    }

    #[tokio::test]
    async fn test_dead_sessions_are_dropped() {
        let registry = WsRegistry::new();
        let rx = registry.register("s1".into()).await;
        let _live = registry.register("s1".into()).await;
        assert_eq!(registry.connection_count("s1").await, 2);

        drop(rx);
        registry.send_to_user("s1", "{}").await;
        assert_eq!(registry.connection_count("s1").await, 1);
        assert_eq!(registry.total_connections().await, 1);
    }
}
