//! SSE session registry and streaming endpoint (§4.1, §6): one GET
//! connection per session. The `endpoint` event hands the client its
//! private POST URL; JSON-RPC responses and `notifications/tools/list_changed`
//! are pushed onto the session's channel and streamed out as `message`
//! events; a `pulse` event keeps the connection alive every 30s.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use axum::extract::{Path, State};
use axum::response::sse::{Event, Sse};
use futures_util::Stream;
use tokio::sync::{RwLock, broadcast};
use tracing::info;
use uuid::Uuid;

use super::GatewayState;

/// Bounded, non-blocking per-session channel (§5, §9 "SSE back-pressure"):
/// a slow client just starts lagging instead of stalling the dispatcher
/// that's trying to deliver its response.
const CHANNEL_CAPACITY: usize = 10;
const PULSE_INTERVAL: Duration = Duration::from_secs(30);

struct Session {
    profile_id: String,
    tx: broadcast::Sender<String>,
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    async fn register(&self, profile_id: &str) -> (String, broadcast::Receiver<String>) {
        let id = Uuid::new_v4().simple().to_string();
        let (tx, rx) = broadcast::channel(CHANNEL_CAPACITY);
        let session = Arc::new(Session {
            profile_id: profile_id.to_string(),
            tx,
        });
        self.sessions.write().await.insert(id.clone(), session);
        (id, rx)
    }

    async fn unregister(&self, session_id: &str) {
        self.sessions.write().await.remove(session_id);
    }

    /// Pushes a JSON-RPC payload onto one session's stream. Returns false
    /// if the session is gone (client disconnected before a response made
    /// it back).
    pub async fn send_to_session(&self, session_id: &str, payload: String) -> bool {
        match self.sessions.read().await.get(session_id) {
            Some(session) => session.tx.send(payload).is_ok(),
            None => false,
        }
    }

    /// Pushes a notification to every session open against a profile
    /// (`notifications/tools/list_changed`, §4.1 step 6).
    pub async fn broadcast_to_profile(&self, profile_id: &str, payload: String) {
        let sessions = self.sessions.read().await;
        for session in sessions.values().filter(|s| s.profile_id == profile_id) {
            let _ = session.tx.send(payload.clone());
        }
    }
}

pub async fn sse_handler(
    State(state): State<GatewayState>,
    Path(profile_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    stream_for_profile(state, profile_id).await
}

pub async fn default_profile_sse_handler(
    State(state): State<GatewayState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    stream_for_profile(state, super::ROOT_SHORTCUT_PROFILE.to_string()).await
}

async fn stream_for_profile(
    state: GatewayState,
    profile_id: String,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (session_id, mut rx) = state.sessions.register(&profile_id).await;
    let endpoint = format!("/profiles/{profile_id}/sse?sessionId={session_id}");
    info!(%profile_id, %session_id, "SSE session opened");

    let sessions = Arc::clone(&state.sessions);
    let closing_session_id = session_id.clone();

    let stream = stream! {
        yield Ok(Event::default().event("endpoint").data(endpoint));

        let mut pulse = tokio::time::interval(PULSE_INTERVAL);
        pulse.tick().await; // first tick fires immediately; the endpoint event already opened the stream

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Ok(payload) => yield Ok(Event::default().event("message").data(payload)),
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = pulse.tick() => {
                    yield Ok(Event::default().event("pulse").data("{}"));
                }
            }
        }

        sessions.unregister(&closing_session_id).await;
    };

    Sse::new(stream)
}
