//! Session Bus (C11) — cross-worker session state plus topic pub/sub, per
//! §4.11.
//!
//! `DashMap` + `tokio::sync::broadcast` is the same pairing the pack's
//! `rag-api-server`/`localcached-server` crates use for their event buses:
//! a concurrent map of topic -> broadcast sender, channels created lazily on
//! first `subscribe`, publishes to a topic with no subscribers silently
//! dropped (at-most-once, matching the spec's delivery guarantee). This
//! crate runs single-process, so "cross-worker" here means cross-task: the
//! bus is the one seam through which a future multi-worker front-end could
//! be introduced without touching callers.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::models::SessionState;

/// Default channel backlog per topic; slow subscribers that fall behind
/// this many messages observe a `Lagged` error on their next `recv`.
const TOPIC_CHANNEL_CAPACITY: usize = 256;

/// In-process session registry and topic pub/sub bus.
///
/// Cloning shares the same underlying maps — all clones observe the same
/// sessions and topics.
#[derive(Clone)]
pub struct SessionBus {
    sessions: Arc<DashMap<String, SessionState>>,
    topics: Arc<DashMap<String, broadcast::Sender<String>>>,
    ttl: Duration,
}

impl SessionBus {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            topics: Arc::new(DashMap::new()),
            ttl,
        }
    }

    /// Registers a new session for `owner_id` and returns its id.
    pub fn create_session(&self, owner_id: &str) -> String {
        let session_id = uuid::Uuid::new_v4().to_string();
        self.sessions.insert(
            session_id.clone(),
            SessionState {
                session_id: session_id.clone(),
                owner_id: owner_id.to_string(),
                current_conversation_id: None,
                in_flight_stream_handle: None,
                last_activity_at: Utc::now(),
            },
        );
        session_id
    }

    pub fn get_session(&self, session_id: &str) -> Option<SessionState> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    /// Refreshes `last_activity_at`, extending the session's TTL. A no-op if
    /// the session has already expired and been swept.
    pub fn touch_session(&self, session_id: &str) {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.last_activity_at = Utc::now();
        }
    }

    /// Records that `session_id` now owns an in-flight stream, so a later
    /// `stop` signal can be routed to it. Overwrites any prior handle
    /// (last-writer-wins, per §5's concurrency model — only the stream
    /// handle field itself needs CAS-like replace semantics, which a single
    /// `DashMap` entry write already provides since there is one writer per
    /// session at a time in this single-process bus).
    pub fn attach_stream(&self, session_id: &str, handle: &str) {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.in_flight_stream_handle = Some(handle.to_string());
            session.last_activity_at = Utc::now();
        }
    }

    pub fn detach_stream(&self, session_id: &str) {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.in_flight_stream_handle = None;
        }
    }

    pub fn set_conversation(&self, session_id: &str, conversation_id: &str) {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.current_conversation_id = Some(conversation_id.to_string());
        }
    }

    /// Publishes `payload` to `topic`. If no subscriber is currently
    /// listening the message is silently dropped — delivery is at-most-once
    /// within process lifetime, per §4.11.
    pub fn publish(&self, topic: &str, payload: impl Into<String>) {
        if let Some(sender) = self.topics.get(topic) {
            let _ = sender.send(payload.into());
        }
    }

    /// Subscribes to `topic`, creating its channel lazily if this is the
    /// first subscriber.
    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<String> {
        let entry = self
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CHANNEL_CAPACITY).0);
        entry.subscribe()
    }

    /// Removes every session whose `last_activity_at` is older than the
    /// configured TTL. Intended to be driven by a periodic background tick.
    pub fn cleanup_expired(&self) -> usize {
        let cutoff = Utc::now() - chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::hours(1));
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.last_activity_at < cutoff)
            .map(|entry| entry.session_id.clone())
            .collect();
        for id in &expired {
            self.sessions.remove(id);
        }
        expired.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

/// Builds the well-known topic name for a chat session's token stream.
pub fn chat_stream_topic(session_id: &str) -> String {
    format!("chat/{session_id}/stream")
}

/// Builds the well-known topic name for a document's ingestion progress.
pub fn document_progress_topic(document_id: &str) -> String {
    format!("document_progress/{document_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_get_session_round_trips() {
        let bus = SessionBus::new(Duration::from_secs(3600));
        let id = bus.create_session("owner-1");
        let session = bus.get_session(&id).unwrap();
        assert_eq!(session.owner_id, "owner-1");
        assert!(session.in_flight_stream_handle.is_none());
    }

    #[test]
    fn attach_and_detach_stream_handle() {
        let bus = SessionBus::new(Duration::from_secs(3600));
        let id = bus.create_session("owner-1");
        bus.attach_stream(&id, "stream-abc");
        assert_eq!(bus.get_session(&id).unwrap().in_flight_stream_handle, Some("stream-abc".to_string()));
        bus.detach_stream(&id);
        assert!(bus.get_session(&id).unwrap().in_flight_stream_handle.is_none());
    }

    #[tokio::test]
    async fn publish_without_subscriber_does_not_panic() {
        let bus = SessionBus::new(Duration::from_secs(3600));
        bus.publish("chat/none/stream", "hello");
    }

    #[tokio::test]
    async fn subscriber_receives_published_message() {
        let bus = SessionBus::new(Duration::from_secs(3600));
        let topic = chat_stream_topic("s1");
        let mut rx = bus.subscribe(&topic);
        bus.publish(&topic, "token-one");
        let received = rx.recv().await.unwrap();
        assert_eq!(received, "token-one");
    }

    #[tokio::test]
    async fn multiple_subscribers_all_receive() {
        let bus = SessionBus::new(Duration::from_secs(3600));
        let topic = document_progress_topic("doc-1");
        let mut rx1 = bus.subscribe(&topic);
        let mut rx2 = bus.subscribe(&topic);
        bus.publish(&topic, "50%");
        assert_eq!(rx1.recv().await.unwrap(), "50%");
        assert_eq!(rx2.recv().await.unwrap(), "50%");
    }

    #[test]
    fn cleanup_expired_removes_stale_sessions_only() {
        let bus = SessionBus::new(Duration::from_secs(0));
        let id = bus.create_session("owner-1");
        std::thread::sleep(std::time::Duration::from_millis(5));
        let removed = bus.cleanup_expired();
        assert_eq!(removed, 1);
        assert!(bus.get_session(&id).is_none());
    }

    #[test]
    fn touch_session_refreshes_activity_and_survives_cleanup() {
        let bus = SessionBus::new(Duration::from_millis(50));
        let id = bus.create_session("owner-1");
        bus.touch_session(&id);
        let removed = bus.cleanup_expired();
        assert_eq!(removed, 0);
        assert!(bus.get_session(&id).is_some());
    }
}
