//! Fan-out of session activity to whoever is watching.
//!
//! Two flavours of event share one bus. Durable events (status changes,
//! stage transitions, completed interactions) are appended to a per-session
//! log so a late subscriber can ask for "everything after id N". Transient
//! events (streaming LLM chunks, progress pings) are broadcast-only and lost
//! to anyone not already subscribed, matching the cost/benefit of buffering
//! them forever.
//!
//! Grounded on the teacher's `queue.rs` `broadcast::Sender<OutputEvent>`
//! fan-out and its gateway's per-subscriber forwarding task.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::clock::now_us;
use crate::types::SessionId;

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    SessionStatusChanged { status: String },
    StageStatusChanged { stage_index: u32, status: String },
    LlmChunk {
        stage_execution_id: String,
        llm_interaction_id: String,
        stream_type: String,
        text: String,
        is_complete: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        mcp_event_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        parallel_metadata: Option<serde_json::Value>,
    },
    McpCallStarted { server: String, tool: String },
    McpCallFinished { server: String, tool: String, ok: bool },
    /// Generic pre-call event fired by `HookContext::enter` for any
    /// `(service_type, method_name)` pair — `mcp.list_tools`, `mcp.call_tool`,
    /// `llm.generate`, etc. Not to be confused with the MCP-specific
    /// `McpCallStarted`/`McpCallFinished` pair above, which callers publish
    /// themselves for listeners that only care about tool calls.
    ServiceCallStarted { service_type: String, method_name: String, request_id: String },
    ServiceCallFinished {
        service_type: String,
        method_name: String,
        request_id: String,
        ok: bool,
        duration_ms: i64,
    },
    CancellationRequested,
}

impl EventPayload {
    /// Durable events are the ones worth replaying to a subscriber that
    /// reconnects after the fact; streaming chunks and cancellation pings
    /// are not.
    fn is_durable(&self) -> bool {
        !matches!(self, EventPayload::LlmChunk { .. } | EventPayload::CancellationRequested)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    pub id: u64,
    pub session_id: SessionId,
    pub at_us: i64,
    pub payload: EventPayload,
}

struct SessionChannel {
    sender: broadcast::Sender<Event>,
    durable_log: tokio::sync::RwLock<Vec<Event>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl SessionChannel {
    fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            durable_log: tokio::sync::RwLock::new(Vec::new()),
            next_id: std::sync::atomic::AtomicU64::new(1),
        }
    }
}

/// Central publish/subscribe point for session activity.
///
/// Three logical channels, all implemented on this one struct: `sessions`
/// (the `sessions_sender` broadcast, session-lifecycle summaries across all
/// sessions), `session:{id}` (per-session durable+transient stream), and
/// `cancellations` (cooperative-cancellation requests, transient).
pub struct EventBus {
    sessions: DashMap<SessionId, SessionChannel>,
    sessions_sender: broadcast::Sender<Event>,
    cancellations_sender: broadcast::Sender<SessionId>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sessions_sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (cancellations_sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sessions: DashMap::new(),
            sessions_sender,
            cancellations_sender,
        }
    }

    fn channel_for(&self, session_id: &SessionId) -> dashmap::mapref::one::Ref<'_, SessionId, SessionChannel> {
        self.sessions
            .entry(session_id.clone())
            .or_insert_with(SessionChannel::new);
        self.sessions.get(session_id).expect("just inserted")
    }

    /// Publish an event. Durable payloads are appended to the per-session
    /// log before being broadcast; transient ones are broadcast only.
    pub async fn publish(&self, session_id: &SessionId, payload: EventPayload) {
        let channel = self.channel_for(session_id);
        let id = channel
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let event = Event {
            id,
            session_id: session_id.clone(),
            at_us: now_us(),
            payload,
        };
        if event.payload.is_durable() {
            channel.durable_log.write().await.push(event.clone());
        }
        let _ = channel.sender.send(event.clone());
        let _ = self.sessions_sender.send(event);
    }

    pub fn subscribe_session(&self, session_id: &SessionId) -> broadcast::Receiver<Event> {
        self.channel_for(session_id).sender.subscribe()
    }

    pub fn subscribe_sessions(&self) -> broadcast::Receiver<Event> {
        self.sessions_sender.subscribe()
    }

    pub async fn events_after(&self, session_id: &SessionId, after_id: u64) -> Vec<Event> {
        match self.sessions.get(session_id) {
            Some(channel) => channel
                .durable_log
                .read()
                .await
                .iter()
                .filter(|e| e.id > after_id)
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    /// Broadcast a cancellation request on the `cancellations` channel. The
    /// session manager also flips the session's own `CancellationToken`;
    /// this channel exists for external observers (e.g. a dashboard) that
    /// want to know a cancel was requested without polling session status.
    pub async fn request_cancellation(&self, session_id: &SessionId) {
        self.publish(session_id, EventPayload::CancellationRequested)
            .await;
        let _ = self.cancellations_sender.send(session_id.clone());
    }

    pub fn subscribe_cancellations(&self) -> broadcast::Receiver<SessionId> {
        self.cancellations_sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn durable_events_are_replayable_after_the_fact() {
        let bus = EventBus::new();
        let session_id = SessionId::new("s1");
        bus.publish(
            &session_id,
            EventPayload::SessionStatusChanged {
                status: "IN_PROGRESS".into(),
            },
        )
        .await;
        bus.publish(
            &session_id,
            EventPayload::StageStatusChanged {
                stage_index: 0,
                status: "ACTIVE".into(),
            },
        )
        .await;

        let all = bus.events_after(&session_id, 0).await;
        assert_eq!(all.len(), 2);
        let tail = bus.events_after(&session_id, all[0].id).await;
        assert_eq!(tail.len(), 1);
    }

    #[tokio::test]
    async fn transient_events_are_not_kept_in_the_durable_log() {
        let bus = EventBus::new();
        let session_id = SessionId::new("s2");
        bus.publish(
            &session_id,
            EventPayload::LlmChunk {
                stage_execution_id: "se1".into(),
                llm_interaction_id: "li1".into(),
                stream_type: "THOUGHT".into(),
                text: "hi".into(),
                is_complete: false,
                mcp_event_id: None,
                parallel_metadata: None,
            },
        )
        .await;
        assert!(bus.events_after(&session_id, 0).await.is_empty());
    }

    #[tokio::test]
    async fn cancellation_request_reaches_subscribers() {
        let bus = EventBus::new();
        let session_id = SessionId::new("s3");
        let mut rx = bus.subscribe_cancellations();
        bus.request_cancellation(&session_id).await;
        let received = rx.recv().await.unwrap();
        assert_eq!(received, session_id);
    }
}
