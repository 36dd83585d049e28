//! Generic pre/post/error instrumentation wrapper around any
//! `(service_type, method_name)` call.
//!
//! Grounded on the original source's `HookContext` async context manager
//! (`base_hooks.py`): entering fires a `{service_type}.pre` event, a normal
//! exit fires `{service_type}.post`, an exception fires `{service_type}.error`.
//! Rust has no `__aexit__`, so this is reshaped into an RAII guard: callers
//! must call [`HookContext::complete_success`] or [`HookContext::complete_error`]
//! before it drops. If neither is called, `Drop` fires the error event with
//! `ErrorKind::Internal`, since an unconsumed guard means the call path bailed
//! out through a `?` the author forgot to route through this guard.

use std::sync::Arc;

use tracing::error;

use crate::clock::{new_id, now_us};
use crate::error::Error;
use crate::event_bus::{EventBus, EventPayload};
use crate::types::SessionId;

pub struct HookContext {
    event_bus: Arc<EventBus>,
    session_id: SessionId,
    service_type: &'static str,
    method_name: &'static str,
    request_id: String,
    started_at_us: i64,
    consumed: bool,
}

impl HookContext {
    /// Fires the `pre` event immediately and returns a guard the caller must
    /// resolve with [`complete_success`](Self::complete_success) or
    /// [`complete_error`](Self::complete_error).
    pub async fn enter(
        event_bus: &Arc<EventBus>,
        session_id: SessionId,
        service_type: &'static str,
        method_name: &'static str,
    ) -> Self {
        let request_id = new_id();
        event_bus
            .publish(
                &session_id,
                EventPayload::ServiceCallStarted {
                    service_type: service_type.to_string(),
                    method_name: method_name.to_string(),
                    request_id: request_id.clone(),
                },
            )
            .await;
        Self {
            event_bus: event_bus.clone(),
            session_id,
            service_type,
            method_name,
            request_id,
            started_at_us: now_us(),
            consumed: false,
        }
    }

    /// The id generated in `enter()`, stable for the lifetime of this guard.
    /// Callers persisting an interaction row alongside the hooked call can
    /// correlate it with the `pre`/`post` events this guard fires.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub async fn complete_success(mut self) {
        self.consumed = true;
        self.publish_finished(true).await;
    }

    pub async fn complete_error(mut self, err: &Error) {
        self.consumed = true;
        error!(
            service_type = self.service_type,
            method = self.method_name,
            kind = %err.kind,
            message = %err.message,
            "hook error"
        );
        self.publish_finished(false).await;
    }

    async fn publish_finished(&self, ok: bool) {
        self.event_bus
            .publish(
                &self.session_id,
                EventPayload::ServiceCallFinished {
                    service_type: self.service_type.to_string(),
                    method_name: self.method_name.to_string(),
                    request_id: self.request_id.clone(),
                    ok,
                    duration_ms: (now_us() - self.started_at_us) / 1000,
                },
            )
            .await;
    }
}

impl Drop for HookContext {
    fn drop(&mut self) {
        if !self.consumed {
            error!(
                service_type = self.service_type,
                method = self.method_name,
                request_id = %self.request_id,
                "hook context dropped without completion, recording as internal error"
            );
            let event_bus = self.event_bus.clone();
            let session_id = self.session_id.clone();
            let service_type = self.service_type.to_string();
            let method_name = self.method_name.to_string();
            let request_id = self.request_id.clone();
            let duration_ms = (now_us() - self.started_at_us) / 1000;
            tokio::spawn(async move {
                event_bus
                    .publish(
                        &session_id,
                        EventPayload::ServiceCallFinished {
                            service_type,
                            method_name,
                            request_id,
                            ok: false,
                            duration_ms,
                        },
                    )
                    .await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enter_fires_a_pre_event_with_a_fresh_request_id() {
        let bus = Arc::new(EventBus::new());
        let session_id = SessionId::new("s1");
        let mut rx = bus.subscribe_session(&session_id);
        let ctx = HookContext::enter(&bus, session_id.clone(), "mcp", "call_tool").await;
        let event = rx.recv().await.unwrap();
        match event.payload {
            EventPayload::ServiceCallStarted { service_type, method_name, request_id } => {
                assert_eq!(service_type, "mcp");
                assert_eq!(method_name, "call_tool");
                assert_eq!(request_id, ctx.request_id());
            }
            other => panic!("expected ServiceCallStarted, got {other:?}"),
        }
        ctx.complete_success().await;
    }

    #[tokio::test]
    async fn complete_success_fires_a_post_event_tagged_ok() {
        let bus = Arc::new(EventBus::new());
        let session_id = SessionId::new("s1");
        let mut rx = bus.subscribe_session(&session_id);
        let ctx = HookContext::enter(&bus, session_id.clone(), "llm", "generate").await;
        rx.recv().await.unwrap(); // pre
        ctx.complete_success().await;
        let event = rx.recv().await.unwrap();
        match event.payload {
            EventPayload::ServiceCallFinished { service_type, ok, .. } => {
                assert_eq!(service_type, "llm");
                assert!(ok);
            }
            other => panic!("expected ServiceCallFinished, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn complete_error_fires_a_post_event_tagged_not_ok_for_its_own_service_type() {
        let bus = Arc::new(EventBus::new());
        let session_id = SessionId::new("s1");
        let mut rx = bus.subscribe_session(&session_id);
        let ctx = HookContext::enter(&bus, session_id.clone(), "llm", "generate").await;
        rx.recv().await.unwrap(); // pre
        ctx.complete_error(&Error::tool_failure("boom")).await;
        let event = rx.recv().await.unwrap();
        match event.payload {
            EventPayload::ServiceCallFinished { service_type, method_name, ok, .. } => {
                assert_eq!(service_type, "llm");
                assert_eq!(method_name, "generate");
                assert!(!ok);
            }
            other => panic!("expected ServiceCallFinished, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropping_an_unconsumed_guard_still_records_a_finished_event() {
        let bus = Arc::new(EventBus::new());
        let session_id = SessionId::new("s1");
        let mut rx = bus.subscribe_session(&session_id);
        {
            let _ctx = HookContext::enter(&bus, session_id.clone(), "mcp", "list_tools").await;
            rx.recv().await.unwrap(); // pre
            // dropped without complete_success/complete_error
        }
        let event = rx.recv().await.unwrap();
        match event.payload {
            EventPayload::ServiceCallFinished { ok, .. } => assert!(!ok),
            other => panic!("expected ServiceCallFinished, got {other:?}"),
        }
    }
}
