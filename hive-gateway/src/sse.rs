//! Server-Sent Events stream of hive notifications.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use hive::events::{Event as HiveEvent, Notification};
use tokio::sync::broadcast;
use tracing::warn;

use crate::state::AppState;

/// SSE event name for a notification, matching its `type` tag.
fn event_name(notification: &Notification) -> &'static str {
    match notification {
        Notification::StateChanged { .. } => "stateChanged",
        Notification::Bubbled { .. } => "bubbled",
        Notification::Spawned { .. } => "spawned",
        Notification::Retired { .. } => "retired",
    }
}

fn to_sse(event: &HiveEvent) -> Option<Event> {
    let json = serde_json::to_string(event).ok()?;
    Some(
        Event::default()
            .event(event_name(&event.notification))
            .id(event.seq.to_string())
            .data(json),
    )
}

/// SSE endpoint handler.
///
/// A lagging client is told how many events it missed; it can fetch them
/// from `/api/history`.
pub async fn events_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.orchestrator.subscribe();

    let stream = async_stream::stream! {
        yield Ok(Event::default().event("connected").data("{}"));

        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Some(sse) = to_sse(&event) {
                        yield Ok(sse);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "SSE client lagged, some events dropped");
                    yield Ok(Event::default().event("lagged").data(format!("{{\"skipped\":{n}}}")));
                }
                Err(broadcast::error::RecvError::Closed) => {
                    break;
                }
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use hive::core::types::{AgentId, AgentState};

    use super::*;

    #[test]
    fn event_names_follow_notification_type() {
        let notification = Notification::StateChanged {
            agent_id: AgentId::new(),
            agent_name: "ada".into(),
            old_state: AgentState::Idle,
            new_state: AgentState::Working,
            timestamp: Utc::now(),
            reason: None,
        };
        let json = serde_json::to_value(&notification).expect("serialize");
        assert_eq!(json["type"], event_name(&notification));
        assert!(to_sse(&HiveEvent { seq: 3, notification }).is_some());
    }
}
