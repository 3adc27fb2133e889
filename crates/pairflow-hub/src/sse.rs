use crate::broker::{BrokerEvent, EventBroker, EventFilter, EventKind, SnapshotView};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::stream::{self, Stream, StreamExt};
use std::convert::Infallible;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);
const LAST_EVENT_ID_HEADER: &str = "last-event-id";

pub fn router(broker: EventBroker) -> Router {
    Router::new()
        .route("/api/events", get(events_handler))
        .route("/api/snapshot", get(snapshot_handler))
        .route("/health", get(|| async { "ok" }))
        .with_state(broker)
}

/// Query and header parameters of a stream request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamParams {
    pub repos: Vec<PathBuf>,
    pub bubble: Option<String>,
    pub last_event_id: Option<u64>,
}

impl StreamParams {
    /// `repo` may repeat and may hold comma separated paths. A
    /// `Last-Event-ID` header wins over the `lastEventId` query parameter
    /// because browsers send the newer id on reconnect.
    pub fn parse(pairs: &[(String, String)], headers: &HeaderMap) -> Self {
        let mut params = StreamParams::default();
        for (key, value) in pairs {
            match key.as_str() {
                "repo" => params.repos.extend(
                    value
                        .split(',')
                        .map(str::trim)
                        .filter(|part| !part.is_empty())
                        .map(PathBuf::from),
                ),
                "bubble" if !value.trim().is_empty() => {
                    params.bubble = Some(value.trim().to_string());
                }
                "lastEventId" => params.last_event_id = value.trim().parse().ok(),
                _ => {}
            }
        }
        let header_id = headers
            .get(LAST_EVENT_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok());
        if header_id.is_some() {
            params.last_event_id = header_id;
        }
        params
    }

    pub fn filter(&self) -> EventFilter {
        EventFilter::new(&self.repos, self.bubble.clone())
    }
}

async fn events_handler(
    State(broker): State<EventBroker>,
    headers: HeaderMap,
    Query(pairs): Query<Vec<(String, String)>>,
) -> impl IntoResponse {
    let params = StreamParams::parse(&pairs, &headers);
    debug!(
        event = "hub_stream_open",
        repos = params.repos.len(),
        bubble = params.bubble.as_deref().unwrap_or_default(),
        last_event_id = ?params.last_event_id,
    );
    let attachment = broker.attach(params.filter(), params.last_event_id);
    let initial = attachment.snapshot.map(snapshot_frame);
    let live = stream::unfold(attachment.subscription, |mut subscription| async move {
        subscription
            .recv()
            .await
            .map(|event| (event_frame(&event), subscription))
    });
    let frames: std::pin::Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>> =
        Box::pin(stream::iter(initial).chain(live).map(Ok::<Event, Infallible>));
    Sse::new(frames).keep_alive(
        KeepAlive::new()
            .interval(KEEPALIVE_INTERVAL)
            .text("keepalive"),
    )
}

async fn snapshot_handler(
    State(broker): State<EventBroker>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Json<SnapshotView> {
    let params = StreamParams::parse(&pairs, &HeaderMap::new());
    Json(broker.get_snapshot(&params.filter()))
}

fn snapshot_frame(view: SnapshotView) -> Event {
    let frame = Event::default()
        .id(view.last_event_id.to_string())
        .event("snapshot");
    json_frame(frame, &EventKind::Snapshot(view))
}

fn event_frame(event: &BrokerEvent) -> Event {
    json_frame(
        Event::default()
            .id(event.id.to_string())
            .event(event.kind.label()),
        event,
    )
}

fn json_frame<T: serde::Serialize>(frame: Event, payload: &T) -> Event {
    match serde_json::to_string(payload) {
        Ok(data) => frame.data(data),
        Err(err) => {
            warn!(event = "hub_frame_encode_failed", error = %err);
            frame.data("{}")
        }
    }
}
