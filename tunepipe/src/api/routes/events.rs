//! Server-sent status events: `searching`, `found`, then `ready` with a
//! playable locator, or a single `error`.

use std::convert::Infallible;

use axum::{
    Router,
    extract::{Query, State},
    response::{
        IntoResponse,
        sse::{Event, KeepAlive, Sse},
    },
    routing::get,
};
use futures::stream::{self, Stream};
use tokio::sync::mpsc;
use tracing::debug;

use crate::api::error::{ApiError, ApiResult};
use crate::api::routes::media::parse_request;
use crate::api::server::AppState;
use crate::events::{StatusFeed, StreamStatusEvent};
use crate::pipeline::PipelineRequest;
use crate::resolver::Candidate;

const FEED_CAPACITY: usize = 8;

/// Create the events router.
pub fn router() -> Router<AppState> {
    Router::new().route("/events", get(events))
}

/// Validation problems are answered with a plain 400; once the event stream
/// is open every outcome is reported as an event.
async fn events(
    State(state): State<AppState>,
    Query(params): Query<crate::pipeline::RequestParams>,
) -> ApiResult<impl IntoResponse> {
    let request = parse_request(&state, &params)?;
    let (feed, rx) = StatusFeed::channel(FEED_CAPACITY);
    tokio::spawn(run_status_flow(state, request, feed));
    Ok(Sse::new(event_stream(rx)).keep_alive(KeepAlive::default()))
}

fn event_stream(
    rx: mpsc::Receiver<StreamStatusEvent>,
) -> impl Stream<Item = Result<Event, Infallible>> + Send + 'static {
    stream::unfold(rx, |mut rx| async move {
        let event = rx.recv().await?;
        Some((Ok(to_sse(&event)), rx))
    })
}

fn to_sse(event: &StreamStatusEvent) -> Event {
    Event::default()
        .event(event.name())
        .json_data(event)
        .unwrap_or_else(|e| Event::default().event("error").data(e.to_string()))
}

async fn run_status_flow(state: AppState, request: PipelineRequest, mut feed: StatusFeed) {
    let searching = StreamStatusEvent::Searching {
        query: request.source_locator().to_string(),
    };
    if feed.emit(searching).await.is_err() {
        return;
    }

    let resolved = tokio::select! {
        biased;
        _ = feed.closed() => {
            debug!("Status client disconnected during resolution");
            return;
        }
        resolved = resolve(&state, &request) => resolved,
    };

    let result = match resolved {
        Ok((candidate, locator)) => {
            let stream_path = stream_path(&candidate, &request);
            match feed.emit(StreamStatusEvent::found(&candidate)).await {
                Ok(()) => {
                    feed.emit(StreamStatusEvent::ReadyToStream {
                        locator,
                        stream_path,
                    })
                    .await
                }
                Err(e) => Err(e),
            }
        }
        Err(e) => {
            feed.emit(StreamStatusEvent::Error {
                message: ApiError::from(e).message,
            })
            .await
        }
    };
    if let Err(e) = result {
        debug!(error = ?e, "Status event not delivered");
    }
}

/// First candidate with a direct media URL, with metadata filled in.
async fn resolve(state: &AppState, request: &PipelineRequest) -> crate::Result<(Candidate, String)> {
    let (candidate, locator) = state.resolver.direct_url(request).await?;
    let candidate = state.resolver.describe(candidate).await;
    Ok((candidate, locator))
}

/// Path on this server that streams `candidate` with the request's options.
fn stream_path(candidate: &Candidate, request: &PipelineRequest) -> String {
    let mut query = url::form_urlencoded::Serializer::new(String::new());
    query
        .append_pair("mode", "song")
        .append_pair("query", candidate.locator());
    if let Some(format) = request.transcode_format() {
        query.append_pair("format", format.as_str());
    }
    if let Some(seek) = request.seek_offset_seconds() {
        query.append_pair("seek", &seek.to_string());
    }
    format!("/api/stream?{}", query.finish())
}
