//! Audio routes: streaming, buffered download, redirect and track listing.

use axum::{
    Json, Router,
    body::Body,
    extract::{Query, State},
    http::header,
    response::{IntoResponse, Redirect, Response},
    routing::get,
};
use serde::Serialize;
use tracing::info;

use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::pipeline::{PipelineRequest, RequestParams};
use crate::resolver::Candidate;
use crate::resolver::transcoder::file_extension;

/// Create the media router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/stream", get(stream))
        .route("/download", get(download))
        .route("/redirect", get(redirect))
        .route("/tracks", get(tracks))
}

#[derive(Debug, Serialize)]
pub struct TracksResponse {
    pub tracks: Vec<Candidate>,
}

pub(crate) fn parse_request(state: &AppState, params: &RequestParams) -> ApiResult<PipelineRequest> {
    Ok(PipelineRequest::from_params(
        params,
        state.config.default_transcode_format,
    )?)
}

/// Stream audio as it is produced. The status line is only sent once the
/// pipeline has produced its first byte.
async fn stream(
    State(state): State<AppState>,
    Query(params): Query<RequestParams>,
) -> ApiResult<Response> {
    let request = parse_request(&state, &params)?;
    let (candidate, active) = state.resolver.stream(&request).await?;
    let content_type = active.content_type();
    // The driver tears the pipeline down once the body is dropped.
    let (body, _handle) = active.into_parts();

    Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CACHE_CONTROL, "no-store")
        .header(
            header::CONTENT_DISPOSITION,
            content_disposition("inline", &candidate.title, file_extension(content_type)),
        )
        .body(Body::from_stream(body))
        .map_err(|e| ApiError::internal(format!("Failed to build response: {}", e)))
}

/// Run the pipeline to a temp file and send it whole.
async fn download(
    State(state): State<AppState>,
    Query(params): Query<RequestParams>,
) -> ApiResult<Response> {
    let request = parse_request(&state, &params)?;
    let (candidate, download) = state.resolver.download(&request, &state.temp).await?;
    let extension = download
        .file
        .path()
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("bin")
        .to_string();
    let content_type = download.content_type;
    let data = download
        .file
        .read_and_remove()
        .await
        .map_err(crate::Error::from)?;

    info!(candidate = %candidate.id, bytes = data.len(), "Download complete");

    Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, data.len())
        .header(
            header::CONTENT_DISPOSITION,
            content_disposition("attachment", &candidate.title, &extension),
        )
        .body(Body::from(data))
        .map_err(|e| ApiError::internal(format!("Failed to build response: {}", e)))
}

/// Redirect to a direct media URL for the first playable candidate.
async fn redirect(
    State(state): State<AppState>,
    Query(params): Query<RequestParams>,
) -> ApiResult<Redirect> {
    let request = parse_request(&state, &params)?;
    let (_, url) = state.resolver.direct_url(&request).await?;
    Ok(Redirect::temporary(&url))
}

/// List candidates without running any pipeline.
async fn tracks(
    State(state): State<AppState>,
    Query(params): Query<RequestParams>,
) -> ApiResult<impl IntoResponse> {
    let request = parse_request(&state, &params)?;
    let mut tracks = state.resolver.candidates(&request).await?;
    if tracks.len() == 1 {
        let only = tracks.remove(0);
        tracks.push(state.resolver.describe(only).await);
    }
    Ok(Json(TracksResponse { tracks }))
}

/// `Content-Disposition` value with an ASCII-safe file name.
fn content_disposition(kind: &str, title: &str, extension: &str) -> String {
    let stem: String = title
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .take(100)
        .collect();
    let stem = stem.trim_matches(|c: char| c == ' ' || c == '.');
    let stem = if stem.is_empty() { "audio" } else { stem };
    format!("{}; filename=\"{}.{}\"", kind, stem, extension)
}


#[cfg(all(test, unix))]
mod route_tests {
    use axum::http::{StatusCode, header};

    use crate::api::routes::test_support::*;
    use crate::resolver::search::MockSearchProvider;

    fn search_returning(ids: &'static [&'static str]) -> MockSearchProvider {
        let mut search = MockSearchProvider::new();
        search
            .expect_search()
            .returning(move |_, _| Ok(ids.iter().map(|id| candidate(id)).collect()));
        search
    }

    #[tokio::test]
    async fn test_missing_query_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let response = get(router(&dir, MockSearchProvider::new()), "/api/stream?mode=search").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["code"], "BAD_REQUEST");
        assert!(json["message"].as_str().unwrap().contains("query"));
    }

    #[tokio::test]
    async fn test_stream_passthrough() {
        let dir = tempfile::tempdir().unwrap();
        let response = get(
            router(&dir, search_returning(&["bad", "good"])),
            "/api/stream?mode=search&query=test%20song",
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "audio/webm");
        assert_eq!(
            body_bytes(response).await.as_ref(),
            b"audio:https://www.youtube.com/watch?v=good"
        );
    }

    #[tokio::test]
    async fn test_stream_with_transcode() {
        let dir = tempfile::tempdir().unwrap();
        let response = get(
            router(&dir, search_returning(&["good"])),
            "/api/stream?mode=search&query=test&format=mp3",
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "audio/mpeg");
        assert_eq!(
            body_bytes(response).await.as_ref(),
            b"audio:https://www.youtube.com/watch?v=good"
        );
    }

    #[tokio::test]
    async fn test_all_candidates_fail_is_upstream_error() {
        let dir = tempfile::tempdir().unwrap();
        let response = get(
            router(&dir, search_returning(&["bad1", "bad2"])),
            "/api/stream?mode=search&query=test",
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let json = body_json(response).await;
        assert_eq!(json["code"], "UPSTREAM_FAILED");
        assert!(json["message"].as_str().unwrap().contains("Video unavailable"));
    }

    #[tokio::test]
    async fn test_no_results_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let response = get(
            router(&dir, search_returning(&[])),
            "/api/download?mode=search&query=nothing",
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_download_is_buffered() {
        let dir = tempfile::tempdir().unwrap();
        let response = get(
            router(&dir, search_returning(&["good"])),
            "/api/download?mode=search&query=test&format=flac",
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let expected = b"audio:https://www.youtube.com/watch?v=good";
        assert_eq!(response.headers()[header::CONTENT_TYPE], "audio/flac");
        assert_eq!(
            response.headers()[header::CONTENT_LENGTH],
            expected.len().to_string().as_str()
        );
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"Title good.flac\""
        );
        assert_eq!(body_bytes(response).await.as_ref(), expected);

        // The temp file is gone once the body is built.
        let leftovers = std::fs::read_dir(dir.path().join("tmp")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_redirect() {
        let dir = tempfile::tempdir().unwrap();
        let response = get(
            router(&dir, search_returning(&["good"])),
            "/api/redirect?mode=search&query=test",
        )
        .await;
        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(
            response.headers()[header::LOCATION],
            "https://media.example.com/audio?src=good"
        );
    }

    #[tokio::test]
    async fn test_tracks_listing() {
        let dir = tempfile::tempdir().unwrap();
        let response = get(
            router(&dir, search_returning(&["one", "two"])),
            "/api/tracks?mode=genre&query=jazz",
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        let tracks = json["tracks"].as_array().unwrap();
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0]["title"], "Title one");
        assert_eq!(tracks[1]["url"], "https://www.youtube.com/watch?v=two");
    }

    #[tokio::test]
    async fn test_song_mode_accepts_video_id() {
        let dir = tempfile::tempdir().unwrap();
        let mut search = MockSearchProvider::new();
        search.expect_search().never();
        let response = get(router(&dir, search), "/api/stream?mode=song&query=goodgoodgoo").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_bytes(response).await.as_ref(),
            b"audio:https://www.youtube.com/watch?v=goodgoodgoo"
        );
    }
}
