//! Per-request pipeline input and its validation.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Longest free-text query accepted.
const MAX_QUERY_LEN: usize = 512;

/// Raw query-string parameters as received over HTTP.
///
/// Everything is optional here so that missing or malformed values produce
/// our own validation messages instead of extractor rejections.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequestParams {
    pub mode: Option<String>,
    pub query: Option<String>,
    pub format: Option<String>,
    pub seek: Option<String>,
}

/// How the source locator is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceMode {
    /// Free-text search through the search collaborator.
    Search,
    /// A single media URL handed straight to the extractor.
    DirectUrl,
    /// A playlist URL whose entries become the candidates.
    Playlist,
}

/// Output formats the transcoder can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscodeFormat {
    Mp3,
    Opus,
    Aac,
    Flac,
}

impl TranscodeFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mp3 => "mp3",
            Self::Opus => "opus",
            Self::Aac => "aac",
            Self::Flac => "flac",
        }
    }

    /// Media type of the transcoder's output.
    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Mp3 => "audio/mpeg",
            Self::Opus => "audio/ogg",
            Self::Aac => "audio/aac",
            Self::Flac => "audio/flac",
        }
    }

    /// ffmpeg audio encoder.
    pub fn codec(&self) -> &'static str {
        match self {
            Self::Mp3 => "libmp3lame",
            Self::Opus => "libopus",
            Self::Aac => "aac",
            Self::Flac => "flac",
        }
    }

    /// ffmpeg output muxer.
    pub fn muxer(&self) -> &'static str {
        match self {
            Self::Mp3 => "mp3",
            Self::Opus => "ogg",
            Self::Aac => "adts",
            Self::Flac => "flac",
        }
    }

    /// Whether the encoder takes a bitrate.
    pub fn is_lossy(&self) -> bool {
        !matches!(self, Self::Flac)
    }
}

impl fmt::Display for TranscodeFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TranscodeFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "mp3" => Ok(Self::Mp3),
            "opus" | "ogg" => Ok(Self::Opus),
            "aac" => Ok(Self::Aac),
            "flac" => Ok(Self::Flac),
            other => Err(Error::validation(format!(
                "Unsupported format '{}'; expected one of mp3, opus, aac, flac",
                other
            ))),
        }
    }
}

/// Immutable description of one pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineRequest {
    source_locator: String,
    mode: SourceMode,
    transcode_format: Option<TranscodeFormat>,
    seek_offset_seconds: Option<f64>,
}

impl PipelineRequest {
    /// Create a passthrough request.
    pub fn new(source_locator: impl Into<String>, mode: SourceMode) -> Self {
        Self {
            source_locator: source_locator.into(),
            mode,
            transcode_format: None,
            seek_offset_seconds: None,
        }
    }

    /// Request transcoding to `format`.
    pub fn with_transcode(mut self, format: TranscodeFormat) -> Self {
        self.transcode_format = Some(format);
        self
    }

    /// Start output `secs` into the source. Seeking needs the transcoder.
    pub fn with_seek(mut self, secs: f64, fallback_format: TranscodeFormat) -> Self {
        self.seek_offset_seconds = Some(secs);
        self.transcode_format.get_or_insert(fallback_format);
        self
    }

    /// Validate HTTP parameters.
    ///
    /// `fallback_format` is used when a seek is requested without a format.
    pub fn from_params(params: &RequestParams, fallback_format: TranscodeFormat) -> Result<Self> {
        let query = params
            .query
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .ok_or_else(|| Error::validation("Missing required parameter 'query'"))?;
        if query.chars().count() > MAX_QUERY_LEN {
            return Err(Error::validation(format!(
                "Parameter 'query' exceeds {} characters",
                MAX_QUERY_LEN
            )));
        }

        let mode = params
            .mode
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .ok_or_else(|| Error::validation("Missing required parameter 'mode'"))?;

        let mut request = match mode.to_lowercase().as_str() {
            "search" | "genre" => Self::new(query, SourceMode::Search),
            "song" => Self::new(song_locator(query)?, SourceMode::DirectUrl),
            "playlist" => {
                if !is_http_url(query) {
                    return Err(Error::validation(
                        "Mode 'playlist' requires an http(s) playlist URL",
                    ));
                }
                Self::new(query, SourceMode::Playlist)
            }
            other => {
                return Err(Error::validation(format!(
                    "Unknown mode '{}'; expected one of search, playlist, song, genre",
                    other
                )));
            }
        };

        if let Some(format) = params.format.as_deref().filter(|f| !f.trim().is_empty()) {
            request = request.with_transcode(format.parse()?);
        }

        if let Some(seek) = params.seek.as_deref().filter(|s| !s.trim().is_empty()) {
            let secs: f64 = seek
                .trim()
                .parse()
                .map_err(|_| Error::validation("Parameter 'seek' must be a number of seconds"))?;
            if !secs.is_finite() || secs < 0.0 {
                return Err(Error::validation(
                    "Parameter 'seek' must be a non-negative number of seconds",
                ));
            }
            if secs > 0.0 {
                request = request.with_seek(secs, fallback_format);
            }
        }

        Ok(request)
    }

    pub fn source_locator(&self) -> &str {
        &self.source_locator
    }

    pub fn mode(&self) -> SourceMode {
        self.mode
    }

    pub fn want_transcode(&self) -> bool {
        self.transcode_format.is_some()
    }

    pub fn transcode_format(&self) -> Option<TranscodeFormat> {
        self.transcode_format
    }

    pub fn seek_offset_seconds(&self) -> Option<f64> {
        self.seek_offset_seconds
    }

    /// Copy of this request pointing at a different locator (a resolved candidate).
    pub fn for_locator(&self, locator: impl Into<String>) -> Self {
        Self {
            source_locator: locator.into(),
            mode: SourceMode::DirectUrl,
            ..self.clone()
        }
    }
}

fn is_http_url(raw: &str) -> bool {
    url::Url::parse(raw)
        .map(|u| matches!(u.scheme(), "http" | "https") && u.host_str().is_some())
        .unwrap_or(false)
}

fn is_video_id(raw: &str) -> bool {
    raw.len() == 11
        && raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn song_locator(query: &str) -> Result<String> {
    if is_http_url(query) {
        Ok(query.to_string())
    } else if is_video_id(query) {
        Ok(format!("https://www.youtube.com/watch?v={}", query))
    } else {
        Err(Error::validation(
            "Mode 'song' requires an http(s) media URL or a video id",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn params(mode: Option<&str>, query: Option<&str>) -> RequestParams {
        RequestParams {
            mode: mode.map(str::to_string),
            query: query.map(str::to_string),
            ..Default::default()
        }
    }

    #[rstest]
    #[case("search", "test song", SourceMode::Search, "test song")]
    #[case("genre", "lofi hip hop", SourceMode::Search, "lofi hip hop")]
    #[case("SEARCH", "  padded  ", SourceMode::Search, "padded")]
    #[case(
        "song",
        "https://music.youtube.com/watch?v=abc123def45",
        SourceMode::DirectUrl,
        "https://music.youtube.com/watch?v=abc123def45"
    )]
    #[case(
        "song",
        "dQw4w9WgXcQ",
        SourceMode::DirectUrl,
        "https://www.youtube.com/watch?v=dQw4w9WgXcQ"
    )]
    #[case(
        "playlist",
        "https://www.youtube.com/playlist?list=PL123",
        SourceMode::Playlist,
        "https://www.youtube.com/playlist?list=PL123"
    )]
    fn test_valid_modes(
        #[case] mode: &str,
        #[case] query: &str,
        #[case] expected_mode: SourceMode,
        #[case] expected_locator: &str,
    ) {
        let request =
            PipelineRequest::from_params(&params(Some(mode), Some(query)), TranscodeFormat::Mp3)
                .unwrap();
        assert_eq!(request.mode(), expected_mode);
        assert_eq!(request.source_locator(), expected_locator);
        assert!(!request.want_transcode());
    }

    #[rstest]
    #[case(Some("search"), None, "query")]
    #[case(Some("search"), Some("   "), "query")]
    #[case(None, Some("test"), "mode")]
    #[case(Some("video"), Some("test"), "Unknown mode")]
    #[case(Some("playlist"), Some("not a url"), "playlist")]
    #[case(Some("song"), Some("just some words"), "song")]
    #[case(Some("playlist"), Some("ftp://example.com/list"), "playlist")]
    fn test_invalid_params(
        #[case] mode: Option<&str>,
        #[case] query: Option<&str>,
        #[case] needle: &str,
    ) {
        let err = PipelineRequest::from_params(&params(mode, query), TranscodeFormat::Mp3)
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(err.to_string().contains(needle), "unexpected message: {err}");
    }

    #[test]
    fn test_overlong_query_rejected() {
        let long = "a".repeat(MAX_QUERY_LEN + 1);
        let err = PipelineRequest::from_params(&params(Some("search"), Some(&long)), TranscodeFormat::Mp3)
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_format_and_seek() {
        let mut p = params(Some("search"), Some("test song"));
        p.format = Some("opus".to_string());
        let request = PipelineRequest::from_params(&p, TranscodeFormat::Mp3).unwrap();
        assert_eq!(request.transcode_format(), Some(TranscodeFormat::Opus));

        let mut p = params(Some("search"), Some("test song"));
        p.seek = Some("42.5".to_string());
        let request = PipelineRequest::from_params(&p, TranscodeFormat::Mp3).unwrap();
        assert_eq!(request.seek_offset_seconds(), Some(42.5));
        assert_eq!(request.transcode_format(), Some(TranscodeFormat::Mp3));

        let mut p = params(Some("search"), Some("test song"));
        p.seek = Some("0".to_string());
        let request = PipelineRequest::from_params(&p, TranscodeFormat::Mp3).unwrap();
        assert!(request.seek_offset_seconds().is_none());
        assert!(!request.want_transcode());
    }

    #[rstest]
    #[case("-3")]
    #[case("NaN")]
    #[case("inf")]
    #[case("soon")]
    fn test_invalid_seek(#[case] seek: &str) {
        let mut p = params(Some("search"), Some("test song"));
        p.seek = Some(seek.to_string());
        assert!(matches!(
            PipelineRequest::from_params(&p, TranscodeFormat::Mp3),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_unknown_format_rejected() {
        let mut p = params(Some("search"), Some("test song"));
        p.format = Some("wav".to_string());
        assert!(matches!(
            PipelineRequest::from_params(&p, TranscodeFormat::Mp3),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_for_locator_keeps_transcode_settings() {
        let request = PipelineRequest::new("test song", SourceMode::Search)
            .with_transcode(TranscodeFormat::Aac);
        let resolved = request.for_locator("https://www.youtube.com/watch?v=abc123");
        assert_eq!(resolved.mode(), SourceMode::DirectUrl);
        assert_eq!(resolved.transcode_format(), Some(TranscodeFormat::Aac));
    }
}
