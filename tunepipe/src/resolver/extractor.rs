//! yt-dlp invocation: option set, argument translation and record parsing.

use std::path::PathBuf;

use serde::Deserialize;

use super::search::Candidate;

/// Structured extractor options. Translated into arguments in one place by
/// [`build_extractor_args`] so callers never assemble flags by hand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractorOptions {
    /// Netscape cookie file passed with `--cookies`.
    pub credential_file: Option<PathBuf>,
    /// Format selectors tried in order. The first one's `ext=` filter also
    /// decides the passthrough media type, see
    /// [`passthrough_content_type`](super::transcoder::passthrough_content_type).
    pub format_preference: Vec<String>,
    /// Extra arguments appended before the locator.
    pub extra_args: Vec<String>,
}

impl Default for ExtractorOptions {
    fn default() -> Self {
        Self {
            credential_file: None,
            format_preference: vec!["bestaudio[ext=webm]".to_string(), "bestaudio".to_string()],
            extra_args: Vec::new(),
        }
    }
}

impl ExtractorOptions {
    /// yt-dlp format expression; `/` separates fallbacks.
    pub fn format_selector(&self) -> String {
        if self.format_preference.is_empty() {
            "bestaudio".to_string()
        } else {
            self.format_preference.join("/")
        }
    }
}

/// What the extractor is asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractorAction {
    /// Write the selected audio stream to stdout.
    Stream,
    /// Print the direct media URL of the selected format.
    ResolveUrl,
    /// Print one JSON metadata record.
    Metadata,
    /// Print flat JSON records for the first `limit` search results.
    Search { limit: usize },
    /// Print flat JSON records for the first `limit` playlist entries.
    ListPlaylist { limit: usize },
}

/// Build the extractor's argument list for `action` on `locator`.
///
/// The locator is always last and preceded by `--`, so user text beginning
/// with `-` is never taken for an option.
pub fn build_extractor_args(
    options: &ExtractorOptions,
    action: &ExtractorAction,
    locator: &str,
) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();

    match action {
        ExtractorAction::Stream => {
            args.extend([
                "-f".to_string(),
                options.format_selector(),
                "--no-playlist".to_string(),
                "--no-part".to_string(),
                "-o".to_string(),
                "-".to_string(),
            ]);
        }
        ExtractorAction::ResolveUrl => {
            args.extend([
                "-f".to_string(),
                options.format_selector(),
                "--no-playlist".to_string(),
                "--get-url".to_string(),
            ]);
        }
        ExtractorAction::Metadata => {
            args.extend([
                "-f".to_string(),
                options.format_selector(),
                "--no-playlist".to_string(),
                "--dump-json".to_string(),
            ]);
        }
        ExtractorAction::Search { .. } => {
            args.extend(["--flat-playlist".to_string(), "--dump-json".to_string()]);
        }
        ExtractorAction::ListPlaylist { limit } => {
            args.extend([
                "--flat-playlist".to_string(),
                "--dump-json".to_string(),
                "--playlist-end".to_string(),
                limit.to_string(),
            ]);
        }
    }

    args.extend(["--no-progress".to_string(), "--no-warnings".to_string()]);

    if let Some(cookies) = &options.credential_file {
        args.push("--cookies".to_string());
        args.push(cookies.to_string_lossy().to_string());
    }

    args.extend(options.extra_args.iter().cloned());

    args.push("--".to_string());
    match action {
        ExtractorAction::Search { limit } => {
            args.push(format!("ytsearch{}:{}", (*limit).max(1), locator));
        }
        _ => args.push(locator.to_string()),
    }

    args
}

/// Subset of a yt-dlp JSON record we care about. Flat records carry fewer
/// fields than full ones, so everything is optional.
#[derive(Debug, Deserialize)]
struct ExtractorRecord {
    id: Option<String>,
    title: Option<String>,
    artist: Option<String>,
    channel: Option<String>,
    uploader: Option<String>,
    duration: Option<f64>,
    thumbnail: Option<String>,
    #[serde(default)]
    thumbnails: Vec<Thumbnail>,
    webpage_url: Option<String>,
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Thumbnail {
    url: Option<String>,
}

impl ExtractorRecord {
    fn into_candidate(self) -> Option<Candidate> {
        let page = self
            .webpage_url
            .clone()
            .or_else(|| self.url.clone().filter(|u| u.starts_with("http")))
            .or_else(|| {
                self.id
                    .as_ref()
                    .map(|id| format!("https://www.youtube.com/watch?v={}", id))
            })?;
        let thumbnail_url = self
            .thumbnail
            .or_else(|| self.thumbnails.into_iter().rev().find_map(|t| t.url));
        Some(Candidate {
            id: self.id.unwrap_or_else(|| page.clone()),
            title: self.title.unwrap_or_else(|| "Unknown title".to_string()),
            artist: self.artist.or(self.channel).or(self.uploader),
            duration_seconds: self.duration,
            thumbnail_url,
            url: page,
        })
    }
}

/// Parse newline-delimited JSON records into candidates, skipping lines
/// that are not records.
pub fn parse_records(stdout: &[u8]) -> Vec<Candidate> {
    String::from_utf8_lossy(stdout)
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .filter_map(|line| match serde_json::from_str::<ExtractorRecord>(line) {
            Ok(record) => record.into_candidate(),
            Err(e) => {
                tracing::debug!(error = %e, "Skipping unparsable extractor record");
                None
            }
        })
        .collect()
}

/// First `http(s)` line of `--get-url` output.
pub fn parse_resolved_url(stdout: &[u8]) -> Option<String> {
    String::from_utf8_lossy(stdout)
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with("http://") || line.starts_with("https://"))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> ExtractorOptions {
        ExtractorOptions::default()
    }

    #[test]
    fn test_stream_args() {
        let args = build_extractor_args(
            &opts(),
            &ExtractorAction::Stream,
            "https://www.youtube.com/watch?v=abc123",
        );
        assert_eq!(
            args,
            vec![
                "-f",
                "bestaudio[ext=webm]/bestaudio",
                "--no-playlist",
                "--no-part",
                "-o",
                "-",
                "--no-progress",
                "--no-warnings",
                "--",
                "https://www.youtube.com/watch?v=abc123",
            ]
        );
    }

    #[test]
    fn test_credentials_and_extra_args_precede_locator() {
        let options = ExtractorOptions {
            credential_file: Some(PathBuf::from("/secrets/cookies.txt")),
            extra_args: vec!["--force-ipv4".to_string()],
            ..opts()
        };
        let args = build_extractor_args(&options, &ExtractorAction::ResolveUrl, "-rf");
        let sep = args.iter().position(|a| a == "--").unwrap();
        assert_eq!(&args[sep + 1..], ["-rf"]);
        let cookies = args.iter().position(|a| a == "--cookies").unwrap();
        assert_eq!(args[cookies + 1], "/secrets/cookies.txt");
        assert!(cookies < sep);
        assert!(args.contains(&"--force-ipv4".to_string()));
        assert!(args.contains(&"--get-url".to_string()));
    }

    #[test]
    fn test_search_args() {
        let args = build_extractor_args(
            &opts(),
            &ExtractorAction::Search { limit: 3 },
            "test song",
        );
        assert!(args.contains(&"--flat-playlist".to_string()));
        assert_eq!(args.last().unwrap(), "ytsearch3:test song");
    }

    #[test]
    fn test_playlist_args() {
        let args = build_extractor_args(
            &opts(),
            &ExtractorAction::ListPlaylist { limit: 5 },
            "https://www.youtube.com/playlist?list=PL1",
        );
        let end = args.iter().position(|a| a == "--playlist-end").unwrap();
        assert_eq!(args[end + 1], "5");
        assert_eq!(args.last().unwrap(), "https://www.youtube.com/playlist?list=PL1");
    }

    #[test]
    fn test_parse_flat_and_full_records() {
        let stdout = br#"{"id": "abc123def45", "title": "Flat Entry", "url": "https://www.youtube.com/watch?v=abc123def45", "duration": 201.0, "channel": "Some Artist", "thumbnails": [{"url": "https://i.ytimg.com/small.jpg"}, {"url": "https://i.ytimg.com/large.jpg"}]}
[youtube:search] Downloading page 1
{"id": "zzz", "title": "Full", "uploader": "Uploader", "webpage_url": "https://www.youtube.com/watch?v=zzz", "url": "https://rr1.googlevideo.com/videoplayback?x", "thumbnail": "https://i.ytimg.com/zzz.jpg"}
not json at all
"#;
        let candidates = parse_records(stdout);
        assert_eq!(candidates.len(), 2);

        assert_eq!(candidates[0].id, "abc123def45");
        assert_eq!(candidates[0].artist.as_deref(), Some("Some Artist"));
        assert_eq!(candidates[0].duration_seconds, Some(201.0));
        assert_eq!(
            candidates[0].thumbnail_url.as_deref(),
            Some("https://i.ytimg.com/large.jpg")
        );

        assert_eq!(candidates[1].url, "https://www.youtube.com/watch?v=zzz");
        assert_eq!(candidates[1].artist.as_deref(), Some("Uploader"));
    }

    #[test]
    fn test_record_without_url_uses_id() {
        let candidates = parse_records(br#"{"id": "dQw4w9WgXcQ", "title": "t"}"#);
        assert_eq!(candidates[0].url, "https://www.youtube.com/watch?v=dQw4w9WgXcQ");
    }

    #[test]
    fn test_parse_resolved_url() {
        let out = b"WARNING: something\nhttps://rr3.googlevideo.com/videoplayback?id=1\n";
        assert_eq!(
            parse_resolved_url(out).as_deref(),
            Some("https://rr3.googlevideo.com/videoplayback?id=1")
        );
        assert_eq!(parse_resolved_url(b""), None);
    }
}
