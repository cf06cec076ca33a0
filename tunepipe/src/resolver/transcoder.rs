//! ffmpeg invocation for the optional transcode stage.

use crate::pipeline::TranscodeFormat;

/// Served when the format preference does not pin a known container.
pub const UNKNOWN_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TranscodeOptions {
    pub format: TranscodeFormat,
    pub bitrate_kbps: u32,
    pub seek_offset_seconds: Option<f64>,
}

impl TranscodeOptions {
    pub fn new(format: TranscodeFormat, bitrate_kbps: u32) -> Self {
        Self {
            format,
            bitrate_kbps,
            seek_offset_seconds: None,
        }
    }

    pub fn with_seek(mut self, secs: Option<f64>) -> Self {
        self.seek_offset_seconds = secs.filter(|s| *s > 0.0);
        self
    }
}

/// Build ffmpeg arguments reading from stdin and writing to stdout.
pub fn build_transcoder_args(options: &TranscodeOptions) -> Vec<String> {
    let mut args: Vec<String> = ["-hide_banner", "-nostats", "-loglevel", "error"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    if let Some(secs) = options.seek_offset_seconds {
        args.push("-ss".to_string());
        args.push(format!("{:.3}", secs));
    }

    args.extend(["-i", "pipe:0", "-vn", "-c:a", options.format.codec()].map(String::from));

    if options.format.is_lossy() && options.bitrate_kbps > 0 {
        args.push("-b:a".to_string());
        args.push(format!("{}k", options.bitrate_kbps));
    }

    args.extend(["-f", options.format.muxer(), "pipe:1"].map(String::from));
    args
}

/// Response media type for an optional transcode format. `passthrough` is
/// used when the extractor output is served as is.
pub fn content_type(format: Option<TranscodeFormat>, passthrough: &'static str) -> &'static str {
    format.map(|f| f.content_type()).unwrap_or(passthrough)
}

/// Media type of untranscoded extractor output, taken from the container the
/// first format selector pins (`bestaudio[ext=m4a]` gives `audio/mp4`).
///
/// Later selectors are fallbacks and are not consulted, so a fallback that
/// lands on another container is still served under the first selector's type.
pub fn passthrough_content_type(format_preference: &[String]) -> &'static str {
    let Some(ext) = format_preference.first().and_then(|s| pinned_ext(s)) else {
        return UNKNOWN_CONTENT_TYPE;
    };
    match ext.to_ascii_lowercase().as_str() {
        "webm" => "audio/webm",
        "m4a" | "mp4" => "audio/mp4",
        "mp3" => "audio/mpeg",
        "ogg" | "opus" => "audio/ogg",
        "aac" => "audio/aac",
        "flac" => "audio/flac",
        _ => UNKNOWN_CONTENT_TYPE,
    }
}

/// Value of an `ext=` filter in a yt-dlp selector.
fn pinned_ext(selector: &str) -> Option<&str> {
    let start = selector.find("[ext=")? + "[ext=".len();
    let rest = &selector[start..];
    let end = rest.find(']')?;
    Some(rest[..end].trim_matches(|c: char| c == '\'' || c == '"'))
}

/// File extension for a response media type.
pub fn file_extension(content_type: &str) -> &'static str {
    match content_type {
        "audio/webm" => "webm",
        "audio/mp4" => "m4a",
        "audio/mpeg" => "mp3",
        "audio/ogg" => "opus",
        "audio/aac" => "aac",
        "audio/flac" => "flac",
        _ => "bin",
    }
}
