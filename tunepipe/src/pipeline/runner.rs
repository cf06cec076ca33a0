//! Runs extractor (and optional transcoder) pipelines for one request.
//!
//! A stream is only handed to the caller once the last stage has produced
//! its first bytes. Until then every failure is still a structured error;
//! afterwards the response has started and failures can only truncate it.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::process::{Launcher, ProcessSpec, ProcessState, StdinSource, StdoutSink};
use super::relay::{RelayEnd, WriterSink, chunk_stream, relay};
use super::request::{PipelineRequest, TranscodeFormat};
use super::supervisor::{Pipeline, Supervision};
use crate::config::{AppConfig, PipelineConfig, ToolCommand};
use crate::resolver::extractor::{
    ExtractorAction, ExtractorOptions, build_extractor_args, parse_resolved_url,
};
use crate::resolver::transcoder::{
    TranscodeOptions, build_transcoder_args, content_type, passthrough_content_type,
};
use crate::{Error, Result};

pub const STAGE_EXTRACTOR: &str = "extractor";
pub const STAGE_TRANSCODER: &str = "transcoder";

/// Upper bound on captured extractor output (metadata, URLs, listings).
const MAX_CAPTURE_BYTES: u64 = 16 * 1024 * 1024;

type ChunkStream = BoxStream<'static, io::Result<Bytes>>;

fn new_pipeline_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Removes configured secrets and local paths from text shown to clients.
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    needles: Vec<String>,
}

impl Redactor {
    pub fn new<I, S>(needles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut needles: Vec<String> = needles
            .into_iter()
            .map(Into::into)
            .filter(|n: &String| !n.is_empty())
            .collect();
        // Longest first, so a path is replaced before its parent directory.
        needles.sort_by_key(|n| std::cmp::Reverse(n.len()));
        Self { needles }
    }

    pub fn apply(&self, text: &str) -> String {
        self.needles
            .iter()
            .fold(text.to_string(), |acc, needle| acc.replace(needle, "<redacted>"))
    }

    pub fn error(&self, err: Error) -> Error {
        match err {
            Error::Pipeline {
                exit_code,
                stderr_excerpt,
            } => Error::Pipeline {
                exit_code,
                stderr_excerpt: self.apply(&stderr_excerpt),
            },
            other => other,
        }
    }
}

/// How a stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    /// The final stage reached end of output and every stage exited cleanly.
    Completed,
    /// The consumer stopped reading before the end.
    ConsumerDisconnected,
    /// The stream was cancelled through its handle.
    Cancelled,
    /// A stage failed after the response had started.
    Failed(String),
}

/// Final accounting for a stream.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub pipeline_id: String,
    pub outcome: StreamOutcome,
    pub bytes: u64,
    pub states: Vec<ProcessState>,
}

/// Control side of a running stream.
#[derive(Debug)]
pub struct StreamHandle {
    cancel: CancellationToken,
    report: oneshot::Receiver<PipelineReport>,
}

impl StreamHandle {
    /// Tear the pipeline down without waiting for the consumer.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the pipeline to finish and every process to be reaped.
    pub async fn report(self) -> Option<PipelineReport> {
        self.report.await.ok()
    }
}

/// A pipeline whose final stage has started producing output.
pub struct ActiveStream {
    pipeline_id: String,
    content_type: &'static str,
    body: mpsc::Receiver<io::Result<Bytes>>,
    handle: StreamHandle,
}

impl ActiveStream {
    pub fn pipeline_id(&self) -> &str {
        &self.pipeline_id
    }

    pub fn content_type(&self) -> &'static str {
        self.content_type
    }

    /// Split into the body and its control handle. Dropping the body stops
    /// the pipeline; dropping the handle does not.
    pub fn into_parts(
        self,
    ) -> (
        impl Stream<Item = io::Result<Bytes>> + Send + 'static,
        StreamHandle,
    ) {
        let body = futures::stream::unfold(self.body, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        (body, self.handle)
    }
}

/// Spawns and supervises pipelines.
#[derive(Debug)]
pub struct PipelineRunner {
    launcher: Launcher,
    extractor_command: ToolCommand,
    transcoder_command: ToolCommand,
    extractor: ExtractorOptions,
    passthrough_type: &'static str,
    bitrate_kbps: u32,
    config: PipelineConfig,
    redactor: Redactor,
    shutdown: CancellationToken,
}

impl PipelineRunner {
    pub fn new(config: &AppConfig) -> Self {
        let mut needles: Vec<String> = Vec::new();
        if let Some(path) = &config.extractor.credential_file {
            needles.push(path.to_string_lossy().to_string());
        }
        needles.push(config.temp.dir.to_string_lossy().to_string());

        Self {
            launcher: Launcher::new(config.pipeline.stderr_tail_bytes),
            extractor_command: config.extractor_command.clone(),
            transcoder_command: config.transcoder_command.clone(),
            extractor: config.extractor.clone(),
            passthrough_type: passthrough_content_type(&config.extractor.format_preference),
            bitrate_kbps: config.transcode_bitrate_kbps,
            config: config.pipeline.clone(),
            redactor: Redactor::new(needles),
            shutdown: CancellationToken::new(),
        }
    }

    /// Tie every pipeline started from now on to `token`; cancelling it tears
    /// down live streams and downloads.
    pub fn with_shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Media type of the output for an optional transcode format.
    pub fn content_type_for(&self, format: Option<TranscodeFormat>) -> &'static str {
        content_type(format, self.passthrough_type)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn transcode_options(&self, request: &PipelineRequest) -> Option<TranscodeOptions> {
        request.transcode_format().map(|format| {
            TranscodeOptions::new(format, self.bitrate_kbps)
                .with_seek(request.seek_offset_seconds())
        })
    }

    fn extractor_spec(&self, action: &ExtractorAction, locator: &str) -> ProcessSpec {
        ProcessSpec::new(
            STAGE_EXTRACTOR,
            self.extractor_command.clone(),
            build_extractor_args(&self.extractor, action, locator),
        )
    }

    fn transcoder_spec(&self, options: &TranscodeOptions) -> ProcessSpec {
        ProcessSpec::new(
            STAGE_TRANSCODER,
            self.transcoder_command.clone(),
            build_transcoder_args(options),
        )
        .stdin(StdinSource::PreviousProcessStdout)
    }

    fn resolve_timeout_error(&self) -> Error {
        Error::Timeout {
            phase: "resolve",
            after_secs: self.config.resolve_timeout.as_secs(),
        }
    }

    /// Tear `pipeline` down and hand back `err`.
    async fn abort(&self, pipeline: &mut Pipeline, err: Error) -> Error {
        pipeline.shutdown().await;
        self.redactor.error(err)
    }

    /// Error for a stage whose output ended before producing anything.
    async fn no_output(&self, pipeline: &mut Pipeline, index: usize) -> Error {
        if let Some(stage) = pipeline.stage_mut(index) {
            let _ = tokio::time::timeout(self.config.terminate_grace, stage.wait()).await;
        }
        pipeline.reap();
        match pipeline.first_failure().await {
            Some(err) => err,
            None => Error::resolution("Extractor produced no audio"),
        }
    }

    /// Wait for the first chunk of `source` until the resolve `deadline`.
    async fn prime(
        &self,
        pipeline: &mut Pipeline,
        index: usize,
        source: &mut ChunkStream,
        deadline: Instant,
    ) -> Result<Bytes> {
        match tokio::time::timeout_at(deadline, source.next()).await {
            Ok(Some(Ok(chunk))) => Ok(chunk),
            Ok(Some(Err(e))) => Err(Error::Io(e)),
            Ok(None) => Err(self.no_output(pipeline, index).await),
            Err(_) => {
                warn!(
                    pipeline_id = pipeline.id(),
                    stage = index,
                    timeout = ?self.config.resolve_timeout,
                    "No output within resolve timeout"
                );
                Err(self.resolve_timeout_error())
            }
        }
    }

    /// Start streaming `request`'s locator.
    ///
    /// Returns once the final stage has produced its first bytes. Any
    /// failure before that point is returned as an error with every
    /// spawned process already reaped.
    pub async fn start_stream(&self, request: &PipelineRequest) -> Result<ActiveStream> {
        let pipeline_id = new_pipeline_id();
        let chunk_size = self.config.chunk_size;
        let transcode = self.transcode_options(request);
        let cancel = self.shutdown.child_token();
        let mut pipeline = Pipeline::new(&pipeline_id, self.config.terminate_grace);
        // One budget covers both stages.
        let deadline = Instant::now() + self.config.resolve_timeout;

        let extractor_sink = if transcode.is_some() {
            StdoutSink::PipeToNext
        } else {
            StdoutSink::PipeToConsumer
        };
        let spec = self
            .extractor_spec(&ExtractorAction::Stream, request.source_locator())
            .stdout(extractor_sink);
        pipeline.push(self.launcher.spawn(&pipeline_id, spec)?)?;

        let stdout = take_stdout(&mut pipeline, 0)?;
        let mut source: ChunkStream = chunk_stream(stdout, chunk_size).boxed();
        let first = match self.prime(&mut pipeline, 0, &mut source, deadline).await {
            Ok(chunk) => chunk,
            Err(e) => return Err(self.abort(&mut pipeline, e).await),
        };
        debug!(pipeline_id = %pipeline_id, bytes = first.len(), "Extractor produced first chunk");

        let (output, feed) = match transcode {
            None => (prepend(first, source), None),
            Some(options) => {
                let process = match self
                    .launcher
                    .spawn(&pipeline_id, self.transcoder_spec(&options))
                {
                    Ok(process) => process,
                    Err(e) => return Err(self.abort(&mut pipeline, e).await),
                };
                if let Err(e) = pipeline.push(process) {
                    return Err(self.abort(&mut pipeline, e).await);
                }
                let stdin = match pipeline.stage_mut(1).and_then(|s| s.take_stdin()) {
                    Some(stdin) => stdin,
                    None => {
                        let err = Error::Other("transcoder stdin not piped".to_string());
                        return Err(self.abort(&mut pipeline, err).await);
                    }
                };
                let stdout = match take_stdout(&mut pipeline, 1) {
                    Ok(stdout) => stdout,
                    Err(e) => return Err(self.abort(&mut pipeline, e).await),
                };

                let upstream = prepend(first, source);
                let feed_cancel = cancel.clone();
                let feed = tokio::spawn(async move {
                    let mut sink = WriterSink::new(stdin);
                    relay(upstream, &mut sink, &feed_cancel).await
                });

                let mut transcoded: ChunkStream = chunk_stream(stdout, chunk_size).boxed();
                let first_out = match self.prime(&mut pipeline, 1, &mut transcoded, deadline).await {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        cancel.cancel();
                        let _ = feed.await;
                        return Err(self.abort(&mut pipeline, e).await);
                    }
                };
                (prepend(first_out, transcoded), Some(feed))
            }
        };

        let content_type = self.content_type_for(request.transcode_format());
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let (report_tx, report_rx) = oneshot::channel();
        let driver = StreamDriver {
            pipeline,
            output,
            feed,
            sink: tx,
            cancel: cancel.clone(),
            grace: self.config.terminate_grace,
            redactor: self.redactor.clone(),
        };
        tokio::spawn(async move {
            let report = driver.run().await;
            let _ = report_tx.send(report);
        });

        info!(pipeline_id = %pipeline_id, content_type, "Stream ready");
        Ok(ActiveStream {
            pipeline_id,
            content_type,
            body: rx,
            handle: StreamHandle {
                cancel,
                report: report_rx,
            },
        })
    }

    /// Run `request` to completion, writing the final output to `path`.
    /// Returns the number of bytes written.
    pub async fn download_to(&self, request: &PipelineRequest, path: &Path) -> Result<u64> {
        let pipeline_id = new_pipeline_id();
        let transcode = self.transcode_options(request);
        let cancel = self.shutdown.child_token();
        let mut pipeline = Pipeline::new(&pipeline_id, self.config.terminate_grace);
        let file_sink = StdoutSink::File(PathBuf::from(path));

        let extractor_sink = if transcode.is_some() {
            StdoutSink::PipeToNext
        } else {
            file_sink.clone()
        };
        let spec = self
            .extractor_spec(&ExtractorAction::Stream, request.source_locator())
            .stdout(extractor_sink);
        pipeline.push(self.launcher.spawn(&pipeline_id, spec)?)?;

        let mut feed = None;
        if let Some(options) = transcode {
            let spec = self.transcoder_spec(&options).stdout(file_sink);
            let process = match self.launcher.spawn(&pipeline_id, spec) {
                Ok(process) => process,
                Err(e) => return Err(self.abort(&mut pipeline, e).await),
            };
            if let Err(e) = pipeline.push(process) {
                return Err(self.abort(&mut pipeline, e).await);
            }
            let upstream = take_stdout(&mut pipeline, 0);
            let stdin = pipeline.stage_mut(1).and_then(|s| s.take_stdin());
            let (upstream, stdin) = match (upstream, stdin) {
                (Ok(upstream), Some(stdin)) => (upstream, stdin),
                _ => {
                    let err = Error::Other("download stages are not piped".to_string());
                    return Err(self.abort(&mut pipeline, err).await);
                }
            };
            let chunk_size = self.config.chunk_size;
            let feed_cancel = cancel.clone();
            feed = Some(tokio::spawn(async move {
                let mut sink = WriterSink::new(stdin);
                relay(chunk_stream(upstream, chunk_size), &mut sink, &feed_cancel).await
            }));
        }

        let budget = self.config.download_timeout;
        let supervision = tokio::time::timeout(budget, pipeline.supervise(&cancel)).await;
        cancel.cancel();
        if let Some(feed) = feed {
            let _ = feed.await;
        }

        match supervision {
            Err(_) => {
                let err = Error::Timeout {
                    phase: "download",
                    after_secs: budget.as_secs(),
                };
                return Err(self.abort(&mut pipeline, err).await);
            }
            Ok(Supervision::Completed) => {}
            Ok(_) => {
                let err = match pipeline.first_failure().await {
                    Some(err) => err,
                    None => Error::Other("download interrupted".to_string()),
                };
                return Err(self.abort(&mut pipeline, err).await);
            }
        }
        pipeline.shutdown().await;

        let bytes = tokio::fs::metadata(path).await?.len();
        if bytes == 0 {
            return Err(Error::resolution("Extractor produced no audio"));
        }
        info!(pipeline_id = %pipeline_id, bytes, "Download finished");
        Ok(bytes)
    }

    /// Run the extractor with `action` and return everything it printed.
    pub async fn extract(&self, action: &ExtractorAction, locator: &str) -> Result<Vec<u8>> {
        let pipeline_id = new_pipeline_id();
        let mut pipeline = Pipeline::new(&pipeline_id, self.config.terminate_grace);
        let spec = self
            .extractor_spec(action, locator)
            .stdout(StdoutSink::Captured);
        pipeline.push(self.launcher.spawn(&pipeline_id, spec)?)?;
        let stdout = take_stdout(&mut pipeline, 0)?;

        let work = async {
            let mut out = Vec::new();
            stdout.take(MAX_CAPTURE_BYTES).read_to_end(&mut out).await?;
            let state = match pipeline.stage_mut(0) {
                Some(stage) => stage.wait().await,
                None => ProcessState::Failed("missing stage".to_string()),
            };
            Ok::<_, Error>((out, state))
        };

        match tokio::time::timeout(self.config.resolve_timeout, work).await {
            Err(_) => {
                let err = self.resolve_timeout_error();
                Err(self.abort(&mut pipeline, err).await)
            }
            Ok(Err(e)) => Err(self.abort(&mut pipeline, e).await),
            Ok(Ok((out, state))) if state.is_success() => {
                pipeline.shutdown().await;
                debug!(pipeline_id = %pipeline_id, bytes = out.len(), "Extractor output captured");
                Ok(out)
            }
            Ok(Ok(_)) => {
                let err = match pipeline.first_failure().await {
                    Some(err) => err,
                    None => Error::resolution("Extractor failed"),
                };
                Err(self.abort(&mut pipeline, err).await)
            }
        }
    }

    /// Resolve `locator` to a direct media URL without streaming it.
    pub async fn resolve_direct_url(&self, locator: &str) -> Result<String> {
        let stdout = self.extract(&ExtractorAction::ResolveUrl, locator).await?;
        parse_resolved_url(&stdout)
            .ok_or_else(|| Error::resolution("Extractor returned no media URL"))
    }
}

fn take_stdout(pipeline: &mut Pipeline, index: usize) -> Result<tokio::process::ChildStdout> {
    pipeline
        .stage_mut(index)
        .and_then(|s| s.take_stdout())
        .ok_or_else(|| Error::Other(format!("stage {} stdout is not piped", index)))
}

fn prepend(first: Bytes, rest: ChunkStream) -> ChunkStream {
    futures::stream::once(async move { Ok(first) })
        .chain(rest)
        .boxed()
}

/// Owns a primed pipeline and relays its output into the response body.
struct StreamDriver {
    pipeline: Pipeline,
    output: ChunkStream,
    feed: Option<tokio::task::JoinHandle<super::relay::RelayOutcome>>,
    sink: mpsc::Sender<io::Result<Bytes>>,
    cancel: CancellationToken,
    grace: Duration,
    redactor: Redactor,
}

impl StreamDriver {
    async fn run(self) -> PipelineReport {
        let Self {
            mut pipeline,
            output,
            feed,
            mut sink,
            cancel,
            grace,
            redactor,
        } = self;
        let pipeline_id = pipeline.id().to_string();
        let mut failed_stage = None;

        let relayed = {
            let relay_fut = relay(output, &mut sink, &cancel);
            tokio::pin!(relay_fut);
            loop {
                let watch = failed_stage.is_none() && !pipeline.all_terminal();
                tokio::select! {
                    biased;
                    outcome = &mut relay_fut => break outcome,
                    exit = pipeline.next_exit(), if watch => {
                        if let Some((index, state)) = exit
                            && state.is_failure()
                        {
                            debug!(pipeline_id = %pipeline_id, stage = index, %state, "Stage failed mid-stream");
                            failed_stage = Some(index);
                            cancel.cancel();
                        }
                    }
                }
            }
        };

        if relayed.end == RelayEnd::SourceExhausted && failed_stage.is_none() {
            let settle = CancellationToken::new();
            if tokio::time::timeout(grace, pipeline.supervise(&settle))
                .await
                .is_err()
            {
                debug!(pipeline_id = %pipeline_id, "Stages still running after end of output");
            }
        }

        cancel.cancel();
        pipeline.shutdown().await;
        if let Some(mut feed) = feed
            && tokio::time::timeout(grace, &mut feed).await.is_err()
        {
            feed.abort();
        }

        let bytes = relayed.bytes;
        let outcome = match relayed.end {
            RelayEnd::SinkClosed => {
                info!(pipeline_id = %pipeline_id, bytes, "Consumer disconnected; pipeline torn down");
                StreamOutcome::ConsumerDisconnected
            }
            RelayEnd::Cancelled if failed_stage.is_none() => {
                info!(pipeline_id = %pipeline_id, bytes, "Stream cancelled");
                StreamOutcome::Cancelled
            }
            end => {
                let failure = match pipeline.first_failure().await {
                    Some(err) => Some(redactor.error(err).to_string()),
                    None => match end {
                        RelayEnd::SourceError(e) => Some(e),
                        _ => None,
                    },
                };
                match failure {
                    Some(message) => {
                        warn!(pipeline_id = %pipeline_id, bytes, error = %message, "Stream truncated: pipeline failed after response started");
                        let _ = tokio::time::timeout(
                            grace,
                            sink.send(Err(io::Error::other(message.clone()))),
                        )
                        .await;
                        StreamOutcome::Failed(message)
                    }
                    None => {
                        info!(pipeline_id = %pipeline_id, bytes, "Stream finished");
                        StreamOutcome::Completed
                    }
                }
            }
        };

        PipelineReport {
            pipeline_id,
            outcome,
            bytes,
            states: pipeline.states(),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::pipeline::request::SourceMode;
    use std::time::Instant;

    struct Fixture {
        dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
            }
        }

        fn path(&self, name: &str) -> PathBuf {
            self.dir.path().join(name)
        }

        /// Write `body` as a shell script and return a command running it.
        fn tool(&self, name: &str, body: &str) -> ToolCommand {
            let path = self.path(name);
            std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
            ToolCommand::new("sh").with_leading_args([path.to_string_lossy().to_string()])
        }

        fn media(&self, len: usize) -> (PathBuf, Vec<u8>) {
            let data: Vec<u8> = (0..len).map(|i| (i * 31 % 251) as u8).collect();
            let path = self.path("media.bin");
            std::fs::write(&path, &data).unwrap();
            (path, data)
        }

        fn runner(&self, extractor: ToolCommand, transcoder: ToolCommand) -> PipelineRunner {
            let mut config = AppConfig::default();
            config.extractor_command = extractor;
            config.transcoder_command = transcoder;
            config.pipeline.resolve_timeout = Duration::from_secs(5);
            config.pipeline.terminate_grace = Duration::from_millis(500);
            config.pipeline.chunk_size = 8 * 1024;
            config.temp.dir = self.path("tmp");
            PipelineRunner::new(&config)
        }
    }

    fn request() -> PipelineRequest {
        PipelineRequest::new("https://www.youtube.com/watch?v=abc123def45", SourceMode::DirectUrl)
    }

    async fn collect(stream: ActiveStream) -> (Vec<u8>, bool, PipelineReport) {
        let (body, handle) = stream.into_parts();
        let items: Vec<io::Result<Bytes>> = body.collect().await;
        let errored = items.iter().any(|i| i.is_err());
        let data = items.into_iter().filter_map(|i| i.ok()).collect::<Vec<_>>().concat();
        let report = handle.report().await.unwrap();
        (data, errored, report)
    }

    #[tokio::test]
    async fn test_passthrough_is_byte_identical() {
        let fx = Fixture::new();
        let (media, data) = fx.media(300_000);
        let runner = fx.runner(
            fx.tool("yt-dlp", &format!("exec cat '{}'", media.display())),
            fx.tool("ffmpeg", "exec cat"),
        );

        let stream = runner.start_stream(&request()).await.unwrap();
        assert_eq!(stream.content_type(), "audio/webm");
        let (body, errored, report) = collect(stream).await;

        assert!(!errored);
        assert_eq!(body, data);
        assert_eq!(report.outcome, StreamOutcome::Completed);
        assert_eq!(report.bytes, data.len() as u64);
        assert_eq!(report.states, vec![ProcessState::Exited(0)]);
    }

    #[tokio::test]
    async fn test_passthrough_type_follows_format_preference() {
        let fx = Fixture::new();
        let (media, _) = fx.media(10_000);
        let mut config = AppConfig::default();
        config.extractor_command = fx.tool("yt-dlp", &format!("exec cat '{}'", media.display()));
        config.extractor.format_preference =
            vec!["bestaudio[ext=m4a]".to_string(), "bestaudio".to_string()];
        config.temp.dir = fx.path("tmp");
        let runner = PipelineRunner::new(&config);

        assert_eq!(runner.content_type_for(Some(TranscodeFormat::Mp3)), "audio/mpeg");
        let stream = runner.start_stream(&request()).await.unwrap();
        assert_eq!(stream.content_type(), "audio/mp4");
        let (_, errored, report) = collect(stream).await;
        assert!(!errored);
        assert_eq!(report.outcome, StreamOutcome::Completed);
    }

    #[tokio::test]
    async fn test_transcode_chain_is_byte_identical() {
        let fx = Fixture::new();
        let (media, data) = fx.media(200_000);
        let runner = fx.runner(
            fx.tool("yt-dlp", &format!("exec cat '{}'", media.display())),
            fx.tool("ffmpeg", "exec cat"),
        );

        let request = request().with_transcode(TranscodeFormat::Mp3);
        let stream = runner.start_stream(&request).await.unwrap();
        assert_eq!(stream.content_type(), "audio/mpeg");
        let (body, errored, report) = collect(stream).await;

        assert!(!errored);
        assert_eq!(body, data);
        assert_eq!(report.outcome, StreamOutcome::Completed);
        assert_eq!(
            report.states,
            vec![ProcessState::Exited(0), ProcessState::Exited(0)]
        );
    }

    #[tokio::test]
    async fn test_extractor_failure_never_spawns_transcoder() {
        let fx = Fixture::new();
        let marker = fx.path("transcoder-ran");
        let runner = fx.runner(
            fx.tool(
                "yt-dlp",
                "echo 'ERROR: [youtube] abc123def45: Video unavailable' >&2\nexit 1",
            ),
            fx.tool("ffmpeg", &format!("touch '{}'\nexec cat", marker.display())),
        );

        let request = request().with_transcode(TranscodeFormat::Mp3);
        let err = runner.start_stream(&request).await.err().unwrap();
        match err {
            Error::Pipeline {
                exit_code,
                stderr_excerpt,
            } => {
                assert_eq!(exit_code, Some(1));
                assert!(stderr_excerpt.contains("Video unavailable"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_clean_exit_without_output_is_resolution_error() {
        let fx = Fixture::new();
        let runner = fx.runner(fx.tool("yt-dlp", "exit 0"), fx.tool("ffmpeg", "exec cat"));
        let err = runner.start_stream(&request()).await.err().unwrap();
        assert!(matches!(err, Error::Resolution(_)));
    }

    #[tokio::test]
    async fn test_resolve_timeout() {
        let fx = Fixture::new();
        let mut runner = fx.runner(fx.tool("yt-dlp", "exec sleep 30"), fx.tool("ffmpeg", "exec cat"));
        runner.config.resolve_timeout = Duration::from_millis(300);

        let started = Instant::now();
        let err = runner.start_stream(&request()).await.err().unwrap();
        assert!(matches!(err, Error::Timeout { phase: "resolve", .. }));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_consumer_disconnect_tears_down_all_stages() {
        let fx = Fixture::new();
        let runner = fx.runner(
            fx.tool("yt-dlp", "exec cat /dev/zero"),
            fx.tool("ffmpeg", "exec cat"),
        );

        let request = request().with_transcode(TranscodeFormat::Opus);
        let stream = runner.start_stream(&request).await.unwrap();
        let (body, handle) = stream.into_parts();
        let mut body = Box::pin(body);

        let mut received = 0usize;
        while received < 100_000 {
            let chunk = body.next().await.unwrap().unwrap();
            received += chunk.len();
        }
        drop(body);

        let report = tokio::time::timeout(Duration::from_secs(3), handle.report())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.outcome, StreamOutcome::ConsumerDisconnected);
        assert_eq!(report.states.len(), 2);
        assert!(report.states.iter().all(ProcessState::is_terminal));
    }

    #[tokio::test]
    async fn test_disconnect_while_extractor_stalls() {
        let fx = Fixture::new();
        let runner = fx.runner(
            fx.tool("yt-dlp", "printf 'first-chunk'\nexec sleep 20"),
            fx.tool("ffmpeg", "exec cat"),
        );

        let stream = runner.start_stream(&request()).await.unwrap();
        let (body, handle) = stream.into_parts();
        let mut body = Box::pin(body);
        assert_eq!(body.next().await.unwrap().unwrap().as_ref(), b"first-chunk");
        drop(body);

        let started = Instant::now();
        let report = tokio::time::timeout(Duration::from_secs(5), handle.report())
            .await
            .unwrap()
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(report.outcome, StreamOutcome::ConsumerDisconnected);
        assert!(report.states.iter().all(ProcessState::is_terminal));
    }

    #[tokio::test]
    async fn test_shutdown_token_tears_down_live_stream() {
        let fx = Fixture::new();
        let shutdown = CancellationToken::new();
        let runner = fx
            .runner(fx.tool("yt-dlp", "exec cat /dev/zero"), fx.tool("ffmpeg", "exec cat"))
            .with_shutdown_token(shutdown.child_token());

        let request = request().with_transcode(TranscodeFormat::Mp3);
        let stream = runner.start_stream(&request).await.unwrap();
        let (body, handle) = stream.into_parts();
        let mut body = Box::pin(body);
        assert!(body.next().await.unwrap().is_ok());

        shutdown.cancel();
        let report = tokio::time::timeout(Duration::from_secs(3), handle.report())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.outcome, StreamOutcome::Cancelled);
        assert_eq!(report.states.len(), 2);
        assert!(report.states.iter().all(ProcessState::is_terminal));

        // The body ends once the pipeline is gone.
        let drained = tokio::time::timeout(Duration::from_secs(3), async {
            while body.next().await.is_some() {}
        })
        .await;
        assert!(drained.is_ok());
    }

    fn pid_alive(pid_file: &Path) -> bool {
        let pid = std::fs::read_to_string(pid_file).unwrap();
        std::process::Command::new("kill")
            .args(["-0", pid.trim()])
            .stderr(std::process::Stdio::null())
            .status()
            .unwrap()
            .success()
    }

    #[tokio::test]
    async fn test_resolve_timeout_kills_both_stages() {
        let fx = Fixture::new();
        let (media, _) = fx.media(200_000);
        let extractor_pid = fx.path("extractor.pid");
        let transcoder_pid = fx.path("transcoder.pid");
        let mut runner = fx.runner(
            fx.tool(
                "yt-dlp",
                &format!("echo $$ > '{}'\nexec cat '{}'", extractor_pid.display(), media.display()),
            ),
            fx.tool(
                "ffmpeg",
                &format!("echo $$ > '{}'\nexec sleep 30", transcoder_pid.display()),
            ),
        );
        runner.config.resolve_timeout = Duration::from_millis(500);

        let request = request().with_transcode(TranscodeFormat::Mp3);
        let started = Instant::now();
        let err = runner.start_stream(&request).await.err().unwrap();
        assert!(matches!(err, Error::Timeout { phase: "resolve", .. }));
        assert!(started.elapsed() < Duration::from_secs(4));

        assert!(!pid_alive(&extractor_pid));
        assert!(!pid_alive(&transcoder_pid));
    }

    #[tokio::test]
    async fn test_resolve_budget_spans_both_stages() {
        let fx = Fixture::new();
        let (media, _) = fx.media(50_000);
        let mut runner = fx.runner(
            fx.tool("yt-dlp", &format!("sleep 0.7\nexec cat '{}'", media.display())),
            fx.tool("ffmpeg", "sleep 0.7\nexec cat"),
        );
        runner.config.resolve_timeout = Duration::from_secs(1);

        // Each stage alone fits the budget; together they do not.
        let request = request().with_transcode(TranscodeFormat::Mp3);
        let err = runner.start_stream(&request).await.err().unwrap();
        assert!(matches!(err, Error::Timeout { phase: "resolve", .. }));
    }

    #[tokio::test]
    async fn test_failure_after_start_truncates() {
        let fx = Fixture::new();
        let runner = fx.runner(
            fx.tool(
                "yt-dlp",
                "printf 'partial audio'\nsleep 0.2\necho 'ERROR: connection reset' >&2\nexit 2",
            ),
            fx.tool("ffmpeg", "exec cat"),
        );

        let stream = runner.start_stream(&request()).await.unwrap();
        let (body, errored, report) = collect(stream).await;
        assert_eq!(body, b"partial audio");
        assert!(errored);
        match report.outcome {
            StreamOutcome::Failed(message) => assert!(message.contains("connection reset")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_through_handle() {
        let fx = Fixture::new();
        let runner = fx.runner(fx.tool("yt-dlp", "exec cat /dev/zero"), fx.tool("ffmpeg", "exec cat"));

        let stream = runner.start_stream(&request()).await.unwrap();
        let (_body, handle) = stream.into_parts();
        handle.cancel();
        let report = tokio::time::timeout(Duration::from_secs(3), handle.report())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.outcome, StreamOutcome::Cancelled);
        assert!(report.states.iter().all(ProcessState::is_terminal));
    }

    #[tokio::test]
    async fn test_missing_extractor_is_launch_error() {
        let fx = Fixture::new();
        let runner = fx.runner(
            ToolCommand::new(fx.path("missing/yt-dlp").to_string_lossy().to_string()),
            fx.tool("ffmpeg", "exec cat"),
        );
        let err = runner.start_stream(&request()).await.err().unwrap();
        match err {
            Error::Launch { program, .. } => assert_eq!(program, "yt-dlp"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_download_with_transcode() {
        let fx = Fixture::new();
        let (media, data) = fx.media(120_000);
        let runner = fx.runner(
            fx.tool("yt-dlp", &format!("exec cat '{}'", media.display())),
            fx.tool("ffmpeg", "exec cat"),
        );

        let out = fx.path("out.mp3");
        let request = request().with_transcode(TranscodeFormat::Mp3);
        let bytes = runner.download_to(&request, &out).await.unwrap();
        assert_eq!(bytes, data.len() as u64);
        assert_eq!(std::fs::read(&out).unwrap(), data);
    }

    #[tokio::test]
    async fn test_download_failure() {
        let fx = Fixture::new();
        let runner = fx.runner(
            fx.tool("yt-dlp", "echo 'ERROR: Private video' >&2\nexit 1"),
            fx.tool("ffmpeg", "exec cat"),
        );
        let err = runner
            .download_to(&request(), &fx.path("out.webm"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Pipeline { exit_code: Some(1), .. }));
    }

    #[tokio::test]
    async fn test_resolve_direct_url_and_redaction() {
        let fx = Fixture::new();
        let runner = fx.runner(
            fx.tool("yt-dlp", "echo https://media.example.com/a.webm"),
            fx.tool("ffmpeg", "exec cat"),
        );
        assert_eq!(
            runner.resolve_direct_url("https://www.youtube.com/watch?v=x").await.unwrap(),
            "https://media.example.com/a.webm"
        );

        let tmp = fx.path("tmp");
        let runner = fx.runner(
            fx.tool(
                "yt-dlp",
                &format!("echo 'ERROR: cannot write {}/x.part' >&2\nexit 1", tmp.display()),
            ),
            fx.tool("ffmpeg", "exec cat"),
        );
        match runner.resolve_direct_url("https://www.youtube.com/watch?v=x").await {
            Err(Error::Pipeline { stderr_excerpt, .. }) => {
                assert!(!stderr_excerpt.contains(&tmp.display().to_string()));
                assert!(stderr_excerpt.contains("<redacted>"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_redactor_prefers_longest_match() {
        let redactor = Redactor::new(["/srv", "/srv/cookies.txt", ""]);
        assert_eq!(
            redactor.apply("bad file /srv/cookies.txt in /srv"),
            "bad file <redacted> in <redacted>"
        );
    }
}
