//! Turning a request into playable candidates.

pub mod extractor;
pub mod search;
pub mod transcoder;

use std::sync::Arc;

use tracing::{debug, info};

use crate::pipeline::{ActiveStream, PipelineRequest, PipelineRunner, SourceMode};
use crate::tempfiles::{TempFile, TempStore};
use crate::{Error, Result};
pub use search::{Candidate, SearchProvider, YtDlpSearch, try_candidates};

/// A finished download waiting in the temp store.
#[derive(Debug)]
pub struct Download {
    pub file: TempFile,
    pub bytes: u64,
    pub content_type: &'static str,
}

/// Resolves requests against the search collaborator and runs pipelines on
/// the resulting candidates, best first.
pub struct Resolver {
    search: Arc<dyn SearchProvider>,
    runner: Arc<PipelineRunner>,
    max_candidates: usize,
}

impl Resolver {
    pub fn new(
        search: Arc<dyn SearchProvider>,
        runner: Arc<PipelineRunner>,
        max_candidates: usize,
    ) -> Self {
        Self {
            search,
            runner,
            max_candidates: max_candidates.max(1),
        }
    }

    /// Ordered candidates for `request`, at most `max_candidates`.
    pub async fn candidates(&self, request: &PipelineRequest) -> Result<Vec<Candidate>> {
        let locator = request.source_locator();
        let candidates = match request.mode() {
            SourceMode::Search => self.search.search(locator, self.max_candidates).await?,
            SourceMode::Playlist => {
                self.search
                    .playlist_entries(locator, self.max_candidates)
                    .await?
            }
            SourceMode::DirectUrl => vec![Candidate::from_locator(locator)],
        };
        if candidates.is_empty() {
            return Err(Error::resolution("No matching tracks found"));
        }
        debug!(mode = ?request.mode(), count = candidates.len(), "Candidates resolved");
        Ok(candidates)
    }

    /// Fill in metadata for a bare candidate. Failures keep the bare one.
    pub async fn describe(&self, candidate: Candidate) -> Candidate {
        if !candidate.is_bare() {
            return candidate;
        }
        match self.search.describe(candidate.locator()).await {
            Ok(described) => described,
            Err(e) => {
                debug!(error = %e, "Metadata lookup failed; using bare locator");
                candidate
            }
        }
    }

    /// Start streaming the first candidate that produces output.
    pub async fn stream(&self, request: &PipelineRequest) -> Result<(Candidate, ActiveStream)> {
        let candidates = self.candidates(request).await?;
        let (candidate, stream) = try_candidates(candidates, |candidate| {
            let request = request.for_locator(candidate.locator());
            async move { self.runner.start_stream(&request).await }
        })
        .await?;
        info!(
            candidate = %candidate.id,
            pipeline_id = stream.pipeline_id(),
            "Streaming candidate"
        );
        Ok((candidate, stream))
    }

    /// Download the first candidate that succeeds into a claimed temp file.
    pub async fn download(
        &self,
        request: &PipelineRequest,
        temp: &TempStore,
    ) -> Result<(Candidate, Download)> {
        let candidates = self.candidates(request).await?;
        let content_type = self.runner.content_type_for(request.transcode_format());
        let extension = transcoder::file_extension(content_type);
        temp.ensure_dir().await?;

        try_candidates(candidates, |candidate| {
            let request = request.for_locator(candidate.locator());
            let file = temp.claim(extension);
            async move {
                let bytes = self.runner.download_to(&request, file.path()).await?;
                Ok(Download {
                    file,
                    bytes,
                    content_type,
                })
            }
        })
        .await
    }

    /// Resolve the first candidate to a direct media URL.
    pub async fn direct_url(&self, request: &PipelineRequest) -> Result<(Candidate, String)> {
        let candidates = self.candidates(request).await?;
        try_candidates(candidates, |candidate| async move {
            self.runner.resolve_direct_url(candidate.locator()).await
        })
        .await
    }
}
