//! Search collaborator and ordered candidate retry.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use super::extractor::{ExtractorAction, parse_records};
use crate::pipeline::runner::PipelineRunner;
use crate::{Error, Result};

/// One search result or playlist entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub id: String,
    pub title: String,
    pub artist: Option<String>,
    pub duration_seconds: Option<f64>,
    pub thumbnail_url: Option<String>,
    /// Page URL handed back to the extractor.
    pub url: String,
}

impl Candidate {
    /// Candidate for a locator the caller already knows, without metadata.
    pub fn from_locator(locator: impl Into<String>) -> Self {
        let url = locator.into();
        Self {
            id: url.clone(),
            title: url.clone(),
            artist: None,
            duration_seconds: None,
            thumbnail_url: None,
            url,
        }
    }

    pub fn locator(&self) -> &str {
        &self.url
    }

    /// Whether only the locator is known.
    pub fn is_bare(&self) -> bool {
        self.title == self.url && self.duration_seconds.is_none()
    }
}

/// Turns free text or a playlist into an ordered candidate list.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SearchProvider: Send + Sync {
    /// Best matches for `query`, best first, at most `limit`.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Candidate>>;

    /// Entries of the playlist at `url`, in playlist order, at most `limit`.
    async fn playlist_entries(&self, url: &str, limit: usize) -> Result<Vec<Candidate>>;

    /// Full metadata for a single media locator.
    async fn describe(&self, locator: &str) -> Result<Candidate>;
}

/// [`SearchProvider`] backed by the extractor's own search and flat listing.
pub struct YtDlpSearch {
    runner: Arc<PipelineRunner>,
}

impl YtDlpSearch {
    pub fn new(runner: Arc<PipelineRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl SearchProvider for YtDlpSearch {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Candidate>> {
        let stdout = self
            .runner
            .extract(&ExtractorAction::Search { limit }, query)
            .await?;
        let mut candidates = parse_records(&stdout);
        candidates.truncate(limit);
        info!(query, found = candidates.len(), "Search finished");
        Ok(candidates)
    }

    async fn playlist_entries(&self, url: &str, limit: usize) -> Result<Vec<Candidate>> {
        let stdout = self
            .runner
            .extract(&ExtractorAction::ListPlaylist { limit }, url)
            .await?;
        let mut candidates = parse_records(&stdout);
        candidates.truncate(limit);
        info!(url, found = candidates.len(), "Playlist listed");
        Ok(candidates)
    }

    async fn describe(&self, locator: &str) -> Result<Candidate> {
        let stdout = self
            .runner
            .extract(&ExtractorAction::Metadata, locator)
            .await?;
        parse_records(&stdout)
            .into_iter()
            .next()
            .ok_or_else(|| Error::resolution("Extractor returned no metadata"))
    }
}

/// Try `attempt` on each candidate in order until one succeeds.
///
/// Recoverable failures move on to the next candidate; anything else stops
/// immediately. When every candidate fails, the last error is returned.
pub async fn try_candidates<T, F, Fut>(
    candidates: Vec<Candidate>,
    mut attempt: F,
) -> Result<(Candidate, T)>
where
    F: FnMut(Candidate) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_error = None;
    let total = candidates.len();

    for (rank, candidate) in candidates.into_iter().enumerate() {
        match attempt(candidate.clone()).await {
            Ok(value) => return Ok((candidate, value)),
            Err(e) if e.is_recoverable() => {
                warn!(
                    rank,
                    total,
                    candidate = %candidate.id,
                    error = %e,
                    "Candidate failed; trying next"
                );
                last_error = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_error.unwrap_or_else(|| Error::resolution("No matching tracks found")))
}
