//! Ownership and teardown of the processes in one pipeline.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::process::{ManagedProcess, ProcessState, StdinSource, StdoutSink};
use crate::{Error, Result};

/// A pipeline never holds more than an extractor and a transcoder.
pub const MAX_STAGES: usize = 2;

/// How supervision of a pipeline ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Supervision {
    /// Every stage exited cleanly.
    Completed,
    /// A stage failed; the index of the first failing stage.
    Failed(usize),
    /// Cancellation fired before the stages finished.
    Cancelled,
}

/// The processes serving one request, upstream first.
#[derive(Debug)]
pub struct Pipeline {
    id: String,
    stages: Vec<ManagedProcess>,
    grace: Duration,
    torn_down: bool,
}

impl Pipeline {
    pub fn new(id: impl Into<String>, grace: Duration) -> Self {
        Self {
            id: id.into(),
            stages: Vec::with_capacity(MAX_STAGES),
            grace,
            torn_down: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Append the next stage, checking that it is wired to the previous one.
    pub fn push(&mut self, process: ManagedProcess) -> Result<usize> {
        if self.stages.len() >= MAX_STAGES {
            return Err(Error::Other(format!(
                "pipeline {} already has {} stages",
                self.id, MAX_STAGES
            )));
        }
        let chained = process.stdin_source() == StdinSource::PreviousProcessStdout;
        match self.stages.last() {
            None if chained => {
                return Err(Error::Other(
                    "first stage cannot read from a previous process".to_string(),
                ));
            }
            Some(prev) if !chained || prev.stdout_sink() != &StdoutSink::PipeToNext => {
                return Err(Error::Other(format!(
                    "stage {} is not chained to {}",
                    process.stage(),
                    prev.stage()
                )));
            }
            _ => {}
        }
        self.stages.push(process);
        Ok(self.stages.len() - 1)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage(&self, index: usize) -> Option<&ManagedProcess> {
        self.stages.get(index)
    }

    pub fn stage_mut(&mut self, index: usize) -> Option<&mut ManagedProcess> {
        self.stages.get_mut(index)
    }

    pub fn states(&self) -> Vec<ProcessState> {
        self.stages.iter().map(|s| s.state().clone()).collect()
    }

    pub fn all_terminal(&self) -> bool {
        self.stages.iter().all(|s| s.state().is_terminal())
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    /// Poll for exits without blocking.
    pub fn reap(&mut self) {
        for stage in &mut self.stages {
            stage.try_reap();
        }
    }

    /// Wait for the next live stage to exit. `None` once every stage is terminal.
    pub async fn next_exit(&mut self) -> Option<(usize, ProcessState)> {
        let waits: Vec<_> = self
            .stages
            .iter_mut()
            .enumerate()
            .filter(|(_, s)| !s.state().is_terminal())
            .map(|(i, s)| Box::pin(async move { (i, s.wait().await) }))
            .collect();
        if waits.is_empty() {
            return None;
        }
        let ((index, state), _, _) = futures::future::select_all(waits).await;
        Some((index, state))
    }

    /// Wait for every stage to exit on its own, stopping early on a failure.
    ///
    /// On failure the remaining stages are terminated.
    pub async fn supervise(&mut self, cancel: &CancellationToken) -> Supervision {
        loop {
            let exit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                exit = self.next_exit() => Some(exit),
            };
            match exit {
                None => {
                    self.shutdown().await;
                    return Supervision::Cancelled;
                }
                Some(None) => return Supervision::Completed,
                Some(Some((index, state))) => {
                    debug!(pipeline_id = %self.id, stage = index, %state, "Stage exited");
                    if state.is_failure() {
                        self.shutdown().await;
                        return Supervision::Failed(index);
                    }
                }
            }
        }
    }

    /// Terminate every stage still running. Safe to call repeatedly.
    pub async fn shutdown(&mut self) -> Vec<ProcessState> {
        if !self.torn_down {
            self.torn_down = true;
            let grace = self.grace;
            let live = self
                .stages
                .iter()
                .filter(|s| !s.state().is_terminal())
                .count();
            if live > 0 {
                debug!(pipeline_id = %self.id, live, ?grace, "Tearing down pipeline");
            }
            futures::future::join_all(self.stages.iter_mut().map(|s| s.terminate(grace))).await;
            info!(pipeline_id = %self.id, states = ?self.states(), "Pipeline torn down");
        }
        self.states()
    }

    /// Error describing the first failed stage, if any.
    ///
    /// A stage that exited with a code wins over one that died from a
    /// signal, which is usually a broken pipe caused by the former.
    pub async fn first_failure(&mut self) -> Option<Error> {
        let index = self
            .stages
            .iter()
            .position(|s| matches!(s.state(), ProcessState::Exited(code) if *code != 0))
            .or_else(|| self.stages.iter().position(|s| s.state().is_failure()))?;
        let stage = &mut self.stages[index];
        let exit_code = stage.state().exit_code();
        let stderr_excerpt = stage.stderr_excerpt().await;
        warn!(
            pipeline_id = %self.id,
            stage = stage.stage(),
            program = stage.program(),
            state = %stage.state(),
            stderr = %stderr_excerpt,
            "Pipeline stage failed"
        );
        Some(Error::Pipeline {
            exit_code,
            stderr_excerpt,
        })
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if !self.torn_down && !self.all_terminal() {
            warn!(pipeline_id = %self.id, "Pipeline dropped without shutdown; killing stages");
        }
        // Each ManagedProcess kills its own child when dropped.
    }
}
