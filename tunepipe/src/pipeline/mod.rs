//! Subprocess pipelines: launch, relay, supervise.

pub mod process;
pub mod relay;
pub mod request;
pub mod runner;
pub mod stderr;
pub mod supervisor;

pub use process::{Launcher, ManagedProcess, ProcessSpec, ProcessState, StdinSource, StdoutSink};
pub use relay::{ChunkSink, RelayEnd, RelayOutcome};
pub use request::{PipelineRequest, RequestParams, SourceMode, TranscodeFormat};
pub use runner::{ActiveStream, PipelineReport, PipelineRunner, StreamHandle, StreamOutcome};
pub use supervisor::Pipeline;
