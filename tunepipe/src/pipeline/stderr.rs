//! Bounded capture of a child's stderr.
//!
//! yt-dlp and ffmpeg write progress to stderr using carriage returns, and a
//! child blocks once the OS pipe buffer fills. The drain task therefore reads
//! continuously, keeps only the newest bytes, and logs complete records.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Longest excerpt surfaced to callers.
pub const EXCERPT_MAX_CHARS: usize = 512;

/// Ring buffer keeping the last `capacity` bytes written to it.
#[derive(Debug)]
pub struct StderrTail {
    buf: VecDeque<u8>,
    capacity: usize,
    dropped: u64,
}

impl StderrTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity.min(64 * 1024)),
            capacity: capacity.max(1),
            dropped: 0,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        let bytes = if bytes.len() > self.capacity {
            self.dropped += (bytes.len() - self.capacity) as u64;
            &bytes[bytes.len() - self.capacity..]
        } else {
            bytes
        };
        let overflow = (self.buf.len() + bytes.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            self.buf.drain(..overflow);
            self.dropped += overflow as u64;
        }
        self.buf.extend(bytes);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Bytes discarded to stay within capacity.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Short human-readable excerpt of the retained output.
    ///
    /// Lines mentioning `ERROR` are preferred; otherwise the last lines are
    /// used. The result never exceeds [`EXCERPT_MAX_CHARS`] characters.
    pub fn excerpt(&self) -> String {
        let (front, back) = self.buf.as_slices();
        let mut raw = Vec::with_capacity(front.len() + back.len());
        raw.extend_from_slice(front);
        raw.extend_from_slice(back);
        let text = String::from_utf8_lossy(&raw);

        let lines: Vec<&str> = text
            .split(['\n', '\r'])
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();
        let errors: Vec<&str> = lines
            .iter()
            .copied()
            .filter(|l| l.contains("ERROR") || l.to_lowercase().starts_with("error"))
            .collect();
        let chosen = if errors.is_empty() { lines } else { errors };

        let joined = chosen.join("\n");
        let count = joined.chars().count();
        if count <= EXCERPT_MAX_CHARS {
            joined
        } else {
            joined.chars().skip(count - EXCERPT_MAX_CHARS).collect()
        }
    }
}

/// Shared handle to a process's stderr tail and its drain task.
#[derive(Debug)]
pub struct StderrCapture {
    tail: Arc<Mutex<StderrTail>>,
    task: Option<JoinHandle<()>>,
}

impl StderrCapture {
    /// Start draining `reader` into a tail of `capacity` bytes.
    pub fn spawn<R>(reader: R, capacity: usize, label: String) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let tail = Arc::new(Mutex::new(StderrTail::new(capacity)));
        let task_tail = tail.clone();
        let task = tokio::spawn(async move {
            drain(reader, task_tail, &label).await;
        });
        Self {
            tail,
            task: Some(task),
        }
    }

    /// Capture with nothing attached, for processes whose stderr is not piped.
    pub fn empty(capacity: usize) -> Self {
        Self {
            tail: Arc::new(Mutex::new(StderrTail::new(capacity))),
            task: None,
        }
    }

    /// Wait briefly for the drain task to reach EOF, then return the excerpt.
    pub async fn finish(&mut self, wait: std::time::Duration) -> String {
        if let Some(task) = self.task.as_mut() {
            match tokio::time::timeout(wait, task).await {
                Ok(_) => self.task = None,
                Err(_) => debug!("stderr drain still running; using partial output"),
            }
        }
        let tail = self.tail.lock();
        if tail.dropped() > 0 {
            debug!(dropped = tail.dropped(), "stderr exceeded tail capacity");
        }
        tail.excerpt()
    }
}

impl Drop for StderrCapture {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn drain<R>(mut reader: R, tail: Arc<Mutex<StderrTail>>, label: &str)
where
    R: AsyncRead + Unpin,
{
    let mut scratch = [0u8; 4096];
    let mut pending: Vec<u8> = Vec::new();

    loop {
        let n = match reader.read(&mut scratch).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!(stage = label, error = %e, "Error reading stderr");
                break;
            }
        };
        tail.lock().push(&scratch[..n]);

        pending.extend_from_slice(&scratch[..n]);
        while let Some(idx) = pending.iter().position(|&b| matches!(b, b'\n' | b'\r')) {
            let record: Vec<u8> = pending.drain(..=idx).collect();
            log_record(label, &record);
        }
        // Bound the pending record as well as the tail.
        if pending.len() > 4096 {
            log_record(label, &pending);
            pending.clear();
        }
    }

    if !pending.is_empty() {
        log_record(label, &pending);
    }
}

fn log_record(label: &str, record: &[u8]) {
    let line = String::from_utf8_lossy(record);
    let line = line.trim();
    if !line.is_empty() {
        debug!(stage = label, "stderr: {}", line);
    }
}
