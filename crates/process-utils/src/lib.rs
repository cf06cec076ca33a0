//! Small process-related helpers shared across the workspace.
//!
//! Every external tool tunepipe runs goes through [`tokio_command`], so the
//! defaults that matter for request-scoped children (no console window on
//! Windows, kill on drop, closed stdin) are applied in one place.

use std::ffi::OsStr;
use std::io;
use std::path::Path;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Apply the Windows `CREATE_NO_WINDOW` flag. No-op elsewhere.
fn no_window(cmd: &mut tokio::process::Command) {
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        cmd.as_std_mut().creation_flags(CREATE_NO_WINDOW);
    }
    #[cfg(not(windows))]
    let _ = cmd;
}

/// Create a `tokio::process::Command` for a request-scoped child.
///
/// The child is killed if its handle is dropped without being reaped and
/// its stdin starts out closed; callers opt into pipes explicitly.
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    no_window(&mut cmd);
    cmd.kill_on_drop(true);
    cmd.stdin(std::process::Stdio::null());
    cmd
}

/// Why the OS refused to create a child process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnFailure {
    /// The executable does not exist or is not on `PATH`.
    NotFound,
    /// The executable exists but may not be executed.
    PermissionDenied,
    /// An argument could not be handed to the OS (e.g. an interior NUL byte).
    InvalidArgument,
    /// Anything else reported by the OS.
    Other(String),
}

impl SpawnFailure {
    /// Classify an error returned by `Command::spawn`.
    pub fn classify(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound,
            io::ErrorKind::PermissionDenied => Self::PermissionDenied,
            io::ErrorKind::InvalidInput => Self::InvalidArgument,
            _ => Self::Other(err.to_string()),
        }
    }
}

/// Bare executable name of `program`, without any directory components.
///
/// Used in user-facing messages so configured filesystem paths stay private.
pub fn display_name(program: &str) -> &str {
    Path::new(program)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(program)
}
