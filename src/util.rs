//! Shared utilities: cooperative cancellation, subprocess invocation with
//! deadlines, and content hashing.

use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

// ============================================================================
// Cancellation
// ============================================================================

/// Cooperative cancellation flag shared between a job and its worker.
///
/// Workers call [`CancelFlag::checkpoint`] at chapter boundaries, alignment
/// chunks, and progress emissions; the flag is also polled while waiting on
/// subprocesses.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Return `Err(Canceled)` if cancellation was requested.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_canceled() {
            Err(Error::Canceled)
        } else {
            Ok(())
        }
    }
}

// ============================================================================
// Subprocess invocation
// ============================================================================

/// Captured output of a finished subprocess.
#[derive(Debug)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Run a subprocess with a deadline and cooperative cancellation.
///
/// stdout/stderr are drained on separate threads so large outputs cannot
/// deadlock the pipe. On timeout the child is killed and the error is
/// classified transient; on cancellation the child is killed and `Canceled`
/// is returned. A nonzero exit is a permanent `BackendFailed`.
pub fn run_command(
    mut command: Command,
    stdin: Option<Vec<u8>>,
    timeout: Duration,
    cancel: &CancelFlag,
    backend: &str,
) -> Result<CommandOutput> {
    command
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command.spawn().map_err(|e| Error::BackendFailed {
        backend: backend.to_string(),
        message: format!("failed to spawn: {e}"),
    })?;

    if let Some(input) = stdin {
        let mut handle = child.stdin.take().ok_or_else(|| Error::BackendFailed {
            backend: backend.to_string(),
            message: "no stdin pipe".into(),
        })?;
        std::thread::spawn(move || {
            let _ = handle.write_all(&input);
        });
    }

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let out_thread = std::thread::spawn(move || drain(stdout));
    let err_thread = std::thread::spawn(move || drain(stderr));

    let deadline = Instant::now() + timeout;
    let status = loop {
        if cancel.is_canceled() {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::Canceled);
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::BackendTimeout {
                backend: backend.to_string(),
                seconds: timeout.as_secs(),
            });
        }
        match child.try_wait()? {
            Some(status) => break status,
            None => std::thread::sleep(Duration::from_millis(25)),
        }
    };

    let stdout = out_thread.join().unwrap_or_default();
    let stderr = err_thread.join().unwrap_or_default();

    if !status.success() {
        return Err(Error::BackendFailed {
            backend: backend.to_string(),
            message: format!(
                "exit {}: {}",
                status.code().unwrap_or(-1),
                String::from_utf8_lossy(&stderr).trim()
            ),
        });
    }

    Ok(CommandOutput { stdout, stderr })
}

fn drain(pipe: Option<impl Read>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf);
    }
    buf
}

// ============================================================================
// Interval math
// ============================================================================

/// Sort and merge overlapping or touching `[begin, end)` intervals.
pub fn coalesce_intervals(mut intervals: Vec<(f64, f64)>) -> Vec<(f64, f64)> {
    intervals.retain(|(b, e)| e > b);
    intervals.sort_by(|a, b| a.0.total_cmp(&b.0));
    let mut merged: Vec<(f64, f64)> = Vec::with_capacity(intervals.len());
    for (begin, end) in intervals {
        match merged.last_mut() {
            Some((_, last_end)) if begin <= *last_end => {
                *last_end = last_end.max(end);
            }
            _ => merged.push((begin, end)),
        }
    }
    merged
}

/// Complement of coalesced intervals within `[0, duration)`.
pub fn complement_intervals(intervals: &[(f64, f64)], duration: f64) -> Vec<(f64, f64)> {
    let mut keep = Vec::with_capacity(intervals.len() + 1);
    let mut cursor = 0.0;
    for &(begin, end) in intervals {
        if begin > cursor {
            keep.push((cursor, begin.min(duration)));
        }
        cursor = cursor.max(end);
    }
    if cursor < duration {
        keep.push((cursor, duration));
    }
    keep
}

// ============================================================================
// Hashing
// ============================================================================

/// Hex SHA-1 of a byte slice, used for content fingerprints.
pub fn sha1_hex(bytes: &[u8]) -> String {
    let mut sha = sha1_smol::Sha1::new();
    sha.update(bytes);
    sha.digest().to_string()
}

/// Hex SHA-1 over a sequence of parts with length framing, so that
/// `["ab", "c"]` and `["a", "bc"]` hash differently.
pub fn sha1_hex_parts<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<[u8]>,
{
    let mut sha = sha1_smol::Sha1::new();
    for part in parts {
        let part = part.as_ref();
        sha.update(&(part.len() as u64).to_le_bytes());
        sha.update(part);
    }
    sha.digest().to_string()
}
