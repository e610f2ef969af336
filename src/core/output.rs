//! Streaming output capture for child processes.
//!
//! Each stream (stdout, stderr) is drained by its own reader task in fixed
//! size chunks. Small outputs stay in memory; once a capture reaches the
//! spillover threshold it moves to a temp file with a predictable prefix
//! (`tasker_stdout_`, `tasker_stderr_`) so cleanup can be audited. A hard
//! per-stream cap stops pathological children from filling the disk: past
//! the cap the reader keeps draining the pipe (the child must never block
//! on a full pipe) but discards the data and marks the capture truncated.
//!
//! Every temp file is registered on the workflow's [`CleanupRegistry`];
//! workflow termination removes them all, tolerating prior deletion.
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

/// In-memory size at which a capture spills to disk (1 MiB).
pub const DEFAULT_SPILL_THRESHOLD: usize = 1_048_576;
/// Hard per-stream cap (100 MiB); beyond it data is dropped, not stored.
pub const DEFAULT_HARD_CAP: u64 = 100 * 1024 * 1024;
/// Pipe read chunk size (8 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024;
/// Largest output that may be substituted inline into a command line
/// (100 KB). Larger outputs are truncated with a trailing marker.
pub const INLINE_READ_BUDGET: usize = 100 * 1024;

/// Marker appended to an inline substitution that was cut at the budget.
pub const TRUNCATION_MARKER: &str = "...[truncated]";

static CAPTURE_SEQ: AtomicU64 = AtomicU64::new(0);

/// Capture tuning knobs. Defaults match the documented thresholds.
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub spill_threshold: usize,
    pub hard_cap: u64,
    pub chunk_size: usize,
    /// Directory temp files are created in.
    pub temp_dir: PathBuf,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            spill_threshold: DEFAULT_SPILL_THRESHOLD,
            hard_cap: DEFAULT_HARD_CAP,
            chunk_size: DEFAULT_CHUNK_SIZE,
            temp_dir: std::env::temp_dir(),
        }
    }
}

/// Which stream a capture belongs to; selects the temp-file prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn temp_prefix(&self) -> &'static str {
        match self {
            StreamKind::Stdout => "tasker_stdout_",
            StreamKind::Stderr => "tasker_stderr_",
        }
    }
}

/// Workflow-scoped registry of temp files awaiting deletion.
///
/// Append-only until workflow cleanup; deletions are idempotent.
#[derive(Debug, Default)]
pub struct CleanupRegistry {
    files: Mutex<Vec<PathBuf>>,
}

impl CleanupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, path: PathBuf) {
        self.files.lock().unwrap().push(path);
    }

    pub fn tracked_count(&self) -> usize {
        self.files.lock().unwrap().len()
    }

    /// Delete every tracked file, returning how many were actually removed.
    /// Files already gone are not an error.
    pub fn remove_all(&self) -> usize {
        let files = std::mem::take(&mut *self.files.lock().unwrap());
        let mut removed = 0;
        for path in files {
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => log::warn!("failed to remove temp file {}: {}", path.display(), e),
            }
        }
        removed
    }
}

#[derive(Debug, Clone)]
enum Backing {
    Memory(Vec<u8>),
    Disk(PathBuf),
}

/// Captured output of one stream, either in memory or on disk.
///
/// Handles stay valid until workflow cleanup removes their backing files;
/// readers never follow arbitrary paths, only files the capture itself
/// created.
#[derive(Debug, Clone)]
pub struct OutputHandle {
    backing: Backing,
    size: u64,
    truncated: bool,
}

impl OutputHandle {
    /// Handle for a task that produced no output (skips, decisions).
    pub fn empty() -> Self {
        Self {
            backing: Backing::Memory(Vec::new()),
            size: 0,
            truncated: false,
        }
    }

    /// Handle over bytes already in memory. Used by tests and by recovery
    /// when re-hydrating results from a state file.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let size = bytes.len() as u64;
        Self {
            backing: Backing::Memory(bytes),
            size,
            truncated: false,
        }
    }

    /// Total bytes captured (before any hard-cap truncation).
    pub fn size_bytes(&self) -> u64 {
        self.size
    }

    /// Whether the capture spilled to a temp file.
    pub fn is_on_disk(&self) -> bool {
        matches!(self.backing, Backing::Disk(_))
    }

    /// Whether the hard cap cut this capture short.
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Filesystem path of the backing temp file, for `@N_stdout_file@`
    /// style references. `None` while the capture is in memory.
    pub fn path(&self) -> Option<&Path> {
        match &self.backing {
            Backing::Disk(path) => Some(path),
            Backing::Memory(_) => None,
        }
    }

    /// Read up to `budget` bytes. The boolean reports whether anything was
    /// left behind (either beyond the budget or lost to the hard cap).
    pub fn read_all(&self, budget: usize) -> std::io::Result<(Vec<u8>, bool)> {
        match &self.backing {
            Backing::Memory(bytes) => {
                if bytes.len() > budget {
                    Ok((bytes[..budget].to_vec(), true))
                } else {
                    Ok((bytes.clone(), self.truncated))
                }
            }
            Backing::Disk(path) => {
                use std::io::Read;
                let file = std::fs::File::open(path)?;
                let mut reader = file.take((budget as u64).saturating_add(1));
                let mut bytes = Vec::new();
                reader.read_to_end(&mut bytes)?;
                if bytes.len() > budget {
                    bytes.truncate(budget);
                    Ok((bytes, true))
                } else {
                    Ok((bytes, self.truncated))
                }
            }
        }
    }

    /// Lossy UTF-8 text up to the inline budget, trailing newline trimmed
    /// the way command substitution trims it.
    pub fn text_for_substitution(&self) -> std::io::Result<(String, bool)> {
        let (bytes, truncated) = self.read_all(INLINE_READ_BUDGET)?;
        let mut text = String::from_utf8_lossy(&bytes).into_owned();
        if truncated {
            text.push_str(TRUNCATION_MARKER);
        } else {
            while text.ends_with('\n') || text.ends_with('\r') {
                text.pop();
            }
        }
        Ok((text, truncated))
    }

    /// Full text with no budget, for logs and the JSON report. Still bounded
    /// by the hard cap the capture itself enforced.
    pub fn text_unbounded(&self) -> std::io::Result<String> {
        let (bytes, _) = self.read_all(usize::MAX)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Drain one child stream to completion.
///
/// Never stops reading before EOF: once the hard cap is reached, incoming
/// data is discarded so the child cannot deadlock on a full pipe.
pub async fn capture_stream<R>(
    mut reader: R,
    kind: StreamKind,
    settings: &CaptureSettings,
    registry: &CleanupRegistry,
) -> std::io::Result<OutputHandle>
where
    R: AsyncRead + Unpin,
{
    let mut buffer: Vec<u8> = Vec::new();
    let mut file: Option<tokio::fs::File> = None;
    let mut file_path: Option<PathBuf> = None;
    let mut size: u64 = 0;
    let mut truncated = false;
    let mut chunk = vec![0u8; settings.chunk_size.max(1)];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        if truncated {
            // Keep draining so the child is never blocked on write.
            continue;
        }

        let mut take = n;
        if size + n as u64 > settings.hard_cap {
            take = (settings.hard_cap - size) as usize;
            truncated = true;
        }

        if file.is_none() && buffer.len() + take >= settings.spill_threshold {
            let (new_file, path) = create_temp_file(kind, settings).await?;
            registry.register(path.clone());
            let mut new_file = new_file;
            new_file.write_all(&buffer).await?;
            buffer = Vec::new();
            file = Some(new_file);
            file_path = Some(path);
        }

        match file.as_mut() {
            Some(f) => f.write_all(&chunk[..take]).await?,
            None => buffer.extend_from_slice(&chunk[..take]),
        }
        size += take as u64;
    }

    if let Some(mut f) = file {
        f.flush().await?;
    }

    let backing = match file_path {
        Some(path) => Backing::Disk(path),
        None => Backing::Memory(buffer),
    };
    Ok(OutputHandle {
        backing,
        size,
        truncated,
    })
}

async fn create_temp_file(
    kind: StreamKind,
    settings: &CaptureSettings,
) -> std::io::Result<(tokio::fs::File, PathBuf)> {
    let seq = CAPTURE_SEQ.fetch_add(1, Ordering::Relaxed);
    let name = format!("{}{}_{}", kind.temp_prefix(), std::process::id(), seq);
    let path = settings.temp_dir.join(name);

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);
    let file = options.open(&path).await?;
    Ok((file, path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn settings_in(dir: &TempDir) -> CaptureSettings {
        CaptureSettings {
            temp_dir: dir.path().to_path_buf(),
            ..CaptureSettings::default()
        }
    }

    #[tokio::test]
    async fn test_small_output_stays_in_memory() {
        let dir = TempDir::new().unwrap();
        let registry = CleanupRegistry::new();
        let handle = capture_stream(
            &b"hello\n"[..],
            StreamKind::Stdout,
            &settings_in(&dir),
            &registry,
        )
        .await
        .unwrap();
        assert!(!handle.is_on_disk());
        assert_eq!(handle.size_bytes(), 6);
        assert_eq!(registry.tracked_count(), 0);
        let (text, truncated) = handle.text_for_substitution().unwrap();
        assert_eq!(text, "hello");
        assert!(!truncated);
    }

    #[tokio::test]
    async fn test_spillover_at_exact_threshold() {
        let dir = TempDir::new().unwrap();
        let registry = CleanupRegistry::new();
        let data = vec![b'x'; DEFAULT_SPILL_THRESHOLD];
        let handle = capture_stream(&data[..], StreamKind::Stdout, &settings_in(&dir), &registry)
            .await
            .unwrap();
        assert!(handle.is_on_disk());
        assert_eq!(handle.size_bytes(), DEFAULT_SPILL_THRESHOLD as u64);
        assert_eq!(registry.tracked_count(), 1);
        let path = handle.path().unwrap();
        assert!(
            path.file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("tasker_stdout_")
        );
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_one_byte_under_threshold_stays_in_memory() {
        let dir = TempDir::new().unwrap();
        let registry = CleanupRegistry::new();
        let data = vec![b'x'; DEFAULT_SPILL_THRESHOLD - 1];
        let handle = capture_stream(&data[..], StreamKind::Stdout, &settings_in(&dir), &registry)
            .await
            .unwrap();
        assert!(!handle.is_on_disk());
        assert_eq!(registry.tracked_count(), 0);
    }

    #[tokio::test]
    async fn test_hard_cap_truncates_but_drains() {
        let dir = TempDir::new().unwrap();
        let registry = CleanupRegistry::new();
        let settings = CaptureSettings {
            spill_threshold: 64,
            hard_cap: 128,
            chunk_size: 32,
            temp_dir: dir.path().to_path_buf(),
        };
        let data = vec![b'y'; 1024];
        let handle = capture_stream(&data[..], StreamKind::Stderr, &settings, &registry)
            .await
            .unwrap();
        assert!(handle.is_truncated());
        assert_eq!(handle.size_bytes(), 128);
        let (bytes, truncated) = handle.read_all(usize::MAX).unwrap();
        assert_eq!(bytes.len(), 128);
        assert!(truncated);
    }

    #[tokio::test]
    async fn test_inline_budget_truncation_boundary() {
        let exactly = OutputHandle::from_bytes(vec![b'a'; INLINE_READ_BUDGET]);
        let (text, truncated) = exactly.text_for_substitution().unwrap();
        assert!(!truncated);
        assert_eq!(text.len(), INLINE_READ_BUDGET);

        let over = OutputHandle::from_bytes(vec![b'a'; INLINE_READ_BUDGET + 1]);
        let (text, truncated) = over.text_for_substitution().unwrap();
        assert!(truncated);
        assert!(text.ends_with(TRUNCATION_MARKER));
        assert_eq!(text.len(), INLINE_READ_BUDGET + TRUNCATION_MARKER.len());
    }

    #[tokio::test]
    async fn test_cleanup_registry_idempotent() {
        let dir = TempDir::new().unwrap();
        let registry = CleanupRegistry::new();
        let data = vec![b'z'; DEFAULT_SPILL_THRESHOLD + 10];
        let handle = capture_stream(&data[..], StreamKind::Stdout, &settings_in(&dir), &registry)
            .await
            .unwrap();
        let path = handle.path().unwrap().to_path_buf();

        // Simulate an earlier deletion; cleanup must tolerate it.
        std::fs::remove_file(&path).unwrap();
        assert_eq!(registry.remove_all(), 0);
        assert_eq!(registry.tracked_count(), 0);
        assert_eq!(registry.remove_all(), 0);
    }

    #[tokio::test]
    async fn test_stderr_prefix() {
        let dir = TempDir::new().unwrap();
        let registry = CleanupRegistry::new();
        let data = vec![b'e'; DEFAULT_SPILL_THRESHOLD];
        let handle = capture_stream(&data[..], StreamKind::Stderr, &settings_in(&dir), &registry)
            .await
            .unwrap();
        assert!(
            handle
                .path()
                .unwrap()
                .file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("tasker_stderr_")
        );
    }
}
