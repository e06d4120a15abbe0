//! Single-writer arbitration for shared artifacts
//!
//! Every artifact path gets exactly one appender task. Work units send whole
//! lines to it over a channel and wait for an acknowledgement, so concurrent
//! units targeting the same artifact never interleave partial lines and each
//! request lands contiguously.
//!
//! An appender lives only while some append is using it. Once the last
//! caller gets its acknowledgement the entry is dropped, the channel closes
//! and the appender exits with its file handle.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, warn};

/// Output errors
#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The appender for the artifact is gone
    #[error("artifact writer closed: {0}")]
    Closed(PathBuf),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

struct AppendRequest {
    lines: Vec<String>,
    ack: oneshot::Sender<std::io::Result<()>>,
}

struct Writer {
    tx: mpsc::Sender<AppendRequest>,
    /// Appends currently using this writer
    active: usize,
}

/// Releases a writer reference when an append finishes or is cancelled
struct WriterLease<'a> {
    arbiter: &'a ArtifactArbiter,
    path: &'a Path,
}

impl Drop for WriterLease<'_> {
    fn drop(&mut self) {
        self.arbiter.release(self.path);
    }
}

/// Serializes appends per artifact path
pub struct ArtifactArbiter {
    writers: DashMap<PathBuf, Writer>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
    channel_capacity: usize,
}

impl ArtifactArbiter {
    pub fn new() -> Self {
        Self::with_channel_capacity(64)
    }

    pub fn with_channel_capacity(capacity: usize) -> Self {
        Self {
            writers: DashMap::new(),
            handles: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            channel_capacity: capacity.max(1),
        }
    }

    /// Append `lines` to the artifact at `path`
    ///
    /// Resolves once the lines are written and flushed. Lines must not
    /// contain newlines; each is terminated with one.
    #[instrument(skip(self, lines), fields(path = %path.display(), lines = lines.len()))]
    pub async fn append(&self, path: &Path, lines: Vec<String>) -> Result<(), OutputError> {
        if lines.is_empty() {
            return Ok(());
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(OutputError::Closed(path.to_path_buf()));
        }

        let sender = {
            let mut writer = match self.writers.entry(path.to_path_buf()) {
                Entry::Occupied(entry) => entry.into_ref(),
                Entry::Vacant(entry) => {
                    let tx = self
                        .spawn_appender(path.to_path_buf())
                        .ok_or_else(|| OutputError::Closed(path.to_path_buf()))?;
                    entry.insert(Writer { tx, active: 0 })
                }
            };
            writer.active += 1;
            writer.tx.clone()
        };
        let _lease = WriterLease {
            arbiter: self,
            path,
        };

        let (ack, done) = oneshot::channel();
        if sender.send(AppendRequest { lines, ack }).await.is_err() {
            return Err(OutputError::Closed(path.to_path_buf()));
        }

        done.await
            .map_err(|_| OutputError::Closed(path.to_path_buf()))?
            .map_err(|source| OutputError::Io {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Number of artifacts with a live appender
    pub fn open_writers(&self) -> usize {
        self.writers.len()
    }

    /// Stop accepting appends and wait for every appender to drain
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.writers.clear();

        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Artifact appender panicked: {}", e);
            }
        }
        debug!("artifact arbiter closed");
    }

    /// Spawn an appender, or `None` once the arbiter is closed
    fn spawn_appender(&self, path: PathBuf) -> Option<mpsc::Sender<AppendRequest>> {
        // Checked under the lock `close` takes handles with, so no appender
        // can be spawned after the drain starts
        let mut handles = self.handles.lock();
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        handles.retain(|h| !h.is_finished());

        let (tx, rx) = mpsc::channel(self.channel_capacity);
        handles.push(tokio::spawn(run_appender(path, rx)));
        Some(tx)
    }

    fn release(&self, path: &Path) {
        let idle = match self.writers.get_mut(path) {
            Some(mut writer) => {
                writer.active = writer.active.saturating_sub(1);
                writer.active == 0
            }
            None => false,
        };
        if idle {
            // Dropping the last sender lets the appender drain and exit
            self.writers.remove_if(path, |_, w| w.active == 0);
        }
    }
}

impl Default for ArtifactArbiter {
    fn default() -> Self {
        Self::new()
    }
}

async fn open_artifact(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    OpenOptions::new().create(true).append(true).open(path).await
}

async fn write_lines(file: &mut File, lines: &[String]) -> std::io::Result<()> {
    let mut buf = Vec::with_capacity(lines.iter().map(|l| l.len() + 1).sum());
    for line in lines {
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
    }
    file.write_all(&buf).await?;
    file.flush().await
}

async fn run_appender(path: PathBuf, mut rx: mpsc::Receiver<AppendRequest>) {
    let mut file: Option<File> = None;

    while let Some(request) = rx.recv().await {
        let result: std::io::Result<()> = async {
            if file.is_none() {
                file = Some(open_artifact(&path).await?);
            }
            match file.as_mut() {
                Some(f) => write_lines(f, &request.lines).await,
                None => Ok(()),
            }
        }
        .await;

        if let Err(e) = &result {
            warn!(path = %path.display(), "Artifact append failed: {}", e);
            // Reopen on the next request
            file = None;
        }

        let _ = request.ack.send(result);
    }

    if let Some(mut f) = file {
        if let Err(e) = f.sync_all().await {
            warn!(path = %path.display(), "Artifact sync failed: {}", e);
        }
    }
    debug!(path = %path.display(), "artifact appender exited");
}
