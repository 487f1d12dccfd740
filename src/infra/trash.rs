//! Deferred file deletion with undo.
//!
//! [`Trash::delete`] does not touch the disk. It records the path with a
//! CRC-32 fingerprint of its contents in a bounded queue; once the queue is
//! longer than `queue_size` the oldest entries are committed. A commit
//! re-checks the fingerprint and, if the file is unchanged, enqueues the
//! actual removal on the trash's own [`ThreadSpool`].

use std::collections::VecDeque;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::{debug, info, warn};

use crate::config::SpoolConfig;
use crate::core::{AppResult, FinishOptions, ThreadSpool};

/// Default number of deletions kept undoable.
pub const DEFAULT_QUEUE_SIZE: usize = 20;
/// Name of the spool performing removals.
pub const TRASH_SPOOL_NAME: &str = "os trash";

const TRASH_SPOOL_QUOTA: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Trashed {
    path: PathBuf,
    crc: u32,
}

/// Proxy for deleting files that keeps recent deletions undoable.
///
/// Dropping a `Trash` commits everything still queued and drains the spool.
pub struct Trash {
    queue: VecDeque<Trashed>,
    queue_size: usize,
    verbose: bool,
    spool: ThreadSpool,
}

impl Trash {
    /// Trash with the default queue size.
    ///
    /// # Errors
    ///
    /// The removal spool could not be started.
    pub fn new() -> AppResult<Self> {
        Self::with_queue_size(DEFAULT_QUEUE_SIZE)
    }

    /// Trash keeping at most `queue_size` deletions undoable.
    ///
    /// # Errors
    ///
    /// The removal spool could not be started.
    pub fn with_queue_size(queue_size: usize) -> AppResult<Self> {
        let config = SpoolConfig::new()
            .with_name(TRASH_SPOOL_NAME)
            .with_quota(TRASH_SPOOL_QUOTA)
            .with_show_progress(false);
        let spool = ThreadSpool::with_config(config).context("starting trash spool")?;
        Ok(Self::with_spool(spool, queue_size))
    }

    /// Trash committing removals onto an existing spool.
    #[must_use]
    pub fn with_spool(spool: ThreadSpool, queue_size: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            queue_size,
            verbose: false,
            spool,
        }
    }

    /// Log every delete, commit and undo at info level.
    #[must_use]
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Mark `path` for deletion.
    ///
    /// Returns false, with a warning, if the path is already trashed or is
    /// not an existing file.
    ///
    /// # Errors
    ///
    /// The file could not be read to fingerprint it.
    pub fn delete(&mut self, path: impl AsRef<Path>) -> AppResult<bool> {
        let path = normalize(path.as_ref());
        if self.contains(&path) {
            warn!(path = %path.display(), "attempted to delete already trashed file");
            return Ok(false);
        }
        if !path.is_file() {
            warn!(path = %path.display(), "attempted to delete non-existent file");
            return Ok(false);
        }

        let crc = fingerprint(&path)?;
        if self.verbose {
            info!(path = %path.display(), crc, "moved to trash");
        }
        self.queue.push_back(Trashed { path, crc });
        self.enforce_queue_size()?;
        Ok(true)
    }

    /// Take back the most recent deletion, returning its path.
    pub fn undo(&mut self) -> Option<PathBuf> {
        let entry = self.queue.pop_back()?;
        if self.verbose {
            info!(path = %entry.path.display(), "restored from trash");
        }
        Some(entry.path)
    }

    /// Like [`Path::is_file`], but trashed paths report false.
    #[must_use]
    pub fn is_file(&self, path: impl AsRef<Path>) -> bool {
        let path = normalize(path.as_ref());
        !self.contains(&path) && path.is_file()
    }

    /// Paths currently held in the trash, oldest first.
    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.queue.iter().map(|t| t.path.as_path())
    }

    /// Number of deletions still undoable.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// True when nothing is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// The spool performing removals.
    #[must_use]
    pub const fn spool(&self) -> &ThreadSpool {
        &self.spool
    }

    /// Wait for every removal committed so far, keeping the trash usable.
    ///
    /// # Errors
    ///
    /// The removal spool was cancelled.
    pub fn sync(&self) -> AppResult<()> {
        self.spool
            .finish(FinishOptions::new().with_resume(true))
            .context("waiting for trash removals")
    }

    /// Commit every held deletion and wait for the removals.
    ///
    /// # Errors
    ///
    /// A file could not be fingerprinted, or the removal spool was cancelled.
    pub fn finish(mut self) -> AppResult<()> {
        self.commit_all()?;
        self.spool
            .finish(FinishOptions::new())
            .context("draining trash spool")
    }

    fn contains(&self, path: &Path) -> bool {
        self.queue.iter().any(|t| t.path == path)
    }

    fn enforce_queue_size(&mut self) -> AppResult<()> {
        while self.queue.len() > self.queue_size {
            if let Some(oldest) = self.queue.pop_front() {
                self.commit(&oldest)?;
            }
        }
        Ok(())
    }

    fn commit_all(&mut self) -> AppResult<()> {
        while let Some(entry) = self.queue.pop_front() {
            self.commit(&entry)?;
        }
        Ok(())
    }

    fn commit(&self, entry: &Trashed) -> AppResult<()> {
        let path = &entry.path;
        if !path.is_file() {
            warn!(path = %path.display(), "deleted file disappeared from disk");
            return Ok(());
        }
        if fingerprint(path)? != entry.crc {
            warn!(path = %path.display(), "file changed; not deleting");
            return Ok(());
        }

        let target = path.clone();
        self.spool
            .enqueue_labeled(format!("rm {}", path.display()), move || {
                std::fs::remove_file(&target)
            })
            .with_context(|| format!("queueing removal of {}", path.display()))?;
        if self.verbose {
            info!(path = %path.display(), crc = entry.crc, "committed to os trash");
        } else {
            debug!(path = %path.display(), "committed to os trash");
        }
        Ok(())
    }
}

impl fmt::Display for Trash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.queue.iter().map(|t| (t.path.display().to_string(), t.crc)))
            .finish()
    }
}

impl fmt::Debug for Trash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trash")
            .field("queue", &self.queue)
            .field("queue_size", &self.queue_size)
            .field("spool", &self.spool)
            .finish()
    }
}

impl Drop for Trash {
    fn drop(&mut self) {
        if let Err(e) = self.commit_all() {
            warn!(error = %format!("{e:#}"), "trash dropped with uncommitted deletions");
        }
    }
}

/// Lexically normalise a path so equivalent spellings compare equal.
fn normalize(path: &Path) -> PathBuf {
    path.components().collect()
}

/// CRC-32 of a file's contents.
fn fingerprint(path: &Path) -> AppResult<u32> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = [0_u8; 64 * 1024];
    loop {
        let n = reader
            .read(&mut buf)
            .with_context(|| format!("reading {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}
