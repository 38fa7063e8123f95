//! Append-only persisted transcript of run output.
//!
//! Every record (output line or run marker) is stored as one line of a text
//! file. The file survives restarts and is replayed to new observers.

mod error;

pub use error::{TranscriptError, TranscriptResult};

use log::{debug, info, warn};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Durable, ordered log of transcript records.
///
/// An in-memory copy serves replays. Before each replay the file length is
/// compared with what this process wrote; when something else changed the
/// file the copy is reloaded, so history always matches the file on disk.
#[derive(Debug)]
pub struct TranscriptStore {
    path: PathBuf,
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    /// Lazily (re)opened append handle.
    file: Option<File>,
    entries: Vec<String>,
    /// Byte length of the file as last written or read by us.
    persisted_len: u64,
}

impl TranscriptStore {
    /// Open the transcript at `path`, loading any existing records.
    pub fn open(path: impl Into<PathBuf>) -> TranscriptResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| TranscriptError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let mut inner = Inner::default();
        load(&path, &mut inner)?;
        info!(
            "Loaded transcript {} ({} records)",
            path.display(),
            inner.entries.len()
        );

        Ok(Self {
            path,
            inner: Mutex::new(inner),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record. On success the record is in the file.
    ///
    /// Line breaks inside `entry` are replaced with spaces so one record
    /// always maps to one line.
    pub fn append(&self, entry: &str) -> TranscriptResult<()> {
        let mut inner = self.lock();
        self.refresh_if_changed(&mut inner);
        let record = sanitize(entry);

        if inner.file.is_none() {
            inner.file = Some(open_append(&self.path)?);
        }
        let file = inner.file.as_mut().ok_or_else(|| TranscriptError::Io {
            path: self.path.clone(),
            source: io::Error::other("transcript file handle missing"),
        })?;

        file.write_all(format!("{record}\n").as_bytes())
            .and_then(|_| file.flush())
            .map_err(|source| TranscriptError::Io {
                path: self.path.clone(),
                source,
            })?;

        inner.persisted_len += record.len() as u64 + 1;
        inner.entries.push(record);
        Ok(())
    }

    /// All records in append order.
    pub fn replay(&self) -> Vec<String> {
        let mut inner = self.lock();
        self.refresh_if_changed(&mut inner);
        inner.entries.clone()
    }

    /// The full transcript as newline-joined text.
    pub fn text(&self) -> String {
        let entries = self.replay();
        if entries.is_empty() {
            return String::new();
        }
        let mut text = entries.join("\n");
        text.push('\n');
        text
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every record, in memory and on disk.
    pub fn clear(&self) -> TranscriptResult<()> {
        let mut inner = self.lock();
        let file = File::create(&self.path).map_err(|source| TranscriptError::Io {
            path: self.path.clone(),
            source,
        })?;
        drop(file);

        inner.file = None;
        inner.entries.clear();
        inner.persisted_len = 0;
        info!("Cleared transcript {}", self.path.display());
        Ok(())
    }

    fn refresh_if_changed(&self, inner: &mut Inner) {
        let on_disk = match fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => {
                warn!(
                    "Cannot stat transcript {}: {}; serving cached copy",
                    self.path.display(),
                    e
                );
                return;
            }
        };
        if on_disk == inner.persisted_len {
            return;
        }

        debug!(
            "Transcript {} changed on disk ({} -> {} bytes), reloading",
            self.path.display(),
            inner.persisted_len,
            on_disk
        );
        // The append handle may point at an unlinked inode now.
        inner.file = None;
        if let Err(e) = load(&self.path, inner) {
            warn!("Failed to reload transcript: {}", e);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn load(path: &Path, inner: &mut Inner) -> TranscriptResult<()> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
        Err(source) => {
            return Err(TranscriptError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    inner.persisted_len = bytes.len() as u64;
    inner.entries = String::from_utf8_lossy(&bytes)
        .lines()
        .map(str::to_string)
        .collect();
    Ok(())
}

fn open_append(path: &Path) -> TranscriptResult<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| TranscriptError::Io {
            path: path.to_path_buf(),
            source,
        })
}

fn sanitize(entry: &str) -> String {
    entry.replace(['\r', '\n'], " ")
}
