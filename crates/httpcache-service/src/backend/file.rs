use std::fmt::Write as _;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use crate::cache_error::{CacheError, CacheResult};
use crate::types::{Priority, ResponseInfo};

use super::{
    Backend, BackendPoll, CompletionMode, DiskEntry, DoomCallback, EntryCallback, OpenedEntry,
};

/// The on-disk representation of one entry.
#[derive(Debug, Serialize, Deserialize)]
struct EntryRecord {
    key: String,
    /// Distinguishes an entry from a later one created under the same key.
    created: i64,
    #[serde(default)]
    response_info: Option<ResponseInfo>,
    #[serde(default)]
    metadata: Option<Vec<u8>>,
}

/// A backend that stores every entry as a JSON file below a cache directory.
///
/// Files are named by the sha-256 of their key: `$cache_dir/aa/aabbccdd...`.
#[derive(Debug)]
pub struct FileBackend {
    cache_dir: PathBuf,
    completion: CompletionMode,
    max_bytes: u64,
}

impl FileBackend {
    /// Opens a backend rooted at `cache_dir`, creating the directory if needed.
    pub fn open(
        cache_dir: impl Into<PathBuf>,
        max_bytes: u64,
        completion: CompletionMode,
    ) -> CacheResult<Self> {
        let cache_dir = cache_dir.into();
        fs::create_dir_all(&cache_dir)?;
        Ok(Self {
            cache_dir,
            completion,
            max_bytes,
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        let hash = Sha256::digest(key.as_bytes());
        let mut name = String::with_capacity(64);
        for b in hash.iter() {
            // writing to a `String` can not fail
            let _ = write!(name, "{b:02x}");
        }
        self.cache_dir.join(&name[..2]).join(name)
    }

    fn open_file(&self, key: &str) -> CacheResult<OpenedEntry> {
        let path = self.entry_path(key);
        let record = match read_record(&path)? {
            Some(record) if record.key == key => record,
            // either missing, or a hash collision which we treat as a miss
            _ => return Err(CacheError::NotFound),
        };
        Ok(OpenedEntry {
            entry: Box::new(FileEntry {
                path,
                record,
                doomed: false,
            }),
            opened: true,
        })
    }

    fn create_file(&self, key: &str) -> CacheResult<OpenedEntry> {
        let path = self.entry_path(key);
        if path.exists() {
            return Err(CacheError::Failed);
        }
        let record = EntryRecord {
            key: key.to_owned(),
            created: Utc::now().timestamp_nanos_opt().unwrap_or_default(),
            response_info: None,
            metadata: None,
        };
        write_record(&path, &record)?;
        Ok(OpenedEntry {
            entry: Box::new(FileEntry {
                path,
                record,
                doomed: false,
            }),
            opened: false,
        })
    }
}

fn read_record(path: &Path) -> CacheResult<Option<EntryRecord>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Atomically replaces the file at `path` with the serialized record.
fn write_record(path: &Path, record: &EntryRecord) -> CacheResult<()> {
    let dir = path.parent().ok_or(CacheError::InternalError)?;
    fs::create_dir_all(dir)?;
    let mut temp_file = NamedTempFile::new_in(dir)?;
    serde_json::to_writer(&mut temp_file, record)?;
    temp_file.flush()?;
    temp_file.persist(path).map_err(|err| err.error)?;
    Ok(())
}

impl Backend for FileBackend {
    fn open_entry(
        &mut self,
        key: &str,
        _priority: Priority,
        callback: EntryCallback,
    ) -> BackendPoll<OpenedEntry> {
        let result = self.open_file(key);
        self.completion.finish(callback, result)
    }

    fn create_entry(
        &mut self,
        key: &str,
        _priority: Priority,
        callback: EntryCallback,
    ) -> BackendPoll<OpenedEntry> {
        let result = self.create_file(key);
        self.completion.finish(callback, result)
    }

    fn open_or_create_entry(
        &mut self,
        key: &str,
        _priority: Priority,
        callback: EntryCallback,
    ) -> BackendPoll<OpenedEntry> {
        let result = match self.open_file(key) {
            Err(CacheError::NotFound) => self.create_file(key),
            result => result,
        };
        self.completion.finish(callback, result)
    }

    fn doom_entry(
        &mut self,
        key: &str,
        _priority: Priority,
        callback: DoomCallback,
    ) -> BackendPoll<()> {
        let result = match fs::remove_file(self.entry_path(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(CacheError::NotFound),
            Err(err) => Err(err.into()),
        };
        self.completion.finish(callback, result)
    }

    fn entry_count(&self) -> usize {
        let Ok(dirs) = fs::read_dir(&self.cache_dir) else {
            return 0;
        };
        dirs.filter_map(Result::ok)
            .filter_map(|dir| fs::read_dir(dir.path()).ok())
            .flat_map(|files| files.filter_map(Result::ok))
            .filter(|file| {
                // skip temp files of in-progress writes
                file.file_name().len() == 64
            })
            .count()
    }

    fn max_file_size(&self) -> u64 {
        self.max_bytes / 8
    }
}

struct FileEntry {
    path: PathBuf,
    record: EntryRecord,
    doomed: bool,
}

impl FileEntry {
    fn persist(&self) -> CacheResult<()> {
        if self.doomed {
            // a doomed entry only lives on in memory until it is closed
            return Ok(());
        }
        write_record(&self.path, &self.record)
    }
}

impl DiskEntry for FileEntry {
    fn key(&self) -> &str {
        &self.record.key
    }

    fn doom(&mut self) {
        if std::mem::replace(&mut self.doomed, true) {
            return;
        }
        // leave a newer entry that was created under the same key alone
        let is_ours = matches!(
            read_record(&self.path),
            Ok(Some(record)) if record.created == self.record.created
        );
        if is_ours {
            if let Err(err) = fs::remove_file(&self.path) {
                let dynerr: &dyn std::error::Error = &err;
                tracing::warn!(error = dynerr, key = %self.record.key, "failed to remove doomed entry");
            }
        }
    }

    fn close(self: Box<Self>) {
        tracing::trace!(key = %self.record.key, doomed = self.doomed, "closing file entry");
    }

    fn read_response_info(&self) -> CacheResult<Option<ResponseInfo>> {
        Ok(self.record.response_info.clone())
    }

    fn write_response_info(&mut self, info: &ResponseInfo) -> CacheResult<()> {
        self.record.response_info = Some(info.clone());
        self.persist()
    }

    fn read_metadata(&self) -> CacheResult<Option<Bytes>> {
        Ok(self.record.metadata.clone().map(Bytes::from))
    }

    fn write_metadata(&mut self, data: &[u8]) -> CacheResult<()> {
        self.record.metadata = Some(data.to_vec());
        self.persist()
    }
}
