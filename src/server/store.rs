use bytes::Bytes;
use chrono::Utc;
use std::{
    fs,
    fs::OpenOptions,
    io,
    io::Write,
    path::{Component, Path, PathBuf},
};
use thiserror::Error;

use crate::common::{
    data::{upload_error, CapturedRequest, Identifier, StoredFile, Upload},
    util::{random_hex, sanitize_file_name},
};

use crate::server::store::Error::{CorruptRecord, NotFound, PathEscape, ReadFailed, StorageWriteFailed};

const UPLOADS_DIR: &str = "uploads";

#[derive(Error, Debug)]
pub enum Error {
    #[error("cannot write to storage: {0}")]
    StorageWriteFailed(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("cannot parse record {0}: {1}")]
    CorruptRecord(String, String),
    #[error("path escapes its storage directory: {0}")]
    PathEscape(String),
    #[error("cannot read from storage: {0}")]
    ReadFailed(String),
}

/// Persists and enumerates captured requests and their uploaded files. Records are
/// append-only: once written they are never modified.
pub trait RecordStore {
    /// Writes the uploads and the record, returning the generated record file name.
    fn put(
        &self,
        id: &Identifier,
        record: CapturedRequest,
        uploads: Vec<Upload>,
    ) -> Result<String, Error>;

    /// Returns all record file names of an identifier, newest first.
    fn list(&self, id: &Identifier) -> Result<Vec<String>, Error>;

    /// Resolves a caller supplied record file name to a location inside the record directory.
    fn resolve(&self, id: &Identifier, file_name: &str) -> Result<PathBuf, Error>;

    /// Resolves a stored upload name to a location inside the uploads directory.
    fn resolve_upload(&self, id: &Identifier, stored_name: &str) -> Result<PathBuf, Error>;

    fn read_upload(&self, id: &Identifier, stored_name: &str) -> Result<Bytes, Error>;

    fn get(&self, id: &Identifier, file_name: &str) -> Result<CapturedRequest, Error>;
}

/// A [`RecordStore`] that keeps records in `{root}/{id}/*.json` and blobs in
/// `{root}/{id}/uploads/*`.
pub struct FsRecordStore {
    root: PathBuf,
}

impl FsRecordStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_dir(&self, id: &Identifier) -> PathBuf {
        self.root.join(id.as_str())
    }

    fn uploads_dir(&self, id: &Identifier) -> PathBuf {
        self.record_dir(id).join(UPLOADS_DIR)
    }

    /// Creates the record and uploads directories. Failures are logged only, since the
    /// subsequent write reports the actual error.
    fn ensure_dirs(&self, id: &Identifier) {
        let uploads = self.uploads_dir(id);
        if let Err(err) = fs::create_dir_all(&uploads) {
            tracing::warn!(
                "cannot create storage directory '{}': {}",
                uploads.display(),
                err
            );
        }
    }

    fn store_upload(&self, id: &Identifier, upload: Upload) -> StoredFile {
        match upload {
            Upload::Failed { field, name, error } => StoredFile::Failed { field, name, error },
            Upload::Received {
                field,
                name,
                content_type,
                data,
            } => {
                let name = sanitize_file_name(&name);
                let stored_name = blob_file_name(&name);
                let path = self.uploads_dir(id).join(&stored_name);

                match write_new(&path, &data) {
                    Ok(()) => {
                        tracing::debug!("stored upload '{}' as '{}'", name, stored_name);
                        StoredFile::Saved {
                            field,
                            name,
                            path: stored_name,
                            content_type,
                            size: data.len() as u64,
                        }
                    }
                    Err(err) => {
                        tracing::warn!("cannot store upload '{}': {}", name, err);
                        StoredFile::Failed {
                            field,
                            name,
                            error: upload_error::CANT_WRITE,
                        }
                    }
                }
            }
        }
    }
}

impl RecordStore for FsRecordStore {
    fn put(
        &self,
        id: &Identifier,
        mut record: CapturedRequest,
        uploads: Vec<Upload>,
    ) -> Result<String, Error> {
        self.ensure_dirs(id);

        for upload in uploads {
            let stored = self.store_upload(id, upload);
            record.files.push(stored);
        }

        let content =
            serde_json::to_vec_pretty(&record).map_err(|err| StorageWriteFailed(err.to_string()))?;

        let file_name = record_file_name();
        let path = self.record_dir(id).join(&file_name);
        write_new(&path, &content).map_err(|err| {
            StorageWriteFailed(format!("cannot write '{}': {}", path.display(), err))
        })?;

        tracing::debug!("stored record '{}' for identifier '{}'", file_name, id);
        Ok(file_name)
    }

    fn list(&self, id: &Identifier) -> Result<Vec<String>, Error> {
        let dir = self.record_dir(id);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(ReadFailed(format!("{}: {}", dir.display(), err))),
        };

        let mut names = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|err| ReadFailed(format!("{}: {}", dir.display(), err)))?
                .path();

            if !path.is_file() || path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }

            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                names.push(name.to_string());
            }
        }

        names.sort_unstable_by(|a, b| b.cmp(a));
        Ok(names)
    }

    fn resolve(&self, id: &Identifier, file_name: &str) -> Result<PathBuf, Error> {
        resolve_within(&self.record_dir(id), file_name)
    }

    fn resolve_upload(&self, id: &Identifier, stored_name: &str) -> Result<PathBuf, Error> {
        resolve_within(&self.uploads_dir(id), stored_name)
    }

    fn read_upload(&self, id: &Identifier, stored_name: &str) -> Result<Bytes, Error> {
        let path = self.resolve_upload(id, stored_name)?;
        let content = fs::read(&path).map_err(|err| read_error(stored_name, err))?;
        Ok(Bytes::from(content))
    }

    fn get(&self, id: &Identifier, file_name: &str) -> Result<CapturedRequest, Error> {
        let path = self.resolve(id, file_name)?;
        let content = fs::read(&path).map_err(|err| read_error(file_name, err))?;
        serde_json::from_slice(&content).map_err(|err| CorruptRecord(file_name.to_string(), err.to_string()))
    }
}

/// Only accepts paths that canonicalize to a regular file strictly inside `dir`.
fn resolve_within(dir: &Path, file_name: &str) -> Result<PathBuf, Error> {
    if file_name.is_empty() {
        return Err(NotFound(file_name.to_string()));
    }

    let relative = Path::new(file_name);
    let only_normal = relative
        .components()
        .all(|c| matches!(c, Component::Normal(_)));
    if relative.is_absolute() || !only_normal {
        tracing::warn!("rejected path outside of '{}': {}", dir.display(), file_name);
        return Err(PathEscape(file_name.to_string()));
    }

    let base = dir.canonicalize().map_err(|err| read_error(file_name, err))?;
    let candidate = base
        .join(relative)
        .canonicalize()
        .map_err(|err| read_error(file_name, err))?;

    if candidate == base || !candidate.starts_with(&base) {
        tracing::warn!("rejected path outside of '{}': {}", dir.display(), file_name);
        return Err(PathEscape(file_name.to_string()));
    }

    if !candidate.is_file() {
        return Err(NotFound(file_name.to_string()));
    }

    Ok(candidate)
}

fn read_error(file_name: &str, err: io::Error) -> Error {
    match err.kind() {
        io::ErrorKind::NotFound => NotFound(file_name.to_string()),
        _ => ReadFailed(format!("{}: {}", file_name, err)),
    }
}

fn write_new(path: &Path, content: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.write_all(content)?;
    file.flush()
}

/// `YYYYMMDD_HHMMSS_<microseconds>_<random>.json` in UTC, lexicographically sortable by time.
fn record_file_name() -> String {
    let now = Utc::now();
    format!(
        "{}_{}_{}.json",
        now.format("%Y%m%d_%H%M%S"),
        now.format("%6f"),
        random_hex(2)
    )
}

fn blob_file_name(sanitized_name: &str) -> String {
    format!(
        "{}_{}_{}",
        Utc::now().format("%Y%m%d_%H%M%S"),
        random_hex(3),
        sanitized_name
    )
}
