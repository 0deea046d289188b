//! Evidence upload pipeline.
//!
//! Walks the recordings root and the session-data directory, uploads every
//! file to the object store under timestamped destination keys, and cleans
//! up local copies that made it. Batches run sequentially per file; progress
//! is published after each file so pollers see partial state.

use crate::config::{RecordingConfig, UploadConfig};
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("object store error: {0}")]
    Store(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Destination for uploaded evidence files.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_file(&self, key: &str, path: &Path) -> Result<(), UploadError>;
}

/// S3-backed object store.
pub struct S3Store {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3Store {
    pub async fn new(cfg: &UploadConfig) -> Self {
        let base = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(cfg.region.clone()))
            .load()
            .await;

        let mut builder = aws_sdk_s3::config::Builder::from(&base);
        if let Some(endpoint) = &cfg.endpoint_url {
            builder = builder.endpoint_url(endpoint);
        }
        if cfg.force_path_style {
            builder = builder.force_path_style(true);
        }

        Self {
            client: aws_sdk_s3::Client::from_conf(builder.build()),
            bucket: cfg.bucket.clone(),
        }
    }
}

fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("mp4") => "video/mp4",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("json") => "application/json",
        Some("csv") => "text/csv",
        Some("txt") => "text/plain",
        _ => "application/octet-stream",
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put_file(&self, key: &str, path: &Path) -> Result<(), UploadError> {
        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| UploadError::Store(e.to_string()))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type_for(path))
            .body(body)
            .send()
            .await
            .map_err(|e| UploadError::Store(e.to_string()))?;

        debug!(key, "Object uploaded");
        Ok(())
    }
}

/// External session-log store that can be purged once its exported data
/// files are safely uploaded.
#[async_trait]
pub trait SessionLog: Send + Sync {
    async fn clear_all(&self) -> Result<(), UploadError>;
}

/// Session log kept as flat files in a directory; purging removes the files.
pub struct FlatFileSessionLog {
    dir: PathBuf,
}

impl FlatFileSessionLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl SessionLog for FlatFileSessionLog {
    async fn clear_all(&self) -> Result<(), UploadError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            // A missing directory means there is nothing to purge.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                tokio::fs::remove_file(entry.path()).await?;
            }
        }
        info!(dir = %self.dir.display(), "Session log cleared");
        Ok(())
    }
}

/// Category of an enumerated file, driving cleanup policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileCategory {
    Clip,
    Video,
    SessionData,
    Other,
}

impl FileCategory {
    /// Session-data exports are never deleted locally; their store of record
    /// is purged through the session log instead.
    pub fn deletable(self) -> bool {
        !matches!(self, FileCategory::SessionData)
    }
}

/// One file scheduled for upload.
#[derive(Debug, Clone, Serialize)]
pub struct UploadFile {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub category: FileCategory,
    /// Destination key, fixed at enumeration time.
    pub key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    InProgress,
    Cleaning,
    Completed,
}

/// Terminal outcome for one file in a batch.
#[derive(Debug, Clone, Serialize)]
pub struct FileResult {
    pub name: String,
    pub key: String,
    pub success: bool,
    pub error: Option<String>,
}

/// Progress snapshot of an upload batch. Published after every file so it is
/// always internally consistent when polled.
#[derive(Debug, Clone, Serialize)]
pub struct UploadBatch {
    pub batch_id: String,
    pub bucket: String,
    pub status: BatchStatus,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub total_bytes: u64,
    pub uploaded_bytes: u64,
    pub cleaned_files: usize,
    pub cleaned_bytes: u64,
    pub purged_log: bool,
    pub purge_failed: bool,
    pub files: Vec<FileResult>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<f64>,
    pub error: Option<String>,
}

impl UploadBatch {
    fn new(batch_id: &str, bucket: &str, total: usize, total_bytes: u64) -> Self {
        Self {
            batch_id: batch_id.to_string(),
            bucket: bucket.to_string(),
            status: BatchStatus::InProgress,
            total,
            completed: 0,
            failed: 0,
            total_bytes,
            uploaded_bytes: 0,
            cleaned_files: 0,
            cleaned_bytes: 0,
            purged_log: false,
            purge_failed: false,
            files: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
            duration_secs: None,
            error: None,
        }
    }

    pub fn success(&self) -> bool {
        self.failed == 0
    }

    fn finish(&mut self) {
        self.status = BatchStatus::Completed;
        let finished = Utc::now();
        self.duration_secs = Some(
            (finished - self.started_at)
                .to_std()
                .unwrap_or_default()
                .as_secs_f64(),
        );
        self.finished_at = Some(finished);
    }
}

/// Enumerates, uploads and cleans up evidence files. Batch state is kept in
/// memory for the lifetime of the process.
pub struct UploadPipeline {
    recordings_root: PathBuf,
    data_dir: PathBuf,
    video_ext: String,
    clip_ext: String,
    bucket: String,
    store: Arc<dyn ObjectStore>,
    log: Arc<dyn SessionLog>,
    batches: RwLock<HashMap<String, UploadBatch>>,
}

impl UploadPipeline {
    pub fn new(
        recording: &RecordingConfig,
        upload: &UploadConfig,
        store: Arc<dyn ObjectStore>,
        log: Arc<dyn SessionLog>,
    ) -> Self {
        Self {
            recordings_root: recording.root_path(),
            data_dir: upload.session_data_path(),
            video_ext: recording.video_ext.clone(),
            clip_ext: recording.clip_ext.clone(),
            bucket: upload.bucket.clone(),
            store,
            log,
            batches: RwLock::new(HashMap::new()),
        }
    }

    /// Enumerate everything eligible for upload. All files in one batch
    /// share a single timestamp so the batch lands under one key prefix.
    pub async fn enumerate(&self) -> Result<Vec<UploadFile>, UploadError> {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S%3f").to_string();
        let mut files = Vec::new();

        // Recordings live one directory per session under the root.
        match tokio::fs::read_dir(&self.recordings_root).await {
            Ok(mut sessions) => {
                while let Some(session) = sessions.next_entry().await? {
                    if !session.file_type().await?.is_dir() {
                        continue;
                    }
                    let session_dir = session.file_name().to_string_lossy().into_owned();
                    let mut entries = tokio::fs::read_dir(session.path()).await?;
                    while let Some(entry) = entries.next_entry().await? {
                        if !entry.file_type().await?.is_file() {
                            continue;
                        }
                        let name = entry.file_name().to_string_lossy().into_owned();
                        let category = self.classify_recording(&name);
                        files.push(UploadFile {
                            key: format!("recordings/{stamp}/{session_dir}/{name}"),
                            size: entry.metadata().await?.len(),
                            path: entry.path(),
                            name,
                            category,
                        });
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(root = %self.recordings_root.display(), "No recordings directory");
            }
            Err(e) => return Err(e.into()),
        }

        // Session-data exports are a flat directory.
        match tokio::fs::read_dir(&self.data_dir).await {
            Ok(mut entries) => {
                while let Some(entry) = entries.next_entry().await? {
                    if !entry.file_type().await?.is_file() {
                        continue;
                    }
                    let name = entry.file_name().to_string_lossy().into_owned();
                    files.push(UploadFile {
                        key: format!("session_data/{stamp}/{name}"),
                        size: entry.metadata().await?.len(),
                        path: entry.path(),
                        name,
                        category: FileCategory::SessionData,
                    });
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(dir = %self.data_dir.display(), "No session-data directory");
            }
            Err(e) => return Err(e.into()),
        }

        Ok(files)
    }

    fn classify_recording(&self, name: &str) -> FileCategory {
        match Path::new(name).extension().and_then(|e| e.to_str()) {
            Some(ext) if ext == self.video_ext => FileCategory::Video,
            Some(ext) if ext == self.clip_ext => FileCategory::Clip,
            _ => FileCategory::Other,
        }
    }

    /// Run a full upload batch: enumerate, upload sequentially, optionally
    /// clean up local copies, and purge the session log once its exports are
    /// safely stored.
    ///
    /// Individual file failures never abort the batch.
    pub async fn upload_all(&self, batch_id: &str, cleanup: bool) -> UploadBatch {
        let files = match self.enumerate().await {
            Ok(files) => files,
            Err(e) => {
                error!(batch_id, error = %e, "Enumeration failed");
                let mut batch = UploadBatch::new(batch_id, &self.bucket, 0, 0);
                batch.error = Some(e.to_string());
                batch.finish();
                self.publish(batch.clone());
                return batch;
            }
        };

        let total_bytes = files.iter().map(|f| f.size).sum();
        let mut batch = UploadBatch::new(batch_id, &self.bucket, files.len(), total_bytes);

        if files.is_empty() {
            info!(batch_id, "Nothing to upload");
            batch.finish();
            self.publish(batch.clone());
            return batch;
        }

        info!(
            batch_id,
            files = batch.total,
            bytes = batch.total_bytes,
            bucket = %self.bucket,
            cleanup,
            "Upload batch started"
        );
        self.publish(batch.clone());

        let mut succeeded: Vec<&UploadFile> = Vec::new();
        let mut data_uploaded = false;
        for file in &files {
            match self.store.put_file(&file.key, &file.path).await {
                Ok(()) => {
                    batch.completed += 1;
                    batch.uploaded_bytes += file.size;
                    batch.files.push(FileResult {
                        name: file.name.clone(),
                        key: file.key.clone(),
                        success: true,
                        error: None,
                    });
                    if file.category == FileCategory::SessionData {
                        data_uploaded = true;
                    }
                    succeeded.push(file);
                    metrics::counter!("recorder_files_uploaded_total").increment(1);
                    metrics::counter!("recorder_bytes_uploaded_total").increment(file.size);
                }
                Err(e) => {
                    warn!(batch_id, file = %file.name, error = %e, "File upload failed");
                    batch.failed += 1;
                    batch.files.push(FileResult {
                        name: file.name.clone(),
                        key: file.key.clone(),
                        success: false,
                        error: Some(e.to_string()),
                    });
                    metrics::counter!("recorder_files_failed_total").increment(1);
                }
            }
            self.publish(batch.clone());
        }

        if cleanup && batch.completed > 0 {
            batch.status = BatchStatus::Cleaning;
            self.publish(batch.clone());
            for file in succeeded.iter().filter(|f| f.category.deletable()) {
                match tokio::fs::remove_file(&file.path).await {
                    Ok(()) => {
                        batch.cleaned_files += 1;
                        batch.cleaned_bytes += file.size;
                    }
                    Err(e) => {
                        warn!(file = %file.path.display(), error = %e, "Cleanup failed")
                    }
                }
            }
            self.prune_empty_session_dirs().await;
        }

        // The session log is the store of record for the data exports; only
        // purge once at least one export is confirmed uploaded. This happens
        // regardless of the cleanup flag.
        if data_uploaded {
            match self.log.clear_all().await {
                Ok(()) => batch.purged_log = true,
                Err(e) => {
                    error!(batch_id, error = %e, "Session log purge failed");
                    batch.purge_failed = true;
                }
            }
        }

        batch.finish();
        info!(
            batch_id,
            completed = batch.completed,
            failed = batch.failed,
            cleaned = batch.cleaned_files,
            purged = batch.purged_log,
            "Upload batch finished"
        );
        self.publish(batch.clone());
        batch
    }

    async fn prune_empty_session_dirs(&self) {
        let Ok(mut sessions) = tokio::fs::read_dir(&self.recordings_root).await else {
            return;
        };
        while let Ok(Some(session)) = sessions.next_entry().await {
            // remove_dir refuses non-empty directories, which is exactly the
            // guard needed here.
            if tokio::fs::remove_dir(session.path()).await.is_ok() {
                debug!(dir = %session.path().display(), "Empty session directory removed");
            }
        }
    }

    fn publish(&self, batch: UploadBatch) {
        self.batches.write().insert(batch.batch_id.clone(), batch);
    }

    /// Latest published snapshot for a batch, if it exists.
    pub fn get_progress(&self, batch_id: &str) -> Option<UploadBatch> {
        self.batches.read().get(batch_id).cloned()
    }
}
