//! Backing image state machine.
//!
//! One [`BackingImage`] owns the lifecycle of a single on-disk artifact:
//! acquisition by pull (from a URL) or receive (inbound from a peer),
//! fan-out by send (outbound to peers), validation, and deletion. All
//! mutable state lives behind one per-image lock; background transfer
//! tasks re-acquire it only for bookkeeping. Every observable transition
//! emits a payload-free signal on the process-wide update channel.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use bim_core::config;
use bim_core::error::{ImageError, Result};
use bim_core::event::{ImageUpdate, UpdateEmitter};

use crate::paths;
use crate::status::ImageStatus;
use crate::transfer::{PortAllocator, ProgressSink, RemoteFetcher, SyncService};

/// Lifecycle state of a backing image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageState {
    /// Created, no transfer started
    Pending,

    /// A pull or receive transfer is writing the tmp file
    Downloading,

    /// The final file is complete on disk
    Downloaded,

    /// An operation failed; retryable via pull or receive
    Failed,
}

impl std::fmt::Display for ImageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Downloading => write!(f, "downloading"),
            Self::Downloaded => write!(f, "downloaded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Mutable fields guarded by the per-image lock.
#[derive(Debug)]
struct ImageInner {
    state: ImageState,
    error_msg: String,
    size: i64,
    processed_size: i64,
    progress: i32,
    sending_reference: i32,
    sender_manager_address: String,
}

impl ImageInner {
    fn new(state: ImageState) -> Self {
        Self {
            state,
            error_msg: String::new(),
            size: 0,
            processed_size: 0,
            progress: 0,
            sending_reference: 0,
            sender_manager_address: String::new(),
        }
    }

    fn fail(&mut self, err: &ImageError) {
        self.state = ImageState::Failed;
        self.error_msg = err.to_string();
    }

    /// Reset transfer accounting for a fresh attempt.
    fn begin_transfer(&mut self, size: i64) {
        self.size = size;
        self.processed_size = 0;
        self.progress = 0;
        self.error_msg.clear();
        self.state = ImageState::Downloading;
    }
}

/// Handles of spawned transfer tasks, retained so callers and tests can
/// join them deterministically. Nothing ever cancels a task through them.
#[derive(Debug, Default)]
struct TaskHandles {
    transfer: Option<JoinHandle<()>>,
    sends: Vec<JoinHandle<()>>,
}

/// One backing image and its on-disk artifact.
///
/// Cheap to clone; clones share the same state and task registry, which is
/// how background transfer tasks keep mutating the image after the
/// synchronous portion of an operation has returned.
#[derive(Debug, Clone)]
pub struct BackingImage {
    name: String,
    url: String,
    uuid: String,
    host_directory: PathBuf,
    work_directory: PathBuf,

    inner: Arc<RwLock<ImageInner>>,
    tasks: Arc<Mutex<TaskHandles>>,
    update_emitter: Option<UpdateEmitter>,
}

impl BackingImage {
    /// Create a pending image whose work directory lives under the
    /// default process-wide work root.
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        uuid: impl Into<String>,
        disk_path_on_host: impl AsRef<Path>,
    ) -> Self {
        let name = name.into();
        let url = url.into();
        let uuid = uuid.into();
        let host_directory = paths::host_directory(disk_path_on_host.as_ref(), &name, &uuid);
        let work_directory =
            paths::work_directory(&config::default_work_directory(), &name, &uuid);

        Self {
            name,
            url,
            uuid,
            host_directory,
            work_directory,
            inner: Arc::new(RwLock::new(ImageInner::new(ImageState::Pending))),
            tasks: Arc::new(Mutex::new(TaskHandles::default())),
            update_emitter: None,
        }
    }

    /// Re-derive the work directory under a different staging root.
    pub fn with_work_root(mut self, work_root: impl AsRef<Path>) -> Self {
        self.work_directory = paths::work_directory(work_root.as_ref(), &self.name, &self.uuid);
        self
    }

    /// Reconstruct knowledge of an image already fully present on disk
    /// from a prior process run. Invalid identity or a non-positive size
    /// yields a failed image rather than a lying downloaded one.
    pub fn introduce_downloaded(
        name: impl Into<String>,
        url: impl Into<String>,
        uuid: impl Into<String>,
        disk_path_on_host: impl AsRef<Path>,
        size: i64,
    ) -> Self {
        let disk_blank = disk_path_on_host.as_ref().as_os_str().is_empty();
        let image = Self::new(name, url, uuid, disk_path_on_host);

        let inner = if image.name.is_empty() || image.uuid.is_empty() || disk_blank || size <= 0 {
            let mut inner = ImageInner::new(ImageState::Failed);
            inner.error_msg = format!(
                "invalid parameters for reintroduced image: name={:?} uuid={:?} size={}",
                image.name, image.uuid, size
            );
            inner.size = size;
            inner
        } else {
            let mut inner = ImageInner::new(ImageState::Downloaded);
            inner.size = size;
            inner.processed_size = size;
            inner.progress = 100;
            inner
        };

        Self {
            inner: Arc::new(RwLock::new(inner)),
            ..image
        }
    }

    /// Set the process-wide update channel. Called once, right after
    /// construction and before the first operation.
    pub fn set_update_channel(&mut self, emitter: UpdateEmitter) {
        self.update_emitter = Some(emitter);
    }

    /// Image name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Image UUID.
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Origin URL; empty for images acquired via receive.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Final on-host directory visible to consumers.
    pub fn host_directory(&self) -> &Path {
        &self.host_directory
    }

    /// Private staging directory holding the tmp and final files.
    pub fn work_directory(&self) -> &Path {
        &self.work_directory
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> ImageState {
        self.inner.read().await.state
    }

    /// Status snapshot without file revalidation. Use [`Self::get`] for
    /// the validating read path.
    pub async fn status(&self) -> ImageStatus {
        let inner = self.inner.read().await;
        self.status_locked(&inner)
    }

    /// Initiate acquisition by fetching from the image URL.
    ///
    /// The synchronous portion prepares the working directory, records the
    /// best-effort remote size, and launches the detached transfer task;
    /// the returned snapshot already shows the downloading state. Transfer
    /// errors surface later through `get` or the update channel.
    pub async fn pull(&self, fetcher: Arc<dyn RemoteFetcher>) -> Result<ImageStatus> {
        let mut inner = self.inner.write().await;
        if inner.state == ImageState::Downloading {
            return Err(ImageError::TransferInFlight {
                operation: "pull".to_string(),
            });
        }

        tracing::info!(
            name = %self.name,
            uuid = %self.uuid,
            url = %self.url,
            "Start pulling backing image"
        );

        if let Err(err) = self.prepare_for_transfer() {
            inner.fail(&err);
            tracing::error!(name = %self.name, error = %err, "Failed to pull backing image");
            drop(inner);
            self.emit_update();
            return Err(err);
        }

        let size = match fetcher.remote_size(&self.url).await {
            Ok(size) => size,
            Err(err) => {
                let err = ImageError::DownloadError(format!(
                    "failed to get file size before pulling: {}",
                    err
                ));
                inner.fail(&err);
                tracing::error!(name = %self.name, error = %err, "Failed to pull backing image");
                drop(inner);
                self.emit_update();
                return Err(err);
            }
        };
        if size <= 0 {
            tracing::warn!(
                name = %self.name,
                url = %self.url,
                "Cannot determine size from URL, will set size after pulling"
            );
        }
        inner.begin_transfer(size);

        let image = self.clone();
        let handle = tokio::spawn(async move {
            let tmp_path = paths::tmp_path(&image.work_directory);
            let sink: Arc<dyn ProgressSink> = Arc::new(image.clone());
            match fetcher
                .download_to_file(&image.url, &tmp_path, sink)
                .await
            {
                Ok(written) => image.finalize_transfer(written).await,
                Err(err) => {
                    tracing::error!(
                        name = %image.name,
                        error = %err,
                        "Failed to pull from remote"
                    );
                    image.record_failure(&err).await;
                }
            }
            image.emit_update();
        });
        self.tasks.lock().transfer = Some(handle);

        tracing::info!(name = %self.name, "Pulling backing image");

        let status = self.status_locked(&inner);
        drop(inner);
        self.emit_update();
        Ok(status)
    }

    /// Initiate acquisition by running a transient server that awaits an
    /// inbound stream from `sender_manager_address`.
    ///
    /// Returns the leased port for the peer to connect to. Port lease
    /// exhaustion is a precondition failure: the prior state is retained
    /// and no port leaks.
    pub async fn receive(
        &self,
        size: i64,
        sender_manager_address: &str,
        ports: Arc<dyn PortAllocator>,
        sync: Arc<dyn SyncService>,
    ) -> Result<i32> {
        let mut inner = self.inner.write().await;
        if inner.state == ImageState::Downloading {
            return Err(ImageError::TransferInFlight {
                operation: "receive".to_string(),
            });
        }

        inner.sender_manager_address = sender_manager_address.to_string();
        tracing::info!(
            name = %self.name,
            uuid = %self.uuid,
            sender = %sender_manager_address,
            "Start receiving backing image"
        );

        if let Err(err) = self.prepare_for_transfer() {
            inner.fail(&err);
            tracing::error!(name = %self.name, error = %err, "Failed to receive backing image");
            drop(inner);
            self.emit_update();
            return Err(err);
        }

        let (port, _) = match ports.allocate(1).await {
            Ok(range) => range,
            Err(err) => {
                drop(inner);
                self.emit_update();
                return Err(ImageError::PortError(format!(
                    "failed to lease a port for backing image receiving: {}",
                    err
                )));
            }
        };

        inner.begin_transfer(size);

        let image = self.clone();
        let sender = sender_manager_address.to_string();
        let handle = tokio::spawn(async move {
            tracing::info!(
                name = %image.name,
                port,
                "Prepare to receive backing image"
            );

            let tmp_path = paths::tmp_path(&image.work_directory);
            let sink: Arc<dyn ProgressSink> = Arc::new(image.clone());
            match sync.serve_inbound(port, &tmp_path, sink).await {
                // A closed server means the sender finished and shut the
                // stream down; the transfer itself decides success.
                Ok(()) | Err(ImageError::SyncServerClosed) => {
                    image.finalize_transfer(size).await;
                }
                Err(err) => {
                    tracing::error!(
                        name = %image.name,
                        sender = %sender,
                        error = %err,
                        "Failed to receive backing image"
                    );
                    image.record_failure(&err).await;
                }
            }
            image.emit_update();
            if let Err(err) = ports.release(port, port + 1).await {
                tracing::error!(
                    name = %image.name,
                    port,
                    error = %err,
                    "Failed to release port after receiving backing image"
                );
            }
        });
        self.tasks.lock().transfer = Some(handle);

        drop(inner);
        self.emit_update();
        Ok(port)
    }

    /// Serve this downloaded image outbound to a peer.
    ///
    /// A failed send never moves the image out of the downloaded state;
    /// the local copy remains intact, so only the reference count and the
    /// leased port are affected.
    pub async fn send(
        &self,
        address: &str,
        ports: Arc<dyn PortAllocator>,
        sync: Arc<dyn SyncService>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;

        if inner.state != ImageState::Downloaded {
            return Err(ImageError::InvalidState {
                operation: "send".to_string(),
                state: inner.state.to_string(),
            });
        }
        if let Err(err) = self.validate_files(&inner) {
            inner.fail(&err);
            tracing::error!(
                name = %self.name,
                error = %err,
                "Failed to validate files before sending"
            );
            drop(inner);
            self.emit_update();
            return Err(err);
        }
        if inner.sending_reference >= config::SENDING_LIMIT {
            return Err(ImageError::SendingLimitReached {
                name: self.name.clone(),
                limit: config::SENDING_LIMIT,
            });
        }

        let (port, _) = match ports.allocate(1).await {
            Ok(range) => range,
            Err(err) => {
                return Err(ImageError::PortError(format!(
                    "failed to lease a port for backing image sending: {}",
                    err
                )));
            }
        };

        inner.sending_reference += 1;
        drop(inner);

        let image = self.clone();
        let address = address.to_string();
        let handle = tokio::spawn(async move {
            tracing::info!(
                name = %image.name,
                peer = %address,
                "Start sending backing image"
            );

            let source = paths::image_path(&image.work_directory);
            match sync
                .stream_to_peer(&source, &address, config::FILE_SYNC_TIMEOUT)
                .await
            {
                Ok(()) => {
                    tracing::info!(
                        name = %image.name,
                        peer = %address,
                        "Done sending backing image"
                    );
                }
                Err(err) => {
                    tracing::error!(
                        name = %image.name,
                        peer = %address,
                        error = %err,
                        "Failed to send backing image"
                    );
                }
            }

            let mut inner = image.inner.write().await;
            inner.sending_reference -= 1;
            drop(inner);
            image.emit_update();
            if let Err(err) = ports.release(port, port + 1).await {
                tracing::error!(
                    name = %image.name,
                    port,
                    error = %err,
                    "Failed to release port after sending backing image"
                );
            }
        });
        self.tasks.lock().sends.push(handle);

        Ok(())
    }

    /// Validating read path: cross-checks on-disk files against the
    /// recorded state before projecting a snapshot, failing the image on
    /// any divergence.
    pub async fn get(&self) -> Result<ImageStatus> {
        let mut inner = self.inner.write().await;

        if let Err(err) = self.validate_files(&inner) {
            inner.fail(&err);
            tracing::error!(
                name = %self.name,
                error = %err,
                "Failed to validate files when getting backing image"
            );
            drop(inner);
            self.emit_update();
            return Err(err);
        }

        if inner.state == ImageState::Downloaded && inner.size <= 0 {
            let err = ImageError::InvalidSize { size: inner.size };
            inner.fail(&err);
            tracing::error!(
                name = %self.name,
                error = %err,
                "Failed to validate size when getting backing image"
            );
            drop(inner);
            self.emit_update();
            return Err(err);
        }

        Ok(self.status_locked(&inner))
    }

    /// Remove the working directory tree. A directory already gone is not
    /// an error; the recorded state is left untouched on success.
    pub async fn delete(&self) -> Result<()> {
        let mut inner = self.inner.write().await;

        tracing::info!(name = %self.name, uuid = %self.uuid, "Start cleaning up backing image");

        match std::fs::remove_dir_all(&self.work_directory) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                let err = ImageError::FileError(format!(
                    "failed to clean up work directory {} when deleting the backing image: {}",
                    self.work_directory.display(),
                    e
                ));
                inner.fail(&err);
                tracing::error!(name = %self.name, error = %err, "Failed to do cleanup");
                drop(inner);
                self.emit_update();
                return Err(err);
            }
        }

        tracing::info!(name = %self.name, "Cleanup succeeded");
        Ok(())
    }

    /// Wait for the in-flight pull or receive task to finish.
    pub async fn wait_for_transfer(&self) {
        let handle = self.tasks.lock().transfer.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Wait for all launched send tasks to finish.
    pub async fn wait_for_sends(&self) {
        let handles = std::mem::take(&mut self.tasks.lock().sends);
        for handle in handles {
            let _ = handle.await;
        }
    }

    fn emit_update(&self) {
        if let Some(emitter) = &self.update_emitter {
            emitter.emit(ImageUpdate::new(&self.name, &self.uuid));
        }
    }

    async fn record_failure(&self, err: &ImageError) {
        let mut inner = self.inner.write().await;
        inner.fail(err);
    }

    fn status_locked(&self, inner: &ImageInner) -> ImageStatus {
        ImageStatus {
            name: self.name.clone(),
            url: self.url.clone(),
            uuid: self.uuid.clone(),
            size: inner.size,
            directory: self.host_directory.display().to_string(),
            state: inner.state,
            sending_reference: inner.sending_reference,
            error_msg: inner.error_msg.clone(),
            sender_manager_address: inner.sender_manager_address.clone(),
            download_progress: inner.progress,
        }
    }

    /// Prepare the working directory for a fresh transfer, reusing a
    /// previously completed file as the new tmp file when possible.
    ///
    /// Best-effort recovery: when the completed file cannot be renamed
    /// back to the tmp name it is deleted so the transfer starts from a
    /// clean slate. The tmp file always exists on return, since the
    /// downloading state is entered before the first byte arrives.
    fn prepare_for_transfer(&self) -> Result<()> {
        let tmp_path = paths::tmp_path(&self.work_directory);
        let image_path = paths::image_path(&self.work_directory);

        if !self.work_directory.exists() {
            std::fs::create_dir_all(&self.work_directory).map_err(|e| {
                ImageError::FileError(format!(
                    "failed to create work directory {} before transfer: {}",
                    self.work_directory.display(),
                    e
                ))
            })?;
        } else if image_path.exists() {
            if tmp_path.exists() {
                std::fs::remove_file(&tmp_path).map_err(|e| {
                    ImageError::FileError(format!(
                        "failed to delete stale tmp file {} before reusing file {}: {}",
                        tmp_path.display(),
                        image_path.display(),
                        e
                    ))
                })?;
            }
            if let Err(e) = std::fs::rename(&image_path, &tmp_path) {
                tracing::warn!(
                    name = %self.name,
                    error = %e,
                    "Failed to rename existing image file to tmp for reuse, will fall back to deleting it"
                );
                std::fs::remove_file(&image_path).map_err(|e| {
                    ImageError::FileError(format!(
                        "failed to delete image file {} before transfer: {}",
                        image_path.display(),
                        e
                    ))
                })?;
            }
        }

        if !tmp_path.exists() {
            std::fs::File::create(&tmp_path).map_err(|e| {
                ImageError::FileError(format!(
                    "failed to create tmp file {} before transfer: {}",
                    tmp_path.display(),
                    e
                ))
            })?;
        }

        Ok(())
    }

    /// State-dependent existence check of the two well-known files.
    fn validate_files(&self, inner: &ImageInner) -> Result<()> {
        match inner.state {
            ImageState::Downloading => {
                let tmp_path = paths::tmp_path(&self.work_directory);
                if !tmp_path.exists() {
                    return Err(ImageError::FileError(format!(
                        "missing tmp file {} for downloading backing image",
                        tmp_path.display()
                    )));
                }
                Ok(())
            }
            ImageState::Downloaded => {
                let image_path = paths::image_path(&self.work_directory);
                if !image_path.exists() {
                    return Err(ImageError::FileError(format!(
                        "missing image file {} for downloaded backing image",
                        image_path.display()
                    )));
                }
                Ok(())
            }
            // Nothing to check for a pending or failed image; a retry
            // re-runs preparation.
            ImageState::Pending | ImageState::Failed => Ok(()),
        }
    }

    /// Promote the tmp file to its final name after a transfer reports
    /// completion with `written` bytes.
    async fn finalize_transfer(&self, written: i64) {
        let mut inner = self.inner.write().await;

        if inner.state == ImageState::Failed {
            // A racing validation failure or deletion won the lock first.
            tracing::warn!(
                name = %self.name,
                "State became failed after transfer, will not rename the image file"
            );
            return;
        }

        if inner.processed_size != written {
            let err = ImageError::SizeMismatch {
                processed: inner.processed_size,
                written,
            };
            inner.fail(&err);
            tracing::error!(name = %self.name, error = %err, "Failed to finalize backing image");
            return;
        }

        let tmp_path = paths::tmp_path(&self.work_directory);
        let image_path = paths::image_path(&self.work_directory);
        if let Err(e) = std::fs::rename(&tmp_path, &image_path) {
            let err = ImageError::FileError(format!(
                "failed to rename backing image file after transfer: {}",
                e
            ));
            inner.fail(&err);
            tracing::error!(name = %self.name, error = %err, "Failed to finalize backing image");
            return;
        }

        inner.state = ImageState::Downloaded;
        inner.size = written;
        inner.progress = 100;
        tracing::info!(name = %self.name, size = written, "Downloaded backing image file");
    }
}

#[async_trait]
impl ProgressSink for BackingImage {
    /// The only place processed bytes are accumulated during an active
    /// transfer; invoked by the collaborators once per chunk.
    async fn update_progress(&self, delta: i64) {
        let mut inner = self.inner.write().await;

        if inner.state == ImageState::Pending {
            inner.state = ImageState::Downloading;
        }

        inner.processed_size += delta;
        if inner.size > 0 {
            inner.progress = ((inner.processed_size as f64 / inner.size as f64) * 100.0) as i32;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_image(tmp: &TempDir) -> BackingImage {
        BackingImage::new("img1", "http://x/y", "u1", "/disk0").with_work_root(tmp.path())
    }

    async fn force_state(image: &BackingImage, state: ImageState) {
        image.inner.write().await.state = state;
    }

    #[test]
    fn test_new_derives_paths() {
        let image = BackingImage::new("img1", "http://x/y", "u1", "/disk0");
        assert_eq!(
            image.host_directory(),
            Path::new("/disk0/backing-images/img1-u1")
        );
        assert_eq!(
            image.work_directory(),
            Path::new("/var/lib/backing-image-manager/img1-u1")
        );
        assert_eq!(image.name(), "img1");
        assert_eq!(image.uuid(), "u1");
        assert_eq!(image.url(), "http://x/y");
    }

    #[tokio::test]
    async fn test_new_starts_pending() {
        let tmp = TempDir::new().unwrap();
        let image = test_image(&tmp);
        assert_eq!(image.state().await, ImageState::Pending);

        let status = image.status().await;
        assert_eq!(status.state, ImageState::Pending);
        assert_eq!(status.size, 0);
        assert_eq!(status.download_progress, 0);
        assert_eq!(status.sending_reference, 0);
        assert!(status.error_msg.is_empty());
    }

    #[tokio::test]
    async fn test_introduce_downloaded_valid() {
        let image = BackingImage::introduce_downloaded("img1", "http://x/y", "u1", "/disk0", 2048);
        assert_eq!(image.state().await, ImageState::Downloaded);

        let status = image.status().await;
        assert_eq!(status.size, 2048);
        assert_eq!(status.download_progress, 100);
        assert!(status.error_msg.is_empty());
    }

    #[tokio::test]
    async fn test_introduce_downloaded_invalid_size() {
        let image = BackingImage::introduce_downloaded("img1", "http://x/y", "u1", "/disk0", 0);
        assert_eq!(image.state().await, ImageState::Failed);
        assert!(!image.status().await.error_msg.is_empty());
    }

    #[tokio::test]
    async fn test_introduce_downloaded_blank_identity() {
        let image = BackingImage::introduce_downloaded("", "http://x/y", "u1", "/disk0", 2048);
        assert_eq!(image.state().await, ImageState::Failed);
        assert!(!image.status().await.error_msg.is_empty());
    }

    #[tokio::test]
    async fn test_prepare_creates_work_dir_and_tmp() {
        let tmp = TempDir::new().unwrap();
        let image = test_image(&tmp);

        image.prepare_for_transfer().unwrap();
        assert!(image.work_directory().exists());
        assert!(paths::tmp_path(image.work_directory()).exists());
        assert!(!paths::image_path(image.work_directory()).exists());
    }

    #[tokio::test]
    async fn test_prepare_reuses_final_file_as_tmp() {
        let tmp = TempDir::new().unwrap();
        let image = test_image(&tmp);
        std::fs::create_dir_all(image.work_directory()).unwrap();
        std::fs::write(paths::image_path(image.work_directory()), b"complete").unwrap();
        std::fs::write(paths::tmp_path(image.work_directory()), b"stale").unwrap();

        image.prepare_for_transfer().unwrap();

        // The stale tmp was discarded and the final file renamed over it.
        let tmp_path = paths::tmp_path(image.work_directory());
        assert_eq!(std::fs::read(&tmp_path).unwrap(), b"complete");
        assert!(!paths::image_path(image.work_directory()).exists());
    }

    #[tokio::test]
    async fn test_prepare_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let image = test_image(&tmp);
        image.prepare_for_transfer().unwrap();
        image.prepare_for_transfer().unwrap();
        assert!(paths::tmp_path(image.work_directory()).exists());
    }

    #[tokio::test]
    async fn test_validate_files_per_state() {
        let tmp = TempDir::new().unwrap();
        let image = test_image(&tmp);

        // Pending and failed require nothing.
        for state in [ImageState::Pending, ImageState::Failed] {
            force_state(&image, state).await;
            let inner = image.inner.read().await;
            assert!(image.validate_files(&inner).is_ok());
        }

        // Downloading requires the tmp file.
        force_state(&image, ImageState::Downloading).await;
        {
            let inner = image.inner.read().await;
            assert!(image.validate_files(&inner).is_err());
        }
        image.prepare_for_transfer().unwrap();
        {
            let inner = image.inner.read().await;
            assert!(image.validate_files(&inner).is_ok());
        }

        // Downloaded requires the final file.
        force_state(&image, ImageState::Downloaded).await;
        {
            let inner = image.inner.read().await;
            assert!(image.validate_files(&inner).is_err());
        }
        std::fs::rename(
            paths::tmp_path(image.work_directory()),
            paths::image_path(image.work_directory()),
        )
        .unwrap();
        {
            let inner = image.inner.read().await;
            assert!(image.validate_files(&inner).is_ok());
        }
    }

    #[tokio::test]
    async fn test_update_progress_transitions_and_accumulates() {
        let tmp = TempDir::new().unwrap();
        let image = test_image(&tmp);
        image.inner.write().await.size = 1000;

        image.update_progress(250).await;
        assert_eq!(image.state().await, ImageState::Downloading);
        let status = image.status().await;
        assert_eq!(status.download_progress, 25);

        image.update_progress(250).await;
        image.update_progress(500).await;
        let status = image.status().await;
        assert_eq!(status.download_progress, 100);
    }

    #[tokio::test]
    async fn test_update_progress_truncates_percentage() {
        let tmp = TempDir::new().unwrap();
        let image = test_image(&tmp);
        image.inner.write().await.size = 3;

        image.update_progress(1).await;
        // 1/3 = 33.33..%, truncated toward zero.
        assert_eq!(image.status().await.download_progress, 33);
    }

    #[tokio::test]
    async fn test_update_progress_without_known_size() {
        let tmp = TempDir::new().unwrap();
        let image = test_image(&tmp);

        image.update_progress(4096).await;
        let status = image.status().await;
        assert_eq!(status.state, ImageState::Downloading);
        assert_eq!(status.download_progress, 0);
    }

    #[tokio::test]
    async fn test_progress_monotonic() {
        let tmp = TempDir::new().unwrap();
        let image = test_image(&tmp);
        image.inner.write().await.size = 100;

        let mut last = 0;
        for _ in 0..10 {
            image.update_progress(10).await;
            let processed = image.inner.read().await.processed_size;
            assert!(processed >= last);
            last = processed;
            let progress = image.status().await.download_progress;
            assert!((0..=100).contains(&progress));
        }
    }

    #[tokio::test]
    async fn test_finalize_success() {
        let tmp = TempDir::new().unwrap();
        let image = test_image(&tmp);
        image.prepare_for_transfer().unwrap();
        std::fs::write(paths::tmp_path(image.work_directory()), vec![7u8; 1024]).unwrap();

        image.inner.write().await.size = 1024;
        image.update_progress(1024).await;
        image.finalize_transfer(1024).await;

        let status = image.status().await;
        assert_eq!(status.state, ImageState::Downloaded);
        assert_eq!(status.size, 1024);
        assert_eq!(status.download_progress, 100);
        assert!(paths::image_path(image.work_directory()).exists());
        assert!(!paths::tmp_path(image.work_directory()).exists());
    }

    #[tokio::test]
    async fn test_finalize_size_mismatch() {
        let tmp = TempDir::new().unwrap();
        let image = test_image(&tmp);
        image.prepare_for_transfer().unwrap();

        image.inner.write().await.size = 1000;
        image.update_progress(900).await;
        image.finalize_transfer(1000).await;

        let status = image.status().await;
        assert_eq!(status.state, ImageState::Failed);
        assert!(status.error_msg.contains("900"));
        assert!(status.error_msg.contains("1000"));
        // The rename is never attempted on a mismatch.
        assert!(!paths::image_path(image.work_directory()).exists());
    }

    #[tokio::test]
    async fn test_finalize_aborts_when_already_failed() {
        let tmp = TempDir::new().unwrap();
        let image = test_image(&tmp);
        image.prepare_for_transfer().unwrap();

        force_state(&image, ImageState::Failed).await;
        image.finalize_transfer(0).await;

        assert_eq!(image.state().await, ImageState::Failed);
        assert!(!paths::image_path(image.work_directory()).exists());
    }

    #[tokio::test]
    async fn test_get_idempotent_on_downloaded() {
        let tmp = TempDir::new().unwrap();
        let image = BackingImage::introduce_downloaded("img1", "http://x/y", "u1", "/disk0", 2048)
            .with_work_root(tmp.path());
        std::fs::create_dir_all(image.work_directory()).unwrap();
        std::fs::write(paths::image_path(image.work_directory()), vec![0u8; 16]).unwrap();

        let first = image.get().await.unwrap();
        let second = image.get().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.state, ImageState::Downloaded);
        assert_eq!(first.size, 2048);
    }

    #[tokio::test]
    async fn test_get_fails_downloaded_without_file() {
        let tmp = TempDir::new().unwrap();
        let image = BackingImage::introduce_downloaded("img1", "http://x/y", "u1", "/disk0", 2048)
            .with_work_root(tmp.path());

        let err = image.get().await.unwrap_err();
        assert!(matches!(err, ImageError::FileError(_)));
        let status = image.status().await;
        assert_eq!(status.state, ImageState::Failed);
        assert!(!status.error_msg.is_empty());
    }

    #[tokio::test]
    async fn test_get_fails_downloaded_with_invalid_size() {
        let tmp = TempDir::new().unwrap();
        let image = BackingImage::introduce_downloaded("img1", "http://x/y", "u1", "/disk0", 2048)
            .with_work_root(tmp.path());
        std::fs::create_dir_all(image.work_directory()).unwrap();
        std::fs::write(paths::image_path(image.work_directory()), vec![0u8; 16]).unwrap();
        image.inner.write().await.size = 0;

        let err = image.get().await.unwrap_err();
        assert!(matches!(err, ImageError::InvalidSize { size: 0 }));
        assert_eq!(image.state().await, ImageState::Failed);
    }

    #[tokio::test]
    async fn test_delete_removes_work_directory() {
        let tmp = TempDir::new().unwrap();
        let image = test_image(&tmp);
        image.prepare_for_transfer().unwrap();
        assert!(image.work_directory().exists());

        image.delete().await.unwrap();
        assert!(!image.work_directory().exists());
    }

    #[tokio::test]
    async fn test_delete_missing_directory_succeeds() {
        let tmp = TempDir::new().unwrap();
        let image = test_image(&tmp);
        assert!(!image.work_directory().exists());

        image.delete().await.unwrap();
        assert_eq!(image.state().await, ImageState::Pending);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ImageState::Pending.to_string(), "pending");
        assert_eq!(ImageState::Downloading.to_string(), "downloading");
        assert_eq!(ImageState::Downloaded.to_string(), "downloaded");
        assert_eq!(ImageState::Failed.to_string(), "failed");
    }
}
