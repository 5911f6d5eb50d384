//! Path naming for backing image directories and files.
//!
//! Pure derivations from an image's identity. An image is keyed by
//! `(name, uuid)`; neither half is unique alone, so every on-disk
//! location embeds both.

use std::path::{Path, PathBuf};

use bim_core::config;

/// Directory name for one backing image: `<name>-<uuid>`.
pub fn directory_name(name: &str, uuid: &str) -> String {
    format!("{}-{}", name, uuid)
}

/// Final location visible to consumers, under a per-disk root.
pub fn host_directory(disk_path_on_host: &Path, name: &str, uuid: &str) -> PathBuf {
    disk_path_on_host
        .join(config::BACKING_IMAGE_DIRECTORY_NAME)
        .join(directory_name(name, uuid))
}

/// Private staging location under the process-wide work root.
pub fn work_directory(work_root: &Path, name: &str, uuid: &str) -> PathBuf {
    work_root.join(directory_name(name, uuid))
}

/// Path of the completed image file inside a work directory.
pub fn image_path(work_directory: &Path) -> PathBuf {
    work_directory.join(config::IMAGE_FILE_NAME)
}

/// Path of the in-progress image file inside a work directory.
pub fn tmp_path(work_directory: &Path) -> PathBuf {
    work_directory.join(config::IMAGE_TMP_FILE_NAME)
}
