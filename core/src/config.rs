//! Fleet-wide constants for backing image handling.

use std::path::PathBuf;
use std::time::Duration;

/// Name of the completed backing image file inside a work directory.
pub const IMAGE_FILE_NAME: &str = "image";

/// Name of the in-progress backing image file inside a work directory.
pub const IMAGE_TMP_FILE_NAME: &str = "image.tmp";

/// Directory under each disk root that holds backing image directories.
pub const BACKING_IMAGE_DIRECTORY_NAME: &str = "backing-images";

/// Maximum number of concurrent outbound send transfers per image.
pub const SENDING_LIMIT: i32 = 3;

/// Fixed timeout for outbound file sync transfers.
pub const FILE_SYNC_TIMEOUT: Duration = Duration::from_secs(120);

/// Default process-wide staging root for in-progress transfers.
pub const DEFAULT_WORK_DIRECTORY: &str = "/var/lib/backing-image-manager";

/// The default staging root as a path.
pub fn default_work_directory() -> PathBuf {
    PathBuf::from(DEFAULT_WORK_DIRECTORY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sending_limit_positive() {
        assert!(SENDING_LIMIT > 0);
    }

    #[test]
    fn test_default_work_directory() {
        assert_eq!(
            default_work_directory(),
            PathBuf::from("/var/lib/backing-image-manager")
        );
    }

    #[test]
    fn test_file_names_differ() {
        assert_ne!(IMAGE_FILE_NAME, IMAGE_TMP_FILE_NAME);
    }
}
