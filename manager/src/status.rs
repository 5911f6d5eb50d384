//! Status snapshot projected from a backing image.

use serde::{Deserialize, Serialize};

use crate::image::ImageState;

/// Immutable snapshot of one backing image, in the shape the control
/// plane consumes. Built under the image lock so all fields describe the
/// same instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageStatus {
    /// Image name (human label)
    pub name: String,

    /// Origin URL for pull-based acquisition; empty when received from a peer
    pub url: String,

    /// Globally unique image identifier
    pub uuid: String,

    /// Expected size in bytes once known, 0 before that
    pub size: i64,

    /// Final on-host directory visible to consumers
    pub directory: String,

    /// Current lifecycle state
    pub state: ImageState,

    /// Number of outbound send transfers in flight
    pub sending_reference: i32,

    /// Error text, non-empty only when the state is failed
    pub error_msg: String,

    /// Peer currently streaming this image in, when acquired via receive
    pub sender_manager_address: String,

    /// Transfer progress, 0-100
    pub download_progress: i32,
}
