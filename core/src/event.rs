//! State-change notifications.
//!
//! Every observable state transition of a backing image emits an
//! [`ImageUpdate`] into one process-wide channel. The signal carries only
//! the image identity, never the changed state itself; subscribers are
//! expected to re-read current status through `get` so a stale payload can
//! never race a newer transition.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Identity of the image whose externally-visible status may have changed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUpdate {
    /// Image name (human label)
    pub name: String,

    /// Globally unique image identifier
    pub uuid: String,

    /// Timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl ImageUpdate {
    /// Create a new update signal for the given image identity.
    pub fn new(name: impl Into<String>, uuid: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uuid: uuid.into(),
            timestamp: chrono::Utc::now(),
        }
    }
}

/// Receiving half of the update channel, consumed by the registry.
pub type UpdateReceiver = mpsc::UnboundedReceiver<ImageUpdate>;

/// Update emitter handed to every image at construction time.
#[derive(Debug, Clone)]
pub struct UpdateEmitter {
    sender: mpsc::UnboundedSender<ImageUpdate>,
}

impl UpdateEmitter {
    /// Create an emitter together with its receiving half.
    pub fn channel() -> (Self, UpdateReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    /// Emit an update signal. A closed receiver is not an error.
    pub fn emit(&self, update: ImageUpdate) {
        let _ = self.sender.send(update);
    }
}
