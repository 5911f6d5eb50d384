//! Backing Image Manager - per-image lifecycle engine.
//!
//! This crate owns the state machine of a single backing image: acquiring
//! it by pulling from a URL or receiving it from a peer, serving it to
//! other nodes, tracking transfer progress, and projecting consistent
//! status snapshots for the control plane.

pub mod image;
pub mod paths;
pub mod status;
pub mod transfer;

// Re-export common types
pub use image::{BackingImage, ImageState};
pub use status::ImageStatus;
pub use transfer::{PortAllocator, ProgressSink, RemoteFetcher, SyncService};

/// Backing image manager version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
