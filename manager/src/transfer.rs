//! Contracts for the external transfer collaborators.
//!
//! The manager never moves bytes itself. Pulling from a URL, serving an
//! inbound sync stream, streaming a file to a peer, and leasing cluster
//! ports are all delegated through these traits; implementations live in
//! the surrounding daemon. Every trait is object-safe so collaborators can
//! be handed in as `Arc<dyn ..>` per operation.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bim_core::Result;

/// Sink for per-chunk progress reports during an active transfer.
///
/// Implemented by [`crate::BackingImage`]: the first reported byte moves a
/// pending image to downloading, and accumulated bytes drive the derived
/// progress percentage.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    /// Record `delta` additional bytes processed.
    async fn update_progress(&self, delta: i64);
}

/// Pull-based acquisition: fetches remote content over HTTP(S).
#[async_trait]
pub trait RemoteFetcher: Send + Sync {
    /// Best-effort size query for the remote content. A non-positive
    /// result means the size could not be determined; it is tolerated,
    /// not fatal.
    async fn remote_size(&self, url: &str) -> Result<i64>;

    /// Stream remote content to `dest`, reporting each chunk through
    /// `progress`. Returns the number of bytes written.
    async fn download_to_file(
        &self,
        url: &str,
        dest: &Path,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<i64>;
}

/// Node-to-node file sync protocol.
#[async_trait]
pub trait SyncService: Send + Sync {
    /// Run a transient server on `port` that accepts one inbound file
    /// stream into `dest`, reporting chunks through `progress`. Blocks
    /// until the transfer completes or the server is closed; a clean
    /// shutdown surfaces as [`bim_core::ImageError::SyncServerClosed`].
    async fn serve_inbound(
        &self,
        port: i32,
        dest: &Path,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<()>;

    /// Stream the file at `source` to `peer_address`, giving up after
    /// `timeout`.
    async fn stream_to_peer(
        &self,
        source: &Path,
        peer_address: &str,
        timeout: Duration,
    ) -> Result<()>;
}

/// Cluster-scoped port allocator.
///
/// Leased ports are owned exclusively by the task that leased them and
/// must be released on every exit path.
#[async_trait]
pub trait PortAllocator: Send + Sync {
    /// Lease `count` consecutive ports, returning `(start, end)`.
    async fn allocate(&self, count: i32) -> Result<(i32, i32)>;

    /// Release the leased range `[start, end)`.
    async fn release(&self, start: i32, end: i32) -> Result<()>;
}
