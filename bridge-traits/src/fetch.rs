//! Block Fetching Abstraction
//!
//! Retrieval of a single encrypted block from the messaging server's asset
//! store. The transport (HTTP client, proxy, auth headers) belongs to the host.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// Fetches the raw body of one encrypted block.
///
/// Implementations are stateless from the engine's point of view: every call
/// is independent and may be issued concurrently for different assets. The
/// returned body is passed to the decryptor untouched.
///
/// # Example
///
/// ```ignore
/// use bridge_traits::fetch::BlockFetcher;
///
/// async fn first_block(fetcher: &dyn BlockFetcher, url: &str) -> Result<usize> {
///     let body = fetcher.fetch_block(url).await?;
///     Ok(body.len())
/// }
/// ```
#[async_trait]
pub trait BlockFetcher: Send + Sync {
    /// Fetch the block stored at `location`.
    ///
    /// Non-success responses must be reported as errors rather than returned
    /// as a body, so a server error page is never fed to the decryptor.
    async fn fetch_block(&self, location: &str) -> Result<Bytes>;
}
