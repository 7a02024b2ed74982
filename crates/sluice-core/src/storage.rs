//! The remote storage contract used by the unload path.

use async_trait::async_trait;

use crate::error::Error;

/// Fetches objects from the remote storage a source unloads slices to.
#[async_trait]
pub trait SliceStore: Send + Sync {
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, Error>;
}
