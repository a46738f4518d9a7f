use std::path::Path;

use async_trait::async_trait;
use tracing::debug;

use crate::contract::ArtifactCache;

/// Writes derived files straight into the local tree, next to their sources.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsArtifactCache;

#[async_trait]
impl ArtifactCache for FsArtifactCache {
    async fn write_derived(&self, path: &Path, contents: &[u8]) -> Result<(), std::io::Error> {
        tokio::fs::write(path, contents).await?;
        debug!(path = %path.display(), bytes = contents.len(), "Wrote derived artifact");
        Ok(())
    }

    async fn write_error_log(&self, path: &Path, report: &str) -> Result<(), std::io::Error> {
        tokio::fs::write(path, report).await?;
        debug!(path = %path.display(), "Wrote error log");
        Ok(())
    }
}
