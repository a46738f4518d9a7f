use std::path::PathBuf;

use tracing::{debug, info};

use crate::chunked::DEFAULT_CHUNK_SIZE;
use crate::contract::{ContainerRef, Credentials};

/// Everything one synchronization run needs to know.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Local directory whose subdirectories become collections.
    pub root: PathBuf,
    /// Collection that receives files found directly in `root`.
    pub base_collection_id: String,
    pub credentials: Credentials,
}

impl SyncConfig {
    pub fn root_parent(&self) -> ContainerRef {
        ContainerRef::Collection(self.base_collection_id.clone())
    }

    pub fn trace_loaded(&self) {
        info!(
            root = %self.root.display(),
            base_collection_id = %self.base_collection_id,
            username = %self.credentials.username,
            "Loaded sync config"
        );
        debug!(?self, "Sync config loaded (full debug)");
    }
}

/// Transport tuning for the remote store client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferConfig {
    pub chunk_size: u64,
    pub request_timeout_secs: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            request_timeout_secs: 300,
        }
    }
}
