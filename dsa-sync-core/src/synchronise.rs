//! Tree synchronizer: mirrors a local lab/study/sample tree onto the archive.
//!
//! The walk is depth-first over an explicit work list. Every frame carries the
//! directory to read, the remote parent its entries belong to, and whether it is
//! the root level:
//!   - Root-level subdirectories map to collections (looked up by name).
//!   - Deeper subdirectories map to folders under the current parent.
//!   - Files are uploaded once; spreadsheets are converted to JSON and the
//!     derived item is replaced on every run.
//!
//! # Error Handling
//! Only authentication failure aborts a run ([`SyncError::Authentication`]).
//! Everything else is isolated to the entry it happened on: it is logged,
//! counted in the report, and for spreadsheets written to an error sidecar
//! next to the source. Siblings and other subtrees carry on.
//!
//! # Navigation
//! - Main entrypoint: [`synchronise`]
//! - Output: [`SynchroniseReport`]

use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::contract::{
    ArtifactCache, ContainerRef, FolderMetadata, ParentType, RemoteContainer, RemoteError,
    RemoteStore, Session, SheetTransformer, TransformError,
};
use crate::ignore::{derived_name, derived_path, error_log_path, is_ignored, is_spreadsheet};

pub const STAIN_MARKER: &str = "stain";
pub const STAIN_FOLDER_TYPE: &str = "tissue_microarray_stain";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("authentication failed: {0}")]
    Authentication(#[source] RemoteError),
}

/// Failure of a single entry. Never escapes the entry's own step.
#[derive(Debug, Error)]
pub enum EntryError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Transform(#[from] TransformError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not serialize derived document: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Counts of what one run did.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SynchroniseReport {
    pub collections_created: usize,
    pub folders_created: usize,
    pub containers_reused: usize,
    pub files_uploaded: usize,
    pub files_already_present: usize,
    pub derived_uploaded: usize,
    /// Stale derived items deleted before re-upload.
    pub derived_replaced: usize,
    pub ignored: usize,
    pub failed: usize,
}

/// A filesystem entry as read during the walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalNode {
    pub path: PathBuf,
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

#[derive(Debug)]
struct Frame {
    dir: PathBuf,
    parent: ContainerRef,
    is_root: bool,
}

enum ContainerOutcome {
    Created(ParentType),
    Reused,
}

enum FileOutcome {
    Ignored,
    Uploaded,
    AlreadyPresent,
    DerivedUploaded { replaced: usize },
    Failed,
}

impl SynchroniseReport {
    fn record_container(&mut self, outcome: &ContainerOutcome) {
        match outcome {
            ContainerOutcome::Created(ParentType::Collection) => self.collections_created += 1,
            ContainerOutcome::Created(ParentType::Folder) => self.folders_created += 1,
            ContainerOutcome::Reused => self.containers_reused += 1,
        }
    }

    fn record_file(&mut self, outcome: FileOutcome) {
        match outcome {
            FileOutcome::Ignored => self.ignored += 1,
            FileOutcome::Uploaded => self.files_uploaded += 1,
            FileOutcome::AlreadyPresent => self.files_already_present += 1,
            FileOutcome::DerivedUploaded { replaced } => {
                self.derived_uploaded += 1;
                self.derived_replaced += replaced;
            }
            FileOutcome::Failed => self.failed += 1,
        }
    }
}

/// Authenticate, then mirror `config.root` onto the archive.
pub async fn synchronise<R, T, C>(
    config: &SyncConfig,
    remote: &R,
    transformer: &T,
    cache: &C,
) -> Result<SynchroniseReport, SyncError>
where
    R: RemoteStore + ?Sized,
    T: SheetTransformer + ?Sized,
    C: ArtifactCache + ?Sized,
{
    info!(root = %config.root.display(), "[SYNC] Starting synchronisation");

    let session = remote
        .authenticate(&config.credentials)
        .await
        .map_err(|e| {
            error!(error = %e, username = %config.credentials.username, "[SYNC][ERROR] Authentication failed, aborting run");
            SyncError::Authentication(e)
        })?;
    info!("[SYNC] Authenticated");

    let walker = TreeWalker {
        remote,
        transformer,
        cache,
        session: &session,
    };

    let mut report = SynchroniseReport::default();
    let mut pending = vec![Frame {
        dir: config.root.clone(),
        parent: config.root_parent(),
        is_root: true,
    }];

    while let Some(frame) = pending.pop() {
        let entries = match read_entries(&frame.dir).await {
            Ok(entries) => entries,
            Err(e) => {
                error!(dir = %frame.dir.display(), error = ?e, "[SYNC][ERROR] Failed to read directory, skipping subtree");
                report.failed += 1;
                continue;
            }
        };

        let mut children = Vec::new();
        for entry in entries {
            if entry.is_dir {
                match walker.resolve_container(&frame, &entry.name).await {
                    Ok((container, outcome)) => {
                        report.record_container(&outcome);
                        children.push(Frame {
                            dir: entry.path,
                            parent: container.as_parent(),
                            is_root: false,
                        });
                    }
                    Err(e) => {
                        error!(
                            dir = %entry.path.display(),
                            parent_id = frame.parent.id(),
                            error = %e,
                            "[SYNC][ERROR] Failed to resolve remote container, skipping subtree"
                        );
                        report.failed += 1;
                    }
                }
            } else {
                let outcome = walker.sync_file(&frame.parent, &entry).await;
                report.record_file(outcome);
            }
        }
        // Reversed so the first listed subdirectory is walked first.
        pending.extend(children.into_iter().rev());
    }

    info!(report = ?report, "[SYNC] Finished updating folders and files");
    Ok(report)
}

struct TreeWalker<'a, R: ?Sized, T: ?Sized, C: ?Sized> {
    remote: &'a R,
    transformer: &'a T,
    cache: &'a C,
    session: &'a Session,
}

impl<R, T, C> TreeWalker<'_, R, T, C>
where
    R: RemoteStore + ?Sized,
    T: SheetTransformer + ?Sized,
    C: ArtifactCache + ?Sized,
{
    /// Find or create the container `name` maps to under the frame's parent.
    async fn resolve_container(
        &self,
        frame: &Frame,
        name: &str,
    ) -> Result<(RemoteContainer, ContainerOutcome), RemoteError> {
        let found = if frame.is_root {
            self.remote.find_collections(self.session, name).await?
        } else {
            self.remote
                .find_folders(self.session, &frame.parent, name)
                .await?
        };

        if let Some(existing) = first_exact_match(found, name) {
            debug!(container = name, id = %existing.id, model_type = %existing.model_type, "[SYNC] Reusing remote container");
            return Ok((existing, ContainerOutcome::Reused));
        }

        let created = if frame.is_root {
            self.remote.create_collection(self.session, name).await?
        } else {
            self.remote
                .create_folder(self.session, &frame.parent, name)
                .await?
        };
        info!(
            container = name,
            id = %created.id,
            model_type = %created.model_type,
            parent_id = frame.parent.id(),
            "[SYNC] Created remote container"
        );
        let kind = created.model_type;
        Ok((created, ContainerOutcome::Created(kind)))
    }

    async fn sync_file(&self, parent: &ContainerRef, entry: &LocalNode) -> FileOutcome {
        if is_ignored(&entry.name) {
            debug!(path = %entry.path.display(), "[SYNC] Ignoring file");
            return FileOutcome::Ignored;
        }

        if is_spreadsheet(&entry.name) {
            match self.sync_spreadsheet(parent, entry).await {
                Ok(replaced) => {
                    debug!(file = %entry.name, "[SYNC] Uploaded JSON for spreadsheet");
                    FileOutcome::DerivedUploaded { replaced }
                }
                Err(e) => {
                    self.record_spreadsheet_failure(entry, &e).await;
                    FileOutcome::Failed
                }
            }
        } else {
            match self.sync_original(parent, entry).await {
                Ok(true) => FileOutcome::Uploaded,
                Ok(false) => FileOutcome::AlreadyPresent,
                Err(e) => {
                    error!(
                        path = %entry.path.display(),
                        parent_id = parent.id(),
                        error = %e,
                        "[SYNC][ERROR] Failed to upload file, leaving it for the next run"
                    );
                    FileOutcome::Failed
                }
            }
        }
    }

    /// Upload an original file unless an item with its name already exists.
    async fn sync_original(
        &self,
        parent: &ContainerRef,
        entry: &LocalNode,
    ) -> Result<bool, EntryError> {
        let existing = self
            .remote
            .find_items(self.session, parent, &entry.name)
            .await?;
        if existing.iter().any(|item| item.name == entry.name) {
            debug!(file = %entry.name, parent_id = parent.id(), "[SYNC] File already present");
            return Ok(false);
        }

        let uploaded = self
            .remote
            .upload_file(self.session, parent, &entry.path, &entry.name, entry.size)
            .await?;
        info!(file = %entry.name, file_id = %uploaded.id, size = entry.size, "[SYNC] Uploaded file");
        Ok(true)
    }

    /// Replace the derived JSON of a spreadsheet. Returns how many stale items were deleted.
    async fn sync_spreadsheet(
        &self,
        parent: &ContainerRef,
        entry: &LocalNode,
    ) -> Result<usize, EntryError> {
        let json_name = derived_name(&entry.name);
        let stale: Vec<_> = self
            .remote
            .find_items(self.session, parent, &json_name)
            .await?
            .into_iter()
            .filter(|item| item.name == json_name)
            .collect();
        for item in &stale {
            self.remote.delete_item(self.session, &item.id).await?;
            info!(item_id = %item.id, name = %json_name, "[SYNC] Deleted stale derived item");
        }

        let document = self.transformer.convert(&entry.path, &entry.name)?;
        let bytes = serde_json::to_vec(&document)?;

        let json_path = derived_path(&entry.path);
        self.cache.write_derived(&json_path, &bytes).await?;

        let uploaded = self
            .remote
            .upload_file(
                self.session,
                parent,
                &json_path,
                &json_name,
                bytes.len() as u64,
            )
            .await?;
        info!(file = %json_name, file_id = %uploaded.id, "[SYNC] Uploaded derived JSON");

        if json_path.to_string_lossy().contains(STAIN_MARKER) {
            self.remote
                .set_folder_metadata(self.session, parent, &stain_metadata())
                .await?;
            info!(parent_id = parent.id(), "[SYNC] Marked parent as tissue microarray stain");
        }

        Ok(stale.len())
    }

    async fn record_spreadsheet_failure(&self, entry: &LocalNode, e: &EntryError) {
        let log_path = error_log_path(&entry.path);
        let report = error_report(&entry.name, e);
        match self.cache.write_error_log(&log_path, &report).await {
            Ok(()) => error!(
                file = %entry.name,
                error = %e,
                log = %log_path.display(),
                "[SYNC][ERROR] Failed to process spreadsheet, details saved"
            ),
            Err(write_err) => error!(
                file = %entry.name,
                error = %e,
                log_error = ?write_err,
                "[SYNC][ERROR] Failed to process spreadsheet and to save error log"
            ),
        }
    }
}

/// `{type: tissue_microarray_stain}`
pub fn stain_metadata() -> FolderMetadata {
    let mut metadata = FolderMetadata::new();
    metadata.insert(
        "type".to_string(),
        serde_json::Value::String(STAIN_FOLDER_TYPE.to_string()),
    );
    metadata
}

/// Text written to a spreadsheet's error sidecar.
pub fn error_report(file_name: &str, e: &(dyn std::error::Error + 'static)) -> String {
    let mut report = format!("Failed to process file: {file_name}\nError: {e}\nStack:\n  {e:?}");
    let mut source = e.source();
    while let Some(cause) = source {
        report.push_str(&format!("\n  caused by: {cause}"));
        source = cause.source();
    }
    report.push('\n');
    report
}

fn first_exact_match(found: Vec<RemoteContainer>, name: &str) -> Option<RemoteContainer> {
    let mut exact: Vec<RemoteContainer> = found.into_iter().filter(|c| c.name == name).collect();
    if exact.len() > 1 {
        warn!(
            container = name,
            matches = exact.len(),
            "[SYNC] Several remote containers share this name, reusing the first"
        );
    }
    (!exact.is_empty()).then(|| exact.swap_remove(0))
}

async fn read_entries(dir: &Path) -> Result<Vec<LocalNode>, std::io::Error> {
    let mut entries = Vec::new();
    let mut listing = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = listing.next_entry().await? {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        let metadata = match tokio::fs::symlink_metadata(&path).await {
            Ok(link) if link.file_type().is_symlink() => match tokio::fs::metadata(&path).await {
                // Following a directory link can loop back to an ancestor.
                Ok(target) if target.is_dir() => {
                    warn!(path = %path.display(), "[SYNC] Skipping symlinked directory");
                    continue;
                }
                Ok(target) => target,
                Err(e) => {
                    warn!(path = %path.display(), error = ?e, "[SYNC] Dangling symlink, skipping");
                    continue;
                }
            },
            Ok(metadata) => metadata,
            Err(e) => {
                warn!(path = %path.display(), error = ?e, "[SYNC] Cannot stat entry, skipping");
                continue;
            }
        };
        entries.push(LocalNode {
            path,
            name,
            is_dir: metadata.is_dir(),
            size: metadata.len(),
        });
    }
    Ok(entries)
}
