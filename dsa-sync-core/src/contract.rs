//! # contract: Interfaces between the tree synchronizer and its collaborators
//!
//! This module defines the data model shared by every part of the sync pipeline
//! and the three seams the synchronizer talks through:
//!
//! - [`RemoteStore`]: the archive (collections, folders, items, chunked uploads).
//! - [`SheetTransformer`]: spreadsheet → JSON conversion.
//! - [`ArtifactCache`]: files the run writes back into the local tree
//!   (derived JSON, error sidecars).
//!
//! ## Mocking & Testing
//! - Every trait is annotated for `mockall`; the mocks are exported behind the
//!   `test-export-mocks` feature so integration tests and the CLI crate can use them.
//!
//! ## Sessions
//! - [`RemoteStore::authenticate`] returns a [`Session`] which is passed to every
//!   later call. Implementors hold no token of their own.

use std::path::Path;

use async_trait::async_trait;
use mockall::automock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Kind of a remote container, as reported by the archive's `_modelType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParentType {
    Collection,
    Folder,
}

impl ParentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParentType::Collection => "collection",
            ParentType::Folder => "folder",
        }
    }
}

impl std::fmt::Display for ParentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The parent under which the walk is currently creating things.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ContainerRef {
    Collection(String),
    Folder(String),
}

impl ContainerRef {
    pub fn id(&self) -> &str {
        match self {
            ContainerRef::Collection(id) | ContainerRef::Folder(id) => id,
        }
    }

    pub fn parent_type(&self) -> ParentType {
        match self {
            ContainerRef::Collection(_) => ParentType::Collection,
            ContainerRef::Folder(_) => ParentType::Folder,
        }
    }
}

/// A collection or folder as returned by the archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteContainer {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    #[serde(rename = "_modelType")]
    pub model_type: ParentType,
    /// Absent for collections.
    #[serde(rename = "parentId", default)]
    pub parent_id: Option<String>,
    /// `collection`, `folder` or `user`; absent for collections.
    #[serde(rename = "parentCollection", default)]
    pub parent_collection: Option<String>,
}

impl RemoteContainer {
    /// The parent reference children of this container are created under.
    ///
    /// Uses the model type the archive reported rather than the type that was
    /// asked for.
    pub fn as_parent(&self) -> ContainerRef {
        match self.model_type {
            ParentType::Collection => ContainerRef::Collection(self.id.clone()),
            ParentType::Folder => ContainerRef::Folder(self.id.clone()),
        }
    }
}

/// A file record (item) under a folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteItem {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    #[serde(rename = "folderId", default)]
    pub folder_id: Option<String>,
}

/// The file document returned once an upload is finalized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedFile {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(rename = "itemId", default)]
    pub item_id: Option<String>,
}

/// Server-side state for one file transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSession {
    pub id: String,
    pub name: String,
    pub size: u64,
    /// Set when the archive finalized the upload at initiation (zero-byte files).
    pub finalized: Option<UploadedFile>,
}

/// Authentication token for one run.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    pub token: String,
}

impl Session {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("token", &"<redacted>")
            .finish()
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Key-value annotations attached to a container.
pub type FolderMetadata = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid url: {0}")]
    Url(String),
    #[error("api returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("upload protocol error: {0}")]
    Protocol(String),
}

impl RemoteError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, RemoteError::Api { status: 401 | 403, .. })
    }
}

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("error reading excel file: {0}")]
    Workbook(String),
    #[error("workbook {0} has no sheets")]
    EmptyWorkbook(String),
}

/// The archive, as seen by the synchronizer.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Exchange credentials for a session token.
    async fn authenticate(&self, credentials: &Credentials) -> Result<Session, RemoteError>;

    /// Search collections by name. Results may include partial matches.
    async fn find_collections(
        &self,
        session: &Session,
        name: &str,
    ) -> Result<Vec<RemoteContainer>, RemoteError>;

    async fn create_collection(
        &self,
        session: &Session,
        name: &str,
    ) -> Result<RemoteContainer, RemoteError>;

    async fn find_folders(
        &self,
        session: &Session,
        parent: &ContainerRef,
        name: &str,
    ) -> Result<Vec<RemoteContainer>, RemoteError>;

    async fn create_folder(
        &self,
        session: &Session,
        parent: &ContainerRef,
        name: &str,
    ) -> Result<RemoteContainer, RemoteError>;

    async fn find_items(
        &self,
        session: &Session,
        parent: &ContainerRef,
        name: &str,
    ) -> Result<Vec<RemoteItem>, RemoteError>;

    async fn delete_item(&self, session: &Session, item_id: &str) -> Result<(), RemoteError>;

    async fn delete_file(&self, session: &Session, file_id: &str) -> Result<(), RemoteError>;

    /// Merge metadata into a container. Reapplying the same keys is a no-op.
    async fn set_folder_metadata(
        &self,
        session: &Session,
        target: &ContainerRef,
        metadata: &FolderMetadata,
    ) -> Result<(), RemoteError>;

    /// Upload a local file as a new item under `parent`.
    async fn upload_file(
        &self,
        session: &Session,
        parent: &ContainerRef,
        path: &Path,
        name: &str,
        size: u64,
    ) -> Result<UploadedFile, RemoteError>;
}

/// Converts one spreadsheet into a JSON document.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
pub trait SheetTransformer: Send + Sync {
    fn convert(&self, path: &Path, file_name: &str)
        -> Result<serde_json::Value, TransformError>;
}

/// Files the run writes back next to the sources it read.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait ArtifactCache: Send + Sync {
    /// Persist the serialized derived document at `path`.
    async fn write_derived(&self, path: &Path, contents: &[u8]) -> Result<(), std::io::Error>;

    /// Persist an error report for a failed source file at `path`.
    async fn write_error_log(&self, path: &Path, report: &str) -> Result<(), std::io::Error>;
}
