//! Girder REST client.
//!
//! [`GirderClient`] implements [`RemoteStore`] and [`ChunkTransport`] over
//! `reqwest`. It keeps no token: every call takes the [`Session`] returned by
//! `authenticate` and sends it in the `Girder-Token` header.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use dsa_sync_core::chunked::{upload_in_chunks, ChunkReceipt, ChunkSpec, ChunkTransport};
use dsa_sync_core::config::TransferConfig;
use dsa_sync_core::contract::{
    ContainerRef, Credentials, FolderMetadata, RemoteContainer, RemoteError, RemoteItem,
    RemoteStore, Session, UploadSession, UploadedFile,
};
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, error, info};
use url::Url;

const API_PREFIX: &str = "api/v1/";
const TOKEN_HEADER: &str = "Girder-Token";
const PAGE_SIZE: usize = 50;

#[derive(Clone)]
pub struct GirderClient {
    http: Client,
    base_url: Url,
    chunk_size: u64,
}

#[derive(Debug, Deserialize)]
struct AuthenticationResponse {
    #[serde(rename = "authToken")]
    auth_token: AuthToken,
}

#[derive(Debug, Deserialize)]
struct AuthToken {
    token: String,
}

/// Either an upload document or, once finalized, a file document.
#[derive(Debug, Deserialize)]
struct UploadDocument {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_modelType", default)]
    model_type: Option<String>,
    #[serde(default)]
    name: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    received: u64,
    #[serde(rename = "itemId", default)]
    item_id: Option<String>,
}

impl UploadDocument {
    fn is_file(&self) -> bool {
        self.model_type.as_deref() == Some("file")
    }

    fn into_file(self) -> UploadedFile {
        UploadedFile {
            id: self.id,
            name: self.name,
            size: self.size,
            item_id: self.item_id,
        }
    }
}

impl GirderClient {
    /// Client for the archive at `host` (e.g. `http://localhost:8080`).
    pub fn new(host: &str, transfer: TransferConfig) -> Result<Self, RemoteError> {
        let root = Url::parse(&format!("{}/", host.trim_end_matches('/')))
            .map_err(|e| RemoteError::Url(e.to_string()))?;
        let base_url = root
            .join(API_PREFIX)
            .map_err(|e| RemoteError::Url(e.to_string()))?;
        let http = Client::builder()
            .timeout(Duration::from_secs(transfer.request_timeout_secs))
            .build()
            .map_err(request_error)?;
        info!(
            base_url = %base_url,
            chunk_size = transfer.chunk_size,
            timeout_secs = transfer.request_timeout_secs,
            "Initialized Girder client"
        );
        Ok(Self {
            http,
            base_url,
            chunk_size: transfer.chunk_size,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url, RemoteError> {
        self.base_url
            .join(path)
            .map_err(|e| RemoteError::Url(e.to_string()))
    }

    fn request(&self, method: Method, url: Url, session: &Session) -> RequestBuilder {
        self.http
            .request(method, url)
            .header(TOKEN_HEADER, &session.token)
    }

    async fn send<T: DeserializeOwned>(builder: RequestBuilder) -> Result<T, RemoteError> {
        let response = builder.send().await.map_err(request_error)?;
        Self::handle_response(response).await
    }

    async fn handle_response<T: DeserializeOwned>(response: Response) -> Result<T, RemoteError> {
        let status = response.status();
        if status.is_success() {
            return response.json::<T>().await.map_err(request_error);
        }
        let body = response.text().await.unwrap_or_default();
        Err(RemoteError::Api {
            status: status.as_u16(),
            body,
        })
    }

    async fn send_discarding(builder: RequestBuilder) -> Result<(), RemoteError> {
        let response = builder.send().await.map_err(request_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(RemoteError::Api {
            status: status.as_u16(),
            body,
        })
    }
}

fn request_error(e: reqwest::Error) -> RemoteError {
    RemoteError::Request(e.to_string())
}

#[async_trait]
impl RemoteStore for GirderClient {
    async fn authenticate(&self, credentials: &Credentials) -> Result<Session, RemoteError> {
        let url = self.endpoint("user/authentication")?;
        let response = self
            .http
            .get(url)
            .basic_auth(&credentials.username, Some(&credentials.password))
            .send()
            .await
            .map_err(request_error)?;
        let auth: AuthenticationResponse = Self::handle_response(response).await.map_err(|e| {
            error!(error = %e, username = %credentials.username, "Authentication request rejected");
            e
        })?;
        info!(username = %credentials.username, "Authenticated against archive");
        Ok(Session::new(auth.auth_token.token))
    }

    /// Text search is fuzzy, so pages are fetched until one holds the exact
    /// name or the results run out.
    async fn find_collections(
        &self,
        session: &Session,
        name: &str,
    ) -> Result<Vec<RemoteContainer>, RemoteError> {
        let mut found: Vec<RemoteContainer> = Vec::new();
        loop {
            let mut url = self.endpoint("collection")?;
            url.query_pairs_mut()
                .append_pair("text", name)
                .append_pair("limit", &PAGE_SIZE.to_string())
                .append_pair("offset", &found.len().to_string())
                .append_pair("sort", "name")
                .append_pair("sortdir", "1");
            debug!(collection = name, offset = found.len(), "Searching collections");
            let page: Vec<RemoteContainer> =
                Self::send(self.request(Method::GET, url, session)).await?;

            let exhausted = page.len() < PAGE_SIZE;
            let hit = page.iter().any(|c| c.name == name);
            found.extend(page);
            if hit || exhausted {
                return Ok(found);
            }
        }
    }

    async fn create_collection(
        &self,
        session: &Session,
        name: &str,
    ) -> Result<RemoteContainer, RemoteError> {
        let mut url = self.endpoint("collection")?;
        url.query_pairs_mut()
            .append_pair("name", name)
            .append_pair("public", "false");
        Self::send(self.request(Method::POST, url, session)).await
    }

    async fn find_folders(
        &self,
        session: &Session,
        parent: &ContainerRef,
        name: &str,
    ) -> Result<Vec<RemoteContainer>, RemoteError> {
        let mut url = self.endpoint("folder")?;
        url.query_pairs_mut()
            .append_pair("parentType", parent.parent_type().as_str())
            .append_pair("parentId", parent.id())
            .append_pair("name", name)
            .append_pair("limit", &PAGE_SIZE.to_string())
            .append_pair("offset", "0")
            .append_pair("sort", "lowerName")
            .append_pair("sortdir", "1");
        debug!(folder = name, parent_id = parent.id(), "Searching folders");
        Self::send(self.request(Method::GET, url, session)).await
    }

    async fn create_folder(
        &self,
        session: &Session,
        parent: &ContainerRef,
        name: &str,
    ) -> Result<RemoteContainer, RemoteError> {
        let mut url = self.endpoint("folder")?;
        url.query_pairs_mut()
            .append_pair("parentType", parent.parent_type().as_str())
            .append_pair("parentId", parent.id())
            .append_pair("name", name)
            .append_pair("reuseExisting", "false");
        Self::send(self.request(Method::POST, url, session)).await
    }

    async fn find_items(
        &self,
        session: &Session,
        parent: &ContainerRef,
        name: &str,
    ) -> Result<Vec<RemoteItem>, RemoteError> {
        let mut url = self.endpoint("item")?;
        url.query_pairs_mut()
            .append_pair("folderId", parent.id())
            .append_pair("name", name)
            .append_pair("limit", &PAGE_SIZE.to_string())
            .append_pair("offset", "0")
            .append_pair("sort", "lowerName")
            .append_pair("sortdir", "1");
        Self::send(self.request(Method::GET, url, session)).await
    }

    async fn delete_item(&self, session: &Session, item_id: &str) -> Result<(), RemoteError> {
        let url = self.endpoint(&format!("item/{item_id}"))?;
        Self::send_discarding(self.request(Method::DELETE, url, session)).await
    }

    async fn delete_file(&self, session: &Session, file_id: &str) -> Result<(), RemoteError> {
        let url = self.endpoint(&format!("file/{file_id}"))?;
        Self::send_discarding(self.request(Method::DELETE, url, session)).await
    }

    async fn set_folder_metadata(
        &self,
        session: &Session,
        target: &ContainerRef,
        metadata: &FolderMetadata,
    ) -> Result<(), RemoteError> {
        let mut url = self.endpoint(&format!(
            "{}/{}/metadata",
            target.parent_type().as_str(),
            target.id()
        ))?;
        url.query_pairs_mut().append_pair("allowNull", "false");
        Self::send_discarding(self.request(Method::PUT, url, session).json(metadata)).await
    }

    async fn upload_file(
        &self,
        session: &Session,
        parent: &ContainerRef,
        path: &Path,
        name: &str,
        size: u64,
    ) -> Result<UploadedFile, RemoteError> {
        upload_in_chunks(self, session, parent, path, name, size, self.chunk_size).await
    }
}

#[async_trait]
impl ChunkTransport for GirderClient {
    async fn initiate_upload(
        &self,
        session: &Session,
        parent: &ContainerRef,
        name: &str,
        size: u64,
    ) -> Result<UploadSession, RemoteError> {
        let mut url = self.endpoint("file")?;
        url.query_pairs_mut()
            .append_pair("parentType", parent.parent_type().as_str())
            .append_pair("parentId", parent.id())
            .append_pair("name", name)
            .append_pair("size", &size.to_string());
        let doc: UploadDocument = Self::send(self.request(Method::POST, url, session)).await?;

        let id = doc.id.clone();
        let finalized = doc.is_file().then(|| doc.into_file());
        Ok(UploadSession {
            id,
            name: name.to_string(),
            size,
            finalized,
        })
    }

    async fn send_chunk(
        &self,
        session: &Session,
        upload: &UploadSession,
        chunk: &ChunkSpec,
        bytes: Vec<u8>,
    ) -> Result<ChunkReceipt, RemoteError> {
        let mut url = self.endpoint("file/chunk")?;
        url.query_pairs_mut()
            .append_pair("offset", &chunk.offset.to_string())
            .append_pair("uploadId", &upload.id);
        let builder = self
            .request(Method::POST, url, session)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(bytes);
        let doc: UploadDocument = Self::send(builder).await?;

        if doc.is_file() {
            Ok(ChunkReceipt::Complete(doc.into_file()))
        } else {
            Ok(ChunkReceipt::Partial {
                received: doc.received,
            })
        }
    }
}
