use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use futures_util::{Stream, TryStreamExt, stream};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::{Error, Result};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// File content as it arrives from the source, one network chunk at a time.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// An opened download. `len` is the advertised content length, if any.
pub struct SourceBody {
    pub len: Option<u64>,
    pub stream: ByteStream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    File,
    Folder,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderItem {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ItemKind,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

impl FolderItem {
    pub fn file(id: impl Into<String>, name: impl Into<String>, size: u64) -> Self {
        Self {
            id: id.into(),
            kind: ItemKind::File,
            display_name: Some(name.into()),
            size: Some(size),
        }
    }

    pub fn folder(id: impl Into<String>, name: Option<&str>) -> Self {
        Self {
            id: id.into(),
            kind: ItemKind::Folder,
            display_name: name.map(str::to_string),
            size: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FolderListing {
    #[serde(default)]
    pub items: Vec<FolderItem>,
}

/// Registration response as the metadata service returns it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadLinks {
    #[serde(default)]
    pub upload_url: String,
    #[serde(default)]
    pub complete_url: String,
    #[serde(default)]
    pub pending: bool,
    #[serde(default)]
    pub skip: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyLinks {
    pub upload_url: String,
    pub complete_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    Ready(ReadyLinks),
    Pending,
    /// The service reports the file as already materialized; no bytes are sent.
    AlreadyMaterialized,
}

impl UploadLinks {
    pub fn into_registration(self) -> Registration {
        if self.skip {
            return Registration::AlreadyMaterialized;
        }
        if self.pending || self.upload_url.is_empty() || self.complete_url.is_empty() {
            return Registration::Pending;
        }
        Registration::Ready(ReadyLinks {
            upload_url: self.upload_url,
            complete_url: self.complete_url,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: u64,
    pub len: u64,
}

impl ByteRange {
    fn header_value(&self) -> String {
        format!("bytes={}-{}", self.offset, self.offset + self.len.saturating_sub(1))
    }
}

pub trait SourceCatalog: Send + Sync {
    fn list_folder<'a>(&'a self, folder_id: &'a str) -> BoxFuture<'a, Result<FolderListing>>;

    /// Temporary download location for a file, if the store hands one out.
    fn download_location<'a>(&'a self, file_id: &'a str) -> BoxFuture<'a, Result<Option<String>>>;

    /// Direct-download endpoint used when no temporary location is available.
    fn fallback_location(&self, file_id: &str) -> String;

    /// Reads one byte range, or the whole file when `range` is `None`.
    fn read<'a>(
        &'a self,
        location: &'a str,
        range: Option<ByteRange>,
    ) -> BoxFuture<'a, Result<Bytes>>;

    /// Opens the whole file as a stream without buffering it.
    fn open<'a>(&'a self, location: &'a str) -> BoxFuture<'a, Result<SourceBody>>;
}

pub trait MetadataService: Send + Sync {
    fn register_upload<'a>(
        &'a self,
        folder_id: &'a str,
        display_name: &'a str,
    ) -> BoxFuture<'a, Result<Registration>>;

    fn finalize<'a>(&'a self, complete_url: &'a str) -> BoxFuture<'a, Result<()>>;
}

pub async fn resolve_location<C: SourceCatalog + ?Sized>(
    catalog: &C,
    file_id: &str,
) -> Result<String> {
    match catalog.download_location(file_id).await? {
        Some(url) if !url.trim().is_empty() => Ok(url),
        _ => Ok(catalog.fallback_location(file_id)),
    }
}

#[derive(Debug, Clone)]
pub struct RestSourceConfig {
    pub base_url: String,
    pub token: Option<String>,
}

pub struct RestSourceClient {
    config: RestSourceConfig,
    client: reqwest::Client,
}

impl RestSourceClient {
    pub fn new(config: RestSourceConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn base(&self) -> &str {
        self.config.base_url.trim_end_matches('/')
    }

    fn absolute(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("{}/{}", self.base(), url.trim_start_matches('/'))
        }
    }

    /// Whether `url` is an endpoint of this API. Pre-signed locations on other
    /// hosts carry their own authorization and must not see the token.
    fn is_api_url(&self, url: &str) -> bool {
        let base = self.base();
        url == base
            || url
                .strip_prefix(base)
                .is_some_and(|rest| rest.starts_with('/') || rest.starts_with('?'))
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let url = self.absolute(url);
        let req = self.client.request(method, &url);
        match &self.config.token {
            Some(token) if self.is_api_url(&url) => req.bearer_auth(token),
            _ => req,
        }
    }

    async fn send(&self, what: &str, req: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        req.send()
            .await
            .map_err(|e| Error::source_api(format!("{what} request failed: {e}")))
    }

    async fn download(&self, location: &str, range: Option<ByteRange>) -> Result<reqwest::Response> {
        let mut req = self.request(reqwest::Method::GET, location);
        if let Some(range) = range {
            req = req.header(reqwest::header::RANGE, range.header_value());
        }
        let res = req
            .send()
            .await
            .map_err(|e| Error::transport(format!("download request failed: {e}")))?;
        let status = res.status();
        if !status.is_success() {
            return Err(Error::transport(format!("download http {status}")));
        }
        Ok(res)
    }
}

async fn read_body(what: &str, res: reqwest::Response) -> Result<(reqwest::StatusCode, String)> {
    let status = res.status();
    let body = res
        .text()
        .await
        .map_err(|e| Error::source_api(format!("{what} read response failed: {e}")))?;
    Ok((status, body))
}

#[derive(Debug, Deserialize)]
struct DownloadLocationBody {
    #[serde(default)]
    url: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterUploadBody<'a> {
    display_name: &'a str,
}

impl SourceCatalog for RestSourceClient {
    fn list_folder<'a>(&'a self, folder_id: &'a str) -> BoxFuture<'a, Result<FolderListing>> {
        Box::pin(async move {
            let url = format!("folders/{folder_id}/children");
            let res = self
                .send("listFolder", self.request(reqwest::Method::GET, &url))
                .await?;
            let (status, body) = read_body("listFolder", res).await?;
            if !status.is_success() {
                return Err(Error::Traversal {
                    folder_id: folder_id.to_string(),
                    message: format!("http {status}: {body}"),
                });
            }
            serde_json::from_str(&body).map_err(|e| Error::Traversal {
                folder_id: folder_id.to_string(),
                message: format!("invalid json: {e}"),
            })
        })
    }

    fn download_location<'a>(&'a self, file_id: &'a str) -> BoxFuture<'a, Result<Option<String>>> {
        Box::pin(async move {
            let url = format!("files/{file_id}/download-location");
            let res = self
                .send("getDownloadLocation", self.request(reqwest::Method::GET, &url))
                .await?;
            let (status, body) = read_body("getDownloadLocation", res).await?;
            if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::NO_CONTENT
            {
                return Ok(None);
            }
            if !status.is_success() {
                return Err(Error::source_api(format!(
                    "getDownloadLocation http {status}: {body}"
                )));
            }
            if body.trim().is_empty() {
                return Ok(None);
            }
            let parsed: DownloadLocationBody = serde_json::from_str(&body).map_err(|e| {
                Error::source_api(format!("getDownloadLocation invalid json: {e}; body={body}"))
            })?;
            Ok(parsed.url)
        })
    }

    fn fallback_location(&self, file_id: &str) -> String {
        format!("{}/files/{file_id}/content", self.base())
    }

    fn read<'a>(
        &'a self,
        location: &'a str,
        range: Option<ByteRange>,
    ) -> BoxFuture<'a, Result<Bytes>> {
        Box::pin(async move {
            self.download(location, range)
                .await?
                .bytes()
                .await
                .map_err(|e| Error::transport(format!("download read failed: {e}")))
        })
    }

    fn open<'a>(&'a self, location: &'a str) -> BoxFuture<'a, Result<SourceBody>> {
        Box::pin(async move {
            let res = self.download(location, None).await?;
            let len = res.content_length();
            let stream = res
                .bytes_stream()
                .map_err(|e| Error::transport(format!("download read failed: {e}")));
            Ok(SourceBody {
                len,
                stream: Box::pin(stream),
            })
        })
    }
}

impl MetadataService for RestSourceClient {
    fn register_upload<'a>(
        &'a self,
        folder_id: &'a str,
        display_name: &'a str,
    ) -> BoxFuture<'a, Result<Registration>> {
        Box::pin(async move {
            let url = format!("folders/{folder_id}/uploads");
            let req = self
                .request(reqwest::Method::POST, &url)
                .json(&RegisterUploadBody { display_name });
            let res = self.send("registerUpload", req).await?;
            let (status, body) = read_body("registerUpload", res).await?;
            if !status.is_success() {
                return Err(Error::source_api(format!(
                    "registerUpload http {status}: {body}"
                )));
            }
            // 202 Accepted usually has an empty body while links are prepared.
            if body.trim().is_empty() {
                return Ok(Registration::Pending);
            }
            let links: UploadLinks = serde_json::from_str(&body).map_err(|e| {
                Error::source_api(format!("registerUpload invalid json: {e}; body={body}"))
            })?;
            Ok(links.into_registration())
        })
    }

    fn finalize<'a>(&'a self, complete_url: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let res = self
                .send("finalize", self.request(reqwest::Method::POST, complete_url))
                .await?;
            let (status, body) = read_body("finalize", res).await?;
            if !status.is_success() {
                return Err(Error::source_api(format!("finalize http {status}: {body}")));
            }
            Ok(())
        })
    }
}

/// Scripted registration outcome for [`InMemorySource`].
#[derive(Debug, Clone)]
pub enum ScriptedRegistration {
    Ready,
    Pending,
    Skip,
    Fail(String),
}

const MEM_PREFIX: &str = "mem://";
/// Chunk size of streamed in-memory downloads.
pub const MEM_CHUNK_BYTES: u64 = 64 * 1024;

/// Source store double for tests. File bytes are synthesized on read, so large
/// files cost nothing until a range of them is requested.
#[derive(Debug, Default)]
pub struct InMemorySource {
    folders: Mutex<HashMap<String, Vec<FolderItem>>>,
    failing_folders: Mutex<HashSet<String>>,
    sizes: Mutex<HashMap<String, u64>>,
    locations: Mutex<HashMap<String, String>>,
    scripts: Mutex<HashMap<String, VecDeque<ScriptedRegistration>>>,
    failing_finalize: Mutex<HashSet<String>>,
    pub list_calls: AtomicUsize,
    pub register_calls: AtomicUsize,
    pub finalize_calls: AtomicUsize,
    pub read_calls: AtomicUsize,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_folder(mut self, folder_id: &str, items: Vec<FolderItem>) -> Self {
        for item in &items {
            if item.kind == ItemKind::File {
                self.sizes
                    .get_mut()
                    .insert(item.id.clone(), item.size.unwrap_or(0));
            }
        }
        self.folders
            .get_mut()
            .entry(folder_id.to_string())
            .or_default()
            .extend(items);
        self
    }

    pub fn with_failing_folder(mut self, folder_id: &str) -> Self {
        self.failing_folders.get_mut().insert(folder_id.to_string());
        self
    }

    /// Hands out a temporary location for `file_id` instead of the fallback.
    pub fn with_download_location(mut self, file_id: &str, location: &str) -> Self {
        self.locations
            .get_mut()
            .insert(file_id.to_string(), location.to_string());
        self
    }

    /// Queues registration outcomes for `display_name`; once drained every
    /// further registration is ready.
    pub fn with_registrations(
        mut self,
        display_name: &str,
        outcomes: Vec<ScriptedRegistration>,
    ) -> Self {
        self.scripts
            .get_mut()
            .entry(display_name.to_string())
            .or_default()
            .extend(outcomes);
        self
    }

    pub fn with_failing_finalize(mut self, display_name: &str) -> Self {
        self.failing_finalize
            .get_mut()
            .insert(display_name.to_string());
        self
    }

    /// Deterministic content byte at `offset`.
    pub fn content_byte(offset: u64) -> u8 {
        ((offset / 4096) % 251) as u8
    }

    async fn locate(&self, location: &str) -> Result<(String, u64)> {
        let file_id = {
            let locations = self.locations.lock().await;
            locations
                .iter()
                .find(|(_, loc)| loc.as_str() == location)
                .map(|(id, _)| id.clone())
        }
        .or_else(|| location.strip_prefix("mem://files/").map(str::to_string))
        .ok_or_else(|| Error::transport(format!("unknown location: {location}")))?;

        let size = self
            .sizes
            .lock()
            .await
            .get(&file_id)
            .copied()
            .ok_or_else(|| Error::transport(format!("file not found: {file_id}")))?;
        Ok((file_id, size))
    }

    fn synthesize(offset: u64, len: u64) -> Vec<u8> {
        let mut out = Vec::with_capacity(len as usize);
        let end = offset + len;
        let mut pos = offset;
        while pos < end {
            let page_end = ((pos / 4096) + 1) * 4096;
            let run = page_end.min(end) - pos;
            out.resize(out.len() + run as usize, Self::content_byte(pos));
            pos += run;
        }
        out
    }
}

impl SourceCatalog for InMemorySource {
    fn list_folder<'a>(&'a self, folder_id: &'a str) -> BoxFuture<'a, Result<FolderListing>> {
        Box::pin(async move {
            self.list_calls.fetch_add(1, Ordering::Relaxed);
            if self.failing_folders.lock().await.contains(folder_id) {
                return Err(Error::Traversal {
                    folder_id: folder_id.to_string(),
                    message: "injected listing failure".to_string(),
                });
            }
            let items = self
                .folders
                .lock()
                .await
                .get(folder_id)
                .cloned()
                .unwrap_or_default();
            Ok(FolderListing { items })
        })
    }

    fn download_location<'a>(&'a self, file_id: &'a str) -> BoxFuture<'a, Result<Option<String>>> {
        Box::pin(async move { Ok(self.locations.lock().await.get(file_id).cloned()) })
    }

    fn fallback_location(&self, file_id: &str) -> String {
        format!("{MEM_PREFIX}files/{file_id}")
    }

    fn read<'a>(
        &'a self,
        location: &'a str,
        range: Option<ByteRange>,
    ) -> BoxFuture<'a, Result<Bytes>> {
        Box::pin(async move {
            self.read_calls.fetch_add(1, Ordering::Relaxed);
            let (file_id, size) = self.locate(location).await?;
            let range = range.unwrap_or(ByteRange {
                offset: 0,
                len: size,
            });
            if range.offset + range.len > size {
                return Err(Error::transport(format!(
                    "range {}+{} out of bounds for {file_id} ({size} bytes)",
                    range.offset, range.len
                )));
            }
            Ok(Bytes::from(Self::synthesize(range.offset, range.len)))
        })
    }

    fn open<'a>(&'a self, location: &'a str) -> BoxFuture<'a, Result<SourceBody>> {
        Box::pin(async move {
            self.read_calls.fetch_add(1, Ordering::Relaxed);
            let (_, size) = self.locate(location).await?;
            let chunks = (0..size)
                .step_by(MEM_CHUNK_BYTES as usize)
                .map(move |offset| {
                    let len = MEM_CHUNK_BYTES.min(size - offset);
                    Ok(Bytes::from(Self::synthesize(offset, len)))
                });
            Ok(SourceBody {
                len: Some(size),
                stream: Box::pin(stream::iter(chunks)),
            })
        })
    }
}

impl MetadataService for InMemorySource {
    fn register_upload<'a>(
        &'a self,
        folder_id: &'a str,
        display_name: &'a str,
    ) -> BoxFuture<'a, Result<Registration>> {
        Box::pin(async move {
            self.register_calls.fetch_add(1, Ordering::Relaxed);
            let next = self
                .scripts
                .lock()
                .await
                .get_mut(display_name)
                .and_then(VecDeque::pop_front)
                .unwrap_or(ScriptedRegistration::Ready);
            match next {
                ScriptedRegistration::Ready => Ok(Registration::Ready(ReadyLinks {
                    upload_url: format!("{folder_id}/{display_name}"),
                    complete_url: format!("{MEM_PREFIX}complete/{display_name}"),
                })),
                ScriptedRegistration::Pending => Ok(Registration::Pending),
                ScriptedRegistration::Skip => Ok(Registration::AlreadyMaterialized),
                ScriptedRegistration::Fail(message) => Err(Error::source_api(message)),
            }
        })
    }

    fn finalize<'a>(&'a self, complete_url: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.finalize_calls.fetch_add(1, Ordering::Relaxed);
            let name = complete_url
                .strip_prefix("mem://complete/")
                .unwrap_or(complete_url);
            if self.failing_finalize.lock().await.contains(name) {
                return Err(Error::source_api("injected finalize failure"));
            }
            Ok(())
        })
    }
}
