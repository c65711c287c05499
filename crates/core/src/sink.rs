use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use base64::Engine;
use bytes::Bytes;
use futures_util::TryStreamExt;
use reqwest::Url;
use tokio::sync::Mutex;

use crate::source::{BoxFuture, ByteStream};
use crate::{Error, Result};

/// Called with the cumulative number of bytes handed to the transport.
pub type BytesSent = Arc<dyn Fn(u64) + Send + Sync>;

const BLOB_API_VERSION: &str = "2021-08-06";

pub trait BlobSink: Send + Sync {
    fn provider(&self) -> &str;

    /// Whether the sink holds credentials for its container.
    fn is_authorized(&self) -> bool;

    /// Turns a registration upload link (absolute, or a blob name relative to
    /// the container) into a pre-authorized blob URL.
    fn resolve_blob_url(&self, upload_url: &str) -> Result<String>;

    /// Writes `len` bytes from `body` as one blob. The body is forwarded as it
    /// arrives; `on_sent` sees the running total.
    fn put_blob<'a>(
        &'a self,
        url: &'a str,
        body: ByteStream,
        len: u64,
        on_sent: BytesSent,
    ) -> BoxFuture<'a, Result<()>>;

    fn put_block<'a>(
        &'a self,
        url: &'a str,
        block_id: &'a str,
        bytes: Bytes,
    ) -> BoxFuture<'a, Result<()>>;

    fn commit_blocks<'a>(&'a self, url: &'a str, block_ids: &'a [String])
    -> BoxFuture<'a, Result<()>>;
}

/// Fixed-width block id, as block blobs require every id in a blob to have
/// the same length.
pub fn block_id(index: usize) -> String {
    base64::engine::general_purpose::STANDARD.encode(format!("block-{index:08}"))
}

/// Blob URL with the query (and any SAS signature in it) removed.
pub fn public_blob_url(url: &str) -> String {
    match Url::parse(url) {
        Ok(mut u) => {
            u.set_query(None);
            u.to_string()
        }
        Err(_) => url.split('?').next().unwrap_or(url).to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct BlockBlobSinkConfig {
    pub container_url: String,
    pub sas_token: Option<String>,
}

pub struct BlockBlobSink {
    config: BlockBlobSinkConfig,
    client: reqwest::Client,
}

impl BlockBlobSink {
    pub fn new(config: BlockBlobSinkConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn sas(&self) -> Option<&str> {
        self.config
            .sas_token
            .as_deref()
            .map(|s| s.trim().trim_start_matches('?'))
            .filter(|s| !s.is_empty())
    }

    fn with_comp(url: &str, pairs: &[(&str, &str)]) -> Result<Url> {
        let mut u = Url::parse(url)
            .map_err(|e| Error::transport(format!("invalid blob url {url:?}: {e}")))?;
        {
            let mut q = u.query_pairs_mut();
            for (k, v) in pairs {
                q.append_pair(k, v);
            }
        }
        Ok(u)
    }
}

async fn check_status(what: &str, res: reqwest::Response) -> Result<()> {
    let status = res.status();
    if status.is_success() {
        return Ok(());
    }
    let body = res.text().await.unwrap_or_default();
    Err(Error::transport(format!("{what} http {status}: {body}")))
}

fn block_list_xml(block_ids: &[String]) -> String {
    let mut xml = String::from(r#"<?xml version="1.0" encoding="utf-8"?><BlockList>"#);
    for id in block_ids {
        xml.push_str("<Latest>");
        xml.push_str(id);
        xml.push_str("</Latest>");
    }
    xml.push_str("</BlockList>");
    xml
}

impl BlobSink for BlockBlobSink {
    fn provider(&self) -> &str {
        "azure.blockblob"
    }

    fn is_authorized(&self) -> bool {
        if self.sas().is_some() {
            return true;
        }
        Url::parse(&self.config.container_url)
            .map(|u| u.query_pairs().any(|(k, _)| k == "sig"))
            .unwrap_or(false)
    }

    fn resolve_blob_url(&self, upload_url: &str) -> Result<String> {
        let mut url = if upload_url.starts_with("http://") || upload_url.starts_with("https://") {
            Url::parse(upload_url)
                .map_err(|e| Error::transport(format!("invalid upload url {upload_url:?}: {e}")))?
        } else {
            let mut container = Url::parse(&self.config.container_url).map_err(|e| {
                Error::InvalidConfig {
                    message: format!("invalid sink container url: {e}"),
                }
            })?;
            container
                .path_segments_mut()
                .map_err(|_| Error::InvalidConfig {
                    message: "sink container url cannot hold a path".to_string(),
                })?
                .pop_if_empty()
                .extend(upload_url.split('/').filter(|s| !s.is_empty() && *s != "."));
            container
        };
        if url.query().is_none() {
            url.set_query(self.sas());
        }
        Ok(url.to_string())
    }

    fn put_blob<'a>(
        &'a self,
        url: &'a str,
        body: ByteStream,
        len: u64,
        on_sent: BytesSent,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut sent = 0u64;
            let body = body.inspect_ok(move |chunk| {
                sent += chunk.len() as u64;
                on_sent(sent);
            });

            let res = self
                .client
                .put(url)
                .header("x-ms-blob-type", "BlockBlob")
                .header("x-ms-version", BLOB_API_VERSION)
                .header(reqwest::header::CONTENT_LENGTH, len)
                .body(reqwest::Body::wrap_stream(body))
                .send()
                .await
                .map_err(|e| Error::transport(format!("put blob request failed: {e}")))?;
            check_status("put blob", res).await
        })
    }

    fn put_block<'a>(
        &'a self,
        url: &'a str,
        block_id: &'a str,
        bytes: Bytes,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let target = Self::with_comp(url, &[("comp", "block"), ("blockid", block_id)])?;
            let res = self
                .client
                .put(target)
                .header("x-ms-version", BLOB_API_VERSION)
                .body(bytes)
                .send()
                .await
                .map_err(|e| Error::transport(format!("put block request failed: {e}")))?;
            check_status("put block", res).await
        })
    }

    fn commit_blocks<'a>(
        &'a self,
        url: &'a str,
        block_ids: &'a [String],
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let target = Self::with_comp(url, &[("comp", "blocklist")])?;
            let res = self
                .client
                .put(target)
                .header("x-ms-version", BLOB_API_VERSION)
                .header(reqwest::header::CONTENT_TYPE, "application/xml")
                .body(block_list_xml(block_ids))
                .send()
                .await
                .map_err(|e| Error::transport(format!("put block list request failed: {e}")))?;
            check_status("put block list", res).await
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub len: u64,
    /// Number of committed blocks; zero for single-shot uploads.
    pub blocks: usize,
    /// Kept only for single-shot uploads.
    pub bytes: Option<Vec<u8>>,
}

/// Sink double for tests. Blob keys are URLs without their query.
#[derive(Debug)]
pub struct InMemorySink {
    authorized: bool,
    delay: Duration,
    failing_blobs: HashSet<String>,
    failing_block: Option<usize>,
    blobs: Mutex<HashMap<String, StoredBlob>>,
    staged: Mutex<HashMap<String, HashMap<String, u64>>>,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    /// Largest single body chunk seen by `put_blob`.
    pub largest_chunk: AtomicUsize,
    pub put_blob_calls: AtomicUsize,
    pub put_block_calls: AtomicUsize,
    pub commit_calls: AtomicUsize,
}

impl Default for InMemorySink {
    fn default() -> Self {
        Self {
            authorized: true,
            delay: Duration::ZERO,
            failing_blobs: HashSet::new(),
            failing_block: None,
            blobs: Mutex::new(HashMap::new()),
            staged: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            largest_chunk: AtomicUsize::new(0),
            put_blob_calls: AtomicUsize::new(0),
            put_block_calls: AtomicUsize::new(0),
            commit_calls: AtomicUsize::new(0),
        }
    }
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unauthorized() -> Self {
        Self {
            authorized: false,
            ..Self::default()
        }
    }

    /// Every upload call sleeps this long while counted as in flight.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Uploads to blobs whose name ends with `name` fail.
    pub fn with_failing_blob(mut self, name: &str) -> Self {
        self.failing_blobs.insert(name.to_string());
        self
    }

    /// The `n`th block upload (zero-based, across the sink) fails.
    pub fn with_failing_block(mut self, n: usize) -> Self {
        self.failing_block = Some(n);
        self
    }

    pub async fn get(&self, url: &str) -> Option<StoredBlob> {
        self.blobs.lock().await.get(&public_blob_url(url)).cloned()
    }

    pub async fn blob_count(&self) -> usize {
        self.blobs.lock().await.len()
    }

    fn fails(&self, url: &str) -> bool {
        let key = public_blob_url(url);
        self.failing_blobs.iter().any(|name| key.ends_with(name.as_str()))
    }

    async fn enter(&self) {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }

    fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl BlobSink for InMemorySink {
    fn provider(&self) -> &str {
        "test.mem"
    }

    fn is_authorized(&self) -> bool {
        self.authorized
    }

    fn resolve_blob_url(&self, upload_url: &str) -> Result<String> {
        if upload_url.starts_with("http://") || upload_url.starts_with("https://") {
            return Ok(upload_url.to_string());
        }
        Ok(format!(
            "https://sink.test/container/{}?sig=test",
            upload_url.trim_start_matches('/')
        ))
    }

    fn put_blob<'a>(
        &'a self,
        url: &'a str,
        mut body: ByteStream,
        len: u64,
        on_sent: BytesSent,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.put_blob_calls.fetch_add(1, Ordering::Relaxed);
            self.enter().await;
            if self.fails(url) {
                self.leave();
                return Err(Error::transport("put blob http 503 Service Unavailable"));
            }
            let mut bytes = Vec::new();
            loop {
                let chunk = match body.try_next().await {
                    Ok(Some(chunk)) => chunk,
                    Ok(None) => break,
                    Err(e) => {
                        self.leave();
                        return Err(e);
                    }
                };
                self.largest_chunk.fetch_max(chunk.len(), Ordering::Relaxed);
                bytes.extend_from_slice(&chunk);
                on_sent(bytes.len() as u64);
            }
            if bytes.len() as u64 != len {
                self.leave();
                return Err(Error::transport(format!(
                    "put blob body was {} bytes, declared {len}",
                    bytes.len()
                )));
            }
            self.blobs.lock().await.insert(
                public_blob_url(url),
                StoredBlob {
                    len: bytes.len() as u64,
                    blocks: 0,
                    bytes: Some(bytes),
                },
            );
            self.leave();
            Ok(())
        })
    }

    fn put_block<'a>(
        &'a self,
        url: &'a str,
        block_id: &'a str,
        bytes: Bytes,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let n = self.put_block_calls.fetch_add(1, Ordering::SeqCst);
            self.enter().await;
            if self.fails(url) || self.failing_block == Some(n) {
                self.leave();
                return Err(Error::transport("put block http 500 Internal Server Error"));
            }
            self.staged
                .lock()
                .await
                .entry(public_blob_url(url))
                .or_default()
                .insert(block_id.to_string(), bytes.len() as u64);
            self.leave();
            Ok(())
        })
    }

    fn commit_blocks<'a>(
        &'a self,
        url: &'a str,
        block_ids: &'a [String],
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.commit_calls.fetch_add(1, Ordering::Relaxed);
            let key = public_blob_url(url);
            let staged = self.staged.lock().await.remove(&key).unwrap_or_default();
            let mut len = 0u64;
            for id in block_ids {
                len += staged.get(id).copied().ok_or_else(|| {
                    Error::transport(format!("put block list: block {id} was never staged"))
                })?;
            }
            self.blobs.lock().await.insert(
                key,
                StoredBlob {
                    len,
                    blocks: block_ids.len(),
                    bytes: None,
                },
            );
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink(container_url: &str, sas: Option<&str>) -> BlockBlobSink {
        BlockBlobSink::new(BlockBlobSinkConfig {
            container_url: container_url.to_string(),
            sas_token: sas.map(str::to_string),
        })
    }

    #[test]
    fn block_ids_have_equal_length() {
        assert_eq!(block_id(0).len(), block_id(99_999).len());
        assert_ne!(block_id(1), block_id(2));
    }

    #[test]
    fn relative_upload_url_lands_in_container_with_sas() {
        let s = sink("https://acct.blob.core.windows.net/exports", Some("?sv=1&sig=abc"));
        let url = s.resolve_blob_url("./plans/level 1.pdf").unwrap();
        assert_eq!(
            url,
            "https://acct.blob.core.windows.net/exports/plans/level%201.pdf?sv=1&sig=abc"
        );
        assert_eq!(
            public_blob_url(&url),
            "https://acct.blob.core.windows.net/exports/plans/level%201.pdf"
        );
    }

    #[test]
    fn absolute_upload_url_keeps_its_own_query() {
        let s = sink("https://acct.blob.core.windows.net/exports", Some("sig=zzz"));
        let url = s
            .resolve_blob_url("https://other.blob.core.windows.net/c/x.pdf?sig=own")
            .unwrap();
        assert_eq!(url, "https://other.blob.core.windows.net/c/x.pdf?sig=own");
    }

    #[test]
    fn authorization_comes_from_sas_or_signed_container() {
        assert!(!sink("https://acct.blob.core.windows.net/exports", None).is_authorized());
        assert!(!sink("https://acct.blob.core.windows.net/exports", Some("  ")).is_authorized());
        assert!(sink("https://acct.blob.core.windows.net/exports", Some("sig=1")).is_authorized());
        assert!(sink("https://acct.blob.core.windows.net/exports?sv=1&sig=2", None).is_authorized());
    }

    #[test]
    fn block_list_lists_ids_in_order() {
        let xml = block_list_xml(&["YQ==".to_string(), "Yg==".to_string()]);
        assert!(xml.ends_with("<BlockList><Latest>YQ==</Latest><Latest>Yg==</Latest></BlockList>"));
    }
}
