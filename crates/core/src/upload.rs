use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::{TryStreamExt, stream};
use tracing::{debug, warn};

use crate::config::UploadTuning;
use crate::progress::percent;
use crate::sink::{BlobSink, block_id};
use crate::source::{ByteRange, SourceCatalog};
use crate::{Error, Result};

/// Called with the integer percentage of the file acknowledged so far.
pub type PercentFn = Arc<dyn Fn(u8) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStrategy {
    SingleShot,
    Chunked {
        block_size: u64,
        block_concurrency: usize,
    },
}

pub fn choose_strategy(size: u64, tuning: &UploadTuning) -> UploadStrategy {
    if size < tuning.chunk_threshold_bytes {
        UploadStrategy::SingleShot
    } else {
        UploadStrategy::Chunked {
            block_size: tuning.block_size_bytes.max(1),
            block_concurrency: tuning.block_concurrency.max(1),
        }
    }
}

/// Splits `size` bytes into consecutive blocks of at most `block_size`.
pub fn plan_blocks(size: u64, block_size: u64) -> Vec<ByteRange> {
    let block_size = block_size.max(1);
    let mut blocks = Vec::new();
    let mut offset = 0;
    while offset < size {
        let len = block_size.min(size - offset);
        blocks.push(ByteRange { offset, len });
        offset += len;
    }
    blocks
}

/// Transfers one file from `location` to `blob_url`. Returns the byte count.
/// Failed blocks are not retried; any failure fails the whole call.
///
/// Single-shot uploads forward the download stream straight into the sink
/// request, so a file is never held in memory whole.
pub async fn upload_file<C, S>(
    catalog: &C,
    sink: &S,
    location: &str,
    blob_url: &str,
    size: u64,
    strategy: UploadStrategy,
    on_percent: PercentFn,
) -> Result<u64>
where
    C: SourceCatalog + ?Sized,
    S: BlobSink + ?Sized,
{
    match strategy {
        UploadStrategy::SingleShot => {
            upload_single(catalog, sink, location, blob_url, size, on_percent).await
        }
        UploadStrategy::Chunked {
            block_size,
            block_concurrency,
        } => {
            upload_chunked(
                catalog,
                sink,
                location,
                blob_url,
                size,
                block_size,
                block_concurrency,
                on_percent,
            )
            .await
        }
    }
}

async fn upload_single<C, S>(
    catalog: &C,
    sink: &S,
    location: &str,
    blob_url: &str,
    size: u64,
    on_percent: PercentFn,
) -> Result<u64>
where
    C: SourceCatalog + ?Sized,
    S: BlobSink + ?Sized,
{
    let body = catalog.open(location).await?;
    let total = body.len.unwrap_or(size);
    on_percent(0);
    sink.put_blob(
        blob_url,
        body.stream,
        total,
        Arc::new(move |sent| on_percent(percent(sent, total))),
    )
    .await?;
    Ok(total)
}

#[allow(clippy::too_many_arguments)]
async fn upload_chunked<C, S>(
    catalog: &C,
    sink: &S,
    location: &str,
    blob_url: &str,
    size: u64,
    block_size: u64,
    block_concurrency: usize,
    on_percent: PercentFn,
) -> Result<u64>
where
    C: SourceCatalog + ?Sized,
    S: BlobSink + ?Sized,
{
    let blocks = plan_blocks(size, block_size);
    let block_ids: Vec<String> = (0..blocks.len()).map(block_id).collect();
    let acked = AtomicU64::new(0);
    debug!(
        event = "upload.chunked.start",
        blocks = blocks.len() as u64,
        block_size,
        block_concurrency = block_concurrency as u64,
        "upload.chunked.start"
    );
    on_percent(0);

    stream::iter(blocks.into_iter().enumerate().map(Ok::<_, Error>))
        .try_for_each_concurrent(block_concurrency.max(1), |(index, range)| {
            let acked = &acked;
            let block_ids = &block_ids;
            let on_percent = &on_percent;
            async move {
                let bytes = catalog.read(location, Some(range)).await?;
                if bytes.len() as u64 != range.len {
                    return Err(Error::transport(format!(
                        "short read for block {index}: got {} of {} bytes",
                        bytes.len(),
                        range.len
                    )));
                }
                sink.put_block(blob_url, &block_ids[index], bytes)
                    .await
                    .inspect_err(|e| {
                        warn!(
                            event = "upload.block_failed",
                            block = index as u64,
                            offset = range.offset,
                            error = %e,
                            "upload.block_failed"
                        );
                    })?;
                let done = acked.fetch_add(range.len, Ordering::Relaxed) + range.len;
                on_percent(percent(done, size));
                Ok(())
            }
        })
        .await?;

    sink.commit_blocks(blob_url, &block_ids).await?;
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn threshold_selects_strategy() {
        let tuning = UploadTuning::default();
        assert_eq!(choose_strategy(10 * MIB, &tuning), UploadStrategy::SingleShot);
        assert_eq!(
            choose_strategy(256 * MIB, &tuning),
            UploadStrategy::Chunked {
                block_size: 8 * MIB,
                block_concurrency: 4
            }
        );
    }

    #[tokio::test]
    async fn single_shot_streams_the_download_into_the_sink() {
        use std::sync::Mutex;

        use crate::sink::InMemorySink;
        use crate::source::{FolderItem, InMemorySource, MEM_CHUNK_BYTES};

        let src = InMemorySource::new()
            .with_folder("root", vec![FolderItem::file("f1", "a.pdf", 3 * MIB)]);
        let sink = InMemorySink::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&seen);

        let sent = upload_file(
            &src,
            &sink,
            "mem://files/f1",
            "https://sink.test/container/root/a.pdf?sig=test",
            3 * MIB,
            UploadStrategy::SingleShot,
            Arc::new(move |p| record.lock().unwrap().push(p)),
        )
        .await
        .unwrap();

        assert_eq!(sent, 3 * MIB);
        assert_eq!(
            sink.largest_chunk.load(Ordering::Relaxed) as u64,
            MEM_CHUNK_BYTES
        );
        let stored = sink
            .get("https://sink.test/container/root/a.pdf")
            .await
            .unwrap();
        assert_eq!(stored.len, 3 * MIB);
        assert_eq!(
            stored.bytes.unwrap()[MIB as usize],
            InMemorySource::content_byte(MIB)
        );

        let seen = seen.lock().unwrap();
        assert_eq!(seen.first(), Some(&0));
        assert_eq!(seen.last(), Some(&100));
        assert!(seen.len() > 10);
    }

    #[tokio::test]
    async fn short_stream_fails_the_single_shot_upload() {
        use crate::sink::InMemorySink;
        use crate::source::{FolderItem, InMemorySource};

        let src =
            InMemorySource::new().with_folder("root", vec![FolderItem::file("f1", "a.pdf", 1000)]);
        let sink = InMemorySink::new();
        let body = src.open("mem://files/f1").await.unwrap();
        let err = sink
            .put_blob(
                "https://sink.test/container/a.pdf",
                body.stream,
                2000,
                Arc::new(|_| {}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UploadTransport { .. }));
        assert_eq!(sink.blob_count().await, 0);
    }

    #[test]
    fn blocks_cover_the_file_exactly() {
        let blocks = plan_blocks(500 * MIB, 8 * MIB);
        assert_eq!(blocks.len(), 63);
        assert_eq!(blocks.last().unwrap().len, 4 * MIB);
        assert_eq!(blocks.iter().map(|b| b.len).sum::<u64>(), 500 * MIB);
        assert!(plan_blocks(0, 8 * MIB).is_empty());
    }
}
