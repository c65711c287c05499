pub mod config;
mod controller;
mod error;
mod pipeline;
pub mod progress;
mod report;
mod retry;
pub mod run_log;
mod sink;
mod source;
mod traversal;
mod upload;

pub const APP_NAME: &str = "BlobFerry";

pub use controller::{
    Collaborators, TransferConfig, TransferOptions, TransferReport, run_transfer,
    transfer_targets,
};
pub use error::{Error, Result};
pub use pipeline::{ALREADY_MATERIALIZED_MESSAGE, Pipeline, PipelineOutcome, TransferState};
pub use progress::{Progress, ProgressSink};
pub use report::{
    CSV_HEADER, ResultLog, TransferResult, TransferStatus, parse_csv, to_csv, write_csv,
    write_json,
};
pub use retry::{BoundedRetry, RetryWait};
pub use sink::{
    BlobSink, BlockBlobSink, BlockBlobSinkConfig, BytesSent, InMemorySink, StoredBlob, block_id,
    public_blob_url,
};
pub use source::{
    BoxFuture, ByteRange, ByteStream, FolderItem, FolderListing, InMemorySource, ItemKind,
    MEM_CHUNK_BYTES, MetadataService, ReadyLinks, Registration, RestSourceClient,
    RestSourceConfig, ScriptedRegistration, SourceBody, SourceCatalog, UploadLinks,
    resolve_location,
};
pub use traversal::{
    Discovery, TransferTarget, TraversalConfig, discover_targets, matches_extension,
    normalize_extensions,
};
pub use upload::{PercentFn, UploadStrategy, choose_strategy, plan_blocks, upload_file};
