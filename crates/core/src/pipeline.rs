//! Per-target transfer state machine.
//!
//! ```text
//! Start -> MetadataPending* -> MetadataReady -> Uploading -> Completing -> Done
//!   \            \                  \               \             \
//!    +------------+------------------+---------------+-------------+--> Failed
//! Start / MetadataPending -> AlreadyMaterialized
//! ```
//!
//! Every run ends in exactly one terminal state and produces exactly one
//! [`TransferResult`].

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{PendingPolicy, UploadTuning};
use crate::report::{TransferResult, TransferStatus};
use crate::retry::{BoundedRetry, RetryWait};
use crate::sink::{BlobSink, public_blob_url};
use crate::source::{MetadataService, ReadyLinks, Registration, SourceCatalog, resolve_location};
use crate::traversal::TransferTarget;
use crate::upload::{PercentFn, UploadStrategy, choose_strategy, upload_file};
use crate::Error;

pub const ALREADY_MATERIALIZED_MESSAGE: &str =
    "already materialized at source; no bytes transferred";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Start,
    MetadataPending,
    MetadataReady,
    Uploading,
    Completing,
    Done,
    /// The source reported the file as already present; nothing was sent.
    AlreadyMaterialized,
    Failed,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::AlreadyMaterialized | Self::Failed)
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    /// Every state entered, in order, ending with the terminal one.
    pub trace: Vec<TransferState>,
    pub strategy: Option<UploadStrategy>,
    pub result: TransferResult,
}

impl PipelineOutcome {
    pub fn final_state(&self) -> TransferState {
        self.trace.last().copied().unwrap_or(TransferState::Start)
    }
}

pub struct Pipeline<'a> {
    pub catalog: &'a dyn SourceCatalog,
    pub metadata: &'a dyn MetadataService,
    pub sink: &'a dyn BlobSink,
    pub pending: &'a PendingPolicy,
    pub tuning: &'a UploadTuning,
}

struct Run<'t> {
    target: &'t TransferTarget,
    trace: Vec<TransferState>,
    strategy: Option<UploadStrategy>,
}

impl<'t> Run<'t> {
    fn new(target: &'t TransferTarget) -> Self {
        Self {
            target,
            trace: vec![TransferState::Start],
            strategy: None,
        }
    }

    fn enter(&mut self, state: TransferState) {
        debug!(
            event = "pipeline.state",
            file_id = %self.target.file_id,
            state = ?state,
            "pipeline.state"
        );
        self.trace.push(state);
    }

    fn finish(
        mut self,
        terminal: TransferState,
        message: Option<String>,
        blob_url: Option<String>,
    ) -> PipelineOutcome {
        let status = match terminal {
            TransferState::Failed => TransferStatus::Error,
            _ => TransferStatus::Ok,
        };
        self.enter(terminal);
        PipelineOutcome {
            trace: self.trace,
            strategy: self.strategy,
            result: TransferResult {
                file_name: self.target.display_name.clone(),
                path: self.target.relative_path.clone(),
                size: Some(self.target.size),
                status,
                message,
                blob_url,
            },
        }
    }

    fn fail(self, error: Error) -> PipelineOutcome {
        warn!(
            event = "pipeline.failed",
            file_id = %self.target.file_id,
            code = error.code(),
            error = %error,
            "pipeline.failed"
        );
        self.finish(TransferState::Failed, Some(error.to_string()), None)
    }

    fn skipped(self) -> PipelineOutcome {
        self.finish(
            TransferState::AlreadyMaterialized,
            Some(ALREADY_MATERIALIZED_MESSAGE.to_string()),
            None,
        )
    }
}

enum Registered {
    Ready(ReadyLinks),
    Skipped,
}

impl Pipeline<'_> {
    /// Drives `target` to a terminal state. Never returns an error: failures
    /// are folded into the outcome's result.
    pub async fn run(
        &self,
        target: &TransferTarget,
        cancel: &CancellationToken,
        on_percent: PercentFn,
    ) -> PipelineOutcome {
        let mut run = Run::new(target);

        let links = match self.register(&mut run, cancel).await {
            Ok(Registered::Ready(links)) => links,
            Ok(Registered::Skipped) => return run.skipped(),
            Err(e) => return run.fail(e),
        };
        run.enter(TransferState::MetadataReady);

        let blob_url = match self.sink.resolve_blob_url(&links.upload_url) {
            Ok(url) => url,
            Err(e) => return run.fail(e),
        };
        let strategy = choose_strategy(target.size, self.tuning);
        run.strategy = Some(strategy);

        run.enter(TransferState::Uploading);
        let uploaded = async {
            let location = resolve_location(self.catalog, &target.file_id).await?;
            upload_file(
                self.catalog,
                self.sink,
                &location,
                &blob_url,
                target.size,
                strategy,
                on_percent,
            )
            .await
        }
        .await;
        if let Err(e) = uploaded {
            let e = match e {
                Error::UploadTransport { .. } => e,
                other => Error::transport(other.to_string()),
            };
            return run.fail(e);
        }

        run.enter(TransferState::Completing);
        if let Err(e) = self.metadata.finalize(&links.complete_url).await {
            return run.fail(Error::Finalize {
                message: e.to_string(),
            });
        }

        run.finish(TransferState::Done, None, Some(public_blob_url(&blob_url)))
    }

    async fn register(
        &self,
        run: &mut Run<'_>,
        cancel: &CancellationToken,
    ) -> crate::Result<Registered> {
        let target = run.target;
        let mut retry = BoundedRetry::new(self.pending);

        let first = self
            .metadata
            .register_upload(&target.folder_id, &target.display_name)
            .await?;
        let mut outcome = Ok(first);

        loop {
            match outcome {
                Ok(Registration::Ready(links)) => return Ok(Registered::Ready(links)),
                Ok(Registration::AlreadyMaterialized) => return Ok(Registered::Skipped),
                Ok(Registration::Pending) => run.enter(TransferState::MetadataPending),
                Err(e) => warn!(
                    event = "pipeline.registration_retry_failed",
                    file_id = %target.file_id,
                    attempt = retry.attempts(),
                    error = %e,
                    "pipeline.registration_retry_failed"
                ),
            }

            match retry.wait(cancel).await {
                RetryWait::Retry => {
                    debug!(
                        event = "pipeline.pending",
                        file_id = %target.file_id,
                        attempt = retry.attempts(),
                        max_attempts = retry.max_attempts(),
                        "pipeline.pending"
                    );
                }
                RetryWait::Exhausted => {
                    return Err(Error::MetadataTimeout {
                        attempts: retry.attempts(),
                    });
                }
                RetryWait::Cancelled => return Err(Error::Cancelled),
            }

            outcome = self
                .metadata
                .register_upload(&target.folder_id, &target.display_name)
                .await;
        }
    }
}
