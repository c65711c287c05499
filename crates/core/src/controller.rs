use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::time::Instant;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::{PendingPolicy, UploadTuning, clamp_concurrency};
use crate::pipeline::Pipeline;
use crate::progress::{Progress, ProgressSink};
use crate::report::{ResultLog, TransferResult, TransferStatus};
use crate::sink::BlobSink;
use crate::source::{MetadataService, SourceCatalog};
use crate::traversal::{TransferTarget, TraversalConfig, discover_targets};
use crate::upload::PercentFn;
use crate::{Error, Result};

/// The external services a run talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub catalog: Arc<dyn SourceCatalog>,
    pub metadata: Arc<dyn MetadataService>,
    pub sink: Arc<dyn BlobSink>,
}

#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub traversal: TraversalConfig,
    pub concurrency: usize,
    pub pending: PendingPolicy,
    pub tuning: UploadTuning,
}

#[derive(Default)]
pub struct TransferOptions<'a> {
    pub cancel: Option<&'a CancellationToken>,
    pub progress: Option<&'a dyn ProgressSink>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferReport {
    pub run_id: String,
    pub progress: Progress,
    pub results: Vec<TransferResult>,
    pub aborted: bool,
    pub folders_listed: u64,
    pub folders_failed: Vec<String>,
    pub duration_ms: u64,
}

impl TransferReport {
    pub fn succeeded(&self) -> u64 {
        self.progress.done
    }

    pub fn failed(&self) -> u64 {
        self.progress.errors
    }
}

enum WorkerEvent {
    Claimed {
        index: usize,
        worker: usize,
        file_name: String,
    },
    FileProgress {
        file_name: String,
        percent: u8,
    },
    Finished {
        index: usize,
        result: TransferResult,
    },
}

struct WorkerContext {
    collaborators: Collaborators,
    targets: Vec<TransferTarget>,
    cursor: AtomicUsize,
    cancel: CancellationToken,
    pending: PendingPolicy,
    tuning: UploadTuning,
}

/// Discovers targets under the configured root and transfers them.
pub async fn run_transfer(
    collaborators: &Collaborators,
    config: TransferConfig,
    options: TransferOptions<'_>,
) -> Result<TransferReport> {
    let started = Instant::now();
    let run_id = format!("run_{}", uuid::Uuid::new_v4());
    let cancel = options.cancel.cloned().unwrap_or_default();
    info!(
        event = "run.start",
        run_id = %run_id,
        root_folder_id = %config.traversal.root_folder_id,
        concurrency = clamp_concurrency(config.concurrency) as u64,
        sink = collaborators.sink.provider(),
        "run.start"
    );

    check_sink(collaborators)?;

    let discovery =
        discover_targets(collaborators.catalog.as_ref(), &config.traversal, &cancel).await?;
    if discovery.targets.is_empty() {
        if discovery.aborted {
            return Err(Error::Cancelled);
        }
        return Err(Error::precondition(format!(
            "no files matching {:?} under folder {}",
            config.traversal.extensions, config.traversal.root_folder_id
        )));
    }

    let (progress, results) = dispatch(
        collaborators,
        discovery.targets,
        &config,
        &cancel,
        options.progress,
    )
    .await?;

    let report = TransferReport {
        run_id,
        progress,
        results,
        aborted: cancel.is_cancelled(),
        folders_listed: discovery.folders_listed,
        folders_failed: discovery.folders_failed,
        duration_ms: started.elapsed().as_millis() as u64,
    };
    info!(
        event = "run.finish",
        run_id = %report.run_id,
        total = report.progress.total,
        done = report.progress.done,
        errors = report.progress.errors,
        aborted = report.aborted,
        folders_failed = report.folders_failed.len() as u64,
        duration_ms = report.duration_ms,
        "run.finish"
    );
    Ok(report)
}

/// Transfers an already enumerated target list.
pub async fn transfer_targets(
    collaborators: &Collaborators,
    targets: Vec<TransferTarget>,
    config: &TransferConfig,
    options: TransferOptions<'_>,
) -> Result<(Progress, Vec<TransferResult>)> {
    check_sink(collaborators)?;
    if targets.is_empty() {
        return Err(Error::precondition("target list is empty"));
    }
    let cancel = options.cancel.cloned().unwrap_or_default();
    dispatch(collaborators, targets, config, &cancel, options.progress).await
}

fn check_sink(collaborators: &Collaborators) -> Result<()> {
    if !collaborators.sink.is_authorized() {
        return Err(Error::precondition(
            "sink credentials missing (no SAS token for the container)",
        ));
    }
    Ok(())
}

async fn dispatch(
    collaborators: &Collaborators,
    targets: Vec<TransferTarget>,
    config: &TransferConfig,
    cancel: &CancellationToken,
    sink: Option<&dyn ProgressSink>,
) -> Result<(Progress, Vec<TransferResult>)> {
    let total = targets.len();
    let workers = clamp_concurrency(config.concurrency).min(total.max(1));
    let ctx = Arc::new(WorkerContext {
        collaborators: collaborators.clone(),
        targets,
        cursor: AtomicUsize::new(0),
        cancel: cancel.clone(),
        pending: config.pending.clone(),
        tuning: config.tuning.clone(),
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut set = JoinSet::new();
    for worker in 0..workers {
        set.spawn(worker_loop(worker, Arc::clone(&ctx), tx.clone()));
    }
    drop(tx);

    // Single writer for progress and results; workers only send events.
    let mut progress = Progress::new(total as u64);
    let mut log = ResultLog::new();
    let mut in_flight: BTreeMap<usize, String> = BTreeMap::new();
    if let Some(sink) = sink {
        sink.on_progress(&progress);
    }

    while let Some(event) = rx.recv().await {
        match event {
            WorkerEvent::Claimed {
                index,
                worker,
                file_name,
            } => {
                debug!(
                    event = "dispatch.claimed",
                    index = index as u64,
                    worker = worker as u64,
                    "dispatch.claimed"
                );
                progress.queued = progress.queued.saturating_sub(1);
                progress.current = Some(file_name.clone());
                in_flight.insert(index, file_name);
            }
            WorkerEvent::FileProgress { file_name, percent } => {
                if let Some(sink) = sink {
                    sink.on_file_progress(&file_name, percent);
                }
                continue;
            }
            WorkerEvent::Finished { index, result } => {
                in_flight.remove(&index);
                match result.status {
                    TransferStatus::Ok => progress.done += 1,
                    TransferStatus::Error => progress.errors += 1,
                }
                log.push(result);
            }
        }
        if let Some(sink) = sink {
            sink.on_progress(&progress);
        }
    }

    while let Some(joined) = set.join_next().await {
        if let Err(e) = joined {
            error!(
                event = "dispatch.worker_panicked",
                error = %e,
                "dispatch.worker_panicked"
            );
        }
    }

    // A claimed target whose worker died still gets its one outcome.
    for (index, file_name) in in_flight {
        let target = &ctx.targets[index];
        log.push(TransferResult {
            file_name,
            path: target.relative_path.clone(),
            size: Some(target.size),
            status: TransferStatus::Error,
            message: Some("worker stopped before the transfer finished".to_string()),
            blob_url: None,
        });
    }

    let (done, errors) = log.counts();
    progress.done = done;
    progress.errors = errors;
    progress.current = None;
    if let Some(sink) = sink {
        sink.on_progress(&progress);
    }
    Ok((progress, log.into_records()))
}

async fn worker_loop(
    worker: usize,
    ctx: Arc<WorkerContext>,
    tx: mpsc::UnboundedSender<WorkerEvent>,
) {
    let pipeline = Pipeline {
        catalog: ctx.collaborators.catalog.as_ref(),
        metadata: ctx.collaborators.metadata.as_ref(),
        sink: ctx.collaborators.sink.as_ref(),
        pending: &ctx.pending,
        tuning: &ctx.tuning,
    };

    loop {
        if ctx.cancel.is_cancelled() {
            debug!(
                event = "dispatch.worker_aborted",
                worker = worker as u64,
                "dispatch.worker_aborted"
            );
            break;
        }
        let index = ctx.cursor.fetch_add(1, Ordering::SeqCst);
        let Some(target) = ctx.targets.get(index) else {
            break;
        };

        let _ = tx.send(WorkerEvent::Claimed {
            index,
            worker,
            file_name: target.display_name.clone(),
        });

        let outcome = pipeline
            .run(target, &ctx.cancel, percent_reporter(&tx, &target.display_name))
            .await;
        let _ = tx.send(WorkerEvent::Finished {
            index,
            result: outcome.result,
        });
    }
}

/// Forwards byte progress to the controller, once per distinct percentage.
fn percent_reporter(tx: &mpsc::UnboundedSender<WorkerEvent>, file_name: &str) -> PercentFn {
    let tx = tx.clone();
    let file_name = file_name.to_string();
    let last = AtomicU8::new(u8::MAX);
    Arc::new(move |percent| {
        if last.swap(percent, Ordering::Relaxed) != percent {
            let _ = tx.send(WorkerEvent::FileProgress {
                file_name: file_name.clone(),
                percent,
            });
        }
    })
}
