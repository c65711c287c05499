use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::Ordering;
use std::time::Duration;

use blobferry_core::config::{ListingPolicy, PendingPolicy, UploadTuning};
use blobferry_core::{
    Collaborators, Error, FolderItem, InMemorySink, InMemorySource, Progress, ProgressSink,
    ScriptedRegistration, TransferConfig, TransferOptions, TraversalConfig, parse_csv,
    run_transfer, to_csv,
};

const MIB: u64 = 1024 * 1024;

fn config(exts: &[&str], concurrency: usize) -> TransferConfig {
    TransferConfig {
        traversal: TraversalConfig {
            root_folder_id: "root".to_string(),
            extensions: exts.iter().map(|e| e.to_string()).collect(),
            recursive: true,
            listing_policy: ListingPolicy::BestEffort,
        },
        concurrency,
        pending: PendingPolicy {
            interval: Duration::from_millis(2),
            max_attempts: 5,
        },
        tuning: UploadTuning::default(),
    }
}

fn collaborators(src: Arc<InMemorySource>, sink: Arc<InMemorySink>) -> Collaborators {
    Collaborators {
        catalog: src.clone(),
        metadata: src,
        sink,
    }
}

#[derive(Default)]
struct RecordingSink {
    snapshots: Mutex<Vec<Progress>>,
    file_percents: Mutex<Vec<(String, u8)>>,
}

impl ProgressSink for RecordingSink {
    fn on_progress(&self, progress: &Progress) {
        self.snapshots.lock().unwrap().push(progress.clone());
    }

    fn on_file_progress(&self, file_name: &str, percent: u8) {
        self.file_percents
            .lock()
            .unwrap()
            .push((file_name.to_string(), percent));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn small_file_takes_the_single_shot_path() {
    let src = Arc::new(
        InMemorySource::new().with_folder("root", vec![FolderItem::file("f1", "plan.pdf", 10 * MIB)]),
    );
    let sink = Arc::new(InMemorySink::new());
    let progress = RecordingSink::default();

    let report = run_transfer(
        &collaborators(src.clone(), sink.clone()),
        config(&["pdf"], 4),
        TransferOptions {
            cancel: None,
            progress: Some(&progress),
        },
    )
    .await
    .unwrap();

    assert_eq!(report.results.len(), 1);
    let r = &report.results[0];
    assert!(r.is_ok());
    assert_eq!(r.size, Some(10 * MIB));
    let blob_url = r.blob_url.as_deref().unwrap();
    assert_eq!(blob_url, "https://sink.test/container/root/plan.pdf");

    let stored = sink.get(blob_url).await.unwrap();
    assert_eq!(stored.len, 10 * MIB);
    assert_eq!(stored.blocks, 0);
    let bytes = stored.bytes.unwrap();
    assert_eq!(bytes[5000], InMemorySource::content_byte(5000));
    assert_eq!(sink.put_blob_calls.load(Ordering::Relaxed), 1);
    assert_eq!(sink.put_block_calls.load(Ordering::Relaxed), 0);
    assert_eq!(src.finalize_calls.load(Ordering::Relaxed), 1);

    let percents = progress.file_percents.lock().unwrap();
    assert_eq!(percents.first().map(|(_, p)| *p), Some(0));
    assert_eq!(percents.last().map(|(_, p)| *p), Some(100));
    assert!(percents.windows(2).all(|w| w[0].1 < w[1].1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn large_file_takes_the_chunked_path() {
    let src = Arc::new(
        InMemorySource::new().with_folder("root", vec![FolderItem::file("f1", "site.dwg", 500 * MIB)]),
    );
    let sink = Arc::new(InMemorySink::new().with_delay(Duration::from_millis(5)));

    let report = run_transfer(
        &collaborators(src.clone(), sink.clone()),
        config(&["dwg"], 4),
        TransferOptions::default(),
    )
    .await
    .unwrap();

    let r = &report.results[0];
    assert!(r.is_ok(), "{:?}", r.message);
    let stored = sink.get(r.blob_url.as_deref().unwrap()).await.unwrap();
    assert_eq!(stored.len, 500 * MIB);
    assert_eq!(stored.blocks, 63);
    assert_eq!(sink.put_block_calls.load(Ordering::Relaxed), 63);
    assert_eq!(sink.commit_calls.load(Ordering::Relaxed), 1);
    assert_eq!(sink.put_blob_calls.load(Ordering::Relaxed), 0);

    let max_in_flight = sink.max_in_flight.load(Ordering::SeqCst);
    assert!(max_in_flight <= 4);
    assert!(max_in_flight >= 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_block_fails_only_that_target() {
    let src = Arc::new(InMemorySource::new().with_folder(
        "root",
        vec![
            FolderItem::file("f1", "big.dwg", 300 * MIB),
            FolderItem::file("f2", "small.dwg", MIB),
        ],
    ));
    let sink = Arc::new(InMemorySink::new().with_failing_block(3));

    let report = run_transfer(
        &collaborators(src.clone(), sink.clone()),
        config(&["dwg"], 1),
        TransferOptions::default(),
    )
    .await
    .unwrap();

    assert_eq!(report.progress.total, 2);
    assert_eq!(report.progress.done, 1);
    assert_eq!(report.progress.errors, 1);
    let big = report
        .results
        .iter()
        .find(|r| r.file_name == "big.dwg")
        .unwrap();
    assert!(!big.is_ok());
    assert!(big.message.as_deref().unwrap().starts_with("upload failed"));
    assert_eq!(sink.commit_calls.load(Ordering::Relaxed), 0);
    assert_eq!(src.finalize_calls.load(Ordering::Relaxed), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mixed_outcomes_account_for_every_target() {
    let src = Arc::new(
        InMemorySource::new()
            .with_folder(
                "root",
                vec![
                    FolderItem::file("f1", "a.pdf", 100),
                    FolderItem::file("f2", "b.pdf", 100),
                    FolderItem::file("f3", "c.pdf", 100),
                    FolderItem::file("f4", "d.pdf", 100),
                    FolderItem::folder("broken", Some("Broken")),
                    FolderItem::folder("d1", Some("Sub")),
                ],
            )
            .with_folder("d1", vec![FolderItem::file("f5", "e.pdf", 100)])
            .with_failing_folder("broken")
            .with_registrations("b.pdf", vec![ScriptedRegistration::Pending; 100])
            .with_registrations("c.pdf", vec![ScriptedRegistration::Skip])
            .with_failing_finalize("d.pdf"),
    );
    let sink = Arc::new(InMemorySink::new());
    let progress = RecordingSink::default();

    let report = run_transfer(
        &collaborators(src.clone(), sink.clone()),
        config(&["pdf"], 3),
        TransferOptions {
            cancel: None,
            progress: Some(&progress),
        },
    )
    .await
    .unwrap();

    assert_eq!(report.progress.total, 5);
    assert_eq!(report.progress.done + report.progress.errors, 5);
    assert_eq!(report.progress.done, 3);
    assert_eq!(report.progress.errors, 2);
    assert_eq!(report.progress.queued, 0);
    assert!(!report.aborted);
    assert_eq!(report.folders_failed, vec!["broken".to_string()]);

    let by_name = |n: &str| report.results.iter().find(|r| r.file_name == n).unwrap();
    assert!(by_name("b.pdf").message.as_deref().unwrap().contains("not ready after 5"));
    assert!(by_name("c.pdf").is_ok());
    assert_eq!(by_name("c.pdf").blob_url, None);
    assert!(by_name("d.pdf").message.as_deref().unwrap().contains("orphaned"));
    assert_eq!(by_name("e.pdf").path, "./Sub");

    for p in progress.snapshots.lock().unwrap().iter() {
        assert!(p.done + p.errors <= p.total);
    }

    let parsed = parse_csv(&to_csv(&report.results)).unwrap();
    assert_eq!(parsed, report.results);
}

#[tokio::test]
async fn missing_sink_credentials_stop_the_run_before_listing() {
    let src = Arc::new(InMemorySource::new().with_folder("root", vec![FolderItem::file("f1", "a.pdf", 1)]));
    let sink = Arc::new(InMemorySink::unauthorized());

    let err = run_transfer(
        &collaborators(src.clone(), sink),
        config(&["pdf"], 2),
        TransferOptions::default(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, Error::Precondition { .. }));
    assert_eq!(src.list_calls.load(Ordering::Relaxed), 0);
}

#[tokio::test]
async fn empty_target_set_is_a_precondition_failure() {
    let src = Arc::new(InMemorySource::new().with_folder("root", vec![FolderItem::file("f1", "a.txt", 1)]));
    let sink = Arc::new(InMemorySink::new());

    let err = run_transfer(
        &collaborators(src.clone(), sink.clone()),
        config(&["pdf"], 2),
        TransferOptions::default(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, Error::Precondition { .. }));
    assert_eq!(src.register_calls.load(Ordering::Relaxed), 0);
}
