use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ListingPolicy;
use crate::source::{ItemKind, SourceCatalog};
use crate::Result;

/// One remote file selected for transfer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferTarget {
    pub file_id: String,
    /// Folder the file was listed in; registration happens against it.
    pub folder_id: String,
    pub display_name: String,
    pub size: u64,
    pub relative_path: String,
}

#[derive(Debug, Clone)]
pub struct TraversalConfig {
    pub root_folder_id: String,
    pub extensions: Vec<String>,
    pub recursive: bool,
    pub listing_policy: ListingPolicy,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Discovery {
    pub targets: Vec<TransferTarget>,
    pub folders_listed: u64,
    pub folders_failed: Vec<String>,
    pub aborted: bool,
}

/// Lowercases extensions and gives each a leading dot.
pub fn normalize_extensions(extensions: &[String]) -> Vec<String> {
    let mut out: Vec<String> = extensions
        .iter()
        .map(|e| e.trim().to_lowercase())
        .filter(|e| !e.is_empty() && e != ".")
        .map(|e| if e.starts_with('.') { e } else { format!(".{e}") })
        .collect();
    out.sort();
    out.dedup();
    out
}

pub fn matches_extension(name: &str, normalized: &[String]) -> bool {
    let lower = name.to_lowercase();
    normalized.iter().any(|ext| lower.ends_with(ext.as_str()))
}

/// Breadth-first walk from the root folder. Abort is checked once per folder;
/// a folder already dequeued is always fully processed.
pub async fn discover_targets<C: SourceCatalog + ?Sized>(
    catalog: &C,
    config: &TraversalConfig,
    cancel: &CancellationToken,
) -> Result<Discovery> {
    let extensions = normalize_extensions(&config.extensions);
    let mut discovery = Discovery::default();
    let mut queue = VecDeque::from([(config.root_folder_id.clone(), ".".to_string())]);

    while let Some((folder_id, prefix)) = queue.pop_front() {
        if cancel.is_cancelled() {
            discovery.aborted = true;
            debug!(
                event = "traversal.aborted",
                pending_folders = queue.len() + 1,
                "traversal.aborted"
            );
            break;
        }

        let listing = match catalog.list_folder(&folder_id).await {
            Ok(listing) => listing,
            Err(e) => match config.listing_policy {
                ListingPolicy::BestEffort => {
                    warn!(
                        event = "traversal.folder_failed",
                        folder_id = %folder_id,
                        path = %prefix,
                        error = %e,
                        "traversal.folder_failed"
                    );
                    discovery.folders_failed.push(folder_id);
                    continue;
                }
                ListingPolicy::FailFast => return Err(e),
            },
        };
        discovery.folders_listed += 1;

        for item in listing.items {
            let name = item.display_name.as_deref().unwrap_or(&item.id);
            match item.kind {
                ItemKind::File => {
                    if matches_extension(name, &extensions) {
                        discovery.targets.push(TransferTarget {
                            display_name: name.to_string(),
                            file_id: item.id.clone(),
                            folder_id: folder_id.clone(),
                            size: item.size.unwrap_or(0),
                            relative_path: prefix.clone(),
                        });
                    }
                }
                ItemKind::Folder if config.recursive => {
                    let child_prefix = format!("{prefix}/{name}");
                    queue.push_back((item.id, child_prefix));
                }
                ItemKind::Folder => {}
            }
        }
    }

    debug!(
        event = "traversal.finish",
        targets = discovery.targets.len() as u64,
        folders_listed = discovery.folders_listed,
        folders_failed = discovery.folders_failed.len() as u64,
        aborted = discovery.aborted,
        "traversal.finish"
    );
    Ok(discovery)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{FolderItem, InMemorySource};

    fn config(exts: &[&str], recursive: bool) -> TraversalConfig {
        TraversalConfig {
            root_folder_id: "root".to_string(),
            extensions: exts.iter().map(|e| e.to_string()).collect(),
            recursive,
            listing_policy: ListingPolicy::BestEffort,
        }
    }

    fn tree() -> InMemorySource {
        InMemorySource::new()
            .with_folder(
                "root",
                vec![
                    FolderItem::file("f1", "Plan.PDF", 10),
                    FolderItem::file("f2", "notes.txt", 5),
                    FolderItem::file("f3", "model.dwg", 20),
                    FolderItem::folder("d1", Some("Level 1")),
                    FolderItem::folder("d2", None),
                ],
            )
            .with_folder(
                "d1",
                vec![
                    FolderItem::file("f4", "detail.pdf", 1),
                    FolderItem::folder("d3", Some("Sub")),
                ],
            )
            .with_folder("d2", vec![FolderItem::file("f5", "x.pdf", 2)])
            .with_folder("d3", vec![FolderItem::file("f6", "deep.PdF", 3)])
    }

    #[test]
    fn extensions_are_normalized() {
        let exts = normalize_extensions(&[
            "PDF".to_string(),
            ".dwg".to_string(),
            " .pdf ".to_string(),
            "".to_string(),
        ]);
        assert_eq!(exts, vec![".dwg".to_string(), ".pdf".to_string()]);
        assert!(matches_extension("A.PDF", &exts));
        assert!(!matches_extension("pdf", &exts));
    }

    #[tokio::test]
    async fn flat_folder_counts_only_matching_files() {
        let src = tree();
        let cancel = CancellationToken::new();
        let d = discover_targets(&src, &config(&["pdf", "dwg"], false), &cancel)
            .await
            .unwrap();
        let names: Vec<_> = d.targets.iter().map(|t| t.display_name.as_str()).collect();
        assert_eq!(names, vec!["Plan.PDF", "model.dwg"]);
        assert!(d.targets.iter().all(|t| t.relative_path == "."));
        assert_eq!(d.folders_listed, 1);
    }

    #[tokio::test]
    async fn recursive_walk_is_breadth_first_with_paths() {
        let src = tree();
        let cancel = CancellationToken::new();
        let d = discover_targets(&src, &config(&[".pdf"], true), &cancel)
            .await
            .unwrap();
        let got: Vec<_> = d
            .targets
            .iter()
            .map(|t| (t.display_name.as_str(), t.relative_path.as_str()))
            .collect();
        assert_eq!(
            got,
            vec![
                ("Plan.PDF", "."),
                ("detail.pdf", "./Level 1"),
                ("x.pdf", "./d2"),
                ("deep.PdF", "./Level 1/Sub"),
            ]
        );
        assert_eq!(d.targets[1].folder_id, "d1");
    }

    #[tokio::test]
    async fn repeated_walks_yield_the_same_set() {
        let src = tree();
        let cancel = CancellationToken::new();
        let cfg = config(&["pdf"], true);
        let mut a = discover_targets(&src, &cfg, &cancel).await.unwrap().targets;
        let mut b = discover_targets(&src, &cfg, &cancel).await.unwrap().targets;
        a.sort_by(|x, y| x.file_id.cmp(&y.file_id));
        b.sort_by(|x, y| x.file_id.cmp(&y.file_id));
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn failed_folder_is_skipped_in_best_effort_mode() {
        let src = tree().with_failing_folder("d1");
        let cancel = CancellationToken::new();
        let d = discover_targets(&src, &config(&["pdf"], true), &cancel)
            .await
            .unwrap();
        let ids: Vec<_> = d.targets.iter().map(|t| t.file_id.as_str()).collect();
        assert_eq!(ids, vec!["f1", "f5"]);
        assert_eq!(d.folders_failed, vec!["d1".to_string()]);
    }

    #[tokio::test]
    async fn failed_folder_aborts_discovery_in_fail_fast_mode() {
        let src = tree().with_failing_folder("d2");
        let cancel = CancellationToken::new();
        let mut cfg = config(&["pdf"], true);
        cfg.listing_policy = ListingPolicy::FailFast;
        let err = discover_targets(&src, &cfg, &cancel).await.unwrap_err();
        assert!(matches!(err, crate::Error::Traversal { ref folder_id, .. } if folder_id == "d2"));
    }

    #[tokio::test]
    async fn cancelled_walk_stops_before_listing() {
        let src = tree();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let d = discover_targets(&src, &config(&["pdf"], true), &cancel)
            .await
            .unwrap();
        assert!(d.aborted);
        assert!(d.targets.is_empty());
        assert_eq!(src.list_calls.load(std::sync::atomic::Ordering::Relaxed), 0);
    }
}
