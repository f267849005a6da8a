//! File enumerator.
//!
//! Walks each dataset's source tree directory-at-a-time and feeds
//! `FileUnit`s into the first bounded queue. Never materializes the
//! full file list: only one directory's entries are held in memory at
//! a time (needed for chunk grouping). This is the only stage that
//! listens for cancellation; stopping it closes the queue and lets the
//! rest of the pipeline drain naturally.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sleet_common::emit;
use sleet_common::metrics::events::{FailureStage, FilesEnumerated, ResumedEntitiesSkipped};
use sleet_common::queue::StageSender;

use crate::config::{ChunkConfig, DatasetConfig, DatasetKey, KeyConfig};
use crate::pipeline::types::{FileUnit, RunCounters};
use crate::quarantine::FailureTracker;

/// One dataset's enumeration input.
pub struct DatasetSource {
    pub key: DatasetKey,
    pub config: DatasetConfig,
    /// Entity keys already in the sink; set on resumed runs.
    pub resume_keys: Option<HashSet<String>>,
}

/// Spawn the enumerator task.
///
/// The task drops `file_tx` when every dataset is exhausted or
/// cancellation is requested, which starts the drain cascade.
pub fn spawn(
    sources: Vec<DatasetSource>,
    file_tx: StageSender<FileUnit>,
    cancel: CancellationToken,
    counters: Arc<RunCounters>,
    tracker: Arc<FailureTracker>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        for source in sources {
            if cancel.is_cancelled() {
                break;
            }
            enumerate_dataset(&source, &file_tx, &cancel, &counters, &tracker).await;
        }
        debug!("[enumerate] Enumeration finished");
        // file_tx drops here; IO workers drain and exit.
    })
}

async fn enumerate_dataset(
    source: &DatasetSource,
    file_tx: &StageSender<FileUnit>,
    cancel: &CancellationToken,
    counters: &RunCounters,
    tracker: &FailureTracker,
) {
    let root = PathBuf::from(&source.config.source);
    info!(dataset = %source.key, path = %root.display(), "Enumerating dataset");

    let mut resumed = 0u64;
    let mut dirs = vec![root];
    while let Some(dir) = dirs.pop() {
        if cancel.is_cancelled() {
            debug!(dataset = %source.key, "[enumerate] Cancelled, stopping traversal");
            break;
        }

        let listing = match list_directory(&dir, source.config.chunks.as_ref()).await {
            Ok(listing) => listing,
            Err(e) => {
                warn!(dataset = %source.key, dir = %dir.display(), "Failed to list directory: {e}");
                if tracker
                    .record_failure(
                        &dir.display().to_string(),
                        source.key.id(),
                        &e.to_string(),
                        FailureStage::Enumerate,
                    )
                    .await
                    .is_err()
                {
                    return;
                }
                continue;
            }
        };

        dirs.extend(listing.subdirs);

        // Orphan chunks have no main file to ride along with; they
        // still need a terminal outcome.
        for orphan in listing.orphan_chunks {
            RunCounters::add(&counters.files_enumerated, 1);
            RunCounters::add(&counters.files_failed, 1);
            if tracker
                .record_failure(
                    &orphan.display().to_string(),
                    source.key.id(),
                    "chunk file without a main document",
                    FailureStage::Enumerate,
                )
                .await
                .is_err()
            {
                return;
            }
        }

        for group in listing.groups {
            if cancel.is_cancelled() {
                break;
            }

            let physical = 1 + group.chunk_paths.len() as u64;
            RunCounters::add(&counters.files_enumerated, physical);
            emit!(FilesEnumerated {
                count: physical,
                dataset: source.key.to_string(),
            });

            let Some(entity_key) = derive_entity_key(&group.stem, &source.config.key) else {
                RunCounters::add(&counters.files_failed, physical);
                if tracker
                    .record_failure(
                        &group.path.display().to_string(),
                        source.key.id(),
                        "file name yields an empty entity key",
                        FailureStage::Enumerate,
                    )
                    .await
                    .is_err()
                {
                    return;
                }
                continue;
            };

            if let Some(keys) = &source.resume_keys {
                if keys.contains(&entity_key) {
                    resumed += physical;
                    RunCounters::add(&counters.files_resumed_skipped, physical);
                    continue;
                }
            }

            let unit = FileUnit {
                dataset: source.key.clone(),
                entity_key,
                path: group.path,
                chunk_paths: group.chunk_paths,
                size: group.size,
            };

            if file_tx.send(unit).await.is_err() {
                debug!(dataset = %source.key, "[enumerate] Downstream closed, stopping");
                return;
            }
        }
    }

    if resumed > 0 {
        info!(dataset = %source.key, resumed, "Skipped already-loaded entities");
        emit!(ResumedEntitiesSkipped {
            count: resumed,
            dataset: source.key.to_string(),
        });
    }
}

/// A main file and its grouped chunk siblings.
#[derive(Debug)]
struct FileGroup {
    /// File stem of the main file (name without extension).
    stem: String,
    path: PathBuf,
    chunk_paths: Vec<PathBuf>,
    size: u64,
}

#[derive(Debug, Default)]
struct DirectoryListing {
    groups: Vec<FileGroup>,
    subdirs: Vec<PathBuf>,
    orphan_chunks: Vec<PathBuf>,
}

/// List one directory, grouping chunk siblings under their main file.
async fn list_directory(
    dir: &Path,
    chunks: Option<&ChunkConfig>,
) -> std::io::Result<DirectoryListing> {
    let mut listing = DirectoryListing::default();
    let mut mains: Vec<(String, PathBuf, u64)> = Vec::new();
    let mut chunk_map: BTreeMap<String, Vec<(PathBuf, u64)>> = BTreeMap::new();

    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let file_type = entry.file_type().await?;
        if file_type.is_dir() {
            listing.subdirs.push(path);
            continue;
        }
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
            continue;
        };
        let size = entry.metadata().await.map(|m| m.len()).unwrap_or(0);

        match chunks {
            Some(cfg) => match split_chunk_stem(&stem, &cfg.suffix) {
                Some(main_stem) => chunk_map
                    .entry(main_stem.to_string())
                    .or_default()
                    .push((path, size)),
                None => mains.push((stem, path, size)),
            },
            None => mains.push((stem, path, size)),
        }
    }

    // Deterministic order within a directory.
    mains.sort_by(|a, b| a.0.cmp(&b.0));

    for (stem, path, size) in mains {
        let mut total = size;
        let chunk_paths = match chunk_map.remove(&stem) {
            Some(mut chunk_files) => {
                chunk_files.sort_by(|a, b| a.0.cmp(&b.0));
                chunk_files
                    .into_iter()
                    .map(|(path, size)| {
                        total += size;
                        path
                    })
                    .collect()
            }
            None => Vec::new(),
        };
        listing.groups.push(FileGroup {
            stem,
            path,
            chunk_paths,
            size: total,
        });
    }

    // Whatever is left in the chunk map has no matching main file.
    for (_, chunk_files) in chunk_map {
        for (path, _) in chunk_files {
            listing.orphan_chunks.push(path);
        }
    }

    Ok(listing)
}

/// Split a chunk file stem into its main-file stem, if it is a chunk.
///
/// `CIK0000320193-submissions-001` with suffix `-submissions` yields
/// `CIK0000320193`.
fn split_chunk_stem<'a>(stem: &'a str, suffix: &str) -> Option<&'a str> {
    let idx = stem.find(suffix)?;
    let rest = &stem[idx + suffix.len()..];
    // Chunk ordinal follows the suffix: "-NNN" or empty.
    if rest.is_empty() || rest.starts_with('-') {
        Some(&stem[..idx])
    } else {
        None
    }
}

/// Derive the entity key from a main file's stem.
pub fn derive_entity_key(stem: &str, config: &KeyConfig) -> Option<String> {
    let mut key = stem;
    if let Some(prefix) = &config.strip_prefix {
        key = key.strip_prefix(prefix.as_str()).unwrap_or(key);
    }
    if let Some(suffix) = &config.strip_suffix {
        key = key.strip_suffix(suffix.as_str()).unwrap_or(key);
    }
    if key.is_empty() {
        return None;
    }
    if let Some(width) = config.zero_pad {
        if let Ok(numeric) = key.parse::<u64>() {
            return Some(format!("{numeric:0width$}"));
        }
    }
    Some(key.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_key_plain() {
        let config = KeyConfig::default();
        assert_eq!(derive_entity_key("report", &config), Some("report".into()));
    }

    #[test]
    fn test_derive_key_strips_prefix() {
        let config = KeyConfig {
            strip_prefix: Some("CIK".into()),
            ..KeyConfig::default()
        };
        assert_eq!(
            derive_entity_key("CIK0000320193", &config),
            Some("0000320193".into())
        );
    }

    #[test]
    fn test_derive_key_zero_pads_numeric() {
        let config = KeyConfig {
            strip_prefix: Some("CIK".into()),
            zero_pad: Some(10),
            ..KeyConfig::default()
        };
        assert_eq!(
            derive_entity_key("CIK320193", &config),
            Some("0000320193".into())
        );
    }

    #[test]
    fn test_derive_key_empty_is_none() {
        let config = KeyConfig {
            strip_prefix: Some("CIK".into()),
            ..KeyConfig::default()
        };
        assert_eq!(derive_entity_key("CIK", &config), None);
    }

    #[test]
    fn test_split_chunk_stem() {
        assert_eq!(
            split_chunk_stem("CIK1-submissions-001", "-submissions"),
            Some("CIK1")
        );
        assert_eq!(
            split_chunk_stem("CIK1-submissions", "-submissions"),
            Some("CIK1")
        );
        assert_eq!(split_chunk_stem("CIK1", "-submissions"), None);
        // Suffix must be followed by an ordinal separator or nothing.
        assert_eq!(split_chunk_stem("CIK1-submissionsx", "-submissions"), None);
    }

    #[tokio::test]
    async fn test_list_directory_groups_chunks() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "CIK1.json",
            "CIK1-submissions-001.json",
            "CIK1-submissions-002.json",
            "CIK2.json",
            "CIK3-submissions-001.json",
            "notes.txt",
        ] {
            std::fs::write(dir.path().join(name), b"{}").unwrap();
        }
        std::fs::create_dir(dir.path().join("nested")).unwrap();

        let chunks = ChunkConfig {
            suffix: "-submissions".into(),
            merge_path: "filings.recent".into(),
        };
        let listing = list_directory(dir.path(), Some(&chunks)).await.unwrap();

        assert_eq!(listing.groups.len(), 2);
        assert_eq!(listing.groups[0].stem, "CIK1");
        assert_eq!(listing.groups[0].chunk_paths.len(), 2);
        assert!(
            listing.groups[0].chunk_paths[0]
                .to_string_lossy()
                .ends_with("001.json")
        );
        assert_eq!(listing.groups[1].stem, "CIK2");
        assert!(listing.groups[1].chunk_paths.is_empty());
        // CIK3 chunk has no main file.
        assert_eq!(listing.orphan_chunks.len(), 1);
        assert_eq!(listing.subdirs.len(), 1);
    }

    #[tokio::test]
    async fn test_list_directory_without_chunk_config() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.json", "b.json"] {
            std::fs::write(dir.path().join(name), b"{}").unwrap();
        }
        let listing = list_directory(dir.path(), None).await.unwrap();
        assert_eq!(listing.groups.len(), 2);
        assert!(listing.orphan_chunks.is_empty());
    }
}
