//! Parse worker pool.
//!
//! M workers deserialize raw payloads into normalized records:
//! structural validation (valid JSON, object root), chunk merging for
//! grouped datasets, and field-name normalization. Malformed input is
//! a counted skip, never a fault; parsing is pure per record with no
//! shared mutable state between workers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use sleet_common::emit;
use sleet_common::metrics::events::{
    FailureStage, FileProcessed, FileStatus, ParseCompleted, RecordsParsed,
};
use sleet_common::queue::{StageReceiver, StageSender};

use crate::config::{ChunkConfig, DatasetKey};
use crate::error::ParseError;
use crate::mapping::FieldMapping;
use crate::pipeline::types::{ParsedRecord, RawPayload, RunCounters};
use crate::quarantine::QuarantineWriter;

/// Per-dataset parsing rules, shared read-only by all workers.
pub struct ParseSpec {
    pub mapping: Arc<FieldMapping>,
    pub chunks: Option<ChunkConfig>,
    /// Top-level fields that must be present and non-empty, checked
    /// against the raw field names before normalization.
    pub required: Vec<String>,
}

pub type ParseSpecs = Arc<HashMap<DatasetKey, ParseSpec>>;

/// Spawn the parse worker pool.
///
/// Records are routed to aggregator shards by dataset-tag hash so each
/// tag always lands on the same shard (single writer per tag).
pub fn spawn_pool(
    workers: usize,
    payload_rx: StageReceiver<RawPayload>,
    shard_txs: Vec<StageSender<ParsedRecord>>,
    specs: ParseSpecs,
    counters: Arc<RunCounters>,
    quarantine: Option<Arc<QuarantineWriter>>,
) -> Vec<JoinHandle<()>> {
    (0..workers)
        .map(|worker| {
            let payload_rx = payload_rx.clone();
            let shard_txs = shard_txs.clone();
            let specs = Arc::clone(&specs);
            let counters = Arc::clone(&counters);
            let quarantine = quarantine.clone();
            tokio::spawn(async move {
                run_worker(worker, payload_rx, shard_txs, specs, counters, quarantine).await;
            })
        })
        .collect()
}

async fn run_worker(
    worker: usize,
    payload_rx: StageReceiver<RawPayload>,
    shard_txs: Vec<StageSender<ParsedRecord>>,
    specs: ParseSpecs,
    counters: Arc<RunCounters>,
    quarantine: Option<Arc<QuarantineWriter>>,
) {
    while let Some(payload) = payload_rx.recv().await {
        let dataset = payload.unit.dataset.clone();
        let path = payload.unit.path.clone();
        let physical = payload.unit.physical_files();
        let start = Instant::now();

        let spec_chunks = specs
            .get(&dataset)
            .and_then(|spec| spec.chunks.clone());
        let mapping = specs
            .get(&dataset)
            .map(|spec| Arc::clone(&spec.mapping))
            .unwrap_or_default();
        let required = specs
            .get(&dataset)
            .map(|spec| spec.required.clone())
            .unwrap_or_default();

        // JSON deserialization of multi-megabyte documents is CPU-bound;
        // keep it off the async worker threads.
        let parsed = tokio::task::spawn_blocking(move || {
            parse_payload(payload, spec_chunks.as_ref(), &mapping, &required)
        })
        .await;

        let record = match parsed {
            Ok(Ok(record)) => record,
            Ok(Err(e)) => {
                RunCounters::add(&counters.files_skipped, physical);
                emit!(FileProcessed {
                    status: FileStatus::Skipped,
                    count: physical,
                    dataset: dataset.to_string(),
                });
                warn!(dataset = %dataset, path = %path.display(), "Skipping malformed input: {e}");
                if let Some(quarantine) = &quarantine {
                    quarantine
                        .record_failure(
                            &path.display().to_string(),
                            dataset.id(),
                            &e.to_string(),
                            FailureStage::Parse,
                        )
                        .await;
                }
                continue;
            }
            Err(join_error) => {
                // A panicking parse task is handled like malformed input
                // so the unit still reaches a terminal outcome.
                RunCounters::add(&counters.files_skipped, physical);
                emit!(FileProcessed {
                    status: FileStatus::Skipped,
                    count: physical,
                    dataset: dataset.to_string(),
                });
                warn!(dataset = %dataset, path = %path.display(), "Parse task failed: {join_error}");
                continue;
            }
        };

        RunCounters::add(&counters.files_parsed, physical);
        emit!(RecordsParsed {
            count: 1,
            dataset: dataset.to_string(),
        });
        emit!(ParseCompleted {
            duration: start.elapsed(),
            dataset: dataset.to_string(),
        });

        let shard = shard_for(&dataset, shard_txs.len());
        if shard_txs[shard].send(record).await.is_err() {
            debug!("[parse:{worker}] Downstream closed, stopping");
            return;
        }
    }
    debug!("[parse:{worker}] Upstream closed, worker exiting");
}

/// Assign a dataset tag to an aggregator shard (FNV-1a over the tag).
pub fn shard_for(dataset: &DatasetKey, shards: usize) -> usize {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = FNV_OFFSET;
    for byte in dataset.id().bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    (hash % shards as u64) as usize
}

/// Validate, merge, and normalize one payload into a record.
fn parse_payload(
    payload: RawPayload,
    chunks: Option<&ChunkConfig>,
    mapping: &FieldMapping,
    required: &[String],
) -> Result<ParsedRecord, ParseError> {
    let path = payload.unit.path.display().to_string();
    let approx_bytes = payload.body.len()
        + payload
            .chunk_bodies
            .iter()
            .map(bytes::Bytes::len)
            .sum::<usize>();

    let mut document: Value =
        serde_json::from_slice(&payload.body).map_err(|e| ParseError::InvalidJson {
            path: path.clone(),
            message: e.to_string(),
        })?;
    if !document.is_object() {
        return Err(ParseError::NotAnObject { path });
    }

    if let Some(cfg) = chunks {
        for (chunk_path, body) in payload.unit.chunk_paths.iter().zip(&payload.chunk_bodies) {
            let chunk: Value =
                serde_json::from_slice(body).map_err(|e| ParseError::InvalidJson {
                    path: chunk_path.display().to_string(),
                    message: e.to_string(),
                })?;
            merge_chunk(&mut document, &chunk, cfg, &path)?;
        }
    }

    for field in required {
        if !field_present(&document, field) {
            return Err(ParseError::MissingField {
                path: path.clone(),
                field: field.clone(),
            });
        }
    }

    mapping.apply(&mut document);

    let physical_files = payload.unit.physical_files();
    Ok(ParsedRecord {
        dataset: payload.unit.dataset,
        entity_key: payload.unit.entity_key,
        document,
        approx_bytes,
        physical_files,
    })
}

/// A required field counts as present when it has a non-empty value.
fn field_present(document: &Value, field: &str) -> bool {
    match document.get(field) {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Object(o)) => !o.is_empty(),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(_) => true,
    }
}

/// Append a chunk's list fields into the main document at `merge_path`.
///
/// The chunk is an object of field -> array; each array is appended to
/// the matching array under the merge target (created when absent), so
/// older entries follow the main document's recent ones.
fn merge_chunk(
    document: &mut Value,
    chunk: &Value,
    cfg: &ChunkConfig,
    path: &str,
) -> Result<(), ParseError> {
    let Value::Object(chunk_fields) = chunk else {
        return Err(ParseError::ChunkMerge {
            path: path.to_string(),
            merge_path: cfg.merge_path.clone(),
            message: "chunk root is not an object".to_string(),
        });
    };

    // Walk to the merge target, creating intermediate objects.
    let mut target = &mut *document;
    for segment in cfg.merge_path.split('.') {
        let Value::Object(object) = target else {
            return Err(ParseError::ChunkMerge {
                path: path.to_string(),
                merge_path: cfg.merge_path.clone(),
                message: format!("'{segment}' parent is not an object"),
            });
        };
        target = object
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
    }
    let Value::Object(target) = target else {
        return Err(ParseError::ChunkMerge {
            path: path.to_string(),
            merge_path: cfg.merge_path.clone(),
            message: "merge target is not an object".to_string(),
        });
    };

    for (field, values) in chunk_fields {
        let Value::Array(values) = values else {
            return Err(ParseError::ChunkMerge {
                path: path.to_string(),
                merge_path: cfg.merge_path.clone(),
                message: format!("chunk field '{field}' is not an array"),
            });
        };
        let entry = target
            .entry(field.clone())
            .or_insert_with(|| Value::Array(Vec::new()));
        let Value::Array(entry) = entry else {
            return Err(ParseError::ChunkMerge {
                path: path.to_string(),
                merge_path: cfg.merge_path.clone(),
                message: format!("target field '{field}' is not an array"),
            });
        };
        entry.extend(values.iter().cloned());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use serde_json::json;
    use std::path::PathBuf;

    use crate::pipeline::types::FileUnit;

    fn payload(body: &str, chunks: Vec<&str>) -> RawPayload {
        let chunk_paths = (0..chunks.len())
            .map(|i| PathBuf::from(format!("/data/CIK1-submissions-{i:03}.json")))
            .collect();
        RawPayload {
            unit: FileUnit {
                dataset: DatasetKey::new("submissions"),
                entity_key: "1".to_string(),
                path: PathBuf::from("/data/CIK1.json"),
                chunk_paths,
                size: 0,
            },
            body: Bytes::from(body.to_string()),
            chunk_bodies: chunks
                .into_iter()
                .map(|c| Bytes::from(c.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_parse_plain_document() {
        let record =
            parse_payload(
                payload(r#"{"cik": 1}"#, vec![]),
                None,
                &FieldMapping::identity(),
                &[],
            )
            .unwrap();
        assert_eq!(record.entity_key, "1");
        assert_eq!(record.document, json!({"cik": 1}));
        assert_eq!(record.physical_files, 1);
    }

    #[test]
    fn test_invalid_json_is_parse_error() {
        let result = parse_payload(
            payload("{not json", vec![]),
            None,
            &FieldMapping::identity(),
            &[],
        );
        assert!(matches!(result, Err(ParseError::InvalidJson { .. })));
    }

    #[test]
    fn test_non_object_root_is_parse_error() {
        let result = parse_payload(
            payload("[1, 2]", vec![]),
            None,
            &FieldMapping::identity(),
            &[],
        );
        assert!(matches!(result, Err(ParseError::NotAnObject { .. })));
    }

    #[test]
    fn test_chunk_merge_appends_lists() {
        let cfg = ChunkConfig {
            suffix: "-submissions".into(),
            merge_path: "filings.recent".into(),
        };
        let main = r#"{"cik": 1, "filings": {"recent": {"form": ["10-K"], "date": ["2024-01-01"]}}}"#;
        let chunk = r#"{"form": ["10-Q", "8-K"], "date": ["2023-09-01", "2023-06-01"]}"#;

        let record = parse_payload(
            payload(main, vec![chunk]),
            Some(&cfg),
            &FieldMapping::identity(),
            &[],
        )
        .unwrap();

        assert_eq!(
            record.document["filings"]["recent"]["form"],
            json!(["10-K", "10-Q", "8-K"])
        );
        assert_eq!(record.physical_files, 2);
    }

    #[test]
    fn test_chunk_merge_creates_missing_target() {
        let cfg = ChunkConfig {
            suffix: "-submissions".into(),
            merge_path: "filings.recent".into(),
        };
        let record = parse_payload(
            payload(r#"{"cik": 1}"#, vec![r#"{"form": ["10-K"]}"#]),
            Some(&cfg),
            &FieldMapping::identity(),
            &[],
        )
        .unwrap();
        assert_eq!(record.document["filings"]["recent"]["form"], json!(["10-K"]));
    }

    #[test]
    fn test_malformed_chunk_skips_unit() {
        let cfg = ChunkConfig {
            suffix: "-submissions".into(),
            merge_path: "filings.recent".into(),
        };
        let result = parse_payload(
            payload(r#"{"cik": 1}"#, vec![r#"["not", "an", "object"]"#]),
            Some(&cfg),
            &FieldMapping::identity(),
            &[],
        );
        assert!(matches!(result, Err(ParseError::ChunkMerge { .. })));
    }

    #[test]
    fn test_mapping_applied_to_top_level() {
        let mapping = FieldMapping::from_pairs(&[("entityName", "entity_name")]);
        let record = parse_payload(
            payload(r#"{"entityName": "Apple Inc."}"#, vec![]),
            None,
            &mapping,
            &[],
        )
        .unwrap();
        assert_eq!(record.document, json!({"entity_name": "Apple Inc."}));
    }

    #[test]
    fn test_missing_required_field_skips() {
        let required = ["entityName".to_string(), "facts".to_string()];
        let result = parse_payload(
            payload(r#"{"entityName": "Apple Inc."}"#, vec![]),
            None,
            &FieldMapping::identity(),
            &required,
        );
        assert!(
            matches!(result, Err(ParseError::MissingField { ref field, .. }) if field == "facts")
        );
    }

    #[test]
    fn test_empty_required_field_skips() {
        let required = ["entityName".to_string()];
        let result = parse_payload(
            payload(r#"{"entityName": "", "facts": {"a": 1}}"#, vec![]),
            None,
            &FieldMapping::identity(),
            &required,
        );
        assert!(matches!(result, Err(ParseError::MissingField { .. })));
    }

    #[test]
    fn test_required_fields_present_passes() {
        let required = ["entityName".to_string(), "facts".to_string()];
        let record = parse_payload(
            payload(
                r#"{"entityName": "Apple Inc.", "facts": {"us-gaap": {}}}"#,
                vec![],
            ),
            None,
            &FieldMapping::identity(),
            &required,
        )
        .unwrap();
        assert_eq!(record.document["entityName"], "Apple Inc.");
    }

    #[test]
    fn test_shard_for_is_stable_and_in_range() {
        let key = DatasetKey::new("submissions");
        let shard = shard_for(&key, 4);
        assert!(shard < 4);
        assert_eq!(shard, shard_for(&key, 4));
        assert_eq!(shard_for(&key, 1), 0);
    }
}
