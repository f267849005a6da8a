//! Integration tests for sleet

use std::path::Path;
use std::sync::Arc;

use indexmap::IndexMap;
use tokio_util::sync::CancellationToken;

use sleet::config::{
    BatchConfig, Config, DatasetConfig, DatasetKey, ErrorHandlingConfig, KeyConfig, RetryConfig,
    SinkConfig,
};
use sleet::pipeline::{Pipeline, RunState, RunSummary};
use sleet::sink::{BulkSink, FailureScript, MemorySink};

fn write_tree(dir: &Path, count: usize) {
    for i in 0..count {
        let path = dir.join(format!("CIK{i:010}.json"));
        std::fs::write(&path, format!(r#"{{"cik": {i}, "value": "v{i}"}}"#)).unwrap();
    }
}

fn dataset(source: &Path) -> DatasetConfig {
    DatasetConfig {
        source: source.to_string_lossy().into_owned(),
        table: "facts".to_string(),
        key: KeyConfig {
            strip_prefix: Some("CIK".to_string()),
            ..KeyConfig::default()
        },
        chunks: None,
        required: Vec::new(),
        resume: false,
        mapping_path: None,
    }
}

fn test_config(source: &Path, max_rows: usize) -> Config {
    let mut datasets = IndexMap::new();
    datasets.insert(DatasetKey::new("facts"), dataset(source));
    Config {
        datasets,
        sink: SinkConfig {
            url: "memory://".to_string(),
        },
        batch: BatchConfig {
            max_rows,
            ..BatchConfig::default()
        },
        retry: RetryConfig {
            read_backoff_ms: 1,
            load_backoff_ms: 1,
            ..RetryConfig::default()
        },
        ..Config::default()
    }
}

async fn run(config: Config, sink: Arc<MemorySink>) -> (RunState, RunSummary) {
    run_with_cancel(config, sink, CancellationToken::new()).await
}

async fn run_with_cancel(
    config: Config,
    sink: Arc<MemorySink>,
    cancel: CancellationToken,
) -> (RunState, RunSummary) {
    sleet_common::metrics::init_test();
    Pipeline::new(config, sink as Arc<dyn BulkSink>, cancel)
        .run()
        .await
        .unwrap()
}

mod end_to_end_tests {
    use super::*;

    #[tokio::test]
    async fn test_thousand_files_batch_hundred() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(dir.path(), 1000);

        let sink = Arc::new(MemorySink::new());
        let (state, summary) = run(test_config(dir.path(), 100), Arc::clone(&sink)).await;

        assert_eq!(state, RunState::Done);
        assert_eq!(summary.files_enumerated, 1000);
        assert_eq!(summary.files_loaded, 1000);
        assert_eq!(summary.files_skipped, 0);
        assert_eq!(summary.files_failed, 0);
        assert_eq!(summary.batches_sealed, 10);
        assert_eq!(summary.batches_loaded, 10);
        assert_eq!(summary.rows_loaded, 1000);
        assert_eq!(summary.sequence_gaps, 0);
        assert!(summary.is_clean());

        assert_eq!(sink.row_count("facts").await, 1000);
        // Entity keys come from the file names with the prefix stripped.
        assert!(sink.document("facts", "0000000042").await.is_some());
    }

    #[tokio::test]
    async fn test_malformed_files_are_counted_skips() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(dir.path(), 870);
        for i in 0..130 {
            let path = dir.path().join(format!("CIK9{i:09}.json"));
            std::fs::write(&path, "{truncated").unwrap();
        }

        let sink = Arc::new(MemorySink::new());
        let (state, summary) = run(test_config(dir.path(), 100), Arc::clone(&sink)).await;

        assert_eq!(state, RunState::Done);
        assert_eq!(summary.files_enumerated, 1000);
        assert_eq!(summary.files_loaded, 870);
        assert_eq!(summary.files_skipped, 130);
        assert_eq!(summary.files_failed, 0);
        assert_eq!(summary.rows_loaded, 870);
        assert_eq!(sink.row_count("facts").await, 870);
    }

    #[tokio::test]
    async fn test_documents_missing_required_fields_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(dir.path(), 20);
        // Valid JSON, but no "value" field.
        std::fs::write(
            dir.path().join("CIK9000000000.json"),
            r#"{"cik": 9000000000}"#,
        )
        .unwrap();

        let mut config = test_config(dir.path(), 100);
        let facts = config.datasets.get_mut(&DatasetKey::new("facts")).unwrap();
        facts.required = vec!["cik".to_string(), "value".to_string()];

        let sink = Arc::new(MemorySink::new());
        let (state, summary) = run(config, Arc::clone(&sink)).await;

        assert_eq!(state, RunState::Done);
        assert_eq!(summary.files_loaded, 20);
        assert_eq!(summary.files_skipped, 1);
        assert_eq!(sink.row_count("facts").await, 20);
    }

    #[tokio::test]
    async fn test_conservation_every_file_reaches_one_outcome() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(dir.path(), 200);
        std::fs::write(dir.path().join("CIKbad.json"), "[]").unwrap();
        std::fs::write(dir.path().join("CIK.json"), "{}").unwrap(); // empty key

        let sink = Arc::new(MemorySink::new());
        let (_, summary) = run(test_config(dir.path(), 50), sink).await;

        assert_eq!(
            summary.files_enumerated,
            summary.files_loaded + summary.files_skipped + summary.files_failed
        );
        assert_eq!(summary.files_loaded, 200);
        assert_eq!(summary.files_skipped, 1); // array root
        assert_eq!(summary.files_failed, 1); // empty entity key
    }

    #[tokio::test]
    async fn test_chunked_dataset_merges_siblings() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("CIK0000000001.json"),
            r#"{"cik": 1, "filings": {"recent": {"form": ["10-K"]}}}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("CIK0000000001-submissions-001.json"),
            r#"{"form": ["10-Q", "8-K"]}"#,
        )
        .unwrap();

        let mut config = test_config(dir.path(), 100);
        let facts = config.datasets.get_mut(&DatasetKey::new("facts")).unwrap();
        facts.chunks = Some(sleet::config::ChunkConfig {
            suffix: "-submissions".to_string(),
            merge_path: "filings.recent".to_string(),
        });

        let sink = Arc::new(MemorySink::new());
        let (_, summary) = run(config, Arc::clone(&sink)).await;

        // Two physical files, one logical entity.
        assert_eq!(summary.files_enumerated, 2);
        assert_eq!(summary.files_loaded, 2);
        assert_eq!(summary.rows_loaded, 1);

        let doc = sink.document("facts", "0000000001").await.unwrap();
        assert_eq!(
            doc["filings"]["recent"]["form"],
            serde_json::json!(["10-K", "10-Q", "8-K"])
        );
    }
}

mod resilience_tests {
    use super::*;

    #[tokio::test]
    async fn test_transient_sink_failure_retries_and_loads() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(dir.path(), 50);

        let script = Arc::new(FailureScript::new());
        script.fail_transient(1).await;
        let sink = Arc::new(MemorySink::with_script(script));

        let (state, summary) = run(test_config(dir.path(), 100), Arc::clone(&sink)).await;

        assert_eq!(state, RunState::Done);
        assert_eq!(summary.rows_loaded, 50);
        assert_eq!(summary.load_retries, 1);
        assert_eq!(summary.batches_quarantined, 0);
        assert_eq!(sink.row_count("facts").await, 50);
        assert_eq!(sink.merge_attempts(), 2);
    }

    #[tokio::test]
    async fn test_permanent_sink_failure_quarantines_batch() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(dir.path(), 3);
        let quarantine_dir = tempfile::tempdir().unwrap();

        let script = Arc::new(FailureScript::new());
        script.fail_permanent(1).await;
        let sink = Arc::new(MemorySink::with_script(script));

        let mut config = test_config(dir.path(), 100);
        config.error_handling = ErrorHandlingConfig {
            quarantine_path: Some(quarantine_dir.path().to_string_lossy().into_owned()),
            ..ErrorHandlingConfig::default()
        };

        let (state, summary) = run(config, Arc::clone(&sink)).await;

        // A quarantined batch does not fail the run.
        assert_eq!(state, RunState::Done);
        assert_eq!(summary.batches_quarantined, 1);
        assert_eq!(summary.rows_quarantined, 3);
        assert_eq!(summary.files_failed, 3);
        assert_eq!(summary.rows_loaded, 0);
        assert_eq!(sink.row_count("facts").await, 0);

        // The batch rows land in the quarantine NDJSON for replay.
        let batches_file = std::fs::read_dir(quarantine_dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .find(|e| e.file_name().to_string_lossy().starts_with("batches-"))
            .unwrap();
        let contents = std::fs::read_to_string(batches_file.path()).unwrap();
        assert_eq!(contents.lines().count(), 3);
    }

    #[tokio::test]
    async fn test_unavailable_sink_fails_the_run() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(dir.path(), 5);

        let script = Arc::new(FailureScript::new());
        script.fail_unavailable(1).await;
        script.fail_unavailable(2).await;
        script.fail_unavailable(3).await;
        let sink = Arc::new(MemorySink::with_script(script));

        let (state, summary) = run(test_config(dir.path(), 100), Arc::clone(&sink)).await;

        assert_eq!(state, RunState::Failed);
        assert_eq!(summary.rows_loaded, 0);
        assert_eq!(summary.files_failed, 5);
    }
}

mod drain_tests {
    use super::*;

    #[tokio::test]
    async fn test_cancellation_drains_in_flight_work() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(dir.path(), 2000);

        let sink = Arc::new(MemorySink::new());
        let cancel = CancellationToken::new();

        let config = test_config(dir.path(), 100);
        let handle = {
            let sink = Arc::clone(&sink);
            let cancel = cancel.clone();
            tokio::spawn(async move { run_with_cancel(config, sink, cancel).await })
        };

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        cancel.cancel();
        let (state, summary) = handle.await.unwrap();

        assert_eq!(state, RunState::Done);
        // Everything enumerated before the cancel still reaches a
        // terminal outcome; sealed batches are never lost.
        assert_eq!(
            summary.files_enumerated,
            summary.files_loaded + summary.files_skipped + summary.files_failed
        );
        assert_eq!(summary.sequence_gaps, 0);
        assert_eq!(sink.row_count("facts").await, summary.rows_loaded);
    }

    #[tokio::test]
    async fn test_pre_cancelled_run_loads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(dir.path(), 100);

        let sink = Arc::new(MemorySink::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let (state, summary) =
            run_with_cancel(test_config(dir.path(), 100), Arc::clone(&sink), cancel).await;

        assert_eq!(state, RunState::Done);
        assert_eq!(summary.files_enumerated, 0);
        assert_eq!(sink.row_count("facts").await, 0);
    }
}

mod resume_tests {
    use super::*;

    #[tokio::test]
    async fn test_rerun_with_merge_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(dir.path(), 300);

        let sink = Arc::new(MemorySink::new());
        let (_, first) = run(test_config(dir.path(), 100), Arc::clone(&sink)).await;
        assert_eq!(first.rows_loaded, 300);
        assert_eq!(sink.row_count("facts").await, 300);

        // Re-running against the populated sink merges by entity key:
        // same final row count, no duplicates.
        let (_, second) = run(test_config(dir.path(), 100), Arc::clone(&sink)).await;
        assert_eq!(second.rows_loaded, 300);
        assert_eq!(sink.row_count("facts").await, 300);
    }

    #[tokio::test]
    async fn test_resume_skips_already_loaded_entities() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(dir.path(), 300);

        let mut config = test_config(dir.path(), 100);
        config
            .datasets
            .get_mut(&DatasetKey::new("facts"))
            .unwrap()
            .resume = true;

        let sink = Arc::new(MemorySink::new());
        let (_, first) = run(config.clone(), Arc::clone(&sink)).await;
        assert_eq!(first.files_resumed_skipped, 0);
        assert_eq!(first.rows_loaded, 300);
        let attempts_after_first = sink.merge_attempts();

        let (state, second) = run(config, Arc::clone(&sink)).await;
        assert_eq!(state, RunState::Done);
        assert_eq!(second.files_resumed_skipped, 300);
        assert_eq!(second.rows_loaded, 0);
        // Nothing reached the sink on the resumed run.
        assert_eq!(sink.merge_attempts(), attempts_after_first);
        assert_eq!(sink.row_count("facts").await, 300);
    }
}
