mod common;

use common::{ScriptedIds, compressible, harness, harness_with_ids};
use file_relay::models::{CompressionAlgorithm, FileRecord, IngressRoute, TransferStatus};
use file_relay::services::file_service::FileService;
use file_relay::services::progress::{ProgressNotifier, TransferEvent};
use file_relay::services::storage::StorageError;
use file_relay::services::transfer::{CompressionChoice, TransferError};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn zip6() -> (CompressionChoice, Option<u32>) {
    (
        CompressionChoice::Explicit(CompressionAlgorithm::Zip),
        Some(6),
    )
}

#[tokio::test]
async fn test_ten_megabyte_zip_on_low_capacity_path() {
    let h = harness().await;
    let data = compressible(10 * 1024 * 1024);
    let (choice, level) = zip6();
    let request = h.request("access.log", &data, IngressRoute::LowCapacity, choice, level);

    let outcome = h
        .coordinator
        .run(request, &ProgressNotifier::disabled(), &CancellationToken::new())
        .await
        .unwrap();

    let record = h.store.get(&outcome.record.id).await.unwrap();
    assert_eq!(record.status, TransferStatus::Stored);
    assert_eq!(record.original_size, data.len() as u64);
    assert_eq!(record.compression, CompressionAlgorithm::Zip);
    assert_eq!(record.compression_level, Some(6));
    let compressed = record.compressed_size.unwrap();
    assert!(compressed < record.original_size);
    assert!(record.storage_locator.is_some());
    assert!(record.completed_at.is_some());
    assert!(outcome.ratio < 1.0);
    assert_eq!(outcome.attempts, 1);
    assert!(h.temp_files().is_empty(), "{:?}", h.temp_files());
}

#[tokio::test]
async fn test_oversized_file_on_low_capacity_path_is_refused() {
    let h = harness().await;
    let mut request = h.request(
        "movie.mkv",
        b"tiny",
        IngressRoute::LowCapacity,
        CompressionChoice::Default,
        None,
    );
    request.declared_size = 500 * 1024 * 1024;

    let err = h
        .coordinator
        .run(request, &ProgressNotifier::disabled(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, TransferError::TransportNotEligible { .. }));
    assert!(h.store.list_by_owner("alice").await.unwrap().is_empty());
    assert_eq!(h.storage.calls(), 0);
    assert!(h.temp_files().is_empty());
}

#[tokio::test]
async fn test_ceiling_applies_to_high_capacity_path() {
    let h = harness().await;
    let mut request = h.request(
        "disk.img",
        b"tiny",
        IngressRoute::HighCapacity,
        CompressionChoice::Default,
        None,
    );
    request.declared_size = h.config.max_file_size + 1;

    let err = h
        .coordinator
        .run(request, &ProgressNotifier::disabled(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::FileTooLarge { .. }));
    assert!(h.store.list_by_owner("alice").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_transient_failures_retry_until_stored() {
    let h = harness().await;
    h.storage.fail_next(vec![
        StorageError::Unavailable("503".into()),
        StorageError::Unavailable("timeout".into()),
    ]);
    let (choice, level) = zip6();
    let request = h.request("a.txt", &compressible(4096), IngressRoute::LowCapacity, choice, level);

    let outcome = h
        .coordinator
        .run(request, &ProgressNotifier::disabled(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.attempts, 3);
    assert_eq!(h.storage.calls(), 3);
    let record = h.store.get(&outcome.record.id).await.unwrap();
    assert_eq!(record.status, TransferStatus::Stored);
}

#[tokio::test]
async fn test_exhausted_retries_fail_the_record() {
    let h = harness().await;
    h.storage.fail_always(StorageError::Unavailable("down".into()));
    let request = h.request(
        "a.bin",
        &compressible(1024),
        IngressRoute::LowCapacity,
        CompressionChoice::Explicit(CompressionAlgorithm::None),
        None,
    );

    let err = h
        .coordinator
        .run(request, &ProgressNotifier::disabled(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, TransferError::StorageUnavailable { attempts: 3, .. }));
    assert_eq!(h.storage.calls(), h.config.upload_attempts);

    let records = h.store.list_by_owner("alice").await.unwrap();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.status, TransferStatus::Failed);
    assert!(record.storage_locator.is_none());
    assert!(record.error_detail.as_deref().unwrap().contains("down"));
    assert!(h.temp_files().is_empty());
}

#[tokio::test]
async fn test_rejection_is_not_retried() {
    let h = harness().await;
    h.storage
        .fail_next(vec![StorageError::Rejected("403 Forbidden".into())]);
    let request = h.request(
        "a.bin",
        b"data",
        IngressRoute::LowCapacity,
        CompressionChoice::Default,
        None,
    );

    let err = h
        .coordinator
        .run(request, &ProgressNotifier::disabled(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, TransferError::StorageRejected(_)));
    assert_eq!(h.storage.calls(), 1);
    let records = h.store.list_by_owner("alice").await.unwrap();
    assert_eq!(records[0].status, TransferStatus::Failed);
}

#[tokio::test]
async fn test_compression_failure_skips_upload() {
    let h = harness().await;
    let (choice, level) = zip6();
    let request = h.request("a.txt", b"gone", IngressRoute::LowCapacity, choice, level);
    std::fs::remove_file(request.file.path()).unwrap();

    let err = h
        .coordinator
        .run(request, &ProgressNotifier::disabled(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, TransferError::Compression(_)));
    assert_eq!(h.storage.calls(), 0);
    let records = h.store.list_by_owner("alice").await.unwrap();
    assert_eq!(records[0].status, TransferStatus::Failed);
    assert!(records[0].compressed_size.is_none());
}

#[tokio::test]
async fn test_cancel_during_upload() {
    let h = harness().await;
    h.storage.hang();
    let (choice, level) = zip6();
    let request = h.request(
        "big.csv",
        &compressible(256 * 1024),
        IngressRoute::HighCapacity,
        choice,
        level,
    );

    let handle = h.coordinator.spawn(request);
    tokio::time::timeout(Duration::from_secs(10), h.storage.put_started.notified())
        .await
        .unwrap();

    let active = h.coordinator.active_transfers();
    assert_eq!(active.len(), 1);
    let during = h.store.get(&active[0]).await.unwrap();
    assert_eq!(during.status, TransferStatus::Uploading);
    assert!(h.coordinator.cancel(&active[0]));

    let err = tokio::time::timeout(Duration::from_secs(10), handle.outcome())
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, TransferError::Cancelled));

    let record = h.store.get(&active[0]).await.unwrap();
    assert_eq!(record.status, TransferStatus::Failed);
    assert!(record.storage_locator.is_none());
    assert!(record.error_detail.is_some());
    assert!(h.temp_files().is_empty(), "{:?}", h.temp_files());
    assert!(h.coordinator.active_transfers().is_empty());
    assert!(!h.coordinator.cancel(&active[0]));
}

#[tokio::test]
async fn test_cancelled_before_start_creates_no_record() {
    let h = harness().await;
    let request = h.request(
        "a.bin",
        b"data",
        IngressRoute::LowCapacity,
        CompressionChoice::Default,
        None,
    );
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = h
        .coordinator
        .run(request, &ProgressNotifier::disabled(), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::Cancelled));
    assert!(h.store.list_by_owner("alice").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_identifier_collision_draws_again() {
    let h = harness_with_ids(Arc::new(ScriptedIds::new(&["taken", "fresh"], None))).await;
    h.store
        .create(&FileRecord::pending(
            "taken".into(),
            "bob".into(),
            "old.bin".into(),
            1,
            CompressionAlgorithm::None,
            None,
        ))
        .await
        .unwrap();

    let request = h.request(
        "new.bin",
        b"payload",
        IngressRoute::LowCapacity,
        CompressionChoice::Explicit(CompressionAlgorithm::None),
        None,
    );
    let outcome = h
        .coordinator
        .run(request, &ProgressNotifier::disabled(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.record.id, "fresh");
    let existing = h.store.get("taken").await.unwrap();
    assert_eq!(existing.owner, "bob");
    assert_eq!(existing.status, TransferStatus::Pending);
}

#[tokio::test]
async fn test_identifier_exhaustion() {
    let h = harness_with_ids(Arc::new(ScriptedIds::new(&[], Some("taken")))).await;
    h.store
        .create(&FileRecord::pending(
            "taken".into(),
            "bob".into(),
            "old.bin".into(),
            1,
            CompressionAlgorithm::None,
            None,
        ))
        .await
        .unwrap();

    let request = h.request(
        "new.bin",
        b"payload",
        IngressRoute::LowCapacity,
        CompressionChoice::Default,
        None,
    );
    let err = h
        .coordinator
        .run(request, &ProgressNotifier::disabled(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        TransferError::IdentifierExhaustion { attempts: 5 }
    ));
    assert!(h.store.list_by_owner("alice").await.unwrap().is_empty());
    assert_eq!(h.storage.calls(), 0);
    assert!(h.temp_files().is_empty());
}

#[tokio::test]
async fn test_concurrent_transfers_get_distinct_ids() {
    let h = harness().await;
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let request = h.request(
                &format!("file-{}.txt", i),
                &compressible(8 * 1024 + i),
                IngressRoute::LowCapacity,
                CompressionChoice::Explicit(CompressionAlgorithm::Gzip),
                Some(1),
            );
            h.coordinator.spawn(request)
        })
        .collect();

    let mut ids = HashSet::new();
    for handle in handles {
        let outcome = handle.outcome().await.unwrap();
        assert!(ids.insert(outcome.record.id));
    }

    let records = h.store.list_by_owner("alice").await.unwrap();
    assert_eq!(records.len(), 8);
    assert!(records.iter().all(|r| r.status == TransferStatus::Stored));
    assert_eq!(h.storage.object_count(), 8);
    assert!(h.temp_files().is_empty());
}

#[tokio::test]
async fn test_progress_events_follow_stages() {
    let h = harness().await;
    let request = h.request(
        "notes.md",
        &compressible(64 * 1024),
        IngressRoute::LowCapacity,
        CompressionChoice::Auto,
        None,
    );

    let mut handle = h.coordinator.spawn(request);
    let mut names = Vec::new();
    while let Some(event) = handle.events.recv().await {
        if let TransferEvent::CompressionStarted { algorithm, .. } = &event {
            assert_eq!(*algorithm, CompressionAlgorithm::Gzip);
        }
        names.push(event.name());
    }
    handle.outcome().await.unwrap();

    assert_eq!(
        names,
        vec![
            "received",
            "compression_started",
            "compression_finished",
            "upload_started",
            "upload_finished",
            "stored",
        ]
    );
}

#[tokio::test]
async fn test_retry_events_are_reported() {
    let h = harness().await;
    h.storage
        .fail_next(vec![StorageError::Unavailable("slow down".into())]);
    let request = h.request(
        "a.bin",
        b"data",
        IngressRoute::LowCapacity,
        CompressionChoice::Explicit(CompressionAlgorithm::None),
        None,
    );

    let mut handle = h.coordinator.spawn(request);
    let mut events = Vec::new();
    while let Some(event) = handle.events.recv().await {
        events.push(event);
    }

    assert!(events.iter().any(|e| matches!(
        e,
        TransferEvent::UploadRetry { attempt: 1, .. }
    )));
    assert!(matches!(events.last(), Some(TransferEvent::Stored { .. })));
}

#[tokio::test]
async fn test_stored_file_fetches_back_to_original_bytes() {
    let h = harness().await;
    let data = compressible(300 * 1024);

    for algorithm in [
        CompressionAlgorithm::None,
        CompressionAlgorithm::Zip,
        CompressionAlgorithm::Gzip,
        CompressionAlgorithm::Lzma,
    ] {
        let request = h.request(
            "report.csv",
            &data,
            IngressRoute::LowCapacity,
            CompressionChoice::Explicit(algorithm),
            Some(3),
        );
        let outcome = h
            .coordinator
            .run(request, &ProgressNotifier::disabled(), &CancellationToken::new())
            .await
            .unwrap();

        let files = FileService::new(
            h.store.clone(),
            h.storage.clone(),
            h.config.temp_dir.clone(),
        );
        let downloaded = files.fetch(&outcome.record.id, "alice").await.unwrap();
        assert_eq!(downloaded.name, "report.csv");
        assert_eq!(std::fs::read(downloaded.path()).unwrap(), data, "{}", algorithm);
    }
    assert!(h.temp_files().is_empty());
}

#[tokio::test]
async fn test_only_api_processes_fail_in_flight_records() {
    use file_relay::config::ServiceMode;
    use file_relay::infrastructure::database::recover_interrupted;
    use file_relay::models::StatusFields;

    let h = harness().await;
    h.store
        .create(&FileRecord::pending(
            "live".into(),
            "alice".into(),
            "big.bin".into(),
            10,
            CompressionAlgorithm::None,
            None,
        ))
        .await
        .unwrap();
    h.store
        .update_status("live", TransferStatus::Uploading, StatusFields::default())
        .await
        .unwrap();

    // A worker started next to a running API must not touch its transfers
    assert_eq!(recover_interrupted(&h.store, ServiceMode::Worker).await.unwrap(), 0);
    assert_eq!(h.store.get("live").await.unwrap().status, TransferStatus::Uploading);

    assert_eq!(recover_interrupted(&h.store, ServiceMode::Api).await.unwrap(), 1);
    let record = h.store.get("live").await.unwrap();
    assert_eq!(record.status, TransferStatus::Failed);
    assert_eq!(record.error_detail.as_deref(), Some("interrupted by restart"));
}

#[tokio::test]
async fn test_sweeper_spares_files_of_running_transfers() {
    use file_relay::services::worker::BackgroundWorker;

    let h = harness().await;
    h.storage.hang();
    std::fs::write(h.config.temp_dir.join("orphan.gz"), b"left by a crash").unwrap();

    let request = h.request(
        "slow.bin",
        b"still uploading",
        IngressRoute::LowCapacity,
        CompressionChoice::Explicit(CompressionAlgorithm::None),
        None,
    );
    let received = request.file.path().to_path_buf();
    let handle = h.coordinator.spawn(request);
    h.storage.put_started.notified().await;

    let (_tx, rx) = tokio::sync::watch::channel(false);
    let sweeper = BackgroundWorker::new(h.config.temp_dir.clone(), 0, rx)
        .with_transfers(h.coordinator.clone());
    assert_eq!(sweeper.sweep_once().await, 1);
    assert!(received.exists());
    assert!(!h.config.temp_dir.join("orphan.gz").exists());

    handle.cancel.cancel();
    assert!(matches!(handle.outcome().await, Err(TransferError::Cancelled)));
    assert!(!h.coordinator.is_in_use(&received));
    assert!(!received.exists());
}

#[tokio::test]
async fn test_default_choice_uses_saved_owner_preference() {
    let h = harness().await;
    let data = compressible(64 * 1024);
    h.coordinator
        .preferences()
        .save("alice", true, CompressionAlgorithm::Lzma, Some(3))
        .await
        .unwrap();

    let request = h.request(
        "a.txt",
        &data,
        IngressRoute::LowCapacity,
        CompressionChoice::Default,
        None,
    );
    let outcome = h
        .coordinator
        .run(request, &ProgressNotifier::disabled(), &CancellationToken::new())
        .await
        .unwrap();
    let record = h.store.get(&outcome.record.id).await.unwrap();
    assert_eq!(record.compression, CompressionAlgorithm::Lzma);
    assert_eq!(record.compression_level, Some(3));

    // Opting out stores the bytes as received
    h.coordinator
        .preferences()
        .save("alice", false, CompressionAlgorithm::Lzma, Some(3))
        .await
        .unwrap();
    let request = h.request(
        "b.txt",
        &data,
        IngressRoute::LowCapacity,
        CompressionChoice::Default,
        None,
    );
    let outcome = h
        .coordinator
        .run(request, &ProgressNotifier::disabled(), &CancellationToken::new())
        .await
        .unwrap();
    let record = h.store.get(&outcome.record.id).await.unwrap();
    assert_eq!(record.compression, CompressionAlgorithm::None);
    assert_eq!(record.compression_level, None);
    assert_eq!(record.status, TransferStatus::Stored);
}
