//! End-to-end uploads through a storage context
//!
//! Covers the round trip from upload to download, size validation, replay
//! after lost responses and the indexing timeout path.

use pdp_storage::mock::{fast_config, MockCommitment, MockFailure, MockNetwork, MockSigner};
use pdp_storage::{
    Capability, ContextOptions, Metadata, Phase, ProviderRecord, StorageContext, StorageError,
    UploadOutcome,
};
use std::sync::Arc;
use std::time::Duration;

const CLIENT: &str = "0xclient";

fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

fn label(value: &str) -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert("label".to_string(), value.to_string());
    metadata
}

#[tokio::test(flavor = "multi_thread")]
async fn test_upload_then_download() -> Result<(), Box<dyn std::error::Error>> {
    let _ = env_logger::try_init();

    let network = MockNetwork::new();
    let server = network.add_provider(ProviderRecord::new(1, "http://sp1.test"));
    let manager = network.manager(CLIENT);

    let context = manager
        .create_context(ContextOptions::new().metadata("source", "upload-test"))
        .await?;
    let data = payload(1024, 7);

    println!("Uploading {} bytes...", data.len());
    let outcome = context.upload(&data, label("first")).await?;
    assert!(outcome.is_complete());
    let result = outcome.into_complete().expect("piece should be indexed");

    assert_eq!(result.size, 1024);
    assert_eq!(result.provider_id, 1);
    assert!(!result.already_existed);
    assert_eq!(result.piece_cid, MockCommitment::piece_cid(&data)?);
    assert_eq!(
        server.dataset_pieces(result.dataset_id),
        vec![result.piece_cid.to_string()]
    );

    let fetched = manager.download(&result.piece_cid).await?;
    assert_eq!(fetched, data, "downloaded bytes should match the upload");

    let direct = context.download(&result.piece_cid).await?;
    assert_eq!(direct, data);
    Ok(())
}

#[tokio::test]
async fn test_repeated_upload_is_not_duplicated() -> Result<(), Box<dyn std::error::Error>> {
    let _ = env_logger::try_init();

    let network = MockNetwork::new();
    let server = network.add_provider(ProviderRecord::new(1, "http://sp1.test"));
    let context = network
        .manager(CLIENT)
        .create_context(ContextOptions::new())
        .await?;
    let data = payload(600, 1);

    let first = context
        .upload(&data, Metadata::new())
        .await?
        .into_complete()
        .expect("indexed");
    let second = context
        .upload(&data, Metadata::new())
        .await?
        .into_complete()
        .expect("indexed");

    assert_eq!(first.piece_cid, second.piece_cid);
    assert!(!first.already_existed);
    assert!(second.already_existed);
    assert_eq!(server.sessions_created(), 1);
    assert_eq!(server.dataset_pieces(first.dataset_id).len(), 1);
    assert_eq!(server.calls(Phase::CreateDataset), 1);
    Ok(())
}

#[tokio::test]
async fn test_size_rejected_before_network() -> Result<(), Box<dyn std::error::Error>> {
    let network = MockNetwork::new();
    let server = network.add_provider(
        ProviderRecord::new(1, "http://sp1.test").piece_size_range(0, 2048),
    );
    let context = network
        .manager(CLIENT)
        .create_context(ContextOptions::new())
        .await?;

    let too_small = context.upload(&payload(100, 0), Metadata::new()).await;
    assert!(matches!(too_small, Err(StorageError::Validation { .. })));

    let too_large_for_provider = context.upload(&payload(4096, 0), Metadata::new()).await;
    assert!(matches!(
        too_large_for_provider,
        Err(StorageError::Validation { .. })
    ));

    assert_eq!(server.calls(Phase::CreateDataset), 0);
    assert_eq!(server.calls(Phase::CreateSession), 0);
    Ok(())
}

#[tokio::test]
async fn test_missing_commitment_helper() -> Result<(), Box<dyn std::error::Error>> {
    let network = MockNetwork::new();
    let record = ProviderRecord::new(1, "http://sp1.test");
    let server = network.add_provider(record.clone());
    let commitment = Arc::new(MockCommitment::unavailable());

    let context = StorageContext::builder(
        record,
        network.clone(),
        network.chain(),
        Arc::new(MockSigner::new(CLIENT)),
    )
    .config(fast_config())
    .commitment(commitment.clone())
    .build()?;

    let err = context
        .upload(&payload(512, 3), Metadata::new())
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::CommitmentUnavailable { .. }));
    assert_eq!(commitment.calls(), 1);
    assert_eq!(server.sessions_created(), 0);
    Ok(())
}

async fn replay_after_lost_response(phase: Phase) -> Result<(), Box<dyn std::error::Error>> {
    let _ = env_logger::try_init();

    let network = MockNetwork::new();
    let server = network.add_provider(ProviderRecord::new(1, "http://sp1.test"));
    let context = network
        .manager(CLIENT)
        .create_context(ContextOptions::new())
        .await?;
    let data = payload(2048, 9);

    server.fail_next(phase, MockFailure::DropResponse);
    let err = context.upload(&data, label("replay")).await.unwrap_err();
    assert_eq!(err.phase(), Some(phase));
    assert!(err.retry_key().is_some(), "lost {} should carry a key", phase);

    let result = context
        .upload(&data, label("replay"))
        .await?
        .into_complete()
        .expect("indexed");
    assert_eq!(result.size, 2048);
    assert_eq!(server.sessions_created(), 1);
    assert_eq!(server.dataset_pieces(result.dataset_id).len(), 1);

    let fetched = network.manager(CLIENT).download(&result.piece_cid).await?;
    assert_eq!(fetched, data);
    Ok(())
}

#[tokio::test]
async fn test_replay_after_lost_session_response() -> Result<(), Box<dyn std::error::Error>> {
    replay_after_lost_response(Phase::CreateSession).await
}

#[tokio::test]
async fn test_replay_after_lost_transfer_response() -> Result<(), Box<dyn std::error::Error>> {
    replay_after_lost_response(Phase::PutBytes).await
}

#[tokio::test]
async fn test_replay_after_lost_finalize_response() -> Result<(), Box<dyn std::error::Error>> {
    replay_after_lost_response(Phase::Finalize).await
}

#[tokio::test]
async fn test_transfer_failure_is_transient() -> Result<(), Box<dyn std::error::Error>> {
    let network = MockNetwork::new();
    let server = network.add_provider(ProviderRecord::new(1, "http://sp1.test"));
    let context = network
        .manager(CLIENT)
        .create_context(ContextOptions::new())
        .await?;

    server.fail_next(Phase::PutBytes, MockFailure::Status(500));
    let err = context
        .upload(&payload(512, 2), Metadata::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        StorageError::Transient {
            phase: Phase::PutBytes,
            status: Some(500),
            ..
        }
    ));
    assert!(err.is_retryable());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_not_yet_indexed_then_resume() -> Result<(), Box<dyn std::error::Error>> {
    let _ = env_logger::try_init();

    let network = MockNetwork::new();
    let server = network.add_provider(ProviderRecord::new(1, "http://sp1.test"));
    server.set_indexing_delay(Duration::from_millis(300));

    let manager = network
        .manager(CLIENT)
        .with_config(fast_config().indexing_timeout(Duration::from_millis(50)));
    let context = manager.create_context(ContextOptions::new()).await?;
    let data = payload(1000, 4);

    let outcome = context.upload(&data, Metadata::new()).await?;
    let pending = match outcome {
        UploadOutcome::NotYetIndexed(pending) => pending,
        UploadOutcome::Complete(result) => {
            panic!("piece {} should not be indexed yet", result.piece_cid)
        }
    };
    assert_eq!(pending.piece_cid(), &MockCommitment::piece_cid(&data)?);
    assert!(server
        .dataset_pieces(pending.dataset.dataset_id)
        .is_empty());

    tokio::time::sleep(Duration::from_millis(400)).await;

    let resumed = context.resume(pending).await?;
    let result = resumed.into_complete().expect("indexed after the delay");
    assert_eq!(server.dataset_pieces(result.dataset_id).len(), 1);
    assert_eq!(server.sessions_created(), 1);
    Ok(())
}

#[tokio::test]
async fn test_upload_many_registers_one_batch() -> Result<(), Box<dyn std::error::Error>> {
    let _ = env_logger::try_init();

    let network = MockNetwork::new();
    let server = network.add_provider(
        ProviderRecord::new(1, "http://sp1.test").capability(Capability::BatchAdd),
    );
    let manager = network.manager(CLIENT);
    let context = manager.create_context(ContextOptions::new()).await?;

    let items: Vec<(Vec<u8>, Metadata)> = (0..3)
        .map(|i| (payload(300 + i * 100, i as u8), label(&format!("item-{}", i))))
        .collect();
    let outcomes = context.upload_many(&items).await?;

    assert_eq!(outcomes.len(), 3);
    for ((data, _), outcome) in items.iter().zip(&outcomes) {
        assert!(outcome.is_complete());
        assert_eq!(outcome.piece_cid(), &MockCommitment::piece_cid(data)?);
        assert_eq!(&manager.download(outcome.piece_cid()).await?, data);
    }
    assert_eq!(server.calls(Phase::AddPieces), 1);
    assert_eq!(server.sessions_created(), 3);
    Ok(())
}

#[tokio::test]
async fn test_upload_many_rejects_conflicting_metadata_before_network(
) -> Result<(), Box<dyn std::error::Error>> {
    let network = MockNetwork::new();
    let server = network.add_provider(
        ProviderRecord::new(1, "http://sp1.test").capability(Capability::BatchAdd),
    );
    let context = network
        .manager(CLIENT)
        .create_context(ContextOptions::new())
        .await?;

    let data = payload(512, 5);
    let items = vec![(data.clone(), label("one")), (data, label("two"))];
    let err = context.upload_many(&items).await.unwrap_err();

    assert!(matches!(err, StorageError::Validation { .. }));
    assert_eq!(server.calls(Phase::CreateDataset), 0);
    assert_eq!(server.sessions_created(), 0);
    assert_eq!(server.calls(Phase::PutBytes), 0);
    assert_eq!(server.calls(Phase::Finalize), 0);
    assert!(context.dataset_id().await.is_none());
    Ok(())
}

async fn key_conflict_propagates(phase: Phase) -> Result<(), Box<dyn std::error::Error>> {
    let _ = env_logger::try_init();

    let network = MockNetwork::new();
    let server = network.add_provider(ProviderRecord::new(1, "http://sp1.test"));
    let context = network
        .manager(CLIENT)
        .create_context(ContextOptions::new())
        .await?;

    server.fail_next(phase, MockFailure::Status(422));
    let err = context
        .upload(&payload(768, 6), label("conflict"))
        .await
        .unwrap_err();

    match &err {
        StorageError::Idempotency { phase: failed, .. } => assert_eq!(*failed, phase),
        other => panic!("expected an idempotency conflict, got {:?}", other),
    }
    assert!(!err.is_retryable());

    let dataset_id = context.dataset_id().await.expect("dataset resolved");
    assert!(server.dataset_pieces(dataset_id).is_empty());
    assert_eq!(server.calls(Phase::AddPieces), 0);
    Ok(())
}

#[tokio::test]
async fn test_session_key_conflict_propagates() -> Result<(), Box<dyn std::error::Error>> {
    key_conflict_propagates(Phase::CreateSession).await
}

#[tokio::test]
async fn test_finalize_key_conflict_propagates() -> Result<(), Box<dyn std::error::Error>> {
    key_conflict_propagates(Phase::Finalize).await
}
