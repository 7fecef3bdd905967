//! Dataset creation idempotency against the in-memory provider
//!
//! Covers repeated creation, replay after a lost response, metadata conflicts
//! and the errors that must reach the caller unchanged.

use pdp_storage::mock::{fast_config, MockFailure, MockNetwork, MockSigner};
use pdp_storage::{
    DatasetRegistrar, Metadata, PdpClient, Phase, ProviderRecord, StorageContext, StorageError,
};
use std::sync::Arc;

const CLIENT: &str = "0xclient";

fn metadata(pairs: &[(&str, &str)]) -> Metadata {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn registrar(network: &Arc<MockNetwork>, record: &ProviderRecord) -> DatasetRegistrar {
    let pdp = PdpClient::new(network.clone(), record.endpoint.clone(), fast_config());
    DatasetRegistrar::new(
        pdp,
        record.clone(),
        network.chain(),
        Arc::new(MockSigner::new(CLIENT)),
    )
}

#[tokio::test]
async fn test_create_twice_returns_same_dataset() -> Result<(), Box<dyn std::error::Error>> {
    let _ = env_logger::try_init();

    let network = MockNetwork::new();
    let record = ProviderRecord::new(1, "http://sp1.test").payee("0xpayee");
    let server = network.add_provider(record.clone());
    let registrar = registrar(&network, &record);
    let meta = metadata(&[("project", "demo")]);

    let first = registrar.create_or_reuse(CLIENT, 1, 1, &meta).await?;
    let second = registrar.create_or_reuse(CLIENT, 1, 1, &meta).await?;

    assert_eq!(first.dataset_id, second.dataset_id);
    assert!(first.is_new);
    assert!(!second.is_new);
    assert_eq!(second.metadata, meta);
    assert_eq!(server.datasets_created(), 1);
    assert_eq!(server.calls(Phase::CreateDataset), 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_racing_contexts_converge_on_one_dataset() -> Result<(), Box<dyn std::error::Error>>
{
    let _ = env_logger::try_init();

    let network = MockNetwork::new();
    let record = ProviderRecord::new(1, "http://sp1.test");
    let server = network.add_provider(record.clone());

    let build = || {
        StorageContext::builder(
            record.clone(),
            network.clone(),
            network.chain(),
            Arc::new(MockSigner::new(CLIENT)),
        )
        .config(fast_config())
        .client_dataset_id(4)
        .metadata(metadata(&[("project", "race")]))
        .build()
    };
    let first = build()?;
    let second = build()?;

    let (a, b) = tokio::join!(first.dataset(), second.dataset());
    let (a, b) = (a?, b?);

    assert_eq!(a.dataset_id, b.dataset_id);
    assert_eq!(a.client_dataset_id, 4);
    assert_eq!(server.datasets_created(), 1);
    assert_eq!(server.calls(Phase::CreateDataset), 2);
    Ok(())
}

#[tokio::test]
async fn test_context_creates_dataset_once() -> Result<(), Box<dyn std::error::Error>> {
    let _ = env_logger::try_init();

    let network = MockNetwork::new();
    let record = ProviderRecord::new(1, "http://sp1.test");
    let server = network.add_provider(record.clone());

    let context = StorageContext::builder(
        record,
        network.clone(),
        network.chain(),
        Arc::new(MockSigner::new(CLIENT)),
    )
    .config(fast_config())
    .metadata(metadata(&[("project", "demo")]))
    .build()?;

    assert_eq!(context.dataset_id().await, None);
    let first = context.dataset().await?;
    let second = context.dataset().await?;

    assert_eq!(first, second);
    assert_eq!(context.dataset_id().await, Some(first.dataset_id));
    assert_eq!(server.calls(Phase::CreateDataset), 1);
    Ok(())
}

#[tokio::test]
async fn test_replay_after_lost_response_reuses_dataset() -> Result<(), Box<dyn std::error::Error>>
{
    let _ = env_logger::try_init();

    let network = MockNetwork::new();
    let record = ProviderRecord::new(1, "http://sp1.test");
    let server = network.add_provider(record.clone());
    let registrar = registrar(&network, &record);
    let meta = metadata(&[("project", "demo")]);

    server.fail_next(Phase::CreateDataset, MockFailure::DropResponse);
    let err = registrar
        .create_or_reuse(CLIENT, 1, 7, &meta)
        .await
        .unwrap_err();

    assert!(err.is_retryable());
    assert_eq!(err.phase(), Some(Phase::CreateDataset));
    let expected_key = DatasetRegistrar::dataset_key(CLIENT, 1, 7, &meta);
    assert_eq!(err.retry_key(), Some(&expected_key));

    // The provider did create the dataset before the response was lost
    let on_chain = network.chain().dataset(1).expect("dataset recorded on chain");
    assert_eq!(on_chain.client_dataset_id, 7);

    let replayed = registrar.create_or_reuse(CLIENT, 1, 7, &meta).await?;
    assert_eq!(replayed.dataset_id, on_chain.dataset_id);
    assert!(!replayed.is_new);
    assert_eq!(server.datasets_created(), 1);
    Ok(())
}

#[tokio::test]
async fn test_different_metadata_is_a_conflict() -> Result<(), Box<dyn std::error::Error>> {
    let _ = env_logger::try_init();

    let network = MockNetwork::new();
    let record = ProviderRecord::new(1, "http://sp1.test");
    let server = network.add_provider(record.clone());
    let registrar = registrar(&network, &record);

    let created = registrar
        .create_or_reuse(CLIENT, 1, 1, &metadata(&[("project", "demo")]))
        .await?;

    let requested = metadata(&[("project", "other")]);
    let err = registrar
        .create_or_reuse(CLIENT, 1, 1, &requested)
        .await
        .unwrap_err();

    match err {
        StorageError::MetadataConflict {
            dataset_id,
            requested: got_requested,
            stored,
        } => {
            assert_eq!(dataset_id, created.dataset_id);
            assert_eq!(got_requested, requested);
            assert_eq!(stored, metadata(&[("project", "demo")]));
        }
        other => panic!("expected a metadata conflict, got {:?}", other),
    }
    assert_eq!(server.datasets_created(), 1);
    Ok(())
}

#[tokio::test]
async fn test_idempotency_error_propagates() {
    let _ = env_logger::try_init();

    let network = MockNetwork::new();
    let record = ProviderRecord::new(1, "http://sp1.test");
    let server = network.add_provider(record.clone());
    let registrar = registrar(&network, &record);

    server.fail_next(Phase::CreateDataset, MockFailure::Status(422));
    let err = registrar
        .create_or_reuse(CLIENT, 1, 1, &Metadata::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        StorageError::Idempotency {
            phase: Phase::CreateDataset,
            ..
        }
    ));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_server_error_is_transient() {
    let _ = env_logger::try_init();

    let network = MockNetwork::new();
    let record = ProviderRecord::new(1, "http://sp1.test");
    let server = network.add_provider(record.clone());
    let registrar = registrar(&network, &record);

    server.fail_next(Phase::CreateDataset, MockFailure::Status(503));
    let err = registrar
        .create_or_reuse(CLIENT, 1, 1, &Metadata::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        StorageError::Transient {
            status: Some(503),
            ..
        }
    ));
    assert!(err.retry_key().is_some());
    assert_eq!(server.datasets_created(), 0);
}

#[tokio::test]
async fn test_registrar_rejects_foreign_provider() {
    let network = MockNetwork::new();
    let record = ProviderRecord::new(1, "http://sp1.test");
    network.add_provider(record.clone());
    let registrar = registrar(&network, &record);

    let err = registrar
        .create_or_reuse(CLIENT, 2, 1, &Metadata::new())
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::Validation { .. }));
}
