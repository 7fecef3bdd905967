//! Provider selection and dataset reuse through `StorageManager::create_context`

use chrono::{Duration as ChronoDuration, Utc};
use pdp_storage::mock::MockNetwork;
use pdp_storage::{
    Capability, ContextOptions, Metadata, Phase, ProviderHealth, ProviderRecord, StorageError,
};

const CLIENT: &str = "0xclient";

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test]
async fn test_matching_dataset_is_reused() -> Result<(), Box<dyn std::error::Error>> {
    let _ = env_logger::try_init();

    let network = MockNetwork::new();
    let server = network.add_provider(ProviderRecord::new(1, "http://sp1.test"));
    let manager = network.manager(CLIENT);
    let options = ContextOptions::new().metadata("app", "photos");

    let first = manager.create_context(options.clone()).await?;
    let created = first.dataset().await?;
    assert!(created.is_new);
    first.upload(&payload(512), Metadata::new()).await?;

    let second = manager.create_context(options).await?;
    assert_eq!(second.dataset_id().await, Some(created.dataset_id));
    let reused = second.dataset().await?;
    assert!(!reused.is_new);
    assert_eq!(reused.metadata, created.metadata);
    assert_eq!(server.calls(Phase::CreateDataset), 1);

    let datasets = manager.find_datasets().await?;
    assert_eq!(datasets.len(), 1);
    assert_eq!(datasets[0].active_piece_count, 1);
    Ok(())
}

#[tokio::test]
async fn test_different_metadata_plans_new_dataset() -> Result<(), Box<dyn std::error::Error>> {
    let network = MockNetwork::new();
    network.add_provider(ProviderRecord::new(1, "http://sp1.test"));
    let manager = network.manager(CLIENT);

    let first = manager
        .create_context(ContextOptions::new().metadata("app", "photos"))
        .await?;
    let created = first.dataset().await?;

    let second = manager
        .create_context(ContextOptions::new().metadata("app", "videos"))
        .await?;
    assert_eq!(second.dataset_id().await, None);
    assert_eq!(second.client_dataset_id(), created.client_dataset_id + 1);

    let other = second.dataset().await?;
    assert!(other.is_new);
    assert_ne!(other.dataset_id, created.dataset_id);

    // A subset of the stored metadata is not a match either
    let subset = manager.create_context(ContextOptions::new()).await?;
    assert_eq!(subset.dataset_id().await, None);
    Ok(())
}

#[tokio::test]
async fn test_force_create_skips_reuse() -> Result<(), Box<dyn std::error::Error>> {
    let network = MockNetwork::new();
    network.add_provider(ProviderRecord::new(1, "http://sp1.test"));
    let manager = network.manager(CLIENT);

    let first = manager.create_context(ContextOptions::new()).await?;
    first.dataset().await?;

    let forced = manager
        .create_context(ContextOptions::new().force_create())
        .await?;
    assert_eq!(forced.dataset_id().await, None);
    assert_eq!(forced.client_dataset_id(), 2);
    Ok(())
}

#[tokio::test]
async fn test_unreachable_provider_is_not_reused() -> Result<(), Box<dyn std::error::Error>> {
    let _ = env_logger::try_init();

    let network = MockNetwork::new();
    let old = Utc::now() - ChronoDuration::days(30);
    let first = network.add_provider(ProviderRecord::new(1, "http://sp1.test").registered_at(old));
    network.add_provider(ProviderRecord::new(2, "http://sp2.test").registered_at(old));
    let manager = network.manager(CLIENT);

    let context = manager
        .create_context(ContextOptions::new().provider_id(1))
        .await?;
    context.dataset().await?;

    first.set_online(false);
    let replacement = manager.create_context(ContextOptions::new()).await?;
    assert_eq!(replacement.provider().provider_id, 2);
    assert_eq!(replacement.dataset_id().await, None);
    Ok(())
}

#[tokio::test]
async fn test_selection_follows_ranking_and_ping() -> Result<(), Box<dyn std::error::Error>> {
    let network = MockNetwork::new();
    let now = Utc::now();
    network.add_provider(
        ProviderRecord::new(1, "http://sp1.test").registered_at(now - ChronoDuration::days(10)),
    );
    let newest =
        network.add_provider(ProviderRecord::new(2, "http://sp2.test").registered_at(now));
    network.add_provider(
        ProviderRecord::new(3, "http://sp3.test")
            .registered_at(now + ChronoDuration::days(1))
            .health(ProviderHealth::Degraded),
    );
    let manager = network.manager(CLIENT);

    let context = manager.create_context(ContextOptions::new()).await?;
    assert_eq!(context.provider().provider_id, 2, "healthy and newest wins");

    newest.set_online(false);
    let context = manager.create_context(ContextOptions::new()).await?;
    assert_eq!(context.provider().provider_id, 1);

    let context = manager
        .create_context(ContextOptions::new().exclude_provider(1))
        .await?;
    assert_eq!(context.provider().provider_id, 3);
    Ok(())
}

#[tokio::test]
async fn test_cdn_requires_capable_provider() -> Result<(), Box<dyn std::error::Error>> {
    let network = MockNetwork::new();
    network.add_provider(ProviderRecord::new(1, "http://sp1.test"));
    let manager = network.manager(CLIENT);

    let err = manager
        .create_context(ContextOptions::new().with_cdn(true))
        .await
        .err()
        .expect("no provider offers a CDN");
    assert!(matches!(err, StorageError::Registry { .. }));

    network.add_provider(ProviderRecord::new(2, "http://sp2.test").capability(Capability::Cdn));
    let context = manager
        .create_context(ContextOptions::new().with_cdn(true))
        .await?;
    assert_eq!(context.provider().provider_id, 2);
    assert_eq!(context.metadata().get("withCDN"), Some(&String::new()));
    Ok(())
}

#[tokio::test]
async fn test_pinned_dataset() -> Result<(), Box<dyn std::error::Error>> {
    let network = MockNetwork::new();
    let server = network.add_provider(ProviderRecord::new(1, "http://sp1.test"));
    let manager = network.manager(CLIENT);

    let created = manager
        .create_context(ContextOptions::new().metadata("app", "photos"))
        .await?
        .dataset()
        .await?;

    let pinned = manager
        .create_context(ContextOptions::new().dataset_id(created.dataset_id))
        .await?;
    assert_eq!(pinned.dataset_id().await, Some(created.dataset_id));
    assert_eq!(pinned.metadata(), &created.metadata);

    let err = manager
        .create_context(
            ContextOptions::new()
                .dataset_id(created.dataset_id)
                .metadata("app", "videos"),
        )
        .await
        .err()
        .expect("metadata differs from the pinned dataset");
    assert!(matches!(err, StorageError::MetadataConflict { .. }));

    network.chain().terminate_dataset(created.dataset_id);
    let err = manager
        .create_context(ContextOptions::new().dataset_id(created.dataset_id))
        .await
        .err()
        .expect("terminated datasets cannot be pinned");
    assert!(matches!(err, StorageError::Validation { .. }));
    assert_eq!(server.calls(Phase::CreateDataset), 1);
    Ok(())
}

#[tokio::test]
async fn test_no_providers_registered() {
    let network = MockNetwork::new();
    let err = network
        .manager(CLIENT)
        .create_context(ContextOptions::new())
        .await
        .err()
        .expect("nothing to select");
    assert!(matches!(err, StorageError::Registry { .. }));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_replicas_land_on_distinct_providers() -> Result<(), Box<dyn std::error::Error>> {
    let _ = env_logger::try_init();

    let network = MockNetwork::new();
    let servers: Vec<_> = (1..=3)
        .map(|id| network.add_provider(ProviderRecord::new(id, format!("http://sp{}.test", id))))
        .collect();
    let manager = network.manager(CLIENT);

    let contexts = manager
        .create_contexts(2, ContextOptions::new().metadata("app", "backup"))
        .await?;
    assert_eq!(contexts.len(), 2);
    let used: Vec<u64> = contexts.iter().map(|c| c.provider().provider_id).collect();
    assert_ne!(used[0], used[1]);

    let data = payload(900);
    let outcomes = manager.upload_multi(&contexts, &data, Metadata::new()).await?;
    assert_eq!(outcomes.len(), 2);
    let piece_cid = outcomes[0].piece_cid().clone();
    assert!(outcomes.iter().all(|o| o.is_complete() && o.piece_cid() == &piece_cid));

    for context in &contexts {
        assert!(context.has_piece(&piece_cid).await?);
    }
    let unused = (1..=3).find(|id| !used.contains(id)).expect("one provider left");
    let other = manager
        .create_context(ContextOptions::new().provider_id(unused))
        .await?;
    assert!(!other.has_piece(&piece_cid).await?);

    // Either copy serves the download once the other holder is gone
    servers[(used[0] - 1) as usize].set_online(false);
    assert_eq!(manager.download(&piece_cid).await?, data);
    Ok(())
}

#[tokio::test]
async fn test_replicas_limited_by_available_providers(
) -> Result<(), Box<dyn std::error::Error>> {
    let network = MockNetwork::new();
    network.add_provider(ProviderRecord::new(1, "http://sp1.test"));
    network.add_provider(ProviderRecord::new(2, "http://sp2.test"));
    let manager = network.manager(CLIENT);

    let contexts = manager
        .create_contexts(3, ContextOptions::new().provider_id(2))
        .await?;
    let used: Vec<u64> = contexts.iter().map(|c| c.provider().provider_id).collect();
    assert_eq!(used, vec![2, 1], "pinned provider first, then the rest");

    let err = manager
        .create_contexts(0, ContextOptions::new())
        .await
        .err()
        .expect("zero replicas is rejected");
    assert!(matches!(err, StorageError::Validation { .. }));

    let empty = MockNetwork::new().manager(CLIENT);
    let err = empty
        .create_contexts(2, ContextOptions::new())
        .await
        .err()
        .expect("no providers registered");
    assert!(matches!(err, StorageError::Registry { .. }));
    Ok(())
}
