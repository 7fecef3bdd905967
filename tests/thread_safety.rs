//! Tests for thread safety of the async workflows
//!
//! Applications drive uploads from `tokio::spawn`, which requires the
//! returned futures to be Send. These tests fail to compile otherwise.

use pdp_storage::mock::{MockCommitment, MockNetwork};
use pdp_storage::{ContextOptions, Metadata, ProviderRecord};
use std::sync::Arc;
use std::thread;
use tokio_test::assert_ok;

const CLIENT: &str = "0xclient";

/// The future returned by `create_context` can be moved to another thread
#[tokio::test]
async fn test_create_context_returns_send_future() {
    let network = MockNetwork::new();
    network.add_provider(ProviderRecord::new(1, "http://sp1.test"));
    let manager = network.manager(CLIENT);

    let future = async move { manager.create_context(ContextOptions::new()).await };

    let handle = thread::spawn(move || {
        // Moving the future proves it is Send; it is not polled here
        std::mem::drop(future);
    });
    handle.join().expect("Thread panicked");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_uploads_in_tokio_spawn() -> Result<(), Box<dyn std::error::Error>> {
    let _ = env_logger::try_init();

    let network = MockNetwork::new();
    let server = network.add_provider(ProviderRecord::new(1, "http://sp1.test"));
    let manager = network.manager(CLIENT);
    let context = Arc::new(manager.create_context(ContextOptions::new()).await?);

    let mut handles = Vec::new();
    for i in 0..4u8 {
        let context = context.clone();
        handles.push(tokio::spawn(async move {
            let data = vec![i; 512 + i as usize];
            context.upload(&data, Metadata::new()).await
        }));
    }

    let mut cids = Vec::new();
    for handle in handles {
        let outcome = assert_ok!(handle.await?);
        cids.push(outcome.piece_cid().clone());
    }

    for (i, cid) in cids.iter().enumerate() {
        assert_eq!(cid, &MockCommitment::piece_cid(&vec![i as u8; 512 + i])?);
        assert_eq!(manager.download(cid).await?, vec![i as u8; 512 + i]);
    }

    // All four tasks shared one lazily created dataset
    let dataset_id = context.dataset_id().await.expect("dataset resolved");
    assert_eq!(server.datasets_created(), 1);
    assert_eq!(server.dataset_pieces(dataset_id).len(), 4);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_retrieval_in_tokio_spawn() -> Result<(), Box<dyn std::error::Error>> {
    let network = MockNetwork::new();
    network.add_provider(ProviderRecord::new(1, "http://sp1.test"));
    let manager = network.manager(CLIENT);

    let context = manager.create_context(ContextOptions::new()).await?;
    let data = vec![3u8; 2048];
    let cid = context
        .upload(&data, Metadata::new())
        .await?
        .piece_cid()
        .clone();

    let retriever = manager.retriever();
    let fetched = tokio::spawn(async move { retriever.fetch(&cid).await }).await??;
    assert_eq!(fetched, data);
    Ok(())
}
