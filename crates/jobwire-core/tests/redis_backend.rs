//! Redis-backed scenarios. Run with a live server:
//!
//! ```text
//! JOBWIRE_TEST_REDIS_URL=redis://localhost:6379/15 cargo test -p jobwire-core -- --ignored
//! ```
#![cfg(feature = "redis")]

use std::time::Duration;

use jobwire_core::domain::{
    GetOptions, JobId, JobStatusType, PublishOptions, QueueDeclaration, QueueMetadata,
    QueueMetadataUpdate,
};
use jobwire_core::error::JobwireError;
use jobwire_core::impls::{RedisMetadataStore, RedisQueue, RedisResultStorage};
use jobwire_core::ports::{MessageQueue, QueueMetadataStore, ResultStorage};
use ulid::Ulid;

fn redis_url() -> String {
    std::env::var("JOBWIRE_TEST_REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379/15".into())
}

/// Queue names are unique per run so tests do not see each other's data.
fn unique(name: &str) -> String {
    format!("jobwire-test-{name}-{}", Ulid::new().to_string().to_ascii_lowercase())
}

#[tokio::test]
#[ignore = "needs a redis server (JOBWIRE_TEST_REDIS_URL)"]
async fn priority_and_fifo_order_on_redis() {
    let queue = RedisQueue::new(&redis_url()).unwrap();
    queue.connect().await.unwrap();
    let name = unique("prio");
    queue
        .declare_queue(&QueueDeclaration::new(&name).with_max_priority(10))
        .await
        .unwrap();

    for (body, priority) in [("a", 1), ("b", 5), ("c", 1), ("d", 5)] {
        queue
            .publish(&name, body.as_bytes(), PublishOptions::default().with_priority(Some(priority)))
            .await
            .unwrap();
    }

    let mut order = Vec::new();
    while let Some(m) = queue.get(&name, GetOptions::default()).await.unwrap() {
        order.push(String::from_utf8(m.body.clone()).unwrap());
        queue.ack(&m.delivery_tag).await.unwrap();
    }
    assert_eq!(order, vec!["b", "d", "a", "c"]);
    queue.delete_queue(&name).await.unwrap();
}

#[tokio::test]
#[ignore = "needs a redis server (JOBWIRE_TEST_REDIS_URL)"]
async fn nack_requeue_restores_position_on_redis() {
    let queue = RedisQueue::new(&redis_url()).unwrap();
    let name = unique("nack");
    queue
        .declare_queue(&QueueDeclaration::new(&name).with_max_priority(10))
        .await
        .unwrap();
    for body in ["first", "second"] {
        queue
            .publish(&name, body.as_bytes(), PublishOptions::default().with_priority(Some(3)))
            .await
            .unwrap();
    }

    let first = queue.get(&name, GetOptions::default()).await.unwrap().unwrap();
    queue.nack(&first.delivery_tag, true).await.unwrap();
    assert!(queue.ack(&first.delivery_tag).await.unwrap_err().is_not_found());

    let again = queue.get(&name, GetOptions::default()).await.unwrap().unwrap();
    assert_eq!(again.body, b"first");
    assert!(again.redelivered);

    assert_eq!(queue.purge_queue(&name).await.unwrap(), 1);
    queue.delete_queue(&name).await.unwrap();
}

#[tokio::test]
#[ignore = "needs a redis server (JOBWIRE_TEST_REDIS_URL)"]
async fn status_wait_wakes_on_publish() {
    let storage = std::sync::Arc::new(RedisResultStorage::new(&redis_url(), "jobwire-test").unwrap());
    let id = JobId::new(unique("job"));
    storage.create_job_status(&id).await.unwrap();

    let writer = {
        let storage = storage.clone();
        let id = id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            storage.complete_job(&id, Some("42".into()), None, None).await
        })
    };
    let status = storage
        .wait_for_completion(&id, Duration::from_secs(5), 2)
        .await
        .unwrap();
    assert_eq!(status.status, JobStatusType::Completed);
    writer.await.unwrap().unwrap();

    storage.delete_job_status(&id).await.unwrap();
    assert!(storage.get_job_status(&id).await.unwrap_err().is_not_found());
}

#[tokio::test]
#[ignore = "needs a redis server (JOBWIRE_TEST_REDIS_URL)"]
async fn concurrent_completions_keep_the_first_result() {
    let storage = std::sync::Arc::new(RedisResultStorage::new(&redis_url(), "jobwire-test").unwrap());
    let id = JobId::new(unique("race"));
    storage.create_job_status(&id).await.unwrap();

    let writers: Vec<_> = (0..16)
        .map(|n| {
            let storage = storage.clone();
            let id = id.clone();
            tokio::spawn(async move { (n, storage.complete_job(&id, Some(n.to_string()), None, None).await) })
        })
        .collect();
    let mut winners = Vec::new();
    for writer in writers {
        match writer.await.unwrap() {
            (n, Ok(())) => winners.push(n),
            (_, Err(err)) => assert!(matches!(err, JobwireError::TerminalState(_)), "{err}"),
        }
    }
    assert_eq!(winners.len(), 1);

    let status = storage.get_job_status(&id).await.unwrap();
    assert_eq!(status.result, Some(winners[0].to_string()));
    assert!(matches!(
        storage.update_job_status(&id, JobStatusType::InProgress, None).await,
        Err(JobwireError::TerminalState(_))
    ));
    storage.delete_job_status(&id).await.unwrap();
}

#[tokio::test]
#[ignore = "needs a redis server (JOBWIRE_TEST_REDIS_URL)"]
async fn metadata_update_touches_only_descriptive_fields() {
    let store = RedisMetadataStore::new(&redis_url(), unique("db")).unwrap();
    let declaration = QueueDeclaration::new("q").with_max_priority(4);
    store
        .insert(QueueMetadata::from_declaration(&declaration, None, None))
        .await
        .unwrap();

    let changed = store
        .update(
            "q",
            &QueueMetadataUpdate {
                model: None,
                description: Some("batch".into()),
            },
        )
        .await
        .unwrap();
    assert!(changed);
    let stored = store.get("q").await.unwrap().unwrap();
    assert_eq!(stored.description.as_deref(), Some("batch"));
    assert_eq!(stored.max_priority(), Some(4));

    assert!(store.delete("q").await.unwrap());
    assert!(store.list().await.unwrap().is_empty());
}
