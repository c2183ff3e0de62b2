//! Runs against a live broker only when `MEDMAN_TEST_REDIS_URL` is set.
#![cfg(feature = "redis")]

use std::time::Duration;

use medman_core::job::{JobId, JobPayload, JobState, NewJob};
use medman_core::store::{JobStore, RedisJobStore};
use medman_core::QueueError;

const Q: &str = "thumbnailQueue";

async fn store() -> Option<RedisJobStore> {
    let Ok(url) = std::env::var("MEDMAN_TEST_REDIS_URL") else {
        eprintln!("MEDMAN_TEST_REDIS_URL not set; skipping");
        return None;
    };
    let prefix = format!("medman-test-{}", uuid::Uuid::new_v4());
    Some(
        RedisJobStore::new(&url, &prefix)
            .await
            .expect("connect to test redis"),
    )
}

fn job(id: &str, priority: i64) -> NewJob {
    let mut payload = JobPayload::new();
    payload.insert("id".into(), id.into());
    NewJob::new(JobId::from(id), "thumbnail-generation", payload).with_priority(priority)
}

#[tokio::test]
async fn bulk_add_is_idempotent_and_claims_by_priority() {
    let Some(store) = store().await else { return };

    let first = store
        .add_bulk(Q, vec![job("a", 0), job("b", 80), job("c", 20)])
        .await
        .expect("bulk add");
    assert_eq!((first.added, first.skipped), (3, 0));
    let second = store
        .add_bulk(Q, vec![job("a", 5), job("d", 0)])
        .await
        .expect("bulk add");
    assert_eq!((second.added, second.skipped), (1, 1));

    let order: Vec<String> = {
        let mut ids = Vec::new();
        while let Some(job) = store.claim(Q, "test-w0").await.expect("claim") {
            ids.push(job.id.to_string());
        }
        ids
    };
    assert_eq!(order, vec!["b", "c", "a", "d"]);

    let counts = store.job_counts(Q).await.expect("counts");
    assert_eq!(counts.active, 4);
    assert_eq!(
        store.get_job(Q, &JobId::from("a")).await.expect("get").expect("job").priority,
        0
    );
}

#[tokio::test]
async fn pause_blocks_claims_and_resume_restores_them() {
    let Some(store) = store().await else { return };
    store.add(Q, job("a", 0)).await.expect("add");

    store.pause(Q).await.expect("pause");
    assert!(store.is_paused(Q).await.expect("flag"));
    assert!(store.claim(Q, "test-w0").await.expect("claim").is_none());
    assert_eq!(store.job_counts(Q).await.expect("counts").paused, 1);

    store.resume(Q).await.expect("resume");
    let claimed = store.claim(Q, "test-w0").await.expect("claim").expect("job");
    assert_eq!(claimed.state, JobState::Active);
    assert_eq!(claimed.attempts, 1);
}

#[tokio::test]
async fn active_jobs_are_locked_until_finished() {
    let Some(store) = store().await else { return };
    store.add(Q, job("a", 0)).await.expect("add");
    let claimed = store.claim(Q, "test-w0").await.expect("claim").expect("job");

    let err = store.remove(Q, &claimed.id).await.expect_err("locked");
    assert!(matches!(err, QueueError::JobLocked(_)));

    store.fail(Q, &claimed.id, "decoder crashed").await.expect("fail");
    let failed = store
        .get_jobs(Q, JobState::Failed, 0, None)
        .await
        .expect("failed jobs");
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].failed_reason.as_deref(), Some("decoder crashed"));

    assert_eq!(
        store
            .clean(Q, Duration::ZERO, 0, JobState::Failed)
            .await
            .expect("clean"),
        1
    );
    assert!(!store.remove(Q, &claimed.id).await.expect("remove missing"));
}

#[tokio::test]
async fn delayed_jobs_become_ready_when_due() {
    let Some(store) = store().await else { return };
    store
        .add(Q, job("later", 0).with_delay(Duration::from_millis(200)))
        .await
        .expect("add");

    assert_eq!(store.job_counts(Q).await.expect("counts").delayed, 1);
    assert!(store.claim(Q, "test-w0").await.expect("claim").is_none());

    tokio::time::sleep(Duration::from_millis(300)).await;
    let claimed = store.claim(Q, "test-w0").await.expect("claim");
    assert_eq!(claimed.map(|job| job.id.to_string()), Some("later".to_string()));
}
