//! Integration tests for the sliding-window rate limiter (spec.md §4.5,
//! §8 invariant 4 and scenario S4).
//!
//! Requires: `DATABASE_URL` pointing at a scratch Postgres with this
//! crate's migrations applied.

use bintranslate::ratelimit;
use bintranslate::storage::db::Store;

async fn test_store() -> Store {
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for integration tests");
    let store = Store::connect(&database_url).await.expect("failed to connect to test database");
    store.migrate().await.expect("failed to run migrations");
    store
}

#[tokio::test]
async fn requests_within_the_cap_are_all_allowed() {
    let store = test_store().await;
    let identifier = format!("key-{}", uuid::Uuid::new_v4());

    for i in 0..10 {
        let decision = ratelimit::check_and_consume(&store, "api_key", &identifier, 60, 10)
            .await
            .expect("rate limit check should not error");
        assert!(decision.allowed, "request {i} should be allowed under the cap");
    }
}

/// Invariant 4 / boundary behavior: the 11th request within the window
/// for a 10-req/min tier is rejected with a retry-after hint.
#[tokio::test]
async fn eleventh_request_within_window_is_denied() {
    let store = test_store().await;
    let identifier = format!("key-{}", uuid::Uuid::new_v4());

    for _ in 0..10 {
        let decision = ratelimit::check_and_consume(&store, "api_key", &identifier, 60, 10).await.unwrap();
        assert!(decision.allowed);
    }

    let eleventh = ratelimit::check_and_consume(&store, "api_key", &identifier, 60, 10).await.unwrap();
    assert!(!eleventh.allowed, "the 11th request should be denied");
    assert_eq!(eleventh.retry_after_seconds, 60);
}

/// Two distinct identifiers never share quota.
#[tokio::test]
async fn limits_are_scoped_per_identifier() {
    let store = test_store().await;
    let a = format!("key-{}", uuid::Uuid::new_v4());
    let b = format!("key-{}", uuid::Uuid::new_v4());

    for _ in 0..5 {
        assert!(ratelimit::check_and_consume(&store, "api_key", &a, 60, 5).await.unwrap().allowed);
    }
    assert!(!ratelimit::check_and_consume(&store, "api_key", &a, 60, 5).await.unwrap().allowed);

    // b's quota is untouched by a's exhaustion.
    assert!(ratelimit::check_and_consume(&store, "api_key", &b, 60, 5).await.unwrap().allowed);
}

/// Concurrent requests against the same identifier must never let more
/// than `max_requests` through — the prune/sum/increment transaction
/// serializes concurrent callers rather than racing past the cap.
#[tokio::test]
async fn concurrent_requests_never_exceed_the_cap() {
    let store = test_store().await;
    let identifier = format!("key-{}", uuid::Uuid::new_v4());
    let max_requests = 5u32;

    let mut handles = Vec::new();
    for _ in 0..20 {
        let store = store.clone();
        let identifier = identifier.clone();
        handles.push(tokio::spawn(async move {
            ratelimit::check_and_consume(&store, "api_key", &identifier, 60, max_requests).await
        }));
    }

    let mut allowed_count = 0;
    for handle in handles {
        if handle.await.unwrap().unwrap().allowed {
            allowed_count += 1;
        }
    }

    assert_eq!(allowed_count, max_requests as usize, "exactly max_requests callers should be admitted");
}
