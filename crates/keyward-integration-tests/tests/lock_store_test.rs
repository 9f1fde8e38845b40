// Integration tests for lock-bearing stores
// Every scenario runs against both the transactional and the consistent-key
// backend unless it exercises claim leases, which only the latter has.

use std::time::Duration;

use keyward_common::{Entry, KeyColumnValueStore, StorageError, StoreTransaction};
use keyward_integration_tests::{
    Backend, LOCK_EXPIRE_MS, LockCluster, bytes, finish, lock_and_write,
};
use keyward_locking::LockStrategy;

const KEY: &str = "key";
const COL1: &str = "col1";
const COL2: &str = "col2";

#[tokio::test]
async fn test_single_lock_round() {
    for backend in Backend::ALL {
        let cluster = LockCluster::open(backend, 2).await;
        let host = cluster.host(0);

        let tx = host.begin().await;
        let result = lock_and_write(host, &tx, KEY, COL1, "1", None).await;
        finish(&tx, result).await.unwrap();

        assert_eq!(host.read(KEY, COL1).await, Some(bytes("1")));
        assert_eq!(cluster.host(1).read(KEY, COL1).await, Some(bytes("1")));
        assert_eq!(host.claim_records(KEY, COL1).await, 0);
    }
}

#[tokio::test]
async fn test_transaction_may_reenter_lock() {
    for backend in Backend::ALL {
        let cluster = LockCluster::open(backend, 2).await;
        let host = cluster.host(0);
        let tx = host.begin().await;

        for _ in 0..3 {
            host.store
                .acquire_lock(KEY.as_bytes(), COL1.as_bytes(), None, &tx)
                .await
                .unwrap();
        }
        if backend == Backend::ConsistentKey {
            assert_eq!(host.claim_records(KEY, COL1).await, 1);
        }

        let result = lock_and_write(host, &tx, KEY, COL1, "1", None).await;
        finish(&tx, result).await.unwrap();
        assert_eq!(host.read(KEY, COL1).await, Some(bytes("1")));
    }
}

#[tokio::test]
async fn test_expected_value_mismatch() {
    for backend in Backend::ALL {
        let cluster = LockCluster::open(backend, 2).await;
        let host = cluster.host(0);
        let tx = host.begin().await;

        let result = lock_and_write(host, &tx, KEY, COL1, "1", Some("foobar")).await;
        let err = finish(&tx, result).await.unwrap_err();
        assert!(
            matches!(err, StorageError::ExpectationViolated { .. }),
            "{backend:?}: unexpected error {err}"
        );
        assert!(err.is_permanent());
        assert_eq!(host.read(KEY, COL1).await, None);
    }
}

#[tokio::test]
async fn test_expected_value_match() {
    for backend in Backend::ALL {
        let cluster = LockCluster::open(backend, 2).await;
        let host = cluster.host(0);

        let tx = host.begin().await;
        let result = lock_and_write(host, &tx, KEY, COL1, "1", None).await;
        finish(&tx, result).await.unwrap();

        let tx = host.begin().await;
        let result = lock_and_write(host, &tx, KEY, COL1, "2", Some("1")).await;
        finish(&tx, result).await.unwrap();
        assert_eq!(host.read(KEY, COL1).await, Some(bytes("2")));
    }
}

#[tokio::test]
async fn test_single_host_contention() {
    for backend in Backend::ALL {
        let cluster = LockCluster::open(backend, 2).await;
        let host = cluster.host(0);
        let tx1 = host.begin().await;
        let tx2 = host.begin().await;

        host.store
            .acquire_lock(KEY.as_bytes(), COL1.as_bytes(), None, &tx1)
            .await
            .unwrap();
        let second = host
            .store
            .acquire_lock(KEY.as_bytes(), COL1.as_bytes(), None, &tx2)
            .await;

        match host.manager.strategy() {
            LockStrategy::ConsistentKey => {
                // Rejected by the local mediator before touching the store
                assert!(matches!(second, Err(StorageError::LockContention { .. })));
                assert_eq!(host.claim_records(KEY, COL1).await, 1);
                tx2.rollback().await.unwrap();
                let result = lock_and_write(host, &tx1, KEY, COL1, "1", None).await;
                finish(&tx1, result).await.unwrap();
            }
            _ => {
                // Isolation lets both proceed until commit
                second.unwrap();
                let r1 = lock_and_write(host, &tx1, KEY, COL1, "1", None).await;
                let r2 = lock_and_write(host, &tx2, KEY, COL1, "2", None).await;
                finish(&tx1, r1).await.unwrap();
                let err = finish(&tx2, r2).await.unwrap_err();
                assert!(matches!(err, StorageError::LockContention { .. }));
                assert!(err.is_locking());
            }
        }
        assert_eq!(host.read(KEY, COL1).await, Some(bytes("1")));
    }
}

#[tokio::test]
async fn test_two_hosts_exactly_one_write_succeeds() {
    for backend in Backend::ALL {
        let cluster = LockCluster::open(backend, 2).await;
        let (h0, h1) = (cluster.host(0), cluster.host(1));
        let tx0 = h0.begin().await;
        let tx1 = h1.begin().await;

        // Different mediator namespaces: both acquisitions look fine
        h0.store
            .acquire_lock(KEY.as_bytes(), COL1.as_bytes(), None, &tx0)
            .await
            .unwrap();
        h1.store
            .acquire_lock(KEY.as_bytes(), COL1.as_bytes(), None, &tx1)
            .await
            .unwrap();

        let w1 = lock_and_write(h1, &tx1, KEY, COL1, "1", None).await;
        let w0 = lock_and_write(h0, &tx0, KEY, COL1, "0", None).await;
        let r0 = finish(&tx0, w0).await;
        let r1 = finish(&tx1, w1).await;

        let outcomes = [&r0, &r1];
        assert_eq!(
            outcomes.iter().filter(|r| r.is_ok()).count(),
            1,
            "{backend:?}: {r0:?} / {r1:?}"
        );
        let failure = outcomes
            .iter()
            .find_map(|r| r.as_ref().err())
            .unwrap();
        assert!(
            matches!(failure, StorageError::LockContention { .. }),
            "{backend:?}: {failure}"
        );
        assert!(!failure.is_retryable());
        if backend == Backend::ConsistentKey {
            // Equal timestamps tie-break on instance id
            assert!(r0.is_ok());
        }
    }
}

#[tokio::test]
async fn test_multiple_locks_released_on_commit() {
    for backend in Backend::ALL {
        let cluster = LockCluster::open(backend, 2).await;
        let (h0, h1) = (cluster.host(0), cluster.host(1));

        let tx = h0.begin().await;
        let mut result = lock_and_write(h0, &tx, KEY, COL1, "a", None).await;
        if result.is_ok() {
            result = lock_and_write(h0, &tx, KEY, COL2, "b", None).await;
        }
        finish(&tx, result).await.unwrap();
        assert_eq!(h0.claim_records(KEY, COL1).await, 0);
        assert_eq!(h0.claim_records(KEY, COL2).await, 0);

        // Another host can take both right away
        let tx = h1.begin().await;
        let mut result = lock_and_write(h1, &tx, KEY, COL1, "c", Some("a")).await;
        if result.is_ok() {
            result = lock_and_write(h1, &tx, KEY, COL2, "d", Some("b")).await;
        }
        finish(&tx, result).await.unwrap();
        assert_eq!(h0.read(KEY, COL2).await, Some(bytes("d")));
    }
}

#[tokio::test]
async fn test_rollback_releases_lock() {
    for backend in Backend::ALL {
        let cluster = LockCluster::open(backend, 2).await;
        let host = cluster.host(0);

        let tx1 = host.begin().await;
        host.store
            .acquire_lock(KEY.as_bytes(), COL1.as_bytes(), None, &tx1)
            .await
            .unwrap();
        tx1.rollback().await.unwrap();

        let tx2 = host.begin().await;
        let result = lock_and_write(host, &tx2, KEY, COL1, "2", None).await;
        finish(&tx2, result).await.unwrap();
    }
}

#[tokio::test]
async fn test_expired_local_lock_is_ignored() {
    let cluster = LockCluster::open(Backend::ConsistentKey, 2).await;
    let host = cluster.host(0);

    // tx1 never finishes, as if its process stalled
    let tx1 = host.begin().await;
    host.store
        .acquire_lock(KEY.as_bytes(), COL1.as_bytes(), None, &tx1)
        .await
        .unwrap();

    cluster.clock.advance(Duration::from_millis(LOCK_EXPIRE_MS));

    let tx2 = host.begin().await;
    let result = lock_and_write(host, &tx2, KEY, COL1, "2", None).await;
    finish(&tx2, result).await.unwrap();
    assert_eq!(host.read(KEY, COL1).await, Some(bytes("2")));
}

#[tokio::test]
async fn test_expired_remote_lock_is_ignored() {
    let cluster = LockCluster::open(Backend::ConsistentKey, 2).await;
    let (h0, h1) = (cluster.host(0), cluster.host(1));

    let tx0 = h0.begin().await;
    h0.store
        .acquire_lock(KEY.as_bytes(), COL1.as_bytes(), None, &tx0)
        .await
        .unwrap();

    cluster.clock.advance(Duration::from_millis(LOCK_EXPIRE_MS));

    let tx1 = h1.begin().await;
    let result = lock_and_write(h1, &tx1, KEY, COL1, "1", None).await;
    finish(&tx1, result).await.unwrap();

    // The stale holder lost its lease
    let late = lock_and_write(h0, &tx0, KEY, COL1, "0", None).await;
    assert!(matches!(late, Err(StorageError::LockContention { .. })));
    tx0.rollback().await.unwrap();
    assert_eq!(h1.read(KEY, COL1).await, Some(bytes("1")));
}

#[tokio::test]
async fn test_expired_holder_cannot_overwrite_new_holder() {
    let cluster = LockCluster::open(Backend::ConsistentKey, 2).await;
    let (h0, h1) = (cluster.host(0), cluster.host(1));

    let tx0 = h0.begin().await;
    lock_and_write(h0, &tx0, KEY, COL1, "0a", None).await.unwrap();

    cluster.clock.advance(Duration::from_millis(LOCK_EXPIRE_MS + 1));

    let tx1 = h1.begin().await;
    let result = lock_and_write(h1, &tx1, KEY, COL1, "1", None).await;
    finish(&tx1, result).await.unwrap();

    // tx0 verified its claim long ago, but the lease is gone now
    let late = h0
        .store
        .mutate(
            KEY.as_bytes(),
            vec![Entry::new(bytes(COL1), bytes("0b"))],
            vec![],
            &tx0,
        )
        .await;
    assert!(matches!(late, Err(StorageError::LockContention { .. })));
    tx0.rollback().await.unwrap();
    assert_eq!(h1.read(KEY, COL1).await, Some(bytes("1")));
}

#[tokio::test]
async fn test_repeat_locking_does_not_extend_expiration() {
    let cluster = LockCluster::open(Backend::ConsistentKey, 2).await;
    let (h0, h1) = (cluster.host(0), cluster.host(1));

    let tx0 = h0.begin().await;
    h0.store
        .acquire_lock(KEY.as_bytes(), COL1.as_bytes(), None, &tx0)
        .await
        .unwrap();

    // Re-lock halfway through the lease
    cluster.clock.advance(Duration::from_millis(LOCK_EXPIRE_MS / 2));
    h0.store
        .acquire_lock(KEY.as_bytes(), COL1.as_bytes(), None, &tx0)
        .await
        .unwrap();
    cluster.clock.advance(Duration::from_millis(LOCK_EXPIRE_MS / 2));

    // The original lease is over, for colocated and remote transactions alike
    let local = h0.begin().await;
    h0.store
        .acquire_lock(KEY.as_bytes(), COL2.as_bytes(), None, &local)
        .await
        .unwrap();
    let result = h0
        .store
        .acquire_lock(KEY.as_bytes(), COL1.as_bytes(), None, &local)
        .await;
    finish(&local, result).await.unwrap();

    let remote = h1.begin().await;
    let result = lock_and_write(h1, &remote, KEY, COL1, "1", None).await;
    finish(&remote, result).await.unwrap();
    tx0.rollback().await.unwrap();
}

#[tokio::test]
async fn test_claim_write_failures_are_retried() {
    let cluster = LockCluster::open(Backend::ConsistentKey, 2).await;
    let host = cluster.host(0);
    let tx = host.begin().await;

    host.raw.fail_next_operations(2);
    let result = lock_and_write(host, &tx, KEY, COL1, "1", None).await;
    finish(&tx, result).await.unwrap();

    let tx = host.begin().await;
    host.raw.fail_next_operations(3);
    let err = host
        .store
        .acquire_lock(KEY.as_bytes(), COL1.as_bytes(), None, &tx)
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::TemporaryFailure { attempts: 3, .. }));
    assert!(err.is_temporary());
    tx.rollback().await.unwrap();
}

#[tokio::test]
async fn test_cleared_mediators_start_empty() {
    let cluster = LockCluster::open(Backend::ConsistentKey, 1).await;
    let host = cluster.host(0);
    let tx = host.begin().await;
    host.store
        .acquire_lock(KEY.as_bytes(), COL1.as_bytes(), None, &tx)
        .await
        .unwrap();
    assert!(!cluster.mediators.is_empty());

    tx.rollback().await.unwrap();
    cluster.mediators.clear();
    assert!(cluster.mediators.is_empty());
}
