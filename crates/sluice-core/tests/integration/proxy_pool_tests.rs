use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sluice_core::testutil::MockProxySource;
use sluice_core::{
    AppError, BotStatus, GroupProxySource, NoValidProxyBehaviour, ProxyPoolOptions, WorkingStatus,
};
use tokio_util::sync::CancellationToken;

use crate::common::{ordered_pool, proxies};

#[tokio::test]
async fn max_uses_one_with_reload_refetches_on_sixth_checkout() {
    let source = MockProxySource::new(proxies(5));
    let pool = ordered_pool(
        ProxyPoolOptions {
            max_uses_per_proxy: 1,
            no_valid_proxy_behaviour: NoValidProxyBehaviour::Reload,
            ..ProxyPoolOptions::default()
        },
        Arc::new(source.clone()),
    );
    pool.reload().await.unwrap();
    let cancel = CancellationToken::new();

    for _ in 0..5 {
        let lease = pool.checkout(&cancel).await.unwrap();
        lease.checkin(&BotStatus::Success);
    }
    let stats = pool.stats();
    assert_eq!((stats.total, stats.banned), (5, 5));
    assert_eq!(pool.reload_count(), 1);

    let sixth = pool.checkout(&cancel).await.unwrap();
    assert_eq!(pool.reload_count(), 2);
    assert_eq!(source.fetch_count(), 2);
    assert_eq!(
        pool.proxy_state(sixth.proxy()).map(|(status, _)| status),
        Some(WorkingStatus::Working)
    );
}

#[tokio::test]
async fn do_nothing_surfaces_exhaustion() {
    let pool = ordered_pool(
        ProxyPoolOptions {
            no_valid_proxy_behaviour: NoValidProxyBehaviour::DoNothing,
            ..ProxyPoolOptions::default()
        },
        Arc::new(GroupProxySource::new("one", proxies(1))),
    );
    pool.reload().await.unwrap();
    let cancel = CancellationToken::new();

    pool.checkout(&cancel).await.unwrap().checkin(&BotStatus::Error);
    assert!(matches!(
        pool.checkout(&cancel).await,
        Err(AppError::NoProxyAvailable)
    ));
}

#[tokio::test(start_paused = true)]
async fn periodic_reload_runs_when_interval_elapses() {
    let source = MockProxySource::new(proxies(2));
    let pool = ordered_pool(
        ProxyPoolOptions {
            periodic_reload_interval_secs: 60,
            ..ProxyPoolOptions::default()
        },
        Arc::new(source.clone()),
    );
    let cancel = CancellationToken::new();

    drop(pool.checkout(&cancel).await.unwrap());
    assert_eq!(source.fetch_count(), 1);

    tokio::time::sleep(Duration::from_secs(30)).await;
    drop(pool.checkout(&cancel).await.unwrap());
    assert_eq!(source.fetch_count(), 1);

    tokio::time::sleep(Duration::from_secs(31)).await;
    drop(pool.checkout(&cancel).await.unwrap());
    assert_eq!(source.fetch_count(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exclusive_mode_never_lends_a_proxy_twice() {
    let pool = ordered_pool(
        ProxyPoolOptions::default(),
        Arc::new(GroupProxySource::new("three", proxies(3))),
    );
    pool.reload().await.unwrap();

    let holders: Arc<Mutex<HashMap<u16, usize>>> = Arc::default();
    let violations = Arc::new(Mutex::new(0usize));
    let mut tasks = Vec::new();
    for _ in 0..30 {
        let pool = Arc::clone(&pool);
        let holders = Arc::clone(&holders);
        let violations = Arc::clone(&violations);
        tasks.push(tokio::spawn(async move {
            let cancel = CancellationToken::new();
            let lease = pool.checkout(&cancel).await.unwrap();
            let port = lease.proxy().port;
            {
                let mut holders = holders.lock().unwrap();
                let count = holders.entry(port).or_default();
                *count += 1;
                if *count > 1 {
                    *violations.lock().unwrap() += 1;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            *holders.lock().unwrap().get_mut(&port).unwrap() -= 1;
            lease.checkin(&BotStatus::Success);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(*violations.lock().unwrap(), 0);
    let stats = pool.stats();
    assert_eq!((stats.working, stats.held), (3, 0));
}
