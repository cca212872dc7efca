use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use sluice_core::testutil::{MockBot, MockHitSink, MockProxySource, MockReporter};
use sluice_core::{
    BotOutcome, BotStatus, DataPool, DataPoolDescriptor, GroupProxySource, HitKind, Job,
    JobOptions, NoValidProxyBehaviour, ParallelizerEvent, ParallelizerStatus, ProxyMode,
    ProxyPoolOptions,
};

use crate::common::{drain, ordered_pool, progress_count, proxies};

#[tokio::test]
async fn ban_loop_evasion_three_redispatches_then_to_check() {
    let bot = MockBot::with_status(BotStatus::Ban);
    let sink = MockHitSink::new();
    let job = Job::builder(
        JobOptions {
            proxy_mode: ProxyMode::Off,
            ban_loop_evasion: 3,
            ..JobOptions::default()
        },
        bot.clone(),
    )
    .with_data_pool(DataPool::from_lines(["locked-out"]))
    .with_hit_sink(Arc::new(sink.clone()))
    .build()
    .unwrap();

    job.start().await.unwrap();
    job.completion().await;

    assert_eq!(bot.calls_for("locked-out"), 1 + 3);
    let counts = job.counts();
    assert_eq!((counts.retries, counts.to_check, counts.tested), (3, 1, 1));
    let hits = sink.hits();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].kind, HitKind::ToCheck);
}

#[tokio::test]
async fn wordlist_job_with_skip_and_proxies() {
    let mut wordlist = tempfile::NamedTempFile::new().unwrap();
    for i in 0..30 {
        writeln!(wordlist, "user{i}:pass{i}").unwrap();
    }

    let bot = MockBot::from_fn(|data| {
        let n: u32 = data
            .trim_start_matches("user")
            .split(':')
            .next()
            .and_then(|n| n.parse().ok())
            .unwrap_or_default();
        Ok(if n % 10 == 0 {
            BotOutcome::new(BotStatus::Success).with_capture("balance", n)
        } else {
            BotOutcome::new(BotStatus::Fail)
        })
    })
    .needing_proxies();

    let proxy_pool = ordered_pool(
        ProxyPoolOptions::default(),
        Arc::new(GroupProxySource::new("dc", proxies(4))),
    );
    let sink = MockHitSink::new();
    let job = Job::builder(
        JobOptions {
            bots: 4,
            skip: 5,
            data_pool: DataPoolDescriptor::Wordlist {
                path: wordlist.path().to_path_buf(),
            },
            ..JobOptions::default()
        },
        bot.clone(),
    )
    .with_proxy_pool(Arc::clone(&proxy_pool))
    .with_hit_sink(Arc::new(sink.clone()))
    .build()
    .unwrap();
    let events = job.subscribe();

    job.start().await.unwrap();
    job.completion().await;
    let events = drain(events).await;

    assert_eq!(progress_count(&events), 25);
    assert_eq!(bot.call_count(), 25);
    assert!(bot.proxies_seen().iter().all(Option::is_some));

    let counts = job.counts();
    assert_eq!((counts.hits, counts.fails, counts.tested), (2, 23, 25));
    let mut hit_data: Vec<String> = sink.hits().into_iter().map(|h| h.data).collect();
    hit_data.sort();
    assert_eq!(hit_data, vec!["user10:pass10", "user20:pass20"]);
    assert!(sink.hits().iter().all(|h| h.proxy.is_some()));

    let stats = proxy_pool.stats();
    assert_eq!((stats.total, stats.working, stats.held), (4, 4, 0));
    assert!((job.snapshot().progress - 1.0).abs() < f64::EPSILON);
}

#[tokio::test(start_paused = true)]
async fn live_control_pause_resume_and_bots() {
    let bot = MockBot::with_status(BotStatus::Fail).with_delay(Duration::from_millis(100));
    let reporter = Arc::new(MockReporter::new());
    let job = Job::builder(
        JobOptions {
            proxy_mode: ProxyMode::Off,
            bots: 2,
            ..JobOptions::default()
        },
        bot.clone(),
    )
    .with_data_pool(DataPool::range(0, 60, 1, 0))
    .with_reporter(reporter.clone())
    .build()
    .unwrap();
    let events = job.subscribe();

    job.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;
    job.pause().unwrap();
    assert_eq!(job.status(), ParallelizerStatus::Paused);

    tokio::time::sleep(Duration::from_secs(10)).await;
    let while_paused = bot.call_count();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(bot.call_count(), while_paused);

    job.change_bots(6).unwrap();
    job.resume().unwrap();
    job.completion().await;

    let events = drain(events).await;
    assert_eq!(progress_count(&events), 60);
    assert!(matches!(events.last(), Some(ParallelizerEvent::Completed)));
    assert_eq!(job.counts().fails, 60);
    assert_eq!(job.snapshot().bots, 6);
    for label in ["Started", "Paused", "BotsChanged", "Resumed", "Completed"] {
        assert_eq!(reporter.count(label), 1, "{label}");
    }
}

#[tokio::test]
async fn reload_mode_keeps_records_flowing_after_max_uses() {
    let source = MockProxySource::new(proxies(5));
    let proxy_pool = ordered_pool(
        ProxyPoolOptions {
            max_uses_per_proxy: 1,
            no_valid_proxy_behaviour: NoValidProxyBehaviour::Reload,
            ..ProxyPoolOptions::default()
        },
        Arc::new(source.clone()),
    );
    let bot = MockBot::with_status(BotStatus::Fail).needing_proxies();
    let job = Job::builder(
        JobOptions {
            bots: 2,
            ..JobOptions::default()
        },
        bot.clone(),
    )
    .with_data_pool(DataPool::range(0, 12, 1, 0))
    .with_proxy_pool(Arc::clone(&proxy_pool))
    .build()
    .unwrap();

    job.start().await.unwrap();
    tokio::time::timeout(Duration::from_secs(10), job.completion())
        .await
        .unwrap();

    let counts = job.counts();
    assert_eq!((counts.fails, counts.to_check), (12, 0));
    assert_eq!(bot.call_count(), 12);
    // 12 single-use checks over 5 proxies need at least three loads.
    assert!(source.fetch_count() >= 3);
}

#[tokio::test(start_paused = true)]
async fn abort_with_proxies_leaves_pool_unbanned() {
    let proxy_pool = ordered_pool(
        ProxyPoolOptions::default(),
        Arc::new(GroupProxySource::new("dc", proxies(4))),
    );
    let sink = MockHitSink::new();
    let job = Job::builder(
        JobOptions {
            bots: 4,
            mark_as_to_check_on_abort: true,
            ..JobOptions::default()
        },
        MockBot::with_status(BotStatus::Success)
            .with_delay(Duration::from_secs(10))
            .needing_proxies(),
    )
    .with_data_pool(DataPool::range(0, 40, 1, 0))
    .with_proxy_pool(Arc::clone(&proxy_pool))
    .with_hit_sink(Arc::new(sink.clone()))
    .build()
    .unwrap();

    job.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    job.abort().await.unwrap();

    let counts = job.counts();
    assert_eq!((counts.to_check, counts.bans, counts.errors), (4, 0, 0));
    assert!(sink.hits().iter().all(|h| h.kind == HitKind::ToCheck));

    let stats = proxy_pool.stats();
    assert_eq!((stats.banned, stats.held), (0, 0));
    for proxy in proxies(4) {
        assert_eq!(
            proxy_pool.proxy_state(&proxy).map(|(_, uses)| uses),
            Some(0)
        );
    }
}
