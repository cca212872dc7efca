use std::sync::Arc;

use sluice_core::{
    Parallelizer, ParallelizerEvent, Proxy, ProxyPool, ProxyPoolOptions, ProxySource, ProxyType,
};
use tokio::sync::mpsc::UnboundedReceiver;

pub fn proxies(n: u16) -> Vec<Proxy> {
    (0..n)
        .map(|i| Proxy::new(ProxyType::Http, "192.0.2.10", 3128 + i))
        .collect()
}

/// A pool that keeps load order, so rotation is predictable.
pub fn ordered_pool(options: ProxyPoolOptions, source: Arc<dyn ProxySource>) -> Arc<ProxyPool> {
    Arc::new(ProxyPool::new(
        ProxyPoolOptions {
            shuffle_on_load: false,
            ..options
        },
        vec![source],
    ))
}

/// Drain a subscription until the scheduler closes it after `Completed`.
pub async fn drain<T, O>(mut rx: UnboundedReceiver<ParallelizerEvent<T, O>>) -> Vec<ParallelizerEvent<T, O>> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

pub fn progress_count<T, O>(events: &[ParallelizerEvent<T, O>]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, ParallelizerEvent::Progress { .. }))
        .count()
}

pub fn completed_count<T, O>(events: &[ParallelizerEvent<T, O>]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, ParallelizerEvent::Completed))
        .count()
}

/// Parallelizer over `n` records where each check sleeps `millis`.
pub fn uniform_workload(n: u64, dop: usize, millis: u64) -> Parallelizer<u64, u64> {
    Parallelizer::new(0..n, n, 0, dop, move |i, ctx| async move {
        tokio::select! {
            () = tokio::time::sleep(std::time::Duration::from_millis(millis)) => Ok(i),
            () = ctx.cancel_token().cancelled() => Err(sluice_core::AppError::Cancelled),
        }
    })
    .unwrap()
}
