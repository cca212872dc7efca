use std::time::Duration;

use sluice_core::{Parallelizer, ParallelizerEvent, ParallelizerStatus};

use crate::common::{completed_count, drain, progress_count, uniform_workload};

#[tokio::test]
async fn progress_matches_dispatched_records_and_ends_with_completed() {
    let p = Parallelizer::new(0..100u64, 100, 25, 8, |n, _ctx| async move { Ok(n * 2) }).unwrap();
    let rx = p.subscribe();
    p.start().unwrap();
    let events = drain(rx).await;

    assert_eq!(progress_count(&events), 75);
    assert_eq!(completed_count(&events), 1);
    assert!(matches!(events.last(), Some(ParallelizerEvent::Completed)));

    let final_fraction = events
        .iter()
        .rev()
        .find_map(|e| match e {
            ParallelizerEvent::Progress { fraction, .. } => Some(*fraction),
            _ => None,
        })
        .unwrap();
    assert!((final_fraction - 1.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn parity_scenario() {
    let p = Parallelizer::new(0..100u64, 100, 0, 1, |n, _ctx| async move {
        Ok(if n % 2 == 0 { "even".to_string() } else { "odd".to_string() })
    })
    .unwrap();
    let rx = p.subscribe();
    p.start().unwrap();
    let events = drain(rx).await;

    assert_eq!(progress_count(&events), 100);
    assert_eq!(completed_count(&events), 1);
    let errors = events
        .iter()
        .filter(|e| matches!(e, ParallelizerEvent::Error { .. }))
        .count();
    assert_eq!(errors, 0);

    let last = events
        .iter()
        .filter_map(|e| match e {
            ParallelizerEvent::Result { input, output, .. } => Some((*input, output.clone())),
            _ => None,
        })
        .last()
        .unwrap();
    assert_eq!(last, (99, "odd".to_string()));
}

#[tokio::test(start_paused = true)]
async fn stop_after_250ms_drains_in_flight() {
    let p = uniform_workload(1000, 10, 100);
    let rx = p.subscribe();
    p.start().unwrap();

    tokio::time::sleep(Duration::from_millis(250)).await;
    p.stop().await.unwrap();
    let processed_at_completion = p.processed();
    let events = drain(rx).await;

    let progress = progress_count(&events);
    assert!((10..=50).contains(&progress), "progress = {progress}");
    assert_eq!(progress as u64, processed_at_completion);
    assert_eq!(completed_count(&events), 1);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(p.processed(), processed_at_completion);
}

#[tokio::test(start_paused = true)]
async fn elapsed_across_pause_equals_elapsed_before_pause() {
    let p = uniform_workload(500, 4, 100);
    p.start().unwrap();

    tokio::time::sleep(Duration::from_millis(350)).await;
    let before = p.elapsed();
    p.pause().unwrap();
    let at_pause = p.elapsed();
    assert!(at_pause >= before);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(p.elapsed(), at_pause);

    p.resume().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let after = p.elapsed();
    assert!(after >= at_pause + Duration::from_millis(100));
    assert!(after < at_pause + Duration::from_secs(1));

    p.abort().await.unwrap();
    let frozen = p.elapsed();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(p.elapsed(), frozen);
}

async fn run_to_completion(p: &Parallelizer<u64, u64>) -> Duration {
    p.completion().await;
    p.elapsed()
}

#[tokio::test(start_paused = true)]
async fn raising_parallelism_never_slows_the_run() {
    let baseline = uniform_workload(40, 2, 100);
    baseline.start().unwrap();
    let baseline = run_to_completion(&baseline).await;

    let raised = uniform_workload(40, 2, 100);
    raised.start().unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    raised.change_degree_of_parallelism(8).unwrap();
    let raised = run_to_completion(&raised).await;

    assert!(raised <= baseline, "{raised:?} > {baseline:?}");
    assert!(raised < baseline);
}

#[tokio::test(start_paused = true)]
async fn lowering_parallelism_never_speeds_the_run() {
    let baseline = uniform_workload(40, 8, 100);
    baseline.start().unwrap();
    let baseline = run_to_completion(&baseline).await;

    let lowered = uniform_workload(40, 8, 100);
    lowered.start().unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    lowered.change_degree_of_parallelism(2).unwrap();
    assert_eq!(lowered.degree_of_parallelism(), 2);
    let lowered = run_to_completion(&lowered).await;

    assert!(lowered > baseline, "{lowered:?} <= {baseline:?}");
}

#[tokio::test(start_paused = true)]
async fn abort_fires_exactly_one_completed_and_cuts_progress() {
    let full = uniform_workload(100, 5, 100);
    let rx = full.subscribe();
    full.start().unwrap();
    let full_progress = progress_count(&drain(rx).await);

    let aborted = uniform_workload(100, 5, 100);
    let rx = aborted.subscribe();
    aborted.start().unwrap();
    tokio::time::sleep(Duration::from_millis(450)).await;
    aborted.abort().await.unwrap();
    let events = drain(rx).await;

    assert_eq!(completed_count(&events), 1);
    assert!(progress_count(&events) <= full_progress);
    assert!(progress_count(&events) < 100);
    assert_eq!(aborted.status(), ParallelizerStatus::Completed);
    assert_eq!(aborted.in_flight(), 0);
}
