//! Concurrent work scheduler with a live-adjustable degree of parallelism.
//!
//! A single dispatcher task pulls records from the lazy input sequence and
//! spawns one invocation of the work function per record, keeping at most
//! `degree_of_parallelism` invocations in flight. The bound is a slot
//! counter re-read before every dispatch, so it can change while running.
//!
//! # States
//!
//! ```text
//! IDLE --start--> STARTING --> RUNNING --pause--> PAUSING --> PAUSED
//!                                 ^                             |
//!                                 +------ RESUMING <--resume----+
//!
//! RUNNING | PAUSED --stop--> STOPPING --[in-flight drained]--> COMPLETED
//! any non-terminal --abort--> STOPPING (cancel signalled) --> COMPLETED
//! ```

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::{Notify, mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;

/// Lifecycle state of a [`Parallelizer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ParallelizerStatus {
    Idle,
    Starting,
    Running,
    Pausing,
    Paused,
    Stopping,
    Resuming,
    Completed,
}

impl ParallelizerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParallelizerStatus::Idle => "idle",
            ParallelizerStatus::Starting => "starting",
            ParallelizerStatus::Running => "running",
            ParallelizerStatus::Pausing => "pausing",
            ParallelizerStatus::Paused => "paused",
            ParallelizerStatus::Stopping => "stopping",
            ParallelizerStatus::Resuming => "resuming",
            ParallelizerStatus::Completed => "completed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ParallelizerStatus::Completed)
    }
}

impl fmt::Display for ParallelizerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Notifications delivered to every subscriber.
///
/// For one record, `Progress` is delivered before its `Result` or `Error`.
/// No ordering holds across records. `Completed` is delivered exactly once
/// and is the last event on every channel.
#[derive(Debug, Clone)]
pub enum ParallelizerEvent<T, O> {
    Progress { processed: u64, fraction: f64 },
    Result { index: u64, input: T, output: O },
    Error { index: u64, input: T, error: String },
    Completed,
}

/// Elapsed-time accumulator that freezes while stopped.
#[derive(Debug, Default, Clone, Copy)]
struct Stopwatch {
    accumulated: Duration,
    started_at: Option<Instant>,
}

impl Stopwatch {
    fn start(&mut self) {
        if self.started_at.is_none() {
            self.started_at = Some(Instant::now());
        }
    }

    fn stop(&mut self) {
        if let Some(started_at) = self.started_at.take() {
            self.accumulated += started_at.elapsed();
        }
    }

    fn elapsed(&self) -> Duration {
        self.accumulated + self.started_at.map_or(Duration::ZERO, |t| t.elapsed())
    }
}

/// Per-invocation handle given to the work function.
pub struct WorkContext {
    index: u64,
    cancel: CancellationToken,
    status: watch::Receiver<ParallelizerStatus>,
}

impl WorkContext {
    /// Position of the record in the input sequence (skipped records included).
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Cancelled when the run is aborted.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn status(&self) -> ParallelizerStatus {
        *self.status.borrow()
    }

    /// Suspends while the run is paused, so work that re-enters the
    /// dispatch path (retries) honours pause like fresh records do.
    pub async fn wait_while_paused(&mut self) -> Result<(), AppError> {
        let cancel = self.cancel.clone();
        tokio::select! {
            resumed = self.status.wait_for(|s| {
                !matches!(s, ParallelizerStatus::Pausing | ParallelizerStatus::Paused)
            }) => resumed.map(|_| ()).map_err(|_| AppError::Cancelled),
            () = cancel.cancelled() => Err(AppError::Cancelled),
        }
    }

    /// Resolves once a graceful stop or an abort has been requested.
    pub async fn stop_requested(&mut self) {
        let _ = self
            .status
            .wait_for(|s| {
                matches!(
                    s,
                    ParallelizerStatus::Stopping | ParallelizerStatus::Completed
                )
            })
            .await;
    }
}

type WorkFn<T, O> =
    Arc<dyn Fn(T, WorkContext) -> BoxFuture<'static, Result<O, AppError>> + Send + Sync>;

type Source<T> = Box<dyn Iterator<Item = T> + Send>;

struct Control<T> {
    degree_of_parallelism: usize,
    in_flight: usize,
    processed: u64,
    errors: u64,
    stopwatch: Stopwatch,
    source: Option<Source<T>>,
}

struct Shared<T, O> {
    total_amount: u64,
    skip: u64,
    control: Mutex<Control<T>>,
    status: watch::Sender<ParallelizerStatus>,
    /// Wakes the dispatcher; it is the only waiter.
    wakeup: Notify,
    cancel: CancellationToken,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ParallelizerEvent<T, O>>>>,
    work: WorkFn<T, O>,
}

/// Drives a lazy record sequence through an async work function.
///
/// Cheap to clone; clones control the same run.
pub struct Parallelizer<T, O> {
    shared: Arc<Shared<T, O>>,
}

impl<T, O> Clone for Parallelizer<T, O> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T, O> Parallelizer<T, O>
where
    T: Clone + Send + 'static,
    O: Clone + Send + 'static,
{
    /// Create an idle run.
    ///
    /// `total_amount` is the progress denominator and may exceed the number
    /// of records actually produced. The first `skip` records are discarded
    /// before dispatch begins.
    pub fn new<I, F, Fut>(
        items: I,
        total_amount: u64,
        skip: u64,
        degree_of_parallelism: usize,
        work: F,
    ) -> Result<Self, AppError>
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
        F: Fn(T, WorkContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, AppError>> + Send + 'static,
    {
        if degree_of_parallelism == 0 {
            return Err(AppError::ConfigError(
                "degree of parallelism must be at least 1".into(),
            ));
        }

        let work: WorkFn<T, O> =
            Arc::new(move |item: T, context: WorkContext| work(item, context).boxed());
        let (status, _) = watch::channel(ParallelizerStatus::Idle);

        Ok(Self {
            shared: Arc::new(Shared {
                total_amount,
                skip,
                control: Mutex::new(Control {
                    degree_of_parallelism,
                    in_flight: 0,
                    processed: 0,
                    errors: 0,
                    stopwatch: Stopwatch::default(),
                    source: Some(Box::new(items.into_iter())),
                }),
                status,
                wakeup: Notify::new(),
                cancel: CancellationToken::new(),
                subscribers: Mutex::new(Vec::new()),
                work,
            }),
        })
    }

    /// Subscribe to run notifications. The channel closes after `Completed`.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ParallelizerEvent<T, O>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self.shared.lock_subscribers();
        if !self.status().is_terminal() {
            subscribers.push(tx);
        }
        rx
    }

    /// Begin dispatching. Must be called from within a Tokio runtime.
    pub fn start(&self) -> Result<(), AppError> {
        let source = {
            let mut control = self.shared.lock_control();
            self.shared.transition(
                "start",
                &[ParallelizerStatus::Idle],
                ParallelizerStatus::Starting,
            )?;
            control.stopwatch.start();
            self.shared.status.send_replace(ParallelizerStatus::Running);
            control.source.take()
        };

        let source = source.unwrap_or_else(|| Box::new(std::iter::empty()));
        tokio::spawn(dispatch(Arc::clone(&self.shared), source));
        tracing::debug!(
            total = self.shared.total_amount,
            skip = self.shared.skip,
            "Parallelizer started"
        );
        Ok(())
    }

    /// Stop dispatching new records; in-flight work keeps running.
    pub fn pause(&self) -> Result<(), AppError> {
        let mut control = self.shared.lock_control();
        self.shared.transition(
            "pause",
            &[ParallelizerStatus::Running],
            ParallelizerStatus::Pausing,
        )?;
        control.stopwatch.stop();
        self.shared.status.send_replace(ParallelizerStatus::Paused);
        Ok(())
    }

    pub fn resume(&self) -> Result<(), AppError> {
        {
            let mut control = self.shared.lock_control();
            self.shared.transition(
                "resume",
                &[ParallelizerStatus::Paused],
                ParallelizerStatus::Resuming,
            )?;
            control.stopwatch.start();
            self.shared.status.send_replace(ParallelizerStatus::Running);
        }
        self.shared.wakeup.notify_one();
        Ok(())
    }

    /// Request a graceful stop without waiting for in-flight work to drain.
    pub fn request_stop(&self) -> Result<(), AppError> {
        {
            let _control = self.shared.lock_control();
            self.shared.transition(
                "stop",
                &[ParallelizerStatus::Running, ParallelizerStatus::Paused],
                ParallelizerStatus::Stopping,
            )?;
        }
        self.shared.wakeup.notify_one();
        Ok(())
    }

    /// Graceful stop: no further dispatch, wait for in-flight work to finish.
    pub async fn stop(&self) -> Result<(), AppError> {
        self.request_stop()?;
        self.completion().await;
        Ok(())
    }

    /// Signal cancellation to in-flight work and wait for it to return.
    pub async fn abort(&self) -> Result<(), AppError> {
        let was_idle = {
            let mut control = self.shared.lock_control();
            let previous = self.shared.transition(
                "abort",
                &[
                    ParallelizerStatus::Idle,
                    ParallelizerStatus::Starting,
                    ParallelizerStatus::Running,
                    ParallelizerStatus::Pausing,
                    ParallelizerStatus::Paused,
                    ParallelizerStatus::Resuming,
                    ParallelizerStatus::Stopping,
                ],
                ParallelizerStatus::Stopping,
            )?;
            if previous == ParallelizerStatus::Idle {
                control.source = None;
                self.shared.finish(&mut control);
                true
            } else {
                false
            }
        };

        self.shared.cancel.cancel();
        if !was_idle {
            self.shared.wakeup.notify_one();
            self.completion().await;
        }
        Ok(())
    }

    /// Change the in-flight bound without restarting. A lower bound is
    /// reached as running invocations finish and are not replaced.
    pub fn change_degree_of_parallelism(&self, degree: usize) -> Result<(), AppError> {
        if degree == 0 {
            return Err(AppError::ConfigError(
                "degree of parallelism must be at least 1".into(),
            ));
        }

        let previous = {
            let mut control = self.shared.lock_control();
            let state = self.status();
            if state.is_terminal() {
                return Err(AppError::InvalidState {
                    operation: "change the degree of parallelism",
                    state,
                });
            }
            std::mem::replace(&mut control.degree_of_parallelism, degree)
        };

        self.shared.wakeup.notify_one();
        tracing::info!(from = previous, to = degree, "Degree of parallelism changed");
        Ok(())
    }

    /// Wait until the run completes or `signal` is cancelled.
    pub async fn wait_completion(&self, signal: &CancellationToken) -> Result<(), AppError> {
        tokio::select! {
            () = self.completion() => Ok(()),
            () = signal.cancelled() => Err(AppError::Cancelled),
        }
    }

    /// Wait until the run completes.
    pub async fn completion(&self) {
        let mut status = self.shared.status.subscribe();
        let _ = status.wait_for(|s| s.is_terminal()).await;
    }

    pub fn status(&self) -> ParallelizerStatus {
        *self.shared.status.borrow()
    }

    pub fn degree_of_parallelism(&self) -> usize {
        self.shared.lock_control().degree_of_parallelism
    }

    pub fn in_flight(&self) -> usize {
        self.shared.lock_control().in_flight
    }

    /// Records finished in this run, successfully or not.
    pub fn processed(&self) -> u64 {
        self.shared.lock_control().processed
    }

    pub fn errors(&self) -> u64 {
        self.shared.lock_control().errors
    }

    pub fn total_amount(&self) -> u64 {
        self.shared.total_amount
    }

    /// Fraction done, counting skipped records as done.
    pub fn progress(&self) -> f64 {
        self.shared.fraction(self.processed())
    }

    /// Running time, frozen while paused.
    pub fn elapsed(&self) -> Duration {
        self.shared.lock_control().stopwatch.elapsed()
    }

    /// Linear estimate of the time left; `None` until something finished.
    pub fn remaining(&self) -> Option<Duration> {
        let (processed, elapsed) = {
            let control = self.shared.lock_control();
            (control.processed, control.stopwatch.elapsed())
        };
        if processed == 0 || self.shared.total_amount == 0 {
            return None;
        }
        let left = self
            .shared
            .total_amount
            .saturating_sub(self.shared.skip + processed);
        Some(elapsed.mul_f64(left as f64 / processed as f64))
    }

    /// Records finished per minute of running time.
    pub fn per_minute(&self) -> u64 {
        let (processed, elapsed) = {
            let control = self.shared.lock_control();
            (control.processed, control.stopwatch.elapsed())
        };
        if elapsed.is_zero() {
            return 0;
        }
        (processed as f64 * 60.0 / elapsed.as_secs_f64()) as u64
    }
}

impl<T, O> Shared<T, O>
where
    T: Clone + Send + 'static,
    O: Clone + Send + 'static,
{
    /// Acquires the control lock, recovering from poison if necessary.
    fn lock_control(&self) -> MutexGuard<'_, Control<T>> {
        self.control.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned parallelizer mutex");
            poisoned.into_inner()
        })
    }

    fn lock_subscribers(&self) -> MutexGuard<'_, Vec<mpsc::UnboundedSender<ParallelizerEvent<T, O>>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Moves to `to` if the current state is in `allowed`, returning the
    /// previous state. Callers hold the control lock so transitions serialize.
    fn transition(
        &self,
        operation: &'static str,
        allowed: &[ParallelizerStatus],
        to: ParallelizerStatus,
    ) -> Result<ParallelizerStatus, AppError> {
        let mut outcome = Ok(to);
        self.status.send_if_modified(|current| {
            if allowed.contains(current) {
                outcome = Ok(*current);
                *current = to;
                true
            } else {
                outcome = Err(AppError::InvalidState {
                    operation,
                    state: *current,
                });
                false
            }
        });
        if let Ok(from) = outcome {
            tracing::debug!(%from, %to, "Parallelizer transition");
        }
        outcome
    }

    fn fraction(&self, processed: u64) -> f64 {
        if self.total_amount == 0 {
            return 0.0;
        }
        ((self.skip + processed) as f64 / self.total_amount as f64).min(1.0)
    }

    fn emit(&self, event: ParallelizerEvent<T, O>) {
        self.lock_subscribers()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Freeze the clock, deliver `Completed`, close every channel and
    /// publish the terminal state, in that order.
    fn finish(&self, control: &mut Control<T>) {
        control.stopwatch.stop();
        let mut subscribers = self.lock_subscribers();
        for tx in subscribers.iter() {
            let _ = tx.send(ParallelizerEvent::Completed);
        }
        subscribers.clear();
        self.status.send_replace(ParallelizerStatus::Completed);
        tracing::debug!(
            processed = control.processed,
            errors = control.errors,
            "Parallelizer completed"
        );
    }

    /// Reserve a worker slot. Returns false once no further dispatch may happen.
    async fn acquire_slot(&self) -> bool {
        loop {
            let notified = self.wakeup.notified();
            {
                let mut control = self.lock_control();
                match *self.status.borrow() {
                    ParallelizerStatus::Stopping | ParallelizerStatus::Completed => return false,
                    ParallelizerStatus::Running
                        if control.in_flight < control.degree_of_parallelism =>
                    {
                        control.in_flight += 1;
                        return true;
                    }
                    _ => {}
                }
            }
            notified.await;
        }
    }

    fn release_slot(&self) {
        let mut control = self.lock_control();
        control.in_flight = control.in_flight.saturating_sub(1);
    }

    async fn drained(&self) {
        loop {
            let notified = self.wakeup.notified();
            if self.lock_control().in_flight == 0 {
                return;
            }
            notified.await;
        }
    }
}

async fn dispatch<T, O>(shared: Arc<Shared<T, O>>, mut source: Source<T>)
where
    T: Clone + Send + 'static,
    O: Clone + Send + 'static,
{
    let skip = usize::try_from(shared.skip).unwrap_or(usize::MAX);
    let skipped = source.by_ref().take(skip).count() as u64;
    if skipped < shared.skip {
        tracing::debug!(skipped, skip = shared.skip, "Sequence shorter than skip");
    }

    let mut index = shared.skip;
    while shared.acquire_slot().await {
        let Some(item) = source.next() else {
            shared.release_slot();
            break;
        };
        tokio::spawn(run_item(Arc::clone(&shared), index, item));
        index += 1;
    }
    drop(source);

    shared.drained().await;
    let mut control = shared.lock_control();
    shared.finish(&mut control);
}

async fn run_item<T, O>(shared: Arc<Shared<T, O>>, index: u64, item: T)
where
    T: Clone + Send + 'static,
    O: Clone + Send + 'static,
{
    let context = WorkContext {
        index,
        cancel: shared.cancel.child_token(),
        status: shared.status.subscribe(),
    };
    let input = item.clone();
    let outcome = AssertUnwindSafe((shared.work)(item, context))
        .catch_unwind()
        .await;

    let processed = {
        let mut control = shared.lock_control();
        control.processed += 1;
        if !matches!(outcome, Ok(Ok(_))) {
            control.errors += 1;
        }
        control.processed
    };

    shared.emit(ParallelizerEvent::Progress {
        processed,
        fraction: shared.fraction(processed),
    });

    match outcome {
        Ok(Ok(output)) => shared.emit(ParallelizerEvent::Result {
            index,
            input,
            output,
        }),
        Ok(Err(error)) => {
            tracing::warn!(index, error = %error, "Work item failed");
            shared.emit(ParallelizerEvent::Error {
                index,
                input,
                error: error.to_string(),
            });
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            tracing::error!(index, %message, "Work item panicked");
            shared.emit(ParallelizerEvent::Error {
                index,
                input,
                error: format!("work function panicked: {message}"),
            });
        }
    }

    shared.release_slot();
    shared.wakeup.notify_one();
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
