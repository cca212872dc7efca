//! Job orchestration.
//!
//! A [`Job`] binds a data pool, an optional proxy pool and a [`Bot`] to a
//! [`Parallelizer`]. For every record it borrows a proxy, runs the bot,
//! checks the proxy back in with the observed status (the pool applies its
//! ban policy), then classifies the status with the [`OutcomePolicy`]: hits
//! go to every hit sink, retryable outcomes are checked again up to the
//! `ban_loop_evasion` cap, and anything that cannot be classified with
//! confidence ends up as a `ToCheck` hit.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{JobOptions, ProxyMode};
use crate::data_pool::DataPool;
use crate::error::AppError;
use crate::models::{BotOutcome, BotStatus, Hit, HitKind};
use crate::policy::{OutcomePolicy, Resolution, Verdict};
use crate::proxy_pool::{NoValidProxyBehaviour, ProxyLease, ProxyPool, ProxyPoolStats};
use crate::reporter::{JobEvent, JobReporter, TracingJobReporter};
use crate::scheduler::{Parallelizer, ParallelizerEvent, ParallelizerStatus, WorkContext};
use crate::traits::{Bot, HitSink};

/// Final verdict for one record, delivered as the scheduler's result payload.
#[derive(Debug, Clone, Serialize)]
pub struct RecordOutcome {
    pub index: u64,
    pub data: String,
    /// Last status the bot returned, if it ran at all.
    pub status: Option<BotStatus>,
    pub resolution: Resolution,
    pub captured: serde_json::Map<String, serde_json::Value>,
    /// Proxy used for the last check, credentials hidden.
    pub proxy: Option<String>,
    pub retries: u32,
}

impl RecordOutcome {
    fn new(index: u64, data: String, resolution: Resolution, retries: u32) -> Self {
        Self {
            index,
            data,
            status: None,
            resolution,
            captured: serde_json::Map::new(),
            proxy: None,
            retries,
        }
    }

    /// Hit category to store, if any.
    pub fn hit_kind(&self) -> Option<HitKind> {
        match (self.resolution, &self.status) {
            (Resolution::Success, _) => Some(HitKind::Success),
            (Resolution::Custom, Some(status)) => Some(HitKind::Custom(status.to_string())),
            (Resolution::ToCheck, _) => Some(HitKind::ToCheck),
            _ => None,
        }
    }
}

/// Live per-category counters.
#[derive(Debug, Default)]
struct JobCounters {
    tested: AtomicU64,
    hits: AtomicU64,
    custom: AtomicU64,
    fails: AtomicU64,
    to_check: AtomicU64,
    retries: AtomicU64,
    bans: AtomicU64,
    errors: AtomicU64,
    proxy_waits: AtomicU64,
}

impl JobCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> JobCounts {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        JobCounts {
            tested: load(&self.tested),
            hits: load(&self.hits),
            custom: load(&self.custom),
            fails: load(&self.fails),
            to_check: load(&self.to_check),
            retries: load(&self.retries),
            bans: load(&self.bans),
            errors: load(&self.errors),
            proxy_waits: load(&self.proxy_waits),
        }
    }
}

/// Point-in-time copy of the job counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    /// Records that reached a terminal resolution other than `Abandoned`.
    pub tested: u64,
    pub hits: u64,
    pub custom: u64,
    pub fails: u64,
    pub to_check: u64,
    /// Re-checks performed after a retryable status.
    pub retries: u64,
    /// Proxies banned by check-ins from this job.
    pub bans: u64,
    /// Records whose bot invocation raised an error.
    pub errors: u64,
    /// Times a record found no proxy to borrow.
    pub proxy_waits: u64,
}

/// Read-only status view for control layers.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub id: Uuid,
    pub name: String,
    pub status: ParallelizerStatus,
    pub progress: f64,
    pub processed: u64,
    pub total: u64,
    pub elapsed_secs: f64,
    pub remaining_secs: Option<f64>,
    pub cpm: u64,
    pub bots: usize,
    pub in_flight: usize,
    pub counts: JobCounts,
    pub proxies: Option<ProxyPoolStats>,
}

impl fmt::Display for JobSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {:.1}% ({}/{}) | hits {} custom {} fails {} tocheck {} errors {} | retries {} | {} cpm | bots {}",
            self.status,
            self.progress * 100.0,
            self.processed,
            self.total,
            self.counts.hits,
            self.counts.custom,
            self.counts.fails,
            self.counts.to_check,
            self.counts.errors,
            self.counts.retries,
            self.cpm,
            self.bots,
        )?;
        if let Some(proxies) = &self.proxies {
            write!(
                f,
                " | proxies {}/{} banned {}",
                proxies.working + proxies.untested,
                proxies.total,
                proxies.banned
            )?;
        }
        Ok(())
    }
}

/// Receiver for scheduler notifications carrying [`RecordOutcome`]s.
pub type JobEventReceiver = mpsc::UnboundedReceiver<ParallelizerEvent<String, RecordOutcome>>;

/// Why a record stopped waiting for a proxy.
enum Interruption {
    /// The pool had nothing to lend and its policy does not wait.
    Exhausted,
    Stopped,
    Aborted,
}

/// Per-record pipeline shared by every in-flight check.
struct Engine<B> {
    id: Uuid,
    options: JobOptions,
    policy: OutcomePolicy,
    bot: B,
    proxy_pool: Option<Arc<ProxyPool>>,
    sinks: Vec<Arc<dyn HitSink>>,
    reporter: Arc<dyn JobReporter>,
    counters: JobCounters,
}

impl<B: Bot> Engine<B> {
    async fn process(&self, data: String, mut ctx: WorkContext) -> Result<RecordOutcome, AppError> {
        let index = ctx.index();
        let cancel = ctx.cancel_token().clone();
        let mut retries = 0;

        loop {
            let lease = match &self.proxy_pool {
                Some(pool) => match self.acquire_proxy(pool, index, &mut ctx).await {
                    Ok(lease) => Some(lease),
                    Err(interruption) => {
                        let resolution = match interruption {
                            Interruption::Exhausted | Interruption::Stopped => Resolution::ToCheck,
                            Interruption::Aborted => self.abort_resolution(),
                        };
                        let outcome = RecordOutcome::new(index, data, resolution, retries);
                        return Ok(self.finish(outcome).await);
                    }
                },
                None => None,
            };
            let proxy_label = lease.as_ref().map(|l| l.proxy().to_string());

            let checked = self
                .bot
                .check(&data, lease.as_ref().map(ProxyLease::proxy), cancel.clone())
                .await;

            let BotOutcome { status, captured } = match checked {
                Ok(outcome) => outcome,
                Err(error) => {
                    if cancel.is_cancelled() {
                        // The proxy saw no outcome; dropping the lease only releases it.
                        drop(lease);
                        let outcome =
                            RecordOutcome::new(index, data, self.abort_resolution(), retries);
                        return Ok(self.finish(outcome).await);
                    }
                    if let Some(lease) = lease {
                        self.checkin(lease, index, &BotStatus::Error);
                    }
                    JobCounters::bump(&self.counters.errors);
                    self.reporter.report(JobEvent::RecordErrored {
                        index,
                        error: &error.to_string(),
                    });
                    return Err(error);
                }
            };
            if let Some(lease) = lease {
                self.checkin(lease, index, &status);
            }

            let resolution = match self.policy.classify(&status) {
                Verdict::Hit(kind) => Resolution::from(&kind),
                Verdict::Fail => Resolution::Fail,
                Verdict::Retry if cancel.is_cancelled() => self.abort_resolution(),
                Verdict::Retry
                    if ctx.status() == ParallelizerStatus::Stopping
                        || !self.policy.allows_retry(retries) =>
                {
                    Resolution::ToCheck
                }
                Verdict::Retry => match ctx.wait_while_paused().await {
                    Err(_) => self.abort_resolution(),
                    Ok(()) if cancel.is_cancelled() => self.abort_resolution(),
                    // Stopped while paused: no further dispatch.
                    Ok(()) if ctx.status() == ParallelizerStatus::Stopping => Resolution::ToCheck,
                    Ok(()) => {
                        retries += 1;
                        JobCounters::bump(&self.counters.retries);
                        self.reporter.report(JobEvent::Retrying {
                            index,
                            attempt: retries,
                            status: &status,
                        });
                        continue;
                    }
                },
            };

            let outcome = RecordOutcome {
                index,
                data,
                status: Some(status),
                resolution,
                captured,
                proxy: proxy_label,
                retries,
            };
            return Ok(self.finish(outcome).await);
        }
    }

    /// Borrow a proxy, waiting out exhaustion without consuming a retry.
    async fn acquire_proxy(
        &self,
        pool: &Arc<ProxyPool>,
        index: u64,
        ctx: &mut WorkContext,
    ) -> Result<ProxyLease, Interruption> {
        let cancel = ctx.cancel_token().clone();
        loop {
            match pool.checkout(&cancel).await {
                Ok(lease) => return Ok(lease),
                Err(AppError::NoProxyAvailable) => {}
                Err(AppError::Cancelled) => return Err(Interruption::Aborted),
                Err(e) => {
                    tracing::warn!(index, error = %e, "Proxy checkout failed");
                    return Err(Interruption::Exhausted);
                }
            }

            JobCounters::bump(&self.counters.proxy_waits);
            self.reporter.report(JobEvent::ProxyWait { index });
            if pool.options().no_valid_proxy_behaviour == NoValidProxyBehaviour::DoNothing {
                return Err(Interruption::Exhausted);
            }

            tokio::select! {
                waited = pool.wait_available(&cancel) => {
                    if waited.is_err() {
                        return Err(Interruption::Aborted);
                    }
                }
                () = ctx.stop_requested() => {
                    return Err(if cancel.is_cancelled() {
                        Interruption::Aborted
                    } else {
                        Interruption::Stopped
                    });
                }
            }
            if ctx.wait_while_paused().await.is_err() {
                return Err(Interruption::Aborted);
            }
        }
    }

    fn checkin(&self, lease: ProxyLease, index: u64, status: &BotStatus) {
        let proxy = lease.proxy().clone();
        if lease.checkin(status) {
            JobCounters::bump(&self.counters.bans);
            self.reporter.report(JobEvent::ProxyBanned {
                index,
                proxy: &proxy,
                status,
            });
        }
    }

    fn abort_resolution(&self) -> Resolution {
        if self.options.mark_as_to_check_on_abort {
            Resolution::ToCheck
        } else {
            Resolution::Abandoned
        }
    }

    /// Count the outcome, report it and hand hits to every sink.
    async fn finish(&self, outcome: RecordOutcome) -> RecordOutcome {
        let counter = match outcome.resolution {
            Resolution::Success => Some(&self.counters.hits),
            Resolution::Custom => Some(&self.counters.custom),
            Resolution::Fail => Some(&self.counters.fails),
            Resolution::ToCheck => Some(&self.counters.to_check),
            Resolution::Abandoned => None,
        };
        if let Some(counter) = counter {
            JobCounters::bump(counter);
            JobCounters::bump(&self.counters.tested);
        }

        self.reporter.report(JobEvent::RecordFinished {
            index: outcome.index,
            data: &outcome.data,
            resolution: outcome.resolution,
            status: outcome.status.as_ref(),
        });

        if let Some(kind) = outcome.hit_kind() {
            let hit = Hit {
                id: Uuid::new_v4(),
                job_id: self.id,
                data: outcome.data.clone(),
                kind,
                captured: outcome.captured.clone(),
                proxy: outcome.proxy.clone(),
                date: Utc::now(),
            };
            self.store(&hit).await;
        }
        outcome
    }

    async fn store(&self, hit: &Hit) {
        for sink in &self.sinks {
            if let Err(e) = sink.store(hit).await {
                self.reporter.report(JobEvent::SinkFailed {
                    sink: &sink.name(),
                    error: &e.to_string(),
                });
            }
        }
    }
}

/// Builder for [`Job`].
pub struct JobBuilder<B> {
    options: JobOptions,
    bot: B,
    data_pool: Option<DataPool>,
    proxy_pool: Option<Arc<ProxyPool>>,
    sinks: Vec<Arc<dyn HitSink>>,
    reporter: Arc<dyn JobReporter>,
}

impl<B: Bot> JobBuilder<B> {
    /// Use this data pool instead of building one from the options' descriptor.
    pub fn with_data_pool(mut self, data_pool: DataPool) -> Self {
        self.data_pool = Some(data_pool);
        self
    }

    pub fn with_proxy_pool(mut self, pool: Arc<ProxyPool>) -> Self {
        self.proxy_pool = Some(pool);
        self
    }

    pub fn with_hit_sink(mut self, sink: Arc<dyn HitSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn JobReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn build(self) -> Result<Job<B>, AppError> {
        self.options.validate()?;

        let uses_proxies = match self.options.proxy_mode {
            ProxyMode::On => true,
            ProxyMode::Off => false,
            ProxyMode::Default => self.bot.needs_proxies(),
        };
        let proxy_pool = match (uses_proxies, self.proxy_pool) {
            (true, Some(pool)) => Some(pool),
            (true, None) => {
                return Err(AppError::ConfigError(
                    "proxies are enabled but no proxy pool was configured".into(),
                ));
            }
            (false, _) => None,
        };

        let data_pool = match self.data_pool {
            Some(pool) => pool,
            None => DataPool::from_descriptor(&self.options.data_pool)?,
        };
        let (records, size) = data_pool.into_parts();

        let engine = Arc::new(Engine {
            id: Uuid::new_v4(),
            policy: OutcomePolicy::new(
                self.options.retry_statuses.clone(),
                self.options.ban_loop_evasion,
            ),
            options: self.options,
            bot: self.bot,
            proxy_pool,
            sinks: self.sinks,
            reporter: self.reporter,
            counters: JobCounters::default(),
        });

        let worker = Arc::clone(&engine);
        let parallelizer = Parallelizer::new(
            records,
            size.total(),
            engine.options.skip,
            engine.options.bots,
            move |data, ctx| {
                let engine = Arc::clone(&worker);
                async move { engine.process(data, ctx).await }
            },
        )?;

        Ok(Job {
            engine,
            parallelizer,
            monitor: Mutex::new(None),
        })
    }
}

/// One run of a bot over a data pool.
pub struct Job<B> {
    engine: Arc<Engine<B>>,
    parallelizer: Parallelizer<String, RecordOutcome>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl<B: Bot> Job<B> {
    pub fn builder(options: JobOptions, bot: B) -> JobBuilder<B> {
        JobBuilder {
            options,
            bot,
            data_pool: None,
            proxy_pool: None,
            sinks: Vec::new(),
            reporter: Arc::new(TracingJobReporter),
        }
    }

    pub fn id(&self) -> Uuid {
        self.engine.id
    }

    pub fn options(&self) -> &JobOptions {
        &self.engine.options
    }

    pub fn uses_proxies(&self) -> bool {
        self.engine.proxy_pool.is_some()
    }

    pub fn proxy_pool(&self) -> Option<&Arc<ProxyPool>> {
        self.engine.proxy_pool.as_ref()
    }

    pub fn status(&self) -> ParallelizerStatus {
        self.parallelizer.status()
    }

    /// Progress, result, error and completion notifications.
    pub fn subscribe(&self) -> JobEventReceiver {
        self.parallelizer.subscribe()
    }

    /// Load proxies (if used) and begin dispatching records.
    pub async fn start(&self) -> Result<(), AppError> {
        let state = self.status();
        if state != ParallelizerStatus::Idle {
            return Err(AppError::InvalidState {
                operation: "start",
                state,
            });
        }

        if let Some(pool) = &self.engine.proxy_pool {
            match pool.reload().await {
                Ok(loaded) => tracing::info!(job_id = %self.id(), loaded, "Proxies loaded"),
                Err(e) => tracing::warn!(job_id = %self.id(), error = %e, "Initial proxy load failed"),
            }
        }

        let mut events = self.parallelizer.subscribe();
        self.parallelizer.start()?;

        let engine = Arc::clone(&self.engine);
        let parallelizer = self.parallelizer.clone();
        let monitor = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let ParallelizerEvent::Completed = event {
                    let counts = engine.counters.snapshot();
                    engine.reporter.report(JobEvent::Completed {
                        job_id: engine.id,
                        counts: &counts,
                        elapsed: parallelizer.elapsed(),
                    });
                }
            }
        });
        *self.lock_monitor() = Some(monitor);

        self.engine.reporter.report(JobEvent::Started {
            job_id: self.id(),
            name: &self.engine.options.name,
            bots: self.engine.options.bots,
            total: self.parallelizer.total_amount(),
            proxies: self.uses_proxies(),
        });
        Ok(())
    }

    pub fn pause(&self) -> Result<(), AppError> {
        self.parallelizer.pause()?;
        self.engine
            .reporter
            .report(JobEvent::Paused { job_id: self.id() });
        Ok(())
    }

    pub fn resume(&self) -> Result<(), AppError> {
        self.parallelizer.resume()?;
        self.engine
            .reporter
            .report(JobEvent::Resumed { job_id: self.id() });
        Ok(())
    }

    /// Request a graceful stop and return without waiting for the drain.
    pub fn request_stop(&self) -> Result<(), AppError> {
        self.parallelizer.request_stop()?;
        self.engine
            .reporter
            .report(JobEvent::Stopping { job_id: self.id() });
        Ok(())
    }

    /// Graceful stop: finish in-flight records, dispatch no more.
    pub async fn stop(&self) -> Result<(), AppError> {
        self.request_stop()?;
        self.completion().await;
        Ok(())
    }

    /// Cancel in-flight records and wait for them to return.
    pub async fn abort(&self) -> Result<(), AppError> {
        let state = self.status();
        if state.is_terminal() {
            return Err(AppError::InvalidState {
                operation: "abort",
                state,
            });
        }
        self.engine
            .reporter
            .report(JobEvent::Aborting { job_id: self.id() });
        self.parallelizer.abort().await?;
        self.completion().await;
        Ok(())
    }

    /// Change the number of concurrent bots while running.
    pub fn change_bots(&self, bots: usize) -> Result<(), AppError> {
        let from = self.parallelizer.degree_of_parallelism();
        self.parallelizer.change_degree_of_parallelism(bots)?;
        self.engine.reporter.report(JobEvent::BotsChanged {
            job_id: self.id(),
            from,
            to: bots,
        });
        Ok(())
    }

    /// Wait until the run has completed and its completion was reported.
    pub async fn completion(&self) {
        self.parallelizer.completion().await;
        let monitor = self.lock_monitor().take();
        if let Some(handle) = monitor
            && let Err(e) = handle.await
        {
            tracing::warn!(error = %e, "Job monitor task failed");
        }
    }

    /// Wait for completion unless `signal` fires first.
    pub async fn wait_completion(&self, signal: &CancellationToken) -> Result<(), AppError> {
        tokio::select! {
            () = self.completion() => Ok(()),
            () = signal.cancelled() => Err(AppError::Cancelled),
        }
    }

    pub fn counts(&self) -> JobCounts {
        self.engine.counters.snapshot()
    }

    pub fn snapshot(&self) -> JobSnapshot {
        let p = &self.parallelizer;
        JobSnapshot {
            id: self.id(),
            name: self.engine.options.name.clone(),
            status: p.status(),
            progress: p.progress(),
            processed: p.processed(),
            total: p.total_amount(),
            elapsed_secs: p.elapsed().as_secs_f64(),
            remaining_secs: p.remaining().map(|d| d.as_secs_f64()),
            cpm: p.per_minute(),
            bots: p.degree_of_parallelism(),
            in_flight: p.in_flight(),
            counts: self.counts(),
            proxies: self.engine.proxy_pool.as_ref().map(|pool| pool.stats()),
        }
    }

    fn lock_monitor(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.monitor.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
