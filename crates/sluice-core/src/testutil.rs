//! Test utilities: mock implementations of the collaborator traits.
//!
//! Handwritten mocks for dependency injection in unit and integration tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls. Clones share their recordings.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::models::{BotOutcome, BotStatus, Hit};
use crate::proxy::Proxy;
use crate::reporter::{JobEvent, JobReporter};
use crate::traits::{Bot, HitSink, ProxySource};

// ---------------------------------------------------------------------------
// MockBot
// ---------------------------------------------------------------------------

type Responder = Arc<dyn Fn(&str) -> Result<BotOutcome, AppError> + Send + Sync>;

/// Mock bot with a configurable response per call.
#[derive(Clone)]
pub struct MockBot {
    responder: Responder,
    /// Statuses popped one per call; the last one repeats.
    sequence: Arc<Mutex<VecDeque<BotStatus>>>,
    delay: Option<Duration>,
    needs_proxies: bool,
    calls: Arc<Mutex<Vec<(String, Option<Proxy>)>>>,
}

impl MockBot {
    /// Always returns `status`.
    pub fn with_status(status: BotStatus) -> Self {
        Self::from_fn(move |_| Ok(BotOutcome::new(status.clone())))
    }

    /// Computes the outcome from the record.
    pub fn from_fn(
        f: impl Fn(&str) -> Result<BotOutcome, AppError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            responder: Arc::new(f),
            sequence: Arc::new(Mutex::new(VecDeque::new())),
            delay: None,
            needs_proxies: false,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Returns the statuses in order, repeating the last one.
    pub fn sequence(statuses: Vec<BotStatus>) -> Self {
        let mut bot = Self::with_status(BotStatus::None);
        bot.sequence = Arc::new(Mutex::new(statuses.into()));
        bot
    }

    /// Each check takes `delay`, or returns `Cancelled` if cancelled first.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn needing_proxies(mut self) -> Self {
        self.needs_proxies = true;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls_for(&self, data: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(d, _)| d == data)
            .count()
    }

    pub fn proxies_seen(&self) -> Vec<Option<Proxy>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, p)| p.clone())
            .collect()
    }

    fn respond(&self, data: &str) -> Result<BotOutcome, AppError> {
        let mut sequence = self.sequence.lock().unwrap();
        match sequence.len() {
            0 => (self.responder)(data),
            1 => Ok(BotOutcome::new(sequence[0].clone())),
            _ => Ok(BotOutcome::new(sequence.pop_front().unwrap())),
        }
    }
}

impl Bot for MockBot {
    async fn check(
        &self,
        data: &str,
        proxy: Option<&Proxy>,
        cancel: CancellationToken,
    ) -> Result<BotOutcome, AppError> {
        self.calls
            .lock()
            .unwrap()
            .push((data.to_string(), proxy.cloned()));

        if let Some(delay) = self.delay {
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = cancel.cancelled() => return Err(AppError::Cancelled),
            }
        }
        self.respond(data)
    }

    fn needs_proxies(&self) -> bool {
        self.needs_proxies
    }
}

// ---------------------------------------------------------------------------
// MockProxySource
// ---------------------------------------------------------------------------

/// Mock proxy source with a replaceable list and fetch counting.
#[derive(Clone)]
pub struct MockProxySource {
    proxies: Arc<Mutex<Result<Vec<Proxy>, String>>>,
    delay: Option<Duration>,
    fetches: Arc<AtomicUsize>,
}

impl MockProxySource {
    pub fn new(proxies: Vec<Proxy>) -> Self {
        Self {
            proxies: Arc::new(Mutex::new(Ok(proxies))),
            delay: None,
            fetches: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_proxies(&self, proxies: Vec<Proxy>) {
        *self.proxies.lock().unwrap() = Ok(proxies);
    }

    /// Make every later fetch fail with `message`.
    pub fn fail_with(&self, message: &str) {
        *self.proxies.lock().unwrap() = Err(message.to_string());
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProxySource for MockProxySource {
    fn name(&self) -> String {
        "mock".to_string()
    }

    async fn fetch(&self) -> Result<Vec<Proxy>, AppError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.proxies
            .lock()
            .unwrap()
            .clone()
            .map_err(|message| AppError::ProxySourceError {
                source_name: self.name(),
                message,
            })
    }
}

// ---------------------------------------------------------------------------
// MockHitSink
// ---------------------------------------------------------------------------

/// Mock hit sink that records stored hits.
#[derive(Clone, Default)]
pub struct MockHitSink {
    hits: Arc<Mutex<Vec<Hit>>>,
    fail: bool,
}

impl MockHitSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink whose every store fails.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn hits(&self) -> Vec<Hit> {
        self.hits.lock().unwrap().clone()
    }
}

#[async_trait]
impl HitSink for MockHitSink {
    fn name(&self) -> String {
        "mock".to_string()
    }

    async fn store(&self, hit: &Hit) -> Result<(), AppError> {
        if self.fail {
            return Err(AppError::SinkError {
                sink: self.name(),
                message: "disk full".to_string(),
            });
        }
        self.hits.lock().unwrap().push(hit.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Mock job reporter that records event labels.
#[derive(Default)]
pub struct MockReporter {
    pub events: Arc<Mutex<Vec<String>>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn labels(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, label: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|l| *l == label)
            .count()
    }
}

impl JobReporter for MockReporter {
    fn report(&self, event: JobEvent<'_>) {
        let label = match &event {
            JobEvent::Started { .. } => "Started",
            JobEvent::Paused { .. } => "Paused",
            JobEvent::Resumed { .. } => "Resumed",
            JobEvent::BotsChanged { .. } => "BotsChanged",
            JobEvent::Stopping { .. } => "Stopping",
            JobEvent::Aborting { .. } => "Aborting",
            JobEvent::ProxyWait { .. } => "ProxyWait",
            JobEvent::ProxyBanned { .. } => "ProxyBanned",
            JobEvent::Retrying { .. } => "Retrying",
            JobEvent::RecordFinished { .. } => "RecordFinished",
            JobEvent::RecordErrored { .. } => "RecordErrored",
            JobEvent::SinkFailed { .. } => "SinkFailed",
            JobEvent::Completed { .. } => "Completed",
        };
        self.events.lock().unwrap().push(label.to_string());
    }
}
