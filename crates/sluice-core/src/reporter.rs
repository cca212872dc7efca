use std::time::Duration;

use uuid::Uuid;

use crate::job::JobCounts;
use crate::models::BotStatus;
use crate::policy::Resolution;
use crate::proxy::Proxy;

/// Events emitted by a job for monitoring/logging.
#[derive(Debug, Clone)]
pub enum JobEvent<'a> {
    Started {
        job_id: Uuid,
        name: &'a str,
        bots: usize,
        total: u64,
        proxies: bool,
    },
    Paused {
        job_id: Uuid,
    },
    Resumed {
        job_id: Uuid,
    },
    BotsChanged {
        job_id: Uuid,
        from: usize,
        to: usize,
    },
    Stopping {
        job_id: Uuid,
    },
    Aborting {
        job_id: Uuid,
    },
    ProxyWait {
        index: u64,
    },
    ProxyBanned {
        index: u64,
        proxy: &'a Proxy,
        status: &'a BotStatus,
    },
    Retrying {
        index: u64,
        attempt: u32,
        status: &'a BotStatus,
    },
    RecordFinished {
        index: u64,
        data: &'a str,
        resolution: Resolution,
        status: Option<&'a BotStatus>,
    },
    RecordErrored {
        index: u64,
        error: &'a str,
    },
    SinkFailed {
        sink: &'a str,
        error: &'a str,
    },
    Completed {
        job_id: Uuid,
        counts: &'a JobCounts,
        elapsed: Duration,
    },
}

/// Trait for receiving job events (decoupled logging).
pub trait JobReporter: Send + Sync {
    fn report(&self, event: JobEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingJobReporter;

impl JobReporter for TracingJobReporter {
    fn report(&self, event: JobEvent<'_>) {
        match event {
            JobEvent::Started {
                job_id,
                name,
                bots,
                total,
                proxies,
            } => {
                tracing::info!(%job_id, %name, bots, total, proxies, "Job started");
            }
            JobEvent::Paused { job_id } => {
                tracing::info!(%job_id, "Job paused");
            }
            JobEvent::Resumed { job_id } => {
                tracing::info!(%job_id, "Job resumed");
            }
            JobEvent::BotsChanged { job_id, from, to } => {
                tracing::info!(%job_id, from, to, "Bots changed");
            }
            JobEvent::Stopping { job_id } => {
                tracing::info!(%job_id, "Job stopping, draining in-flight checks");
            }
            JobEvent::Aborting { job_id } => {
                tracing::warn!(%job_id, "Job aborting");
            }
            JobEvent::ProxyWait { index } => {
                tracing::debug!(index, "No proxy available, waiting");
            }
            JobEvent::ProxyBanned {
                index,
                proxy,
                status,
            } => {
                tracing::debug!(index, %proxy, %status, "Proxy banned");
            }
            JobEvent::Retrying {
                index,
                attempt,
                status,
            } => {
                tracing::debug!(index, attempt, %status, "Retrying record");
            }
            JobEvent::RecordFinished {
                index,
                data,
                resolution,
                status,
            } => match resolution {
                Resolution::Success | Resolution::Custom => {
                    tracing::info!(index, %data, %resolution, ?status, "Hit");
                }
                _ => {
                    tracing::debug!(index, %resolution, ?status, "Record finished");
                }
            },
            JobEvent::RecordErrored { index, error } => {
                tracing::warn!(index, %error, "Record failed with an error");
            }
            JobEvent::SinkFailed { sink, error } => {
                tracing::warn!(%sink, %error, "Hit sink failed");
            }
            JobEvent::Completed {
                job_id,
                counts,
                elapsed,
            } => {
                tracing::info!(
                    %job_id,
                    tested = counts.tested,
                    hits = counts.hits,
                    custom = counts.custom,
                    to_check = counts.to_check,
                    errors = counts.errors,
                    elapsed_secs = elapsed.as_secs(),
                    "Job completed"
                );
            }
        }
    }
}
