pub mod config;
pub mod data_pool;
pub mod error;
pub mod job;
pub mod models;
pub mod policy;
pub mod proxy;
pub mod proxy_pool;
pub mod reporter;
pub mod scheduler;
#[doc(hidden)]
pub mod testutil;
pub mod traits;

pub use config::{DataPoolDescriptor, HitSinkDescriptor, JobOptions, ProxyMode, ProxySourceDescriptor};
pub use data_pool::{DataPool, PoolSize};
pub use error::AppError;
pub use job::{Job, JobBuilder, JobCounts, JobEventReceiver, JobSnapshot, RecordOutcome};
pub use models::{BotOutcome, BotStatus, Hit, HitKind, compute_hash};
pub use policy::{OutcomePolicy, Resolution, Verdict};
pub use proxy::{Proxy, ProxyType, WorkingStatus, parse_proxy_list};
pub use proxy_pool::{BorrowMode, NoValidProxyBehaviour, ProxyLease, ProxyPool, ProxyPoolOptions, ProxyPoolStats};
pub use reporter::{JobEvent, JobReporter, TracingJobReporter};
pub use scheduler::{Parallelizer, ParallelizerEvent, ParallelizerStatus, WorkContext};
pub use traits::{Bot, GroupProxySource, HitSink, LogHitSink, ProxySource};
