#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Job scheduler core for the bookforge pipeline: priority queue, rate
//! limiter, provider/cpu worker pools, write-through sink, job contract, and
//! the scheduler that ties them together.

pub mod adapters;
pub mod config;
pub mod cpu_pool;
pub mod error;
pub mod job;
pub mod job_manager;
pub mod priority_queue;
pub mod provider_pool;
pub mod rate_limiter;
pub mod scheduler;
pub mod sink;
pub mod store;
pub mod types;

pub use config::{load_config, save_config, ConfigError, PoolConfig, SchedulerConfig};
pub use job::{Job, JobContext, JobRecord, JobStatus};
pub use job_manager::{JobManager, StoreJobManager};
pub use priority_queue::PriorityQueue;
pub use provider_pool::{ProviderHandle, ProviderPool};
pub use rate_limiter::RateLimiter;
pub use scheduler::{JobFactory, RegisteredProvider, Scheduler};
pub use sink::Sink;
pub use store::{DocumentStore, OpKind, StoreOp};
pub use types::{WorkKind, WorkResult, WorkUnit};
