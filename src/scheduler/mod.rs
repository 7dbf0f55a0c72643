//! Render queue scheduling.
//!
//! - [`job`]: the job record and its lifecycle states
//! - [`queue`]: ordering, eligibility and per-job rules
//! - [`engine`]: the [`Scheduler`] state machine (dispatch, retry, batches)
//! - [`service`]: the task that owns the scheduler and the worker it feeds

pub mod engine;
pub mod job;
pub mod queue;
pub mod service;

pub use engine::{Advance, BatchSummary, Completion, Dispatch, Scheduler, SchedulerStatus};
pub use job::{job_id_for, Job, JobId, JobStatus};
pub use queue::{JobQueue, MoveDirection};
pub use service::{SchedulerCommand, SchedulerEvent, SchedulerHandle, SchedulerService};
