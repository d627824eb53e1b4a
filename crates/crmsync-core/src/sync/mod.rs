//! The sync engine: conflict resolution, retries, the run orchestrator and
//! the recurring job scheduler

mod orchestrator;
mod resolver;
mod retry;
mod scheduler;

pub use orchestrator::{Orchestrator, RunRequest};
pub use resolver::{resolve, ConflictDraft, FieldOutcome, Resolution, Side};
pub use retry::RetryPolicy;
pub use scheduler::{Job, JobReport, Scheduler};
