/// Task runtime
///
/// The [`Task`] contract, the ledger-bracketed runner and the cron
/// [`Scheduler`] that drives the roster.

pub mod scheduler;
pub mod task;

pub use scheduler::{Scheduler, TaskStatus};
pub use task::{run_task, Task};
