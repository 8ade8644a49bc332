/// ledger-sync: background orchestration for a personal-finance ledger
///
/// Cron-scheduled data-sync tasks, a durable run ledger with "ran today"
/// semantics, and a broker credential lifecycle that keeps access tokens
/// valid by driving the provider's web login.

// Process and broker account configuration
pub mod config;

// Error taxonomy shared by every layer
pub mod error;

// SQLite pool, schema and credential persistence
pub mod storage;

// Per-task run history
pub mod ledger;

// Provider login, session API and trade fetch
pub mod broker;

// Task contract and cron scheduler
pub mod runtime;

// Concrete task roster
pub mod tasks;

// Component wiring and run loop
pub mod app;

// Re-export commonly used types for external consumers
pub use app::{create_app, run, App};
pub use error::{Error, Result};
pub use ledger::{ExecutionLedger, TaskExecutionRecord};
pub use runtime::{Scheduler, Task, TaskStatus};
