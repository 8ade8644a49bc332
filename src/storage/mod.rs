/// Storage layer
///
/// A single SQLite database (sqlx pool) shared by the execution ledger and
/// the broker credential store. Writes that can contend go through
/// [`retry::RetryPolicy`].

pub mod credentials;
pub mod database;
pub mod retry;

pub use credentials::{AccountCredential, CredentialStore};
pub use database::open_pool;
pub use retry::RetryPolicy;
