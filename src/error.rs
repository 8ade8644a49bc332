/// Error taxonomy for the sync core
///
/// Each variant maps to one failure class the orchestration layers react to:
/// storage contention is retried inside the ledger, authentication failures
/// drive the credential refresh cascade, everything else is logged and
/// recorded against the task that hit it.

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing or invalid static configuration (account secrets, task names).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The provider's login flow did not have the expected shape.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The provider rejected credentials, the second factor or a token.
    #[error("authentication error: {0}")]
    Authentication(String),

    /// The database stayed busy/locked after every retry.
    #[error("storage busy: {0}")]
    TransientStorage(String),

    /// Any other database failure.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// Transport-level HTTP failure (connect, timeout, body read).
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Token acquisition gave up after the bounded retry cascade.
    #[error("could not obtain access token for {api_key} after {attempts} attempt(s): {reason}")]
    Credential {
        api_key: String,
        attempts: u32,
        reason: String,
    },

    /// Automated login is unavailable; a human has to log in at `login_url`.
    #[error("manual login required for {api_key}: visit {login_url} and put the request token in the broker config")]
    ManualLoginRequired { api_key: String, login_url: String },

    /// Task body failure unrelated to authentication.
    #[error("task error: {0}")]
    Task(String),

    /// Scheduler engine failure.
    #[error("scheduler error: {0}")]
    Scheduler(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl From<tokio_cron_scheduler::JobSchedulerError> for Error {
    fn from(e: tokio_cron_scheduler::JobSchedulerError) -> Self {
        Error::Scheduler(format!("{:?}", e))
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, Error>;
