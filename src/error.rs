use thiserror::Error;
use tokio_cron_scheduler::JobSchedulerError;

/// Custom Error and Result types to unify errors from all sources.
pub type StatsResult<T> = Result<T, StatsError>;

#[derive(Debug, Error)]
pub enum StatsError {
    #[error("Transport Error: {0}")]
    Transport(String),
    // Upstream asked us to slow down. Absorbed by the upstream client.
    #[error("Throttled by upstream")]
    Throttled,
    // Upstream rejected the API key. Absorbed by removing the key from the pool.
    #[error("Invalid API key")]
    InvalidCredential,
    #[error("Endpoint temporarily disabled")]
    EndpointDisabled,
    #[error("Entity not found")]
    NotFound,
    #[error("Persistent store unavailable")]
    StoreUnavailable,
    #[error("No API key available")]
    NoCredentials,
    #[error("Upstream Error: {0}")]
    Upstream(String),
    #[error("Store Error: {0}")]
    Store(String),
    #[error("Scheduler Error: {0}")]
    Scheduler(String),
    #[error("Config Error: {0}")]
    Config(String),
    #[error("Parse Error: {0}")]
    Parse(String),
}

impl From<reqwest::Error> for StatsError {
    fn from(error: reqwest::Error) -> Self {
        StatsError::Transport(error.to_string())
    }
}

impl From<serde_json::Error> for StatsError {
    fn from(error: serde_json::Error) -> Self {
        StatsError::Parse(error.to_string())
    }
}

impl From<JobSchedulerError> for StatsError {
    fn from(error: JobSchedulerError) -> Self {
        StatsError::Scheduler(error.to_string())
    }
}

impl From<figment::Error> for StatsError {
    fn from(error: figment::Error) -> Self {
        StatsError::Config(error.to_string())
    }
}
