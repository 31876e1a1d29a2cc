use std::time::Duration;

use thiserror::Error;

/// Failures of a single BACnet read against a field device.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BacnetError {
    #[error("read timed out after {0:?}")]
    Timeout(Duration),
    #[error("device unreachable: {0}")]
    Unreachable(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("could not parse property value: {0}")]
    ValueParse(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("required configuration `{0}` is missing (env or config file)")]
    Missing(&'static str),
    #[error("invalid value `{value}` for `{name}`: {message}")]
    Invalid {
        name: String,
        value: String,
        message: String,
    },
    #[error("could not read config file `{path}`: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse config file `{path}`: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("could not build the connection pool: {0}")]
    CreatePool(#[from] deadpool_postgres::CreatePoolError),
    #[error("could not acquire a pooled connection: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),
    #[error("unexpected row data: {0}")]
    Decode(String),
}

/// Failures talking to the remote Client System API.
#[derive(Error, Debug, Clone)]
pub enum RemoteError {
    #[error("request failed: {0}")]
    Transport(String),
    #[error("request timed out")]
    Timeout,
    #[error("the configured API key was rejected")]
    Unauthorized,
    #[error("remote returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("could not decode remote payload: {0}")]
    Decode(String),
}

impl RemoteError {
    /// Whether a retry with backoff can reasonably succeed.
    ///
    /// 4xx responses are terminal: the payload will not become acceptable by
    /// resending it. 401 is terminal and additionally surfaced to the
    /// operator as [`RemoteError::Unauthorized`].
    pub fn is_retriable(&self) -> bool {
        match self {
            RemoteError::Transport(_) | RemoteError::Timeout => true,
            RemoteError::Status { status, .. } => *status >= 500,
            RemoteError::Unauthorized | RemoteError::Decode(_) => false,
        }
    }

    pub(crate) fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RemoteError::Timeout
        } else if err.is_decode() {
            RemoteError::Decode(err.to_string())
        } else {
            RemoteError::Transport(err.to_string())
        }
    }
}

/// Mutual-exclusion rejection: a second invocation of a cycle while one is
/// still running. Surfaced as HTTP 409 by the local API.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CycleError {
    #[error("{0} cycle already running")]
    AlreadyRunning(&'static str),
}

#[derive(Error, Debug)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Bacnet(#[from] BacnetError),
    #[error(transparent)]
    Cycle(#[from] CycleError),
}
