use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::models::Level;
use crate::navigator::ViewKind;

/// Failure talking to the result service.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("database query failed: {0}")]
    Database(#[from] sqlx::Error),
    #[error("reading snapshot failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("decoding payload failed: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("{what} {id:?} not found")]
    NotFound { what: &'static str, id: String },
    #[error("{what} id {id:?} is not valid")]
    InvalidId { what: &'static str, id: String },
    #[error("no response after {}s", .after.as_secs_f64())]
    TimedOut { after: Duration },
}

/// What a failed or superseded fetch was loading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    Tests,
    Test(String),
    Faculty(String),
    Student(String),
    Result(String),
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Tests => write!(f, "test list"),
            Scope::Test(id) => write!(f, "test {id}"),
            Scope::Faculty(name) => write!(f, "faculty {name}"),
            Scope::Student(key) => write!(f, "student {key}"),
            Scope::Result(id) => write!(f, "result {id}"),
        }
    }
}

/// Error state kept by the navigator so a view can render it and offer a retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeError {
    pub scope: Scope,
    pub message: String,
}

impl ScopeError {
    pub fn new(scope: &Scope, error: &FetchError) -> Self {
        Self {
            scope: scope.clone(),
            message: error.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum DrillError {
    #[error("loading {scope} failed: {source}")]
    Fetch {
        scope: Scope,
        #[source]
        source: FetchError,
    },
    #[error("cannot {action} from {from:?}")]
    InvalidTransition { action: &'static str, from: ViewKind },
    #[error("no {level} {key:?} in the current scope")]
    UnknownKey { level: Level, key: String },
}
