use std::time::Duration;

use thiserror::Error;

/// Why a request did not receive a reply
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum RequestError {
    #[error("response timed out after {0:?}")]
    Timeout(Duration),

    #[error("rejected by server: {0}")]
    Rejected(String),

    #[error("session was shut down")]
    Closed,
}
