//! Error taxonomy for the proxy core.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("client closed the connection")]
    ClientClosed,

    #[error("client did not complete a request within the read deadline")]
    ClientTimeout,

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("domain blocked: {0}")]
    Blocked(String),

    #[error("rate limit exceeded for source")]
    RateLimited,

    #[error("access denied by ACL")]
    AclDenied,

    #[error("failed to reach upstream: {0}")]
    UpstreamDialFailed(String),

    #[error("upstream timed out")]
    UpstreamTimeout,

    #[error("upstream closed the connection")]
    UpstreamClosed,

    #[error("resource exhausted")]
    ResourceExhausted,

    #[error("server is shutting down")]
    ShuttingDown,

    #[error("internal error: {0}")]
    Internal(String),
}
