//! Crate-wide error type for the parts of the public API that cannot
//! express their failure as a `ProbeResult` (construction, not probing).

use std::io;

/// Errors surfaced directly to callers, as opposed to the per-probe
/// outcomes delivered through [`crate::model::ProbeResult`].
#[derive(thiserror::Error, Debug)]
pub enum ProbeError {
    #[error("failed to parse destination address {0:?}")]
    InvalidDestination(String),

    #[error("socket creation failed: {0}")]
    SocketCreate(#[source] io::Error),

    #[error("socket bind failed: {0}")]
    SocketBind(#[source] io::Error),

    #[error("socket configuration failed: {0}")]
    SocketConfig(#[source] io::Error),

    #[error("send failed: {0}")]
    Send(#[source] io::Error),

    #[error("probe manager is not running")]
    NotRunning,
}
