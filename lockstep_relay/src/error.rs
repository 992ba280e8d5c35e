// Relay error type.

use lockstep_protocol::NetworkId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("network {0} is shutting down")]
    NetworkClosed(NetworkId),

    #[error("failed to bind relay listener: {0}")]
    Bind(#[source] std::io::Error),
}
