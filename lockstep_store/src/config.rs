// Peer-side configuration.

use std::time::Duration;

use lockstep_protocol::ClientSlot;

/// Default number of *re*-tries for `set_store_with_retries`.
pub const DEFAULT_RETRIES: usize = 5;

/// Tunables for a `ReplicatedStore`.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// How long a follower waits for its proposal to come back committed
    /// before reporting it as not accepted.
    pub confirmation_timeout: Duration,
    /// Upper bound on the client-config handshake and the initial
    /// client-controlled-state exchange.
    pub handshake_timeout: Duration,
    /// Retries used by `set_store_with_default_retries`.
    pub default_retries: usize,
    /// Published into this peer's client-controlled-state slot on join.
    pub initial_client_state: ClientSlot,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            confirmation_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            default_retries: DEFAULT_RETRIES,
            initial_client_state: ClientSlot::new(),
        }
    }
}
