use keysim_p2p::PeerId;
use std::time::Duration;

/// Configuration for the [`Engine`](super::Engine).
#[derive(Clone, Debug)]
pub struct Config {
    /// The identity of the participant.
    pub public_key: PeerId,

    /// The maximum size of the mailbox backlog.
    pub mailbox_size: usize,

    /// Interval between gossip rounds with each neighbor.
    pub resend_interval: Duration,
}
