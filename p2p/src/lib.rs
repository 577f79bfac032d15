//! Communicate with peers over bandwidth-constrained links.
//!
//! Peers are identified by a [PeerId] and exchange typed messages that know their own encoded
//! [Payload::size]. The [simulated] module provides a network that delivers each message once its
//! last byte has cleared both the sender's uplink and the recipient's downlink.

use std::{error::Error as StdError, fmt, fmt::Debug, future::Future, time::SystemTime};

pub mod simulated;

/// Identity of a peer in the network.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(u32);

impl PeerId {
    /// Create a new peer identity.
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw identity.
    pub const fn get(&self) -> u32 {
        self.0
    }

    /// Returns the big-endian encoding of the identity.
    pub const fn to_be_bytes(&self) -> [u8; 4] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// A message that can be carried over the network.
pub trait Payload: Clone + Debug + Send + Sync + 'static {
    /// Number of bytes the message occupies on the wire.
    fn size(&self) -> usize;
}

/// Interface for sending messages to a neighbor.
pub trait Sender: Clone + Debug + Send + 'static {
    /// Error that can occur when sending a message.
    type Error: Debug + StdError + Send + Sync;

    /// Message carried by the sender.
    type Message: Payload;

    /// Schedule a message for delivery to `recipient` and return the time at which it will be
    /// delivered (without waiting for delivery).
    fn dispatch(
        &mut self,
        recipient: PeerId,
        message: Self::Message,
    ) -> impl Future<Output = Result<SystemTime, Self::Error>> + Send;

    /// Send a message to `recipient` and wait until it has been delivered.
    fn send(
        &mut self,
        recipient: PeerId,
        message: Self::Message,
    ) -> impl Future<Output = Result<SystemTime, Self::Error>> + Send;

    /// Returns whether a message is in flight between this peer and `peer` (in either direction).
    fn busy(&mut self, peer: PeerId) -> impl Future<Output = Result<bool, Self::Error>> + Send;

    /// Returns the current neighbors of this peer.
    fn neighbors(&mut self) -> impl Future<Output = Result<Vec<PeerId>, Self::Error>> + Send;
}

/// Interface for receiving messages from neighbors.
pub trait Receiver: Debug + Send + 'static {
    /// Error that can occur when receiving a message.
    type Error: Debug + StdError + Send + Sync;

    /// Message carried by the receiver.
    type Message: Payload;

    /// Receive a message (and the peer that sent it) from any neighbor.
    fn recv(
        &mut self,
    ) -> impl Future<Output = Result<(PeerId, Self::Message), Self::Error>> + Send;
}
