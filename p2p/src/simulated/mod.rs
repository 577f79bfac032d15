//! Send messages between peers over links with finite, time-varying capacity.
//!
//! Every peer owns an uplink and a downlink [bandwidth::Channel]. When a peer sends a message,
//! the network computes how fast the message can flow through the sender's uplink and the
//! recipient's downlink (given everything already reserved on both), reserves that bandwidth and
//! delivers the message at the instant its last byte arrives. Concurrent transfers therefore never
//! draw more than a channel's capacity: a later transfer simply receives whatever an earlier one
//! left behind.
//!
//! Peers must be connected (with [Oracle::connect]) before they can exchange messages. The
//! network also tracks which pairs of peers have a transfer in flight, so callers can avoid
//! queueing more traffic on a busy link.
//!
//! # Example
//!
//! ```rust
//! use keysim_p2p::{simulated::{Channel, Config, Network}, PeerId, Payload, Sender, Receiver};
//! use keysim_runtime::{deterministic, Metrics, Runner};
//!
//! #[derive(Clone, Debug)]
//! struct Ping;
//!
//! impl Payload for Ping {
//!     fn size(&self) -> usize {
//!         10
//!     }
//! }
//!
//! let executor = deterministic::Runner::default();
//! executor.start(|context| async move {
//!     let (network, mut oracle) =
//!         Network::<_, Ping>::new(context.with_label("network"), Config { max_size: 1024 });
//!     network.start();
//!
//!     let (a, b) = (PeerId::new(0), PeerId::new(1));
//!     let (mut sender, _) = oracle.register(a, Channel::new(10), Channel::new(10)).await.unwrap();
//!     let (_, mut receiver) = oracle.register(b, Channel::new(10), Channel::new(10)).await.unwrap();
//!     oracle.connect(a, b).await.unwrap();
//!
//!     sender.send(b, Ping).await.unwrap();
//!     let (origin, _) = receiver.recv().await.unwrap();
//!     assert_eq!(origin, a);
//! });
//! ```

pub mod bandwidth;
mod ingress;
mod metrics;
mod network;

use crate::PeerId;
use std::time::Duration;
use thiserror::Error;

pub use bandwidth::{Channel, Segment};
pub use ingress::Oracle;
pub use network::{Config, Network, Receiver, Sender};

/// Errors that can occur when interacting with the `simulated` network.
#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed channel: segments must be ordered and end with an unbounded segment")]
    MalformedChannel,
    #[error("channel starved: bandwidth never becomes available")]
    Starved,
    #[error("over-allocation at {at:?}: requested {requested} B/s but only {available} B/s available")]
    OverAllocation {
        at: Duration,
        available: u64,
        requested: u64,
    },
    #[error("message too large: {0}")]
    MessageTooLarge(usize),
    #[error("network closed")]
    NetworkClosed,
    #[error("not valid to link self")]
    LinkingSelf,
    #[error("unknown peer: {0}")]
    UnknownPeer(PeerId),
    #[error("peer already registered: {0}")]
    AlreadyRegistered(PeerId),
    #[error("peers not connected: {0} -> {1}")]
    NotConnected(PeerId, PeerId),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Payload, Receiver as _, Sender as _};
    use keysim_runtime::{deterministic, Clock, Metrics, Runner, Spawner, SystemTimeExt};
    use std::time::UNIX_EPOCH;

    #[derive(Clone, Debug, PartialEq, Eq)]
    struct Blob(usize);

    impl Payload for Blob {
        fn size(&self) -> usize {
            self.0
        }
    }

    fn secs(value: u64) -> std::time::SystemTime {
        UNIX_EPOCH + Duration::from_secs(value)
    }

    fn new_network(
        context: &deterministic::Context,
    ) -> Oracle<deterministic::Context, Blob> {
        let (network, oracle) =
            Network::new(context.with_label("network"), Config { max_size: 1024 });
        network.start();
        oracle
    }

    #[test]
    fn test_shared_uplink() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let mut oracle = new_network(&context);
            let (a, b, c) = (PeerId::new(0), PeerId::new(1), PeerId::new(2));
            let (sender, _) = oracle
                .register(a, Channel::new(10), Channel::new(10))
                .await
                .unwrap();
            let (_, mut receiver_b) = oracle
                .register(b, Channel::new(10), Channel::new(10))
                .await
                .unwrap();
            let (_, mut receiver_c) = oracle
                .register(c, Channel::new(10), Channel::new(10))
                .await
                .unwrap();
            oracle.connect(a, b).await.unwrap();
            oracle.connect(a, c).await.unwrap();

            // Send two messages at the same instant (each caller waits for its own delivery)
            let mut handles = Vec::new();
            for recipient in [b, c] {
                let mut sender = sender.clone();
                handles.push(context.clone().spawn(move |_| async move {
                    sender.send(recipient, Blob(50)).await.unwrap()
                }));
            }

            // The uplink is fully reserved until both transfers finish
            context.sleep(Duration::from_secs(1)).await;
            let (uplink, _) = oracle.channels(a).await.unwrap();
            assert_eq!(
                uplink.segments(),
                &[
                    Segment {
                        available: 0,
                        until: Some(secs(10)),
                    },
                    Segment {
                        available: 10,
                        until: None,
                    },
                ]
            );

            // Together they never draw more than the uplink capacity
            let mut completions = Vec::new();
            for handle in handles {
                completions.push(handle.await.unwrap());
            }
            assert_eq!(completions, vec![secs(5), secs(10)]);
            assert_eq!(context.current(), secs(10));

            // Each recipient observed the message at its completion time
            let (origin, message) = receiver_b.recv().await.unwrap();
            assert_eq!((origin, message), (a, Blob(50)));
            let (origin, message) = receiver_c.recv().await.unwrap();
            assert_eq!((origin, message), (a, Blob(50)));
        });
    }

    #[test]
    fn test_shared_downlink() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let mut oracle = new_network(&context);
            let (a, b, c) = (PeerId::new(0), PeerId::new(1), PeerId::new(2));
            let (mut sender_a, _) = oracle
                .register(a, Channel::new(100), Channel::new(100))
                .await
                .unwrap();
            let (mut sender_b, _) = oracle
                .register(b, Channel::new(100), Channel::new(100))
                .await
                .unwrap();
            let (_, mut receiver) = oracle
                .register(c, Channel::new(100), Channel::new(20))
                .await
                .unwrap();
            oracle.connect(a, c).await.unwrap();
            oracle.connect(b, c).await.unwrap();

            let first = sender_a.dispatch(c, Blob(100)).await.unwrap();
            let second = sender_b.dispatch(c, Blob(100)).await.unwrap();
            assert_eq!(first, secs(5));
            assert_eq!(second, secs(10));

            // Messages arrive in completion order
            let (origin, _) = receiver.recv().await.unwrap();
            assert_eq!(origin, a);
            assert_eq!(context.current(), secs(5));
            let (origin, _) = receiver.recv().await.unwrap();
            assert_eq!(origin, b);
            assert_eq!(context.current(), secs(10));
        });
    }

    #[test]
    fn test_time_varying_capacity() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let mut oracle = new_network(&context);
            let (a, b) = (PeerId::new(0), PeerId::new(1));
            let uplink = Channel::from_segments(vec![
                Segment {
                    available: 0,
                    until: Some(secs(2)),
                },
                Segment {
                    available: 10,
                    until: None,
                },
            ])
            .unwrap();
            let (mut sender, _) = oracle.register(a, uplink, Channel::new(10)).await.unwrap();
            let (_, mut receiver) = oracle
                .register(b, Channel::new(10), Channel::new(10))
                .await
                .unwrap();
            oracle.connect(a, b).await.unwrap();

            let completion = sender.send(b, Blob(10)).await.unwrap();
            assert_eq!(completion, secs(3));
            assert_eq!(context.current().epoch(), Duration::from_secs(3));
            receiver.recv().await.unwrap();
        });
    }

    #[test]
    fn test_busy() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let mut oracle = new_network(&context);
            let (a, b, c) = (PeerId::new(0), PeerId::new(1), PeerId::new(2));
            let (mut sender_a, _) = oracle
                .register(a, Channel::new(10), Channel::new(10))
                .await
                .unwrap();
            let (mut sender_b, mut receiver_b) = oracle
                .register(b, Channel::new(10), Channel::new(10))
                .await
                .unwrap();
            let (mut sender_c, _) = oracle
                .register(c, Channel::new(10), Channel::new(10))
                .await
                .unwrap();
            oracle.connect(a, b).await.unwrap();
            oracle.connect(b, c).await.unwrap();
            assert!(!sender_a.busy(b).await.unwrap());

            // In flight in one direction marks the link busy from both ends
            sender_a.dispatch(b, Blob(20)).await.unwrap();
            assert!(sender_a.busy(b).await.unwrap());
            assert!(sender_b.busy(a).await.unwrap());
            assert!(!sender_b.busy(c).await.unwrap());
            assert!(!sender_c.busy(b).await.unwrap());

            // Idle again once delivered
            receiver_b.recv().await.unwrap();
            assert!(!sender_a.busy(b).await.unwrap());
            assert!(!sender_b.busy(a).await.unwrap());
        });
    }

    #[test]
    fn test_fan_out() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let mut oracle = new_network(&context);
            let (a, b) = (PeerId::new(0), PeerId::new(1));
            let (mut sender, _) = oracle
                .register(a, Channel::new(10), Channel::new(10))
                .await
                .unwrap();
            let (_, mut first) = oracle
                .register(b, Channel::new(10), Channel::new(10))
                .await
                .unwrap();
            let mut second = oracle.attach(b).await.unwrap();
            oracle.connect(a, b).await.unwrap();

            sender.send(b, Blob(5)).await.unwrap();
            assert_eq!(first.recv().await.unwrap(), (a, Blob(5)));
            assert_eq!(second.recv().await.unwrap(), (a, Blob(5)));
        });
    }

    #[test]
    fn test_topology_errors() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let mut oracle = new_network(&context);
            let (a, b) = (PeerId::new(0), PeerId::new(1));
            let (mut sender, _) = oracle
                .register(a, Channel::new(10), Channel::new(10))
                .await
                .unwrap();
            oracle
                .register(b, Channel::new(10), Channel::new(10))
                .await
                .unwrap();

            // Registration
            let result = oracle.register(a, Channel::new(10), Channel::new(10)).await;
            assert!(matches!(result, Err(Error::AlreadyRegistered(peer)) if peer == a));

            // Connections
            assert!(matches!(oracle.connect(a, a).await, Err(Error::LinkingSelf)));
            assert!(matches!(
                oracle.connect(a, PeerId::new(9)).await,
                Err(Error::UnknownPeer(_))
            ));
            let result = sender.dispatch(b, Blob(1)).await;
            assert!(matches!(result, Err(Error::NotConnected(x, y)) if x == a && y == b));

            // Connecting is idempotent and symmetric
            oracle.connect(a, b).await.unwrap();
            oracle.connect(b, a).await.unwrap();
            assert_eq!(oracle.neighbors(a).await.unwrap(), vec![b]);
            assert_eq!(oracle.neighbors(b).await.unwrap(), vec![a]);
            assert_eq!(sender.neighbors().await.unwrap(), vec![b]);

            // Oversized messages are rejected
            let result = sender.dispatch(b, Blob(4096)).await;
            assert!(matches!(result, Err(Error::MessageTooLarge(4096))));
        });
    }

    #[test]
    fn test_metrics() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let mut oracle = new_network(&context);
            let (a, b) = (PeerId::new(0), PeerId::new(1));
            let (mut sender, _) = oracle
                .register(a, Channel::new(10), Channel::new(10))
                .await
                .unwrap();
            let (_, mut receiver) = oracle
                .register(b, Channel::new(10), Channel::new(10))
                .await
                .unwrap();
            oracle.connect(a, b).await.unwrap();
            sender.send(b, Blob(30)).await.unwrap();
            receiver.recv().await.unwrap();

            let encoded = context.encode();
            assert!(encoded.contains("network_bytes_sent_total 30"));
            assert!(encoded
                .contains(r#"network_messages_sent_total{origin="peer-0",recipient="peer-1"} 1"#));
        });
    }
}
