//! Implementation of a `simulated` network.

use super::{
    bandwidth::{apply_charge, compute_charge, Channel},
    ingress::{self, Inbox, Oracle},
    metrics, Error,
};
use crate::{Payload, PeerId};
use futures::{
    channel::{mpsc, oneshot},
    SinkExt, StreamExt,
};
use keysim_runtime::{Clock, Handle, Metrics, Spawner, SystemTimeExt};
use prometheus_client::metrics::{counter::Counter, family::Family};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    time::SystemTime,
};
use tracing::{debug, trace};

/// Configuration for a `simulated` network.
#[derive(Clone, Debug)]
pub struct Config {
    /// Maximum size of a message that can be sent over the network.
    pub max_size: usize,
}

/// Link and attachments of a registered peer.
struct Peer<M> {
    uplink: Channel,
    downlink: Channel,
    neighbors: BTreeSet<PeerId>,
    inboxes: Vec<mpsc::UnboundedSender<(PeerId, M)>>,
}

/// Implementation of a `simulated` network.
pub struct Network<E: Spawner + Clock + Metrics, M: Payload> {
    context: E,
    max_size: usize,

    sender: mpsc::UnboundedSender<ingress::Message<M>>,
    receiver: mpsc::UnboundedReceiver<ingress::Message<M>>,

    peers: BTreeMap<PeerId, Peer<M>>,
    transmissions: BTreeMap<(PeerId, PeerId), usize>,

    sent_messages: Family<metrics::Message, Counter>,
    delivered_messages: Family<metrics::Message, Counter>,
    sent_bytes: Counter,
}

impl<E: Spawner + Clock + Metrics, M: Payload> Network<E, M> {
    /// Create a new simulated network with a given runtime and configuration.
    ///
    /// Returns a tuple containing the network instance and the oracle that can
    /// be used to modify the state of the network during context.
    pub fn new(context: E, cfg: Config) -> (Self, Oracle<E, M>) {
        let (sender, receiver) = mpsc::unbounded();
        let sent_messages = Family::<metrics::Message, Counter>::default();
        let delivered_messages = Family::<metrics::Message, Counter>::default();
        let sent_bytes = Counter::default();
        context.register("messages_sent", "messages sent", sent_messages.clone());
        context.register(
            "messages_delivered",
            "messages delivered",
            delivered_messages.clone(),
        );
        context.register("bytes_sent", "bytes sent", sent_bytes.clone());

        let oracle = Oracle::new(context.clone(), sender.clone());
        (
            Self {
                context,
                max_size: cfg.max_size,
                sender,
                receiver,
                peers: BTreeMap::new(),
                transmissions: BTreeMap::new(),
                sent_messages,
                delivered_messages,
                sent_bytes,
            },
            oracle,
        )
    }

    /// Run the simulated network.
    ///
    /// It is not necessary to invoke this method before modifying the network topology, however,
    /// no messages will be sent until this method is called.
    pub fn start(self) -> Handle<()> {
        self.context.clone().spawn(|_| self.run())
    }

    async fn run(mut self) {
        while let Some(message) = self.receiver.next().await {
            match message {
                ingress::Message::Register {
                    peer,
                    uplink,
                    downlink,
                    result,
                } => {
                    let _ = result.send(self.register(peer, uplink, downlink));
                }
                ingress::Message::Attach { peer, result } => {
                    let _ = result.send(self.attach(peer));
                }
                ingress::Message::Connect { a, b, result } => {
                    let _ = result.send(self.connect(a, b));
                }
                ingress::Message::Neighbors { peer, result } => {
                    let neighbors = self
                        .peers
                        .get(&peer)
                        .map(|p| p.neighbors.iter().copied().collect())
                        .ok_or(Error::UnknownPeer(peer));
                    let _ = result.send(neighbors);
                }
                ingress::Message::Channels { peer, result } => {
                    let now = self.context.current();
                    let channels = self
                        .peers
                        .get_mut(&peer)
                        .map(|p| {
                            p.uplink.prune(now);
                            p.downlink.prune(now);
                            (p.uplink.clone(), p.downlink.clone())
                        })
                        .ok_or(Error::UnknownPeer(peer));
                    let _ = result.send(channels);
                }
                ingress::Message::Dispatch {
                    origin,
                    recipient,
                    message,
                    result,
                } => {
                    let _ = result.send(self.dispatch(origin, recipient, message));
                }
                ingress::Message::Busy { a, b, result } => {
                    let _ = result.send(self.busy(a, b));
                }
                ingress::Message::Deliver {
                    origin,
                    recipient,
                    message,
                } => {
                    self.deliver(origin, recipient, message);
                }
            }
        }
    }

    fn register(
        &mut self,
        peer: PeerId,
        uplink: Channel,
        downlink: Channel,
    ) -> Result<Inbox<M>, Error> {
        if self.peers.contains_key(&peer) {
            return Err(Error::AlreadyRegistered(peer));
        }
        let (sender, receiver) = mpsc::unbounded();
        self.peers.insert(
            peer,
            Peer {
                uplink,
                downlink,
                neighbors: BTreeSet::new(),
                inboxes: vec![sender],
            },
        );
        debug!(%peer, "registered peer");
        Ok(receiver)
    }

    fn attach(&mut self, peer: PeerId) -> Result<Inbox<M>, Error> {
        let entry = self.peers.get_mut(&peer).ok_or(Error::UnknownPeer(peer))?;
        let (sender, receiver) = mpsc::unbounded();
        entry.inboxes.push(sender);
        Ok(receiver)
    }

    fn connect(&mut self, a: PeerId, b: PeerId) -> Result<(), Error> {
        if a == b {
            return Err(Error::LinkingSelf);
        }
        if !self.peers.contains_key(&b) {
            return Err(Error::UnknownPeer(b));
        }
        let first = self.peers.get_mut(&a).ok_or(Error::UnknownPeer(a))?;
        if !first.neighbors.insert(b) {
            return Ok(());
        }
        if let Some(second) = self.peers.get_mut(&b) {
            second.neighbors.insert(a);
        }
        debug!(%a, %b, "connected peers");
        Ok(())
    }

    fn busy(&self, a: PeerId, b: PeerId) -> bool {
        self.transmissions.contains_key(&(a, b)) || self.transmissions.contains_key(&(b, a))
    }

    fn dispatch(
        &mut self,
        origin: PeerId,
        recipient: PeerId,
        message: M,
    ) -> Result<SystemTime, Error> {
        // Ensure message can be carried
        let size = message.size();
        if size > self.max_size {
            return Err(Error::MessageTooLarge(size));
        }
        let sender = self.peers.get(&origin).ok_or(Error::UnknownPeer(origin))?;
        if !sender.neighbors.contains(&recipient) {
            return Err(Error::NotConnected(origin, recipient));
        }
        let receiver = self
            .peers
            .get(&recipient)
            .ok_or(Error::UnknownPeer(recipient))?;

        // Reserve bandwidth on the sender's uplink and the recipient's downlink
        let now = self.context.current();
        let charge = compute_charge(size, &[&sender.uplink, &receiver.downlink], now)?;
        let uplink = apply_charge(&sender.uplink, &charge)
            .expect("charge exceeds availability of sender uplink");
        let downlink = apply_charge(&receiver.downlink, &charge)
            .expect("charge exceeds availability of recipient downlink");
        if let Some(sender) = self.peers.get_mut(&origin) {
            sender.uplink = uplink;
        }
        if let Some(receiver) = self.peers.get_mut(&recipient) {
            receiver.downlink = downlink;
        }

        // Record metrics
        self.sent_messages
            .get_or_create(&metrics::Message::new(&origin, &recipient))
            .inc();
        self.sent_bytes.inc_by(size as u64);

        // Schedule delivery
        let completion = charge.completion();
        *self.transmissions.entry((origin, recipient)).or_default() += 1;
        trace!(
            %origin,
            %recipient,
            size,
            start = ?now.epoch(),
            completion = ?completion.epoch(),
            "scheduled message"
        );
        let mut mailbox = self.sender.clone();
        self.context
            .with_label("messenger")
            .spawn(move |context| async move {
                context.sleep_until(completion).await;
                let _ = mailbox
                    .send(ingress::Message::Deliver {
                        origin,
                        recipient,
                        message,
                    })
                    .await;
            });
        Ok(completion)
    }

    fn deliver(&mut self, origin: PeerId, recipient: PeerId, message: M) {
        // Mark the transmission as complete
        if let Some(count) = self.transmissions.get_mut(&(origin, recipient)) {
            *count -= 1;
            if *count == 0 {
                self.transmissions.remove(&(origin, recipient));
            }
        }

        // Fan out to every service attached to the recipient
        let Some(peer) = self.peers.get_mut(&recipient) else {
            return;
        };
        peer.inboxes
            .retain(|inbox| inbox.unbounded_send((origin, message.clone())).is_ok());
        self.delivered_messages
            .get_or_create(&metrics::Message::new(&origin, &recipient))
            .inc();
        trace!(%origin, %recipient, "delivered message");
    }
}

/// Implementation of a [crate::Sender] for the `simulated` network.
pub struct Sender<E: Clock, M: Payload> {
    context: E,
    me: PeerId,
    sender: mpsc::UnboundedSender<ingress::Message<M>>,
}

impl<E: Clock, M: Payload> Sender<E, M> {
    pub(crate) fn new(
        context: E,
        me: PeerId,
        sender: mpsc::UnboundedSender<ingress::Message<M>>,
    ) -> Self {
        Self {
            context,
            me,
            sender,
        }
    }

    /// Returns the identity of the sending peer.
    pub fn me(&self) -> PeerId {
        self.me
    }
}

impl<E: Clock, M: Payload> Clone for Sender<E, M> {
    fn clone(&self) -> Self {
        Self {
            context: self.context.clone(),
            me: self.me,
            sender: self.sender.clone(),
        }
    }
}

impl<E: Clock, M: Payload> fmt::Debug for Sender<E, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender").field("me", &self.me).finish()
    }
}

impl<E: Clock, M: Payload> crate::Sender for Sender<E, M> {
    type Error = Error;
    type Message = M;

    async fn dispatch(&mut self, recipient: PeerId, message: M) -> Result<SystemTime, Error> {
        let (s, r) = oneshot::channel();
        self.sender
            .send(ingress::Message::Dispatch {
                origin: self.me,
                recipient,
                message,
                result: s,
            })
            .await
            .map_err(|_| Error::NetworkClosed)?;
        r.await.map_err(|_| Error::NetworkClosed)?
    }

    async fn send(&mut self, recipient: PeerId, message: M) -> Result<SystemTime, Error> {
        let completion = self.dispatch(recipient, message).await?;
        self.context.sleep_until(completion).await;
        Ok(completion)
    }

    async fn busy(&mut self, peer: PeerId) -> Result<bool, Error> {
        let (s, r) = oneshot::channel();
        self.sender
            .send(ingress::Message::Busy {
                a: self.me,
                b: peer,
                result: s,
            })
            .await
            .map_err(|_| Error::NetworkClosed)?;
        r.await.map_err(|_| Error::NetworkClosed)
    }

    async fn neighbors(&mut self) -> Result<Vec<PeerId>, Error> {
        let (s, r) = oneshot::channel();
        self.sender
            .send(ingress::Message::Neighbors {
                peer: self.me,
                result: s,
            })
            .await
            .map_err(|_| Error::NetworkClosed)?;
        r.await.map_err(|_| Error::NetworkClosed)?
    }
}

/// Implementation of a [crate::Receiver] for the `simulated` network.
#[derive(Debug)]
pub struct Receiver<M: Payload> {
    receiver: Inbox<M>,
}

impl<M: Payload> Receiver<M> {
    pub(crate) fn new(receiver: Inbox<M>) -> Self {
        Self { receiver }
    }
}

impl<M: Payload> crate::Receiver for Receiver<M> {
    type Error = Error;
    type Message = M;

    async fn recv(&mut self) -> Result<(PeerId, M), Error> {
        self.receiver.next().await.ok_or(Error::NetworkClosed)
    }
}
