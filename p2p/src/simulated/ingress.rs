use super::{bandwidth::Channel, network::Receiver, network::Sender, Error};
use crate::{Payload, PeerId};
use futures::{
    channel::{mpsc, oneshot},
    SinkExt,
};
use keysim_runtime::Clock;
use std::time::SystemTime;

/// Inbox of a service attached to a peer.
pub(crate) type Inbox<M> = mpsc::UnboundedReceiver<(PeerId, M)>;

pub enum Message<M: Payload> {
    Register {
        peer: PeerId,
        uplink: Channel,
        downlink: Channel,
        result: oneshot::Sender<Result<Inbox<M>, Error>>,
    },
    Attach {
        peer: PeerId,
        result: oneshot::Sender<Result<Inbox<M>, Error>>,
    },
    Connect {
        a: PeerId,
        b: PeerId,
        result: oneshot::Sender<Result<(), Error>>,
    },
    Neighbors {
        peer: PeerId,
        result: oneshot::Sender<Result<Vec<PeerId>, Error>>,
    },
    Channels {
        peer: PeerId,
        result: oneshot::Sender<Result<(Channel, Channel), Error>>,
    },
    Dispatch {
        origin: PeerId,
        recipient: PeerId,
        message: M,
        result: oneshot::Sender<Result<SystemTime, Error>>,
    },
    Busy {
        a: PeerId,
        b: PeerId,
        result: oneshot::Sender<bool>,
    },
    Deliver {
        origin: PeerId,
        recipient: PeerId,
        message: M,
    },
}

/// Interface for modifying the simulated network.
///
/// Peers must be registered before they can be connected and connected before they can
/// exchange messages.
pub struct Oracle<E: Clock, M: Payload> {
    context: E,
    sender: mpsc::UnboundedSender<Message<M>>,
}

impl<E: Clock, M: Payload> Clone for Oracle<E, M> {
    fn clone(&self) -> Self {
        Self {
            context: self.context.clone(),
            sender: self.sender.clone(),
        }
    }
}

impl<E: Clock, M: Payload> Oracle<E, M> {
    /// Create a new instance of the oracle.
    pub(crate) fn new(context: E, sender: mpsc::UnboundedSender<Message<M>>) -> Self {
        Self { context, sender }
    }

    /// Register a new peer with the given uplink and downlink.
    ///
    /// Malformed channels are rejected before the peer can send anything. By default, the peer
    /// will not be connected to any other peers.
    pub async fn register(
        &mut self,
        peer: PeerId,
        uplink: Channel,
        downlink: Channel,
    ) -> Result<(Sender<E, M>, Receiver<M>), Error> {
        uplink.validate()?;
        downlink.validate()?;
        let (s, r) = oneshot::channel();
        self.sender
            .send(Message::Register {
                peer,
                uplink,
                downlink,
                result: s,
            })
            .await
            .map_err(|_| Error::NetworkClosed)?;
        let inbox = r.await.map_err(|_| Error::NetworkClosed)??;
        Ok((
            Sender::new(self.context.clone(), peer, self.sender.clone()),
            Receiver::new(inbox),
        ))
    }

    /// Attach another service to a registered peer.
    ///
    /// Every message delivered to the peer is cloned to all attached services.
    pub async fn attach(&mut self, peer: PeerId) -> Result<Receiver<M>, Error> {
        let (s, r) = oneshot::channel();
        self.sender
            .send(Message::Attach { peer, result: s })
            .await
            .map_err(|_| Error::NetworkClosed)?;
        let inbox = r.await.map_err(|_| Error::NetworkClosed)??;
        Ok(Receiver::new(inbox))
    }

    /// Connect two peers (in both directions).
    ///
    /// Connecting already connected peers is a no-op.
    pub async fn connect(&mut self, a: PeerId, b: PeerId) -> Result<(), Error> {
        let (s, r) = oneshot::channel();
        self.sender
            .send(Message::Connect { a, b, result: s })
            .await
            .map_err(|_| Error::NetworkClosed)?;
        r.await.map_err(|_| Error::NetworkClosed)?
    }

    /// Returns the neighbors of a peer (in ascending order).
    pub async fn neighbors(&mut self, peer: PeerId) -> Result<Vec<PeerId>, Error> {
        let (s, r) = oneshot::channel();
        self.sender
            .send(Message::Neighbors { peer, result: s })
            .await
            .map_err(|_| Error::NetworkClosed)?;
        r.await.map_err(|_| Error::NetworkClosed)?
    }

    /// Returns the current `(uplink, downlink)` of a peer.
    pub async fn channels(&mut self, peer: PeerId) -> Result<(Channel, Channel), Error> {
        let (s, r) = oneshot::channel();
        self.sender
            .send(Message::Channels { peer, result: s })
            .await
            .map_err(|_| Error::NetworkClosed)?;
        r.await.map_err(|_| Error::NetworkClosed)?
    }
}
