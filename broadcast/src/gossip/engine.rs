use super::{
    ingress::{Inventory, Mailbox, Message},
    metrics::{self, StatusLabel},
    store::{self, Store},
    wire, Config,
};
use crate::{Block, Digest, Item, Kind};
use futures::{
    channel::{mpsc, oneshot},
    pin_mut, select_biased, FutureExt, StreamExt,
};
use keysim_p2p::{PeerId, Receiver, Sender};
use keysim_runtime::{Clock, Handle, Metrics, Spawner};
use rand::Rng;
use std::{
    collections::{BTreeMap, BTreeSet},
    time::{Duration, SystemTime},
};
use tracing::{debug, error, trace, warn};

/// A local service waiting for items.
struct Waiter {
    /// Kinds of items the service is interested in.
    kinds: BTreeSet<Kind>,

    /// Block the items must belong to (if any).
    block: Option<Block>,

    /// Items the service already has.
    exclude: BTreeSet<Digest>,

    /// The responder to send matching items to.
    responder: oneshot::Sender<BTreeSet<Item>>,
}

/// Outcome of waiting on the engine's inputs.
enum Event<N> {
    Mailbox(Option<Message>),
    Network(N),
    Round,
}

/// Instance of the main engine for the module.
///
/// It is responsible for:
/// - Accepting items from local services
/// - Announcing held items to each neighbor once per interval
/// - Requesting announced items it does not hold
/// - Answering requests from neighbors
/// - Notifying local services when matching items arrive
pub struct Engine<E: Clock + Spawner + Metrics + Rng> {
    ////////////////////////////////////////
    // Interfaces
    ////////////////////////////////////////
    context: E,

    ////////////////////////////////////////
    // Configuration
    ////////////////////////////////////////
    /// My identity
    public_key: PeerId,

    /// Interval between rounds with each neighbor
    resend_interval: Duration,

    ////////////////////////////////////////
    // Messaging
    ////////////////////////////////////////
    /// The mailbox for receiving messages.
    mailbox_receiver: mpsc::Receiver<Message>,

    /// Pending requests from local services.
    waiters: Vec<Waiter>,

    ////////////////////////////////////////
    // State
    ////////////////////////////////////////
    /// Items known to the participant.
    store: Store,

    /// Time of the next round with each neighbor.
    rounds: BTreeMap<PeerId, SystemTime>,

    /// Time at which the announcement sent to each neighbor this round is delivered (and the
    /// round continues with a request).
    announced: BTreeMap<PeerId, SystemTime>,

    /// Time at which neighbors are next looked up.
    next_refresh: SystemTime,

    ////////////////////////////////////////
    // Metrics
    ////////////////////////////////////////
    /// Metrics
    metrics: metrics::Metrics,
}

impl<E: Clock + Spawner + Metrics + Rng> Engine<E> {
    /// Creates a new engine with the given context and configuration.
    /// Returns the engine and a mailbox for sending messages to the engine.
    pub fn new(context: E, cfg: Config) -> (Self, Mailbox) {
        let (mailbox_sender, mailbox_receiver) = mpsc::channel(cfg.mailbox_size);
        let mailbox = Mailbox::new(mailbox_sender);
        let metrics = metrics::Metrics::init(context.clone());
        let next_refresh = context.current();

        let result = Self {
            context,
            public_key: cfg.public_key,
            resend_interval: cfg.resend_interval,
            mailbox_receiver,
            waiters: Vec::new(),
            store: Store::default(),
            rounds: BTreeMap::new(),
            announced: BTreeMap::new(),
            next_refresh,
            metrics,
        };

        (result, mailbox)
    }

    /// Starts the engine with the given network.
    pub fn start(
        self,
        network: (
            impl Sender<Message = wire::Message>,
            impl Receiver<Message = wire::Message>,
        ),
    ) -> Handle<()> {
        self.context.clone().spawn(|_| self.run(network))
    }

    /// Inner run loop called by `start`.
    async fn run<S, R>(mut self, network: (S, R))
    where
        S: Sender<Message = wire::Message>,
        R: Receiver<Message = wire::Message>,
    {
        let (mut sender, mut receiver) = network;
        self.refresh(&mut sender).await;

        loop {
            // Cleanup waiters
            self.cleanup_waiters();
            self.metrics.waiters.set(self.waiters.len() as i64);

            // Wake for the earliest step due with any neighbor (or to look for neighbors again)
            let deadline = self
                .rounds
                .values()
                .chain(self.announced.values())
                .fold(self.next_refresh, |earliest, at| earliest.min(*at));

            let event = {
                let round = self.context.sleep_until(deadline).fuse();
                let network = receiver.recv().fuse();
                pin_mut!(round, network);
                select_biased! {
                    mail = self.mailbox_receiver.next() => Event::Mailbox(mail),
                    msg = network => Event::Network(msg),
                    _ = round => Event::Round,
                }
            };

            match event {
                Event::Mailbox(None) => {
                    error!("mailbox receiver failed");
                    break;
                }
                Event::Mailbox(Some(Message::Distribute { item })) => {
                    trace!(%item, "mailbox: distribute");
                    self.handle_distribute(item);
                }
                Event::Mailbox(Some(Message::Subscribe {
                    kinds,
                    block,
                    exclude,
                    responder,
                })) => {
                    trace!("mailbox: subscribe");
                    self.handle_subscribe(kinds, block, exclude, responder);
                }
                Event::Mailbox(Some(Message::Inventory { responder })) => {
                    self.cleanup_waiters();
                    let _ = responder.send(self.inventory());
                }
                Event::Network(Err(err)) => {
                    error!(?err, "receiver failed");
                    break;
                }
                Event::Network(Ok((peer, msg))) => {
                    self.handle_network(&mut sender, peer, msg).await;
                }
                Event::Round => {
                    self.gossip(&mut sender).await;
                }
            }
        }
    }

    ////////////////////////////////////////
    // Handling
    ////////////////////////////////////////

    /// Handles an item created by a local service.
    fn handle_distribute(&mut self, item: Item) {
        if !self.store.insert(item.clone()) {
            trace!(%item, "ignoring known item");
            return;
        }
        debug!(me = %self.public_key, %item, "distributing item");
        self.notify_waiters(&[item]);
    }

    /// Handles a request for items from a local service.
    fn handle_subscribe(
        &mut self,
        kinds: BTreeSet<Kind>,
        block: Option<Block>,
        exclude: BTreeSet<Digest>,
        responder: oneshot::Sender<BTreeSet<Item>>,
    ) {
        let items = self.store.matching(&kinds, block, &exclude);
        if !items.is_empty() {
            let _ = responder.send(items);
            return;
        }
        self.waiters.push(Waiter {
            kinds,
            block,
            exclude,
            responder,
        });
    }

    /// Handles a message from a neighbor.
    async fn handle_network<S: Sender<Message = wire::Message>>(
        &mut self,
        sender: &mut S,
        peer: PeerId,
        msg: wire::Message,
    ) {
        match msg {
            wire::Message::Announce(items) => {
                let count = items.len();
                let new = self.store.announced(peer, items);
                trace!(%peer, count, new, "received announcement");
            }
            wire::Message::Request(digests) => {
                let items = self.store.requested(&digests);
                if items.is_empty() {
                    trace!(%peer, "nothing to reply with");
                    return;
                }
                let count = items.len();
                match sender.dispatch(peer, wire::Message::Send(items)).await {
                    Ok(_) => {
                        self.metrics.replies.inc();
                        trace!(%peer, count, "replied to request");
                    }
                    Err(err) => warn!(?err, %peer, "failed to reply to request"),
                }
            }
            wire::Message::Send(items) => {
                let count = items.len();
                let new = self.store.received(peer, items);
                self.metrics
                    .received
                    .get_or_create(&StatusLabel::NEW)
                    .inc_by(new.len() as u64);
                self.metrics
                    .received
                    .get_or_create(&StatusLabel::DUPLICATE)
                    .inc_by((count - new.len()) as u64);
                if new.is_empty() {
                    return;
                }
                debug!(me = %self.public_key, %peer, new = new.len(), "fetched items");
                self.notify_waiters(&new);
            }
        }
    }

    ////////////////////////////////////////
    // Gossip
    ////////////////////////////////////////

    /// Schedules a first round with any neighbor not seen before (and when to look again).
    ///
    /// The first round is jittered by up to one interval so that neighbors do not all announce
    /// at the same time.
    async fn refresh<S: Sender<Message = wire::Message>>(&mut self, sender: &mut S) {
        self.next_refresh = self.context.current() + self.resend_interval;
        let neighbors = match sender.neighbors().await {
            Ok(neighbors) => neighbors,
            Err(err) => {
                warn!(?err, "failed to fetch neighbors");
                return;
            }
        };
        let now = self.context.current();
        let interval = self.resend_interval.as_nanos() as u64;
        for neighbor in neighbors {
            if self.rounds.contains_key(&neighbor) {
                continue;
            }
            let jitter = Duration::from_nanos(self.context.gen_range(0..=interval));
            self.rounds.insert(neighbor, now + jitter);
        }
    }

    /// Runs every step that is due: looking up neighbors, requests following a delivered
    /// announcement and new rounds.
    async fn gossip<S: Sender<Message = wire::Message>>(&mut self, sender: &mut S) {
        let now = self.context.current();
        if self.next_refresh <= now {
            self.refresh(sender).await;
        }

        let delivered: Vec<PeerId> = self
            .announced
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(neighbor, _)| *neighbor)
            .collect();
        for neighbor in delivered {
            self.announced.remove(&neighbor);
            self.request(sender, neighbor).await;
        }

        let due: Vec<PeerId> = self
            .rounds
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(neighbor, _)| *neighbor)
            .collect();
        for neighbor in due {
            self.rounds.insert(neighbor, now + self.resend_interval);
            self.round(sender, neighbor).await;
        }
    }

    /// Announces new items to a neighbor and, once the announcement is delivered, requests the
    /// items it has that we are missing.
    ///
    /// Nothing is sent while a message is in flight between us and the neighbor.
    async fn round<S: Sender<Message = wire::Message>>(
        &mut self,
        sender: &mut S,
        neighbor: PeerId,
    ) {
        if self.announced.contains_key(&neighbor) {
            return;
        }
        let unannounced = self.store.unannounced(&neighbor);
        if unannounced.is_empty() {
            self.request(sender, neighbor).await;
            return;
        }
        if self.busy(sender, neighbor).await {
            return;
        }
        let digests: Vec<Digest> = unannounced.iter().map(Item::digest).collect();
        let count = unannounced.len();
        match sender
            .dispatch(neighbor, wire::Message::Announce(unannounced))
            .await
        {
            Ok(delivery) => {
                // Assume the neighbor will fetch what it lacks
                self.store.mark(neighbor, digests);
                self.metrics.announcements.inc();
                self.announced.insert(neighbor, delivery);
                trace!(%neighbor, count, "announced items");
            }
            Err(err) => warn!(?err, %neighbor, "failed to announce items"),
        }
    }

    /// Requests the items a neighbor announced that we are missing.
    async fn request<S: Sender<Message = wire::Message>>(
        &mut self,
        sender: &mut S,
        neighbor: PeerId,
    ) {
        let missing = self.store.missing(&neighbor);
        if missing.is_empty() || self.busy(sender, neighbor).await {
            return;
        }
        let count = missing.len();
        match sender
            .dispatch(neighbor, wire::Message::Request(missing))
            .await
        {
            Ok(_) => {
                self.metrics.requests.inc();
                trace!(%neighbor, count, "requested items");
            }
            Err(err) => warn!(?err, %neighbor, "failed to request items"),
        }
    }

    /// Returns whether a message is in flight between us and the neighbor.
    async fn busy<S: Sender<Message = wire::Message>>(
        &mut self,
        sender: &mut S,
        neighbor: PeerId,
    ) -> bool {
        let busy = match sender.busy(neighbor).await {
            Ok(busy) => busy,
            Err(err) => {
                warn!(?err, %neighbor, "failed to check link");
                true
            }
        };
        if busy {
            self.metrics.busy.inc();
            trace!(%neighbor, "link busy");
        }
        busy
    }

    ////////////////////////////////////////
    // Waiters
    ////////////////////////////////////////

    /// Answers every waiter interested in any of the newly held items.
    fn notify_waiters(&mut self, items: &[Item]) {
        let waiters = std::mem::take(&mut self.waiters);
        for waiter in waiters {
            let matching: BTreeSet<Item> = items
                .iter()
                .filter(|item| {
                    store::matches(item, &waiter.kinds, waiter.block)
                        && !waiter.exclude.contains(&item.digest())
                })
                .cloned()
                .collect();
            if matching.is_empty() {
                self.waiters.push(waiter);
                continue;
            }
            let _ = waiter.responder.send(matching);
        }
    }

    /// Remove all waiters that have been canceled.
    fn cleanup_waiters(&mut self) {
        self.waiters.retain(|waiter| !waiter.responder.is_canceled());
    }

    /// Returns a snapshot of the engine's state.
    fn inventory(&self) -> Inventory {
        Inventory {
            known: self.store.known(),
            fetched: self.store.fetched(),
            waiters: self.waiters.len(),
            announcements: self.metrics.announcements.get(),
            requests: self.metrics.requests.get(),
            replies: self.metrics.replies.get(),
        }
    }
}
