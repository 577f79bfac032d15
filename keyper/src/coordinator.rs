use crate::{metrics, protocol::Protocol, Error};
use futures::channel::mpsc;
use keysim_broadcast::{Block, Digest, Distributor, Item, Kind};
use keysim_p2p::PeerId;
use keysim_runtime::{Clock, Handle, Metrics, Spawner, SystemTimeExt};
use rand::Rng;
use std::{
    collections::BTreeSet,
    time::{Duration, SystemTime},
};
use tracing::{debug, error, info};

/// Kinds of items that contribute to the handshake.
const CONTRIBUTIONS: [Kind; 3] = [Kind::SecretShare, Kind::Witness, Kind::Nonce];

/// Configuration for the [Coordinator].
#[derive(Clone, Debug)]
pub struct Config {
    /// Our identity.
    pub public_key: PeerId,

    /// Every keyper (including ourselves).
    pub keypers: BTreeSet<PeerId>,

    /// Number of key shares required to encrypt or decrypt.
    ///
    /// Key generation itself always waits for every other keyper.
    pub threshold: usize,

    /// Upper bound on the random delay before starting the first block.
    pub max_jitter: Duration,
}

/// Summary of a finished block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Finished {
    /// The keyper that finished the block.
    pub keyper: PeerId,
    /// The finished block.
    pub block: Block,
    /// Time at which the block was finished.
    pub at: SystemTime,
    /// Distinct senders of secret shares addressed to the keyper.
    pub shares: usize,
    /// Distinct senders of witnesses.
    pub witnesses: usize,
    /// Distinct senders of nonces.
    pub nonces: usize,
}

/// Drives the handshake through consecutive blocks.
pub struct Coordinator<E: Clock + Spawner + Metrics + Rng, D: Distributor> {
    context: E,
    distributor: D,

    public_key: PeerId,
    keypers: BTreeSet<PeerId>,
    threshold: usize,
    max_jitter: Duration,

    /// Handshake for the current block.
    protocol: Protocol,

    /// Items of the current block already processed.
    seen: BTreeSet<Digest>,

    reports: mpsc::UnboundedSender<Finished>,
    metrics: metrics::Metrics,
}

impl<E: Clock + Spawner + Metrics + Rng, D: Distributor> Coordinator<E, D> {
    /// Create a new coordinator that exchanges contributions over `distributor`.
    ///
    /// Returns the coordinator and a stream of finished blocks.
    pub fn new(
        context: E,
        distributor: D,
        cfg: Config,
    ) -> (Self, mpsc::UnboundedReceiver<Finished>) {
        let (reports, receiver) = mpsc::unbounded();
        let metrics = metrics::Metrics::init(context.clone());
        let protocol = Protocol::new(cfg.public_key, 0, &cfg.keypers);
        (
            Self {
                context,
                distributor,
                public_key: cfg.public_key,
                keypers: cfg.keypers,
                threshold: cfg.threshold,
                max_jitter: cfg.max_jitter,
                protocol,
                seen: BTreeSet::new(),
                reports,
                metrics,
            },
            receiver,
        )
    }

    /// Start the coordinator.
    pub fn start(self) -> Handle<()> {
        self.context.clone().spawn(|_| self.run())
    }

    async fn run(mut self) {
        if let Err(err) = self.drive().await {
            error!(
                me = %self.public_key,
                block = self.protocol.block(),
                ?err,
                "coordinator failed"
            );
        }
    }

    async fn drive(&mut self) -> Result<(), Error> {
        // Stagger startup
        let jitter = self.max_jitter.as_nanos() as u64;
        if jitter > 0 {
            let delay = Duration::from_nanos(self.context.gen_range(0..jitter));
            self.context.sleep(delay).await;
        }
        self.kickoff(0).await?;

        loop {
            let block = self.protocol.block();
            let items = self
                .distributor
                .get_items(&CONTRIBUTIONS, Some(block), &self.seen)
                .await?;
            for item in items {
                self.seen.insert(item.digest());
                if item.sender() == Some(self.public_key) {
                    continue;
                }
                if self.record(&item)? && self.progress().await? {
                    // Remaining items belong to the finished block
                    break;
                }
            }
        }
    }

    /// Start the handshake for `block`.
    async fn kickoff(&mut self, block: Block) -> Result<(), Error> {
        self.protocol = Protocol::new(self.public_key, block, &self.keypers);
        self.seen.clear();
        self.metrics.block.set(block as i64);

        let others: Vec<PeerId> = self.protocol.others().iter().copied().collect();
        for receiver in others {
            self.distributor
                .distribute(Item::SecretShare {
                    block,
                    sender: self.public_key,
                    receiver,
                })
                .await?;
        }
        self.distributor
            .distribute(Item::Witness {
                block,
                sender: self.public_key,
            })
            .await?;
        info!(
            me = %self.public_key,
            block,
            time = ?self.context.current().epoch(),
            "kicked off block"
        );
        Ok(())
    }

    /// Record a contribution, returning whether it was new.
    fn record(&mut self, item: &Item) -> Result<bool, Error> {
        if !self.protocol.record(item)? {
            return Ok(false);
        }
        match item.kind() {
            Kind::SecretShare => self.metrics.shares.inc(),
            Kind::Witness => self.metrics.witnesses.inc(),
            _ => self.metrics.nonces.inc(),
        };
        debug!(
            me = %self.public_key,
            %item,
            phase = ?self.protocol.phase(),
            "recorded contribution"
        );
        Ok(true)
    }

    /// Publish our nonce or advance to the next block if possible, returning whether we advanced.
    async fn progress(&mut self) -> Result<bool, Error> {
        let block = self.protocol.block();
        if self.protocol.publish_nonce() {
            self.distributor
                .distribute(Item::Nonce {
                    block,
                    sender: self.public_key,
                })
                .await?;
            debug!(me = %self.public_key, block, "published nonce");
        }
        if !self.protocol.nonce_collection_finished() {
            return Ok(false);
        }

        // Publish our share of the encryption key
        self.distributor
            .distribute(Item::EncKeyShare {
                block,
                sender: self.public_key,
            })
            .await?;
        let at = self.context.current();
        let (shares, witnesses, nonces) = self.protocol.counts();
        let _ = self.reports.unbounded_send(Finished {
            keyper: self.public_key,
            block,
            at,
            shares,
            witnesses,
            nonces,
        });
        self.metrics.finished.inc();
        info!(
            me = %self.public_key,
            block,
            threshold = self.threshold,
            time = ?at.epoch(),
            "finished block"
        );
        self.kickoff(block + 1).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::collections::BTreeMap;
    use keysim_broadcast::gossip::{self, Engine, Mailbox};
    use keysim_p2p::simulated::{self, Channel, Network};
    use keysim_runtime::{deterministic, Runner};

    const CAPACITY: u64 = 10_000;

    /// Start a fully connected network of `peers` gossip engines.
    async fn setup(context: &deterministic::Context, peers: u32) -> Vec<Mailbox> {
        let (network, mut oracle) = Network::new(
            context.with_label("network"),
            simulated::Config {
                max_size: 1024 * 1024,
            },
        );
        network.start();

        let mut networks = Vec::new();
        for i in 0..peers {
            let peer = PeerId::new(i);
            let network = oracle
                .register(peer, Channel::new(CAPACITY), Channel::new(CAPACITY))
                .await
                .unwrap();
            networks.push((peer, network));
        }
        for a in 0..peers {
            for b in (a + 1)..peers {
                oracle
                    .connect(PeerId::new(a), PeerId::new(b))
                    .await
                    .unwrap();
            }
        }

        let mut mailboxes = Vec::new();
        for (peer, network) in networks {
            let (engine, mailbox) = Engine::new(
                context.with_label(&format!("distributor_{}", peer.get())),
                gossip::Config {
                    public_key: peer,
                    mailbox_size: 1024,
                    resend_interval: Duration::from_millis(100),
                },
            );
            engine.start(network);
            mailboxes.push(mailbox);
        }
        mailboxes
    }

    /// Start a coordinator for each of the first `keypers` mailboxes.
    fn start_coordinators(
        context: &deterministic::Context,
        mailboxes: &[Mailbox],
        keypers: u32,
    ) -> Vec<mpsc::UnboundedReceiver<Finished>> {
        let set: BTreeSet<PeerId> = (0..keypers).map(PeerId::new).collect();
        let mut reports = Vec::new();
        for i in 0..keypers {
            let (coordinator, receiver) = Coordinator::new(
                context.with_label(&format!("keyper_{i}")),
                mailboxes[i as usize].clone(),
                Config {
                    public_key: PeerId::new(i),
                    keypers: set.clone(),
                    threshold: 2,
                    max_jitter: Duration::from_millis(500),
                },
            );
            coordinator.start();
            reports.push(receiver);
        }
        reports
    }

    #[test]
    fn test_keypers_advance_through_blocks() {
        let runner = deterministic::Runner::timed(Duration::from_secs(120));
        runner.start(|context| async move {
            let mailboxes = setup(&context, 3).await;
            let mut reports = start_coordinators(&context, &mailboxes, 3);

            for (i, receiver) in reports.iter_mut().enumerate() {
                let mut last = None;
                for block in 0..3 {
                    let finished = receiver.next().await.unwrap();
                    assert_eq!(finished.keyper, PeerId::new(i as u32));
                    assert_eq!(finished.block, block);
                    assert_eq!(
                        (finished.shares, finished.witnesses, finished.nonces),
                        (2, 2, 2)
                    );
                    if let Some(last) = last {
                        assert!(finished.at >= last);
                    }
                    last = Some(finished.at);
                }
            }

            // Each keyper published one share per other keyper and a single witness, nonce and
            // encryption key share for block 0
            context.sleep(Duration::from_secs(5)).await;
            let mut mailbox = mailboxes[0].clone();
            let items = mailbox
                .get_items(
                    &[
                        Kind::SecretShare,
                        Kind::Witness,
                        Kind::Nonce,
                        Kind::EncKeyShare,
                    ],
                    Some(0),
                    &BTreeSet::new(),
                )
                .await
                .unwrap();
            let mut published: BTreeMap<(PeerId, Kind), BTreeSet<Option<PeerId>>> =
                BTreeMap::new();
            for item in &items {
                let sender = item.sender().unwrap();
                published
                    .entry((sender, item.kind()))
                    .or_default()
                    .insert(item.receiver());
            }
            for i in 0..3 {
                let sender = PeerId::new(i);
                let others: BTreeSet<_> = (0..3)
                    .filter(|j| *j != i)
                    .map(|j| Some(PeerId::new(j)))
                    .collect();
                assert_eq!(published[&(sender, Kind::SecretShare)], others);
                for kind in [Kind::Witness, Kind::Nonce, Kind::EncKeyShare] {
                    assert_eq!(published[&(sender, kind)], BTreeSet::from([None]));
                }
            }
            assert_eq!(items.len(), 3 * (2 + 3));
        });
    }

    #[test]
    fn test_forged_contributions() {
        let runner = deterministic::Runner::timed(Duration::from_secs(120));
        runner.start(|context| async move {
            // Peer 3 is not a keyper
            let mut mailboxes = setup(&context, 4).await;
            let adversary = &mut mailboxes[3];
            for block in 0..2 {
                // Contributions attributed to keypers (including duplicates)
                for _ in 0..2 {
                    adversary
                        .distribute(Item::Witness {
                            block,
                            sender: PeerId::new(0),
                        })
                        .await
                        .unwrap();
                }
                adversary
                    .distribute(Item::SecretShare {
                        block,
                        sender: PeerId::new(1),
                        receiver: PeerId::new(2),
                    })
                    .await
                    .unwrap();

                // Contributions from an outsider
                adversary
                    .distribute(Item::Nonce {
                        block,
                        sender: PeerId::new(3),
                    })
                    .await
                    .unwrap();
                adversary
                    .distribute(Item::SecretShare {
                        block,
                        sender: PeerId::new(3),
                        receiver: PeerId::new(0),
                    })
                    .await
                    .unwrap();
            }

            let mut reports = start_coordinators(&context, &mailboxes, 3);
            for receiver in reports.iter_mut() {
                for block in 0..2 {
                    assert_eq!(receiver.next().await.unwrap().block, block);
                }
            }
        });
    }
}
