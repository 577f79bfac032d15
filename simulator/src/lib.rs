//! Simulate threshold-encryption key generation over a gossip network.
//!
//! A simulation places keypers, users, a collator and validators on a simulated network with
//! finite link capacity (see [keysim_p2p::simulated]), gives each of them a gossip distributor
//! (see [keysim_broadcast::gossip]) and runs their roles for a fixed amount of virtual time:
//!
//! - Keypers run the key generation handshake of [keysim_keyper] for consecutive blocks and
//!   release a decryption key share once a block has been collated.
//! - Users create transactions for the block whose encryption key they are waiting for.
//! - The collator bundles transactions into a collation at a fixed interval.
//! - Validators vote on a block once they hold its collation and enough decryption key shares.
//!
//! The outcome is summarized in a [Report]. Runs are deterministic: the same [Config] (including
//! its seed) always produces the same report.

use futures::channel::mpsc;
use keysim_broadcast::{gossip, Block};
use keysim_p2p::{
    simulated::{self, Channel, Network},
    PeerId,
};
use keysim_runtime::{Clock, Metrics, Spawner};
use rand::Rng;
use serde::Serialize;
use std::{
    collections::{BTreeMap, BTreeSet},
    time::Duration,
};
use thiserror::Error;
use tracing::{error, info};

pub mod config;
pub use config::Config;
pub mod roles;
use roles::{collator, keyper, user, validator, Event};
pub mod topology;
use topology::{Layout, Topology};

/// Errors that can occur while setting up a simulation.
#[derive(Error, Debug)]
pub enum Error {
    #[error("network error: {0}")]
    Network(#[from] simulated::Error),
}

/// Summary of a simulation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Report {
    /// Number of blocks finished by each keyper.
    pub keypers: BTreeMap<String, u64>,
    /// Milliseconds (since the start) at which every keyper had finished each block.
    pub blocks: BTreeMap<Block, u64>,
    /// Block each user is creating transactions for.
    pub users: BTreeMap<String, Block>,
    /// Number of collations published.
    pub collations: u64,
    /// Number of transactions included in collations.
    pub transactions: u64,
    /// Number of votes cast by each validator.
    pub votes: BTreeMap<String, u64>,
}

impl Report {
    fn new(layout: &Layout) -> Self {
        Self {
            keypers: layout.keypers.iter().map(|k| (k.to_string(), 0)).collect(),
            users: layout.users.iter().map(|u| (u.to_string(), 0)).collect(),
            votes: layout.validators.iter().map(|v| (v.to_string(), 0)).collect(),
            ..Default::default()
        }
    }
}

/// Run a simulation described by `cfg` until `cfg.duration` has elapsed.
pub async fn run<E: Spawner + Clock + Metrics + Rng>(
    mut context: E,
    cfg: Config,
) -> Result<Report, Error> {
    let start = context.current();
    let layout = Layout::new(&cfg);
    let topology = Topology::random(&mut context, &layout, &cfg);
    info!(
        keypers = layout.keypers.len(),
        users = layout.users.len(),
        collator = layout.collator.is_some(),
        validators = layout.validators.len(),
        links = topology.links().len(),
        "created topology"
    );

    // Create network
    let (network, mut oracle) = Network::new(
        context.with_label("network"),
        simulated::Config {
            max_size: usize::MAX,
        },
    );
    network.start();

    // Register and connect every peer, then give each a distributor
    let capacity = |peer: &PeerId| {
        if layout.keypers.contains(peer) {
            (cfg.keypers.uplink, cfg.keypers.downlink)
        } else if layout.users.contains(peer) {
            (cfg.users.uplink, cfg.users.downlink)
        } else if layout.collator.as_ref() == Some(peer) {
            (cfg.collator.uplink, cfg.collator.downlink)
        } else {
            (cfg.validators.uplink, cfg.validators.downlink)
        }
    };
    let mut networks = Vec::new();
    for peer in layout.peers() {
        let (uplink, downlink) = capacity(&peer);
        let network = oracle
            .register(peer, Channel::new(uplink), Channel::new(downlink))
            .await?;
        networks.push((peer, network));
    }
    for (a, b) in topology.links() {
        oracle.connect(a, b).await?;
    }
    let mut distributors = BTreeMap::new();
    for (peer, network) in networks {
        let (engine, mailbox) = gossip::Engine::new(
            context.with_label(&format!("distributor_{}", peer.get())),
            gossip::Config {
                public_key: peer,
                mailbox_size: cfg.mailbox_size,
                resend_interval: cfg.resend_interval(),
            },
        );
        engine.start(network);
        distributors.insert(peer, mailbox);
    }

    // Start roles
    let (events, mut reports) = mpsc::unbounded();
    let keypers: BTreeSet<PeerId> = layout.keypers.iter().copied().collect();
    for peer in &layout.keypers {
        let cfg = keysim_keyper::Config {
            public_key: *peer,
            keypers: keypers.clone(),
            threshold: cfg.keypers.threshold,
            max_jitter: Duration::from_millis(cfg.keypers.max_jitter),
        };
        let decrypt = layout.collator.is_some();
        let distributor = distributors[peer].clone();
        let events = events.clone();
        context
            .with_label(&format!("keyper_{}", peer.get()))
            .spawn(move |context| async move {
                let me = cfg.public_key;
                if let Err(err) = keyper::run(context, distributor, cfg, decrypt, events).await {
                    error!(%me, ?err, "keyper failed");
                }
            });
    }
    for peer in &layout.users {
        let cfg = user::Config {
            public_key: *peer,
            threshold: cfg.keypers.threshold,
            interval: Duration::from_millis(cfg.users.tx_interval),
        };
        let distributor = distributors[peer].clone();
        let events = events.clone();
        context
            .with_label(&format!("user_{}", peer.get()))
            .spawn(move |context| async move {
                let me = cfg.public_key;
                if let Err(err) = user::run(context, distributor, cfg, events).await {
                    error!(%me, ?err, "user failed");
                }
            });
    }
    if let Some(peer) = layout.collator {
        let cfg = collator::Config {
            public_key: peer,
            interval: Duration::from_millis(cfg.collator.collation_interval),
        };
        let distributor = distributors[&peer].clone();
        let events = events.clone();
        context
            .with_label("collator")
            .spawn(move |context| async move {
                if let Err(err) = collator::run(context, distributor, cfg, events).await {
                    error!(me = %peer, ?err, "collator failed");
                }
            });
    }
    for peer in &layout.validators {
        let cfg = validator::Config {
            public_key: *peer,
            threshold: cfg.keypers.threshold,
        };
        let distributor = distributors[peer].clone();
        let events = events.clone();
        context
            .with_label(&format!("validator_{}", peer.get()))
            .spawn(move |context| async move {
                let me = cfg.public_key;
                if let Err(err) = validator::run(context, distributor, cfg, events).await {
                    error!(%me, ?err, "validator failed");
                }
            });
    }
    drop(events);

    // Let the simulation play out
    context.sleep(cfg.duration()).await;

    // Summarize
    let mut report = Report::new(&layout);
    let mut finished: BTreeMap<Block, usize> = BTreeMap::new();
    while let Ok(Some(event)) = reports.try_next() {
        match event {
            Event::Finished { keyper, block, at } => {
                *report.keypers.entry(keyper.to_string()).or_default() += 1;
                let count = finished.entry(block).or_default();
                *count += 1;
                if *count == layout.keypers.len() {
                    let elapsed = at.duration_since(start).unwrap_or_default();
                    report.blocks.insert(block, elapsed.as_millis() as u64);
                }
            }
            Event::Advanced { user, block } => {
                report.users.insert(user.to_string(), block);
            }
            Event::Collated {
                transactions, ..
            } => {
                report.collations += 1;
                report.transactions += transactions as u64;
            }
            Event::Voted { validator, .. } => {
                *report.votes.entry(validator.to_string()).or_default() += 1;
            }
        }
    }
    info!(
        blocks = report.blocks.len(),
        collations = report.collations,
        "simulation finished"
    );
    Ok(report)
}
