//! Run key generation and release decryption key shares for collated blocks.

use super::Event;
use futures::{channel::mpsc, StreamExt};
use keysim_broadcast::{Block, Distributor, Error, Item, Kind};
use keysim_keyper::{Config, Coordinator};
use keysim_p2p::PeerId;
use keysim_runtime::{Clock, Metrics, Spawner};
use rand::Rng;
use std::collections::BTreeSet;
use tracing::{debug, warn};

/// Start a [Coordinator] and, for every block it finishes, publish a decryption key share once the
/// block has been collated (if `decrypt` is set).
pub async fn run<E: Clock + Spawner + Metrics + Rng, D: Distributor>(
    context: E,
    distributor: D,
    cfg: Config,
    decrypt: bool,
    events: mpsc::UnboundedSender<Event>,
) -> Result<(), Error> {
    let me = cfg.public_key;
    let (coordinator, mut finished) =
        Coordinator::new(context.with_label("coordinator"), distributor.clone(), cfg);
    coordinator.start();

    // Blocks are collated long after their key was generated, so finished blocks queue up here
    let (decryptable, pending) = mpsc::unbounded();
    if decrypt {
        let distributor = distributor.clone();
        context
            .with_label("decryption")
            .spawn(move |_| async move {
                if let Err(err) = decryption(distributor, me, pending).await {
                    warn!(%me, ?err, "failed to publish decryption key share");
                }
            });
    }

    while let Some(report) = finished.next().await {
        let _ = events.unbounded_send(Event::Finished {
            keyper: report.keyper,
            block: report.block,
            at: report.at,
        });
        if decrypt {
            let _ = decryptable.unbounded_send(report.block);
        }
    }
    Err(Error::Closed)
}

/// Walk finished blocks in order, publishing a decryption key share for each once its collation
/// is held.
async fn decryption<D: Distributor>(
    mut distributor: D,
    me: PeerId,
    mut pending: mpsc::UnboundedReceiver<Block>,
) -> Result<(), Error> {
    while let Some(block) = pending.next().await {
        distributor
            .get_items(&[Kind::Collation], Some(block), &BTreeSet::new())
            .await?;
        distributor
            .distribute(Item::DecKeyShare { block, sender: me })
            .await?;
        debug!(%me, block, "published decryption key share");
    }
    Ok(())
}
