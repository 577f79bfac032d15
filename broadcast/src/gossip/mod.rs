//! Share items with neighbors by periodically announcing what you hold.
//!
//! # Design
//!
//! Each participant runs an [Engine] that keeps track of the items it has heard of, the items it
//! holds and the items each neighbor is believed to hold. Once per `resend_interval` (with the
//! first round jittered by up to one interval), the engine visits each neighbor and:
//!
//! 1. Announces every held item the neighbor is not known to hold (and then assumes the neighbor
//!    holds them).
//! 2. Once that announcement has been delivered (or right away if there was nothing to
//!    announce), requests every item the neighbor announced that it does not hold yet.
//!
//! A step is skipped while a message is in flight between the two peers, so a slow link never
//! accumulates a backlog. Neighbors are looked up once per interval, so links added after the
//! engine started are picked up. Neighbors answer requests with the full items they hold. Once
//! every participant holds every item (and every neighbor knows it), no more messages are sent.
//!
//! Local services interact with the engine through a [Mailbox], which implements
//! [crate::Distributor].

mod config;
pub use config::Config;
mod engine;
pub use engine::Engine;
mod ingress;
pub use ingress::{Inventory, Mailbox};
mod metrics;
mod store;
pub mod wire;
