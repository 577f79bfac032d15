//! Parameters of a simulation, loaded from YAML.
//!
//! Every field has a default, so an empty document describes a complete simulation. Capacities
//! are in bytes per second, `duration` is in seconds and every other interval is in milliseconds.

use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};
use thiserror::Error;

/// Errors that can occur when loading a [Config].
#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("at least one keyper is required")]
    NoKeypers,
    #[error("threshold must be between 1 and {keypers}: {threshold}")]
    InvalidThreshold { threshold: usize, keypers: usize },
    #[error("{0} capacity must be positive")]
    ZeroCapacity(&'static str),
    #[error("{0} must be positive")]
    ZeroInterval(&'static str),
    #[error("mailbox size must be positive")]
    ZeroMailbox,
}

/// Configuration of a simulation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Seed of the deterministic runtime (and of the topology).
    pub seed: u64,

    /// Length of the simulation (in seconds).
    pub duration: u64,

    /// Interval between gossip rounds with each neighbor (in milliseconds).
    pub resend_interval: u64,

    /// Backlog of each distributor's mailbox.
    pub mailbox_size: usize,

    pub keypers: Keypers,
    pub users: Users,
    pub collator: Collator,
    pub validators: Validators,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            seed: 0,
            duration: 30,
            resend_interval: 100,
            mailbox_size: 1024,
            keypers: Keypers::default(),
            users: Users::default(),
            collator: Collator::default(),
            validators: Validators::default(),
        }
    }
}

/// Peers running the key generation handshake.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Keypers {
    pub count: usize,
    /// Number of key shares required to encrypt or decrypt.
    pub threshold: usize,
    /// Number of other keypers each keyper connects to.
    pub connections: usize,
    pub uplink: u64,
    pub downlink: u64,
    /// Upper bound on the random delay before a keyper starts (in milliseconds).
    pub max_jitter: u64,
}

impl Default for Keypers {
    fn default() -> Self {
        Self {
            count: 10,
            threshold: 7,
            connections: 4,
            uplink: 100_000,
            downlink: 100_000,
            max_jitter: 1_000,
        }
    }
}

/// Peers creating transactions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Users {
    pub count: usize,
    /// Number of other users each user connects to (in addition to one keyper).
    pub connections: usize,
    pub uplink: u64,
    pub downlink: u64,
    /// Interval between transactions of a single user (in milliseconds).
    pub tx_interval: u64,
}

impl Default for Users {
    fn default() -> Self {
        Self {
            count: 10,
            connections: 2,
            uplink: 10_000,
            downlink: 10_000,
            tx_interval: 1_000,
        }
    }
}

/// Peer bundling transactions into collations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Collator {
    pub enabled: bool,
    /// Number of keypers and users the collator connects to.
    pub connections: usize,
    pub uplink: u64,
    pub downlink: u64,
    /// Interval between collations (in milliseconds).
    pub collation_interval: u64,
}

impl Default for Collator {
    fn default() -> Self {
        Self {
            enabled: true,
            connections: 4,
            uplink: 100_000,
            downlink: 100_000,
            collation_interval: 5_000,
        }
    }
}

/// Peers voting on collated blocks.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Validators {
    pub count: usize,
    /// Number of keypers each validator connects to.
    pub connections: usize,
    pub uplink: u64,
    pub downlink: u64,
}

impl Default for Validators {
    fn default() -> Self {
        Self {
            count: 3,
            connections: 2,
            uplink: 100_000,
            downlink: 100_000,
        }
    }
}

impl Config {
    /// Read, parse and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse and validate a configuration document.
    pub fn parse(contents: &str) -> Result<Self, Error> {
        let config: Self = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Ensure the configuration describes a runnable simulation.
    pub fn validate(&self) -> Result<(), Error> {
        if self.keypers.count == 0 {
            return Err(Error::NoKeypers);
        }
        if self.keypers.threshold == 0 || self.keypers.threshold > self.keypers.count {
            return Err(Error::InvalidThreshold {
                threshold: self.keypers.threshold,
                keypers: self.keypers.count,
            });
        }
        if self.mailbox_size == 0 {
            return Err(Error::ZeroMailbox);
        }
        let capacities = [
            ("keyper", self.keypers.uplink, self.keypers.downlink, true),
            ("user", self.users.uplink, self.users.downlink, self.users.count > 0),
            (
                "collator",
                self.collator.uplink,
                self.collator.downlink,
                self.collator.enabled,
            ),
            (
                "validator",
                self.validators.uplink,
                self.validators.downlink,
                self.validators.count > 0,
            ),
        ];
        for (role, uplink, downlink, present) in capacities {
            if present && (uplink == 0 || downlink == 0) {
                return Err(Error::ZeroCapacity(role));
            }
        }
        let intervals = [
            ("duration", self.duration),
            ("resend interval", self.resend_interval),
            ("transaction interval", self.users.tx_interval),
            ("collation interval", self.collator.collation_interval),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(Error::ZeroInterval(name));
            }
        }
        Ok(())
    }

    /// Returns the length of the simulation.
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration)
    }

    /// Returns the interval between gossip rounds.
    pub fn resend_interval(&self) -> Duration {
        Duration::from_millis(self.resend_interval)
    }
}
