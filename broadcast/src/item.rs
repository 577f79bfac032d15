//! Typed, block-scoped units of data exchanged between peers.
//!
//! Items carry no real payload: only enough structure to identify them, to decide who authored
//! them and to account for the bytes they would occupy on the wire. Two items with the same
//! [Identity] are the same item, regardless of any other field.

use keysim_p2p::PeerId;
use keysim_runtime::hex;
use sha2::{Digest as _, Sha256};
use std::{
    cmp::Ordering,
    fmt,
    hash::{Hash, Hasher},
};

/// Height of a block.
pub type Block = u64;

/// Size of an encoded block number.
pub const BLOCK_NUMBER_SIZE: usize = 4;

/// Size of an item hash.
pub const ITEM_HASH_SIZE: usize = 32;

/// Size of a peer address.
pub const ADDRESS_SIZE: usize = 20;

/// Size of a signature.
pub const SIGNATURE_SIZE: usize = 132;

/// Size of every item before any kind-specific fields.
const BASE_SIZE: usize = BLOCK_NUMBER_SIZE + ITEM_HASH_SIZE;

/// Size of an item that carries its author's signature.
const SIGNED_SIZE: usize = BASE_SIZE + SIGNATURE_SIZE;

/// Size of a signed item that is addressed to a specific peer.
const ADDRESSED_SIZE: usize = SIGNED_SIZE + ADDRESS_SIZE;

/// Size of the opaque body of a transaction.
const TRANSACTION_BODY_SIZE: usize = 100;

/// Size of an encrypted secret share.
const SECRET_SHARE_SIZE: usize = 64;

/// Size of the value carried by witnesses, nonces, key shares and votes.
const VALUE_SIZE: usize = 32;

/// Kinds of items (ordered by their type id).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Kind {
    Transaction = 0,
    SecretShare = 1,
    Witness = 2,
    Nonce = 3,
    EncKeyShare = 4,
    DecKeyShare = 5,
    Vote = 6,
    Collation = 7,
}

impl Kind {
    /// Returns the type id of the kind.
    pub const fn type_id(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Kind::Transaction => "transaction",
            Kind::SecretShare => "secret_share",
            Kind::Witness => "witness",
            Kind::Nonce => "nonce",
            Kind::EncKeyShare => "enc_key_share",
            Kind::DecKeyShare => "dec_key_share",
            Kind::Vote => "vote",
            Kind::Collation => "collation",
        };
        f.write_str(name)
    }
}

/// Everything that distinguishes one item from another.
///
/// Plain items are identified by an opaque token minted at creation, signed items by their
/// author and addressed items by their author and receiver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Identity {
    pub kind: Kind,
    pub block: Block,
    pub sender: Option<PeerId>,
    pub receiver: Option<PeerId>,
    pub token: Option<u64>,
}

impl Identity {
    /// Returns the digest of the identity.
    pub fn digest(&self) -> Digest {
        let mut hasher = Sha256::new();
        hasher.update([self.kind.type_id()]);
        hasher.update(self.block.to_be_bytes());
        match self.sender {
            Some(sender) => {
                hasher.update([1]);
                hasher.update(sender.to_be_bytes());
            }
            None => hasher.update([0]),
        }
        match self.receiver {
            Some(receiver) => {
                hasher.update([1]);
                hasher.update(receiver.to_be_bytes());
            }
            None => hasher.update([0]),
        }
        match self.token {
            Some(token) => {
                hasher.update([1]);
                hasher.update(token.to_be_bytes());
            }
            None => hasher.update([0]),
        }
        Digest(hasher.finalize().into())
    }
}

/// SHA-256 digest of an item's [Identity].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Digest([u8; ITEM_HASH_SIZE]);

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex(&self.0))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex(&self.0[..4]))
    }
}

/// An item exchanged between peers.
#[derive(Clone, Debug)]
pub enum Item {
    /// A user transaction.
    Transaction { block: Block, token: u64 },
    /// A secret share sent from one keyper to another.
    SecretShare {
        block: Block,
        sender: PeerId,
        receiver: PeerId,
    },
    /// Commitment to the secret shares a keyper has dealt.
    Witness { block: Block, sender: PeerId },
    /// Published by a keyper once it has received all shares and witnesses.
    Nonce { block: Block, sender: PeerId },
    /// A keyper's share of the encryption key.
    EncKeyShare { block: Block, sender: PeerId },
    /// A keyper's share of the decryption key.
    DecKeyShare { block: Block, sender: PeerId },
    /// A validator's vote on a block.
    Vote { block: Block, sender: PeerId },
    /// A batch of transactions proposed for a block.
    Collation {
        block: Block,
        sender: PeerId,
        transactions: usize,
    },
}

impl Item {
    /// Returns the kind of the item.
    pub fn kind(&self) -> Kind {
        match self {
            Item::Transaction { .. } => Kind::Transaction,
            Item::SecretShare { .. } => Kind::SecretShare,
            Item::Witness { .. } => Kind::Witness,
            Item::Nonce { .. } => Kind::Nonce,
            Item::EncKeyShare { .. } => Kind::EncKeyShare,
            Item::DecKeyShare { .. } => Kind::DecKeyShare,
            Item::Vote { .. } => Kind::Vote,
            Item::Collation { .. } => Kind::Collation,
        }
    }

    /// Returns the block the item belongs to.
    pub fn block(&self) -> Block {
        match self {
            Item::Transaction { block, .. }
            | Item::SecretShare { block, .. }
            | Item::Witness { block, .. }
            | Item::Nonce { block, .. }
            | Item::EncKeyShare { block, .. }
            | Item::DecKeyShare { block, .. }
            | Item::Vote { block, .. }
            | Item::Collation { block, .. } => *block,
        }
    }

    /// Returns the author of the item (if signed).
    pub fn sender(&self) -> Option<PeerId> {
        match self {
            Item::Transaction { .. } => None,
            Item::SecretShare { sender, .. }
            | Item::Witness { sender, .. }
            | Item::Nonce { sender, .. }
            | Item::EncKeyShare { sender, .. }
            | Item::DecKeyShare { sender, .. }
            | Item::Vote { sender, .. }
            | Item::Collation { sender, .. } => Some(*sender),
        }
    }

    /// Returns the peer the item is addressed to (if any).
    pub fn receiver(&self) -> Option<PeerId> {
        match self {
            Item::SecretShare { receiver, .. } => Some(*receiver),
            _ => None,
        }
    }

    /// Returns the identity of the item.
    pub fn identity(&self) -> Identity {
        let token = match self {
            Item::Transaction { token, .. } => Some(*token),
            _ => None,
        };
        Identity {
            kind: self.kind(),
            block: self.block(),
            sender: self.sender(),
            receiver: self.receiver(),
            token,
        }
    }

    /// Returns the digest of the item's identity.
    pub fn digest(&self) -> Digest {
        self.identity().digest()
    }

    /// Returns the number of bytes the item occupies on the wire.
    pub fn size(&self) -> usize {
        match self {
            Item::Transaction { .. } => BASE_SIZE + TRANSACTION_BODY_SIZE,
            Item::SecretShare { .. } => ADDRESSED_SIZE + SECRET_SHARE_SIZE,
            Item::Witness { .. }
            | Item::Nonce { .. }
            | Item::EncKeyShare { .. }
            | Item::DecKeyShare { .. }
            | Item::Vote { .. } => SIGNED_SIZE + VALUE_SIZE,
            Item::Collation { transactions, .. } => SIGNED_SIZE + transactions * ITEM_HASH_SIZE,
        }
    }
}

impl PartialEq for Item {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for Item {}

impl PartialOrd for Item {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Item {
    fn cmp(&self, other: &Self) -> Ordering {
        self.identity().cmp(&other.identity())
    }
}

impl Hash for Item {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
    }
}

impl fmt::Display for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(block={}", self.kind(), self.block())?;
        if let Some(sender) = self.sender() {
            write!(f, ", sender={sender}")?;
        }
        if let Some(receiver) = self.receiver() {
            write!(f, ", receiver={receiver}")?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn peer(id: u32) -> PeerId {
        PeerId::new(id)
    }

    #[test]
    fn test_sizes() {
        assert_eq!(Item::Transaction { block: 0, token: 1 }.size(), 136);
        let share = Item::SecretShare {
            block: 0,
            sender: peer(1),
            receiver: peer(2),
        };
        assert_eq!(share.size(), 252);
        assert_eq!(
            Item::Witness {
                block: 0,
                sender: peer(1)
            }
            .size(),
            200
        );
        assert_eq!(
            Item::Collation {
                block: 0,
                sender: peer(1),
                transactions: 3
            }
            .size(),
            168 + 96
        );
    }

    #[test]
    fn test_identity_ignores_payload() {
        let a = Item::Collation {
            block: 4,
            sender: peer(1),
            transactions: 3,
        };
        let b = Item::Collation {
            block: 4,
            sender: peer(1),
            transactions: 10,
        };
        assert_eq!(a, b);
        assert_eq!(a.digest(), b.digest());
    }

    #[test]
    fn test_identity_distinguishes_fields() {
        let items = [
            Item::Witness {
                block: 1,
                sender: peer(1),
            },
            Item::Nonce {
                block: 1,
                sender: peer(1),
            },
            Item::Witness {
                block: 2,
                sender: peer(1),
            },
            Item::Witness {
                block: 1,
                sender: peer(2),
            },
            Item::SecretShare {
                block: 1,
                sender: peer(1),
                receiver: peer(2),
            },
            Item::SecretShare {
                block: 1,
                sender: peer(1),
                receiver: peer(3),
            },
            Item::Transaction { block: 1, token: 1 },
            Item::Transaction { block: 1, token: 2 },
        ];
        let unique: BTreeSet<_> = items.iter().cloned().collect();
        assert_eq!(unique.len(), items.len());
        let digests: BTreeSet<_> = items.iter().map(Item::digest).collect();
        assert_eq!(digests.len(), items.len());
    }

    #[test]
    fn test_ordered_by_kind() {
        let mut items = vec![
            Item::Vote {
                block: 0,
                sender: peer(1),
            },
            Item::Transaction { block: 9, token: 0 },
            Item::SecretShare {
                block: 5,
                sender: peer(1),
                receiver: peer(2),
            },
        ];
        items.sort();
        let kinds: Vec<_> = items.iter().map(Item::kind).collect();
        assert_eq!(kinds, vec![Kind::Transaction, Kind::SecretShare, Kind::Vote]);
        assert!(Kind::Transaction.type_id() < Kind::Collation.type_id());
    }

    #[test]
    fn test_display() {
        let share = Item::SecretShare {
            block: 3,
            sender: peer(1),
            receiver: peer(2),
        };
        assert_eq!(
            share.to_string(),
            "secret_share(block=3, sender=peer-1, receiver=peer-2)"
        );
    }
}
