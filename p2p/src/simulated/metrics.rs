use crate::PeerId;
use prometheus_client::encoding::EncodeLabelSet;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct Message {
    pub origin: String,
    pub recipient: String,
}

impl Message {
    pub fn new(origin: &PeerId, recipient: &PeerId) -> Self {
        Self {
            origin: origin.to_string(),
            recipient: recipient.to_string(),
        }
    }
}
