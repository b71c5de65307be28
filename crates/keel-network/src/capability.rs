//! Protocol versions and the capabilities they unlock.

use crate::protocol::Message;

/// Sync protocol version. V2 adds the state-sync extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProtocolVersion {
    V1 = 1,
    V2 = 2,
}

impl ProtocolVersion {
    pub const LATEST: Self = ProtocolVersion::V2;

    pub fn as_wire(self) -> u8 {
        self as u8
    }

    /// Version both sides speak, given the remote's advertised version.
    /// Remotes newer than us are talked to at our version.
    pub fn negotiate(self, remote: u8) -> Option<Self> {
        let remote = match remote {
            0 => return None,
            1 => ProtocolVersion::V1,
            _ => ProtocolVersion::V2,
        };
        Some(self.min(remote))
    }

    pub fn capabilities(self) -> Capabilities {
        match self {
            ProtocolVersion::V1 => Capabilities::BASE,
            ProtocolVersion::V2 => Capabilities::STATE_SYNC,
        }
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.as_wire())
    }
}

/// Optional message families enabled on a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// `GET_NODE_DATA` / `NODE_DATA`.
    pub node_data: bool,
    /// `GET_RECEIPTS` / `RECEIPTS`.
    pub receipts: bool,
}

impl Capabilities {
    pub const BASE: Self = Self {
        node_data: false,
        receipts: false,
    };
    pub const STATE_SYNC: Self = Self {
        node_data: true,
        receipts: true,
    };

    pub fn has_state_sync(&self) -> bool {
        self.node_data || self.receipts
    }

    /// Whether `msg` may be exchanged under these capabilities.
    pub fn allows(&self, msg: &Message) -> bool {
        match msg {
            Message::GetNodeData(_) | Message::NodeData(_) => self.node_data,
            Message::GetReceipts(_) | Message::Receipts(_) => self.receipts,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiation_picks_the_lower_version() {
        assert_eq!(ProtocolVersion::V2.negotiate(1), Some(ProtocolVersion::V1));
        assert_eq!(ProtocolVersion::V1.negotiate(2), Some(ProtocolVersion::V1));
        assert_eq!(ProtocolVersion::V2.negotiate(9), Some(ProtocolVersion::V2));
        assert_eq!(ProtocolVersion::V2.negotiate(0), None);
    }

    #[test]
    fn base_rejects_state_sync_messages() {
        let caps = ProtocolVersion::V1.capabilities();
        assert!(!caps.has_state_sync());
        assert!(!caps.allows(&Message::GetNodeData(vec![])));
        assert!(caps.allows(&Message::Ping(1)));
        assert!(ProtocolVersion::V2.capabilities().allows(&Message::Receipts(vec![])));
    }
}
