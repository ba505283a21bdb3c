use serde::{Deserialize, Serialize};
use std::fmt;

/// Short channel id: block height, transaction index and output index
/// packed into 64 bits.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ChannelId(pub u64);

impl ChannelId {
    pub fn block_height(&self) -> u32 {
        (self.0 >> 40) as u32
    }

    pub fn tx_index(&self) -> u32 {
        ((self.0 >> 16) & 0xFF_FFFF) as u32
    }

    pub fn output_index(&self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl From<u64> for ChannelId {
    fn from(id: u64) -> Self {
        ChannelId(id)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.block_height(),
            self.tx_index(),
            self.output_index()
        )
    }
}

/// One row of the node's channel listing.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChannelInfo {
    pub channel_id: ChannelId,
    pub capacity: u64,
    pub local_balance: u64,
    pub remote_balance: u64,
    /// Hex-encoded public key of the channel counterparty.
    pub peer: String,
    pub private: bool,
}

/// Balance summary for a channel, or for a set of channels when a peer or the
/// whole node is assessed. Channel reserve, fees and pending htlcs are not
/// included, so `incoming + outgoing <= capacity`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Balances {
    /// Total capacity, in satoshis.
    pub capacity: u64,
    /// Remote balance, in satoshis.
    pub incoming: u64,
    /// Local balance, in satoshis.
    pub outgoing: u64,
    /// Channels these balances cover.
    pub channels: Vec<ChannelId>,
    /// Counterparty, when all channels belong to one peer.
    pub peer: Option<String>,
}

impl Balances {
    pub fn from_channel(info: &ChannelInfo) -> Self {
        Self {
            capacity: info.capacity,
            incoming: info.remote_balance,
            outgoing: info.local_balance,
            channels: vec![info.channel_id],
            peer: Some(info.peer.clone()),
        }
    }

    /// Sum a set of balances into one. The peer is kept only if every input
    /// shares it.
    pub fn aggregate(balances: &[Balances]) -> Self {
        let mut total = Balances::default();
        let mut peer: Option<&Option<String>> = None;
        let mut shared_peer = true;

        for b in balances {
            total.capacity += b.capacity;
            total.incoming += b.incoming;
            total.outgoing += b.outgoing;
            total.channels.extend_from_slice(&b.channels);

            match peer {
                None => peer = Some(&b.peer),
                Some(p) if *p != b.peer => shared_peer = false,
                Some(_) => {}
            }
        }

        if shared_peer {
            total.peer = peer.cloned().flatten();
        }
        total
    }

    /// Incoming liquidity as a fraction of capacity. Zero capacity yields 0.
    pub fn incoming_ratio(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.incoming as f64 / self.capacity as f64
    }

    /// Outgoing liquidity as a fraction of capacity. Zero capacity yields 0.
    pub fn outgoing_ratio(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.outgoing as f64 / self.capacity as f64
    }

    pub fn ratios(&self) -> (f64, f64) {
        (self.incoming_ratio(), self.outgoing_ratio())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn balance(id: u64, peer: &str, capacity: u64, incoming: u64, outgoing: u64) -> Balances {
        Balances {
            capacity,
            incoming,
            outgoing,
            channels: vec![ChannelId(id)],
            peer: Some(peer.to_string()),
        }
    }

    #[test]
    fn test_ratios() {
        let b = balance(1, "a", 100, 20, 70);
        let (incoming, outgoing) = b.ratios();
        assert!((incoming - 0.2).abs() < 1e-9);
        assert!((outgoing - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_zero_capacity_ratios() {
        let b = Balances::default();
        assert_eq!(b.ratios(), (0.0, 0.0));
    }

    #[test]
    fn test_aggregate_same_peer() {
        let total = Balances::aggregate(&[
            balance(1, "a", 100, 20, 80),
            balance(2, "a", 300, 100, 150),
        ]);
        assert_eq!(total.capacity, 400);
        assert_eq!(total.incoming, 120);
        assert_eq!(total.outgoing, 230);
        assert_eq!(total.channels, vec![ChannelId(1), ChannelId(2)]);
        assert_eq!(total.peer.as_deref(), Some("a"));
    }

    #[test]
    fn test_aggregate_mixed_peers_drops_peer() {
        let total = Balances::aggregate(&[
            balance(1, "a", 100, 20, 80),
            balance(2, "b", 100, 20, 80),
        ]);
        assert!(total.peer.is_none());
    }

    #[test]
    fn test_aggregate_empty() {
        let total = Balances::aggregate(&[]);
        assert_eq!(total.capacity, 0);
        assert!(total.channels.is_empty());
    }

    #[test]
    fn test_channel_id_display() {
        let id = ChannelId((700_000u64 << 40) | (1234 << 16) | 1);
        assert_eq!(id.to_string(), "700000:1234:1");
        assert_eq!(id.block_height(), 700_000);
        assert_eq!(id.tx_index(), 1234);
        assert_eq!(id.output_index(), 1);
    }
}
