/// Channel eligibility filter.
///
/// Channels already involved in a swap are not considered for new ones:
/// - a pending loop out restricted to channels excludes those channels;
/// - a pending loop in restricted to a last hop excludes every channel with
///   that peer;
/// - a pending swap with no restriction could touch any channel, so nothing
///   is eligible;
/// - a loop out whose off-chain payments failed within the backoff window
///   excludes its channels, so we do not retry straight away.
use crate::liquidity::balances::{ChannelId, ChannelInfo};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapType {
    LoopOut,
    LoopIn,
}

impl fmt::Display for SwapType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SwapType::LoopOut => write!(f, "loop out"),
            SwapType::LoopIn => write!(f, "loop in"),
        }
    }
}

/// State of a swap as recorded by the swap store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapState {
    #[default]
    Initiated,
    PreimageRevealed,
    HtlcPublished,
    InvoiceSettled,
    Success,
    FailOffchainPayments,
    FailTimeout,
    FailSweepTimeout,
    FailInsufficientValue,
    FailTemporary,
    FailIncorrectHtlcAmt,
}

impl SwapState {
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            SwapState::Initiated
                | SwapState::PreimageRevealed
                | SwapState::HtlcPublished
                | SwapState::InvoiceSettled
        )
    }

}

/// Snapshot of a swap known to the swap store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistingSwap {
    pub hash: String,
    pub state: SwapState,
    pub swap_type: SwapType,
    /// Outgoing channels a loop out is restricted to. Empty means any.
    pub channels: Vec<ChannelId>,
    /// Peer a loop in is restricted to.
    pub last_hop: Option<String>,
    pub last_update: DateTime<Utc>,
}

impl ExistingSwap {
    /// Whether the swap is pinned to specific channels or a peer.
    pub fn is_restricted(&self) -> bool {
        match self.swap_type {
            SwapType::LoopOut => !self.channels.is_empty(),
            SwapType::LoopIn => self.last_hop.is_some(),
        }
    }
}

/// Channels from `channels` that may take part in a new swap, in input order.
pub fn eligible_channels(
    channels: &[ChannelInfo],
    swaps: &[ExistingSwap],
    failure_backoff: Duration,
    now: DateTime<Utc>,
) -> Vec<ChannelInfo> {
    let failure_cutoff = now
        .checked_sub_signed(failure_backoff)
        .unwrap_or(DateTime::<Utc>::MIN_UTC);

    let mut excluded_channels: HashSet<ChannelId> = HashSet::new();
    let mut excluded_peers: HashSet<&str> = HashSet::new();

    for swap in swaps {
        if swap.swap_type == SwapType::LoopOut
            && swap.state == SwapState::FailOffchainPayments
            && swap.last_update > failure_cutoff
        {
            log::debug!(
                "Swap {} failed recently, excluding channels: {:?}",
                swap.hash,
                swap.channels
            );
            excluded_channels.extend(swap.channels.iter().copied());
            continue;
        }

        if !swap.state.is_pending() {
            continue;
        }

        if !swap.is_restricted() {
            log::debug!(
                "Pending {} {} has no channel restriction, no channels eligible",
                swap.swap_type,
                swap.hash
            );
            return Vec::new();
        }

        match swap.swap_type {
            SwapType::LoopOut => excluded_channels.extend(swap.channels.iter().copied()),
            SwapType::LoopIn => {
                if let Some(peer) = swap.last_hop.as_deref() {
                    excluded_peers.insert(peer);
                }
            }
        }
    }

    channels
        .iter()
        .filter(|c| {
            !excluded_channels.contains(&c.channel_id) && !excluded_peers.contains(c.peer.as_str())
        })
        .cloned()
        .collect()
}

/// Number of swaps still in flight.
pub fn pending_count(swaps: &[ExistingSwap]) -> usize {
    swaps.iter().filter(|s| s.state.is_pending()).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn test_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap()
    }

    fn backoff() -> Duration {
        Duration::hours(24)
    }

    fn channel(id: u64, peer: &str) -> ChannelInfo {
        ChannelInfo {
            channel_id: ChannelId(id),
            capacity: 1000,
            local_balance: 500,
            remote_balance: 500,
            peer: peer.to_string(),
            private: false,
        }
    }

    fn channels() -> Vec<ChannelInfo> {
        vec![channel(1, "peer1"), channel(2, "peer2")]
    }

    fn swap(swap_type: SwapType) -> ExistingSwap {
        ExistingSwap {
            hash: "hash".to_string(),
            state: SwapState::Initiated,
            swap_type,
            channels: Vec::new(),
            last_hop: None,
            last_update: test_time(),
        }
    }

    fn ids(channels: &[ChannelInfo]) -> Vec<u64> {
        channels.iter().map(|c| c.channel_id.0).collect()
    }

    #[test]
    fn test_no_existing_swaps() {
        let eligible = eligible_channels(&channels(), &[], backoff(), test_time());
        assert_eq!(ids(&eligible), vec![1, 2]);
    }

    #[test]
    fn test_unrestricted_loop_out() {
        let swaps = [swap(SwapType::LoopOut)];
        assert!(eligible_channels(&channels(), &swaps, backoff(), test_time()).is_empty());
    }

    #[test]
    fn test_unrestricted_loop_in() {
        let swaps = [swap(SwapType::LoopIn)];
        assert!(eligible_channels(&channels(), &swaps, backoff(), test_time()).is_empty());
    }

    #[test]
    fn test_restricted_loop_out() {
        let swaps = [ExistingSwap {
            channels: vec![ChannelId(1)],
            ..swap(SwapType::LoopOut)
        }];
        let eligible = eligible_channels(&channels(), &swaps, backoff(), test_time());
        assert_eq!(ids(&eligible), vec![2]);
    }

    #[test]
    fn test_restricted_loop_in_excludes_peer() {
        let mut chans = channels();
        chans.push(channel(3, "peer2"));

        let swaps = [ExistingSwap {
            last_hop: Some("peer2".to_string()),
            ..swap(SwapType::LoopIn)
        }];
        let eligible = eligible_channels(&chans, &swaps, backoff(), test_time());
        assert_eq!(ids(&eligible), vec![1]);
    }

    #[test]
    fn test_swap_failed_recently() {
        let swaps = [ExistingSwap {
            channels: vec![ChannelId(1)],
            state: SwapState::FailOffchainPayments,
            ..swap(SwapType::LoopOut)
        }];
        let eligible = eligible_channels(&channels(), &swaps, backoff(), test_time());
        assert_eq!(ids(&eligible), vec![2]);
    }

    #[test]
    fn test_swap_failed_before_cutoff() {
        let swaps = [ExistingSwap {
            channels: vec![ChannelId(1)],
            state: SwapState::FailOffchainPayments,
            last_update: test_time() - backoff(),
            ..swap(SwapType::LoopOut)
        }];
        let eligible = eligible_channels(&channels(), &swaps, backoff(), test_time());
        assert_eq!(ids(&eligible), vec![1, 2]);
    }

    #[test]
    fn test_backoff_beyond_time_range() {
        let swaps = [ExistingSwap {
            channels: vec![ChannelId(1)],
            state: SwapState::FailOffchainPayments,
            last_update: DateTime::<Utc>::MIN_UTC + Duration::days(1),
            ..swap(SwapType::LoopOut)
        }];
        let eligible = eligible_channels(&channels(), &swaps, Duration::MAX, test_time());
        assert_eq!(ids(&eligible), vec![2]);
    }

    #[test]
    fn test_terminal_swaps_ignored() {
        let swaps = [
            ExistingSwap {
                state: SwapState::Success,
                ..swap(SwapType::LoopOut)
            },
            ExistingSwap {
                state: SwapState::FailTimeout,
                channels: vec![ChannelId(2)],
                ..swap(SwapType::LoopOut)
            },
        ];
        let eligible = eligible_channels(&channels(), &swaps, backoff(), test_time());
        assert_eq!(ids(&eligible), vec![1, 2]);
    }

    #[test]
    fn test_state_classification() {
        assert!(SwapState::InvoiceSettled.is_pending());
        assert!(!SwapState::Success.is_pending());
        assert!(!SwapState::FailTemporary.is_pending());

        let swaps = [
            swap(SwapType::LoopOut),
            ExistingSwap {
                state: SwapState::Success,
                ..swap(SwapType::LoopIn)
            },
        ];
        assert_eq!(pending_count(&swaps), 1);
    }
}
