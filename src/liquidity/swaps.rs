use crate::liquidity::balances::ChannelId;
use serde::Serialize;
use std::fmt;

/// The action a rule recommends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    None,
    /// Loop out to acquire inbound liquidity.
    LoopOut,
    /// Loop in to acquire outbound liquidity.
    LoopIn,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::None => write!(f, "No action"),
            Action::LoopOut => write!(f, "Loop out"),
            Action::LoopIn => write!(f, "Loop in"),
        }
    }
}

/// Why an action (including no action) was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    /// Below threshold on one side, with surplus on the other.
    Imbalanced,
    /// No eligible capacity: no channels, or only excluded ones.
    NoCapacity,
    /// Deficit on both sides, usually from pending htlcs.
    NoSurplus,
    LiquidityOk,
    /// A swap is needed but smaller than the server minimum.
    MinimumAmountNotMet,
    BudgetElapsed,
    BudgetConsumed,
    /// Too many swaps already in flight.
    InFlightLimit,
    /// The quote for the swap exceeded our fee limits.
    FeesTooHigh,
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Reason::Imbalanced => "Channels imbalanced",
            Reason::NoCapacity => "No capacity",
            Reason::NoSurplus => "No surplus",
            Reason::LiquidityOk => "Liquidity ok",
            Reason::MinimumAmountNotMet => "Imbalance amount less than minimum swap amount",
            Reason::BudgetElapsed => "Budget elapsed",
            Reason::BudgetConsumed => "Budget consumed",
            Reason::InFlightLimit => "In flight swap limit reached",
            Reason::FeesTooHigh => "Fees too high",
        };
        write!(f, "{}", s)
    }
}

/// A swap of `amount` satoshis over `channel`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SwapRecommendation {
    pub channel: ChannelId,
    pub amount: u64,
}

impl SwapRecommendation {
    pub fn new(channel: ChannelId, amount: u64) -> Self {
        Self { channel, amount }
    }
}

impl fmt::Display for SwapRecommendation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} sat over {}", self.amount, self.channel)
    }
}

/// Outcome of applying one rule to one set of balances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SwapSet {
    pub action: Action,
    pub reason: Reason,
    pub swaps: Vec<SwapRecommendation>,
}

impl SwapSet {
    pub fn new(action: Action, reason: Reason, swaps: Vec<SwapRecommendation>) -> Self {
        Self {
            action,
            reason,
            swaps,
        }
    }

    pub fn empty(action: Action, reason: Reason) -> Self {
        Self::new(action, reason, Vec::new())
    }
}

/// Surplus available on one channel for the swap direction being considered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSurplus {
    pub channel: ChannelId,
    pub amount: u64,
}

/// Split `amount` across channels with surplus, one swap per channel.
///
/// Each swap is assumed to be paid with a single htlc, so a swap never spans
/// channels. Channels are used richest first, each contributing at most
/// `max_swap`; channels holding less than `min_swap` are skipped. Stops once
/// the remaining amount drops below `min_swap`. The result may fall short of
/// `amount`.
pub fn select_single_swap(
    mut channels: Vec<ChannelSurplus>,
    mut amount: u64,
    min_swap: u64,
    max_swap: u64,
) -> Vec<SwapRecommendation> {
    let mut swaps = Vec::new();
    if amount < min_swap {
        return swaps;
    }

    // Stable: ties keep their listing order.
    channels.sort_by(|a, b| b.amount.cmp(&a.amount));

    for channel in channels {
        if channel.amount < min_swap {
            continue;
        }

        let available = channel.amount.min(amount);
        let swap_amount = available.min(max_swap);

        swaps.push(SwapRecommendation::new(channel.channel, swap_amount));
        amount -= swap_amount;

        if amount < min_swap {
            break;
        }
    }

    swaps
}
