/// Liquidity rules and the balancing arithmetic they share.
///
/// A rule holds a minimum inbound and a minimum outbound level. Given a set
/// of balances it decides whether we are short on one side, and if the other
/// side has surplus it works out how much capacity to shift:
///
/// - not enough surplus to clear the deficit: shift half of the surplus, so
///   we move towards the target without draining the other side;
/// - enough surplus to reach the midpoint between the two minimums: shift
///   to the midpoint;
/// - otherwise: shift just enough to clear the deficit.
///
/// The midpoint is the same balance point from either direction, so a loop
/// out never sets up a loop in (or the reverse) on the next cycle.
use crate::liquidity::balances::{Balances, ChannelId};
use crate::liquidity::error::{LiquidityError, Result};
use crate::liquidity::restrictions::Restrictions;
use crate::liquidity::swaps::{
    select_single_swap, Action, ChannelSurplus, Reason, SwapRecommendation, SwapSet,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Capability shared by all rule variants.
pub trait LiquidityRule: fmt::Display + Send + Sync {
    /// Checks the thresholds the rule was created with.
    fn validate(&self) -> Result<()>;

    /// Evaluates the rule against `balances` and recommends swaps within the
    /// server restrictions for each direction.
    fn evaluate(
        &self,
        balances: &[Balances],
        out_restrictions: &Restrictions,
        in_restrictions: &Restrictions,
    ) -> SwapSet;
}

/// Classify a set of balances against minimum inbound/outbound ratios.
pub fn decide_action(balances: &Balances, min_inbound: f64, min_outbound: f64) -> (Action, Reason) {
    if balances.capacity == 0 {
        return (Action::None, Reason::NoCapacity);
    }

    let inbound_deficit = balances.incoming_ratio() < min_inbound;
    let outbound_deficit = balances.outgoing_ratio() < min_outbound;

    match (inbound_deficit, outbound_deficit) {
        // Shifting either way would deepen the other deficit.
        (true, true) => (Action::None, Reason::NoSurplus),
        (true, false) => (Action::LoopOut, Reason::Imbalanced),
        (false, true) => (Action::LoopIn, Reason::Imbalanced),
        (false, false) => (Action::None, Reason::LiquidityOk),
    }
}

/// Fraction of total capacity to move from the surplus side to the deficit
/// side.
pub fn shift_ratio(
    deficit_current: f64,
    deficit_minimum: f64,
    surplus_current: f64,
    surplus_minimum: f64,
) -> f64 {
    let required = deficit_minimum - deficit_current;
    let available = surplus_current - surplus_minimum;

    if available <= required {
        return available / 2.0;
    }

    let midpoint = (deficit_minimum + (1.0 - surplus_minimum)) / 2.0;
    let midpoint_delta = midpoint - deficit_current;

    if midpoint_delta <= available {
        return midpoint_delta;
    }

    required
}

/// Shift ratio for `action` given current ratios and the two minimums.
fn shift_for_action(
    action: Action,
    balances: &Balances,
    min_inbound: f64,
    min_outbound: f64,
) -> f64 {
    let (incoming, outgoing) = balances.ratios();
    match action {
        Action::LoopOut => shift_ratio(incoming, min_inbound, outgoing, min_outbound),
        Action::LoopIn => shift_ratio(outgoing, min_outbound, incoming, min_inbound),
        Action::None => 0.0,
    }
}

/// Node or peer level rule with minimum inbound and outbound ratios of
/// capacity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RatioRule {
    pub minimum_inbound: f64,
    pub minimum_outbound: f64,
}

impl RatioRule {
    pub fn new(minimum_inbound: f64, minimum_outbound: f64) -> Self {
        Self {
            minimum_inbound,
            minimum_outbound,
        }
    }

    /// Per-channel surplus on the side that a swap in `action` direction
    /// draws from. Channels with nothing to give are left out.
    fn surplus(&self, action: Action, balances: &[Balances]) -> Vec<ChannelSurplus> {
        balances
            .iter()
            .flat_map(|b| {
                let (current, minimum) = match action {
                    Action::LoopOut => (b.outgoing_ratio(), self.minimum_outbound),
                    _ => (b.incoming_ratio(), self.minimum_inbound),
                };
                let surplus = ((current - minimum) * b.capacity as f64).floor();
                let capacity = b.capacity;

                b.channels.iter().filter_map(move |channel| {
                    if capacity == 0 || surplus <= 0.0 {
                        return None;
                    }
                    Some(ChannelSurplus {
                        channel: *channel,
                        amount: surplus as u64,
                    })
                })
            })
            .collect()
    }
}

impl fmt::Display for RatioRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ratio rule: minimum inbound: {}, minimum outbound: {}",
            self.minimum_inbound, self.minimum_outbound
        )
    }
}

impl LiquidityRule for RatioRule {
    fn validate(&self) -> Result<()> {
        let in_range = |r: f64| (0.0..=1.0).contains(&r);
        if !in_range(self.minimum_inbound) || !in_range(self.minimum_outbound) {
            return Err(LiquidityError::InvalidLiquidityRatio);
        }
        if self.minimum_inbound + self.minimum_outbound >= 1.0 {
            return Err(LiquidityError::InvalidRatioSum);
        }
        Ok(())
    }

    fn evaluate(
        &self,
        balances: &[Balances],
        out_restrictions: &Restrictions,
        in_restrictions: &Restrictions,
    ) -> SwapSet {
        let total = Balances::aggregate(balances);

        let (action, reason) =
            decide_action(&total, self.minimum_inbound, self.minimum_outbound);
        if action == Action::None {
            return SwapSet::empty(action, reason);
        }

        let ratio = shift_for_action(action, &total, self.minimum_inbound, self.minimum_outbound);
        let amount = (ratio * total.capacity as f64) as u64;

        let restrictions = match action {
            Action::LoopOut => out_restrictions,
            _ => in_restrictions,
        };

        if amount < restrictions.minimum {
            return SwapSet::empty(action, Reason::MinimumAmountNotMet);
        }

        let swaps = select_single_swap(
            self.surplus(action, balances),
            amount,
            restrictions.minimum,
            restrictions.maximum,
        );

        SwapSet::new(action, reason, swaps)
    }
}

/// Channel level rule. Thresholds are whole percentages of the channel's
/// capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdRule {
    pub minimum_incoming: u64,
    pub minimum_outgoing: u64,
}

impl ThresholdRule {
    pub fn new(minimum_incoming: u64, minimum_outgoing: u64) -> Self {
        Self {
            minimum_incoming,
            minimum_outgoing,
        }
    }

    fn ratios(&self) -> (f64, f64) {
        (
            self.minimum_incoming as f64 / 100.0,
            self.minimum_outgoing as f64 / 100.0,
        )
    }

    fn classify(&self, balance: &Balances, restrictions: &Restrictions) -> (Action, Reason, u64) {
        let (min_inbound, min_outbound) = self.ratios();

        let (action, reason) = decide_action(balance, min_inbound, min_outbound);
        match action {
            Action::None => return (action, reason, 0),
            // A loop in cannot be pinned to one channel.
            Action::LoopIn => return (Action::None, Reason::Imbalanced, 0),
            Action::LoopOut => {}
        }

        let ratio = shift_for_action(action, balance, min_inbound, min_outbound);
        let amount = (ratio * balance.capacity as f64) as u64;

        if amount < restrictions.minimum {
            return (action, Reason::MinimumAmountNotMet, 0);
        }

        (action, reason, amount.min(restrictions.maximum))
    }

    /// Loop out recommendation for a single channel, if one is needed and
    /// large enough to dispatch.
    pub fn suggest_swap(
        &self,
        balance: &Balances,
        restrictions: &Restrictions,
    ) -> Option<SwapRecommendation> {
        let channel: ChannelId = *balance.channels.first()?;
        match self.classify(balance, restrictions) {
            (Action::LoopOut, Reason::Imbalanced, amount) => {
                Some(SwapRecommendation::new(channel, amount))
            }
            _ => None,
        }
    }
}

impl fmt::Display for ThresholdRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "threshold rule: minimum incoming: {}%, minimum outgoing: {}%",
            self.minimum_incoming, self.minimum_outgoing
        )
    }
}

impl LiquidityRule for ThresholdRule {
    fn validate(&self) -> Result<()> {
        if self.minimum_incoming > 100 || self.minimum_outgoing > 100 {
            return Err(LiquidityError::InvalidThreshold);
        }
        if self.minimum_incoming + self.minimum_outgoing >= 100 {
            return Err(LiquidityError::InvalidThresholdSum);
        }
        Ok(())
    }

    fn evaluate(
        &self,
        balances: &[Balances],
        out_restrictions: &Restrictions,
        _in_restrictions: &Restrictions,
    ) -> SwapSet {
        let balance = Balances::aggregate(balances);
        let (action, reason, _) = self.classify(&balance, out_restrictions);

        match self.suggest_swap(&balance, out_restrictions) {
            Some(swap) => SwapSet::new(action, reason, vec![swap]),
            None => SwapSet::empty(action, reason),
        }
    }
}
