use crate::liquidity::balances::ChannelId;
use crate::liquidity::error::{LiquidityError, Result};
use crate::liquidity::fees::FeeLimits;
use crate::liquidity::rules::{LiquidityRule, RatioRule, ThresholdRule};
use chrono::Duration;
use std::collections::HashMap;
use std::fmt;

/// Wait this long after an off-chain payment failure before suggesting a
/// swap over the same channels again.
pub const DEFAULT_FAILURE_BACKOFF_HOURS: i64 = 24;

/// Longest failure backoff accepted, one year.
pub const MAXIMUM_FAILURE_BACKOFF_HOURS: i64 = 24 * 365;

pub const DEFAULT_CONF_TARGET: u32 = 100;

/// Lowest confirmation target the server accepts for loop out sweeps.
pub const MINIMUM_CONF_TARGET: u32 = 2;

pub const DEFAULT_MAX_IN_FLIGHT: usize = 1;

/// Everything the manager needs to decide on swaps. Replaced wholesale on
/// update and handed out as copies.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameters {
    /// Rule applied to the node's channels as a whole.
    pub node_rule: Option<RatioRule>,
    /// Rule applied to each peer's channels.
    pub peer_rule: Option<RatioRule>,
    /// Per-channel rules. Channels listed here are left out of node and
    /// peer aggregation.
    pub channel_rules: HashMap<ChannelId, ThresholdRule>,
    pub include_private: bool,
    pub failure_backoff: Duration,
    pub fee_limits: FeeLimits,
    /// Confirmation target used for loop out quotes.
    pub conf_target: u32,
    pub max_in_flight: usize,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            node_rule: None,
            peer_rule: None,
            channel_rules: HashMap::new(),
            include_private: false,
            failure_backoff: Duration::hours(DEFAULT_FAILURE_BACKOFF_HOURS),
            fee_limits: FeeLimits::default(),
            conf_target: DEFAULT_CONF_TARGET,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }
}

impl Parameters {
    pub fn has_rules(&self) -> bool {
        self.node_rule.is_some() || self.peer_rule.is_some() || !self.channel_rules.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_rule.is_some() && self.peer_rule.is_some() {
            return Err(LiquidityError::SingleRule);
        }

        for rule in self.node_rule.iter().chain(self.peer_rule.iter()) {
            rule.validate()?;
        }

        for (channel, rule) in &self.channel_rules {
            if channel.is_zero() {
                return Err(LiquidityError::ZeroChannelId);
            }
            rule.validate()?;
        }

        if self.conf_target < MINIMUM_CONF_TARGET {
            return Err(LiquidityError::InvalidConfTarget {
                minimum: MINIMUM_CONF_TARGET,
                got: self.conf_target,
            });
        }

        self.fee_limits.validate()?;

        if self.max_in_flight == 0 {
            return Err(LiquidityError::InvalidInFlightLimit);
        }

        if self.failure_backoff < Duration::zero()
            || self.failure_backoff > Duration::hours(MAXIMUM_FAILURE_BACKOFF_HOURS)
        {
            return Err(LiquidityError::InvalidFailureBackoff {
                maximum_hours: MAXIMUM_FAILURE_BACKOFF_HOURS,
            });
        }

        Ok(())
    }
}

impl fmt::Display for Parameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.node_rule, &self.peer_rule) {
            (Some(rule), _) => write!(f, "node: {}", rule)?,
            (_, Some(rule)) => write!(f, "per peer: {}", rule)?,
            _ => write!(f, "no node/peer rule")?,
        }

        let mut channels: Vec<_> = self.channel_rules.iter().collect();
        channels.sort_by_key(|(id, _)| **id);
        for (id, rule) in channels {
            write!(f, "; channel {}: {}", id, rule)?;
        }

        write!(
            f,
            "; include private: {}, failure backoff: {}h, conf target: {}, max in flight: {}",
            self.include_private,
            self.failure_backoff.num_hours(),
            self.conf_target,
            self.max_in_flight
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_has_no_rules() {
        let params = Parameters::default();
        assert!(!params.has_rules());
        assert!(params.validate().is_ok());
        assert_eq!(params.failure_backoff, Duration::hours(24));
        assert_eq!(params.conf_target, 100);
        assert_eq!(params.max_in_flight, 1);
    }

    #[test]
    fn test_node_and_peer_rule_exclusive() {
        let params = Parameters {
            node_rule: Some(RatioRule::new(0.2, 0.2)),
            peer_rule: Some(RatioRule::new(0.2, 0.2)),
            ..Default::default()
        };
        assert!(matches!(params.validate(), Err(LiquidityError::SingleRule)));
    }

    #[test]
    fn test_zero_channel_id() {
        let mut params = Parameters::default();
        params.channel_rules.insert(ChannelId(0), ThresholdRule::new(10, 10));
        assert!(matches!(params.validate(), Err(LiquidityError::ZeroChannelId)));
    }

    #[test]
    fn test_invalid_rules_rejected() {
        let params = Parameters {
            peer_rule: Some(RatioRule::new(0.6, 0.6)),
            ..Default::default()
        };
        assert!(matches!(params.validate(), Err(LiquidityError::InvalidRatioSum)));

        let mut params = Parameters::default();
        params.channel_rules.insert(ChannelId(1), ThresholdRule::new(101, 0));
        assert!(matches!(params.validate(), Err(LiquidityError::InvalidThreshold)));
    }

    #[test]
    fn test_conf_target_minimum() {
        let params = Parameters {
            conf_target: 1,
            ..Default::default()
        };
        let err = params.validate().unwrap_err();
        assert!(err.is_invalid_config());
        assert!(matches!(err, LiquidityError::InvalidConfTarget { minimum: 2, got: 1 }));
    }

    #[test]
    fn test_in_flight_limit() {
        let params = Parameters {
            max_in_flight: 0,
            ..Default::default()
        };
        assert!(matches!(params.validate(), Err(LiquidityError::InvalidInFlightLimit)));
    }

    #[test]
    fn test_failure_backoff_bounds() {
        let params = Parameters {
            failure_backoff: Duration::hours(-1),
            ..Default::default()
        };
        assert!(matches!(
            params.validate(),
            Err(LiquidityError::InvalidFailureBackoff { .. })
        ));

        let params = Parameters {
            failure_backoff: Duration::MAX,
            ..Default::default()
        };
        let err = params.validate().unwrap_err();
        assert!(err.is_invalid_config());

        let params = Parameters {
            failure_backoff: Duration::hours(MAXIMUM_FAILURE_BACKOFF_HOURS),
            ..Default::default()
        };
        assert!(params.validate().is_ok());

        let params = Parameters {
            failure_backoff: Duration::zero(),
            ..Default::default()
        };
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_display_lists_channel_rules_in_order() {
        let mut params = Parameters {
            node_rule: Some(RatioRule::new(0.2, 0.3)),
            ..Default::default()
        };
        params.channel_rules.insert(ChannelId(9), ThresholdRule::new(10, 10));
        params.channel_rules.insert(ChannelId(1), ThresholdRule::new(20, 20));

        let s = params.to_string();
        let first = s.find("channel 0:0:1").unwrap();
        let second = s.find("channel 0:0:9").unwrap();
        assert!(s.starts_with("node: ratio rule"));
        assert!(first < second);
    }
}
