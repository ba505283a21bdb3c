use std::fmt;
use thiserror::Error;

/// Which component of a swap quote broke our fee limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeeKind {
    Server,
    Miner,
    Prepay,
}

impl fmt::Display for FeeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeeKind::Server => write!(f, "server"),
            FeeKind::Miner => write!(f, "miner"),
            FeeKind::Prepay => write!(f, "prepay"),
        }
    }
}

#[derive(Debug, Error)]
pub enum LiquidityError {
    #[error("liquidity ratio must be in [0;1]")]
    InvalidLiquidityRatio,

    #[error("sum of inbound and outbound ratios must be < 1")]
    InvalidRatioSum,

    #[error("liquidity threshold must be in [0;100]")]
    InvalidThreshold,

    #[error("sum of incoming and outgoing thresholds must be < 100")]
    InvalidThresholdSum,

    #[error("liquidity rules can be set on a per node or per peer basis, not both")]
    SingleRule,

    #[error("zero channel ID not allowed")]
    ZeroChannelId,

    #[error("confirmation target must be at least {minimum}, got {got}")]
    InvalidConfTarget { minimum: u32, got: u32 },

    #[error("swap fee ppm ({0}) cannot exceed 1000000")]
    InvalidFeePpm(u64),

    #[error("in-flight swap limit must be at least 1")]
    InvalidInFlightLimit,

    #[error("failure backoff must be between 0 and {maximum_hours} hours")]
    InvalidFailureBackoff { maximum_hours: i64 },

    #[error("no rules set for swap suggestions")]
    NoRules,

    #[error("upstream failure: {0:#}")]
    Upstream(anyhow::Error),

    #[error("fee too high: {0}")]
    FeeTooHigh(FeeKind),

    #[error("liquidity manager shutting down")]
    ShuttingDown,

    #[error("request cancelled")]
    Cancelled,

    #[error("liquidity manager already started")]
    AlreadyStarted,
}

impl LiquidityError {
    /// True for errors that reject a set of parameters.
    pub fn is_invalid_config(&self) -> bool {
        matches!(
            self,
            LiquidityError::InvalidLiquidityRatio
                | LiquidityError::InvalidRatioSum
                | LiquidityError::InvalidThreshold
                | LiquidityError::InvalidThresholdSum
                | LiquidityError::SingleRule
                | LiquidityError::ZeroChannelId
                | LiquidityError::InvalidConfTarget { .. }
                | LiquidityError::InvalidFeePpm(_)
                | LiquidityError::InvalidInFlightLimit
                | LiquidityError::InvalidFailureBackoff { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, LiquidityError>;
