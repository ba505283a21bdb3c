use crate::liquidity::error::{FeeKind, LiquidityError, Result};
use serde::{Deserialize, Serialize};

/// Parts per million denominator for the swap fee limit.
pub const FEE_BASE: u64 = 1_000_000;

pub const DEFAULT_SWAP_FEE_PPM: u64 = 5000;
pub const DEFAULT_MAX_MINER_FEE: u64 = 15_000;
pub const DEFAULT_MAX_PREPAY: u64 = 30_000;

/// Fees quoted by the swap server for a loop out of a given amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LoopOutQuote {
    pub swap_fee: u64,
    pub miner_fee: u64,
    pub prepay_amount: u64,
}

/// Fees quoted by the swap server for a loop in of a given amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LoopInQuote {
    pub swap_fee: u64,
    pub miner_fee: u64,
}

/// Operator ceilings on what an automatically suggested swap may cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeLimits {
    /// Server fee limit, in parts per million of the swap amount.
    pub max_swap_fee_ppm: u64,
    pub max_miner_fee: u64,
    pub max_prepay: u64,
}

impl Default for FeeLimits {
    fn default() -> Self {
        Self {
            max_swap_fee_ppm: DEFAULT_SWAP_FEE_PPM,
            max_miner_fee: DEFAULT_MAX_MINER_FEE,
            max_prepay: DEFAULT_MAX_PREPAY,
        }
    }
}

impl FeeLimits {
    pub fn validate(&self) -> Result<()> {
        if self.max_swap_fee_ppm > FEE_BASE {
            return Err(LiquidityError::InvalidFeePpm(self.max_swap_fee_ppm));
        }
        Ok(())
    }

    /// Largest server fee we accept for a swap of `amount`.
    pub fn max_swap_fee(&self, amount: u64) -> u64 {
        ((amount as u128 * self.max_swap_fee_ppm as u128) / FEE_BASE as u128) as u64
    }

    pub fn check_loop_out(&self, amount: u64, quote: &LoopOutQuote) -> Result<()> {
        if quote.prepay_amount > self.max_prepay {
            return Err(LiquidityError::FeeTooHigh(FeeKind::Prepay));
        }
        if quote.miner_fee > self.max_miner_fee {
            return Err(LiquidityError::FeeTooHigh(FeeKind::Miner));
        }
        if quote.swap_fee > self.max_swap_fee(amount) {
            return Err(LiquidityError::FeeTooHigh(FeeKind::Server));
        }
        Ok(())
    }

    /// Loop in has no prepay, so only the server and miner fees are checked.
    pub fn check_loop_in(&self, amount: u64, quote: &LoopInQuote) -> Result<()> {
        if quote.miner_fee > self.max_miner_fee {
            return Err(LiquidityError::FeeTooHigh(FeeKind::Miner));
        }
        if quote.swap_fee > self.max_swap_fee(amount) {
            return Err(LiquidityError::FeeTooHigh(FeeKind::Server));
        }
        Ok(())
    }
}
