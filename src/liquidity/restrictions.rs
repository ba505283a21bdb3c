use serde::{Deserialize, Serialize};
use std::fmt;

/// Server-imposed bounds on swap amount for one swap direction, inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Restrictions {
    pub minimum: u64,
    pub maximum: u64,
}

impl Restrictions {
    pub fn new(minimum: u64, maximum: u64) -> Self {
        Self { minimum, maximum }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.minimum > self.maximum {
            anyhow::bail!(
                "minimum swap amount ({}) exceeds maximum ({})",
                self.minimum,
                self.maximum
            );
        }
        Ok(())
    }
}

impl fmt::Display for Restrictions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{} sat", self.minimum, self.maximum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate() {
        assert!(Restrictions::new(10, 100).validate().is_ok());
        assert!(Restrictions::new(100, 100).validate().is_ok());
        assert!(Restrictions::new(101, 100).validate().is_err());
    }
}
