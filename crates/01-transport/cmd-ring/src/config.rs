//! Construction-time configuration for the command ring.

use crate::{RingError, RingResult};

/// Slot count used when no capacity is configured.
pub const DEFAULT_CAPACITY: usize = 8192;

/// Largest slot count accepted by [`RingConfig::validate`].
pub const MAX_CAPACITY: usize = 1 << 24;

/// Environment variable consulted by [`RingConfig::from_env`].
pub const CAPACITY_ENV: &str = "CMD_RING_CAPACITY";

/// Configuration describing the shape of a [`Ring`](crate::Ring).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RingConfig {
    /// Number of slots, and therefore the bound on in-flight admissions.
    /// Must be a power of two.
    pub capacity: usize,
}

impl RingConfig {
    /// Configuration with an explicit slot count.
    pub const fn with_capacity(capacity: usize) -> Self {
        Self { capacity }
    }

    /// Reads the capacity from [`CAPACITY_ENV`], falling back to [`DEFAULT_CAPACITY`].
    pub fn from_env() -> RingResult<Self> {
        match std::env::var(CAPACITY_ENV) {
            Ok(raw) => Self::parse_capacity(&raw),
            Err(std::env::VarError::NotPresent) => Ok(Self::default()),
            Err(err) => Err(RingError::InvalidConfig(format!("{CAPACITY_ENV}: {err}"))),
        }
    }

    fn parse_capacity(raw: &str) -> RingResult<Self> {
        let capacity = raw.trim().parse::<usize>().map_err(|err| {
            RingError::InvalidConfig(format!("{CAPACITY_ENV}={raw:?}: {err}"))
        })?;
        let config = Self::with_capacity(capacity);
        config.validate()?;
        Ok(config)
    }

    /// Checks that the capacity can back a ring.
    pub fn validate(&self) -> RingResult<()> {
        let capacity = self.capacity;
        if capacity == 0 || !capacity.is_power_of_two() || capacity > MAX_CAPACITY {
            return Err(RingError::InvalidCapacity {
                requested: capacity,
                maximum: MAX_CAPACITY,
            });
        }
        Ok(())
    }

    /// Index mask derived from the capacity.
    pub const fn mask(&self) -> u64 {
        (self.capacity as u64).wrapping_sub(1)
    }
}

impl Default for RingConfig {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}
