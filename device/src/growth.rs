//! Amortized capacity growth shared by every container.
//!
//! A container grows only when the requested length exceeds its capacity. The new capacity is
//! `align_up(ceil(factor * n + headroom), granularity)`; capacity never shrinks.
//!
//! The granularity is counted in elements, not bytes, so large element types over-allocate
//! proportionally. Callers depend on the resulting capacity values, so this is kept as is.

use bon::bon;
use snafu::ensure;

use crate::error::{Error, InvalidConfigSnafu, Result};

/// Capacity growth rule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GrowthPolicy {
    factor: f64,
    headroom: usize,
    granularity: usize,
}

impl GrowthPolicy {
    pub const DEFAULT_FACTOR: f64 = 1.1;
    pub const DEFAULT_HEADROOM: usize = 10;
    pub const DEFAULT_GRANULARITY: usize = 128;

    /// Policy with the default constants.
    pub const fn standard() -> Self {
        Self { factor: Self::DEFAULT_FACTOR, headroom: Self::DEFAULT_HEADROOM, granularity: Self::DEFAULT_GRANULARITY }
    }

    /// Read the policy from the environment.
    ///
    /// # Environment Variables
    ///
    /// * `CELLFLOW_GROWTH_FACTOR` - multiplicative factor (default: 1.1)
    /// * `CELLFLOW_GROWTH_HEADROOM` - additive element count (default: 10)
    /// * `CELLFLOW_GROWTH_GRANULARITY` - capacity rounding in elements (default: 128)
    ///
    /// Unparsable or invalid values are ignored with a warning.
    pub fn from_env() -> Self {
        let factor = env_value("CELLFLOW_GROWTH_FACTOR").unwrap_or(Self::DEFAULT_FACTOR);
        let headroom = env_value("CELLFLOW_GROWTH_HEADROOM").unwrap_or(Self::DEFAULT_HEADROOM);
        let granularity = env_value("CELLFLOW_GROWTH_GRANULARITY").unwrap_or(Self::DEFAULT_GRANULARITY);

        match Self::validated(factor, headroom, granularity) {
            Ok(policy) => policy,
            Err(error) => {
                tracing::warn!(%error, "ignoring growth policy from environment");
                Self::standard()
            }
        }
    }

    fn validated(factor: f64, headroom: usize, granularity: usize) -> Result<Self> {
        ensure!(
            factor.is_finite() && factor >= 1.0,
            InvalidConfigSnafu { key: "growth factor", value: factor.to_string(), reason: "must be finite and >= 1" }
        );
        ensure!(
            granularity.is_power_of_two(),
            InvalidConfigSnafu {
                key: "growth granularity",
                value: granularity.to_string(),
                reason: "must be a non-zero power of two"
            }
        );
        Ok(Self { factor, headroom, granularity })
    }

    pub fn factor(&self) -> f64 {
        self.factor
    }

    pub fn headroom(&self) -> usize {
        self.headroom
    }

    pub fn granularity(&self) -> usize {
        self.granularity
    }

    /// Capacity to allocate for `n` elements. Always `>= n` and a multiple of the granularity
    /// (unless saturated at `usize::MAX`).
    pub fn capacity_for(&self, n: usize) -> usize {
        let estimate = (self.factor * n as f64 + self.headroom as f64).ceil();
        // `as` saturates for values beyond usize::MAX.
        let estimate = (estimate as usize).max(n);
        estimate.div_ceil(self.granularity).saturating_mul(self.granularity)
    }

    /// New capacity if a container holding `capacity` elements must reallocate to hold `n`.
    pub fn plan(&self, capacity: usize, n: usize) -> Option<usize> {
        (n > capacity).then(|| self.capacity_for(n))
    }
}

#[bon]
impl GrowthPolicy {
    /// Create a growth policy with builder pattern.
    #[builder]
    pub fn new(
        #[builder(default = GrowthPolicy::DEFAULT_FACTOR)] factor: f64,
        #[builder(default = GrowthPolicy::DEFAULT_HEADROOM)] headroom: usize,
        #[builder(default = GrowthPolicy::DEFAULT_GRANULARITY)] granularity: usize,
    ) -> Result<Self, Error> {
        Self::validated(factor, headroom, granularity)
    }
}

impl Default for GrowthPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

fn env_value<T: std::str::FromStr>(key: &'static str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable growth setting");
            None
        }
    }
}
