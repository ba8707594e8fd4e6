//! Progressive penalty calculation.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::check_duration_secs;
use crate::error::{BulwarkError, Result};

/// Escalation settings shared by every strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PenaltyConfig {
    /// Growth factor applied per repeat violation
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Longest block ever handed out, in seconds
    #[serde(default = "default_cap")]
    pub cap_secs: u64,
}

impl Default for PenaltyConfig {
    fn default() -> Self {
        Self {
            multiplier: default_multiplier(),
            cap_secs: default_cap(),
        }
    }
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_cap() -> u64 {
    86400
}

impl PenaltyConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(BulwarkError::Config(format!(
                "penalty.multiplier must be a finite number >= 1, got {}",
                self.multiplier
            )));
        }
        if self.cap_secs == 0 {
            return Err(BulwarkError::Config("penalty.cap_secs must be positive".into()));
        }
        check_duration_secs("penalty.cap_secs", self.cap_secs)
    }

    pub fn cap(&self) -> Duration {
        Duration::from_secs(self.cap_secs)
    }
}

/// Exponential backoff over prior violations of a scope key.
#[derive(Debug, Clone, Copy)]
pub struct Escalation {
    multiplier: f64,
    cap: Duration,
}

impl Escalation {
    pub fn new(config: &PenaltyConfig) -> Self {
        Self {
            multiplier: config.multiplier,
            cap: config.cap(),
        }
    }

    /// `min(base * multiplier^(v - 1), cap)`; a count of zero is treated as a first offence.
    pub fn next_block_duration(&self, base: Duration, violation_count: u32) -> Duration {
        let exponent = violation_count.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = base.as_secs_f64() * self.multiplier.powi(exponent);

        if !secs.is_finite() || secs >= self.cap.as_secs_f64() {
            return self.cap;
        }
        Duration::from_secs_f64(secs)
    }

    pub fn cap(&self) -> Duration {
        self.cap
    }
}

impl Default for Escalation {
    fn default() -> Self {
        Self::new(&PenaltyConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_offence_gets_base() {
        let escalation = Escalation::default();
        let base = Duration::from_secs(300);
        assert_eq!(escalation.next_block_duration(base, 1), base);
        assert_eq!(escalation.next_block_duration(base, 0), base);
    }

    #[test]
    fn test_repeat_offences_double_until_cap() {
        let escalation = Escalation::new(&PenaltyConfig {
            multiplier: 2.0,
            cap_secs: 3600,
        });
        let base = Duration::from_secs(300);

        let durations: Vec<u64> = (1..=6)
            .map(|v| escalation.next_block_duration(base, v).as_secs())
            .collect();
        assert_eq!(durations, vec![300, 600, 1200, 2400, 3600, 3600]);
    }

    #[test]
    fn test_penalty_is_non_decreasing() {
        let escalation = Escalation::new(&PenaltyConfig {
            multiplier: 1.5,
            cap_secs: 86400,
        });
        let base = Duration::from_secs(60);
        let mut previous = Duration::ZERO;
        for v in 1..200 {
            let next = escalation.next_block_duration(base, v);
            assert!(next >= previous);
            previous = next;
        }
        assert_eq!(previous, Duration::from_secs(86400));
    }

    #[test]
    fn test_huge_violation_count_saturates_at_cap() {
        let escalation = Escalation::default();
        let duration = escalation.next_block_duration(Duration::from_secs(1), u32::MAX);
        assert_eq!(duration, escalation.cap());
    }

    #[test]
    fn test_invalid_multiplier_rejected() {
        let config = PenaltyConfig {
            multiplier: 0.5,
            cap_secs: 10,
        };
        assert!(config.validate().is_err());

        let config = PenaltyConfig {
            multiplier: f64::NAN,
            cap_secs: 10,
        };
        assert!(config.validate().is_err());
    }
}
