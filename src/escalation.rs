use chrono::{DateTime, Duration, Utc};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Short,
    Long,
    Permanent,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Short => write!(f, "short"),
            Tier::Long => write!(f, "long"),
            Tier::Permanent => write!(f, "permanent"),
        }
    }
}

/// Maps a source address's block history to the severity of its next block.
#[derive(Debug, Clone)]
pub struct EscalationPolicy {
    pub long_after: usize,
    pub permanent_after: usize,
    pub short_duration: Duration,
    pub long_duration: Duration,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self {
            long_after: 5,
            permanent_after: 7,
            short_duration: Duration::hours(1),
            long_duration: Duration::days(7),
        }
    }
}

impl EscalationPolicy {
    /// `prior_blocks` counts decisions recorded before this one, across all targets.
    pub fn tier(&self, prior_blocks: usize) -> Tier {
        if prior_blocks >= self.permanent_after {
            Tier::Permanent
        } else if prior_blocks >= self.long_after {
            Tier::Long
        } else {
            Tier::Short
        }
    }

    /// `None` for permanent blocks.
    pub fn expiration(&self, tier: Tier, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match tier {
            Tier::Short => Some(now + self.short_duration),
            Tier::Long => Some(now + self.long_duration),
            Tier::Permanent => None,
        }
    }
}
