use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use uuid::Uuid;

use crate::cursor::LogCursor;
use crate::detector::DropWindow;
use crate::firewall::RuleRef;

/// Blocking granularity: one source address as seen by one guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TrackKey {
    pub target_id: u32,
    pub source: IpAddr,
}

impl TrackKey {
    pub fn new(target_id: u32, source: IpAddr) -> Self {
        Self { target_id, source }
    }
}

impl fmt::Display for TrackKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.target_id, self.source)
    }
}

impl FromStr for TrackKey {
    type Err = String;

    // The target is numeric, so the first ':' separates it even for IPv6 sources.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (target, source) = s
            .split_once(':')
            .ok_or_else(|| format!("track key '{s}' has no ':' separator"))?;
        let target_id = target
            .parse::<u32>()
            .map_err(|e| format!("track key '{s}': bad target: {e}"))?;
        let source = source
            .parse::<IpAddr>()
            .map_err(|e| format!("track key '{s}': bad source: {e}"))?;
        Ok(Self { target_id, source })
    }
}

impl Serialize for TrackKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TrackKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Local bookkeeping for one firewall rule this warden owns.
/// A record without expiration is permanent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRecord {
    pub rule_reference: RuleRef,
    pub expiration: Option<DateTime<Utc>>,
    pub correlation_id: Uuid,
}

impl BlockRecord {
    pub fn is_permanent(&self) -> bool {
        self.expiration.is_none()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration.is_some_and(|at| at < now)
    }
}

/// Everything that must survive between runs, snapshotted as one unit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WardenState {
    pub cursor: LogCursor,
    pub windows: BTreeMap<TrackKey, DropWindow>,
    pub blocks: BTreeMap<TrackKey, BlockRecord>,
}

impl WardenState {
    pub fn is_blocked(&self, key: &TrackKey) -> bool {
        self.blocks.contains_key(key)
    }

    pub fn is_permanently_blocked(&self, key: &TrackKey) -> bool {
        self.blocks.get(key).is_some_and(BlockRecord::is_permanent)
    }

    /// Drops the key's record and its drop history together.
    pub fn clear_key(&mut self, key: &TrackKey) -> Option<BlockRecord> {
        self.windows.remove(key);
        self.blocks.remove(key)
    }
}
