use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;
use uuid::Uuid;

use crate::firewall::RuleRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockReason {
    #[serde(rename = "disallowed country")]
    DisallowedCountry,
    #[serde(rename = "multiple drops")]
    MultipleDrops,
}

/// One block decision. Entries are never edited once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub target_id: u32,
    pub source_address: IpAddr,
    pub correlation_id: Uuid,
    pub rule_reference: RuleRef,
    #[serde(with = "expiration_label")]
    pub expiration: Option<DateTime<Utc>>,
    pub reason: BlockReason,
    #[serde(default)]
    pub prior_block_count: usize,
}

/// Append-only history of block decisions, keyed for lookups by correlation id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuditTrail {
    entries: Vec<AuditEntry>,
    ids: HashSet<Uuid>,
}

impl AuditTrail {
    pub fn from_entries(entries: impl IntoIterator<Item = AuditEntry>) -> Self {
        let mut trail = Self::default();
        for entry in entries {
            trail.append(entry);
        }
        trail
    }

    /// Returns false, leaving the ledger unchanged, when an entry with
    /// the same correlation id is already recorded.
    pub fn append(&mut self, entry: AuditEntry) -> bool {
        if !self.ids.insert(entry.correlation_id) {
            return false;
        }
        self.entries.push(entry);
        true
    }

    pub fn entries(&self) -> &[AuditEntry] {
        &self.entries
    }

    /// Blocks previously issued against `addr` on any target.
    pub fn prior_block_count(&self, addr: IpAddr) -> usize {
        self.entries
            .iter()
            .filter(|e| e.source_address == addr)
            .count()
    }

    /// Per-address block counts, most blocked first.
    pub fn counts_by_address(&self) -> Vec<(IpAddr, usize)> {
        let mut counts: BTreeMap<IpAddr, usize> = BTreeMap::new();
        for entry in &self.entries {
            *counts.entry(entry.source_address).or_default() += 1;
        }
        let mut counts: Vec<_> = counts.into_iter().collect();
        counts.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        counts
    }
}

/// Expirations are stored as "permanent" or an RFC 3339 timestamp.
pub(crate) mod expiration_label {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    const PERMANENT: &str = "permanent";

    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(at) => serializer.serialize_str(&at.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
            None => serializer.serialize_str(PERMANENT),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if raw == PERMANENT {
            return Ok(None);
        }
        DateTime::parse_from_rfc3339(&raw)
            .map(|at| Some(at.with_timezone(&Utc)))
            .map_err(serde::de::Error::custom)
    }
}
