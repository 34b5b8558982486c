use chrono::{TimeZone, Utc};
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::Mutex;
use uuid::Uuid;

use crate::audit::{AuditEntry, BlockReason};
use crate::firewall::{FirewallError, FirewallRule, RuleRef, RuleSpec, RuleStore};
use crate::geo::GeoLookup;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Create(u32, IpAddr),
    List(u32),
    Delete(u32, RuleRef),
}

#[derive(Default)]
struct Inner {
    rules: BTreeMap<u32, Vec<FirewallRule>>,
    next_id: u64,
    calls: Vec<Call>,
    fail_create: bool,
    fail_list: bool,
    fail_delete: bool,
}

/// In-memory rule store that records every call.
#[derive(Default)]
pub struct MockRuleStore {
    inner: Mutex<Inner>,
}

impl MockRuleStore {
    pub fn fail_creates(&self, fail: bool) {
        self.inner.lock().unwrap().fail_create = fail;
    }

    pub fn fail_lists(&self, fail: bool) {
        self.inner.lock().unwrap().fail_list = fail;
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.inner.lock().unwrap().fail_delete = fail;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn create_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Create(..)))
            .count()
    }

    pub fn delete_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Delete(..)))
            .count()
    }

    pub fn rules(&self, target_id: u32) -> Vec<FirewallRule> {
        self.inner
            .lock()
            .unwrap()
            .rules
            .get(&target_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Places a rule directly, without recording a call.
    pub fn seed_rule(&self, target_id: u32, source: &str, comment: &str) -> RuleRef {
        let mut inner = self.inner.lock().unwrap();
        let reference = RuleRef(inner.next_id.to_string());
        inner.next_id += 1;
        let rules = inner.rules.entry(target_id).or_default();
        rules.push(FirewallRule {
            reference: reference.clone(),
            source: Some(source.to_string()),
            comment: Some(comment.to_string()),
        });
        reference
    }

    fn rejected(command: &str) -> FirewallError {
        FirewallError::Rejected {
            command: command.to_string(),
            stderr: "injected failure".to_string(),
        }
    }
}

impl RuleStore for MockRuleStore {
    async fn create(&self, target_id: u32, rule: &RuleSpec) -> Result<RuleRef, FirewallError> {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.calls.push(Call::Create(target_id, rule.source));
            if inner.fail_create {
                return Err(Self::rejected("create"));
            }
        }
        Ok(self.seed_rule(target_id, &rule.source.to_string(), &rule.comment))
    }

    async fn list(&self, target_id: u32) -> Result<Vec<FirewallRule>, FirewallError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(Call::List(target_id));
        if inner.fail_list {
            return Err(Self::rejected("list"));
        }
        Ok(inner.rules.get(&target_id).cloned().unwrap_or_default())
    }

    async fn delete(&self, target_id: u32, reference: &RuleRef) -> Result<(), FirewallError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(Call::Delete(target_id, reference.clone()));
        if inner.fail_delete {
            return Err(Self::rejected("delete"));
        }
        let rules = inner.rules.entry(target_id).or_default();
        let before = rules.len();
        rules.retain(|r| &r.reference != reference);
        if rules.len() == before {
            return Err(Self::rejected("delete: no such rule"));
        }
        Ok(())
    }
}

/// Fixed address-to-country table.
pub struct StaticGeo(HashMap<IpAddr, String>);

impl StaticGeo {
    pub fn new<const N: usize>(entries: [(&str, &str); N]) -> Self {
        Self(
            entries
                .into_iter()
                .map(|(addr, code)| (addr.parse().unwrap(), code.to_string()))
                .collect(),
        )
    }
}

impl GeoLookup for StaticGeo {
    fn country(&self, addr: IpAddr) -> Option<String> {
        self.0.get(&addr).cloned()
    }
}

/// `count` past drop-rate blocks of `addr` on `target_id`.
pub fn audit_entries(addr: &str, target_id: u32, count: usize) -> Vec<AuditEntry> {
    (0..count)
        .map(|i| AuditEntry {
            timestamp: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
                + chrono::Duration::days(i as i64),
            target_id,
            source_address: addr.parse().unwrap(),
            correlation_id: Uuid::new_v4(),
            rule_reference: RuleRef(i.to_string()),
            expiration: Some(Utc.with_ymd_and_hms(2025, 1, 1, 1, 0, 0).unwrap()),
            reason: BlockReason::MultipleDrops,
            prior_block_count: i,
        })
        .collect()
}
