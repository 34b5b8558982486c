use chrono::{DateTime, Utc};
use log::{error, info, warn};
use std::collections::HashSet;
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditTrail, BlockReason};
use crate::escalation::{EscalationPolicy, Tier};
use crate::firewall::{Annotation, FirewallError, FirewallRule, RuleSpec, RuleStore};
use crate::state::{BlockRecord, TrackKey, WardenState};

/// Why a key should be blocked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockCause {
    DisallowedCountry(String),
    DropBurst,
}

impl BlockCause {
    fn reason(&self) -> BlockReason {
        match self {
            BlockCause::DisallowedCountry(_) => BlockReason::DisallowedCountry,
            BlockCause::DropBurst => BlockReason::MultipleDrops,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    Created(Tier),
    /// A rule left behind by an interrupted run was taken over.
    Adopted,
    AlreadyBlocked,
    /// Already attempted earlier in this run.
    Deferred,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: usize,
    pub failed: usize,
}

/// Drives the per-key block state machine against the external rule store.
///
/// Records change only after the store confirms the operation. A failed
/// operation leaves the key as it was and is retried on a later run, never
/// within the same one.
pub struct BlockManager<'a, F> {
    store: &'a F,
    policy: &'a EscalationPolicy,
    attempted: HashSet<TrackKey>,
}

impl<'a, F: RuleStore> BlockManager<'a, F> {
    pub fn new(store: &'a F, policy: &'a EscalationPolicy) -> Self {
        Self {
            store,
            policy,
            attempted: HashSet::new(),
        }
    }

    pub async fn block(
        &mut self,
        state: &mut WardenState,
        audit: &mut AuditTrail,
        key: TrackKey,
        cause: BlockCause,
        now: DateTime<Utc>,
    ) -> BlockOutcome {
        let wants_permanent = matches!(cause, BlockCause::DisallowedCountry(_));
        if let Some(record) = state.blocks.get(&key) {
            // only a geo verdict can escalate a temporary block
            if record.is_permanent() || !wants_permanent {
                return BlockOutcome::AlreadyBlocked;
            }
        }
        if !self.attempted.insert(key) {
            return BlockOutcome::Deferred;
        }

        let rules = match self.store.list(key.target_id).await {
            Ok(rules) => rules,
            Err(e) => {
                error!(
                    "❌ Cannot list rules of target {} before blocking {}: {}",
                    key.target_id, key.source, e
                );
                return BlockOutcome::Failed;
            }
        };

        let superseded = match state.blocks.get(&key) {
            Some(record) => find_by_id(&rules, record.correlation_id),
            None => match find_orphan(&rules, &key) {
                Some((rule, annotation)) if annotation.permanent || !wants_permanent => {
                    self.adopt(state, audit, key, rule, annotation, now);
                    return BlockOutcome::Adopted;
                }
                Some((rule, _)) => Some(rule),
                None => None,
            },
        };
        if let Some(rule) = superseded {
            if let Err(e) = self.store.delete(key.target_id, &rule.reference).await {
                error!(
                    "❌ Cannot remove temporary rule for {} before escalating: {}",
                    key, e
                );
                return BlockOutcome::Failed;
            }
            info!(
                "Removed temporary rule {} for {} ahead of permanent block",
                rule.reference.0, key
            );
        }
        // the drop window survives until a rule is confirmed
        state.blocks.remove(&key);

        match self.create(state, audit, key, &cause, now).await {
            Ok(tier) => BlockOutcome::Created(tier),
            Err(e) => {
                error!(
                    "❌ Failed to block {} on target {}: {}",
                    key.source, key.target_id, e
                );
                BlockOutcome::Failed
            }
        }
    }

    async fn create(
        &self,
        state: &mut WardenState,
        audit: &mut AuditTrail,
        key: TrackKey,
        cause: &BlockCause,
        now: DateTime<Utc>,
    ) -> Result<Tier, FirewallError> {
        let prior = audit.prior_block_count(key.source);
        let tier = match cause {
            BlockCause::DisallowedCountry(_) => Tier::Permanent,
            BlockCause::DropBurst => self.policy.tier(prior),
        };
        let correlation_id = Uuid::new_v4();
        let expiration = self.policy.expiration(tier, now);
        let annotation = Annotation {
            correlation_id,
            reason: cause.reason(),
            permanent: expiration.is_none(),
            expiration,
        };
        let rule = RuleSpec {
            source: key.source,
            correlation_id,
            comment: annotation.render(now),
        };

        let reference = self.store.create(key.target_id, &rule).await?;

        match cause {
            BlockCause::DisallowedCountry(country) => warn!(
                "⛔ GEO-BLOCKED: {} ({}) on target {} permanently",
                key.source, country, key.target_id
            ),
            BlockCause::DropBurst => warn!(
                "⛔ BANNED: {} on target {} ({} tier, {} prior blocks)",
                key.source, key.target_id, tier, prior
            ),
        }

        state.clear_key(&key);
        state.blocks.insert(
            key,
            BlockRecord {
                rule_reference: reference.clone(),
                expiration,
                correlation_id,
            },
        );
        audit.append(AuditEntry {
            timestamp: now,
            target_id: key.target_id,
            source_address: key.source,
            correlation_id,
            rule_reference: reference,
            expiration,
            reason: cause.reason(),
            prior_block_count: prior,
        });
        Ok(tier)
    }

    fn adopt(
        &self,
        state: &mut WardenState,
        audit: &mut AuditTrail,
        key: TrackKey,
        rule: &FirewallRule,
        annotation: Annotation,
        now: DateTime<Utc>,
    ) {
        // temporary rules from before expirations were embedded expire now
        let expiration = if annotation.permanent {
            None
        } else {
            Some(annotation.expiration.unwrap_or(now))
        };
        warn!(
            "Adopting existing rule {} (ID {}) for {}",
            rule.reference.0, annotation.correlation_id, key
        );
        let prior = audit.prior_block_count(key.source);
        state.clear_key(&key);
        state.blocks.insert(
            key,
            BlockRecord {
                rule_reference: rule.reference.clone(),
                expiration,
                correlation_id: annotation.correlation_id,
            },
        );
        audit.append(AuditEntry {
            timestamp: now,
            target_id: key.target_id,
            source_address: key.source,
            correlation_id: annotation.correlation_id,
            rule_reference: rule.reference.clone(),
            expiration,
            reason: annotation.reason,
            prior_block_count: prior,
        });
    }

    /// Removes every temporary block that expired before `now`.
    pub async fn sweep(&mut self, state: &mut WardenState, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        let expired: Vec<(TrackKey, Uuid)> = state
            .blocks
            .iter()
            .filter(|(_, record)| record.is_expired(now))
            .map(|(key, record)| (*key, record.correlation_id))
            .collect();

        for (key, correlation_id) in expired {
            // Positions shift as rules are removed, so resolve each one fresh.
            let rules = match self.store.list(key.target_id).await {
                Ok(rules) => rules,
                Err(e) => {
                    warn!(
                        "Cannot list rules of target {} to unblock {}: {}",
                        key.target_id, key.source, e
                    );
                    report.failed += 1;
                    continue;
                }
            };
            match find_by_id(&rules, correlation_id) {
                Some(rule) => {
                    if let Err(e) = self.store.delete(key.target_id, &rule.reference).await {
                        warn!(
                            "Failed to remove rule {} for {}: {}",
                            rule.reference.0, key, e
                        );
                        report.failed += 1;
                        continue;
                    }
                    info!("✅ Unblocked {} on target {}", key.source, key.target_id);
                }
                None => info!("Rule for {} (ID {}) is already gone", key, correlation_id),
            }
            state.clear_key(&key);
            report.removed += 1;
        }
        report
    }
}

fn find_by_id(rules: &[FirewallRule], correlation_id: Uuid) -> Option<&FirewallRule> {
    rules.iter().find(|rule| {
        rule.annotation()
            .is_some_and(|a| a.correlation_id == correlation_id)
    })
}

/// A warden-annotated rule for the key's source with no local record.
fn find_orphan<'r>(
    rules: &'r [FirewallRule],
    key: &TrackKey,
) -> Option<(&'r FirewallRule, Annotation)> {
    rules
        .iter()
        .filter(|rule| rule.matches_source(key.source))
        .find_map(|rule| rule.annotation().map(|a| (rule, a)))
}
