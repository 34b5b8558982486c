use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use log::{debug, info, warn};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use crate::audit::AuditTrail;
use crate::config::WardenConfig;
use crate::cursor::LogReader;
use crate::detector::DropRateDetector;
use crate::escalation::EscalationPolicy;
use crate::firewall::RuleStore;
use crate::geo::{GeoLookup, GeoPolicy, GeoVerdict};
use crate::lifecycle::{BlockCause, BlockManager, BlockOutcome};
use crate::parser::{Event, Verdict, parse_line};
use crate::snapshot::{AuditStore, StateStore};
use crate::state::{TrackKey, WardenState};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub lines: usize,
    pub events: usize,
    pub blocked: usize,
    pub adopted: usize,
    pub block_failures: usize,
    pub unblocked: usize,
    pub unblock_failures: usize,
}

impl RunSummary {
    fn record(&mut self, outcome: BlockOutcome) {
        match outcome {
            BlockOutcome::Created(_) => self.blocked += 1,
            BlockOutcome::Adopted => self.adopted += 1,
            BlockOutcome::Failed => self.block_failures += 1,
            BlockOutcome::AlreadyBlocked | BlockOutcome::Deferred => {}
        }
    }
}

/// Everything one run needs, injected by the caller and released when
/// the warden is dropped.
pub struct Warden<G, F> {
    log_path: PathBuf,
    state_store: StateStore,
    audit_store: AuditStore,
    geo: GeoPolicy<G>,
    rules: F,
    detector: DropRateDetector,
    escalation: EscalationPolicy,
    exclusions: Vec<IpNetwork>,
    exclusions_bypass_geo: bool,
    clock: Box<dyn Fn() -> DateTime<Utc>>,
}

impl<G: GeoLookup, F: RuleStore> Warden<G, F> {
    pub fn new(config: &WardenConfig, geo: GeoPolicy<G>, rules: F) -> Self {
        Self {
            log_path: config.log_path.clone(),
            state_store: StateStore::new(&config.state_path),
            audit_store: AuditStore::new(&config.audit_path),
            geo,
            rules,
            detector: DropRateDetector::new(config.burst_span()),
            escalation: config.escalation_policy(),
            exclusions: config.exclusions.clone(),
            exclusions_bypass_geo: config.exclusions_bypass_geo,
            clock: Box::new(Utc::now),
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    fn is_excluded(&self, addr: IpAddr) -> bool {
        self.exclusions.iter().any(|net| net.contains(addr))
    }

    /// One batch pass: consume new log lines, apply block decisions, sweep
    /// expired blocks, then persist the ledger and the state snapshot.
    ///
    /// Failing to open the log aborts before anything is mutated, leaving
    /// the previous snapshot in place.
    pub async fn run(&self) -> Result<RunSummary> {
        let mut state = self.state_store.load();
        let mut reader = LogReader::open(&self.log_path, &state.cursor)
            .context("cannot start run, previous snapshot left untouched")?;
        let mut audit = self.audit_store.load();

        let mut manager = BlockManager::new(&self.rules, &self.escalation);
        let mut summary = RunSummary::default();

        loop {
            let line = match reader.next_line() {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!(
                        "Read error in {} after offset {}: {}. Stopping here.",
                        self.log_path.display(),
                        reader.cursor().byte_offset,
                        e
                    );
                    break;
                }
            };
            summary.lines += 1;
            let Some(event) = parse_line(&line) else {
                continue;
            };
            summary.events += 1;
            self.handle_event(&mut manager, &mut state, &mut audit, &event, &mut summary)
                .await;
        }
        // committed together with everything derived from those lines
        state.cursor = reader.cursor();

        let sweep = manager.sweep(&mut state, (self.clock)()).await;
        summary.unblocked = sweep.removed;
        summary.unblock_failures = sweep.failed;

        // ledger first: a crash between the writes re-derives state, never loses history
        self.audit_store
            .save(&audit)
            .context("failed to write audit ledger")?;
        self.state_store
            .save(&state)
            .context("failed to write state snapshot")?;

        info!(
            "Run complete: {} lines, {} events, {} blocked, {} adopted, {} unblocked, {} failed operations",
            summary.lines,
            summary.events,
            summary.blocked,
            summary.adopted,
            summary.unblocked,
            summary.block_failures + summary.unblock_failures
        );
        Ok(summary)
    }

    async fn handle_event(
        &self,
        manager: &mut BlockManager<'_, F>,
        state: &mut WardenState,
        audit: &mut AuditTrail,
        event: &Event,
        summary: &mut RunSummary,
    ) {
        let key = TrackKey::new(event.target_id, event.source);
        let excluded = self.is_excluded(event.source);
        let now = (self.clock)();

        // Geo and drop-rate are independent checks; a geo block makes the
        // key permanent, which in turn stops window accumulation.
        if !(excluded && self.exclusions_bypass_geo) && !state.is_permanently_blocked(&key) {
            match self.geo.evaluate(event.source) {
                GeoVerdict::Disallowed(country) => {
                    let cause = BlockCause::DisallowedCountry(country);
                    let outcome = manager.block(state, audit, key, cause, now).await;
                    summary.record(outcome);
                }
                GeoVerdict::Allowed(_) => {}
                GeoVerdict::Unknown => debug!("No country for {}", event.source),
            }
        }

        if event.verdict != Verdict::Drop || excluded || state.is_blocked(&key) {
            return;
        }
        if self
            .detector
            .observe(&mut state.windows, key, event.timestamp)
        {
            let outcome = manager
                .block(state, audit, key, BlockCause::DropBurst, now)
                .await;
            summary.record(outcome);
        }
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }
}
