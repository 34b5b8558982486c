//! On-disk forms of the warden state and the audit ledger.
//!
//! Both files carry a `version` field. Unversioned files written by the
//! original warden are migrated here, at load, so the rest of the crate
//! only ever sees the current in-memory types. Unreadable files load as an
//! empty default and are moved aside by the next save, never by the load.

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cell::Cell;
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditTrail, BlockReason, expiration_label};
use crate::cursor::LogCursor;
use crate::detector::DropWindow;
use crate::firewall::RuleRef;
use crate::state::{BlockRecord, TrackKey, WardenState};

const SCHEMA_VERSION: u64 = 2;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("I/O error on {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported schema version {0}")]
    UnsupportedVersion(u64),
}

// --- state snapshot -------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct StateV2 {
    version: u64,
    cursor: CursorV2,
    #[serde(default)]
    windows: BTreeMap<TrackKey, Vec<DateTime<Utc>>>,
    #[serde(default)]
    blocks: BTreeMap<TrackKey, BlockV2>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CursorV2 {
    file_identity: Option<u64>,
    byte_offset: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct BlockV2 {
    rule_reference: RuleRef,
    expiration: Option<DateTime<Utc>>,
    correlation_id: Uuid,
    permanent: bool,
}

#[derive(Debug, Deserialize)]
struct LegacyState {
    #[serde(default)]
    drops: BTreeMap<String, Vec<DateTime<Utc>>>,
    #[serde(default)]
    blocked: BTreeMap<String, LegacyBlock>,
    #[serde(default)]
    log_file_inode: Option<u64>,
    #[serde(default)]
    log_file_position: u64,
}

#[derive(Debug, Deserialize)]
struct LegacyBlock {
    #[serde(default)]
    rule_index: Value,
    #[serde(default)]
    expiration: Option<DateTime<Utc>>,
    unique_id: Uuid,
    #[serde(default)]
    permanent: bool,
}

impl From<&WardenState> for StateV2 {
    fn from(state: &WardenState) -> Self {
        Self {
            version: SCHEMA_VERSION,
            cursor: CursorV2 {
                file_identity: state.cursor.file_identity,
                byte_offset: state.cursor.byte_offset,
            },
            windows: state
                .windows
                .iter()
                .map(|(key, window)| (*key, window.samples().copied().collect()))
                .collect(),
            blocks: state
                .blocks
                .iter()
                .map(|(key, record)| {
                    (
                        *key,
                        BlockV2 {
                            rule_reference: record.rule_reference.clone(),
                            expiration: record.expiration,
                            correlation_id: record.correlation_id,
                            permanent: record.is_permanent(),
                        },
                    )
                })
                .collect(),
        }
    }
}

impl From<StateV2> for WardenState {
    fn from(v2: StateV2) -> Self {
        WardenState {
            cursor: LogCursor {
                file_identity: v2.cursor.file_identity,
                byte_offset: v2.cursor.byte_offset,
            },
            windows: v2
                .windows
                .into_iter()
                .map(|(key, samples)| (key, DropWindow::from_samples(samples)))
                .collect(),
            blocks: v2
                .blocks
                .into_iter()
                .map(|(key, block)| {
                    (
                        key,
                        BlockRecord {
                            rule_reference: block.rule_reference,
                            expiration: lifetime(block.permanent, block.expiration, &key),
                            correlation_id: block.correlation_id,
                        },
                    )
                })
                .collect(),
        }
    }
}

/// Resolves the permanent flag and expiration into one lifetime. A
/// record with neither could never be swept, so it is kept as permanent.
fn lifetime(
    permanent: bool,
    expiration: Option<DateTime<Utc>>,
    key: &TrackKey,
) -> Option<DateTime<Utc>> {
    match (permanent, expiration) {
        (true, Some(_)) => {
            warn!(
                "Block {} is permanent but has an expiration; keeping it permanent",
                key
            );
            None
        }
        (false, None) => {
            warn!("Block {} has no expiration; treating it as permanent", key);
            None
        }
        (_, expiration) => expiration,
    }
}

fn rule_ref_from_legacy(value: &Value) -> RuleRef {
    match value {
        Value::String(s) => RuleRef(s.clone()),
        Value::Number(n) => RuleRef(n.to_string()),
        _ => RuleRef("unknown".to_string()),
    }
}

fn migrate_legacy_state(legacy: LegacyState) -> WardenState {
    let mut state = WardenState {
        cursor: LogCursor {
            file_identity: legacy.log_file_inode,
            byte_offset: legacy.log_file_position,
        },
        ..WardenState::default()
    };
    for (raw, samples) in legacy.drops {
        match raw.parse::<TrackKey>() {
            Ok(key) => {
                state.windows.insert(key, DropWindow::from_samples(samples));
            }
            Err(e) => warn!("Dropping window during migration: {}", e),
        }
    }
    for (raw, block) in legacy.blocked {
        match raw.parse::<TrackKey>() {
            Ok(key) => {
                let record = BlockRecord {
                    rule_reference: rule_ref_from_legacy(&block.rule_index),
                    expiration: lifetime(block.permanent, block.expiration, &key),
                    correlation_id: block.unique_id,
                };
                state.blocks.insert(key, record);
            }
            Err(e) => warn!("Dropping block during migration: {}", e),
        }
    }
    state
}

fn decode_state(bytes: &[u8]) -> Result<WardenState, SnapshotError> {
    let value: Value = serde_json::from_slice(bytes)?;
    match value.get("version").map(Value::as_u64) {
        Some(Some(SCHEMA_VERSION)) => Ok(serde_json::from_value::<StateV2>(value)?.into()),
        Some(Some(other)) => Err(SnapshotError::UnsupportedVersion(other)),
        Some(None) => Err(SnapshotError::UnsupportedVersion(0)),
        None => {
            info!("Migrating unversioned state snapshot");
            Ok(migrate_legacy_state(serde_json::from_value(value)?))
        }
    }
}

pub struct StateStore {
    path: PathBuf,
    corrupt: Cell<bool>,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            corrupt: Cell::new(false),
        }
    }

    /// Empty state when the snapshot is absent or unreadable.
    pub fn load(&self) -> WardenState {
        load_or_default(&self.path, "state snapshot", &self.corrupt, decode_state)
    }

    pub fn save(&self, state: &WardenState) -> Result<(), SnapshotError> {
        let bytes = serde_json::to_vec_pretty(&StateV2::from(state))?;
        quarantine_if_corrupt(&self.path, &self.corrupt);
        write_atomic(&self.path, &bytes)
    }
}

// --- audit ledger ---------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct LedgerV2 {
    version: u64,
    entries: Vec<AuditEntry>,
}

#[derive(Debug, Deserialize)]
struct LegacyAuditEntry {
    timestamp: DateTime<Utc>,
    vmid: String,
    src_ip: String,
    unique_id: Uuid,
    #[serde(default)]
    rule_index: Value,
    #[serde(with = "expiration_label")]
    expiration: Option<DateTime<Utc>>,
    reason: BlockReason,
}

fn migrate_legacy_entry(legacy: LegacyAuditEntry) -> Option<AuditEntry> {
    let (Ok(target_id), Ok(source_address)) = (legacy.vmid.parse(), legacy.src_ip.parse()) else {
        warn!(
            "Dropping audit entry {} during migration: bad target '{}' or source '{}'",
            legacy.unique_id, legacy.vmid, legacy.src_ip
        );
        return None;
    };
    Some(AuditEntry {
        timestamp: legacy.timestamp,
        target_id,
        source_address,
        correlation_id: legacy.unique_id,
        rule_reference: rule_ref_from_legacy(&legacy.rule_index),
        expiration: legacy.expiration,
        reason: legacy.reason,
        prior_block_count: 0,
    })
}

fn decode_ledger(bytes: &[u8]) -> Result<AuditTrail, SnapshotError> {
    let value: Value = serde_json::from_slice(bytes)?;
    if value.is_array() {
        info!("Migrating unversioned audit ledger");
        let legacy: Vec<LegacyAuditEntry> = serde_json::from_value(value)?;
        return Ok(AuditTrail::from_entries(
            legacy.into_iter().filter_map(migrate_legacy_entry),
        ));
    }
    match value.get("version").and_then(Value::as_u64) {
        Some(SCHEMA_VERSION) => {
            let ledger: LedgerV2 = serde_json::from_value(value)?;
            Ok(AuditTrail::from_entries(ledger.entries))
        }
        other => Err(SnapshotError::UnsupportedVersion(other.unwrap_or(0))),
    }
}

pub struct AuditStore {
    path: PathBuf,
    corrupt: Cell<bool>,
}

impl AuditStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            corrupt: Cell::new(false),
        }
    }

    /// Empty ledger when the file is absent or unreadable.
    pub fn load(&self) -> AuditTrail {
        load_or_default(&self.path, "audit ledger", &self.corrupt, decode_ledger)
    }

    /// Rewrites the whole ledger.
    pub fn save(&self, trail: &AuditTrail) -> Result<(), SnapshotError> {
        let ledger = LedgerV2 {
            version: SCHEMA_VERSION,
            entries: trail.entries().to_vec(),
        };
        let bytes = serde_json::to_vec_pretty(&ledger)?;
        quarantine_if_corrupt(&self.path, &self.corrupt);
        write_atomic(&self.path, &bytes)
    }
}

// --- file handling --------------------------------------------------------

fn load_or_default<T: Default>(
    path: &Path,
    what: &str,
    corrupt: &Cell<bool>,
    decode: impl FnOnce(&[u8]) -> Result<T, SnapshotError>,
) -> T {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            info!("No {} at {}, starting empty", what, path.display());
            return T::default();
        }
        Err(e) => {
            warn!(
                "Cannot read {} {}: {}. Starting empty.",
                what,
                path.display(),
                e
            );
            return T::default();
        }
    };
    match decode(&bytes) {
        Ok(value) => value,
        Err(e) => {
            warn!(
                "Corrupt {} {}: {}. Starting empty.",
                what,
                path.display(),
                e
            );
            corrupt.set(true);
            T::default()
        }
    }
}

/// Moves a file that failed to load aside so this save does not destroy it.
fn quarantine_if_corrupt(path: &Path, corrupt: &Cell<bool>) {
    if !corrupt.replace(false) {
        return;
    }
    let mut aside = path.as_os_str().to_owned();
    aside.push(format!(".corrupt-{}", Utc::now().timestamp()));
    let aside = PathBuf::from(aside);
    match fs::rename(path, &aside) {
        Ok(()) => warn!("Moved {} to {}", path.display(), aside.display()),
        Err(e) => warn!("Could not move {} aside: {}", path.display(), e),
    }
}

/// Replaces `path` with `bytes` via a synced temp file in the same directory.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), SnapshotError> {
    let io_err = |source| SnapshotError::Io {
        path: path.to_path_buf(),
        source,
    };
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let name = path
        .file_name()
        .ok_or_else(|| io_err(io::Error::from(io::ErrorKind::InvalidInput)))?;
    let tmp_name = format!(".{}.{}.tmp", name.to_string_lossy(), std::process::id());
    let tmp = dir.join(tmp_name);

    let result = (|| {
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result.map_err(io_err)
}
