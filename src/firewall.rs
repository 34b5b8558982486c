use chrono::{DateTime, SecondsFormat, Utc};
use ipnetwork::IpNetwork;
use log::debug;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;
use uuid::Uuid;

use crate::audit::BlockReason;
use crate::config::GuestKind;

/// Opaque handle the rule store hands back for a rule (a position for Proxmox).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleRef(pub String);

#[derive(Debug, Error)]
pub enum FirewallError {
    #[error("failed to execute {program}: {source}")]
    Spawn {
        program: &'static str,
        source: std::io::Error,
    },
    #[error("`{command}` timed out after {after:?}")]
    Timeout { command: String, after: Duration },
    #[error("`{command}` failed: {stderr}")]
    Rejected { command: String, stderr: String },
    #[error("unexpected rule listing: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("rule with ID {0} not found after creation")]
    MissingAfterCreate(Uuid),
}

/// An inbound DROP rule for one source address.
#[derive(Debug, Clone)]
pub struct RuleSpec {
    pub source: IpAddr,
    pub correlation_id: Uuid,
    pub comment: String,
}

/// A rule as reported by the store's listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallRule {
    pub reference: RuleRef,
    pub source: Option<String>,
    pub comment: Option<String>,
}

impl FirewallRule {
    pub fn matches_source(&self, addr: IpAddr) -> bool {
        self.source
            .as_deref()
            .and_then(|s| s.parse::<IpNetwork>().ok())
            .is_some_and(|net| net.ip() == addr && net.prefix() == full_prefix(addr))
    }

    pub fn annotation(&self) -> Option<Annotation> {
        self.comment.as_deref().and_then(Annotation::parse)
    }
}

fn full_prefix(addr: IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

/// External control plane holding per-target firewall rules.
pub trait RuleStore {
    async fn create(&self, target_id: u32, rule: &RuleSpec) -> Result<RuleRef, FirewallError>;
    async fn list(&self, target_id: u32) -> Result<Vec<FirewallRule>, FirewallError>;
    async fn delete(&self, target_id: u32, reference: &RuleRef) -> Result<(), FirewallError>;
}

impl<T: RuleStore> RuleStore for &T {
    async fn create(&self, target_id: u32, rule: &RuleSpec) -> Result<RuleRef, FirewallError> {
        (**self).create(target_id, rule).await
    }

    async fn list(&self, target_id: u32) -> Result<Vec<FirewallRule>, FirewallError> {
        (**self).list(target_id).await
    }

    async fn delete(&self, target_id: u32, reference: &RuleRef) -> Result<(), FirewallError> {
        (**self).delete(target_id, reference).await
    }
}

// hyphen placement is checked by `Uuid::parse_str`
static ANNOTATION_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"- ID: ([0-9a-fA-F-]{36})\s*$").expect("Fatal: Regex invalid"));
static ANNOTATION_UNTIL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r" until (\S+) ").expect("Fatal: Regex invalid"));

/// Operator-visible rule comment linking a rule back to its block decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Annotation {
    pub correlation_id: Uuid,
    pub reason: BlockReason,
    pub permanent: bool,
    /// Absent on permanent rules and on temporary rules written
    /// before expirations were embedded.
    pub expiration: Option<DateTime<Utc>>,
}

impl Annotation {
    pub fn render(&self, created_at: DateTime<Utc>) -> String {
        let created = created_at.to_rfc3339_opts(SecondsFormat::Secs, true);
        match (self.permanent, self.reason, self.expiration) {
            (true, BlockReason::DisallowedCountry, _) => format!(
                "Permanent geo-block at {created} - ID: {}",
                self.correlation_id
            ),
            (true, _, _) => format!("Permanent block at {created} - ID: {}", self.correlation_id),
            (false, _, Some(until)) => format!(
                "Temp block at {created} until {} - ID: {}",
                until.to_rfc3339_opts(SecondsFormat::Secs, true),
                self.correlation_id
            ),
            (false, _, None) => format!("Temp block at {created} - ID: {}", self.correlation_id),
        }
    }

    pub fn parse(comment: &str) -> Option<Self> {
        let correlation_id = ANNOTATION_ID
            .captures(comment)
            .and_then(|caps| Uuid::parse_str(&caps[1]).ok())?;
        let (permanent, reason) = if comment.starts_with("Permanent geo-block at ") {
            (true, BlockReason::DisallowedCountry)
        } else if comment.starts_with("Permanent block at ") {
            (true, BlockReason::MultipleDrops)
        } else if comment.starts_with("Temp block at ") {
            (false, BlockReason::MultipleDrops)
        } else {
            return None;
        };
        let expiration = if permanent {
            None
        } else {
            ANNOTATION_UNTIL
                .captures(comment)
                .and_then(|caps| DateTime::parse_from_rfc3339(&caps[1]).ok())
                .map(|at| at.with_timezone(&Utc))
        };
        Some(Self {
            correlation_id,
            reason,
            permanent,
            expiration,
        })
    }
}

#[derive(Debug, Deserialize)]
struct PveRule {
    pos: u64,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    comment: Option<String>,
}

/// Rule store backed by the Proxmox VE API through the `pvesh` CLI.
pub struct PveshFirewall {
    node: String,
    guest_kind: GuestKind,
    call_timeout: Duration,
}

impl PveshFirewall {
    pub fn new(node: impl Into<String>, guest_kind: GuestKind, call_timeout: Duration) -> Self {
        Self {
            node: node.into(),
            guest_kind,
            call_timeout,
        }
    }

    fn rules_path(&self, target_id: u32) -> String {
        format!(
            "/nodes/{}/{}/{}/firewall/rules",
            self.node,
            self.guest_kind.api_segment(),
            target_id
        )
    }

    async fn pvesh(&self, args: &[&str]) -> Result<Vec<u8>, FirewallError> {
        let command = format!("pvesh {}", args.join(" "));
        debug!("Running {}", command);

        let mut cmd = Command::new("pvesh");
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match timeout(self.call_timeout, cmd.output()).await {
            Ok(result) => result.map_err(|source| FirewallError::Spawn {
                program: "pvesh",
                source,
            })?,
            Err(_) => {
                return Err(FirewallError::Timeout {
                    command,
                    after: self.call_timeout,
                });
            }
        };

        if output.status.success() {
            Ok(output.stdout)
        } else {
            Err(FirewallError::Rejected {
                command,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

impl RuleStore for PveshFirewall {
    async fn create(&self, target_id: u32, rule: &RuleSpec) -> Result<RuleRef, FirewallError> {
        let path = self.rules_path(target_id);
        let source = rule.source.to_string();
        // pvesh create /nodes/pve01/qemu/100/firewall/rules --action DROP --type in ...
        self.pvesh(&[
            "create",
            &path,
            "--action",
            "DROP",
            "--type",
            "in",
            "--enable",
            "1",
            "--source",
            &source,
            "--comment",
            &rule.comment,
        ])
        .await?;

        // Proxmox answers create with null; find the position by our ID.
        self.list(target_id)
            .await?
            .into_iter()
            .find(|r| {
                r.annotation()
                    .is_some_and(|a| a.correlation_id == rule.correlation_id)
            })
            .map(|r| r.reference)
            .ok_or(FirewallError::MissingAfterCreate(rule.correlation_id))
    }

    async fn list(&self, target_id: u32) -> Result<Vec<FirewallRule>, FirewallError> {
        let path = self.rules_path(target_id);
        let stdout = self
            .pvesh(&["get", &path, "--output-format", "json"])
            .await?;
        let rules: Vec<PveRule> = serde_json::from_slice(&stdout)?;
        Ok(rules
            .into_iter()
            .map(|r| FirewallRule {
                reference: RuleRef(r.pos.to_string()),
                source: r.source,
                comment: r.comment,
            })
            .collect())
    }

    async fn delete(&self, target_id: u32, reference: &RuleRef) -> Result<(), FirewallError> {
        let path = format!("{}/{}", self.rules_path(target_id), reference.0);
        self.pvesh(&["delete", &path]).await.map(|_| ())
    }
}
