use ipnetwork::IpNetwork;
use log::{error, info, warn};
use regex::Regex;
use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::escalation::EscalationPolicy;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuestKind {
    #[default]
    Qemu,
    Lxc,
}

impl GuestKind {
    pub fn api_segment(self) -> &'static str {
        match self {
            GuestKind::Qemu => "qemu",
            GuestKind::Lxc => "lxc",
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WardenConfig {
    #[serde(default = "default_log_path")]
    pub log_path: PathBuf,
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,
    #[serde(default = "default_audit_path")]
    pub audit_path: PathBuf,
    #[serde(default = "default_node")]
    pub node: String,
    #[serde(default)]
    pub guest_kind: GuestKind,
    #[serde(default = "default_country_allow_list_path")]
    pub country_allow_list_path: PathBuf,
    #[serde(default = "default_geoip_db_path")]
    pub geoip_db_path: PathBuf,
    /// Networks never blocked by the drop-rate path.
    #[serde(default)]
    pub exclusions: Vec<IpNetwork>,
    /// Also exempt excluded networks from geo-blocking.
    #[serde(default)]
    pub exclusions_bypass_geo: bool,
    #[serde(default = "default_burst_span_secs")]
    pub burst_span_secs: u64,
    #[serde(default = "default_long_block_after")]
    pub long_block_after: usize,
    #[serde(default = "default_permanent_block_after")]
    pub permanent_block_after: usize,
    #[serde(default = "default_short_block_secs")]
    pub short_block_secs: u64,
    #[serde(default = "default_long_block_secs")]
    pub long_block_secs: u64,
    #[serde(default = "default_api_timeout_secs")]
    pub api_timeout_secs: u64,
}

fn default_log_path() -> PathBuf {
    PathBuf::from("/var/log/pve-firewall.log")
}
fn default_state_path() -> PathBuf {
    PathBuf::from("./firewall_state.json")
}
fn default_audit_path() -> PathBuf {
    PathBuf::from("./tracking.json")
}
fn default_node() -> String {
    "pve01".to_string()
}
fn default_country_allow_list_path() -> PathBuf {
    PathBuf::from("./country_conf")
}
fn default_geoip_db_path() -> PathBuf {
    PathBuf::from("/usr/share/GeoIP/GeoLite2-Country.mmdb")
}
fn default_burst_span_secs() -> u64 {
    300
}
fn default_long_block_after() -> usize {
    5
}
fn default_permanent_block_after() -> usize {
    7
}
fn default_short_block_secs() -> u64 {
    3600
}
fn default_long_block_secs() -> u64 {
    7 * 24 * 3600
}
fn default_api_timeout_secs() -> u64 {
    30
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            log_path: default_log_path(),
            state_path: default_state_path(),
            audit_path: default_audit_path(),
            node: default_node(),
            guest_kind: GuestKind::default(),
            country_allow_list_path: default_country_allow_list_path(),
            geoip_db_path: default_geoip_db_path(),
            exclusions: vec![],
            exclusions_bypass_geo: false,
            burst_span_secs: default_burst_span_secs(),
            long_block_after: default_long_block_after(),
            permanent_block_after: default_permanent_block_after(),
            short_block_secs: default_short_block_secs(),
            long_block_secs: default_long_block_secs(),
            api_timeout_secs: default_api_timeout_secs(),
        }
    }
}

impl WardenConfig {
    /// Loads the YAML file named by `WARDEN_CONFIG` (default `warden.yaml`).
    /// A missing or unreadable file leaves every setting at its default.
    pub fn load() -> Self {
        let config_path = env::var("WARDEN_CONFIG").unwrap_or_else(|_| "warden.yaml".to_string());
        Self::load_from(Path::new(&config_path))
    }

    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            info!(
                "Config file '{}' not found. Using defaults.",
                path.display()
            );
            return Self::default();
        }
        match fs::read_to_string(path) {
            Ok(contents) => match Self::from_yaml(&contents) {
                Ok(config) => {
                    info!("Config loaded successfully from {}", path.display());
                    config
                }
                Err(e) => {
                    error!("Failed to parse YAML config: {}", e);
                    Self::default()
                }
            },
            Err(e) => {
                error!("Failed to read config file {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn from_yaml(contents: &str) -> Result<Self, serde_yaml::Error> {
        let config: Self = serde_yaml::from_str(contents)?;
        if config.permanent_block_after < config.long_block_after {
            warn!(
                "permanent_block_after ({}) is below long_block_after ({}); long blocks will never be chosen",
                config.permanent_block_after, config.long_block_after
            );
        }
        Ok(config)
    }

    pub fn escalation_policy(&self) -> EscalationPolicy {
        EscalationPolicy {
            long_after: self.long_block_after,
            permanent_after: self.permanent_block_after,
            short_duration: chrono::Duration::seconds(self.short_block_secs as i64),
            long_duration: chrono::Duration::seconds(self.long_block_secs as i64),
        }
    }

    pub fn burst_span(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.burst_span_secs as i64)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }
}

/// Reads the flat country allow-list: one ISO code per line, case
/// insensitive. A missing file means nothing is allowed.
pub fn load_country_allow_list(path: &Path) -> HashSet<String> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) => {
            warn!(
                "Country allow-list {} unavailable ({}). No countries allowed.",
                path.display(),
                e
            );
            return HashSet::new();
        }
    };
    parse_country_allow_list(&contents)
}

fn parse_country_allow_list(contents: &str) -> HashSet<String> {
    let code = Regex::new(r"^[A-Z]{2}$").expect("Fatal: Regex invalid");
    let mut allowed = HashSet::new();
    for line in contents.lines() {
        let entry = line.trim().to_uppercase();
        if entry.is_empty() {
            continue;
        }
        if code.is_match(&entry) {
            allowed.insert(entry);
        } else {
            warn!("Ignoring malformed country code '{}'", line.trim());
        }
    }
    allowed
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn empty_document_yields_defaults() {
        let config = WardenConfig::from_yaml("{}").unwrap();
        assert_eq!(config.log_path, PathBuf::from("/var/log/pve-firewall.log"));
        assert_eq!(config.node, "pve01");
        assert_eq!(config.guest_kind, GuestKind::Qemu);
        assert_eq!(config.burst_span(), chrono::Duration::minutes(5));
        let policy = config.escalation_policy();
        assert_eq!(policy.long_after, 5);
        assert_eq!(policy.permanent_after, 7);
        assert_eq!(policy.short_duration, chrono::Duration::hours(1));
        assert_eq!(policy.long_duration, chrono::Duration::days(7));
    }

    #[test]
    fn parses_overrides_and_exclusions() {
        let yaml = r#"
node: pve07
guest_kind: lxc
exclusions:
  - 10.0.0.0/8
  - 2001:db8::/32
exclusions_bypass_geo: true
api_timeout_secs: 5
"#;
        let config = WardenConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.node, "pve07");
        assert_eq!(config.guest_kind.api_segment(), "lxc");
        assert!(config.exclusions_bypass_geo);
        assert_eq!(config.api_timeout(), Duration::from_secs(5));
        let excluded = |addr: &str| {
            let addr = addr.parse().unwrap();
            config.exclusions.iter().any(|net| net.contains(addr))
        };
        assert!(excluded("10.20.30.40"));
        assert!(excluded("2001:db8::5"));
        assert!(!excluded("11.0.0.1"));
    }

    #[test]
    fn missing_or_broken_file_falls_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        let absent = WardenConfig::load_from(&dir.path().join("nope.yaml"));
        assert_eq!(absent.node, "pve01");

        let broken = dir.path().join("broken.yaml");
        fs::write(&broken, "node: [unterminated").unwrap();
        assert_eq!(WardenConfig::load_from(&broken).node, "pve01");
    }

    #[test]
    fn allow_list_is_normalised_and_filtered() {
        let allowed = parse_country_allow_list("us\n  DE \n\nfrance\nC1\n");
        assert_eq!(allowed.len(), 2);
        assert!(allowed.contains("US"));
        assert!(allowed.contains("DE"));
    }

    #[test]
    fn missing_allow_list_is_empty() {
        let dir = TempDir::new().unwrap();
        assert!(load_country_allow_list(&dir.path().join("country_conf")).is_empty());
    }
}
