use chrono::{DateTime, Utc};
use std::net::IpAddr;

// Field layout of a pve-firewall policy line:
// <target> <level> <iface> <dd/Mon/yyyy:HH:MM:SS> <zone> policy <VERDICT:> ... SRC=<addr> ...
const MIN_FIELDS: usize = 10;
const POLICY_MARKER: &str = "policy";
const SOURCE_PREFIX: &str = "SRC=";
const TIMESTAMP_FORMAT: &str = "%d/%b/%Y:%H:%M:%S %z";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Drop,
    Accept,
}

impl Verdict {
    fn from_token(token: &str) -> Option<Self> {
        match token {
            "DROP:" => Some(Verdict::Drop),
            "ACCEPT:" => Some(Verdict::Accept),
            _ => None,
        }
    }
}

/// A firewall policy decision recovered from one log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Proxmox guest id. Valid ids stop at 999999999, so a digit-only
    /// field beyond `u32::MAX` is not a guest and the line is dropped.
    pub target_id: u32,
    pub source: IpAddr,
    pub timestamp: DateTime<Utc>,
    pub verdict: Verdict,
}

/// Parses one raw log line. Anything that is not a well-formed policy
/// line yields `None`; malformed input is never an error.
pub fn parse_line(line: &str) -> Option<Event> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < MIN_FIELDS || fields[5] != POLICY_MARKER {
        return None;
    }

    let verdict = Verdict::from_token(fields[6])?;

    // `u32::from_str` accepts a leading '+', the log never carries one
    if !fields[0].bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let target_id = fields[0].parse::<u32>().ok()?;

    let stamp = format!("{} {}", fields[3], fields[4]);
    let timestamp = DateTime::parse_from_str(&stamp, TIMESTAMP_FORMAT)
        .ok()?
        .with_timezone(&Utc);

    let source = fields[7..]
        .iter()
        .find_map(|field| field.strip_prefix(SOURCE_PREFIX))?
        .parse::<IpAddr>()
        .ok()?;

    Some(Event {
        target_id,
        source,
        timestamp,
        verdict,
    })
}
