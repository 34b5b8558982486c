mod audit;
mod config;
mod cursor;
mod detector;
mod escalation;
mod firewall;
mod geo;
mod lifecycle;
mod parser;
mod snapshot;
mod state;
mod warden;

#[cfg(test)]
mod test_support;

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::audit::AuditTrail;
use crate::config::{WardenConfig, load_country_allow_list};
use crate::firewall::PveshFirewall;
use crate::geo::{GeoPolicy, MaxMindGeo};
use crate::snapshot::{AuditStore, StateStore};
use crate::state::WardenState;
use crate::warden::Warden;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = WardenConfig::load();

    if std::env::args().nth(1).as_deref() == Some("report") {
        print_report(&config);
        return Ok(());
    }

    // 1. Check Root (required for pvesh)
    if unsafe { libc::geteuid() } != 0 {
        log::error!("❌ CRITICAL: Run this application with SUDO/ROOT!");
        std::process::exit(1);
    }

    // 2. Setup collaborators for this run; the GeoIP handle is released with the warden
    let allowed = load_country_allow_list(&config.country_allow_list_path);
    let geo = GeoPolicy::new(MaxMindGeo::open(&config.geoip_db_path), allowed);
    let firewall = PveshFirewall::new(config.node.clone(), config.guest_kind, config.api_timeout());
    let warden = Warden::new(&config, geo, firewall);

    log::info!(
        "🚀 Firewall warden pass over {}",
        warden.log_path().display()
    );

    if let Err(e) = warden.run().await {
        log::error!("❌ Run aborted: {:#}", e);
        std::process::exit(1);
    }
    Ok(())
}

/// Operator view of active blocks and repeat offenders. Touches neither
/// the log nor the firewall.
fn print_report(config: &WardenConfig) {
    let state = StateStore::new(&config.state_path).load();
    let audit = AuditStore::new(&config.audit_path).load();
    print!("{}", render_report(&state, &audit, Utc::now()));
}

fn render_report(state: &WardenState, audit: &AuditTrail, now: DateTime<Utc>) -> String {
    let mut lines = vec![format!("Active blocks: {}", state.blocks.len())];
    for (key, record) in &state.blocks {
        let lifetime = match record.expiration {
            None => "permanent".to_string(),
            Some(at) if at < now => format!("expired {} (pending removal)", at),
            Some(at) => format!("until {}", at),
        };
        lines.push(format!(
            "  {:<45} {:<45} ID {}",
            key.to_string(),
            lifetime,
            record.correlation_id
        ));
    }

    lines.push(String::new());
    lines.push(format!("Block history ({} decisions):", audit.entries().len()));
    for (addr, count) in audit.counts_by_address() {
        lines.push(format!("  {:<40} {}", addr.to_string(), count));
    }
    lines.push(String::new());
    lines.join("\n")
}
