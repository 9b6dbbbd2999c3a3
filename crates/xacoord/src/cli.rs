//! CLI commands over a recovery log directory

use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;

use xacoord_common::config::Config;
use xacoord_common::metrics;
use xacoord_common::types::Timestamp;
use xacoord_log::{BranchRecord, FileLogStore, LoggedState, PartnerRecord, TransactionLog, TransactionRecord};

#[derive(Debug, Serialize)]
pub struct PartnerView {
    pub recovery_id: i32,
    pub factory: String,
    pub info: String,
    pub priority: i32,
    pub registered_at: String,
}

#[derive(Debug, Serialize)]
pub struct BranchView {
    pub resource: String,
    pub recovery_id: Option<i32>,
    pub priority: i32,
    pub bqual: String,
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct TransactionView {
    pub xid: String,
    pub state: String,
    pub decision: String,
    pub written_at: String,
    pub branches: Vec<BranchView>,
}

/// Snapshot of what the recovery log holds
#[derive(Debug, Serialize)]
pub struct Inspection {
    pub log_dir: String,
    pub partners: Vec<PartnerView>,
    pub pending: Vec<TransactionView>,
    pub heuristic: Vec<TransactionView>,
}

fn format_time(ms: Timestamp) -> String {
    chrono::DateTime::<chrono::Utc>::from_timestamp_millis(ms).map_or_else(|| ms.to_string(), |t| t.to_rfc3339())
}

fn partner_view(p: &PartnerRecord) -> PartnerView {
    PartnerView {
        recovery_id: p.recovery_id,
        factory: p.factory.clone(),
        info: hex::encode(&p.info),
        priority: p.priority,
        registered_at: format_time(p.written_at),
    }
}

fn branch_view(b: &BranchRecord) -> BranchView {
    BranchView {
        resource: b.resource_name.clone(),
        recovery_id: b.recovery_id,
        priority: b.priority,
        bqual: hex::encode(&b.bqual),
        status: b.status.to_string(),
    }
}

fn transaction_view(t: &TransactionRecord) -> TransactionView {
    let state = match t.state {
        LoggedState::Committing => "committing".to_string(),
        LoggedState::RollingBack => "rolling back".to_string(),
        LoggedState::Heuristic(outcome) => outcome.to_string(),
    };
    TransactionView {
        xid: t.xid.to_string(),
        state,
        decision: t.decision.to_string(),
        written_at: format_time(t.written_at),
        branches: t.branches.iter().map(branch_view).collect(),
    }
}

async fn open_log(config: &Config) -> Result<TransactionLog> {
    let store = FileLogStore::open(Path::new(&config.log.dir), config.log.max_segment_bytes)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;
    TransactionLog::open(Arc::new(store))
        .await
        .map_err(|e| anyhow::anyhow!(e))
}

/// Read the log and describe its registrations and unresolved transactions
pub async fn inspect(config: &Config) -> Result<Inspection> {
    let log = open_log(config).await?;
    let (partners, pending, heuristic) = (log.partners(), log.pending(), log.heuristics());
    metrics::record_log_contents(partners.len(), pending.len(), heuristic.len());

    let inspection = Inspection {
        log_dir: config.log.dir.clone(),
        partners: partners.iter().map(partner_view).collect(),
        pending: pending.iter().map(transaction_view).collect(),
        heuristic: heuristic.iter().map(transaction_view).collect(),
    };
    log.close().await.map_err(|e| anyhow::anyhow!(e))?;
    Ok(inspection)
}

/// Human-readable rendering of an inspection
pub fn render(inspection: &Inspection) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Recovery log: {}", inspection.log_dir);

    let _ = writeln!(out, "\nRegistrations ({}):", inspection.partners.len());
    for p in &inspection.partners {
        let _ = writeln!(
            out,
            "  #{:<4} {:<24} priority {:<4} info {} ({})",
            p.recovery_id, p.factory, p.priority, p.info, p.registered_at
        );
    }

    for (title, txns) in [("Pending", &inspection.pending), ("Heuristic", &inspection.heuristic)] {
        let _ = writeln!(out, "\n{} transactions ({}):", title, txns.len());
        for t in txns {
            let _ = writeln!(out, "  {} {} (decision {}, {})", t.xid, t.state, t.decision, t.written_at);
            for b in &t.branches {
                let _ = writeln!(
                    out,
                    "    {:<24} bqual {} priority {} {}",
                    b.resource, b.bqual, b.priority, b.status
                );
            }
        }
    }
    out
}

/// Rewrite the log without completion markers past the confirmation window
pub async fn prune(config: &Config) -> Result<String> {
    let log = open_log(config).await?;
    let window = Duration::from_secs(config.recovery.confirmation_window_secs);
    let stats = log.prune(window).await.map_err(|e| anyhow::anyhow!(e))?;
    log.close().await.map_err(|e| anyhow::anyhow!(e))?;
    Ok(format!(
        "Pruned {}: kept {} registrations, {} transactions, {} completion markers; dropped {} markers",
        config.log.dir, stats.partners, stats.transactions, stats.completed_kept, stats.completed_dropped
    ))
}
