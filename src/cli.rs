//! Operator commands
//!
//! One-shot commands run against the same database the daemon uses. Merge is
//! only reachable from here: it needs the reviewed duplicate list passed back
//! explicitly with `--confirm`. Restore is a dry run unless `--apply` is given.

use clap::Subcommand;
use std::fmt::Write;

use crate::backup::{BackupInfo, BackupKind, RestoreReport};
use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::ledger::{CheckpointOutcome, VerificationOutcome, VerificationRun};
use crate::principal::{now_millis, whole_units};
use crate::query::{LeaderboardRow, PrincipalDetail};
use crate::reconcile::{DuplicateReport, MergeOutcome};

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the HTTP API and the leaderboard scheduler (default)
    Serve,

    /// Run one leaderboard rebuild pass now
    Rebuild,

    /// Show the cached leaderboard
    Top {
        /// Number of entries (defaults to the configured top N)
        #[arg(short, long)]
        count: Option<usize>,
    },

    /// Show live balances and rank for one principal
    Show { identity: String },

    /// Persist live balances (all principals when no identity is given)
    Checkpoint {
        identity: Option<String>,
        /// Ignore the debounce window
        #[arg(short, long)]
        force: bool,
    },

    /// Spend gold from a principal's balance
    Spend { identity: String, amount: f64 },

    /// Query the ownership oracle and apply the result
    Verify {
        identity: Option<String>,
        /// Refresh every stored principal and log the run
        #[arg(long, conflicts_with = "identity")]
        all: bool,
    },

    /// Show recent `verify --all` runs
    Runs {
        #[arg(short, long, default_value_t = 10)]
        count: usize,
    },

    /// Set a principal's display name
    Rename { identity: String, name: String },

    /// List records whose stored balances break an invariant
    Audit,

    /// List duplicate principal groups and asset overlaps
    Duplicates,

    /// Merge reviewed duplicates into a target principal
    Merge {
        target: String,
        /// Duplicate identities exactly as listed by `duplicates`
        #[arg(long, value_delimiter = ',')]
        confirm: Vec<String>,
    },

    /// Snapshot every principal's live balances
    Backup {
        #[arg(short, long)]
        label: Option<String>,
    },

    /// List balance backups, newest first
    Backups,

    /// Write a backup's balances back onto existing principals
    Restore {
        backup_id: String,
        /// Restrict to these identities
        #[arg(long, value_delimiter = ',')]
        only: Vec<String>,
        /// Write the balances; without it only the effect is reported
        #[arg(long)]
        apply: bool,
    },

    /// Delete backups older than the retention window
    CleanupBackups {
        /// Retention in days (defaults to the configured value)
        #[arg(long)]
        days: Option<u32>,
        #[arg(long)]
        dry_run: bool,
    },
}

pub async fn execute(engine: &Engine, command: Commands) -> Result<String> {
    let now = now_millis();

    match command {
        Commands::Serve => Err(EngineError::Config(
            "serve runs as the daemon, not as a one-shot command".to_string(),
        )),

        Commands::Rebuild => {
            let report = engine.cache.rebuild(now)?;
            Ok(format!(
                "Rebuild {} complete: {} principals, {} inserted, {} updated, {} unchanged, {} evicted (version {}, {} ms)",
                report.pass_id,
                report.principals,
                report.inserted,
                report.updated,
                report.unchanged,
                report.evicted,
                report.version,
                report.duration_ms
            ))
        }

        Commands::Top { count } => {
            let rows = engine.query.top_n(count.unwrap_or(engine.config.top_n))?;
            Ok(format_rows(&rows))
        }

        Commands::Show { identity } => {
            let detail = engine.query.rank_and_balance(&identity, now)?;
            Ok(format_detail(&detail))
        }

        Commands::Checkpoint { identity: Some(identity), force } => {
            match engine.ledger.checkpoint(&identity, now, force).await? {
                CheckpointOutcome::Checkpointed { principal } => Ok(format!(
                    "Checkpointed {}: spendable {}, cumulative {}",
                    principal.identity,
                    whole_units(principal.spendable_balance),
                    whole_units(principal.cumulative_balance)
                )),
                CheckpointOutcome::Skipped { last_checkpoint_at } => Ok(format!(
                    "Skipped {}: last checkpoint at {} is inside the debounce window (use --force)",
                    identity, last_checkpoint_at
                )),
                CheckpointOutcome::Defective { defects } => {
                    let mut out = format!("Refused {}: stored balances are defective\n", identity);
                    for defect in defects {
                        let _ = writeln!(out, "  - {}", defect);
                    }
                    Ok(out)
                }
            }
        }

        Commands::Checkpoint { identity: None, force } => {
            let summary = engine.ledger.checkpoint_all(now, force).await?;
            Ok(format!(
                "Checkpointed {}, skipped {}, defective {}, failed {}",
                summary.checkpointed, summary.skipped, summary.defective, summary.failed
            ))
        }

        Commands::Spend { identity, amount } => {
            let principal = engine.ledger.spend(&identity, amount, now).await?;
            Ok(format!(
                "Spent {:.2} from {}: spendable now {}",
                amount,
                principal.identity,
                whole_units(principal.spendable_balance)
            ))
        }

        Commands::Verify { identity: Some(identity), .. } => {
            let outcome = engine.ledger.refresh_verification(&identity, now).await?;
            Ok(format_verification(&outcome))
        }

        Commands::Verify { identity: None, all: true } => {
            let run = engine.ledger.refresh_all(now).await?;
            Ok(format_run(&run))
        }

        Commands::Verify { identity: None, all: false } => Err(EngineError::Config(
            "verify needs an identity or --all".to_string(),
        )),

        Commands::Runs { count } => {
            let runs = engine.ledger.verification_runs(count)?;
            if runs.is_empty() {
                return Ok("No verification runs logged".to_string());
            }
            Ok(runs.iter().map(format_run).collect::<Vec<_>>().join("\n"))
        }

        Commands::Rename { identity, name } => {
            let principal = engine.ledger.set_display_name(&identity, &name).await?;
            Ok(format!("{} is now {}", principal.identity, principal.display_label()))
        }

        Commands::Audit => {
            let reports = engine.ledger.audit(now)?;
            if reports.is_empty() {
                return Ok("No invariant defects".to_string());
            }
            let mut out = format!("{} defective record(s)\n", reports.len());
            for report in reports {
                let _ = writeln!(
                    out,
                    "{} (spendable {:.2}, cumulative {:.2})",
                    report.identity, report.stored_spendable, report.stored_cumulative
                );
                for defect in report.defects {
                    let _ = writeln!(out, "  - {}", defect);
                }
            }
            Ok(out)
        }

        Commands::Duplicates => {
            let report = engine.reconciler.find_duplicates()?;
            Ok(format_duplicates(&report))
        }

        Commands::Merge { target, confirm } => {
            match engine.reconciler.merge(&target, &confirm, now).await? {
                MergeOutcome::Merged(summary) => Ok(format!(
                    "Merged {} into {}: spendable {}, cumulative {}, rate {:.2}/h (backup {})",
                    summary.absorbed.join(", "),
                    summary.principal.identity,
                    whole_units(summary.principal.spendable_balance),
                    whole_units(summary.principal.cumulative_balance),
                    summary.principal.total_rate_per_hour,
                    summary.backup_id
                )),
                MergeOutcome::NoOp(reason) => Ok(format!("Nothing merged: {}", reason)),
            }
        }

        Commands::Backup { label } => {
            let info = engine.backups.create(BackupKind::Manual, label, now)?;
            Ok(format!(
                "Backup {} created with {} principal(s)",
                info.backup_id, info.principal_count
            ))
        }

        Commands::Backups => Ok(format_backups(&engine.backups.list()?)),

        Commands::Restore { backup_id, only, apply } => {
            let report = engine.backups.restore(&backup_id, &only, !apply, now).await?;
            Ok(format_restore(&report))
        }

        Commands::CleanupBackups { days, dry_run } => {
            let days = days.unwrap_or(engine.config.backup_retention_days);
            let report = engine.backups.cleanup(days, dry_run, now)?;
            Ok(format!(
                "{} {} backup(s) and {} record(s) older than {} day(s)",
                if report.dry_run { "Would delete" } else { "Deleted" },
                report.backups_deleted,
                report.records_deleted,
                days
            ))
        }
    }
}

fn format_verification(outcome: &VerificationOutcome) -> String {
    let mut out = format!(
        "{}: {:?}, verified {}, rate {:.2}/h",
        outcome.principal.identity,
        outcome.transition,
        outcome.principal.is_verified,
        outcome.principal.total_rate_per_hour
    );
    if outcome.created {
        out.push_str(" (new principal)");
    }
    if !outcome.oracle_available {
        out.push_str(" (oracle unavailable)");
    }
    if outcome.principal.consecutive_oracle_failures > 0 {
        let _ = write!(
            out,
            " ({} consecutive oracle failures)",
            outcome.principal.consecutive_oracle_failures
        );
    }
    out
}

fn format_run(run: &VerificationRun) -> String {
    let s = &run.summary;
    format!(
        "Run {} at {}: {} principals, {} confirmed, {} reconfirmed, {} revoked, {} unverified, \
         {} rejected, {} oracle unavailable, {} alerting, {} failed",
        run.run_id,
        run.started_at,
        s.total,
        s.confirmed,
        s.reconfirmed,
        s.revoked,
        s.still_unverified,
        s.assets_rejected,
        s.oracle_unavailable,
        s.alerting,
        s.failed
    )
}

fn format_backups(backups: &[BackupInfo]) -> String {
    if backups.is_empty() {
        return "No backups".to_string();
    }
    let mut out = String::new();
    for b in backups {
        let _ = writeln!(
            out,
            "{}  {:>14}  {:<11} {:>6} principal(s)  {}",
            b.backup_id,
            b.created_at,
            b.kind.as_str(),
            b.principal_count,
            b.label.as_deref().unwrap_or("")
        );
    }
    out
}

fn format_restore(report: &RestoreReport) -> String {
    let mut out = format!(
        "{} {} principal(s) from backup {} ({} spendable gold)",
        if report.dry_run { "Would restore" } else { "Restored" },
        report.restored,
        report.backup_id,
        whole_units(report.restored_spendable)
    );
    if let Some(safety) = &report.safety_backup_id {
        let _ = write!(out, "; previous state saved as {}", safety);
    }
    if !report.missing.is_empty() {
        let _ = write!(out, "\n  no longer present: {}", report.missing.join(", "));
    }
    if !report.rejected.is_empty() {
        let _ = write!(out, "\n  rejected (invariant defects): {}", report.rejected.join(", "));
    }
    if report.dry_run {
        out.push_str("\n  re-run with --apply to write");
    }
    out
}

fn format_rows(rows: &[LeaderboardRow]) -> String {
    if rows.is_empty() {
        return "Leaderboard is empty".to_string();
    }
    let mut out = String::new();
    for row in rows {
        let _ = writeln!(
            out,
            "{:>4}  {:<32} {:>12}  {:>8.2}/h",
            row.rank, row.display_name, row.cumulative_gold, row.rate_per_hour
        );
    }
    out
}

fn format_detail(d: &PrincipalDetail) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{} ({})", d.display_name, d.identity);
    let _ = writeln!(out, "  Rank:       {} of {}", d.rank, d.total_principals);
    let _ = writeln!(out, "  Spendable:  {}", d.spendable_gold);
    let _ = writeln!(out, "  Cumulative: {}", d.cumulative_gold);
    let _ = writeln!(out, "  Spent:      {}", d.total_spent);
    let _ = writeln!(out, "  Rate:       {:.2}/h", d.rate_per_hour);
    let _ = writeln!(out, "  Verified:   {}", d.is_verified);
    if d.consecutive_oracle_failures > 0 {
        let _ = writeln!(out, "  Oracle:     {} consecutive failures", d.consecutive_oracle_failures);
    }
    let _ = writeln!(out, "  Assets:     {}", d.assets.len());
    out
}

fn format_duplicates(report: &DuplicateReport) -> String {
    if report.groups.is_empty() && report.asset_overlaps.is_empty() {
        return "No duplicates found".to_string();
    }

    let mut out = String::new();
    for group in &report.groups {
        let _ = writeln!(out, "Suffix {}:", group.suffix);
        for member in &group.members {
            let _ = writeln!(
                out,
                "  {}  verified={}  cumulative={}",
                member.identity,
                member.is_verified,
                whole_units(member.cumulative_balance)
            );
        }
    }
    for overlap in &report.asset_overlaps {
        let _ = writeln!(
            out,
            "Asset {} held by: {}",
            overlap.asset_id,
            overlap.identities.join(", ")
        );
    }
    out
}
