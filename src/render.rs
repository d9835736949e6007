//! Text and JSON views for the `config` and `history` commands.

use std::fmt::Display;
use std::path::Path;

use anyhow::{Context, Result};

use crate::config::ProjectConfig;
use crate::history::HistoryRecord;
use crate::model::{AccountDescriptor, QueueEntry};
use crate::progress::EntryStatus;

fn config_source_label(config_path: Option<&Path>) -> String {
    config_path
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(defaults, no .automaa/config.toml found)".to_string())
}

fn push_kv(output: &mut String, key: &str, value: impl Display) {
    output.push_str(&format!("  {key:<30} {value}\n"));
}

fn quota_label(account: &AccountDescriptor) -> String {
    if account.remaining_quota < 0 {
        "unlimited".to_string()
    } else {
        account.remaining_quota.to_string()
    }
}

fn entry_label(entry: &QueueEntry) -> String {
    match entry {
        QueueEntry::Account(uid) => format!("account {uid}"),
        QueueEntry::Queue(name) => format!("queue {name}"),
    }
}

pub fn render_config_human(config: &ProjectConfig, config_path: Option<&Path>) -> String {
    let mut output = String::new();
    output.push_str("Agent\n");
    push_kv(&mut output, "exe", config.agent.exe.display());
    push_kv(&mut output, "config_path", config.agent.config_path.display());
    push_kv(&mut output, "log_path", config.agent.log_path.display());
    push_kv(&mut output, "settle", format!("{}s", config.agent.settle_secs));
    push_kv(&mut output, "tick", format!("{}ms", config.agent.tick_millis));
    output.push('\n');

    output.push_str("Run\n");
    push_kv(&mut output, "max_attempts", config.run.max_attempts);
    push_kv(
        &mut output,
        "annihilation_timeout",
        format!("{}m", config.run.annihilation_timeout_minutes),
    );
    push_kv(
        &mut output,
        "routine_timeout",
        format!("{}m", config.run.routine_timeout_minutes),
    );
    push_kv(
        &mut output,
        "server_day_rollover",
        format!("{:02}:00", config.run.server_day_rollover_hour),
    );
    push_kv(
        &mut output,
        "annihilation_weekly_limit",
        config.run.annihilation_weekly_limit,
    );
    output.push('\n');

    output.push_str("Power\n");
    push_kv(&mut output, "countdown", format!("{}s", config.power.countdown_secs));
    push_kv(&mut output, "confirm", config.power.confirm);
    output.push('\n');

    output.push_str("Accounts\n");
    if config.accounts.is_empty() {
        push_kv(&mut output, "entries", "(none)");
    }
    for account in &config.accounts {
        let state = if account.enabled { "enabled" } else { "disabled" };
        output.push_str(&format!(
            "  - {} ({}) {state}, quota {}, annihilation {}\n",
            account.uid,
            account.label(),
            quota_label(account),
            account.annihilation_enabled
        ));
    }
    output.push('\n');

    output.push_str("Queues\n");
    if config.queues.is_empty() {
        push_kv(&mut output, "entries", "(none)");
    }
    for queue in &config.queues {
        output.push_str(&format!("  - {} (after: {})\n", queue.name, queue.after_completion));
        for entry in &queue.entries {
            output.push_str(&format!("      {}\n", entry_label(entry)));
        }
        for expr in &queue.schedule {
            output.push_str(&format!("      at \"{expr}\"\n"));
        }
    }
    output.push('\n');

    output.push_str("Source Path\n");
    push_kv(&mut output, "path", config_source_label(config_path));

    output
}

pub fn render_config_json(config: &ProjectConfig, config_path: Option<&Path>) -> Result<String> {
    let accounts: Vec<_> = config
        .accounts
        .iter()
        .map(|account| {
            serde_json::json!({
                "uid": &account.uid,
                "name": &account.name,
                "enabled": account.enabled,
                "remaining_quota": account.remaining_quota,
                "annihilation_enabled": account.annihilation_enabled,
                "login": account.masked_login(),
                "client_type": account.client_type,
            })
        })
        .collect();

    let payload = serde_json::json!({
        "agent": {
            "exe": &config.agent.exe,
            "config_path": &config.agent.config_path,
            "log_path": &config.agent.log_path,
            "settle_secs": config.agent.settle_secs,
            "tick_millis": config.agent.tick_millis
        },
        "run": {
            "max_attempts": config.run.max_attempts,
            "annihilation_timeout_minutes": config.run.annihilation_timeout_minutes,
            "routine_timeout_minutes": config.run.routine_timeout_minutes,
            "server_day_rollover_hour": config.run.server_day_rollover_hour,
            "annihilation_weekly_limit": config.run.annihilation_weekly_limit
        },
        "power": {
            "countdown_secs": config.power.countdown_secs,
            "confirm": config.power.confirm
        },
        "accounts": accounts,
        "queues": &config.queues,
        "source_path": config_source_label(config_path)
    });

    serde_json::to_string_pretty(&payload).context("failed to serialize config to JSON")
}

/// The `limit` most recent runs, newest last.
pub fn render_history(records: &[HistoryRecord], limit: usize) -> String {
    if records.is_empty() {
        return "No runs recorded yet.\n".to_string();
    }
    let mut output = String::new();
    let skip = records.len().saturating_sub(limit);
    for record in &records[skip..] {
        let report = &record.report;
        let outcome = if report.cancelled {
            "cancelled"
        } else if report.all_done() {
            "done"
        } else {
            "incomplete"
        };
        output.push_str(&format!(
            "{} {} [{outcome}] {} .. {}\n",
            record.run_id,
            record.task,
            report.started_at.format("%Y-%m-%d %H:%M:%S"),
            report.finished_at.format("%H:%M:%S"),
        ));
        push_kv(&mut output, "done", report.count(EntryStatus::Done));
        push_kv(&mut output, "failed", report.count(EntryStatus::Failed));
        push_kv(&mut output, "skipped", report.count(EntryStatus::Skipped));
        for entry in report
            .history
            .iter()
            .filter(|e| e.status == EntryStatus::Failed)
        {
            output.push_str(&format!("  ! {}: {}\n", entry.label, entry.summary));
        }
    }
    output
}
