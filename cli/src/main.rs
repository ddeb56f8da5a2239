use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use changelog_kernel::config::ChangelogConfig;
use changelog_kernel::csn::Csn;
use changelog_kernel::cursor::{MatchStrategy, PositionStrategy};
use changelog_kernel::env::{ChangelogEnv, PurgeReport};
use changelog_kernel::index::ChangeNumberRecord;
use changelog_kernel::log::{ReplicaLog, UpdateRecord};
use changelog_kernel::store::MemoryStore;

/// Replication changelog inspection tool
#[derive(Parser, Debug)]
#[command(name = "changelog")]
#[command(about = "Load updates into an in-memory changelog and inspect it", long_about = None)]
struct Cli {
    /// Path to changelog config JSON
    #[arg(long)]
    config: Option<String>,

    /// Path to a JSON array of updates
    #[arg(long)]
    updates: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print every replica log and the change-number index
    Dump,

    /// Purge everything older than a CSN, keeping the newest records
    Purge {
        #[arg(long)]
        before: Csn,
    },

    /// Estimate the number of records of one replica log in a CSN range
    Count {
        #[arg(long)]
        domain: String,

        #[arg(long)]
        replica: u16,

        #[arg(long)]
        from: Csn,

        #[arg(long)]
        to: Csn,
    },
}

/// One line of the updates file.
#[derive(Debug, Deserialize)]
struct UpdateInput {
    domain: String,
    csn: Csn,
    #[serde(default)]
    payload: String,
}

#[derive(Debug, Serialize)]
struct ReplicaLogDump {
    domain: String,
    replica_id: u16,
    oldest: Option<Csn>,
    newest: Option<Csn>,
    records: Vec<RecordDump>,
}

#[derive(Debug, Serialize)]
struct RecordDump {
    csn: Csn,
    payload: String,
}

#[derive(Debug, Serialize)]
struct DumpOutput {
    replica_logs: Vec<ReplicaLogDump>,
    change_numbers: Vec<ChangeNumberRecord>,
}

#[derive(Debug, Serialize)]
struct PurgeOutput {
    calls: usize,
    report: PurgeReport,
}

#[derive(Debug, Serialize)]
struct CountOutput {
    domain: String,
    replica_id: u16,
    from: Csn,
    to: Csn,
    count: u64,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // ----------------------------
    // Load config
    // ----------------------------
    let config = if let Some(path) = &cli.config {
        let data = fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
        serde_json::from_str::<ChangelogConfig>(&data)?
    } else {
        ChangelogConfig::default_config()
    };

    // ----------------------------
    // Load updates
    // ----------------------------
    let data = fs::read_to_string(&cli.updates)
        .with_context(|| format!("reading {}", cli.updates))?;
    let updates: Vec<UpdateInput> = serde_json::from_str(&data)?;

    let env = ChangelogEnv::open(Arc::new(MemoryStore::new()), config)?;
    for input in &updates {
        let update = UpdateRecord::new(input.csn, input.payload.as_bytes());
        env.append(&input.domain, &update)
            .with_context(|| format!("appending {} to {}", input.csn, input.domain))?;
    }
    info!(updates = updates.len(), "updates loaded");

    // ----------------------------
    // Run command
    // ----------------------------
    let output = match cli.command {
        Command::Dump => serde_json::to_value(dump(&env)?)?,
        Command::Purge { before } => serde_json::to_value(purge(&env, before)?)?,
        Command::Count {
            domain,
            replica,
            from,
            to,
        } => {
            let log = env
                .replica_log(&domain, replica)
                .with_context(|| format!("no log for replica {replica} of {domain}"))?;
            serde_json::to_value(CountOutput {
                count: log.count(from, to)?,
                domain,
                replica_id: replica,
                from,
                to,
            })?
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);

    env.shutdown()?;
    Ok(())
}

fn dump(env: &ChangelogEnv) -> Result<DumpOutput> {
    let mut replica_logs = Vec::new();
    for domain in env.domains() {
        for log in env.replica_logs(&domain) {
            replica_logs.push(dump_log(&log)?);
        }
    }

    let change_numbers = env
        .index()
        .open_cursor(None, MatchStrategy::EqualTo, PositionStrategy::OnMatchingKey)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(DumpOutput {
        replica_logs,
        change_numbers,
    })
}

fn dump_log(log: &ReplicaLog) -> Result<ReplicaLogDump> {
    let records = log
        .open_cursor(None, MatchStrategy::EqualTo, PositionStrategy::OnMatchingKey)
        .map(|record| {
            record.map(|record| RecordDump {
                csn: record.csn,
                payload: String::from_utf8_lossy(&record.payload).into_owned(),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ReplicaLogDump {
        domain: log.domain().to_string(),
        replica_id: log.replica_id(),
        oldest: log.oldest_csn(),
        newest: log.newest_csn(),
        records,
    })
}

/// Repeat bounded purge calls until a call changes nothing.
fn purge(env: &ChangelogEnv, before: Csn) -> Result<PurgeOutput> {
    let mut report = env.purge_up_to(before)?;
    let mut calls = 1;
    loop {
        let next = env.purge_up_to(before)?;
        calls += 1;
        if next == report {
            return Ok(PurgeOutput { calls, report });
        }
        report = next;
    }
}
