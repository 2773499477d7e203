//! Backup engine - command line entry point
//!
//! Runs backup jobs, restores from their sets and inspects the ledger and
//! lock directory.

use anyhow::{Context, Result};
use backup_engine::config::{GlobalConfig, PartialJobConfig};
use backup_engine::{utils, BackupKind, Engine, RunResult, SkipReason};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

/// Exit code when another process holds the job lock
const EXIT_LOCKED: u8 = 2;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the global configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a backup job
    Run {
        /// Job configuration file
        #[arg(short, long, value_name = "FILE")]
        job: PathBuf,

        /// full, differential (diff), incremental (inc) or dryrun
        #[arg(short, long, default_value = "full")]
        kind: String,

        /// Encrypt chunks even if the job does not enable it
        #[arg(long)]
        encrypt: bool,

        /// Mirror the set to S3 even if the job does not enable it
        #[arg(long)]
        sync: bool,

        /// Pending job record to use instead of creating one
        #[arg(long)]
        job_id: Option<i64>,
    },

    /// Restore files from a backup set
    Restore {
        /// Job configuration file
        #[arg(short, long, value_name = "FILE")]
        job: PathBuf,

        /// Set to restore from, e.g. 20240101_020000
        set_name: String,

        /// Relative paths to restore; the whole set when omitted
        paths: Vec<String>,

        /// Directory to restore into instead of the job's source
        #[arg(short, long, value_name = "DIR")]
        target: Option<PathBuf>,
    },

    /// List the backup sets of a job, newest first
    Sets { job_name: String },

    /// Show one backup set with its jobs
    Show { job_name: String, set_name: String },

    /// Find backed up files by path
    Search {
        query: String,

        /// Only search this job
        #[arg(long)]
        job: Option<String>,

        #[arg(long, default_value_t = 100)]
        limit: i64,
    },

    /// List lock markers and whether they are stale
    Locks,
}

fn main() -> Result<ExitCode> {
    let args = Args::parse();

    // .env may hold the encryption passphrase
    let _ = dotenvy::dotenv();

    let global = match &args.config {
        Some(path) => GlobalConfig::from_file(path)?,
        None => GlobalConfig::default(),
    };

    let log_level = args.log_level.as_deref().unwrap_or(&global.engine.log_level);
    utils::logger::init(log_level)?;

    tracing::debug!("backup-engine v{}", env!("CARGO_PKG_VERSION"));

    let engine = Engine::new(global.engine.clone()).context("failed to open the backup ledger")?;

    match args.command {
        Command::Run {
            job,
            kind,
            encrypt,
            sync,
            job_id,
        } => {
            let kind: BackupKind = kind.parse()?;
            let job_file = PartialJobConfig::from_file(&job)?;
            let job_config = global.defaults.merge(&job_file).resolve()?;

            match engine.run_backup(&job_config, kind, encrypt, sync, job_id) {
                Ok(outcome) => {
                    let code = match &outcome.result {
                        RunResult::SetPath(path) => {
                            println!("{}", path.display());
                            ExitCode::SUCCESS
                        }
                        RunResult::Nothing => {
                            if let Some(set) = &outcome.set_name {
                                println!("dry run recorded as set {}", set);
                            }
                            ExitCode::SUCCESS
                        }
                        RunResult::Skipped(SkipReason::NoChanges) => {
                            println!("skipped: no changes");
                            ExitCode::SUCCESS
                        }
                        RunResult::Skipped(SkipReason::Locked) => {
                            println!("skipped: job {} is already running", job_config.job_name);
                            ExitCode::from(EXIT_LOCKED)
                        }
                    };
                    Ok(code)
                }
                Err(e) => {
                    tracing::error!(job = %job_config.job_name, error = %e, "backup failed");
                    eprintln!("backup failed: {}", e);
                    Ok(ExitCode::FAILURE)
                }
            }
        }

        Command::Restore {
            job,
            set_name,
            paths,
            target,
        } => {
            let job_file = PartialJobConfig::from_file(&job)?;
            let job_config = global.defaults.merge(&job_file).resolve()?;

            match engine.restore(&job_config, &set_name, &paths, target.as_deref()) {
                Ok(report) => {
                    for path in &report.restored {
                        println!("{}", path.display());
                    }
                    for path in &report.missing {
                        eprintln!("not in set {}: {}", set_name, path);
                    }
                    for path in &report.refused {
                        eprintln!("refused, outside the target: {}", path);
                    }
                    if report.missing.is_empty() && report.refused.is_empty() {
                        Ok(ExitCode::SUCCESS)
                    } else {
                        Ok(ExitCode::FAILURE)
                    }
                }
                Err(e) => {
                    tracing::error!(job = %job_config.job_name, set = %set_name, error = %e, "restore failed");
                    eprintln!("restore failed: {}", e);
                    Ok(ExitCode::FAILURE)
                }
            }
        }

        Command::Sets { job_name } => {
            let sets = engine.ledger().list_sets(&job_name)?;
            if sets.is_empty() {
                println!("no backup sets for {}", job_name);
            }
            for summary in sets {
                println!(
                    "{}  jobs={}  files={}  bytes={}  last={}",
                    summary.set.set_name,
                    summary.job_count,
                    summary.total_files,
                    summary.total_size_bytes,
                    summary.last_job_at.as_deref().unwrap_or("-"),
                );
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::Show { job_name, set_name } => {
            let detail = engine
                .ledger()
                .set_with_jobs(&job_name, &set_name)?
                .with_context(|| format!("no set {} for job {}", set_name, job_name))?;
            println!("{}", serde_json::to_string_pretty(&detail)?);
            Ok(ExitCode::SUCCESS)
        }

        Command::Search { query, job, limit } => {
            let hits = engine.ledger().search_files(&query, job.as_deref(), limit)?;
            for hit in hits {
                println!(
                    "{}/{}  {}  {}  {} bytes  [{}]",
                    hit.job_name, hit.set_name, hit.backup_type, hit.path, hit.size_bytes, hit.chunk_name
                );
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::Locks => {
            let locks = engine.locks().list()?;
            if locks.is_empty() {
                println!("no locks in {}", engine.locks().lock_dir().display());
            }
            for lock in locks {
                let holder = match &lock.info {
                    Some(info) => format!("pid {} on {} since {}", info.pid, info.host, info.created_at.to_rfc3339()),
                    None => "unreadable marker".to_string(),
                };
                match &lock.stale_reason {
                    Some(reason) => println!("{}  {}  STALE ({})", lock.job, holder, reason),
                    None => println!("{}  {}  held", lock.job, holder),
                }
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}
