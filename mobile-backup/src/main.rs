//! mobile-backup - Main entry point
//!
//! Extract, inspect and compare phone backup directories.

use anyhow::Result;
use clap::{Parser, Subcommand};
use mobile_backup::executor::{ExtractSummary, Extractor, LinkMode};
use mobile_backup::inspect::{self, ListingOptions};
use mobile_backup::sync::BackupDiff;
use mobile_backup::{utils, Backup, BackupError, Config, FileRecord};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Extract all files of a backup into OUTDIR/<domain>/<path>
    Extract {
        #[arg(value_name = "BACKUPDIR")]
        backup_dir: PathBuf,

        #[arg(value_name = "OUTDIR")]
        out_dir: PathBuf,

        /// Use hardlinks instead of copying files
        #[arg(short = 'l')]
        hardlink: bool,

        /// Only extract domains containing this string
        #[arg(long)]
        domain: Option<String>,
    },

    /// Get info on a backup
    Info {
        #[arg(value_name = "BACKUPDIR")]
        backup_dir: PathBuf,

        #[command(flatten)]
        mode: InfoMode,

        /// Separator to use when listing files
        #[arg(long, default_value = "\t")]
        sep: String,

        /// Suppress header when listing files
        #[arg(long)]
        no_header: bool,

        /// List files as JSON lines
        #[arg(long, requires = "list")]
        json: bool,
    },

    /// List or extract differences between two backups
    Diff {
        #[arg(value_name = "BACKUP1")]
        backup1: PathBuf,

        #[arg(value_name = "BACKUP2")]
        backup2: PathBuf,

        /// Extract files from BACKUP1 that are removed or changed in BACKUP2
        #[arg(short = 'e', value_name = "OUTDIR")]
        extract: Option<PathBuf>,

        /// Use hardlinks instead of copying files (requires -e)
        #[arg(short = 'l', requires = "extract")]
        hardlink: bool,
    },
}

#[derive(clap::Args, Debug)]
#[group(required = true, multiple = false)]
struct InfoMode {
    /// List all files and their metadata
    #[arg(short = 'L')]
    list: bool,

    /// Print summary of backup
    #[arg(short = 'S')]
    summary: bool,

    /// Print backup date
    #[arg(short = 'D')]
    date: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("mobile-backup: {:#}", e);
            let code = e
                .downcast_ref::<BackupError>()
                .map(BackupError::exit_code)
                .unwrap_or(1);
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}

async fn run(args: Args) -> Result<()> {
    // Load configuration
    let config = if let Some(config_path) = &args.config {
        Config::from_file(config_path)?
    } else {
        Config::default()
    };

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::debug!("Starting mobile-backup v{}", env!("CARGO_PKG_VERSION"));

    // Record decoding and file copies are blocking; Ctrl+C only flips the token
    let shutdown = CancellationToken::new();
    let work_token = shutdown.clone();
    let command = args.command;
    let mut work = tokio::task::spawn_blocking(move || execute(command, &config, work_token));

    tokio::select! {
        result = &mut work => result?,
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => {
                    tracing::warn!("Received SIGINT (Ctrl+C), stopping after the current record");
                    shutdown.cancel();
                }
                Err(e) => tracing::warn!("Failed to listen for Ctrl+C: {}", e),
            }
            work.await?
        }
    }
}

fn execute(command: Command, config: &Config, token: CancellationToken) -> Result<()> {
    match command {
        Command::Extract {
            backup_dir,
            out_dir,
            hardlink,
            domain,
        } => {
            let backup = Backup::load(&backup_dir)?;
            let extractor = Extractor::with_cancel(link_mode(hardlink, config), token.clone())
                .dir_mode(config.extract.dir_mode);
            let records = backup.records_with_cancel(token)?;

            let summary = match domain {
                Some(filter) => extractor.extract_subset(
                    &backup.storage(),
                    records.filter(|r| r.as_ref().map_or(true, |r| r.domain.contains(&filter))),
                    &out_dir,
                    |_| {},
                )?,
                None => extractor.extract_subset(&backup.storage(), records, &out_dir, |_| {})?,
            };
            finish_extraction(&summary)
        }

        Command::Info {
            backup_dir,
            mode,
            sep,
            no_header,
            json,
        } => {
            let backup = Backup::load(&backup_dir)?;
            let stdout = io::stdout();
            let mut out = BufWriter::new(stdout.lock());

            if mode.list {
                let records = backup.records_with_cancel(token)?;
                if json {
                    inspect::write_json_listing(&mut out, records)?;
                } else {
                    let options = ListingOptions {
                        separator: sep,
                        header: !no_header,
                    };
                    inspect::write_listing(&mut out, records, &options)?;
                }
            } else if mode.summary {
                let summary = inspect::summarize(backup.records_with_cancel(token)?)?;
                inspect::write_summary(&mut out, &backup, &summary)?;
            } else {
                let date = backup
                    .status()
                    .date
                    .ok_or_else(|| BackupError::Metadata("Status.plist has no Date".to_string()))?;
                writeln!(out, "{}", inspect::compact_date(&date))?;
            }
            out.flush()?;
            Ok(())
        }

        Command::Diff {
            backup1,
            backup2,
            extract,
            hardlink,
        } => {
            let a = Backup::load(&backup1)?;
            let b = Backup::load(&backup2)?;
            let diff = BackupDiff::with_cancel(&a, &b, token.clone())
                .buffer_size(config.compare.buffer_size);

            if let Some(out_dir) = extract {
                let extractor = Extractor::with_cancel(link_mode(hardlink, config), token)
                    .dir_mode(config.extract.dir_mode);
                let summary = diff.extract_changed_and_removed(&out_dir, &extractor)?;
                return finish_extraction(&summary);
            }

            let stdout = io::stdout();
            let mut out = BufWriter::new(stdout.lock());
            for change in diff.changed_files()? {
                let change = change?;
                writeln!(
                    out,
                    "{}\t{}",
                    display_path(change.a.as_ref()),
                    display_path(change.b.as_ref())
                )?;
            }
            out.flush()?;
            Ok(())
        }
    }
}

/// `-l` forces hard links; otherwise the configured default applies.
fn link_mode(hardlink: bool, config: &Config) -> LinkMode {
    if hardlink {
        LinkMode::Hardlink
    } else {
        config.extract.link_mode()
    }
}

/// `domain/relativePath`, empty for an absent side
fn display_path(record: Option<&FileRecord>) -> String {
    match record {
        Some(r) if r.relative_path.is_empty() => r.domain.clone(),
        Some(r) => Path::new(&r.domain).join(&r.relative_path).display().to_string(),
        None => String::new(),
    }
}

fn finish_extraction(summary: &ExtractSummary) -> Result<()> {
    for failure in &summary.failures {
        eprintln!(
            "failed: {}/{}: {}",
            failure.domain, failure.relative_path, failure.error
        );
    }
    if summary.cancelled {
        return Err(BackupError::Cancelled.into());
    }
    if !summary.failures.is_empty() {
        anyhow::bail!(
            "{} of {} records could not be extracted",
            summary.failures.len(),
            summary.succeeded() + summary.failures.len()
        );
    }
    Ok(())
}
