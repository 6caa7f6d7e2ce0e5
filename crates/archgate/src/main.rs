use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{ArgGroup, Args, Parser};
use crossbeam_channel::{bounded, Receiver};
use tracing_subscriber::EnvFilter;

mod bridge;
mod certificate;
mod config;
mod crawl;
mod doctor;
mod emit;
mod error;
mod fix;
mod gate;
mod history;
mod ingest;
mod pipeline;
mod registry;
mod report;
mod rules;
mod snapshot;
mod store;
mod util;
mod watch;

use pipeline::Workspace;

const LOG_ENV: &str = "ARCHGATE_LOG";

#[derive(Parser, Debug)]
#[command(name = "archgate")]
#[command(about = "Repository governance engine: architectural rules, signed verdicts, safe fixes.", long_about = None)]
#[command(version)]
struct Cli {
    /// Workspace root to govern.
    #[arg(long, global = true, value_name = "DIR", default_value = ".")]
    root: PathBuf,

    /// Raise log verbosity on stderr (-v info, -vv debug). Overrides ARCHGATE_LOG.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Crawl the workspace and evaluate every rule into report.json.
    Scan(ScanArgs),
    /// Gate the current report and issue a signed certificate.
    Verify(VerifyArgs),
    /// Plan and apply structural-only remediations.
    Fix(FixArgs),
    /// Re-run the pipeline on file-system change.
    Watch(WatchArgs),
    /// Restore governance artifacts from a snapshot.
    Rollback(RollbackArgs),
    /// Check and repair the governance state directory.
    Doctor,
    /// Admit inbound files into the locked area.
    Ingest(IngestArgs),
    /// Print the current report.
    Report,
    /// Serve line-delimited JSON requests on stdin/stdout.
    Bridge,
}

#[derive(Debug, Args)]
struct ScanArgs {
    /// Only scan files under this workspace-relative path.
    #[arg(long, value_name = "PATH")]
    path: Option<String>,
}

#[derive(Debug, Args)]
struct VerifyArgs {
    /// Re-check the existing certificate's signature and evidence hashes.
    #[arg(long)]
    check_certificate: bool,
}

#[derive(Debug, Args)]
struct FixArgs {
    /// Write the plan and a preview patch without touching source files.
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct WatchArgs {
    /// Directory to watch (defaults to the workspace root).
    path: Option<PathBuf>,

    /// Exit after this many pipeline passes.
    #[arg(long, value_name = "N")]
    max_passes: Option<u64>,
}

#[derive(Debug, Args)]
#[command(group(ArgGroup::new("target").required(true).args(["latest", "latest_green", "to"])))]
struct RollbackArgs {
    /// Newest snapshot.
    #[arg(long)]
    latest: bool,

    /// Newest snapshot whose certificate passed.
    #[arg(long)]
    latest_green: bool,

    /// Snapshot id (`YYYYMMDDTHHMMSSZ`).
    #[arg(long, value_name = "ID")]
    to: Option<String>,
}

#[derive(Debug, Args)]
struct IngestArgs {
    /// Continue the persisted pending list instead of rediscovering.
    #[arg(long)]
    resume: bool,

    /// Stop after this many moves.
    #[arg(long, value_name = "N")]
    limit: Option<u64>,
}

fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        _ => EnvFilter::new("debug"),
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Fires once on the first SIGINT (or SIGTERM on unix). Handlers are
/// registered before this returns, so the loop always sees the signal and
/// finishes its in-flight pass.
fn shutdown_channel() -> Result<Receiver<()>> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build signal runtime")?;
    let (tx, rx) = bounded::<()>(1);

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (mut sigint, mut sigterm) = {
            let _guard = rt.enter();
            (
                signal(SignalKind::interrupt()).context("register SIGINT")?,
                signal(SignalKind::terminate()).context("register SIGTERM")?,
            )
        };
        std::thread::spawn(move || {
            rt.block_on(async {
                tokio::select! {
                    _ = sigint.recv() => {}
                    _ = sigterm.recv() => {}
                }
            });
            tracing::info!("shutdown signal received");
            let _ = tx.send(());
        });
    }
    #[cfg(not(unix))]
    {
        std::thread::spawn(move || {
            if rt.block_on(tokio::signal::ctrl_c()).is_ok() {
                tracing::info!("shutdown signal received");
                let _ = tx.send(());
            }
        });
    }
    Ok(rx)
}

fn main() -> ExitCode {
    match try_main() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::from(2)
        }
    }
}

fn exit_for(ok: bool) -> ExitCode {
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    }
}

fn try_main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let ws = Workspace::open(&cli.root);

    match cli.command {
        Command::Scan(args) => {
            let (summary, _) = pipeline::scan(&ws, args.path.as_deref())?;
            util::write_stdout_json(&summary)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Verify(args) if args.check_certificate => {
            let check = pipeline::check_certificate(&ws)?;
            util::write_stdout_json(&check)?;
            Ok(exit_for(check.ok))
        }
        Command::Verify(_) => {
            let summary = pipeline::verify(&ws)?;
            util::write_stdout_json(&summary)?;
            Ok(exit_for(summary.verdict.pass))
        }
        Command::Fix(args) => {
            let outcome = pipeline::fix(&ws, args.dry_run)?;
            util::write_stdout_json(&outcome)?;
            if let Some(b) = &outcome.blocked {
                eprintln!("semantic block: {}: {}", b.file, b.reason);
            }
            Ok(exit_for(outcome.blocked.is_none()))
        }
        Command::Watch(args) => {
            let dir = args.path.map(|p| if p.is_absolute() { p } else { cli.root.join(p) });
            let opts = watch::WatchOptions::from_workspace(&ws, dir, args.max_passes);
            let stop = shutdown_channel()?;
            let mut write_err = None;
            watch::run(&ws, &opts, stop, |pass| {
                if let Err(err) = util::write_stdout_json(pass) {
                    write_err.get_or_insert(err);
                }
            })?;
            match write_err {
                Some(err) => Err(err),
                None => Ok(ExitCode::SUCCESS),
            }
        }
        Command::Rollback(args) => {
            let target = match (args.latest, args.latest_green, args.to) {
                (_, _, Some(id)) => snapshot::RollbackTarget::To(id),
                (_, true, None) => snapshot::RollbackTarget::LatestGreen,
                _ => snapshot::RollbackTarget::Latest,
            };
            let entry = pipeline::rollback(&ws, &target)?;
            util::write_stdout_json(&entry)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Doctor => {
            let report = doctor::run(&ws)?;
            util::write_stdout_json(&report)?;
            Ok(exit_for(report.ok))
        }
        Command::Ingest(args) => {
            let opts = ingest::IngestOptions {
                resume: args.resume,
                limit: args.limit,
            };
            let state = ingest::run(&ws.state, &ws.cfg, opts)?;
            util::write_stdout_json(&state)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Report => {
            util::write_stdout_json(&pipeline::current_report(&ws))?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Bridge => {
            let stdin = std::io::stdin();
            bridge::serve(cli.root.clone(), stdin.lock(), std::io::stdout())?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
