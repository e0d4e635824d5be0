use std::path::PathBuf;
use std::process::ExitCode;

use chdpack_core::{BatchOptions, BatchResult, CancellationToken, JobStatus, ProcessControl};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "chdpack", version, about = "Batch-convert archived disc images to CHD with multi-disc playlists")]
struct Cli {
    /// Directory searched recursively for .zip and .7z archives
    #[arg(short, long)]
    source: PathBuf,

    /// Directory receiving .chd files, playlists and the ledger
    #[arg(short, long)]
    destination: PathBuf,

    /// Concurrent conversions (0 = one per core, at most 4)
    #[arg(short, long, default_value_t = 0)]
    threads: usize,

    /// Delete each archive once its conversion is recorded
    #[arg(long)]
    delete_originals: bool,

    /// Convert again even if the ledger or an existing output says it is done
    #[arg(long)]
    force: bool,

    /// Ledger file (default: <destination>/.chdpack-ledger.json)
    #[arg(long)]
    ledger: Option<PathBuf>,

    /// Parent directory for extraction scratch space
    #[arg(long)]
    temp_dir: Option<PathBuf>,

    /// chdman executable
    #[arg(long, env = "CHDMAN_PATH")]
    chdman: Option<PathBuf>,

    /// Do not write .m3u playlists for multi-disc games
    #[arg(long)]
    no_playlists: bool,

    /// Log debug detail instead of a progress bar
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_summary(result: &BatchResult) {
    eprintln!(
        "Done! {} archives: {} converted, {} skipped, {} failed{} ({:.2}s)",
        result.total(),
        result.succeeded,
        result.skipped,
        result.failed,
        if result.cancelled > 0 {
            format!(", {} cancelled", result.cancelled)
        } else {
            String::new()
        },
        result.elapsed.as_secs_f64()
    );

    for outcome in result.failures() {
        if let JobStatus::Failed(reason) = &outcome.status {
            eprintln!("  FAILED  {}: {reason}", outcome.archive.display());
        }
    }
    for issue in &result.issues {
        eprintln!("  WARNING {}: {}", issue.path.display(), issue.reason);
    }
    for warning in &result.warnings {
        eprintln!("  WARNING {warning}");
    }
    for playlist in &result.playlists {
        eprintln!("  playlist {}", playlist.display());
    }
}

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let options = BatchOptions {
        source: cli.source,
        destination: cli.destination,
        workers: cli.threads,
        keep_originals: !cli.delete_originals,
        force: cli.force,
        ledger_path: cli.ledger,
        temp_dir: cli.temp_dir,
        chdman_path: cli.chdman,
        playlists: !cli.no_playlists,
    };

    let token = CancellationToken::new();
    let handler_token = token.clone();
    ctrlc::set_handler(move || {
        tracing::warn!("cancelling: waiting for running conversions to stop");
        handler_token.cancel();
    })?;
    let control = ProcessControl::new().with_cancel_token(token);
    tracing::debug!(
        source = %options.source.display(),
        destination = %options.destination.display(),
        workers = options.workers,
        "starting batch"
    );

    let pb = if cli.verbose {
        ProgressBar::hidden()
    } else {
        ProgressBar::new(0)
    };
    pb.set_style(ProgressStyle::with_template("[{bar:40}] {pos}/{len} {wide_msg}")?);

    let pb_cb = pb.clone();
    let result = chdpack_core::process_with_control(&options, &control, &move |stage, current, total, message| {
        if stage == "convert" {
            pb_cb.set_length(total);
            pb_cb.set_position(current);
        }
        pb_cb.set_message(message.to_string());
    })?;
    pb.finish_and_clear();

    print_summary(&result);

    if result.failed > 0 || result.cancelled > 0 {
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}
