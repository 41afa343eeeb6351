//! Command line uploader

use anyhow::Context;
use clap::{ArgAction, Parser};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use slo_uploader::prompt::confirm_stdio;
use slo_uploader::storage::{auth, ObjectStore, SwiftClient, SwiftConfig};
use slo_uploader::upload::{CommitPolicy, ProgressObserver, ResumeState};
use slo_uploader::{
    SessionOptions, SloError, UploadSession, DEFAULT_COMMIT_ATTEMPTS, DEFAULT_CONCURRENCY,
    DEFAULT_SEGMENT_SIZE_MB, MEGABYTE,
};

/// Upload a large file to OpenStack Swift as a Static Large Object.
///
/// Interrupted uploads resume from the recovery log kept in the temp
/// directory; run the same command again to continue.
#[derive(Parser, Debug)]
#[command(name = "slo-upload", version)]
struct Args {
    /// File to upload
    filename: PathBuf,

    /// Container for the assembled object
    container: String,

    /// Segment size in MB
    #[arg(short = 's', long, value_name = "MB", default_value_t = DEFAULT_SEGMENT_SIZE_MB)]
    segment_size: u64,

    /// Auth token; requires --storage-url
    #[arg(long, env = "OS_AUTH_TOKEN", hide_env_values = true)]
    auth_token: Option<String>,

    /// Account storage URL; requires --auth-token
    #[arg(long, env = "OS_STORAGE_URL")]
    storage_url: Option<String>,

    /// Number of segments uploaded at once
    #[arg(short = 'c', long, default_value_t = DEFAULT_CONCURRENCY)]
    concurrency: usize,

    /// Local disk budget for scratch segments in MB (0 = unlimited)
    #[arg(short = 'd', long, value_name = "MB")]
    max_disk_space: Option<u64>,

    /// Directory in which the temp directory is created (default: current directory)
    #[arg(short = 't', long, value_name = "DIR")]
    temp_directory: Option<PathBuf>,

    /// Per-request timeout in seconds (default: none)
    #[arg(long, value_name = "SECS")]
    request_timeout: Option<u64>,

    /// Manifest commit attempts before giving up
    #[arg(long, default_value_t = DEFAULT_COMMIT_ATTEMPTS)]
    commit_attempts: u32,

    /// Answer yes to every prompt
    #[arg(short = 'y', long)]
    yes: bool,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short = 'v', long, action = ArgAction::Count)]
    verbose: u8,
}

struct ProgressReporter {
    bar: ProgressBar,
}

impl ProgressObserver for ProgressReporter {
    fn segment_completed(&self, _sequence: u32, _bytes: u64) {
        self.bar.inc(1);
    }

    fn segment_failed(&self, sequence: u32, error: &SloError) {
        self.bar.println(format!("Segment {} failed: {}", sequence, error));
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    let prepared = UploadSession::prepare(SessionOptions {
        segment_size_mb: args.segment_size,
        concurrency: args.concurrency,
        max_disk_space_mb: args.max_disk_space,
        temp_root: args.temp_directory.clone(),
        commit: CommitPolicy {
            attempts: args.commit_attempts,
            ..Default::default()
        },
        ..SessionOptions::new(&args.filename, &args.container)
    });
    let mut session = match prepared {
        Ok(session) => session,
        Err(e) => {
            report_failure(&anyhow::Error::from(e), false);
            return ExitCode::FAILURE;
        }
    };

    match run(&args, &mut session).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report_failure(&e, session.has_progress());
            ExitCode::FAILURE
        }
    }
}

/// Tell the user whether anything is left to resume
fn report_failure(e: &anyhow::Error, has_progress: bool) {
    eprintln!("Error: {:#}", e);
    let error = e.downcast_ref::<SloError>();
    if error.is_some_and(SloError::is_corruption) {
        eprintln!("Inspect or remove the recovery log before running again.");
    } else if has_progress || error.is_some_and(SloError::is_resumable) {
        eprintln!("The upload is partially complete. Run the same command again to resume.");
    } else {
        eprintln!("No upload progress was made.");
    }
}

async fn run(args: &Args, session: &mut UploadSession) -> anyhow::Result<()> {
    let http = reqwest::Client::new();
    let credentials = auth::resolve(
        args.storage_url.clone(),
        args.auth_token.clone(),
        |name| std::env::var(name).ok(),
        &http,
    )
    .await?;

    let swift = Arc::new(SwiftClient::new(SwiftConfig {
        storage_url: credentials.storage_url,
        auth_token: credentials.auth_token,
        request_timeout_secs: args.request_timeout,
        ..Default::default()
    })?);
    swift.head_account().await?;
    info!("Using account {}", swift.storage_url());

    if !swift.container_exists(&args.container).await? {
        let question = format!("Container {} does not exist. Create it?", args.container);
        if !confirm_stdio(&question, args.yes)? {
            return Err(SloError::ContainerNotFound {
                container: args.container.clone(),
            }
            .into());
        }
        swift.create_container(&args.container).await?;
    }

    match session.resume_state().clone() {
        ResumeState::Fresh => {}
        ResumeState::Resumable { .. } => {
            let question = format!(
                "Continue upload of {} at {}%?",
                session.object_name(),
                session.percent_complete()
            );
            if !confirm_stdio(&question, args.yes)? {
                session.discard_progress().await?;
            }
        }
        ResumeState::Mismatched { reason } => {
            println!("Found progress from a different upload ({}), starting over.", reason);
            session.discard_progress().await?;
        }
    }

    let plan = session.plan();
    let logged = match session.resume_state() {
        ResumeState::Resumable { logged, .. } => *logged as u64,
        _ => 0,
    };
    println!("Upload {} to {}:", args.filename.display(), args.container);
    println!("  segments uploaded: {}/{}", logged, plan.total_segments);
    println!("  segment size:      {}MB", plan.segment_size_mb);
    println!("  concurrency:       {}", plan.concurrency);
    println!("  disk space used:   {}MB", plan.scratch_bound() / MEGABYTE);
    if !confirm_stdio("Start upload?", args.yes)? {
        println!("Nothing was uploaded.");
        return Ok(());
    }

    let bar = ProgressBar::new(u64::from(plan.total_segments));
    bar.set_style(
        ProgressStyle::with_template("{spinner} {bar:40.green/blue} {pos}/{len} segments ({eta})")
            .context("invalid progress template")?,
    );
    bar.set_position(logged);
    let observer = Arc::new(ProgressReporter { bar: bar.clone() });

    let store: Arc<dyn ObjectStore> = swift;
    let result = session.run(store, observer).await;
    bar.finish_and_clear();

    let report = result?;
    println!("Uploaded {}", report);
    Ok(())
}
