use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use patchwork_cli::{commands, DownloadArgs, GlobalOptions, RunContext};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(author, version, about = "Keeps a game installation in sync with its patch manifest")]
struct Cli {
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(flatten)]
    global: GlobalOptions,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compare the installation against the manifest
    Check {
        /// Also write the results as JSON
        #[arg(short, long)]
        output: Option<Utf8PathBuf>,
    },
    /// Download outdated files into the staging directory
    Download {
        #[command(flatten)]
        args: DownloadArgs,
    },
    /// Rebuild archives from staged files
    Build {
        /// Rebuild every archive from all staged files
        #[arg(long)]
        force: bool,
    },
    /// Download, then rebuild the archives that changed
    Update {
        #[command(flatten)]
        args: DownloadArgs,
        #[arg(long)]
        force: bool,
    },
    /// Remove staged downloads and built archives
    Clean,
}

fn exit_code(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let default_level = if cli.verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\nCancelling, finished files are kept...");
                cancel.cancel();
            }
        });
    }

    let ctx = RunContext::load(&cli.global, cancel)?;

    let code = match cli.command {
        Commands::Check { output } => {
            let outcome = commands::cmd_check(&ctx, output).await?;
            exit_code(outcome.is_up_to_date())
        }
        Commands::Download { args } => {
            let report = commands::cmd_download(&ctx, &args).await?;
            exit_code(report.is_success())
        }
        Commands::Build { force } => {
            let report = commands::cmd_build(&ctx, force).await?;
            exit_code(report.is_success())
        }
        Commands::Update { args, force } => {
            let (report, built) = commands::cmd_update(&ctx, &args, force).await?;
            exit_code(report.is_success() && built.is_success())
        }
        Commands::Clean => {
            commands::cmd_clean(&ctx)?;
            ExitCode::SUCCESS
        }
    };

    Ok(code)
}
