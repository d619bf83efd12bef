//! Command line shell over the bootstrap engine.

use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use mcboot::engine::{DownloadStatus, Engine, Error, Handler, LaunchConfig};
use mcboot::{catalog, layout};


/// Bootstrap and launch vanilla Minecraft clients.
#[derive(Parser)]
#[command(name = "mcboot", version, disable_help_subcommand = true)]
struct Cli {
    /// Main directory of the installation, defaults to the system's standard one.
    #[arg(long)]
    main_dir: Option<PathBuf>,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// List available versions, locals first then remote ones newest first.
    Search {
        /// Only list locally installed versions.
        #[arg(long)]
        local: bool,
    },
    /// Ensure a version is fully installed and launch it.
    Start {
        /// The version id to launch, as shown by search.
        version: String,
        /// The offline player name.
        #[arg(long, short, default_value = "Player")]
        username: String,
        /// Maximum JVM heap size in MiB.
        #[arg(long)]
        max_memory: Option<u32>,
        /// Minimum JVM heap size in MiB.
        #[arg(long)]
        min_memory: Option<u32>,
        /// Print the launch command instead of spawning the game.
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = Cli::parse();

    let Some(main_dir) = args.main_dir.clone().or_else(layout::default_main_dir) else {
        eprintln!("error: no default main directory on this system, use --main-dir");
        return ExitCode::FAILURE;
    };

    let res = match args.cmd {
        Cmd::Search { local } => search(&main_dir, local).await,
        Cmd::Start { ref version, ref username, max_memory, min_memory, dry_run } =>
            start(&main_dir, version, username, max_memory, min_memory, dry_run).await,
    };

    match res {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }

}

async fn search(main_dir: &Path, local: bool) -> mcboot::Result<ExitCode> {

    let mut versions = if local {
        catalog::local_versions(main_dir).await?
    } else {
        catalog::available_versions(main_dir).await?
    };

    // Locals keep their scan order at the top, remotes are shown newest first.
    versions.sort_by(|a, b| {
        b.local.cmp(&a.local)
            .then_with(|| if a.local { std::cmp::Ordering::Equal } else { b.release_time.cmp(&a.release_time) })
    });

    for version in &versions {
        let marker = if version.local { "local " } else { "remote" };
        println!("{} {:<12} {:<26} {}", marker, version.r#type, version.id, version.release_time.format("%Y-%m-%d"));
    }

    Ok(ExitCode::SUCCESS)

}

async fn start(
    main_dir: &Path,
    version: &str,
    username: &str,
    max_memory: Option<u32>,
    min_memory: Option<u32>,
    dry_run: bool,
) -> mcboot::Result<ExitCode> {

    let mut config = LaunchConfig::new(username, version, main_dir);
    if let Some(max_memory) = max_memory {
        config.set_max_memory_mb(max_memory);
    }
    if let Some(min_memory) = min_memory {
        config.set_min_memory_mb(min_memory);
    }

    let engine = Arc::new(Engine::new(config)?);

    engine.init().await?;

    if engine.state().needs_download() {

        let dl = engine.download(ProgressPrinter::default()).await?;
        let status = dl.wait().await;
        println!();

        if status != DownloadStatus::Completed {
            return Err(Error::PreconditionNotMet { reason: "download session did not complete" });
        }

        if dl.failed_files() != 0 {
            eprintln!("{} files failed to download, retry with another start", dl.failed_files());
        }

    }

    let state = engine.state();
    if !state.can_launch() {
        eprintln!("installation is not complete: {}", state.status_message());
        return Ok(ExitCode::FAILURE);
    }

    if dry_run {
        let command = engine.launch_command()?;
        print!("{}", command.program());
        for arg in command.args() {
            print!(" {}", arg.to_string_lossy());
        }
        println!();
        return Ok(ExitCode::SUCCESS);
    }

    println!("launching {version}...");
    let mut child = engine.run().await?;

    let status = child.wait()
        .map_err(|e| Error::Io { error: e, file: None })?;

    Ok(if status.success() { ExitCode::SUCCESS } else { ExitCode::FAILURE })

}

/// Prints a single carriage-returned progress line while a session is running.
#[derive(Default)]
struct ProgressPrinter;

impl Handler for ProgressPrinter {

    fn status_change(&mut self, status: DownloadStatus) {
        if status == DownloadStatus::Downloading {
            println!("downloading missing files...");
        }
    }

    fn progress(&mut self, completed: u32, failed: u32, total: u32, current_file: &str) {
        let mut out = io::stdout().lock();
        let _ = write!(out, "\r[{}/{total}] {current_file:<60.60}", completed + failed);
        let _ = out.flush();
    }

    fn error(&mut self, error: &Error) {
        eprintln!("\ndownload failed: {error}");
    }

}
