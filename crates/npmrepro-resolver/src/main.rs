use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use npmrepro_resolver::{write_outcome, BuildRequest, Resolver};
use npmrepro_runner_common::SystemRunner;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "npmrepro-resolver")]
#[command(about = "Rebuild one npm package version from its git repository.", long_about = None)]
struct Cli {
    #[arg(long)]
    package_name: String,

    #[arg(long)]
    repository_url: String,

    #[arg(long = "version", value_name = "VERSION")]
    target_version: String,

    /// Registry publish timestamp; pins npm installs to what existed at that time.
    #[arg(long)]
    published_at: Option<String>,

    #[arg(long)]
    subdirectory_hint: Option<String>,

    /// Host-visible directory receiving the archive and outcome.json, or failure.json.
    #[arg(long)]
    out_dir: PathBuf,

    #[arg(long, default_value = "/tmp/npmrepro")]
    scratch_dir: PathBuf,

    /// Tracing filter (`RUST_LOG` syntax). Defaults to `RUST_LOG`, then `warn`.
    #[arg(long)]
    log_level: Option<String>,
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

fn try_main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    let request = BuildRequest {
        package_name: cli.package_name,
        repository_url: cli.repository_url,
        target_version: cli.target_version,
        published_at: cli.published_at.filter(|s| !s.trim().is_empty()),
        subdirectory_hint: cli.subdirectory_hint.filter(|s| !s.trim().is_empty()),
    };

    let resolver = Resolver::new(SystemRunner, &cli.scratch_dir, &cli.out_dir);
    let outcome = resolver.resolve(&request);
    write_outcome(&cli.out_dir, &outcome)
        .with_context(|| format!("write outcome into {}", cli.out_dir.display()))?;

    Ok(if outcome.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("warn")),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}
