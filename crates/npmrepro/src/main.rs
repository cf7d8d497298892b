use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use npmrepro_classify::{Classifier, KnownMismatches, RULESET_VERSION};
use npmrepro_contracts::REPORT_SCHEMA_VERSION;
use npmrepro_registry::{GitRepository, PackageVersionInfo, RegistryClient, RepositoryIssue};
use npmrepro_runner_common::sandbox_backend::{resolve_sandbox_backend, SandboxBackend};
use npmrepro_runner_common::SystemRunner;
use serde::Serialize;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

mod config;
mod log;
mod pipeline;
mod pool;
mod report;
mod sandbox;
mod selector;
mod store;
mod util;

use config::{CliOverrides, Settings};
use pipeline::AuditContext;
use selector::Selector;
use store::{AuditRecord, DataLayout};

#[derive(Parser, Debug)]
#[command(name = "npmrepro")]
#[command(about = "Audit whether npm packages can be rebuilt from their source repositories.", long_about = None)]
#[command(version)]
struct Cli {
    /// Data directory (results, logs, work trees, report). Defaults to `NPMREPRO_DATA_DIR`.
    #[arg(long, global = true, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Machine-readable output on stdout; progress lines are suppressed.
    #[arg(long, global = true)]
    json: bool,

    #[arg(long, global = true)]
    quiet: bool,

    /// Tracing filter (`RUST_LOG` syntax). Defaults to `RUST_LOG`, then `warn`.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Rebuild and compare the latest version of the selected packages.
    Audit(AuditArgs),
    /// Print registry metadata and the normalized repository of a package.
    Lookup(LookupArgs),
    /// Classify the difference between a rebuilt and a published artifact.
    Classify(ClassifyArgs),
    /// Regenerate the HTML report from stored records.
    Report(ReportArgs),
}

#[derive(Args, Debug)]
struct AuditArgs {
    /// `all`, `failed`, `failed:<kind>`, `mismatched`, `stale`, or package names.
    #[arg(required = true, value_name = "SELECTOR")]
    selectors: Vec<String>,

    #[arg(long)]
    jobs: Option<usize>,

    #[arg(long)]
    registry_url: Option<String>,

    #[arg(long, value_enum)]
    sandbox_backend: Option<SandboxBackend>,

    #[arg(long)]
    sandbox_image: Option<String>,

    /// Allow `--sandbox-backend=none`, which runs package build scripts on this host.
    #[arg(long = "i-accept-weaker-isolation")]
    accept_weaker_isolation: bool,

    #[arg(long, value_name = "PATH")]
    known_mismatches: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct LookupArgs {
    name: String,

    #[arg(long)]
    registry_url: Option<String>,
}

#[derive(Args, Debug)]
struct ClassifyArgs {
    #[arg(long)]
    name: String,

    #[arg(long = "version", value_name = "VERSION")]
    package_version: String,

    /// Rebuilt archive (`.tgz`) or extracted tree.
    built: PathBuf,

    /// Published archive (`.tgz`) or extracted tree.
    published: PathBuf,

    #[arg(long, value_name = "PATH")]
    known_mismatches: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ReportArgs {
    #[arg(long, value_name = "PATH")]
    out: Option<PathBuf>,
}

struct Reporter {
    json: bool,
    quiet: bool,
}

impl Reporter {
    fn progress(&self, msg: &str) {
        if self.json || self.quiet {
            return;
        }
        eprintln!("{msg}");
    }
}

#[derive(Serialize)]
struct AuditRunOutput<'a> {
    schema_version: &'static str,
    ruleset_version: u32,
    report: String,
    summary: BTreeMap<String, usize>,
    records: &'a [AuditRecord],
}

#[derive(Serialize)]
struct LookupOutput {
    #[serde(flatten)]
    info: PackageVersionInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    git: Option<GitRepository>,
    #[serde(skip_serializing_if = "Option::is_none")]
    repository_error: Option<String>,
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
    let reporter = Reporter {
        json: cli.json,
        quiet: cli.quiet,
    };

    match cli.cmd {
        Command::Audit(args) => cmd_audit(cli.data_dir, args, &reporter),
        Command::Lookup(args) => cmd_lookup(cli.data_dir, args),
        Command::Classify(args) => cmd_classify(args, &reporter),
        Command::Report(args) => cmd_report(cli.data_dir, args, &reporter),
    }
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

fn cmd_audit(data_dir: Option<PathBuf>, args: AuditArgs, reporter: &Reporter) -> Result<ExitCode> {
    let settings = Settings::resolve(
        data_dir,
        CliOverrides {
            registry_url: args.registry_url,
            sandbox_image: args.sandbox_image,
            sandbox_backend: args.sandbox_backend,
            jobs: args.jobs,
            known_mismatches: args.known_mismatches,
        },
    )?;
    let backend = resolve_sandbox_backend(settings.sandbox_backend, args.accept_weaker_isolation)?;
    let registry = RegistryClient::from_url(&settings.registry_url)?;
    let known = KnownMismatches::load(settings.known_mismatches.as_deref())?;
    let layout = DataLayout::new(&settings.data_dir);

    let previous = store::load_records(&layout)?;
    let tracked = store::read_tracked_packages(&settings.tracked_packages)?;
    let selectors: Vec<Selector> = args.selectors.iter().map(|s| Selector::parse(s)).collect();
    let names = selector::select(&selectors, &tracked, &store::latest_records(&previous));
    reporter.progress(&format!(
        "auditing {} package(s) with {} job(s), sandbox {backend}",
        names.len(),
        settings.jobs
    ));

    let sandbox = sandbox::sandbox_for(backend, &settings.sandbox_image);
    let ctx = AuditContext {
        layout: &layout,
        registry: &registry,
        sandbox: sandbox.as_ref(),
        known: &known,
        diff_runner: &SystemRunner,
    };
    let records = pool::run_pool(&names, settings.jobs, |name| {
        let record = ctx.audit(name);
        reporter.progress(&format!(
            "{}@{}: {}",
            record.package,
            record.version,
            record.category().label()
        ));
        record
    });

    let all = store::load_records(&layout)?;
    let report_path = layout.report_path();
    write_report(&all, &report_path)?;
    reporter.progress(&format!("report: {}", report_path.display()));

    if reporter.json {
        util::print_json(&AuditRunOutput {
            schema_version: REPORT_SCHEMA_VERSION,
            ruleset_version: RULESET_VERSION,
            report: report_path.display().to_string(),
            summary: report::summarize(&records),
            records: &records,
        })?;
    }

    Ok(if records.iter().any(AuditRecord::is_problem) {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    })
}

fn cmd_lookup(data_dir: Option<PathBuf>, args: LookupArgs) -> Result<ExitCode> {
    let settings = Settings::resolve(
        data_dir,
        CliOverrides {
            registry_url: args.registry_url,
            ..CliOverrides::default()
        },
    )?;
    let registry = RegistryClient::from_url(&settings.registry_url)?;
    let info = registry
        .latest(&args.name)
        .with_context(|| format!("look up {}", args.name))?;
    let (git, repository_error) = match info.git_repository() {
        Ok(git) => (Some(git), None),
        Err(RepositoryIssue::Missing) => (None, Some("no-repository".to_string())),
        Err(RepositoryIssue::NotGit(kind)) => (None, Some(format!("not-git: {kind}"))),
    };
    util::print_json(&LookupOutput {
        info,
        git,
        repository_error,
    })?;
    Ok(ExitCode::SUCCESS)
}

fn cmd_classify(args: ClassifyArgs, reporter: &Reporter) -> Result<ExitCode> {
    let known = KnownMismatches::load(args.known_mismatches.as_deref())?;
    let scratch = util::scratch_dir("classify")?;
    let result = Classifier::new(SystemRunner, known).classify_archives(
        &args.built,
        &args.published,
        &scratch,
        &args.name,
        &args.package_version,
    );
    let _ = std::fs::remove_dir_all(&scratch);
    let verdict = result.with_context(|| format!("classify {}@{}", args.name, args.package_version))?;

    util::print_json(&verdict)?;
    if verdict.is_real_mismatch() {
        reporter.progress(&format!(
            "{}@{}: real mismatch ({} change(s) unexplained)",
            verdict.package,
            verdict.version,
            verdict.changes.iter().filter(|c| c.rule.is_none()).count()
        ));
        return Ok(ExitCode::from(1));
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_report(data_dir: Option<PathBuf>, args: ReportArgs, reporter: &Reporter) -> Result<ExitCode> {
    let settings = Settings::resolve(data_dir, CliOverrides::default())?;
    let layout = DataLayout::new(&settings.data_dir);
    let records = store::load_records(&layout)?;
    let out = args.out.unwrap_or_else(|| layout.report_path());
    write_report(&records, &out)?;
    reporter.progress(&format!("{} record(s) -> {}", records.len(), out.display()));
    if reporter.json {
        util::print_json(&report::summarize(&records))?;
    }
    Ok(ExitCode::SUCCESS)
}

fn write_report(records: &[AuditRecord], out: &Path) -> Result<()> {
    let html = report::render_html(records, util::unix_now())?;
    util::write_atomic(out, html.as_bytes())
        .with_context(|| format!("write report {}", out.display()))
}
