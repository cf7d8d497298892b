//! The per-package audit: registry lookup, sandboxed build, published fetch, diff and
//! classification, persisted as one result record. Every failure ends up in the record.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::Path;

use npmrepro_classify::{Classifier, KnownMismatches};
use npmrepro_contracts::{AuditErrorKind, BuildErrorKind};
use npmrepro_registry::{download_tarball, RegistryClient, RepositoryIssue};
use npmrepro_resolver::{BuildOutcome, BuildRequest};
use npmrepro_runner_common::CommandRunner;
use tracing::{info, warn};

use crate::log::{PackageLog, TranscriptRunner};
use crate::sandbox::BuildSandbox;
use crate::store::{write_record, AuditRecord, BuildInfo, DataLayout};
use crate::util::reset_dir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AuditState {
    Pending,
    Resolving,
    Resolved,
    BuildFailed,
    Comparing,
    ShortCircuitBenign,
    Matched,
    BenignMismatch,
    RealMismatch,
}

impl AuditState {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditState::Pending => "Pending",
            AuditState::Resolving => "Resolving",
            AuditState::Resolved => "Resolved",
            AuditState::BuildFailed => "BuildFailed",
            AuditState::Comparing => "Comparing",
            AuditState::ShortCircuitBenign => "ShortCircuitBenign",
            AuditState::Matched => "Matched",
            AuditState::BenignMismatch => "BenignMismatch",
            AuditState::RealMismatch => "RealMismatch",
        }
    }
}

impl fmt::Display for AuditState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct AuditFailure {
    kind: AuditErrorKind,
    detail: String,
}

impl AuditFailure {
    fn new(kind: AuditErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

trait StageExt<T> {
    /// Classifies an error escaping this stage as `kind`.
    fn stage(self, kind: AuditErrorKind) -> Result<T, AuditFailure>;
}

impl<T> StageExt<T> for anyhow::Result<T> {
    fn stage(self, kind: AuditErrorKind) -> Result<T, AuditFailure> {
        self.map_err(|err| AuditFailure::new(kind, format!("{err:#}")))
    }
}

/// Where one audit is in its state machine, plus what is known so far.
struct Progress<'a> {
    log: &'a PackageLog,
    state: AuditState,
    version: Option<String>,
    published_at: Option<String>,
}

impl Progress<'_> {
    fn advance(&mut self, to: AuditState) {
        self.log.transition(self.state.as_str(), to.as_str());
        self.state = to;
    }
}

/// Shared, read-only collaborators of every audit in a run.
pub(crate) struct AuditContext<'a> {
    pub layout: &'a DataLayout,
    pub registry: &'a RegistryClient,
    pub sandbox: &'a dyn BuildSandbox,
    pub known: &'a KnownMismatches,
    pub diff_runner: &'a dyn CommandRunner,
}

impl AuditContext<'_> {
    /// Audits the latest version of `package` and persists the record.
    pub fn audit(&self, package: &str) -> AuditRecord {
        let record = self.audit_unpersisted(package);
        match write_record(self.layout, &record) {
            Ok(path) => info!(package, path = %path.display(), "record written"),
            Err(err) => warn!(package, "failed to write record: {err:#}"),
        }
        record
    }

    fn audit_unpersisted(&self, package: &str) -> AuditRecord {
        let log = match PackageLog::create(&self.layout.log_path(package), package) {
            Ok(log) => log,
            Err(err) => {
                return AuditRecord::failed(
                    package,
                    None,
                    AuditErrorKind::UnexpectedError,
                    format!("{err:#}"),
                )
            }
        };
        let mut progress = Progress {
            log: &log,
            state: AuditState::Pending,
            version: None,
            published_at: None,
        };

        let result = std::panic::catch_unwind(AssertUnwindSafe(|| self.run(package, &mut progress)))
            .unwrap_or_else(|payload| {
                let msg = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                Err(AuditFailure::new(AuditErrorKind::UnexpectedError, format!("panic: {msg}")))
            });

        match result {
            Ok(record) => {
                log.step(format!("done: {}", record.category().label()));
                record
            }
            Err(failure) => {
                warn!(package, kind = %failure.kind, log = %log.path().display(), "audit failed");
                log.error(format!("{}: {}", failure.kind, failure.detail));
                let mut record = AuditRecord::failed(
                    package,
                    progress.version.as_deref(),
                    failure.kind,
                    failure.detail,
                );
                record.published_at = progress.published_at.take();
                record
            }
        }
    }

    fn run(&self, package: &str, progress: &mut Progress<'_>) -> Result<AuditRecord, AuditFailure> {
        let log = progress.log;

        log.step(format!("registry lookup: {}", self.registry.registry_root()));
        let info = self
            .registry
            .latest(package)
            .stage(AuditErrorKind::RegFetchFailed)?;
        progress.version = Some(info.version.clone());
        progress.published_at = info.published_at.clone();
        log.step(format!("latest version {}", info.version));

        let repo = info.git_repository().map_err(|issue| match issue {
            RepositoryIssue::Missing => {
                AuditFailure::new(AuditErrorKind::NoRepository, "registry metadata has no repository")
            }
            RepositoryIssue::NotGit(kind) => {
                AuditFailure::new(AuditErrorKind::NotGit, format!("repository type is {kind:?}"))
            }
        })?;
        log.step(format!("repository {}", repo.url));

        let work_dir = self.layout.work_dir(package);
        reset_dir(&work_dir).stage(AuditErrorKind::UnexpectedError)?;

        let request = BuildRequest {
            package_name: info.name.clone(),
            repository_url: repo.url.clone(),
            target_version: info.version.clone(),
            published_at: info.published_at.clone(),
            subdirectory_hint: repo.directory.clone(),
        };
        progress.advance(AuditState::Resolving);
        let outcome = self
            .sandbox
            .build(&request, &work_dir, log)
            .stage(AuditErrorKind::Build(BuildErrorKind::UnexpectedError))?;
        let built = match outcome {
            BuildOutcome::Success(success) => success,
            BuildOutcome::Failure(failure) => {
                progress.advance(AuditState::BuildFailed);
                return Err(AuditFailure::new(
                    AuditErrorKind::Build(failure.error_kind),
                    failure.detail,
                ));
            }
        };
        progress.advance(AuditState::Resolved);

        let classifier = Classifier::new(TranscriptRunner::new(self.diff_runner, log), self.known.clone());
        let published = work_dir.join("published.tgz");
        if self.known.contains(&info.name, &info.version) {
            progress.advance(AuditState::ShortCircuitBenign);
        } else {
            log.step(format!("download {}", info.dist.tarball));
            download_tarball(&info.dist, &published).stage(AuditErrorKind::PublishedFetchFailed)?;
            progress.advance(AuditState::Comparing);
        }

        let verdict = classifier
            .classify_archives(
                &built.artifact_path,
                &published,
                &work_dir.join("trees"),
                &info.name,
                &info.version,
            )
            .map_err(|err| AuditFailure::new(err.kind(), err.to_string()))?;
        let record = AuditRecord::from_verdict(verdict, info.published_at.clone(), BuildInfo::from(&built));

        if progress.state == AuditState::Comparing {
            progress.advance(if record.content_matches {
                AuditState::Matched
            } else if record.is_known_benign_mismatch {
                AuditState::BenignMismatch
            } else {
                AuditState::RealMismatch
            });
        }
        log_changes(log, &record, &work_dir);
        Ok(record)
    }
}

fn log_changes(log: &PackageLog, record: &AuditRecord, work_dir: &Path) {
    for change in &record.changes {
        let rule = change.rule.as_deref().unwrap_or("unexplained");
        log.step(format!("{} {} ({rule})", change.kind.as_str(), change.path));
    }
    log.step(format!("work dir kept at {}", work_dir.display()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::HostSandbox;
    use crate::store::{read_record, Category};
    use npmrepro_registry::archive::pack_dir_tgz;
    use npmrepro_runner_common::scripted::ScriptedRunner;
    use npmrepro_runner_common::{CommandOutput, SystemRunner};
    use std::path::PathBuf;

    struct Fixture {
        tmp: tempfile::TempDir,
        layout: DataLayout,
        registry: RegistryClient,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let registry_dir = tmp.path().join("registry");
            std::fs::create_dir_all(&registry_dir).unwrap();
            let registry =
                RegistryClient::from_url(&format!("file://{}/", registry_dir.display())).unwrap();
            let layout = DataLayout::new(tmp.path().join("data"));
            Self {
                tmp,
                layout,
                registry,
            }
        }

        fn path(&self, rel: &str) -> PathBuf {
            self.tmp.path().join(rel)
        }

        /// Publishes `demo@1.0.0` whose tarball holds `files` under `package/`.
        fn publish(&self, repository: &str, files: &[(&str, &str)]) {
            let src = self.path("published-src");
            write_files(&src, files);
            let tarball = self.path("registry/demo-1.0.0.tgz");
            pack_dir_tgz(&src, "package", &tarball).unwrap();
            let doc = format!(
                r#"{{"name":"demo","dist-tags":{{"latest":"1.0.0"}},
                   "time":{{"1.0.0":"2024-05-01T00:00:00.000Z"}},
                   "versions":{{"1.0.0":{{"version":"1.0.0",{repository}
                   "dist":{{"tarball":"file://{}"}}}}}}}}"#,
                tarball.display()
            );
            std::fs::write(self.path("registry/demo"), doc).unwrap();
        }
    }

    fn write_files(root: &Path, files: &[(&str, &str)]) {
        for (rel, body) in files {
            let path = root.join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, body).unwrap();
        }
    }

    const SOURCE: &[(&str, &str)] = &[
        ("package.json", r#"{"name":"demo","version":"1.0.0"}"#),
        ("index.js", "module.exports = 1;\n"),
    ];

    /// A repository whose `npm pack` output equals `SOURCE`.
    fn scripted_repo(built_src: PathBuf) -> ScriptedRunner {
        ScriptedRunner::new()
            .on("git clone", |cmd| {
                write_files(Path::new(cmd.args.last().unwrap()), SOURCE);
                Ok(CommandOutput::ok(""))
            })
            .on_output("git tag", CommandOutput::ok("v0.9.0\nv1.0.0\n"))
            .on_output("git -c", CommandOutput::ok(""))
            .on_output("npm install", CommandOutput::ok(""))
            .on("npm pack", move |cmd| {
                pack_dir_tgz(&built_src, "package", &cmd.cwd.join("demo-1.0.0.tgz"))?;
                Ok(CommandOutput::ok("demo-1.0.0.tgz\n"))
            })
    }

    fn audit(f: &Fixture, runner: &ScriptedRunner, known: &KnownMismatches) -> AuditRecord {
        let sandbox = HostSandbox::new(runner);
        let ctx = AuditContext {
            layout: &f.layout,
            registry: &f.registry,
            sandbox: &sandbox,
            known,
            diff_runner: &SystemRunner,
        };
        ctx.audit("demo")
    }

    #[test]
    fn reproduced_package_matches_and_is_persisted() {
        let f = Fixture::new();
        f.publish(r#""repository":{"type":"git","url":"git+https://github.com/o/demo.git"},"#, SOURCE);
        let built_src = f.path("built-src");
        write_files(&built_src, SOURCE);
        let runner = scripted_repo(built_src);

        let record = audit(&f, &runner, &KnownMismatches::empty());
        assert_eq!(record.category(), Category::Matched, "{record:?}");
        assert_eq!(record.published_at.as_deref(), Some("2024-05-01T00:00:00.000Z"));
        let build = record.build.as_ref().unwrap();
        assert_eq!(build.tag.as_deref(), Some("v1.0.0"));
        assert_eq!(build.package_manager, "npm");
        assert!(runner.ran("git clone --quiet https://github.com/o/demo"));
        assert!(runner.ran("npm install --before=2024-05-01T00:00:00.000Z"));

        let stored = read_record(&f.layout.record_path("demo", "1.0.0")).unwrap();
        assert_eq!(stored, record);
        let log = std::fs::read_to_string(f.layout.log_path("demo")).unwrap();
        assert!(log.contains("[state] Pending -> Resolving"));
        assert!(log.contains("[state] Comparing -> Matched"));
        assert!(log.contains("[exec] diff -r -u"));
    }

    #[test]
    fn extra_published_changelog_is_benign() {
        let f = Fixture::new();
        let mut published: Vec<(&str, &str)> = SOURCE.to_vec();
        published.push(("CHANGELOG.md", "## 1.0.0\n"));
        f.publish(r#""repository":"github:o/demo","#, &published);
        let built_src = f.path("built-src");
        write_files(&built_src, SOURCE);

        let record = audit(&f, &scripted_repo(built_src), &KnownMismatches::empty());
        assert_eq!(record.category(), Category::BenignMismatch);
        assert_eq!(record.changes[0].rule.as_deref(), Some("published-changelog"));
    }

    #[test]
    fn missing_repository_fails_before_any_build() {
        let f = Fixture::new();
        f.publish("", SOURCE);
        let runner = ScriptedRunner::new();

        let record = audit(&f, &runner, &KnownMismatches::empty());
        assert_eq!(record.error_kind, Some(AuditErrorKind::NoRepository));
        assert_eq!(record.version, "1.0.0");
        assert!(runner.calls().is_empty());
        assert!(f.layout.record_path("demo", "1.0.0").is_file());
    }

    #[test]
    fn unknown_package_is_a_registry_failure() {
        let f = Fixture::new();
        let runner = ScriptedRunner::new();
        let record = audit(&f, &runner, &KnownMismatches::empty());
        assert_eq!(record.error_kind, Some(AuditErrorKind::RegFetchFailed));
        assert_eq!(record.version, crate::store::UNKNOWN_VERSION);
    }

    #[test]
    fn build_failure_is_recorded_with_its_code() {
        let f = Fixture::new();
        f.publish(r#""repository":"o/demo","#, SOURCE);
        let runner = ScriptedRunner::new()
            .on_output("git clone", CommandOutput::failed(128, "fatal: not found"));

        let record = audit(&f, &runner, &KnownMismatches::empty());
        assert_eq!(
            record.error_kind,
            Some(AuditErrorKind::Build(BuildErrorKind::CloneFailed))
        );
        assert!(record.error_detail.as_deref().unwrap().contains("fatal: not found"));
        let log = std::fs::read_to_string(f.layout.log_path("demo")).unwrap();
        assert!(log.contains("[state] Resolving -> BuildFailed"));
    }

    #[test]
    fn allow_listed_version_skips_download_and_diff() {
        let f = Fixture::new();
        f.publish(r#""repository":"o/demo","#, SOURCE);
        std::fs::remove_file(f.path("registry/demo-1.0.0.tgz")).unwrap();
        let built_src = f.path("built-src");
        write_files(&built_src, SOURCE);
        let mut known = KnownMismatches::empty();
        known.insert("demo", "1.0.0");

        let record = audit(&f, &scripted_repo(built_src), &known);
        assert_eq!(record.category(), Category::BenignMismatch);
        let log = std::fs::read_to_string(f.layout.log_path("demo")).unwrap();
        assert!(log.contains("Resolved -> ShortCircuitBenign"));
        assert!(!log.contains("[exec] diff"));
    }
}
