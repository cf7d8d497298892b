use std::path::Path;

use npmrepro_classify::{ChangeKind, Classifier, ClassifyError, KnownMismatches};
use npmrepro_contracts::AuditErrorKind;
use npmrepro_registry::archive::pack_dir_tgz;
use npmrepro_runner_common::scripted::ScriptedRunner;
use npmrepro_runner_common::{CommandOutput, SystemRunner};

fn write_tree(root: &Path, files: &[(&str, &str)]) {
    for (rel, body) in files {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }
}

const BASE: &[(&str, &str)] = &[
    ("package.json", "{\"name\":\"demo\",\"version\":\"1.0.0\"}\n"),
    ("README.md", "# demo\n"),
    ("lib/index.js", "module.exports = 1;\n"),
];

/// Builds `built/package` and `published/<wrapper>` from the same base plus extras.
fn tree_pair(
    tmp: &Path,
    built_extra: &[(&str, &str)],
    published_extra: &[(&str, &str)],
) -> (std::path::PathBuf, std::path::PathBuf) {
    let built = tmp.join("built");
    let published = tmp.join("published");
    write_tree(&built.join("package"), BASE);
    write_tree(&built.join("package"), built_extra);
    write_tree(&published.join("node"), BASE);
    write_tree(&published.join("node"), published_extra);
    (built, published)
}

fn classifier() -> Classifier<SystemRunner> {
    Classifier::new(SystemRunner, KnownMismatches::builtin())
}

#[test]
fn allow_listed_version_short_circuits_without_diffing() {
    let runner = ScriptedRunner::new();
    let classifier = Classifier::new(&runner, KnownMismatches::builtin());
    let verdict = classifier
        .classify(Path::new("/nonexistent/a"), Path::new("/nonexistent/b"), "safe-buffer", "5.2.1")
        .unwrap();
    assert!(!verdict.content_matches);
    assert!(verdict.is_known_benign_mismatch);
    assert!(verdict.allow_listed);
    assert!(runner.calls().is_empty());
}

#[test]
fn identical_trees_match_regardless_of_wrapper_name() {
    let tmp = tempfile::tempdir().unwrap();
    let (built, published) = tree_pair(tmp.path(), &[], &[]);
    let verdict = classifier()
        .classify(&built, &published, "demo", "1.0.0")
        .unwrap();
    assert!(verdict.content_matches);
    assert!(!verdict.is_known_benign_mismatch);
    assert!(verdict.changes.is_empty());
}

#[test]
fn modified_tsbuildinfo_alone_is_benign() {
    let tmp = tempfile::tempdir().unwrap();
    let (built, published) = tree_pair(
        tmp.path(),
        &[("tsconfig.tsbuildinfo", "{\"version\":\"5.0.2\",\"a\":1}\n")],
        &[("tsconfig.tsbuildinfo", "{\"version\":\"5.0.2\",\"a\":2}\n")],
    );
    let verdict = classifier()
        .classify(&built, &published, "demo", "1.0.0")
        .unwrap();
    assert!(!verdict.content_matches);
    assert!(verdict.is_known_benign_mismatch);
    assert_eq!(verdict.changes.len(), 1);
    assert_eq!(verdict.changes[0].kind, ChangeKind::Modified);
    assert_eq!(verdict.changes[0].path, "/tsconfig.tsbuildinfo");
}

#[test]
fn published_changelog_flags_benign_but_not_matching() {
    let tmp = tempfile::tempdir().unwrap();
    let (built, published) = tree_pair(tmp.path(), &[], &[("CHANGELOG.md", "## 1.0.0\n")]);
    let verdict = classifier()
        .classify(&built, &published, "demo", "1.0.0")
        .unwrap();
    assert!(!verdict.content_matches);
    assert!(verdict.is_known_benign_mismatch);
    assert_eq!(verdict.changes[0].kind, ChangeKind::Added);
    assert_eq!(verdict.changes[0].rule.as_deref(), Some("published-changelog"));
}

#[test]
fn types_readme_is_benign_until_declarations_differ() {
    let tmp = tempfile::tempdir().unwrap();
    let (built, published) = tree_pair(
        tmp.path(),
        &[("README.md", "# built\n"), ("index.d.ts", "export {};\n")],
        &[("README.md", "# published\n"), ("index.d.ts", "export {};\n")],
    );
    let verdict = classifier()
        .classify(&built, &published, "@types/node", "20.1.0")
        .unwrap();
    assert!(verdict.is_known_benign_mismatch, "{verdict:?}");

    std::fs::write(published.join("node/index.d.ts"), "export declare const x: 1;\n").unwrap();
    let verdict = classifier()
        .classify(&built, &published, "@types/node", "20.1.0")
        .unwrap();
    assert!(!verdict.content_matches);
    assert!(!verdict.is_known_benign_mismatch);
    let unexplained: Vec<_> = verdict
        .changes
        .iter()
        .filter(|c| c.rule.is_none())
        .map(|c| c.path.as_str())
        .collect();
    assert_eq!(unexplained, vec!["/index.d.ts"]);
}

#[test]
fn classification_is_idempotent() {
    let tmp = tempfile::tempdir().unwrap();
    let (built, published) = tree_pair(
        tmp.path(),
        &[("lib/extra.js", "1\n")],
        &[("CHANGELOG.md", "x\n")],
    );
    let c = classifier();
    let first = c.classify(&built, &published, "demo", "1.0.0").unwrap();
    let second = c.classify(&built, &published, "demo", "1.0.0").unwrap();
    assert_eq!(first, second);
    assert!(first.is_real_mismatch());
}

#[test]
fn archives_with_different_wrappers_compare_equal() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src");
    write_tree(&src, BASE);
    let built = tmp.path().join("built.tgz");
    let published = tmp.path().join("published.tgz");
    pack_dir_tgz(&src, "package", &built).unwrap();
    pack_dir_tgz(&src, "demo-1.0.0", &published).unwrap();

    let verdict = classifier()
        .classify_archives(&built, &published, &tmp.path().join("scratch"), "demo", "1.0.0")
        .unwrap();
    assert!(verdict.content_matches, "{verdict:?}");
}

#[test]
fn silent_diff_failure_is_its_own_error_kind() {
    let tmp = tempfile::tempdir().unwrap();
    let (built, published) = tree_pair(tmp.path(), &[], &[]);
    let runner =
        ScriptedRunner::new().on_output("diff", CommandOutput::failed(2, "diff: out of memory"));
    let err = Classifier::new(&runner, KnownMismatches::empty())
        .classify(&built, &published, "demo", "1.0.0")
        .unwrap_err();
    assert!(matches!(err, ClassifyError::DiffProducedNoOutput { .. }));
    assert_eq!(err.kind(), AuditErrorKind::DiffProducedNoOutput);
}
