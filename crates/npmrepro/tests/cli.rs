use std::path::{Path, PathBuf};
use std::process::Command;

use npmrepro_contracts::{AUDIT_RECORD_SCHEMA_VERSION, VERDICT_SCHEMA_VERSION};
use npmrepro_registry::archive::pack_dir_tgz;
use serde_json::Value;

fn run_npmrepro(args: &[&str]) -> std::process::Output {
    let exe = env!("CARGO_BIN_EXE_npmrepro");
    Command::new(exe)
        .args(args)
        .env_remove("NPMREPRO_DATA_DIR")
        .env_remove("NPMREPRO_REGISTRY_URL")
        .env_remove("NPMREPRO_SANDBOX_BACKEND")
        .env_remove("NPMREPRO_I_ACCEPT_WEAKER_ISOLATION")
        .output()
        .expect("run npmrepro")
}

fn parse_json_stdout(out: &std::process::Output) -> Value {
    serde_json::from_slice(&out.stdout).unwrap_or_else(|err| {
        panic!(
            "parse stdout JSON: {err}\nstdout:\n{}\nstderr:\n{}",
            String::from_utf8_lossy(&out.stdout),
            String::from_utf8_lossy(&out.stderr)
        )
    })
}

fn write_tree(root: &Path, files: &[(&str, &str)]) {
    for (rel, body) in files {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).expect("create parent dir");
        std::fs::write(path, body).expect("write file");
    }
}

fn s(p: &Path) -> &str {
    p.to_str().expect("utf-8 path")
}

const FILES: &[(&str, &str)] = &[
    ("package.json", "{\"name\":\"demo\",\"version\":\"1.0.0\"}\n"),
    ("index.js", "module.exports = 1;\n"),
];

/// A `file://` registry holding `demo@1.0.0` with the given repository JSON member.
fn registry_with_demo(root: &Path, repository: &str) -> String {
    let registry = root.join("registry");
    let src = root.join("src");
    write_tree(&src, FILES);
    let tarball = registry.join("demo-1.0.0.tgz");
    std::fs::create_dir_all(&registry).unwrap();
    pack_dir_tgz(&src, "package", &tarball).unwrap();
    let doc = format!(
        r#"{{"name":"demo","dist-tags":{{"latest":"1.0.0"}},"time":{{"1.0.0":"2024-05-01T00:00:00.000Z"}},"versions":{{"1.0.0":{{"version":"1.0.0",{repository}"dist":{{"tarball":"file://{}"}}}}}}}}"#,
        tarball.display()
    );
    std::fs::write(registry.join("demo"), doc).unwrap();
    format!("file://{}/", registry.display())
}

#[test]
fn classify_identical_archives_with_different_wrappers() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src");
    write_tree(&src, FILES);
    let built = tmp.path().join("built.tgz");
    let published = tmp.path().join("published.tgz");
    pack_dir_tgz(&src, "package", &built).unwrap();
    pack_dir_tgz(&src, "demo", &published).unwrap();

    let out = run_npmrepro(&[
        "classify", "--name", "demo", "--version", "1.0.0", s(&built), s(&published),
    ]);
    assert_eq!(out.status.code(), Some(0), "stderr:\n{}", String::from_utf8_lossy(&out.stderr));
    let v = parse_json_stdout(&out);
    assert_eq!(v["schema_version"], VERDICT_SCHEMA_VERSION);
    assert_eq!(v["content_matches"], true);
    assert_eq!(v["is_known_benign_mismatch"], false);
}

#[test]
fn classify_allow_listed_version_without_inputs() {
    let out = run_npmrepro(&[
        "classify",
        "--name",
        "safe-buffer",
        "--version",
        "5.2.1",
        "/nonexistent/built.tgz",
        "/nonexistent/published.tgz",
    ]);
    assert_eq!(out.status.code(), Some(0), "stderr:\n{}", String::from_utf8_lossy(&out.stderr));
    let v = parse_json_stdout(&out);
    assert_eq!(v["allow_listed"], true);
    assert_eq!(v["is_known_benign_mismatch"], true);
}

#[test]
fn classify_real_mismatch_exits_one() {
    let tmp = tempfile::tempdir().unwrap();
    let built = tmp.path().join("built");
    let published = tmp.path().join("published");
    write_tree(&built.join("package"), FILES);
    write_tree(&published.join("package"), FILES);
    write_tree(&published.join("package"), &[("index.js", "steal();\n")]);

    let out = run_npmrepro(&[
        "--quiet", "classify", "--name", "demo", "--version", "1.0.0", s(&built), s(&published),
    ]);
    assert_eq!(out.status.code(), Some(1));
    let v = parse_json_stdout(&out);
    assert_eq!(v["content_matches"], false);
    assert_eq!(v["changes"][0]["kind"], "modified");
    assert_eq!(v["changes"][0]["path"], "/index.js");
}

#[test]
fn lookup_prints_normalized_repository() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = registry_with_demo(
        tmp.path(),
        r#""repository":{"type":"git","url":"git+ssh://git@github.com/o/demo.git","directory":"packages/demo"},"#,
    );
    let data = tmp.path().join("data");

    let out = run_npmrepro(&[
        "--data-dir", s(&data), "lookup", "demo", "--registry-url", &registry,
    ]);
    assert_eq!(out.status.code(), Some(0), "stderr:\n{}", String::from_utf8_lossy(&out.stderr));
    let v = parse_json_stdout(&out);
    assert_eq!(v["version"], "1.0.0");
    assert_eq!(v["published_at"], "2024-05-01T00:00:00.000Z");
    assert_eq!(v["git"]["url"], "https://github.com/o/demo.git");
    assert_eq!(v["git"]["directory"], "packages/demo");
}

#[test]
fn audit_records_terminal_failure_and_writes_report() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = registry_with_demo(tmp.path(), "");
    let data: PathBuf = tmp.path().join("data");
    std::fs::create_dir_all(&data).unwrap();
    std::fs::write(data.join("packages.txt"), "# tracked\nDemo\n").unwrap();

    let out = run_npmrepro(&[
        "--data-dir", s(&data), "--json", "audit", "all", "--registry-url", &registry,
    ]);
    assert_eq!(out.status.code(), Some(1), "stderr:\n{}", String::from_utf8_lossy(&out.stderr));
    let v = parse_json_stdout(&out);
    let records = v["records"].as_array().expect("records[]");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["schema_version"], AUDIT_RECORD_SCHEMA_VERSION);
    assert_eq!(records[0]["package"], "demo");
    assert_eq!(records[0]["error_kind"], "no-repository");
    assert_eq!(v["summary"]["no-repository"], 1);

    assert!(data.join("results/demo/1.0.0.json").is_file());
    assert!(data.join("logs/demo.log").is_file());
    let html = std::fs::read_to_string(data.join("report.html")).unwrap();
    assert!(html.contains("id=\"npmrepro-results\""));

    // The failure filter selects it again; an unmatched filter selects nothing.
    let out = run_npmrepro(&[
        "--data-dir", s(&data), "--json", "audit", "failed:no-repository", "--registry-url", &registry,
    ]);
    assert_eq!(out.status.code(), Some(1));
    assert_eq!(parse_json_stdout(&out)["records"].as_array().unwrap().len(), 1);

    let out = run_npmrepro(&[
        "--data-dir", s(&data), "--json", "audit", "mismatched", "--registry-url", &registry,
    ]);
    assert_eq!(out.status.code(), Some(0));
    assert!(parse_json_stdout(&out)["records"].as_array().unwrap().is_empty());

    let report = tmp.path().join("out/report.html");
    let out = run_npmrepro(&["--data-dir", s(&data), "--quiet", "report", "--out", s(&report)]);
    assert_eq!(out.status.code(), Some(0));
    assert!(std::fs::read_to_string(report).unwrap().contains("no-repository"));
}

#[test]
fn unisolated_builds_require_explicit_acceptance() {
    let tmp = tempfile::tempdir().unwrap();
    let data = tmp.path().join("data");
    let out = run_npmrepro(&[
        "--data-dir", s(&data), "audit", "demo", "--sandbox-backend", "none",
    ]);
    assert_eq!(out.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&out.stderr).contains("--i-accept-weaker-isolation"));
    assert!(!data.join("results").exists());
}
