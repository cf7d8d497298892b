//! Self-contained HTML report over every stored record.

use std::collections::BTreeMap;

use anyhow::Result;
use npmrepro_classify::RULESET_VERSION;
use npmrepro_contracts::REPORT_SCHEMA_VERSION;
use serde::Serialize;

use crate::store::{latest_records, AuditRecord};
use crate::util::html_escape;

pub(crate) const RESULTS_SCRIPT_ID: &str = "npmrepro-results";

#[derive(Serialize)]
struct EmbeddedResults<'a> {
    schema_version: &'static str,
    ruleset_version: u32,
    generated_at: u64,
    records: &'a [AuditRecord],
}

/// Counts of the latest record per package, keyed by category label.
pub(crate) fn summarize(records: &[AuditRecord]) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for record in latest_records(records).values() {
        *counts.entry(record.category().label()).or_insert(0) += 1;
        if record.is_stale() {
            *counts.entry("stale".to_string()).or_insert(0) += 1;
        }
    }
    counts
}

/// JSON for a `<script>` element: `/` and `<` are escaped so the text cannot end it.
pub(crate) fn script_safe_json<T: Serialize>(value: &T) -> Result<String> {
    let json = serde_json::to_string(value)?;
    Ok(json.replace('/', "\\/").replace('<', "\\u003c"))
}

pub(crate) fn render_html(records: &[AuditRecord], generated_at: u64) -> Result<String> {
    let latest = latest_records(records);
    let mut groups: BTreeMap<String, Vec<&AuditRecord>> = BTreeMap::new();
    for record in latest.values() {
        groups.entry(record.category().label()).or_default().push(record);
    }

    let mut s = String::new();
    s.push_str("<!doctype html>\n<html><head><meta charset=\"utf-8\">");
    s.push_str("<title>npmrepro report</title>");
    s.push_str("<style>body{font-family:system-ui,Segoe UI,Helvetica,Arial,sans-serif;margin:24px;line-height:1.45}code{background:#f6f8fa;padding:2px 4px;border-radius:4px}table{border-collapse:collapse;margin-bottom:16px}td,th{padding:6px 8px;border:1px solid #ddd;text-align:left;vertical-align:top}h2{margin-top:28px}.stale{color:#9a6700;font-weight:700}.real-mismatch{color:#cf222e}</style>");
    s.push_str("</head><body>");
    s.push_str("<h1>npmrepro report</h1>");
    s.push_str("<p><b>tool:</b> <code>npmrepro ");
    s.push_str(env!("CARGO_PKG_VERSION"));
    s.push_str("</code> <b>rule set:</b> ");
    s.push_str(&RULESET_VERSION.to_string());
    s.push_str(" <b>packages:</b> ");
    s.push_str(&latest.len().to_string());
    s.push_str("</p>");

    s.push_str("<h2>Summary</h2><table>");
    for (label, count) in summarize(records) {
        s.push_str("<tr><th>");
        s.push_str(&html_escape(&label));
        s.push_str("</th><td>");
        s.push_str(&count.to_string());
        s.push_str("</td></tr>");
    }
    s.push_str("</table>");

    for (label, group) in &groups {
        s.push_str("<h2 class=\"");
        s.push_str(&html_escape(label));
        s.push_str("\">");
        s.push_str(&html_escape(label));
        s.push_str("</h2>");
        render_group(&mut s, group);
    }

    let payload = EmbeddedResults {
        schema_version: REPORT_SCHEMA_VERSION,
        ruleset_version: RULESET_VERSION,
        generated_at,
        records,
    };
    s.push_str("<script type=\"application/json\" id=\"");
    s.push_str(RESULTS_SCRIPT_ID);
    s.push_str("\">");
    s.push_str(&script_safe_json(&payload)?);
    s.push_str("</script>");
    s.push_str("</body></html>\n");
    Ok(s)
}

fn render_group(s: &mut String, group: &[&AuditRecord]) {
    s.push_str("<table><tr><th>package</th><th>version</th><th>build</th><th>details</th></tr>");
    for record in group {
        s.push_str("<tr><td><code>");
        s.push_str(&html_escape(&record.package));
        s.push_str("</code>");
        if record.is_stale() {
            s.push_str(" <span class=\"stale\">stale</span>");
        }
        s.push_str("</td><td>");
        s.push_str(&html_escape(&record.version));
        s.push_str("</td><td>");
        if let Some(build) = &record.build {
            let mut parts = vec![build.package_manager.clone()];
            parts.extend(build.tag.iter().map(|t| format!("tag {t}")));
            parts.extend(build.subdirectory.iter().map(|d| format!("dir {d}")));
            parts.extend(build.build_command.iter().cloned());
            if build.used_clean_publish {
                parts.push("clean-publish".to_string());
            }
            parts.extend(build.special_case.iter().cloned());
            s.push_str(&html_escape(parts.join(", ")));
        }
        s.push_str("</td><td>");
        if let Some(detail) = &record.error_detail {
            s.push_str("<pre>");
            s.push_str(&html_escape(first_lines(detail, 6)));
            s.push_str("</pre>");
        }
        for change in &record.changes {
            s.push_str("<code>");
            s.push_str(change.kind.as_str());
            s.push(' ');
            s.push_str(&html_escape(&change.path));
            s.push_str("</code>");
            if let Some(rule) = &change.rule {
                s.push_str(" (");
                s.push_str(&html_escape(rule));
                s.push(')');
            }
            s.push_str("<br>");
        }
        s.push_str("</td></tr>");
    }
    s.push_str("</table>");
}

fn first_lines(text: &str, n: usize) -> String {
    text.lines().take(n).collect::<Vec<_>>().join("\n")
}
