use serde::{Deserialize, Serialize};

/// The `repository` field of a manifest or packument, in either of its published shapes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum RepositoryField {
    Shorthand(String),
    Object {
        #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
        kind: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        directory: Option<String>,
    },
}

/// A git repository the resolver can clone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitRepository {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepositoryIssue {
    Missing,
    NotGit(String),
}

impl RepositoryField {
    pub fn to_git(&self) -> Result<GitRepository, RepositoryIssue> {
        match self {
            RepositoryField::Shorthand(raw) => {
                if raw.trim().is_empty() {
                    return Err(RepositoryIssue::Missing);
                }
                Ok(GitRepository {
                    url: normalize_repository_url(raw),
                    directory: None,
                })
            }
            RepositoryField::Object {
                kind,
                url,
                directory,
            } => {
                let Some(url) = url.as_deref().filter(|u| !u.trim().is_empty()) else {
                    return Err(RepositoryIssue::Missing);
                };
                let kind = kind.as_deref().unwrap_or("git").trim();
                if !kind.eq_ignore_ascii_case("git") {
                    return Err(RepositoryIssue::NotGit(kind.to_string()));
                }
                let directory = directory
                    .as_deref()
                    .map(|d| d.trim().trim_matches('/').to_string())
                    .filter(|d| !d.is_empty());
                Ok(GitRepository {
                    url: normalize_repository_url(url),
                    directory,
                })
            }
        }
    }
}

pub fn git_repository(field: Option<&RepositoryField>) -> Result<GitRepository, RepositoryIssue> {
    match field {
        Some(field) => field.to_git(),
        None => Err(RepositoryIssue::Missing),
    }
}

/// Rewrites a declared repository URL into an anonymous `https://` clone URL.
///
/// Handles `git+` prefixes, `git://` and `http://` schemes, scp-style and `ssh://`
/// remotes, hosted shorthands (`github:o/r`, bare `o/r`) and trailing fragments.
pub fn normalize_repository_url(raw: &str) -> String {
    let mut s = raw.trim();
    if let Some((head, _fragment)) = s.split_once('#') {
        s = head;
    }
    let s = s.strip_prefix("git+").unwrap_or(s);

    for (prefix, host) in [
        ("github:", "github.com"),
        ("gitlab:", "gitlab.com"),
        ("bitbucket:", "bitbucket.org"),
        ("gist:", "gist.github.com"),
    ] {
        if let Some(rest) = s.strip_prefix(prefix) {
            return format!("https://{host}/{}", rest.trim_start_matches('/'));
        }
    }

    if let Some(rest) = s.strip_prefix("ssh://") {
        let rest = strip_userinfo(rest);
        let (host, path) = rest.split_once('/').unwrap_or((rest, ""));
        let host = host.split(':').next().unwrap_or(host);
        return format!("https://{host}/{path}");
    }
    if let Some(rest) = s.strip_prefix("git://") {
        return format!("https://{rest}");
    }
    if let Some(rest) = s.strip_prefix("http://") {
        return format!("https://{rest}");
    }
    if s.starts_with("https://") {
        return s.to_string();
    }

    if !s.contains("://") {
        let rest = strip_userinfo(s);
        if let Some((host, path)) = rest.split_once(':') {
            if host.contains('.') {
                return format!("https://{host}/{}", path.trim_start_matches('/'));
            }
        }
        if is_owner_repo_shorthand(s) {
            return format!("https://github.com/{s}");
        }
    }
    s.to_string()
}

fn strip_userinfo(s: &str) -> &str {
    match s.split_once('@') {
        Some((user, rest)) if !user.contains('/') => rest,
        _ => s,
    }
}

fn is_owner_repo_shorthand(s: &str) -> bool {
    let mut parts = s.split('/');
    let (Some(owner), Some(repo), None) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    let ok = |p: &str| {
        !p.is_empty()
            && p
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
    };
    ok(owner) && ok(repo)
}

/// Key used for exact-URL comparisons: scheme-normalized, no trailing `.git` or `/`,
/// lowercase host.
pub fn repository_key(url: &str) -> String {
    let url = normalize_repository_url(url);
    let url = url.trim_end_matches('/');
    let url = url.strip_suffix(".git").unwrap_or(url);
    match url.strip_prefix("https://") {
        Some(rest) => {
            let (host, path) = rest.split_once('/').unwrap_or((rest, ""));
            format!("https://{}/{path}", host.to_ascii_lowercase())
        }
        None => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_vcs_prefix_and_upgrades_scheme() {
        assert_eq!(
            normalize_repository_url("git+https://github.com/feross/safe-buffer.git"),
            "https://github.com/feross/safe-buffer.git"
        );
        assert_eq!(
            normalize_repository_url("git://github.com/isaacs/node-glob.git"),
            "https://github.com/isaacs/node-glob.git"
        );
        assert_eq!(
            normalize_repository_url("http://github.com/a/b"),
            "https://github.com/a/b"
        );
    }

    #[test]
    fn rewrites_key_based_remotes() {
        assert_eq!(
            normalize_repository_url("git@github.com:babel/babel.git"),
            "https://github.com/babel/babel.git"
        );
        assert_eq!(
            normalize_repository_url("git+ssh://git@github.com/facebook/react.git"),
            "https://github.com/facebook/react.git"
        );
        assert_eq!(
            normalize_repository_url("ssh://git@gitlab.com:2222/group/proj.git"),
            "https://gitlab.com/group/proj.git"
        );
    }

    #[test]
    fn expands_shorthands_and_drops_fragments() {
        assert_eq!(
            normalize_repository_url("github:sindresorhus/chalk"),
            "https://github.com/sindresorhus/chalk"
        );
        assert_eq!(
            normalize_repository_url("expressjs/express"),
            "https://github.com/expressjs/express"
        );
        assert_eq!(
            normalize_repository_url("https://github.com/a/b#readme"),
            "https://github.com/a/b"
        );
    }

    #[test]
    fn object_descriptor_requires_git() {
        let field = RepositoryField::Object {
            kind: Some("svn".to_string()),
            url: Some("https://svn.example.org/x".to_string()),
            directory: None,
        };
        assert_eq!(
            field.to_git(),
            Err(RepositoryIssue::NotGit("svn".to_string()))
        );

        let field = RepositoryField::Object {
            kind: Some("git".to_string()),
            url: None,
            directory: None,
        };
        assert_eq!(field.to_git(), Err(RepositoryIssue::Missing));
        assert_eq!(git_repository(None), Err(RepositoryIssue::Missing));
    }

    #[test]
    fn object_descriptor_keeps_directory_hint() {
        let field: RepositoryField = serde_json::from_str(
            r#"{"type":"git","url":"git+https://github.com/babel/babel.git","directory":"packages/babel-types/"}"#,
        )
        .unwrap();
        let repo = field.to_git().unwrap();
        assert_eq!(repo.url, "https://github.com/babel/babel.git");
        assert_eq!(repo.directory.as_deref(), Some("packages/babel-types"));
    }

    #[test]
    fn repository_key_ignores_suffixes() {
        assert_eq!(
            repository_key("git+https://GitHub.com/babel/babel.git"),
            "https://github.com/babel/babel"
        );
        assert_eq!(
            repository_key("https://github.com/babel/babel/"),
            "https://github.com/babel/babel"
        );
    }
}
