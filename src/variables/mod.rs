// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 cilocal contributors

//! Variable resolution
//!
//! Interpolates `$VAR`/`${VAR}` in strings and composes the per-job
//! variable scope out of its tiers. Expansion is a single pass; values
//! containing `$` are never re-expanded.

use std::collections::HashMap;

use crate::git::GitInfo;

/// Variable scope, name to value
pub type Scope = HashMap<String, String>;

/// Job identity needed to derive the predefined scope
#[derive(Debug, Clone, Copy)]
pub struct JobIdentity<'a> {
    pub name: &'a str,
    pub stage: &'a str,
    pub job_id: u64,
}

/// Replace each `$NAME` or `${NAME}` with `scope[NAME]` when present,
/// leaving unknown references as literal text.
pub fn expand_text(text: &str, scope: &Scope) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.char_indices().peekable();

    while let Some((i, ch)) = chars.next() {
        if ch != '$' {
            out.push(ch);
            continue;
        }

        match chars.peek() {
            Some((_, '{')) => {
                if let Some(end) = text[i..].find('}') {
                    let name = &text[i + 2..i + end];
                    if is_name(name) {
                        match scope.get(name) {
                            Some(value) => out.push_str(value),
                            None => out.push_str(&text[i..i + end + 1]),
                        }
                        // Skip past the closing brace.
                        while let Some((j, _)) = chars.peek() {
                            if *j > i + end {
                                break;
                            }
                            chars.next();
                        }
                        continue;
                    }
                }
                out.push(ch);
            }
            Some((_, c)) if c.is_ascii_alphabetic() || *c == '_' => {
                let start = i + 1;
                let mut end = start;
                while let Some((j, c)) = chars.peek() {
                    if c.is_ascii_alphanumeric() || *c == '_' {
                        end = *j + c.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                let name = &text[start..end];
                match scope.get(name) {
                    Some(value) => out.push_str(value),
                    None => out.push_str(&text[i..end]),
                }
            }
            _ => out.push(ch),
        }
    }

    out
}

/// Apply [`expand_text`] to every value, producing a new scope.
pub fn expand_all(vars: &Scope, scope: &Scope) -> Scope {
    vars.iter()
        .map(|(k, v)| (k.clone(), expand_text(v, scope)))
        .collect()
}

/// Compose scope tiers; later tiers win.
pub fn compose(tiers: &[&Scope]) -> Scope {
    let mut out = Scope::new();
    for tier in tiers {
        for (k, v) in tier.iter() {
            out.insert(k.clone(), v.clone());
        }
    }
    out
}

/// The current process environment as a scope tier.
pub fn process_env() -> Scope {
    std::env::vars().collect()
}

/// GitLab ref slug: lowercased, runs of non-alphanumerics collapsed to
/// `-`, trimmed, at most 63 characters.
pub fn ref_slug(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for ch in name.to_lowercase().chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch);
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.truncate(63);
    slug.trim_matches('-').to_string()
}

/// `my-project` -> `myProject`
pub fn camel_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper_next = false;
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            if upper_next && !out.is_empty() {
                out.extend(ch.to_uppercase());
            } else {
                out.extend(ch.to_lowercase());
            }
            upper_next = false;
        } else {
            upper_next = true;
        }
    }
    out
}

/// The predefined variable set injected into every job, deterministic
/// from git metadata plus job identity.
pub fn predefined(job: JobIdentity<'_>, git: &GitInfo, pipeline_iid: u64, project_dir: &str) -> Scope {
    let remote = &git.remote;
    let server_url = format!("https://{}", remote.domain);
    let project_path = remote.path();
    let project_url = format!("{server_url}/{project_path}");
    let pipeline_id = pipeline_iid + 1000;

    let mut scope = Scope::new();
    let mut set = |k: &str, v: String| {
        scope.insert(k.to_string(), v);
    };

    set("CI_JOB_NAME", job.name.to_string());
    set("CI_JOB_STAGE", job.stage.to_string());
    set("CI_JOB_ID", job.job_id.to_string());
    set("CI_JOB_URL", format!("{project_url}/-/jobs/{}", job.job_id));

    set("CI_PIPELINE_ID", pipeline_id.to_string());
    set("CI_PIPELINE_IID", pipeline_iid.to_string());
    set(
        "CI_PIPELINE_URL",
        format!("{project_url}/-/pipelines/{pipeline_id}"),
    );
    set("CI_PIPELINE_SOURCE", "push".to_string());

    set("CI_COMMIT_SHA", git.sha.clone());
    set("CI_COMMIT_SHORT_SHA", git.short_sha.clone());
    if !git.is_tag {
        set("CI_COMMIT_BRANCH", git.ref_name.clone());
    }
    set("CI_COMMIT_REF_NAME", git.ref_name.clone());
    set("CI_COMMIT_REF_SLUG", ref_slug(&git.ref_name));
    set("CI_COMMIT_REF_PROTECTED", "false".to_string());
    set("CI_COMMIT_TITLE", git.commit_title.clone());
    set("CI_COMMIT_MESSAGE", git.commit_message.clone());
    set("CI_COMMIT_DESCRIPTION", git.commit_description.clone());

    set("CI_PROJECT_DIR", project_dir.to_string());
    set("CI_PROJECT_NAME", remote.project.clone());
    set("CI_PROJECT_TITLE", camel_case(&remote.project));
    set("CI_PROJECT_PATH", project_path.clone());
    set("CI_PROJECT_PATH_SLUG", ref_slug(&project_path));
    set("CI_PROJECT_NAMESPACE", remote.group.clone());
    set("CI_PROJECT_VISIBILITY", "internal".to_string());
    set("CI_PROJECT_ID", "1217".to_string());
    set("CI_PROJECT_URL", project_url);

    set("CI_SERVER_HOST", remote.domain.clone());
    set("CI_SERVER_URL", server_url.clone());
    set("CI_API_V4_URL", format!("{server_url}/api/v4"));

    set("GITLAB_USER_LOGIN", git.user_email.split('@').next().unwrap_or("").to_string());
    set("GITLAB_USER_EMAIL", git.user_email.clone());
    set("GITLAB_USER_NAME", git.user_name.clone());
    set("GITLAB_CI", "false".to_string());

    scope
}

fn is_name(s: &str) -> bool {
    !s.is_empty()
        && s.chars().next().map(|c| c.is_ascii_alphabetic() || c == '_').unwrap_or(false)
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope(pairs: &[(&str, &str)]) -> Scope {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_expand_bare_and_braced() {
        let s = scope(&[("NAME", "world")]);
        assert_eq!(expand_text("hello $NAME", &s), "hello world");
        assert_eq!(expand_text("hello ${NAME}!", &s), "hello world!");
    }

    #[test]
    fn test_unknown_vars_stay_literal() {
        let s = scope(&[]);
        assert_eq!(expand_text("keep $MISSING and ${ALSO}", &s), "keep $MISSING and ${ALSO}");
    }

    #[test]
    fn test_no_recursive_expansion() {
        let s = scope(&[("A", "$B"), ("B", "deep")]);
        assert_eq!(expand_text("$A", &s), "$B");
    }

    #[test]
    fn test_expansion_is_idempotent_without_dollar_values() {
        let s = scope(&[("X", "one"), ("Y", "two")]);
        let once = expand_text("$X ${Y} $Z", &s);
        assert_eq!(expand_text(&once, &s), once);
    }

    #[test]
    fn test_dollar_before_non_name_is_literal() {
        let s = scope(&[("X", "v")]);
        assert_eq!(expand_text("cost: $5 and $X", &s), "cost: $5 and v");
        assert_eq!(expand_text("trailing $", &s), "trailing $");
    }

    #[test]
    fn test_adjacent_braced_expansion() {
        let s = scope(&[("A", "x"), ("B", "y")]);
        assert_eq!(expand_text("${A}${B}", &s), "xy");
    }

    #[test]
    fn test_compose_later_wins() {
        let a = scope(&[("K", "first"), ("ONLY_A", "a")]);
        let b = scope(&[("K", "second")]);
        let merged = compose(&[&a, &b]);
        assert_eq!(merged["K"], "second");
        assert_eq!(merged["ONLY_A"], "a");
    }

    #[test]
    fn test_ref_slug() {
        assert_eq!(ref_slug("feature/My_Branch!"), "feature-my-branch");
        assert_eq!(ref_slug("main"), "main");
        let long = "x".repeat(100);
        assert!(ref_slug(&long).len() <= 63);
    }

    #[test]
    fn test_camel_case() {
        assert_eq!(camel_case("my-project"), "myProject");
        assert_eq!(camel_case("api"), "api");
        assert_eq!(camel_case("Widget Factory"), "widgetFactory");
    }
}
