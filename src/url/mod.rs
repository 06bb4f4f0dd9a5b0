use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Error, Result};

static RE_ISSUE_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-Za-z][A-Za-z0-9_]*)-(\d+)$").unwrap());
static RE_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"<([^>]*)>\s*((?:;\s*[^;,]+)*)"#).unwrap());

/// Check if a string looks like a tracker issue key (`ABC-123`).
pub fn is_issue_key(s: &str) -> bool {
    RE_ISSUE_KEY.is_match(s)
}

/// Resolve an issue key from either a raw key or a tracker web URL.
///
/// Supported inputs:
/// - `ABC-123` (case-insensitive queue part, normalised to upper case)
/// - `https://tracker.example.com/ABC-123`
/// - `https://tracker.example.com/ABC-123?focus=comments`
pub fn resolve_issue_key(input: &str) -> Result<String> {
    let input = input.trim();
    if is_issue_key(input) {
        return Ok(normalize_key(input));
    }
    if input.contains("://") {
        let parsed = ::url::Url::parse(input).map_err(|e| {
            Error::InvalidIdentifier(format!("{input}: {e}"))
        })?;
        let last = parsed
            .path_segments()
            .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
            .unwrap_or("");
        if is_issue_key(last) {
            return Ok(normalize_key(last));
        }
        return Err(Error::InvalidIdentifier(format!(
            "no issue key in URL: {input}"
        )));
    }
    Err(Error::InvalidIdentifier(format!(
        "expected an issue key like ABC-123, got: {input}"
    )))
}

fn normalize_key(key: &str) -> String {
    key.to_ascii_uppercase()
}

/// Extract the `id` query parameter of the `rel="next"` target in a
/// changelog `Link` header.
///
/// `<https://api/v2/issues/A-1/changelog?id=5f&perPage=50>; rel="next"`
/// yields `Some("5f")`. Relative targets are accepted.
pub fn next_link_id(header: &str) -> Option<String> {
    let target = RE_LINK
        .captures_iter(header)
        .find(|caps| {
            caps.get(2)
                .map(|params| is_next_rel(params.as_str()))
                .unwrap_or(false)
        })
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())?;

    let parsed = match ::url::Url::parse(target) {
        Ok(u) => u,
        Err(::url::ParseError::RelativeUrlWithoutBase) => {
            let base = ::url::Url::parse("http://localhost/").ok()?;
            base.join(target).ok()?
        }
        Err(e) => {
            log::warn!("Unparseable Link target {target:?}: {e}");
            return None;
        }
    };
    parsed
        .query_pairs()
        .find(|(k, _)| k == "id")
        .map(|(_, v)| v.into_owned())
        .filter(|v| !v.is_empty())
}

fn is_next_rel(params: &str) -> bool {
    params.split(';').any(|param| {
        let mut parts = param.splitn(2, '=');
        let name = parts.next().unwrap_or("").trim();
        let value = parts.next().unwrap_or("").trim().trim_matches('"');
        name.eq_ignore_ascii_case("rel")
            && value.split_whitespace().any(|v| v.eq_ignore_ascii_case("next"))
    })
}
