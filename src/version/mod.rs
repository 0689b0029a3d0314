//! Version parsing and version-token handling
//!
//! Every place a version can hide inside a distribution (archive URL path
//! tokens, `name@version` and `name==version` specifiers) is located here.
//! Validation asks "does this token equal the manifest version?" and the
//! updater asks "rewrite this token to the new version" through the same
//! functions, so the two cannot disagree.

use once_cell::sync::Lazy;
use regex::Regex;
use std::ops::Range;

use crate::models::PackageIndex;

/// Literal alias that pins nothing
pub const LATEST_ALIAS: &str = "latest";

static URL_VERSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"v?\d+\.\d+(?:\.\d+)?").expect("static regex"));

static PYPI_NAME_END: Lazy<Regex> = Lazy::new(|| Regex::new(r"[<>=!@~\[ ]").expect("static regex"));

/// Parse a strict semantic version (`MAJOR.MINOR.PATCH[-pre][+build]`)
pub fn parse_version(version: &str) -> Result<semver::Version, semver::Error> {
    semver::Version::parse(version)
}

pub fn is_semver(version: &str) -> bool {
    parse_version(version).is_ok()
}

/// Normalize an upstream tag or version to `x.y.z`
///
/// Strips a leading `v` and pads `x` / `x.y` with zeros.
pub fn normalize_version(raw: &str) -> String {
    let trimmed = raw.trim();
    let stripped = trimmed
        .strip_prefix('v')
        .or_else(|| trimmed.strip_prefix('V'))
        .unwrap_or(trimmed);
    let (core, suffix) = match stripped.find(|c: char| c == '-' || c == '+') {
        Some(pos) => stripped.split_at(pos),
        None => (stripped, ""),
    };
    let mut parts: Vec<&str> = core.split('.').collect();
    while parts.len() < 3 {
        parts.push("0");
    }
    format!("{}{}", parts.join("."), suffix)
}

/// `1.6.0` -> `1.6`; versions with a non-zero patch have no short form
pub fn short_version(version: &str) -> Option<&str> {
    let short = version.strip_suffix(".0")?;
    (short.matches('.').count() == 1).then_some(short)
}

// ============================================================================
// Package specifiers
// ============================================================================

/// Location of the version inside a package specifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecVersion<'a> {
    pub name: &'a str,
    pub version: Option<&'a str>,
    /// Byte range of `version` inside the specifier
    pub range: Option<Range<usize>>,
}

/// Split an npm specifier like `@scope/name@1.2.3` into name and version
pub fn split_npm_spec(spec: &str) -> SpecVersion<'_> {
    let search_from = usize::from(spec.starts_with('@'));
    match spec[search_from..].find('@') {
        Some(rel) => {
            let at = search_from + rel;
            SpecVersion {
                name: &spec[..at],
                version: Some(&spec[at + 1..]),
                range: Some(at + 1..spec.len()),
            }
        }
        None => SpecVersion {
            name: spec,
            version: None,
            range: None,
        },
    }
}

/// Split a PyPI specifier like `name==1.2.3` or `name@1.2.3`
pub fn split_pypi_spec(spec: &str) -> SpecVersion<'_> {
    let name_end = PYPI_NAME_END.find(spec).map_or(spec.len(), |m| m.start());
    let name = &spec[..name_end];
    // Extras (`name[cli]==1.0`) sit between the name and the operator
    let op_start = match spec[name_end..].strip_prefix('[') {
        Some(extras) => extras.find(']').map_or(spec.len(), |end| name_end + end + 2),
        None => name_end,
    };
    let rest = &spec[op_start..];

    let op_len = if rest.starts_with("===") {
        3
    } else if rest.starts_with("==") {
        2
    } else if rest.starts_with('@') {
        1
    } else {
        0
    };

    if op_len == 0 {
        return SpecVersion {
            name,
            version: None,
            range: None,
        };
    }

    let start = op_start + op_len;
    let version = spec[start..].trim();
    let start = start + (spec[start..].len() - spec[start..].trim_start().len());
    SpecVersion {
        name,
        version: Some(version),
        range: Some(start..start + version.len()),
    }
}

pub fn split_package_spec(index: PackageIndex, spec: &str) -> SpecVersion<'_> {
    match index {
        PackageIndex::Npm => split_npm_spec(spec),
        PackageIndex::PyPi => split_pypi_spec(spec),
    }
}

/// Replace the pinned version of a package specifier
///
/// Returns `None` when the specifier pins no version.
pub fn rewrite_package_spec(index: PackageIndex, spec: &str, new_version: &str) -> Option<String> {
    let range = split_package_spec(index, spec).range?;
    let mut out = String::with_capacity(spec.len() + new_version.len());
    out.push_str(&spec[..range.start]);
    out.push_str(new_version);
    out.push_str(&spec[range.end..]);
    Some(out)
}

// ============================================================================
// Archive URLs
// ============================================================================

/// A version-looking token inside an archive URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlToken {
    /// Byte range of the numeric part (any `v` prefix excluded)
    pub range: Range<usize>,
}

impl UrlToken {
    pub fn text<'a>(&self, url: &'a str) -> &'a str {
        &url[self.range.clone()]
    }
}

/// Result of comparing an archive URL against a manifest version
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrlVersion {
    /// At least one token equals the version
    Matches,
    /// The URL embeds no version token at all
    Unversioned,
    /// The URL embeds version tokens, none of them the manifest version
    Mismatch(Vec<String>),
}

fn path_start(url: &str) -> usize {
    match url.find("://") {
        Some(scheme_end) => {
            let host_start = scheme_end + 3;
            url[host_start..]
                .find('/')
                .map_or(url.len(), |p| host_start + p)
        }
        None => 0,
    }
}

fn is_leading_delimiter(c: char) -> bool {
    matches!(c, '/' | '-' | '_' | '@' | '=')
}

fn is_trailing_boundary(rest: &str) -> bool {
    let mut chars = rest.chars();
    match chars.next() {
        None => true,
        Some('/' | '-' | '_' | '+' | '?' | '#') => true,
        Some('.') => !chars.next().is_some_and(|c| c.is_ascii_digit()),
        Some(_) => false,
    }
}

/// Find delimited version tokens in the path of an archive URL
pub fn url_version_tokens(url: &str) -> Vec<UrlToken> {
    let start = path_start(url);
    let path = &url[start..];

    URL_VERSION
        .find_iter(path)
        .filter_map(|m| {
            let before_ok = path[..m.start()]
                .chars()
                .next_back()
                .map_or(true, is_leading_delimiter);
            if !before_ok || !is_trailing_boundary(&path[m.end()..]) {
                return None;
            }
            let text = m.as_str();
            let numeric_start = m.start() + usize::from(text.starts_with('v'));
            Some(UrlToken {
                range: start + numeric_start..start + m.end(),
            })
        })
        .collect()
}

/// Span of `version` (or its short form) starting at a token, if it matches
fn matched_span(url: &str, token: &UrlToken, version: &str) -> Option<(Range<usize>, bool)> {
    let at = token.range.start;
    let rest = &url[at..];
    if rest.starts_with(version) && is_trailing_boundary(&rest[version.len()..]) {
        return Some((at..at + version.len(), false));
    }
    let short = short_version(version)?;
    (token.text(url) == short).then(|| (token.range.clone(), true))
}

pub fn archive_url_version(url: &str, version: &str) -> UrlVersion {
    let tokens = url_version_tokens(url);
    if tokens.is_empty() {
        return UrlVersion::Unversioned;
    }
    if tokens.iter().any(|t| matched_span(url, t, version).is_some()) {
        return UrlVersion::Matches;
    }
    UrlVersion::Mismatch(tokens.iter().map(|t| t.text(url).to_string()).collect())
}

/// Rewrite every token of `old_version` in an archive URL to `new_version`
///
/// Short-form tokens (`1.6` for `1.6.0`) are rewritten to the short form of
/// the new version when it has one.
pub fn rewrite_archive_url(url: &str, old_version: &str, new_version: &str) -> String {
    let spans: Vec<(Range<usize>, bool)> = url_version_tokens(url)
        .iter()
        .filter_map(|t| matched_span(url, t, old_version))
        .collect();

    let mut out = String::with_capacity(url.len());
    let mut cursor = 0;
    for (range, short) in spans {
        if range.start < cursor {
            continue;
        }
        out.push_str(&url[cursor..range.start]);
        let replacement = if short {
            short_version(new_version).unwrap_or(new_version)
        } else {
            new_version
        };
        out.push_str(replacement);
        cursor = range.end;
    }
    out.push_str(&url[cursor..]);
    out
}

/// Final path segment of a URL, without query or fragment
pub fn url_file_name(url: &str) -> &str {
    let path = &url[path_start(url)..];
    let path = path.split(|c: char| c == '?' || c == '#').next().unwrap_or(path);
    path.rsplit('/').next().unwrap_or(path)
}

/// `true` if any URL path segment is the `latest` alias
pub fn url_has_latest_alias(url: &str) -> bool {
    let path = &url[path_start(url)..];
    let path = path.split(|c: char| c == '?' || c == '#').next().unwrap_or(path);
    path.split('/')
        .any(|segment| segment.eq_ignore_ascii_case(LATEST_ALIAS))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_version() {
        assert_eq!(normalize_version("v1.2"), "1.2.0");
        assert_eq!(normalize_version("2"), "2.0.0");
        assert_eq!(normalize_version("1.2.3"), "1.2.3");
        assert_eq!(normalize_version("v1.2-rc.1"), "1.2.0-rc.1");
    }

    #[test]
    fn test_short_version() {
        assert_eq!(short_version("1.6.0"), Some("1.6"));
        assert_eq!(short_version("1.6.1"), None);
        assert_eq!(short_version("1.0"), None);
    }

    #[test]
    fn test_npm_spec_split() {
        let scoped = split_npm_spec("@google/gemini-cli@0.30.0");
        assert_eq!(scoped.name, "@google/gemini-cli");
        assert_eq!(scoped.version, Some("0.30.0"));

        let bare_scoped = split_npm_spec("@google/gemini-cli");
        assert_eq!(bare_scoped.name, "@google/gemini-cli");
        assert_eq!(bare_scoped.version, None);

        let plain = split_npm_spec("some-package@1.2.3");
        assert_eq!(plain.name, "some-package");
        assert_eq!(plain.version, Some("1.2.3"));

        assert_eq!(split_npm_spec("").name, "");
    }

    #[test]
    fn test_pypi_spec_split() {
        let pinned = split_pypi_spec("some-package==1.2.3");
        assert_eq!(pinned.name, "some-package");
        assert_eq!(pinned.version, Some("1.2.3"));

        let at = split_pypi_spec("some-package@1.2.3");
        assert_eq!(at.version, Some("1.2.3"));

        let ranged = split_pypi_spec("some-package>=1.0");
        assert_eq!(ranged.name, "some-package");
        assert_eq!(ranged.version, None);

        assert_eq!(split_pypi_spec("plain").version, None);
    }

    #[test]
    fn test_pypi_spec_with_extras() {
        let extras = split_pypi_spec("agent[cli,server]==0.9.0");
        assert_eq!(extras.name, "agent");
        assert_eq!(extras.version, Some("0.9.0"));
        assert_eq!(extras.range, Some(19..24));

        assert_eq!(split_pypi_spec("agent[cli]").version, None);
        assert_eq!(split_pypi_spec("agent[cli]>=1.0").version, None);
        assert_eq!(split_pypi_spec("agent[cli").version, None);
        assert_eq!(
            rewrite_package_spec(PackageIndex::PyPi, "agent[cli]==0.9.0", "0.10.0").as_deref(),
            Some("agent[cli]==0.10.0")
        );
    }

    #[test]
    fn test_rewrite_package_spec() {
        assert_eq!(
            rewrite_package_spec(PackageIndex::Npm, "@scope/agent@0.9.0", "0.10.0").as_deref(),
            Some("@scope/agent@0.10.0")
        );
        assert_eq!(
            rewrite_package_spec(PackageIndex::PyPi, "agent==0.9.0", "0.10.0").as_deref(),
            Some("agent==0.10.0")
        );
        assert_eq!(rewrite_package_spec(PackageIndex::Npm, "agent", "1.0.0"), None);
    }

    #[test]
    fn test_url_tokens_respect_boundaries() {
        let url = "https://github.com/o/r/releases/download/v1.2.3/agent-1.2.3-linux-x64.tar.gz";
        let tokens = url_version_tokens(url);
        let texts: Vec<_> = tokens.iter().map(|t| t.text(url)).collect();
        assert_eq!(texts, vec!["1.2.3", "1.2.3"]);

        // host names never count
        assert!(url_version_tokens("https://10.0.0.1/agent.tar.gz").is_empty());
        // four-component numbers are not versions
        assert!(url_version_tokens("https://x.dev/build/1.2.3.4/agent.zip").is_empty());
    }

    #[test]
    fn test_archive_url_version() {
        let url = "https://x.dev/releases/v1.2.3/agent.tar.gz";
        assert_eq!(archive_url_version(url, "1.2.3"), UrlVersion::Matches);
        assert_eq!(
            archive_url_version(url, "1.2.4"),
            UrlVersion::Mismatch(vec!["1.2.3".to_string()])
        );
        assert_eq!(
            archive_url_version("https://x.dev/agent.tar.gz", "1.2.3"),
            UrlVersion::Unversioned
        );
        assert_eq!(
            archive_url_version("https://x.dev/1.6/agent-1.6.zip", "1.6.0"),
            UrlVersion::Matches
        );
    }

    #[test]
    fn test_rewrite_archive_url() {
        let url = "https://github.com/o/r/releases/download/v0.9.0/agent_0.9.0_linux.tar.gz";
        assert_eq!(
            rewrite_archive_url(url, "0.9.0", "0.10.0"),
            "https://github.com/o/r/releases/download/v0.10.0/agent_0.10.0_linux.tar.gz"
        );

        let short = "https://x.dev/1.6/agent-1.6.zip";
        assert_eq!(rewrite_archive_url(short, "1.6.0", "1.7.0"), "https://x.dev/1.7/agent-1.7.zip");
        assert_eq!(rewrite_archive_url(short, "1.6.0", "1.7.2"), "https://x.dev/1.7.2/agent-1.7.2.zip");

        // unrelated versions are left alone
        let other = "https://x.dev/node-18.0/agent-2.0.1.zip";
        assert_eq!(rewrite_archive_url(other, "2.0.1", "2.1.0"), "https://x.dev/node-18.0/agent-2.1.0.zip");
    }

    #[test]
    fn test_latest_alias_and_file_name() {
        assert!(url_has_latest_alias("https://github.com/o/r/releases/latest/download/a.zip"));
        assert!(!url_has_latest_alias("https://latest.example.com/a-latest.zip"));
        assert_eq!(url_file_name("https://x.dev/a/b/agent.tar.gz?raw=1"), "agent.tar.gz");
    }
}
