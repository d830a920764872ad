//! §4.C NameCanonicalizer — maps one raw dependency token to a
//! canonical binary-package name, and derives candidate source-archive
//! names from a canonical name.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use regex::Regex;
use tracing::{debug, trace};

use crate::config::MACRO_EXPANSION_DEPTH;
use crate::ml_fallback::MlFallback;
use crate::model::NameResolutionMode;
use crate::spec_analyzer::expand_macros;

/// One (regex, transform) entry of the virtual-provide rewrite table
///. Order matters: first match wins.
struct VirtualProvidePattern {
    name: &'static str,
    regex: Regex,
    transform: fn(&regex::Captures) -> String,
}

fn virtual_provide_patterns() -> &'static Vec<VirtualProvidePattern> {
    static PATTERNS: OnceLock<Vec<VirtualProvidePattern>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            VirtualProvidePattern {
                name: "python-dist",
                regex: Regex::new(r"^python(\d*(?:\.\d+)?)dist\((.+)\)$").unwrap(),
                transform: |c| {
                    let n = &c[1];
                    let pkg = &c[2];
                    if n.is_empty() {
                        format!("python3-{pkg}")
                    } else {
                        format!("python{n}-{pkg}")
                    }
                },
            },
            VirtualProvidePattern {
                name: "pkgconfig",
                regex: Regex::new(r"^pkgconfig\((.+)\)$").unwrap(),
                transform: |c| format!("{}-devel", &c[1]),
            },
            VirtualProvidePattern {
                name: "perl",
                regex: Regex::new(r"^perl\((.+)\)$").unwrap(),
                transform: |c| format!("perl-{}", c[1].replace("::", "-")),
            },
            VirtualProvidePattern {
                name: "rubygem",
                regex: Regex::new(r"^rubygem\((.+)\)$").unwrap(),
                transform: |c| format!("rubygem-{}", &c[1]),
            },
            VirtualProvidePattern {
                name: "npm",
                regex: Regex::new(r"^npm\((.+)\)$").unwrap(),
                transform: |c| format!("nodejs-{}", &c[1]),
            },
            VirtualProvidePattern {
                name: "cmake",
                regex: Regex::new(r"^cmake\((.+)\)$").unwrap(),
                transform: |c| format!("cmake-{}", c[1].to_lowercase()),
            },
            VirtualProvidePattern {
                name: "tex",
                regex: Regex::new(r"^tex\((.+)\)$").unwrap(),
                transform: |c| format!("texlive-{}", &c[1]),
            },
            VirtualProvidePattern {
                name: "golang",
                regex: Regex::new(r"^golang\((.+)\)$").unwrap(),
                transform: |c| format!("golang-{}", c[1].replace('/', "-")),
            },
            VirtualProvidePattern {
                name: "mvn",
                regex: Regex::new(r"^mvn\(([^:]+):([^:]+)\)$").unwrap(),
                transform: |c| c[2].to_string(),
            },
        ]
    })
}

/// In-process cache + regex pipeline + optional ML fallback for
/// resolving raw dependency tokens to canonical binary names.
pub struct NameCanonicalizer {
    cache: Mutex<HashMap<String, String>>,
    mode: NameResolutionMode,
    ml_fallback: Option<Arc<dyn MlFallback>>,
}

impl NameCanonicalizer {
    pub fn new(mode: NameResolutionMode, ml_fallback: Option<Arc<dyn MlFallback>>) -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
            mode,
            ml_fallback,
        }
    }

    pub fn without_ml() -> Self {
        Self::new(NameResolutionMode::RulesOnly, None)
    }

    /// Pipeline of §4.C, first hit wins: cache, macro expansion,
    /// virtual-provide rewrite, ML fallback, identity. `mode ==
    /// NameResolutionMode::Off` disables the rewrite/ML stages
    /// entirely, so a dependency token is only ever macro-expanded.
    pub fn canonicalize(&self, raw_token: &str) -> String {
        if let Some(hit) = self.cache.lock().unwrap().get(raw_token).cloned() {
            trace!(token = raw_token, result = %hit, "canonicalization cache hit");
            return hit;
        }

        let expanded = expand_macros(raw_token, MACRO_EXPANSION_DEPTH).text;

        let result = if matches!(self.mode, NameResolutionMode::Off) {
            expanded
        } else if let Some(rewritten) = apply_virtual_provide_patterns(&expanded) {
            rewritten
        } else if matches!(self.mode, NameResolutionMode::RulesPlusMl) && self.ml_fallback.is_some() {
            let fallback = self.ml_fallback.as_ref().unwrap();
            match fallback.predict(&expanded) {
                Some(prediction) => {
                    debug!(token = raw_token, rpm = %prediction.rpm_name, distance = prediction.distance, "ML fallback resolved token");
                    prediction.rpm_name
                }
                None => expanded,
            }
        } else {
            expanded
        };

        self.cache
            .lock()
            .unwrap()
            .insert(raw_token.to_string(), result.clone());
        result
    }

    /// `candidateSourceNames(binaryName) → ordered sequence of string`
    ///. Tries the typically-shorter source name first, then the
    /// binary form verbatim.
    pub fn candidate_source_names(&self, binary_name: &str) -> Vec<String> {
        candidate_source_names(binary_name)
    }
}

fn apply_virtual_provide_patterns(token: &str) -> Option<String> {
    for pattern in virtual_provide_patterns() {
        if let Some(captures) = pattern.regex.captures(token) {
            let result = (pattern.transform)(&captures);
            trace!(pattern = pattern.name, token, result = %result, "virtual-provide rewrite matched");
            return Some(result);
        }
    }
    None
}

/// Standalone so tests and `ArchiveFetcher` can call it without a
/// `NameCanonicalizer` instance (it carries no cache-dependent state).
pub fn candidate_source_names(binary_name: &str) -> Vec<String> {
    if let Some(rest) = strip_python_prefix(binary_name) {
        return dedup_preserve_order(vec![format!("python-{rest}"), binary_name.to_string()]);
    }
    for suffix in ["-devel", "-libs"] {
        if let Some(stripped) = binary_name.strip_suffix(suffix) {
            return dedup_preserve_order(vec![stripped.to_string(), binary_name.to_string()]);
        }
    }
    for prefix in ["perl-", "rubygem-", "nodejs-", "golang-"] {
        if let Some(stripped) = binary_name.strip_prefix(prefix) {
            return dedup_preserve_order(vec![stripped.to_string(), binary_name.to_string()]);
        }
    }
    vec![binary_name.to_string()]
}

/// Matches `python{N}-X` where `N` is a version-ish numeric/dotted
/// token, returning `X`.
fn strip_python_prefix(name: &str) -> Option<&str> {
    let rest = name.strip_prefix("python")?;
    let dash = rest.find('-')?;
    let (version_part, tail) = rest.split_at(dash);
    if version_part.is_empty() || !version_part.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return None;
    }
    Some(&tail[1..])
}

fn dedup_preserve_order(items: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    items.into_iter().filter(|item| seen.insert(item.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn canon(token: &str) -> String {
        NameCanonicalizer::without_ml().canonicalize(token)
    }

    #[test]
    fn s1_seed_scenarios() {
        assert_eq!(canon("python3dist(requests)"), "python3-requests");
        assert_eq!(canon("python3.12dist(setuptools)"), "python3.12-setuptools");
        assert_eq!(canon("pkgconfig(glib-2.0)"), "glib-2.0-devel");
        assert_eq!(canon("perl(File::Path)"), "perl-File-Path");
        assert_eq!(canon("rubygem(bundler)"), "rubygem-bundler");
        assert_eq!(canon("npm(typescript)"), "nodejs-typescript");
        assert_eq!(canon("cmake(Qt5Core)"), "cmake-qt5core");
        assert_eq!(canon("golang(github.com/foo/bar)"), "golang-github.com-foo-bar");
        assert_eq!(canon("mvn(org.apache:commons-lang)"), "commons-lang");
        assert_eq!(canon("%{python3_pkgversion}-devel"), "3-devel");
        assert_eq!(canon("gcc"), "gcc");
    }

    #[test]
    fn s2_candidate_source_names() {
        assert_eq!(
            candidate_source_names("python3-requests"),
            vec!["python-requests".to_string(), "python3-requests".to_string()]
        );
        assert_eq!(
            candidate_source_names("glib2-devel"),
            vec!["glib2".to_string(), "glib2-devel".to_string()]
        );
        // See DESIGN.md for why this follows the §4.C prefix-rule table
        // (CPAN dist tarballs drop the `perl-` prefix) rather than the
        // single-element reading of the same seed scenario in spec.md §8.
        assert_eq!(
            candidate_source_names("perl-File-Path"),
            vec!["File-Path".to_string(), "perl-File-Path".to_string()]
        );
    }

    #[test]
    fn p6_candidate_first_element_is_x_iff_no_rule_applies() {
        assert_eq!(candidate_source_names("gcc"), vec!["gcc".to_string()]);
        assert_ne!(candidate_source_names("python3-foo")[0], "python3-foo");
    }

    #[test]
    fn p7_canonicalize_is_idempotent() {
        let canonicalizer = NameCanonicalizer::without_ml();
        for token in ["python3dist(requests)", "pkgconfig(zlib)", "gcc", "perl(File::Path)"] {
            let once = canonicalizer.canonicalize(token);
            let twice = canonicalizer.canonicalize(&once);
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn cache_hits_avoid_recomputation() {
        let canonicalizer = NameCanonicalizer::without_ml();
        let first = canonicalizer.canonicalize("pkgconfig(glib-2.0)");
        let second = canonicalizer.canonicalize("pkgconfig(glib-2.0)");
        assert_eq!(first, second);
        assert_eq!(canonicalizer.cache.lock().unwrap().len(), 1);
    }
}
