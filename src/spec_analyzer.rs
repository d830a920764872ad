//! §4.A SpecAnalyzer — parses a textual spec-file payload into a
//! `PackageInfo`, expanding RPM-style macros along the way.

use std::collections::BTreeMap;

use crate::error::CoreError;
use crate::model::{BuildRequirement, PackageInfo};

/// Fixed table of system macros consulted during expansion (§4.A: "a
/// fixed table of ≥18 system macros"). Values match the conventions a
/// modern Fedora/RHEL-family rpm macro set defines.
fn system_macro_table() -> BTreeMap<&'static str, &'static str> {
    BTreeMap::from([
        ("python3_pkgversion", "3"),
        ("python3_version", "3.12"),
        ("python3_version_nodots", "312"),
        ("python3_sitelib", "/usr/lib/python3.12/site-packages"),
        ("python3_sitearch", "/usr/lib64/python3.12/site-packages"),
        ("_bindir", "/usr/bin"),
        ("_sbindir", "/usr/sbin"),
        ("_libdir", "/usr/lib64"),
        ("_libexecdir", "/usr/libexec"),
        ("_datadir", "/usr/share"),
        ("_sysconfdir", "/etc"),
        ("_includedir", "/usr/include"),
        ("_mandir", "/usr/share/man"),
        ("_docdir", "/usr/share/doc"),
        ("_prefix", "/usr"),
        ("_exec_prefix", "/usr"),
        ("_localstatedir", "/var"),
        ("_sharedstatedir", "/var/lib"),
        ("_rundir", "/run"),
        ("_tmpfilesdir", "/usr/lib/tmpfiles.d"),
        ("_unitdir", "/usr/lib/systemd/system"),
        ("perl_vendorlib", "/usr/share/perl5/vendor_perl"),
        ("perl_vendorarch", "/usr/lib64/perl5/vendor_perl"),
        ("rust_arches", "x86_64 aarch64"),
        ("go_arches", "x86_64 aarch64"),
    ])
}

/// Result of expanding a macro string: the expanded text plus any
/// non-optional macro names that could not be resolved (§4.A:
/// "unknown non-optional macros are left verbatim and flagged").
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MacroExpansion {
    pub text: String,
    pub unresolved: Vec<String>,
}

/// Expands `%{name}`, `%{?name}` and `%name` forms against
/// `system_macro_table()`, iterating up to `MACRO_EXPANSION_DEPTH`
/// times to resolve macros that expand to other macros.
pub fn expand_macros(input: &str, depth_cap: usize) -> MacroExpansion {
    let table = system_macro_table();
    let mut text = input.to_string();
    let mut unresolved = Vec::new();

    for _ in 0..depth_cap {
        let (next, hit_any, pass_unresolved) = expand_macros_once(&text, &table);
        unresolved = pass_unresolved;
        if !hit_any {
            break;
        }
        text = next;
    }

    unresolved.sort();
    unresolved.dedup();
    MacroExpansion { text, unresolved }
}

fn expand_macros_once(input: &str, table: &BTreeMap<&'static str, &'static str>) -> (String, bool, Vec<String>) {
    let bytes = input.as_bytes();
    let mut out = String::with_capacity(input.len());
    let mut unresolved = Vec::new();
    let mut hit_any = false;
    let mut i = 0usize;

    while i < bytes.len() {
        if bytes[i] == b'%' && i + 1 < bytes.len() {
            if bytes[i + 1] == b'{' {
                if let Some(close) = input[i + 2..].find('}') {
                    let inner = &input[i + 2..i + 2 + close];
                    let (name, optional) = if let Some(rest) = inner.strip_prefix('?') {
                        (rest, true)
                    } else {
                        (inner, false)
                    };
                    match table.get(name) {
                        Some(value) => {
                            out.push_str(value);
                            hit_any = true;
                        }
                        None if optional => {
                            hit_any = true;
                        }
                        None => {
                            out.push_str(&input[i..i + 2 + close + 1]);
                            unresolved.push(name.to_string());
                        }
                    }
                    i += 2 + close + 1;
                    continue;
                }
            } else if bytes[i + 1].is_ascii_alphabetic() || bytes[i + 1] == b'_' {
                let rest = &input[i + 1..];
                let name_len = rest
                    .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                    .unwrap_or(rest.len());
                let name = &rest[..name_len];
                match table.get(name) {
                    Some(value) => {
                        out.push_str(value);
                        hit_any = true;
                    }
                    None => {
                        out.push('%');
                        out.push_str(name);
                        unresolved.push(name.to_string());
                    }
                }
                i += 1 + name_len;
                continue;
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }

    (out, hit_any, unresolved)
}

/// Splits a `BuildRequires` value line into its whitespace/comma
/// separated tokens and parses each as a `BuildRequirement`.
/// Tokens that are themselves virtual-provide syntax are preserved
/// raw — canonicalization is the job of `NameCanonicalizer`.
pub fn parse_build_requires_line(line: &str, depth_cap: usize) -> Vec<BuildRequirement> {
    let normalized = line.replace(',', " ");
    let tokens: Vec<&str> = normalized.split_whitespace().collect();
    let mut out = Vec::new();
    let mut i = 0usize;
    while i < tokens.len() {
        let expanded = expand_macros(tokens[i], depth_cap).text;
        if i + 2 < tokens.len() && Operator::parse_static(tokens[i + 1]).is_some() {
            let op = Operator::parse_static(tokens[i + 1]).unwrap();
            let version = expand_macros(tokens[i + 2], depth_cap).text;
            out.push(BuildRequirement::versioned(expanded, op, version));
            i += 3;
        } else {
            out.push(BuildRequirement::bare(expanded));
            i += 1;
        }
    }
    out
}

// local alias so this module doesn't need a direct `model::Operator` import cycle concern
use crate::model::Operator;
impl Operator {
    fn parse_static(token: &str) -> Option<Operator> {
        Operator::parse(token)
    }
}

const HEADER_FIELDS: &[&str] = &["Name", "Version", "Release", "Epoch", "BuildRequires"];

/// Parses a UTF-8 spec-file payload into a `PackageInfo`. Fails with
/// `CoreError::SpecParse` when `Name` or `Version` is absent.
pub fn analyze_spec_text(source_label: &str, payload: &str) -> Result<(PackageInfo, Vec<String>), CoreError> {
    let mut name: Option<String> = None;
    let mut version: Option<String> = None;
    let mut release = "1".to_string();
    let mut epoch: Option<String> = None;
    let mut sources: Vec<(u32, String)> = Vec::new();
    let mut build_requires = Vec::new();
    let mut warnings = Vec::new();

    // Header lines may continue only on the same line; multiple
    // BuildRequires lines concatenate semantically, so we never merge
    // across newlines — each line is handled independently.
    for raw_line in payload.lines() {
        let line = raw_line.trim_end();
        let trimmed = line.trim_start();
        if trimmed.starts_with('#') || trimmed.is_empty() {
            continue;
        }
        let Some(colon) = trimmed.find(':') else {
            continue;
        };
        let (field_raw, value_raw) = trimmed.split_at(colon);
        let field = field_raw.trim();
        let value = value_raw[1..].trim();

        if field.eq_ignore_ascii_case("Name") {
            let expansion = expand_macros(value, crate::config::MACRO_EXPANSION_DEPTH);
            warn_unresolved(&mut warnings, source_label, &expansion);
            name = Some(expansion.text);
        } else if field.eq_ignore_ascii_case("Version") {
            let expansion = expand_macros(value, crate::config::MACRO_EXPANSION_DEPTH);
            warn_unresolved(&mut warnings, source_label, &expansion);
            version = Some(expansion.text);
        } else if field.eq_ignore_ascii_case("Release") {
            let expansion = expand_macros(value, crate::config::MACRO_EXPANSION_DEPTH);
            warn_unresolved(&mut warnings, source_label, &expansion);
            release = expansion.text;
        } else if field.eq_ignore_ascii_case("Epoch") {
            let expansion = expand_macros(value, crate::config::MACRO_EXPANSION_DEPTH);
            epoch = Some(expansion.text);
        } else if field.eq_ignore_ascii_case("BuildRequires") {
            let reqs = parse_build_requires_line(value, crate::config::MACRO_EXPANSION_DEPTH);
            build_requires.extend(reqs);
        } else if let Some(index) = parse_source_field_index(field) {
            let expansion = expand_macros(value, crate::config::MACRO_EXPANSION_DEPTH);
            warn_unresolved(&mut warnings, source_label, &expansion);
            sources.push((index, expansion.text));
        } else if !HEADER_FIELDS.iter().any(|h| field.eq_ignore_ascii_case(h)) {
            // Unrecognized header: not an error, just not part of our model.
            continue;
        }
    }

    let name = name.ok_or_else(|| CoreError::SpecParse {
        source: source_label.to_string(),
        reason: "missing Name header".to_string(),
    })?;
    let version = version.ok_or_else(|| CoreError::SpecParse {
        source: source_label.to_string(),
        reason: "missing Version header".to_string(),
    })?;
    if version.trim().is_empty() {
        return Err(CoreError::SpecParse {
            source: source_label.to_string(),
            reason: "Version header resolved to an empty string".to_string(),
        });
    }

    sources.sort_by_key(|(index, _)| *index);
    let source_urls = sources.into_iter().map(|(_, url)| url).collect();

    Ok((
        PackageInfo {
            name,
            version,
            release,
            epoch,
            build_requires,
            source_urls,
        },
        warnings,
    ))
}

/// `Source`, `Source0`..`SourceN`. Bare `Source` is index 0.
fn parse_source_field_index(field: &str) -> Option<u32> {
    let lower = field.to_ascii_lowercase();
    let suffix = lower.strip_prefix("source")?;
    if suffix.is_empty() {
        return Some(0);
    }
    suffix.parse::<u32>().ok()
}

fn warn_unresolved(warnings: &mut Vec<String>, source_label: &str, expansion: &MacroExpansion) {
    for name in &expansion.unresolved {
        warnings.push(format!("{source_label}: unresolved macro %{{{name}}}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_known_macro_braced_form() {
        let result = expand_macros("%{python3_pkgversion}-devel", 8);
        assert_eq!(result.text, "3-devel");
        assert!(result.unresolved.is_empty());
    }

    #[test]
    fn expands_known_macro_bare_form() {
        let result = expand_macros("%_bindir/foo", 8);
        assert_eq!(result.text, "/usr/bin/foo");
    }

    #[test]
    fn unknown_optional_macro_expands_to_empty() {
        let result = expand_macros("%{?totally_unknown_thing}", 8);
        assert_eq!(result.text, "");
        assert!(result.unresolved.is_empty());
    }

    #[test]
    fn unknown_required_macro_preserved_and_flagged() {
        let result = expand_macros("%{totally_unknown_thing}", 8);
        assert_eq!(result.text, "%{totally_unknown_thing}");
        assert_eq!(result.unresolved, vec!["totally_unknown_thing".to_string()]);
    }

    #[test]
    fn nested_macro_expansion_terminates_within_depth_cap() {
        // python3_sitelib doesn't itself reference another macro in our
        // table, but the expansion loop must still terminate promptly
        // for macros that do happen to nest.
        let result = expand_macros("%{python3_sitelib}", 8);
        assert!(!result.text.contains('%'));
    }

    #[test]
    fn parses_minimal_spec() {
        let payload = "\
Name: foo
Version: 1.2.3
Release: 4%{?dist}
BuildRequires: gcc, python3-devel >= 3.9
Source0: https://example.org/foo-1.2.3.tar.gz
";
        let (info, warnings) = analyze_spec_text("foo.spec", payload).unwrap();
        assert_eq!(info.name, "foo");
        assert_eq!(info.version, "1.2.3");
        assert_eq!(info.build_requires.len(), 2);
        assert_eq!(info.source_urls, vec!["https://example.org/foo-1.2.3.tar.gz".to_string()]);
        // %{?dist} is optional and unknown to our table: expands empty.
        assert_eq!(info.release, "4");
        assert!(warnings.is_empty());
    }

    #[test]
    fn missing_name_is_fatal() {
        let payload = "Version: 1.0\n";
        let err = analyze_spec_text("bad.spec", payload).unwrap_err();
        assert!(matches!(err, CoreError::SpecParse { .. }));
    }

    #[test]
    fn missing_version_is_fatal() {
        let payload = "Name: foo\n";
        let err = analyze_spec_text("bad.spec", payload).unwrap_err();
        assert!(matches!(err, CoreError::SpecParse { .. }));
    }

    #[test]
    fn multiple_build_requires_lines_concatenate() {
        let payload = "\
Name: foo
Version: 1.0
BuildRequires: gcc
BuildRequires: make
";
        let (info, _) = analyze_spec_text("foo.spec", payload).unwrap();
        assert_eq!(info.build_requires.len(), 2);
    }
}
