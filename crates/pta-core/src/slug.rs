// Copyright (C) 2025 pwnthemall contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! URL-safe slug generation.

use std::sync::LazyLock;

use regex::Regex;

/// Maximum slug length.
pub const MAX_SLUG_LEN: usize = 100;

static DISALLOWED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9\s-]").expect("static regex"));
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("static regex"));
static HYPHENS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"-{2,}").expect("static regex"));
static VALID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]+(-[a-z0-9]+)*$").expect("static regex"));

/// Turn arbitrary text into a slug.
///
/// Deterministic and idempotent; the output only contains `[a-z0-9-]`, is at
/// most [`MAX_SLUG_LEN`] bytes long and never starts or ends with a hyphen.
pub fn generate_slug(input: &str) -> String {
    let mut slug = input.to_lowercase();

    for pattern in ["../", "./", "\\"] {
        slug = slug.replace(pattern, "");
    }

    let slug = DISALLOWED.replace_all(&slug, "");
    let slug = WHITESPACE.replace_all(slug.trim(), "-");
    let slug = HYPHENS.replace_all(&slug, "-");
    let mut slug = slug.trim_matches('-').to_string();

    if slug.len() > MAX_SLUG_LEN {
        // Only ASCII remains at this point, byte truncation is safe
        slug.truncate(MAX_SLUG_LEN);
        slug = slug.trim_end_matches('-').to_string();
    }

    slug
}

/// Check that a string is already a well-formed slug.
pub fn is_valid_slug(slug: &str) -> bool {
    if slug.is_empty() || slug.len() > MAX_SLUG_LEN {
        return false;
    }
    if slug.contains("..") || slug.contains("./") || slug.contains('\\') {
        return false;
    }
    VALID.is_match(slug)
}

/// Generate a slug that `exists` does not report as taken.
///
/// Tries the bare slug, then `-2` up to `-1000`. Returns `None` when every
/// candidate is taken or the input has no sluggable characters.
pub fn unique_slug(input: &str, exists: impl Fn(&str) -> bool) -> Option<String> {
    let base = generate_slug(input);
    if base.is_empty() {
        return None;
    }
    if !exists(&base) {
        return Some(base);
    }

    (2..=1000).find_map(|n| {
        let suffix = format!("-{}", n);
        let mut stem = base.clone();
        if stem.len() + suffix.len() > MAX_SLUG_LEN {
            stem.truncate(MAX_SLUG_LEN - suffix.len());
            stem = stem.trim_end_matches('-').to_string();
        }
        let candidate = format!("{}{}", stem, suffix);
        (!exists(&candidate)).then_some(candidate)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic() {
        assert_eq!(generate_slug("Hello World"), "hello-world");
        assert_eq!(generate_slug("  Web   Exploit 101 "), "web-exploit-101");
        assert_eq!(generate_slug("SQL_Injection!!"), "sqlinjection");
        assert_eq!(generate_slug("a -- b"), "a-b");
        assert_eq!(generate_slug("---"), "");
    }

    #[test]
    fn test_strips_traversal() {
        assert_eq!(generate_slug("../../etc/passwd"), "etcpasswd");
        assert_eq!(generate_slug("..\\windows"), "windows");
    }

    #[test]
    fn test_truncates_without_trailing_hyphen() {
        let input = format!("{} tail", "a".repeat(99));
        let slug = generate_slug(&input);
        assert!(slug.len() <= MAX_SLUG_LEN);
        assert!(!slug.ends_with('-'));
    }

    #[test]
    fn test_properties_over_samples() {
        let mut samples: Vec<String> = [
            "Hello World",
            "  --Leading and trailing--  ",
            "Ünïcödé chäräctérs",
            "tabs\tand\nnewlines",
            "a - - - b",
            "MiXeD CaSe 42",
            "../..//\\\\",
            "emoji 🚩 flag",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        samples.push("x".repeat(250));
        samples.push(format!("{} {}", "ab".repeat(49), "cd".repeat(10)));

        for sample in samples.iter() {
            let slug = generate_slug(sample);
            assert_eq!(generate_slug(&slug), slug, "idempotent for {:?}", sample);
            assert!(slug.len() <= MAX_SLUG_LEN);
            assert!(!slug.starts_with('-') && !slug.ends_with('-'));
            assert!(!slug.contains("--"));
            assert!(
                slug.chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            );
            if !slug.is_empty() {
                assert!(is_valid_slug(&slug));
            }
        }
    }

    #[test]
    fn test_is_valid_slug() {
        assert!(is_valid_slug("web-101"));
        assert!(!is_valid_slug("Web-101"));
        assert!(!is_valid_slug("-web"));
        assert!(!is_valid_slug("web--101"));
        assert!(!is_valid_slug(""));
        assert!(!is_valid_slug("a/b"));
    }

    #[test]
    fn test_unique_slug() {
        let taken = ["web", "web-2"];
        let slug = unique_slug("Web", |s| taken.contains(&s)).unwrap();
        assert_eq!(slug, "web-3");
        assert_eq!(unique_slug("Fresh", |_| false).unwrap(), "fresh");
        assert!(unique_slug("!!!", |_| false).is_none());
        assert!(unique_slug("web", |_| true).is_none());
    }
}
