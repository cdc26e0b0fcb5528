//! Tag version parsing and ordering.
//!
//! Registry tags are free-form strings. A [`Version`] splits a tag into a
//! numeric core (`8.16.0`) and an optional suffix (`management-alpine`,
//! `beta1`, `12-18T13-15-44Z`) and defines a total order over them:
//!
//! - numeric segments compare component-wise, missing segments count as 0
//! - a bare core ranks above the same core carrying any suffix
//! - two suffixes compare in natural order (digit runs numerically,
//!   everything else case-insensitively)
//!
//! A leading `v` is ignored and `+build` metadata does not take part in
//! ordering. Tags with no leading numeric segment (`latest`, `alpine`)
//! still order, but report [`Version::is_semantic`] as false.

use std::cmp::Ordering;
use std::fmt;

/// Suffix tokens that mark a pre-release build.
const PRERELEASE_TOKENS: &[&str] = &[
    "alpha", "beta", "rc", "pre", "preview", "snapshot", "dev", "nightly",
];

/// A parsed tag version.
#[derive(Debug, Clone)]
pub struct Version {
    raw: String,
    segments: Vec<u64>,
    suffix: Option<String>,
}

impl Version {
    /// Parse a tag. Never fails; unparseable tags become non-semantic.
    pub fn parse(tag: &str) -> Self {
        let raw = tag.trim().to_string();
        let body = raw.split('+').next().unwrap_or("");
        let body = body
            .strip_prefix('v')
            .or_else(|| body.strip_prefix('V'))
            .filter(|rest| rest.starts_with(|c: char| c.is_ascii_digit()))
            .unwrap_or(body);

        let bytes = body.as_bytes();
        let mut segments = Vec::new();
        let mut pos = 0;
        loop {
            let start = pos;
            while pos < bytes.len() && bytes[pos].is_ascii_digit() {
                pos += 1;
            }
            if pos == start {
                break;
            }
            segments.push(body[start..pos].parse::<u64>().unwrap_or(u64::MAX));

            let continues = pos + 1 < bytes.len()
                && bytes[pos] == b'.'
                && bytes[pos + 1].is_ascii_digit();
            if !continues {
                break;
            }
            pos += 1;
        }

        let rest = if segments.is_empty() { body } else { &body[pos..] };
        let rest = rest.trim_start_matches(['-', '.', '_']);
        let suffix = (!rest.is_empty()).then(|| rest.to_string());

        Self {
            raw,
            segments,
            suffix,
        }
    }

    /// The original tag string.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Numeric core segments.
    pub fn segments(&self) -> &[u64] {
        &self.segments
    }

    /// Suffix after the numeric core, without its leading separator.
    pub fn suffix(&self) -> Option<&str> {
        self.suffix.as_deref()
    }

    /// Whether the tag starts with a numeric version core.
    pub fn is_semantic(&self) -> bool {
        !self.segments.is_empty()
    }

    /// First numeric segment.
    pub fn major(&self) -> Option<u64> {
        self.segments.first().copied()
    }

    /// Whether the suffix carries a pre-release marker (`beta`, `rc1`, ...).
    pub fn is_prerelease(&self) -> bool {
        let Some(suffix) = &self.suffix else {
            return false;
        };
        natural_runs(suffix).into_iter().any(|run| match run {
            Run::Text(text) => PRERELEASE_TOKENS.contains(&text.as_str()),
            Run::Number(_) => false,
        })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl From<&str> for Version {
    fn from(tag: &str) -> Self {
        Self::parse(tag)
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let width = self.segments.len().max(other.segments.len());
        for i in 0..width {
            let a = self.segments.get(i).copied().unwrap_or(0);
            let b = other.segments.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => {}
                unequal => return unequal,
            }
        }

        match (&self.suffix, &other.suffix) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(a), Some(b)) => natural_cmp(a, b),
        }
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

#[derive(Debug, PartialEq, Eq)]
enum Run {
    Number(String),
    Text(String),
}

/// Split into digit runs and lowercase alphabetic runs; separators drop out.
fn natural_runs(s: &str) -> Vec<Run> {
    let mut runs = Vec::new();
    let mut current = String::new();
    let mut in_digits = false;

    let flush = |current: &mut String, in_digits: bool, runs: &mut Vec<Run>| {
        if current.is_empty() {
            return;
        }
        let taken = std::mem::take(current);
        runs.push(if in_digits {
            Run::Number(taken)
        } else {
            Run::Text(taken)
        });
    };

    for c in s.chars() {
        if c.is_ascii_digit() {
            if !in_digits {
                flush(&mut current, in_digits, &mut runs);
                in_digits = true;
            }
            current.push(c);
        } else if c.is_alphanumeric() {
            if in_digits {
                flush(&mut current, in_digits, &mut runs);
                in_digits = false;
            }
            current.extend(c.to_lowercase());
        } else {
            flush(&mut current, in_digits, &mut runs);
        }
    }
    flush(&mut current, in_digits, &mut runs);
    runs
}

fn natural_cmp(a: &str, b: &str) -> Ordering {
    let left = natural_runs(a);
    let right = natural_runs(b);

    for (x, y) in left.iter().zip(right.iter()) {
        let ord = match (x, y) {
            (Run::Number(x), Run::Number(y)) => {
                let x = x.trim_start_matches('0');
                let y = y.trim_start_matches('0');
                x.len().cmp(&y.len()).then_with(|| x.cmp(y))
            }
            (Run::Number(_), Run::Text(_)) => Ordering::Less,
            (Run::Text(_), Run::Number(_)) => Ordering::Greater,
            (Run::Text(x), Run::Text(y)) => x.cmp(y),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    left.len().cmp(&right.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        Version::parse(s)
    }

    #[test]
    fn test_parse_plain() {
        let version = v("8.16.0");
        assert_eq!(version.segments(), &[8, 16, 0]);
        assert_eq!(version.suffix(), None);
        assert!(version.is_semantic());
        assert_eq!(version.major(), Some(8));
    }

    #[test]
    fn test_parse_prefixed_and_suffixed() {
        let version = v("v2.4.3-slim");
        assert_eq!(version.segments(), &[2, 4, 3]);
        assert_eq!(version.suffix(), Some("slim"));
        assert_eq!(version.as_str(), "v2.4.3-slim");
    }

    #[test]
    fn test_parse_non_semantic() {
        let version = v("latest");
        assert!(!version.is_semantic());
        assert_eq!(version.suffix(), Some("latest"));
        assert_eq!(version.major(), None);
    }

    #[test]
    fn test_parse_timestamp_tag() {
        let version = v("2024-12-18T13-15-44Z");
        assert_eq!(version.segments(), &[2024]);
        assert_eq!(version.suffix(), Some("12-18T13-15-44Z"));
    }

    #[test]
    fn test_trailing_dot_is_suffix() {
        let version = v("1.2.");
        assert_eq!(version.segments(), &[1, 2]);
        assert_eq!(version.suffix(), None);
    }

    #[test]
    fn test_build_metadata_ignored() {
        assert_eq!(v("1.2.3+build.7"), v("1.2.3"));
    }

    #[test]
    fn test_numeric_ordering() {
        assert!(v("1.2.0") < v("1.2.1"));
        assert!(v("1.2.1") < v("1.10.0"));
        assert!(v("1.9") < v("1.10"));
    }

    #[test]
    fn test_zero_padding() {
        assert_eq!(v("1.2"), v("1.2.0"));
        assert!(v("1.2") < v("1.2.0.1"));
    }

    #[test]
    fn test_prerelease_below_release() {
        assert!(v("2.0.0-beta") < v("2.0.0"));
        assert!(!(v("2.0.0") < v("2.0.0-beta")));
        assert!(v("2.0.0-beta") > v("1.9.9"));
    }

    #[test]
    fn test_suffix_natural_order() {
        assert!(v("2.0.0-rc2") < v("2.0.0-rc10"));
        assert!(v("2.0.0-alpha") < v("2.0.0-beta"));
        assert!(
            v("2024-11-05T10-00-00Z") < v("2024-12-18T13-15-44Z"),
            "timestamp suffixes order by their digit runs"
        );
    }

    #[test]
    fn test_prefix_v_ignored_in_ordering() {
        assert_eq!(v("v2.4.3"), v("2.4.3"));
        assert!(v("v2.4.3") < v("v2.5.0"));
    }

    #[test]
    fn test_prerelease_detection() {
        assert!(v("4.0.0-rc.1").is_prerelease());
        assert!(v("3.13.0-beta1-management-alpine").is_prerelease());
        assert!(!v("3.13.7-management-alpine").is_prerelease());
        assert!(!v("8.16.0").is_prerelease());
    }

    #[test]
    fn test_total_order_trichotomy() {
        let tags = [
            "1.0", "1.0.0", "1.0.1", "1.0.0-beta", "1.0.0-rc1", "v1.0.0", "latest",
            "alpine", "2.0.0-Beta", "2.0.0-beta", "10.1", "1.10", "0.0.0",
        ];
        for a in &tags {
            for b in &tags {
                let (a, b) = (v(a), v(b));
                let holds = [a < b, a == b, b < a];
                assert_eq!(
                    holds.iter().filter(|h| **h).count(),
                    1,
                    "{} vs {}",
                    a,
                    b
                );
            }
        }
    }

    #[test]
    fn test_sorting_is_deterministic() {
        let mut tags: Vec<Version> = ["1.10.0", "1.2.1", "1.2.0", "1.2.1-rc1"]
            .iter()
            .map(|t| v(t))
            .collect();
        tags.sort();
        let sorted: Vec<&str> = tags.iter().map(|t| t.as_str()).collect();
        assert_eq!(sorted, vec!["1.2.0", "1.2.1-rc1", "1.2.1", "1.10.0"]);
    }
}
