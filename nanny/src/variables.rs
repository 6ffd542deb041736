//! Well-known variable lookup.
//!
//! The UDP query protocol and the HTTP `/environment` page both read the
//! same namespace: a handful of supervisor-known keys, falling back to the
//! inherited process environment. Integer-valued keys compare numerically in
//! queries; everything else compares lexicographically.

// Layer 1: Standard library imports
use std::cmp::Ordering;

/// Keys always present on the `/environment` page.
pub const DEFAULT_KEYS: &[&str] = &[
    "GID", "HOSTNAME", "HTTP_PORT", "ISOTIME", "NANNY_PID", "PID", "TIME", "UID", "USERNAME",
];

/// A resolvable variable namespace.
///
/// Implemented by the supervisor's global state; tests substitute a
/// map-backed source.
pub trait VariableSource {
    /// Value of an integer-valued well-known key, if it currently has one.
    fn integer(&self, key: &str) -> Option<i64>;

    /// String value of any resolvable key: integer keys formatted, known
    /// string keys, then the inherited environment. Empty environment
    /// entries count as unset.
    fn lookup(&self, key: &str) -> Option<String>;
}

/// Compares the current value of `key` against a literal from a query.
///
/// Returns the ordering of the *current* value relative to `given`
/// (`Greater` means the current value exceeds the query literal), or `None`
/// when the key doesn't resolve. Integer keys parse the literal as a decimal
/// prefix, like `strtoll`; a non-numeric literal counts as 0.
pub fn compare(src: &dyn VariableSource, key: &str, given: &str) -> Option<Ordering> {
    if let Some(current) = src.integer(key) {
        let reference = parse_decimal_prefix(given);
        return Some(current.cmp(&reference));
    }
    let current = src.lookup(key)?;
    Some(current.as_str().cmp(given))
}

fn parse_decimal_prefix(s: &str) -> i64 {
    let s = s.trim_start();
    let (sign, digits) = match s.strip_prefix('-') {
        Some(rest) => (-1i64, rest),
        None => (1i64, s.strip_prefix('+').unwrap_or(s)),
    };
    let mut value: i64 = 0;
    for c in digits.chars() {
        let Some(d) = c.to_digit(10) else { break };
        value = value.saturating_mul(10).saturating_add(d as i64);
    }
    sign * value
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MapSource {
        ints: HashMap<&'static str, i64>,
        strs: HashMap<&'static str, &'static str>,
    }

    impl VariableSource for MapSource {
        fn integer(&self, key: &str) -> Option<i64> {
            self.ints.get(key).copied()
        }

        fn lookup(&self, key: &str) -> Option<String> {
            if let Some(v) = self.ints.get(key) {
                return Some(v.to_string());
            }
            self.strs.get(key).map(|v| (*v).to_string())
        }
    }

    fn source() -> MapSource {
        MapSource {
            ints: HashMap::from([("PID", 4242), ("HTTP_PORT", 51717)]),
            strs: HashMap::from([("HOSTNAME", "box01"), ("INSTANCE", "gd#1")]),
        }
    }

    #[test]
    fn test_integer_compare_is_numeric() {
        let src = source();
        assert_eq!(compare(&src, "PID", "0"), Some(Ordering::Greater));
        assert_eq!(compare(&src, "PID", "4242"), Some(Ordering::Equal));
        // Lexicographically "9" > "4242"; numerically it is less.
        assert_eq!(compare(&src, "PID", "9"), Some(Ordering::Greater));
        assert_eq!(compare(&src, "PID", "99999"), Some(Ordering::Less));
    }

    #[test]
    fn test_string_compare_is_lexicographic() {
        let src = source();
        assert_eq!(compare(&src, "HOSTNAME", "box01"), Some(Ordering::Equal));
        assert_eq!(compare(&src, "HOSTNAME", "box00"), Some(Ordering::Greater));
        assert_eq!(compare(&src, "HOSTNAME", "box02"), Some(Ordering::Less));
    }

    #[test]
    fn test_unknown_key_yields_none() {
        let src = source();
        assert_eq!(compare(&src, "NOPE", "1"), None);
    }

    #[test]
    fn test_decimal_prefix_parsing() {
        assert_eq!(parse_decimal_prefix("123abc"), 123);
        assert_eq!(parse_decimal_prefix("-7"), -7);
        assert_eq!(parse_decimal_prefix("junk"), 0);
    }
}
