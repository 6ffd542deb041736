//! Small host-level lookups shared across status surfaces.

// Layer 2: Third-party crate imports
use chrono::{TimeZone, Utc};
use nix::unistd::{gethostname, getuid, User};

/// The local hostname, or `"localhost"` if the kernel won't say.
pub fn hostname() -> String {
    gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Login name of the invoking user, if resolvable.
pub fn username() -> Option<String> {
    User::from_uid(getuid()).ok().flatten().map(|u| u.name)
}

/// `t` as UTC ISO-8601, `2009-07-14T02:30:59Z`.
pub fn isotime(t: i64) -> String {
    match Utc.timestamp_opt(t, 0).single() {
        Some(dt) => dt.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        None => format!("@{t}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isotime_epoch() {
        assert_eq!(isotime(0), "1970-01-01T00:00:00Z");
    }

    #[test]
    fn test_isotime_known_instant() {
        assert_eq!(isotime(1_247_538_659), "2009-07-14T02:30:59Z");
    }

    #[test]
    fn test_hostname_nonempty() {
        assert!(!hostname().is_empty());
    }
}
