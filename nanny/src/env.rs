//! Child environment templates.
//!
//! A child carries its environment as a plain `KEY=VALUE` vector. The
//! template itself is never mutated for a spawn: stop commands and periodic
//! tasks get a fresh copy with their extra variables appended, so nothing
//! leaks into later spawns sharing the template.

// Layer 1: Standard library imports
use std::ffi::CString;

/// The inherited process environment as a template vector.
pub fn inherited() -> Vec<String> {
    std::env::vars().map(|(k, v)| format!("{k}={v}")).collect()
}

/// A fresh copy of `template` with `extra` variables appended.
///
/// An appended key shadows an inherited one for `/bin/sh` purposes: later
/// entries win in every libc's `getenv`.
pub fn with_extra(template: &[String], extra: &[(&str, String)]) -> Vec<String> {
    let mut env = Vec::with_capacity(template.len() + extra.len());
    env.extend_from_slice(template);
    env.extend(extra.iter().map(|(k, v)| format!("{k}={v}")));
    env
}

/// Converts an environment vector for `execve`. Entries with interior NUL
/// bytes cannot cross the exec boundary and are dropped.
pub fn to_cstrings(env: &[String]) -> Vec<CString> {
    env.iter()
        .filter_map(|entry| CString::new(entry.as_str()).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_extra_appends_without_touching_template() {
        let template = vec!["PATH=/bin".to_string(), "HOME=/root".to_string()];
        let env = with_extra(&template, &[("PID", "4242".to_string())]);

        assert_eq!(env, vec!["PATH=/bin", "HOME=/root", "PID=4242"]);
        assert_eq!(template.len(), 2);
    }

    #[test]
    fn test_with_extra_two_spawns_do_not_accumulate() {
        let template = vec!["PATH=/bin".to_string()];
        let first = with_extra(&template, &[("PID", "1".to_string())]);
        let second = with_extra(&template, &[("PID", "2".to_string())]);

        assert_eq!(first, vec!["PATH=/bin", "PID=1"]);
        assert_eq!(second, vec!["PATH=/bin", "PID=2"]);
    }

    #[test]
    fn test_to_cstrings_drops_nul_entries() {
        let env = vec!["GOOD=1".to_string(), "BAD=\0oops".to_string()];
        let converted = to_cstrings(&env);
        assert_eq!(converted.len(), 1);
    }
}
