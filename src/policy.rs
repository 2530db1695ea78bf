//! Domain Policy (C1): canonicalization, exact/suffix matching, and hot
//! reload of the blocklist. The request path only ever does a lock-free
//! `ArcSwap::load`; `reload()` builds a whole new snapshot off to the side
//! and installs it with a single atomic store, so readers never observe a
//! half-built rule set.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use std::sync::OnceLock;

use arc_swap::ArcSwap;
use regex::Regex;
use tracing::warn;

use crate::error::ProxyError;

const MAX_HOSTNAME_LEN: usize = 253;

fn hostname_grammar() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[a-z0-9]([a-z0-9.-]*[a-z0-9])?$").expect("static pattern compiles")
    })
}

/// Canonicalizes an input hostname. Returns an empty string for any
/// entry that fails a check; callers drop empty results with a warning.
pub fn canonicalize(input: &str) -> String {
    let trimmed = input.trim().to_lowercase();
    if trimmed.is_empty() {
        return String::new();
    }
    if !trimmed.chars().all(|c| c.is_ascii() && !c.is_control()) {
        return String::new();
    }
    if trimmed.len() > MAX_HOSTNAME_LEN {
        return String::new();
    }

    let grammar_check = trimmed.strip_prefix("*.").unwrap_or(&trimmed);
    if grammar_check.is_empty() {
        return String::new();
    }
    if hostname_grammar().is_match(grammar_check) || is_dotted_quad(grammar_check) {
        trimmed
    } else {
        String::new()
    }
}

fn is_dotted_quad(s: &str) -> bool {
    let parts: Vec<&str> = s.split('.').collect();
    parts.len() == 4
        && parts.iter().all(|p| {
            !p.is_empty()
                && p.chars().all(|c| c.is_ascii_digit())
                && p.parse::<u16>().map(|v| v <= 255).unwrap_or(false)
        })
}

#[derive(Default)]
struct Snapshot {
    exact: HashSet<String>,
    suffixes: Vec<String>,
}

/// Process-wide blocklist. Cheap to clone (an `Arc` underneath); the request
/// path calls `is_blocked` which never blocks on I/O or a lock.
#[derive(Clone)]
pub struct Policy {
    path: PathBuf,
    snapshot: std::sync::Arc<ArcSwap<Snapshot>>,
}

impl Policy {
    /// Loads the blocklist at `path`, or starts empty (with a warning) if it
    /// does not exist — a missing file is not a startup error.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let snapshot = build_snapshot(&path);
        Self {
            path,
            snapshot: std::sync::Arc::new(ArcSwap::from_pointee(snapshot)),
        }
    }

    /// Rebuilds the rule sets from disk and atomically installs them.
    /// Readers observe either the prior complete state or the new one.
    pub fn reload(&self) {
        let snapshot = build_snapshot(&self.path);
        self.snapshot.store(std::sync::Arc::new(snapshot));
    }

    pub fn is_blocked(&self, host: &str) -> bool {
        if host.is_empty() {
            return false;
        }
        let canonical = canonicalize(strip_port(host));
        if canonical.is_empty() {
            return false;
        }
        let snap = self.snapshot.load();
        if snap.exact.contains(&canonical) {
            return true;
        }
        snap.suffixes
            .iter()
            .any(|suffix| &canonical == suffix || canonical.ends_with(&format!(".{suffix}")))
    }

    pub fn exact_count(&self) -> usize {
        self.snapshot.load().exact.len()
    }

    pub fn suffix_count(&self) -> usize {
        self.snapshot.load().suffixes.len()
    }
}

fn strip_port(host: &str) -> &str {
    // Queried hosts may carry a `:port` suffix (e.g. from a CONNECT target);
    // only the first colon matters here since canonicalize() lowercases and
    // never sees a bracketed IPv6 literal in this proxy's supported grammar.
    match host.find(':') {
        Some(idx) => &host[..idx],
        None => host,
    }
}

fn build_snapshot(path: &Path) -> Snapshot {
    let mut snapshot = Snapshot::default();

    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => {
            warn!(path = %path.display(), "blocklist file not found, starting with no blocked domains");
            return snapshot;
        }
    };

    for raw_line in contents.lines() {
        let trimmed = raw_line.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let canonical = canonicalize(raw_line);
        if canonical.is_empty() {
            let err = ProxyError::PolicyCanonicalizationReject(raw_line.to_string());
            warn!(entry = %raw_line, "{err}");
            continue;
        }

        if let Some(suffix) = canonical.strip_prefix("*.") {
            snapshot.suffixes.push(suffix.to_string());
        } else {
            snapshot.exact.insert(canonical);
        }
    }

    snapshot
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_blocklist(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn canonicalize_rejects_non_ascii_and_overlong() {
        assert_eq!(canonicalize("exámple.com"), "");
        let long = format!("{}.com", "a".repeat(260));
        assert_eq!(canonicalize(&long), "");
    }

    #[test]
    fn canonicalize_accepts_dotted_quad() {
        assert_eq!(canonicalize("192.168.1.1"), "192.168.1.1");
    }

    #[test]
    fn canonicalize_trims_and_lowercases() {
        assert_eq!(canonicalize("  Example.COM  "), "example.com");
    }

    #[test]
    fn exact_and_suffix_matching() {
        let file = write_blocklist("# comment\n\nexample.test\n*.ads.test\n");
        let policy = Policy::load(file.path());
        assert!(policy.is_blocked("example.test"));
        assert!(policy.is_blocked("EXAMPLE.test"));
        assert!(policy.is_blocked("  example.test  ".trim()));
        assert!(policy.is_blocked("tracker.ads.test"));
        assert!(policy.is_blocked("ads.test"));
        assert!(!policy.is_blocked("other.test"));
    }

    #[test]
    fn strips_port_suffix_before_matching() {
        let file = write_blocklist("secure.test\n");
        let policy = Policy::load(file.path());
        assert!(policy.is_blocked("secure.test:443"));
    }

    #[test]
    fn missing_file_loads_empty() {
        let policy = Policy::load("/nonexistent/path/to/blocklist.txt");
        assert!(!policy.is_blocked("anything.test"));
        assert_eq!(policy.exact_count(), 0);
    }

    #[test]
    fn reload_picks_up_new_rules() {
        let file = write_blocklist("first.test\n");
        let policy = Policy::load(file.path());
        assert!(policy.is_blocked("first.test"));
        assert!(!policy.is_blocked("second.test"));

        std::fs::write(file.path(), "second.test\n").unwrap();
        policy.reload();

        assert!(!policy.is_blocked("first.test"));
        assert!(policy.is_blocked("second.test"));
    }

    #[test]
    fn invalid_entries_are_dropped_without_poisoning_load() {
        let file = write_blocklist("good.test\nbad domain with spaces\n*.also-good.test\n");
        let policy = Policy::load(file.path());
        assert!(policy.is_blocked("good.test"));
        assert!(policy.is_blocked("x.also-good.test"));
    }
}
