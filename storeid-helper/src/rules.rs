//! Rule engine: first-match-wins URL canonicalization with a per-snapshot
//! memo cache.
//!
//! Grounded on `GatewayApp`'s rule walk in `app/gateway_fast.rs`
//! (`REDIRECT_RULES` iterated in priority order, first `Captures::expand`
//! match wins) and on `Dedup.parse()` in the original `dedup.py`, which
//! walks sections in file order and calls `regexp.subn()` per pattern,
//! caching the outcome only when a pattern actually substitutes.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::Arc;

use regex::{Captures, Regex};

use crate::config::ConfigSnapshot;

/// Outcome of resolving one URL against the current rule set.
pub enum ResolveOutcome {
    Hit(Resolution),
    Miss,
}

/// Everything the protocol loop and the prefetch pool need to know about a
/// match. Carries owned data rather than a `&Section` so the engine's
/// `&mut self` borrow in `resolve` doesn't have to outlive the call.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub section_name: String,
    pub fetch: bool,
    pub canonical: String,
    /// True when this URL was already in the memo cache — the protocol loop
    /// uses this to decide whether to offer the pair to the prefetch queue
    /// (a cached hit was already offered the first time it was seen).
    pub cached: bool,
}

/// Apply `re`'s replacement template to every non-overlapping match in
/// `haystack`, the way Python's `re.subn` does, returning the rewritten
/// string and the number of substitutions performed. The `regex` crate's
/// `replace_all` doesn't expose a match count, so it's tracked out-of-band
/// via the closure.
fn subn(re: &Regex, template: &str, haystack: &str) -> (String, usize) {
    let count = Cell::new(0usize);
    let result = re.replace_all(haystack, |caps: &Captures| {
        count.set(count.get() + 1);
        let mut dst = String::new();
        caps.expand(template, &mut dst);
        dst
    });
    (result.into_owned(), count.get())
}

/// Owns the memo cache for one `ConfigSnapshot` generation. A fresh engine
/// is built whenever the published snapshot pointer changes, which
/// discards the old cache wholesale — matching §3's "scoped to the
/// lifetime of one config snapshot".
pub struct RuleEngine {
    snapshot: Arc<ConfigSnapshot>,
    cache: HashMap<String, (usize, String)>,
}

impl RuleEngine {
    pub fn new(snapshot: Arc<ConfigSnapshot>) -> Self {
        Self { snapshot, cache: HashMap::new() }
    }

    pub fn snapshot(&self) -> &Arc<ConfigSnapshot> {
        &self.snapshot
    }

    /// First-section, first-pattern-wins. Caches hits only: a URL that
    /// matches nothing is recomputed (cheap: no match) every time, the same
    /// as `Dedup.parse()` never stores misses in `self._cache`.
    pub fn resolve(&mut self, url: &str) -> ResolveOutcome {
        if let Some((idx, canonical)) = self.cache.get(url) {
            let section = &self.snapshot.sections[*idx];
            return ResolveOutcome::Hit(Resolution {
                section_name: section.name.clone(),
                fetch: section.fetch,
                canonical: canonical.clone(),
                cached: true,
            });
        }

        for (idx, section) in self.snapshot.sections.iter().enumerate() {
            for (_, re) in &section.patterns {
                let (canonical, count) = subn(re, &section.replacement, url);
                if count > 0 {
                    self.cache.insert(url.to_string(), (idx, canonical.clone()));
                    return ResolveOutcome::Hit(Resolution {
                        section_name: section.name.clone(),
                        fetch: section.fetch,
                        canonical,
                        cached: false,
                    });
                }
            }
        }
        ResolveOutcome::Miss
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Section;
    use regex::RegexBuilder;
    use std::path::PathBuf;
    use std::time::SystemTime;

    fn compile(src: &str) -> Regex {
        RegexBuilder::new(src).case_insensitive(true).build().unwrap()
    }

    fn snapshot_with(sections: Vec<Section>) -> Arc<ConfigSnapshot> {
        Arc::new(ConfigSnapshot {
            internal_domain: "squid.internal".into(),
            http_proxy: None,
            https_proxy: None,
            fetch_workers: 0,
            fetch_delay: std::time::Duration::from_secs(0),
            auto_reload: true,
            protocol_log_path: None,
            log_level: 20,
            log_file: "-".into(),
            syslog_level: None,
            sections,
            primary_path: PathBuf::from("test.conf"),
            primary_mtime: SystemTime::now(),
        })
    }

    #[test]
    fn first_match_wins_and_caches() {
        let pattern = r"^http://[\w.-]+\.dl\.sourceforge\.net/(.*)$";
        let section = Section {
            name: "sourceforge".into(),
            patterns: vec![(pattern.into(), compile(pattern))],
            replacement: "http://dl.sourceforge.net.squid.internal/${1}".into(),
            fetch: true,
            source_path: PathBuf::from("test.conf"),
            source_mtime: SystemTime::now(),
        };
        let mut engine = RuleEngine::new(snapshot_with(vec![section]));

        let url = "http://downloads.dl.sourceforge.net/project/foo/bar.tar.gz";
        match engine.resolve(url) {
            ResolveOutcome::Hit(res) => {
                assert_eq!(res.canonical, "http://dl.sourceforge.net.squid.internal/project/foo/bar.tar.gz");
                assert!(!res.cached);
                assert!(res.fetch);
            }
            ResolveOutcome::Miss => panic!("expected a hit"),
        }

        match engine.resolve(url) {
            ResolveOutcome::Hit(res) => assert!(res.cached),
            ResolveOutcome::Miss => panic!("expected a cached hit"),
        }
    }

    #[test]
    fn no_pattern_matches_is_a_miss() {
        let pattern = r"^http://only\.example\.com/(.*)$";
        let section = Section {
            name: "only".into(),
            patterns: vec![(pattern.into(), compile(pattern))],
            replacement: "http://only.internal/${1}".into(),
            fetch: false,
            source_path: PathBuf::from("test.conf"),
            source_mtime: SystemTime::now(),
        };
        let mut engine = RuleEngine::new(snapshot_with(vec![section]));
        assert!(matches!(engine.resolve("http://unrelated.example.net/x"), ResolveOutcome::Miss));
    }
}
