use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// An immutable set of registered domain suffixes.
///
/// A host matches when it equals a suffix or is a proper subdomain of one,
/// compared case-insensitively and aligned on label boundaries:
/// `www.google.com` matches `google.com`, `notgoogle.com` does not.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DomainSuffixSet {
    suffixes: Vec<String>,
}

impl DomainSuffixSet {
    pub fn new(suffixes: impl IntoIterator<Item = impl AsRef<str>>) -> Self {
        let mut normalized = suffixes
            .into_iter()
            .filter_map(|suffix| normalize_domain(suffix.as_ref()))
            .collect::<Vec<_>>();
        normalized.sort();
        normalized.dedup();
        Self {
            suffixes: normalized,
        }
    }

    pub fn matches(&self, host: &str) -> bool {
        let Some(host) = normalize_domain(host) else {
            return false;
        };
        self.suffixes.iter().any(|suffix| {
            host.len() >= suffix.len()
                && host.ends_with(suffix.as_str())
                && (host.len() == suffix.len()
                    || host.as_bytes()[host.len() - suffix.len() - 1] == b'.')
        })
    }

    pub fn len(&self) -> usize {
        self.suffixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.suffixes.is_empty()
    }

    pub fn suffixes(&self) -> &[String] {
        &self.suffixes
    }
}

fn normalize_domain(input: &str) -> Option<String> {
    let trimmed = input.trim().trim_end_matches('.');
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.to_ascii_lowercase())
}

/// Atomically swappable routing policy over a [`DomainSuffixSet`] snapshot.
///
/// Readers clone the live `Arc` under a short read lock and evaluate against
/// that snapshot without further synchronization; `reload` builds a brand-new
/// set and replaces the pointer under the write lock. A lookup therefore sees
/// either the entirely-old or entirely-new snapshot, never a mix, and reloads
/// never block in-flight evaluations.
#[derive(Debug)]
pub struct SuffixRouter {
    live: RwLock<Arc<DomainSuffixSet>>,
    generation: AtomicU64,
}

impl SuffixRouter {
    pub fn new(suffixes: impl IntoIterator<Item = impl AsRef<str>>) -> Self {
        Self {
            live: RwLock::new(Arc::new(DomainSuffixSet::new(suffixes))),
            generation: AtomicU64::new(0),
        }
    }

    pub fn matches(&self, host: &str) -> bool {
        self.snapshot().matches(host)
    }

    pub fn snapshot(&self) -> Arc<DomainSuffixSet> {
        Arc::clone(&self.live.read().expect("suffix router lock poisoned"))
    }

    pub fn reload(&self, suffixes: impl IntoIterator<Item = impl AsRef<str>>) -> u64 {
        let next = Arc::new(DomainSuffixSet::new(suffixes));
        *self.live.write().expect("suffix router lock poisoned") = next;
        self.generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }
}

impl Default for SuffixRouter {
    fn default() -> Self {
        Self::new(Vec::<String>::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    #[test]
    fn matches_exact_suffix_and_subdomains() {
        let set = DomainSuffixSet::new(["google.com"]);
        assert!(set.matches("google.com"));
        assert!(set.matches("www.google.com"));
        assert!(set.matches("a.b.google.com"));
        assert!(set.matches("WWW.GOOGLE.COM"));
    }

    #[test]
    fn rejects_substring_lookalikes() {
        let set = DomainSuffixSet::new(["google.com"]);
        assert!(!set.matches("notgoogle.com"));
        assert!(!set.matches("google.com.evil.example"));
        assert!(!set.matches("oogle.com"));
        assert!(!set.matches("com"));
    }

    #[test]
    fn normalizes_trailing_dots_and_whitespace() {
        let set = DomainSuffixSet::new([" Google.COM. "]);
        assert!(set.matches("maps.google.com."));
    }

    #[test]
    fn empty_entries_are_dropped() {
        let set = DomainSuffixSet::new(["", "  ", "."]);
        assert!(set.is_empty());
        assert!(!set.matches("example.com"));
    }

    #[test]
    fn reload_replaces_snapshot_and_bumps_generation() {
        let router = SuffixRouter::new(["google.com"]);
        assert!(router.matches("www.google.com"));
        assert_eq!(router.generation(), 0);

        let generation = router.reload(["example.org"]);
        assert_eq!(generation, 1);
        assert!(!router.matches("www.google.com"));
        assert!(router.matches("sub.example.org"));
    }

    #[test]
    fn in_flight_snapshot_outlives_reload() {
        let router = SuffixRouter::new(["google.com"]);
        let snapshot = router.snapshot();
        router.reload(["example.org"]);
        // The captured snapshot still answers with the old set.
        assert!(snapshot.matches("www.google.com"));
        assert!(!snapshot.matches("example.org"));
    }

    /// A snapshot captured during concurrent reloads must be explainable by
    /// exactly one reload generation: it answers for the old marker host or
    /// the new one, never both and never neither.
    #[test]
    fn concurrent_reload_never_tears_a_snapshot() {
        let router = Arc::new(SuffixRouter::new(["alpha.test"]));
        let stop = Arc::new(AtomicBool::new(false));

        let reloader = {
            let router = Arc::clone(&router);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut flip = false;
                while !stop.load(Ordering::Relaxed) {
                    if flip {
                        router.reload(["alpha.test"]);
                    } else {
                        router.reload(["beta.test"]);
                    }
                    flip = !flip;
                }
            })
        };

        let readers = (0..4)
            .map(|_| {
                let router = Arc::clone(&router);
                let stop = Arc::clone(&stop);
                thread::spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        let snapshot = router.snapshot();
                        let alpha = snapshot.matches("www.alpha.test");
                        let beta = snapshot.matches("www.beta.test");
                        assert!(
                            alpha != beta,
                            "torn snapshot observed: alpha={alpha} beta={beta}"
                        );
                    }
                })
            })
            .collect::<Vec<_>>();

        thread::sleep(std::time::Duration::from_millis(200));
        stop.store(true, Ordering::Relaxed);
        reloader.join().expect("reloader thread");
        for reader in readers {
            reader.join().expect("reader thread");
        }
    }
}
