use std::collections::HashSet;

use gravastar_lib::canonical_name;

/// An immutable snapshot of blocked domains. The whole set is replaced on
/// update; readers holding the state lock never observe a partial install.
#[derive(Default, Debug)]
pub struct Blocklist {
    domains: HashSet<String>,
}

impl Blocklist {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn set_domains(&mut self, domains: HashSet<String>) {
        self.domains = domains;
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    /// A name is blocked if it is a direct member of the set or if any of
    /// its parent suffixes with at least two labels is.
    pub fn is_blocked(&self, name: &str) -> bool {
        if self.domains.is_empty() {
            return false;
        }

        let canonical = canonical_name(name);
        if self.domains.contains(&canonical) {
            return true;
        }

        let labels: Vec<&str> = canonical.split('.').collect();
        if labels.len() < 2 {
            return false;
        }

        // Parent suffixes keep at least two labels: a bare TLD in the set
        // never matches by suffix.
        (1..labels.len() - 1).any(|idx| self.domains.contains(&labels[idx..].join(".")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blocklist_with(domains: &[&str]) -> Blocklist {
        let mut blocklist = Blocklist::new();
        blocklist.set_domains(domains.iter().map(|domain| domain.to_string()).collect());
        blocklist
    }

    #[test]
    fn matches_direct_and_parent_suffixes() {
        let blocklist = blocklist_with(&["example.com"]);
        assert!(blocklist.is_blocked("example.com"));
        assert!(blocklist.is_blocked("ads.example.com"));
        assert!(blocklist.is_blocked("a.b.example.com"));
        assert!(!blocklist.is_blocked("notexample.com"));
        assert!(!blocklist.is_blocked("example.org"));
    }

    #[test]
    fn canonicalizes_lookups() {
        let blocklist = blocklist_with(&["example.com"]);
        assert!(blocklist.is_blocked("EXAMPLE.COM"));
        assert!(blocklist.is_blocked("example.com."));
    }

    #[test]
    fn suffix_matching_requires_two_labels() {
        // A bare TLD in the set matches directly but never by suffix
        let blocklist = blocklist_with(&["com"]);
        assert!(blocklist.is_blocked("com"));
        assert!(!blocklist.is_blocked("example.com"));

        let blocklist = blocklist_with(&["example.com"]);
        assert!(blocklist.is_blocked("deep.ads.example.com"));
    }

    #[test]
    fn empty_set_blocks_nothing() {
        let blocklist = Blocklist::new();
        assert!(!blocklist.is_blocked("example.com"));
    }
}
