use std::collections::{hash_map::Entry, HashMap};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// SHA-256 digest of a message payload. Collisions are treated as negligible.
pub type Fingerprint = [u8; 32];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupOutcome {
    New,
    Duplicate,
}

/// Tracks which payloads have been accepted into the current accumulation
/// window. The index is cleared in full at every archive boundary, so a
/// payload seen just before a flush and again just after counts as two
/// distinct messages.
#[derive(Debug, Default)]
pub struct Deduplicator {
    seen: HashMap<Fingerprint, DateTime<Utc>>,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fingerprint(payload: &[u8]) -> Fingerprint {
        Sha256::digest(payload).into()
    }

    /// Check-and-insert in one step. Never touches storage or the network.
    pub fn observe(&mut self, payload: &[u8]) -> DedupOutcome {
        match self.seen.entry(Self::fingerprint(payload)) {
            Entry::Occupied(_) => DedupOutcome::Duplicate,
            Entry::Vacant(entry) => {
                entry.insert(Utc::now());
                DedupOutcome::New
            }
        }
    }

    /// Clears the whole index. Called only at the archive flush boundary.
    pub fn reset(&mut self) {
        self.seen.clear();
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_observation_is_duplicate() {
        let mut dedup = Deduplicator::new();
        assert_eq!(dedup.observe(b"payload"), DedupOutcome::New);
        assert_eq!(dedup.observe(b"payload"), DedupOutcome::Duplicate);
        assert_eq!(dedup.len(), 1);
    }

    #[test]
    fn test_distinct_payloads_are_new() {
        let mut dedup = Deduplicator::new();
        assert_eq!(dedup.observe(b"a"), DedupOutcome::New);
        assert_eq!(dedup.observe(b"b"), DedupOutcome::New);
        assert_eq!(dedup.observe(b"c"), DedupOutcome::New);
        assert_eq!(dedup.len(), 3);
    }

    #[test]
    fn test_reset_reopens_the_window() {
        let mut dedup = Deduplicator::new();
        assert_eq!(dedup.observe(b"payload"), DedupOutcome::New);
        assert_eq!(dedup.observe(b"payload"), DedupOutcome::Duplicate);

        dedup.reset();

        assert!(dedup.is_empty());
        // The boundary seam is intended: the same payload is new again.
        assert_eq!(dedup.observe(b"payload"), DedupOutcome::New);
    }

    #[test]
    fn test_fingerprint_is_stable() {
        assert_eq!(
            Deduplicator::fingerprint(b"payload"),
            Deduplicator::fingerprint(b"payload")
        );
        assert_ne!(
            Deduplicator::fingerprint(b"payload"),
            Deduplicator::fingerprint(b"payload2")
        );
    }
}
