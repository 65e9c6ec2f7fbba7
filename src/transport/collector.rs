//! Reassembly of packages arriving from several senders.

use super::Package;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Per-round reassembly buffer keyed by sender identifier
///
/// Packages are kept ordered by sequence number, so arrival order does not
/// matter. A sender is complete once its last package arrived.
#[derive(Debug, Default)]
pub struct Collector {
    expected_peers: usize,
    buckets: HashMap<u32, BTreeMap<u32, Vec<u8>>>,
    completed: HashSet<u32>,
}

impl Collector {
    /// Create a collector waiting for `expected_peers` senders
    ///
    /// With `expected_peers == 0` the round is finished once every sender
    /// seen so far is complete.
    pub fn new(expected_peers: usize) -> Self {
        Self {
            expected_peers,
            ..Self::default()
        }
    }

    /// Add packages to their senders' buckets
    ///
    /// Returns the identifiers that became complete with this call.
    pub fn load<I: IntoIterator<Item = Package>>(&mut self, packages: I) -> Vec<u32> {
        let mut newly_completed = Vec::new();

        for package in packages {
            if package.identifier == 0 {
                log::warn!("Ignoring package with identifier 0");
                continue;
            }

            let bucket = self.buckets.entry(package.identifier).or_default();
            if bucket.insert(package.sequence, package.payload).is_some() {
                log::debug!(
                    "Duplicate package {} from {}, keeping the newer copy",
                    package.sequence,
                    package.identifier
                );
            }

            if package.is_last && self.completed.insert(package.identifier) {
                newly_completed.push(package.identifier);
            }
        }

        newly_completed
    }

    /// Concatenate a sender's packages in sequence order
    ///
    /// Unknown identifiers yield an empty buffer. Incomplete senders yield
    /// what has arrived so far.
    pub fn get_payload(&self, identifier: u32) -> Vec<u8> {
        let Some(bucket) = self.buckets.get(&identifier) else {
            log::warn!("No packages from identifier {identifier}");
            return Vec::new();
        };

        if !self.completed.contains(&identifier) {
            log::warn!("Payload of {identifier} requested before its last package");
        }

        bucket.values().flatten().copied().collect()
    }

    /// True once the last package from `identifier` arrived
    pub fn is_complete(&self, identifier: u32) -> bool {
        self.completed.contains(&identifier)
    }

    /// True once all expected senders are complete
    ///
    /// Without an expected count every sender seen so far must be complete.
    /// A collector that has completed nothing is never finished, even with
    /// no expected senders and nothing loaded.
    pub fn is_finished(&self) -> bool {
        let target = if self.expected_peers == 0 {
            self.buckets.len()
        } else {
            self.expected_peers
        };
        !self.completed.is_empty() && self.completed.len() >= target
    }

    /// Number of complete senders
    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    /// Every identifier seen so far
    pub fn identifiers(&self) -> impl Iterator<Item = u32> + '_ {
        self.buckets.keys().copied()
    }
}
