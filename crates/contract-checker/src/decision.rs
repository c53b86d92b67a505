//! Branch decisions along a path
//!
//! A [`DecisionVector`] records, for each branching instruction met on the way
//! from a contract to a target, which destinations are still possible. It is
//! cloned and narrowed once per target so each block check replays exactly one
//! path.

use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecisionVector {
    decisions: BTreeMap<u64, Vec<u64>>,
}

impl DecisionVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the destinations of the branch at `address`, replacing any
    /// earlier record.
    pub fn record(&mut self, address: u64, targets: Vec<u64>) {
        self.decisions.insert(address, targets);
    }

    pub fn get(&self, address: u64) -> Option<&[u64]> {
        self.decisions.get(&address).map(Vec::as_slice)
    }

    pub fn contains(&self, address: u64) -> bool {
        self.decisions.contains_key(&address)
    }

    pub fn len(&self) -> usize {
        self.decisions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decisions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &[u64])> {
        self.decisions
            .iter()
            .map(|(&address, targets)| (address, targets.as_slice()))
    }

    /// Copy of this vector where the branch at `branch` only goes to `target`.
    pub fn narrowed(&self, branch: u64, target: u64) -> Self {
        let mut narrowed = self.clone();
        narrowed.record(branch, vec![target]);
        narrowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_get() {
        let mut decisions = DecisionVector::new();
        assert!(decisions.is_empty());
        decisions.record(0x1004, vec![0x2000, 0x3000]);
        assert!(decisions.contains(0x1004));
        assert_eq!(decisions.get(0x1004), Some(&[0x2000, 0x3000][..]));
        assert_eq!(decisions.get(0x1008), None);
    }

    #[test]
    fn test_narrowed_leaves_original() {
        let mut decisions = DecisionVector::new();
        decisions.record(0x1004, vec![0x2000, 0x3000]);
        let narrowed = decisions.narrowed(0x1004, 0x3000);

        assert_eq!(narrowed.get(0x1004), Some(&[0x3000][..]));
        assert_eq!(decisions.get(0x1004), Some(&[0x2000, 0x3000][..]));
        assert_eq!(narrowed.len(), 1);
    }
}
