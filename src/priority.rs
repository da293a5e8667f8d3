//! Priority lists: precedence between signatures of one matcher
//!
//! An entry `winner -> [losers]` means that when `winner` matches, hits for
//! any of `losers` are suppressed. Lists are baked into a matcher when its
//! signatures are added and are read only afterwards.

use std::collections::BTreeMap;

use crate::core::Hit;
use crate::persist::LoadSaver;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PriorityList {
    over: BTreeMap<usize, Vec<usize>>,
}

impl PriorityList {
    /// Create an empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `winner` takes precedence over `loser`.
    pub fn add(&mut self, winner: usize, loser: usize) {
        if winner == loser {
            return;
        }
        let losers = self.over.entry(winner).or_default();
        if !losers.contains(&loser) {
            losers.push(loser);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.over.is_empty()
    }

    pub fn suppresses(&self, winner: usize, loser: usize) -> bool {
        self.over
            .get(&winner)
            .is_some_and(|losers| losers.contains(&loser))
    }

    /// Drop every index suppressed by another index in `matched`, keeping the
    /// original order of the survivors.
    pub fn filter(&self, matched: &[usize]) -> Vec<usize> {
        matched
            .iter()
            .copied()
            .filter(|&candidate| {
                !matched
                    .iter()
                    .any(|&other| other != candidate && self.suppresses(other, candidate))
            })
            .collect()
    }

    /// Drop hits suppressed by another hit in the same batch.
    pub fn retain_hits(&self, hits: Vec<Hit>) -> Vec<Hit> {
        if self.is_empty() {
            return hits;
        }
        let indexes: Vec<usize> = hits.iter().map(Hit::index).collect();
        let keep = self.filter(&indexes);
        hits.into_iter()
            .filter(|hit| keep.contains(&hit.index()))
            .collect()
    }

    /// Shift every index by `offset`, used when a set is appended after
    /// signatures already held by the matcher.
    pub fn rebase(&self, offset: usize) -> PriorityList {
        PriorityList {
            over: self
                .over
                .iter()
                .map(|(winner, losers)| {
                    (
                        winner + offset,
                        losers.iter().map(|loser| loser + offset).collect(),
                    )
                })
                .collect(),
        }
    }

    /// Merge `other` into this list.
    pub fn extend(&mut self, other: &PriorityList) {
        for (&winner, losers) in &other.over {
            for &loser in losers {
                self.add(winner, loser);
            }
        }
    }

    pub fn save(&self, ls: &mut LoadSaver) {
        ls.save_int(self.over.len() as u32);
        for (&winner, losers) in &self.over {
            ls.save_usize(winner);
            ls.save_ints(losers);
        }
    }

    pub fn load(ls: &mut LoadSaver) -> Self {
        let mut list = PriorityList::new();
        let len = ls.load_int();
        for _ in 0..len {
            if ls.err().is_some() {
                break;
            }
            let winner = ls.load_usize();
            for loser in ls.load_ints() {
                list.add(winner, loser);
            }
        }
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_drops_suppressed() {
        let mut list = PriorityList::new();
        list.add(1, 0);
        assert_eq!(list.filter(&[0, 1, 2]), vec![1, 2]);
        assert_eq!(list.filter(&[0, 2]), vec![0, 2]);
    }

    #[test]
    fn test_retain_hits() {
        let mut list = PriorityList::new();
        list.add(2, 1);
        let hits = vec![Hit::new(1, "a"), Hit::new(2, "b"), Hit::new(3, "c")];
        let kept: Vec<usize> = list.retain_hits(hits).iter().map(Hit::index).collect();
        assert_eq!(kept, vec![2, 3]);
    }

    #[test]
    fn test_self_priority_ignored() {
        let mut list = PriorityList::new();
        list.add(3, 3);
        assert!(list.is_empty());
    }

    #[test]
    fn test_rebase_and_extend() {
        let mut list = PriorityList::new();
        list.add(1, 0);
        let rebased = list.rebase(10);
        assert!(rebased.suppresses(11, 10));
        assert!(!rebased.suppresses(1, 0));

        let mut merged = PriorityList::new();
        merged.extend(&list);
        merged.extend(&rebased);
        assert!(merged.suppresses(1, 0));
        assert!(merged.suppresses(11, 10));
    }

    #[test]
    fn test_save_load() {
        let mut list = PriorityList::new();
        list.add(4, 1);
        list.add(4, 2);
        list.add(7, 4);
        let mut ls = LoadSaver::saver();
        list.save(&mut ls);
        let mut ls = LoadSaver::loader(ls.into_bytes().unwrap());
        assert_eq!(PriorityList::load(&mut ls), list);
    }
}
