//! Syntactic <-> semantic checksum registry
//!
//! Code pins are keyed by the checksum of their canonical form, so that
//! formatting-only edits share a cache entry. To run such a transformation
//! the engine needs a syntactic buffer back, which this registry remembers.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::checksum::Checksum;
use crate::codec::Celltype;

/// `(checksum, celltype, subcelltype)`
pub type SemanticKey = (Checksum, Celltype, Option<String>);

#[derive(Default)]
struct Maps {
    syn_to_sem: HashMap<SemanticKey, Checksum>,
    sem_to_syn: HashMap<SemanticKey, Vec<Checksum>>,
}

#[derive(Default)]
pub struct SemanticRegistry {
    maps: Mutex<Maps>,
}

impl SemanticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Maps> {
        self.maps.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn semantic(&self, syntactic: &SemanticKey) -> Option<Checksum> {
        self.lock().syn_to_sem.get(syntactic).copied()
    }

    pub fn syntactic(&self, semantic: &SemanticKey) -> Option<Vec<Checksum>> {
        self.lock().sem_to_syn.get(semantic).cloned()
    }

    /// Every recorded syntactic form of a semantic checksum, whatever its celltype
    pub fn syntactic_any(&self, semantic: &Checksum) -> Vec<(Celltype, Option<String>, Vec<Checksum>)> {
        self.lock()
            .sem_to_syn
            .iter()
            .filter(|((sem, _, _), _)| sem == semantic)
            .map(|((_, celltype, sub), syntactic)| (*celltype, sub.clone(), syntactic.clone()))
            .collect()
    }

    /// Record a syntactic -> semantic pair
    ///
    /// Returns the updated syntactic list of the semantic key, or `None` when
    /// the pair was already known.
    pub fn record(
        &self,
        syntactic: Checksum,
        semantic: Checksum,
        celltype: Celltype,
        subcelltype: Option<&str>,
    ) -> Option<Vec<Checksum>> {
        let sub = subcelltype.map(str::to_string);
        let mut maps = self.lock();
        maps.syn_to_sem.insert((syntactic, celltype, sub.clone()), semantic);
        let list = maps.sem_to_syn.entry((semantic, celltype, sub)).or_default();
        if list.contains(&syntactic) {
            return None;
        }
        list.push(syntactic);
        Some(list.clone())
    }

    /// Merge syntactic checksums obtained elsewhere (e.g. from the database)
    pub fn merge(&self, semantic: SemanticKey, syntactic: &[Checksum]) -> Vec<Checksum> {
        let mut maps = self.lock();
        for syn in syntactic {
            maps.syn_to_sem
                .insert((*syn, semantic.1, semantic.2.clone()), semantic.0);
        }
        let list = maps.sem_to_syn.entry(semantic).or_default();
        for syn in syntactic {
            if !list.contains(syn) {
                list.push(*syn);
            }
        }
        list.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().sem_to_syn.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
