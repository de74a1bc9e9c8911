//! Transformation checksum -> result bookkeeping
//!
//! Pure state: every method is synchronous and returns the buffer
//! checksums whose refcounts the caller must adjust. The service holds it
//! behind a mutex and never across an await point.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::checksum::Checksum;
use crate::transformation::Transformation;

/// Identifies one requester of a transformation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransformerId(pub u64);

/// How long an unreferenced transformation stays registered
#[derive(Debug, Clone, Copy)]
pub struct KeepAlive {
    pub min: Duration,
    pub max: Duration,
    /// Jobs running longer than this get `max`
    pub threshold: Duration,
}

impl Default for KeepAlive {
    fn default() -> Self {
        Self {
            min: Duration::from_secs(1),
            max: Duration::from_secs(20),
            threshold: Duration::from_secs(20),
        }
    }
}

/// What `set_result` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultUpdate {
    /// A final result was already present; nothing changed
    Ignored,
    /// The result was stored; `replaced` is the preliminary result it superseded
    Stored { replaced: Option<Checksum> },
}

/// A transformation removed from the cache, with the buffers it referenced
#[derive(Debug, Clone)]
pub struct Destroyed {
    pub transformation: Transformation,
    /// Preliminary result that was dropped along with it
    pub preliminary: Option<Checksum>,
    /// Final result referenced since registration
    pub held: Option<Checksum>,
}

/// What `undo` removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Undone {
    /// Result that was associated with the transformation, if any
    pub result: Option<Checksum>,
    /// Result buffer whose transient reference must be dropped
    pub release: Option<Checksum>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransformationCacheStats {
    pub transformations: usize,
    pub results: usize,
    pub exceptions: usize,
    pub known: usize,
    pub running: usize,
}

#[derive(Default)]
pub struct TransformationCache {
    transformations: HashMap<Checksum, Transformation>,
    /// tf checksum -> (result checksum, preliminary)
    results: HashMap<Checksum, (Checksum, bool)>,
    /// result checksum -> tf checksums (final results only)
    results_rev: HashMap<Checksum, Vec<Checksum>>,
    exceptions: HashMap<Checksum, String>,
    logs: HashMap<Checksum, String>,
    transformer_to_transformation: HashMap<TransformerId, Option<Checksum>>,
    transformation_to_transformers: HashMap<Checksum, Vec<TransformerId>>,
    /// Results of transformations launched imperatively or reported by a worker
    known: HashMap<Checksum, Checksum>,
    known_rev: HashMap<Checksum, Vec<Checksum>>,
    /// Final results referenced by a registered transformation
    held: HashMap<Checksum, Checksum>,
    job_start: HashMap<Checksum, Instant>,
    job_progress: HashMap<Checksum, f64>,
}

impl TransformationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a transformation dict; returns true on first registration
    ///
    /// A re-registration replaces the dict, to pick up changed metadata.
    pub fn add_transformation(&mut self, tf_checksum: Checksum, transformation: Transformation) -> bool {
        self.transformation_to_transformers.entry(tf_checksum).or_default();
        self.transformations.insert(tf_checksum, transformation).is_none()
    }

    /// Let a registered transformation reference its final result, if one is known
    ///
    /// Returns the result buffer that must be incref'ed.
    pub fn hold_result(&mut self, tf_checksum: &Checksum) -> Option<Checksum> {
        if !self.transformations.contains_key(tf_checksum) || self.held.contains_key(tf_checksum) {
            return None;
        }
        match self.results.get(tf_checksum) {
            Some((result, false)) => {
                self.held.insert(*tf_checksum, *result);
                Some(*result)
            }
            _ => None,
        }
    }

    pub fn transformation(&self, tf_checksum: &Checksum) -> Option<&Transformation> {
        self.transformations.get(tf_checksum)
    }

    pub fn contains(&self, tf_checksum: &Checksum) -> bool {
        self.transformations.contains_key(tf_checksum)
    }

    pub fn register_transformer(&mut self, transformer: TransformerId) {
        self.transformer_to_transformation.entry(transformer).or_insert(None);
    }

    /// Attach a transformer to a transformation
    ///
    /// Returns the transformation it was attached to before, when that differs.
    pub fn attach(&mut self, tf_checksum: Checksum, transformer: TransformerId) -> Option<Checksum> {
        let transformers = self.transformation_to_transformers.entry(tf_checksum).or_default();
        if !transformers.contains(&transformer) {
            transformers.push(transformer);
        }
        let old = self
            .transformer_to_transformation
            .insert(transformer, Some(tf_checksum))
            .flatten();
        old.filter(|old| *old != tf_checksum)
    }

    /// Detach a transformer; returns how many transformers remain
    pub fn detach(&mut self, tf_checksum: &Checksum, transformer: TransformerId) -> usize {
        if let Some(Some(current)) = self.transformer_to_transformation.get(&transformer) {
            if current == tf_checksum {
                self.transformer_to_transformation.insert(transformer, None);
            }
        }
        match self.transformation_to_transformers.get_mut(tf_checksum) {
            Some(transformers) => {
                transformers.retain(|t| *t != transformer);
                transformers.len()
            }
            None => 0,
        }
    }

    /// Forget a transformer entirely; returns the transformation it was attached to
    pub fn destroy_transformer(&mut self, transformer: TransformerId) -> Option<Checksum> {
        self.transformer_to_transformation.remove(&transformer).flatten()
    }

    pub fn transformation_of(&self, transformer: TransformerId) -> Option<Checksum> {
        self.transformer_to_transformation.get(&transformer).copied().flatten()
    }

    pub fn referrers(&self, tf_checksum: &Checksum) -> usize {
        self.transformation_to_transformers
            .get(tf_checksum)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Grace period before destroying an unreferenced transformation
    pub fn keep_alive(&self, tf_checksum: &Checksum, now: Instant, policy: &KeepAlive) -> Duration {
        match self.job_start.get(tf_checksum) {
            Some(start) if now.saturating_duration_since(*start) > policy.threshold => policy.max,
            _ => policy.min,
        }
    }

    /// Remove a transformation that no transformer refers to anymore
    ///
    /// Preliminary results go with it; final results stay cached.
    pub fn destroy(&mut self, tf_checksum: &Checksum) -> Option<Destroyed> {
        if self.referrers(tf_checksum) > 0 {
            return None;
        }
        let transformation = self.transformations.remove(tf_checksum)?;
        self.transformation_to_transformers.remove(tf_checksum);
        self.logs.remove(tf_checksum);
        let preliminary = match self.results.get(tf_checksum).copied() {
            Some((result, true)) => {
                self.results.remove(tf_checksum);
                Some(result)
            }
            _ => None,
        };
        Some(Destroyed {
            transformation,
            preliminary,
            held: self.held.remove(tf_checksum),
        })
    }

    pub fn result(&self, tf_checksum: &Checksum) -> Option<(Checksum, bool)> {
        self.results.get(tf_checksum).copied()
    }

    /// Store a (preliminary or final) result
    pub fn set_result(&mut self, tf_checksum: Checksum, result: Checksum, prelim: bool) -> ResultUpdate {
        let replaced = match self.results.get(&tf_checksum) {
            Some((_, false)) => return ResultUpdate::Ignored,
            Some((old, true)) => Some(*old),
            None => None,
        };
        self.results.insert(tf_checksum, (result, prelim));
        if !prelim {
            self.push_rev(tf_checksum, result);
        }
        ResultUpdate::Stored { replaced }
    }

    /// Adopt a final result found in the database; true if it was not cached yet
    pub fn adopt_result(&mut self, tf_checksum: Checksum, result: Checksum) -> bool {
        if let Some((_, false)) = self.results.get(&tf_checksum) {
            return false;
        }
        self.results.insert(tf_checksum, (result, false));
        self.push_rev(tf_checksum, result);
        true
    }

    fn push_rev(&mut self, tf_checksum: Checksum, result: Checksum) {
        let rev = self.results_rev.entry(result).or_default();
        if !rev.contains(&tf_checksum) {
            rev.push(tf_checksum);
        }
    }

    /// Record a result of a transformation that was not run through this cache
    pub fn register_known(&mut self, tf_checksum: Checksum, result: Checksum) {
        if self.known.get(&tf_checksum) == Some(&result) {
            return;
        }
        if let Some(old) = self.known.insert(tf_checksum, result) {
            if let Some(rev) = self.known_rev.get_mut(&old) {
                rev.retain(|t| *t != tf_checksum);
            }
        }
        self.known_rev.entry(result).or_default().push(tf_checksum);
    }

    pub fn known(&self, tf_checksum: &Checksum) -> Option<Checksum> {
        self.known.get(tf_checksum).copied()
    }

    /// Transformations known to have produced `result`, cached results first
    pub fn producers_of(&self, result: &Checksum) -> Vec<Checksum> {
        let mut producers: Vec<Checksum> = self.results_rev.get(result).cloned().unwrap_or_default();
        for tf in self.known_rev.get(result).into_iter().flatten() {
            if !producers.contains(tf) {
                producers.push(*tf);
            }
        }
        producers
    }

    /// Forget the result of a transformation so that it is recomputed
    pub fn undo(&mut self, tf_checksum: &Checksum) -> Undone {
        let mut undone = Undone::default();
        if let Some((result, _)) = self.results.remove(tf_checksum) {
            undone.result = Some(result);
            undone.release = Some(result);
            if let Some(rev) = self.results_rev.get_mut(&result) {
                rev.retain(|t| t != tf_checksum);
                if rev.is_empty() {
                    self.results_rev.remove(&result);
                }
            }
        }
        if let Some(known) = self.known.remove(tf_checksum) {
            if let Some(rev) = self.known_rev.get_mut(&known) {
                rev.retain(|t| t != tf_checksum);
                if rev.is_empty() {
                    self.known_rev.remove(&known);
                }
            }
            undone.result = Some(known);
        }
        self.logs.remove(tf_checksum);
        undone
    }

    pub fn set_exception(&mut self, tf_checksum: Checksum, exception: String, logs: Option<String>) {
        self.exceptions.insert(tf_checksum, exception);
        if let Some(logs) = logs {
            self.logs.insert(tf_checksum, logs);
        }
    }

    pub fn exception(&self, tf_checksum: &Checksum) -> Option<&str> {
        self.exceptions.get(tf_checksum).map(String::as_str)
    }

    pub fn clear_exception(&mut self, tf_checksum: &Checksum) -> Option<String> {
        self.exceptions.remove(tf_checksum)
    }

    pub fn set_logs(&mut self, tf_checksum: Checksum, logs: String) {
        self.logs.insert(tf_checksum, logs);
    }

    pub fn logs(&self, tf_checksum: &Checksum) -> Option<&str> {
        self.logs.get(tf_checksum).map(String::as_str)
    }

    pub fn job_started(&mut self, tf_checksum: Checksum, at: Instant) {
        self.job_start.insert(tf_checksum, at);
        self.job_progress.remove(&tf_checksum);
    }

    /// Returns the job start time, if the job was registered
    pub fn job_finished(&mut self, tf_checksum: &Checksum) -> Option<Instant> {
        self.job_progress.remove(tf_checksum);
        self.job_start.remove(tf_checksum)
    }

    pub fn is_running(&self, tf_checksum: &Checksum) -> bool {
        self.job_start.contains_key(tf_checksum)
    }

    pub fn set_progress(&mut self, tf_checksum: Checksum, progress: f64) {
        if self.job_start.contains_key(&tf_checksum) {
            self.job_progress.insert(tf_checksum, progress);
        }
    }

    pub fn progress(&self, tf_checksum: &Checksum) -> Option<f64> {
        self.job_progress.get(tf_checksum).copied()
    }

    pub fn running(&self) -> Vec<Checksum> {
        self.job_start.keys().copied().collect()
    }

    pub fn stats(&self) -> TransformationCacheStats {
        TransformationCacheStats {
            transformations: self.transformations.len(),
            results: self.results.len(),
            exceptions: self.exceptions.len(),
            known: self.known.len(),
            running: self.job_start.len(),
        }
    }
}
