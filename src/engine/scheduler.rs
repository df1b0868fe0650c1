use std::collections::{HashMap, HashSet, VecDeque};

use crate::config::Settings;
use crate::core::ArcStr;
use crate::key::CacheKey;

/// How [`Environment::task_generate_data`](crate::Environment::task_generate_data)
/// dispatches the production task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerateOptions {
    /// Run on the worker pool instead of inline on the main thread.
    pub threaded: bool,
    pub visual: bool,
    /// The key is a prerequisite discovered while resolving another key.
    /// Declined components fail instead of being queued again.
    pub is_component: bool,
    /// The key whose resolution discovered this one.
    pub component_parent: Option<CacheKey>,
}

impl GenerateOptions {
    pub fn new(settings: &Settings) -> Self {
        Self {
            threaded: settings.threaded,
            visual: settings.visual,
            is_component: false,
            component_parent: None,
        }
    }

    pub fn threaded(mut self, threaded: bool) -> Self {
        self.threaded = threaded;
        self
    }

    pub fn visual(mut self, visual: bool) -> Self {
        self.visual = visual;
        self
    }

    pub(crate) fn component_of(mut self, parent: Option<CacheKey>) -> Self {
        self.is_component = true;
        self.component_parent = parent;
        self
    }
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self::new(&Settings::default())
    }
}

/// Keys requested for computation that couldn't be scheduled directly,
/// oldest request first, plus the keys that failed for good.
///
/// A failed key is not queued again until its failure is cleared, either by
/// an explicit [`request`](Self::request) or by the environment when the
/// data behind it changes.
#[derive(Debug, Default)]
pub struct GenerationQueue {
    order: VecDeque<CacheKey>,
    members: HashSet<CacheKey>,
    failures: HashMap<CacheKey, ArcStr>,
}

impl GenerationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `key` unless it is already queued or has failed.
    pub fn insert(&mut self, key: CacheKey) -> bool {
        if self.failures.contains_key(&key) {
            tracing::debug!(key = %key, "not queueing a failed key");
            return false;
        }
        if !self.members.insert(key.clone()) {
            return false;
        }
        self.order.push_back(key);
        true
    }

    /// Clears a failure, then queues `key`.
    pub fn request(&mut self, key: CacheKey) -> bool {
        self.failures.remove(&key);
        self.insert(key)
    }

    pub fn remove(&mut self, key: &CacheKey) -> bool {
        if !self.members.remove(key) {
            return false;
        }
        self.order.retain(|queued| queued != key);
        true
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.members.contains(key)
    }

    /// Keys in request order, copied so the queue can change while they
    /// are worked through.
    pub fn snapshot(&self) -> Vec<CacheKey> {
        self.order.iter().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CacheKey> {
        self.order.iter()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.members.clear();
    }

    /// Removes `key` from the queue and remembers why it failed.
    pub fn fail(&mut self, key: CacheKey, reason: impl Into<ArcStr>) {
        self.remove(&key);
        self.failures.insert(key, reason.into());
    }

    pub fn clear_failure(&mut self, key: &CacheKey) -> bool {
        self.failures.remove(key).is_some()
    }

    /// Drops failures of every key `clear` returns true for.
    pub fn clear_failures_where<F>(&mut self, mut clear: F)
    where
        F: FnMut(&CacheKey) -> bool,
    {
        self.failures.retain(|key, _| !clear(key));
    }

    /// Drops queued keys `remove` returns true for.
    pub fn remove_where<F>(&mut self, mut remove: F) -> bool
    where
        F: FnMut(&CacheKey) -> bool,
    {
        let before = self.order.len();
        self.order.retain(|key| !remove(key));
        self.members.retain(|key| self.order.contains(key));
        before != self.order.len()
    }

    pub fn is_failed(&self, key: &CacheKey) -> bool {
        self.failures.contains_key(key)
    }

    pub fn failure(&self, key: &CacheKey) -> Option<&str> {
        self.failures.get(key).map(|reason| &**reason)
    }

    pub fn failures(&self) -> impl Iterator<Item = (&CacheKey, &str)> {
        self.failures.iter().map(|(key, reason)| (key, &**reason))
    }
}
