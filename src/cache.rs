use std::collections::HashMap;

use crate::entities::EntityKind;

/// Natural key to persisted id for one entity kind, valid for one run.
#[derive(Debug, Clone)]
pub struct ResolutionCache {
    kind: EntityKind,
    ids: HashMap<String, i64>,
}

impl ResolutionCache {
    pub fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            ids: HashMap::new(),
        }
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn get(&self, key: &str) -> Option<i64> {
        self.ids.get(key).copied()
    }

    /// Keeps the first id cached for a key.
    pub fn insert(&mut self, key: String, id: i64) {
        self.ids.entry(key).or_insert(id);
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResolutionCaches {
    caches: HashMap<EntityKind, ResolutionCache>,
}

impl ResolutionCaches {
    pub fn install(&mut self, cache: ResolutionCache) {
        self.caches.insert(cache.kind(), cache);
    }

    pub fn lookup(&self, kind: EntityKind, key: &str) -> Option<i64> {
        self.caches.get(&kind)?.get(key)
    }
}
