//! Resolves one reference-entity kind for a whole batch of records.
//!
//! The store is read once per kind. Candidates are matched against persisted
//! rows through one index per identifying attribute, probing in priority order,
//! and whatever stays unmatched is created in chunked bulk inserts. Candidates
//! that match an entity already queued for creation are folded into it, so
//! two sightings of one pharmacy (one with an NPI, one with only a name) create
//! a single row.

use std::collections::{HashMap, HashSet};
use tracing::{info, warn};

use crate::{
    cache::{ResolutionCache, ResolutionCaches},
    entities::{EntityKind, Probe, ReferenceEntity},
    records::TypedRecord,
    store::{BackingStore, StoreError, StoredRow, row_id},
    summary::ImportError,
};

#[derive(Debug)]
pub struct Resolution {
    pub kind: EntityKind,
    pub cache: ResolutionCache,
    /// Distinct candidates found in the batch.
    pub candidates: usize,
    pub matched: usize,
    pub created: usize,
    pub errors: Vec<ImportError>,
}

impl Resolution {
    fn new(kind: EntityKind, candidates: usize) -> Self {
        Self {
            kind,
            cache: ResolutionCache::new(kind),
            candidates,
            matched: 0,
            created: 0,
            errors: Vec::new(),
        }
    }

    fn cache_aliases(&mut self, aliases: &[String], id: i64) {
        for alias in aliases {
            self.cache.insert(alias.clone(), id);
        }
    }

    fn creation_failed(&mut self, attempted: usize, message: String) {
        warn!(kind = %self.kind, attempted, %message, "entity creation failed");
        self.errors.push(ImportError::EntityCreationFailed {
            kind: self.kind,
            attempted,
            message,
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Persisted(i64),
    Pending(usize),
}

/// One lookup map per identifying attribute, all pointing into `targets`.
struct IdentityIndex {
    identifiers: &'static [&'static str],
    maps: Vec<HashMap<String, usize>>,
    targets: Vec<(Target, Vec<Probe>)>,
}

impl IdentityIndex {
    fn new(identifiers: &'static [&'static str]) -> Self {
        Self {
            identifiers,
            maps: vec![HashMap::new(); identifiers.len()],
            targets: Vec::new(),
        }
    }

    fn from_rows<E: ReferenceEntity>(rows: &[StoredRow]) -> Self {
        let mut index = Self::new(E::IDENTIFIERS);
        for row in rows {
            if let Some(id) = row_id(row) {
                index.insert(Target::Persisted(id), E::probes_from_row(row));
            }
        }
        index
    }

    fn position(&self, attr: &str) -> Option<usize> {
        self.identifiers.iter().position(|a| *a == attr)
    }

    fn insert(&mut self, target: Target, probes: Vec<Probe>) -> usize {
        let slot = self.targets.len();
        self.register(slot, &probes);
        self.targets.push((target, probes));
        slot
    }

    /// Replaces a slot's probes after it gained attributes; earlier mappings stay.
    fn refresh(&mut self, slot: usize, probes: Vec<Probe>) {
        self.register(slot, &probes);
        self.targets[slot].1 = probes;
    }

    /// Adds attributes the slot lacks, keeping priority order.
    fn merge(&mut self, slot: usize, probes: &[Probe]) {
        let mut merged = self.targets[slot].1.clone();
        for probe in probes {
            if !merged.iter().any(|known| known.attr == probe.attr) {
                merged.push(probe.clone());
            }
        }
        merged.sort_by_key(|probe| self.position(probe.attr));
        self.refresh(slot, merged);
    }

    fn register(&mut self, slot: usize, probes: &[Probe]) {
        for probe in probes {
            if let Some(pos) = self.position(probe.attr) {
                self.maps[pos].entry(probe.value.clone()).or_insert(slot);
            }
        }
    }

    /// First hit in priority order, skipping hits whose higher-priority
    /// attributes disagree with the probe set.
    fn find(&self, probes: &[Probe]) -> Option<(usize, Target)> {
        for (rank, probe) in probes.iter().enumerate() {
            let Some(pos) = self.position(probe.attr) else {
                continue;
            };
            let Some(&slot) = self.maps[pos].get(&probe.value) else {
                continue;
            };
            if self.conflicts(slot, &probes[..rank]) {
                continue;
            }
            return Some((slot, self.targets[slot].0));
        }
        None
    }

    fn conflicts(&self, slot: usize, higher: &[Probe]) -> bool {
        let existing = &self.targets[slot].1;
        higher.iter().any(|probe| {
            existing
                .iter()
                .any(|other| other.attr == probe.attr && other.value != probe.value)
        })
    }

    fn persisted_id(&self, probes: &[Probe]) -> Option<i64> {
        match self.find(probes)? {
            (_, Target::Persisted(id)) => Some(id),
            (_, Target::Pending(_)) => None,
        }
    }
}

struct PendingEntity<E> {
    entity: E,
    slot: usize,
    /// Candidate keys that resolve to this entity once it exists.
    aliases: Vec<String>,
}

/// Distinct candidates in first-seen order, keyed by natural key.
fn distinct_candidates<E: ReferenceEntity>(
    records: &[TypedRecord],
    caches: &ResolutionCaches,
) -> Vec<(String, E)> {
    let mut seen = HashSet::new();
    let mut candidates = Vec::new();
    for record in records {
        let Some(entity) = E::from_record(record, caches) else {
            continue;
        };
        let Some(key) = entity.natural_key() else {
            continue;
        };
        if seen.insert(key.clone()) {
            candidates.push((key, entity));
        }
    }
    candidates
}

/// Resolves every `E` referenced by `records` to a persisted id.
///
/// Returns `Err` only when the initial read of the kind's table fails; creation
/// failures are reported in [`Resolution::errors`] and leave the affected keys
/// uncached.
pub async fn resolve<E, S>(
    store: &S,
    records: &[TypedRecord],
    caches: &ResolutionCaches,
    chunk_size: usize,
    mut on_progress: impl FnMut(f64),
) -> Result<Resolution, StoreError>
where
    E: ReferenceEntity,
    S: BackingStore,
{
    let kind = E::KIND;
    let candidates = distinct_candidates::<E>(records, caches);
    let mut resolution = Resolution::new(kind, candidates.len());
    if candidates.is_empty() {
        on_progress(1.0);
        return Ok(resolution);
    }

    let existing = store.bulk_read(kind.table()).await?;
    on_progress(0.3);

    let mut index = IdentityIndex::from_rows::<E>(&existing);
    let mut pending: Vec<PendingEntity<E>> = Vec::new();
    for (key, entity) in candidates {
        let probes = entity.probes();
        match index.find(&probes) {
            Some((slot, Target::Persisted(id))) => {
                // Later sightings with a different identifier must not reach this row by name.
                index.merge(slot, &probes);
                resolution.cache.insert(key, id);
                resolution.matched += 1;
            }
            Some((slot, Target::Pending(idx))) => {
                let queued = &mut pending[idx];
                queued.entity.absorb(&entity);
                queued.aliases.push(key);
                index.refresh(slot, queued.entity.probes());
            }
            None => {
                let slot = index.insert(Target::Pending(pending.len()), probes);
                pending.push(PendingEntity {
                    entity,
                    slot,
                    aliases: vec![key],
                });
            }
        }
    }
    on_progress(0.5);

    let chunk_size = chunk_size.max(1);
    let total_chunks = pending.len().div_ceil(chunk_size);
    for (chunk_idx, chunk) in pending.chunks(chunk_size).enumerate() {
        let chunk: Vec<&PendingEntity<E>> = chunk.iter().collect();
        create_chunk(store, &chunk, &mut resolution).await;
        on_progress(0.5 + 0.5 * (chunk_idx + 1) as f64 / total_chunks as f64);
    }
    on_progress(1.0);

    info!(
        kind = %kind,
        candidates = resolution.candidates,
        matched = resolution.matched,
        created = resolution.created,
        "resolved reference entities"
    );
    Ok(resolution)
}

async fn create_chunk<E, S>(
    store: &S,
    chunk: &[&PendingEntity<E>],
    resolution: &mut Resolution,
) where
    E: ReferenceEntity,
    S: BackingStore,
{
    let rows: Vec<StoredRow> = chunk.iter().map(|p| p.entity.to_row()).collect();
    match store.bulk_insert(E::KIND.table(), &rows).await {
        Ok(returned) => {
            let unmatched = adopt_created(chunk, &returned, resolution);
            if !unmatched.is_empty() {
                resolution.creation_failed(
                    unmatched.len(),
                    "created rows could not be matched back to their natural keys".to_string(),
                );
            }
        }
        Err(err) if err.is_conflict() => {
            warn!(kind = %E::KIND, error = %err, "insert hit existing rows, re-reading");
            recover_from_conflict(store, chunk, resolution).await;
        }
        Err(err) => resolution.creation_failed(chunk.len(), err.to_string()),
    }
}

/// Caches ids for entities found among freshly created rows. Returns the rest.
fn adopt_created<'a, E: ReferenceEntity>(
    chunk: &[&'a PendingEntity<E>],
    returned: &[StoredRow],
    resolution: &mut Resolution,
) -> Vec<&'a PendingEntity<E>> {
    let index = IdentityIndex::from_rows::<E>(returned);
    let mut unmatched = Vec::new();
    for pending in chunk {
        match index.persisted_id(&pending.entity.probes()) {
            Some(id) => {
                resolution.cache_aliases(&pending.aliases, id);
                resolution.created += 1;
            }
            None => unmatched.push(*pending),
        }
    }
    unmatched
}

/// Another writer created some of the chunk first: adopt its rows, then retry
/// whatever is still missing once. A second conflict falls back to one row at
/// a time so a single bad entity cannot sink its neighbours.
async fn recover_from_conflict<E, S>(
    store: &S,
    chunk: &[&PendingEntity<E>],
    resolution: &mut Resolution,
) where
    E: ReferenceEntity,
    S: BackingStore,
{
    let table = E::KIND.table();
    let existing = match store.bulk_read(table).await {
        Ok(rows) => rows,
        Err(err) => {
            resolution.creation_failed(chunk.len(), format!("re-read after conflict: {err}"));
            return;
        }
    };

    let index = IdentityIndex::from_rows::<E>(&existing);
    let mut missing = Vec::new();
    for pending in chunk {
        match index.persisted_id(&pending.entity.probes()) {
            Some(id) => {
                resolution.cache_aliases(&pending.aliases, id);
                resolution.matched += 1;
            }
            None => missing.push(*pending),
        }
    }
    if missing.is_empty() {
        return;
    }

    let rows: Vec<StoredRow> = missing.iter().map(|p| p.entity.to_row()).collect();
    match store.bulk_insert(table, &rows).await {
        Ok(returned) => {
            let unmatched = adopt_created(&missing, &returned, resolution);
            if !unmatched.is_empty() {
                resolution.creation_failed(
                    unmatched.len(),
                    "created rows could not be matched back to their natural keys".to_string(),
                );
            }
        }
        Err(err) if err.is_conflict() => {
            let mut failures = 0usize;
            let mut last_error = String::new();
            for pending in missing {
                match store.bulk_insert(table, &[pending.entity.to_row()]).await {
                    Ok(returned) => {
                        if !adopt_created(&[pending], &returned, resolution).is_empty() {
                            failures += 1;
                        }
                    }
                    Err(err) => {
                        failures += 1;
                        last_error = err.to_string();
                    }
                }
            }
            if failures > 0 {
                resolution.creation_failed(failures, format!("retry after conflict: {last_error}"));
            }
        }
        Err(err) => {
            resolution.creation_failed(missing.len(), format!("retry after conflict: {err}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe(attr: &'static str, value: &str) -> Probe {
        Probe {
            attr,
            value: value.to_string(),
        }
    }

    const PHARMACY_IDS: &[&str] = &["npi", "nabp", "name"];

    #[test]
    fn index_prefers_higher_priority_attributes() {
        let mut index = IdentityIndex::new(PHARMACY_IDS);
        index.insert(Target::Persisted(1), vec![probe("name", "main st")]);
        index.insert(
            Target::Persisted(2),
            vec![probe("npi", "1234567890"), probe("name", "other")],
        );

        let found = index.find(&[probe("npi", "1234567890"), probe("name", "main st")]);
        assert_eq!(found.map(|(_, t)| t), Some(Target::Persisted(2)));
    }

    #[test]
    fn index_refuses_to_merge_conflicting_identifiers_on_name() {
        let mut index = IdentityIndex::new(PHARMACY_IDS);
        index.insert(
            Target::Persisted(1),
            vec![probe("npi", "1111111111"), probe("name", "main st")],
        );

        let other_npi = [probe("npi", "2222222222"), probe("name", "main st")];
        assert_eq!(index.find(&other_npi), None);

        let name_only = [probe("name", "main st")];
        assert_eq!(index.find(&name_only).map(|(_, t)| t), Some(Target::Persisted(1)));
    }

    #[test]
    fn matched_rows_take_on_the_identifiers_they_were_matched_with() {
        let mut index = IdentityIndex::new(PHARMACY_IDS);
        let slot = index.insert(Target::Persisted(1), vec![probe("name", "walgreens")]);

        let first = [probe("npi", "1111111111"), probe("name", "walgreens")];
        assert_eq!(index.find(&first), Some((slot, Target::Persisted(1))));
        index.merge(slot, &first);

        let second = [probe("npi", "2222222222"), probe("name", "walgreens")];
        assert_eq!(index.find(&second), None);
        let by_npi = [probe("npi", "1111111111")];
        assert_eq!(index.find(&by_npi), Some((slot, Target::Persisted(1))));
    }

    #[test]
    fn refreshed_slots_are_reachable_by_new_attributes() {
        let mut index = IdentityIndex::new(PHARMACY_IDS);
        let slot = index.insert(Target::Pending(0), vec![probe("name", "main st")]);
        index.refresh(
            slot,
            vec![probe("npi", "1234567890"), probe("name", "main st")],
        );
        assert_eq!(
            index.find(&[probe("npi", "1234567890")]).map(|(_, t)| t),
            Some(Target::Pending(0))
        );
    }
}
