//! Entity state reconciler.
//!
//! Cached members and bets are held as JSON field maps. Baseline state is
//! installed by [`EntityCache::hydrate`]; push events then merge partial
//! patches field by field, last write wins by [`OrderingKey`].

use crate::clock::Clock;
use crate::error::{Result, SyncError};
use common::{Entity, EntityRef};
use dashmap::DashMap;
use metrics::counter;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Position of a write in the event stream.
///
/// Ordered by session epoch, then sequence. A later epoch always orders
/// after an earlier one even though sequence numbering restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OrderingKey {
    /// Client-side epoch, incremented on every successful authentication.
    pub session: u64,
    /// Server sequence within the session.
    pub sequence: u64,
}

impl OrderingKey {
    pub fn new(session: u64, sequence: u64) -> Self {
        Self { session, sequence }
    }

    /// Whether a write at `self` supersedes one at `other`.
    pub fn newer_than(&self, other: &OrderingKey) -> bool {
        self > other
    }

    fn max_with(self, other: Option<OrderingKey>) -> OrderingKey {
        other.map_or(self, |other| self.max(other))
    }
}

/// Result of applying one patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Patch merged; `fields` is the number of fields written.
    Applied { fields: usize },
    /// Every field already holds a newer write.
    Stale,
    /// Entity not in the cache; patch discarded.
    Missing,
}

/// One cached record.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedEntity {
    pub entity: EntityRef,
    pub fields: Map<String, Value>,
    /// Newest write applied to any field.
    pub last_applied: Option<OrderingKey>,
    /// Key of the write that last set each field.
    pub field_keys: HashMap<String, OrderingKey>,
    /// Local wall-clock time of the last change.
    pub updated_at_ms: i64,
}

impl CachedEntity {
    /// Read one field.
    pub fn get<T: DeserializeOwned>(&self, field: &str) -> Option<T> {
        self.fields
            .get(field)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    /// Rebuild the typed record.
    pub fn to_typed<E: Entity>(&self) -> Result<E> {
        Ok(serde_json::from_value(Value::Object(self.fields.clone()))?)
    }
}

/// Concurrent cache of reconciled entities.
pub struct EntityCache {
    entries: DashMap<EntityRef, CachedEntity>,
    clock: Arc<dyn Clock>,
}

impl EntityCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Install baseline state fetched from the server.
    ///
    /// `as_of` is the stream position the snapshot reflects. Fields patched
    /// by a newer write since then keep their cached value.
    pub fn hydrate<E: Entity>(&self, entity: &E, as_of: Option<OrderingKey>) -> Result<()> {
        let key = entity.entity_ref();
        let fields = match serde_json::to_value(entity)? {
            Value::Object(fields) => fields,
            other => {
                return Err(SyncError::InvalidEntity(format!(
                    "{} serialized to {}, expected an object",
                    key, other
                )))
            }
        };
        let now = self.clock.now_ms();

        let mut entry = self.entries.entry(key.clone()).or_insert_with(|| CachedEntity {
            entity: key.clone(),
            fields: Map::new(),
            last_applied: None,
            field_keys: HashMap::new(),
            updated_at_ms: now,
        });
        let cached = entry.value_mut();

        let mut kept = 0;
        for (field, value) in fields {
            let newer = match (cached.field_keys.get(&field), as_of) {
                (Some(existing), Some(as_of)) => existing.newer_than(&as_of),
                _ => false,
            };
            if newer {
                kept += 1;
                continue;
            }
            match as_of {
                Some(as_of) => cached.field_keys.insert(field.clone(), as_of),
                None => cached.field_keys.remove(&field),
            };
            cached.fields.insert(field, value);
        }

        if let Some(as_of) = as_of {
            cached.last_applied = Some(as_of.max_with(cached.last_applied));
        }
        cached.updated_at_ms = now;

        debug!(entity = %key, kept, "Hydrated entity");
        Ok(())
    }

    /// Merge `patch` into the cached entity.
    pub fn apply(
        &self,
        key: &EntityRef,
        patch: &Map<String, Value>,
        ordering: OrderingKey,
    ) -> ApplyOutcome {
        let Some(mut entry) = self.entries.get_mut(key) else {
            debug!(entity = %key, "Patch for uncached entity discarded");
            return ApplyOutcome::Missing;
        };
        let cached = entry.value_mut();

        let mut written = 0;
        for (field, value) in patch {
            let supersedes = cached
                .field_keys
                .get(field)
                .map_or(true, |existing| ordering.newer_than(existing));
            if supersedes {
                cached.fields.insert(field.clone(), value.clone());
                cached.field_keys.insert(field.clone(), ordering);
                written += 1;
            }
        }

        let entity_newer = cached
            .last_applied
            .is_some_and(|last| !ordering.newer_than(&last));
        if written == 0 && (entity_newer || !patch.is_empty()) {
            counter!("sync_patches_stale_total").increment(1);
            debug!(entity = %key, ?ordering, "Stale patch discarded");
            return ApplyOutcome::Stale;
        }

        cached.last_applied = Some(ordering.max_with(cached.last_applied));
        cached.updated_at_ms = self.clock.now_ms();
        counter!("sync_patches_applied_total").increment(1);
        ApplyOutcome::Applied { fields: written }
    }

    /// Snapshot of one cached entity.
    pub fn get(&self, key: &EntityRef) -> Option<CachedEntity> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Typed snapshot of one cached entity.
    pub fn get_typed<E: Entity>(&self, id: &str) -> Result<Option<E>> {
        let key = EntityRef {
            kind: E::KIND,
            id: id.to_string(),
        };
        self.get(&key).map(|cached| cached.to_typed()).transpose()
    }

    pub fn contains(&self, key: &EntityRef) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use common::{Member, MemberStatus};
    use rust_decimal::Decimal;
    use serde_json::json;

    fn cache() -> (EntityCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000));
        (EntityCache::new(clock.clone()), clock)
    }

    fn member(id: &str) -> Member {
        Member {
            id: id.to_string(),
            username: format!("user-{}", id),
            agent_id: Some("a1".to_string()),
            balance: Decimal::from(100),
            available_balance: Decimal::from(100),
            rolling_percent: Decimal::ZERO,
            rolling_amount: Decimal::ZERO,
            status: MemberStatus::Active,
        }
    }

    fn seq(sequence: u64) -> OrderingKey {
        OrderingKey::new(1, sequence)
    }

    fn patch(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("patch must be an object"),
        }
    }

    #[test]
    fn test_ordering_key_comparison() {
        assert!(seq(5).newer_than(&seq(4)));
        assert!(!seq(4).newer_than(&seq(4)));
        let next_session = OrderingKey::new(2, 1);
        assert!(next_session.newer_than(&seq(900)));
        assert!(!seq(900).newer_than(&next_session));
    }

    #[test]
    fn test_missing_entity() {
        let (cache, _) = cache();
        let outcome = cache.apply(
            &EntityRef::member("m1"),
            &patch(json!({"balance": "5"})),
            seq(1),
        );
        assert_eq!(outcome, ApplyOutcome::Missing);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_merge_preserves_other_fields() {
        let (cache, clock) = cache();
        cache.hydrate(&member("m1"), None).unwrap();
        clock.advance(500);

        let outcome = cache.apply(
            &EntityRef::member("m1"),
            &patch(json!({"balance": "150.25"})),
            seq(1),
        );
        assert_eq!(outcome, ApplyOutcome::Applied { fields: 1 });

        let updated: Member = cache.get_typed("m1").unwrap().unwrap();
        assert_eq!(updated.balance.to_string(), "150.25");
        assert_eq!(updated.username, "user-m1");
        assert_eq!(updated.agent_id.as_deref(), Some("a1"));

        let cached = cache.get(&EntityRef::member("m1")).unwrap();
        assert_eq!(cached.last_applied, Some(seq(1)));
        assert_eq!(cached.updated_at_ms, 1_500);
    }

    #[test]
    fn test_reapply_is_noop() {
        let (cache, _) = cache();
        cache.hydrate(&member("m1"), None).unwrap();
        let key = EntityRef::member("m1");
        let p = patch(json!({"balance": "7"}));

        assert_eq!(cache.apply(&key, &p, seq(3)), ApplyOutcome::Applied { fields: 1 });
        let before = cache.get(&key).unwrap();
        assert_eq!(cache.apply(&key, &p, seq(3)), ApplyOutcome::Stale);
        assert_eq!(cache.get(&key).unwrap(), before);
    }

    #[test]
    fn test_older_patch_rejected_for_same_field() {
        let (cache, _) = cache();
        cache.hydrate(&member("m1"), None).unwrap();
        let key = EntityRef::member("m1");

        cache.apply(&key, &patch(json!({"balance": "20"})), seq(7));
        assert_eq!(
            cache.apply(&key, &patch(json!({"balance": "10"})), seq(4)),
            ApplyOutcome::Stale
        );
        let cached = cache.get(&key).unwrap();
        assert_eq!(cached.get::<String>("balance").as_deref(), Some("20"));
        assert_eq!(cached.last_applied, Some(seq(7)));
    }

    #[test]
    fn test_backfill_converges_to_in_order_state() {
        let events = [
            (1, json!({"balance": "110"})),
            (2, json!({"rolling_amount": "1.5"})),
            (3, json!({"status": "suspended"})),
            (4, json!({"balance": "90"})),
            (5, json!({"rolling_percent": "0.8"})),
            (6, json!({"balance": "95"})),
        ];

        let (in_order, _) = cache();
        in_order.hydrate(&member("m1"), None).unwrap();
        for (sequence, p) in &events {
            in_order.apply(&EntityRef::member("m1"), &patch(p.clone()), seq(*sequence));
        }

        let (backfilled, _) = cache();
        backfilled.hydrate(&member("m1"), None).unwrap();
        for index in [0, 1, 4, 5, 2, 3] {
            let (sequence, p) = &events[index];
            backfilled.apply(&EntityRef::member("m1"), &patch(p.clone()), seq(*sequence));
        }

        let expected: Member = in_order.get_typed("m1").unwrap().unwrap();
        let actual: Member = backfilled.get_typed("m1").unwrap().unwrap();
        assert_eq!(actual, expected);
        assert_eq!(actual.balance.to_string(), "95");
        assert_eq!(actual.status, MemberStatus::Suspended);
    }

    #[test]
    fn test_hydrate_keeps_newer_patched_fields() {
        let (cache, _) = cache();
        let key = EntityRef::member("m1");
        cache.hydrate(&member("m1"), None).unwrap();
        cache.apply(&key, &patch(json!({"balance": "300"})), seq(10));

        let mut snapshot = member("m1");
        snapshot.username = "renamed".to_string();
        cache.hydrate(&snapshot, Some(seq(8))).unwrap();

        let cached: Member = cache.get_typed("m1").unwrap().unwrap();
        assert_eq!(cached.balance.to_string(), "300");
        assert_eq!(cached.username, "renamed");

        // Snapshot fields now carry the snapshot's position.
        assert_eq!(
            cache.apply(&key, &patch(json!({"username": "late"})), seq(5)),
            ApplyOutcome::Stale
        );
    }
}
