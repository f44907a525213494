//! Per-channel authoritative entity collection.
//!
//! Entities live in a flat map keyed by id; the section tree is implicit in
//! `parent_id` references. Cascade delete and cycle prevention are explicit
//! traversals over the flat list, never recursion over a pre-built tree.
//!
//! The store has no side effects beyond its in-memory structure; persistence
//! and broadcast are invoked by the orchestrating [`crate::channel`] layer.

use std::collections::{HashMap, HashSet, VecDeque};

use uuid::Uuid;

use crate::order;
use crate::protocol::{Entity, EntityId, EntityKind, EventPayload};

/// Store errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Add targeted an id already present
    DuplicateId(EntityId),
    /// Update/remove targeted an absent id
    NotFound(EntityId),
    /// Referenced parent does not exist in this store
    ParentNotFound(EntityId),
    /// Reparent would make the entity its own ancestor
    CycleDetected(EntityId),
    /// Merge would blank a required text field
    EmptyText,
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateId(id) => write!(f, "entity already exists: {id}"),
            Self::NotFound(id) => write!(f, "entity not found: {id}"),
            Self::ParentNotFound(id) => write!(f, "parent not found: {id}"),
            Self::CycleDetected(id) => write!(f, "reparent would create a cycle at: {id}"),
            Self::EmptyText => write!(f, "merge would blank a required text field"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Authoritative collection of one entity kind within one channel.
pub struct EntityStore {
    kind: EntityKind,
    entities: HashMap<EntityId, Entity>,
}

impl EntityStore {
    /// Create an empty store for the given entity kind.
    pub fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            entities: HashMap::new(),
        }
    }

    /// The entity kind this store holds.
    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    /// Number of entities.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Whether an id is present.
    pub fn contains(&self, id: &str) -> bool {
        self.entities.contains_key(id)
    }

    /// Get an entity by id.
    pub fn get(&self, id: &str) -> Result<&Entity, StoreError> {
        self.entities
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    /// Insert a new entity, appending it at the end of its sibling group.
    ///
    /// The entity's `order` is assigned here — creation order defines the
    /// position for first insertion. Fails on a duplicate id or a dangling
    /// parent reference.
    pub fn add(&mut self, mut entity: Entity) -> Result<&Entity, StoreError> {
        if self.entities.contains_key(&entity.id) {
            return Err(StoreError::DuplicateId(entity.id));
        }
        if let Some(parent) = &entity.data.parent_id {
            if !self.entities.contains_key(parent) {
                return Err(StoreError::ParentNotFound(parent.clone()));
            }
        }

        let siblings = self.list_children(entity.data.parent_id.as_deref());
        entity.data.order = order::next_order(&siblings);

        let id = entity.id.clone();
        self.entities.insert(id.clone(), entity);
        Ok(&self.entities[&id])
    }

    /// Insert a previously persisted entity, trusting its stored order.
    ///
    /// Used during rehydration, where records arrive in arbitrary order and
    /// parent references may resolve only after the full batch is loaded.
    pub fn insert_restored(&mut self, entity: Entity) -> Result<(), StoreError> {
        if self.entities.contains_key(&entity.id) {
            return Err(StoreError::DuplicateId(entity.id));
        }
        self.entities.insert(entity.id.clone(), entity);
        Ok(())
    }

    /// Merge a partial payload into an existing entity.
    ///
    /// Unspecified fields survive: a name-only patch leaves `order` and
    /// `parent_id` alone. A present `parent_id`/`order` relocates the entity
    /// through the same path as an explicit reorder.
    pub fn patch(
        &mut self,
        id: &str,
        payload: &EventPayload,
        owner: Uuid,
        event_ms: u64,
        server_ms: u64,
    ) -> Result<&Entity, StoreError> {
        if !self.entities.contains_key(id) {
            return Err(StoreError::NotFound(id.to_string()));
        }
        if let Some(name) = &payload.name {
            if name.trim().is_empty() {
                return Err(StoreError::EmptyText);
            }
        }

        if payload.parent_id.is_some() || payload.order.is_some() {
            self.relocate(id, payload.parent_id.clone(), payload.order)?;
        }

        // Checked present above; relocate does not remove entries.
        let entity = self
            .entities
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if let Some(name) = &payload.name {
            entity.data.name = name.clone();
        }
        entity.owner = owner;
        entity.last_event_ms = event_ms;
        entity.server_ms = server_ms;
        Ok(&self.entities[id])
    }

    /// Move an entity within or across sibling groups.
    ///
    /// `new_parent`: `None` keeps the current parent, `Some(None)` moves to
    /// root, `Some(Some(p))` reparents under `p`. `new_order` positions the
    /// entity within the target group; absent means append at the end.
    /// Both the old and the new sibling group are renumbered dense.
    pub fn reorder(
        &mut self,
        id: &str,
        payload: &EventPayload,
        owner: Uuid,
        event_ms: u64,
        server_ms: u64,
    ) -> Result<&Entity, StoreError> {
        if !self.entities.contains_key(id) {
            return Err(StoreError::NotFound(id.to_string()));
        }
        self.relocate(id, payload.parent_id.clone(), payload.order)?;

        let entity = self
            .entities
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        entity.owner = owner;
        entity.last_event_ms = event_ms;
        entity.server_ms = server_ms;
        Ok(&self.entities[id])
    }

    /// Remove an entity together with all of its descendants.
    ///
    /// The cascade is an explicit breadth-first traversal over the flat list:
    /// every entity whose `parent_id` chain resolves to the removed id goes
    /// with it, totally, never partially. The former sibling group is
    /// renumbered afterwards. Returns the removed entities.
    pub fn remove(&mut self, id: &str) -> Result<Vec<Entity>, StoreError> {
        if !self.entities.contains_key(id) {
            return Err(StoreError::NotFound(id.to_string()));
        }

        let mut doomed: HashSet<EntityId> = HashSet::new();
        let mut frontier: VecDeque<EntityId> = VecDeque::new();
        doomed.insert(id.to_string());
        frontier.push_back(id.to_string());

        while let Some(current) = frontier.pop_front() {
            for entity in self.entities.values() {
                if entity.data.parent_id.as_deref() == Some(current.as_str())
                    && doomed.insert(entity.id.clone())
                {
                    frontier.push_back(entity.id.clone());
                }
            }
        }

        let former_parent = self
            .entities
            .get(id)
            .and_then(|e| e.data.parent_id.clone());

        let mut removed: Vec<Entity> = Vec::with_capacity(doomed.len());
        for doomed_id in &doomed {
            if let Some(entity) = self.entities.remove(doomed_id) {
                removed.push(entity);
            }
        }

        self.renumber_group(former_parent.as_deref());
        Ok(removed)
    }

    /// Entities sharing the given parent, ordered ascending.
    ///
    /// `None` returns root-level entities (the whole list for goals).
    pub fn list_children(&self, parent: Option<&str>) -> Vec<&Entity> {
        let mut children: Vec<&Entity> = self
            .entities
            .values()
            .filter(|e| e.data.parent_id.as_deref() == parent)
            .collect();
        children.sort_by(|a, b| order::sibling_cmp(a, b));
        children
    }

    /// All entities, roots first, ordered ascending within each group.
    pub fn list_all(&self) -> Vec<&Entity> {
        let mut all: Vec<&Entity> = self.entities.values().collect();
        all.sort_by(|a, b| {
            let ka = (a.data.parent_id.is_some(), a.data.parent_id.as_deref());
            let kb = (b.data.parent_id.is_some(), b.data.parent_id.as_deref());
            ka.cmp(&kb).then_with(|| order::sibling_cmp(a, b))
        });
        all
    }

    /// Relocate `id` to a (possibly new) sibling group and position.
    ///
    /// Equivalent to removing the entity from its group, renumbering the
    /// survivors, then inserting at the target position and renumbering again.
    fn relocate(
        &mut self,
        id: &str,
        new_parent: Option<Option<EntityId>>,
        new_order: Option<u64>,
    ) -> Result<(), StoreError> {
        let old_parent = self
            .entities
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?
            .data
            .parent_id
            .clone();

        let target_parent = match &new_parent {
            Some(p) => p.clone(),
            None => old_parent.clone(),
        };

        if let Some(parent) = &target_parent {
            if !self.entities.contains_key(parent) {
                return Err(StoreError::ParentNotFound(parent.clone()));
            }
            self.check_cycle(id, parent)?;
        }

        // Detach: renumber the old group as if the entity were already gone.
        self.renumber_group_excluding(old_parent.as_deref(), Some(id));

        let group_len = self
            .entities
            .values()
            .filter(|e| e.id != id && e.data.parent_id.as_deref() == target_parent.as_deref())
            .count() as u64;

        // Explicit position clamped into the group; absent means append.
        let target_order = new_order.map(|o| o.min(group_len)).unwrap_or(group_len);

        // Open the slot: shift target-group siblings at or past the position.
        for entity in self.entities.values_mut() {
            if entity.id != id
                && entity.data.parent_id.as_deref() == target_parent.as_deref()
                && entity.data.order >= target_order
            {
                entity.data.order += 1;
            }
        }

        if let Some(entity) = self.entities.get_mut(id) {
            entity.data.parent_id = target_parent.clone();
            entity.data.order = target_order;
        }

        self.renumber_group(target_parent.as_deref());
        if old_parent.as_deref() != target_parent.as_deref() {
            self.renumber_group(old_parent.as_deref());
        }
        Ok(())
    }

    /// Reject a parent assignment that would make `id` its own ancestor.
    ///
    /// Walks the parent chain from `candidate` over the flat list; the chain
    /// is finite because existing state is acyclic.
    fn check_cycle(&self, id: &str, candidate: &str) -> Result<(), StoreError> {
        if candidate == id {
            return Err(StoreError::CycleDetected(id.to_string()));
        }
        let mut cursor = Some(candidate.to_string());
        while let Some(current) = cursor {
            if current == id {
                return Err(StoreError::CycleDetected(id.to_string()));
            }
            cursor = self
                .entities
                .get(&current)
                .and_then(|e| e.data.parent_id.clone());
        }
        Ok(())
    }

    /// Renumber one sibling group to a dense 0..n-1 sequence.
    fn renumber_group(&mut self, parent: Option<&str>) -> Vec<EntityId> {
        self.renumber_group_excluding(parent, None)
    }

    /// Renumber a sibling group, optionally pretending one member is absent.
    fn renumber_group_excluding(
        &mut self,
        parent: Option<&str>,
        exclude: Option<&str>,
    ) -> Vec<EntityId> {
        let mut group: Vec<&mut Entity> = self
            .entities
            .values_mut()
            .filter(|e| {
                e.data.parent_id.as_deref() == parent && Some(e.id.as_str()) != exclude
            })
            .collect();
        order::renumber(&mut group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::EntityData;

    fn section(id: &str, name: &str, parent: Option<&str>, ms: u64) -> Entity {
        Entity {
            id: id.into(),
            kind: EntityKind::Section,
            owner: Uuid::nil(),
            data: EntityData {
                name: name.into(),
                parent_id: parent.map(|p| p.to_string()),
                order: 0,
            },
            created_ms: ms,
            last_event_ms: ms,
            server_ms: ms,
        }
    }

    #[test]
    fn test_add_assigns_dense_orders() {
        let mut store = EntityStore::new(EntityKind::Section);
        store.add(section("x", "X", None, 1)).unwrap();
        store.add(section("y", "Y", None, 2)).unwrap();
        store.add(section("z", "Z", None, 3)).unwrap();

        let roots = store.list_children(None);
        let orders: Vec<u64> = roots.iter().map(|e| e.data.order).collect();
        assert_eq!(orders, vec![0, 1, 2]);
        assert_eq!(roots[0].id, "x");
        assert_eq!(roots[2].id, "z");
    }

    #[test]
    fn test_add_duplicate_rejected() {
        let mut store = EntityStore::new(EntityKind::Section);
        store.add(section("a", "A", None, 1)).unwrap();
        let err = store.add(section("a", "A again", None, 2)).unwrap_err();
        assert_eq!(err, StoreError::DuplicateId("a".into()));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_add_dangling_parent_rejected() {
        let mut store = EntityStore::new(EntityKind::Section);
        let err = store.add(section("b", "B", Some("ghost"), 1)).unwrap_err();
        assert_eq!(err, StoreError::ParentNotFound("ghost".into()));
        assert!(store.is_empty());
    }

    #[test]
    fn test_get_not_found() {
        let store = EntityStore::new(EntityKind::Goal);
        assert_eq!(
            store.get("missing").unwrap_err(),
            StoreError::NotFound("missing".into())
        );
    }

    #[test]
    fn test_patch_preserves_unspecified_fields() {
        let mut store = EntityStore::new(EntityKind::Section);
        store.add(section("a", "Root", None, 1)).unwrap();
        store.add(section("b", "Child", Some("a"), 2)).unwrap();

        let user = Uuid::new_v4();
        store
            .patch("b", &EventPayload::named("Renamed Child"), user, 10, 11)
            .unwrap();

        let b = store.get("b").unwrap();
        assert_eq!(b.data.name, "Renamed Child");
        assert_eq!(b.data.parent_id.as_deref(), Some("a"));
        assert_eq!(b.data.order, 0);
        assert_eq!(b.owner, user);
        assert_eq!(b.last_event_ms, 10);
        assert_eq!(b.server_ms, 11);
    }

    #[test]
    fn test_patch_empty_name_leaves_prior_value() {
        let mut store = EntityStore::new(EntityKind::Section);
        store.add(section("a", "Original", None, 1)).unwrap();

        let err = store
            .patch("a", &EventPayload::named("   "), Uuid::nil(), 2, 3)
            .unwrap_err();
        assert_eq!(err, StoreError::EmptyText);
        assert_eq!(store.get("a").unwrap().data.name, "Original");
    }

    #[test]
    fn test_patch_not_found() {
        let mut store = EntityStore::new(EntityKind::Section);
        let err = store
            .patch("nope", &EventPayload::named("x"), Uuid::nil(), 1, 2)
            .unwrap_err();
        assert_eq!(err, StoreError::NotFound("nope".into()));
    }

    #[test]
    fn test_remove_cascades_to_all_descendants() {
        let mut store = EntityStore::new(EntityKind::Section);
        store.add(section("a", "Root", None, 1)).unwrap();
        store.add(section("b", "Child", Some("a"), 2)).unwrap();
        store.add(section("c", "Grandchild", Some("b"), 3)).unwrap();
        store.add(section("d", "Other root", None, 4)).unwrap();

        let removed = store.remove("a").unwrap();
        let mut removed_ids: Vec<&str> = removed.iter().map(|e| e.id.as_str()).collect();
        removed_ids.sort();
        assert_eq!(removed_ids, vec!["a", "b", "c"]);

        assert_eq!(store.len(), 1);
        assert!(store.contains("d"));
        // Survivor renumbers to the front of the root group
        assert_eq!(store.get("d").unwrap().data.order, 0);
    }

    #[test]
    fn test_remove_middle_sibling_renumbers() {
        let mut store = EntityStore::new(EntityKind::Section);
        store.add(section("x", "X", None, 1)).unwrap();
        store.add(section("y", "Y", None, 2)).unwrap();
        store.add(section("z", "Z", None, 3)).unwrap();

        store.remove("y").unwrap();
        assert_eq!(store.get("x").unwrap().data.order, 0);
        assert_eq!(store.get("z").unwrap().data.order, 1);

        store.add(section("w", "W", None, 4)).unwrap();
        assert_eq!(store.get("w").unwrap().data.order, 2);
    }

    #[test]
    fn test_remove_not_found() {
        let mut store = EntityStore::new(EntityKind::Section);
        assert_eq!(
            store.remove("ghost").unwrap_err(),
            StoreError::NotFound("ghost".into())
        );
    }

    #[test]
    fn test_concrete_scenario_root_child_rename_delete() {
        let mut store = EntityStore::new(EntityKind::Section);
        let user = Uuid::new_v4();

        store.add(section("A", "Root", None, 1)).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("A").unwrap().data.order, 0);

        store.add(section("B", "Child", Some("A"), 2)).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.get("B").unwrap().data.order, 0);

        store
            .patch("A", &EventPayload::named("Renamed Root"), user, 3, 4)
            .unwrap();
        let a = store.get("A").unwrap();
        assert_eq!(a.data.name, "Renamed Root");
        assert_eq!(a.data.parent_id, None);

        store.remove("A").unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_reorder_within_group() {
        let mut store = EntityStore::new(EntityKind::Goal);
        store.add(section("g1", "First", None, 1)).unwrap();
        store.add(section("g2", "Second", None, 2)).unwrap();
        store.add(section("g3", "Third", None, 3)).unwrap();

        // Move g3 to the front
        store
            .reorder("g3", &EventPayload::at_order(0), Uuid::nil(), 4, 5)
            .unwrap();

        let ids: Vec<&str> = store.list_children(None).iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["g3", "g1", "g2"]);
        let orders: Vec<u64> = store.list_children(None).iter().map(|e| e.data.order).collect();
        assert_eq!(orders, vec![0, 1, 2]);
    }

    #[test]
    fn test_reorder_reparents_and_renumbers_both_groups() {
        let mut store = EntityStore::new(EntityKind::Section);
        store.add(section("a", "A", None, 1)).unwrap();
        store.add(section("b", "B", None, 2)).unwrap();
        store.add(section("c", "C", None, 3)).unwrap();

        // Move b under a
        let payload = EventPayload {
            parent_id: Some(Some("a".into())),
            order: None,
            name: None,
        };
        store.reorder("b", &payload, Uuid::nil(), 4, 5).unwrap();

        assert_eq!(store.get("b").unwrap().data.parent_id.as_deref(), Some("a"));
        assert_eq!(store.get("b").unwrap().data.order, 0);
        // Old root group closed the gap
        assert_eq!(store.get("a").unwrap().data.order, 0);
        assert_eq!(store.get("c").unwrap().data.order, 1);
    }

    #[test]
    fn test_reparent_to_root() {
        let mut store = EntityStore::new(EntityKind::Section);
        store.add(section("a", "A", None, 1)).unwrap();
        store.add(section("b", "B", Some("a"), 2)).unwrap();

        let payload = EventPayload {
            parent_id: Some(None),
            order: None,
            name: None,
        };
        store.reorder("b", &payload, Uuid::nil(), 3, 4).unwrap();

        assert_eq!(store.get("b").unwrap().data.parent_id, None);
        assert_eq!(store.get("b").unwrap().data.order, 1);
    }

    #[test]
    fn test_cycle_rejected() {
        let mut store = EntityStore::new(EntityKind::Section);
        store.add(section("a", "A", None, 1)).unwrap();
        store.add(section("b", "B", Some("a"), 2)).unwrap();
        store.add(section("c", "C", Some("b"), 3)).unwrap();

        // a under its own grandchild
        let payload = EventPayload {
            parent_id: Some(Some("c".into())),
            order: None,
            name: None,
        };
        let err = store.reorder("a", &payload, Uuid::nil(), 4, 5).unwrap_err();
        assert_eq!(err, StoreError::CycleDetected("a".into()));

        // Self-parent
        let payload = EventPayload {
            parent_id: Some(Some("a".into())),
            order: None,
            name: None,
        };
        let err = store.reorder("a", &payload, Uuid::nil(), 6, 7).unwrap_err();
        assert_eq!(err, StoreError::CycleDetected("a".into()));
    }

    #[test]
    fn test_list_all_roots_first() {
        let mut store = EntityStore::new(EntityKind::Section);
        store.add(section("a", "A", None, 1)).unwrap();
        store.add(section("b", "B", Some("a"), 2)).unwrap();
        store.add(section("c", "C", None, 3)).unwrap();

        let all = store.list_all();
        assert_eq!(all.len(), 3);
        assert!(all[0].data.parent_id.is_none());
        assert!(all[1].data.parent_id.is_none());
        assert_eq!(all[2].id, "b");
    }

    #[test]
    fn test_insert_restored_keeps_order() {
        let mut store = EntityStore::new(EntityKind::Section);
        // Child record arrives before its parent — rehydration must tolerate it
        let mut child = section("b", "B", Some("a"), 2);
        child.data.order = 0;
        let mut root = section("a", "A", None, 1);
        root.data.order = 3;

        store.insert_restored(child).unwrap();
        store.insert_restored(root).unwrap();

        assert_eq!(store.get("a").unwrap().data.order, 3);
        assert_eq!(store.get("b").unwrap().data.parent_id.as_deref(), Some("a"));
    }
}
