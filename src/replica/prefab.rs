//! Prefab Registry and scene definitions
//!
//! The registry is the build-time contract between peers: both sides register
//! the same templates in the same order, so a prefab index sent over the wire
//! resolves to the same behavior stack everywhere. Composite prefabs list the
//! behaviors of all their parts in one flattened sequence; the flattening
//! order is part of the contract.

use std::fmt;

use crate::replica::behavior::ReplicaBehavior;
use crate::replica::id::ReplicaId;
use crate::replica::replica::{Replica, ReplicaSettings, Role};

pub type BehaviorFactory = Box<dyn Fn() -> Box<dyn ReplicaBehavior>>;

/// Construction template for one replica kind
pub struct PrefabTemplate {
    pub name: String,
    pub settings: ReplicaSettings,
    pub replicate_only_to_owner: bool,
    factories: Vec<BehaviorFactory>,
}

impl PrefabTemplate {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            settings: ReplicaSettings::default(),
            replicate_only_to_owner: false,
            factories: Vec::new(),
        }
    }

    pub fn with_settings(mut self, settings: ReplicaSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn owner_only(mut self) -> Self {
        self.replicate_only_to_owner = true;
        self
    }

    /// Append a behavior slot. Call order defines slot indices.
    pub fn with_behavior<B, F>(mut self, factory: F) -> Self
    where
        B: ReplicaBehavior + 'static,
        F: Fn() -> B + 'static,
    {
        self.factories.push(Box::new(move || Box::new(factory())));
        self
    }

    pub fn behavior_count(&self) -> usize {
        self.factories.len()
    }

    /// Build a fresh replica with all behavior slots attached in order
    pub fn instantiate(&self, role: Role) -> Replica {
        let mut replica = Replica::new(role);
        replica.settings = self.settings.clone();
        replica.replicate_only_to_owner = self.replicate_only_to_owner;
        for factory in &self.factories {
            replica.attach_behavior(factory());
        }
        replica
    }
}

impl fmt::Debug for PrefabTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrefabTemplate")
            .field("name", &self.name)
            .field("behaviors", &self.factories.len())
            .finish()
    }
}

/// Registry of prefab templates; indices are assigned in registration order
/// and must match on every peer.
#[derive(Default)]
pub struct PrefabRegistry {
    templates: Vec<PrefabTemplate>,
}

impl PrefabRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a template and return its stable index
    pub fn register(&mut self, template: PrefabTemplate) -> u16 {
        assert!(self.templates.len() < usize::from(u16::MAX));
        self.templates.push(template);
        (self.templates.len() - 1) as u16
    }

    pub fn lookup(&self, prefab_idx: u16) -> Option<&PrefabTemplate> {
        self.templates.get(usize::from(prefab_idx))
    }

    /// Deterministic reverse lookup by template name
    pub fn index_of(&self, name: &str) -> Option<u16> {
        self.templates
            .iter()
            .position(|t| t.name == name)
            .map(|idx| idx as u16)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

/// One build-time scene replica entry
pub struct SceneEntry {
    pub scene_idx: u8,
    pub template: PrefabTemplate,
}

/// Build-time content of one scene: the replicas that exist identically on
/// every peer, keyed by their stable scene index (1..=255; 0 is unassigned).
#[derive(Default)]
pub struct SceneDefinition {
    entries: Vec<SceneEntry>,
}

impl SceneDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_replica(mut self, scene_idx: u8, template: PrefabTemplate) -> Self {
        self.entries.push(SceneEntry { scene_idx, template });
        self
    }

    /// Entries sorted by scene index, the registration order both peers use
    pub fn sorted_entries(&self) -> Vec<&SceneEntry> {
        let mut entries: Vec<&SceneEntry> = self.entries.iter().collect();
        entries.sort_by_key(|e| e.scene_idx);
        entries
    }
}

/// Register a scene's replicas into a manager's world. Shared by both
/// managers so ids come out identical with no handshake.
pub(crate) fn instantiate_scene_entry(entry: &SceneEntry, role: Role) -> Option<Replica> {
    if entry.scene_idx == 0 {
        tracing::warn!(
            name = %entry.template.name,
            "scene replica has no valid scene index; fix the scene content"
        );
        return None;
    }
    let mut replica = entry.template.instantiate(role);
    replica.scene_idx = entry.scene_idx;
    replica.id = ReplicaId::from_scene_index(entry.scene_idx);
    Some(replica)
}
