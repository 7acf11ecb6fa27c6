//! Databases and their vgroup index.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use strata_config::DatabaseConfig;
use strata_types::VGroupId;

/// A live database.
///
/// The vgroup index is ordered by placement preference: the head is where
/// the next table goes, full vgroups are pushed to the tail.
#[derive(Debug)]
pub struct Database {
    pub name: String,
    cfg: RwLock<DatabaseConfig>,
    vgroups: Mutex<VecDeque<VGroupId>>,
}

impl Database {
    pub fn new(name: impl Into<String>, cfg: DatabaseConfig) -> Self {
        Self {
            name: name.into(),
            cfg: RwLock::new(cfg),
            vgroups: Mutex::new(VecDeque::new()),
        }
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> DatabaseConfig {
        self.cfg.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Per-vgroup table capacity.
    pub fn max_tables_per_vgroup(&self) -> u32 {
        self.cfg
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .max_tables_per_vgroup
    }

    pub fn replications(&self) -> u8 {
        self.cfg
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .replications
    }

    /// Replaces the configuration. Existing vgroups pick up a new capacity
    /// on their next update.
    pub fn alter_config(&self, cfg: DatabaseConfig) {
        *self.cfg.write().unwrap_or_else(PoisonError::into_inner) = cfg;
    }

    pub(crate) fn link_vgroup(&self, vg_id: VGroupId) {
        let mut index = self.index();
        if !index.contains(&vg_id) {
            index.push_front(vg_id);
        }
    }

    pub(crate) fn unlink_vgroup(&self, vg_id: VGroupId) {
        self.index().retain(|id| *id != vg_id);
    }

    /// Moves a vgroup to the tail of the index. No-op if it is not linked.
    pub(crate) fn move_to_tail(&self, vg_id: VGroupId) {
        let mut index = self.index();
        if let Some(pos) = index.iter().position(|id| *id == vg_id) {
            index.remove(pos);
            index.push_back(vg_id);
        }
    }

    /// Preferred placement target.
    pub fn head(&self) -> Option<VGroupId> {
        self.index().front().copied()
    }

    /// Vgroup ids from head to tail.
    pub fn vgroup_ids(&self) -> Vec<VGroupId> {
        self.index().iter().copied().collect()
    }

    pub fn vgroup_count(&self) -> usize {
        self.index().len()
    }

    fn index(&self) -> std::sync::MutexGuard<'_, VecDeque<VGroupId>> {
        self.vgroups.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Keyed lookup of live databases.
#[derive(Debug, Default)]
pub struct DatabaseRegistry {
    dbs: RwLock<BTreeMap<String, Arc<Database>>>,
}

impl DatabaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates (or replaces) a database.
    pub fn create(&self, name: impl Into<String>, cfg: DatabaseConfig) -> Arc<Database> {
        let db = Arc::new(Database::new(name, cfg));
        self.dbs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(db.name.clone(), Arc::clone(&db));
        db
    }

    pub fn get(&self, name: &str) -> Option<Arc<Database>> {
        self.dbs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn remove(&self, name: &str) -> Option<Arc<Database>> {
        self.dbs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vg(id: u32) -> VGroupId {
        VGroupId::new(id)
    }

    #[test]
    fn new_vgroups_link_at_head() {
        let db = Database::new("db1", DatabaseConfig::default());
        db.link_vgroup(vg(1));
        db.link_vgroup(vg(2));
        db.link_vgroup(vg(2));
        assert_eq!(db.vgroup_ids(), vec![vg(2), vg(1)]);
        assert_eq!(db.head(), Some(vg(2)));
    }

    #[test]
    fn move_to_tail_and_unlink() {
        let db = Database::new("db1", DatabaseConfig::default());
        for id in 1..=3 {
            db.link_vgroup(vg(id));
        }
        db.move_to_tail(vg(3));
        assert_eq!(db.vgroup_ids(), vec![vg(2), vg(1), vg(3)]);

        db.unlink_vgroup(vg(1));
        db.move_to_tail(vg(9));
        assert_eq!(db.vgroup_ids(), vec![vg(2), vg(3)]);
    }

    #[test]
    fn alter_config_is_visible() {
        let registry = DatabaseRegistry::new();
        let db = registry.create("db1", DatabaseConfig::default());
        db.alter_config(DatabaseConfig {
            max_tables_per_vgroup: 8,
            ..DatabaseConfig::default()
        });
        assert_eq!(registry.get("db1").map(|d| d.max_tables_per_vgroup()), Some(8));
        assert!(registry.remove("db1").is_some());
        assert!(registry.get("db1").is_none());
    }
}
