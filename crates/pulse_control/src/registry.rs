//! Plugin Registry
//!
//! Running instances grouped into pools by plugin key, with one table per
//! plugin type. The registry guard must be held across any sequence that
//! reads pool state and then acts on it.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::{AvailablePlugin, ControlError, ControlResult, PluginKey, PluginType};

// ─────────────────────────────────────────────────────────────────────────────
// Plugin Pool
// ─────────────────────────────────────────────────────────────────────────────

/// Running instances of one plugin key
#[derive(Debug)]
pub struct PluginPool {
    key: PluginKey,
    plugins: Vec<Arc<AvailablePlugin>>,
}

impl PluginPool {
    pub fn new(key: PluginKey) -> Self {
        Self {
            key,
            plugins: Vec::new(),
        }
    }

    pub fn key(&self) -> &PluginKey {
        &self.key
    }

    pub fn count(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.plugins.iter().any(|p| p.id() == id)
    }

    pub fn insert(&mut self, plugin: Arc<AvailablePlugin>) {
        self.plugins.push(plugin);
    }

    /// Remove the instance with `id`, returning it if it was present
    pub fn remove(&mut self, id: u64) -> Option<Arc<AvailablePlugin>> {
        let idx = self.plugins.iter().position(|p| p.id() == id)?;
        Some(self.plugins.remove(idx))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<AvailablePlugin>> {
        self.plugins.iter()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Plugin Table
// ─────────────────────────────────────────────────────────────────────────────

/// All pools of one plugin type
#[derive(Debug, Default)]
pub struct PluginTable {
    pools: BTreeMap<PluginKey, PluginPool>,
}

impl PluginTable {
    /// `None` means no instance of `key` is running yet
    pub fn get_plugin_pool(&self, key: &PluginKey) -> Option<&PluginPool> {
        self.pools.get(key)
    }

    pub fn pools(&self) -> impl Iterator<Item = &PluginPool> {
        self.pools.values()
    }

    pub fn plugins(&self) -> impl Iterator<Item = &Arc<AvailablePlugin>> {
        self.pools.values().flat_map(PluginPool::iter)
    }

    pub fn len(&self) -> usize {
        self.pools.values().map(PluginPool::count).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    fn insert(&mut self, plugin: Arc<AvailablePlugin>) {
        self.pools
            .entry(plugin.key().clone())
            .or_insert_with(|| PluginPool::new(plugin.key().clone()))
            .insert(plugin);
    }

    fn remove(&mut self, plugin: &AvailablePlugin) -> ControlResult<Arc<AvailablePlugin>> {
        let not_found = || ControlError::NotFound {
            key: plugin.key().clone(),
            id: plugin.id(),
        };

        let pool = self.pools.get_mut(plugin.key()).ok_or_else(not_found)?;
        let removed = pool.remove(plugin.id()).ok_or_else(not_found)?;
        if pool.is_empty() {
            self.pools.remove(plugin.key());
        }
        Ok(removed)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Registry Tables
// ─────────────────────────────────────────────────────────────────────────────

/// The registry contents, reachable only through `PluginRegistry::lock`
#[derive(Debug, Default)]
pub struct RegistryTables {
    pub collectors: PluginTable,
    pub processors: PluginTable,
    pub publishers: PluginTable,
}

impl RegistryTables {
    pub fn table_for(&self, plugin_type: PluginType) -> &PluginTable {
        match plugin_type {
            PluginType::Collector => &self.collectors,
            PluginType::Processor => &self.processors,
            PluginType::Publisher => &self.publishers,
        }
    }

    fn table_for_mut(&mut self, plugin_type: PluginType) -> &mut PluginTable {
        match plugin_type {
            PluginType::Collector => &mut self.collectors,
            PluginType::Processor => &mut self.processors,
            PluginType::Publisher => &mut self.publishers,
        }
    }

    /// Pool for `key`, looked up in the table of the key's plugin type
    pub fn get_plugin_pool(&self, key: &PluginKey) -> Option<&PluginPool> {
        self.table_for(key.plugin_type).get_plugin_pool(key)
    }

    pub fn insert(&mut self, plugin: Arc<AvailablePlugin>) {
        self.table_for_mut(plugin.key().plugin_type).insert(plugin);
    }

    /// Remove `plugin` from its pool; other pools are never touched
    pub fn remove(&mut self, plugin: &AvailablePlugin) -> ControlResult<Arc<AvailablePlugin>> {
        self.table_for_mut(plugin.key().plugin_type).remove(plugin)
    }

    /// Every instance across all types
    pub fn table(&self) -> Vec<Arc<AvailablePlugin>> {
        PluginType::ALL
            .iter()
            .flat_map(|t| self.table_for(*t).plugins().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        PluginType::ALL.iter().map(|t| self.table_for(*t).len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Plugin Registry
// ─────────────────────────────────────────────────────────────────────────────

/// Shared registry of running instances
///
/// Single-step helpers (`insert`, `remove`, `table`, `count`) lock for the
/// duration of the call. Use `lock` to make a check-then-act sequence atomic.
/// The guard must not be held across an `.await`.
#[derive(Debug, Default)]
pub struct PluginRegistry {
    tables: Mutex<RegistryTables>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Exclusive access until the guard is dropped
    pub fn lock(&self) -> MutexGuard<'_, RegistryTables> {
        self.tables.lock()
    }

    pub fn insert(&self, plugin: Arc<AvailablePlugin>) {
        self.lock().insert(plugin);
    }

    pub fn remove(&self, plugin: &AvailablePlugin) -> ControlResult<Arc<AvailablePlugin>> {
        self.lock().remove(plugin)
    }

    pub fn table(&self) -> Vec<Arc<AvailablePlugin>> {
        self.lock().table()
    }

    /// Number of instances running for `key`
    pub fn count(&self, key: &PluginKey) -> usize {
        self.lock().get_plugin_pool(key).map_or(0, PluginPool::count)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockClient;

    fn ap(id: u64, key: &PluginKey) -> Arc<AvailablePlugin> {
        Arc::new(AvailablePlugin::new(id, key.clone(), MockClient::healthy()))
    }

    #[test]
    fn test_insert_buckets_by_key_and_type() {
        let registry = PluginRegistry::new();
        let foo = PluginKey::new(PluginType::Collector, "foo", 1);
        let foo2 = PluginKey::new(PluginType::Collector, "foo", 2);
        let bar = PluginKey::new(PluginType::Publisher, "bar", 1);

        registry.insert(ap(1, &foo));
        registry.insert(ap(2, &foo));
        registry.insert(ap(3, &foo2));
        registry.insert(ap(4, &bar));

        let tables = registry.lock();
        assert_eq!(tables.collectors.get_plugin_pool(&foo).map(PluginPool::count), Some(2));
        assert_eq!(tables.collectors.get_plugin_pool(&foo2).map(PluginPool::count), Some(1));
        assert!(tables.collectors.get_plugin_pool(&bar).is_none());
        assert_eq!(tables.publishers.get_plugin_pool(&bar).map(PluginPool::count), Some(1));
        assert!(tables.processors.is_empty());
        assert_eq!(tables.len(), 4);
    }

    #[test]
    fn test_table_spans_all_types() {
        let registry = PluginRegistry::new();
        for (id, t) in PluginType::ALL.into_iter().enumerate() {
            registry.insert(ap(id as u64 + 1, &PluginKey::new(t, "p", 1)));
        }

        let mut ids: Vec<u64> = registry.table().iter().map(|p| p.id()).collect();
        ids.sort();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_remove_drops_empty_pool() {
        let registry = PluginRegistry::new();
        let key = PluginKey::new(PluginType::Processor, "passthru", 1);
        let plugin = ap(1, &key);
        registry.insert(plugin.clone());

        let removed = registry.remove(&plugin).unwrap();
        assert_eq!(removed.id(), 1);
        assert!(registry.lock().get_plugin_pool(&key).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_remove_missing_is_not_found_and_leaves_other_pools() {
        let registry = PluginRegistry::new();
        let foo = PluginKey::new(PluginType::Collector, "foo", 1);
        let bar = PluginKey::new(PluginType::Publisher, "bar", 1);
        registry.insert(ap(1, &foo));
        registry.insert(ap(2, &bar));

        // same key as a live pool, unknown id
        let stray = ap(99, &foo);
        let err = registry.remove(&stray).unwrap_err();
        assert!(matches!(err, ControlError::NotFound { id: 99, .. }));

        // key with no pool at all
        let ghost = ap(100, &PluginKey::new(PluginType::Collector, "ghost", 1));
        assert!(matches!(
            registry.remove(&ghost),
            Err(ControlError::NotFound { id: 100, .. })
        ));

        assert_eq!(registry.count(&foo), 1);
        assert_eq!(registry.count(&bar), 1);
    }

    #[test]
    fn test_locked_check_then_insert_never_exceeds_limit() {
        let registry = PluginRegistry::new_shared();
        let key = PluginKey::new(PluginType::Collector, "foo", 1);
        let ids = Arc::new(crate::IdAllocator::new());

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let ids = Arc::clone(&ids);
                let key = key.clone();
                std::thread::spawn(move || {
                    let mut tables = registry.lock();
                    let count = tables.get_plugin_pool(&key).map_or(0, PluginPool::count);
                    if count < 3 {
                        tables.insert(ap(ids.next(), &key));
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(registry.count(&key), 3);
    }
}
