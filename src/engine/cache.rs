use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::core::ArcStr;
use crate::engine::datatype::Registry;
use crate::entity::DataEntity;
use crate::key::CacheKey;
use crate::source::{Dataset, Model};

/// A loaded dataset and its session state.
#[derive(Clone)]
pub struct DatasetEntry {
    pub dataset: Arc<dyn Dataset>,
    pub active: bool,
    /// Stable position in load order, for colour assignment.
    pub color_index: usize,
}

impl std::fmt::Debug for DatasetEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatasetEntry")
            .field("fingerprint", &self.dataset.fingerprint())
            .field("active", &self.active)
            .field("color_index", &self.color_index)
            .finish()
    }
}

struct Shared {
    registry: Arc<Registry>,
    entries: RwLock<HashMap<CacheKey, Arc<DataEntity>>>,
    datasets: RwLock<BTreeMap<ArcStr, DatasetEntry>>,
    models: RwLock<BTreeMap<ArcStr, Arc<dyn Model>>>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// The cache, together with the datasets and models its keys refer to.
///
/// Cloning is cheap and every clone sees the same state, which lets worker
/// threads read while producing. Writes are crate-private and only issued by
/// the owning [`Environment`](crate::Environment) on the main thread.
#[derive(Clone)]
pub struct Catalog {
    shared: Arc<Shared>,
}

impl Catalog {
    pub(crate) fn new(registry: Registry) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry: Arc::new(registry),
                entries: RwLock::default(),
                datasets: RwLock::default(),
                models: RwLock::default(),
            }),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.shared.registry
    }

    /// Entry for `key`, falling back to the parent dataset's entry when
    /// `key` refers to a sub-dataset without one of its own:
    ///
    /// * index subset of an iterable type: configuration view of the parent,
    /// * atom subset of an atom-filterable type: atom view of the parent,
    /// * atom subset of an atom-constant type: the parent entry itself.
    ///
    /// Nested subsets resolve recursively.
    pub fn resolve(&self, key: &CacheKey) -> Option<Arc<DataEntity>> {
        if let Some(entry) = self.get_raw(key) {
            return Some(entry);
        }

        let dataset = self.dataset(key.dataset()?)?;
        let subset = dataset.as_subset()?;
        let data_type = self.registry().get(key.data_type())?;

        let parent_key = key.with_dataset(subset.parent().fingerprint().into());

        if subset.is_atom_filtered() {
            if data_type.atom_filterable {
                let parent = self.resolve(&parent_key)?;
                Some(Arc::new(DataEntity::atom_view(parent, subset.indices())))
            } else if data_type.atom_constant {
                self.resolve(&parent_key)
            } else {
                None
            }
        } else if data_type.iterable {
            let parent = self.resolve(&parent_key)?;
            Some(Arc::new(DataEntity::index_view(parent, subset.indices())))
        } else {
            None
        }
    }

    /// Whether `key` resolves, directly or through a parent dataset.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.resolve(key).is_some()
    }

    /// Entry stored under exactly `key`.
    pub fn get_raw(&self, key: &CacheKey) -> Option<Arc<DataEntity>> {
        read(&self.shared.entries).get(key).cloned()
    }

    pub fn contains_raw(&self, key: &CacheKey) -> bool {
        read(&self.shared.entries).contains_key(key)
    }

    /// Every stored key, sorted.
    pub fn keys(&self) -> Vec<CacheKey> {
        let mut keys: Vec<_> = read(&self.shared.entries).keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        read(&self.shared.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        read(&self.shared.entries).is_empty()
    }

    pub(crate) fn insert(&self, key: CacheKey, entity: Arc<DataEntity>) -> Option<Arc<DataEntity>> {
        write(&self.shared.entries).insert(key, entity)
    }

    /// Drops every entry `remove` returns true for, returning the keys.
    pub(crate) fn remove_where<F>(&self, mut remove: F) -> Vec<CacheKey>
    where
        F: FnMut(&CacheKey) -> bool,
    {
        let mut removed = Vec::new();
        write(&self.shared.entries).retain(|key, _| {
            let drop = remove(key);
            if drop {
                removed.push(key.clone());
            }
            !drop
        });
        removed
    }

    // datasets

    pub fn dataset(&self, fingerprint: &str) -> Option<Arc<dyn Dataset>> {
        read(&self.shared.datasets)
            .get(fingerprint)
            .map(|entry| entry.dataset.clone())
    }

    pub fn dataset_entry(&self, fingerprint: &str) -> Option<DatasetEntry> {
        read(&self.shared.datasets).get(fingerprint).cloned()
    }

    /// Fingerprints of every loaded dataset, sub-datasets included.
    pub fn dataset_keys(&self) -> Vec<ArcStr> {
        read(&self.shared.datasets).keys().cloned().collect()
    }

    pub fn is_active(&self, fingerprint: &str) -> bool {
        read(&self.shared.datasets)
            .get(fingerprint)
            .is_some_and(|entry| entry.active)
    }

    /// `fingerprint` and every sub-dataset derived from it, at any depth.
    pub fn descendants(&self, fingerprint: &str) -> Vec<ArcStr> {
        let datasets = read(&self.shared.datasets);
        let mut found: Vec<ArcStr> = Vec::new();

        if let Some((key, _)) = datasets.get_key_value(fingerprint) {
            found.push(key.clone());
        }

        let mut i = 0;
        while i < found.len() {
            let current = found[i].clone();
            for (key, entry) in datasets.iter() {
                let child = entry
                    .dataset
                    .as_subset()
                    .is_some_and(|subset| subset.parent().fingerprint() == &*current);
                if child && !found.contains(key) {
                    found.push(key.clone());
                }
            }
            i += 1;
        }

        found
    }

    pub(crate) fn insert_dataset(&self, dataset: Arc<dyn Dataset>, color_index: usize) -> ArcStr {
        let fingerprint: ArcStr = dataset.fingerprint().into();
        write(&self.shared.datasets).insert(
            fingerprint.clone(),
            DatasetEntry {
                dataset,
                active: true,
                color_index,
            },
        );
        fingerprint
    }

    pub(crate) fn remove_dataset(&self, fingerprint: &str) -> Option<DatasetEntry> {
        write(&self.shared.datasets).remove(fingerprint)
    }

    /// Returns whether the flag changed.
    pub(crate) fn set_active(&self, fingerprint: &str, active: bool) -> Option<bool> {
        let mut datasets = write(&self.shared.datasets);
        let entry = datasets.get_mut(fingerprint)?;
        let changed = entry.active != active;
        entry.active = active;
        Some(changed)
    }

    // models

    pub fn model(&self, fingerprint: &str) -> Option<Arc<dyn Model>> {
        read(&self.shared.models).get(fingerprint).cloned()
    }

    pub fn model_keys(&self) -> Vec<ArcStr> {
        read(&self.shared.models).keys().cloned().collect()
    }

    pub(crate) fn insert_model(&self, model: Arc<dyn Model>) -> (ArcStr, Option<Arc<dyn Model>>) {
        let fingerprint: ArcStr = model.fingerprint().into();
        let previous = write(&self.shared.models).insert(fingerprint.clone(), model);
        (fingerprint, previous)
    }

    pub(crate) fn remove_model(&self, fingerprint: &str) -> Option<Arc<dyn Model>> {
        write(&self.shared.models).remove(fingerprint)
    }
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog")
            .field("entries", &self.len())
            .field("datasets", &self.dataset_keys())
            .field("models", &self.model_keys())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::{Array, Value};
    use crate::engine::datatype::{DataType, ProduceContext};
    use crate::source::{MemoryDataset, SubDataset};

    fn data_type(key: &str, iterable: bool, atom_filterable: bool, atom_constant: bool) -> DataType {
        DataType {
            key: key.into(),
            name: key.to_string(),
            model_dependent: true,
            dataset_dependent: true,
            dependencies: vec![],
            iterable,
            atom_filterable,
            atom_constant,
            producer: Arc::new(|_: &mut ProduceContext| Ok(false)),
        }
    }

    fn setup() -> (Catalog, ArcStr) {
        let catalog = Catalog::new(Registry::new(vec![
            data_type("forces", true, true, false),
            data_type("energy", true, false, true),
            data_type("mae", false, false, false),
        ]));

        let dataset = MemoryDataset::new(
            "d",
            vec![8, 1, 1],
            Array::zeros(vec![4, 3, 3]),
            None,
            None,
        )
        .unwrap();
        let fingerprint = catalog.insert_dataset(Arc::new(dataset), 0);

        // forces [4, 3, 1] numbered 0..12, energy [4]
        let mut forces = BTreeMap::new();
        forces.insert(
            "forces".to_string(),
            Value::Array(Array::new(vec![4, 3, 1], (0..12).map(f64::from).collect()).unwrap()),
        );
        catalog.insert(key("forces", &fingerprint), Arc::new(DataEntity::new("forces", forces)));

        let mut energy = BTreeMap::new();
        energy.insert(
            "energy".to_string(),
            Value::Array(Array::from_vec(vec![1.0, 2.0, 3.0, 4.0])),
        );
        catalog.insert(key("energy", &fingerprint), Arc::new(DataEntity::new("energy", energy)));

        (catalog, fingerprint)
    }

    fn key(t: &str, d: &str) -> CacheKey {
        CacheKey::new(t, Some("m"), Some(d)).unwrap()
    }

    fn subset(catalog: &Catalog, parent: &str, name: &str, indices: Vec<usize>, atoms: bool) -> ArcStr {
        let parent = catalog.dataset(parent).unwrap();
        let subset = SubDataset::new(parent, None, name, indices, atoms);
        catalog.insert_dataset(Arc::new(subset), 1)
    }

    fn array(entity: &DataEntity, field: &str) -> Vec<f64> {
        entity.get(field).unwrap().as_array().unwrap().to_vec()
    }

    #[test]
    fn test_index_subset_falls_back_to_view() {
        let (catalog, d) = setup();
        let sub = subset(&catalog, &d, "sel", vec![3, 1], false);

        let entry = catalog.resolve(&key("energy", &sub)).unwrap();
        assert!(entry.is_view());
        assert_eq!(array(&entry, "energy"), vec![4.0, 2.0]);
        assert!(!catalog.contains_raw(&key("energy", &sub)));
    }

    #[test]
    fn test_non_iterable_has_no_fallback() {
        let (catalog, d) = setup();
        catalog.insert(key("mae", &d), Arc::new(DataEntity::new("mae", BTreeMap::new())));
        let sub = subset(&catalog, &d, "sel", vec![0], false);

        assert!(!catalog.contains(&key("mae", &sub)));
    }

    #[test]
    fn test_atom_subset_fallback() {
        let (catalog, d) = setup();
        let sub = subset(&catalog, &d, "h", vec![1, 2], true);

        let forces = catalog.resolve(&key("forces", &sub)).unwrap();
        assert_eq!(array(&forces, "forces"), vec![1.0, 2.0, 4.0, 5.0, 7.0, 8.0, 10.0, 11.0]);

        // atom constant reuses the parent entry as is
        let energy = catalog.resolve(&key("energy", &sub)).unwrap();
        assert!(!energy.is_view());
        assert_eq!(array(&energy, "energy").len(), 4);
    }

    #[test]
    fn test_nested_subsets_resolve_recursively() {
        let (catalog, d) = setup();
        let outer = subset(&catalog, &d, "outer", vec![1, 2, 3], false);
        let inner = subset(&catalog, &outer, "inner", vec![2], false);

        let entry = catalog.resolve(&key("energy", &inner)).unwrap();
        assert_eq!(array(&entry, "energy"), vec![4.0]);
    }

    #[test]
    fn test_own_entry_wins_over_fallback() {
        let (catalog, d) = setup();
        let sub = subset(&catalog, &d, "sel", vec![0], false);

        let mut energy = BTreeMap::new();
        energy.insert("energy".to_string(), Value::Scalar(42.0));
        catalog.insert(key("energy", &sub), Arc::new(DataEntity::new("energy", energy)));

        let entry = catalog.resolve(&key("energy", &sub)).unwrap();
        assert_eq!(entry.get("energy").unwrap(), Value::Scalar(42.0));
    }

    #[test]
    fn test_descendants() {
        let (catalog, d) = setup();
        let outer = subset(&catalog, &d, "outer", vec![1, 2], false);
        let inner = subset(&catalog, &outer, "inner", vec![0], false);

        let found = catalog.descendants(&d);
        assert_eq!(found.len(), 3);
        assert!(found.contains(&outer) && found.contains(&inner));
        assert_eq!(catalog.descendants(&inner), vec![inner.clone()]);
        assert!(catalog.descendants("missing").is_empty());
    }

    #[test]
    fn test_remove_where() {
        let (catalog, d) = setup();
        let removed = catalog.remove_where(|key| key.data_type() == "forces");
        assert_eq!(removed, vec![key("forces", &d)]);
        assert_eq!(catalog.keys(), vec![key("energy", &d)]);
    }
}
