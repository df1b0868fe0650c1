//! Per-consumer views of the cache.
//!
//! A [`DataWatcher`] belongs to one consumer (a plot, a table) and tracks
//! the cache keys it currently needs. The environment forwards every event
//! to every watcher; a watcher refreshes only when the event touches one of
//! its keys, and then tells its widgets through [`Event::WidgetRefresh`].

use std::collections::HashSet;
use std::fmt::{self, Display};
use std::sync::Arc;

use crate::core::ArcStr;
use crate::engine::{Catalog, GenerationQueue};
use crate::entity::DataEntity;
use crate::event::{Event, EventBus, WidgetId};
use crate::key::CacheKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatcherId(pub(crate) u64);

impl Display for WatcherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "watcher#{}", self.0)
    }
}

/// Datasets or models a watcher is interested in.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Selection {
    /// Everything loaded, now or later.
    All,
    Only(Vec<ArcStr>),
    #[default]
    None,
}

impl Selection {
    pub fn only<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ArcStr>,
    {
        Selection::Only(keys.into_iter().map(Into::into).collect())
    }

    pub fn includes(&self, key: &str) -> bool {
        match self {
            Selection::All => true,
            Selection::Only(keys) => keys.iter().any(|k| &**k == key),
            Selection::None => false,
        }
    }

    fn resolve(&self, loaded: Vec<ArcStr>) -> Vec<ArcStr> {
        match self {
            Selection::All => loaded,
            Selection::Only(keys) => keys.iter().filter(|k| loaded.contains(k)).cloned().collect(),
            Selection::None => Vec::new(),
        }
    }
}

/// One cached dependency of a watcher.
#[derive(Debug, Clone)]
pub struct WatchedData {
    pub data_type: ArcStr,
    pub model: Option<ArcStr>,
    pub dataset: Option<ArcStr>,
    pub entry: Arc<DataEntity>,
}

#[derive(Debug)]
pub struct DataWatcher {
    id: WatcherId,
    owner: String,
    widgets: Vec<WidgetId>,
    data_types: Vec<ArcStr>,
    datasets: Selection,
    models: Selection,
    dependency_list: Vec<CacheKey>,
    missing: Vec<CacheKey>,
    failed: Vec<CacheKey>,
}

impl DataWatcher {
    pub(crate) fn new(id: WatcherId, owner: impl Into<String>) -> Self {
        Self {
            id,
            owner: owner.into(),
            widgets: Vec::new(),
            data_types: Vec::new(),
            datasets: Selection::None,
            models: Selection::None,
            dependency_list: Vec::new(),
            missing: Vec::new(),
            failed: Vec::new(),
        }
    }

    pub fn id(&self) -> WatcherId {
        self.id
    }

    /// Name of the owning consumer. Sub-datasets declared under this name
    /// are never watched by it.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn widgets(&self) -> &[WidgetId] {
        &self.widgets
    }

    pub fn data_types(&self) -> &[ArcStr] {
        &self.data_types
    }

    pub fn datasets(&self) -> &Selection {
        &self.datasets
    }

    pub fn models(&self) -> &Selection {
        &self.models
    }

    /// Concrete keys this watcher needs.
    pub fn dependency_list(&self) -> &[CacheKey] {
        &self.dependency_list
    }

    /// Needed keys absent from the cache as of the last refresh.
    pub fn missing_keys(&self) -> &[CacheKey] {
        &self.missing
    }

    /// Needed keys that failed for good as of the last refresh.
    pub fn failed_keys(&self) -> &[CacheKey] {
        &self.failed
    }

    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }

    /// Every needed key present in the cache, with its entry.
    pub fn watched_data(&self, catalog: &Catalog) -> Vec<WatchedData> {
        self.dependency_list
            .iter()
            .filter_map(|key| {
                let entry = catalog.resolve(key)?;
                Some(WatchedData {
                    data_type: key.data_type().into(),
                    model: key.model().map(Into::into),
                    dataset: key.dataset().map(Into::into),
                    entry,
                })
            })
            .collect()
    }

    fn watches_dataset(&self, catalog: &Catalog, fingerprint: &str) -> bool {
        let Some(entry) = catalog.dataset_entry(fingerprint) else {
            return false;
        };

        let own_subset = entry
            .dataset
            .as_subset()
            .is_some_and(|subset| subset.sub_name() == self.owner);

        entry.active && !own_subset
    }

    fn rebuild(&mut self, catalog: &Catalog) {
        let datasets: Vec<ArcStr> = self
            .datasets
            .resolve(catalog.dataset_keys())
            .into_iter()
            .filter(|fp| self.watches_dataset(catalog, fp))
            .collect();
        let models = self.models.resolve(catalog.model_keys());

        let mut seen = HashSet::new();
        let mut list = Vec::new();

        for key in &self.data_types {
            let Some(data_type) = catalog.registry().get(key) else {
                tracing::warn!(watcher = %self.id, data_type = %key, "watching an unknown data type");
                continue;
            };

            let models: Vec<Option<&str>> = if data_type.is_model_dependent() {
                models.iter().map(|m| Some(&**m)).collect()
            } else {
                vec![None]
            };
            let datasets: Vec<Option<&str>> = if data_type.is_dataset_dependent() {
                datasets.iter().map(|d| Some(&**d)).collect()
            } else {
                vec![None]
            };

            for &model in &models {
                for &dataset in &datasets {
                    if let Some(key) = data_type.cache_key(model, dataset)
                        && seen.insert(key.clone())
                    {
                        list.push(key);
                    }
                }
            }
        }

        self.dependency_list = list;
    }

    pub(crate) fn refresh_dependency_list(
        &mut self,
        catalog: &Catalog,
        queue: &GenerationQueue,
        bus: &mut EventBus,
    ) {
        self.rebuild(catalog);
        self.refresh(catalog, queue, bus);
    }

    pub(crate) fn refresh(&mut self, catalog: &Catalog, queue: &GenerationQueue, bus: &mut EventBus) {
        self.missing = self
            .dependency_list
            .iter()
            .filter(|key| !catalog.contains(key))
            .cloned()
            .collect();
        self.failed = self
            .missing
            .iter()
            .filter(|key| queue.is_failed(key))
            .cloned()
            .collect();

        for &widget in &self.widgets {
            bus.push(Event::WidgetRefresh(widget));
        }
    }

    /// Whether an entry written under `key` may change what this watcher
    /// reads. Writes to a parent dataset show through sub-dataset keys.
    fn touched_by(&self, catalog: &Catalog, key: &CacheKey) -> bool {
        self.dependency_list.iter().any(|watched| {
            if watched == key {
                return true;
            }
            if watched.data_type() != key.data_type() || watched.model() != key.model() {
                return false;
            }
            match (watched.dataset(), key.dataset()) {
                (Some(watched), Some(written)) => catalog
                    .descendants(written)
                    .iter()
                    .any(|d| &**d == watched),
                _ => false,
            }
        })
    }

    fn uses_dataset(&self, fingerprint: &str) -> bool {
        self.dependency_list
            .iter()
            .any(|key| key.dataset() == Some(fingerprint))
    }

    pub(crate) fn on_event(
        &mut self,
        event: &Event,
        catalog: &Catalog,
        queue: &GenerationQueue,
        bus: &mut EventBus,
    ) {
        match event {
            Event::DataUpdated(key) | Event::GenerationFailed(key) => {
                if self.touched_by(catalog, key) {
                    self.refresh(catalog, queue, bus);
                }
            }
            Event::DatasetLoaded(fp) | Event::DatasetStateChanged(fp) => {
                if self.datasets.includes(fp) || self.uses_dataset(fp) {
                    self.refresh_dependency_list(catalog, queue, bus);
                }
            }
            Event::DatasetDeleted(fp) => {
                if self.uses_dataset(fp) {
                    self.refresh_dependency_list(catalog, queue, bus);
                }
            }
            Event::ModelLoaded(fp) | Event::ModelDeleted(fp) => {
                if self.models.includes(fp) {
                    self.refresh_dependency_list(catalog, queue, bus);
                }
            }
            Event::SubdatasetIndicesChanged(fp) => {
                if self.uses_dataset(fp) {
                    self.refresh(catalog, queue, bus);
                }
            }
            _ => {}
        }
    }
}

/// Mutable access to one watcher, borrowed from its environment.
pub struct WatcherMut<'a> {
    pub(crate) watcher: &'a mut DataWatcher,
    pub(crate) catalog: &'a Catalog,
    pub(crate) queue: &'a mut GenerationQueue,
    pub(crate) bus: &'a mut EventBus,
}

impl WatcherMut<'_> {
    pub fn add_widget(&mut self, widget: WidgetId) -> &mut Self {
        if !self.watcher.widgets.contains(&widget) {
            self.watcher.widgets.push(widget);
        }
        self
    }

    pub fn remove_widget(&mut self, widget: WidgetId) -> &mut Self {
        self.watcher.widgets.retain(|&w| w != widget);
        self
    }

    pub fn set_data_dependencies<I, S>(&mut self, data_types: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ArcStr>,
    {
        self.watcher.data_types = data_types.into_iter().map(Into::into).collect();
        self.refresh_dependency_list()
    }

    pub fn set_dataset_dependencies(&mut self, datasets: Selection) -> &mut Self {
        self.watcher.datasets = datasets;
        self.refresh_dependency_list()
    }

    pub fn set_model_dependencies(&mut self, models: Selection) -> &mut Self {
        self.watcher.models = models;
        self.refresh_dependency_list()
    }

    pub fn refresh_dependency_list(&mut self) -> &mut Self {
        self.watcher
            .refresh_dependency_list(self.catalog, self.queue, self.bus);
        self
    }

    pub fn refresh(&mut self) -> &mut Self {
        self.watcher.refresh(self.catalog, self.queue, self.bus);
        self
    }

    /// Requests generation of every missing key, failed ones included.
    /// Returns how many keys were queued.
    pub fn load_content(&mut self) -> usize {
        let mut queued = 0;
        for key in &self.watcher.missing {
            if self.queue.request(key.clone()) {
                tracing::debug!(watcher = %self.watcher.id, key = %key, "requested");
                queued += 1;
            }
        }
        self.watcher.failed.clear();

        if queued > 0 {
            self.bus.push(Event::GenerationQueueChanged);
        }
        queued
    }
}

impl std::ops::Deref for WatcherMut<'_> {
    type Target = DataWatcher;

    fn deref(&self) -> &Self::Target {
        &*self.watcher
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::{Array, Value};
    use crate::engine::{DataType, ProduceContext, Registry};
    use crate::source::{MemoryDataset, SubDataset};
    use std::collections::BTreeMap;

    fn data_type(key: &str, model_dependent: bool) -> DataType {
        DataType {
            key: key.into(),
            name: key.to_string(),
            model_dependent,
            dataset_dependent: true,
            dependencies: vec![],
            iterable: true,
            atom_filterable: false,
            atom_constant: false,
            producer: Arc::new(|_: &mut ProduceContext| Ok(false)),
        }
    }

    struct Fixture {
        catalog: Catalog,
        queue: GenerationQueue,
        bus: EventBus,
        watcher: DataWatcher,
        dataset: ArcStr,
    }

    impl Fixture {
        fn new() -> Self {
            let catalog = Catalog::new(Registry::new(vec![
                data_type("energy", true),
                data_type("summary", false),
            ]));
            let dataset = MemoryDataset::new("d", vec![1], Array::zeros(vec![2, 1, 3]), None, None)
                .unwrap();
            let dataset = catalog.insert_dataset(Arc::new(dataset), 0);
            catalog.insert_model(Arc::new(crate::source::GhostModel::new("m1", None)));
            catalog.insert_model(Arc::new(crate::source::GhostModel::new("m2", None)));

            Self {
                catalog,
                queue: GenerationQueue::new(),
                bus: EventBus::new(),
                watcher: DataWatcher::new(WatcherId(1), "plot"),
                dataset,
            }
        }

        fn watcher(&mut self) -> WatcherMut<'_> {
            WatcherMut {
                watcher: &mut self.watcher,
                catalog: &self.catalog,
                queue: &mut self.queue,
                bus: &mut self.bus,
            }
        }

        fn cache(&self, key: &CacheKey) {
            let mut data = BTreeMap::new();
            data.insert("energy".to_string(), Value::Array(Array::from_vec(vec![1.0, 2.0])));
            self.catalog
                .insert(key.clone(), Arc::new(DataEntity::new(key.data_type(), data)));
        }
    }

    fn key(t: &str, m: Option<&str>, d: &str) -> CacheKey {
        CacheKey::new(t, m, Some(d)).unwrap()
    }

    #[test]
    fn test_dependency_list_is_cross_product() {
        let mut fx = Fixture::new();
        let d = fx.dataset.clone();

        fx.watcher()
            .set_data_dependencies(["energy", "summary"])
            .set_dataset_dependencies(Selection::All)
            .set_model_dependencies(Selection::All);

        assert_eq!(
            fx.watcher.dependency_list(),
            &[
                key("energy", Some("m1"), &d),
                key("energy", Some("m2"), &d),
                key("summary", None, &d),
            ]
        );
        assert_eq!(fx.watcher.missing_keys().len(), 3);
    }

    #[test]
    fn test_excludes_inactive_and_own_subsets() {
        let mut fx = Fixture::new();
        let d = fx.dataset.clone();

        let parent = fx.catalog.dataset(&d).unwrap();
        let own = fx.catalog.insert_dataset(
            Arc::new(SubDataset::new(parent.clone(), None, "plot", vec![0], false)),
            1,
        );
        let other = fx.catalog.insert_dataset(
            Arc::new(SubDataset::new(parent, None, "table", vec![0], false)),
            2,
        );
        fx.catalog.set_active(&d, false);

        fx.watcher()
            .set_data_dependencies(["summary"])
            .set_dataset_dependencies(Selection::All);

        assert_eq!(fx.watcher.dependency_list(), &[key("summary", None, &other)]);
        assert!(!fx.watcher.dependency_list().contains(&key("summary", None, &own)));
    }

    #[test]
    fn test_refresh_notifies_widgets_on_relevant_update() {
        let mut fx = Fixture::new();
        let d = fx.dataset.clone();

        fx.watcher()
            .add_widget(WidgetId(7))
            .set_data_dependencies(["summary"])
            .set_dataset_dependencies(Selection::only([d.clone()]));
        fx.bus.drain();

        let unrelated = key("energy", Some("m1"), &d);
        fx.cache(&unrelated);
        fx.watcher
            .on_event(&Event::DataUpdated(unrelated), &fx.catalog, &fx.queue, &mut fx.bus);
        assert!(fx.bus.is_empty());

        let watched = key("summary", None, &d);
        fx.cache(&watched);
        fx.watcher
            .on_event(&Event::DataUpdated(watched), &fx.catalog, &fx.queue, &mut fx.bus);
        assert_eq!(fx.bus.drain(), vec![Event::WidgetRefresh(WidgetId(7))]);
        assert!(fx.watcher.is_complete());
    }

    #[test]
    fn test_load_content_queues_missing() {
        let mut fx = Fixture::new();
        let d = fx.dataset.clone();

        let mut watcher = fx.watcher();
        watcher
            .set_data_dependencies(["energy"])
            .set_dataset_dependencies(Selection::All)
            .set_model_dependencies(Selection::only(["m1"]));
        assert_eq!(watcher.load_content(), 1);
        assert_eq!(watcher.load_content(), 0);

        assert!(fx.queue.contains(&key("energy", Some("m1"), &d)));
        assert!(fx.bus.pending().any(|e| *e == Event::GenerationQueueChanged));
    }

    #[test]
    fn test_failed_keys() {
        let mut fx = Fixture::new();
        let d = fx.dataset.clone();
        let failing = key("summary", None, &d);
        fx.queue.fail(failing.clone(), "no reference data");

        fx.watcher()
            .set_data_dependencies(["summary"])
            .set_dataset_dependencies(Selection::All);
        assert_eq!(fx.watcher.failed_keys(), &[failing.clone()]);

        // asking again clears the failure
        fx.watcher().load_content();
        assert!(fx.watcher.failed_keys().is_empty());
        assert!(fx.queue.contains(&failing));
    }

    #[test]
    fn test_watched_data_includes_fallback_entries() {
        let mut fx = Fixture::new();
        let d = fx.dataset.clone();
        let parent = fx.catalog.dataset(&d).unwrap();
        let sub = fx.catalog.insert_dataset(
            Arc::new(SubDataset::new(parent, None, "sel", vec![1], false)),
            1,
        );
        fx.cache(&key("summary", None, &d));

        fx.watcher()
            .set_data_dependencies(["summary"])
            .set_dataset_dependencies(Selection::only([sub.clone()]));

        let data = fx.watcher.watched_data(&fx.catalog);
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].dataset.as_deref(), Some(&*sub));
        let energy = data[0].entry.get("energy").unwrap();
        assert_eq!(energy.as_array().unwrap().to_vec(), &[2.0]);
    }
}
