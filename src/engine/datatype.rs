//! Data types: named computations over a `(model, dataset)` pair.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::fmt::{self, Display};
use std::sync::Arc;

use anyhow::{Context, anyhow};

use crate::array::Value;
use crate::core::ArcStr;
use crate::engine::cache::Catalog;
use crate::engine::task::TaskHandle;
use crate::entity::DataEntity;
use crate::error::ResolveError;
use crate::key::CacheKey;
use crate::source::{Dataset, Model};

/// Production function of a data type.
///
/// Returns `Ok(true)` once every output has been published through the
/// context, `Ok(false)` to decline (dependencies not ready, task cancelled),
/// and an error when the data can never be produced for this input.
pub trait Producer: Send + Sync {
    fn produce(&self, ctx: &mut ProduceContext) -> anyhow::Result<bool>;
}

impl<F> Producer for F
where
    F: Fn(&mut ProduceContext) -> anyhow::Result<bool> + Send + Sync,
{
    fn produce(&self, ctx: &mut ProduceContext) -> anyhow::Result<bool> {
        self(ctx)
    }
}

pub struct DataType {
    pub(crate) key: ArcStr,
    pub(crate) name: String,
    pub(crate) model_dependent: bool,
    pub(crate) dataset_dependent: bool,
    pub(crate) dependencies: Vec<ArcStr>,
    pub(crate) iterable: bool,
    pub(crate) atom_filterable: bool,
    pub(crate) atom_constant: bool,
    pub(crate) producer: Arc<dyn Producer>,
}

/// Result of [`DataType::check_dependencies`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependencies {
    pub missing: Vec<CacheKey>,
    pub can_generate: bool,
}

/// Everything one production call published, waiting to be written to the
/// cache by the main thread.
#[derive(Debug, Default)]
pub struct Production {
    pub produced: bool,
    pub outputs: Vec<(CacheKey, DataEntity)>,
}

impl DataType {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_model_dependent(&self) -> bool {
        self.model_dependent
    }

    pub fn is_dataset_dependent(&self) -> bool {
        self.dataset_dependent
    }

    pub fn dependencies(&self) -> &[ArcStr] {
        &self.dependencies
    }

    /// Result is per configuration.
    pub fn is_iterable(&self) -> bool {
        self.iterable
    }

    /// Result is per atom and can be sliced along atoms.
    pub fn is_atom_filterable(&self) -> bool {
        self.atom_filterable
    }

    /// Result doesn't change under atom filtering.
    pub fn is_atom_constant(&self) -> bool {
        self.atom_constant
    }

    /// Key of this type for the given pair. Disambiguators the type doesn't
    /// depend on are dropped; a missing one that it needs is logged and
    /// yields `None`.
    pub fn cache_key(&self, model: Option<&str>, dataset: Option<&str>) -> Option<CacheKey> {
        if self.model_dependent && model.is_none() {
            tracing::error!(data_type = %self.key, "model dependent data type requested without a model");
            return None;
        }
        if self.dataset_dependent && dataset.is_none() {
            tracing::error!(data_type = %self.key, "dataset dependent data type requested without a dataset");
            return None;
        }

        let model = model.filter(|_| self.model_dependent);
        let dataset = dataset.filter(|_| self.dataset_dependent);

        CacheKey::new(self.key.clone(), model, dataset)
            .inspect_err(|err| tracing::error!(data_type = %self.key, "{err}"))
            .ok()
    }

    /// Parent dataset whose result this type can reuse for `dataset`.
    fn reusable_parent(&self, catalog: &Catalog, dataset: &str) -> Option<ArcStr> {
        let dataset = catalog.dataset(dataset)?;
        let subset = dataset.as_subset()?;

        let reusable = if subset.is_atom_filtered() {
            self.atom_filterable || self.atom_constant
        } else {
            self.iterable
        };

        reusable.then(|| subset.parent().fingerprint().into())
    }

    /// Dataset this type actually produces an entry for when asked for
    /// `dataset`: the furthest ancestor whose entry the cache can read back
    /// for `dataset`, or `dataset` itself.
    pub fn production_dataset(&self, catalog: &Catalog, dataset: Option<&str>) -> Option<ArcStr> {
        let mut current: ArcStr = dataset?.into();
        while let Some(parent) = self.reusable_parent(catalog, &current) {
            current = parent;
        }
        Some(current)
    }

    /// Key this type publishes when asked for the pair. Differs from
    /// [`cache_key`](Self::cache_key) for sub-datasets served by a parent.
    pub fn production_key(
        &self,
        catalog: &Catalog,
        model: Option<&str>,
        dataset: Option<&str>,
    ) -> Option<CacheKey> {
        let dataset = self.production_dataset(catalog, dataset);
        self.cache_key(model, dataset.as_deref())
    }

    /// Dependencies of the pair, judged on the dataset that will actually be
    /// produced. Missing keys therefore name the parent dataset for results
    /// produced through one.
    pub fn check_dependencies(
        &self,
        catalog: &Catalog,
        model: Option<&str>,
        dataset: Option<&str>,
    ) -> Dependencies {
        let target = self.production_dataset(catalog, dataset);
        let dataset = target.as_deref();

        let mut missing = Vec::new();
        let mut resolvable = true;

        for dependency in &self.dependencies {
            let Some(data_type) = catalog.registry().get(dependency) else {
                tracing::error!(data_type = %self.key, dependency = %dependency, "unknown dependency");
                resolvable = false;
                continue;
            };
            let Some(key) = data_type.cache_key(model, dataset) else {
                resolvable = false;
                continue;
            };

            if !catalog.contains(&key) {
                missing.push(key);
            }
        }

        Dependencies {
            can_generate: resolvable && missing.is_empty(),
            missing,
        }
    }

    /// Runs the production function for one pair. Reusable results are
    /// produced for the parent dataset instead, and read back through the
    /// cache fallback.
    pub fn generate(
        &self,
        catalog: &Catalog,
        model: Option<&str>,
        dataset: Option<&str>,
        handle: &TaskHandle,
        batch_size: usize,
    ) -> anyhow::Result<Production> {
        let target = self.production_dataset(catalog, dataset);
        if target.as_deref() != dataset {
            tracing::debug!(data_type = %self.key, parent = ?target, "producing for parent dataset");
        }
        let dataset = target.as_deref();

        let key = self
            .cache_key(model, dataset)
            .ok_or_else(|| anyhow!("Couldn't build a cache key for '{}'", self.key))?;

        if !self.check_dependencies(catalog, model, dataset).can_generate {
            tracing::debug!(key = %key, "dependencies not ready");
            return Ok(Production::default());
        }

        let model = match key.model() {
            Some(fp) => Some(
                catalog
                    .model(fp)
                    .ok_or_else(|| anyhow!("Model '{fp}' is not loaded"))?,
            ),
            None => None,
        };
        let dataset = match key.dataset() {
            Some(fp) => Some(
                catalog
                    .dataset(fp)
                    .ok_or_else(|| anyhow!("Dataset '{fp}' is not loaded"))?,
            ),
            None => None,
        };

        let mut ctx = ProduceContext {
            catalog: catalog.clone(),
            key: key.clone(),
            dataset,
            model,
            handle: handle.clone(),
            batch_size,
            outputs: Vec::new(),
        };

        let produced = self
            .producer
            .produce(&mut ctx)
            .with_context(|| format!("Couldn't produce '{key}'"))?;

        Ok(Production {
            produced,
            outputs: ctx.outputs,
        })
    }

    /// Closest keys on the way to this type's key that can be produced now.
    ///
    /// Expands breadth-first from the requested key through every missing
    /// dependency. Each path remembers the data types it went through, so a
    /// dependency that leads back into its own path fails with the cycle
    /// instead of expanding forever.
    pub fn generatable_component(
        &self,
        catalog: &Catalog,
        model: Option<&str>,
        dataset: Option<&str>,
    ) -> Result<BTreeSet<CacheKey>, ResolveError> {
        let mut components = BTreeSet::new();

        let Some(start) = self.cache_key(model, dataset) else {
            return Ok(components);
        };

        let mut frontier: VecDeque<(&DataType, CacheKey, Vec<ArcStr>)> = VecDeque::new();
        frontier.push_back((self, start, vec![self.key.clone()]));
        let mut seen = HashSet::new();

        while let Some((data_type, key, path)) = frontier.pop_front() {
            if !seen.insert(key.clone()) {
                continue;
            }

            let dependencies = data_type.check_dependencies(catalog, key.model(), key.dataset());
            if dependencies.can_generate {
                components.insert(key);
                continue;
            }

            for missing in dependencies.missing {
                let Some(next) = catalog.registry().get(missing.data_type()) else {
                    continue;
                };

                let mut path = path.clone();
                let cyclic = path.contains(&next.key);
                path.push(next.key.clone());
                if cyclic {
                    return Err(ResolveError::DependencyCycle(path));
                }

                frontier.push_back((&**next, missing, path));
            }
        }

        Ok(components)
    }
}

impl fmt::Debug for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataType")
            .field("key", &self.key)
            .field("dependencies", &self.dependencies)
            .field("model_dependent", &self.model_dependent)
            .field("dataset_dependent", &self.dataset_dependent)
            .finish_non_exhaustive()
    }
}

/// What a production function sees of the environment.
pub struct ProduceContext {
    catalog: Catalog,
    key: CacheKey,
    dataset: Option<Arc<dyn Dataset>>,
    model: Option<Arc<dyn Model>>,
    handle: TaskHandle,
    batch_size: usize,
    outputs: Vec<(CacheKey, DataEntity)>,
}

impl ProduceContext {
    /// Key being produced.
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn dataset(&self) -> anyhow::Result<Arc<dyn Dataset>> {
        self.dataset
            .clone()
            .ok_or_else(|| anyhow!("'{}' has no dataset", self.key))
    }

    pub fn model(&self) -> anyhow::Result<Arc<dyn Model>> {
        self.model
            .clone()
            .ok_or_else(|| anyhow!("'{}' has no model", self.key))
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    fn key_for(&self, data_type: &str) -> anyhow::Result<CacheKey> {
        self.catalog
            .registry()
            .get(data_type)
            .ok_or_else(|| anyhow!("Data type '{data_type}' is not registered"))?
            .cache_key(self.key.model(), self.key.dataset())
            .ok_or_else(|| anyhow!("Couldn't build a cache key for '{data_type}'"))
    }

    /// Cached entry of another data type for the same pair.
    pub fn dependency(&self, data_type: &str) -> anyhow::Result<Arc<DataEntity>> {
        let key = self.key_for(data_type)?;
        self.catalog
            .resolve(&key)
            .ok_or_else(|| anyhow!("Dependency '{key}' is not cached"))
    }

    /// Publishes the result for [`key`](Self::key).
    pub fn publish(&mut self, data: BTreeMap<String, Value>) {
        let entity = DataEntity::new(self.key.data_type(), data);
        self.outputs.push((self.key.clone(), entity));
    }

    /// Publishes a by-product for another data type of the same pair.
    pub fn publish_as(&mut self, data_type: &str, data: BTreeMap<String, Value>) -> anyhow::Result<()> {
        let key = self.key_for(data_type)?;
        let entity = DataEntity::new(key.data_type(), data);
        self.outputs.push((key, entity));
        Ok(())
    }

    /// `false` once the task has been cancelled. Long productions should
    /// check this between steps and decline.
    pub fn is_running(&self) -> bool {
        self.handle.is_running()
    }

    pub fn set_progress(&self, prog_max: usize, prog: usize, message: Option<&str>, percent: bool) {
        self.handle.set_progress(prog_max, prog, message, percent);
    }

    /// Configurations per model evaluation.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}

/// Every data type known to an environment, by key.
#[derive(Debug, Default)]
pub struct Registry {
    types: BTreeMap<ArcStr, Arc<DataType>>,
}

impl Registry {
    pub(crate) fn new(types: impl IntoIterator<Item = DataType>) -> Self {
        Self {
            types: types
                .into_iter()
                .map(|data_type| (data_type.key.clone(), Arc::new(data_type)))
                .collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Arc<DataType>> {
        self.types.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.types.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<DataType>> {
        self.types.values()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

/// Mermaid graph of the dependencies, arrows pointing at the dependent type.
pub(crate) fn write_mermaid<'a, I>(f: &mut fmt::Formatter<'_>, types: I) -> fmt::Result
where
    I: IntoIterator<Item = &'a DataType>,
    I::IntoIter: Clone,
{
    let types = types.into_iter();
    writeln!(f, "graph LR")?;

    for data_type in types.clone() {
        let name = data_type.name.replace('"', "\\\"");
        writeln!(f, "    {}[\"{}\"]", data_type.key, name)?;
    }

    for data_type in types {
        for dependency in &data_type.dependencies {
            writeln!(f, "    {} --> {}", dependency, data_type.key)?;
        }
    }

    Ok(())
}

impl Display for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_mermaid(f, self.types.values().map(Arc::as_ref))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::Array;
    use crate::engine::task::TaskId;
    use crate::source::{MemoryDataset, SubDataset};

    fn data_type(key: &str, deps: &[&str]) -> DataType {
        DataType {
            key: key.into(),
            name: key.to_string(),
            model_dependent: true,
            dataset_dependent: true,
            dependencies: deps.iter().map(|&d| d.into()).collect(),
            iterable: true,
            atom_filterable: false,
            atom_constant: false,
            producer: Arc::new(|ctx: &mut ProduceContext| {
                let mut data = BTreeMap::new();
                data.insert("value".to_string(), Value::Scalar(1.0));
                ctx.publish(data);
                Ok(true)
            }),
        }
    }

    fn catalog(types: Vec<DataType>) -> (Catalog, ArcStr) {
        let catalog = Catalog::new(Registry::new(types));
        let dataset = MemoryDataset::new(
            "d",
            vec![1, 1],
            Array::zeros(vec![3, 2, 3]),
            None,
            None,
        )
        .unwrap();
        let fingerprint: ArcStr = dataset.fingerprint().into();
        catalog.insert_dataset(Arc::new(dataset), 0);
        (catalog, fingerprint)
    }

    fn cached(catalog: &Catalog, key: CacheKey) {
        let entity = DataEntity::new(key.data_type(), BTreeMap::new());
        catalog.insert(key, Arc::new(entity));
    }

    fn key(t: &str, d: &str) -> CacheKey {
        CacheKey::new(t, Some("m"), Some(d)).unwrap()
    }

    #[test]
    fn test_cache_key_drops_unused_disambiguators() {
        let mut dt = data_type("totals", &[]);
        dt.model_dependent = false;

        let key = dt.cache_key(Some("m"), Some("d")).unwrap();
        assert_eq!(key.to_string(), "totals__nil__d");
        assert!(dt.cache_key(Some("m"), None).is_none());
    }

    #[test]
    fn test_check_dependencies() {
        let (catalog, d) = catalog(vec![data_type("base", &[]), data_type("double", &["base"])]);
        let double = catalog.registry().get("double").unwrap().clone();

        let deps = double.check_dependencies(&catalog, Some("m"), Some(&d));
        assert!(!deps.can_generate);
        assert_eq!(deps.missing, vec![key("base", &d)]);

        cached(&catalog, key("base", &d));
        let deps = double.check_dependencies(&catalog, Some("m"), Some(&d));
        assert!(deps.can_generate);
        assert!(deps.missing.is_empty());
    }

    #[test]
    fn test_component_is_lowest_generatable() {
        let (catalog, d) = catalog(vec![
            data_type("a", &[]),
            data_type("b", &["a"]),
            data_type("c", &["b"]),
        ]);
        let c = catalog.registry().get("c").unwrap().clone();

        let components = c.generatable_component(&catalog, Some("m"), Some(&d)).unwrap();
        assert_eq!(components, BTreeSet::from([key("a", &d)]));

        cached(&catalog, key("a", &d));
        let components = c.generatable_component(&catalog, Some("m"), Some(&d)).unwrap();
        assert_eq!(components, BTreeSet::from([key("b", &d)]));

        for component in &components {
            let dt = catalog.registry().get(component.data_type()).unwrap();
            assert!(
                dt.check_dependencies(&catalog, component.model(), component.dataset())
                    .can_generate
            );
        }
    }

    #[test]
    fn test_diamond_expands_once() {
        let (catalog, d) = catalog(vec![
            data_type("a", &[]),
            data_type("b", &["a"]),
            data_type("c", &["a"]),
            data_type("d", &["b", "c"]),
        ]);
        let top = catalog.registry().get("d").unwrap().clone();

        let components = top.generatable_component(&catalog, Some("m"), Some(&d)).unwrap();
        assert_eq!(components, BTreeSet::from([key("a", &d)]));
    }

    #[test]
    fn test_cycle_is_reported() {
        let (catalog, d) = catalog(vec![data_type("x", &["y"]), data_type("y", &["x"])]);
        let x = catalog.registry().get("x").unwrap().clone();

        let err = x.generatable_component(&catalog, Some("m"), Some(&d)).unwrap_err();
        let ResolveError::DependencyCycle(path) = err;
        assert_eq!(path, vec![ArcStr::from("x"), "y".into(), "x".into()]);
    }

    #[test]
    fn test_atom_filtered_parent_satisfies_dependency() {
        let mut errors = data_type("errors", &["base"]);
        errors.atom_filterable = true;
        let (catalog, d) = catalog(vec![data_type("base", &[]), errors]);

        let parent = catalog.dataset(&d).unwrap();
        let subset = SubDataset::new(parent, None, "first", vec![0], true);
        let sub: ArcStr = subset.fingerprint().into();
        catalog.insert_dataset(Arc::new(subset), 1);

        // "base" is neither atom filterable nor constant, so the subset has no
        // entry of its own through the fallback
        cached(&catalog, key("base", &d));
        assert!(!catalog.contains(&key("base", &sub)));

        let errors = catalog.registry().get("errors").unwrap().clone();
        assert!(
            errors
                .check_dependencies(&catalog, Some("m"), Some(&sub))
                .can_generate
        );
    }

    #[test]
    fn test_generate_requires_loaded_model() {
        let (catalog, d) = catalog(vec![data_type("base", &[])]);
        let base = catalog.registry().get("base").unwrap().clone();
        let handle = TaskHandle::detached(TaskId::new("t"));

        // model isn't loaded
        assert!(base.generate(&catalog, Some("m"), Some(&d), &handle, 8).is_err());
        assert!(!catalog.contains(&key("base", &d)));
    }

    #[test]
    fn test_generate_declines_without_dependencies() {
        let (catalog, d) = catalog(vec![data_type("base", &[]), data_type("double", &["base"])]);
        let double = catalog.registry().get("double").unwrap().clone();
        let handle = TaskHandle::detached(TaskId::new("t"));

        let production = double
            .generate(&catalog, Some("m"), Some(&d), &handle, 8)
            .unwrap();
        assert!(!production.produced);
        assert!(production.outputs.is_empty());
    }

    #[test]
    fn test_registry_mermaid() {
        let registry = Registry::new(vec![data_type("base", &[]), data_type("double", &["base"])]);
        let graph = registry.to_string();
        assert!(graph.starts_with("graph LR"));
        assert!(graph.contains("base --> double"));
    }
}
