use std::collections::HashMap;
use std::sync::Arc;

use petgraph::Graph;
use petgraph::algo::{tarjan_scc, toposort};

use crate::builtin;
use crate::config::Settings;
use crate::core::ArcStr;
use crate::engine::{self, DataType, Environment, ProduceContext, Producer, Registry};
use crate::error::BlueprintError;
use crate::key::CacheKey;

/// The blueprint of an [`Environment`].
///
/// `Blueprint` collects the data types an environment can produce. Each one
/// is declared with [`data_type`](Self::data_type), which names it, lists
/// the data types it is computed from, and attaches its production
/// function.
///
/// Once configured, [`finish`](Self::finish) checks the dependency graph and
/// turns the blueprint into an [`Environment`].
///
/// # Example
///
/// ```rust
/// use ffscope::Blueprint;
///
/// let mut blueprint = Blueprint::with_builtins();
/// blueprint
///     .data_type("energy_spread")
///     .depends_on(["energy"])
///     .produce(|ctx| {
///         let energy = ctx.dependency("energy")?;
///         ctx.publish(energy.materialize()?);
///         Ok(true)
///     });
///
/// let env = blueprint.finish().unwrap();
/// assert!(env.registry().contains("energy_spread"));
/// ```
#[derive(Default)]
pub struct Blueprint {
    types: Vec<DataType>,
    settings: Settings,
}

impl Blueprint {
    /// Creates a new, empty blueprint.
    pub fn new() -> Self {
        Self::default()
    }

    /// A blueprint with the standard force-field data types registered.
    pub fn with_builtins() -> Self {
        let mut blueprint = Self::new();
        builtin::register(&mut blueprint);
        blueprint
    }

    pub fn settings(&mut self, settings: Settings) -> &mut Self {
        self.settings = settings;
        self
    }

    /// Starts declaring a data type. It isn't registered until a production
    /// function is attached.
    pub fn data_type(&mut self, key: impl Into<ArcStr>) -> DataTypeDef<'_> {
        let key = key.into();
        DataTypeDef {
            blueprint: self,
            name: key.to_string(),
            key,
            model_dependent: true,
            dataset_dependent: true,
            dependencies: Vec::new(),
            iterable: false,
            atom_filterable: false,
            atom_constant: false,
        }
    }

    fn validate(&self) -> Result<(), BlueprintError> {
        let mut graph = Graph::<ArcStr, ()>::new();
        let mut nodes = HashMap::new();

        for data_type in &self.types {
            CacheKey::new(data_type.key.clone(), None::<&str>, None::<&str>)?;

            let index = graph.add_node(data_type.key.clone());
            if nodes.insert(data_type.key.clone(), (index, data_type)).is_some() {
                return Err(BlueprintError::Duplicate(data_type.key.clone()));
            }
        }

        for data_type in &self.types {
            let (index, _) = nodes[&data_type.key];

            for dependency in &data_type.dependencies {
                let Some(&(dep_index, dep)) = nodes.get(dependency) else {
                    return Err(BlueprintError::UnknownDependency(
                        data_type.key.clone(),
                        dependency.clone(),
                    ));
                };

                if (dep.model_dependent && !data_type.model_dependent)
                    || (dep.dataset_dependent && !data_type.dataset_dependent)
                {
                    return Err(BlueprintError::Disambiguator(
                        data_type.key.clone(),
                        dependency.clone(),
                    ));
                }

                graph.add_edge(dep_index, index, ());
            }
        }

        if let Err(cycle) = toposort(&graph, None) {
            let culprit = cycle.node_id();
            let members = tarjan_scc(&graph)
                .into_iter()
                .find(|component| component.contains(&culprit))
                .unwrap_or_else(|| vec![culprit]);

            let mut keys: Vec<ArcStr> = members.iter().map(|&i| graph[i].clone()).collect();
            keys.sort();
            return Err(BlueprintError::Cycle(keys));
        }

        Ok(())
    }

    /// Checks the dependency graph and creates the environment.
    pub fn finish(self) -> Result<Environment, BlueprintError> {
        self.validate()?;

        tracing::debug!(types = self.types.len(), "blueprint finished");
        Ok(Environment::new(self.settings, Registry::new(self.types)))
    }
}

impl std::fmt::Display for Blueprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        engine::write_mermaid(f, &self.types)
    }
}

pub struct DataTypeDef<'a> {
    blueprint: &'a mut Blueprint,
    key: ArcStr,
    name: String,
    model_dependent: bool,
    dataset_dependent: bool,
    dependencies: Vec<ArcStr>,
    iterable: bool,
    atom_filterable: bool,
    atom_constant: bool,
}

impl DataTypeDef<'_> {
    /// Human readable name, used for task names and diagrams.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Whether a model is part of the key. Defaults to `true`.
    pub fn model_dependent(mut self, yes: bool) -> Self {
        self.model_dependent = yes;
        self
    }

    /// Whether a dataset is part of the key. Defaults to `true`.
    pub fn dataset_dependent(mut self, yes: bool) -> Self {
        self.dataset_dependent = yes;
        self
    }

    pub fn depends_on<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ArcStr>,
    {
        for dependency in dependencies {
            let dependency = dependency.into();
            if !self.dependencies.contains(&dependency) {
                self.dependencies.push(dependency);
            }
        }
        self
    }

    pub fn iterable(mut self, yes: bool) -> Self {
        self.iterable = yes;
        self
    }

    pub fn atom_filterable(mut self, yes: bool) -> Self {
        self.atom_filterable = yes;
        self
    }

    pub fn atom_constant(mut self, yes: bool) -> Self {
        self.atom_constant = yes;
        self
    }

    /// Registers the data type with a production function.
    pub fn produce<F>(self, producer: F)
    where
        F: Fn(&mut ProduceContext) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        self.producer(Arc::new(producer));
    }

    /// Registers the data type with a shared producer.
    pub fn producer(self, producer: Arc<dyn Producer>) {
        let DataTypeDef {
            blueprint,
            key,
            name,
            model_dependent,
            dataset_dependent,
            dependencies,
            iterable,
            atom_filterable,
            atom_constant,
        } = self;

        blueprint.types.push(DataType {
            key,
            name,
            model_dependent,
            dataset_dependent,
            dependencies,
            iterable,
            atom_filterable,
            atom_constant,
            producer,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(blueprint: &mut Blueprint, key: &str, deps: &[&str]) {
        blueprint
            .data_type(key)
            .depends_on(deps.iter().copied())
            .produce(|_| Ok(false));
    }

    #[test]
    fn test_builtins_are_valid() {
        let env = Blueprint::with_builtins().finish().unwrap();
        assert_eq!(env.registry().len(), 8);
        assert!(env.registry().get("forces_rmse").is_some());
    }

    #[test]
    fn test_duplicate() {
        let mut blueprint = Blueprint::new();
        noop(&mut blueprint, "a", &[]);
        noop(&mut blueprint, "a", &[]);
        assert_eq!(
            blueprint.finish().unwrap_err(),
            BlueprintError::Duplicate("a".into())
        );
    }

    #[test]
    fn test_unknown_dependency() {
        let mut blueprint = Blueprint::new();
        noop(&mut blueprint, "a", &["b"]);
        assert_eq!(
            blueprint.finish().unwrap_err(),
            BlueprintError::UnknownDependency("a".into(), "b".into())
        );
    }

    #[test]
    fn test_cycle_names_members() {
        let mut blueprint = Blueprint::new();
        noop(&mut blueprint, "root", &[]);
        noop(&mut blueprint, "a", &["c", "root"]);
        noop(&mut blueprint, "b", &["a"]);
        noop(&mut blueprint, "c", &["b"]);

        assert_eq!(
            blueprint.finish().unwrap_err(),
            BlueprintError::Cycle(vec!["a".into(), "b".into(), "c".into()])
        );
    }

    #[test]
    fn test_self_dependency() {
        let mut blueprint = Blueprint::new();
        noop(&mut blueprint, "a", &["a"]);
        assert!(matches!(blueprint.finish(), Err(BlueprintError::Cycle(_))));
    }

    #[test]
    fn test_invalid_key() {
        let mut blueprint = Blueprint::new();
        noop(&mut blueprint, "a__b", &[]);
        assert!(matches!(blueprint.finish(), Err(BlueprintError::Key(_))));
    }

    #[test]
    fn test_missing_disambiguator() {
        let mut blueprint = Blueprint::new();
        noop(&mut blueprint, "per_model", &[]);
        blueprint
            .data_type("global")
            .model_dependent(false)
            .depends_on(["per_model"])
            .produce(|_| Ok(false));

        assert_eq!(
            blueprint.finish().unwrap_err(),
            BlueprintError::Disambiguator("global".into(), "per_model".into())
        );
    }

    #[test]
    fn test_display_as_mermaid() {
        let mut blueprint = Blueprint::new();
        noop(&mut blueprint, "base", &[]);
        blueprint
            .data_type("double")
            .name("Double \"base\"")
            .depends_on(["base"])
            .produce(|_| Ok(false));

        let graph = blueprint.to_string();
        assert!(graph.starts_with("graph LR\n"));
        assert!(graph.contains("double[\"Double \\\"base\\\"\"]"));
        assert!(graph.contains("base --> double"));
    }
}
