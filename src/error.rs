use crate::core::ArcStr;

pub use anyhow::Error as RuntimeError;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("Cache key component is empty")]
    Empty,

    #[error("Cache key component '{0}' is reserved")]
    Reserved(String),

    #[error("Cache key component '{0}' contains the separator or starts/ends with '_'")]
    Separator(String),

    #[error("Couldn't parse cache key '{0}'")]
    Malformed(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DataError {
    #[error("Field '{0}' not found")]
    MissingField(String),

    #[error("Shape {shape:?} doesn't match {len} values")]
    Shape { shape: Vec<usize>, len: usize },

    #[error("Index {index} out of bounds for axis {axis} with length {len}")]
    IndexOutOfBounds {
        axis: usize,
        index: usize,
        len: usize,
    },

    #[error("Axis {axis} doesn't exist for an array with {ndim} dimensions")]
    Axis { axis: usize, ndim: usize },

    #[error("Arrays can't be concatenated, shapes {0:?} and {1:?} differ")]
    Concat(Vec<usize>, Vec<usize>),

    #[error("Data entity is a view and can't be written to")]
    ReadOnlyView,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BlueprintError {
    #[error("Data type '{0}' is registered twice")]
    Duplicate(ArcStr),

    #[error("Data type '{0}' depends on unknown data type '{1}'")]
    UnknownDependency(ArcStr, ArcStr),

    #[error("Data type '{0}' can't depend on '{1}', which needs a model or dataset '{0}' isn't keyed by")]
    Disambiguator(ArcStr, ArcStr),

    #[error("Data type key is invalid.\n{0}")]
    Key(#[from] KeyError),

    #[error("Dependency cycle between data types: {}", .0.join(" -> "))]
    Cycle(Vec<ArcStr>),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("Dependency cycle while resolving: {}", .0.join(" -> "))]
    DependencyCycle(Vec<ArcStr>),
}

#[derive(Debug, Error)]
pub enum EnvironmentError {
    #[error("Dataset '{0}' is not loaded")]
    UnknownDataset(ArcStr),

    #[error("Model '{0}' is not loaded")]
    UnknownModel(ArcStr),

    #[error("Sub-dataset '{0}' already exists with a different atom filter")]
    FilterMismatch(ArcStr),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Data(#[from] DataError),
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("Couldn't access the cache directory.\n{0}")]
    Io(#[from] std::io::Error),

    #[error("Couldn't encode archive '{0}'.\n{1}")]
    Encode(String, ciborium::ser::Error<std::io::Error>),

    #[error("Couldn't decode archive '{0}'.\n{1}")]
    Decode(String, ciborium::de::Error<std::io::Error>),

    #[error("Archive '{0}' has an invalid cache key.\n{1}")]
    Key(String, KeyError),

    #[error(transparent)]
    GlobPattern(#[from] glob::PatternError),

    #[error(transparent)]
    Glob(#[from] glob::GlobError),

    #[error("Couldn't convert path to UTF-8.\n{0}")]
    PathFormat(#[from] camino::FromPathBufError),

    #[error(transparent)]
    Data(#[from] DataError),

    #[error("No cache directory given and none configured")]
    NoDirectory,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Couldn't read settings file.\n{0}")]
    Io(#[from] std::io::Error),

    #[error("Couldn't parse settings.\n{0}")]
    Json(#[from] serde_json::Error),
}
