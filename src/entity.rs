use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::SystemTime;

use crate::array::Value;
use crate::core::ArcStr;
use crate::error::DataError;

/// Axis along which a view slices its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    /// First axis, one entry per configuration.
    Configurations,
    /// Second axis, one entry per atom.
    Atoms,
}

impl Axis {
    fn index(self) -> usize {
        match self {
            Axis::Configurations => 0,
            Axis::Atoms => 1,
        }
    }
}

enum Inner {
    Owned(RwLock<BTreeMap<String, Value>>),
    View {
        parent: Arc<DataEntity>,
        axis: Axis,
        indices: Arc<[usize]>,
    },
}

/// A named bag of arrays and scalars produced by one data type.
///
/// Entities are either owned, or views over a parent entity. A view never
/// copies the parent's arrays: every [`get`](Self::get) re-reads the live
/// parent and applies the slice then, so writes to the parent are visible
/// through all of its views.
pub struct DataEntity {
    data_type: ArcStr,
    created: SystemTime,
    inner: Inner,
}

impl DataEntity {
    pub fn new(data_type: impl Into<ArcStr>, data: BTreeMap<String, Value>) -> Self {
        Self {
            data_type: data_type.into(),
            created: SystemTime::now(),
            inner: Inner::Owned(RwLock::new(data)),
        }
    }

    pub(crate) fn with_created(mut self, created: SystemTime) -> Self {
        self.created = created;
        self
    }

    /// View selecting configurations (first axis) of `parent`.
    pub fn index_view(parent: Arc<DataEntity>, indices: Arc<[usize]>) -> Self {
        Self::view(parent, Axis::Configurations, indices)
    }

    /// View selecting atoms (second axis) of `parent`.
    pub fn atom_view(parent: Arc<DataEntity>, indices: Arc<[usize]>) -> Self {
        Self::view(parent, Axis::Atoms, indices)
    }

    fn view(parent: Arc<DataEntity>, axis: Axis, indices: Arc<[usize]>) -> Self {
        Self {
            data_type: parent.data_type.clone(),
            created: parent.created,
            inner: Inner::View {
                parent,
                axis,
                indices,
            },
        }
    }

    /// Key of the data type that produced this entity.
    pub fn data_type(&self) -> &str {
        &self.data_type
    }

    pub fn created(&self) -> SystemTime {
        self.created
    }

    pub fn is_view(&self) -> bool {
        matches!(self.inner, Inner::View { .. })
    }

    pub fn get(&self, name: &str) -> Result<Value, DataError> {
        match &self.inner {
            Inner::Owned(data) => data
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(name)
                .cloned()
                .ok_or_else(|| DataError::MissingField(name.into())),
            Inner::View {
                parent,
                axis,
                indices,
            } => parent.get(name)?.select(axis.index(), indices),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        match &self.inner {
            Inner::Owned(data) => data
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .contains_key(name),
            Inner::View { parent, .. } => parent.contains(name),
        }
    }

    pub fn fields(&self) -> Vec<String> {
        match &self.inner {
            Inner::Owned(data) => data
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .keys()
                .cloned()
                .collect(),
            Inner::View { parent, .. } => parent.fields(),
        }
    }

    /// Overwrites one field of an owned entity.
    pub fn set(&self, name: impl Into<String>, value: impl Into<Value>) -> Result<(), DataError> {
        match &self.inner {
            Inner::Owned(data) => {
                data.write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(name.into(), value.into());
                Ok(())
            }
            Inner::View { .. } => Err(DataError::ReadOnlyView),
        }
    }

    /// Copies every field out, applying view slices.
    pub fn materialize(&self) -> Result<BTreeMap<String, Value>, DataError> {
        self.fields()
            .into_iter()
            .map(|name| {
                let value = self.get(&name)?;
                Ok((name, value))
            })
            .collect()
    }
}

impl std::fmt::Debug for DataEntity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataEntity")
            .field("data_type", &self.data_type)
            .field("view", &self.is_view())
            .field("fields", &self.fields())
            .finish()
    }
}
